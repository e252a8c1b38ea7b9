//! Line commands for the interactive operator console.

use anyhow::{Context, Result, bail};
use gonio_lib::{Command, DeviceConfig, JogDirection};

pub const HELP: &str = "\
commands:
  goto X Y                 move to absolute position
  home                     goto 0 0
  jog up|down|left|right   start directional jog (send `stop` to end it)
  joy X Y                  analog jog, X and Y in [-1, 1]
  stop                     stop any motion
  traj A0,..,A4 B0,..,B4   polynomial trajectory
  config P_X I_X D_X P_Y I_Y D_Y MAX_X MAX_Y TOL_X TOL_Y
  status                   show connection state
  help                     this text
  quit                     disconnect and exit";

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleAction {
    Send(Command),
    Status,
    Help,
    Quit,
    Nothing,
}

fn number(token: Option<&str>, name: &str) -> Result<f64> {
    let token = token.with_context(|| format!("missing {name}"))?;
    token
        .parse::<f64>()
        .with_context(|| format!("{name}: '{token}' is not a number"))
}

fn number_list(token: Option<&str>, name: &str) -> Result<Vec<f64>> {
    let token = token.with_context(|| format!("missing {name} coefficients"))?;
    token
        .split(',')
        .filter(|t| !t.trim().is_empty())
        .map(|t| number(Some(t.trim()), name))
        .collect()
}

/// Joystick input is normalized on this side; the encoder never clamps.
pub fn clamp_unit(v: f64) -> f64 {
    v.clamp(-1.0, 1.0)
}

pub fn parse_line(line: &str) -> Result<ConsoleAction> {
    let mut tokens = line.split_whitespace();
    let Some(word) = tokens.next() else {
        return Ok(ConsoleAction::Nothing);
    };

    let action = match word.to_ascii_lowercase().as_str() {
        "goto" => ConsoleAction::Send(Command::Goto {
            x: number(tokens.next(), "x")?,
            y: number(tokens.next(), "y")?,
        }),
        "home" => ConsoleAction::Send(Command::home()),
        "jog" => {
            let direction: JogDirection = tokens.next().context("missing direction")?.parse()?;
            ConsoleAction::Send(Command::Jog(direction))
        }
        "joy" => ConsoleAction::Send(Command::AnalogJog {
            x: clamp_unit(number(tokens.next(), "x")?),
            y: clamp_unit(number(tokens.next(), "y")?),
        }),
        "stop" => ConsoleAction::Send(Command::Stop),
        "traj" | "trajectory" => {
            let xs = number_list(tokens.next(), "x")?;
            let ys = number_list(tokens.next(), "y")?;
            ConsoleAction::Send(Command::trajectory(&xs, &ys)?)
        }
        "config" => {
            let values = tokens
                .by_ref()
                .map(|t| number(Some(t), "config value"))
                .collect::<Result<Vec<f64>>>()?;
            let values: [f64; 10] = values
                .try_into()
                .map_err(|v: Vec<f64>| anyhow::anyhow!("config needs 10 values, got {}", v.len()))?;
            ConsoleAction::Send(Command::ConfigSet(DeviceConfig::from_wire(values)))
        }
        "status" => ConsoleAction::Status,
        "help" | "?" => ConsoleAction::Help,
        "quit" | "exit" => ConsoleAction::Quit,
        other => bail!("unknown command '{other}', try `help`"),
    };

    if let Some(extra) = tokens.next() {
        bail!("unexpected argument '{extra}'");
    }
    Ok(action)
}
