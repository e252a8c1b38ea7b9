//! Simulated goniometer used by the `mock_device` binary.
//!
//! Parses command frames from a TCP byte stream the way the firmware does
//! (fixed size per opcode) and integrates a simple two-axis motion model
//! whose position is reported as telemetry.

use anyhow::Result;
use bytes::{Buf, BytesMut};
use gonio_lib::command::TRAJECTORY_COEFFS;
use gonio_lib::{Command, DeviceConfig, GonioError, JogDirection, Opcode, TelemetrySample};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, error, trace, warn};

/// Reassembles command frames from arbitrary reads.
#[derive(Debug, Default)]
pub struct CommandAssembler {
    buffer: BytesMut,
}

impl CommandAssembler {
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Next complete command. An unknown opcode byte is skipped and reported.
    pub fn next_command(&mut self) -> Option<Result<Command, GonioError>> {
        let first = *self.buffer.first()?;
        let opcode = match Opcode::try_from(first) {
            Ok(opcode) => opcode,
            Err(_) => {
                self.buffer.advance(1);
                return Some(Err(GonioError::UnknownOpcode(first)));
            }
        };
        if self.buffer.len() < opcode.frame_len() {
            return None;
        }
        let frame = self.buffer.split_to(opcode.frame_len());
        Some(Command::decode(&frame))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Motion {
    Idle,
    Goto { x: f64, y: f64 },
    Jog(JogDirection),
    Analog { x: f64, y: f64 },
    Trajectory {
        x: [f64; TRAJECTORY_COEFFS],
        y: [f64; TRAJECTORY_COEFFS],
        elapsed: f64,
    },
}

/// Seconds a trajectory takes to sweep its normalized time from 0 to 1.
pub const TRAJECTORY_DURATION_S: f64 = 10.0;

fn polynomial(coeffs: &[f64; TRAJECTORY_COEFFS], t: f64) -> f64 {
    coeffs.iter().rev().fold(0.0, |acc, c| acc * t + c)
}

/// Move `from` toward `to` by at most `max_step`.
fn approach(from: f64, to: f64, max_step: f64) -> f64 {
    let delta = to - from;
    if delta.abs() <= max_step {
        to
    } else {
        from + max_step * delta.signum()
    }
}

#[derive(Debug, Clone)]
pub struct MockGoniometer {
    pub x: f64,
    pub y: f64,
    pub config: DeviceConfig,
    motion: Motion,
}

impl Default for MockGoniometer {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            config: DeviceConfig {
                p_x: 1.0,
                p_y: 1.0,
                max_speed_x: 20.0,
                max_speed_y: 20.0,
                tol_x: 0.1,
                tol_y: 0.1,
                ..DeviceConfig::default()
            },
            motion: Motion::Idle,
        }
    }
}

impl MockGoniometer {
    pub fn is_moving(&self) -> bool {
        self.motion != Motion::Idle
    }

    pub fn apply(&mut self, command: Command) {
        debug!(?command, "Device received command");
        self.motion = match command {
            Command::Stop => Motion::Idle,
            Command::Goto { x, y } => Motion::Goto { x, y },
            Command::Jog(direction) => Motion::Jog(direction),
            Command::AnalogJog { x, y } if x == 0.0 && y == 0.0 => Motion::Idle,
            Command::AnalogJog { x, y } => Motion::Analog { x, y },
            Command::Trajectory { x, y } => Motion::Trajectory { x, y, elapsed: 0.0 },
            Command::ConfigSet(config) => {
                self.config = config;
                return;
            }
        };
    }

    /// Advance the simulation by `dt` seconds.
    pub fn step(&mut self, dt: f64) {
        let (vx, vy) = (self.config.max_speed_x.abs(), self.config.max_speed_y.abs());
        match &mut self.motion {
            Motion::Idle => {}
            Motion::Goto { x, y } => {
                let (tx, ty) = (*x, *y);
                self.x = approach(self.x, tx, vx * dt);
                self.y = approach(self.y, ty, vy * dt);
                if (self.x - tx).abs() <= self.config.tol_x.abs() && (self.y - ty).abs() <= self.config.tol_y.abs() {
                    self.motion = Motion::Idle;
                }
            }
            Motion::Jog(direction) => match direction {
                JogDirection::Up => self.y += vy * dt,
                JogDirection::Down => self.y -= vy * dt,
                JogDirection::Left => self.x -= vx * dt,
                JogDirection::Right => self.x += vx * dt,
            },
            Motion::Analog { x, y } => {
                self.x += *x * vx * dt;
                self.y += *y * vy * dt;
            }
            Motion::Trajectory { x, y, elapsed } => {
                *elapsed += dt;
                let t = (*elapsed / TRAJECTORY_DURATION_S).min(1.0);
                self.x = polynomial(x, t);
                self.y = polynomial(y, t);
                if t >= 1.0 {
                    self.motion = Motion::Idle;
                }
            }
        }
    }

    /// Telemetry carries unsigned integers; negative positions saturate at zero.
    pub fn sample(&self) -> TelemetrySample {
        let to_wire = |v: f64| {
            if v.is_nan() {
                warn!("Position is NaN");
                0
            } else {
                v.round().clamp(0.0, u32::MAX as f64) as u32
            }
        };
        TelemetrySample::new(to_wire(self.x), to_wire(self.y))
    }
}

/// Advance the motion model at a fixed rate, independent of connections.
pub async fn simulate(device: Arc<Mutex<MockGoniometer>>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    let dt = interval.as_secs_f64();
    loop {
        ticker.tick().await;
        device.lock().await.step(dt);
    }
}

/// Serve one console connection: execute its commands and stream telemetry
/// every `interval`. Returns when the console disconnects.
pub async fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    device: Arc<Mutex<MockGoniometer>>,
    interval: Duration,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();
    let mut assembler = CommandAssembler::default();
    let mut buf = [0u8; 256];
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                trace!(%peer, data = %hex::encode(&buf[..n]), "rx");
                assembler.push(&buf[..n]);
                while let Some(parsed) = assembler.next_command() {
                    match parsed {
                        Ok(command) => device.lock().await.apply(command),
                        Err(e) => error!(%peer, "Bad command frame: {}", e),
                    }
                }
            }
            _ = ticker.tick() => {
                let sample = device.lock().await.sample();
                debug!(x = sample.x, y = sample.y, "telemetry");
                writer.write_all(&sample.to_bytes()).await?;
            }
        }
    }
}
