//! Outbound command frames.
//!
//! Every command is a single opcode byte followed by packed little-endian
//! 32-bit fields. There is no length prefix, checksum or terminator: the
//! device infers the frame size from the opcode alone, so the layouts below
//! must never change.
//!
//! | Opcode | Command     | Payload                          | Frame size |
//! |--------|-------------|----------------------------------|------------|
//! | 1      | Stop        | -                                | 1          |
//! | 2      | Goto        | x: f32, y: f32                   | 9          |
//! | 3      | Jog         | direction: i32                   | 5          |
//! | 4      | AnalogJog   | x: f32, y: f32 in [-1, 1]        | 9          |
//! | 5      | Trajectory  | a0..a4: f32, b0..b4: f32         | 41         |
//! | 6      | ConfigSet   | PID gains, speed limits, tolerances (10 x f32) | 41 |

use crate::error::GonioError;
use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use strum_macros::Display;
use zerocopy::byteorder::little_endian::{F32, I32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Number of polynomial coefficients per axis in a trajectory command.
pub const TRAJECTORY_COEFFS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Opcode {
    Stop = 1,
    Goto = 2,
    Jog = 3,
    AnalogJog = 4,
    Trajectory = 5,
    ConfigSet = 6,
}

impl Opcode {
    /// Number of 32-bit payload fields carried after the opcode byte.
    pub fn field_count(&self) -> usize {
        match self {
            Opcode::Stop => 0,
            Opcode::Goto | Opcode::AnalogJog => 2,
            Opcode::Jog => 1,
            Opcode::Trajectory => 2 * TRAJECTORY_COEFFS,
            Opcode::ConfigSet => 10,
        }
    }

    /// Total encoded size of a frame with this opcode.
    pub fn frame_len(&self) -> usize {
        1 + 4 * self.field_count()
    }
}

/// Direction of a manual (button) jog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, TryFromPrimitive, IntoPrimitive)]
#[strum(serialize_all = "lowercase")]
#[repr(i32)]
pub enum JogDirection {
    Up = 0,
    Down = 1,
    Left = 2,
    Right = 3,
}

impl FromStr for JogDirection {
    type Err = GonioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" => Ok(JogDirection::Up),
            "down" => Ok(JogDirection::Down),
            "left" => Ok(JogDirection::Left),
            "right" => Ok(JogDirection::Right),
            other => Err(GonioError::InvalidDirectionName(other.to_string())),
        }
    }
}

/// Controller tuning pushed with a `ConfigSet` command.
///
/// Field order matches the wire order. Collaborators persist this as a JSON
/// preset; the core only encodes it.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub p_x: f64,
    pub i_x: f64,
    pub d_x: f64,
    pub p_y: f64,
    pub i_y: f64,
    pub d_y: f64,
    /// Maximum axis speed in degrees per second.
    pub max_speed_x: f64,
    pub max_speed_y: f64,
    /// Position tolerance in degrees.
    pub tol_x: f64,
    pub tol_y: f64,
}

impl DeviceConfig {
    pub fn to_wire(&self) -> [f64; 10] {
        [
            self.p_x,
            self.i_x,
            self.d_x,
            self.p_y,
            self.i_y,
            self.d_y,
            self.max_speed_x,
            self.max_speed_y,
            self.tol_x,
            self.tol_y,
        ]
    }

    pub fn from_wire(v: [f64; 10]) -> Self {
        Self {
            p_x: v[0],
            i_x: v[1],
            d_x: v[2],
            p_y: v[3],
            i_y: v[4],
            d_y: v[5],
            max_speed_x: v[6],
            max_speed_y: v[7],
            tol_x: v[8],
            tol_y: v[9],
        }
    }

    pub fn encode(&self) -> Bytes {
        let v = self.to_wire();
        encode_config(v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7], v[8], v[9])
    }
}

/// High-level command issued by the console.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Stop,
    /// Absolute target position.
    Goto { x: f64, y: f64 },
    /// Continuous directional motion until a `Stop` is sent.
    Jog(JogDirection),
    /// Continuous motion with a normalized joystick vector.
    AnalogJog { x: f64, y: f64 },
    /// Degree-4 polynomial per axis, coefficients a0..a4 and b0..b4.
    Trajectory {
        x: [f64; TRAJECTORY_COEFFS],
        y: [f64; TRAJECTORY_COEFFS],
    },
    ConfigSet(DeviceConfig),
}

impl Command {
    /// Goto the origin of both axes.
    pub fn home() -> Self {
        Command::Goto { x: 0.0, y: 0.0 }
    }

    /// Trajectory from coefficient lists; each axis needs exactly five values.
    pub fn trajectory(coeffs_x: &[f64], coeffs_y: &[f64]) -> Result<Self, GonioError> {
        let arity = || GonioError::InvalidArity {
            expected: TRAJECTORY_COEFFS,
            x: coeffs_x.len(),
            y: coeffs_y.len(),
        };
        Ok(Command::Trajectory {
            x: coeffs_x.try_into().map_err(|_| arity())?,
            y: coeffs_y.try_into().map_err(|_| arity())?,
        })
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Command::Stop => Opcode::Stop,
            Command::Goto { .. } => Opcode::Goto,
            Command::Jog(_) => Opcode::Jog,
            Command::AnalogJog { .. } => Opcode::AnalogJog,
            Command::Trajectory { .. } => Opcode::Trajectory,
            Command::ConfigSet(_) => Opcode::ConfigSet,
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            Command::Stop => encode_stop(),
            Command::Goto { x, y } => encode_goto(*x, *y),
            Command::Jog(direction) => encode_jog(*direction),
            Command::AnalogJog { x, y } => encode_analog_jog(*x, *y),
            Command::Trajectory { x, y } => encode_trajectory_frame(x, y),
            Command::ConfigSet(config) => config.encode(),
        }
    }

    /// Parse one complete command frame, as the device would.
    pub fn decode(frame: &[u8]) -> Result<Self, GonioError> {
        let first = *frame.first().ok_or(GonioError::InvalidFrameLength {
            opcode: "empty".to_string(),
            expected: 1,
            actual: 0,
        })?;
        let opcode = Opcode::try_from(first).map_err(|_| GonioError::UnknownOpcode(first))?;
        if frame.len() != opcode.frame_len() {
            return Err(GonioError::InvalidFrameLength {
                opcode: opcode.to_string(),
                expected: opcode.frame_len(),
                actual: frame.len(),
            });
        }

        let command = match opcode {
            Opcode::Stop => Command::Stop,
            Opcode::Goto | Opcode::AnalogJog => {
                let raw = XyFrameRaw::read_from_bytes(frame).map_err(|_| bad_length(opcode, frame))?;
                let (x, y) = (raw.x.get() as f64, raw.y.get() as f64);
                if opcode == Opcode::Goto {
                    Command::Goto { x, y }
                } else {
                    Command::AnalogJog { x, y }
                }
            }
            Opcode::Jog => {
                let raw = JogFrameRaw::read_from_bytes(frame).map_err(|_| bad_length(opcode, frame))?;
                let code = raw.direction.get();
                let direction = JogDirection::try_from(code).map_err(|_| GonioError::InvalidDirection(code))?;
                Command::Jog(direction)
            }
            Opcode::Trajectory => {
                let raw = TrajectoryFrameRaw::read_from_bytes(frame).map_err(|_| bad_length(opcode, frame))?;
                Command::Trajectory {
                    x: raw.coeffs_x.map(|c| c.get() as f64),
                    y: raw.coeffs_y.map(|c| c.get() as f64),
                }
            }
            Opcode::ConfigSet => {
                let raw = ConfigFrameRaw::read_from_bytes(frame).map_err(|_| bad_length(opcode, frame))?;
                Command::ConfigSet(DeviceConfig::from_wire(raw.values.map(|v| v.get() as f64)))
            }
        };
        Ok(command)
    }
}

impl From<Command> for Bytes {
    fn from(command: Command) -> Self {
        command.encode()
    }
}

fn bad_length(opcode: Opcode, frame: &[u8]) -> GonioError {
    GonioError::InvalidFrameLength {
        opcode: opcode.to_string(),
        expected: opcode.frame_len(),
        actual: frame.len(),
    }
}

// Wire layouts. All fields are byte-aligned, so `repr(C)` adds no padding.

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct XyFrameRaw {
    opcode: u8,
    x: F32,
    y: F32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct JogFrameRaw {
    opcode: u8,
    direction: I32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct TrajectoryFrameRaw {
    opcode: u8,
    coeffs_x: [F32; TRAJECTORY_COEFFS],
    coeffs_y: [F32; TRAJECTORY_COEFFS],
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct ConfigFrameRaw {
    opcode: u8,
    values: [F32; 10],
}

fn f32_le(value: f64) -> F32 {
    F32::new(value as f32)
}

fn xy_frame(opcode: Opcode, x: f64, y: f64) -> Bytes {
    let raw = XyFrameRaw {
        opcode: opcode.into(),
        x: f32_le(x),
        y: f32_le(y),
    };
    Bytes::copy_from_slice(raw.as_bytes())
}

pub fn encode_stop() -> Bytes {
    Bytes::copy_from_slice(&[u8::from(Opcode::Stop)])
}

/// Absolute goto. Values are narrowed to f32; the device enforces its own limits.
pub fn encode_goto(x: f64, y: f64) -> Bytes {
    xy_frame(Opcode::Goto, x, y)
}

pub fn encode_jog(direction: JogDirection) -> Bytes {
    let raw = JogFrameRaw {
        opcode: Opcode::Jog.into(),
        direction: I32::new(direction.into()),
    };
    Bytes::copy_from_slice(raw.as_bytes())
}

/// Joystick jog. Callers normalize `x` and `y` to [-1, 1]; nothing is clamped here.
pub fn encode_analog_jog(x: f64, y: f64) -> Bytes {
    xy_frame(Opcode::AnalogJog, x, y)
}

/// Trajectory from two coefficient lists, each of which must hold exactly five values.
pub fn encode_trajectory(coeffs_x: &[f64], coeffs_y: &[f64]) -> Result<Bytes, GonioError> {
    Ok(Command::trajectory(coeffs_x, coeffs_y)?.encode())
}

fn encode_trajectory_frame(x: &[f64; TRAJECTORY_COEFFS], y: &[f64; TRAJECTORY_COEFFS]) -> Bytes {
    let raw = TrajectoryFrameRaw {
        opcode: Opcode::Trajectory.into(),
        coeffs_x: (*x).map(f32_le),
        coeffs_y: (*y).map(f32_le),
    };
    Bytes::copy_from_slice(raw.as_bytes())
}

#[allow(clippy::too_many_arguments)]
pub fn encode_config(
    p_x: f64,
    i_x: f64,
    d_x: f64,
    p_y: f64,
    i_y: f64,
    d_y: f64,
    max_x: f64,
    max_y: f64,
    tol_x: f64,
    tol_y: f64,
) -> Bytes {
    let raw = ConfigFrameRaw {
        opcode: Opcode::ConfigSet.into(),
        values: [p_x, i_x, d_x, p_y, i_y, d_y, max_x, max_y, tol_x, tol_y].map(f32_le),
    };
    Bytes::copy_from_slice(raw.as_bytes())
}
