pub mod command;
pub mod config;
pub mod error;
pub mod session;
pub mod sink;
pub mod telemetry;

pub use command::{
    Command, DeviceConfig, JogDirection, Opcode, encode_analog_jog, encode_config, encode_goto, encode_jog,
    encode_stop, encode_trajectory,
};
pub use config::SessionConfig;
pub use error::GonioError;
pub use session::{Session, SessionState};
pub use sink::{CloseReason, EventSink, FnSink, SessionEvent};
pub use telemetry::{DecodeMode, FrameDecoder, TelemetrySample};
