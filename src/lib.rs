//! Operator console front-ends for the goniometer.

pub mod console;
pub mod logging;
pub mod mock;
