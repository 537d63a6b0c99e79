pub mod config;
pub mod error;
pub mod pulse;

pub use error::{Error, Result};
pub use pulse::{Priority, Pulse, PulseStatus};
