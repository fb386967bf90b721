//! Shared building blocks for the framepace workspace: configuration loading,
//! the common error type, and identifier newtypes.

pub mod config;
pub mod error;
pub mod types;

pub use config::{FramepaceConfig, LoggingConfig, SchedulerConfig};
pub use error::{CoreError, Result};
pub use types::{JobId, LoopId};
