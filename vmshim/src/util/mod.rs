//! Shared helpers: logging setup and task supervision.

pub mod logging;
pub mod task;

pub use logging::{LoggingOptions, init_logging};
pub use task::{TaskGroup, spawn_supervised};
