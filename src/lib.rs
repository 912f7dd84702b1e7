//! taskmill - remote task execution and status tracking
//!
//! The engine stages declared task files onto configured execution hosts,
//! submits the tasks through pluggable queue backends (local shell,
//! containers, batch schedulers), polls them to a terminal state with an
//! adaptive interval and retrieves their outputs. Tasks whose recorded
//! signature still matches are skipped without touching the backend.

pub mod backend;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod report;
pub mod signature;
pub mod status;
pub mod sync;
pub mod task;
pub mod version;

pub use config::Config;
pub use engine::{RunReport, SubmitOutcome, TaskEngine};
pub use error::{Error, Result};
pub use status::{TaskRecord, TaskStatus};
pub use task::{SigMode, TaskSpec};
