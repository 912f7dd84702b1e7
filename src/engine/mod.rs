//! Cross-host task orchestration

pub mod controller;
pub mod host;

pub use controller::{PurgeReport, RunReport, SubmitOutcome, TaskEngine};
pub use host::{FinishedTask, Host};
