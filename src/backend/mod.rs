//! Pluggable queue backends
//!
//! One backend per host; the engine never talks to a queue except
//! through the [`QueueBackend`] trait.

pub mod batch;
pub mod container;
pub mod local;
pub mod mock;
pub mod registry;
pub mod traits;

pub use batch::BatchBackend;
pub use container::ContainerBackend;
pub use local::LocalBackend;
pub use mock::MockBackend;
pub use registry::{create_backend, BackendKind};
pub use traits::{read_exit, JobHandle, PollState, PreparedJob, QueueBackend};
