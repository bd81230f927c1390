//! Admission-controlled batch dispatch with timeouts, retries and completion
//! accounting.

pub mod accumulator;
pub mod admission;
mod coordinator;
pub mod error;
pub mod lifecycle;
pub mod orchestrator;
mod pool;
pub mod record;
pub mod retry;
pub mod task;
mod timeout;

pub use accumulator::Metrics;
pub use admission::AdmissionController;
pub use coordinator::CompletionObserver;
pub use error::{DispatchError, OrchestratorError};
pub use lifecycle::{LifecycleState, StopReport};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, Settings};
pub use record::RequestRecord;
pub use retry::{RetryDecision, RetryPolicy};
pub use task::{BoxTask, Completion, DispatchRequest, TaskFactory};

// Re-export the shared types callers need alongside the orchestrator
pub use batchflow_core::{Batch, BatchNumber, BatchResult, FailureCause, IdGenerator, RequestId, RequestStatus};
