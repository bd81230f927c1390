pub mod batch;
pub mod config;
pub mod ids;
pub mod result;

pub use batch::{Batch, split_into_batches};
pub use config::{Config, ConfigError, LoggingConfig, OrchestratorConfig};
pub use ids::{BatchNumber, IdGenerator, RequestId};
pub use result::{BatchResult, FailureCause, RequestStatus};
