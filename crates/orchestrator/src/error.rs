use batchflow_core::ConfigError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
  #[error("Orchestrator has been shut down")]
  ShutDown,
  #[error("No tokio runtime available to start the orchestrator")]
  NoRuntime,
  #[error("Invalid settings: {0}")]
  InvalidSettings(String),
  #[error("Config error: {0}")]
  Config(#[from] ConfigError),
}

/// Error raised by a task factory before it produced a task.
///
/// Treated as a transient failure of the attempt: the batch goes through the
/// retry path like any other failure.
#[derive(Error, Debug)]
pub enum DispatchError {
  #[error("Task factory failed: {0}")]
  Factory(String),
  #[error("Task factory panicked: {0}")]
  Panicked(String),
}

impl DispatchError {
  pub fn factory(msg: impl Into<String>) -> Self {
    Self::Factory(msg.into())
  }
}
