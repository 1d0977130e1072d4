use thiserror::Error;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Startup failed: {0}")]
    FatalStartup(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Worker infrastructure failure: {0}")]
    Infrastructure(String),

    #[error("No worker available for manifest version {0}")]
    Unroutable(String),

    #[error("Crash budget exhausted for manifest version {version} after {crashes} crashes")]
    CrashBudgetExhausted { version: String, crashes: u32 },

    #[error("Configuration invalid: {0}")]
    InvalidConfig(String),

    #[error("Supervisor is shutting down")]
    ShuttingDown,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl SupervisorError {
    /// Transient errors are retried locally and never bubble past
    /// the owning component.
    pub fn is_transient(&self) -> bool {
        matches!(self, SupervisorError::Transient(_))
    }

    /// Fatal errors terminate the process with a non-zero exit.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SupervisorError::FatalStartup(_) | SupervisorError::CrashBudgetExhausted { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
