mod attempt;
mod config;
mod error;
mod manifest;

pub use attempt::{AttemptOutcome, ExecutionAttemptPayload, RunId};
pub use config::{DequeueIntervals, ResourceThresholds, RuntimeConfig, WorkerLimits};
pub use error::{Result, SupervisorError};
pub use manifest::{ManifestVersion, ResourceRequirements, TaskDefinition, WorkerManifest};

/// Maximum size of an opaque execution context: 1MB
pub const MAX_CONTEXT_SIZE: usize = 1024 * 1024;
