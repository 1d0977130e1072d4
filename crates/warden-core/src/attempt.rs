use crate::{ManifestVersion, SupervisorError, Result, MAX_CONTEXT_SIZE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a run
pub type RunId = Uuid;

/// A unit of dispatchable work, created by the control plane in response
/// to a dequeue request and acknowledged exactly once when a worker
/// accepts or rejects it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionAttemptPayload {
    /// Run this attempt belongs to
    pub run_id: RunId,

    /// Attempt number within the run (1-based)
    pub attempt_number: u32,

    /// Task identifier within the manifest
    pub task_id: String,

    /// Manifest version that must serve this attempt
    pub manifest_version: ManifestVersion,

    /// Opaque JSON-encoded execution context handed through to the
    /// worker untouched
    pub context: Vec<u8>,

    /// When the control plane handed the attempt out
    pub dequeued_at: DateTime<Utc>,
}

impl ExecutionAttemptPayload {
    pub fn new(
        task_id: impl Into<String>,
        manifest_version: impl Into<ManifestVersion>,
        context: serde_json::Value,
    ) -> Result<Self> {
        let encoded = serde_json::to_vec(&context)
            .map_err(|e| SupervisorError::Protocol(format!("unencodable context: {}", e)))?;
        if encoded.len() > MAX_CONTEXT_SIZE {
            return Err(SupervisorError::Protocol(format!(
                "execution context exceeds {} bytes (got {})",
                MAX_CONTEXT_SIZE,
                encoded.len()
            )));
        }

        Ok(ExecutionAttemptPayload {
            run_id: Uuid::new_v4(),
            attempt_number: 1,
            task_id: task_id.into(),
            manifest_version: manifest_version.into(),
            context: encoded,
            dequeued_at: Utc::now(),
        })
    }
}

/// Terminal report for an attempt.
///
/// Success and task-level failure are both normal completions from the
/// supervisor's perspective; only `InfrastructureFailure` marks the
/// attempt as eligible for redelivery by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    /// Task ran to completion
    Success { output: Option<String> },

    /// The task itself failed; an expected outcome, not a supervisor error
    TaskFailure { error: String },

    /// Worker crash or unresponsiveness while the attempt was in flight
    InfrastructureFailure { reason: String },
}

impl AttemptOutcome {
    pub fn is_infrastructure_failure(&self) -> bool {
        matches!(self, AttemptOutcome::InfrastructureFailure { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success { .. } => "success",
            AttemptOutcome::TaskFailure { .. } => "task_failure",
            AttemptOutcome::InfrastructureFailure { .. } => "infrastructure_failure",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_attempt_creation() {
        let attempt =
            ExecutionAttemptPayload::new("emails.send", "v3", json!({"to": "a@b.c"})).unwrap();

        assert_eq!(attempt.task_id, "emails.send");
        assert_eq!(attempt.manifest_version, "v3");
        assert_eq!(attempt.attempt_number, 1);
    }

    #[test]
    fn test_context_size_limit() {
        let huge = json!({ "blob": "x".repeat(MAX_CONTEXT_SIZE + 1) });
        let result = ExecutionAttemptPayload::new("t", "v1", huge);

        assert!(result.is_err());
        match result {
            Err(SupervisorError::Protocol(_)) => {}
            _ => panic!("Expected Protocol error"),
        }
    }

    #[test]
    fn test_outcome_classification() {
        let ok = AttemptOutcome::Success { output: None };
        let task_err = AttemptOutcome::TaskFailure {
            error: "boom".to_string(),
        };
        let infra = AttemptOutcome::InfrastructureFailure {
            reason: "worker crashed".to_string(),
        };

        assert!(!ok.is_infrastructure_failure());
        assert!(!task_err.is_infrastructure_failure());
        assert!(infra.is_infrastructure_failure());
        assert_eq!(infra.as_str(), "infrastructure_failure");
    }
}
