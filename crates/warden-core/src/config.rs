use crate::{Result, SupervisorError};
use serde::{Deserialize, Serialize};

/// Immutable runtime settings fetched once from the control plane at
/// startup. Replaced wholesale if the control plane signals a config
/// change on reconnect, never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub dequeue: DequeueIntervals,
    pub resources: ResourceThresholds,
    pub workers: WorkerLimits,

    /// Supervisor-to-control-plane keepalive interval in seconds
    pub heartbeat_interval_secs: u64,

    /// No presence ping for this long counts as a lost presence link
    pub presence_liveness_secs: u64,
}

/// Adaptive polling intervals. Exact numbers are tuning parameters
/// delivered by the control plane, not a fixed contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DequeueIntervals {
    /// Interval after a non-empty dequeue response (work is flowing)
    pub short_ms: u64,

    /// Interval after an empty response or while paused
    pub long_ms: u64,

    /// Interval when local resources are insufficient; the control plane
    /// is not contacted at all in that case
    pub starved_ms: u64,

    /// Most attempts requested in a single dequeue
    pub max_batch: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceThresholds {
    /// Skip dequeue when machine CPU usage is at or above this percent
    pub max_cpu_percent: f32,

    /// Skip dequeue when available memory falls below this many MiB
    pub min_free_memory_mib: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerLimits {
    /// Worker must signal readiness within this window after spawn
    pub startup_timeout_secs: u64,

    /// Missed worker heartbeats beyond this window while Busy count
    /// as unresponsiveness
    pub liveness_timeout_secs: u64,

    /// In-flight work gets this long to finish during drain
    pub drain_grace_secs: u64,

    /// Consecutive crashes for one manifest version before spawning is
    /// suppressed and the failure escalates as fatal for that version
    pub crash_budget: u32,

    /// Bounded wait for a Starting worker before a dispatch is rejected
    /// as unroutable
    pub dispatch_wait_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            dequeue: DequeueIntervals {
                short_ms: 1_000,
                long_ms: 10_000,
                starved_ms: 30_000,
                max_batch: 10,
            },
            resources: ResourceThresholds {
                max_cpu_percent: 90.0,
                min_free_memory_mib: 512,
            },
            workers: WorkerLimits {
                startup_timeout_secs: 30,
                liveness_timeout_secs: 30,
                drain_grace_secs: 30,
                crash_budget: 3,
                dispatch_wait_ms: 5_000,
            },
            heartbeat_interval_secs: 15,
            presence_liveness_secs: 60,
        }
    }
}

impl RuntimeConfig {
    /// Reject configs that would break the adaptive-polling contract.
    pub fn validate(&self) -> Result<()> {
        if self.dequeue.short_ms == 0 {
            return Err(SupervisorError::InvalidConfig(
                "short dequeue interval must be non-zero".to_string(),
            ));
        }
        if self.dequeue.long_ms < self.dequeue.short_ms {
            return Err(SupervisorError::InvalidConfig(format!(
                "long interval ({}ms) must not be shorter than short interval ({}ms)",
                self.dequeue.long_ms, self.dequeue.short_ms
            )));
        }
        if self.dequeue.max_batch == 0 {
            return Err(SupervisorError::InvalidConfig(
                "dequeue batch size must be non-zero".to_string(),
            ));
        }
        if self.workers.crash_budget == 0 {
            return Err(SupervisorError::InvalidConfig(
                "crash budget must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
