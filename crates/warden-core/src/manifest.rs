use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Version identifier for a deployable set of tasks (e.g., "20250108.3")
pub type ManifestVersion = String;

/// A single task definition within a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Stable task identifier (e.g., "emails.send-welcome")
    pub id: String,

    /// Human-readable name shown in run listings
    pub name: String,

    /// How many attempts of this task a single worker may execute
    /// concurrently (1 = strictly serial)
    pub concurrency: u32,
}

/// Resource requirements declared by the build pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    /// CPU request in millicores
    pub cpu_millis: u32,

    /// Memory request in MiB
    pub memory_mib: u32,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        ResourceRequirements {
            cpu_millis: 500,
            memory_mib: 256,
        }
    }
}

/// Describes a deployable set of tasks: version identifier, task
/// definitions, resource requirements, and how to launch the worker
/// process that serves them.
///
/// Produced externally by the build pipeline; treated as opaque and
/// immutable once received.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerManifest {
    /// Version identifier, unique per deploy
    pub version: ManifestVersion,

    /// Task definitions keyed by task id
    pub tasks: Vec<TaskDefinition>,

    /// Resource requirements for one worker process of this version
    pub resources: ResourceRequirements,

    /// Executable that hosts the task code
    pub entry_command: String,

    /// Arguments passed to the entry command
    pub entry_args: Vec<String>,

    /// Environment passed to the worker process. Part of the manifest so
    /// spawning never mutates the supervisor's own environment.
    pub env: HashMap<String, String>,
}

impl WorkerManifest {
    pub fn new(version: impl Into<ManifestVersion>, entry_command: impl Into<String>) -> Self {
        WorkerManifest {
            version: version.into(),
            tasks: Vec::new(),
            resources: ResourceRequirements::default(),
            entry_command: entry_command.into(),
            entry_args: Vec::new(),
            env: HashMap::new(),
        }
    }

    /// Look up a task definition by id
    pub fn task(&self, task_id: &str) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    /// Whether this manifest declares support for concurrent execution.
    /// A worker already Busy is skipped for further routing unless this
    /// returns a slot count greater than one.
    pub fn max_concurrency(&self) -> u32 {
        self.tasks.iter().map(|t| t.concurrency).max().unwrap_or(1)
    }
}
