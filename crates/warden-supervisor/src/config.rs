use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Local bootstrap settings for the supervisor process. Everything the
/// supervisor needs before it can talk to the control plane; the
/// authoritative runtime tuning (intervals, thresholds) arrives later as
/// a RuntimeConfig over the control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Control-plane message channel endpoint
    pub control_addr: String,

    /// Control-plane presence stream endpoint
    pub presence_addr: String,

    /// Stable supervisor identity (auto-generated if not provided)
    pub supervisor_id: Option<String>,

    /// Timeout for any single request/response pair on the channel
    pub request_timeout_secs: u64,

    /// Ceiling for the channel and presence reconnect backoff
    pub backoff_ceiling_secs: u64,

    /// Settings applied when spawning worker processes
    pub spawn: WorkerSpawnConfig,
}

/// Explicit per-spawn settings for worker processes. Everything a worker
/// inherits travels through this struct; spawning never mutates the
/// supervisor's own environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerSpawnConfig {
    /// Working directory for worker processes
    pub working_dir: Option<PathBuf>,

    /// Environment merged under the manifest's own env block
    pub base_env: HashMap<String, String>,

    /// Replaces the manifest's entry command when set (used by local dev
    /// runs that wrap the worker in a shim)
    pub command_override: Option<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            control_addr: "127.0.0.1:8030".to_string(),
            presence_addr: "127.0.0.1:8031".to_string(),
            supervisor_id: None,
            request_timeout_secs: 10,
            backoff_ceiling_secs: 30,
            spawn: WorkerSpawnConfig::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: SupervisorConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    pub fn generate_supervisor_id(&self) -> String {
        use std::process;
        use uuid::Uuid;

        if let Some(id) = &self.supervisor_id {
            return id.clone();
        }

        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        let pid = process::id();
        let random = Uuid::new_v4().to_string().split('-').next().unwrap().to_string();

        format!("{}-{}-{}", hostname, pid, random)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_explicit_id_wins() {
        let mut config = SupervisorConfig::default();
        config.supervisor_id = Some("sup-1".to_string());
        assert_eq!(config.generate_supervisor_id(), "sup-1");
    }

    #[test]
    fn test_generated_id_is_unique() {
        let config = SupervisorConfig::default();
        assert_ne!(config.generate_supervisor_id(), config.generate_supervisor_id());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "control_addr: 10.0.0.5:9000\npresence_addr: 10.0.0.5:9001\nsupervisor_id: sup-7\nrequest_timeout_secs: 5\nbackoff_ceiling_secs: 60\nspawn:\n  working_dir: /srv/tasks\n  base_env:\n    NODE_ENV: production\n"
        )
        .unwrap();

        let config = SupervisorConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.control_addr, "10.0.0.5:9000");
        assert_eq!(config.supervisor_id.as_deref(), Some("sup-7"));
        assert_eq!(config.spawn.working_dir, Some(PathBuf::from("/srv/tasks")));
        assert_eq!(
            config.spawn.base_env.get("NODE_ENV").map(String::as_str),
            Some("production")
        );
    }
}
