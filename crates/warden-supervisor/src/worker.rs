use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::WorkerSpawnConfig;
use warden_core::{Result, SupervisorError, WorkerManifest};
use warden_protocol::{Envelope, EnvelopeCodec};

const WORKER_CHANNEL_BUFFER: usize = 16;

/// Lifecycle of a supervised worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Starting,
    Ready,
    Busy,
    Draining,
    Stopped,
    Crashed,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Starting => "starting",
            WorkerStatus::Ready => "ready",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Draining => "draining",
            WorkerStatus::Stopped => "stopped",
            WorkerStatus::Crashed => "crashed",
        }
    }

    /// Whether the worker may accept a dispatch in this state
    pub fn accepts_work(&self) -> bool {
        matches!(self, WorkerStatus::Ready | WorkerStatus::Busy)
    }
}

/// Live endpoints of a launched worker process. The coordinator owns the
/// envelope channels; `exited` resolves exactly once with an exit
/// description; `kill` force-terminates the process.
pub struct LaunchedWorker {
    pub sender: mpsc::Sender<Envelope>,
    pub receiver: mpsc::Receiver<Envelope>,
    pub exited: oneshot::Receiver<String>,
    pub kill: Arc<Notify>,
}

/// Seam between the coordinator and the operating system. The production
/// implementation spawns a real process; tests substitute an in-memory
/// fake so supervision logic is exercised without child processes.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, manifest: &WorkerManifest, worker_id: Uuid) -> Result<LaunchedWorker>;
}

/// Spawns isolated worker processes and bridges their stdio to envelope
/// channels. All spawn inputs come from the manifest and the explicit
/// `WorkerSpawnConfig`; the supervisor's own environment is never
/// mutated.
pub struct ProcessWorkerLauncher {
    spawn: WorkerSpawnConfig,
}

impl ProcessWorkerLauncher {
    pub fn new(spawn: WorkerSpawnConfig) -> Self {
        ProcessWorkerLauncher { spawn }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessWorkerLauncher {
    async fn launch(&self, manifest: &WorkerManifest, worker_id: Uuid) -> Result<LaunchedWorker> {
        let program = self
            .spawn
            .command_override
            .as_deref()
            .unwrap_or(&manifest.entry_command);

        let mut command = Command::new(program);
        command
            .args(&manifest.entry_args)
            .envs(&self.spawn.base_env)
            .envs(&manifest.env)
            .env("WARDEN_WORKER_ID", worker_id.to_string())
            .env("WARDEN_MANIFEST_VERSION", &manifest.version)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        if let Some(dir) = &self.spawn.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            SupervisorError::Infrastructure(format!(
                "failed to launch worker process '{}': {}",
                program, e
            ))
        })?;

        info!(
            "Spawned worker {} (pid {:?}, version {})",
            worker_id,
            child.id(),
            manifest.version
        );

        let stdin = child.stdin.take().ok_or_else(|| {
            SupervisorError::Infrastructure("worker process has no stdin".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            SupervisorError::Infrastructure("worker process has no stdout".to_string())
        })?;

        let mut writer = FramedWrite::new(stdin, EnvelopeCodec);
        let mut reader = FramedRead::new(stdout, EnvelopeCodec);

        let (to_worker_tx, mut to_worker_rx) = mpsc::channel::<Envelope>(WORKER_CHANNEL_BUFFER);
        let (from_worker_tx, from_worker_rx) = mpsc::channel::<Envelope>(WORKER_CHANNEL_BUFFER);
        let (exited_tx, exited_rx) = oneshot::channel();
        let kill = Arc::new(Notify::new());
        let kill_rx = kill.clone();

        // Writer pump: coordinator envelopes into the child's stdin
        tokio::spawn(async move {
            while let Some(envelope) = to_worker_rx.recv().await {
                if let Err(e) = writer.send(envelope).await {
                    debug!("Worker stdin closed: {}", e);
                    break;
                }
            }
        });

        // Reader + lifecycle watch: child stdout envelopes out, exit
        // status reported exactly once
        tokio::spawn(async move {
            let mut stdout_open = true;
            let exit_description = loop {
                tokio::select! {
                    status = child.wait() => {
                        break match status {
                            Ok(status) => format!("exited with {}", status),
                            Err(e) => format!("wait failed: {}", e),
                        };
                    }
                    _ = kill_rx.notified() => {
                        warn!("Force-terminating worker {}", worker_id);
                        let _ = child.start_kill();
                    }
                    maybe = reader.next(), if stdout_open => {
                        match maybe {
                            Some(Ok(envelope)) => {
                                let _ = from_worker_tx.send(envelope).await;
                            }
                            Some(Err(e)) => {
                                warn!("Dropping invalid envelope from worker {}: {}", worker_id, e);
                            }
                            None => stdout_open = false,
                        }
                    }
                }
            };
            let _ = exited_tx.send(exit_description);
        });

        Ok(LaunchedWorker {
            sender: to_worker_tx,
            receiver: from_worker_rx,
            exited: exited_rx,
            kill,
        })
    }
}
