use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelEvent, ControlChannel};
use crate::config::SupervisorConfig;
use crate::coordinator::{CoordinatorEvent, WorkerCoordinator};
use crate::dequeue::{ChannelAttemptSource, DequeueLoop};
use crate::presence::{PresenceHandle, PresenceMonitor, ReconcileReason};
use crate::resources::{ResourceGate, ResourceMonitor};
use crate::worker::WorkerLauncher;
use warden_core::{
    ExecutionAttemptPayload, Result, RuntimeConfig, SupervisorError, WorkerManifest,
};
use warden_protocol::{
    AttemptRejected, AttemptResult, ConfigRequest, Envelope, Heartbeat, MessageBody,
    RegisterWorker,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const ATTEMPT_SINK_BUFFER: usize = 64;

/// Top-level lifecycle of the supervisor process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Uninitialized,
    Initializing,
    Running,
    ShuttingDown,
    Stopped,
}

/// Owns startup, wiring, and shutdown of every other component: fetches
/// the runtime config (fatal on failure), opens the presence monitor and
/// control channel, starts the dequeue loop, and hands incoming
/// execution payloads to the coordinator.
pub struct RuntimeController {
    config: SupervisorConfig,
    supervisor_id: String,
    launcher: Arc<dyn WorkerLauncher>,
    state_tx: watch::Sender<ControllerState>,
    runtime_config_tx: watch::Sender<RuntimeConfig>,
    // Cancels the dequeue timer
    dequeue_shutdown: Arc<Notify>,
    // Cancels every other background task
    cancel_tx: watch::Sender<bool>,
    channel: Option<Arc<ControlChannel>>,
    presence_handle: Option<PresenceHandle>,
    coordinator: Option<Arc<WorkerCoordinator>>,
    handles: Vec<JoinHandle<()>>,
}

impl RuntimeController {
    pub fn new(config: SupervisorConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        let supervisor_id = config.generate_supervisor_id();
        let (state_tx, _) = watch::channel(ControllerState::Uninitialized);
        let (runtime_config_tx, _) = watch::channel(RuntimeConfig::default());
        let (cancel_tx, _) = watch::channel(false);

        RuntimeController {
            config,
            supervisor_id,
            launcher,
            state_tx,
            runtime_config_tx,
            dequeue_shutdown: Arc::new(Notify::new()),
            cancel_tx,
            channel: None,
            presence_handle: None,
            coordinator: None,
            handles: Vec::new(),
        }
    }

    pub fn state(&self) -> watch::Receiver<ControllerState> {
        self.state_tx.subscribe()
    }

    /// Bring the supervisor to Running. Failure to obtain the runtime
    /// config is fatal; the process cannot operate without it.
    pub async fn init(&mut self) -> Result<()> {
        self.state_tx.send_replace(ControllerState::Initializing);
        info!("Initializing supervisor {}", self.supervisor_id);

        let backoff_ceiling = Duration::from_secs(self.config.backoff_ceiling_secs);
        let request_timeout = Duration::from_secs(self.config.request_timeout_secs);

        let channel = Arc::new(
            ControlChannel::connect(&self.config.control_addr, backoff_ceiling, request_timeout)
                .await?,
        );

        let runtime_config = fetch_runtime_config(&channel).await?;
        runtime_config.validate()?;
        debug!("Got runtime settings: {:?}", runtime_config);
        self.runtime_config_tx.send_replace(runtime_config.clone());

        register(&channel, &self.supervisor_id).await.map_err(|e| {
            SupervisorError::FatalStartup(format!("initial registration failed: {}", e))
        })?;

        let presence = Arc::new(PresenceMonitor::new(
            &self.config.presence_addr,
            Duration::from_secs(runtime_config.presence_liveness_secs),
            backoff_ceiling,
        ));
        let presence_handle = presence.start();

        let (coordinator, coordinator_events) =
            WorkerCoordinator::new(self.launcher.clone(), runtime_config.workers.clone());

        let (attempt_tx, attempt_rx) = mpsc::channel(ATTEMPT_SINK_BUFFER);
        self.handles.push(spawn_attempt_router(
            attempt_rx,
            coordinator.clone(),
            channel.clone(),
        ));

        if let Some(inbound) = channel.take_inbound() {
            self.handles.push(spawn_inbound_handler(
                inbound,
                attempt_tx.clone(),
                self.cancel_tx.subscribe(),
            ));
        }

        let gate: Arc<dyn ResourceGate> =
            Arc::new(ResourceMonitor::new(runtime_config.resources.clone()));
        let source = Arc::new(ChannelAttemptSource::new(channel.clone()));
        let dequeue = DequeueLoop::new(
            source,
            gate.clone(),
            self.runtime_config_tx.subscribe(),
            presence.state(),
            attempt_tx,
            self.dequeue_shutdown.clone(),
        );
        self.handles.push(tokio::spawn(dequeue.run()));

        self.handles.push(spawn_heartbeat_loop(
            channel.clone(),
            gate,
            coordinator.clone(),
            self.supervisor_id.clone(),
            self.runtime_config_tx.subscribe(),
            self.cancel_tx.subscribe(),
        ));

        self.handles.push(spawn_reconcile_loop(
            presence.clone(),
            channel.clone(),
            self.supervisor_id.clone(),
            self.runtime_config_tx.clone(),
            presence.reconciliations(),
            self.cancel_tx.subscribe(),
        ));

        self.handles.push(spawn_channel_event_loop(
            channel.clone(),
            self.supervisor_id.clone(),
            self.runtime_config_tx.clone(),
            channel.events(),
            self.cancel_tx.subscribe(),
        ));

        self.handles.push(spawn_escalation_loop(
            coordinator_events,
            self.cancel_tx.subscribe(),
        ));

        self.channel = Some(channel);
        self.presence_handle = Some(presence_handle);
        self.coordinator = Some(coordinator);

        self.state_tx.send_replace(ControllerState::Running);
        info!("Supervisor {} running", self.supervisor_id);

        Ok(())
    }

    /// Extension point for the build pipeline: a new manifest is handed
    /// to the coordinator so upcoming attempts for its version are
    /// routable.
    pub fn notify_manifest(&self, manifest: WorkerManifest) {
        match &self.coordinator {
            Some(coordinator) => {
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    match coordinator.ensure_worker(&manifest).await {
                        Ok(worker_id) => {
                            info!(
                                "Worker {} serving manifest version {}",
                                worker_id, manifest.version
                            );
                        }
                        Err(e) => {
                            error!(
                                "Could not start worker for manifest version {}: {}",
                                manifest.version, e
                            );
                        }
                    }
                });
            }
            None => warn!(
                "Manifest version {} received before initialization",
                manifest.version
            ),
        }
    }

    /// Ordered teardown: dequeue timer first, then presence, then worker
    /// drain, and the control channel last so in-flight reports can
    /// still go out.
    pub async fn shutdown(&mut self) {
        if *self.state_tx.borrow() == ControllerState::Stopped {
            return;
        }
        info!("Shutting down supervisor {}", self.supervisor_id);
        self.state_tx.send_replace(ControllerState::ShuttingDown);

        self.dequeue_shutdown.notify_one();

        if let Some(handle) = self.presence_handle.take() {
            handle.stop().await;
        }

        if let Some(coordinator) = &self.coordinator {
            coordinator.drain().await;
        }

        self.cancel_tx.send_replace(true);

        if let Some(channel) = &self.channel {
            channel.close().await;
        }

        for handle in self.handles.drain(..) {
            handle.abort();
        }

        self.state_tx.send_replace(ControllerState::Stopped);
        info!("Supervisor stopped");
    }
}

async fn fetch_runtime_config(channel: &ControlChannel) -> Result<RuntimeConfig> {
    let response = channel
        .request(MessageBody::ConfigRequest(ConfigRequest {
            supervisor_version: VERSION.to_string(),
        }))
        .await
        .map_err(|e| {
            SupervisorError::FatalStartup(format!("couldn't retrieve runtime settings: {}", e))
        })?;

    match response {
        MessageBody::ConfigResponse(resp) => Ok(resp.config),
        other => Err(SupervisorError::FatalStartup(format!(
            "expected ConfigResponse, got {:?}",
            other.message_type()
        ))),
    }
}

/// Register this supervisor with the control plane. Returns whether the
/// control plane replaced the runtime config since the last epoch.
async fn register(channel: &ControlChannel, supervisor_id: &str) -> Result<bool> {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    let response = channel
        .request(MessageBody::RegisterWorker(RegisterWorker {
            supervisor_id: supervisor_id.to_string(),
            hostname,
            pid: std::process::id(),
            supervisor_version: VERSION.to_string(),
        }))
        .await?;

    match response {
        MessageBody::RegisterAck(ack) => {
            info!("Registered with control plane");
            Ok(ack.config_changed)
        }
        other => Err(SupervisorError::Protocol(format!(
            "expected RegisterAck, got {:?}",
            other.message_type()
        ))),
    }
}

/// Re-fetch the runtime config and replace the current snapshot
/// wholesale.
async fn refresh_runtime_config(
    channel: &ControlChannel,
    runtime_config_tx: &watch::Sender<RuntimeConfig>,
) {
    match fetch_runtime_config(channel).await {
        Ok(config) => match config.validate() {
            Ok(()) => {
                info!("Runtime settings replaced");
                runtime_config_tx.send_replace(config);
            }
            Err(e) => warn!("Ignoring invalid replacement config: {}", e),
        },
        Err(e) => warn!("Could not refresh runtime settings: {}", e),
    }
}

/// Fan payloads out of the dequeue sink into per-attempt dispatch tasks.
fn spawn_attempt_router(
    mut attempt_rx: mpsc::Receiver<ExecutionAttemptPayload>,
    coordinator: Arc<WorkerCoordinator>,
    channel: Arc<ControlChannel>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(payload) = attempt_rx.recv().await {
            let coordinator = coordinator.clone();
            let channel = channel.clone();
            tokio::spawn(async move {
                dispatch_and_report(coordinator, channel, payload).await;
            });
        }
    })
}

async fn dispatch_and_report(
    coordinator: Arc<WorkerCoordinator>,
    channel: Arc<ControlChannel>,
    payload: ExecutionAttemptPayload,
) {
    let run_id = payload.run_id;
    let attempt_number = payload.attempt_number;

    match coordinator.dispatch(payload).await {
        Ok(outcome) => {
            debug!("Run {} finished: {}", run_id, outcome.as_str());
            let report = MessageBody::AttemptResult(AttemptResult {
                run_id,
                attempt_number,
                outcome,
            });
            match channel.request(report).await {
                Ok(MessageBody::ResultAck(_)) => {}
                Ok(other) => warn!(
                    "Expected ResultAck for run {}, got {:?}",
                    run_id,
                    other.message_type()
                ),
                // Transient: the control plane redelivers unacknowledged
                // attempts
                Err(e) => warn!("Could not report result for run {}: {}", run_id, e),
            }
        }
        Err(e) => {
            warn!("Rejecting run {}: {}", run_id, e);
            let reject = Envelope::event(MessageBody::AttemptRejected(AttemptRejected {
                run_id,
                reason: e.to_string(),
            }));
            if let Err(send_err) = channel.send(reject).await {
                warn!("Could not reject run {}: {}", run_id, send_err);
            }
        }
    }
}

/// Uncorrelated server pushes. Execution payloads are handed to the
/// coordinator like dequeued ones; everything else is logged and
/// dropped.
fn spawn_inbound_handler(
    mut inbound: mpsc::Receiver<Envelope>,
    attempt_tx: mpsc::Sender<ExecutionAttemptPayload>,
    mut cancel_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = inbound.recv() => {
                    let envelope = match maybe {
                        Some(envelope) => envelope,
                        None => break,
                    };
                    match envelope.body {
                        MessageBody::ExecuteAttempt(exec) => {
                            if attempt_tx.send(exec.payload).await.is_err() {
                                break;
                            }
                        }
                        other => {
                            debug!(
                                "Ignoring unsolicited envelope: {:?}",
                                other.message_type()
                            );
                        }
                    }
                }
                _ = cancel_rx.changed() => break,
            }
        }
    })
}

fn spawn_heartbeat_loop(
    channel: Arc<ControlChannel>,
    gate: Arc<dyn ResourceGate>,
    coordinator: Arc<WorkerCoordinator>,
    supervisor_id: String,
    config_rx: watch::Receiver<RuntimeConfig>,
    mut cancel_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let interval = Duration::from_secs(config_rx.borrow().heartbeat_interval_secs);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let snapshot = gate.snapshot();
                    let beat = MessageBody::Heartbeat(Heartbeat {
                        supervisor_id: supervisor_id.clone(),
                        busy_workers: coordinator.busy_workers(),
                        cpu_percent: snapshot.cpu_percent,
                        memory_mib: snapshot.available_memory_mib,
                    });
                    match channel.request(beat).await {
                        Ok(MessageBody::HeartbeatAck(_)) => debug!("Heartbeat acknowledged"),
                        Ok(other) => warn!(
                            "Expected HeartbeatAck, got {:?}",
                            other.message_type()
                        ),
                        Err(e) => warn!("Heartbeat failed: {}", e),
                    }
                }
                _ = cancel_rx.changed() => break,
            }
        }
    })
}

/// Serve presence reconciliation: re-register (and on missed events
/// re-fetch the authoritative config) before presence returns to
/// Connected and the dequeue loop resumes.
fn spawn_reconcile_loop(
    presence: Arc<PresenceMonitor>,
    channel: Arc<ControlChannel>,
    supervisor_id: String,
    runtime_config_tx: watch::Sender<RuntimeConfig>,
    mut recon_rx: broadcast::Receiver<ReconcileReason>,
    mut cancel_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                result = recon_rx.recv() => {
                    let reason = match result {
                        Ok(reason) => reason,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    };
                    info!("Presence reconciliation required: {:?}", reason);

                    match register(&channel, &supervisor_id).await {
                        Ok(config_changed) => {
                            if config_changed || reason == ReconcileReason::MissedEvents {
                                refresh_runtime_config(&channel, &runtime_config_tx).await;
                            }
                            presence.reconciled();
                        }
                        Err(e) => {
                            // Stay in Reconciling; the next presence
                            // event retries the resync
                            warn!("Resync failed: {}", e);
                        }
                    }
                }
                _ = cancel_rx.changed() => break,
            }
        }
    })
}

/// A new channel epoch invalidates the control plane's view of this
/// supervisor; re-register before any dequeue succeeds again.
fn spawn_channel_event_loop(
    channel: Arc<ControlChannel>,
    supervisor_id: String,
    runtime_config_tx: watch::Sender<RuntimeConfig>,
    mut events_rx: broadcast::Receiver<ChannelEvent>,
    mut cancel_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                result = events_rx.recv() => {
                    match result {
                        Ok(ChannelEvent::Ready { epoch }) if epoch > 1 => {
                            match register(&channel, &supervisor_id).await {
                                Ok(true) => {
                                    refresh_runtime_config(&channel, &runtime_config_tx).await;
                                }
                                Ok(false) => {}
                                Err(e) => warn!("Re-registration failed: {}", e),
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = cancel_rx.changed() => break,
            }
        }
    })
}

/// Coordinator escalations. A failed version is fatal for that version
/// only; other versions keep running.
fn spawn_escalation_loop(
    mut events_rx: mpsc::Receiver<CoordinatorEvent>,
    mut cancel_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = events_rx.recv() => {
                    match maybe {
                        Some(CoordinatorEvent::VersionFailed { version, crashes }) => {
                            error!(
                                "Manifest version {} disabled after {} consecutive crashes; \
                                 redeploy to recover",
                                version, crashes
                            );
                        }
                        None => break,
                    }
                }
                _ = cancel_rx.changed() => break,
            }
        }
    })
}
