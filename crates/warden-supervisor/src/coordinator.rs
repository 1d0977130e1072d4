use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::worker::{LaunchedWorker, WorkerLauncher, WorkerStatus};
use warden_core::{
    AttemptOutcome, ExecutionAttemptPayload, ManifestVersion, Result, RunId, SupervisorError,
    WorkerLimits, WorkerManifest,
};
use warden_protocol::{Envelope, ExecuteAttempt, MessageBody};

const EVENT_BUFFER: usize = 16;
const DRAIN_POLL_MS: u64 = 100;

/// Escalations the coordinator cannot resolve on its own
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    /// The crash budget for a manifest version is exhausted; no further
    /// spawn attempts will be made for it
    VersionFailed {
        version: ManifestVersion,
        crashes: u32,
    },
}

/// One supervised worker. The coordinator is the only writer of this
/// state; everything else observes through the status watch.
struct WorkerEntry {
    id: Uuid,
    version: ManifestVersion,
    max_concurrency: u32,
    status_tx: watch::Sender<WorkerStatus>,
    active: AtomicU32,
    sender: mpsc::Sender<Envelope>,
    kill: Arc<Notify>,
    pending: Mutex<HashMap<RunId, oneshot::Sender<AttemptOutcome>>>,
    last_heartbeat: RwLock<DateTime<Utc>>,
}

impl WorkerEntry {
    fn status(&self) -> WorkerStatus {
        *self.status_tx.borrow()
    }

    fn set_status(&self, status: WorkerStatus) {
        self.status_tx.send_replace(status);
    }

    /// Fail every in-flight attempt exactly once
    fn fail_pending(&self, reason: &str) {
        let waiters: Vec<_> = {
            let mut pending = self.pending.lock();
            pending.drain().collect()
        };
        for (run_id, tx) in waiters {
            debug!("Failing in-flight run {} on worker {}: {}", run_id, self.id, reason);
            let _ = tx.send(AttemptOutcome::InfrastructureFailure {
                reason: reason.to_string(),
            });
        }
    }
}

/// Owns the set of live worker processes: spawns them, routes execution
/// payloads to the worker matching a manifest version, detects crashes,
/// and drains everything on shutdown. No other component may spawn or
/// terminate a worker process.
pub struct WorkerCoordinator {
    launcher: Arc<dyn WorkerLauncher>,
    limits: WorkerLimits,
    registry: RwLock<HashMap<ManifestVersion, Arc<WorkerEntry>>>,
    manifests: RwLock<HashMap<ManifestVersion, WorkerManifest>>,
    crash_counts: RwLock<HashMap<ManifestVersion, u32>>,
    events_tx: mpsc::Sender<CoordinatorEvent>,
    // Serializes spawning so no version ever has two concurrently
    // starting instances
    spawn_lock: tokio::sync::Mutex<()>,
    draining: AtomicBool,
}

impl WorkerCoordinator {
    pub fn new(
        launcher: Arc<dyn WorkerLauncher>,
        limits: WorkerLimits,
    ) -> (Arc<Self>, mpsc::Receiver<CoordinatorEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let coordinator = Arc::new(WorkerCoordinator {
            launcher,
            limits,
            registry: RwLock::new(HashMap::new()),
            manifests: RwLock::new(HashMap::new()),
            crash_counts: RwLock::new(HashMap::new()),
            events_tx,
            spawn_lock: tokio::sync::Mutex::new(()),
            draining: AtomicBool::new(false),
        });
        (coordinator, events_rx)
    }

    /// Current status of the worker serving a manifest version
    pub fn worker_status(&self, version: &str) -> Option<WorkerStatus> {
        self.registry.read().get(version).map(|entry| entry.status())
    }

    /// Workers currently executing at least one attempt
    pub fn busy_workers(&self) -> u32 {
        self.registry
            .read()
            .values()
            .filter(|entry| entry.active.load(Ordering::SeqCst) > 0)
            .count() as u32
    }

    /// Return the worker serving this manifest's version, spawning one if
    /// none is alive. A Ready or Starting worker is reused; a Crashed or
    /// Stopped one is replaced, bounded by the per-version crash budget.
    pub async fn ensure_worker(self: &Arc<Self>, manifest: &WorkerManifest) -> Result<Uuid> {
        if self.draining.load(Ordering::SeqCst) {
            return Err(SupervisorError::ShuttingDown);
        }

        self.manifests
            .write()
            .entry(manifest.version.clone())
            .or_insert_with(|| manifest.clone());

        let _guard = self.spawn_lock.lock().await;

        if let Some(entry) = self.registry.read().get(&manifest.version) {
            let status = entry.status();
            if status == WorkerStatus::Starting || status.accepts_work() {
                return Ok(entry.id);
            }
        }

        let crashes = self
            .crash_counts
            .read()
            .get(&manifest.version)
            .copied()
            .unwrap_or(0);
        if crashes >= self.limits.crash_budget {
            return Err(SupervisorError::CrashBudgetExhausted {
                version: manifest.version.clone(),
                crashes,
            });
        }

        let worker_id = Uuid::new_v4();
        let launched = match self.launcher.launch(manifest, worker_id).await {
            Ok(launched) => launched,
            Err(e) => {
                self.note_crash(&manifest.version, &format!("spawn failed: {}", e)).await;
                return Err(e);
            }
        };

        let LaunchedWorker {
            sender,
            receiver,
            exited,
            kill,
        } = launched;

        let (status_tx, _) = watch::channel(WorkerStatus::Starting);
        let entry = Arc::new(WorkerEntry {
            id: worker_id,
            version: manifest.version.clone(),
            max_concurrency: manifest.max_concurrency(),
            status_tx,
            active: AtomicU32::new(0),
            sender,
            kill,
            pending: Mutex::new(HashMap::new()),
            last_heartbeat: RwLock::new(Utc::now()),
        });

        self.registry
            .write()
            .insert(manifest.version.clone(), entry.clone());

        tokio::spawn(self.clone().supervise(entry, receiver, exited));

        Ok(worker_id)
    }

    /// Route one attempt to the worker matching its manifest version and
    /// wait for the terminal outcome. Success and task failure are both
    /// normal completions; a crash mid-flight resolves to an
    /// infrastructure failure. No version match within the bounded wait
    /// rejects the payload as unroutable.
    pub async fn dispatch(
        self: &Arc<Self>,
        payload: ExecutionAttemptPayload,
    ) -> Result<AttemptOutcome> {
        if self.draining.load(Ordering::SeqCst) {
            return Err(SupervisorError::ShuttingDown);
        }

        let version = payload.manifest_version.clone();
        let entry = match self.routable_worker(&version) {
            Some(entry) => entry,
            None => self.await_routable(&version).await?,
        };

        // Reserve a concurrency slot
        let active = entry.active.fetch_add(1, Ordering::SeqCst) + 1;
        if active > entry.max_concurrency || !entry.status().accepts_work() {
            entry.active.fetch_sub(1, Ordering::SeqCst);
            return Err(SupervisorError::Unroutable(version));
        }
        entry.set_status(WorkerStatus::Busy);

        let run_id = payload.run_id;
        let (tx, rx) = oneshot::channel();
        entry.pending.lock().insert(run_id, tx);

        let envelope = Envelope::event(MessageBody::ExecuteAttempt(ExecuteAttempt { payload }));
        if entry.sender.send(envelope).await.is_err() {
            entry.pending.lock().remove(&run_id);
            self.release_slot(&entry);
            return Ok(AttemptOutcome::InfrastructureFailure {
                reason: "worker channel closed before dispatch".to_string(),
            });
        }

        debug!("Dispatched run {} to worker {} (version {})", run_id, entry.id, version);

        let outcome = match rx.await {
            Ok(outcome) => outcome,
            Err(_) => AttemptOutcome::InfrastructureFailure {
                reason: "worker terminated without reporting a result".to_string(),
            },
        };

        self.release_slot(&entry);

        // A normal completion proves the worker healthy again
        if !outcome.is_infrastructure_failure() {
            self.crash_counts.write().remove(&version);
        }

        Ok(outcome)
    }

    /// Stop accepting dispatches, let in-flight work finish within the
    /// grace period, then force-stop whatever remains.
    pub async fn drain(&self) {
        self.draining.store(true, Ordering::SeqCst);

        let entries: Vec<Arc<WorkerEntry>> = self.registry.read().values().cloned().collect();
        for entry in &entries {
            let status = entry.status();
            if status == WorkerStatus::Starting || status.accepts_work() {
                entry.set_status(WorkerStatus::Draining);
            }
        }

        let draining: Vec<_> = entries
            .iter()
            .filter(|e| e.status() == WorkerStatus::Draining)
            .collect();
        info!("Draining {} workers", draining.len());

        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.limits.drain_grace_secs);
        loop {
            let in_flight: u32 = draining
                .iter()
                .map(|e| e.active.load(Ordering::SeqCst))
                .sum();
            if in_flight == 0 {
                info!("All in-flight attempts completed, stopping workers");
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("Drain grace expired with {} attempts in flight", in_flight);
                break;
            }
            tokio::time::sleep(Duration::from_millis(DRAIN_POLL_MS)).await;
        }

        for entry in draining {
            entry.fail_pending("worker force-stopped during drain");
            entry.set_status(WorkerStatus::Stopped);
            entry.kill.notify_one();
        }
    }

    fn routable_worker(&self, version: &str) -> Option<Arc<WorkerEntry>> {
        let registry = self.registry.read();
        let entry = registry.get(version)?;
        let status = entry.status();
        let has_slot = entry.active.load(Ordering::SeqCst) < entry.max_concurrency;
        if status.accepts_work() && has_slot {
            Some(entry.clone())
        } else {
            None
        }
    }

    /// No routable worker right now: wait briefly for a Starting one, or
    /// respawn from a known manifest, then wait. Bounded by the dispatch
    /// wait window.
    async fn await_routable(self: &Arc<Self>, version: &str) -> Result<Arc<WorkerEntry>> {
        let existing = self.registry.read().get(version).cloned();
        let entry = match existing {
            Some(entry) if entry.status() == WorkerStatus::Starting => entry,
            Some(entry) if entry.status().accepts_work() => entry,
            _ => {
                let manifest = self.manifests.read().get(version).cloned();
                match manifest {
                    Some(manifest) => {
                        self.ensure_worker(&manifest).await?;
                        self.registry
                            .read()
                            .get(version)
                            .cloned()
                            .ok_or_else(|| SupervisorError::Unroutable(version.to_string()))?
                    }
                    None => return Err(SupervisorError::Unroutable(version.to_string())),
                }
            }
        };

        let wait = Duration::from_millis(self.limits.dispatch_wait_ms);
        let mut status_rx = entry.status_tx.subscribe();
        let settled = timeout(
            wait,
            status_rx.wait_for(|status| *status != WorkerStatus::Starting),
        )
        .await;

        match settled {
            Ok(Ok(_)) if entry.status().accepts_work() => Ok(entry),
            _ => Err(SupervisorError::Unroutable(version.to_string())),
        }
    }

    fn release_slot(&self, entry: &Arc<WorkerEntry>) {
        let remaining = entry.active.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        if remaining == 0 && entry.status() == WorkerStatus::Busy {
            entry.set_status(WorkerStatus::Ready);
        }
    }

    /// Per-worker supervision: readiness with a startup timeout, then
    /// heartbeat liveness and result routing until exit.
    async fn supervise(
        self: Arc<Self>,
        entry: Arc<WorkerEntry>,
        mut receiver: mpsc::Receiver<Envelope>,
        mut exited: oneshot::Receiver<String>,
    ) {
        let startup_deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.limits.startup_timeout_secs);
        let mut channel_open = true;

        // Starting phase: nothing is routable until the worker signals
        // readiness
        while entry.status() == WorkerStatus::Starting {
            tokio::select! {
                _ = tokio::time::sleep_until(startup_deadline) => {
                    warn!(
                        "Worker {} (version {}) not ready within {}s",
                        entry.id, entry.version, self.limits.startup_timeout_secs
                    );
                    entry.kill.notify_one();
                    self.record_crash(&entry, "startup timeout").await;
                    return;
                }
                reason = &mut exited => {
                    let reason = reason.unwrap_or_else(|_| "exit channel dropped".to_string());
                    self.record_crash(&entry, &format!("process {} before ready", reason)).await;
                    return;
                }
                maybe = receiver.recv(), if channel_open => {
                    match maybe {
                        Some(envelope) => self.handle_worker_envelope(&entry, envelope),
                        None => channel_open = false,
                    }
                }
            }
        }

        if entry.status() != WorkerStatus::Ready {
            // Drained or replaced while starting
            return;
        }
        info!("Worker {} ready (version {})", entry.id, entry.version);

        let liveness = Duration::from_secs(self.limits.liveness_timeout_secs);
        let mut liveness_check =
            tokio::time::interval(Duration::from_secs(self.limits.liveness_timeout_secs.max(2) / 2));
        liveness_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                reason = &mut exited => {
                    let reason = reason.unwrap_or_else(|_| "exit channel dropped".to_string());
                    let status = entry.status();
                    if status == WorkerStatus::Draining || status == WorkerStatus::Stopped {
                        info!("Worker {} stopped ({})", entry.id, reason);
                        entry.fail_pending("worker stopped during drain");
                        entry.set_status(WorkerStatus::Stopped);
                    } else {
                        self.record_crash(&entry, &format!("process {}", reason)).await;
                    }
                    return;
                }
                maybe = receiver.recv(), if channel_open => {
                    match maybe {
                        Some(envelope) => self.handle_worker_envelope(&entry, envelope),
                        None => channel_open = false,
                    }
                }
                _ = liveness_check.tick() => {
                    let stale = Utc::now() - *entry.last_heartbeat.read()
                        > chrono::Duration::from_std(liveness).unwrap_or(chrono::Duration::seconds(30));
                    if entry.status() == WorkerStatus::Busy && stale {
                        warn!(
                            "Worker {} unresponsive while busy (no heartbeat in {:?})",
                            entry.id, liveness
                        );
                        entry.kill.notify_one();
                        self.record_crash(&entry, "liveness timeout while busy").await;
                        return;
                    }
                }
            }
        }
    }

    fn handle_worker_envelope(&self, entry: &Arc<WorkerEntry>, envelope: Envelope) {
        match envelope.body {
            MessageBody::WorkerReady(_) => {
                *entry.last_heartbeat.write() = Utc::now();
                if entry.status() == WorkerStatus::Starting {
                    entry.set_status(WorkerStatus::Ready);
                }
            }
            MessageBody::WorkerHeartbeat(_) => {
                *entry.last_heartbeat.write() = Utc::now();
            }
            MessageBody::AttemptCompleted(done) => {
                *entry.last_heartbeat.write() = Utc::now();
                let waiter = entry.pending.lock().remove(&done.run_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(done.outcome);
                    }
                    None => {
                        warn!("Worker {} reported unknown run {}", entry.id, done.run_id);
                    }
                }
            }
            other => {
                debug!(
                    "Unexpected envelope from worker {}: {:?}",
                    entry.id,
                    other.message_type()
                );
            }
        }
    }

    /// One crash event: mark the worker Crashed, fail its in-flight
    /// attempts exactly once, and charge the version's crash budget.
    async fn record_crash(self: &Arc<Self>, entry: &Arc<WorkerEntry>, reason: &str) {
        error!(
            "Worker {} (version {}) crashed: {}",
            entry.id, entry.version, reason
        );
        entry.set_status(WorkerStatus::Crashed);
        entry.fail_pending(reason);
        self.note_crash(&entry.version, reason).await;
    }

    async fn note_crash(self: &Arc<Self>, version: &str, reason: &str) {
        let crashes = {
            let mut counts = self.crash_counts.write();
            let count = counts.entry(version.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        if crashes >= self.limits.crash_budget {
            error!(
                "Crash budget exhausted for version {} ({} consecutive crashes): {}",
                version, crashes, reason
            );
            let _ = self
                .events_tx
                .send(CoordinatorEvent::VersionFailed {
                    version: version.to_string(),
                    crashes,
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use warden_protocol::{AttemptCompleted, WorkerReady};

    struct FakeWorkerHandle {
        to_worker: mpsc::Receiver<Envelope>,
        from_worker: mpsc::Sender<Envelope>,
        exited: Option<oneshot::Sender<String>>,
        killed: Arc<AtomicBool>,
    }

    struct FakeLauncher {
        auto_ready: bool,
        launches: AtomicU32,
        handles_tx: mpsc::UnboundedSender<FakeWorkerHandle>,
    }

    impl FakeLauncher {
        fn new(auto_ready: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<FakeWorkerHandle>) {
            let (handles_tx, handles_rx) = mpsc::unbounded_channel();
            (
                Arc::new(FakeLauncher {
                    auto_ready,
                    launches: AtomicU32::new(0),
                    handles_tx,
                }),
                handles_rx,
            )
        }
    }

    #[async_trait::async_trait]
    impl WorkerLauncher for FakeLauncher {
        async fn launch(
            &self,
            _manifest: &WorkerManifest,
            worker_id: Uuid,
        ) -> Result<LaunchedWorker> {
            self.launches.fetch_add(1, Ordering::SeqCst);

            let (to_tx, to_rx) = mpsc::channel(16);
            let (from_tx, from_rx) = mpsc::channel(16);
            let (exit_tx, exit_rx) = oneshot::channel();
            let kill = Arc::new(Notify::new());

            let killed = Arc::new(AtomicBool::new(false));
            let killed_flag = killed.clone();
            let kill_watch = kill.clone();
            tokio::spawn(async move {
                kill_watch.notified().await;
                killed_flag.store(true, Ordering::SeqCst);
            });

            if self.auto_ready {
                let _ = from_tx
                    .send(Envelope::event(MessageBody::WorkerReady(WorkerReady {
                        worker_id,
                    })))
                    .await;
            }

            let _ = self.handles_tx.send(FakeWorkerHandle {
                to_worker: to_rx,
                from_worker: from_tx,
                exited: Some(exit_tx),
                killed,
            });

            Ok(LaunchedWorker {
                sender: to_tx,
                receiver: from_rx,
                exited: exit_rx,
                kill,
            })
        }
    }

    fn limits() -> WorkerLimits {
        WorkerLimits {
            startup_timeout_secs: 1,
            liveness_timeout_secs: 30,
            drain_grace_secs: 1,
            crash_budget: 2,
            dispatch_wait_ms: 500,
        }
    }

    fn manifest(version: &str) -> WorkerManifest {
        let mut manifest = WorkerManifest::new(version, "worker-shim");
        manifest.tasks.push(warden_core::TaskDefinition {
            id: "demo.task".to_string(),
            name: "Demo".to_string(),
            concurrency: 1,
        });
        manifest
    }

    fn payload(version: &str) -> ExecutionAttemptPayload {
        ExecutionAttemptPayload::new("demo.task", version, json!({})).unwrap()
    }

    async fn wait_for_status(
        coordinator: &Arc<WorkerCoordinator>,
        version: &str,
        want: WorkerStatus,
    ) {
        timeout(Duration::from_secs(5), async {
            loop {
                if coordinator.worker_status(version) == Some(want) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("worker never reached {:?}", want));
    }

    /// Drive one fake worker: complete every dispatched attempt with the
    /// given outcome.
    fn serve(mut handle: FakeWorkerHandle, outcome: AttemptOutcome) {
        tokio::spawn(async move {
            while let Some(envelope) = handle.to_worker.recv().await {
                if let MessageBody::ExecuteAttempt(exec) = envelope.body {
                    let _ = handle
                        .from_worker
                        .send(Envelope::event(MessageBody::AttemptCompleted(
                            AttemptCompleted {
                                run_id: exec.payload.run_id,
                                attempt_number: exec.payload.attempt_number,
                                outcome: outcome.clone(),
                            },
                        )))
                        .await;
                }
            }
        });
    }

    #[tokio::test]
    async fn test_ensure_worker_reuses_existing() {
        let (launcher, _handles) = FakeLauncher::new(true);
        let (coordinator, _events) = WorkerCoordinator::new(launcher.clone(), limits());

        let first = coordinator.ensure_worker(&manifest("v1")).await.unwrap();
        let second = coordinator.ensure_worker(&manifest("v1")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_never_two_starting_instances_of_same_version() {
        let (launcher, _handles) = FakeLauncher::new(false);
        let (coordinator, _events) = WorkerCoordinator::new(launcher.clone(), limits());

        let m = manifest("v1");
        let (a, b) = tokio::join!(coordinator.ensure_worker(&m), coordinator.ensure_worker(&m));

        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispatch_routes_to_matching_version() {
        let (launcher, mut handles) = FakeLauncher::new(true);
        let (coordinator, _events) = WorkerCoordinator::new(launcher, limits());

        coordinator.ensure_worker(&manifest("v3")).await.unwrap();
        let handle = handles.recv().await.unwrap();
        serve(handle, AttemptOutcome::Success { output: None });

        let outcome = coordinator.dispatch(payload("v3")).await.unwrap();
        assert_eq!(outcome, AttemptOutcome::Success { output: None });
        wait_for_status(&coordinator, "v3", WorkerStatus::Ready).await;
    }

    #[tokio::test]
    async fn test_task_failure_is_normal_completion() {
        let (launcher, mut handles) = FakeLauncher::new(true);
        let (coordinator, _events) = WorkerCoordinator::new(launcher, limits());

        coordinator.ensure_worker(&manifest("v1")).await.unwrap();
        serve(
            handles.recv().await.unwrap(),
            AttemptOutcome::TaskFailure {
                error: "user code raised".to_string(),
            },
        );

        let outcome = coordinator.dispatch(payload("v1")).await.unwrap();
        assert!(matches!(outcome, AttemptOutcome::TaskFailure { .. }));
        // The worker stays healthy after a task-level failure
        wait_for_status(&coordinator, "v1", WorkerStatus::Ready).await;
    }

    #[tokio::test]
    async fn test_dispatch_unknown_version_is_unroutable() {
        let (launcher, _handles) = FakeLauncher::new(true);
        let (coordinator, _events) = WorkerCoordinator::new(launcher, limits());

        match coordinator.dispatch(payload("v9")).await {
            Err(SupervisorError::Unroutable(version)) => assert_eq!(version, "v9"),
            other => panic!("Expected Unroutable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_crash_isolation() {
        let (launcher, mut handles) = FakeLauncher::new(true);
        let (coordinator, _events) = WorkerCoordinator::new(launcher, limits());

        coordinator.ensure_worker(&manifest("v1")).await.unwrap();
        let mut crashing = handles.recv().await.unwrap();
        coordinator.ensure_worker(&manifest("v2")).await.unwrap();
        let _healthy = handles.recv().await.unwrap();

        wait_for_status(&coordinator, "v1", WorkerStatus::Ready).await;
        wait_for_status(&coordinator, "v2", WorkerStatus::Ready).await;

        // Dispatch to v1, then kill the process mid-flight
        let dispatcher = coordinator.clone();
        let in_flight = tokio::spawn(async move { dispatcher.dispatch(payload("v1")).await });
        // Wait until the worker actually received the attempt
        let _ = crashing.to_worker.recv().await.unwrap();
        crashing
            .exited
            .take()
            .unwrap()
            .send("exited with signal 9".to_string())
            .unwrap();

        let outcome = in_flight.await.unwrap().unwrap();
        assert!(outcome.is_infrastructure_failure());

        wait_for_status(&coordinator, "v1", WorkerStatus::Crashed).await;
        // The sibling worker is untouched
        assert_eq!(coordinator.worker_status("v2"), Some(WorkerStatus::Ready));
    }

    #[tokio::test]
    async fn test_startup_timeout_charges_crash_budget() {
        let (launcher, _handles) = FakeLauncher::new(false);
        let (coordinator, mut events) = WorkerCoordinator::new(launcher.clone(), limits());

        coordinator.ensure_worker(&manifest("v1")).await.unwrap();
        wait_for_status(&coordinator, "v1", WorkerStatus::Crashed).await;

        // Budget is 2: a second failed start exhausts it
        coordinator.ensure_worker(&manifest("v1")).await.unwrap();
        wait_for_status(&coordinator, "v1", WorkerStatus::Crashed).await;

        match timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some(CoordinatorEvent::VersionFailed { version, crashes })) => {
                assert_eq!(version, "v1");
                assert_eq!(crashes, 2);
            }
            other => panic!("Expected VersionFailed, got {:?}", other),
        }

        match coordinator.ensure_worker(&manifest("v1")).await {
            Err(SupervisorError::CrashBudgetExhausted { version, crashes }) => {
                assert_eq!(version, "v1");
                assert_eq!(crashes, 2);
            }
            other => panic!("Expected CrashBudgetExhausted, got {:?}", other.map(|_| ())),
        }
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_drain_rejects_new_work_and_force_stops() {
        let (launcher, mut handles) = FakeLauncher::new(true);
        let (coordinator, _events) = WorkerCoordinator::new(launcher, limits());

        coordinator.ensure_worker(&manifest("v1")).await.unwrap();
        let mut handle = handles.recv().await.unwrap();
        wait_for_status(&coordinator, "v1", WorkerStatus::Ready).await;

        // One attempt in flight that never completes
        let dispatcher = coordinator.clone();
        let in_flight = tokio::spawn(async move { dispatcher.dispatch(payload("v1")).await });
        let _ = handle.to_worker.recv().await.unwrap();

        coordinator.drain().await;

        // The stuck attempt was failed as infrastructure so the control
        // plane can redeliver it
        let outcome = in_flight.await.unwrap().unwrap();
        assert!(outcome.is_infrastructure_failure());
        timeout(Duration::from_secs(2), async {
            while !handle.killed.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("worker was never force-killed");
        assert_eq!(coordinator.worker_status("v1"), Some(WorkerStatus::Stopped));

        match coordinator.dispatch(payload("v1")).await {
            Err(SupervisorError::ShuttingDown) => {}
            other => panic!("Expected ShuttingDown, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_drain_waits_for_completion_within_grace() {
        let (launcher, mut handles) = FakeLauncher::new(true);
        let (coordinator, _events) = WorkerCoordinator::new(launcher, limits());

        coordinator.ensure_worker(&manifest("v1")).await.unwrap();
        let mut handle = handles.recv().await.unwrap();
        wait_for_status(&coordinator, "v1", WorkerStatus::Ready).await;

        let dispatcher = coordinator.clone();
        let in_flight = tokio::spawn(async move { dispatcher.dispatch(payload("v1")).await });
        let envelope = handle.to_worker.recv().await.unwrap();

        // Complete the attempt shortly after drain begins
        let from_worker = handle.from_worker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            if let MessageBody::ExecuteAttempt(exec) = envelope.body {
                let _ = from_worker
                    .send(Envelope::event(MessageBody::AttemptCompleted(
                        AttemptCompleted {
                            run_id: exec.payload.run_id,
                            attempt_number: 1,
                            outcome: AttemptOutcome::Success { output: None },
                        },
                    )))
                    .await;
            }
        });

        coordinator.drain().await;

        let outcome = in_flight.await.unwrap().unwrap();
        assert_eq!(outcome, AttemptOutcome::Success { output: None });
    }

    #[tokio::test]
    async fn test_busy_worker_without_spare_slots_rejects() {
        let (launcher, mut handles) = FakeLauncher::new(true);
        let (coordinator, _events) = WorkerCoordinator::new(launcher, limits());

        coordinator.ensure_worker(&manifest("v1")).await.unwrap();
        let mut handle = handles.recv().await.unwrap();
        wait_for_status(&coordinator, "v1", WorkerStatus::Ready).await;

        let dispatcher = coordinator.clone();
        let _first = tokio::spawn(async move { dispatcher.dispatch(payload("v1")).await });
        let _ = handle.to_worker.recv().await.unwrap();

        // Declared concurrency is 1; the second dispatch must not queue
        // behind the first forever
        match coordinator.dispatch(payload("v1")).await {
            Err(SupervisorError::Unroutable(_)) => {}
            other => panic!("Expected Unroutable, got {:?}", other),
        }
    }
}
