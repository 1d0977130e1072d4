use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::channel::backoff_delay;
use warden_protocol::{EnvelopeCodec, MessageBody, ProtocolError};

const RECONCILE_BUFFER: usize = 8;

/// Liveness signal observed by the rest of the supervisor. Transitions
/// are monotonic within a connection epoch:
/// Disconnected -> Connecting -> Connected -> {Connected, Reconciling}
/// -> Disconnected, then a new epoch begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    Disconnected,
    Connecting,
    Connected,
    Reconciling,
}

/// Why dependents must re-synchronize state that may have drifted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileReason {
    /// Link was degraded and restored; cheap resync
    Reconnected,

    /// Events were lost; full resync required before dequeueing resumes
    MissedEvents,
}

/// Server-push presence stream, exposed to the rest of the supervisor as
/// an explicit state machine: a single watch channel carries the
/// four-state signal and raw transport errors never leave this module.
pub struct PresenceMonitor {
    inner: Arc<PresenceInner>,
}

struct PresenceInner {
    addr: String,
    liveness: Duration,
    backoff_ceiling: Duration,
    state_tx: watch::Sender<PresenceState>,
    recon_tx: broadcast::Sender<ReconcileReason>,
    shutdown: Notify,
}

impl PresenceInner {
    fn set_state(&self, state: PresenceState) {
        self.state_tx.send_replace(state);
    }
}

/// Unsubscribe handle returned by `start`
pub struct PresenceHandle {
    inner: Arc<PresenceInner>,
    task: JoinHandle<()>,
}

impl PresenceHandle {
    pub async fn stop(self) {
        info!("Closing presence connection");
        self.inner.shutdown.notify_one();
        if timeout(Duration::from_secs(5), self.task).await.is_err() {
            warn!("Presence monitor did not stop within 5s");
        }
    }
}

impl PresenceMonitor {
    pub fn new(addr: impl Into<String>, liveness: Duration, backoff_ceiling: Duration) -> Self {
        let (state_tx, _) = watch::channel(PresenceState::Disconnected);
        let (recon_tx, _) = broadcast::channel(RECONCILE_BUFFER);

        PresenceMonitor {
            inner: Arc::new(PresenceInner {
                addr: addr.into(),
                liveness,
                backoff_ceiling,
                state_tx,
                recon_tx,
                shutdown: Notify::new(),
            }),
        }
    }

    /// The four-state presence signal
    pub fn state(&self) -> watch::Receiver<PresenceState> {
        self.inner.state_tx.subscribe()
    }

    /// Notifications that dependents must re-synchronize
    pub fn reconciliations(&self) -> broadcast::Receiver<ReconcileReason> {
        self.inner.recon_tx.subscribe()
    }

    /// Called by the subscriber once a full resync after `MissedEvents`
    /// has completed; returns the state to Connected.
    pub fn reconciled(&self) {
        self.inner.state_tx.send_modify(|state| {
            if *state == PresenceState::Reconciling {
                *state = PresenceState::Connected;
            }
        });
    }

    pub fn start(&self) -> PresenceHandle {
        let inner = self.inner.clone();
        let task = tokio::spawn(run(inner));

        PresenceHandle {
            inner: self.inner.clone(),
            task,
        }
    }
}

async fn run(inner: Arc<PresenceInner>) {
    let mut attempt: u32 = 0;

    loop {
        inner.set_state(PresenceState::Connecting);

        let connect_result = tokio::select! {
            result = TcpStream::connect(&inner.addr) => result,
            _ = inner.shutdown.notified() => break,
        };

        let mut framed = match connect_result {
            Ok(stream) => {
                info!("Presence stream connected to {}", inner.addr);
                attempt = 0;
                inner.set_state(PresenceState::Connected);
                Framed::new(stream, EnvelopeCodec)
            }
            Err(e) => {
                warn!("Presence connection failed: {}", e);
                inner.set_state(PresenceState::Disconnected);
                let delay = backoff_delay(attempt, inner.backoff_ceiling);
                attempt += 1;
                tokio::select! {
                    _ = tokio::time::sleep(delay) => continue,
                    _ = inner.shutdown.notified() => break,
                }
            }
        };

        // One connection epoch: read events until loss or staleness
        loop {
            let event = tokio::select! {
                result = timeout(inner.liveness, framed.next()) => result,
                _ = inner.shutdown.notified() => {
                    inner.set_state(PresenceState::Disconnected);
                    return;
                }
            };

            match event {
                Ok(Some(Ok(envelope))) => match envelope.body {
                    MessageBody::PresencePing(_) => {
                        debug!("Presence ping received");
                    }
                    MessageBody::PresenceReconnect(_) => {
                        info!("Presence connection restored");
                        // A pending full resync still gates the return
                        // to Connected
                        inner.state_tx.send_modify(|state| {
                            if *state != PresenceState::Reconciling {
                                *state = PresenceState::Connected;
                            }
                        });
                        let _ = inner.recon_tx.send(ReconcileReason::Reconnected);
                    }
                    MessageBody::PresenceMissedEvents(_) => {
                        warn!("Missed presence events during disconnection");
                        inner.set_state(PresenceState::Reconciling);
                        let _ = inner.recon_tx.send(ReconcileReason::MissedEvents);
                    }
                    other => {
                        warn!(
                            "Unexpected envelope on presence stream: {:?}",
                            other.message_type()
                        );
                    }
                },
                Ok(Some(Err(ProtocolError::IoError(e)))) => {
                    warn!("Presence transport error: {}", e);
                    break;
                }
                Ok(Some(Err(e))) => {
                    warn!("Dropping invalid presence envelope: {}", e);
                }
                Ok(None) => {
                    warn!("Presence stream closed by peer");
                    break;
                }
                Err(_) => {
                    warn!("No presence ping within {:?}", inner.liveness);
                    break;
                }
            }
        }

        inner.set_state(PresenceState::Disconnected);
        let delay = backoff_delay(attempt, inner.backoff_ceiling);
        attempt += 1;
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = inner.shutdown.notified() => break,
        }
    }

    inner.set_state(PresenceState::Disconnected);
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::SinkExt;
    use tokio::net::TcpListener;
    use warden_protocol::{Envelope, PresenceMissedEvents, PresencePing};

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    fn monitor(addr: &str, liveness: Duration) -> PresenceMonitor {
        PresenceMonitor::new(addr, liveness, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_ping_keeps_connected() {
        let (listener, addr) = listener().await;
        let monitor = monitor(&addr, Duration::from_secs(5));
        let mut state = monitor.state();
        let handle = monitor.start();

        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, EnvelopeCodec);
        framed
            .send(Envelope::event(MessageBody::PresencePing(PresencePing)))
            .await
            .unwrap();

        state
            .wait_for(|s| *s == PresenceState::Connected)
            .await
            .unwrap();

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_missed_events_requires_reconciliation() {
        let (listener, addr) = listener().await;
        let monitor = monitor(&addr, Duration::from_secs(5));
        let mut state = monitor.state();
        let mut reconciliations = monitor.reconciliations();
        let handle = monitor.start();

        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, EnvelopeCodec);
        framed
            .send(Envelope::event(MessageBody::PresenceMissedEvents(
                PresenceMissedEvents,
            )))
            .await
            .unwrap();

        state
            .wait_for(|s| *s == PresenceState::Reconciling)
            .await
            .unwrap();
        assert_eq!(
            reconciliations.recv().await.unwrap(),
            ReconcileReason::MissedEvents
        );

        // Only the subscriber's explicit ack returns the state to
        // Connected
        monitor.reconciled();
        state
            .wait_for(|s| *s == PresenceState::Connected)
            .await
            .unwrap();

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_peer_drop_transitions_disconnected_then_reconnects() {
        let (listener, addr) = listener().await;
        let monitor = monitor(&addr, Duration::from_secs(5));
        let mut state = monitor.state();
        let handle = monitor.start();

        let (stream, _) = listener.accept().await.unwrap();
        state
            .wait_for(|s| *s == PresenceState::Connected)
            .await
            .unwrap();

        drop(stream);
        state
            .wait_for(|s| *s == PresenceState::Disconnected)
            .await
            .unwrap();

        // New epoch after backoff
        let (_stream2, _) = listener.accept().await.unwrap();
        state
            .wait_for(|s| *s == PresenceState::Connected)
            .await
            .unwrap();

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_stale_ping_counts_as_loss() {
        let (listener, addr) = listener().await;
        let monitor = monitor(&addr, Duration::from_millis(100));
        let mut state = monitor.state();
        let handle = monitor.start();

        // Accept but never send a ping
        let (_stream, _) = listener.accept().await.unwrap();
        state
            .wait_for(|s| *s == PresenceState::Connected)
            .await
            .unwrap();
        state
            .wait_for(|s| *s == PresenceState::Disconnected)
            .await
            .unwrap();

        handle.stop().await;
    }
}
