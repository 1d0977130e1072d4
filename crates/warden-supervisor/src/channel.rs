use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use warden_core::{Result, SupervisorError};
use warden_protocol::{CorrelationId, Envelope, EnvelopeCodec, MessageBody, ProtocolError};

const OUTBOUND_BUFFER: usize = 64;
const INBOUND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 16;
const BACKOFF_BASE_MS: u64 = 500;

/// Connection lifecycle notifications for channel dependents. `Ready`
/// carries the epoch: any request outstanding across an epoch change was
/// never answered and must be re-issued or failed by its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    Ready { epoch: u64 },
    Down,
}

/// Exponential backoff with jitter, bounded by the configured ceiling.
pub(crate) fn backoff_delay(attempt: u32, ceiling: Duration) -> Duration {
    let exp = BACKOFF_BASE_MS.saturating_mul(2u64.saturating_pow(attempt.min(16)));
    let capped = exp.min(ceiling.as_millis() as u64).max(1);
    let jitter = rand::thread_rng().gen_range(0..=capped / 4);
    Duration::from_millis(capped + jitter)
}

type PendingMap = Arc<Mutex<HashMap<CorrelationId, oneshot::Sender<MessageBody>>>>;

/// Persistent, bidirectional, ordered connection to the control plane.
///
/// Reconnection is the channel's own responsibility: on transport failure
/// every pending correlated request is failed, the channel retries with
/// bounded exponential backoff, and a fresh `Ready` event (new epoch) is
/// emitted on success. Unacknowledged sends are not replayed.
pub struct ControlChannel {
    outbound_tx: mpsc::Sender<Envelope>,
    pending: PendingMap,
    events_tx: broadcast::Sender<ChannelEvent>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Envelope>>>,
    shutdown: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
    request_timeout: Duration,
}

impl ControlChannel {
    /// Connect to the control plane. The initial connection failure is
    /// surfaced to the caller (fatal at startup); failures after that are
    /// handled internally with backoff.
    pub async fn connect(
        addr: &str,
        backoff_ceiling: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            SupervisorError::FatalStartup(format!("cannot reach control plane at {}: {}", addr, e))
        })?;
        let framed = Framed::new(stream, EnvelopeCodec);
        info!("Control channel connected to {}", addr);

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = Arc::new(Notify::new());

        let task = tokio::spawn(run_connection(
            addr.to_string(),
            framed,
            outbound_rx,
            inbound_tx,
            pending.clone(),
            events_tx.clone(),
            shutdown.clone(),
            backoff_ceiling,
        ));

        Ok(ControlChannel {
            outbound_tx,
            pending,
            events_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            shutdown,
            task: Mutex::new(Some(task)),
            request_timeout,
        })
    }

    /// Fire-and-forget send. Queued writes survive a reconnect; whether
    /// they were delivered before a drop is unknowable, so callers treat
    /// anything unacknowledged as unanswered after an epoch change.
    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        self.outbound_tx
            .send(envelope)
            .await
            .map_err(|_| SupervisorError::Transient("control channel closed".to_string()))
    }

    /// Send a request-style body and await the correlated response.
    pub async fn request(&self, body: MessageBody) -> Result<MessageBody> {
        let correlation_id = CorrelationId::new_v4();
        let envelope = Envelope {
            correlation_id: Some(correlation_id),
            body,
        };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(correlation_id, tx);

        if let Err(e) = self.send(envelope).await {
            self.pending.lock().remove(&correlation_id);
            return Err(e);
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(SupervisorError::Transient(
                "control channel dropped before response".to_string(),
            )),
            Err(_) => {
                self.pending.lock().remove(&correlation_id);
                Err(SupervisorError::Transient(format!(
                    "no response within {:?}",
                    self.request_timeout
                )))
            }
        }
    }

    /// Subscribe to connection lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events_tx.subscribe()
    }

    /// Take the stream of uncorrelated inbound envelopes. Yields `Some`
    /// exactly once; the controller owns it for the process lifetime.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<Envelope>> {
        self.inbound_rx.lock().take()
    }

    /// Close the channel after in-flight writes are flushed or the
    /// flush deadline passes.
    pub async fn close(&self) {
        self.shutdown.notify_one();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("Control channel did not close cleanly within 5s");
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_connection(
    addr: String,
    mut framed: Framed<TcpStream, EnvelopeCodec>,
    mut outbound_rx: mpsc::Receiver<Envelope>,
    inbound_tx: mpsc::Sender<Envelope>,
    pending: PendingMap,
    events_tx: broadcast::Sender<ChannelEvent>,
    shutdown: Arc<Notify>,
    backoff_ceiling: Duration,
) {
    let mut epoch: u64 = 1;
    let _ = events_tx.send(ChannelEvent::Ready { epoch });

    loop {
        let disconnected = tokio::select! {
            maybe_envelope = outbound_rx.recv() => {
                match maybe_envelope {
                    Some(envelope) => match framed.send(envelope).await {
                        Ok(()) => false,
                        Err(e) => {
                            warn!("Control channel send failed: {}", e);
                            true
                        }
                    },
                    // All handles dropped; nothing left to serve
                    None => break,
                }
            }
            result = framed.next() => {
                match result {
                    Some(Ok(envelope)) => {
                        route_inbound(envelope, &pending, &inbound_tx);
                        false
                    }
                    Some(Err(ProtocolError::IoError(e))) => {
                        warn!("Control channel transport error: {}", e);
                        true
                    }
                    Some(Err(e)) => {
                        // Validation and framing failures drop the
                        // envelope, never the connection
                        warn!("Dropping invalid envelope: {}", e);
                        false
                    }
                    None => {
                        warn!("Control channel closed by peer");
                        true
                    }
                }
            }
            _ = shutdown.notified() => {
                let _ = framed.close().await;
                return;
            }
        };

        if disconnected {
            fail_pending(&pending);
            let _ = events_tx.send(ChannelEvent::Down);

            match reconnect(&addr, backoff_ceiling, &shutdown).await {
                Some(new_framed) => {
                    framed = new_framed;
                    epoch += 1;
                    info!("Control channel reconnected (epoch {})", epoch);
                    let _ = events_tx.send(ChannelEvent::Ready { epoch });
                }
                None => return,
            }
        }
    }
}

fn route_inbound(envelope: Envelope, pending: &PendingMap, inbound_tx: &mpsc::Sender<Envelope>) {
    if let Some(correlation_id) = envelope.correlation_id {
        if let Some(waiter) = pending.lock().remove(&correlation_id) {
            let _ = waiter.send(envelope.body);
            return;
        }
        debug!("Response with unknown correlation id {}", correlation_id);
    }

    if let Err(e) = inbound_tx.try_send(envelope) {
        warn!("Inbound envelope dropped: {}", e);
    }
}

/// Anything outstanding across a disconnect was never answered; callers
/// re-issue or fail.
fn fail_pending(pending: &PendingMap) {
    let waiters: Vec<_> = {
        let mut map = pending.lock();
        map.drain().collect()
    };
    if !waiters.is_empty() {
        debug!("Failing {} requests pending across disconnect", waiters.len());
    }
    // Dropping the senders wakes every waiter with a RecvError
}

async fn reconnect(
    addr: &str,
    ceiling: Duration,
    shutdown: &Notify,
) -> Option<Framed<TcpStream, EnvelopeCodec>> {
    let mut attempt: u32 = 0;

    loop {
        let delay = backoff_delay(attempt, ceiling);
        debug!("Control channel reconnect attempt {} in {:?}", attempt + 1, delay);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.notified() => return None,
        }

        match TcpStream::connect(addr).await {
            Ok(stream) => return Some(Framed::new(stream, EnvelopeCodec)),
            Err(e) => {
                warn!("Control channel reconnect failed: {}", e);
                attempt += 1;
            }
        }
    }
}
