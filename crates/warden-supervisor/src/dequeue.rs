use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};

use crate::channel::ControlChannel;
use crate::presence::PresenceState;
use crate::resources::ResourceGate;
use warden_core::{DequeueIntervals, ExecutionAttemptPayload, Result, RuntimeConfig, SupervisorError};
use warden_protocol::{DequeueRequest, MessageBody};

/// Where dequeue requests are sent; the control channel in production,
/// an in-memory fake in tests.
#[async_trait]
pub trait AttemptSource: Send + Sync {
    async fn dequeue(&self, max_attempts: u32) -> Result<Vec<ExecutionAttemptPayload>>;
}

/// AttemptSource backed by the control channel's request/response pair
pub struct ChannelAttemptSource {
    channel: Arc<ControlChannel>,
}

impl ChannelAttemptSource {
    pub fn new(channel: Arc<ControlChannel>) -> Self {
        ChannelAttemptSource { channel }
    }
}

#[async_trait]
impl AttemptSource for ChannelAttemptSource {
    async fn dequeue(&self, max_attempts: u32) -> Result<Vec<ExecutionAttemptPayload>> {
        let response = self
            .channel
            .request(MessageBody::DequeueRequest(DequeueRequest { max_attempts }))
            .await?;

        match response {
            MessageBody::DequeueResponse(resp) => Ok(resp.attempts),
            other => Err(SupervisorError::Protocol(format!(
                "expected DequeueResponse, got {:?}",
                other.message_type()
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickOutcome {
    /// Presence is degraded; no request was made
    Paused,
    /// Local resources are insufficient; no request was made
    Starved,
    /// Work arrived; poll again soon
    Found,
    /// Control plane had nothing for us
    Empty,
    /// Transient request failure
    Failed,
}

/// Empty responses and failures always wait at least as long as a
/// productive tick.
fn next_interval(outcome: TickOutcome, intervals: &DequeueIntervals) -> Duration {
    match outcome {
        TickOutcome::Found => Duration::from_millis(intervals.short_ms),
        TickOutcome::Paused | TickOutcome::Empty | TickOutcome::Failed => {
            Duration::from_millis(intervals.long_ms)
        }
        TickOutcome::Starved => Duration::from_millis(intervals.starved_ms),
    }
}

/// Timer-driven adaptive polling: short intervals while work is flowing,
/// long intervals when idle or resource-constrained, and never more than
/// one dequeue request in flight.
pub struct DequeueLoop<S> {
    source: Arc<S>,
    gate: Arc<dyn ResourceGate>,
    config: watch::Receiver<RuntimeConfig>,
    presence: watch::Receiver<PresenceState>,
    sink: mpsc::Sender<ExecutionAttemptPayload>,
    shutdown: Arc<Notify>,
}

impl<S: AttemptSource + 'static> DequeueLoop<S> {
    pub fn new(
        source: Arc<S>,
        gate: Arc<dyn ResourceGate>,
        config: watch::Receiver<RuntimeConfig>,
        presence: watch::Receiver<PresenceState>,
        sink: mpsc::Sender<ExecutionAttemptPayload>,
        shutdown: Arc<Notify>,
    ) -> Self {
        DequeueLoop {
            source,
            gate,
            config,
            presence,
            sink,
            shutdown,
        }
    }

    /// The config snapshot is re-read every tick, so a wholesale
    /// replacement takes effect on the next cycle.
    fn intervals(&self) -> DequeueIntervals {
        self.config.borrow().dequeue.clone()
    }

    pub async fn run(mut self) {
        {
            let intervals = self.intervals();
            info!(
                "Dequeue loop started (short {}ms, long {}ms, starved {}ms)",
                intervals.short_ms, intervals.long_ms, intervals.starved_ms
            );
        }

        loop {
            let outcome = self.tick().await;
            let delay = next_interval(outcome, &self.intervals());

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.notified() => {
                    info!("Dequeue loop stopped");
                    return;
                }
            }
        }
    }

    async fn tick(&mut self) -> TickOutcome {
        let presence = *self.presence.borrow();
        if presence != PresenceState::Connected {
            debug!("Dequeue paused: presence is {:?}", presence);
            return TickOutcome::Paused;
        }

        if !self.gate.has_headroom() {
            let snapshot = self.gate.snapshot();
            info!(
                "Skipping dequeue: insufficient resources (cpu {:.1}%, {} MiB free)",
                snapshot.cpu_percent, snapshot.available_memory_mib
            );
            return TickOutcome::Starved;
        }

        // Single-flight: the request is awaited inline, so a new tick
        // cannot start while one is outstanding
        match self.source.dequeue(self.intervals().max_batch).await {
            Ok(attempts) if attempts.is_empty() => TickOutcome::Empty,
            Ok(attempts) => {
                info!("Dequeued {} attempts", attempts.len());
                for attempt in attempts {
                    if self.sink.send(attempt).await.is_err() {
                        warn!("Attempt sink closed, dropping remaining batch");
                        return TickOutcome::Failed;
                    }
                }
                TickOutcome::Found
            }
            Err(e) => {
                warn!("Dequeue request failed: {}", e);
                TickOutcome::Failed
            }
        }
    }
}
