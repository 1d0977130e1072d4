use crate::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use warden_core::{AttemptOutcome, ExecutionAttemptPayload, RunId, RuntimeConfig};

/// Correlation id carried by every request-style envelope and echoed in
/// its response
pub type CorrelationId = Uuid;

/// Wire-level discriminant, one per envelope type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    ConfigRequest = 1,
    ConfigResponse = 2,
    RegisterWorker = 3,
    RegisterAck = 4,
    DequeueRequest = 5,
    DequeueResponse = 6,
    AttemptResult = 7,
    ResultAck = 8,
    AttemptRejected = 9,
    Heartbeat = 10,
    HeartbeatAck = 11,
    PresencePing = 12,
    PresenceReconnect = 13,
    PresenceMissedEvents = 14,
    ExecuteAttempt = 15,
    WorkerReady = 16,
    WorkerHeartbeat = 17,
    AttemptCompleted = 18,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageType::ConfigRequest),
            2 => Some(MessageType::ConfigResponse),
            3 => Some(MessageType::RegisterWorker),
            4 => Some(MessageType::RegisterAck),
            5 => Some(MessageType::DequeueRequest),
            6 => Some(MessageType::DequeueResponse),
            7 => Some(MessageType::AttemptResult),
            8 => Some(MessageType::ResultAck),
            9 => Some(MessageType::AttemptRejected),
            10 => Some(MessageType::Heartbeat),
            11 => Some(MessageType::HeartbeatAck),
            12 => Some(MessageType::PresencePing),
            13 => Some(MessageType::PresenceReconnect),
            14 => Some(MessageType::PresenceMissedEvents),
            15 => Some(MessageType::ExecuteAttempt),
            16 => Some(MessageType::WorkerReady),
            17 => Some(MessageType::WorkerHeartbeat),
            18 => Some(MessageType::AttemptCompleted),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Closed set of message bodies. Every inbound envelope deserializes into
/// exactly one of these variants; handlers match exhaustively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MessageBody {
    ConfigRequest(ConfigRequest),
    ConfigResponse(ConfigResponse),
    RegisterWorker(RegisterWorker),
    RegisterAck(RegisterAck),
    DequeueRequest(DequeueRequest),
    DequeueResponse(DequeueResponse),
    AttemptResult(AttemptResult),
    ResultAck(ResultAck),
    AttemptRejected(AttemptRejected),
    Heartbeat(Heartbeat),
    HeartbeatAck(HeartbeatAck),
    PresencePing(PresencePing),
    PresenceReconnect(PresenceReconnect),
    PresenceMissedEvents(PresenceMissedEvents),
    ExecuteAttempt(ExecuteAttempt),
    WorkerReady(WorkerReady),
    WorkerHeartbeat(WorkerHeartbeat),
    AttemptCompleted(AttemptCompleted),
}

impl MessageBody {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageBody::ConfigRequest(_) => MessageType::ConfigRequest,
            MessageBody::ConfigResponse(_) => MessageType::ConfigResponse,
            MessageBody::RegisterWorker(_) => MessageType::RegisterWorker,
            MessageBody::RegisterAck(_) => MessageType::RegisterAck,
            MessageBody::DequeueRequest(_) => MessageType::DequeueRequest,
            MessageBody::DequeueResponse(_) => MessageType::DequeueResponse,
            MessageBody::AttemptResult(_) => MessageType::AttemptResult,
            MessageBody::ResultAck(_) => MessageType::ResultAck,
            MessageBody::AttemptRejected(_) => MessageType::AttemptRejected,
            MessageBody::Heartbeat(_) => MessageType::Heartbeat,
            MessageBody::HeartbeatAck(_) => MessageType::HeartbeatAck,
            MessageBody::PresencePing(_) => MessageType::PresencePing,
            MessageBody::PresenceReconnect(_) => MessageType::PresenceReconnect,
            MessageBody::PresenceMissedEvents(_) => MessageType::PresenceMissedEvents,
            MessageBody::ExecuteAttempt(_) => MessageType::ExecuteAttempt,
            MessageBody::WorkerReady(_) => MessageType::WorkerReady,
            MessageBody::WorkerHeartbeat(_) => MessageType::WorkerHeartbeat,
            MessageBody::AttemptCompleted(_) => MessageType::AttemptCompleted,
        }
    }

    /// Per-type validation, run at decode time before the envelope is
    /// handed to any handler. Failing envelopes are dropped without
    /// closing the connection.
    pub fn validate(&self) -> Result<()> {
        match self {
            MessageBody::RegisterWorker(req) => {
                if req.supervisor_id.is_empty() {
                    return Err(ProtocolError::Validation(
                        "RegisterWorker requires a supervisor id".to_string(),
                    ));
                }
                Ok(())
            }
            MessageBody::DequeueRequest(req) => {
                if req.max_attempts == 0 {
                    return Err(ProtocolError::Validation(
                        "DequeueRequest must ask for at least one attempt".to_string(),
                    ));
                }
                Ok(())
            }
            MessageBody::DequeueResponse(resp) => {
                for attempt in &resp.attempts {
                    validate_attempt(attempt)?;
                }
                Ok(())
            }
            MessageBody::AttemptRejected(rej) => {
                if rej.reason.is_empty() {
                    return Err(ProtocolError::Validation(
                        "AttemptRejected requires a reason".to_string(),
                    ));
                }
                Ok(())
            }
            MessageBody::Heartbeat(hb) => {
                if hb.supervisor_id.is_empty() {
                    return Err(ProtocolError::Validation(
                        "Heartbeat requires a supervisor id".to_string(),
                    ));
                }
                if !hb.cpu_percent.is_finite() || hb.cpu_percent < 0.0 {
                    return Err(ProtocolError::Validation(format!(
                        "Heartbeat cpu_percent out of range: {}",
                        hb.cpu_percent
                    )));
                }
                Ok(())
            }
            MessageBody::ExecuteAttempt(exec) => validate_attempt(&exec.payload),
            MessageBody::WorkerReady(msg) => validate_worker_id(&msg.worker_id),
            MessageBody::WorkerHeartbeat(msg) => validate_worker_id(&msg.worker_id),
            // Remaining types carry nothing that can be malformed beyond
            // what deserialization already enforces
            _ => Ok(()),
        }
    }
}

fn validate_attempt(attempt: &ExecutionAttemptPayload) -> Result<()> {
    if attempt.task_id.is_empty() {
        return Err(ProtocolError::Validation(format!(
            "attempt {} has an empty task id",
            attempt.run_id
        )));
    }
    if attempt.manifest_version.is_empty() {
        return Err(ProtocolError::Validation(format!(
            "attempt {} has an empty manifest version",
            attempt.run_id
        )));
    }
    if attempt.attempt_number == 0 {
        return Err(ProtocolError::Validation(format!(
            "attempt {} has attempt number zero",
            attempt.run_id
        )));
    }
    Ok(())
}

fn validate_worker_id(worker_id: &Uuid) -> Result<()> {
    if worker_id.is_nil() {
        return Err(ProtocolError::Validation(
            "worker id must not be nil".to_string(),
        ));
    }
    Ok(())
}

/// A typed, schema-validated message unit. Request-style envelopes carry
/// a correlation id echoed in the eventual response; events carry none.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub correlation_id: Option<CorrelationId>,
    pub body: MessageBody,
}

impl Envelope {
    /// Envelope expecting a reply; a fresh correlation id is attached
    pub fn request(body: MessageBody) -> Self {
        Envelope {
            correlation_id: Some(Uuid::new_v4()),
            body,
        }
    }

    /// Reply carrying the request's correlation id
    pub fn reply(correlation_id: CorrelationId, body: MessageBody) -> Self {
        Envelope {
            correlation_id: Some(correlation_id),
            body,
        }
    }

    /// One-way event
    pub fn event(body: MessageBody) -> Self {
        Envelope {
            correlation_id: None,
            body,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigRequest {
    /// Version of the supervisor binary, lets the control plane refuse
    /// builds it no longer supports
    pub supervisor_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigResponse {
    pub config: RuntimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterWorker {
    pub supervisor_id: String,
    pub hostname: String,
    pub pid: u32,
    pub supervisor_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAck {
    /// Set when the control plane replaced the runtime config since the
    /// last epoch; the supervisor re-fetches before dequeueing
    pub config_changed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DequeueRequest {
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DequeueResponse {
    pub attempts: Vec<ExecutionAttemptPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptResult {
    pub run_id: RunId,
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultAck;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRejected {
    pub run_id: RunId,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub supervisor_id: String,
    pub busy_workers: u32,
    pub cpu_percent: f32,
    pub memory_mib: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatAck;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresencePing;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceReconnect;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceMissedEvents;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteAttempt {
    pub payload: ExecutionAttemptPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerReady {
    pub worker_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptCompleted {
    pub run_id: RunId,
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::from_u8(1), Some(MessageType::ConfigRequest));
        assert_eq!(MessageType::from_u8(18), Some(MessageType::AttemptCompleted));
        assert_eq!(MessageType::from_u8(99), None);

        assert_eq!(MessageType::ConfigRequest.as_u8(), 1);
        assert_eq!(MessageType::AttemptCompleted.as_u8(), 18);
    }

    #[test]
    fn test_request_gets_correlation_id() {
        let envelope = Envelope::request(MessageBody::DequeueRequest(DequeueRequest {
            max_attempts: 5,
        }));
        assert!(envelope.correlation_id.is_some());

        let reply = Envelope::reply(
            envelope.correlation_id.unwrap(),
            MessageBody::DequeueResponse(DequeueResponse { attempts: vec![] }),
        );
        assert_eq!(reply.correlation_id, envelope.correlation_id);

        let event = Envelope::event(MessageBody::PresencePing(PresencePing));
        assert!(event.correlation_id.is_none());
    }

    #[test]
    fn test_validation_rejects_zero_batch() {
        let body = MessageBody::DequeueRequest(DequeueRequest { max_attempts: 0 });
        assert!(body.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_malformed_attempt() {
        let mut attempt =
            ExecutionAttemptPayload::new("emails.send", "v3", json!({})).unwrap();
        attempt.manifest_version = String::new();

        let body = MessageBody::DequeueResponse(DequeueResponse {
            attempts: vec![attempt],
        });
        match body.validate() {
            Err(ProtocolError::Validation(_)) => {}
            other => panic!("Expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_validation_accepts_wellformed_attempt() {
        let attempt = ExecutionAttemptPayload::new("emails.send", "v3", json!({})).unwrap();
        let body = MessageBody::DequeueResponse(DequeueResponse {
            attempts: vec![attempt],
        });
        assert!(body.validate().is_ok());
    }
}
