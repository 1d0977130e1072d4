mod codec;
mod message;

pub use codec::EnvelopeCodec;
pub use message::{
    AttemptCompleted, AttemptRejected, AttemptResult, ConfigRequest, ConfigResponse,
    CorrelationId, DequeueRequest, DequeueResponse, Envelope, ExecuteAttempt, Heartbeat,
    HeartbeatAck, MessageBody, MessageType, PresenceMissedEvents, PresencePing,
    PresenceReconnect, RegisterAck, RegisterWorker, ResultAck, WorkerHeartbeat, WorkerReady,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("Unsupported schema version: {got} (speaking {want})")]
    SchemaMismatch { got: u16, want: u16 },

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Envelope failed validation: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Version of the wire schema this build speaks. Envelopes carrying any
/// other version are dropped at decode time.
pub const SCHEMA_VERSION: u16 = 1;

/// Maximum frame size: 16MB (a full dequeue batch of 1MB contexts plus
/// framing overhead)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
