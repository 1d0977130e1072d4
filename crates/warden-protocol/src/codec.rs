use crate::message::*;
use crate::{ProtocolError, Result, MAX_FRAME_SIZE, SCHEMA_VERSION};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use uuid::Uuid;

/// Codec for encoding/decoding envelopes with length-prefixed framing
///
/// Frame format: [4-byte length (big-endian)] [1-byte message type]
/// [2-byte schema version (big-endian)] [payload]
///
/// A frame that fails the type, version, or validation gate is consumed
/// whole before the error is returned, so the stream stays frame-aligned
/// and the caller can log, drop, and keep reading.
pub struct EnvelopeCodec;

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        // Need at least length prefix + message type + schema version
        if src.len() < 7 {
            return Ok(None);
        }

        // Read length prefix without consuming
        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[0..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(length));
        }

        // Wait for complete frame
        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        // A frame must at least hold its own type and version fields
        if length < 3 {
            src.advance(4 + length);
            return Err(ProtocolError::Validation(format!(
                "frame length {} shorter than envelope header",
                length
            )));
        }

        src.advance(4);

        let type_byte = src.get_u8();
        let schema_version = src.get_u16();
        let payload = src.split_to(length - 3);

        let msg_type = MessageType::from_u8(type_byte)
            .ok_or(ProtocolError::InvalidMessageType(type_byte))?;

        if schema_version != SCHEMA_VERSION {
            return Err(ProtocolError::SchemaMismatch {
                got: schema_version,
                want: SCHEMA_VERSION,
            });
        }

        let envelope = decode_payload(msg_type, &payload)?;
        envelope.body.validate()?;

        Ok(Some(envelope))
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<()> {
        let payload = encode_payload(&item)?;

        // message type + schema version + payload
        let total_length = 3 + payload.len();
        if total_length > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(total_length));
        }

        dst.reserve(4 + total_length);
        dst.put_u32(total_length as u32);
        dst.put_u8(item.message_type().as_u8());
        dst.put_u16(SCHEMA_VERSION);
        dst.put_slice(&payload);

        Ok(())
    }
}

fn encode_payload(envelope: &Envelope) -> Result<Vec<u8>> {
    let cid = &envelope.correlation_id;
    let bytes = match &envelope.body {
        MessageBody::ConfigRequest(req) => bincode::serialize(&(cid, req))?,
        MessageBody::ConfigResponse(resp) => bincode::serialize(&(cid, resp))?,
        MessageBody::RegisterWorker(req) => bincode::serialize(&(cid, req))?,
        MessageBody::RegisterAck(resp) => bincode::serialize(&(cid, resp))?,
        MessageBody::DequeueRequest(req) => bincode::serialize(&(cid, req))?,
        MessageBody::DequeueResponse(resp) => bincode::serialize(&(cid, resp))?,
        MessageBody::AttemptResult(req) => bincode::serialize(&(cid, req))?,
        MessageBody::ResultAck(resp) => bincode::serialize(&(cid, resp))?,
        MessageBody::AttemptRejected(msg) => bincode::serialize(&(cid, msg))?,
        MessageBody::Heartbeat(req) => bincode::serialize(&(cid, req))?,
        MessageBody::HeartbeatAck(resp) => bincode::serialize(&(cid, resp))?,
        MessageBody::PresencePing(msg) => bincode::serialize(&(cid, msg))?,
        MessageBody::PresenceReconnect(msg) => bincode::serialize(&(cid, msg))?,
        MessageBody::PresenceMissedEvents(msg) => bincode::serialize(&(cid, msg))?,
        MessageBody::ExecuteAttempt(msg) => bincode::serialize(&(cid, msg))?,
        MessageBody::WorkerReady(msg) => bincode::serialize(&(cid, msg))?,
        MessageBody::WorkerHeartbeat(msg) => bincode::serialize(&(cid, msg))?,
        MessageBody::AttemptCompleted(msg) => bincode::serialize(&(cid, msg))?,
    };
    Ok(bytes)
}

fn decode_payload(msg_type: MessageType, payload: &[u8]) -> Result<Envelope> {
    let envelope = match msg_type {
        MessageType::ConfigRequest => {
            let (cid, body): (Option<Uuid>, ConfigRequest) = bincode::deserialize(payload)?;
            wrap(cid, MessageBody::ConfigRequest(body))
        }
        MessageType::ConfigResponse => {
            let (cid, body): (Option<Uuid>, ConfigResponse) = bincode::deserialize(payload)?;
            wrap(cid, MessageBody::ConfigResponse(body))
        }
        MessageType::RegisterWorker => {
            let (cid, body): (Option<Uuid>, RegisterWorker) = bincode::deserialize(payload)?;
            wrap(cid, MessageBody::RegisterWorker(body))
        }
        MessageType::RegisterAck => {
            let (cid, body): (Option<Uuid>, RegisterAck) = bincode::deserialize(payload)?;
            wrap(cid, MessageBody::RegisterAck(body))
        }
        MessageType::DequeueRequest => {
            let (cid, body): (Option<Uuid>, DequeueRequest) = bincode::deserialize(payload)?;
            wrap(cid, MessageBody::DequeueRequest(body))
        }
        MessageType::DequeueResponse => {
            let (cid, body): (Option<Uuid>, DequeueResponse) = bincode::deserialize(payload)?;
            wrap(cid, MessageBody::DequeueResponse(body))
        }
        MessageType::AttemptResult => {
            let (cid, body): (Option<Uuid>, AttemptResult) = bincode::deserialize(payload)?;
            wrap(cid, MessageBody::AttemptResult(body))
        }
        MessageType::ResultAck => {
            let (cid, body): (Option<Uuid>, ResultAck) = bincode::deserialize(payload)?;
            wrap(cid, MessageBody::ResultAck(body))
        }
        MessageType::AttemptRejected => {
            let (cid, body): (Option<Uuid>, AttemptRejected) = bincode::deserialize(payload)?;
            wrap(cid, MessageBody::AttemptRejected(body))
        }
        MessageType::Heartbeat => {
            let (cid, body): (Option<Uuid>, Heartbeat) = bincode::deserialize(payload)?;
            wrap(cid, MessageBody::Heartbeat(body))
        }
        MessageType::HeartbeatAck => {
            let (cid, body): (Option<Uuid>, HeartbeatAck) = bincode::deserialize(payload)?;
            wrap(cid, MessageBody::HeartbeatAck(body))
        }
        MessageType::PresencePing => {
            let (cid, body): (Option<Uuid>, PresencePing) = bincode::deserialize(payload)?;
            wrap(cid, MessageBody::PresencePing(body))
        }
        MessageType::PresenceReconnect => {
            let (cid, body): (Option<Uuid>, PresenceReconnect) = bincode::deserialize(payload)?;
            wrap(cid, MessageBody::PresenceReconnect(body))
        }
        MessageType::PresenceMissedEvents => {
            let (cid, body): (Option<Uuid>, PresenceMissedEvents) =
                bincode::deserialize(payload)?;
            wrap(cid, MessageBody::PresenceMissedEvents(body))
        }
        MessageType::ExecuteAttempt => {
            let (cid, body): (Option<Uuid>, ExecuteAttempt) = bincode::deserialize(payload)?;
            wrap(cid, MessageBody::ExecuteAttempt(body))
        }
        MessageType::WorkerReady => {
            let (cid, body): (Option<Uuid>, WorkerReady) = bincode::deserialize(payload)?;
            wrap(cid, MessageBody::WorkerReady(body))
        }
        MessageType::WorkerHeartbeat => {
            let (cid, body): (Option<Uuid>, WorkerHeartbeat) = bincode::deserialize(payload)?;
            wrap(cid, MessageBody::WorkerHeartbeat(body))
        }
        MessageType::AttemptCompleted => {
            let (cid, body): (Option<Uuid>, AttemptCompleted) = bincode::deserialize(payload)?;
            wrap(cid, MessageBody::AttemptCompleted(body))
        }
    };
    Ok(envelope)
}

fn wrap(correlation_id: Option<Uuid>, body: MessageBody) -> Envelope {
    Envelope {
        correlation_id,
        body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use warden_core::ExecutionAttemptPayload;

    #[test]
    fn test_codec_roundtrip() {
        let mut codec = EnvelopeCodec;
        let mut buffer = BytesMut::new();

        let attempt = ExecutionAttemptPayload::new(
            "emails.send",
            "v3",
            json!({"to": "someone@example.com"}),
        )
        .unwrap();
        let envelope = Envelope::request(MessageBody::DequeueResponse(DequeueResponse {
            attempts: vec![attempt.clone()],
        }));
        let sent_cid = envelope.correlation_id;

        codec.encode(envelope, &mut buffer).unwrap();

        let decoded = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(decoded.correlation_id, sent_cid);
        match decoded.body {
            MessageBody::DequeueResponse(resp) => {
                assert_eq!(resp.attempts.len(), 1);
                assert_eq!(resp.attempts[0].run_id, attempt.run_id);
                assert_eq!(resp.attempts[0].manifest_version, "v3");
            }
            other => panic!("Wrong message type: {:?}", other),
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_partial_frame() {
        let mut codec = EnvelopeCodec;
        let mut buffer = BytesMut::new();

        let envelope = Envelope::request(MessageBody::DequeueRequest(DequeueRequest {
            max_attempts: 10,
        }));
        codec.encode(envelope, &mut buffer).unwrap();

        let full_len = buffer.len();
        let partial = buffer.split_to(full_len / 2);
        let mut partial_buffer = BytesMut::from(&partial[..]);

        // Should return None (waiting for more data)
        let result = codec.decode(&mut partial_buffer).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_unknown_type_tag_rejected() {
        let mut codec = EnvelopeCodec;
        let mut buffer = BytesMut::new();

        let envelope = Envelope::event(MessageBody::PresencePing(PresencePing));
        codec.encode(envelope, &mut buffer).unwrap();

        // Corrupt the type tag
        buffer[4] = 200;

        match codec.decode(&mut buffer) {
            Err(ProtocolError::InvalidMessageType(200)) => {}
            other => panic!("Expected InvalidMessageType, got {:?}", other),
        }
    }

    #[test]
    fn test_schema_mismatch_rejected() {
        let mut codec = EnvelopeCodec;
        let mut buffer = BytesMut::new();

        let envelope = Envelope::event(MessageBody::PresencePing(PresencePing));
        codec.encode(envelope, &mut buffer).unwrap();

        // Bump the schema version bytes
        buffer[5] = 0xFF;
        buffer[6] = 0xFF;

        match codec.decode(&mut buffer) {
            Err(ProtocolError::SchemaMismatch { got, want }) => {
                assert_eq!(got, 0xFFFF);
                assert_eq!(want, SCHEMA_VERSION);
            }
            other => panic!("Expected SchemaMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_stream_stays_aligned_after_bad_frame() {
        let mut codec = EnvelopeCodec;
        let mut buffer = BytesMut::new();

        let bad = Envelope::event(MessageBody::PresencePing(PresencePing));
        codec.encode(bad, &mut buffer).unwrap();
        buffer[4] = 200; // corrupt the first frame's tag

        let good = Envelope::request(MessageBody::DequeueRequest(DequeueRequest {
            max_attempts: 1,
        }));
        codec.encode(good, &mut buffer).unwrap();

        assert!(codec.decode(&mut buffer).is_err());

        // The bad frame was consumed; the next decode yields the good one
        let decoded = codec.decode(&mut buffer).unwrap().unwrap();
        match decoded.body {
            MessageBody::DequeueRequest(req) => assert_eq!(req.max_attempts, 1),
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let mut codec = EnvelopeCodec;
        let mut buffer = BytesMut::new();

        // Hand-write a header claiming an absurd frame length
        buffer.put_u32((MAX_FRAME_SIZE + 1) as u32);
        buffer.put_u8(MessageType::PresencePing.as_u8());
        buffer.put_u16(SCHEMA_VERSION);

        match codec.decode(&mut buffer) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge, got {:?}", other),
        }
    }
}
