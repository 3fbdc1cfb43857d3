//! Length-prefixed binary framing and the TLV envelope encoding.
//!
//! Frame layout: a `u32` big-endian payload length, then one schema
//! version byte, then a flat sequence of tag-length-value fields. Field
//! values are length-prefixed, so a decoder can skip tags it does not
//! know; that is the forward-compatibility contract. Nested structures
//! (the payload body) are themselves TLV sequences inside one field.
//!
//! `encode` is total for structurally valid envelopes. `decode` fails
//! with one of `Truncated`, `MalformedField`, `UnknownVariant`, or
//! `UnsupportedVersion`, and any failure is terminal for the connection.

use super::{
    CommandRequest, CommandResponse, CommandStatus, Envelope, Event, HandshakeRequest,
    HandshakeResponse, HandshakeStatus, PROTOCOL_VERSION, Payload, ProtocolError,
};
use crate::error::DecodeError;

use bytes::{Buf as _, BufMut as _, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use uuid::Uuid;

/// Hard cap on a single frame. Anything larger is malformed, not merely
/// big: command arguments are bounded well below this by the admin API.
pub const MAX_FRAME_LEN: usize = 1 << 20;

const FRAME_HEADER_LEN: usize = 4;

// Envelope-level field tags.
const TAG_MESSAGE_ID: u8 = 1;
const TAG_TRACE_ID: u8 = 2;
const TAG_PAYLOAD_KIND: u8 = 3;
const TAG_PAYLOAD_BODY: u8 = 4;

// Payload kind discriminants.
const KIND_HANDSHAKE_REQUEST: u8 = 1;
const KIND_HANDSHAKE_RESPONSE: u8 = 2;
const KIND_HEARTBEAT: u8 = 3;
const KIND_COMMAND_REQUEST: u8 = 4;
const KIND_COMMAND_RESPONSE: u8 = 5;
const KIND_EVENT: u8 = 6;
const KIND_ERROR: u8 = 7;

/// Framed codec for [`Envelope`] values over a byte stream.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeCodec {
    _private: (),
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = DecodeError;

    fn encode(&mut self, env: Envelope, dst: &mut BytesMut) -> Result<(), DecodeError> {
        let body = encode_envelope(&env);
        dst.reserve(FRAME_HEADER_LEN + body.len());
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, DecodeError> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let frame_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if frame_len > MAX_FRAME_LEN {
            return Err(DecodeError::MalformedField("frame length"));
        }
        if src.len() < FRAME_HEADER_LEN + frame_len {
            src.reserve(FRAME_HEADER_LEN + frame_len - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        let frame = src.split_to(frame_len);
        decode_envelope(&frame).map(Some)
    }
}

/// Encode one envelope as a version byte plus TLV fields (no frame
/// header).
pub fn encode_envelope(env: &Envelope) -> Vec<u8> {
    let (kind, body) = encode_payload(&env.payload);

    let mut out = Vec::with_capacity(64 + body.len());
    out.push(PROTOCOL_VERSION);
    put_field(&mut out, TAG_MESSAGE_ID, env.message_id.as_bytes());
    put_field(&mut out, TAG_TRACE_ID, env.trace_id.as_bytes());
    put_field(&mut out, TAG_PAYLOAD_KIND, &[kind]);
    put_field(&mut out, TAG_PAYLOAD_BODY, &body);
    out
}

/// Decode one envelope from a version byte plus TLV fields.
pub fn decode_envelope(frame: &[u8]) -> Result<Envelope, DecodeError> {
    let (&version, mut rest) = frame.split_first().ok_or(DecodeError::Truncated)?;
    if version > PROTOCOL_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }

    let mut message_id = None;
    let mut trace_id = None;
    let mut kind = None;
    let mut body: &[u8] = &[];

    while !rest.is_empty() {
        let (tag, value, remaining) = next_field(rest)?;
        rest = remaining;
        match tag {
            TAG_MESSAGE_ID => message_id = Some(read_uuid(value, "message_id")?),
            TAG_TRACE_ID => trace_id = Some(read_uuid(value, "trace_id")?),
            TAG_PAYLOAD_KIND => kind = Some(read_u8(value, "payload_kind")?),
            TAG_PAYLOAD_BODY => body = value,
            // Unknown envelope-level fields are skipped, not rejected.
            _ => {}
        }
    }

    let kind = kind.ok_or(DecodeError::MalformedField("payload_kind"))?;
    Ok(Envelope {
        message_id: message_id.ok_or(DecodeError::MalformedField("message_id"))?,
        trace_id: trace_id.ok_or(DecodeError::MalformedField("trace_id"))?,
        payload: decode_payload(kind, body)?,
    })
}

fn encode_payload(payload: &Payload) -> (u8, Vec<u8>) {
    let mut body = Vec::new();
    match payload {
        Payload::HandshakeRequest(hs) => {
            put_field(&mut body, 1, hs.bot_id.as_bytes());
            put_field(&mut body, 2, hs.instance_id.as_bytes());
            put_field(&mut body, 3, hs.auth_token.as_bytes());
            for capability in &hs.capabilities {
                put_field(&mut body, 4, capability.as_bytes());
            }
            (KIND_HANDSHAKE_REQUEST, body)
        }
        Payload::HandshakeResponse(hs) => {
            let status = match hs.status {
                HandshakeStatus::Success => 0,
                HandshakeStatus::AuthFailed => 1,
            };
            put_field(&mut body, 1, &[status]);
            put_varint_field(&mut body, 2, hs.heartbeat_interval_secs);
            if let Some(key) = &hs.issued_api_key {
                put_field(&mut body, 3, key.as_bytes());
            }
            if let Some(message) = &hs.message {
                put_field(&mut body, 4, message.as_bytes());
            }
            (KIND_HANDSHAKE_RESPONSE, body)
        }
        Payload::Heartbeat => (KIND_HEARTBEAT, body),
        Payload::CommandRequest(req) => {
            put_field(&mut body, 1, req.command_id.as_bytes());
            put_field(&mut body, 2, req.command_name.as_bytes());
            put_field(&mut body, 3, &req.arguments);
            (KIND_COMMAND_REQUEST, body)
        }
        Payload::CommandResponse(resp) => {
            let status = match resp.status {
                CommandStatus::Success => 0,
                CommandStatus::ExecutionError => 1,
                CommandStatus::InvalidArguments => 2,
            };
            put_field(&mut body, 1, resp.command_id.as_bytes());
            put_field(&mut body, 2, &[status]);
            if let Some(result) = &resp.result {
                put_field(&mut body, 3, result);
            }
            if let Some(error) = &resp.error {
                put_field(&mut body, 4, error.as_bytes());
            }
            (KIND_COMMAND_RESPONSE, body)
        }
        Payload::Event(event) => {
            put_field(&mut body, 1, event.event_name.as_bytes());
            put_field(&mut body, 2, &event.payload);
            (KIND_EVENT, body)
        }
        Payload::Error(error) => {
            put_field(&mut body, 1, error.code.as_bytes());
            put_field(&mut body, 2, error.message.as_bytes());
            (KIND_ERROR, body)
        }
    }
}

fn decode_payload(kind: u8, body: &[u8]) -> Result<Payload, DecodeError> {
    match kind {
        KIND_HANDSHAKE_REQUEST => {
            let mut bot_id = None;
            let mut instance_id = None;
            let mut auth_token = None;
            let mut capabilities = Vec::new();
            for_each_field(body, |tag, value| {
                match tag {
                    1 => bot_id = Some(read_string(value, "bot_id")?),
                    2 => instance_id = Some(read_string(value, "instance_id")?),
                    3 => auth_token = Some(read_string(value, "auth_token")?),
                    4 => capabilities.push(read_string(value, "capability")?),
                    _ => {}
                }
                Ok(())
            })?;
            Ok(Payload::HandshakeRequest(HandshakeRequest {
                bot_id: bot_id.ok_or(DecodeError::MalformedField("bot_id"))?,
                instance_id: instance_id.ok_or(DecodeError::MalformedField("instance_id"))?,
                auth_token: auth_token.ok_or(DecodeError::MalformedField("auth_token"))?,
                capabilities,
            }))
        }
        KIND_HANDSHAKE_RESPONSE => {
            let mut status = None;
            let mut heartbeat_interval_secs = 0;
            let mut issued_api_key = None;
            let mut message = None;
            for_each_field(body, |tag, value| {
                match tag {
                    1 => {
                        status = Some(match read_u8(value, "status")? {
                            0 => HandshakeStatus::Success,
                            1 => HandshakeStatus::AuthFailed,
                            _ => return Err(DecodeError::MalformedField("status")),
                        });
                    }
                    2 => heartbeat_interval_secs = read_varint_value(value, "heartbeat_interval")?,
                    3 => issued_api_key = Some(read_string(value, "issued_api_key")?),
                    4 => message = Some(read_string(value, "message")?),
                    _ => {}
                }
                Ok(())
            })?;
            Ok(Payload::HandshakeResponse(HandshakeResponse {
                status: status.ok_or(DecodeError::MalformedField("status"))?,
                heartbeat_interval_secs,
                issued_api_key,
                message,
            }))
        }
        KIND_HEARTBEAT => Ok(Payload::Heartbeat),
        KIND_COMMAND_REQUEST => {
            let mut command_id = None;
            let mut command_name = None;
            let mut arguments = Vec::new();
            for_each_field(body, |tag, value| {
                match tag {
                    1 => command_id = Some(read_uuid(value, "command_id")?),
                    2 => command_name = Some(read_string(value, "command_name")?),
                    3 => arguments = value.to_vec(),
                    _ => {}
                }
                Ok(())
            })?;
            Ok(Payload::CommandRequest(CommandRequest {
                command_id: command_id.ok_or(DecodeError::MalformedField("command_id"))?,
                command_name: command_name.ok_or(DecodeError::MalformedField("command_name"))?,
                arguments,
            }))
        }
        KIND_COMMAND_RESPONSE => {
            let mut command_id = None;
            let mut status = None;
            let mut result = None;
            let mut error = None;
            for_each_field(body, |tag, value| {
                match tag {
                    1 => command_id = Some(read_uuid(value, "command_id")?),
                    2 => {
                        status = Some(match read_u8(value, "status")? {
                            0 => CommandStatus::Success,
                            1 => CommandStatus::ExecutionError,
                            2 => CommandStatus::InvalidArguments,
                            _ => return Err(DecodeError::MalformedField("status")),
                        });
                    }
                    3 => result = Some(value.to_vec()),
                    4 => error = Some(read_string(value, "error")?),
                    _ => {}
                }
                Ok(())
            })?;
            Ok(Payload::CommandResponse(CommandResponse {
                command_id: command_id.ok_or(DecodeError::MalformedField("command_id"))?,
                status: status.ok_or(DecodeError::MalformedField("status"))?,
                result,
                error,
            }))
        }
        KIND_EVENT => {
            let mut event_name = None;
            let mut payload = Vec::new();
            for_each_field(body, |tag, value| {
                match tag {
                    1 => event_name = Some(read_string(value, "event_name")?),
                    2 => payload = value.to_vec(),
                    _ => {}
                }
                Ok(())
            })?;
            Ok(Payload::Event(Event {
                event_name: event_name.ok_or(DecodeError::MalformedField("event_name"))?,
                payload,
            }))
        }
        KIND_ERROR => {
            let mut code = None;
            let mut message = None;
            for_each_field(body, |tag, value| {
                match tag {
                    1 => code = Some(read_string(value, "code")?),
                    2 => message = Some(read_string(value, "message")?),
                    _ => {}
                }
                Ok(())
            })?;
            Ok(Payload::Error(ProtocolError {
                code: code.ok_or(DecodeError::MalformedField("code"))?,
                message: message.ok_or(DecodeError::MalformedField("message"))?,
            }))
        }
        other => Err(DecodeError::UnknownVariant(other)),
    }
}

// -- TLV primitives --

fn put_field(out: &mut Vec<u8>, tag: u8, value: &[u8]) {
    out.push(tag);
    put_varint(out, value.len() as u64);
    out.extend_from_slice(value);
}

fn put_varint_field(out: &mut Vec<u8>, tag: u8, value: u64) {
    let mut encoded = Vec::with_capacity(10);
    put_varint(&mut encoded, value);
    put_field(out, tag, &encoded);
}

fn put_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn get_varint(buf: &mut &[u8]) -> Result<u64, DecodeError> {
    let mut value: u64 = 0;
    for shift in (0..64).step_by(7) {
        let (&byte, rest) = buf.split_first().ok_or(DecodeError::Truncated)?;
        *buf = rest;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(DecodeError::MalformedField("varint"))
}

fn next_field(buf: &[u8]) -> Result<(u8, &[u8], &[u8]), DecodeError> {
    let (&tag, mut rest) = buf.split_first().ok_or(DecodeError::Truncated)?;
    let len = get_varint(&mut rest)? as usize;
    if rest.len() < len {
        return Err(DecodeError::Truncated);
    }
    let (value, remaining) = rest.split_at(len);
    Ok((tag, value, remaining))
}

fn for_each_field<F>(mut buf: &[u8], mut visit: F) -> Result<(), DecodeError>
where
    F: FnMut(u8, &[u8]) -> Result<(), DecodeError>,
{
    while !buf.is_empty() {
        let (tag, value, rest) = next_field(buf)?;
        buf = rest;
        visit(tag, value)?;
    }
    Ok(())
}

fn read_uuid(value: &[u8], field: &'static str) -> Result<Uuid, DecodeError> {
    Uuid::from_slice(value).map_err(|_| DecodeError::MalformedField(field))
}

fn read_string(value: &[u8], field: &'static str) -> Result<String, DecodeError> {
    String::from_utf8(value.to_vec()).map_err(|_| DecodeError::MalformedField(field))
}

fn read_u8(value: &[u8], field: &'static str) -> Result<u8, DecodeError> {
    match value {
        [byte] => Ok(*byte),
        _ => Err(DecodeError::MalformedField(field)),
    }
}

fn read_varint_value(mut value: &[u8], field: &'static str) -> Result<u64, DecodeError> {
    get_varint(&mut value).map_err(|_| DecodeError::MalformedField(field))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(payload: Payload) -> Envelope {
        let env = Envelope::new(payload);
        let encoded = encode_envelope(&env);
        let decoded = decode_envelope(&encoded).expect("round trip should decode");
        assert_eq!(env, decoded);
        decoded
    }

    #[test]
    fn round_trips_every_variant() {
        round_trip(Payload::HandshakeRequest(HandshakeRequest {
            bot_id: "b-1".into(),
            instance_id: "worker-7".into(),
            auth_token: "0123456789abcdef".into(),
            capabilities: vec!["message.send".into(), "task.execute".into()],
        }));
        round_trip(Payload::HandshakeResponse(HandshakeResponse {
            status: HandshakeStatus::Success,
            heartbeat_interval_secs: 30,
            issued_api_key: Some("deadbeef".into()),
            message: None,
        }));
        round_trip(Payload::Heartbeat);
        round_trip(Payload::CommandRequest(CommandRequest {
            command_id: Uuid::new_v4(),
            command_name: "t.exec".into(),
            arguments: br#"{"x":1}"#.to_vec(),
        }));
        round_trip(Payload::CommandResponse(CommandResponse {
            command_id: Uuid::new_v4(),
            status: CommandStatus::ExecutionError,
            result: None,
            error: Some("boom".into()),
        }));
        round_trip(Payload::Event(Event {
            event_name: "presence.update".into(),
            payload: vec![1, 2, 3],
        }));
        round_trip(Payload::Error(ProtocolError {
            code: "bad_handshake".into(),
            message: "handshake required".into(),
        }));
    }

    #[test]
    fn round_trips_empty_and_unicode_values() {
        round_trip(Payload::CommandRequest(CommandRequest {
            command_id: Uuid::new_v4(),
            command_name: "noop".into(),
            arguments: Vec::new(),
        }));
        round_trip(Payload::Event(Event {
            event_name: "émission.reçue".into(),
            payload: Vec::new(),
        }));
    }

    #[test]
    fn rejects_unsupported_version() {
        let env = Envelope::new(Payload::Heartbeat);
        let mut encoded = encode_envelope(&env);
        encoded[0] = PROTOCOL_VERSION + 1;

        match decode_envelope(&encoded) {
            Err(DecodeError::UnsupportedVersion(version)) => {
                assert_eq!(version, PROTOCOL_VERSION + 1);
            }
            other => panic!("expected UnsupportedVersion, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_payload_kind() {
        let mut encoded = Vec::new();
        encoded.push(PROTOCOL_VERSION);
        put_field(&mut encoded, TAG_MESSAGE_ID, Uuid::new_v4().as_bytes());
        put_field(&mut encoded, TAG_TRACE_ID, Uuid::new_v4().as_bytes());
        put_field(&mut encoded, TAG_PAYLOAD_KIND, &[200]);
        put_field(&mut encoded, TAG_PAYLOAD_BODY, &[]);

        match decode_envelope(&encoded) {
            Err(DecodeError::UnknownVariant(kind)) => assert_eq!(kind, 200),
            other => panic!("expected UnknownVariant, got {other:?}"),
        }
    }

    #[test]
    fn rejects_truncated_field() {
        let env = Envelope::new(Payload::Heartbeat);
        let encoded = encode_envelope(&env);

        match decode_envelope(&encoded[..encoded.len() - 3]) {
            Err(DecodeError::Truncated) => {}
            other => panic!("expected Truncated, got {other:?}"),
        }
    }

    #[test]
    fn skips_unknown_fields() {
        let env = Envelope::new(Payload::Heartbeat);
        let mut encoded = encode_envelope(&env);
        // Append a field with an unassigned envelope tag.
        put_field(&mut encoded, 250, b"from-the-future");

        let decoded = decode_envelope(&encoded).expect("unknown field should be skipped");
        assert_eq!(env, decoded);
    }

    #[test]
    fn framed_decode_waits_for_full_frame() {
        let env = Envelope::new(Payload::CommandRequest(CommandRequest {
            command_id: Uuid::new_v4(),
            command_name: "t.exec".into(),
            arguments: br#"{"x":1}"#.to_vec(),
        }));

        let mut codec = EnvelopeCodec::new();
        let mut wire = BytesMut::new();
        codec.encode(env.clone(), &mut wire).expect("encode");

        let split = wire.len() / 2;
        let mut src = BytesMut::from(&wire[..split]);
        assert!(codec.decode(&mut src).expect("partial frame").is_none());

        src.extend_from_slice(&wire[split..]);
        let decoded = codec
            .decode(&mut src)
            .expect("full frame")
            .expect("one envelope");
        assert_eq!(env, decoded);
        assert!(src.is_empty());
    }

    #[test]
    fn framed_decode_rejects_oversized_frame() {
        let mut codec = EnvelopeCodec::new();
        let mut src = BytesMut::new();
        src.put_u32((MAX_FRAME_LEN + 1) as u32);
        src.extend_from_slice(&[0u8; 16]);

        match codec.decode(&mut src) {
            Err(DecodeError::MalformedField("frame length")) => {}
            other => panic!("expected frame length error, got {other:?}"),
        }
    }
}
