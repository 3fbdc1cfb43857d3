//! Wire protocol types shared by the core and its agents.
//!
//! Every frame on the data plane carries exactly one [`Envelope`]. The
//! binary layout lives in [`codec`]; this module defines the typed shape.
//! Command arguments and results are opaque byte blobs (JSON by
//! convention) that the core forwards without interpreting.

pub mod codec;

pub use codec::EnvelopeCodec;

use uuid::Uuid;

/// Highest schema version this build encodes and accepts.
pub const PROTOCOL_VERSION: u8 = 1;

/// A single tagged wire message wrapping exactly one payload variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Unique per envelope; retry idempotency is keyed on it per connection.
    pub message_id: Uuid,

    /// Preserved verbatim across every causally derived message.
    pub trace_id: Uuid,

    pub payload: Payload,
}

impl Envelope {
    /// New envelope starting a fresh causal chain.
    pub fn new(payload: Payload) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            trace_id: Uuid::new_v4(),
            payload,
        }
    }

    /// New envelope causally derived from an inbound one: fresh
    /// `message_id`, inherited `trace_id`.
    pub fn derived(trace_id: Uuid, payload: Payload) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            trace_id,
            payload,
        }
    }

    /// Payload kind name for logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}

/// The payload variants of the unified bot protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    HandshakeRequest(HandshakeRequest),
    HandshakeResponse(HandshakeResponse),
    Heartbeat,
    CommandRequest(CommandRequest),
    CommandResponse(CommandResponse),
    Event(Event),
    Error(ProtocolError),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::HandshakeRequest(_) => "handshake_request",
            Payload::HandshakeResponse(_) => "handshake_response",
            Payload::Heartbeat => "heartbeat",
            Payload::CommandRequest(_) => "command_request",
            Payload::CommandResponse(_) => "command_response",
            Payload::Event(_) => "event",
            Payload::Error(_) => "error",
        }
    }
}

/// First frame from a connecting agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub bot_id: String,
    /// Chosen by the agent; a reconnect with the same id displaces the
    /// previous session.
    pub instance_id: String,
    /// One-time registration token or long-lived key.
    pub auth_token: String,
    /// Runtime capabilities, authoritative over the definition's advisory
    /// list.
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    Success,
    AuthFailed,
}

impl HandshakeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HandshakeStatus::Success => "SUCCESS",
            HandshakeStatus::AuthFailed => "AUTH_FAILED",
        }
    }
}

/// First frame from the core on any connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub status: HandshakeStatus,
    /// Interval the instance must heartbeat at, in seconds.
    pub heartbeat_interval_secs: u64,
    /// Present only when this handshake consumed a one-time token.
    pub issued_api_key: Option<String>,
    pub message: Option<String>,
}

/// A command directed at a single instance, correlated by `command_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub command_id: Uuid,
    pub command_name: String,
    /// Opaque argument blob; the core never looks inside.
    pub arguments: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Success,
    ExecutionError,
    InvalidArguments,
}

impl CommandStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandStatus::Success => "SUCCESS",
            CommandStatus::ExecutionError => "EXECUTION_ERROR",
            CommandStatus::InvalidArguments => "INVALID_ARGUMENTS",
        }
    }
}

/// An instance's reply to a [`CommandRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    pub command_id: Uuid,
    pub status: CommandStatus,
    pub result: Option<Vec<u8>>,
    pub error: Option<String>,
}

/// Unsolicited notification from an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub event_name: String,
    pub payload: Vec<u8>,
}

/// Protocol-level error frame, e.g. a handshake violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    pub code: String,
    pub message: String,
}
