//! Hivecore: the control plane of the unified bot protocol.
//!
//! One long-running process with two surfaces: a framed binary data plane
//! over which bot instances authenticate and exchange commands, and an
//! admin HTTP API for bot lifecycle, task submission, and session context.

pub mod api;
pub mod config;
pub mod context;
pub mod core;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod store;
pub mod tasks;
pub mod telemetry;

pub use error::{Error, Result};

use std::sync::Arc;

/// Bot definition identifier type.
pub type BotId = Arc<str>;

/// Instance identifier type (chosen by the connecting agent).
pub type InstanceId = Arc<str>;

/// Command correlation identifier type.
pub type CommandId = uuid::Uuid;

/// Task identifier type.
pub type TaskId = uuid::Uuid;

/// Trace identifier propagated across causally linked envelopes.
pub type TraceId = uuid::Uuid;
