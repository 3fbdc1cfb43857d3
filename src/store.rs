//! Durable state records and the `StateStore` boundary.
//!
//! Bot definitions, credentials, and task records are the only state
//! whose loss is observable to clients, so they live behind this trait.
//! Instances and in-flight envelopes are intentionally memory-only: a
//! restart reconnects every agent from scratch.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::StoreError;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// An administrator-declared template from which instances may connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotDefinition {
    pub bot_id: String,
    pub name: String,
    pub description: String,
    pub adapter_type: String,
    /// Advisory; the instance's handshake declaration is authoritative.
    pub declared_capabilities: Vec<String>,
    pub configuration: Value,
    pub created_at: DateTime<Utc>,
}

/// Credential material at rest. Only SHA-256 digests are stored; the
/// plaintext token and key exist in the create response and the
/// handshake response respectively, and nowhere else.
#[derive(Debug, Clone)]
pub struct CredentialRecord {
    pub bot_id: String,
    /// Hex digest of the unconsumed one-time token, cleared on consume.
    pub one_time_digest: Option<String>,
    /// Hex digest of the issued long-lived key.
    pub long_lived_digest: Option<String>,
}

/// Result of the one-time token compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// This caller won: the token is consumed and the new key digest is
    /// persisted.
    Swapped,
    /// Candidate token did not match the stored one.
    Mismatch,
    /// No unconsumed token exists (already swapped, possibly by a
    /// concurrent caller).
    NoUnconsumedToken,
    UnknownBot,
}

/// Task lifecycle states. Terminal states are permanent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TaskState::Pending),
            "running" => Some(TaskState::Running),
            "completed" => Some(TaskState::Completed),
            "failed" => Some(TaskState::Failed),
            "cancelled" => Some(TaskState::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An asynchronous poll-pattern job owned by the task manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: Uuid,
    pub bot_id: String,
    pub command_name: String,
    pub arguments: Value,
    pub state: TaskState,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retries_remaining: u32,
}

/// Field updates applied together with a guarded state transition.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub state: Option<TaskState>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retries_remaining: Option<u32>,
}

impl TaskUpdate {
    pub fn to_state(state: TaskState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }
}

/// Pluggable persistence for the durable state classes.
///
/// The one-time token swap's atomicity is a property of this contract:
/// `consume_one_time` must admit exactly one winner under any
/// concurrency, and the winner's key digest must be persisted in the
/// same atomic step.
#[async_trait]
pub trait StateStore: Send + Sync {
    // -- Bot definitions --

    async fn put_definition(&self, definition: &BotDefinition) -> Result<(), StoreError>;

    async fn get_definition(&self, bot_id: &str) -> Result<Option<BotDefinition>, StoreError>;

    async fn list_definitions(&self) -> Result<Vec<BotDefinition>, StoreError>;

    /// Removes the definition and its credentials. Returns false when the
    /// bot is unknown.
    async fn delete_definition(&self, bot_id: &str) -> Result<bool, StoreError>;

    // -- Credentials --

    async fn put_credentials(&self, record: &CredentialRecord) -> Result<(), StoreError>;

    async fn get_credentials(&self, bot_id: &str) -> Result<Option<CredentialRecord>, StoreError>;

    /// Atomic compare-and-swap: if an unconsumed token digest matching
    /// `candidate_digest` exists, clear it and persist
    /// `new_long_lived_digest` in the same step.
    async fn consume_one_time(
        &self,
        bot_id: &str,
        candidate_digest: &str,
        new_long_lived_digest: &str,
    ) -> Result<ConsumeOutcome, StoreError>;

    // -- Tasks --

    async fn put_task(&self, task: &TaskRecord) -> Result<(), StoreError>;

    async fn get_task(&self, task_id: Uuid) -> Result<Option<TaskRecord>, StoreError>;

    /// Apply `update` iff the task's current state is in `from`. Returns
    /// the updated record, or None when the task is missing or the guard
    /// fails. Terminal-state permanence rides on this guard.
    async fn transition_task(
        &self,
        task_id: Uuid,
        from: &[TaskState],
        update: TaskUpdate,
    ) -> Result<Option<TaskRecord>, StoreError>;

    /// Tasks in `state`, ordered by submission time. Used to rebuild the
    /// in-memory queues after a restart.
    async fn list_tasks_in_state(&self, state: TaskState) -> Result<Vec<TaskRecord>, StoreError>;
}

pub(crate) fn apply_task_update(task: &mut TaskRecord, update: &TaskUpdate) {
    if let Some(state) = update.state {
        task.state = state;
    }
    if let Some(result) = &update.result {
        task.result = Some(result.clone());
    }
    if let Some(error) = &update.error {
        task.error = Some(error.clone());
    }
    if let Some(started_at) = update.started_at {
        task.started_at = Some(started_at);
    }
    if let Some(completed_at) = update.completed_at {
        task.completed_at = Some(completed_at);
    }
    if let Some(retries) = update.retries_remaining {
        task.retries_remaining = retries;
    }
}
