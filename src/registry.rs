//! In-memory index of live instances and the per-instance handle.
//!
//! Three indexes (instance id, bot id, capability) are kept mutually
//! consistent under one registry lock. The handle owns everything a
//! session shares with the dispatcher: the outbound lane, the pending
//! correlation table, heartbeat bookkeeping, and the close signal.

use crate::error::DispatchError;
use crate::protocol::{CommandResponse, Envelope};
use crate::telemetry::Metrics;
use crate::{BotId, CommandId, InstanceId};

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

/// Session lifecycle states as observed through the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Active,
    Draining,
    Closed,
}

impl InstanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Active => "active",
            InstanceStatus::Draining => "draining",
            InstanceStatus::Closed => "closed",
        }
    }
}

/// Why a session left the active state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    HeartbeatMiss,
    /// Displaced by a reconnect claiming the same instance id.
    Superseded,
    AdminClose,
    BotDeleted,
    Shutdown,
    Transport,
    Protocol,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::HeartbeatMiss => "heartbeat_miss",
            CloseReason::Superseded => "superseded",
            CloseReason::AdminClose => "admin_close",
            CloseReason::BotDeleted => "bot_deleted",
            CloseReason::Shutdown => "shutdown",
            CloseReason::Transport => "transport",
            CloseReason::Protocol => "protocol",
        }
    }
}

/// Terminal signal delivered to a dispatch waiter, exactly once.
#[derive(Debug)]
pub enum CommandReply {
    Response(CommandResponse),
    Gone(CloseReason),
}

struct Waiter {
    tx: oneshot::Sender<CommandReply>,
    command_name: String,
}

struct HandleState {
    status: InstanceStatus,
    last_heartbeat: Instant,
    last_heartbeat_at: DateTime<Utc>,
    pending: HashMap<CommandId, Waiter>,
}

/// A live session for one (`bot_id`, `instance_id`) pair.
pub struct InstanceHandle {
    pub bot_id: BotId,
    pub instance_id: InstanceId,
    pub connected_at: DateTime<Utc>,
    pub heartbeat_interval: Duration,
    /// Declared at handshake; authoritative over the definition's list.
    pub capabilities: Vec<String>,
    /// Insertion order, the round-robin tie-breaker.
    seq: u64,
    outbound: mpsc::Sender<Envelope>,
    state: Mutex<HandleState>,
    close_tx: watch::Sender<Option<CloseReason>>,
}

impl InstanceHandle {
    pub fn status(&self) -> InstanceStatus {
        self.state.lock().expect("instance state lock").status
    }

    /// Subscribe to the close signal; `Some(reason)` once draining starts.
    pub fn close_signal(&self) -> watch::Receiver<Option<CloseReason>> {
        self.close_tx.subscribe()
    }

    pub fn touch_heartbeat(&self) {
        let mut state = self.state.lock().expect("instance state lock");
        state.last_heartbeat = Instant::now();
        state.last_heartbeat_at = Utc::now();
    }

    pub fn last_heartbeat_at(&self) -> DateTime<Utc> {
        self.state
            .lock()
            .expect("instance state lock")
            .last_heartbeat_at
    }

    /// True once `window` has fully elapsed since the last heartbeat.
    pub fn heartbeat_expired(&self, window: Duration) -> bool {
        let state = self.state.lock().expect("instance state lock");
        state.last_heartbeat.elapsed() > window
    }

    /// Enqueue an envelope on the outbound lane (FIFO per instance).
    pub async fn enqueue(&self, envelope: Envelope) -> Result<(), DispatchError> {
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| DispatchError::InstanceGone)
    }

    /// Install a waiter for `command_id`. Fails unless the session is
    /// Active, so no waiter can be parked on a dying session.
    pub fn register_waiter(
        &self,
        command_id: CommandId,
        command_name: &str,
    ) -> Result<oneshot::Receiver<CommandReply>, DispatchError> {
        let mut state = self.state.lock().expect("instance state lock");
        if state.status != InstanceStatus::Active {
            return Err(DispatchError::InstanceGone);
        }
        let (tx, rx) = oneshot::channel();
        state.pending.insert(
            command_id,
            Waiter {
                tx,
                command_name: command_name.to_string(),
            },
        );
        Ok(rx)
    }

    /// Complete the waiter for a response. Returns false for late or
    /// duplicate correlations, which the caller drops.
    pub fn complete_waiter(&self, response: CommandResponse) -> bool {
        let waiter = {
            let mut state = self.state.lock().expect("instance state lock");
            state.pending.remove(&response.command_id)
        };
        match waiter {
            Some(waiter) => {
                // A dropped receiver means the dispatcher already gave up;
                // that is the same as a late response.
                waiter.tx.send(CommandReply::Response(response)).is_ok()
            }
            None => false,
        }
    }

    /// Remove a waiter without completing it (deadline or caller cancel).
    pub fn remove_waiter(&self, command_id: CommandId) {
        let mut state = self.state.lock().expect("instance state lock");
        state.pending.remove(&command_id);
    }

    /// Move to Draining: fail every outstanding waiter and raise the
    /// close signal. Idempotent; only the first reason wins.
    pub fn begin_drain(&self, reason: CloseReason) {
        let drained: Vec<Waiter> = {
            let mut state = self.state.lock().expect("instance state lock");
            if state.status != InstanceStatus::Active {
                return;
            }
            state.status = InstanceStatus::Draining;
            state.pending.drain().map(|(_, waiter)| waiter).collect()
        };

        for waiter in drained {
            tracing::debug!(
                bot_id = %self.bot_id,
                instance_id = %self.instance_id,
                command_name = %waiter.command_name,
                reason = reason.as_str(),
                "failing pending waiter on drain"
            );
            let _ = waiter.tx.send(CommandReply::Gone(reason));
        }

        let _ = self.close_tx.send(Some(reason));
    }

    pub fn mark_closed(&self) {
        let mut state = self.state.lock().expect("instance state lock");
        state.status = InstanceStatus::Closed;
    }
}

/// Everything the session layer provides when registering an instance.
pub struct InstanceSpec {
    pub bot_id: BotId,
    pub instance_id: InstanceId,
    pub capabilities: Vec<String>,
    pub heartbeat_interval: Duration,
    pub outbound: mpsc::Sender<Envelope>,
}

#[derive(Default)]
struct Indexes {
    by_instance: HashMap<InstanceId, Arc<InstanceHandle>>,
    by_bot: HashMap<BotId, HashSet<InstanceId>>,
    by_capability: HashMap<String, HashSet<InstanceId>>,
    insert_seq: u64,
    rr_counter: u64,
}

/// Concurrent-safe instance index. Writers hold one critical section
/// spanning all three maps, so readers never observe them out of step.
#[derive(Default)]
pub struct InstanceRegistry {
    indexes: Mutex<Indexes>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly handshaken instance as Active. A live entry
    /// under the same instance id and bot id is displaced and returned so
    /// the caller can drain it; the same id under a different bot is a
    /// conflict.
    pub fn insert(
        &self,
        spec: InstanceSpec,
    ) -> Result<(Arc<InstanceHandle>, Option<Arc<InstanceHandle>>), InsertError> {
        let mut indexes = self.indexes.lock().expect("registry lock");

        let displaced = match indexes.by_instance.get(&spec.instance_id) {
            Some(existing) if existing.bot_id != spec.bot_id => {
                return Err(InsertError::InstanceIdInUse);
            }
            Some(existing) => Some(existing.clone()),
            None => None,
        };
        if displaced.is_some() {
            Self::unlink(&mut indexes, &spec.instance_id);
        }

        indexes.insert_seq += 1;
        let now = Instant::now();
        let handle = Arc::new(InstanceHandle {
            bot_id: spec.bot_id.clone(),
            instance_id: spec.instance_id.clone(),
            connected_at: Utc::now(),
            heartbeat_interval: spec.heartbeat_interval,
            capabilities: spec.capabilities,
            seq: indexes.insert_seq,
            outbound: spec.outbound,
            state: Mutex::new(HandleState {
                status: InstanceStatus::Active,
                last_heartbeat: now,
                last_heartbeat_at: Utc::now(),
                pending: HashMap::new(),
            }),
            close_tx: watch::Sender::new(None),
        });

        indexes
            .by_instance
            .insert(handle.instance_id.clone(), handle.clone());
        indexes
            .by_bot
            .entry(handle.bot_id.clone())
            .or_default()
            .insert(handle.instance_id.clone());
        for capability in &handle.capabilities {
            indexes
                .by_capability
                .entry(capability.clone())
                .or_default()
                .insert(handle.instance_id.clone());
        }

        Metrics::global()
            .active_instances
            .set(indexes.by_instance.len() as i64);
        Ok((handle, displaced))
    }

    /// Remove `handle` from all indexes. A displaced session's teardown
    /// must not evict its successor, so removal is by identity, not id.
    pub fn remove(&self, handle: &Arc<InstanceHandle>) {
        let mut indexes = self.indexes.lock().expect("registry lock");
        let is_current = indexes
            .by_instance
            .get(&handle.instance_id)
            .is_some_and(|current| Arc::ptr_eq(current, handle));
        if is_current {
            Self::unlink(&mut indexes, &handle.instance_id);
        }
        Metrics::global()
            .active_instances
            .set(indexes.by_instance.len() as i64);
    }

    fn unlink(indexes: &mut Indexes, instance_id: &InstanceId) {
        let Some(handle) = indexes.by_instance.remove(instance_id) else {
            return;
        };
        if let Some(ids) = indexes.by_bot.get_mut(&handle.bot_id) {
            ids.remove(instance_id);
            if ids.is_empty() {
                indexes.by_bot.remove(&handle.bot_id);
            }
        }
        for capability in &handle.capabilities {
            if let Some(ids) = indexes.by_capability.get_mut(capability) {
                ids.remove(instance_id);
                if ids.is_empty() {
                    indexes.by_capability.remove(capability);
                }
            }
        }
    }

    pub fn get(&self, instance_id: &str) -> Option<Arc<InstanceHandle>> {
        let indexes = self.indexes.lock().expect("registry lock");
        indexes.by_instance.get(instance_id).cloned()
    }

    pub fn list_by_bot(&self, bot_id: &str) -> Vec<Arc<InstanceHandle>> {
        let indexes = self.indexes.lock().expect("registry lock");
        let Some(ids) = indexes.by_bot.get(bot_id) else {
            return Vec::new();
        };
        let mut handles: Vec<_> = ids
            .iter()
            .filter_map(|id| indexes.by_instance.get(id).cloned())
            .collect();
        handles.sort_by_key(|handle| handle.seq);
        handles
    }

    pub fn all(&self) -> Vec<Arc<InstanceHandle>> {
        let indexes = self.indexes.lock().expect("registry lock");
        indexes.by_instance.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.indexes.lock().expect("registry lock").by_instance.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Round-robin over the Active instances of `bot_id` holding
    /// `capability`. Draining and Closed instances are never returned;
    /// tie-breaking is deterministic by insertion order.
    pub fn select_by_capability(
        &self,
        bot_id: &str,
        capability: &str,
    ) -> Option<Arc<InstanceHandle>> {
        let mut indexes = self.indexes.lock().expect("registry lock");
        let ids = indexes.by_capability.get(capability)?;

        let mut eligible: Vec<Arc<InstanceHandle>> = ids
            .iter()
            .filter_map(|id| indexes.by_instance.get(id))
            .filter(|handle| {
                handle.bot_id.as_ref() == bot_id && handle.status() == InstanceStatus::Active
            })
            .cloned()
            .collect();
        if eligible.is_empty() {
            return None;
        }
        eligible.sort_by_key(|handle| handle.seq);

        indexes.rr_counter = indexes.rr_counter.wrapping_add(1);
        let pick = (indexes.rr_counter as usize - 1) % eligible.len();
        Some(eligible[pick].clone())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InsertError {
    #[error("instance id is already claimed by a different bot")]
    InstanceIdInUse,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(
        bot_id: &str,
        instance_id: &str,
        capabilities: &[&str],
    ) -> (InstanceSpec, mpsc::Receiver<Envelope>) {
        let (outbound, outbound_rx) = mpsc::channel(8);
        let spec = InstanceSpec {
            bot_id: bot_id.into(),
            instance_id: instance_id.into(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            heartbeat_interval: Duration::from_secs(30),
            outbound,
        };
        (spec, outbound_rx)
    }

    #[test]
    fn selection_round_robins_over_active_instances() {
        let registry = InstanceRegistry::new();
        let (spec_one, _lane_one) = spec("b1", "i1", &["t.exec"]);
        let (spec_two, _lane_two) = spec("b1", "i2", &["t.exec"]);
        let (first, _) = registry.insert(spec_one).expect("insert");
        let (second, _) = registry.insert(spec_two).expect("insert");

        let picks: Vec<_> = (0..4)
            .map(|_| {
                registry
                    .select_by_capability("b1", "t.exec")
                    .expect("an instance is eligible")
                    .instance_id
                    .clone()
            })
            .collect();

        assert_eq!(picks[0], picks[2]);
        assert_eq!(picks[1], picks[3]);
        assert_ne!(picks[0], picks[1]);

        // A draining instance drops out of selection entirely.
        first.begin_drain(CloseReason::AdminClose);
        for _ in 0..4 {
            let pick = registry
                .select_by_capability("b1", "t.exec")
                .expect("second instance still active");
            assert_eq!(pick.instance_id, second.instance_id);
        }
    }

    #[test]
    fn selection_respects_bot_and_capability() {
        let registry = InstanceRegistry::new();
        let (spec_one, _lane_one) = spec("b1", "i1", &["t.exec"]);
        let (spec_two, _lane_two) = spec("b2", "i2", &["t.exec"]);
        registry.insert(spec_one).expect("insert");
        registry.insert(spec_two).expect("insert");

        assert!(registry.select_by_capability("b1", "other.cap").is_none());
        let pick = registry
            .select_by_capability("b2", "t.exec")
            .expect("b2 instance");
        assert_eq!(pick.instance_id.as_ref(), "i2");
    }

    #[test]
    fn reconnect_displaces_same_bot_and_rejects_other_bot() {
        let registry = InstanceRegistry::new();
        let (spec_one, _lane_one) = spec("b1", "i1", &["t.exec"]);
        let (original, displaced) = registry.insert(spec_one).expect("insert");
        assert!(displaced.is_none());

        let (spec_two, _lane_two) = spec("b1", "i1", &["t.exec", "extra.cap"]);
        let (replacement, displaced) = registry
            .insert(spec_two)
            .expect("reconnect displaces");
        let displaced = displaced.expect("original handle returned");
        assert!(Arc::ptr_eq(&displaced, &original));
        assert_eq!(registry.len(), 1);

        // The old session's teardown must not evict the replacement.
        registry.remove(&original);
        assert!(registry.get("i1").is_some());
        let current = registry.get("i1").expect("replacement still registered");
        assert!(Arc::ptr_eq(&current, &replacement));

        let (spec_conflict, _lane_conflict) = spec("b2", "i1", &[]);
        assert!(registry.insert(spec_conflict).is_err());
    }

    #[test]
    fn waiters_fail_once_on_drain() {
        let registry = InstanceRegistry::new();
        let (spec_one, _lane_one) = spec("b1", "i1", &["t.exec"]);
        let (handle, _) = registry.insert(spec_one).expect("insert");

        let command_id = uuid::Uuid::new_v4();
        let mut rx = handle
            .register_waiter(command_id, "t.exec")
            .expect("active session accepts waiters");

        handle.begin_drain(CloseReason::HeartbeatMiss);
        match rx.try_recv() {
            Ok(CommandReply::Gone(CloseReason::HeartbeatMiss)) => {}
            other => panic!("expected Gone(HeartbeatMiss), got {other:?}"),
        }

        // Draining sessions accept no new waiters and drop late responses.
        assert!(handle.register_waiter(uuid::Uuid::new_v4(), "t.exec").is_err());
        let late = CommandResponse {
            command_id,
            status: crate::protocol::CommandStatus::Success,
            result: None,
            error: None,
        };
        assert!(!handle.complete_waiter(late));
    }
}
