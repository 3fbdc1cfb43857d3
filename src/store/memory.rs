//! In-memory `StateStore`, the default backend and the one tests use.

use super::{
    BotDefinition, ConsumeOutcome, CredentialRecord, StateStore, TaskRecord, TaskState, TaskUpdate,
    apply_task_update,
};
use crate::error::StoreError;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use subtle::ConstantTimeEq as _;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    definitions: HashMap<String, BotDefinition>,
    credentials: HashMap<String, CredentialRecord>,
    tasks: HashMap<Uuid, TaskRecord>,
}

/// Mutex-guarded maps. No await points ever hold the lock, so the
/// credential swap is atomic by construction.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn put_definition(&self, definition: &BotDefinition) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("state store lock");
        inner
            .definitions
            .insert(definition.bot_id.clone(), definition.clone());
        Ok(())
    }

    async fn get_definition(&self, bot_id: &str) -> Result<Option<BotDefinition>, StoreError> {
        let inner = self.inner.lock().expect("state store lock");
        Ok(inner.definitions.get(bot_id).cloned())
    }

    async fn list_definitions(&self) -> Result<Vec<BotDefinition>, StoreError> {
        let inner = self.inner.lock().expect("state store lock");
        let mut definitions: Vec<_> = inner.definitions.values().cloned().collect();
        definitions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(definitions)
    }

    async fn delete_definition(&self, bot_id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().expect("state store lock");
        inner.credentials.remove(bot_id);
        Ok(inner.definitions.remove(bot_id).is_some())
    }

    async fn put_credentials(&self, record: &CredentialRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("state store lock");
        inner
            .credentials
            .insert(record.bot_id.clone(), record.clone());
        Ok(())
    }

    async fn get_credentials(&self, bot_id: &str) -> Result<Option<CredentialRecord>, StoreError> {
        let inner = self.inner.lock().expect("state store lock");
        Ok(inner.credentials.get(bot_id).cloned())
    }

    async fn consume_one_time(
        &self,
        bot_id: &str,
        candidate_digest: &str,
        new_long_lived_digest: &str,
    ) -> Result<ConsumeOutcome, StoreError> {
        let mut inner = self.inner.lock().expect("state store lock");
        let Some(record) = inner.credentials.get_mut(bot_id) else {
            return Ok(ConsumeOutcome::UnknownBot);
        };
        let Some(stored) = &record.one_time_digest else {
            return Ok(ConsumeOutcome::NoUnconsumedToken);
        };

        if stored.as_bytes().ct_eq(candidate_digest.as_bytes()).into() {
            record.one_time_digest = None;
            record.long_lived_digest = Some(new_long_lived_digest.to_string());
            Ok(ConsumeOutcome::Swapped)
        } else {
            Ok(ConsumeOutcome::Mismatch)
        }
    }

    async fn put_task(&self, task: &TaskRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("state store lock");
        inner.tasks.insert(task.task_id, task.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<TaskRecord>, StoreError> {
        let inner = self.inner.lock().expect("state store lock");
        Ok(inner.tasks.get(&task_id).cloned())
    }

    async fn transition_task(
        &self,
        task_id: Uuid,
        from: &[TaskState],
        update: TaskUpdate,
    ) -> Result<Option<TaskRecord>, StoreError> {
        let mut inner = self.inner.lock().expect("state store lock");
        let Some(task) = inner.tasks.get_mut(&task_id) else {
            return Ok(None);
        };
        if !from.contains(&task.state) {
            return Ok(None);
        }
        apply_task_update(task, &update);
        Ok(Some(task.clone()))
    }

    async fn list_tasks_in_state(&self, state: TaskState) -> Result<Vec<TaskRecord>, StoreError> {
        let inner = self.inner.lock().expect("state store lock");
        let mut tasks: Vec<_> = inner
            .tasks
            .values()
            .filter(|task| task.state == state)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn credential_record(bot_id: &str, token_digest: &str) -> CredentialRecord {
        CredentialRecord {
            bot_id: bot_id.into(),
            one_time_digest: Some(token_digest.into()),
            long_lived_digest: None,
        }
    }

    #[tokio::test]
    async fn consume_one_time_admits_exactly_one_winner() {
        let store = std::sync::Arc::new(MemoryStore::new());
        store
            .put_credentials(&credential_record("b1", "digest-a"))
            .await
            .expect("seed credentials");

        let mut winners = 0;
        for _ in 0..8 {
            let outcome = store
                .consume_one_time("b1", "digest-a", "key-digest")
                .await
                .expect("consume");
            if outcome == ConsumeOutcome::Swapped {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        let record = store
            .get_credentials("b1")
            .await
            .expect("get")
            .expect("record");
        assert!(record.one_time_digest.is_none());
        assert_eq!(record.long_lived_digest.as_deref(), Some("key-digest"));
    }

    #[tokio::test]
    async fn consume_one_time_rejects_mismatch_without_consuming() {
        let store = MemoryStore::new();
        store
            .put_credentials(&credential_record("b1", "digest-a"))
            .await
            .expect("seed credentials");

        let outcome = store
            .consume_one_time("b1", "digest-b", "key-digest")
            .await
            .expect("consume");
        assert_eq!(outcome, ConsumeOutcome::Mismatch);

        let record = store
            .get_credentials("b1")
            .await
            .expect("get")
            .expect("record");
        assert_eq!(record.one_time_digest.as_deref(), Some("digest-a"));
        assert!(record.long_lived_digest.is_none());
    }

    #[tokio::test]
    async fn transition_task_guards_terminal_states() {
        let store = MemoryStore::new();
        let task = TaskRecord {
            task_id: Uuid::new_v4(),
            bot_id: "b1".into(),
            command_name: "t.exec".into(),
            arguments: serde_json::json!({}),
            state: TaskState::Pending,
            result: None,
            error: None,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retries_remaining: 3,
        };
        store.put_task(&task).await.expect("put");

        let cancelled = store
            .transition_task(
                task.task_id,
                &[TaskState::Pending, TaskState::Running],
                TaskUpdate::to_state(TaskState::Cancelled),
            )
            .await
            .expect("transition")
            .expect("guard should pass");
        assert_eq!(cancelled.state, TaskState::Cancelled);

        let resurrected = store
            .transition_task(
                task.task_id,
                &[TaskState::Pending],
                TaskUpdate::to_state(TaskState::Running),
            )
            .await
            .expect("transition");
        assert!(resurrected.is_none(), "terminal states are permanent");
    }
}
