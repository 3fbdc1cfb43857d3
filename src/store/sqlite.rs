//! Durable `StateStore` backed by SQLite.

use super::{
    BotDefinition, ConsumeOutcome, CredentialRecord, StateStore, TaskRecord, TaskState, TaskUpdate,
};
use crate::error::StoreError;

use anyhow::Context as _;
use async_trait::async_trait;
use sqlx::{Row as _, SqlitePool, sqlite::SqlitePoolOptions};
use subtle::ConstantTimeEq as _;
use uuid::Uuid;

/// SQLite-backed store. Pass `sqlite://path?mode=rwc` to create the
/// database on first start, or `sqlite::memory:` for an ephemeral one.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(url)
            .await
            .with_context(|| format!("failed to connect to state store: {url}"))?;

        let store = Self { pool };
        store.create_schema().await?;
        Ok(store)
    }

    async fn create_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bot_definitions (
                bot_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                adapter_type TEXT NOT NULL,
                capabilities TEXT NOT NULL DEFAULT '[]',
                configuration TEXT NOT NULL DEFAULT '{}',
                created_at TIMESTAMP NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create bot_definitions schema")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                bot_id TEXT PRIMARY KEY,
                one_time_digest TEXT,
                long_lived_digest TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create credentials schema")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                bot_id TEXT NOT NULL,
                command_name TEXT NOT NULL,
                arguments TEXT NOT NULL DEFAULT '{}',
                state TEXT NOT NULL,
                result TEXT,
                error TEXT,
                submitted_at TIMESTAMP NOT NULL,
                started_at TIMESTAMP,
                completed_at TIMESTAMP,
                retries_remaining INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create tasks schema")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state, submitted_at)")
            .execute(&self.pool)
            .await
            .context("failed to create task state index")?;

        Ok(())
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn put_definition(&self, definition: &BotDefinition) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO bot_definitions
                (bot_id, name, description, adapter_type, capabilities, configuration, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(bot_id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                adapter_type = excluded.adapter_type,
                capabilities = excluded.capabilities,
                configuration = excluded.configuration
            "#,
        )
        .bind(&definition.bot_id)
        .bind(&definition.name)
        .bind(&definition.description)
        .bind(&definition.adapter_type)
        .bind(serde_json::to_string(&definition.declared_capabilities)?)
        .bind(definition.configuration.to_string())
        .bind(definition.created_at)
        .execute(&self.pool)
        .await
        .context("failed to upsert bot definition")?;
        Ok(())
    }

    async fn get_definition(&self, bot_id: &str) -> Result<Option<BotDefinition>, StoreError> {
        let row = sqlx::query("SELECT * FROM bot_definitions WHERE bot_id = ?")
            .bind(bot_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch bot definition")?;
        row.map(definition_from_row).transpose()
    }

    async fn list_definitions(&self) -> Result<Vec<BotDefinition>, StoreError> {
        let rows = sqlx::query("SELECT * FROM bot_definitions ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await
            .context("failed to list bot definitions")?;
        rows.into_iter().map(definition_from_row).collect()
    }

    async fn delete_definition(&self, bot_id: &str) -> Result<bool, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to open delete transaction")?;

        sqlx::query("DELETE FROM credentials WHERE bot_id = ?")
            .bind(bot_id)
            .execute(&mut *tx)
            .await
            .context("failed to delete credentials")?;
        let result = sqlx::query("DELETE FROM bot_definitions WHERE bot_id = ?")
            .bind(bot_id)
            .execute(&mut *tx)
            .await
            .context("failed to delete bot definition")?;

        tx.commit()
            .await
            .context("failed to commit delete transaction")?;
        Ok(result.rows_affected() > 0)
    }

    async fn put_credentials(&self, record: &CredentialRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO credentials (bot_id, one_time_digest, long_lived_digest)
            VALUES (?, ?, ?)
            ON CONFLICT(bot_id) DO UPDATE SET
                one_time_digest = excluded.one_time_digest,
                long_lived_digest = excluded.long_lived_digest
            "#,
        )
        .bind(&record.bot_id)
        .bind(&record.one_time_digest)
        .bind(&record.long_lived_digest)
        .execute(&self.pool)
        .await
        .context("failed to upsert credentials")?;
        Ok(())
    }

    async fn get_credentials(&self, bot_id: &str) -> Result<Option<CredentialRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT bot_id, one_time_digest, long_lived_digest FROM credentials WHERE bot_id = ?",
        )
        .bind(bot_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch credentials")?;

        Ok(row.map(|row| CredentialRecord {
            bot_id: row.get("bot_id"),
            one_time_digest: row.get("one_time_digest"),
            long_lived_digest: row.get("long_lived_digest"),
        }))
    }

    async fn consume_one_time(
        &self,
        bot_id: &str,
        candidate_digest: &str,
        new_long_lived_digest: &str,
    ) -> Result<ConsumeOutcome, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to open consume transaction")?;

        let row = sqlx::query("SELECT one_time_digest FROM credentials WHERE bot_id = ?")
            .bind(bot_id)
            .fetch_optional(&mut *tx)
            .await
            .context("failed to read stored token digest")?;

        let Some(row) = row else {
            return Ok(ConsumeOutcome::UnknownBot);
        };
        let Some(stored) = row.get::<Option<String>, _>("one_time_digest") else {
            return Ok(ConsumeOutcome::NoUnconsumedToken);
        };
        if !bool::from(stored.as_bytes().ct_eq(candidate_digest.as_bytes())) {
            return Ok(ConsumeOutcome::Mismatch);
        }

        // The WHERE clause is the swap's linearization point: a concurrent
        // winner leaves rows_affected at zero here.
        let result = sqlx::query(
            "UPDATE credentials SET one_time_digest = NULL, long_lived_digest = ? \
             WHERE bot_id = ? AND one_time_digest IS NOT NULL",
        )
        .bind(new_long_lived_digest)
        .bind(bot_id)
        .execute(&mut *tx)
        .await
        .context("failed to swap one-time token")?;

        if result.rows_affected() == 0 {
            return Ok(ConsumeOutcome::NoUnconsumedToken);
        }

        tx.commit()
            .await
            .context("failed to commit token swap")?;
        Ok(ConsumeOutcome::Swapped)
    }

    async fn put_task(&self, task: &TaskRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO tasks
                (task_id, bot_id, command_name, arguments, state, result, error,
                 submitted_at, started_at, completed_at, retries_remaining)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(task.task_id.to_string())
        .bind(&task.bot_id)
        .bind(&task.command_name)
        .bind(task.arguments.to_string())
        .bind(task.state.as_str())
        .bind(task.result.as_ref().map(|v| v.to_string()))
        .bind(&task.error)
        .bind(task.submitted_at)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(task.retries_remaining)
        .execute(&self.pool)
        .await
        .context("failed to insert task")?;
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<TaskRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE task_id = ?")
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch task")?;
        row.map(task_from_row).transpose()
    }

    async fn transition_task(
        &self,
        task_id: Uuid,
        from: &[TaskState],
        update: TaskUpdate,
    ) -> Result<Option<TaskRecord>, StoreError> {
        if from.is_empty() {
            return Ok(None);
        }

        let placeholders = vec!["?"; from.len()].join(", ");
        let query = format!(
            "UPDATE tasks SET \
                state = COALESCE(?, state), \
                result = COALESCE(?, result), \
                error = COALESCE(?, error), \
                started_at = COALESCE(?, started_at), \
                completed_at = COALESCE(?, completed_at), \
                retries_remaining = COALESCE(?, retries_remaining) \
             WHERE task_id = ? AND state IN ({placeholders})"
        );

        let mut sql = sqlx::query(&query)
            .bind(update.state.map(TaskState::as_str))
            .bind(update.result.as_ref().map(|v| v.to_string()))
            .bind(&update.error)
            .bind(update.started_at)
            .bind(update.completed_at)
            .bind(update.retries_remaining)
            .bind(task_id.to_string());
        for state in from {
            sql = sql.bind(state.as_str());
        }

        let result = sql
            .execute(&self.pool)
            .await
            .context("failed to transition task")?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }

        self.get_task(task_id).await
    }

    async fn list_tasks_in_state(&self, state: TaskState) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE state = ? ORDER BY submitted_at ASC")
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await
            .context("failed to list tasks by state")?;
        rows.into_iter().map(task_from_row).collect()
    }
}

fn definition_from_row(row: sqlx::sqlite::SqliteRow) -> Result<BotDefinition, StoreError> {
    let capabilities: String = row
        .try_get("capabilities")
        .context("failed to read capabilities")?;
    let configuration: String = row
        .try_get("configuration")
        .context("failed to read configuration")?;

    Ok(BotDefinition {
        bot_id: row.try_get("bot_id").context("failed to read bot_id")?,
        name: row.try_get("name").context("failed to read name")?,
        description: row
            .try_get("description")
            .context("failed to read description")?,
        adapter_type: row
            .try_get("adapter_type")
            .context("failed to read adapter_type")?,
        declared_capabilities: serde_json::from_str(&capabilities)?,
        configuration: serde_json::from_str(&configuration)?,
        created_at: row
            .try_get("created_at")
            .context("failed to read created_at")?,
    })
}

fn task_from_row(row: sqlx::sqlite::SqliteRow) -> Result<TaskRecord, StoreError> {
    let task_id: String = row.try_get("task_id").context("failed to read task_id")?;
    let state_value: String = row.try_get("state").context("failed to read state")?;
    let arguments: String = row
        .try_get("arguments")
        .context("failed to read arguments")?;
    let result: Option<String> = row.try_get("result").context("failed to read result")?;

    Ok(TaskRecord {
        task_id: task_id
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("invalid task id: {task_id}")))?,
        bot_id: row.try_get("bot_id").context("failed to read bot_id")?,
        command_name: row
            .try_get("command_name")
            .context("failed to read command_name")?,
        arguments: serde_json::from_str(&arguments)?,
        state: TaskState::parse(&state_value)
            .ok_or_else(|| StoreError::Corrupt(format!("invalid task state: {state_value}")))?,
        result: result.as_deref().map(serde_json::from_str).transpose()?,
        error: row.try_get("error").context("failed to read error")?,
        submitted_at: row
            .try_get("submitted_at")
            .context("failed to read submitted_at")?,
        started_at: row
            .try_get("started_at")
            .context("failed to read started_at")?,
        completed_at: row
            .try_get("completed_at")
            .context("failed to read completed_at")?,
        retries_remaining: row
            .try_get::<i64, _>("retries_remaining")
            .context("failed to read retries_remaining")? as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    async fn setup_store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite should connect")
    }

    fn definition(bot_id: &str) -> BotDefinition {
        BotDefinition {
            bot_id: bot_id.into(),
            name: "demo bot".into(),
            description: String::new(),
            adapter_type: "demo".into(),
            declared_capabilities: vec!["t.exec".into()],
            configuration: serde_json::json!({"region": "eu"}),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn definition_round_trip_and_delete() {
        let store = setup_store().await;
        store
            .put_definition(&definition("b1"))
            .await
            .expect("put definition");
        store
            .put_credentials(&CredentialRecord {
                bot_id: "b1".into(),
                one_time_digest: Some("d".into()),
                long_lived_digest: None,
            })
            .await
            .expect("put credentials");

        let fetched = store
            .get_definition("b1")
            .await
            .expect("get")
            .expect("definition exists");
        assert_eq!(fetched.declared_capabilities, vec!["t.exec".to_string()]);
        assert_eq!(fetched.configuration["region"], "eu");

        assert!(store.delete_definition("b1").await.expect("delete"));
        assert!(store.get_definition("b1").await.expect("get").is_none());
        assert!(
            store
                .get_credentials("b1")
                .await
                .expect("get credentials")
                .is_none(),
            "delete must take credentials with it"
        );
        assert!(!store.delete_definition("b1").await.expect("second delete"));
    }

    #[tokio::test]
    async fn token_swap_is_single_winner() {
        let store = setup_store().await;
        store
            .put_credentials(&CredentialRecord {
                bot_id: "b1".into(),
                one_time_digest: Some("token-digest".into()),
                long_lived_digest: None,
            })
            .await
            .expect("seed credentials");

        let first = store
            .consume_one_time("b1", "token-digest", "key-digest")
            .await
            .expect("first consume");
        assert_eq!(first, ConsumeOutcome::Swapped);

        let second = store
            .consume_one_time("b1", "token-digest", "other-digest")
            .await
            .expect("second consume");
        assert_eq!(second, ConsumeOutcome::NoUnconsumedToken);

        let record = store
            .get_credentials("b1")
            .await
            .expect("get")
            .expect("record");
        assert_eq!(record.long_lived_digest.as_deref(), Some("key-digest"));
    }

    #[tokio::test]
    async fn task_round_trip_and_guarded_transition() {
        let store = setup_store().await;
        let task = TaskRecord {
            task_id: Uuid::new_v4(),
            bot_id: "b1".into(),
            command_name: "t.exec".into(),
            arguments: serde_json::json!({"x": 1}),
            state: TaskState::Pending,
            result: None,
            error: None,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retries_remaining: 3,
        };
        store.put_task(&task).await.expect("put task");

        let running = store
            .transition_task(
                task.task_id,
                &[TaskState::Pending],
                TaskUpdate {
                    state: Some(TaskState::Running),
                    started_at: Some(Utc::now()),
                    ..TaskUpdate::default()
                },
            )
            .await
            .expect("transition")
            .expect("pending -> running");
        assert_eq!(running.state, TaskState::Running);
        assert!(running.started_at.is_some());

        let completed = store
            .transition_task(
                task.task_id,
                &[TaskState::Running],
                TaskUpdate {
                    state: Some(TaskState::Completed),
                    result: Some(serde_json::json!({"y": 2})),
                    completed_at: Some(Utc::now()),
                    ..TaskUpdate::default()
                },
            )
            .await
            .expect("transition")
            .expect("running -> completed");
        assert_eq!(completed.result, Some(serde_json::json!({"y": 2})));

        let stuck = store
            .transition_task(
                task.task_id,
                &[TaskState::Pending, TaskState::Running],
                TaskUpdate::to_state(TaskState::Cancelled),
            )
            .await
            .expect("transition");
        assert!(stuck.is_none(), "completed tasks must stay completed");
    }
}
