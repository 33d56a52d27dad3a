//! PostgreSQL implementation of ExecutionStore
//!
//! Production persistence:
//! - `seq` assignment and terminal-finality checks inside the append
//!   transaction
//! - `finish_execution` wraps the final append and the state update in one
//!   transaction
//! - claims rely on `INSERT ... ON CONFLICT DO NOTHING` for the at-most-one
//!   invariant
//!
//! Live event tails are fanned out through an in-process broadcast hub;
//! every append publishes after its transaction commits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::{PgPool, Row};
use tokio::sync::broadcast;
use tracing::{debug, error, instrument};
use uuid::Uuid;

use flux_core::{
    CatalogEntry, Claim, Event, EventKind, Execution, ExecutionFilter, ExecutionState,
    SourceType, WorkerInfo, WorkerState,
};

use super::store::{ExecutionStore, StoreError};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// PostgreSQL-backed ExecutionStore
#[derive(Clone)]
pub struct PostgresExecutionStore {
    pool: PgPool,
    event_channels: std::sync::Arc<DashMap<Uuid, broadcast::Sender<Event>>>,
}

impl PostgresExecutionStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            event_channels: std::sync::Arc::new(DashMap::new()),
        }
    }

    /// Connect and run migrations
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn publish(&self, execution_id: Uuid, event: &Event) {
        if let Some(tx) = self.event_channels.get(&execution_id) {
            let _ = tx.send(event.clone());
        }
    }

    fn row_to_execution(row: &sqlx::postgres::PgRow) -> Result<Execution, StoreError> {
        let state: String = row.get("state");
        Ok(Execution {
            id: row.get("id"),
            workflow_id: row.get("workflow_id"),
            workflow_name: row.get("workflow_name"),
            state: parse_state(&state)?,
            input: row.get("input"),
            output: row.get("output"),
            current_worker: row.get("current_worker"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn row_to_event(row: &sqlx::postgres::PgRow) -> Result<Event, StoreError> {
        let kind: String = row.get("kind");
        let source_type: String = row.get("source_type");
        Ok(Event {
            seq: row.get("seq"),
            kind: parse_kind(&kind)?,
            source_type: parse_source_type(&source_type)?,
            source_id: row.get("source_id"),
            source_name: row.get("source_name"),
            value: row.get("value"),
            time: row.get("time"),
        })
    }
}

fn parse_state(s: &str) -> Result<ExecutionState, StoreError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| StoreError::Serialization(format!("unknown execution state: {s}")))
}

fn state_str(state: ExecutionState) -> String {
    state.to_string()
}

fn parse_kind(s: &str) -> Result<EventKind, StoreError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| StoreError::Serialization(format!("unknown event kind: {s}")))
}

fn parse_source_type(s: &str) -> Result<SourceType, StoreError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| StoreError::Serialization(format!("unknown source type: {s}")))
}

fn source_type_str(source_type: SourceType) -> &'static str {
    match source_type {
        SourceType::Workflow => "workflow",
        SourceType::Task => "task",
    }
}

#[async_trait]
impl ExecutionStore for PostgresExecutionStore {
    #[instrument(skip(self, execution), fields(execution_id = %execution.id))]
    async fn create_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO executions
                (id, workflow_id, workflow_name, state, input, output, current_worker, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(execution.id)
        .bind(&execution.workflow_id)
        .bind(&execution.workflow_name)
        .bind(state_str(execution.state))
        .bind(&execution.input)
        .bind(&execution.output)
        .bind(&execution.current_worker)
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to create execution: {}", e);
            StoreError::Database(e.to_string())
        })?;

        debug!("created execution");
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Execution, StoreError> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::ExecutionNotFound(id))?;

        Self::row_to_execution(&row)
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<Execution>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM executions
            WHERE ($1::text IS NULL OR workflow_name = $1)
              AND ($2::text IS NULL OR state = $2)
            ORDER BY created_at
            "#,
        )
        .bind(&filter.workflow_name)
        .bind(filter.state.map(state_str))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(Self::row_to_execution).collect()
    }

    #[instrument(skip(self))]
    async fn set_execution_state(
        &self,
        id: Uuid,
        state: ExecutionState,
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let row = sqlx::query("SELECT state FROM executions WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::ExecutionNotFound(id))?;

        let current = parse_state(row.get("state"))?;
        if !current.can_transition_to(state) {
            return Err(StoreError::InvalidTransition {
                from: current,
                to: state,
            });
        }

        sqlx::query("UPDATE executions SET state = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(state_str(state))
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn set_current_worker(
        &self,
        id: Uuid,
        worker: Option<String>,
    ) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE executions SET current_worker = $2, updated_at = now() WHERE id = $1")
                .bind(id)
                .bind(&worker)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ExecutionNotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self, event), fields(kind = %event.kind))]
    async fn append_event(&self, execution_id: Uuid, mut event: Event) -> Result<i64, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let row = sqlx::query("SELECT state FROM executions WHERE id = $1 FOR UPDATE")
            .bind(execution_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::ExecutionNotFound(execution_id))?;

        if parse_state(row.get("state"))?.is_terminal() {
            return Err(StoreError::TerminalExecution(execution_id));
        }

        let row = sqlx::query(
            r#"
            INSERT INTO events (execution_id, seq, kind, source_type, source_id, source_name, value, time)
            SELECT $1, COALESCE(MAX(seq) + 1, 0), $2, $3, $4, $5, $6, $7
            FROM events WHERE execution_id = $1
            RETURNING seq
            "#,
        )
        .bind(execution_id)
        .bind(event.kind.to_string())
        .bind(source_type_str(event.source_type))
        .bind(&event.source_id)
        .bind(&event.source_name)
        .bind(&event.value)
        .bind(event.time)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        let seq: i64 = row.get("seq");

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        event.seq = seq;
        self.publish(execution_id, &event);
        Ok(seq)
    }

    async fn load_events(&self, execution_id: Uuid) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query("SELECT * FROM events WHERE execution_id = $1 ORDER BY seq")
            .bind(execution_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(Self::row_to_event).collect()
    }

    async fn subscribe_events(
        &self,
        execution_id: Uuid,
    ) -> Result<broadcast::Receiver<Event>, StoreError> {
        // Verify existence so subscribers fail fast on unknown ids
        self.get_execution(execution_id).await?;

        Ok(self
            .event_channels
            .entry(execution_id)
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0)
            .subscribe())
    }

    #[instrument(skip(self, output, final_event))]
    async fn finish_execution(
        &self,
        id: Uuid,
        state: ExecutionState,
        output: Option<serde_json::Value>,
        mut final_event: Event,
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let row = sqlx::query("SELECT state FROM executions WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::ExecutionNotFound(id))?;

        let current = parse_state(row.get("state"))?;
        if current.is_terminal() {
            return Err(StoreError::TerminalExecution(id));
        }
        if !current.can_transition_to(state) {
            return Err(StoreError::InvalidTransition {
                from: current,
                to: state,
            });
        }

        let row = sqlx::query(
            r#"
            INSERT INTO events (execution_id, seq, kind, source_type, source_id, source_name, value, time)
            SELECT $1, COALESCE(MAX(seq) + 1, 0), $2, $3, $4, $5, $6, $7
            FROM events WHERE execution_id = $1
            RETURNING seq
            "#,
        )
        .bind(id)
        .bind(final_event.kind.to_string())
        .bind(source_type_str(final_event.source_type))
        .bind(&final_event.source_id)
        .bind(&final_event.source_name)
        .bind(&final_event.value)
        .bind(final_event.time)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        let seq: i64 = row.get("seq");

        sqlx::query(
            r#"
            UPDATE executions
            SET state = $2, output = COALESCE($3, output), updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(state_str(state))
        .bind(&output)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        final_event.seq = seq;
        self.publish(id, &final_event);
        Ok(())
    }

    async fn put_catalog_entry(&self, entry: &CatalogEntry) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO catalog (name, version, source, resource_request, secret_requests, output_storage_kind)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (name, version) DO NOTHING
            "#,
        )
        .bind(&entry.name)
        .bind(entry.version as i32)
        .bind(&entry.source)
        .bind(serde_json::to_value(&entry.resource_request)?)
        .bind(serde_json::to_value(&entry.secret_requests)?)
        .bind(&entry.output_storage_kind)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::CatalogConflict {
                name: entry.name.clone(),
                version: entry.version,
            });
        }
        Ok(())
    }

    async fn get_catalog_entry(
        &self,
        name: &str,
        version: Option<u32>,
    ) -> Result<CatalogEntry, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM catalog
            WHERE name = $1 AND ($2::int IS NULL OR version = $2)
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(name)
        .bind(version.map(|v| v as i32))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or_else(|| StoreError::WorkflowNotFound(name.to_string()))?;

        row_to_catalog_entry(&row)
    }

    async fn list_catalog(&self) -> Result<Vec<CatalogEntry>, StoreError> {
        let rows = sqlx::query("SELECT * FROM catalog ORDER BY name, version")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(row_to_catalog_entry).collect()
    }

    async fn upsert_worker(&self, worker: &WorkerInfo) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workers (name, session_id, resources, registered_workflows, state, last_seen)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (name) DO UPDATE SET
                session_id = EXCLUDED.session_id,
                resources = EXCLUDED.resources,
                registered_workflows = EXCLUDED.registered_workflows,
                state = EXCLUDED.state,
                last_seen = EXCLUDED.last_seen
            "#,
        )
        .bind(&worker.name)
        .bind(worker.session_id)
        .bind(serde_json::to_value(&worker.resources)?)
        .bind(serde_json::to_value(&worker.registered_workflows)?)
        .bind(worker_state_str(worker.state))
        .bind(worker.last_seen)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn get_worker(&self, name: &str) -> Result<WorkerInfo, StoreError> {
        let row = sqlx::query("SELECT * FROM workers WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or_else(|| StoreError::WorkerNotFound(name.to_string()))?;

        row_to_worker(&row)
    }

    async fn list_workers(&self, online_only: bool) -> Result<Vec<WorkerInfo>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM workers
            WHERE NOT $1 OR state = 'online'
            ORDER BY name
            "#,
        )
        .bind(online_only)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(row_to_worker).collect()
    }

    async fn touch_worker(&self, name: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE workers SET last_seen = now() WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::WorkerNotFound(name.to_string()));
        }
        Ok(())
    }

    async fn mark_worker_offline(&self, name: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE workers SET state = 'offline' WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::WorkerNotFound(name.to_string()));
        }
        Ok(())
    }

    async fn try_claim(&self, claim: &Claim) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO claims (execution_id, worker_name, session_id, claimed_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (execution_id) DO NOTHING
            "#,
        )
        .bind(claim.execution_id)
        .bind(&claim.worker_name)
        .bind(claim.session_id)
        .bind(claim.claimed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        let claimed = result.rows_affected() == 1;
        if claimed {
            sqlx::query("UPDATE workers SET last_claim_at = $2 WHERE name = $1")
                .bind(&claim.worker_name)
                .bind(claim.claimed_at)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;
        }
        Ok(claimed)
    }

    async fn get_claim(&self, execution_id: Uuid) -> Result<Option<Claim>, StoreError> {
        let row = sqlx::query("SELECT * FROM claims WHERE execution_id = $1")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(row.map(|row| Claim {
            execution_id: row.get("execution_id"),
            worker_name: row.get("worker_name"),
            session_id: row.get("session_id"),
            claimed_at: row.get("claimed_at"),
        }))
    }

    async fn release_claim(&self, execution_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM claims WHERE execution_id = $1")
            .bind(execution_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn release_session_claims(&self, session_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query("DELETE FROM claims WHERE session_id = $1 RETURNING execution_id")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(rows.iter().map(|row| row.get("execution_id")).collect())
    }

    async fn count_active_claims(&self, worker_name: &str) -> Result<usize, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM claims WHERE worker_name = $1")
            .bind(worker_name)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let count: i64 = row.get("n");
        Ok(count as usize)
    }

    async fn last_claim_at(
        &self,
        worker_name: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = sqlx::query("SELECT last_claim_at FROM workers WHERE name = $1")
            .bind(worker_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(row.and_then(|row| row.get("last_claim_at")))
    }

    async fn cache_get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let row = sqlx::query("SELECT value FROM task_cache WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(row.map(|row| row.get("value")))
    }

    async fn cache_put(&self, key: &str, value: &serde_json::Value) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO task_cache (key, value)
            VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }
}

fn worker_state_str(state: WorkerState) -> &'static str {
    match state {
        WorkerState::Unknown => "unknown",
        WorkerState::Online => "online",
        WorkerState::Offline => "offline",
    }
}

fn parse_worker_state(s: &str) -> Result<WorkerState, StoreError> {
    match s {
        "unknown" => Ok(WorkerState::Unknown),
        "online" => Ok(WorkerState::Online),
        "offline" => Ok(WorkerState::Offline),
        other => Err(StoreError::Serialization(format!(
            "unknown worker state: {other}"
        ))),
    }
}

fn row_to_catalog_entry(row: &sqlx::postgres::PgRow) -> Result<CatalogEntry, StoreError> {
    let version: i32 = row.get("version");
    let resource_request: serde_json::Value = row.get("resource_request");
    let secret_requests: serde_json::Value = row.get("secret_requests");

    Ok(CatalogEntry {
        name: row.get("name"),
        version: version as u32,
        source: row.get("source"),
        resource_request: serde_json::from_value(resource_request)?,
        secret_requests: serde_json::from_value(secret_requests)?,
        output_storage_kind: row.get("output_storage_kind"),
    })
}

fn row_to_worker(row: &sqlx::postgres::PgRow) -> Result<WorkerInfo, StoreError> {
    let resources: serde_json::Value = row.get("resources");
    let registered: serde_json::Value = row.get("registered_workflows");
    let state: String = row.get("state");

    Ok(WorkerInfo {
        name: row.get("name"),
        session_id: row.get("session_id"),
        resources: serde_json::from_value(resources)?,
        registered_workflows: serde_json::from_value(registered)?,
        state: parse_worker_state(&state)?,
        last_seen: row.get("last_seen"),
    })
}
