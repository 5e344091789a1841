//! Postgres-backed `StateStore`. Each table keeps the required index columns
//! as real columns and the rest of the entity as a `data` JSONB blob — full
//! round-trip fidelity without a column per field, while still indexing the
//! fields queries actually filter on.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::error::StoreError;
use crate::model::{
    DeadLetter, DefinitionId, ExecutionLogEntry, Job, JobId, JobQueueKind, JobStatus, LeadId, Run,
    RunId, RunStatus, TenantId, TriggerType, WorkflowDefinition,
};

use super::{HealthCounts, StateStore};

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        PostgresStore { pool }
    }

    /// Runs the embedded migrations (`migrations/`) against the pool.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

#[async_trait::async_trait]
impl StateStore for PostgresStore {
    async fn get_definition(&self, id: &DefinitionId) -> Result<Option<WorkflowDefinition>, StoreError> {
        let row = sqlx::query("SELECT data FROM definitions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        match row {
            Some(row) => {
                let data: serde_json::Value = row.try_get("data").map_err(db_err)?;
                Ok(Some(serde_json::from_value(data)?))
            }
            None => Ok(None),
        }
    }

    async fn save_definition(&self, definition: WorkflowDefinition) -> Result<(), StoreError> {
        let data = serde_json::to_value(&definition)?;
        sqlx::query(
            r#"
            INSERT INTO definitions (id, tenant_id, trigger_type, is_active, data)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                tenant_id = EXCLUDED.tenant_id,
                trigger_type = EXCLUDED.trigger_type,
                is_active = EXCLUDED.is_active,
                data = EXCLUDED.data
            "#,
        )
        .bind(&definition.id)
        .bind(&definition.tenant_id)
        .bind(format!("{:?}", definition.trigger_type.normalized()))
        .bind(definition.is_active)
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_candidate_definitions(
        &self,
        tenant_id: &TenantId,
        trigger_type: TriggerType,
    ) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let rows = sqlx::query(
            "SELECT data FROM definitions WHERE tenant_id = $1 AND trigger_type = $2 AND is_active = true",
        )
        .bind(tenant_id)
        .bind(format!("{:?}", trigger_type.normalized()))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter()
            .map(|row| {
                let data: serde_json::Value = row.try_get("data").map_err(db_err)?;
                Ok(serde_json::from_value(data)?)
            })
            .collect()
    }

    async fn increment_runs_count(&self, id: &DefinitionId, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            r#"UPDATE definitions SET data = jsonb_set(jsonb_set(data, '{stats,runsCount}',
               to_jsonb(COALESCE((data->'stats'->>'runsCount')::bigint, 0) + 1)),
               '{stats,lastRunAt}', to_jsonb($2::text)) WHERE id = $1"#,
        )
        .bind(id)
        .bind(at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn increment_success_count(&self, id: &DefinitionId) -> Result<(), StoreError> {
        sqlx::query(
            r#"UPDATE definitions SET data = jsonb_set(data, '{stats,successCount}',
               to_jsonb(COALESCE((data->'stats'->>'successCount')::bigint, 0) + 1)) WHERE id = $1"#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn increment_failure_count(&self, id: &DefinitionId) -> Result<(), StoreError> {
        sqlx::query(
            r#"UPDATE definitions SET data = jsonb_set(data, '{stats,failureCount}',
               to_jsonb(COALESCE((data->'stats'->>'failureCount')::bigint, 0) + 1)) WHERE id = $1"#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_run(&self, id: &RunId) -> Result<Option<Run>, StoreError> {
        let row = sqlx::query("SELECT data FROM runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        match row {
            Some(row) => {
                let data: serde_json::Value = row.try_get("data").map_err(db_err)?;
                Ok(Some(serde_json::from_value(data)?))
            }
            None => Ok(None),
        }
    }

    async fn create_run(&self, run: Run) -> Result<(), StoreError> {
        let data = serde_json::to_value(&run)?;
        sqlx::query(
            r#"
            INSERT INTO runs (id, tenant_id, definition_id, lead_id, status, updated_at, version,
                               reply_timeout_at, call_timeout_at, data)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&run.id)
        .bind(&run.tenant_id)
        .bind(&run.definition_id)
        .bind(&run.lead_id)
        .bind(format!("{:?}", run.status))
        .bind(run.updated_at)
        .bind(run.version)
        .bind(run.waiting_for_reply.as_ref().map(|w| w.timeout_at))
        .bind(run.waiting_for_call.as_ref().map(|w| w.timeout_at))
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn cas_update_run(&self, mut run: Run) -> Result<Run, StoreError> {
        let expected_version = run.version;
        run.version += 1;
        run.updated_at = Utc::now();
        let data = serde_json::to_value(&run)?;
        let result = sqlx::query(
            r#"
            UPDATE runs SET status = $1, updated_at = $2, version = $3,
                            reply_timeout_at = $4, call_timeout_at = $5, data = $6
            WHERE id = $7 AND version = $8
            "#,
        )
        .bind(format!("{:?}", run.status))
        .bind(run.updated_at)
        .bind(run.version)
        .bind(run.waiting_for_reply.as_ref().map(|w| w.timeout_at))
        .bind(run.waiting_for_call.as_ref().map(|w| w.timeout_at))
        .bind(data)
        .bind(&run.id)
        .bind(expected_version)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::VersionConflict { entity: "run", id: run.id.clone() });
        }
        Ok(run)
    }

    async fn runs_for_definition_lead(
        &self,
        definition_id: &DefinitionId,
        lead_id: &LeadId,
    ) -> Result<Vec<Run>, StoreError> {
        self.query_runs("SELECT data FROM runs WHERE definition_id = $1 AND lead_id = $2", |q| {
            q.bind(definition_id).bind(lead_id)
        })
        .await
    }

    async fn find_waiting_for_reply_by_phone(
        &self,
        tenant_id: &TenantId,
        _normalized_phone: &str,
    ) -> Result<Vec<Run>, StoreError> {
        // Phone matching happens against the joined lead record, which lives
        // outside this subsystem's tables; callers supply pre-filtered
        // candidates here by tenant and let the Resumer do the phone match.
        self.query_runs(
            "SELECT data FROM runs WHERE tenant_id = $1 AND reply_timeout_at IS NOT NULL ORDER BY data->>'startedAt' DESC",
            |q| q.bind(tenant_id),
        )
        .await
    }

    async fn find_waiting_for_call(
        &self,
        provider_call_id: Option<&str>,
        provider_conversation_id: Option<&str>,
        callback_run_id: Option<&RunId>,
    ) -> Result<Option<Run>, StoreError> {
        if let Some(cid) = provider_call_id {
            let runs = self
                .query_runs(
                    "SELECT data FROM runs WHERE call_timeout_at IS NOT NULL AND data->'waitingForCall'->>'providerCallId' = $1",
                    |q| q.bind(cid),
                )
                .await?;
            if let Some(r) = runs.into_iter().next() {
                return Ok(Some(r));
            }
        }
        if let Some(convo) = provider_conversation_id {
            let runs = self
                .query_runs(
                    "SELECT data FROM runs WHERE call_timeout_at IS NOT NULL AND data->'waitingForCall'->>'providerConversationId' = $1",
                    |q| q.bind(convo),
                )
                .await?;
            if let Some(r) = runs.into_iter().next() {
                return Ok(Some(r));
            }
        }
        if let Some(run_id) = callback_run_id {
            if let Some(run) = self.get_run(run_id).await? {
                if run.waiting_for_call.is_some() {
                    return Ok(Some(run));
                }
            }
        }
        Ok(None)
    }

    async fn find_waiting_for_task(&self, task_id: &str) -> Result<Option<Run>, StoreError> {
        let runs = self
            .query_runs("SELECT data FROM runs WHERE data->'waitingForTask'->>'taskId' = $1", |q| q.bind(task_id))
            .await?;
        Ok(runs.into_iter().next())
    }

    async fn list_waiting_for_call_runs(&self) -> Result<Vec<Run>, StoreError> {
        self.query_runs("SELECT data FROM runs WHERE status = 'WaitingForCall'", |q| q).await
    }

    async fn list_stuck_runs(&self, threshold: DateTime<Utc>) -> Result<Vec<Run>, StoreError> {
        self.query_runs(
            "SELECT data FROM runs WHERE status IN ('Running','WaitingForReply','WaitingForCall','WaitingForTask') AND updated_at < $1",
            |q| q.bind(threshold),
        )
        .await
    }

    async fn list_prunable_runs(
        &self,
        completed_before: DateTime<Utc>,
        failed_or_cancelled_before: DateTime<Utc>,
    ) -> Result<Vec<RunId>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT id FROM runs WHERE
               (status = 'Completed' AND updated_at < $1) OR
               (status IN ('Failed','Cancelled') AND updated_at < $2)"#,
        )
        .bind(completed_before)
        .bind(failed_or_cancelled_before)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(|r| r.try_get::<String, _>("id").map_err(db_err)).collect()
    }

    async fn delete_run(&self, id: &RunId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM runs WHERE id = $1").bind(id).execute(&self.pool).await.map_err(db_err)?;
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query("SELECT data FROM jobs WHERE id = $1").bind(id).fetch_optional(&self.pool).await.map_err(db_err)?;
        match row {
            Some(row) => {
                let data: serde_json::Value = row.try_get("data").map_err(db_err)?;
                Ok(Some(serde_json::from_value(data)?))
            }
            None => Ok(None),
        }
    }

    async fn create_job(&self, job: Job) -> Result<(), StoreError> {
        let data = serde_json::to_value(&job)?;
        sqlx::query(
            r#"INSERT INTO jobs (id, run_id, queue, status, scheduled_for, data)
               VALUES ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(&job.id)
        .bind(&job.run_id)
        .bind(format!("{:?}", job.queue))
        .bind(format!("{:?}", job.status))
        .bind(job.scheduled_for)
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_job(&self, job: Job) -> Result<(), StoreError> {
        let data = serde_json::to_value(&job)?;
        sqlx::query(
            r#"UPDATE jobs SET status = $1, scheduled_for = $2, data = $3 WHERE id = $4"#,
        )
        .bind(format!("{:?}", job.status))
        .bind(job.scheduled_for)
        .bind(data)
        .bind(&job.id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn jobs_for_run(&self, run_id: &RunId) -> Result<Vec<Job>, StoreError> {
        self.query_jobs("SELECT data FROM jobs WHERE run_id = $1", |q| q.bind(run_id)).await
    }

    async fn claim_due_jobs(
        &self,
        queue: JobQueueKind,
        now: DateTime<Utc>,
        limit: usize,
        worker_id: &str,
    ) -> Result<Vec<Job>, StoreError> {
        // `attempts` is bumped by the Executor itself on each attempt (matching
        // the in-memory store's claim behavior) — claiming only flips the
        // status and stamps `lastAttemptAt`, so the two backends agree on who
        // owns the counter and a job is never double-counted against §7's
        // `maxAttempts`.
        let rows = sqlx::query(
            r#"
            UPDATE jobs SET status = 'Processing',
                            data = jsonb_set(data, '{lastAttemptAt}', to_jsonb($1::text))
            WHERE id IN (
                SELECT id FROM jobs
                WHERE queue = $2 AND status = 'Pending' AND scheduled_for <= $1
                ORDER BY scheduled_for
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING data
            "#,
        )
        .bind(now)
        .bind(format!("{:?}", queue))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        tracing::debug!(worker_id, claimed = rows.len(), "claimed due jobs");
        rows.into_iter()
            .map(|row| {
                let data: serde_json::Value = row.try_get("data").map_err(db_err)?;
                Ok(serde_json::from_value(data)?)
            })
            .collect()
    }

    async fn list_stuck_processing_jobs(&self, threshold: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        self.query_jobs(
            "SELECT data FROM jobs WHERE status = 'Processing' AND (data->>'lastAttemptAt')::timestamptz < $1",
            |q| q.bind(threshold),
        )
        .await
    }

    async fn delete_orphaned_and_old_jobs(&self, completed_before: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"DELETE FROM jobs WHERE
               run_id NOT IN (SELECT id FROM runs) OR
               (status = 'Completed' AND (data->>'completedAt')::timestamptz < $1)"#,
        )
        .bind(completed_before)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn push_dead_letter(&self, dead_letter: DeadLetter) -> Result<(), StoreError> {
        let data = serde_json::to_value(&dead_letter)?;
        sqlx::query("INSERT INTO dead_letters (id, created_at, data) VALUES ($1, $2, $3)")
            .bind(&dead_letter.id)
            .bind(dead_letter.created_at)
            .bind(data)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>, StoreError> {
        let rows = sqlx::query("SELECT data FROM dead_letters ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.into_iter()
            .map(|row| {
                let data: serde_json::Value = row.try_get("data").map_err(db_err)?;
                Ok(serde_json::from_value(data)?)
            })
            .collect()
    }

    async fn get_dead_letter(&self, id: &str) -> Result<Option<DeadLetter>, StoreError> {
        let row = sqlx::query("SELECT data FROM dead_letters WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        match row {
            Some(row) => {
                let data: serde_json::Value = row.try_get("data").map_err(db_err)?;
                Ok(Some(serde_json::from_value(data)?))
            }
            None => Ok(None),
        }
    }

    async fn remove_dead_letter(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM dead_letters WHERE id = $1").bind(id).execute(&self.pool).await.map_err(db_err)?;
        Ok(())
    }

    async fn append_log_entry(&self, entry: ExecutionLogEntry) -> Result<(), StoreError> {
        let data = serde_json::to_value(&entry)?;
        sqlx::query("INSERT INTO execution_log (run_id, timestamp, data) VALUES ($1, $2, $3)")
            .bind(&entry.run_id)
            .bind(entry.timestamp)
            .bind(data)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn log_for_run(&self, run_id: &RunId) -> Result<Vec<ExecutionLogEntry>, StoreError> {
        let rows = sqlx::query("SELECT data FROM execution_log WHERE run_id = $1 ORDER BY timestamp")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.into_iter()
            .map(|row| {
                let data: serde_json::Value = row.try_get("data").map_err(db_err)?;
                Ok(serde_json::from_value(data)?)
            })
            .collect()
    }

    async fn health_counts(&self, now: DateTime<Utc>) -> Result<HealthCounts, StoreError> {
        let day_ago = now - chrono::Duration::hours(24);
        let hour_ago = now - chrono::Duration::hours(1);
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT count(*) FROM runs) AS total_runs,
                (SELECT count(*) FROM runs WHERE status IN ('Pending','Running','WaitingForReply','WaitingForCall','WaitingForTask')) AS active_runs,
                (SELECT count(*) FROM runs WHERE status IN ('WaitingForReply','WaitingForCall','WaitingForTask')) AS waiting_runs,
                (SELECT count(*) FROM runs WHERE status = 'Completed' AND updated_at >= $1) AS completed_24h,
                (SELECT count(*) FROM runs WHERE status = 'Failed' AND updated_at >= $1) AS failed_24h,
                (SELECT count(*) FROM runs WHERE status IN ('Pending','Running','WaitingForReply','WaitingForCall','WaitingForTask') AND updated_at < $1) AS stuck_runs,
                (SELECT count(*) FROM jobs WHERE status = 'Pending') AS pending_jobs,
                (SELECT count(*) FROM jobs WHERE status = 'Processing') AS processing_jobs,
                (SELECT count(*) FROM jobs WHERE status = 'Failed' AND (data->>'lastAttemptAt')::timestamptz >= $2) AS failed_jobs_last_hour
            "#,
        )
        .bind(day_ago)
        .bind(hour_ago)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(HealthCounts {
            total_runs: row.try_get::<i64, _>("total_runs").map_err(db_err)? as u64,
            active_runs: row.try_get::<i64, _>("active_runs").map_err(db_err)? as u64,
            waiting_runs: row.try_get::<i64, _>("waiting_runs").map_err(db_err)? as u64,
            completed_24h: row.try_get::<i64, _>("completed_24h").map_err(db_err)? as u64,
            failed_24h: row.try_get::<i64, _>("failed_24h").map_err(db_err)? as u64,
            stuck_runs: row.try_get::<i64, _>("stuck_runs").map_err(db_err)? as u64,
            pending_jobs: row.try_get::<i64, _>("pending_jobs").map_err(db_err)? as u64,
            processing_jobs: row.try_get::<i64, _>("processing_jobs").map_err(db_err)? as u64,
            failed_jobs_last_hour: row.try_get::<i64, _>("failed_jobs_last_hour").map_err(db_err)? as u64,
        })
    }
}

impl PostgresStore {
    async fn query_runs<'q, F>(&self, sql: &'q str, bind: F) -> Result<Vec<Run>, StoreError>
    where
        F: FnOnce(sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    {
        let query = bind(sqlx::query(sql));
        let rows = query.fetch_all(&self.pool).await.map_err(db_err)?;
        rows.into_iter()
            .map(|row| {
                let data: serde_json::Value = row.try_get("data").map_err(db_err)?;
                Ok(serde_json::from_value(data)?)
            })
            .collect()
    }

    async fn query_jobs<'q, F>(&self, sql: &'q str, bind: F) -> Result<Vec<Job>, StoreError>
    where
        F: FnOnce(sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    {
        let query = bind(sqlx::query(sql));
        let rows = query.fetch_all(&self.pool).await.map_err(db_err)?;
        rows.into_iter()
            .map(|row| {
                let data: serde_json::Value = row.try_get("data").map_err(db_err)?;
                Ok(serde_json::from_value(data)?)
            })
            .collect()
    }
}
