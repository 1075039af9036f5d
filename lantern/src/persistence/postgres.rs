use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::PersistenceConfig;
use crate::correlation::RequestId;
use crate::job::{JobEnvelope, JobFailure, JobRecord, JobState, TaskId};
use crate::lease::{JobLease, LeaseId};
use crate::queue::JobBroker;
use crate::status::{StatusStore, TransitionOutcome};

const ALL_STATES: [JobState; 4] = [
    JobState::Pending,
    JobState::Started,
    JobState::Success,
    JobState::Failure,
];

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS lantern_jobs (
        task_id          UUID PRIMARY KEY,
        job_type         TEXT NOT NULL,
        state            TEXT NOT NULL DEFAULT 'PENDING',
        queue_state      TEXT NOT NULL DEFAULT 'idle',
        envelope         JSONB,
        result           JSONB,
        error_kind       TEXT,
        error_message    TEXT,
        attempts         INTEGER NOT NULL DEFAULT 0,
        deliveries       INTEGER NOT NULL DEFAULT 0,
        request_id       UUID,
        available_at     TIMESTAMPTZ,
        lease_id         UUID,
        lease_owner      TEXT,
        lease_expires_at TIMESTAMPTZ,
        enqueued_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        started_at       TIMESTAMPTZ,
        finished_at      TIMESTAMPTZ,
        updated_at       TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS lantern_jobs_ready_idx
        ON lantern_jobs (available_at)
        WHERE queue_state = 'ready'
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS lantern_jobs_lease_idx
        ON lantern_jobs (lease_id)
        WHERE lease_id IS NOT NULL
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS todos (
        id         BIGSERIAL PRIMARY KEY,
        text       VARCHAR(500) NOT NULL,
        done       BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
];

/// Open a connection pool. Only the masked URL is ever logged.
pub async fn connect(config: &PersistenceConfig) -> anyhow::Result<PgPool> {
    info!(
        database_url = %config.masked_connection_string(),
        max_connections = config.max_connections,
        "Connecting to database"
    );
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(StdDuration::from_secs(config.acquire_timeout_seconds))
        .connect(&config.connection_string)
        .await
        .map_err(|e| {
            anyhow::anyhow!(
                "connecting to {} failed: {e}",
                config.masked_connection_string()
            )
        })?;
    Ok(pool)
}

/// Create tables and indexes that do not exist yet.
pub async fn ensure_schema(pool: &PgPool) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;
    for statement in SCHEMA {
        sqlx::query(statement).execute(&mut *tx).await?;
    }
    tx.commit().await?;
    debug!("Database schema ensured");
    Ok(())
}

/// Broker and status store sharing the `lantern_jobs` table.
///
/// `state` is the client-visible job state; `queue_state` tracks delivery
/// (`idle`, `ready`, `leased`, `done`) and is only touched by broker calls.
#[derive(Clone, Debug)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// States a record may be in for a move to `next` to be accepted.
    fn sources_for(next: JobState) -> Vec<String> {
        ALL_STATES
            .iter()
            .filter(|state| state.can_transition_to(next))
            .map(|state| state.as_str().to_string())
            .collect()
    }

    async fn rejection(&self, task_id: TaskId) -> anyhow::Result<TransitionOutcome> {
        let row = sqlx::query("SELECT state FROM lantern_jobs WHERE task_id = $1")
            .bind(task_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let current: String = row.try_get("state")?;
                Ok(TransitionOutcome::Rejected {
                    current: current.parse()?,
                })
            }
            None => Ok(TransitionOutcome::Missing),
        }
    }

    async fn settle_lease(&self, lease_id: LeaseId) -> anyhow::Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE lantern_jobs
            SET queue_state = 'done',
                lease_id = NULL,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE lease_id = $1
              AND queue_state = 'leased'
            "#,
        )
        .bind(lease_id.0)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            anyhow::bail!("lease {lease_id} not found");
        }
        Ok(())
    }

    fn record_from_row(row: &PgRow) -> anyhow::Result<JobRecord> {
        let state: String = row.try_get("state")?;
        let error_kind: Option<String> = row.try_get("error_kind")?;
        let error_message: Option<String> = row.try_get("error_message")?;
        let attempts: i32 = row.try_get("attempts")?;
        let request_id: Option<Uuid> = row.try_get("request_id")?;

        Ok(JobRecord {
            task_id: TaskId(row.try_get("task_id")?),
            job_type: row.try_get("job_type")?,
            state: state.parse()?,
            result: row.try_get("result")?,
            error: error_kind.map(|kind| JobFailure {
                kind,
                message: error_message.unwrap_or_default(),
            }),
            attempts: u32::try_from(attempts).unwrap_or_default(),
            request_id: request_id.map(RequestId),
            enqueued_at: row.try_get("enqueued_at")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }
}

#[async_trait]
impl JobBroker for PostgresJobStore {
    async fn enqueue(&self, envelope: JobEnvelope) -> anyhow::Result<()> {
        let body = serde_json::to_value(&envelope)?;
        sqlx::query(
            r#"
            INSERT INTO lantern_jobs (task_id, job_type, request_id, envelope, queue_state, available_at, enqueued_at)
            VALUES ($1, $2, $3, $4, 'ready', NOW(), $5)
            ON CONFLICT (task_id) DO UPDATE
            SET envelope = EXCLUDED.envelope,
                queue_state = 'ready',
                available_at = NOW(),
                updated_at = NOW()
            "#,
        )
        .bind(envelope.task_id.as_uuid())
        .bind(&envelope.job_type)
        .bind(envelope.request_id.map(|id| id.as_uuid()))
        .bind(&body)
        .bind(envelope.enqueued_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn dequeue(&self, worker_id: &str, lease_ttl: Duration) -> anyhow::Result<Option<JobLease>> {
        let lease_id = LeaseId::new();
        let expires_at = Utc::now() + lease_ttl;

        let row = sqlx::query(
            r#"
            WITH next AS (
                SELECT task_id
                FROM lantern_jobs
                WHERE queue_state = 'ready'
                  AND available_at <= NOW()
                ORDER BY available_at, enqueued_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            UPDATE lantern_jobs j
            SET queue_state = 'leased',
                lease_id = $1,
                lease_owner = $2,
                lease_expires_at = $3,
                deliveries = j.deliveries + 1,
                updated_at = NOW()
            FROM next
            WHERE j.task_id = next.task_id
            RETURNING j.envelope, j.deliveries
            "#,
        )
        .bind(lease_id.0)
        .bind(worker_id)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let body: Value = row.try_get("envelope")?;
        let deliveries: i32 = row.try_get("deliveries")?;
        let envelope: JobEnvelope = serde_json::from_value(body)?;

        Ok(Some(JobLease {
            lease_id,
            envelope,
            worker_id: worker_id.to_string(),
            expires_at,
            attempt: u32::try_from(deliveries).unwrap_or(1),
            ttl_ms: lease_ttl.num_milliseconds(),
        }))
    }

    async fn renew(&self, lease_id: LeaseId, extend_by: Duration) -> anyhow::Result<DateTime<Utc>> {
        let expires_at = Utc::now() + extend_by;
        let res = sqlx::query(
            r#"
            UPDATE lantern_jobs
            SET lease_expires_at = $2,
                updated_at = NOW()
            WHERE lease_id = $1
              AND queue_state = 'leased'
            "#,
        )
        .bind(lease_id.0)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            anyhow::bail!("lease {lease_id} not found");
        }
        Ok(expires_at)
    }

    async fn complete(&self, lease_id: LeaseId) -> anyhow::Result<()> {
        self.settle_lease(lease_id).await
    }

    async fn retry(&self, lease_id: LeaseId, delay: Duration) -> anyhow::Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE lantern_jobs
            SET queue_state = 'ready',
                available_at = $2,
                lease_id = NULL,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE lease_id = $1
              AND queue_state = 'leased'
            "#,
        )
        .bind(lease_id.0)
        .bind(Utc::now() + delay)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            anyhow::bail!("lease {lease_id} not found");
        }
        Ok(())
    }

    async fn fail(&self, lease_id: LeaseId) -> anyhow::Result<()> {
        self.settle_lease(lease_id).await
    }

    async fn reclaim_expired(&self) -> anyhow::Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE lantern_jobs
            SET queue_state = 'ready',
                available_at = NOW(),
                lease_id = NULL,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE queue_state = 'leased'
              AND lease_expires_at < NOW()
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    async fn depth(&self) -> anyhow::Result<usize> {
        let row = sqlx::query("SELECT COUNT(*) AS depth FROM lantern_jobs WHERE queue_state = 'ready'")
            .fetch_one(&self.pool)
            .await?;
        let depth: i64 = row.try_get("depth")?;
        Ok(usize::try_from(depth).unwrap_or_default())
    }

    async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl StatusStore for PostgresJobStore {
    async fn insert_pending(&self, record: JobRecord) -> anyhow::Result<()> {
        let res = sqlx::query(
            r#"
            INSERT INTO lantern_jobs (task_id, job_type, state, request_id, enqueued_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (task_id) DO NOTHING
            "#,
        )
        .bind(record.task_id.as_uuid())
        .bind(&record.job_type)
        .bind(record.state.as_str())
        .bind(record.request_id.map(|id| id.as_uuid()))
        .bind(record.enqueued_at)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            anyhow::bail!("task {} already recorded", record.task_id);
        }
        Ok(())
    }

    async fn mark_started(&self, task_id: TaskId, attempt: u32) -> anyhow::Result<TransitionOutcome> {
        let row = sqlx::query(
            r#"
            WITH prev AS (
                SELECT task_id, state FROM lantern_jobs WHERE task_id = $1 FOR UPDATE
            )
            UPDATE lantern_jobs j
            SET state = 'STARTED',
                attempts = GREATEST(j.attempts, $2),
                started_at = COALESCE(j.started_at, NOW()),
                updated_at = NOW()
            FROM prev
            WHERE j.task_id = prev.task_id
              AND prev.state = ANY($3)
            RETURNING prev.state AS previous
            "#,
        )
        .bind(task_id.as_uuid())
        .bind(i32::try_from(attempt).unwrap_or(i32::MAX))
        .bind(Self::sources_for(JobState::Started))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let previous: String = row.try_get("previous")?;
                Ok(TransitionOutcome::Applied {
                    previous: previous.parse()?,
                })
            }
            None => self.rejection(task_id).await,
        }
    }

    async fn mark_succeeded(&self, task_id: TaskId, result: Value) -> anyhow::Result<TransitionOutcome> {
        let row = sqlx::query(
            r#"
            WITH prev AS (
                SELECT task_id, state FROM lantern_jobs WHERE task_id = $1 FOR UPDATE
            )
            UPDATE lantern_jobs j
            SET state = 'SUCCESS',
                result = $2,
                finished_at = NOW(),
                updated_at = NOW()
            FROM prev
            WHERE j.task_id = prev.task_id
              AND prev.state = ANY($3)
            RETURNING prev.state AS previous
            "#,
        )
        .bind(task_id.as_uuid())
        .bind(&result)
        .bind(Self::sources_for(JobState::Success))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let previous: String = row.try_get("previous")?;
                Ok(TransitionOutcome::Applied {
                    previous: previous.parse()?,
                })
            }
            None => self.rejection(task_id).await,
        }
    }

    async fn mark_failed(&self, task_id: TaskId, failure: JobFailure) -> anyhow::Result<TransitionOutcome> {
        let row = sqlx::query(
            r#"
            WITH prev AS (
                SELECT task_id, state FROM lantern_jobs WHERE task_id = $1 FOR UPDATE
            )
            UPDATE lantern_jobs j
            SET state = 'FAILURE',
                error_kind = $2,
                error_message = $3,
                finished_at = NOW(),
                updated_at = NOW()
            FROM prev
            WHERE j.task_id = prev.task_id
              AND prev.state = ANY($4)
            RETURNING prev.state AS previous
            "#,
        )
        .bind(task_id.as_uuid())
        .bind(&failure.kind)
        .bind(&failure.message)
        .bind(Self::sources_for(JobState::Failure))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let previous: String = row.try_get("previous")?;
                Ok(TransitionOutcome::Applied {
                    previous: previous.parse()?,
                })
            }
            None => self.rejection(task_id).await,
        }
    }

    async fn get(&self, task_id: TaskId) -> anyhow::Result<Option<JobRecord>> {
        let row = sqlx::query(
            r#"
            SELECT task_id, job_type, state, result, error_kind, error_message,
                   attempts, request_id, enqueued_at, started_at, finished_at
            FROM lantern_jobs
            WHERE task_id = $1
            "#,
        )
        .bind(task_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::record_from_row).transpose()
    }

    async fn purge_expired(&self, finished_before: DateTime<Utc>) -> anyhow::Result<u64> {
        let res = sqlx::query(
            r#"
            DELETE FROM lantern_jobs
            WHERE finished_at < $1
              AND state IN ('SUCCESS', 'FAILURE')
              AND queue_state <> 'leased'
            "#,
        )
        .bind(finished_before)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }
}
