use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use vmbroker_model::{
    Session, SessionId, SessionStatus, Worker, WorkerId, WorkerStatus,
};

use crate::error::{BrokerError, Result};
use crate::store::{NewSession, SessionStore, WorkerStore};

/// Durable store over PostgreSQL.
///
/// The idempotency invariant is enforced by the unique index on
/// `(user_id, idempotency_key)`, so it holds across process restarts and
/// multiple service instances.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn map_worker(row: &PgRow) -> Result<Worker> {
        let status: String = row.try_get("status")?;
        let status = WorkerStatus::parse(&status).ok_or_else(|| {
            BrokerError::Database(format!("invalid worker status `{status}`"))
        })?;
        Ok(Worker {
            id: WorkerId(row.try_get::<Uuid, _>("id")?),
            label: row.try_get("label")?,
            base_address: row.try_get("base_address")?,
            status,
            max_concurrent_sessions: row.try_get("max_concurrent_sessions")?,
            credential: row.try_get("credential")?,
            reported_jobs: row.try_get("reported_jobs")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn map_session(row: &PgRow) -> Result<Session> {
        let status: String = row.try_get("status")?;
        let status = SessionStatus::parse(&status).ok_or_else(|| {
            BrokerError::Database(format!("invalid session status `{status}`"))
        })?;
        let checklist: serde_json::Value = row.try_get("checklist")?;
        let result: Option<serde_json::Value> = row.try_get("result")?;
        Ok(Session {
            id: SessionId(row.try_get::<Uuid, _>("id")?),
            user_id: row.try_get("user_id")?,
            idempotency_key: row.try_get("idempotency_key")?,
            status,
            provision_action: row.try_get("provision_action")?,
            worker_id: row
                .try_get::<Option<Uuid>, _>("worker_id")?
                .map(WorkerId),
            worker_route: row.try_get("worker_route")?,
            checklist: serde_json::from_value(checklist)?,
            result: result.map(serde_json::from_value).transpose()?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }

    const SESSION_COLUMNS: &'static str = "id, user_id, idempotency_key, \
         status, provision_action, worker_id, worker_route, checklist, \
         result, created_at, updated_at, expires_at";
}

#[async_trait]
impl WorkerStore for PostgresStore {
    async fn insert_worker(&self, worker: Worker) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workers
                (id, label, base_address, status, max_concurrent_sessions,
                 credential, reported_jobs, last_heartbeat, created_at,
                 updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(worker.id.to_uuid())
        .bind(&worker.label)
        .bind(&worker.base_address)
        .bind(worker.status.as_str())
        .bind(worker.max_concurrent_sessions)
        .bind(&worker.credential)
        .bind(worker.reported_jobs)
        .bind(worker.last_heartbeat)
        .bind(worker.created_at)
        .bind(worker.updated_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn get_worker(&self, id: WorkerId) -> Result<Option<Worker>> {
        let row = sqlx::query("SELECT * FROM workers WHERE id = $1")
            .bind(id.to_uuid())
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(Self::map_worker).transpose()
    }

    async fn update_worker(&self, worker: &Worker) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE workers
            SET label = $2,
                base_address = $3,
                status = $4,
                max_concurrent_sessions = $5,
                reported_jobs = $6,
                last_heartbeat = $7,
                updated_at = $8
            WHERE id = $1
            "#,
        )
        .bind(worker.id.to_uuid())
        .bind(&worker.label)
        .bind(&worker.base_address)
        .bind(worker.status.as_str())
        .bind(worker.max_concurrent_sessions)
        .bind(worker.reported_jobs)
        .bind(worker.last_heartbeat)
        .bind(worker.updated_at)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(BrokerError::WorkerNotFound(worker.id.to_uuid()));
        }
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<Worker>> {
        let rows =
            sqlx::query("SELECT * FROM workers ORDER BY created_at, id")
                .fetch_all(self.pool())
                .await?;
        rows.iter().map(Self::map_worker).collect()
    }

    async fn record_heartbeat(
        &self,
        id: WorkerId,
        reported_jobs: i32,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE workers
            SET reported_jobs = $2, last_heartbeat = $3, updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id.to_uuid())
        .bind(reported_jobs)
        .bind(at)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(BrokerError::WorkerNotFound(id.to_uuid()));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for PostgresStore {
    async fn insert_or_get(&self, new: NewSession) -> Result<(Session, bool)> {
        let now = Utc::now();
        let inserted = sqlx::query(
            r#"
            INSERT INTO sessions
                (id, user_id, idempotency_key, status, provision_action,
                 checklist, created_at, updated_at)
            VALUES ($1, $2, $3, 'pending', $4, '[]'::jsonb, $5, $5)
            ON CONFLICT (user_id, idempotency_key) DO NOTHING
            "#,
        )
        .bind(new.id.to_uuid())
        .bind(new.user_id)
        .bind(&new.idempotency_key)
        .bind(new.provision_action)
        .bind(now)
        .execute(self.pool())
        .await?;
        let created = inserted.rows_affected() == 1;

        let query = format!(
            "SELECT {} FROM sessions \
             WHERE user_id = $1 AND idempotency_key = $2",
            Self::SESSION_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(new.user_id)
            .bind(&new.idempotency_key)
            .fetch_one(self.pool())
            .await?;
        Ok((Self::map_session(&row)?, created))
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<Session>> {
        let query = format!(
            "SELECT {} FROM sessions WHERE id = $1",
            Self::SESSION_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(id.to_uuid())
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(Self::map_session).transpose()
    }

    async fn update_session(&self, session: &Session) -> Result<()> {
        let checklist = serde_json::to_value(&session.checklist)?;
        let result_json = session
            .result
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET status = $2,
                worker_id = $3,
                worker_route = $4,
                checklist = $5,
                result = $6,
                updated_at = $7,
                expires_at = $8
            WHERE id = $1
            "#,
        )
        .bind(session.id.to_uuid())
        .bind(session.status.as_str())
        .bind(session.worker_id.map(WorkerId::to_uuid))
        .bind(&session.worker_route)
        .bind(checklist)
        .bind(result_json)
        .bind(session.updated_at)
        .bind(session.expires_at)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(BrokerError::UnknownSession(session.id.to_uuid()));
        }
        Ok(())
    }

    async fn list_user_sessions(&self, user_id: Uuid) -> Result<Vec<Session>> {
        let query = format!(
            "SELECT {} FROM sessions \
             WHERE user_id = $1 ORDER BY created_at DESC",
            Self::SESSION_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(user_id)
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(Self::map_session).collect()
    }

    async fn active_session_counts(
        &self,
        worker_ids: &[WorkerId],
    ) -> Result<HashMap<WorkerId, i64>> {
        if worker_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let ids: Vec<Uuid> =
            worker_ids.iter().copied().map(WorkerId::to_uuid).collect();
        let rows = sqlx::query(
            r#"
            SELECT worker_id, COUNT(id) AS active
            FROM sessions
            WHERE worker_id = ANY($1)
              AND status IN ('pending', 'provisioning', 'ready')
            GROUP BY worker_id
            "#,
        )
        .bind(&ids)
        .fetch_all(self.pool())
        .await?;

        let mut counts = HashMap::new();
        for row in rows {
            let worker_id: Uuid = row.try_get("worker_id")?;
            let active: i64 = row.try_get("active")?;
            counts.insert(WorkerId(worker_id), active);
        }
        Ok(counts)
    }

    async fn expired_ready_sessions(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        let query = format!(
            "SELECT {} FROM sessions \
             WHERE status = 'ready' AND expires_at IS NOT NULL \
               AND expires_at <= $1",
            Self::SESSION_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(cutoff)
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(Self::map_session).collect()
    }

    async fn stale_inflight_sessions(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        let query = format!(
            "SELECT {} FROM sessions \
             WHERE status IN ('pending', 'provisioning') \
               AND updated_at <= $1",
            Self::SESSION_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(cutoff)
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(Self::map_session).collect()
    }
}
