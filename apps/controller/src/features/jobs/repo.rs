//! Job records.
//!
//! Transitions are monotonic: `queued -> running -> completed|failed`, with
//! `accepted` as the terminal marker for callback-mode jobs whose outcome
//! arrives via `/callbacks/job/{id}`. Finishing guards on the current state
//! so a late or duplicate callback can never resurrect a terminal job.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct JobRow {
    pub id: String,
    pub lab_id: String,
    pub agent_id: Option<String>,
    pub action: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub log: String,
}

#[derive(Clone)]
pub struct JobRepository {
    pool: PgPool,
}

impl JobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        id: &str,
        lab_id: &str,
        agent_id: Option<&str>,
        action: &str,
    ) -> sqlx::Result<JobRow> {
        sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO job (id, lab_id, agent_id, action, status)
            VALUES ($1, $2, $3, $4, 'queued')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(lab_id)
        .bind(agent_id)
        .bind(action)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn get(&self, id: &str) -> sqlx::Result<JobRow> {
        sqlx::query_as::<_, JobRow>(r#"SELECT * FROM job WHERE id = $1"#)
            .bind(id)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn mark_running(&self, id: &str) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            UPDATE job SET status = 'running', started_at = now()
            WHERE id = $1 AND status = 'queued'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Terminal transition; only non-terminal jobs move.
    pub async fn finish(&self, id: &str, status: &str, log: &str) -> sqlx::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job
            SET status = $2,
                completed_at = now(),
                started_at = COALESCE(started_at, created_at),
                log = $3
            WHERE id = $1 AND status IN ('queued', 'running')
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(log)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn touch_heartbeat(&self, id: &str) -> sqlx::Result<bool> {
        let result = sqlx::query(
            r#"UPDATE job SET last_heartbeat_at = now() WHERE id = $1 AND status IN ('queued', 'running')"#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn append_log(&self, id: &str, entry: &str) -> sqlx::Result<()> {
        sqlx::query(r#"UPDATE job SET log = log || $2 WHERE id = $1"#)
            .bind(id)
            .bind(entry)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// queued+running jobs per agent, for capacity filtering.
    pub async fn count_active(&self, agent_id: &str) -> sqlx::Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"SELECT COUNT(*) FROM job WHERE agent_id = $1 AND status IN ('queued', 'running')"#,
        )
        .bind(agent_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Delete terminal jobs older than the retention window. Returns how
    /// many were removed.
    pub async fn sweep_old(&self, older_than_secs: i64) -> sqlx::Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM job
            WHERE status IN ('completed', 'failed', 'accepted')
              AND created_at < now() - make_interval(secs => $1)
            "#,
        )
        .bind(older_than_secs as f64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
