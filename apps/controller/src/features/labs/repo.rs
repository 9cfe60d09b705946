//! Lab rows and the lab state machine.
//!
//! `stopped -> starting -> running -> stopping -> stopped`, with `error`
//! reachable from the transitional states and `unknown` set when the
//! reconciler loses sight of the lab's agent.

use sqlx::PgPool;

pub use crate::features::topology::repo::LabRow;

#[derive(Clone)]
pub struct LabRepository {
    pool: PgPool,
}

impl LabRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: &str) -> sqlx::Result<LabRow> {
        sqlx::query_as::<_, LabRow>(r#"SELECT * FROM lab WHERE id = $1"#)
            .bind(id)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn list(&self) -> sqlx::Result<Vec<LabRow>> {
        sqlx::query_as::<_, LabRow>(r#"SELECT * FROM lab ORDER BY created_at"#)
            .fetch_all(&self.pool)
            .await
    }

    pub async fn list_ids(&self) -> sqlx::Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(r#"SELECT id FROM lab"#)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn labs_on_agent(&self, agent_id: &str) -> sqlx::Result<Vec<LabRow>> {
        sqlx::query_as::<_, LabRow>(r#"SELECT * FROM lab WHERE agent_id = $1"#)
            .bind(agent_id)
            .fetch_all(&self.pool)
            .await
    }

    pub async fn set_state(&self, id: &str, state: &str, error: Option<&str>) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            UPDATE lab
            SET state = $2, state_error = $3, state_updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(state)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remember which agent hosts (most of) the lab, for affinity.
    pub async fn set_agent(&self, id: &str, agent_id: Option<&str>) -> sqlx::Result<()> {
        sqlx::query(r#"UPDATE lab SET agent_id = $2 WHERE id = $1"#)
            .bind(id)
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
