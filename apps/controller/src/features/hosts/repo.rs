use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;

pub const HEARTBEAT_FRESH_SECS: i64 = 60;
pub const HEARTBEAT_DEGRADED_SECS: i64 = 300;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct HostRow {
    pub id: String,
    pub name: String,
    pub address: String,
    pub status: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub capabilities_json: Value,
    pub version: String,
    pub started_at: Option<DateTime<Utc>>,
    pub is_local: bool,
    pub registered_at: DateTime<Utc>,
}

impl HostRow {
    pub fn providers(&self) -> Vec<String> {
        self.capabilities_json["providers"]
            .as_array()
            .map(|providers| {
                providers
                    .iter()
                    .filter_map(|p| p.as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn max_concurrent_jobs(&self) -> i64 {
        self.capabilities_json["max_concurrent_jobs"]
            .as_i64()
            .unwrap_or(4)
    }

    pub fn supports_vxlan(&self) -> bool {
        self.capabilities_json["features"]
            .as_array()
            .is_some_and(|features| features.iter().any(|f| f.as_str() == Some("vxlan")))
    }

    /// Heartbeat-derived health: online within 60 s, degraded within 5 min,
    /// offline beyond that.
    pub fn derived_status(&self) -> &'static str {
        match self.last_heartbeat {
            Some(seen) if Utc::now() - seen < chrono::Duration::seconds(HEARTBEAT_FRESH_SECS) => {
                "online"
            }
            Some(seen)
                if Utc::now() - seen < chrono::Duration::seconds(HEARTBEAT_DEGRADED_SECS) =>
            {
                "degraded"
            }
            _ => "offline",
        }
    }
}

#[derive(Clone)]
pub struct HostRepository {
    pool: PgPool,
}

impl HostRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn register(
        &self,
        id: &str,
        name: &str,
        address: &str,
        capabilities: Value,
        version: &str,
        started_at: Option<DateTime<Utc>>,
        is_local: bool,
    ) -> sqlx::Result<HostRow> {
        sqlx::query_as::<_, HostRow>(
            r#"
            INSERT INTO host (id, name, address, status, last_heartbeat, capabilities_json, version, started_at, is_local)
            VALUES ($1, $2, $3, 'online', now(), $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name,
                address = EXCLUDED.address,
                status = 'online',
                last_heartbeat = now(),
                capabilities_json = EXCLUDED.capabilities_json,
                version = EXCLUDED.version,
                started_at = EXCLUDED.started_at,
                is_local = EXCLUDED.is_local
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(address)
        .bind(capabilities)
        .bind(version)
        .bind(started_at)
        .bind(is_local)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn heartbeat(&self, id: &str, status: &str) -> sqlx::Result<HostRow> {
        sqlx::query_as::<_, HostRow>(
            r#"UPDATE host SET status = $2, last_heartbeat = now() WHERE id = $1 RETURNING *"#,
        )
        .bind(id)
        .bind(status)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn get(&self, id: &str) -> sqlx::Result<HostRow> {
        sqlx::query_as::<_, HostRow>(r#"SELECT * FROM host WHERE id = $1"#)
            .bind(id)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn get_by_name_or_id(&self, name: &str) -> sqlx::Result<Option<HostRow>> {
        sqlx::query_as::<_, HostRow>(r#"SELECT * FROM host WHERE id = $1 OR name = $1"#)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn list_all(&self) -> sqlx::Result<Vec<HostRow>> {
        sqlx::query_as::<_, HostRow>(r#"SELECT * FROM host ORDER BY last_heartbeat DESC NULLS LAST"#)
            .fetch_all(&self.pool)
            .await
    }

    /// Agents that are marked online and have heartbeated recently.
    pub async fn list_fresh(&self) -> sqlx::Result<Vec<HostRow>> {
        sqlx::query_as::<_, HostRow>(
            r#"
            SELECT * FROM host
            WHERE status = 'online'
              AND last_heartbeat > now() - make_interval(secs => $1)
            ORDER BY last_heartbeat DESC
            "#,
        )
        .bind(HEARTBEAT_FRESH_SECS as f64)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn mark_offline(&self, id: &str) -> sqlx::Result<()> {
        sqlx::query(r#"UPDATE host SET status = 'offline' WHERE id = $1"#)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Flip agents whose heartbeat went stale to offline. Returns the ids
    /// that changed.
    pub async fn sweep_stale(&self, stale_after_secs: i64) -> sqlx::Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            UPDATE host SET status = 'offline'
            WHERE status = 'online'
              AND (last_heartbeat IS NULL
                   OR last_heartbeat < now() - make_interval(secs => $1))
            RETURNING id
            "#,
        )
        .bind(stale_after_secs as f64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
