use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct NodeRow {
    pub id: String,
    pub lab_id: String,
    pub container_name: String,
    pub display_name: Option<String>,
    pub kind: String,
    pub image: Option<String>,
    pub host_id: Option<String>,
    pub connection_type: Option<String>,
    pub parent_interface: Option<String>,
    pub vlan_id: Option<i32>,
    pub bridge_name: Option<String>,
    pub config_json: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct LinkRow {
    pub id: String,
    pub lab_id: String,
    pub link_name: String,
    pub source_node_id: String,
    pub source_interface: String,
    pub target_node_id: String,
    pub target_interface: String,
    pub mtu: Option<i32>,
    pub bandwidth: Option<i64>,
    pub config_json: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PlacementRow {
    pub lab_id: String,
    pub node_name: String,
    pub host_id: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct LabRow {
    pub id: String,
    pub name: String,
    pub owner: String,
    pub workspace_path: Option<String>,
    pub agent_id: Option<String>,
    pub state: String,
    pub state_updated_at: DateTime<Utc>,
    pub state_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct TopologyRepository {
    pool: PgPool,
}

impl TopologyRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn nodes(&self, lab_id: &str) -> sqlx::Result<Vec<NodeRow>> {
        sqlx::query_as::<_, NodeRow>(
            r#"SELECT * FROM node WHERE lab_id = $1 ORDER BY container_name"#,
        )
        .bind(lab_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn links(&self, lab_id: &str) -> sqlx::Result<Vec<LinkRow>> {
        sqlx::query_as::<_, LinkRow>(r#"SELECT * FROM link WHERE lab_id = $1 ORDER BY link_name"#)
            .bind(lab_id)
            .fetch_all(&self.pool)
            .await
    }

    pub async fn placements(&self, lab_id: &str) -> sqlx::Result<Vec<PlacementRow>> {
        sqlx::query_as::<_, PlacementRow>(
            r#"SELECT * FROM node_placement WHERE lab_id = $1 ORDER BY node_name"#,
        )
        .bind(lab_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn record_placement(
        &self,
        lab_id: &str,
        node_name: &str,
        host_id: &str,
    ) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO node_placement (lab_id, node_name, host_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (lab_id, node_name) DO UPDATE SET host_id = EXCLUDED.host_id
            "#,
        )
        .bind(lab_id)
        .bind(node_name)
        .bind(host_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear_placements(&self, lab_id: &str) -> sqlx::Result<()> {
        sqlx::query(r#"DELETE FROM node_placement WHERE lab_id = $1"#)
            .bind(lab_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
