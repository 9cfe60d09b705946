mod config;
mod core;
mod features;

use sqlx::PgPool;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::ControllerConfig;
use crate::core::agent_client::{AgentClient, RetryPolicy};
use crate::features::hosts::repo::HostRepository;
use crate::features::jobs::repo::JobRepository;
use crate::features::labs::repo::LabRepository;
use crate::features::topology::repo::TopologyRepository;

#[derive(Clone)]
pub struct AppState {
    pub cfg: ControllerConfig,
    pub db: PgPool,
    pub hosts: HostRepository,
    pub labs: LabRepository,
    pub jobs: JobRepository,
    pub topology: TopologyRepository,
    pub agent_client: AgentClient,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cfg = ControllerConfig::from_env()?;
    init_tracing(&cfg);

    let db = PgPool::connect(&cfg.database_url).await?;
    sqlx::migrate!("./migrations").run(&db).await?;

    let agent_client = AgentClient::new(
        cfg.agent_deploy_timeout,
        cfg.agent_destroy_timeout,
        RetryPolicy {
            max_retries: cfg.agent_max_retries,
            ..RetryPolicy::default()
        },
    );

    let state = AppState {
        cfg: cfg.clone(),
        db: db.clone(),
        hosts: HostRepository::new(db.clone()),
        labs: LabRepository::new(db.clone()),
        jobs: JobRepository::new(db.clone()),
        topology: TopologyRepository::new(db),
        agent_client,
    };

    let _reconciler = features::reconciler::spawn(state.clone());

    let app = features::router(state);
    info!(bind = %cfg.bind, "controller listening");
    let listener = tokio::net::TcpListener::bind(&cfg.bind).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

fn init_tracing(cfg: &ControllerConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("warn,controller={},sqlx=warn", cfg.log_level))
    });
    if cfg.log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
