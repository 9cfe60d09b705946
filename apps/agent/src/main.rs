mod callbacks;
mod config;
mod core;
mod features;
mod locks;
mod network;
mod provider;
mod registration;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use bollard::Docker;
use tokio::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use trellis_types::LinkInfo;

use crate::callbacks::CallbackClient;
use crate::config::AgentConfig;
use crate::locks::DeployLockManager;
use crate::network::overlay::OverlayManager;
use crate::network::plugin::{self, DockerOvsPlugin, PluginSettings};
use crate::provider::docker::DockerProvider;
use crate::registration::Registration;

#[derive(Clone)]
pub struct AppState {
    pub cfg: AgentConfig,
    pub docker: Docker,
    pub plugin: Arc<DockerOvsPlugin>,
    pub provider: Arc<DockerProvider>,
    pub overlay: Arc<OverlayManager>,
    pub locks: Arc<DeployLockManager>,
    pub callbacks: Arc<CallbackClient>,
    pub registration: Arc<Registration>,
    /// Links created through the hot-connect API, by canonical link id.
    pub links: Arc<Mutex<HashMap<String, LinkInfo>>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cfg = AgentConfig::from_env();
    init_tracing(&cfg);

    info!(agent_id = %cfg.agent_id, controller = %cfg.controller_url, "agent starting");
    info!(
        docker = cfg.enable_docker,
        libvirt = cfg.enable_libvirt,
        libvirt_uri = %cfg.libvirt_uri,
        qcow2_store = ?cfg.qcow2_store_path,
        ovs = cfg.enable_ovs,
        ovs_plugin = cfg.enable_ovs_plugin,
        vxlan = cfg.enable_vxlan,
        lock_stuck_threshold_secs = cfg.lock_stuck_threshold.as_secs(),
        "provider configuration"
    );

    tokio::fs::create_dir_all(&cfg.workspace_path)
        .await
        .with_context(|| format!("creating workspace {}", cfg.workspace_path.display()))?;

    let docker = Docker::connect_with_local_defaults().context("connecting to docker daemon")?;

    let plugin = Arc::new(DockerOvsPlugin::new(
        PluginSettings::from_config(&cfg),
        docker.clone(),
        &cfg.workspace_path,
    ));

    if cfg.enable_ovs && cfg.enable_ovs_plugin {
        if plugin.ovs().available().await {
            plugin.initialize().await?;
            plugin::serve_plugin(
                Arc::clone(&plugin),
                &plugin::default_socket_path(),
                &plugin::default_spec_path(),
            )
            .await?;
            plugin.spawn_ttl_cleanup();
        } else {
            warn!("ovs-vsctl not available, OVS plugin disabled");
        }
    }

    let overlay = Arc::new(OverlayManager::new(
        docker.clone(),
        cfg.vxlan_vni_base,
        cfg.vxlan_vni_max,
    ));

    let locks = Arc::new(DeployLockManager::new(
        &cfg.redis_url,
        &cfg.agent_id,
        cfg.lock_ttl,
        cfg.lock_extend_interval,
    )?);
    // Locks we held before a crash belong to no running job anymore.
    match locks.clear_own_locks().await {
        Ok(cleared) if !cleared.is_empty() => {
            info!(count = cleared.len(), "cleared orphaned deploy locks")
        }
        Ok(_) => {}
        Err(err) => warn!(error = %err, "orphan lock sweep failed (redis unreachable?)"),
    }

    let callbacks = Arc::new(CallbackClient::new(
        cfg.callback_retry_delays.clone(),
        cfg.callback_timeout,
    ));

    let provider = Arc::new(DockerProvider::new(
        docker.clone(),
        Arc::clone(&plugin),
        &cfg,
    ));

    let registration = Arc::new(Registration::new(cfg.clone()));
    registration.spawn_loop();

    let state = AppState {
        cfg: cfg.clone(),
        docker,
        plugin,
        provider,
        overlay,
        locks,
        callbacks,
        registration,
        links: Arc::new(Mutex::new(HashMap::new())),
    };

    let app = features::router(state);
    let bind = format!("{}:{}", cfg.agent_host, cfg.agent_port);
    info!(%bind, "agent listening");
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

fn init_tracing(cfg: &AgentConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,agent={}", cfg.log_level)));
    if cfg.log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
