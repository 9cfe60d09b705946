//! Deploy / destroy / node-action execution.
//!
//! Every mutation runs under the lab's Redis deploy lock. Two modes:
//! sync (hold the caller until the job finishes) and callback (answer 202
//! `accepted`, run in the background, POST the outcome to the callback URL
//! with lock-TTL extension and advisory job heartbeats along the way).

use std::collections::HashMap;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::post;
use axum::{Extension, Json, Router};
use chrono::Utc;
use tracing::{error, info};
use trellis_types::{
    CallbackPayload, DeployRequest, DestroyRequest, JobResult, JobStatus, NodeAction,
    NodeActionRequest, NodeStatus, Provider,
};

use crate::callbacks::HeartbeatSender;
use crate::locks::LockError;
use crate::AppState;

pub fn router() -> Router {
    Router::new()
        .route("/jobs/deploy", post(deploy))
        .route("/jobs/destroy", post(destroy))
        .route("/jobs/node-action", post(node_action))
}

struct JobOutcome {
    success: bool,
    stdout: String,
    stderr: String,
    error: Option<String>,
    node_states: Option<HashMap<String, NodeStatus>>,
}

enum JobKind {
    Deploy { topology_yaml: String },
    Destroy,
    NodeAction { node_name: String, action: NodeAction },
}

impl JobKind {
    fn label(&self) -> &'static str {
        match self {
            JobKind::Deploy { .. } => "deploy",
            JobKind::Destroy => "destroy",
            JobKind::NodeAction { .. } => "node-action",
        }
    }
}

fn reject_provider(provider: Provider) -> Option<(StatusCode, String)> {
    match provider {
        Provider::Docker => None,
        Provider::Containerlab => Some((
            StatusCode::BAD_REQUEST,
            "the containerlab provider is no longer supported".to_string(),
        )),
        Provider::Libvirt => Some((
            StatusCode::BAD_REQUEST,
            "this agent does not execute libvirt jobs".to_string(),
        )),
    }
}

async fn deploy(
    Extension(st): Extension<AppState>,
    Json(req): Json<DeployRequest>,
) -> Result<(StatusCode, Json<JobResult>), (StatusCode, String)> {
    if let Some(reject) = reject_provider(req.provider) {
        return Err(reject);
    }
    info!(lab_id = %req.lab_id, job_id = %req.job_id, "deploy request");
    run_or_accept(
        st,
        req.job_id,
        req.lab_id,
        JobKind::Deploy {
            topology_yaml: req.topology_yaml,
        },
        req.callback_url,
    )
    .await
}

async fn destroy(
    Extension(st): Extension<AppState>,
    Json(req): Json<DestroyRequest>,
) -> Result<(StatusCode, Json<JobResult>), (StatusCode, String)> {
    if let Some(reject) = reject_provider(req.provider) {
        return Err(reject);
    }
    info!(lab_id = %req.lab_id, job_id = %req.job_id, "destroy request");
    run_or_accept(st, req.job_id, req.lab_id, JobKind::Destroy, req.callback_url).await
}

async fn node_action(
    Extension(st): Extension<AppState>,
    Json(req): Json<NodeActionRequest>,
) -> Result<(StatusCode, Json<JobResult>), (StatusCode, String)> {
    info!(
        lab_id = %req.lab_id,
        node = %req.log_name(),
        action = ?req.action,
        "node action request"
    );
    run_or_accept(
        st,
        req.job_id,
        req.lab_id,
        JobKind::NodeAction {
            node_name: req.node_name,
            action: req.action,
        },
        None,
    )
    .await
}

async fn run_or_accept(
    st: AppState,
    job_id: String,
    lab_id: String,
    kind: JobKind,
    callback_url: Option<String>,
) -> Result<(StatusCode, Json<JobResult>), (StatusCode, String)> {
    match callback_url {
        Some(callback_url) => {
            // Callback mode: take the job, answer immediately, report later.
            let accepted = JobResult {
                job_id: job_id.clone(),
                status: JobStatus::Accepted,
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                error_message: None,
                completed_at: Utc::now(),
            };
            tokio::spawn(run_with_callback(st, job_id, lab_id, kind, callback_url));
            Ok((StatusCode::ACCEPTED, Json(accepted)))
        }
        None => {
            // Deploys outlive the lock TTL, so even sync jobs extend it.
            let guard = match st
                .locks
                .acquire_with_heartbeat(&lab_id, st.cfg.lock_acquire_timeout)
                .await
            {
                Ok(guard) => guard,
                Err(LockError::AcquisitionTimeout { .. }) => {
                    return Err((
                        StatusCode::SERVICE_UNAVAILABLE,
                        format!("deploy already in progress for lab {lab_id}"),
                    ))
                }
                Err(err) => {
                    return Err((StatusCode::INTERNAL_SERVER_ERROR, err.to_string()));
                }
            };

            st.registration.job_started();
            let outcome = execute(&st, &lab_id, &kind).await;
            st.registration.job_finished();
            guard.release().await;

            let result = JobResult {
                job_id,
                status: if outcome.success {
                    JobStatus::Completed
                } else {
                    JobStatus::Failed
                },
                exit_code: if outcome.success { 0 } else { 1 },
                stdout: outcome.stdout,
                stderr: outcome.stderr,
                error_message: outcome.error,
                completed_at: Utc::now(),
            };
            Ok((StatusCode::OK, Json(result)))
        }
    }
}

async fn run_with_callback(
    st: AppState,
    job_id: String,
    lab_id: String,
    kind: JobKind,
    callback_url: String,
) {
    let started_at = Utc::now();

    let mut payload = CallbackPayload {
        job_id: job_id.clone(),
        agent_id: st.cfg.agent_id.clone(),
        status: JobStatus::Failed,
        stdout: String::new(),
        stderr: String::new(),
        error_message: None,
        node_states: None,
        started_at: Some(started_at),
        completed_at: None,
    };

    let guard = match st
        .locks
        .acquire_with_heartbeat(&lab_id, st.cfg.lock_acquire_timeout)
        .await
    {
        Ok(guard) => guard,
        Err(err) => {
            error!(lab_id = %lab_id, job_id = %job_id, error = %err, "lock acquisition failed");
            payload.error_message = Some(err.to_string());
            payload.completed_at = Some(Utc::now());
            st.callbacks.deliver(&callback_url, &payload).await;
            return;
        }
    };

    // Long jobs prove liveness to the controller while they run.
    let _heartbeat = HeartbeatSender::start(
        st.callbacks.clone(),
        callback_url.clone(),
        job_id.clone(),
        st.cfg.lock_extend_interval,
    );

    st.registration.job_started();
    let outcome = execute(&st, &lab_id, &kind).await;
    st.registration.job_finished();
    guard.release().await;

    payload.status = if outcome.success {
        JobStatus::Completed
    } else {
        JobStatus::Failed
    };
    payload.stdout = outcome.stdout;
    payload.stderr = outcome.stderr;
    payload.error_message = outcome.error;
    payload.node_states = outcome.node_states;
    payload.completed_at = Some(Utc::now());

    st.callbacks.deliver(&callback_url, &payload).await;
}

/// Run the job body under its whole-job timeout.
async fn execute(st: &AppState, lab_id: &str, kind: &JobKind) -> JobOutcome {
    let timeout = match kind {
        JobKind::Deploy { .. } => st.cfg.deploy_timeout,
        JobKind::Destroy => st.cfg.destroy_timeout,
        JobKind::NodeAction { .. } => Duration::from_secs(120),
    };

    match tokio::time::timeout(timeout, execute_inner(st, lab_id, kind)).await {
        Ok(outcome) => outcome,
        Err(_) => JobOutcome {
            success: false,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(format!(
                "{} timed out after {}s",
                kind.label(),
                timeout.as_secs()
            )),
            node_states: None,
        },
    }
}

async fn execute_inner(st: &AppState, lab_id: &str, kind: &JobKind) -> JobOutcome {
    let workspace = st.cfg.lab_workspace(lab_id);

    match kind {
        JobKind::Deploy { topology_yaml } => {
            if let Err(err) = tokio::fs::create_dir_all(&workspace).await {
                return JobOutcome {
                    success: false,
                    stdout: String::new(),
                    stderr: String::new(),
                    error: Some(format!("could not create workspace: {err}")),
                    node_states: None,
                };
            }
            let outcome = st.provider.deploy(lab_id, topology_yaml, &workspace).await;
            JobOutcome {
                success: outcome.success,
                node_states: Some(outcome.node_states()),
                stdout: outcome.stdout,
                stderr: outcome.stderr,
                error: outcome.error,
            }
        }
        JobKind::Destroy => {
            // Overlay first so VXLAN interfaces do not outlive the lab.
            let _ = st.overlay.cleanup_lab(lab_id).await;
            let outcome = st.provider.destroy(lab_id, &workspace).await;
            JobOutcome {
                success: outcome.success,
                stdout: outcome.stdout,
                stderr: outcome.stderr,
                error: outcome.error,
                node_states: None,
            }
        }
        JobKind::NodeAction { node_name, action } => {
            let outcome = match action {
                NodeAction::Start => st.provider.start_node(lab_id, node_name).await,
                NodeAction::Stop => st.provider.stop_node(lab_id, node_name, &workspace).await,
            };
            let node_states = outcome
                .new_status
                .map(|status| HashMap::from([(outcome.node_name.clone(), status)]));
            JobOutcome {
                success: outcome.success,
                stdout: outcome.stdout,
                stderr: String::new(),
                error: outcome.error,
                node_states,
            }
        }
    }
}
