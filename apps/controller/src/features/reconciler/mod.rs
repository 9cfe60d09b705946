//! Background reconciliation.
//!
//! Each tick: flip stale agents offline (their labs become `unknown`, since
//! nobody knows ground truth anymore), diff every fresh agent's discovered
//! labs against the database, push orphan cleanup with the valid-lab set,
//! and sweep old terminal jobs.

use std::collections::HashSet;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::AppState;

const INTERVAL_SECS: u64 = 30;
const AGENT_STALE_SECS: i64 = 120;
const JOB_RETENTION_SECS: i64 = 7 * 24 * 3600;

pub fn spawn(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(INTERVAL_SECS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = reconcile_once(&state).await {
                error!(error = ?err, "reconciler iteration failed");
            }
        }
    })
}

async fn reconcile_once(state: &AppState) -> anyhow::Result<()> {
    // Agents that stopped heartbeating take their labs' ground truth with
    // them.
    let stale = state.hosts.sweep_stale(AGENT_STALE_SECS).await?;
    for agent_id in &stale {
        warn!(agent_id = %agent_id, "agent marked offline (stale heartbeat)");
        for lab in state.labs.labs_on_agent(agent_id).await? {
            if lab.state == "running" || lab.state == "starting" {
                info!(lab_id = %lab.id, "lab state unknown: agent went offline");
                state
                    .labs
                    .set_state(&lab.id, "unknown", Some("agent unreachable"))
                    .await?;
            }
        }
    }

    let valid_lab_ids = state.labs.list_ids().await?;
    let valid_set: HashSet<&str> = valid_lab_ids.iter().map(String::as_str).collect();

    for host in state.hosts.list_fresh().await? {
        let discovered = match state.agent_client.discover_labs(&host.address).await {
            Ok(response) => response,
            Err(err) => {
                warn!(agent_id = %host.id, error = %err, "discover-labs failed");
                continue;
            }
        };

        // Labs the DB says run on this agent but the agent no longer has.
        let discovered_ids: HashSet<&str> = discovered
            .labs
            .iter()
            .map(|lab| lab.lab_id.as_str())
            .collect();
        for lab in state.labs.labs_on_agent(&host.id).await? {
            if lab.state == "running" && !discovered_ids.contains(lab.id.as_str()) {
                info!(lab_id = %lab.id, agent_id = %host.id, "running lab missing on agent");
                state
                    .labs
                    .set_state(&lab.id, "unknown", Some("containers not found on agent"))
                    .await?;
            }
        }

        // Labs the agent has that the DB has never heard of.
        let orphans: Vec<&str> = discovered
            .labs
            .iter()
            .map(|lab| lab.lab_id.as_str())
            .filter(|lab_id| !valid_set.contains(lab_id))
            .collect();
        if !orphans.is_empty() {
            info!(agent_id = %host.id, orphans = ?orphans, "requesting orphan cleanup");
            match state
                .agent_client
                .cleanup_orphans(&host.address, valid_lab_ids.clone())
                .await
            {
                Ok(response) if !response.removed_containers.is_empty() => {
                    info!(
                        agent_id = %host.id,
                        removed = response.removed_containers.len(),
                        "orphan containers removed"
                    );
                }
                Ok(_) => {}
                Err(err) => warn!(agent_id = %host.id, error = %err, "orphan cleanup failed"),
            }
        } else {
            debug!(agent_id = %host.id, labs = discovered.labs.len(), "agent in sync");
        }
    }

    let swept = state.jobs.sweep_old(JOB_RETENTION_SECS).await?;
    if swept > 0 {
        debug!(count = swept, "swept old terminal jobs");
    }

    Ok(())
}
