//! Agent selection.
//!
//! Ranking is a pure function over candidate snapshots so it stays testable:
//! fresh -> not excluded -> capable -> has capacity -> affinity -> least
//! loaded. The lab-level wrapper prefers the agent already hosting most of
//! the lab's placements so a restart does not spray nodes across the fleet.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::features::hosts::repo::{HostRow, HEARTBEAT_FRESH_SECS};
use crate::AppState;

#[derive(Debug, Clone)]
pub struct Candidate {
    pub agent_id: String,
    pub providers: Vec<String>,
    pub max_jobs: i64,
    pub active_jobs: i64,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub online: bool,
}

impl Candidate {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.online
            && self
                .last_heartbeat
                .is_some_and(|seen| now - seen < chrono::Duration::seconds(HEARTBEAT_FRESH_SECS))
    }

    fn load(&self) -> f64 {
        if self.max_jobs <= 0 {
            f64::INFINITY
        } else {
            self.active_jobs as f64 / self.max_jobs as f64
        }
    }
}

pub fn select<'a>(
    candidates: &'a [Candidate],
    required_provider: Option<&str>,
    prefer_agent_id: Option<&str>,
    exclude_agents: &[String],
    now: DateTime<Utc>,
) -> Option<&'a Candidate> {
    let mut eligible: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| c.is_fresh(now))
        .filter(|c| !exclude_agents.contains(&c.agent_id))
        .filter(|c| {
            required_provider
                .map(|provider| c.providers.iter().any(|p| p == provider))
                .unwrap_or(true)
        })
        .filter(|c| c.active_jobs < c.max_jobs)
        .collect();

    if eligible.is_empty() {
        return None;
    }

    if let Some(preferred) = prefer_agent_id {
        if let Some(candidate) = eligible.iter().find(|c| c.agent_id == preferred) {
            debug!(agent_id = %preferred, "using preferred agent (affinity)");
            return Some(candidate);
        }
    }

    eligible.sort_by(|a, b| {
        a.load()
            .partial_cmp(&b.load())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.agent_id.cmp(&b.agent_id))
    });
    eligible.first().copied()
}

async fn load_candidates(st: &AppState) -> sqlx::Result<Vec<Candidate>> {
    let hosts = st.hosts.list_all().await?;
    let mut candidates = Vec::with_capacity(hosts.len());
    for host in hosts {
        let active_jobs = st.jobs.count_active(&host.id).await?;
        candidates.push(candidate_from_row(&host, active_jobs));
    }
    Ok(candidates)
}

pub fn candidate_from_row(host: &HostRow, active_jobs: i64) -> Candidate {
    Candidate {
        agent_id: host.id.clone(),
        providers: host.providers(),
        max_jobs: host.max_concurrent_jobs(),
        active_jobs,
        last_heartbeat: host.last_heartbeat,
        online: host.status == "online",
    }
}

/// Pick a healthy agent for a job.
pub async fn healthy_agent(
    st: &AppState,
    required_provider: Option<&str>,
    prefer_agent_id: Option<&str>,
    exclude_agents: &[String],
) -> sqlx::Result<Option<HostRow>> {
    let candidates = load_candidates(st).await?;
    let Some(chosen) = select(
        &candidates,
        required_provider,
        prefer_agent_id,
        exclude_agents,
        Utc::now(),
    ) else {
        return Ok(None);
    };
    let host = st.hosts.get(&chosen.agent_id).await?;
    Ok(Some(host))
}

/// Agent preference for a lab: the agent holding most of the lab's current
/// placements, falling back to the lab's last-known agent.
pub async fn agent_for_lab(
    st: &AppState,
    lab_id: &str,
    required_provider: Option<&str>,
) -> sqlx::Result<Option<HostRow>> {
    let placements = st.topology.placements(lab_id).await?;
    let mut counts: HashMap<String, usize> = HashMap::new();
    for placement in &placements {
        *counts.entry(placement.host_id.clone()).or_default() += 1;
    }

    let preferred = counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(host_id, _)| host_id);

    let preferred = match preferred {
        Some(host_id) => Some(host_id),
        None => st.labs.get(lab_id).await?.agent_id,
    };

    healthy_agent(st, required_provider, preferred.as_deref(), &[]).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, active: i64, max: i64, fresh: bool) -> Candidate {
        Candidate {
            agent_id: id.to_string(),
            providers: vec!["docker".to_string()],
            max_jobs: max,
            active_jobs: active,
            last_heartbeat: if fresh {
                Some(Utc::now())
            } else {
                Some(Utc::now() - chrono::Duration::seconds(120))
            },
            online: true,
        }
    }

    #[test]
    fn stale_agents_are_filtered() {
        let candidates = vec![candidate("a", 0, 4, false)];
        assert!(select(&candidates, Some("docker"), None, &[], Utc::now()).is_none());
    }

    #[test]
    fn incapable_agents_are_filtered() {
        let mut libvirt_only = candidate("a", 0, 4, true);
        libvirt_only.providers = vec!["libvirt".to_string()];
        let candidates = vec![libvirt_only];
        assert!(select(&candidates, Some("docker"), None, &[], Utc::now()).is_none());
    }

    #[test]
    fn full_agents_are_filtered() {
        let candidates = vec![candidate("a", 4, 4, true), candidate("b", 1, 4, true)];
        let chosen = select(&candidates, Some("docker"), None, &[], Utc::now()).unwrap();
        assert_eq!(chosen.agent_id, "b");
    }

    #[test]
    fn affinity_wins_when_candidate_is_eligible() {
        let candidates = vec![candidate("a", 3, 4, true), candidate("b", 0, 4, true)];
        let chosen = select(&candidates, Some("docker"), Some("a"), &[], Utc::now()).unwrap();
        assert_eq!(chosen.agent_id, "a");
    }

    #[test]
    fn affinity_falls_back_when_preferred_is_full() {
        let candidates = vec![candidate("a", 4, 4, true), candidate("b", 2, 4, true)];
        let chosen = select(&candidates, Some("docker"), Some("a"), &[], Utc::now()).unwrap();
        assert_eq!(chosen.agent_id, "b");
    }

    #[test]
    fn least_loaded_wins_otherwise() {
        let candidates = vec![
            candidate("a", 3, 4, true),
            candidate("b", 1, 8, true),
            candidate("c", 2, 4, true),
        ];
        let chosen = select(&candidates, Some("docker"), None, &[], Utc::now()).unwrap();
        assert_eq!(chosen.agent_id, "b");
    }

    #[test]
    fn excluded_agents_are_skipped() {
        let candidates = vec![candidate("a", 0, 4, true), candidate("b", 1, 4, true)];
        let chosen = select(
            &candidates,
            Some("docker"),
            None,
            &["a".to_string()],
            Utc::now(),
        )
        .unwrap();
        assert_eq!(chosen.agent_id, "b");
    }
}
