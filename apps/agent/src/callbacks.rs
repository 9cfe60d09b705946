//! Callback delivery with retry and a dead-letter queue.
//!
//! Async jobs answer 202 up front and report their outcome by POSTing a
//! `CallbackPayload` to the caller's callback URL. Delivery retries with
//! backoff; when every attempt fails the payload lands in an in-memory
//! dead-letter queue (24 h TTL) and one best-effort POST goes to the
//! dead-letter endpoint so the controller can mark the job failed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use trellis_types::{CallbackPayload, JobStatus};

pub const DEAD_LETTER_TTL: Duration = Duration::from_secs(86_400);

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub job_id: String,
    pub callback_url: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

pub struct CallbackClient {
    http: reqwest::Client,
    retry_delays: Vec<Duration>,
    request_timeout: Duration,
    dead_letters: Mutex<Vec<DeadLetter>>,
}

impl CallbackClient {
    pub fn new(retry_delays: Vec<Duration>, request_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            retry_delays,
            request_timeout,
            dead_letters: Mutex::new(Vec::new()),
        }
    }

    /// Deliver a payload, retrying through the configured delays. Returns
    /// whether any attempt got a 2xx back; on exhaustion the payload is
    /// recorded as a dead letter.
    pub async fn deliver(&self, callback_url: &str, payload: &CallbackPayload) -> bool {
        let attempts = self.retry_delays.len() + 1;

        for attempt in 0..attempts {
            match self.try_deliver(callback_url, payload).await {
                Ok(()) => {
                    info!(job_id = %payload.job_id, attempt = attempt + 1, "callback delivered");
                    return true;
                }
                Err(err) => {
                    warn!(
                        job_id = %payload.job_id,
                        attempt = attempt + 1,
                        error = %err,
                        "callback delivery failed"
                    );
                }
            }
            if attempt < self.retry_delays.len() {
                let delay = self.retry_delays[attempt];
                info!(job_id = %payload.job_id, delay_secs = delay.as_secs(), "retrying callback");
                tokio::time::sleep(delay).await;
            }
        }

        error!(
            job_id = %payload.job_id,
            attempts,
            "callback delivery exhausted all attempts, dead-lettering"
        );
        self.send_to_dead_letter(callback_url, payload).await;
        false
    }

    async fn try_deliver(&self, callback_url: &str, payload: &CallbackPayload) -> Result<(), String> {
        let response = self
            .http
            .post(callback_url)
            .timeout(self.request_timeout)
            .json(payload)
            .send()
            .await
            .map_err(|err| err.to_string())?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            Err(format!("HTTP {status}: {snippet}"))
        }
    }

    /// Record a dead letter and make one best-effort POST to the dead-letter
    /// endpoint derived from the callback URL
    /// (`…/callbacks/job/<id>` -> `…/callbacks/dead-letter/<id>`).
    async fn send_to_dead_letter(&self, callback_url: &str, payload: &CallbackPayload) {
        {
            let mut letters = self.dead_letters.lock().await;
            prune_expired(&mut letters, Utc::now());
            letters.push(DeadLetter {
                job_id: payload.job_id.clone(),
                callback_url: callback_url.to_string(),
                status: payload.status,
                attempts: self.retry_delays.len() as u32 + 1,
                created_at: Utc::now(),
            });
        }

        if let Some(dead_letter_url) = dead_letter_url(callback_url, &payload.job_id) {
            match self
                .http
                .post(&dead_letter_url)
                .timeout(Duration::from_secs(10))
                .json(payload)
                .send()
                .await
            {
                Ok(_) => info!(job_id = %payload.job_id, "dead-letter notification sent"),
                Err(err) => {
                    error!(job_id = %payload.job_id, error = %err, "dead-letter notification failed")
                }
            }
        }
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        let mut letters = self.dead_letters.lock().await;
        prune_expired(&mut letters, Utc::now());
        letters.clone()
    }

    /// Advisory progress heartbeat for a long job. Failures are logged and
    /// ignored.
    pub async fn send_heartbeat(&self, callback_url: &str, job_id: &str) -> bool {
        let url = format!("{callback_url}/heartbeat");
        match self
            .http
            .post(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                debug!(job_id = %job_id, "job heartbeat sent");
                true
            }
            Ok(response) => {
                warn!(job_id = %job_id, status = %response.status(), "job heartbeat rejected");
                false
            }
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "job heartbeat failed");
                false
            }
        }
    }
}

fn prune_expired(letters: &mut Vec<DeadLetter>, now: DateTime<Utc>) {
    let ttl = chrono::Duration::from_std(DEAD_LETTER_TTL).unwrap_or(chrono::Duration::hours(24));
    letters.retain(|letter| now - letter.created_at < ttl);
}

/// `http://host/callbacks/job/<id>` -> `http://host/callbacks/dead-letter/<id>`.
fn dead_letter_url(callback_url: &str, job_id: &str) -> Option<String> {
    let (base, _) = callback_url.rsplit_once('/')?;
    let base = base.strip_suffix("/job").unwrap_or(base);
    Some(format!("{base}/dead-letter/{job_id}"))
}

/// Ticker that POSTs `<callback_url>/heartbeat` every `interval` for the
/// lifetime of the returned guard.
pub struct HeartbeatSender {
    handle: tokio::task::JoinHandle<()>,
}

impl HeartbeatSender {
    pub fn start(
        client: Arc<CallbackClient>,
        callback_url: String,
        job_id: String,
        interval: Duration,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // skip the immediate tick
            loop {
                ticker.tick().await;
                client.send_heartbeat(&callback_url, &job_id).await;
            }
        });
        Self { handle }
    }
}

impl Drop for HeartbeatSender {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn payload(job_id: &str) -> CallbackPayload {
        CallbackPayload {
            job_id: job_id.to_string(),
            agent_id: "agent-test".to_string(),
            status: JobStatus::Completed,
            stdout: String::new(),
            stderr: String::new(),
            error_message: None,
            node_states: None,
            started_at: None,
            completed_at: Some(Utc::now()),
        }
    }

    fn fast_client() -> CallbackClient {
        CallbackClient::new(
            vec![Duration::from_millis(10), Duration::from_millis(10)],
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn delivers_on_first_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/callbacks/job/j1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = fast_client();
        let url = format!("{}/callbacks/job/j1", server.uri());
        assert!(client.deliver(&url, &payload("j1")).await);
        assert!(client.dead_letters().await.is_empty());
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/callbacks/job/j2"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/callbacks/job/j2"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = fast_client();
        let url = format!("{}/callbacks/job/j2", server.uri());
        assert!(client.deliver(&url, &payload("j2")).await);
    }

    #[tokio::test]
    async fn exhaustion_records_dead_letter_and_notifies() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/callbacks/job/j3"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/callbacks/dead-letter/j3"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = fast_client();
        let url = format!("{}/callbacks/job/j3", server.uri());
        assert!(!client.deliver(&url, &payload("j3")).await);

        let letters = client.dead_letters().await;
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].job_id, "j3");
        // retries + the initial attempt
        assert_eq!(letters[0].attempts, 3);
    }

    #[tokio::test]
    async fn dead_letters_expire() {
        let client = fast_client();
        {
            let mut letters = client.dead_letters.lock().await;
            letters.push(DeadLetter {
                job_id: "old".into(),
                callback_url: "http://example.invalid".into(),
                status: JobStatus::Failed,
                attempts: 4,
                created_at: Utc::now() - chrono::Duration::hours(25),
            });
        }
        assert!(client.dead_letters().await.is_empty());
    }

    #[test]
    fn dead_letter_url_rewrites_job_segment() {
        assert_eq!(
            dead_letter_url("http://ctl:8000/callbacks/job/abc", "abc").as_deref(),
            Some("http://ctl:8000/callbacks/dead-letter/abc")
        );
    }
}
