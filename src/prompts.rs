//! Pending password requests.
//!
//! When the interposer surfaces a prompt it cannot answer and interactive
//! mode is on, the command loop parks a request here and waits on a oneshot
//! channel. The agent resolves it through the `ssh_provide_password` and
//! `ssh_cancel_password_request` tools. Unanswered requests expire after a
//! fixed TTL, swept by a background tick.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info};

use crate::ssh::interposer::PromptKind;

/// A pending, externally resolvable request for a secret
#[derive(Debug, Clone, Serialize)]
pub struct PromptRequest {
    pub request_id: String,
    pub session_id: String,
    pub prompt_text: String,
    pub prompt_kind: PromptKind,
    pub created_at_unix: u64,
    pub expires_in_secs: u64,
}

struct PendingEntry {
    request: PromptRequest,
    tx: oneshot::Sender<Option<String>>,
    expires_at: Instant,
}

/// Process-wide table of pending prompt requests
pub struct PendingPrompts {
    inner: Mutex<HashMap<String, PendingEntry>>,
    ttl: Duration,
}

impl PendingPrompts {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Park a new request. The returned receiver yields `Some(password)` when
    /// the agent answers, `None` when it cancels; it errors when the entry is
    /// swept without an answer.
    pub async fn register(
        &self,
        session_id: String,
        kind: PromptKind,
        prompt_text: String,
    ) -> (String, oneshot::Receiver<Option<String>>) {
        let request_id = generate_request_id();
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();

        let request = PromptRequest {
            request_id: request_id.clone(),
            session_id,
            prompt_text,
            prompt_kind: kind,
            created_at_unix: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            expires_in_secs: self.ttl.as_secs(),
        };

        let mut inner = self.inner.lock().await;
        inner.insert(
            request_id.clone(),
            PendingEntry {
                request,
                tx,
                expires_at: now + self.ttl,
            },
        );
        debug!("Registered password request {}", request_id);

        (request_id, rx)
    }

    /// Answer a pending request. Returns false for unknown ids.
    pub async fn provide(&self, request_id: &str, password: String) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.remove(request_id) {
            Some(entry) => {
                let delivered = entry.tx.send(Some(password)).is_ok();
                info!("Password request {} answered", request_id);
                delivered
            }
            None => false,
        }
    }

    /// Cancel a pending request. Returns false for unknown ids.
    pub async fn cancel(&self, request_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.remove(request_id) {
            Some(entry) => {
                let _ = entry.tx.send(None);
                info!("Password request {} cancelled", request_id);
                true
            }
            None => false,
        }
    }

    /// Snapshot of pending requests, with remaining TTLs
    pub async fn list(&self) -> Vec<PromptRequest> {
        let now = Instant::now();
        let inner = self.inner.lock().await;
        let mut requests: Vec<PromptRequest> = inner
            .values()
            .map(|entry| {
                let mut req = entry.request.clone();
                req.expires_in_secs = entry.expires_at.saturating_duration_since(now).as_secs();
                req
            })
            .collect();
        requests.sort_by(|a, b| a.created_at_unix.cmp(&b.created_at_unix));
        requests
    }

    /// Drop entries past their deadline. Dropping the sender wakes the
    /// waiting command loop with a receive error, which it reports as
    /// `PasswordRequired`.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let before = inner.len();
        inner.retain(|_, entry| entry.expires_at > now);
        let removed = before - inner.len();
        if removed > 0 {
            info!("Swept {} expired password request(s)", removed);
        }
        removed
    }

    pub async fn count(&self) -> usize {
        self.inner.lock().await.len()
    }
}

fn generate_request_id() -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PendingPrompts {
        PendingPrompts::new(Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_register_and_provide() {
        let prompts = table();
        let (id, rx) = prompts
            .register("sess1".into(), PromptKind::Sudo, "[sudo] password:".into())
            .await;
        assert_eq!(prompts.count().await, 1);

        assert!(prompts.provide(&id, "s3cret".into()).await);
        assert_eq!(rx.await.unwrap(), Some("s3cret".to_string()));
        assert_eq!(prompts.count().await, 0);
    }

    #[tokio::test]
    async fn test_cancel_delivers_none() {
        let prompts = table();
        let (id, rx) = prompts
            .register("sess1".into(), PromptKind::Generic, "Password:".into())
            .await;
        assert!(prompts.cancel(&id).await);
        assert_eq!(rx.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_id_rejected() {
        let prompts = table();
        assert!(!prompts.provide("nope", "pw".into()).await);
        assert!(!prompts.cancel("nope").await);
    }

    #[tokio::test]
    async fn test_list_reports_pending() {
        let prompts = table();
        let (id, _rx) = prompts
            .register("sess9".into(), PromptKind::Ssh, "host key?".into())
            .await;
        let listed = prompts.list().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].request_id, id);
        assert_eq!(listed[0].session_id, "sess9");
        assert_eq!(listed[0].prompt_kind, PromptKind::Ssh);
        assert!(listed[0].expires_in_secs <= 60);
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_and_wakes_waiter() {
        let prompts = PendingPrompts::new(Duration::from_millis(0));
        let (_id, rx) = prompts
            .register("sess1".into(), PromptKind::Sudo, "p:".into())
            .await;
        assert_eq!(prompts.sweep_expired().await, 1);
        assert_eq!(prompts.count().await, 0);
        // The waiting command loop observes a receive error.
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_sweep_keeps_fresh_requests() {
        let prompts = table();
        let (_id, _rx) = prompts
            .register("sess1".into(), PromptKind::Sudo, "p:".into())
            .await;
        assert_eq!(prompts.sweep_expired().await, 0);
        assert_eq!(prompts.count().await, 1);
    }

    #[tokio::test]
    async fn test_request_ids_are_unique() {
        let prompts = table();
        let (a, _ra) = prompts
            .register("s".into(), PromptKind::Sudo, "p:".into())
            .await;
        let (b, _rb) = prompts
            .register("s".into(), PromptKind::Sudo, "p:".into())
            .await;
        assert_ne!(a, b);
        assert!(a.len() >= 8);
    }
}
