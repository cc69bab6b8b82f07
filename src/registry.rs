//! Session registry.
//!
//! Owns every live session. Handlers borrow an `Arc` for the duration of one
//! call; removal is always routed through the registry so sessions never
//! point back at it. A background tick evicts sessions that sit idle past
//! the TTL, and sessions that lost their transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::ssh::session::{SessionInfo, SshSession};

/// Process-wide map of live sessions
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<SshSession>>>,
    max_sessions: usize,
    idle_ttl: Duration,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize, idle_ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_sessions,
            idle_ttl,
        }
    }

    /// Reserve an id for a new session. Fails fast when the registry is
    /// already at capacity, before any dialing happens.
    pub async fn allocate_id(&self) -> Result<String> {
        let sessions = self.sessions.lock().await;
        if sessions.len() >= self.max_sessions {
            return Err(Error::MaxSessionsReached(self.max_sessions));
        }
        loop {
            let id = generate_session_id();
            if !sessions.contains_key(&id) {
                return Ok(id);
            }
        }
    }

    /// Insert a connected session. Re-checks the cap, since connects run
    /// concurrently between id allocation and registration.
    pub async fn register(&self, session: Arc<SshSession>) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        if sessions.len() >= self.max_sessions {
            session.disconnect().await;
            return Err(Error::MaxSessionsReached(self.max_sessions));
        }
        let id = session.id().to_string();
        if sessions.contains_key(&id) {
            session.disconnect().await;
            return Err(Error::invalid_params(format!(
                "session '{id}' already exists"
            )));
        }
        info!("Registered session {}", id);
        sessions.insert(id, session);
        Ok(())
    }

    /// Look up a live session. A session is discoverable here only while it
    /// is connected; a dead entry is dropped on access.
    pub async fn get(&self, id: &str) -> Result<Arc<SshSession>> {
        let mut sessions = self.sessions.lock().await;
        match sessions.get(id) {
            Some(session) if session.is_connected() => Ok(session.clone()),
            Some(_) => {
                sessions.remove(id);
                Err(Error::NotFound(format!("session '{id}'")))
            }
            None => Err(Error::NotFound(format!("session '{id}'"))),
        }
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.sessions.lock().await.contains_key(id)
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.lock().await;
        let mut infos: Vec<SessionInfo> = sessions.values().map(|s| s.info()).collect();
        infos.sort_by(|a, b| a.created_at_unix.cmp(&b.created_at_unix));
        infos
    }

    pub async fn count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Remove a session from the map; the caller owns the disconnect.
    pub async fn remove(&self, id: &str) -> Option<Arc<SshSession>> {
        self.sessions.lock().await.remove(id)
    }

    /// Disconnect and drop sessions idle past the TTL, plus any whose
    /// transport already died. Runs on the background tick.
    pub async fn evict_idle(&self) -> usize {
        let stale: Vec<Arc<SshSession>> = {
            let mut sessions = self.sessions.lock().await;
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| !s.is_connected() || s.idle_for() > self.idle_ttl)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        for session in &stale {
            warn!("Evicting idle session {}", session.id());
            session.disconnect().await;
        }
        stale.len()
    }

    /// Disconnect everything; used on process shutdown.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<SshSession>> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, s)| s).collect()
        };
        for session in &drained {
            session.disconnect().await;
        }
        if !drained.is_empty() {
            info!("Disconnected {} session(s) on shutdown", drained.len());
        }
    }
}

/// Random url-safe session id, 12 alphanumeric characters
pub fn generate_session_id() -> String {
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

    #[test]
    fn test_generated_ids_are_url_safe_and_long_enough() {
        let id = generate_session_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(id, generate_session_id());
    }

    #[tokio::test]
    async fn test_allocate_id_enforces_cap_when_empty() {
        let registry = SessionRegistry::new(0, Duration::from_secs(60));
        let err = registry.allocate_id().await.unwrap_err();
        assert!(matches!(err, Error::MaxSessionsReached(0)));
    }

    #[tokio::test]
    async fn test_allocate_id_below_cap() {
        let registry = SessionRegistry::new(3, Duration::from_secs(60));
        let id = registry.allocate_id().await.unwrap();
        assert_eq!(id.len(), 12);
    }

    #[tokio::test]
    async fn test_get_unknown_session_is_not_found() {
        let registry = SessionRegistry::new(3, Duration::from_secs(60));
        let err = registry.get("missing").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_empty() {
        let registry = SessionRegistry::new(3, Duration::from_secs(60));
        assert!(registry.list().await.is_empty());
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_evict_idle_on_empty_registry() {
        let registry = SessionRegistry::new(3, Duration::from_millis(1));
        assert_eq!(registry.evict_idle().await, 0);
    }
}
