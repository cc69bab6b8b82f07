//! SSH client handler implementation
//!
//! Implements the `russh::client::Handler` trait. By default every server
//! key is accepted, which suits automated connections where trust is handled
//! out of band. When a SHA-256 fingerprint is pinned in the configuration,
//! any other key is rejected and the connection fails with a host key
//! mismatch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use russh::keys::HashAlg;

/// SSH client handler for russh
#[derive(Debug, Clone)]
pub struct ClientHandler {
    /// Pinned SHA-256 fingerprint, with or without the `SHA256:` prefix
    pinned_fingerprint: Option<String>,

    /// Set when the offered key did not match the pin, so the connect path
    /// can classify the failure as `HostKeyMismatch`
    mismatch: Arc<AtomicBool>,
}

impl ClientHandler {
    pub fn new(pinned_fingerprint: Option<String>) -> Self {
        Self {
            pinned_fingerprint,
            mismatch: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle to the mismatch flag, shared with the connect path
    pub fn mismatch_flag(&self) -> Arc<AtomicBool> {
        self.mismatch.clone()
    }
}

impl russh::client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        match &self.pinned_fingerprint {
            None => Ok(true),
            Some(pinned) => {
                let actual = server_public_key.fingerprint(HashAlg::Sha256).to_string();
                let expected = if pinned.starts_with("SHA256:") {
                    pinned.clone()
                } else {
                    format!("SHA256:{pinned}")
                };
                if actual == expected {
                    Ok(true)
                } else {
                    self.mismatch.store(true, Ordering::SeqCst);
                    Ok(false)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_creation() {
        let handler = ClientHandler::new(None);
        assert!(!handler.mismatch_flag().load(Ordering::SeqCst));
    }

    #[test]
    fn test_mismatch_flag_is_shared() {
        let handler = ClientHandler::new(Some("SHA256:abc".to_string()));
        let flag = handler.mismatch_flag();
        handler.mismatch.store(true, Ordering::SeqCst);
        assert!(flag.load(Ordering::SeqCst));
    }
}
