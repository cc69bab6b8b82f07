//! Connection options and authentication material.

use std::path::PathBuf;
use std::time::Duration;

/// Secrets and key material available to a session.
///
/// Secrets live in memory only; they are never serialised into logs or tool
/// responses (the redactor enforces this on every outward path).
#[derive(Debug, Clone, Default)]
pub struct AuthMaterial {
    /// Password for SSH authentication, and for nested ssh prompts
    pub ssh_password: Option<String>,

    /// Password injected for sudo prompts
    pub sudo_password: Option<String>,

    /// Generic fallback tried when no more specific secret is configured
    pub fallback_password: Option<String>,

    /// Path to a private key file for key authentication
    pub key_path: Option<PathBuf>,

    /// Whether unanswered prompts become pending password requests
    pub interactive_enabled: bool,
}

impl AuthMaterial {
    /// Resolve the secret for a sudo prompt: per-call parameter, then the
    /// configured sudo password, then the generic fallback.
    pub fn resolve_sudo_secret(&self, per_call: Option<&str>) -> Option<String> {
        per_call
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| self.sudo_password.clone())
            .or_else(|| self.fallback_password.clone())
    }
}

/// Everything needed to open one SSH session
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Remote hostname or IP address
    pub host: String,

    /// SSH port
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Secrets and key material
    pub auth: AuthMaterial,

    /// Transport connect timeout
    pub connect_timeout: Duration,

    /// Transport keepalive interval
    pub keepalive: Duration,

    /// Pinned SHA-256 host key fingerprint; None accepts any host key
    pub host_key_fingerprint: Option<String>,
}

impl ConnectOptions {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: username.into(),
            auth: AuthMaterial::default(),
            connect_timeout: Duration::from_secs(30),
            keepalive: Duration::from_secs(30),
            host_key_fingerprint: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_auth(mut self, auth: AuthMaterial) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn with_host_key_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.host_key_fingerprint = Some(fingerprint.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_options_builder() {
        let opts = ConnectOptions::new("10.0.0.5", "ops")
            .with_port(2222)
            .with_connect_timeout(Duration::from_secs(10));

        assert_eq!(opts.host, "10.0.0.5");
        assert_eq!(opts.port, 2222);
        assert_eq!(opts.username, "ops");
        assert_eq!(opts.connect_timeout, Duration::from_secs(10));
        assert!(opts.host_key_fingerprint.is_none());
    }

    #[test]
    fn test_sudo_secret_chain() {
        let auth = AuthMaterial {
            ssh_password: None,
            sudo_password: Some("configured".to_string()),
            fallback_password: Some("fallback".to_string()),
            key_path: None,
            interactive_enabled: false,
        };

        assert_eq!(
            auth.resolve_sudo_secret(Some("percall")),
            Some("percall".to_string())
        );
        assert_eq!(
            auth.resolve_sudo_secret(None),
            Some("configured".to_string())
        );

        let without_sudo = AuthMaterial {
            sudo_password: None,
            ..auth
        };
        assert_eq!(
            without_sudo.resolve_sudo_secret(None),
            Some("fallback".to_string())
        );

        let bare = AuthMaterial::default();
        assert_eq!(bare.resolve_sudo_secret(None), None);
        // Empty per-call values do not short-circuit the chain.
        assert_eq!(bare.resolve_sudo_secret(Some("")), None);
    }
}
