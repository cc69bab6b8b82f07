//! Configuration and CLI argument parsing.
//!
//! Settings layer as: built-in defaults < environment variables (via clap
//! `env` attributes) < optional YAML file < per-call tool parameters. The
//! YAML file path comes from `--config` / `MCP_SSH_CONFIG`; its keys mirror
//! the environment names.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::policy::PermissibilityLevel;

/// Default command execution timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Default connect timeout in seconds
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default transport keepalive interval in seconds
pub const DEFAULT_KEEPALIVE_SECS: u64 = 30;

/// Default cap on combined stdout+stderr bytes per command
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 128 * 1024;

/// Default cap on output lines per command
pub const DEFAULT_MAX_OUTPUT_LINES: usize = 1_000;

/// Default cap on concurrent sessions
pub const DEFAULT_MAX_SESSIONS: usize = 5;

/// Default idle TTL before a session is evicted (8 hours)
pub const DEFAULT_IDLE_TTL_SECS: u64 = 8 * 60 * 60;

/// Tail window inspected by the prompt interposer
pub const PROMPT_WINDOW_BYTES: usize = 4 * 1024;

/// How long an unanswered password request stays pending
pub const PENDING_PROMPT_TTL_SECS: u64 = 60;

/// Default cap for ssh_download when the caller gives none
pub const DEFAULT_DOWNLOAD_MAX_BYTES: usize = 64 * 1024;

/// Remote SSH MCP Server CLI arguments
#[derive(Parser, Debug, Clone)]
#[command(name = "remote-ssh-mcp")]
#[command(version)]
#[command(about = "MCP server brokering policy-checked shell commands to remote hosts over SSH")]
pub struct Args {
    /// Permissibility tier: low, medium, or high
    #[arg(long, default_value = "medium", env = "MCP_SSH_PERMISSIBILITY_LEVEL")]
    pub permissibility_level: String,

    /// Default SSH host for ssh_connect calls that omit one
    #[arg(long, env = "MCP_SSH_HOST")]
    pub host: Option<String>,

    /// Default SSH port
    #[arg(long, default_value = "22", env = "MCP_SSH_PORT")]
    pub port: u16,

    /// Default SSH username
    #[arg(long, env = "MCP_SSH_USER")]
    pub user: Option<String>,

    /// Path to the default SSH private key
    #[arg(long, env = "MCP_SSH_KEY")]
    pub key: Option<PathBuf>,

    /// Default SSH password
    #[arg(long, env = "MCP_SSH_PASSWORD")]
    pub password: Option<String>,

    /// Password injected for sudo prompts
    #[arg(long, env = "MCP_SSH_SUDO_PASSWORD")]
    pub sudo_password: Option<String>,

    /// Fallback secret tried when no more specific one is configured
    #[arg(long, env = "MCP_SSH_FALLBACK_PASSWORD")]
    pub fallback_password: Option<String>,

    /// Surface unanswered prompts as pending password requests
    #[arg(long, default_value = "false", env = "MCP_SSH_INTERACTIVE")]
    pub interactive: bool,

    /// Answer host-authenticity prompts from nested ssh with "yes"
    #[arg(long, default_value = "false", env = "MCP_SSH_AUTO_ACCEPT_HOST_PROMPTS")]
    pub auto_accept_host_prompts: bool,

    /// Pinned SHA-256 host key fingerprint; mismatch aborts the connection
    #[arg(long, env = "MCP_SSH_HOST_FINGERPRINT")]
    pub host_fingerprint: Option<String>,

    /// Command execution timeout in milliseconds
    #[arg(long, default_value = "30000", env = "MCP_SSH_TIMEOUT_MS")]
    pub timeout_ms: u64,

    /// Connect timeout in seconds
    #[arg(long, default_value = "30", env = "MCP_SSH_CONNECT_TIMEOUT")]
    pub connect_timeout: u64,

    /// Transport keepalive interval in seconds
    #[arg(long, default_value = "30", env = "MCP_SSH_KEEPALIVE")]
    pub keepalive: u64,

    /// Maximum combined output bytes per command
    #[arg(long, default_value = "131072", env = "MCP_SSH_MAX_OUTPUT_BYTES")]
    pub max_output_bytes: usize,

    /// Maximum output lines per command
    #[arg(long, default_value = "1000", env = "MCP_SSH_MAX_OUTPUT_LINES")]
    pub max_output_lines: usize,

    /// Maximum concurrent sessions
    #[arg(long, default_value = "5", env = "MCP_SSH_MAX_SESSIONS")]
    pub max_sessions: usize,

    /// Idle seconds before a session is evicted
    #[arg(long, default_value = "28800", env = "MCP_SSH_IDLE_TTL_SECS")]
    pub idle_ttl_secs: u64,

    /// Optional YAML config file; values there win over the environment
    #[arg(long, env = "MCP_SSH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, default_value = "false", env = "DEBUG")]
    pub debug: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    pub log_level: String,
}

/// YAML overlay. Every key is optional; present keys override the
/// environment-derived values.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct YamlOverrides {
    pub permissibility_level: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub key: Option<PathBuf>,
    pub password: Option<String>,
    pub sudo_password: Option<String>,
    pub fallback_password: Option<String>,
    pub interactive: Option<bool>,
    pub auto_accept_host_prompts: Option<bool>,
    pub host_fingerprint: Option<String>,
    pub timeout_ms: Option<u64>,
    pub connect_timeout: Option<u64>,
    pub keepalive: Option<u64>,
    pub max_output_bytes: Option<usize>,
    pub max_output_lines: Option<usize>,
    pub max_sessions: Option<usize>,
    pub idle_ttl_secs: Option<u64>,
    pub transfer_allow_prefixes: Option<Vec<String>>,
    pub extra_forbidden_patterns: Option<Vec<String>>,
    pub debug: Option<bool>,
    pub log_level: Option<String>,
}

/// Parsed, validated, immutable configuration snapshot
#[derive(Debug, Clone)]
pub struct Config {
    pub level: PermissibilityLevel,
    pub host: Option<String>,
    pub port: u16,
    pub user: Option<String>,
    pub key_path: Option<PathBuf>,
    pub ssh_password: Option<String>,
    pub sudo_password: Option<String>,
    pub fallback_password: Option<String>,
    pub interactive: bool,
    pub auto_accept_host_prompts: bool,
    pub host_fingerprint: Option<String>,
    pub command_timeout_ms: u64,
    pub connect_timeout_secs: u64,
    pub keepalive_secs: u64,
    pub max_output_bytes: usize,
    pub max_output_lines: usize,
    pub max_sessions: usize,
    pub idle_ttl_secs: u64,
    pub prompt_window_bytes: usize,
    pub pending_prompt_ttl_secs: u64,
    pub transfer_allow_prefixes: Vec<String>,
    pub extra_forbidden_patterns: Vec<String>,
    pub debug: bool,
    pub log_level: String,
}

impl Config {
    /// Build the config from parsed arguments, applying the YAML overlay
    /// when one is configured.
    pub fn from_args(args: Args) -> Result<Self> {
        let overrides = match &args.config {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    Error::config(format!("cannot read config file {}: {e}", path.display()))
                })?;
                serde_yaml::from_str::<YamlOverrides>(&text).map_err(|e| {
                    Error::config(format!("invalid YAML in {}: {e}", path.display()))
                })?
            }
            _ => YamlOverrides::default(),
        };

        let key_path = overrides.key.or(args.key);
        if let Some(ref path) = key_path {
            if !path.exists() {
                return Err(Error::config(format!(
                    "SSH key file not found: {}",
                    path.display()
                )));
            }
        }

        let level = PermissibilityLevel::parse(
            overrides
                .permissibility_level
                .as_deref()
                .unwrap_or(&args.permissibility_level),
        );

        Ok(Config {
            level,
            host: overrides.host.or(args.host).filter(|h| !h.is_empty()),
            port: overrides.port.unwrap_or(args.port),
            user: overrides.user.or(args.user).filter(|u| !u.is_empty()),
            key_path,
            ssh_password: sanitize_secret(overrides.password.or(args.password)),
            sudo_password: sanitize_secret(overrides.sudo_password.or(args.sudo_password)),
            fallback_password: sanitize_secret(
                overrides.fallback_password.or(args.fallback_password),
            ),
            interactive: overrides.interactive.unwrap_or(args.interactive),
            auto_accept_host_prompts: overrides
                .auto_accept_host_prompts
                .unwrap_or(args.auto_accept_host_prompts),
            host_fingerprint: overrides.host_fingerprint.or(args.host_fingerprint),
            command_timeout_ms: overrides.timeout_ms.unwrap_or(args.timeout_ms),
            connect_timeout_secs: overrides.connect_timeout.unwrap_or(args.connect_timeout),
            keepalive_secs: overrides.keepalive.unwrap_or(args.keepalive),
            max_output_bytes: overrides.max_output_bytes.unwrap_or(args.max_output_bytes),
            max_output_lines: overrides.max_output_lines.unwrap_or(args.max_output_lines),
            max_sessions: overrides.max_sessions.unwrap_or(args.max_sessions),
            idle_ttl_secs: overrides.idle_ttl_secs.unwrap_or(args.idle_ttl_secs),
            prompt_window_bytes: PROMPT_WINDOW_BYTES,
            pending_prompt_ttl_secs: PENDING_PROMPT_TTL_SECS,
            transfer_allow_prefixes: overrides
                .transfer_allow_prefixes
                .unwrap_or_else(default_transfer_prefixes),
            extra_forbidden_patterns: overrides.extra_forbidden_patterns.unwrap_or_default(),
            debug: overrides.debug.unwrap_or(args.debug),
            log_level: overrides.log_level.unwrap_or(args.log_level),
        })
    }

    /// Every configured secret, for the output redactor.
    pub fn secrets(&self) -> Vec<String> {
        [
            self.ssh_password.as_ref(),
            self.sudo_password.as_ref(),
            self.fallback_password.as_ref(),
        ]
        .into_iter()
        .flatten()
        .cloned()
        .collect()
    }

    /// A fresh default config for unit tests; no environment reads.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Config {
            level: PermissibilityLevel::Medium,
            host: None,
            port: 22,
            user: None,
            key_path: None,
            ssh_password: None,
            sudo_password: None,
            fallback_password: None,
            interactive: false,
            auto_accept_host_prompts: false,
            host_fingerprint: None,
            command_timeout_ms: DEFAULT_TIMEOUT_MS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            keepalive_secs: DEFAULT_KEEPALIVE_SECS,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            max_output_lines: DEFAULT_MAX_OUTPUT_LINES,
            max_sessions: DEFAULT_MAX_SESSIONS,
            idle_ttl_secs: DEFAULT_IDLE_TTL_SECS,
            prompt_window_bytes: PROMPT_WINDOW_BYTES,
            pending_prompt_ttl_secs: PENDING_PROMPT_TTL_SECS,
            transfer_allow_prefixes: default_transfer_prefixes(),
            extra_forbidden_patterns: Vec::new(),
            debug: false,
            log_level: "info".to_string(),
        }
    }
}

fn default_transfer_prefixes() -> Vec<String> {
    vec![
        "/home/".to_string(),
        "/root/".to_string(),
        "/var/log/".to_string(),
        "/tmp/".to_string(),
        "/opt/".to_string(),
    ]
}

/// Normalise an empty or whitespace-only secret to None
fn sanitize_secret(secret: Option<String>) -> Option<String> {
    secret.filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args {
            permissibility_level: "medium".to_string(),
            host: Some("example.net".to_string()),
            port: 22,
            user: Some("ops".to_string()),
            key: None,
            password: Some("hunter2".to_string()),
            sudo_password: None,
            fallback_password: None,
            interactive: false,
            auto_accept_host_prompts: false,
            host_fingerprint: None,
            timeout_ms: 30_000,
            connect_timeout: 30,
            keepalive: 30,
            max_output_bytes: 131_072,
            max_output_lines: 1_000,
            max_sessions: 5,
            idle_ttl_secs: 28_800,
            config: None,
            debug: false,
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn test_from_args_defaults() {
        let config = Config::from_args(base_args()).unwrap();
        assert_eq!(config.level, PermissibilityLevel::Medium);
        assert_eq!(config.host.as_deref(), Some("example.net"));
        assert_eq!(config.max_output_bytes, 131_072);
        assert_eq!(config.max_sessions, 5);
        assert!(config.transfer_allow_prefixes.contains(&"/tmp/".to_string()));
    }

    #[test]
    fn test_empty_secret_becomes_none() {
        let mut args = base_args();
        args.password = Some("   ".to_string());
        let config = Config::from_args(args).unwrap();
        assert_eq!(config.ssh_password, None);
    }

    #[test]
    fn test_missing_key_file_is_config_error() {
        let mut args = base_args();
        args.key = Some(PathBuf::from("/nonexistent/id_ed25519"));
        let err = Config::from_args(args).unwrap_err();
        assert_eq!(err.kind(), "config_error");
    }

    #[test]
    fn test_unknown_level_defaults_to_medium() {
        let mut args = base_args();
        args.permissibility_level = "paranoid".to_string();
        let config = Config::from_args(args).unwrap();
        assert_eq!(config.level, PermissibilityLevel::Medium);
    }

    #[test]
    fn test_yaml_overrides_env_values() {
        let dir = std::env::temp_dir().join("remote-ssh-mcp-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("override.yaml");
        std::fs::write(
            &path,
            "permissibility_level: high\nmax_sessions: 9\nhost: yaml.example.net\n",
        )
        .unwrap();

        let mut args = base_args();
        args.config = Some(path.clone());
        let config = Config::from_args(args).unwrap();
        assert_eq!(config.level, PermissibilityLevel::High);
        assert_eq!(config.max_sessions, 9);
        assert_eq!(config.host.as_deref(), Some("yaml.example.net"));

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let dir = std::env::temp_dir().join("remote-ssh-mcp-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("broken.yaml");
        std::fs::write(&path, "max_sessions: [not, a, number\n").unwrap();

        let mut args = base_args();
        args.config = Some(path.clone());
        assert!(Config::from_args(args).is_err());

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_secrets_collects_configured_passwords() {
        let mut args = base_args();
        args.sudo_password = Some("s3cret".to_string());
        let config = Config::from_args(args).unwrap();
        let secrets = config.secrets();
        assert!(secrets.contains(&"hunter2".to_string()));
        assert!(secrets.contains(&"s3cret".to_string()));
        assert_eq!(secrets.len(), 2);
    }
}
