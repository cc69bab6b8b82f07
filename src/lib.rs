//! Remote SSH MCP Server - a Model Context Protocol server for brokered
//! remote command execution.
//!
//! An MCP agent drives a small, stable tool surface — establish session, run
//! command, transfer file, list sessions, tear down — while this crate
//! enforces a three-tier command policy, keeps one persistent interactive
//! shell per session, interposes on password prompts in the output stream,
//! and bounds output size, command wall time, session count, and idle age.
//!
//! # Tools
//!
//! - `ssh_connect` / `ssh_disconnect` / `ssh_list_sessions` - session lifecycle
//! - `ssh_run` - policy-checked command execution with sudo interposition
//! - `ssh_upload` / `ssh_download` - SFTP transfer under path allow-prefixes
//! - `ssh_get_permissibility_info` - active tier and rule-table shape
//! - `ssh_list_password_requests` / `ssh_provide_password` /
//!   `ssh_cancel_password_request` - interactive prompt resolution
//!
//! # Example
//!
//! ```bash
//! MCP_SSH_PERMISSIBILITY_LEVEL=high \
//! MCP_SSH_HOST=10.0.0.5 MCP_SSH_USER=ops MCP_SSH_KEY=~/.ssh/id_ed25519 \
//! remote-ssh-mcp
//! ```

pub mod config;
pub mod error;
pub mod policy;
pub mod prompts;
pub mod registry;
pub mod server;
pub mod ssh;
pub mod tools;

// Re-exports for convenience
pub use config::{Args, Config};
pub use error::{Error, Result, TransferError};
pub use policy::{MatchedRule, PermissibilityLevel, PolicyEngine, ValidationResult};
pub use prompts::{PendingPrompts, PromptRequest};
pub use registry::SessionRegistry;
pub use server::RemoteSshServer;
pub use ssh::{
    AuthMaterial, ConnectOptions, ExecutionOutcome, PromptEvent, PromptKind, Redactor,
    SessionInfo, SessionState, SshSession,
};
pub use tools::ToolContext;
