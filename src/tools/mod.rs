//! Tool parameter types and handlers.
//!
//! Each MCP tool is a plain async function over the shared [`ToolContext`];
//! the dispatcher in `server.rs` routes to them by name. Parameter structs
//! derive `JsonSchema` so the tool listing carries accurate input schemas.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::{Config, DEFAULT_DOWNLOAD_MAX_BYTES};
use crate::error::{Error, Result};
use crate::policy::PolicyEngine;
use crate::prompts::PendingPrompts;
use crate::registry::SessionRegistry;
use crate::ssh::{AuthMaterial, ConnectOptions, Redactor, SessionLimits, SshSession};

/// Shared state threaded through every tool handler. Tests build a fresh
/// context per case; there are no process-wide singletons.
#[derive(Clone)]
pub struct ToolContext {
    pub config: Arc<Config>,
    pub policy: Arc<PolicyEngine>,
    pub registry: Arc<SessionRegistry>,
    pub prompts: Arc<PendingPrompts>,
    pub redactor: Redactor,
}

impl ToolContext {
    pub fn new(config: Config) -> Result<Self> {
        let policy = PolicyEngine::new(&config)?;
        let registry = SessionRegistry::new(
            config.max_sessions,
            Duration::from_secs(config.idle_ttl_secs),
        );
        let prompts = PendingPrompts::new(Duration::from_secs(config.pending_prompt_ttl_secs));
        let redactor = Redactor::new(config.secrets());

        Ok(Self {
            config: Arc::new(config),
            policy: Arc::new(policy),
            registry: Arc::new(registry),
            prompts: Arc::new(prompts),
            redactor,
        })
    }
}

// ---------------------------------------------------------------------------
// Parameter types
// ---------------------------------------------------------------------------

/// Authentication block for ssh_connect
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct AuthParams {
    /// Password for SSH authentication
    pub password: Option<String>,
    /// Path to a private key file on this machine
    pub key_path: Option<String>,
}

/// Parameters for the ssh_connect tool
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ConnectParams {
    /// Remote hostname or IP address; falls back to the configured default
    pub host: Option<String>,
    /// SSH port (default 22)
    pub port: Option<u16>,
    /// Username; falls back to the configured default
    pub username: Option<String>,
    /// Explicit session id; generated when omitted
    pub session_id: Option<String>,
    /// Authentication material; falls back to the configured key/password
    pub auth: Option<AuthParams>,
}

/// Parameters for the ssh_run tool
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct RunParams {
    /// Session id returned by ssh_connect
    pub session_id: String,
    /// Shell command to execute
    pub cmd: String,
    /// Wall-clock timeout in milliseconds (default 30000)
    pub timeout_ms: Option<u64>,
    /// Password for sudo prompts raised by this command
    pub sudo_password: Option<String>,
}

/// Parameters for the ssh_upload tool
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct UploadParams {
    /// Session id returned by ssh_connect
    pub session_id: String,
    /// Absolute remote path under an allowed prefix
    pub path: String,
    /// File content, base64-encoded
    pub bytes_base64: String,
}

/// Parameters for the ssh_download tool
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct DownloadParams {
    /// Session id returned by ssh_connect
    pub session_id: String,
    /// Absolute remote path under an allowed prefix
    pub path: String,
    /// Read cap in bytes (default 65536)
    pub max_bytes: Option<usize>,
}

/// Parameters for tools that only take a session id
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SessionIdParams {
    /// Session id returned by ssh_connect
    pub session_id: String,
}

/// Parameters for the ssh_provide_password tool
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ProvidePasswordParams {
    /// Pending request id from ssh_list_password_requests
    pub request_id: String,
    /// The secret to inject
    pub password: String,
}

/// Parameters for the ssh_cancel_password_request tool
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct RequestIdParams {
    /// Pending request id from ssh_list_password_requests
    pub request_id: String,
}

/// Tools with no parameters
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct EmptyParams {}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Establish an SSH session to a remote host
pub async fn ssh_connect(ctx: &ToolContext, params: ConnectParams) -> Result<Value> {
    let host = params
        .host
        .or_else(|| ctx.config.host.clone())
        .ok_or_else(|| {
            Error::invalid_params("host is required (parameter or MCP_SSH_HOST)")
        })?;
    let username = params
        .username
        .or_else(|| ctx.config.user.clone())
        .ok_or_else(|| {
            Error::invalid_params("username is required (parameter or MCP_SSH_USER)")
        })?;
    let port = params.port.unwrap_or(ctx.config.port);

    let session_id = match params.session_id {
        Some(id) => {
            validate_session_id(&id)?;
            if ctx.registry.contains(&id).await {
                return Err(Error::invalid_params(format!(
                    "session '{id}' already exists; disconnect it first"
                )));
            }
            if ctx.registry.count().await >= ctx.config.max_sessions {
                return Err(Error::MaxSessionsReached(ctx.config.max_sessions));
            }
            id
        }
        None => ctx.registry.allocate_id().await?,
    };

    let (call_password, call_key) = match params.auth {
        Some(auth) => (auth.password, auth.key_path.map(PathBuf::from)),
        None => (None, None),
    };

    let auth = AuthMaterial {
        ssh_password: call_password.or_else(|| ctx.config.ssh_password.clone()),
        sudo_password: ctx.config.sudo_password.clone(),
        fallback_password: ctx.config.fallback_password.clone(),
        key_path: call_key.or_else(|| ctx.config.key_path.clone()),
        interactive_enabled: ctx.config.interactive,
    };

    let mut opts = ConnectOptions::new(host.clone(), username.clone())
        .with_port(port)
        .with_auth(auth)
        .with_connect_timeout(Duration::from_secs(ctx.config.connect_timeout_secs))
        .with_keepalive(Duration::from_secs(ctx.config.keepalive_secs));
    if let Some(ref fingerprint) = ctx.config.host_fingerprint {
        opts = opts.with_host_key_fingerprint(fingerprint.clone());
    }

    let session = SshSession::connect(
        session_id.clone(),
        opts,
        SessionLimits::from_config(&ctx.config),
        ctx.redactor.clone(),
        ctx.prompts.clone(),
        ctx.config.auto_accept_host_prompts,
    )
    .await?;

    ctx.registry.register(Arc::new(session)).await?;

    Ok(json!({
        "success": true,
        "session_id": session_id,
        "host": host,
        "username": username,
        "message": format!("Connected to {username}@{host}:{port}"),
    }))
}

/// Execute a command in an existing session
pub async fn ssh_run(ctx: &ToolContext, params: RunParams) -> Result<Value> {
    let session = ctx.registry.get(&params.session_id).await?;
    let outcome = session
        .run(
            &params.cmd,
            params.timeout_ms,
            params.sudo_password.as_deref(),
            &ctx.policy,
        )
        .await?;

    Ok(json!({
        "success": outcome.denied_reason.is_none(),
        "session_id": params.session_id,
        "stdout": outcome.stdout,
        "stderr": outcome.stderr,
        "exit_status": outcome.exit_status,
        "duration_ms": outcome.duration_ms,
        "truncated": outcome.truncated,
        "timeout": outcome.timeout,
        "denied_reason": outcome.denied_reason,
    }))
}

/// Upload file content to the remote host
pub async fn ssh_upload(ctx: &ToolContext, params: UploadParams) -> Result<Value> {
    let bytes = BASE64
        .decode(&params.bytes_base64)
        .map_err(|e| Error::invalid_params(format!("bytes_base64 is not valid base64: {e}")))?;

    let session = ctx.registry.get(&params.session_id).await?;
    let written = session.upload(&params.path, &bytes).await?;

    Ok(json!({
        "success": true,
        "session_id": params.session_id,
        "path": params.path,
        "bytes_written": written,
    }))
}

/// Download file content from the remote host
pub async fn ssh_download(ctx: &ToolContext, params: DownloadParams) -> Result<Value> {
    let max_bytes = params.max_bytes.unwrap_or(DEFAULT_DOWNLOAD_MAX_BYTES);
    let session = ctx.registry.get(&params.session_id).await?;
    let (bytes, truncated) = session.download(&params.path, max_bytes).await?;

    Ok(json!({
        "success": true,
        "session_id": params.session_id,
        "path": params.path,
        "bytes_base64": BASE64.encode(&bytes),
        "truncated": truncated,
    }))
}

/// List live sessions
pub async fn ssh_list_sessions(ctx: &ToolContext, _params: EmptyParams) -> Result<Value> {
    let sessions: Vec<Value> = ctx
        .registry
        .list()
        .await
        .into_iter()
        .map(|info| {
            json!({
                "id": info.id,
                "host": info.host,
                "port": info.port,
                "user": info.username,
                "created_at": info.created_at_unix,
                "idle_for": info.idle_for_secs,
                "cwd": info.cwd,
                "connected": info.connected,
            })
        })
        .collect();

    Ok(json!({
        "success": true,
        "count": sessions.len(),
        "sessions": sessions,
    }))
}

/// Tear down a session
pub async fn ssh_disconnect(ctx: &ToolContext, params: SessionIdParams) -> Result<Value> {
    let session = ctx
        .registry
        .remove(&params.session_id)
        .await
        .ok_or_else(|| Error::NotFound(format!("session '{}'", params.session_id)))?;
    session.disconnect().await;

    Ok(json!({
        "success": true,
        "session_id": params.session_id,
        "message": format!("Session '{}' disconnected", params.session_id),
    }))
}

/// Report the active permissibility tier and the shape of its tables
pub async fn ssh_get_permissibility_info(
    ctx: &ToolContext,
    _params: EmptyParams,
) -> Result<Value> {
    Ok(json!({
        "success": true,
        "level": ctx.policy.level().as_str(),
        "allowed_count": ctx.policy.allowed_count(),
        "always_denied_count": ctx.policy.always_denied_count(),
        "patterns_active": ctx.policy.patterns_active(),
    }))
}

/// List pending password requests
pub async fn ssh_list_password_requests(
    ctx: &ToolContext,
    _params: EmptyParams,
) -> Result<Value> {
    let requests = ctx.prompts.list().await;
    Ok(json!({
        "success": true,
        "count": requests.len(),
        "requests": requests,
    }))
}

/// Answer a pending password request
pub async fn ssh_provide_password(
    ctx: &ToolContext,
    params: ProvidePasswordParams,
) -> Result<Value> {
    if ctx.prompts.provide(&params.request_id, params.password).await {
        Ok(json!({
            "success": true,
            "request_id": params.request_id,
            "message": format!("Password provided for request {}", params.request_id),
        }))
    } else {
        Err(Error::NotFound(format!(
            "password request '{}'",
            params.request_id
        )))
    }
}

/// Cancel a pending password request
pub async fn ssh_cancel_password_request(
    ctx: &ToolContext,
    params: RequestIdParams,
) -> Result<Value> {
    if ctx.prompts.cancel(&params.request_id).await {
        Ok(json!({
            "success": true,
            "request_id": params.request_id,
            "message": format!("Password request {} cancelled", params.request_id),
        }))
    } else {
        Err(Error::NotFound(format!(
            "password request '{}'",
            params.request_id
        )))
    }
}

/// Explicit session ids must be opaque url-safe tokens of at least 8 chars
fn validate_session_id(id: &str) -> Result<()> {
    let valid_chars = id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if id.len() < 8 || id.len() > 64 || !valid_chars {
        return Err(Error::invalid_params(
            "session_id must be 8-64 characters of [A-Za-z0-9_-]",
        ));
    }
    Ok(())
}
