//! MCP server implementation.
//!
//! Implements `rmcp::ServerHandler` over the shared tool context: advertises
//! the ten SSH tools with schema-derived inputs, routes each call to its
//! handler with an explicit match, and serialises handler errors into the
//! `{success: false, error, details}` envelope. Every outward string passes
//! through the redactor.

use std::sync::Arc;
use std::time::Duration;

use rmcp::{
    handler::server::ServerHandler,
    model::*,
    service::{RequestContext, RoleServer},
    ErrorData as McpError,
};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, error, info};

use crate::error::Error;
use crate::tools::{self, ToolContext};

/// Eviction and sweep cadence for the background maintenance task
const MAINTENANCE_TICK: Duration = Duration::from_secs(30);

/// The MCP server: a thin dispatcher over the tool context
#[derive(Clone)]
pub struct RemoteSshServer {
    ctx: ToolContext,
}

impl RemoteSshServer {
    pub fn new(ctx: ToolContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &ToolContext {
        &self.ctx
    }

    /// Disconnect all sessions; called from the shutdown path
    pub async fn shutdown(&self) {
        info!("Shutting down remote SSH MCP server...");
        self.ctx.registry.shutdown().await;
    }

    /// Start the idle-eviction and prompt-expiry tick
    pub fn spawn_maintenance(&self) -> tokio::task::JoinHandle<()> {
        let registry = self.ctx.registry.clone();
        let prompts = self.ctx.prompts.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(MAINTENANCE_TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                registry.evict_idle().await;
                prompts.sweep_expired().await;
            }
        })
    }

    fn tool<T: JsonSchema>(name: &'static str, description: &'static str) -> Tool {
        Tool::new(name, description, input_schema::<T>())
    }

    fn tool_list() -> Vec<Tool> {
        vec![
            Self::tool::<tools::ConnectParams>(
                "ssh_connect",
                "Establish an SSH session to a remote host and return its session id.",
            ),
            Self::tool::<tools::RunParams>(
                "ssh_run",
                "Execute a policy-checked shell command in an existing SSH session.",
            ),
            Self::tool::<tools::UploadParams>(
                "ssh_upload",
                "Upload base64-encoded file content to an allowed remote path.",
            ),
            Self::tool::<tools::DownloadParams>(
                "ssh_download",
                "Download file content from an allowed remote path, base64-encoded.",
            ),
            Self::tool::<tools::EmptyParams>(
                "ssh_list_sessions",
                "List live SSH sessions with host, user, working directory, and idle time.",
            ),
            Self::tool::<tools::SessionIdParams>(
                "ssh_disconnect",
                "Disconnect an SSH session and release its resources.",
            ),
            Self::tool::<tools::EmptyParams>(
                "ssh_get_permissibility_info",
                "Report the active permissibility level and the size of its rule tables.",
            ),
            Self::tool::<tools::EmptyParams>(
                "ssh_list_password_requests",
                "List pending password requests raised by interactive prompts.",
            ),
            Self::tool::<tools::ProvidePasswordParams>(
                "ssh_provide_password",
                "Answer a pending password request so the blocked command can continue.",
            ),
            Self::tool::<tools::RequestIdParams>(
                "ssh_cancel_password_request",
                "Cancel a pending password request; the blocked command fails.",
            ),
        ]
    }

    async fn dispatch(&self, name: &str, args: JsonObject) -> Result<serde_json::Value, Error> {
        match name {
            "ssh_connect" => tools::ssh_connect(&self.ctx, parse(args)?).await,
            "ssh_run" => tools::ssh_run(&self.ctx, parse(args)?).await,
            "ssh_upload" => tools::ssh_upload(&self.ctx, parse(args)?).await,
            "ssh_download" => tools::ssh_download(&self.ctx, parse(args)?).await,
            "ssh_list_sessions" => tools::ssh_list_sessions(&self.ctx, parse(args)?).await,
            "ssh_disconnect" => tools::ssh_disconnect(&self.ctx, parse(args)?).await,
            "ssh_get_permissibility_info" => {
                tools::ssh_get_permissibility_info(&self.ctx, parse(args)?).await
            }
            "ssh_list_password_requests" => {
                tools::ssh_list_password_requests(&self.ctx, parse(args)?).await
            }
            "ssh_provide_password" => {
                tools::ssh_provide_password(&self.ctx, parse(args)?).await
            }
            "ssh_cancel_password_request" => {
                tools::ssh_cancel_password_request(&self.ctx, parse(args)?).await
            }
            other => Err(Error::invalid_params(format!("unknown tool: {other}"))),
        }
    }
}

impl ServerHandler for RemoteSshServer {
    fn get_info(&self) -> ServerInfo {
        let target = match (&self.ctx.config.host, &self.ctx.config.user) {
            (Some(host), Some(user)) => format!(" Default target: {user}@{host}."),
            _ => String::new(),
        };
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(format!(
                "Remote SSH MCP server v{} at permissibility level '{}'.{}",
                env!("CARGO_PKG_VERSION"),
                self.ctx.policy.level(),
                target,
            )),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        debug!("list_tools called");
        Ok(ListToolsResult {
            tools: Self::tool_list(),
            next_cursor: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let tool_name: &str = request.name.as_ref();
        debug!("call_tool: {}", tool_name);

        let args = request.arguments.unwrap_or_default();
        match self.dispatch(tool_name, args).await {
            // A handler Ok is a structured result even when it reports
            // success=false (e.g. a policy-denied run); only a handler Err
            // becomes an error envelope.
            Ok(body) => {
                let text = self.ctx.redactor.redact(&body.to_string());
                Ok(CallToolResult::success(vec![Content::text(text)]))
            }
            Err(e) => {
                error!("{} failed: {} ({})", tool_name, e, e.kind());
                let envelope = json!({
                    "success": false,
                    "error": e.kind(),
                    "details": self.ctx.redactor.redact(&e.to_string()),
                });
                Ok(CallToolResult::error(vec![Content::text(
                    envelope.to_string(),
                )]))
            }
        }
    }
}

fn parse<T: DeserializeOwned>(args: JsonObject) -> Result<T, Error> {
    serde_json::from_value(serde_json::Value::Object(args))
        .map_err(|e| Error::invalid_params(e.to_string()))
}

fn input_schema<T: JsonSchema>() -> Arc<JsonObject> {
    let schema = schemars::schema_for!(T);
    let value = serde_json::to_value(schema).unwrap_or_default();
    Arc::new(value.as_object().cloned().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn server() -> RemoteSshServer {
        RemoteSshServer::new(ToolContext::new(Config::for_tests()).unwrap())
    }

    #[test]
    fn test_tool_list_is_complete() {
        let tools = RemoteSshServer::tool_list();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_ref()).collect();
        assert_eq!(
            names,
            vec![
                "ssh_connect",
                "ssh_run",
                "ssh_upload",
                "ssh_download",
                "ssh_list_sessions",
                "ssh_disconnect",
                "ssh_get_permissibility_info",
                "ssh_list_password_requests",
                "ssh_provide_password",
                "ssh_cancel_password_request",
            ]
        );
        for tool in &tools {
            assert!(tool.description.is_some());
        }
    }

    #[test]
    fn test_input_schema_has_required_fields() {
        let schema = input_schema::<tools::RunParams>();
        let text = serde_json::Value::Object((*schema).clone()).to_string();
        assert!(text.contains("session_id"));
        assert!(text.contains("cmd"));
    }

    #[tokio::test]
    async fn test_dispatch_unknown_tool() {
        let server = server();
        let err = server
            .dispatch("ssh_frobnicate", JsonObject::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_params");
    }

    #[tokio::test]
    async fn test_dispatch_missing_required_param() {
        let server = server();
        let err = server
            .dispatch("ssh_run", JsonObject::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_params");
    }

    #[tokio::test]
    async fn test_dispatch_permissibility_info() {
        let server = server();
        let value = server
            .dispatch("ssh_get_permissibility_info", JsonObject::default())
            .await
            .unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["level"], "medium");
    }

    #[tokio::test]
    async fn test_error_envelope_shape() {
        // Secrets in error details are redacted before leaving the process.
        let mut config = Config::for_tests();
        config.sudo_password = Some("topsecret".to_string());
        let server = RemoteSshServer::new(ToolContext::new(config).unwrap());

        let err = Error::PasswordRequired("prompt mentioned topsecret".to_string());
        let envelope = json!({
            "success": false,
            "error": err.kind(),
            "details": server.ctx.redactor.redact(&err.to_string()),
        });
        assert_eq!(envelope["error"], "password_required");
        assert!(!envelope["details"].as_str().unwrap().contains("topsecret"));
    }
}
