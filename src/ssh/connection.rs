//! Transport establishment and authentication.
//!
//! Opens the SSH transport with a connect timeout, runs the authentication
//! cascade (key, then password, then keyboard-interactive), and prepares the
//! interactive shell channel every session keeps open.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle, KeyboardInteractiveAuthResponse};
use russh::keys::{decode_secret_key, PrivateKeyWithHashAlg};
use russh::{Channel, ChannelMsg};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::config::ConnectOptions;
use super::handler::ClientHandler;
use crate::error::{Error, Result};

/// Shell preamble: a quiet, predictable prompt with no local echo, so the
/// sentinel protocol sees command output and nothing else.
const SHELL_PREAMBLE: &str = "export PS1=; export TERM=xterm; stty -echo 2>/dev/null; unset HISTFILE\n";

/// Open and authenticate the SSH transport
pub async fn establish(opts: &ConnectOptions) -> Result<Handle<ClientHandler>> {
    let config = Arc::new(client::Config {
        keepalive_interval: Some(opts.keepalive),
        ..client::Config::default()
    });

    let handler = ClientHandler::new(opts.host_key_fingerprint.clone());
    let mismatch = handler.mismatch_flag();

    let addr = format!("{}:{}", opts.host, opts.port);
    debug!("Connecting to {}...", addr);

    let connect_result = timeout(
        opts.connect_timeout,
        client::connect(config, addr.as_str(), handler),
    )
    .await;

    let mut handle = match connect_result {
        Ok(Ok(handle)) => handle,
        Ok(Err(e)) => {
            if mismatch.load(Ordering::SeqCst) {
                return Err(Error::HostKeyMismatch(format!(
                    "server key for {} does not match the pinned fingerprint",
                    opts.host
                )));
            }
            return Err(classify_connect_error(e));
        }
        Err(_) => return Err(Error::ConnectTimeout(opts.connect_timeout.as_secs())),
    };

    authenticate(&mut handle, opts).await?;

    info!(
        "Connected to {}@{}:{}",
        opts.username, opts.host, opts.port
    );

    Ok(handle)
}

/// Run the authentication cascade: key, then password, then
/// keyboard-interactive. The first method that succeeds wins; `AuthFailed`
/// is only returned once every available method has been exhausted.
async fn authenticate(handle: &mut Handle<ClientHandler>, opts: &ConnectOptions) -> Result<()> {
    let mut attempted = Vec::new();

    if let Some(ref key_path) = opts.auth.key_path {
        attempted.push("publickey");
        let key_content = tokio::fs::read_to_string(key_path)
            .await
            .map_err(|e| Error::config(format!("cannot read key file {}: {e}", key_path.display())))?;
        let key = decode_secret_key(&key_content, None)
            .map_err(|e| Error::config(format!("cannot parse private key: {e}")))?;

        debug!("Attempting key authentication for '{}'", opts.username);
        let result = handle
            .authenticate_publickey(
                &opts.username,
                PrivateKeyWithHashAlg::new(Arc::new(key), None),
            )
            .await
            .map_err(|e| Error::auth(e.to_string()))?;
        if result.success() {
            debug!("Key authentication successful");
            return Ok(());
        }
        warn!("Key authentication rejected, trying next method");
    }

    if let Some(ref password) = opts.auth.ssh_password {
        attempted.push("password");
        debug!("Attempting password authentication for '{}'", opts.username);
        let result = handle
            .authenticate_password(&opts.username, password)
            .await
            .map_err(|e| Error::auth(e.to_string()))?;
        if result.success() {
            debug!("Password authentication successful");
            return Ok(());
        }
        warn!("Password authentication rejected, trying next method");

        attempted.push("keyboard-interactive");
        if keyboard_interactive(handle, &opts.username, password).await? {
            debug!("Keyboard-interactive authentication successful");
            return Ok(());
        }
    }

    if attempted.is_empty() {
        return Err(Error::auth(
            "no authentication method available (need a key path or a password)",
        ));
    }

    Err(Error::auth(format!(
        "all methods rejected ({})",
        attempted.join(", ")
    )))
}

/// Answer keyboard-interactive prompts with the configured password.
/// Returns false if the server rejects the exchange.
async fn keyboard_interactive(
    handle: &mut Handle<ClientHandler>,
    username: &str,
    password: &str,
) -> Result<bool> {
    let mut response = handle
        .authenticate_keyboard_interactive_start(username, None)
        .await
        .map_err(|e| Error::auth(e.to_string()))?;

    loop {
        match response {
            KeyboardInteractiveAuthResponse::Success => return Ok(true),
            KeyboardInteractiveAuthResponse::Failure { .. } => return Ok(false),
            KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                let answers: Vec<String> =
                    prompts.iter().map(|_| password.to_string()).collect();
                response = handle
                    .authenticate_keyboard_interactive_respond(answers)
                    .await
                    .map_err(|e| Error::auth(e.to_string()))?;
            }
        }
    }
}

/// Open the session's interactive shell channel: PTY, shell, preamble, and a
/// short drain so banner output never leaks into the first command.
pub async fn open_shell(handle: &Handle<ClientHandler>) -> Result<Channel<client::Msg>> {
    let channel = handle
        .channel_open_session()
        .await
        .map_err(|e| Error::ssh(format!("failed to open channel: {e}")))?;

    channel
        .request_pty(true, "xterm", 120, 30, 0, 0, &[])
        .await
        .map_err(|e| Error::ssh(format!("failed to request PTY: {e}")))?;

    channel
        .request_shell(true)
        .await
        .map_err(|e| Error::ssh(format!("failed to request shell: {e}")))?;

    channel
        .data(SHELL_PREAMBLE.as_bytes())
        .await
        .map_err(|e| Error::ssh(format!("failed to initialise shell: {e}")))?;

    drain_briefly(channel).await
}

/// Discard pending output (MOTD, login banner, preamble echo) for a short
/// settling period, then hand the channel back.
async fn drain_briefly(mut channel: Channel<client::Msg>) -> Result<Channel<client::Msg>> {
    let settle = Duration::from_millis(300);
    loop {
        match timeout(settle, channel.wait()).await {
            Ok(Some(ChannelMsg::Data { .. })) | Ok(Some(ChannelMsg::ExtendedData { .. })) => {
                continue;
            }
            Ok(Some(ChannelMsg::Close)) | Ok(Some(ChannelMsg::Eof)) | Ok(None) => {
                return Err(Error::ssh("shell channel closed during setup"));
            }
            Ok(Some(_)) => continue,
            Err(_) => return Ok(channel),
        }
    }
}

fn classify_connect_error(e: anyhow::Error) -> Error {
    match e.downcast_ref::<russh::Error>() {
        Some(russh::Error::IO(io)) => match io.kind() {
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::HostUnreachable
            | std::io::ErrorKind::NetworkUnreachable => Error::NetworkUnreachable(e.to_string()),
            _ => Error::ssh(e.to_string()),
        },
        _ => Error::ssh(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_connection_refused() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = classify_connect_error(anyhow::Error::from(russh::Error::IO(io)));
        assert_eq!(err.kind(), "network_unreachable");
    }

    #[test]
    fn test_classify_other_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err = classify_connect_error(anyhow::Error::from(russh::Error::IO(io)));
        assert_eq!(err.kind(), "ssh_error");
    }

    #[tokio::test]
    async fn test_establish_requires_auth_material() {
        // Unroutable address: establish fails well before authentication,
        // and the connect timeout bounds the wait.
        let opts = ConnectOptions::new("192.0.2.1", "nobody")
            .with_connect_timeout(Duration::from_millis(200));
        let err = match establish(&opts).await {
            Ok(_) => panic!("expected establish to fail"),
            Err(e) => e,
        };
        assert!(matches!(
            err,
            Error::ConnectTimeout(_) | Error::NetworkUnreachable(_) | Error::Ssh(_)
        ));
    }
}
