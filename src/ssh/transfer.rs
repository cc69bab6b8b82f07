//! File transfer over the SFTP subsystem.
//!
//! Each call opens a fresh channel on the session's existing transport,
//! requests the `sftp` subsystem, and closes it when done; the interactive
//! shell channel is never involved. Paths must sit under one of the
//! configured allow-prefixes. Symlink traversal beyond a prefix is the
//! remote filesystem's concern, not checked here.

use russh_sftp::client::SftpSession;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use super::session::SshSession;
use crate::error::{Error, Result, TransferError};

/// Reject paths outside the allow-prefixes. Relative paths and parent
/// traversal are rejected outright since prefixes could not be enforced.
pub fn check_path(path: &str, allow_prefixes: &[String]) -> Result<()> {
    let path = path.trim();
    if path.is_empty() {
        return Err(Error::invalid_params("path must not be empty"));
    }
    if !path.starts_with('/') || path.contains("..") {
        return Err(TransferError::PathDenied(path.to_string()).into());
    }
    if allow_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
        Ok(())
    } else {
        Err(TransferError::PathDenied(path.to_string()).into())
    }
}

impl SshSession {
    /// Write `bytes` to `path` on the remote host. Returns bytes written.
    pub async fn upload(&self, path: &str, bytes: &[u8]) -> Result<u64> {
        check_path(path, &self.limits().transfer_allow_prefixes)?;
        let _guard = self.try_begin()?;

        let sftp = self.open_sftp().await?;
        let result = write_remote(&sftp, path, bytes).await;
        let _ = sftp.close().await;
        self.finish_op();

        let written = result?;
        info!("Session {}: uploaded {} bytes to {}", self.id(), written, path);
        Ok(written)
    }

    /// Read up to `max_bytes` from `path` on the remote host. The second
    /// element is true when the file was larger than the cap.
    pub async fn download(&self, path: &str, max_bytes: usize) -> Result<(Vec<u8>, bool)> {
        check_path(path, &self.limits().transfer_allow_prefixes)?;
        let cap = max_bytes.min(self.limits().download_cap_bytes);
        let _guard = self.try_begin()?;

        let sftp = self.open_sftp().await?;
        let result = read_remote(&sftp, path, cap).await;
        let _ = sftp.close().await;
        self.finish_op();

        let (bytes, truncated) = result?;
        info!(
            "Session {}: downloaded {} bytes from {} (truncated={})",
            self.id(),
            bytes.len(),
            path,
            truncated
        );
        Ok((bytes, truncated))
    }

    async fn open_sftp(&self) -> Result<SftpSession> {
        let channel = self
            .handle()
            .channel_open_session()
            .await
            .map_err(|e| Error::ssh(format!("failed to open transfer channel: {e}")))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| Error::ssh(format!("failed to request sftp subsystem: {e}")))?;
        debug!("Session {}: sftp subsystem ready", self.id());
        SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| Error::ssh(format!("failed to start sftp session: {e}")))
    }
}

async fn write_remote(sftp: &SftpSession, path: &str, bytes: &[u8]) -> Result<u64> {
    let mut file = sftp
        .create(path)
        .await
        .map_err(|e| TransferError::WriteFailed(format!("{path}: {e}")))?;
    file.write_all(bytes)
        .await
        .map_err(|e| TransferError::WriteFailed(format!("{path}: {e}")))?;
    file.shutdown()
        .await
        .map_err(|e| TransferError::WriteFailed(format!("{path}: {e}")))?;
    Ok(bytes.len() as u64)
}

async fn read_remote(sftp: &SftpSession, path: &str, cap: usize) -> Result<(Vec<u8>, bool)> {
    let size = sftp
        .metadata(path)
        .await
        .map_err(|e| TransferError::ReadFailed(format!("{path}: {e}")))?
        .size
        .unwrap_or(0);

    let file = sftp
        .open(path)
        .await
        .map_err(|e| TransferError::ReadFailed(format!("{path}: {e}")))?;

    let mut bytes = Vec::with_capacity(cap.min(size as usize));
    let mut handle = file.take(cap as u64);
    handle
        .read_to_end(&mut bytes)
        .await
        .map_err(|e| TransferError::ReadFailed(format!("{path}: {e}")))?;

    Ok((bytes, size > cap as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefixes() -> Vec<String> {
        vec![
            "/home/".to_string(),
            "/var/log/".to_string(),
            "/tmp/".to_string(),
            "/opt/".to_string(),
        ]
    }

    #[test]
    fn test_allowed_prefixes_pass() {
        assert!(check_path("/tmp/upload.txt", &prefixes()).is_ok());
        assert!(check_path("/var/log/syslog", &prefixes()).is_ok());
        assert!(check_path("/home/ops/notes.md", &prefixes()).is_ok());
    }

    #[test]
    fn test_system_paths_denied() {
        for path in ["/etc/shadow", "/proc/self/environ", "/boot/vmlinuz", "/dev/sda"] {
            let err = check_path(path, &prefixes()).unwrap_err();
            assert_eq!(err.kind(), "transfer_path_denied", "{path}");
        }
    }

    #[test]
    fn test_relative_and_traversal_paths_denied() {
        assert!(check_path("notes.txt", &prefixes()).is_err());
        assert!(check_path("/tmp/../etc/passwd", &prefixes()).is_err());
        assert!(check_path("/home/ops/../../etc/passwd", &prefixes()).is_err());
    }

    #[test]
    fn test_empty_path_is_invalid_params() {
        let err = check_path("   ", &prefixes()).unwrap_err();
        assert_eq!(err.kind(), "invalid_params");
    }

    #[test]
    fn test_prefix_must_match_from_root() {
        let err = check_path("/data/tmp/file", &prefixes()).unwrap_err();
        assert_eq!(err.kind(), "transfer_path_denied");
    }
}
