//! SSH session runtime: transport, authentication, the interactive command
//! loop with its prompt interposer, and SFTP file transfer.

pub mod config;
pub mod connection;
pub mod handler;
pub mod interposer;
pub mod session;
pub mod transfer;

// Re-exports
pub use config::{AuthMaterial, ConnectOptions};
pub use handler::ClientHandler;
pub use interposer::{Interposer, PromptEvent, PromptKind, Redactor};
pub use session::{ExecutionOutcome, SessionInfo, SessionLimits, SessionState, SshSession};
