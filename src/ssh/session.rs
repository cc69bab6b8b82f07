//! Persistent SSH session.
//!
//! Each session owns one authenticated transport and one interactive PTY
//! shell channel, so working directory and environment persist across
//! commands. Command execution runs a sentinel protocol over the shell: the
//! output of each command is bracketed by a freshly drawn random token, with
//! an exit-status/cwd trailer between the output and the closing bracket.
//! The prompt interposer inspects every chunk as it arrives; byte, line, and
//! wall-clock caps are enforced between chunks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use russh::client::{self, Handle};
use russh::{Channel, ChannelMsg};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::config::{AuthMaterial, ConnectOptions};
use super::connection::{establish, open_shell};
use super::handler::ClientHandler;
use super::interposer::{Interposer, PromptEvent, Redactor};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::policy::PolicyEngine;
use crate::prompts::PendingPrompts;

/// How long the proactive sudo watchdog waits for output before injecting
const PROACTIVE_SUDO_DELAY: Duration = Duration::from_secs(2);

/// Poll granularity of the channel read loop
const READ_POLL: Duration = Duration::from_millis(250);

/// Secondary deadline for draining to the sentinel after a cap fires
const DRAIN_DEADLINE: Duration = Duration::from_secs(2);

/// Lifecycle of a session's channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Busy,
    Broken,
    Closed,
}

/// Result of executing one command
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: Option<i64>,
    pub duration_ms: u64,
    pub truncated: bool,
    pub timeout: bool,
    pub denied_reason: Option<String>,
}

impl ExecutionOutcome {
    fn denied(reason: String) -> Self {
        Self {
            denied_reason: Some(reason),
            ..Self::default()
        }
    }
}

/// Resource caps and transfer policy carried by every session
#[derive(Debug, Clone)]
pub struct SessionLimits {
    pub command_timeout_ms: u64,
    pub max_output_bytes: usize,
    pub max_output_lines: usize,
    pub prompt_window_bytes: usize,
    pub pending_prompt_ttl: Duration,
    pub download_cap_bytes: usize,
    pub transfer_allow_prefixes: Vec<String>,
}

impl SessionLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            command_timeout_ms: config.command_timeout_ms,
            max_output_bytes: config.max_output_bytes,
            max_output_lines: config.max_output_lines,
            prompt_window_bytes: config.prompt_window_bytes,
            pending_prompt_ttl: Duration::from_secs(config.pending_prompt_ttl_secs),
            download_cap_bytes: config.max_output_bytes,
            transfer_allow_prefixes: config.transfer_allow_prefixes.clone(),
        }
    }
}

/// Summary returned by the registry's list operation
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub created_at_unix: u64,
    pub idle_for_secs: u64,
    pub cwd: String,
    pub connected: bool,
}

struct Meta {
    last_used: Instant,
    cwd: String,
}

/// A live SSH session: transport, one interactive shell channel, and the
/// bookkeeping the registry needs.
pub struct SshSession {
    id: String,
    host: String,
    port: u16,
    username: String,
    handle: Handle<ClientHandler>,
    shell: Mutex<Option<Channel<client::Msg>>>,
    in_flight: Mutex<()>,
    state: StdMutex<SessionState>,
    connected: AtomicBool,
    created_at: SystemTime,
    meta: StdMutex<Meta>,
    auth: AuthMaterial,
    limits: SessionLimits,
    redactor: Redactor,
    prompts: Arc<PendingPrompts>,
    auto_accept_host: bool,
}

impl SshSession {
    /// Open the transport, authenticate, and prepare the interactive shell.
    pub async fn connect(
        id: String,
        opts: ConnectOptions,
        limits: SessionLimits,
        redactor: Redactor,
        prompts: Arc<PendingPrompts>,
        auto_accept_host: bool,
    ) -> Result<Self> {
        let handle = establish(&opts).await?;
        let shell = open_shell(&handle).await?;

        info!("Session {} ready for {}@{}", id, opts.username, opts.host);

        Ok(Self {
            id,
            host: opts.host,
            port: opts.port,
            username: opts.username,
            handle,
            shell: Mutex::new(Some(shell)),
            in_flight: Mutex::new(()),
            state: StdMutex::new(SessionState::Idle),
            connected: AtomicBool::new(true),
            created_at: SystemTime::now(),
            meta: StdMutex::new(Meta {
                last_used: Instant::now(),
                cwd: "~".to_string(),
            }),
            auth: opts.auth,
            limits,
            redactor,
            prompts,
            auto_accept_host,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub fn idle_for(&self) -> Duration {
        self.meta.lock().expect("meta lock poisoned").last_used.elapsed()
    }

    pub fn info(&self) -> SessionInfo {
        let meta = self.meta.lock().expect("meta lock poisoned");
        SessionInfo {
            id: self.id.clone(),
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            created_at_unix: self
                .created_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            idle_for_secs: meta.last_used.elapsed().as_secs(),
            cwd: meta.cwd.clone(),
            connected: self.is_connected(),
        }
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().expect("state lock poisoned") = state;
    }

    fn touch(&self) {
        self.meta.lock().expect("meta lock poisoned").last_used = Instant::now();
    }

    fn mark_broken(&self) {
        self.set_state(SessionState::Broken);
    }

    /// Take the in-flight guard or fail with `BusySession`. Shared by run
    /// and the transfer operations.
    pub(crate) fn try_begin(&self) -> Result<tokio::sync::MutexGuard<'_, ()>> {
        if !self.is_connected() || self.state() == SessionState::Closed {
            return Err(Error::broken("session is not connected"));
        }
        if self.state() == SessionState::Broken {
            return Err(Error::broken("session channel is broken; reconnect"));
        }
        self.in_flight
            .try_lock()
            .map_err(|_| Error::BusySession(self.id.clone()))
    }

    pub(crate) fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    pub(crate) fn handle(&self) -> &Handle<ClientHandler> {
        &self.handle
    }

    pub(crate) fn finish_op(&self) {
        self.touch();
        if self.state() == SessionState::Busy {
            self.set_state(SessionState::Idle);
        }
    }

    /// Execute one command under the active policy.
    ///
    /// The policy check happens before any channel I/O; a deny produces an
    /// outcome with `denied_reason` set and no bytes sent. Serialisation is
    /// by try-lock: a concurrent call fails fast with `BusySession` rather
    /// than queueing.
    pub async fn run(
        &self,
        command: &str,
        timeout_ms: Option<u64>,
        sudo_password: Option<&str>,
        policy: &PolicyEngine,
    ) -> Result<ExecutionOutcome> {
        let guard = self.try_begin()?;

        if command.contains('\n') {
            return Err(Error::invalid_params("command must be a single line"));
        }

        let verdict = policy.validate(command);
        if !verdict.allowed {
            debug!("Session {}: denied: {}", self.id, verdict.reason);
            drop(guard);
            self.touch();
            return Ok(ExecutionOutcome::denied(verdict.reason));
        }

        self.set_state(SessionState::Busy);
        let started = Instant::now();
        let wall_timeout =
            Duration::from_millis(timeout_ms.unwrap_or(self.limits.command_timeout_ms));

        let result = self
            .run_inner(command, wall_timeout, sudo_password, started)
            .await;

        drop(guard);
        self.finish_op();

        match result {
            Ok(mut outcome) => {
                if outcome.duration_ms == 0 {
                    outcome.duration_ms = started.elapsed().as_millis() as u64;
                }
                if outcome.stderr.len() > self.limits.max_output_bytes {
                    let mut cut = self.limits.max_output_bytes;
                    while cut > 0 && !outcome.stderr.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    outcome.stderr.truncate(cut);
                    outcome.truncated = true;
                    outcome.exit_status = None;
                }
                outcome.stdout = self.redactor.redact(&outcome.stdout);
                outcome.stderr = self.redactor.redact(&outcome.stderr);
                self.log_completion(command, &outcome);
                Ok(outcome)
            }
            Err(e) => Err(e),
        }
    }

    async fn run_inner(
        &self,
        command: &str,
        wall_timeout: Duration,
        sudo_password: Option<&str>,
        started: Instant,
    ) -> Result<ExecutionOutcome> {
        let mut channel = {
            let mut guard = self.shell.lock().await;
            match guard.take() {
                Some(ch) => ch,
                None => {
                    self.mark_broken();
                    return Err(Error::broken("shell channel is gone"));
                }
            }
        };

        let sentinel = fresh_sentinel();
        let framed = format!(
            "echo {s}; {command}; echo \"__RC_$?__$PWD\"; echo {s}\n",
            s = sentinel
        );

        if let Err(e) = channel.data(framed.as_bytes()).await {
            self.mark_broken();
            return Err(Error::broken(format!("failed to send command: {e}")));
        }

        let mut interposer = Interposer::for_command(
            command,
            &self.auth,
            sudo_password,
            self.limits.prompt_window_bytes,
            self.auto_accept_host,
        );
        let mut assembler = OutputAssembler::new(
            &sentinel,
            self.limits.max_output_bytes,
            self.limits.max_output_lines,
        );
        let mut stderr = String::new();
        let deadline = started + wall_timeout;

        let verdict: RunEnd = loop {
            if assembler.finished {
                break RunEnd::Complete;
            }
            if assembler.truncated {
                break RunEnd::Truncated;
            }
            let now = Instant::now();
            if now >= deadline {
                break RunEnd::TimedOut;
            }
            let poll = READ_POLL.min(deadline - now);

            match timeout(poll, channel.wait()).await {
                Ok(Some(ChannelMsg::Data { data })) => {
                    let text = String::from_utf8_lossy(&data).into_owned();
                    let event = interposer.absorb(&text);
                    assembler.push(&text);
                    if let Some(event) = event {
                        match self
                            .handle_prompt_event(event, &mut channel, &mut interposer, deadline)
                            .await
                        {
                            // The prompt was consumed; its text must not leak
                            // into the command output.
                            PromptOutcome::Continue => assembler.clear_partial(),
                            PromptOutcome::Ignored => {}
                            PromptOutcome::Abort(err) => {
                                self.reset_channel(channel).await;
                                return Err(err);
                            }
                        }
                    }
                }
                Ok(Some(ChannelMsg::ExtendedData { data, ext })) => {
                    let text = String::from_utf8_lossy(&data).into_owned();
                    if ext == 1 {
                        stderr.push_str(&text);
                        assembler.count_stderr(text.len());
                    } else {
                        assembler.push(&text);
                    }
                }
                Ok(Some(ChannelMsg::Close)) | Ok(Some(ChannelMsg::Eof)) | Ok(None) => {
                    if !self.is_connected() {
                        return Err(Error::broken("session disconnected during command"));
                    }
                    self.mark_broken();
                    return Err(Error::broken("channel closed during command"));
                }
                Ok(Some(_)) => {}
                Err(_) => {
                    // Proactive sudo watchdog: the shell echoes the opening
                    // sentinel almost immediately, so "no output" means no
                    // bytes attributable to the command body after it. Some
                    // sudo configurations block without emitting a prompt.
                    if assembler.started
                        && !assembler.body_output_seen()
                        && started.elapsed() >= PROACTIVE_SUDO_DELAY
                    {
                        if let Some(secret) = interposer.proactive_sudo_secret() {
                            debug!("Session {}: proactive sudo injection", self.id);
                            let line = format!("{secret}\n");
                            if channel.data(line.as_bytes()).await.is_err() {
                                self.mark_broken();
                                return Err(Error::broken("failed to write secret"));
                            }
                            interposer.mark_injected();
                        }
                    }
                }
            }
        };

        match verdict {
            RunEnd::Complete => {
                {
                    let mut guard = self.shell.lock().await;
                    *guard = Some(channel);
                }
                if let Some(cwd) = assembler.cwd.clone() {
                    self.meta.lock().expect("meta lock poisoned").cwd = cwd;
                }
                let mut outcome = assembler.into_outcome();
                outcome.stderr = stderr;
                Ok(outcome)
            }
            RunEnd::Truncated => {
                // Drain to the sentinel so the next command starts clean.
                let drained = drain_to_sentinel(&mut channel, &mut assembler).await;
                if drained {
                    let mut guard = self.shell.lock().await;
                    *guard = Some(channel);
                } else {
                    self.reset_channel(channel).await;
                }
                let mut outcome = assembler.into_outcome();
                outcome.stderr = stderr;
                outcome.truncated = true;
                outcome.exit_status = None;
                Ok(outcome)
            }
            RunEnd::TimedOut => {
                // Measured before the channel reset so the reported duration
                // stays within the caller's deadline plus scheduling slack.
                let duration_ms = started.elapsed().as_millis() as u64;
                warn!(
                    "Session {}: command timed out after {}ms",
                    self.id,
                    wall_timeout.as_millis()
                );
                self.reset_channel(channel).await;
                let mut outcome = assembler.into_outcome();
                outcome.stderr = stderr;
                outcome.timeout = true;
                outcome.exit_status = None;
                outcome.duration_ms = duration_ms;
                Ok(outcome)
            }
        }
    }

    async fn handle_prompt_event(
        &self,
        event: PromptEvent,
        channel: &mut Channel<client::Msg>,
        interposer: &mut Interposer,
        deadline: Instant,
    ) -> PromptOutcome {
        match event {
            PromptEvent::Inject { kind, secret } => {
                debug!("Session {}: injecting secret for {} prompt", self.id, kind.as_str());
                let line = format!("{secret}\n");
                if channel.data(line.as_bytes()).await.is_err() {
                    self.mark_broken();
                    return PromptOutcome::Abort(Error::broken("failed to write secret"));
                }
                interposer.mark_injected();
                PromptOutcome::Continue
            }
            PromptEvent::Notice { kind, text } => {
                warn!(
                    "Session {}: {} diagnostic: {}",
                    self.id,
                    kind.as_str(),
                    self.redactor.redact(&text)
                );
                PromptOutcome::Ignored
            }
            PromptEvent::Pending { kind, text } => {
                if !self.auth.interactive_enabled {
                    return PromptOutcome::Abort(Error::PasswordRequired(format!(
                        "unresolvable {} prompt: {}",
                        kind.as_str(),
                        self.redactor.redact(&text)
                    )));
                }
                let (request_id, rx) = self
                    .prompts
                    .register(self.id.clone(), kind, self.redactor.redact(&text))
                    .await;
                info!(
                    "Session {}: password request {} registered for {} prompt",
                    self.id,
                    request_id,
                    kind.as_str()
                );

                let remaining = deadline.saturating_duration_since(Instant::now());
                let wait = self.limits.pending_prompt_ttl.min(remaining);
                match timeout(wait, rx).await {
                    Ok(Ok(Some(password))) => {
                        let line = format!("{password}\n");
                        if channel.data(line.as_bytes()).await.is_err() {
                            self.mark_broken();
                            return PromptOutcome::Abort(Error::broken(
                                "failed to write secret",
                            ));
                        }
                        interposer.mark_injected();
                        PromptOutcome::Continue
                    }
                    Ok(Ok(None)) => PromptOutcome::Abort(Error::PasswordRequired(format!(
                        "password request {request_id} was cancelled"
                    ))),
                    Ok(Err(_)) | Err(_) => {
                        self.prompts.cancel(&request_id).await;
                        PromptOutcome::Abort(Error::PasswordRequired(format!(
                            "password request {request_id} was not answered in time"
                        )))
                    }
                }
            }
        }
    }

    /// Replace the shell channel after a timeout or an aborted prompt wait.
    /// The old channel is dropped (killing whatever was running in it); if a
    /// fresh one cannot be opened the session is broken.
    async fn reset_channel(&self, old: Channel<client::Msg>) {
        drop(old);
        match open_shell(&self.handle).await {
            Ok(fresh) => {
                let mut guard = self.shell.lock().await;
                *guard = Some(fresh);
            }
            Err(e) => {
                warn!("Session {}: could not reopen shell: {e}", self.id);
                self.mark_broken();
            }
        }
    }

    /// Close channels and transport. Idempotent; the registry calls this on
    /// eviction and shutdown, the disconnect tool calls it directly.
    pub async fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        self.set_state(SessionState::Closed);

        {
            let mut guard = self.shell.lock().await;
            if let Some(ch) = guard.take() {
                let _ = ch.eof().await;
            }
        }
        let _ = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "")
            .await;

        info!("Session {} disconnected", self.id);
    }

    /// Commands whose head carries credentials are logged without arguments.
    fn log_completion(&self, command: &str, outcome: &ExecutionOutcome) {
        let head = command.split_whitespace().next().unwrap_or("");
        let loggable = !matches!(head, "passwd" | "su" | "sudo" | "ssh" | "scp");
        if loggable {
            info!(
                "Session {}: '{}' exit={:?} {}ms truncated={} timeout={}",
                self.id,
                command,
                outcome.exit_status,
                outcome.duration_ms,
                outcome.truncated,
                outcome.timeout
            );
        } else {
            info!(
                "Session {}: '{}' (arguments withheld) exit={:?} {}ms",
                self.id, head, outcome.exit_status, outcome.duration_ms
            );
        }
    }
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("state", &self.state())
            .finish()
    }
}

enum RunEnd {
    Complete,
    Truncated,
    TimedOut,
}

enum PromptOutcome {
    Continue,
    Ignored,
    Abort(Error),
}

fn fresh_sentinel() -> String {
    let bytes: [u8; 16] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// Sentinel stream assembly
// ---------------------------------------------------------------------------

/// Line-oriented parser for the sentinel protocol. Output before the opening
/// sentinel is discarded, the `__RC_<status>__<cwd>` trailer is lifted out of
/// band, and byte/line caps are enforced on the content in between.
struct OutputAssembler {
    sentinel: String,
    partial: String,
    started: bool,
    finished: bool,
    content: String,
    content_lines: usize,
    stderr_bytes: usize,
    exit_status: Option<i64>,
    cwd: Option<String>,
    truncated: bool,
    max_bytes: usize,
    max_lines: usize,
}

impl OutputAssembler {
    fn new(sentinel: &str, max_bytes: usize, max_lines: usize) -> Self {
        Self {
            sentinel: sentinel.to_string(),
            partial: String::new(),
            started: false,
            finished: false,
            content: String::new(),
            content_lines: 0,
            stderr_bytes: 0,
            exit_status: None,
            cwd: None,
            truncated: false,
            max_bytes,
            max_lines,
        }
    }

    fn push(&mut self, chunk: &str) {
        self.partial.push_str(chunk);
        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial[..pos].trim_end_matches('\r').to_string();
            self.partial.drain(..=pos);
            self.process_line(&line);
            if self.finished {
                self.partial.clear();
                return;
            }
        }
    }

    fn process_line(&mut self, line: &str) {
        let trimmed = line.trim();
        if !self.started {
            if trimmed == self.sentinel {
                self.started = true;
            }
            return;
        }
        if trimmed == self.sentinel {
            self.finished = true;
            return;
        }
        if let Some(rest) = trimmed.strip_prefix("__RC_") {
            if let Some(sep) = rest.find("__") {
                if let Ok(status) = rest[..sep].parse::<i64>() {
                    self.exit_status = Some(status);
                    let cwd = &rest[sep + 2..];
                    if !cwd.is_empty() {
                        self.cwd = Some(cwd.to_string());
                    }
                    return;
                }
            }
        }
        if self.truncated {
            return;
        }
        self.content.push_str(line);
        self.content.push('\n');
        self.content_lines += 1;
        if self.total_bytes() >= self.max_bytes || self.content_lines >= self.max_lines {
            self.truncated = true;
        }
    }

    /// PTY-mode stderr frames still count against the byte cap
    fn count_stderr(&mut self, len: usize) {
        self.stderr_bytes += len;
        if self.total_bytes() >= self.max_bytes {
            self.truncated = true;
        }
    }

    fn total_bytes(&self) -> usize {
        self.content.len() + self.stderr_bytes
    }

    /// Whether any output attributable to the command body has arrived since
    /// the opening sentinel. Drives the proactive sudo watchdog.
    fn body_output_seen(&self) -> bool {
        self.started
            && (!self.content.is_empty()
                || !self.partial.is_empty()
                || self.stderr_bytes > 0
                || self.exit_status.is_some()
                || self.finished)
    }

    /// Drop the unterminated tail line (called after a prompt is handled, so
    /// consumed prompt text never lands in the output)
    fn clear_partial(&mut self) {
        self.partial.clear();
    }

    fn into_outcome(mut self) -> ExecutionOutcome {
        if self.truncated {
            let budget = self.max_bytes.saturating_sub(self.stderr_bytes);
            if self.content.len() > budget {
                let mut cut = budget;
                while cut > 0 && !self.content.is_char_boundary(cut) {
                    cut -= 1;
                }
                self.content.truncate(cut);
            }
        }
        ExecutionOutcome {
            stdout: self.content,
            stderr: String::new(),
            exit_status: if self.truncated { None } else { self.exit_status },
            duration_ms: 0,
            truncated: self.truncated,
            timeout: false,
            denied_reason: None,
        }
    }
}

async fn drain_to_sentinel(
    channel: &mut Channel<client::Msg>,
    assembler: &mut OutputAssembler,
) -> bool {
    let deadline = Instant::now() + DRAIN_DEADLINE;
    while !assembler.finished {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        match timeout(deadline - now, channel.wait()).await {
            Ok(Some(ChannelMsg::Data { data })) => {
                assembler.push(&String::from_utf8_lossy(&data));
            }
            Ok(Some(ChannelMsg::ExtendedData { .. })) => {}
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => return false,
        }
    }
    true
}
