//! Interactive login session
//!
//! Drives `gcloud auth login --no-launch-browser` over an SSH pipe on the
//! target VM. The CLI is interactive: it prints a confirmation prompt
//! without a trailing newline, emits an authorization URL, then blocks until
//! the user-supplied key is written back to its stdin.
//!
//! Stdout and stderr are read byte-by-byte by two producer tasks feeding one
//! fan-in channel; a dedicated writer task owns stdin. The state machine
//! consuming the channel matches the prompt and the URL and answers through
//! the writer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;

use crate::error::{AppError, Result};
use crate::models::vm_instance;
use crate::services::ssh;

/// Overall deadline for one login attempt, covering both the URL handshake
/// and the key round-trip.
pub const LOGIN_DEADLINE: Duration = Duration::from_secs(5 * 60);

/// The CLI emits this confirmation without a trailing newline; it must be
/// recognized mid-buffer.
const CONFIRM_PROMPT: &str = "(Y/n)?";

const AUTH_URL_MARKER: &str = "https://accounts.google.com/o/oauth2/auth";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    None,
    BeginLogin,
    WaitKey,
    GotKey,
    Done,
    Fail,
}

impl SessionStatus {
    /// States in which the session owns the CLI process.
    fn is_active(self) -> bool {
        matches!(
            self,
            SessionStatus::BeginLogin | SessionStatus::WaitKey | SessionStatus::GotKey
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTag {
    Stdout,
    Stderr,
}

#[derive(Debug)]
struct OutputEvent {
    #[allow(dead_code)]
    stream: StreamTag,
    text: String,
}

struct SessionState {
    status: SessionStatus,
    msg: String,
}

pub struct AuthSession {
    pub session_id: String,
    pub email: String,
    pub vm: vm_instance::Model,
    state: parking_lot::Mutex<SessionState>,
    input_tx: mpsc::Sender<String>,
    events: Mutex<mpsc::Receiver<OutputEvent>>,
    child: Mutex<Option<Child>>,
    deadline: Instant,
}

impl AuthSession {
    /// Spawn the SSH login command on the VM and wire up the reader/writer
    /// tasks. The returned session is in state `None` until `do_login`.
    pub fn open(session_id: &str, email: &str, vm: vm_instance::Model) -> Result<Arc<Self>> {
        let mut child = ssh::spawn_login_command(&vm)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Ssh("login command has no stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Ssh("login command has no stderr".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Ssh("login command has no stdin".to_string()))?;

        let (event_tx, event_rx) = mpsc::channel::<OutputEvent>(100);
        let (input_tx, mut input_rx) = mpsc::channel::<String>(2);

        tokio::spawn(read_stream(stdout, StreamTag::Stdout, event_tx.clone()));
        tokio::spawn(read_stream(stderr, StreamTag::Stderr, event_tx));

        // Writer task: the only owner of stdin.
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = input_rx.recv().await {
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    tracing::info!(error = %e, "login stdin write failed");
                    return;
                }
                let _ = stdin.flush().await;
            }
        });

        Ok(Arc::new(AuthSession {
            session_id: session_id.to_string(),
            email: email.to_string(),
            vm,
            state: parking_lot::Mutex::new(SessionState {
                status: SessionStatus::None,
                msg: String::new(),
            }),
            input_tx,
            events: Mutex::new(event_rx),
            child: Mutex::new(Some(child)),
            deadline: Instant::now() + LOGIN_DEADLINE,
        }))
    }

    pub fn status(&self) -> SessionStatus {
        self.state.lock().status
    }

    pub fn message(&self) -> String {
        self.state.lock().msg.clone()
    }

    fn set_state(&self, status: SessionStatus, msg: &str) {
        let mut state = self.state.lock();
        state.status = status;
        state.msg = msg.to_string();
    }

    async fn fail(&self, msg: &str) {
        self.set_state(SessionStatus::Fail, msg);
        let mut child = self.child.lock().await;
        if let Some(child) = child.as_mut() {
            let _ = child.kill().await;
        }
    }

    /// Run the handshake until the CLI prints its authorization URL. Answers
    /// the confirmation prompt on the way. Returns the URL; the session is
    /// then parked in `WaitKey` until the user's key arrives.
    pub async fn do_login(&self) -> Result<String> {
        self.set_state(SessionStatus::BeginLogin, "");
        tracing::info!(session_id = %self.session_id, "login command started");

        let mut events = self.events.lock().await;
        loop {
            let remaining = self
                .deadline
                .checked_duration_since(Instant::now())
                .unwrap_or(Duration::ZERO);
            if remaining.is_zero() {
                self.fail("login handshake timed out").await;
                return Err(AppError::Ssh("login waiting timeout".to_string()));
            }

            // Cap each wait at 30s so a silently dead process is noticed.
            let step = remaining.min(Duration::from_secs(30));
            match tokio::time::timeout(step, events.recv()).await {
                Err(_) => {
                    let exited = {
                        let mut guard = self.child.lock().await;
                        guard.as_mut().and_then(|child| child.try_wait().ok().flatten())
                    };
                    if let Some(status) = exited {
                        self.fail("SSH process exited unexpectedly").await;
                        return Err(AppError::Ssh(format!(
                            "SSH process exited unexpectedly: {}",
                            status
                        )));
                    }
                }
                Ok(None) => {
                    self.fail("output channel closed").await;
                    return Err(AppError::Ssh("login output ended unexpectedly".to_string()));
                }
                Ok(Some(event)) => {
                    let line = event.text.trim();
                    if !line.is_empty() {
                        tracing::info!(session_id = %self.session_id, line, "login output");
                    }

                    if line.contains(CONFIRM_PROMPT) {
                        tracing::info!(session_id = %self.session_id, "answering confirmation prompt");
                        if self.input_tx.send("Y\n".to_string()).await.is_err() {
                            self.fail("stdin writer gone").await;
                            return Err(AppError::Ssh("failed to confirm prompt".to_string()));
                        }
                        continue;
                    }

                    if line.contains(AUTH_URL_MARKER) {
                        if let Some(url) = line
                            .split_whitespace()
                            .find(|part| part.starts_with(AUTH_URL_MARKER))
                        {
                            self.set_state(SessionStatus::WaitKey, "waiting for auth key");
                            tracing::info!(session_id = %self.session_id, "login URL extracted");
                            return Ok(url.to_string());
                        }
                    }
                }
            }
        }
    }

    /// Write the user's authorization key to the CLI and wait for it to
    /// exit. A session already in `Done` returns immediately; the CLI is
    /// never re-driven.
    pub async fn complete_login_token(&self, auth_key: &str) -> Result<()> {
        match self.status() {
            SessionStatus::Done => return Ok(()),
            SessionStatus::WaitKey => {}
            other => {
                return Err(AppError::Precondition(format!(
                    "session not waiting for a key (state: {:?})",
                    other
                )));
            }
        }

        self.set_state(SessionStatus::GotKey, "");
        if self
            .input_tx
            .send(format!("{}\n", auth_key))
            .await
            .is_err()
        {
            self.fail("stdin writer gone").await;
            return Err(AppError::Ssh("failed to send auth key".to_string()));
        }

        let remaining = self
            .deadline
            .checked_duration_since(Instant::now())
            .unwrap_or(Duration::ZERO);

        let mut guard = self.child.lock().await;
        let Some(mut child) = guard.take() else {
            self.set_state(SessionStatus::Fail, "login process already gone");
            return Err(AppError::Ssh("login process already gone".to_string()));
        };
        drop(guard);

        match tokio::time::timeout(remaining, child.wait()).await {
            Err(_) => {
                let _ = child.kill().await;
                self.set_state(SessionStatus::Fail, "login deadline exceeded");
                Err(AppError::Ssh("login deadline exceeded".to_string()))
            }
            Ok(Err(e)) => {
                self.set_state(SessionStatus::Fail, "failed to wait for login command");
                Err(AppError::Ssh(format!("failed to wait for login command: {}", e)))
            }
            Ok(Ok(status)) if status.success() => {
                self.set_state(SessionStatus::Done, "login succeeded");
                Ok(())
            }
            Ok(Ok(status)) => {
                self.set_state(SessionStatus::Fail, "login command failed");
                Err(AppError::Ssh(format!("login command failed: {}", status)))
            }
        }
    }
}

/// Read one stream byte-by-byte. Full lines are forwarded on newline; a
/// partial buffer is forwarded early when the confirmation prompt shows up
/// in it, since that prompt never gets its newline.
async fn read_stream<R>(mut reader: R, stream: StreamTag, tx: mpsc::Sender<OutputEvent>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = [0u8; 1];
    let mut acc = String::new();

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                if !acc.is_empty() {
                    let _ = tx.send(OutputEvent { stream, text: acc }).await;
                }
                return;
            }
            Ok(_) => {
                let ch = buf[0] as char;
                acc.push(ch);
                if ch == '\n' || acc.contains(CONFIRM_PROMPT) {
                    let text = std::mem::take(&mut acc);
                    if tx.send(OutputEvent { stream, text }).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::info!(error = %e, ?stream, "login stream read error");
                return;
            }
        }
    }
}

// ============================================================================
// Session cache
// ============================================================================

/// In-memory registry of login sessions, keyed by session id. Advisory
/// state: a restart drops it and callers must start over.
pub struct AuthSessionCache {
    sessions: RwLock<HashMap<String, Arc<AuthSession>>>,
}

impl Default for AuthSessionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthSessionCache {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a session. At most one session per email may be live at a
    /// time; a second concurrent login attempt is refused.
    pub async fn insert(&self, session: Arc<AuthSession>) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.session_id) {
            return Err(AppError::Precondition(format!(
                "a login task is already in progress: {}",
                session.session_id
            )));
        }
        if sessions
            .values()
            .any(|s| s.email == session.email && s.status().is_active())
        {
            return Err(AppError::Precondition(format!(
                "a login task is already in progress for {}",
                session.email
            )));
        }
        sessions.insert(session.session_id.clone(), session);
        Ok(())
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<AuthSession>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Drop a session once the post-login workflow no longer needs it.
    pub async fn remove(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_stream_forwards_full_lines() {
        let (tx, mut rx) = mpsc::channel(10);
        let data: &[u8] = b"first line\nsecond line\n";
        read_stream(data, StreamTag::Stdout, tx).await;

        assert_eq!(rx.recv().await.unwrap().text, "first line\n");
        assert_eq!(rx.recv().await.unwrap().text, "second line\n");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_read_stream_flushes_half_line_prompt() {
        let (tx, mut rx) = mpsc::channel(10);
        // No trailing newline on the prompt.
        let data: &[u8] = b"Do you want to continue (Y/n)?";
        read_stream(data, StreamTag::Stderr, tx).await;

        let event = rx.recv().await.unwrap();
        assert!(event.text.contains("(Y/n)?"));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_read_stream_flushes_trailing_partial_on_eof() {
        let (tx, mut rx) = mpsc::channel(10);
        let data: &[u8] = b"no newline at end";
        read_stream(data, StreamTag::Stdout, tx).await;
        assert_eq!(rx.recv().await.unwrap().text, "no newline at end");
    }

    #[test]
    fn test_active_states() {
        assert!(SessionStatus::BeginLogin.is_active());
        assert!(SessionStatus::WaitKey.is_active());
        assert!(SessionStatus::GotKey.is_active());
        assert!(!SessionStatus::None.is_active());
        assert!(!SessionStatus::Done.is_active());
        assert!(!SessionStatus::Fail.is_active());
    }
}
