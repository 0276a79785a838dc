//! Host session: owns the workspace and its on-disk ZIP.
//!
//! The session is single-threaded and cooperative. Tool calls run
//! synchronously against the in-memory workspace; every mutating tool is
//! wrapped in a before/after snapshot pair recorded by the time machine,
//! and the workspace is persisted back to its ZIP path with an atomic
//! rename after each mutation. Guest execution is delegated to a separate
//! sandbox process with an independent wall-clock kill.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::history::{
    DiffReport, HistoryError, LogEntry, Snapshot, TimeMachine,
};
use crate::sandbox::{ExecRequest, ExecResponse, DEFAULT_ENTRY, DEFAULT_TIMEOUT_MS, EXIT_TIMEOUT};
use crate::tools::{self, Encoding, ReadLinesResult, SearchOptions, SearchSummary, ToolError};
use crate::workspace::{FsError, StatInfo, Workspace};

/// Environment variables the sandbox child keeps from the parent. The
/// guest-visible environment comes only from the request.
const RETAINED_CHILD_ENV: &[&str] = &["PATH", "HOME", "TMPDIR"];

static PERSIST_SEQ: AtomicU64 = AtomicU64::new(0);

/// Errors surfaced by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sandbox process failed: {0}")]
    Spawn(String),
    #[error("malformed sandbox response: {0}")]
    Protocol(String),
}

impl SessionError {
    /// Stable machine-readable code for the wire-level error object.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Tool(e) => e.code(),
            Self::History(_) => "history",
            Self::Fs(FsError::NotFound(_)) => "not-found",
            Self::Fs(FsError::NotADirectory(_) | FsError::IsADirectory(_)) => "not-a-directory",
            Self::Fs(FsError::NotEmpty(_)) => "non-empty",
            Self::Fs(FsError::AlreadyExists(_)) => "already-exists",
            Self::Fs(FsError::CorruptArchive(_)) => "corrupt-archive",
            Self::Fs(FsError::RootDelete) => "bad-request",
            Self::Io(_) => "io",
            Self::Spawn(_) => "spawn",
            Self::Protocol(_) => "protocol-failure",
        }
    }
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Where the workspace ZIP lives on disk.
    pub zip_path: PathBuf,
    /// Sandbox executable. Defaults to `coracle-sandbox` next to the
    /// current executable.
    pub sandbox_exe: Option<PathBuf>,
    /// Added to the script timeout for the outer wall-clock kill.
    pub timeout_slack: Duration,
}

impl SessionConfig {
    pub fn new(zip_path: impl Into<PathBuf>) -> Self {
        Self {
            zip_path: zip_path.into(),
            sandbox_exe: None,
            timeout_slack: Duration::from_millis(1000),
        }
    }
}

/// Parameters for [`HostSession::execute`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecuteOptions {
    pub entry_path: String,
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub timeout_ms: u64,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            entry_path: DEFAULT_ENTRY.to_string(),
            argv: Vec::new(),
            env: BTreeMap::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

/// Outcome of a guest execution as seen by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecReport {
    pub ok: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The host session.
pub struct HostSession {
    config: SessionConfig,
    ws: Workspace,
    tm: TimeMachine,
}

impl std::fmt::Debug for HostSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostSession")
            .field("zip_path", &self.config.zip_path)
            .finish_non_exhaustive()
    }
}

impl HostSession {
    /// Open the workspace ZIP at the configured path, creating an empty
    /// workspace (and persisting it) when the file does not exist.
    pub fn open(config: SessionConfig) -> Result<Self, SessionError> {
        let mut ws = Workspace::new();
        match std::fs::read(&config.zip_path) {
            Ok(bytes) => ws.import_zip(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %config.zip_path.display(), "creating new workspace");
            }
            Err(e) => return Err(e.into()),
        }
        let mut session = Self {
            config,
            ws,
            tm: TimeMachine::new(),
        };
        session.persist()?;
        Ok(session)
    }

    pub fn workspace(&self) -> &Workspace {
        &self.ws
    }

    // ---- read-only tools ---------------------------------------------------

    pub fn fs_read(
        &self,
        path: &str,
        enc: Encoding,
        max_bytes: u64,
    ) -> Result<String, SessionError> {
        Ok(tools::fs_read(&self.ws, path, enc, max_bytes)?)
    }

    pub fn fs_read_lines(
        &self,
        path: &str,
        start_line: usize,
        end_line: usize,
        max_bytes: u64,
    ) -> Result<ReadLinesResult, SessionError> {
        Ok(tools::fs_read_lines(
            &self.ws, path, start_line, end_line, max_bytes,
        )?)
    }

    pub fn fs_search(&self, opts: &SearchOptions) -> Result<SearchSummary, SessionError> {
        Ok(tools::search(&self.ws, opts)?)
    }

    pub fn fs_list(&self, path: &str) -> Result<Vec<String>, SessionError> {
        Ok(tools::fs_list(&self.ws, path)?)
    }

    pub fn fs_stat(&self, path: &str) -> Result<Option<StatInfo>, SessionError> {
        Ok(tools::fs_stat(&self.ws, path)?)
    }

    // ---- mutating tools ----------------------------------------------------

    pub fn fs_write(
        &mut self,
        path: &str,
        content: &str,
        enc: Encoding,
        overwrite: bool,
    ) -> Result<(), SessionError> {
        let before = Snapshot::of_paths(&self.ws, &[path]);
        tools::fs_write(&mut self.ws, path, content, enc, overwrite)?;
        let after = Snapshot::of_paths(&self.ws, &[path]);
        self.record("fs_write", path, &before, &after);
        self.persist()
    }

    pub fn fs_patch_lines(
        &mut self,
        path: &str,
        start_line: usize,
        end_line: usize,
        replacement: &str,
    ) -> Result<(), SessionError> {
        let before = Snapshot::of_paths(&self.ws, &[path]);
        tools::fs_patch_lines(&mut self.ws, path, start_line, end_line, replacement)?;
        let after = Snapshot::of_paths(&self.ws, &[path]);
        self.record("fs_patch_lines", path, &before, &after);
        self.persist()
    }

    pub fn fs_mkdir(&mut self, path: &str, recursive: bool) -> Result<(), SessionError> {
        let before = Snapshot::of_paths(&self.ws, &[path]);
        tools::fs_mkdir(&mut self.ws, path, recursive)?;
        let after = Snapshot::of_paths(&self.ws, &[path]);
        self.record("fs_mkdir", path, &before, &after);
        self.persist()
    }

    pub fn fs_delete(&mut self, path: &str) -> Result<(), SessionError> {
        let before = Snapshot::of_paths(&self.ws, &[path]);
        tools::fs_delete(&mut self.ws, path)?;
        let after = Snapshot::of_paths(&self.ws, &[path]);
        self.record("fs_delete", path, &before, &after);
        self.persist()
    }

    // ---- execution ---------------------------------------------------------

    /// Run a guest program in the sandbox process and merge the resulting
    /// workspace back in.
    pub fn execute(&mut self, opts: &ExecuteOptions) -> Result<ExecReport, SessionError> {
        let request = ExecRequest {
            zip_base64: BASE64.encode(self.ws.export_zip_buffer()?),
            entry_path: opts.entry_path.clone(),
            argv: opts.argv.clone(),
            env: opts.env.clone(),
            timeout_ms: opts.timeout_ms,
        };
        let before = Snapshot::full(&self.ws);

        let wall_budget = Duration::from_millis(opts.timeout_ms) + self.config.timeout_slack;
        let response = self.spawn_sandbox(&request, wall_budget)?;

        match response {
            ExecResponse::Success {
                stdout,
                stderr,
                exit_code,
                zip_base64,
                ..
            } => {
                let zip = BASE64
                    .decode(&zip_base64)
                    .map_err(|e| SessionError::Protocol(format!("bad zipBase64: {e}")))?;
                // Re-import replaces everything, including the journal the
                // child carried along untouched.
                self.ws.import_zip(&zip)?;
                let after = Snapshot::full(&self.ws);
                self.record("js_exec", &opts.entry_path, &before, &after);
                self.persist()?;
                Ok(ExecReport {
                    ok: true,
                    stdout,
                    stderr,
                    exit_code,
                    error: None,
                })
            }
            ExecResponse::Failure {
                error, exit_code, ..
            } => Ok(ExecReport {
                ok: false,
                stdout: String::new(),
                stderr: String::new(),
                exit_code,
                error: Some(error),
            }),
        }
    }

    fn sandbox_exe(&self) -> Result<PathBuf, SessionError> {
        if let Some(exe) = &self.config.sandbox_exe {
            return Ok(exe.clone());
        }
        let current = std::env::current_exe()?;
        let sibling = current.with_file_name("coracle-sandbox");
        Ok(sibling)
    }

    fn spawn_sandbox(
        &self,
        request: &ExecRequest,
        wall_budget: Duration,
    ) -> Result<ExecResponse, SessionError> {
        let exe = self.sandbox_exe()?;
        let mut command = Command::new(&exe);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear();
        for key in RETAINED_CHILD_ENV {
            if let Ok(value) = std::env::var(key) {
                command.env(key, value);
            }
        }

        let mut child = command
            .spawn()
            .map_err(|e| SessionError::Spawn(format!("{}: {e}", exe.display())))?;

        let payload =
            serde_json::to_vec(request).map_err(|e| SessionError::Protocol(e.to_string()))?;
        let mut stdin = child.stdin.take().expect("piped stdin");
        stdin.write_all(&payload)?;
        drop(stdin);

        let mut stdout = child.stdout.take().expect("piped stdout");
        let mut stderr = child.stderr.take().expect("piped stderr");
        let stdout_reader = std::thread::spawn(move || {
            let mut buf = Vec::new();
            std::io::Read::read_to_end(&mut stdout, &mut buf).ok();
            buf
        });
        let stderr_reader = std::thread::spawn(move || {
            let mut buf = Vec::new();
            std::io::Read::read_to_end(&mut stderr, &mut buf).ok();
            buf
        });

        let timed_out = wait_with_deadline(&mut child, wall_budget)?;
        let stdout_bytes = stdout_reader.join().unwrap_or_default();
        let stderr_bytes = stderr_reader.join().unwrap_or_default();

        if timed_out {
            warn!(exe = %exe.display(), "sandbox exceeded wall clock; killed");
            return Ok(ExecResponse::failure(
                "sandbox wall-clock timeout",
                String::new(),
                EXIT_TIMEOUT,
            ));
        }

        if !stderr_bytes.is_empty() {
            debug!(
                stderr = %String::from_utf8_lossy(&stderr_bytes),
                "sandbox diagnostics"
            );
        }

        serde_json::from_slice(&stdout_bytes).map_err(|e| {
            SessionError::Protocol(format!(
                "{e} (stdout was {} bytes)",
                stdout_bytes.len()
            ))
        })
    }

    // ---- history -----------------------------------------------------------

    pub fn history(&self, limit: usize) -> Result<Vec<LogEntry>, SessionError> {
        Ok(TimeMachine::log(&self.ws, limit)?)
    }

    pub fn undo(&mut self, steps: usize) -> Result<usize, SessionError> {
        let applied = self.tm.undo(&mut self.ws, steps)?;
        if applied > 0 {
            self.persist()?;
        }
        Ok(applied)
    }

    pub fn redo(&mut self, steps: usize) -> Result<usize, SessionError> {
        let applied = self.tm.redo(&mut self.ws, steps)?;
        if applied > 0 {
            self.persist()?;
        }
        Ok(applied)
    }

    pub fn restore(&mut self, id: &str) -> Result<(), SessionError> {
        self.tm.restore(&mut self.ws, id)?;
        self.persist()
    }

    pub fn diff(
        &self,
        id: &str,
        max_files: usize,
        max_preview_lines: usize,
    ) -> Result<DiffReport, SessionError> {
        Ok(TimeMachine::diff(&self.ws, id, max_files, max_preview_lines)?)
    }

    // ---- internals ---------------------------------------------------------

    /// Record a history entry. Recording failures are logged and swallowed
    /// so the primary operation is never blocked.
    fn record(&mut self, tool: &str, note: &str, before: &Snapshot, after: &Snapshot) {
        if let Err(e) = self.tm.record(&mut self.ws, tool, Some(note), before, after) {
            warn!(tool, error = %e, "history recording failed");
        }
    }

    /// Persist the workspace: write a temporary sibling, then rename over
    /// the destination. Falls back to delete-then-rename where the direct
    /// rename is refused.
    fn persist(&mut self) -> Result<(), SessionError> {
        let bytes = self.ws.export_zip_buffer()?;
        let seq = PERSIST_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp = sibling_tmp_path(&self.config.zip_path, seq);
        std::fs::write(&tmp, &bytes)?;
        match std::fs::rename(&tmp, &self.config.zip_path) {
            Ok(()) => Ok(()),
            Err(_) => {
                let _ = std::fs::remove_file(&self.config.zip_path);
                std::fs::rename(&tmp, &self.config.zip_path)?;
                Ok(())
            }
        }
    }
}

fn sibling_tmp_path(target: &Path, seq: u64) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "workspace.zip".to_string());
    target.with_file_name(format!("{name}.tmp-{}-{seq}", std::process::id()))
}

fn wait_with_deadline(child: &mut Child, budget: Duration) -> Result<bool, SessionError> {
    let deadline = Instant::now() + budget;
    loop {
        if child.try_wait()?.is_some() {
            return Ok(false);
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(true);
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::DEFAULT_MAX_READ_BYTES;

    fn session_in(dir: &tempfile::TempDir) -> HostSession {
        HostSession::open(SessionConfig::new(dir.path().join("workspace.zip"))).unwrap()
    }

    #[test]
    fn test_open_creates_zip_on_absence() {
        let dir = tempfile::tempdir().unwrap();
        let _session = session_in(&dir);
        assert!(dir.path().join("workspace.zip").exists());
    }

    #[test]
    fn test_write_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut session = session_in(&dir);
            session
                .fs_write("~/notes.txt", "remember", Encoding::Text, true)
                .unwrap();
        }
        let session = session_in(&dir);
        assert_eq!(
            session
                .fs_read("~/notes.txt", Encoding::Text, DEFAULT_MAX_READ_BYTES)
                .unwrap(),
            "remember"
        );
    }

    #[test]
    fn test_mutations_record_history() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_in(&dir);
        session
            .fs_write("~/a", "v1", Encoding::Text, true)
            .unwrap();
        session
            .fs_write("~/a", "v2", Encoding::Text, true)
            .unwrap();

        let log = session.history(10).unwrap();
        assert_eq!(log.len(), 2);
        assert!(log.iter().all(|e| e.tool == "fs_write"));
        assert!(log.iter().all(|e| e.applied));
    }

    #[test]
    fn test_undo_redo_through_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_in(&dir);
        session
            .fs_write("~/a", "v1", Encoding::Text, true)
            .unwrap();
        session
            .fs_write("~/a", "v2", Encoding::Text, true)
            .unwrap();

        assert_eq!(session.undo(1).unwrap(), 1);
        assert_eq!(
            session
                .fs_read("~/a", Encoding::Text, DEFAULT_MAX_READ_BYTES)
                .unwrap(),
            "v1"
        );
        assert_eq!(session.redo(1).unwrap(), 1);
        assert_eq!(
            session
                .fs_read("~/a", Encoding::Text, DEFAULT_MAX_READ_BYTES)
                .unwrap(),
            "v2"
        );
    }

    #[test]
    fn test_restore_across_gap() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_in(&dir);
        session
            .fs_write("~/f", "v1", Encoding::Text, true)
            .unwrap();
        session
            .fs_write("~/f", "v2", Encoding::Text, true)
            .unwrap();
        session
            .fs_write("~/f", "v3", Encoding::Text, true)
            .unwrap();

        let log = session.history(10).unwrap();
        session.restore(&log[1].id).unwrap();
        assert_eq!(
            session
                .fs_read("~/f", Encoding::Text, DEFAULT_MAX_READ_BYTES)
                .unwrap(),
            "v2"
        );
    }

    #[test]
    fn test_reserved_namespace_never_listed() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_in(&dir);
        session
            .fs_write("~/a.txt", "x", Encoding::Text, true)
            .unwrap();
        session.fs_mkdir("~/sub", true).unwrap();

        let names = session.fs_list("~/").unwrap();
        assert!(!names.contains(&".time".to_string()), "{names:?}");

        let err = session
            .fs_write("~/.time/x", "y", Encoding::Text, true)
            .unwrap_err();
        assert_eq!(err.code(), "access-denied");
    }

    #[test]
    fn test_diff_after_patch() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_in(&dir);
        session
            .fs_write("~/f", "one\ntwo\nthree", Encoding::Text, true)
            .unwrap();
        session.fs_patch_lines("~/f", 2, 2, "TWO").unwrap();

        let log = session.history(10).unwrap();
        let report = session.diff(&log[1].id, 10, 5).unwrap();
        assert_eq!(report.ops.len(), 1);
        let preview = report.ops[0].preview.as_ref().unwrap();
        assert_eq!(preview.before, vec!["two"]);
        assert_eq!(preview.after, vec!["TWO"]);
    }

    #[test]
    fn test_spawn_failure_is_structured() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SessionConfig::new(dir.path().join("ws.zip"));
        config.sandbox_exe = Some(dir.path().join("does-not-exist"));
        let mut session = HostSession::open(config).unwrap();
        let err = session.execute(&ExecuteOptions::default()).unwrap_err();
        assert!(matches!(err, SessionError::Spawn(_)));
        assert_eq!(err.code(), "spawn");
    }
}
