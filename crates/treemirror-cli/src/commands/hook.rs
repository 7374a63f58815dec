//! Editor/agent session hooks
//!
//! Session hosts call these with a JSON payload `{"cwd", "session_id"}` on
//! stdin:
//!
//! - `session-start` makes sure a background watcher covers `cwd` and
//!   remembers which watcher the session relies on
//! - `session-end` forgets the session and stops its watcher once no other
//!   open session relies on it
//!
//! Sessions are recorded as `<state_dir>/sessions/<session_id>.json`.

use std::fs;
use std::io::{self, ErrorKind, Read};
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use treemirror_supervisor::supervisor::{DaemonSupervisor, EnsureOutcome};

use crate::context::CliContext;

/// Session id used when the payload carries none
const UNKNOWN_SESSION: &str = "unknown";

/// Session lifecycle hooks
#[derive(Debug, Subcommand)]
pub enum HookCommand {
    /// Ensure a watcher runs for the session's working directory
    SessionStart,
    /// Stop the session's watcher unless other sessions still use it
    SessionEnd,
}

/// Payload a session host writes to stdin
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HookPayload {
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl HookPayload {
    pub fn session_id(&self) -> &str {
        self.session_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or(UNKNOWN_SESSION)
    }
}

/// Parses the hook payload; `None` for empty or malformed input
pub fn parse_payload(raw: &str) -> Option<HookPayload> {
    if raw.trim().is_empty() {
        warn!("No payload received");
        return None;
    }
    match serde_json::from_str::<HookPayload>(raw) {
        Ok(payload) => Some(payload),
        Err(err) => {
            warn!(error = %err, "Failed to decode hook payload");
            None
        }
    }
}

// ============================================================================
// Session registry
// ============================================================================

/// Which watcher a session relies on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    /// Directory of the covering watcher
    pub dir: PathBuf,
    /// Watcher pid when known
    #[serde(default)]
    pub pid: Option<u32>,
}

/// Session files under `<state_dir>/sessions`
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    dir: PathBuf,
}

impl SessionRegistry {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join("sessions"),
        }
    }

    fn path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(session_id)))
    }

    pub fn save(&self, record: &SessionRecord) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path(&record.session_id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(record)?)?;
        fs::rename(&tmp, &path)
    }

    pub fn load(&self, session_id: &str) -> Option<SessionRecord> {
        let bytes = fs::read(self.path(session_id)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub fn remove(&self, session_id: &str) -> io::Result<()> {
        match fs::remove_file(self.path(session_id)) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Points sessions recorded below `dir` at the watcher now covering them
    ///
    /// Returns how many sessions moved.
    pub fn adopt(&self, dir: &Path, pid: u32) -> usize {
        let mut moved = 0;
        for mut record in self.all() {
            if record.dir == dir || !record.dir.starts_with(dir) {
                continue;
            }
            record.dir = dir.to_path_buf();
            record.pid = Some(pid);
            match self.save(&record) {
                Ok(()) => moved += 1,
                Err(err) => {
                    warn!(session_id = %record.session_id, error = %err, "Failed to move session")
                }
            }
        }
        moved
    }

    /// Every readable session record
    pub fn all(&self) -> Vec<SessionRecord> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("json"))
            .filter_map(|path| fs::read(path).ok())
            .filter_map(|bytes| serde_json::from_slice(&bytes).ok())
            .collect()
    }
}

/// Session ids come from the host; keep them to a safe file name
fn file_stem(session_id: &str) -> String {
    let stem: String = session_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if stem.is_empty() {
        UNKNOWN_SESSION.to_string()
    } else {
        stem
    }
}

// ============================================================================
// Hook logic
// ============================================================================

fn start_response(dir: Option<&Path>) -> serde_json::Value {
    let context = match dir {
        Some(dir) => format!(
            "treemirror keeps {} mirrored into the remote store. Prefer the \
             treemirror search service for semantic searches over this tree.",
            dir.display()
        ),
        None => "treemirror is installed. Prefer the treemirror search service for \
                 semantic searches over the mirrored tree."
            .to_string(),
    };
    serde_json::json!({
        "hookSpecificOutput": {
            "hookEventName": "SessionStart",
            "additionalContext": context,
        }
    })
}

/// Handles `session-start`; always answers with the hook response
///
/// Failures to resolve the directory or to start the watcher are logged,
/// never surfaced to the session host.
pub fn session_start(
    supervisor: &DaemonSupervisor,
    sessions: &SessionRegistry,
    payload: &HookPayload,
) -> serde_json::Value {
    let session_id = payload.session_id();
    let requested = match &payload.cwd {
        Some(cwd) => cwd.clone(),
        None => match std::env::current_dir() {
            Ok(dir) => dir,
            Err(err) => {
                warn!(error = %err, "No working directory for session");
                return start_response(None);
            }
        },
    };
    let dir = match fs::canonicalize(&requested) {
        Ok(dir) => dir,
        Err(err) => {
            warn!(dir = %requested.display(), error = %err, "Cannot resolve session directory");
            return start_response(None);
        }
    };

    let (daemon_dir, pid) = match supervisor.ensure_daemon(&dir) {
        Ok(EnsureOutcome::AlreadyCovered(record)) => (record.dir, Some(record.pid)),
        Ok(EnsureOutcome::StartInProgress) => (dir.clone(), None),
        Ok(EnsureOutcome::Started { pid, replaced }) => {
            if !replaced.is_empty() {
                let moved = sessions.adopt(&dir, pid);
                debug!(dir = %dir.display(), moved, "Sessions moved to the new watcher");
            }
            (dir.clone(), Some(pid))
        }
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "Failed to start watcher");
            return start_response(Some(&dir));
        }
    };

    let record = SessionRecord {
        session_id: session_id.to_string(),
        dir: daemon_dir,
        pid,
    };
    match sessions.save(&record) {
        Ok(()) => info!(session_id, dir = %record.dir.display(), "Session registered"),
        Err(err) => warn!(session_id, error = %err, "Failed to record session"),
    }
    start_response(Some(&dir))
}

/// Handles `session-end`
///
/// Returns true if a watcher was stopped.
pub fn session_end(
    supervisor: &DaemonSupervisor,
    sessions: &SessionRegistry,
    payload: &HookPayload,
) -> bool {
    let session_id = payload.session_id();
    let Some(record) = sessions.load(session_id) else {
        debug!(session_id, "No session record, nothing to stop");
        return false;
    };
    if let Err(err) = sessions.remove(session_id) {
        warn!(session_id, error = %err, "Failed to remove session record");
    }

    if sessions
        .all()
        .iter()
        .any(|other| other.dir.starts_with(&record.dir))
    {
        info!(dir = %record.dir.display(), "Watcher still used by another session");
        return false;
    }

    match supervisor.stop_daemon(&record.dir) {
        Ok(stopped) => {
            info!(session_id, dir = %record.dir.display(), stopped, "Session ended");
            stopped
        }
        Err(err) => {
            warn!(session_id, error = %err, "Failed to stop watcher");
            false
        }
    }
}

impl HookCommand {
    pub async fn execute(&self, ctx: &CliContext) -> Result<()> {
        let mut raw = String::new();
        if let Err(err) = io::stdin().read_to_string(&mut raw) {
            warn!(error = %err, "Failed to read hook payload");
        }
        let Some(payload) = parse_payload(&raw) else {
            println!("{}", serde_json::json!({"error": "No payload received"}));
            std::process::exit(1);
        };

        let config = ctx.load_config()?;
        let supervisor = ctx.supervisor(&config);
        let sessions = SessionRegistry::new(&config.daemon.state_dir);

        match self {
            HookCommand::SessionStart => {
                let response = session_start(&supervisor, &sessions, &payload);
                println!("{response}");
            }
            HookCommand::SessionEnd => {
                session_end(&supervisor, &sessions, &payload);
            }
        }
        Ok(())
    }
}
