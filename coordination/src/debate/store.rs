//! Debate session storage.
//!
//! Sessions are whole documents written atomically; transcripts are plain
//! markdown files that grow turn by turn and are rewritten whole when a run
//! resumes.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use super::state::DebateSession;
use crate::fs_store;

#[derive(Debug, thiserror::Error)]
pub enum SessionStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session {0} is unreadable: {1}")]
    Corrupt(String, String),

    #[error("Lock poisoned")]
    LockPoisoned,
}

impl SessionStoreError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "SESSION_STORE_IO",
            Self::Corrupt(..) => "SESSION_CORRUPT",
            Self::LockPoisoned => "SESSION_STORE_LOCK_POISONED",
        }
    }
}

pub type SessionStoreResult<T> = Result<T, SessionStoreError>;

pub trait SessionStore: Send + Sync {
    fn load(&self, debate_id: &str) -> SessionStoreResult<Option<DebateSession>>;

    fn save(&self, session: &DebateSession) -> SessionStoreResult<()>;

    /// Append text to the session's transcript.
    fn append_transcript(&self, debate_id: &str, text: &str) -> SessionStoreResult<()>;

    /// Replace the session's transcript.
    fn write_transcript(&self, debate_id: &str, text: &str) -> SessionStoreResult<()>;

    fn transcript(&self, debate_id: &str) -> SessionStoreResult<String>;

    /// All readable sessions, oldest first.
    fn list(&self) -> SessionStoreResult<Vec<DebateSession>>;
}

/// `sessions/<id>.json` plus `transcripts/<id>.md` under a data directory.
pub struct FileSessionStore {
    sessions_dir: PathBuf,
    transcripts_dir: PathBuf,
}

impl FileSessionStore {
    pub fn open(root: impl AsRef<Path>) -> SessionStoreResult<Self> {
        let root = root.as_ref();
        let sessions_dir = root.join("sessions");
        let transcripts_dir = root.join("transcripts");
        fs::create_dir_all(&sessions_dir)?;
        fs::create_dir_all(&transcripts_dir)?;
        Ok(Self {
            sessions_dir,
            transcripts_dir,
        })
    }

    fn session_path(&self, id: &str) -> PathBuf {
        fs_store::record_path(&self.sessions_dir, id, "json")
    }

    fn transcript_path(&self, id: &str) -> PathBuf {
        fs_store::record_path(&self.transcripts_dir, id, "md")
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self, debate_id: &str) -> SessionStoreResult<Option<DebateSession>> {
        match fs_store::read_json::<DebateSession>(&self.session_path(debate_id))? {
            fs_store::Record::Missing => Ok(None),
            fs_store::Record::Corrupt(reason) => {
                Err(SessionStoreError::Corrupt(debate_id.to_string(), reason))
            }
            fs_store::Record::Present(session) => Ok(Some(session)),
        }
    }

    fn save(&self, session: &DebateSession) -> SessionStoreResult<()> {
        fs_store::write_json_atomic(&self.session_path(&session.debate_id), session)?;
        debug!(debate_id = %session.debate_id, status = %session.status, "Session saved");
        Ok(())
    }

    fn append_transcript(&self, debate_id: &str, text: &str) -> SessionStoreResult<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.transcript_path(debate_id))?;
        file.write_all(text.as_bytes())?;
        Ok(())
    }

    fn write_transcript(&self, debate_id: &str, text: &str) -> SessionStoreResult<()> {
        fs_store::write_atomic(&self.transcript_path(debate_id), text.as_bytes())?;
        Ok(())
    }

    fn transcript(&self, debate_id: &str) -> SessionStoreResult<String> {
        match fs::read_to_string(self.transcript_path(debate_id)) {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> SessionStoreResult<Vec<DebateSession>> {
        let mut sessions: Vec<DebateSession> = fs_store::scan_json_dir(&self.sessions_dir)?;
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }
}

/// In-memory session store.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, DebateSession>>,
    transcripts: Mutex<HashMap<String, String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self, debate_id: &str) -> SessionStoreResult<Option<DebateSession>> {
        let sessions = self.sessions.lock().map_err(|_| SessionStoreError::LockPoisoned)?;
        Ok(sessions.get(debate_id).cloned())
    }

    fn save(&self, session: &DebateSession) -> SessionStoreResult<()> {
        let mut sessions = self.sessions.lock().map_err(|_| SessionStoreError::LockPoisoned)?;
        sessions.insert(session.debate_id.clone(), session.clone());
        Ok(())
    }

    fn append_transcript(&self, debate_id: &str, text: &str) -> SessionStoreResult<()> {
        let mut transcripts = self
            .transcripts
            .lock()
            .map_err(|_| SessionStoreError::LockPoisoned)?;
        transcripts.entry(debate_id.to_string()).or_default().push_str(text);
        Ok(())
    }

    fn write_transcript(&self, debate_id: &str, text: &str) -> SessionStoreResult<()> {
        let mut transcripts = self
            .transcripts
            .lock()
            .map_err(|_| SessionStoreError::LockPoisoned)?;
        transcripts.insert(debate_id.to_string(), text.to_string());
        Ok(())
    }

    fn transcript(&self, debate_id: &str) -> SessionStoreResult<String> {
        let transcripts = self
            .transcripts
            .lock()
            .map_err(|_| SessionStoreError::LockPoisoned)?;
        Ok(transcripts.get(debate_id).cloned().unwrap_or_default())
    }

    fn list(&self) -> SessionStoreResult<Vec<DebateSession>> {
        let sessions = self.sessions.lock().map_err(|_| SessionStoreError::LockPoisoned)?;
        let mut list: Vec<DebateSession> = sessions.values().cloned().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(list)
    }
}
