//! Session archive - mirror session logs to disk
//!
//! Directory structure:
//! ```text
//! .runwatch-data/
//!   sessions/
//!     {session_id}/
//!       session.json   # Session metadata
//!       events.jsonl   # Event log (newline-delimited JSON)
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::event::{AgentEvent, SessionId};
use crate::session::SessionInfo;
use crate::Result;

#[derive(Debug, Clone)]
pub struct EventArchive {
    base_dir: PathBuf,
}

impl EventArchive {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: data_dir.as_ref().join("sessions"),
        }
    }

    fn session_dir(&self, session_id: SessionId) -> PathBuf {
        self.base_dir.join(session_id.to_string())
    }

    fn metadata_path(&self, session_id: SessionId) -> PathBuf {
        self.session_dir(session_id).join("session.json")
    }

    fn events_path(&self, session_id: SessionId) -> PathBuf {
        self.session_dir(session_id).join("events.jsonl")
    }

    fn ensure_session_dir(&self, session_id: SessionId) -> Result<PathBuf> {
        let dir = self.session_dir(session_id);
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        Ok(dir)
    }

    pub fn save_session(&self, info: &SessionInfo) -> Result<()> {
        self.ensure_session_dir(info.id)?;
        let path = self.metadata_path(info.id);

        let file = File::create(&path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, info)?;

        debug!("Saved session metadata: {}", path.display());
        Ok(())
    }

    pub fn load_session(&self, session_id: SessionId) -> Result<SessionInfo> {
        let file = File::open(self.metadata_path(session_id))?;
        let info = serde_json::from_reader(BufReader::new(file))?;
        Ok(info)
    }

    /// List archived sessions, oldest first.
    pub fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut sessions = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Failed to read directory entry: {}", e);
                    continue;
                }
            };

            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            let session_id = match path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| Uuid::parse_str(n).ok())
            {
                Some(id) => id,
                None => continue,
            };

            match self.load_session(session_id) {
                Ok(info) => sessions.push(info),
                Err(e) => warn!("Failed to load archived session {}: {}", session_id, e),
            }
        }

        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    /// Append one event. The line is flushed before returning so that a
    /// successful append survives the process.
    pub fn append_event(&self, event: &AgentEvent) -> Result<()> {
        self.ensure_session_dir(event.session_id)?;
        let path = self.events_path(event.session_id);

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let mut writer = BufWriter::new(file);
        let json = serde_json::to_string(event)?;
        writeln!(writer, "{}", json)?;
        writer.flush()?;
        Ok(())
    }

    pub fn load_events(&self, session_id: SessionId) -> Result<Vec<AgentEvent>> {
        let path = self.events_path(session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(&path)?);
        let mut events = Vec::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AgentEvent>(&line) {
                Ok(event) => events.push(event),
                Err(e) => {
                    // A torn final line is expected after a crash mid-write.
                    warn!(
                        "Skipping unreadable event at {}:{}: {}",
                        path.display(),
                        line_no + 1,
                        e
                    );
                }
            }
        }
        Ok(events)
    }
}
