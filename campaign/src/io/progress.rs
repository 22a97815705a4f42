//! Append-only progress ledger (`campaign.progress.jsonl`).
//!
//! Each event is one JSON line written with a single `write` call and synced
//! before the append returns. Lines are never rewritten.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};

use crate::core::idempotency::LedgerIndex;
use crate::core::types::ProgressEvent;

#[derive(Debug, Clone)]
pub struct ProgressLog {
    path: PathBuf,
}

/// Everything recovered from the ledger on start.
#[derive(Debug, Clone, Default)]
pub struct Replay {
    pub events: Vec<ProgressEvent>,
    pub index: LedgerIndex,
}

impl ProgressLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, event: &ProgressEvent) -> Result<()> {
        let mut line = serde_json::to_string(event).context("serialize progress event")?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create ledger dir {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open ledger {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append ledger {}", self.path.display()))?;
        file.sync_data()
            .with_context(|| format!("fsync ledger {}", self.path.display()))?;
        debug!(
            mission_index = event.mission_index,
            status = ?event.status,
            "progress event appended"
        );
        Ok(())
    }

    /// Read every event and rebuild the ledger index.
    ///
    /// A missing ledger replays as empty. A torn final line (no trailing
    /// newline) is skipped with a warning; any other malformed line is an error.
    pub fn replay(&self) -> Result<Replay> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Replay::default()),
            Err(err) => {
                return Err(err).with_context(|| format!("read ledger {}", self.path.display()));
            }
        };

        let complete_tail = contents.ends_with('\n');
        let lines: Vec<&str> = contents.lines().collect();
        let mut events = Vec::with_capacity(lines.len());
        for (pos, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ProgressEvent>(line) {
                Ok(event) => events.push(event),
                Err(err) if pos + 1 == lines.len() && !complete_tail => {
                    warn!(
                        ledger = %self.path.display(),
                        err = %err,
                        "skipping torn final ledger line"
                    );
                }
                Err(err) => {
                    return Err(anyhow!(err)).with_context(|| {
                        format!("parse ledger {} line {}", self.path.display(), pos + 1)
                    });
                }
            }
        }

        let index = LedgerIndex::from_events(&events);
        debug!(
            events = events.len(),
            completed = index.completed().len(),
            "ledger replayed"
        );
        Ok(Replay { events, index })
    }
}
