//! Event journal - appends events to a JSONL file

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::bus::EventBus;
use super::types::{EventLogEntry, PipelineEvent};

/// Journal file name inside the store directory
pub const JOURNAL_FILE: &str = "events.jsonl";

pub struct EventLogger {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl EventLogger {
    pub fn open(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let path = path.as_ref().to_path_buf();
        debug!(?path, "EventLogger::open: called");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_event(&mut self, event: &PipelineEvent) -> eyre::Result<()> {
        let entry = EventLogEntry::new(event.clone());
        writeln!(self.writer, "{}", serde_json::to_string(&entry)?)?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Read every entry of a journal, skipping lines that fail to parse
pub fn read_journal(path: impl AsRef<Path>) -> eyre::Result<Vec<EventLogEntry>> {
    let content = fs::read_to_string(path.as_ref())?;
    Ok(content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, "read_journal: skipping malformed line");
                None
            }
        })
        .collect())
}

/// Spawn a task that journals every event on `bus` until the bus closes
pub fn spawn_event_logger(bus: &EventBus, mut logger: EventLogger) -> tokio::task::JoinHandle<()> {
    debug!(path = ?logger.path(), "spawn_event_logger: called");
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Err(e) = logger.write_event(&event) {
                        warn!(error = %e, "EventLogger: write failed");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "EventLogger: lagged behind event bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("EventLogger: stopped");
    })
}
