use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crawl::frontier::{Frontier, FrontierSnapshot};

const CHECKPOINT_FILE: &str = "checkpoint.json";
const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint {path} is corrupt ({source}); repair or remove it before resuming")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("checkpoint {path} has unsupported version {version}")]
    UnsupportedVersion { path: PathBuf, version: u32 },
}

/// One crawl step boundary: frontier and visited set written as a single record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub steps_completed: u64,
    pub saved_at: DateTime<Utc>,
    pub frontier: FrontierSnapshot,
    pub visited: Vec<String>,
}

impl Checkpoint {
    pub fn capture(frontier: &Frontier, steps_completed: u64) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            steps_completed,
            saved_at: Utc::now(),
            frontier: frontier.snapshot(),
            visited: frontier.visited_snapshot(),
        }
    }

    pub fn into_frontier(self) -> Frontier {
        Frontier::restore(self.frontier, self.visited)
    }
}

/// Persists crawl state to `<data_dir>/checkpoint.json`.
///
/// Saves go to a temporary file in the same directory which is then renamed over the
/// previous checkpoint, so a reader sees either the old step or the new one.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(data_dir: &Path) -> Self {
        Self { path: data_dir.join(CHECKPOINT_FILE) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> CheckpointError {
        CheckpointError::Io { path: self.path.clone(), source }
    }

    /// `Ok(None)` on first run. A file that exists but does not parse is an error;
    /// there is no fallback to an empty crawl.
    pub fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };
        let checkpoint: Checkpoint = serde_json::from_str(&text).map_err(|source| CheckpointError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::UnsupportedVersion {
                path: self.path.clone(),
                version: checkpoint.version,
            });
        }
        Ok(Some(checkpoint))
    }

    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).map_err(|e| self.io_error(e))?;

        let tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| self.io_error(e))?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer_pretty(&mut writer, checkpoint)
                .map_err(|e| self.io_error(std::io::Error::other(e)))?;
            writer.flush().map_err(|e| self.io_error(e))?;
        }
        tmp.as_file().sync_all().map_err(|e| self.io_error(e))?;
        tmp.persist(&self.path).map_err(|e| self.io_error(e.error))?;
        Ok(())
    }

    /// Remove the checkpoint so the next run starts fresh.
    pub fn clear(&self) -> Result<bool, CheckpointError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.io_error(e)),
        }
    }
}
