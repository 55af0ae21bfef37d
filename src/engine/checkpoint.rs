//! Local task checkpoints.
//!
//! A checkpoint stores a task's store contents alongside the changelog offset
//! they reflect, so restore only has to replay the changelog tail. Files are
//! gzip-compressed JSON, written to a temporary file and renamed into place.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::StoreError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreCheckpoint {
    /// Next changelog offset not yet reflected in `entries`
    pub changelog_offset: u64,
    pub entries: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskCheckpoint {
    pub task: String,
    pub written_at: Option<chrono::DateTime<chrono::Utc>>,
    pub stores: BTreeMap<String, StoreCheckpoint>,
}

/// Checkpoint files for one application, one file per task.
#[derive(Debug, Clone)]
pub struct CheckpointDir {
    root: PathBuf,
}

impl CheckpointDir {
    pub fn new(state_dir: &Path, application_id: &str) -> Self {
        Self {
            root: state_dir.join(application_id),
        }
    }

    pub fn path_for(&self, task: &str) -> PathBuf {
        self.root.join(format!("{task}.checkpoint.json.gz"))
    }

    pub fn write(&self, checkpoint: &TaskCheckpoint) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root)?;
        let path = self.path_for(&checkpoint.task);
        let tmp = path.with_extension("tmp");

        let file = File::create(&tmp)?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        serde_json::to_writer(&mut encoder, checkpoint).map_err(std::io::Error::other)?;
        encoder.finish()?.flush()?;
        fs::rename(&tmp, &path)?;

        debug!(task = %checkpoint.task, path = %path.display(), "Wrote checkpoint");
        Ok(())
    }

    /// Reads the task's checkpoint. A missing or unreadable file yields `None`
    /// and the caller restores from the full changelog instead.
    pub fn read(&self, task: &str) -> Option<TaskCheckpoint> {
        let path = self.path_for(task);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(_) => return None,
        };
        let decoder = GzDecoder::new(BufReader::new(file));
        match serde_json::from_reader::<_, TaskCheckpoint>(decoder) {
            Ok(checkpoint) if checkpoint.task == task => Some(checkpoint),
            Ok(checkpoint) => {
                warn!(task, found = %checkpoint.task, "Checkpoint belongs to another task, ignoring");
                None
            }
            Err(e) => {
                warn!(task, path = %path.display(), error = %e, "Unreadable checkpoint, ignoring");
                None
            }
        }
    }

    /// Deletes the task's checkpoint so the next restore replays the full
    /// changelog. A missing file is not an error.
    pub fn remove(&self, task: &str) {
        let path = self.path_for(task);
        match fs::remove_file(&path) {
            Ok(()) => debug!(task, path = %path.display(), "Removed checkpoint"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(task, path = %path.display(), error = %e, "Failed to remove checkpoint"),
        }
    }
}
