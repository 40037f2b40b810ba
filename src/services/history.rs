use crate::core::asset::AssetId;
use crate::core::duplicate::ClusterKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const HISTORY_FILE_NAME: &str = ".nearcull-history.jsonl";

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("IO error on history file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode history record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One cluster's worth of deletions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletionRecord {
    pub timestamp: DateTime<Utc>,
    pub cluster_id: String,
    pub kind: ClusterKind,
    pub retained: AssetId,
    pub deleted: Vec<AssetId>,
}

/// Append-only JSON-lines log kept at the library root.
#[derive(Debug, Clone)]
pub struct HistoryLog {
    path: PathBuf,
}

impl HistoryLog {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            path: dir.join(HISTORY_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &DeletionRecord) -> Result<(), HistoryError> {
        let mut out = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(out, "{}", serde_json::to_string(record)?)?;
        Ok(())
    }

    /// All readable records, oldest first. Malformed lines are logged and
    /// skipped; a missing file is an empty history.
    pub fn read(&self) -> Result<Vec<DeletionRecord>, HistoryError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (i, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<DeletionRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => log::warn!("Skipping malformed history entry {}: {}", i, e),
            }
        }
        Ok(records)
    }
}
