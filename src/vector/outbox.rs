//! Durable retry queue for rows whose embedding failed in a non-atomic
//! batch: newline-delimited JSON `{row_id, text_hash, attempts}` next to the
//! vector files.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub row_id: i64,
    pub text_hash: String,
    pub attempts: u32,
}

pub(crate) fn outbox_path(dir: &Path, stem: &str) -> PathBuf {
    dir.join(format!("{stem}.outbox"))
}

pub(crate) fn append(path: &Path, entry: &OutboxEntry) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(entry)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    writeln!(file, "{line}")?;
    file.sync_data()?;
    Ok(())
}

pub(crate) fn read_all(path: &Path) -> Result<Vec<OutboxEntry>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(entry) => entries.push(entry),
            Err(err) => tracing::warn!(%err, "skipping malformed outbox line"),
        }
    }
    Ok(entries)
}

/// Replace the outbox contents; an empty set removes the file.
pub(crate) fn rewrite(path: &Path, entries: &[OutboxEntry]) -> Result<()> {
    if entries.is_empty() {
        match std::fs::remove_file(path) {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        }
    }
    let tmp = path.with_extension("outbox.tmp");
    let mut file = File::create(&tmp)?;
    for entry in entries {
        let line = serde_json::to_string(entry)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        writeln!(file, "{line}")?;
    }
    file.flush()?;
    file.sync_data()?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
