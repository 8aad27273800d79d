//! Intent log covering the commit window of an atomic batch.
//!
//! Written and fsynced immediately before vectors are appended, deleted
//! after the post-commit fsync. A log that survives to the next open means
//! the process died inside that window; replaying it restores the
//! row/vector agreement either way the transaction fell.
//!
//! Records are length-prefix framed: a 16-byte header (magic, version,
//! flags, payload length, crc32) followed by a bincode payload. A torn or
//! corrupt tail record is ignored.

use crate::error::Result;
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const LOG_MAGIC: u32 = 0x564C_4731; // "VLG1"
const LOG_VERSION: u16 = 1;
const HEADER_BYTES: usize = 16;

const FLAG_BEGIN: u16 = 0;
const FLAG_APPEND: u16 = 1;

#[derive(Serialize, Deserialize)]
enum LogRecord {
    /// Slot count of the vector file before any append of this batch.
    Begin { base_slots: u64 },
    Append { row_id: i64, vector: Vec<f32> },
}

pub(crate) fn log_path(dir: &Path, stem: &str) -> PathBuf {
    dir.join(format!("{stem}.log"))
}

pub(crate) fn write(path: &Path, base_slots: u64, entries: &[(i64, Vec<f32>)]) -> Result<()> {
    let mut file = BufWriter::new(File::create(path)?);
    write_record(&mut file, FLAG_BEGIN, &LogRecord::Begin { base_slots })?;
    for (row_id, vector) in entries {
        write_record(
            &mut file,
            FLAG_APPEND,
            &LogRecord::Append {
                row_id: *row_id,
                vector: vector.clone(),
            },
        )?;
    }
    file.flush()?;
    file.get_ref().sync_all()?;
    Ok(())
}

/// `None` when no log exists or its first record is unreadable.
pub(crate) fn read(path: &Path) -> Result<Option<(u64, Vec<(i64, Vec<f32>)>)>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut reader = BufReader::new(file);
    let mut base_slots = None;
    let mut entries = Vec::new();
    while let Some(record) = read_record(&mut reader) {
        match record {
            LogRecord::Begin { base_slots: base } => base_slots = base_slots.or(Some(base)),
            LogRecord::Append { row_id, vector } => entries.push((row_id, vector)),
        }
    }
    Ok(base_slots.map(|base| (base, entries)))
}

pub(crate) fn clear(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn write_record(writer: &mut impl Write, flags: u16, record: &LogRecord) -> Result<()> {
    let payload = bincode::serialize(record)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let mut header = [0u8; HEADER_BYTES];
    header[0..4].copy_from_slice(&LOG_MAGIC.to_le_bytes());
    header[4..6].copy_from_slice(&LOG_VERSION.to_le_bytes());
    header[6..8].copy_from_slice(&flags.to_le_bytes());
    header[8..12].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    header[12..16].copy_from_slice(&hasher.finalize().to_le_bytes());
    writer.write_all(&header)?;
    writer.write_all(&payload)?;
    Ok(())
}

fn read_record(reader: &mut impl Read) -> Option<LogRecord> {
    let mut header = [0u8; HEADER_BYTES];
    reader.read_exact(&mut header).ok()?;
    let magic = u32::from_le_bytes(header[0..4].try_into().ok()?);
    let version = u16::from_le_bytes(header[4..6].try_into().ok()?);
    if magic != LOG_MAGIC || version != LOG_VERSION {
        return None;
    }
    let len = u32::from_le_bytes(header[8..12].try_into().ok()?) as usize;
    let crc = u32::from_le_bytes(header[12..16].try_into().ok()?);
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).ok()?;
    let mut hasher = Hasher::new();
    hasher.update(&payload);
    if hasher.finalize() != crc {
        return None;
    }
    bincode::deserialize(&payload).ok()
}
