//! Append-only vector file with sidecar id mapping and durable tombstones.
//!
//! Three artifacts per vector column under `<db>/vectors/`:
//! `<table>__<column>.vec` (raw little-endian f32, no header),
//! `<table>__<column>.id` (little-endian u64 row id per slot) and
//! `<table>__<column>.tomb.json` (sorted row ids masked from queries).
//!
//! Vectors are mirrored in an in-memory arena so scans never touch the
//! file. Readers take a cheap snapshot (Arc clones of arena, id maps and
//! tombstones); the single writer mutates through `Arc::make_mut`, so an
//! append never blocks an in-flight scan.

use crate::error::{Error, Result, SchemaError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

#[derive(Serialize, Deserialize, Default)]
struct TombFile {
    tombstones: Vec<u64>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
struct FileStamp {
    len: u64,
    mtime: Option<SystemTime>,
}

impl FileStamp {
    fn of(path: &Path) -> FileStamp {
        match std::fs::metadata(path) {
            Ok(meta) => FileStamp {
                len: meta.len(),
                mtime: meta.modified().ok(),
            },
            Err(_) => FileStamp::default(),
        }
    }
}

struct FileState {
    arena: Arc<Vec<f32>>,
    slot_ids: Arc<Vec<u64>>,
    slot_of: Arc<HashMap<u64, usize>>,
    tombstones: Arc<HashSet<u64>>,
    stamp: FileStamp,
}

/// Read-side view captured at operation start; never invalidated by
/// concurrent appends.
pub(crate) struct VectorSnapshot {
    pub dim: usize,
    arena: Arc<Vec<f32>>,
    slot_ids: Arc<Vec<u64>>,
    slot_of: Arc<HashMap<u64, usize>>,
    tombstones: Arc<HashSet<u64>>,
}

impl VectorSnapshot {
    /// Live slots in slot order. A slot is live when it is the current slot
    /// for its row id and the row id is not tombstoned.
    pub fn iter_live(&self) -> impl Iterator<Item = (i64, usize, &[f32])> + '_ {
        self.slot_ids.iter().enumerate().filter_map(|(slot, &row)| {
            if self.slot_of.get(&row) != Some(&slot) || self.tombstones.contains(&row) {
                return None;
            }
            let start = slot * self.dim;
            Some((row as i64, slot, &self.arena[start..start + self.dim]))
        })
    }

    pub fn live_count(&self) -> usize {
        self.slot_of
            .keys()
            .filter(|row| !self.tombstones.contains(row))
            .count()
    }

    pub fn contains_live(&self, row_id: i64) -> bool {
        let row = row_id as u64;
        self.slot_of.contains_key(&row) && !self.tombstones.contains(&row)
    }
}

pub(crate) struct VectorFile {
    table: String,
    column: String,
    dim: usize,
    vec_path: PathBuf,
    id_path: PathBuf,
    tomb_path: PathBuf,
    state: RwLock<FileState>,
}

impl VectorFile {
    pub fn stem(table: &str, column: &str) -> String {
        format!("{table}__{column}")
    }

    pub fn create(dir: &Path, table: &str, column: &str, dim: usize) -> Result<Self> {
        let file = Self::with_paths(dir, table, column, dim);
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file.vec_path)?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file.id_path)?;
        file.write_tomb(&HashSet::new())?;
        file.state.write().stamp = FileStamp::of(&file.vec_path);
        Ok(file)
    }

    pub fn open(dir: &Path, table: &str, column: &str, dim: usize) -> Result<Self> {
        let file = Self::with_paths(dir, table, column, dim);
        {
            let mut state = file.state.write();
            *state = file.load()?;
        }
        Ok(file)
    }

    fn with_paths(dir: &Path, table: &str, column: &str, dim: usize) -> Self {
        let stem = Self::stem(table, column);
        Self {
            table: table.to_string(),
            column: column.to_string(),
            dim,
            vec_path: dir.join(format!("{stem}.vec")),
            id_path: dir.join(format!("{stem}.id")),
            tomb_path: dir.join(format!("{stem}.tomb.json")),
            state: RwLock::new(FileState {
                arena: Arc::new(Vec::new()),
                slot_ids: Arc::new(Vec::new()),
                slot_of: Arc::new(HashMap::new()),
                tombstones: Arc::new(HashSet::new()),
                stamp: FileStamp::default(),
            }),
        }
    }

    /// Load state from disk, trimming any torn tail so the two files agree
    /// on slot count.
    fn load(&self) -> Result<FileState> {
        let record = (self.dim * 4) as u64;
        let vec_len = std::fs::metadata(&self.vec_path).map(|m| m.len()).unwrap_or(0);
        let id_len = std::fs::metadata(&self.id_path).map(|m| m.len()).unwrap_or(0);
        let slots = ((vec_len / record) as usize).min((id_len / 8) as usize);
        if vec_len % record != 0 || id_len % 8 != 0 || vec_len / record != id_len / 8 {
            tracing::warn!(
                table = %self.table,
                column = %self.column,
                vec_len,
                id_len,
                "trimming torn vector tail to {slots} slots"
            );
            set_len_sync(&self.vec_path, slots as u64 * record)?;
            set_len_sync(&self.id_path, slots as u64 * 8)?;
        }

        let mut arena = vec![0f32; slots * self.dim];
        if slots > 0 {
            let mut buf = vec![0u8; slots * self.dim * 4];
            File::open(&self.vec_path)?.read_exact(&mut buf)?;
            for (i, chunk) in buf.chunks_exact(4).enumerate() {
                arena[i] = f32::from_le_bytes(chunk.try_into().expect("chunk of 4"));
            }
        }
        let mut slot_ids = Vec::with_capacity(slots);
        if slots > 0 {
            let mut buf = vec![0u8; slots * 8];
            File::open(&self.id_path)?.read_exact(&mut buf)?;
            for chunk in buf.chunks_exact(8) {
                slot_ids.push(u64::from_le_bytes(chunk.try_into().expect("chunk of 8")));
            }
        }
        let mut slot_of = HashMap::with_capacity(slots);
        for (slot, &row) in slot_ids.iter().enumerate() {
            slot_of.insert(row, slot); // last occurrence wins
        }
        let tombstones: HashSet<u64> = match std::fs::read(&self.tomb_path) {
            Ok(bytes) => serde_json::from_slice::<TombFile>(&bytes)
                .map(|t| t.tombstones.into_iter().collect())
                .unwrap_or_default(),
            Err(_) => HashSet::new(),
        };
        Ok(FileState {
            arena: Arc::new(arena),
            slot_ids: Arc::new(slot_ids),
            slot_of: Arc::new(slot_of),
            tombstones: Arc::new(tombstones),
            stamp: FileStamp::of(&self.vec_path),
        })
    }

    pub fn snapshot(&self) -> Result<VectorSnapshot> {
        {
            let state = self.state.read();
            if state.stamp == FileStamp::of(&self.vec_path) {
                return Ok(VectorSnapshot {
                    dim: self.dim,
                    arena: state.arena.clone(),
                    slot_ids: state.slot_ids.clone(),
                    slot_of: state.slot_of.clone(),
                    tombstones: state.tombstones.clone(),
                });
            }
        }
        // Externally modified; reload before serving.
        tracing::warn!(table = %self.table, column = %self.column, "vector file changed on disk, reloading");
        let mut state = self.state.write();
        *state = self.load()?;
        Ok(VectorSnapshot {
            dim: self.dim,
            arena: state.arena.clone(),
            slot_ids: state.slot_ids.clone(),
            slot_of: state.slot_of.clone(),
            tombstones: state.tombstones.clone(),
        })
    }

    pub fn append(&self, row_id: i64, vector: &[f32]) -> Result<usize> {
        self.append_batch(&[(row_id, vector.to_vec())])
    }

    /// Append a batch under one writer-lock acquisition and one pair of file
    /// handles. Returns the slot of the first appended vector.
    pub fn append_batch(&self, items: &[(i64, Vec<f32>)]) -> Result<usize> {
        for (_, vector) in items {
            if vector.len() != self.dim {
                return Err(Error::Schema(SchemaError::DimensionMismatch {
                    table: self.table.clone(),
                    column: self.column.clone(),
                    expected: self.dim,
                    got: vector.len(),
                }));
            }
        }
        let mut state = self.state.write();
        let first_slot = state.slot_ids.len();

        let mut vec_file = BufWriter::new(
            OpenOptions::new().create(true).append(true).open(&self.vec_path)?,
        );
        let mut id_file = BufWriter::new(
            OpenOptions::new().create(true).append(true).open(&self.id_path)?,
        );
        for (row_id, vector) in items {
            for value in vector {
                vec_file.write_all(&value.to_le_bytes())?;
            }
            id_file.write_all(&(*row_id as u64).to_le_bytes())?;
        }
        vec_file.flush()?;
        id_file.flush()?;

        {
            let arena = Arc::make_mut(&mut state.arena);
            for (_, vector) in items {
                arena.extend_from_slice(vector);
            }
        }
        {
            let slot_ids = Arc::make_mut(&mut state.slot_ids);
            for (row_id, _) in items {
                slot_ids.push(*row_id as u64);
            }
        }
        {
            let slot_of = Arc::make_mut(&mut state.slot_of);
            for (i, (row_id, _)) in items.iter().enumerate() {
                slot_of.insert(*row_id as u64, first_slot + i);
            }
        }
        // A re-appended row is live again.
        let resurrected: Vec<u64> = items
            .iter()
            .map(|(row_id, _)| *row_id as u64)
            .filter(|row| state.tombstones.contains(row))
            .collect();
        if !resurrected.is_empty() {
            let tombstones = Arc::make_mut(&mut state.tombstones);
            for row in &resurrected {
                tombstones.remove(row);
            }
            self.write_tomb(&state.tombstones)?;
        }
        state.stamp = FileStamp::of(&self.vec_path);
        Ok(first_slot)
    }

    /// Idempotent; a row without a slot is left alone.
    pub fn mark_deleted(&self, row_id: i64) -> Result<()> {
        let row = row_id as u64;
        let mut state = self.state.write();
        if !state.slot_of.contains_key(&row) || state.tombstones.contains(&row) {
            return Ok(());
        }
        Arc::make_mut(&mut state.tombstones).insert(row);
        self.write_tomb(&state.tombstones)
    }

    /// Rewrite both files densely, dropping dead and tombstoned slots, then
    /// clear the tombstone set. Crash-safe: temp files are fsynced and
    /// atomically renamed, then the parent directory is fsynced.
    pub fn compact(&self) -> Result<()> {
        let mut state = self.state.write();
        let live: Vec<(u64, usize)> = state
            .slot_ids
            .iter()
            .enumerate()
            .filter_map(|(slot, &row)| {
                (state.slot_of.get(&row) == Some(&slot) && !state.tombstones.contains(&row))
                    .then_some((row, slot))
            })
            .collect();

        let vec_tmp = self.vec_path.with_extension("vec.tmp");
        let id_tmp = self.id_path.with_extension("id.tmp");
        {
            let mut vec_file = BufWriter::new(File::create(&vec_tmp)?);
            let mut id_file = BufWriter::new(File::create(&id_tmp)?);
            for &(row, slot) in &live {
                let start = slot * self.dim;
                for value in &state.arena[start..start + self.dim] {
                    vec_file.write_all(&value.to_le_bytes())?;
                }
                id_file.write_all(&row.to_le_bytes())?;
            }
            vec_file.flush()?;
            vec_file.get_ref().sync_data()?;
            id_file.flush()?;
            id_file.get_ref().sync_data()?;
        }
        std::fs::rename(&vec_tmp, &self.vec_path)?;
        std::fs::rename(&id_tmp, &self.id_path)?;
        sync_dir(&self.vec_path)?;
        self.write_tomb(&HashSet::new())?;

        let mut arena = Vec::with_capacity(live.len() * self.dim);
        let mut slot_ids = Vec::with_capacity(live.len());
        let mut slot_of = HashMap::with_capacity(live.len());
        for (new_slot, &(row, old_slot)) in live.iter().enumerate() {
            let start = old_slot * self.dim;
            arena.extend_from_slice(&state.arena[start..start + self.dim]);
            slot_ids.push(row);
            slot_of.insert(row, new_slot);
        }
        tracing::debug!(
            table = %self.table,
            column = %self.column,
            live = live.len(),
            dropped = state.slot_ids.len() - live.len(),
            "compacted vector file"
        );
        *state = FileState {
            arena: Arc::new(arena),
            slot_ids: Arc::new(slot_ids),
            slot_of: Arc::new(slot_of),
            tombstones: Arc::new(HashSet::new()),
            stamp: FileStamp::of(&self.vec_path),
        };
        Ok(())
    }

    /// Roll back to an earlier slot count, discarding tail appends. Used
    /// when an atomic batch fails after vectors were written.
    pub fn truncate_to(&self, slots: usize) -> Result<()> {
        let mut state = self.state.write();
        if slots >= state.slot_ids.len() {
            return Ok(());
        }
        set_len_sync(&self.vec_path, (slots * self.dim * 4) as u64)?;
        set_len_sync(&self.id_path, (slots * 8) as u64)?;

        let mut slot_ids = state.slot_ids.as_ref().clone();
        slot_ids.truncate(slots);
        let mut arena = state.arena.as_ref().clone();
        arena.truncate(slots * self.dim);
        let mut slot_of = HashMap::with_capacity(slots);
        for (slot, &row) in slot_ids.iter().enumerate() {
            slot_of.insert(row, slot);
        }
        state.arena = Arc::new(arena);
        state.slot_ids = Arc::new(slot_ids);
        state.slot_of = Arc::new(slot_of);
        state.stamp = FileStamp::of(&self.vec_path);
        Ok(())
    }

    pub fn sync_all(&self) -> Result<()> {
        OpenOptions::new().write(true).open(&self.vec_path)?.sync_all()?;
        OpenOptions::new().write(true).open(&self.id_path)?.sync_all()?;
        Ok(())
    }

    pub fn slot_count(&self) -> usize {
        self.state.read().slot_ids.len()
    }

    pub fn live_count(&self) -> usize {
        let state = self.state.read();
        state
            .slot_of
            .keys()
            .filter(|row| !state.tombstones.contains(row))
            .count()
    }

    pub fn tombstone_count(&self) -> usize {
        self.state.read().tombstones.len()
    }

    pub fn tombstone_ratio(&self) -> f32 {
        let state = self.state.read();
        if state.slot_ids.is_empty() {
            return 0.0;
        }
        state.tombstones.len() as f32 / state.slot_ids.len() as f32
    }

    pub fn has_slot(&self, row_id: i64) -> bool {
        self.state.read().slot_of.contains_key(&(row_id as u64))
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn vec_path(&self) -> &Path {
        &self.vec_path
    }

    fn write_tomb(&self, tombstones: &HashSet<u64>) -> Result<()> {
        let mut sorted: Vec<u64> = tombstones.iter().copied().collect();
        sorted.sort_unstable();
        let tmp = self.tomb_path.with_extension("json.tmp");
        let mut file = File::create(&tmp)?;
        serde_json::to_writer(&mut file, &TombFile { tombstones: sorted })
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        file.flush()?;
        file.sync_data()?;
        std::fs::rename(&tmp, &self.tomb_path)?;
        Ok(())
    }
}

fn set_len_sync(path: &Path, len: u64) -> Result<()> {
    let file = OpenOptions::new().write(true).create(true).open(path)?;
    file.set_len(len)?;
    file.sync_all()?;
    Ok(())
}

fn sync_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}
