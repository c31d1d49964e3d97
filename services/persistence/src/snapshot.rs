//! Warehouse snapshots
//!
//! A snapshot is the whole `WarehouseState` as JSON, optionally zstd
//! compressed, named `snapshot-{sequence}.json[.zst]`. The state hash is
//! stored alongside and re-checked on load; a snapshot whose format version
//! is newer than this build is refused. Old snapshots are pruned by count.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::warehouse::WarehouseState;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Snapshot I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("Snapshot encoding failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Snapshot state hash {actual} does not match recorded {expected}")]
    IntegrityFailure { expected: String, actual: String },

    #[error("Snapshot format version {0} is newer than this build")]
    UnsupportedVersion(u32),

    #[error("zstd failed: {0}")]
    Compression(String),

    #[error("Snapshot directory holds no snapshots")]
    NoSnapshots,
}

// ── Snapshot ────────────────────────────────────────────────────────

/// Format version written by this build.
pub const SNAPSHOT_VERSION: u32 = 1;

const PREFIX: &str = "snapshot-";
const EXT_PLAIN: &str = ".json";
const EXT_COMPRESSED: &str = ".json.zst";

/// The warehouse state as of a given commit sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Format version; loads refuse anything newer.
    pub version: u32,
    /// Number of committed batches contained in the state.
    pub sequence: u64,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
    pub state: WarehouseState,
    /// `WarehouseState::compute_hash` at write time.
    pub checksum: String,
}

impl Snapshot {
    pub fn new(sequence: u64, taken_at: DateTime<Utc>, state: WarehouseState) -> Self {
        let checksum = state.compute_hash();
        Self {
            version: SNAPSHOT_VERSION,
            sequence,
            taken_at,
            state,
            checksum,
        }
    }

    /// Snapshot of `state`, sequenced by its committed batch count.
    pub fn of(state: WarehouseState, taken_at: DateTime<Utc>) -> Self {
        let sequence = state.batches.len() as u64;
        Self::new(sequence, taken_at, state)
    }

    pub fn verify_integrity(&self) -> bool {
        self.state.compute_hash() == self.checksum
    }
}

// ── Snapshot Writer ─────────────────────────────────────────────────

/// Writes snapshots into one directory.
pub struct SnapshotWriter {
    dir: PathBuf,
    compress: bool,
}

impl SnapshotWriter {
    pub fn new(dir: impl Into<PathBuf>, compress: bool) -> Self {
        Self {
            dir: dir.into(),
            compress,
        }
    }

    /// Written to a temporary file, then renamed into place.
    pub fn write(&self, snapshot: &Snapshot) -> Result<PathBuf, SnapshotError> {
        fs::create_dir_all(&self.dir)?;

        let data = serde_json::to_vec(snapshot)?;
        let (final_data, ext) = if self.compress {
            let compressed = zstd::encode_all(data.as_slice(), 3)
                .map_err(|e| SnapshotError::Compression(e.to_string()))?;
            (compressed, EXT_COMPRESSED)
        } else {
            (data, EXT_PLAIN)
        };

        let filename = format!("{PREFIX}{:012}{ext}", snapshot.sequence);
        let path = self.dir.join(&filename);
        let tmp_path = self.dir.join(format!("{filename}.tmp"));

        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&final_data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;

        info!(
            path = %path.display(),
            sequence = snapshot.sequence,
            bytes = final_data.len(),
            "Snapshot written"
        );
        Ok(path)
    }
}

// ── Snapshot Loader ─────────────────────────────────────────────────

/// Reads and verifies snapshots from one directory.
pub struct SnapshotLoader {
    dir: PathBuf,
}

impl SnapshotLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Decode `path`, then check format version and state hash.
    pub fn load(&self, path: &Path) -> Result<Snapshot, SnapshotError> {
        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;

        let is_compressed = path.extension().map(|e| e == "zst").unwrap_or(false);
        let decompressed = if is_compressed {
            zstd::decode_all(data.as_slice())
                .map_err(|e| SnapshotError::Compression(e.to_string()))?
        } else {
            data
        };

        let snapshot: Snapshot = serde_json::from_slice(&decompressed)?;

        if snapshot.version > SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(snapshot.version));
        }

        let actual = snapshot.state.compute_hash();
        if actual != snapshot.checksum {
            warn!(path = %path.display(), "Snapshot checksum mismatch");
            return Err(SnapshotError::IntegrityFailure {
                expected: snapshot.checksum.clone(),
                actual,
            });
        }

        debug!(path = %path.display(), sequence = snapshot.sequence, "Snapshot loaded");
        Ok(snapshot)
    }

    /// Snapshot with the highest sequence.
    pub fn load_latest(&self) -> Result<Snapshot, SnapshotError> {
        let path = self.find_latest()?;
        self.load(&path)
    }

    /// Latest snapshot state, or an empty warehouse when none exist yet.
    pub fn load_latest_or_empty(&self) -> Result<WarehouseState, SnapshotError> {
        match self.load_latest() {
            Ok(snapshot) => Ok(snapshot.state),
            Err(SnapshotError::NoSnapshots) => {
                info!(dir = %self.dir.display(), "No snapshot found, starting from empty warehouse");
                Ok(WarehouseState::empty())
            }
            Err(e) => Err(e),
        }
    }

    pub fn find_latest(&self) -> Result<PathBuf, SnapshotError> {
        self.list_snapshots()?
            .pop()
            .map(|(_, path)| path)
            .ok_or(SnapshotError::NoSnapshots)
    }

    /// List all snapshots as (sequence, path) pairs, ascending.
    pub fn list_snapshots(&self) -> Result<Vec<(u64, PathBuf)>, SnapshotError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut results = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(seq) = parse_sequence(&name) {
                results.push((seq, entry.path()));
            }
        }
        results.sort_by_key(|(seq, _)| *seq);
        Ok(results)
    }
}

fn parse_sequence(filename: &str) -> Option<u64> {
    let rest = filename.strip_prefix(PREFIX)?;
    let digits = rest
        .strip_suffix(EXT_COMPRESSED)
        .or_else(|| rest.strip_suffix(EXT_PLAIN))?;
    digits.parse::<u64>().ok()
}

// ── Snapshot Cleanup Policy ─────────────────────────────────────────

/// Retention by count.
#[derive(Debug, Clone)]
pub struct SnapshotCleanupPolicy {
    pub max_snapshots: usize,
}

impl SnapshotCleanupPolicy {
    pub fn new(max_snapshots: usize) -> Self {
        Self { max_snapshots }
    }

    /// Delete all but the newest `max_snapshots`; returns the deleted paths.
    pub fn cleanup(&self, dir: &Path) -> Result<Vec<PathBuf>, SnapshotError> {
        let snapshots = SnapshotLoader::new(dir).list_snapshots()?;

        let mut removed = Vec::new();
        if snapshots.len() > self.max_snapshots {
            let to_remove = snapshots.len() - self.max_snapshots;
            for (_, path) in snapshots.into_iter().take(to_remove) {
                fs::remove_file(&path)?;
                removed.push(path);
            }
        }
        if !removed.is_empty() {
            debug!(removed = removed.len(), "Old snapshots removed");
        }
        Ok(removed)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
