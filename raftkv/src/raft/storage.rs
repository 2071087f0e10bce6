use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::raft::log::LogEntry;
use crate::raft::{RaftError, RaftResult};

pub const STATE_ENCODING_VERSION: u32 = 1;

/// Everything the core must recover after a restart, serialized as one
/// bincode blob behind an explicit version tag. Field order is fixed by
/// this struct; bumping the layout means bumping the version.
#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub current_term: u64,
    pub voted_for: Option<u64>,
    pub last_snapshot_index: u64,
    pub last_snapshot_term: u64,
    pub entries: Vec<LogEntry>,
}

impl PersistedState {
    pub fn encode(&self) -> RaftResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| RaftError::Encoding(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> RaftResult<Self> {
        let state: PersistedState =
            bincode::deserialize(data).map_err(|e| RaftError::Encoding(e.to_string()))?;
        if state.version != STATE_ENCODING_VERSION {
            return Err(RaftError::Encoding(format!(
                "unsupported state encoding version {}",
                state.version
            )));
        }
        Ok(state)
    }
}

/// Durable storage for the two opaque blobs the core hands down: the
/// serialized raft state and the latest snapshot. Each save replaces the
/// previous file atomically (write to a temp file, then rename), so a
/// crash mid-save never leaves a torn blob behind.
pub struct Persister {
    state_path: PathBuf,
    snapshot_path: PathBuf,
    state_size: Mutex<u64>,
}

impl Persister {
    pub fn new<P: AsRef<Path>>(base_path: P, me: u64) -> io::Result<Self> {
        let base_path = base_path.as_ref();
        fs::create_dir_all(base_path)?;
        let state_path = base_path.join(format!("raftstate-{}.bin", me));
        let snapshot_path = base_path.join(format!("snapshot-{}.bin", me));
        let state_size = match fs::metadata(&state_path) {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        Ok(Persister {
            state_path,
            snapshot_path,
            state_size: Mutex::new(state_size),
        })
    }

    pub fn save(&self, raft_state: &[u8], snapshot: &[u8]) -> io::Result<()> {
        write_atomic(&self.state_path, raft_state)?;
        write_atomic(&self.snapshot_path, snapshot)?;
        *self.state_size.lock().unwrap() = raft_state.len() as u64;
        Ok(())
    }

    pub fn read_raft_state(&self) -> io::Result<Option<Vec<u8>>> {
        read_optional(&self.state_path)
    }

    pub fn read_snapshot(&self) -> io::Result<Option<Vec<u8>>> {
        read_optional(&self.snapshot_path)
    }

    pub fn raft_state_size(&self) -> u64 {
        *self.state_size.lock().unwrap()
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, data)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
