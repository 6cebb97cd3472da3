//! Snapshot persistence for crash recovery.
//!
//! All zone state is dumped as pretty-printed JSON on every save heartbeat,
//! on shutdown and after a successful wipe. The dump goes to `<path>~`
//! first and is renamed over the previous file, so readers and crashes
//! never observe a half-written database. A database that exists but fails
//! to decode is a startup-fatal condition: refusing to run beats silently
//! dropping accumulated counters.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::zone::ZoneState;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// On-disk layout: `{"zones": {<zone>: {public, private, windows}}}`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub zones: IndexMap<String, ZoneState>,
}

/// Handle on the database file.
#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
}

impl Database {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Database { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot. A missing file is a fresh start; a file that
    /// does not decode is an error the caller treats as fatal.
    pub fn load(&self) -> Result<Option<Snapshot>, PersistError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot = serde_json::from_str(&raw)?;
        Ok(Some(snapshot))
    }

    /// Save atomically: write `<path>~`, fsync, unlink the old file and
    /// rename the temp over it. Any failure leaves the previous database
    /// untouched.
    pub fn save(&self, zones: &IndexMap<String, ZoneState>) -> Result<(), PersistError> {
        let tmp_path = temp_path(&self.path);
        {
            let mut file = fs::File::create(&tmp_path)?;
            let body = serde_json::to_string_pretty(&SnapshotRef { zones })?;
            file.write_all(body.as_bytes())?;
            file.write_all(b"\n")?;
            file.sync_all()?;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

/// Borrowing twin of [`Snapshot`] so saving never clones the zone map.
#[derive(Serialize)]
struct SnapshotRef<'a> {
    zones: &'a IndexMap<String, ZoneState>,
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push("~");
    PathBuf::from(name)
}
