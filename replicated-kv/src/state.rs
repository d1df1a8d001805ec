//! Durable `(current_term, voted_for)` pair.
//!
//! These are the only consensus fields that must survive a restart. The
//! engine saves them before sending any message that mentions the new term,
//! so a node can never vote twice in one term across a crash.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::message::NodeId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<NodeId>,
}

/// State file rewritten atomically on every change.
#[derive(Debug)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns `None` when no state has been written yet.
    pub fn load(&self) -> Result<Option<HardState>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        serde_json::from_str(text.trim())
            .map(Some)
            .map_err(|source| Error::CorruptState {
                path: self.path.clone(),
                source,
            })
    }

    pub fn save(&self, state: HardState) -> Result<()> {
        let encoded = serde_json::to_vec(&state).map_err(std::io::Error::from)?;

        // temp file + fsync + rename keeps the old state readable until the
        // new one is complete
        let temp_path = self.path.with_extension("state.tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(&encoded)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}
