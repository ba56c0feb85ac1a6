//! Run-state persistence: remembers across restarts whether the worker
//! was running so a rebooted host resumes on its own.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Default, Deserialize, Serialize)]
struct PersistedState {
    is_running: bool,
}

pub struct RunState {
    path: PathBuf,
    state: PersistedState,
}

impl RunState {
    /// Load from disk; a missing file starts fresh.
    pub fn load(path: PathBuf) -> Self {
        let state = fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        Self { path, state }
    }

    #[must_use]
    pub fn was_running(&self) -> bool {
        self.state.is_running
    }

    pub fn set_running(&mut self, running: bool) -> Result<()> {
        self.state.is_running = running;
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let data = serde_json::to_vec_pretty(&self.state)?;
        fs::write(&self.path, data)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        info!(is_running = running, "run state persisted");
        Ok(())
    }
}
