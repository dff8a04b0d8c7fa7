//! Persisted "last observed sequence" cache.
//!
//! Loaded into a shared [`SequenceTracker`] at startup and flushed atomically
//! (write temp, then rename). Losing or corrupting it is harmless: the
//! naming layer's own check stays authoritative, the cache only saves a
//! round of conflicts after a restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use zkv_core::VaultResult;
use zkv_records::{Sequence, SequenceTracker};

pub struct SequenceCache {
    path: PathBuf,
    tracker: Arc<SequenceTracker>,
}

impl SequenceCache {
    /// Load the cache at `path`, or start empty if it does not exist.
    pub fn open(path: &Path) -> VaultResult<Self> {
        let snapshot: HashMap<String, Sequence> = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading sequence cache: {}", path.display()))?;
            match serde_json::from_str(&content) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "discarding unreadable sequence cache: {e}");
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            tracker: Arc::new(SequenceTracker::from_snapshot(snapshot)),
        })
    }

    pub fn tracker(&self) -> Arc<SequenceTracker> {
        Arc::clone(&self.tracker)
    }

    pub fn flush(&self) -> VaultResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating state dir: {}", parent.display()))?;
        }

        let json = serde_json::to_string_pretty(&self.tracker.snapshot())
            .context("serializing sequence cache")?;

        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, &json)
            .with_context(|| format!("writing sequence cache temp: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("renaming sequence cache: {}", self.path.display()))?;
        Ok(())
    }
}

impl Drop for SequenceCache {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::warn!("failed to flush sequence cache on drop: {e}");
        }
    }
}
