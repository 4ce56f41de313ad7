//! Persisted carry-over state: anomaly refractory ends per config key, per
//! alert, per dimension key. Timestamps are rebased from the elapsed
//! timeline to wall clock at save time and back at load time, so they
//! survive a process restart whose elapsed clock starts over.
//!
//! Save/load failures surface as `Result`s; callers proceed without the
//! persisted state on error (cold start), never crash.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::ConfigKey;
use crate::dimension::DimensionKey;

/// Refractory ends for one alert, in wall-clock seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedAlert {
    pub alert_id: i64,
    pub refractory_end_wall_sec: Vec<(DimensionKey, i64)>,
}

/// Carry-over state for one config key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedConfig {
    pub key: ConfigKey,
    pub alerts: Vec<PersistedAlert>,
}

/// Everything the pipeline persists across restarts.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PersistedMetadata {
    /// Wall clock at save time, seconds; recorded for diagnostics.
    pub saved_wall_clock_sec: i64,
    pub configs: Vec<PersistedConfig>,
}

/// Writes metadata to disk, replacing any previous file. Writes through a
/// temp file so a crash mid-write cannot corrupt the previous state.
pub fn save_metadata(path: &Path, metadata: &PersistedMetadata) -> Result<()> {
    let data = serde_json::to_vec(metadata).context("serializing metadata")?;

    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, &data)
        .with_context(|| format!("writing metadata to {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("replacing metadata file {}", path.display()))?;
    Ok(())
}

/// Reads metadata from disk.
pub fn load_metadata(path: &Path) -> Result<PersistedMetadata> {
    let data = std::fs::read(path)
        .with_context(|| format!("reading metadata from {}", path.display()))?;
    serde_json::from_slice(&data).context("parsing metadata")
}

/// Rebase an elapsed-seconds timestamp to wall clock at save time.
pub fn elapsed_to_wall_sec(elapsed_value_sec: i64, elapsed_now_sec: i64, wall_now_sec: i64) -> i64 {
    elapsed_value_sec - elapsed_now_sec + wall_now_sec
}

/// Rebase a wall-clock-seconds timestamp back into the (new) elapsed
/// timeline at load time.
pub fn wall_to_elapsed_sec(wall_value_sec: i64, elapsed_now_sec: i64, wall_now_sec: i64) -> i64 {
    wall_value_sec - wall_now_sec + elapsed_now_sec
}
