//! Atomic JSON state persistence.
//!
//! Write path: serialize → compare content hash against the last save (skip
//! when unchanged) → write `path.tmp` with mode 0600 under an exclusive
//! advisory lock → fsync → keep the previous content as `path.backup` →
//! rename over `path`. Read path: parse `path`, fall back to `path.backup`,
//! and when both are unreadable quarantine the bad file as `path.corrupt`
//! and start from schema defaults.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;

use crate::state::PersistedState;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("state serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("state file unreadable: {0}")]
    Unreadable(String),
}

/// Where a loaded value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    /// No state file existed yet.
    Fresh,
    Primary,
    Backup,
    /// Both primary and backup were unreadable; the primary was quarantined.
    Defaults,
}

#[derive(Debug)]
pub struct Loaded<T> {
    pub state: T,
    pub source: LoadSource,
}

pub struct StateStore {
    path: PathBuf,
    last_hash: Option<blake3::Hash>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        StateStore {
            path: path.into(),
            last_hash: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_path(&self) -> PathBuf {
        append_extension(&self.path, "backup")
    }

    fn tmp_path(&self) -> PathBuf {
        append_extension(&self.path, "tmp")
    }

    fn corrupt_path(&self) -> PathBuf {
        append_extension(&self.path, "corrupt")
    }

    /// Load owned state, recovering from backup or defaults as needed.
    pub fn load<T: PersistedState>(&mut self) -> Result<Loaded<T>, StoreError> {
        if !self.path.exists() {
            return Ok(Loaded {
                state: T::default(),
                source: LoadSource::Fresh,
            });
        }

        let loaded = match parse_file::<T>(&self.path) {
            Ok(state) => Loaded {
                state,
                source: LoadSource::Primary,
            },
            Err(primary_err) => match parse_file::<T>(&self.backup_path()) {
                Ok(state) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %primary_err,
                        "state file unreadable, recovered from backup"
                    );
                    Loaded {
                        state,
                        source: LoadSource::Backup,
                    }
                }
                Err(backup_err) => {
                    tracing::error!(
                        path = %self.path.display(),
                        primary_error = %primary_err,
                        backup_error = %backup_err,
                        "state and backup both unreadable, quarantining and starting fresh"
                    );
                    fs::rename(&self.path, self.corrupt_path())?;
                    Loaded {
                        state: T::default(),
                        source: LoadSource::Defaults,
                    }
                }
            },
        };

        // After a backup or defaults recovery the primary file is stale or
        // gone; leave the hash unprimed so the next save rewrites it.
        self.last_hash = match loaded.source {
            LoadSource::Primary => Some(content_hash(&loaded.state)?),
            LoadSource::Backup | LoadSource::Defaults | LoadSource::Fresh => None,
        };
        Ok(loaded)
    }

    /// Persist `state` if its content hash changed since the last save.
    /// Returns whether a write actually happened.
    pub fn save<T: PersistedState>(&mut self, state: &T) -> Result<bool, StoreError> {
        let hash = content_hash(state)?;
        if self.last_hash == Some(hash) {
            return Ok(false);
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let bytes = serde_json::to_vec_pretty(state)?;
        let tmp = self.tmp_path();
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp)?;
        file.lock_exclusive()?;
        file.write_all(&bytes)?;
        file.sync_all()?;

        if self.path.exists() {
            fs::copy(&self.path, self.backup_path())?;
        }
        fs::rename(&tmp, &self.path)?;
        fs2::FileExt::unlock(&file)?;

        self.last_hash = Some(hash);
        Ok(true)
    }
}

/// Read-only load of another controller's state file.
///
/// Never writes, quarantines, or falls back to defaults; a torn read is
/// handled by re-reading once (the owning writer replaces the file
/// atomically, so the second read sees a complete document).
pub fn load_readonly<T: PersistedState>(path: &Path) -> Result<T, StoreError> {
    match parse_file::<T>(path) {
        Ok(state) => Ok(state),
        Err(_) => parse_file::<T>(path),
    }
}

/// Stable hash of the persisted content, excluding volatile fields.
pub fn content_hash<T: PersistedState>(state: &T) -> Result<blake3::Hash, StoreError> {
    Ok(blake3::hash(&serde_json::to_vec(&state.hashable())?))
}

fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".");
    os.push(ext);
    PathBuf::from(os)
}

fn parse_file<T: PersistedState>(path: &Path) -> Result<T, StoreError> {
    let mut raw = String::new();
    File::open(path)?.read_to_string(&mut raw)?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| StoreError::Unreadable(format!("{}: {e}", path.display())))?;

    let version = value
        .get("schema_version")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let value = if version != T::SCHEMA_VERSION {
        tracing::info!(
            path = %path.display(),
            from = %version,
            to = T::SCHEMA_VERSION,
            "migrating state schema"
        );
        T::migrate(value, &version)
    } else {
        value
    };

    let mut state: T = serde_json::from_value(value)
        .map_err(|e| StoreError::Unreadable(format!("{}: {e}", path.display())))?;
    state.sanitize();
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{AutorateState, CongestionState};

    fn store(dir: &tempfile::TempDir) -> StateStore {
        StateStore::new(dir.path().join("wan1.state"))
    }

    fn sample() -> AutorateState {
        AutorateState {
            baseline_rtt_ms: 24.3,
            load_rtt_ms: 26.7,
            current_state: CongestionState::Green,
            last_applied_download_bps: 612_000_000,
            last_applied_upload_bps: 34_000_000,
            cycle_counter: 184_523,
            ..Default::default()
        }
    }

    // ─── Round Trip ─────────────────────────────────────────────────────

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir);
        let state = sample();
        assert!(store.save(&state).unwrap());

        let mut fresh = StateStore::new(store.path().to_path_buf());
        let loaded: Loaded<AutorateState> = fresh.load().unwrap();
        assert_eq!(loaded.source, LoadSource::Primary);
        assert_eq!(loaded.state.baseline_rtt_ms, 24.3);
        assert_eq!(loaded.state.cycle_counter, 184_523);
        assert_eq!(
            loaded.state.last_applied_download_bps,
            612_000_000
        );
    }

    #[test]
    fn missing_file_loads_fresh_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir);
        let loaded: Loaded<AutorateState> = store.load().unwrap();
        assert_eq!(loaded.source, LoadSource::Fresh);
        assert_eq!(loaded.state.cycle_counter, 0);
    }

    // ─── Dirty Suppression ──────────────────────────────────────────────

    #[test]
    fn unchanged_content_is_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir);
        let mut state = sample();
        assert!(store.save(&state).unwrap());
        assert!(!store.save(&state).unwrap(), "identical content: no write");

        // A timestamp-only change is also suppressed.
        state.last_transition_timestamp = Some(chrono::Utc::now());
        assert!(!store.save(&state).unwrap());

        state.cycle_counter += 1;
        assert!(store.save(&state).unwrap(), "real change: write");
    }

    #[test]
    fn load_primes_the_dirty_hash() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir);
        store.save(&sample()).unwrap();

        let mut reopened = StateStore::new(store.path().to_path_buf());
        let loaded: Loaded<AutorateState> = reopened.load().unwrap();
        assert!(
            !reopened.save(&loaded.state).unwrap(),
            "saving what was just loaded must be a no-op"
        );
    }

    // ─── Backup & Quarantine ────────────────────────────────────────────

    #[test]
    fn corrupt_primary_recovers_from_backup() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir);
        let mut state = sample();
        store.save(&state).unwrap();
        state.cycle_counter += 1;
        store.save(&state).unwrap(); // backup now holds cycle_counter 184523

        fs::write(store.path(), b"{ not json").unwrap();

        let mut fresh = StateStore::new(store.path().to_path_buf());
        let loaded: Loaded<AutorateState> = fresh.load().unwrap();
        assert_eq!(loaded.source, LoadSource::Backup);
        assert_eq!(loaded.state.cycle_counter, 184_523);
    }

    #[test]
    fn both_unreadable_quarantines_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wan1.state");
        fs::write(&path, b"garbage").unwrap();

        let mut store = StateStore::new(path.clone());
        let loaded: Loaded<AutorateState> = store.load().unwrap();
        assert_eq!(loaded.source, LoadSource::Defaults);
        assert_eq!(loaded.state.cycle_counter, 0);
        assert!(!path.exists(), "bad file was moved aside");
        assert!(
            dir.path().join("wan1.state.corrupt").exists(),
            "quarantine file exists"
        );
    }

    // ─── Schema Skew ────────────────────────────────────────────────────

    #[test]
    fn version_mismatch_still_loads_known_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wan1.state");
        fs::write(
            &path,
            r#"{"schema_version":"0.9","baseline_rtt_ms":21.0,"retired_field":true}"#,
        )
        .unwrap();

        let mut store = StateStore::new(path);
        let loaded: Loaded<AutorateState> = store.load().unwrap();
        assert_eq!(loaded.state.baseline_rtt_ms, 21.0);
    }

    #[test]
    fn non_finite_fields_are_sanitized_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wan1.state");
        fs::write(
            &path,
            r#"{"schema_version":"1.0","baseline_rtt_ms":-5.0,"load_rtt_ms":26.0}"#,
        )
        .unwrap();

        let mut store = StateStore::new(path);
        let loaded: Loaded<AutorateState> = store.load().unwrap();
        assert_eq!(loaded.state.baseline_rtt_ms, 0.0);
        assert_eq!(loaded.state.load_rtt_ms, 26.0);
    }

    // ─── Read-Only Ingest ───────────────────────────────────────────────

    #[test]
    fn readonly_load_never_quarantines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("primary.state");
        fs::write(&path, b"torn").unwrap();

        let result: Result<AutorateState, _> = load_readonly(&path);
        assert!(result.is_err());
        assert!(path.exists(), "read-only loader must not move the file");
        assert!(!dir.path().join("primary.state.corrupt").exists());
    }

    #[test]
    fn readonly_load_parses_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir);
        store.save(&sample()).unwrap();
        let state: AutorateState = load_readonly(store.path()).unwrap();
        assert_eq!(state.baseline_rtt_ms, 24.3);
    }
}
