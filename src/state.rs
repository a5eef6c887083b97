//! Resumable scan state and the background checkpointer.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use ::time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, ScanError};

/// Settings a saved state is tied to. A resume is refused unless every field matches.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub gateway_identifier: String,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub benchmarking_enabled: bool,
}

impl Fingerprint {
    /// Name of the first field that differs, if any.
    pub fn first_difference(&self, other: &Fingerprint) -> Option<&'static str> {
        if self.gateway_identifier != other.gateway_identifier {
            Some("gateway_identifier")
        } else if self.input_path != other.input_path {
            Some("input_path")
        } else if self.output_path != other.output_path {
            Some("output_path")
        } else if self.benchmarking_enabled != other.benchmarking_enabled {
            Some("benchmarking_enabled")
        } else {
            None
        }
    }
}

/// On-disk record of scan progress.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScanState {
    pub scanned_addresses: HashMap<String, bool>,
    #[serde(with = "::time::serde::rfc3339::option", default)]
    pub last_scan_time: Option<OffsetDateTime>,
    pub total_addresses: u64,
    pub config_fingerprint: Fingerprint,
}

impl ScanState {
    pub fn new(fingerprint: Fingerprint) -> Self {
        Self {
            scanned_addresses: HashMap::new(),
            last_scan_time: None,
            total_addresses: 0,
            config_fingerprint: fingerprint,
        }
    }

    /// Read a saved state. `Ok(None)` when no state file exists.
    pub async fn load(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ScanError::io(
                    format!("failed to read state file {}", path.display()),
                    e,
                ))
            }
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|source| ScanError::StateCorrupt {
                path: path.to_path_buf(),
                source,
            })
    }

    /// True iff the saved fingerprint equals `current` field for field.
    pub fn validate(&self, current: &Fingerprint) -> bool {
        self.config_fingerprint == *current
    }

    pub fn is_processed(&self, address: &str) -> bool {
        self.scanned_addresses.get(address).copied().unwrap_or(false)
    }

    /// Record `address` as done. Returns false if it already was.
    pub fn mark_processed(&mut self, address: &str) -> bool {
        match self.scanned_addresses.get_mut(address) {
            Some(done) if *done => false,
            Some(done) => {
                *done = true;
                true
            }
            None => {
                self.scanned_addresses.insert(address.to_string(), true);
                true
            }
        }
    }

    pub fn processed_count(&self) -> u64 {
        self.scanned_addresses.values().filter(|done| **done).count() as u64
    }

    /// Write the state to `path` through a temporary sibling and a rename, so
    /// a crash mid-write never leaves a truncated state file.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self).map_err(|e| {
            ScanError::io("failed to serialize scan state", std::io::Error::other(e))
        })?;
        write_atomic(path.as_ref(), &bytes).await
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = tmp_path(path);
    let write = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await
    };
    write
        .await
        .map_err(|e| ScanError::io(format!("failed to save state to {}", path.display()), e))
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

/// Handle to the state shared by all workers.
///
/// Every read and mutation goes through one mutex. Saves serialize a snapshot
/// under that lock and write it after releasing it; a second lock keeps two
/// saves from interleaving on the temporary file.
#[derive(Clone, Debug)]
pub struct SharedState {
    inner: Arc<Mutex<ScanState>>,
    save_lock: Arc<Mutex<()>>,
    path: Arc<PathBuf>,
}

impl SharedState {
    pub fn new(state: ScanState, path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
            save_lock: Arc::new(Mutex::new(())),
            path: Arc::new(path.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn is_processed(&self, address: &str) -> bool {
        self.inner.lock().await.is_processed(address)
    }

    pub async fn mark_processed(&self, address: &str) -> bool {
        self.inner.lock().await.mark_processed(address)
    }

    /// Stamp `last_scan_time` and persist.
    pub async fn save(&self) -> Result<()> {
        let _saving = self.save_lock.lock().await;
        let bytes = {
            let mut state = self.inner.lock().await;
            state.last_scan_time = Some(OffsetDateTime::now_utc());
            serde_json::to_vec_pretty(&*state).map_err(|e| {
                ScanError::io("failed to serialize scan state", std::io::Error::other(e))
            })?
        };
        write_atomic(&self.path, &bytes).await
    }
}

/// Save `state` every `every` until `stop` fires, then save once more and return.
/// Failed saves are logged; the scan carries on.
pub fn spawn_checkpointer(
    state: SharedState,
    every: Duration,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    match state.save().await {
                        Ok(()) => tracing::debug!(path = %state.path().display(), "checkpoint saved"),
                        Err(e) => tracing::warn!("checkpoint failed: {e}"),
                    }
                }
            }
        }
        match state.save().await {
            Ok(()) => tracing::info!(path = %state.path().display(), "final scan state saved"),
            Err(e) => tracing::warn!("final state save failed: {e}"),
        }
    })
}
