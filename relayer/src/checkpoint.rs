//! Crash-safe snapshots of relayer progress.
//!
//! The [CheckpointState] is written as pretty-printed JSON to `<path>.tmp`, synced, and then
//! renamed over `<path>`. A crash at any point leaves either the new or the previous snapshot
//! at `<path>`, never a partial one.

use crate::{
    metrics::Metrics,
    types::{CheckpointState, PendingAttestation},
    Error,
};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Format version stamped into every snapshot.
pub const CHECKPOINT_VERSION: &str = "1";

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Persistent [CheckpointState] with optional periodic saving.
pub struct Checkpoint {
    path: PathBuf,
    metrics: Metrics,
    state: RwLock<CheckpointState>,
    save_lock: Mutex<()>,
    autosave: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Checkpoint {
    /// Open the checkpoint at `path`.
    ///
    /// A missing file yields an empty state. An unreadable one is logged and replaced by an
    /// empty state on the next save.
    pub fn open(path: impl Into<PathBuf>, metrics: Metrics) -> Self {
        let path = path.into();
        let state = match Self::load(&path) {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load checkpoint, starting fresh");
                CheckpointState::default()
            }
        };
        info!(
            path = %path.display(),
            last_finality_block_height = state.last_finality_block_height,
            pending = state.pending_attestations.len(),
            "opened checkpoint"
        );
        Self {
            path,
            metrics,
            state: RwLock::new(state),
            save_lock: Mutex::new(()),
            autosave: Mutex::new(None),
        }
    }

    /// Read the snapshot at `path` (empty if absent).
    pub fn load(path: &Path) -> Result<CheckpointState, Error> {
        match fs::read(path) {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CheckpointState::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Location of the snapshot.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the current state to disk.
    pub fn save(&self) -> Result<(), Error> {
        let _saving = self.save_lock.lock();
        let snapshot = {
            let mut state = self.state.write();
            state.checkpointed_at = Utc::now();
            if state.version.is_empty() {
                state.version = CHECKPOINT_VERSION.to_string();
            }
            state.clone()
        };
        let result = self.write(&snapshot);
        match &result {
            Ok(()) => {
                self.metrics.checkpoint_saves.inc();
                debug!(
                    path = %self.path.display(),
                    last_finality_block_height = snapshot.last_finality_block_height,
                    pending = snapshot.pending_attestations.len(),
                    "saved checkpoint"
                );
            }
            Err(e) => {
                self.metrics.checkpoint_save_failures.inc();
                warn!(path = %self.path.display(), error = %e, "failed to save checkpoint");
            }
        }
        result
    }

    fn write(&self, snapshot: &CheckpointState) -> Result<(), Error> {
        let encoded = serde_json::to_vec_pretty(snapshot)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = tmp_path(&self.path);
        let mut file = File::create(&tmp)?;
        file.write_all(&encoded)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Save every `interval` until `shutdown` fires or [Checkpoint::stop] is called.
    pub fn start(self: &Arc<Self>, interval: Duration, shutdown: &CancellationToken) {
        let mut autosave = self.autosave.lock();
        if autosave.is_some() {
            return;
        }
        let token = shutdown.child_token();
        let stopped = token.clone();
        let checkpoint = self.clone();
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            loop {
                tokio::select! {
                    _ = stopped.cancelled() => break,
                    _ = ticker.tick() => {
                        let checkpoint = checkpoint.clone();
                        // Failures are logged and counted by save
                        if let Err(e) = tokio::task::spawn_blocking(move || checkpoint.save()).await {
                            warn!(error = %e, "checkpoint task failed");
                        }
                    }
                }
            }
            debug!("checkpoint autosave stopped");
        });
        *autosave = Some((token, handle));
    }

    /// Stop periodic saving and write a final snapshot.
    pub async fn stop(&self) -> Result<(), Error> {
        let autosave = self.autosave.lock().take();
        if let Some((token, handle)) = autosave {
            token.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "checkpoint autosave panicked");
            }
        }
        self.save()
    }

    /// Copy of the whole state.
    pub fn state(&self) -> CheckpointState {
        self.state.read().clone()
    }

    pub fn last_finality_block_height(&self) -> u64 {
        self.state.read().last_finality_block_height
    }

    /// Raise the last finalized height to `height`. Returns false if it was already higher.
    pub fn update_last_finality_block_height(&self, height: u64) -> bool {
        let mut state = self.state.write();
        if height <= state.last_finality_block_height {
            return false;
        }
        state.last_finality_block_height = height;
        true
    }

    pub fn add_pending_attestation(&self, pending: PendingAttestation) {
        let mut state = self.state.write();
        state
            .pending_attestations
            .insert(pending.tx_hash.clone(), pending);
    }

    pub fn remove_pending_attestation(&self, tx_hash: &str) -> Option<PendingAttestation> {
        self.state.write().pending_attestations.remove(tx_hash)
    }

    /// Copy of every in-flight attestation, keyed by transaction hash.
    pub fn pending_attestations(&self) -> BTreeMap<String, PendingAttestation> {
        self.state.read().pending_attestations.clone()
    }

    /// Reset to an empty state and save it.
    pub fn clear(&self) -> Result<(), Error> {
        *self.state.write() = CheckpointState::default();
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(tx_hash: &str, height: u64) -> PendingAttestation {
        PendingAttestation {
            tx_hash: tx_hash.into(),
            attestation_ids: Vec::new(),
            attestation_id: height,
            chain_id: "c".into(),
            block_height: height,
            start_height: 0,
            end_height: 0,
            submitted_at: Utc::now(),
        }
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = Checkpoint::open(dir.path().join("cp.json"), Metrics::default());
        assert_eq!(checkpoint.last_finality_block_height(), 0);
        assert!(checkpoint.pending_attestations().is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("cp.json");
        let metrics = Metrics::default();
        let checkpoint = Checkpoint::open(&path, metrics.clone());
        assert!(checkpoint.update_last_finality_block_height(12));
        checkpoint.add_pending_attestation(pending("AA", 13));
        checkpoint.save().unwrap();
        assert_eq!(metrics.checkpoint_saves.get(), 1);

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\n  \"last_finality_block_height\": 12"));
        assert!(!tmp_path(&path).exists());

        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded, checkpoint.state());
        assert_eq!(loaded.version, CHECKPOINT_VERSION);
        assert_eq!(loaded.pending_attestations["AA"].block_height, 13);
    }

    #[test]
    fn test_height_is_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = Checkpoint::open(dir.path().join("cp.json"), Metrics::default());
        assert!(checkpoint.update_last_finality_block_height(10));
        assert!(!checkpoint.update_last_finality_block_height(9));
        assert!(!checkpoint.update_last_finality_block_height(10));
        assert_eq!(checkpoint.last_finality_block_height(), 10);
    }

    #[test]
    fn test_pending_is_copied() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = Checkpoint::open(dir.path().join("cp.json"), Metrics::default());
        checkpoint.add_pending_attestation(pending("AA", 1));
        let mut copy = checkpoint.pending_attestations();
        copy.clear();
        assert_eq!(checkpoint.pending_attestations().len(), 1);

        assert!(checkpoint.remove_pending_attestation("AA").is_some());
        assert!(checkpoint.remove_pending_attestation("AA").is_none());
    }

    #[test]
    fn test_partial_write_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.json");
        let checkpoint = Checkpoint::open(&path, Metrics::default());
        checkpoint.update_last_finality_block_height(7);
        checkpoint.save().unwrap();

        // Crash between writing the temporary file and renaming it
        fs::write(tmp_path(&path), b"{\"last_finality_block_he").unwrap();
        let reopened = Checkpoint::open(&path, Metrics::default());
        assert_eq!(reopened.last_finality_block_height(), 7);
    }

    #[test]
    fn test_corrupt_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.json");
        fs::write(&path, b"not json").unwrap();
        assert!(matches!(
            Checkpoint::load(&path),
            Err(Error::Serialization(_))
        ));
        let checkpoint = Checkpoint::open(&path, Metrics::default());
        assert_eq!(checkpoint.state(), CheckpointState::default());
    }

    #[test]
    fn test_clear() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.json");
        let checkpoint = Checkpoint::open(&path, Metrics::default());
        checkpoint.update_last_finality_block_height(3);
        checkpoint.add_pending_attestation(pending("AA", 4));
        checkpoint.clear().unwrap();
        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded.last_finality_block_height, 0);
        assert!(loaded.pending_attestations.is_empty());
    }

    #[test]
    fn test_save_failure_is_counted() {
        let dir = tempfile::tempdir().unwrap();
        // The parent is a file, so the directory cannot be created
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"").unwrap();
        let metrics = Metrics::default();
        let checkpoint = Checkpoint::open(blocker.join("cp.json"), metrics.clone());
        assert!(matches!(checkpoint.save(), Err(Error::IoError(_))));
        assert_eq!(metrics.checkpoint_save_failures.get(), 1);
    }

    #[tokio::test]
    async fn test_autosave_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.json");
        let metrics = Metrics::default();
        let checkpoint = Arc::new(Checkpoint::open(&path, metrics.clone()));
        let shutdown = CancellationToken::new();
        checkpoint.start(Duration::from_millis(20), &shutdown);

        checkpoint.update_last_finality_block_height(5);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(metrics.checkpoint_saves.get() >= 1);
        assert_eq!(Checkpoint::load(&path).unwrap().last_finality_block_height, 5);

        checkpoint.update_last_finality_block_height(6);
        checkpoint.stop().await.unwrap();
        assert_eq!(Checkpoint::load(&path).unwrap().last_finality_block_height, 6);
    }
}
