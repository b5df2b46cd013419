//! Persistence of mutable daemon configuration across restarts
//!
//! A checkpoint holds the cluster and node configuration in force plus the
//! power-monitoring state of the running applications. It is written before
//! a controlled restart and restored on start, while the daemon is not yet
//! serving clients, so no locking is involved here.
//!
//! On disk the checkpoint is a JSON envelope carrying the payload and its
//! SHA-256 digest. Writes go to a temporary file that is renamed over the
//! target.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::{ClusterConf, NodeConf};
use crate::error::{EardError, Result};
use crate::policy::ManagedApp;

const CHECKPOINT_VERSION: u32 = 1;

/// Power-monitoring state of the node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PowermonApp {
    pub apps: Vec<ManagedApp>,
    /// Raw risk mask
    pub risk: u8,
    /// Administrator frequency ceiling in kHz
    pub max_freq: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub cluster_conf: ClusterConf,
    pub node_conf: NodeConf,
    pub powermon_app: PowermonApp,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u32,
    saved_at: i64,
    checksum: String,
    payload: String,
}

fn digest(payload: &str) -> String {
    hex::encode(Sha256::digest(payload.as_bytes()))
}

/// Checkpoint file location
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Atomically replace the stored checkpoint
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let payload = serde_json::to_string(checkpoint)?;
        let envelope = Envelope {
            version: CHECKPOINT_VERSION,
            saved_at: chrono::Utc::now().timestamp(),
            checksum: digest(&payload),
            payload,
        };
        let bytes = serde_json::to_vec_pretty(&envelope)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        debug!(path = %self.path.display(), bytes = bytes.len(), "Checkpoint written");
        Ok(())
    }

    /// Read and verify the stored checkpoint
    ///
    /// # Errors
    /// * `NotFound` when no checkpoint exists
    /// * `InvalidArgument` when the file is corrupt or from another version
    pub fn load(&self) -> Result<Checkpoint> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(EardError::not_found(format!(
                    "no checkpoint at {}",
                    self.path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let envelope: Envelope = serde_json::from_slice(&bytes)
            .map_err(|e| EardError::invalid(format!("corrupt checkpoint envelope: {}", e)))?;

        if envelope.version != CHECKPOINT_VERSION {
            return Err(EardError::invalid(format!(
                "unsupported checkpoint version {}",
                envelope.version
            )));
        }
        if digest(&envelope.payload) != envelope.checksum {
            return Err(EardError::invalid("checkpoint checksum mismatch"));
        }

        serde_json::from_str(&envelope.payload)
            .map_err(|e| EardError::invalid(format!("corrupt checkpoint payload: {}", e)))
    }

    /// Delete the stored checkpoint once it has been restored
    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AppInfo, Policy};
    use tempfile::TempDir;

    fn sample() -> Checkpoint {
        let mut app = ManagedApp::new(
            4242,
            AppInfo {
                job_id: 77,
                step_id: 1,
            },
            Policy::MinEnergy,
            2_000_000,
        );
        app.caps.power_w = Some(280.0);

        Checkpoint {
            cluster_conf: ClusterConf::default(),
            node_conf: NodeConf::default(),
            powermon_app: PowermonApp {
                apps: vec![app],
                risk: 0x09,
                max_freq: 2_200_000,
            },
        }
    }

    #[test]
    fn test_save_and_restore() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("state/eard.ckpt"));

        let checkpoint = sample();
        store.save(&checkpoint).unwrap();
        assert!(store.exists());
        assert!(!dir.path().join("state/eard.tmp").exists());

        assert_eq!(store.load().unwrap(), checkpoint);
    }

    #[test]
    fn test_missing_checkpoint_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("absent.ckpt"));
        assert!(matches!(store.load(), Err(EardError::NotFound(_))));
        store.remove().unwrap();
    }

    #[test]
    fn test_tampered_checkpoint_rejected() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("eard.ckpt"));
        store.save(&sample()).unwrap();

        let text = fs::read_to_string(store.path()).unwrap();
        let tampered = text.replace("2200000", "2400000");
        assert_ne!(text, tampered);
        fs::write(store.path(), tampered).unwrap();

        assert!(matches!(store.load(), Err(EardError::InvalidArgument(_))));
    }

    #[test]
    fn test_garbage_rejected() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("eard.ckpt"));
        fs::write(store.path(), b"not json").unwrap();
        assert!(matches!(store.load(), Err(EardError::InvalidArgument(_))));
    }
}
