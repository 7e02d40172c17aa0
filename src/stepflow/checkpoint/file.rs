// SPDX-License-Identifier: MIT

//! File-backed checkpoint store
//!
//! Layout:
//! ```text
//! <root>/<run_id>/checkpoints/00000000000000000003.json
//! <root>/<run_id>/lease.json
//! ```
//! Checkpoints are written to a temporary file and hard-linked into place,
//! which fails if the target exists. That gives both atomic visibility and
//! collision rejection without a separate lock.
//!
//! The lease file is shared between processes. A new lease is hard-linked
//! into place the same way. Replacing an existing lease (renewal, takeover,
//! release) first creates `lease.json.<token>.lock` exclusively for the token
//! being replaced, so two processes can never both take over one lease.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex;

use super::{renew, take_over, Checkpoint, CheckpointStore, InFlight, Lease};
use crate::adk::error::StoreError;
use crate::stepflow::workflow::state::RunId;

const LEASE_FILE: &str = "lease.json";
const CHECKPOINT_DIR: &str = "checkpoints";
const LOCK_ATTEMPTS: u32 = 5;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(10);
// A lock this old belongs to a process that died mid-write
const STALE_LOCK: Duration = Duration::from_secs(10);

/// Exclusive right to replace the lease file that holds one token
struct LeaseLock {
    path: PathBuf,
}

impl LeaseLock {
    /// None when another process keeps the lock through every attempt
    async fn acquire(dir: &Path, token: &str) -> Result<Option<Self>, StoreError> {
        let path = dir.join(format!("{}.{}.lock", LEASE_FILE, token));
        for _ in 0..LOCK_ATTEMPTS {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(Some(Self { path })),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if Self::is_stale(&path).await {
                        log::warn!("Removing stale lease lock {}", path.display());
                        let _ = fs::remove_file(&path).await;
                        continue;
                    }
                    tokio::time::sleep(LOCK_RETRY_DELAY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    async fn is_stale(path: &Path) -> bool {
        match fs::metadata(path).await.and_then(|m| m.modified()) {
            Ok(modified) => modified.elapsed().is_ok_and(|age| age > STALE_LOCK),
            Err(_) => false,
        }
    }
}

impl Drop for LeaseLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Checkpoint store persisting JSON records under a directory
pub struct FileStore {
    root: PathBuf,
    // Serializes lease read-modify-write within this process
    lease_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lease_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, run_id: &RunId) -> Result<PathBuf, StoreError> {
        let valid = !run_id.as_str().is_empty()
            && run_id
                .as_str()
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::Io(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("run id '{}' is not a safe path component", run_id),
            )));
        }
        Ok(self.root.join(run_id.as_str()))
    }

    fn checkpoint_path(dir: &Path, step_seq: u64) -> PathBuf {
        dir.join(CHECKPOINT_DIR)
            .join(format!("{:020}.json", step_seq))
    }

    async fn read_lease(&self, run_id: &RunId) -> Result<Option<Lease>, StoreError> {
        let path = self.run_dir(run_id)?.join(LEASE_FILE);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the lease file; the caller holds the lock for the old token
    async fn write_lease(&self, lease: &Lease) -> Result<(), StoreError> {
        let dir = self.run_dir(&lease.run_id)?;
        let tmp = dir.join(format!("{}.{}.tmp", LEASE_FILE, lease.token));
        fs::write(&tmp, serde_json::to_vec_pretty(lease)?).await?;
        fs::rename(&tmp, dir.join(LEASE_FILE)).await?;
        Ok(())
    }

    /// Create the lease file unless one exists; false if another claim won
    async fn create_lease(&self, lease: &Lease) -> Result<bool, StoreError> {
        let dir = self.run_dir(&lease.run_id)?;
        fs::create_dir_all(&dir).await?;
        let tmp = dir.join(format!("{}.{}.tmp", LEASE_FILE, lease.token));
        fs::write(&tmp, serde_json::to_vec_pretty(lease)?).await?;

        let linked = fs::hard_link(&tmp, dir.join(LEASE_FILE)).await;
        let _ = fs::remove_file(&tmp).await;
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn checkpoint_files(&self, run_id: &RunId) -> Result<Vec<(u64, PathBuf)>, StoreError> {
        let dir = self.run_dir(run_id)?.join(CHECKPOINT_DIR);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(seq) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<u64>().ok())
                {
                    files.push((seq, path));
                }
            }
        }
        files.sort_by_key(|(seq, _)| *seq);
        Ok(files)
    }

    async fn read_checkpoint(path: &Path) -> Result<Checkpoint, StoreError> {
        let bytes = fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl CheckpointStore for FileStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let dir = self.run_dir(checkpoint.run_id())?;
        fs::create_dir_all(dir.join(CHECKPOINT_DIR)).await?;

        let target = Self::checkpoint_path(&dir, checkpoint.step_seq());
        let tmp = target.with_extension(format!("{}.tmp", uuid::Uuid::new_v4()));
        fs::write(&tmp, serde_json::to_vec_pretty(checkpoint)?).await?;

        let linked = fs::hard_link(&tmp, &target).await;
        let _ = fs::remove_file(&tmp).await;
        match linked {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(StoreError::SeqCollision {
                run_id: checkpoint.run_id().clone(),
                step_seq: checkpoint.step_seq(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_latest(&self, run_id: &RunId) -> Result<Option<Checkpoint>, StoreError> {
        match self.checkpoint_files(run_id).await?.last() {
            Some((_, path)) => Ok(Some(Self::read_checkpoint(path).await?)),
            None => Ok(None),
        }
    }

    async fn load_all(&self, run_id: &RunId) -> Result<Vec<Checkpoint>, StoreError> {
        let mut checkpoints = Vec::new();
        for (_, path) in self.checkpoint_files(run_id).await? {
            checkpoints.push(Self::read_checkpoint(&path).await?);
        }
        Ok(checkpoints)
    }

    async fn list_runs(&self) -> Result<Vec<RunId>, StoreError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut runs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    runs.push(RunId::from(name));
                }
            }
        }
        runs.sort();
        Ok(runs)
    }

    async fn claim(&self, run_id: &RunId, ttl: Duration) -> Result<Lease, StoreError> {
        let _guard = self.lease_lock.lock().await;
        let contended = |holder: Option<Lease>| StoreError::LeaseHeld {
            run_id: run_id.clone(),
            holder: holder.map_or_else(|| "unknown".to_string(), |l| l.token),
        };

        let Some(seen) = self.read_lease(run_id).await? else {
            let lease = take_over(None, run_id, ttl)?;
            if self.create_lease(&lease).await? {
                return Ok(lease);
            }
            return Err(contended(self.read_lease(run_id).await?));
        };
        if !seen.is_expired() {
            return Err(contended(Some(seen)));
        }

        let dir = self.run_dir(run_id)?;
        let held = LeaseLock::acquire(&dir, &seen.token).await?;
        let Some(_held) = held else {
            return Err(contended(Some(seen)));
        };
        // Decide again now that nobody else can replace this lease
        let current = self.read_lease(run_id).await?;
        if current.as_ref().map(|l| l.token.as_str()) != Some(seen.token.as_str()) {
            return Err(contended(current));
        }
        let lease = take_over(current, run_id, ttl)?;
        self.write_lease(&lease).await?;
        Ok(lease)
    }

    async fn heartbeat(
        &self,
        lease: &mut Lease,
        in_flight: &InFlight,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let _guard = self.lease_lock.lock().await;
        let dir = self.run_dir(&lease.run_id)?;
        let Some(_held) = LeaseLock::acquire(&dir, &lease.token).await? else {
            return Err(StoreError::LeaseLost(lease.run_id.clone()));
        };
        let mut stored = self.read_lease(&lease.run_id).await?;
        renew(stored.as_mut(), lease, in_flight, ttl)?;
        self.write_lease(lease).await
    }

    async fn release(&self, lease: &Lease) -> Result<(), StoreError> {
        let _guard = self.lease_lock.lock().await;
        let dir = self.run_dir(&lease.run_id)?;
        let Some(_held) = LeaseLock::acquire(&dir, &lease.token).await? else {
            // Someone is taking it over right now
            return Ok(());
        };
        if let Some(current) = self.read_lease(&lease.run_id).await? {
            if current.token == lease.token {
                fs::remove_file(dir.join(LEASE_FILE)).await?;
            }
        }
        Ok(())
    }
}
