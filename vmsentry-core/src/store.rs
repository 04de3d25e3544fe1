//! Instance directory persistence
//!
//! The lifecycle machine produces journals; an [`InstanceStore`] loads
//! directories and replays journals against whatever backs them.

use crate::error::{VmSentryError, VmSentryResult};
use crate::instance_dir::{DirOp, DirectoryJournal, InstanceDirectory};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::debug;

/// Shared pool of disk images
#[async_trait]
pub trait ImagePool: Send + Sync {
    async fn contains_image(&self, image: &str) -> VmSentryResult<bool>;
}

#[async_trait]
pub trait InstanceStore: ImagePool {
    /// Current contents of `<instances_root>/<name>/`; empty when absent
    async fn load(&self, name: &str) -> VmSentryResult<InstanceDirectory>;

    /// Replay `journal` against the instance directory
    async fn apply(&self, name: &str, journal: &DirectoryJournal) -> VmSentryResult<()>;

    /// Create the instance directory; succeeds when it already exists
    async fn ensure_instance_dir(&self, name: &str) -> VmSentryResult<()>;
}

/// Store keeping every directory in memory
#[derive(Default)]
pub struct MemoryInstanceStore {
    dirs: RwLock<HashMap<String, InstanceDirectory>>,
    pool: RwLock<HashSet<String>>,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose pool already holds `images`
    pub fn with_images<I, S>(images: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            dirs: RwLock::new(HashMap::new()),
            pool: RwLock::new(images.into_iter().map(Into::into).collect()),
        }
    }

    pub async fn add_image(&self, image: &str) {
        self.pool.write().await.insert(image.to_string());
    }

    pub async fn remove_image(&self, image: &str) {
        self.pool.write().await.remove(image);
    }

    pub async fn instance_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.dirs.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ImagePool for MemoryInstanceStore {
    async fn contains_image(&self, image: &str) -> VmSentryResult<bool> {
        Ok(self.pool.read().await.contains(image))
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn load(&self, name: &str) -> VmSentryResult<InstanceDirectory> {
        Ok(self.dirs.read().await.get(name).cloned().unwrap_or_default())
    }

    async fn apply(&self, name: &str, journal: &DirectoryJournal) -> VmSentryResult<()> {
        if journal.is_empty() {
            return Ok(());
        }

        let pool = self.pool.read().await;
        let mut dirs = self.dirs.write().await;
        let mut dir = dirs.get(name).cloned().unwrap_or_default();
        for op in journal.ops() {
            if let DirOp::CopyFromPool { image, .. } = op {
                if !pool.contains(image) {
                    return Err(VmSentryError::ImageNotFound {
                        image: image.clone(),
                    });
                }
            }
            dir.apply_op(op)?;
        }
        debug!(instance = name, ops = journal.ops().len(), "Applied journal");
        dirs.insert(name.to_string(), dir);
        Ok(())
    }

    async fn ensure_instance_dir(&self, name: &str) -> VmSentryResult<()> {
        self.dirs
            .write()
            .await
            .entry(name.to_string())
            .or_default();
        Ok(())
    }
}
