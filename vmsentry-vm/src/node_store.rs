//! Instance directories kept on a node's filesystem
//!
//! [`NodeInstanceStore`] loads `<instances_root>/<vm_name>/` into an
//! [`InstanceDirectory`] and replays [`DirectoryJournal`]s onto it through a
//! [`Node`]. Images are copied from `<images_root>/`.

use crate::node::Node;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use vmsentry_core::config::defaults::*;
use vmsentry_core::config::HarnessConfig;
use vmsentry_core::error::{VmSentryError, VmSentryResult};
use vmsentry_core::instance_config::join_lines;
use vmsentry_core::instance_dir::{DirOp, DirectoryJournal, FileContent, InstanceDirectory};
use vmsentry_core::store::{ImagePool, InstanceStore};

pub struct NodeInstanceStore {
    node: Arc<dyn Node>,
    instances_root: PathBuf,
    images_root: PathBuf,
}

impl NodeInstanceStore {
    pub fn new(node: Arc<dyn Node>, instances_root: impl Into<PathBuf>, images_root: impl Into<PathBuf>) -> Self {
        Self {
            node,
            instances_root: instances_root.into(),
            images_root: images_root.into(),
        }
    }

    pub fn from_config(node: Arc<dyn Node>, config: &HarnessConfig) -> Self {
        Self::new(node, &config.instances_root, &config.images_root)
    }

    pub fn instance_dir(&self, name: &str) -> PathBuf {
        self.instances_root.join(name)
    }

    /// Only the adaptor's own text files are read; anything else is a blob
    /// named after the file, whether or not the pool still has it
    async fn read_content(&self, path: &Path, logical_name: &str) -> VmSentryResult<FileContent> {
        if !is_text_file(logical_name) {
            return Ok(FileContent::Blob {
                origin: logical_name.to_string(),
            });
        }
        let lines = self.node.read_file(path).await?;
        Ok(FileContent::Text(join_lines(&lines)))
    }

    async fn apply_op(&self, dir: &Path, op: &DirOp) -> VmSentryResult<()> {
        match op {
            DirOp::WriteFile { path, content } => {
                let lines: Vec<String> = content.lines().map(str::to_string).collect();
                self.node
                    .create_file(&dir.join(relative(path)?), &lines, None)
                    .await
            }
            DirOp::CopyFromPool { image, path } => {
                self.node
                    .copy_file(&self.images_root.join(relative(image)?), &dir.join(relative(path)?))
                    .await
            }
            DirOp::CreateDir { path } => self.node.create_dir(&dir.join(relative(path)?)).await,
            DirOp::RemoveDir { path } | DirOp::RemoveFile { path } => {
                self.node.remove_item(&dir.join(relative(path)?)).await
            }
            DirOp::Move { from, to } => {
                self.node
                    .move_item(&dir.join(relative(from)?), &dir.join(relative(to)?))
                    .await
            }
        }
    }
}

/// Files the adaptor reads as text, with or without the `.live` suffix
fn is_text_file(name: &str) -> bool {
    let base = name.strip_suffix(LIVE_SUFFIX).unwrap_or(name);
    [CONFIG_FILE, META_DATA_FILE, NETWORK_CONFIG_FILE, USER_DATA_FILE].contains(&base)
}

/// `rhel.img-20240101000000` -> `rhel.img`
fn strip_stamp(name: &str) -> &str {
    match name.rsplit_once('-') {
        Some((original, stamp)) if stamp.len() == 14 && stamp.chars().all(|c| c.is_ascii_digit()) => original,
        _ => name,
    }
}

/// Journal paths must stay inside the instance directory
fn relative(path: &str) -> VmSentryResult<&Path> {
    let p = Path::new(path);
    if p.components().all(|c| matches!(c, Component::Normal(_))) && !path.is_empty() {
        Ok(p)
    } else {
        Err(VmSentryError::InvalidOperation {
            operation: "apply journal".to_string(),
            reason: format!("path '{}' leaves the instance directory", path),
        })
    }
}

#[async_trait]
impl ImagePool for NodeInstanceStore {
    async fn contains_image(&self, image: &str) -> VmSentryResult<bool> {
        self.node.exists(&self.images_root.join(relative(image)?)).await
    }
}

#[async_trait]
impl InstanceStore for NodeInstanceStore {
    async fn load(&self, name: &str) -> VmSentryResult<InstanceDirectory> {
        let dir = self.instance_dir(name);
        if !self.node.exists(&dir).await? {
            return Ok(InstanceDirectory::new());
        }

        let mut files = BTreeMap::new();
        let mut archive = None;
        for entry in self.node.list_dir(&dir).await? {
            if entry == ARCHIVE_DIR {
                let archive_dir = dir.join(ARCHIVE_DIR);
                let mut archived = BTreeMap::new();
                for item in self.node.list_dir(&archive_dir).await? {
                    let content = self.read_content(&archive_dir.join(&item), strip_stamp(&item)).await?;
                    archived.insert(item, content);
                }
                archive = Some(archived);
            } else {
                let content = self.read_content(&dir.join(&entry), &entry).await?;
                files.insert(entry, content);
            }
        }
        debug!(instance = name, files = files.len(), archived = archive.is_some(), "Loaded instance directory");
        Ok(InstanceDirectory::from_parts(files, archive))
    }

    async fn apply(&self, name: &str, journal: &DirectoryJournal) -> VmSentryResult<()> {
        if journal.is_empty() {
            return Ok(());
        }

        // A missing image is the common failure; catch it before touching anything
        for op in journal.ops() {
            if let DirOp::CopyFromPool { image, .. } = op {
                if !self.contains_image(image).await? {
                    return Err(VmSentryError::ImageNotFound {
                        image: image.clone(),
                    });
                }
            }
        }

        let dir = self.instance_dir(name);
        for op in journal.ops() {
            self.apply_op(&dir, op).await?;
        }
        info!(
            instance = name,
            node = self.node.name(),
            ops = journal.ops().len(),
            "Applied directory journal"
        );
        Ok(())
    }

    async fn ensure_instance_dir(&self, name: &str) -> VmSentryResult<()> {
        self.node.create_dir(&self.instance_dir(name)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::LocalNode;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> NodeInstanceStore {
        let images = tmp.path().join("images");
        std::fs::create_dir_all(&images).unwrap();
        std::fs::write(images.join("rhel.img"), b"\x00qcow").unwrap();
        NodeInstanceStore::new(Arc::new(LocalNode::new()), tmp.path().join("instances"), images)
    }

    #[test]
    fn test_strip_stamp() {
        assert_eq!(strip_stamp("rhel.img-20240101000000"), "rhel.img");
        assert_eq!(strip_stamp("meta-data.live-20240101000000"), "meta-data.live");
        assert_eq!(strip_stamp("meta-data"), "meta-data");
        assert_eq!(strip_stamp("image-v2"), "image-v2");
    }

    #[test]
    fn test_relative_rejects_escapes() {
        assert!(relative("config.json").is_ok());
        assert!(relative("last_undefined_vm/rhel.img-20240101000000").is_ok());
        assert!(relative("../other/config.json").is_err());
        assert!(relative("/etc/passwd").is_err());
        assert!(relative("").is_err());
    }

    #[tokio::test]
    async fn test_disk_matches_in_memory_model() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        store.ensure_instance_dir("vm1").await.unwrap();

        let mut dir = InstanceDirectory::new();
        let mut journal = DirectoryJournal::new();
        dir.write_file(CONFIG_FILE, "{\n  \"vm_data\": {}\n}\n", &mut journal);
        dir.write_file(META_DATA_FILE, "instance-id: vm1\n", &mut journal);
        dir.copy_image("rhel.img", &mut journal);
        dir.snapshot_live(CONFIG_FILE, &mut journal);
        dir.snapshot_live(META_DATA_FILE, &mut journal);
        store.apply("vm1", &journal).await.unwrap();
        assert_eq!(store.load("vm1").await.unwrap(), dir);

        let mut journal = DirectoryJournal::new();
        let names = vec![
            "config.json.live".to_string(),
            "meta-data.live".to_string(),
            "rhel.img".to_string(),
        ];
        dir.replace_archive(&names, "20240101000000", &mut journal);
        store.apply("vm1", &journal).await.unwrap();

        let loaded = store.load("vm1").await.unwrap();
        assert_eq!(loaded, dir);
        assert_eq!(
            loaded.archive_listing().unwrap(),
            vec![
                "config.json.live-20240101000000",
                "meta-data.live-20240101000000",
                "rhel.img-20240101000000",
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_image_leaves_directory_untouched() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        store.ensure_instance_dir("vm1").await.unwrap();

        let mut dir = InstanceDirectory::new();
        let mut journal = DirectoryJournal::new();
        dir.write_file(CONFIG_FILE, "{}\n", &mut journal);
        dir.copy_image("absent.img", &mut journal);

        let err = store.apply("vm1", &journal).await.unwrap_err();
        assert!(matches!(err, VmSentryError::ImageNotFound { .. }));
        assert!(store.load("vm1").await.unwrap().list().is_empty());
    }

    #[tokio::test]
    async fn test_binary_files_outside_pool_load_as_blobs() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let dir = store.instance_dir("vm1");
        std::fs::create_dir_all(dir.join(ARCHIVE_DIR)).unwrap();
        std::fs::write(dir.join(CONFIG_FILE), "{}\n").unwrap();
        std::fs::write(dir.join("staged.qcow2"), b"QFI\xfb\x00\xff\xfe").unwrap();
        std::fs::write(dir.join(ARCHIVE_DIR).join("gone.img-20240101000000"), b"\xff\xfe\x00").unwrap();
        std::fs::write(dir.join(ARCHIVE_DIR).join("user-data.live-20240101000000"), "#cloud-config\n").unwrap();

        let loaded = store.load("vm1").await.unwrap();
        assert_eq!(
            loaded.file("staged.qcow2"),
            Some(&FileContent::Blob {
                origin: "staged.qcow2".to_string()
            })
        );
        assert_eq!(loaded.text(CONFIG_FILE), Some("{}\n"));
        assert!(loaded.contains("staged.qcow2"));
        assert_eq!(
            loaded.archive_listing().unwrap(),
            vec!["gone.img-20240101000000", "user-data.live-20240101000000"]
        );
    }

    #[tokio::test]
    async fn test_unknown_instance_loads_empty() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        assert_eq!(store.load("nope").await.unwrap(), InstanceDirectory::new());
        assert!(store.contains_image("rhel.img").await.unwrap());
        assert!(!store.contains_image("other.img").await.unwrap());
    }
}
