//! In-memory model of one instance directory
//!
//! `<instances_root>/<vm_name>/` is represented as an [`InstanceDirectory`]
//! value. Every mutation records a [`DirOp`] into a [`DirectoryJournal`];
//! stores replay the journal against real storage so the lifecycle machine
//! never touches the filesystem itself.

use crate::config::defaults::*;
use crate::error::{VmSentryError, VmSentryResult};
use crate::instance_config::InstanceConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Content of one file in the directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileContent {
    Text(String),
    /// Opaque binary, such as a disk image; `origin` names where it came from
    Blob { origin: String },
}

impl FileContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FileContent::Text(text) => Some(text),
            FileContent::Blob { .. } => None,
        }
    }
}

/// One replayable directory operation, paths relative to the instance directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DirOp {
    WriteFile { path: String, content: String },
    CopyFromPool { image: String, path: String },
    CreateDir { path: String },
    RemoveDir { path: String },
    RemoveFile { path: String },
    Move { from: String, to: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryJournal {
    ops: Vec<DirOp>,
}

impl DirectoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: DirOp) {
        self.ops.push(op);
    }

    pub fn ops(&self) -> &[DirOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn extend(&mut self, other: DirectoryJournal) {
        self.ops.extend(other.ops);
    }
}

impl IntoIterator for DirectoryJournal {
    type Item = DirOp;
    type IntoIter = std::vec::IntoIter<DirOp>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.into_iter()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDirectory {
    files: BTreeMap<String, FileContent>,
    archive: Option<BTreeMap<String, FileContent>>,
}

impl InstanceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a directory from already loaded parts
    pub fn from_parts(
        files: BTreeMap<String, FileContent>,
        archive: Option<BTreeMap<String, FileContent>>,
    ) -> Self {
        Self { files, archive }
    }

    pub fn file(&self, name: &str) -> Option<&FileContent> {
        self.files.get(name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.files.get(name).and_then(FileContent::as_text)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    /// Top-level file names in lexicographic order
    pub fn list(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }

    /// `*.live` snapshot names in lexicographic order
    pub fn live_files(&self) -> Vec<String> {
        self.files
            .keys()
            .filter(|name| name.ends_with(LIVE_SUFFIX))
            .cloned()
            .collect()
    }

    pub fn has_archive(&self) -> bool {
        self.archive.is_some()
    }

    /// Names inside `last_undefined_vm/`, or `None` when it does not exist
    pub fn archive_listing(&self) -> Option<Vec<String>> {
        self.archive.as_ref().map(|a| a.keys().cloned().collect())
    }

    pub fn archived(&self, name: &str) -> Option<&FileContent> {
        self.archive.as_ref().and_then(|a| a.get(name))
    }

    /// Parse `config.json`
    pub fn config(&self, instance: &str) -> VmSentryResult<InstanceConfig> {
        let content = self.text(CONFIG_FILE).ok_or_else(|| VmSentryError::MissingFile {
            instance: instance.to_string(),
            file: CONFIG_FILE.to_string(),
        })?;
        InstanceConfig::parse(content)
    }

    pub fn write_file(&mut self, name: &str, content: impl Into<String>, journal: &mut DirectoryJournal) {
        let content = content.into();
        journal.push(DirOp::WriteFile {
            path: name.to_string(),
            content: content.clone(),
        });
        self.files.insert(name.to_string(), FileContent::Text(content));
    }

    pub fn remove_file(&mut self, name: &str, journal: &mut DirectoryJournal) {
        if self.files.remove(name).is_some() {
            journal.push(DirOp::RemoveFile {
                path: name.to_string(),
            });
        }
    }

    /// Copy `image` from the shared pool into the directory under the same name
    pub fn copy_image(&mut self, image: &str, journal: &mut DirectoryJournal) {
        journal.push(DirOp::CopyFromPool {
            image: image.to_string(),
            path: image.to_string(),
        });
        self.files.insert(
            image.to_string(),
            FileContent::Blob {
                origin: image.to_string(),
            },
        );
    }

    /// Write `<name>.live` holding the current content of `name`
    ///
    /// Returns false when `name` is absent or not text.
    pub fn snapshot_live(&mut self, name: &str, journal: &mut DirectoryJournal) -> bool {
        let Some(content) = self.text(name).map(str::to_string) else {
            return false;
        };
        self.write_file(&format!("{}{}", name, LIVE_SUFFIX), content, journal);
        true
    }

    /// Replace the archive with `names`, each renamed to `<name>-<stamp>`
    ///
    /// Names not present in the directory are skipped.
    pub fn replace_archive(&mut self, names: &[String], stamp: &str, journal: &mut DirectoryJournal) {
        if self.archive.is_some() {
            journal.push(DirOp::RemoveDir {
                path: ARCHIVE_DIR.to_string(),
            });
        }
        journal.push(DirOp::CreateDir {
            path: ARCHIVE_DIR.to_string(),
        });

        let mut archive = BTreeMap::new();
        for name in names {
            if let Some(content) = self.files.remove(name) {
                let archived = format!("{}-{}", name, stamp);
                journal.push(DirOp::Move {
                    from: name.clone(),
                    to: format!("{}/{}", ARCHIVE_DIR, archived),
                });
                archive.insert(archived, content);
            }
        }
        self.archive = Some(archive);
    }

    /// Delete `last_undefined_vm/` and its contents
    pub fn remove_archive(&mut self, journal: &mut DirectoryJournal) {
        if self.archive.take().is_some() {
            journal.push(DirOp::RemoveDir {
                path: ARCHIVE_DIR.to_string(),
            });
        }
    }

    /// Replay one journaled operation onto this value
    pub fn apply_op(&mut self, op: &DirOp) -> VmSentryResult<()> {
        match op {
            DirOp::WriteFile { path, content } => {
                self.files
                    .insert(path.clone(), FileContent::Text(content.clone()));
            }
            DirOp::CopyFromPool { image, path } => {
                self.files.insert(
                    path.clone(),
                    FileContent::Blob {
                        origin: image.clone(),
                    },
                );
            }
            DirOp::CreateDir { path } => {
                check_archive_path(path)?;
                self.archive.get_or_insert_with(BTreeMap::new);
            }
            DirOp::RemoveDir { path } => {
                check_archive_path(path)?;
                self.archive = None;
            }
            DirOp::RemoveFile { path } => {
                self.files.remove(path);
            }
            DirOp::Move { from, to } => {
                let content = self.files.remove(from).ok_or_else(|| {
                    VmSentryError::InvalidOperation {
                        operation: "move".to_string(),
                        reason: format!("{} does not exist", from),
                    }
                })?;
                match to.strip_prefix(&format!("{}/", ARCHIVE_DIR)) {
                    Some(archived) => {
                        let archive = self.archive.as_mut().ok_or_else(|| {
                            VmSentryError::InvalidOperation {
                                operation: "move".to_string(),
                                reason: format!("{} does not exist", ARCHIVE_DIR),
                            }
                        })?;
                        archive.insert(archived.to_string(), content);
                    }
                    None => {
                        self.files.insert(to.clone(), content);
                    }
                }
            }
        }
        Ok(())
    }
}

fn check_archive_path(path: &str) -> VmSentryResult<()> {
    if path == ARCHIVE_DIR {
        Ok(())
    } else {
        Err(VmSentryError::InvalidOperation {
            operation: "directory".to_string(),
            reason: format!("unexpected subdirectory '{}'", path),
        })
    }
}
