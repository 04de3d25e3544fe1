//! Archival of a VM's runtime files on undefine
//!
//! On every undefine of a defined VM the `*.live` snapshots and the disk image
//! named by `config.json` are moved into `last_undefined_vm/` as
//! `<name>-<timestamp>`. The archive only ever holds the latest batch.

use crate::config::defaults::*;
use crate::instance_dir::{DirectoryJournal, InstanceDirectory};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Timelike, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use tracing::{debug, info};

pub const STAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Hands out fixed-width archive timestamps that never repeat or go backwards
#[derive(Debug, Default)]
pub struct StampGenerator {
    last: Mutex<Option<NaiveDateTime>>,
}

impl StampGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, now: SystemTime) -> String {
        let now: DateTime<Utc> = now.into();
        let naive = now.naive_utc();
        let mut candidate = naive.with_nanosecond(0).unwrap_or(naive);
        let mut last = self.last.lock();
        if let Some(prev) = *last {
            if candidate <= prev {
                candidate = prev + ChronoDuration::seconds(1);
            }
        }
        *last = Some(candidate);
        candidate.format(STAMP_FORMAT).to_string()
    }
}

/// Record of one archive batch: live files first, then the image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub stamp: String,
    pub entries: Vec<ArchivedFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedFile {
    pub original: String,
    pub archived: String,
}

impl ArchiveManifest {
    pub fn originals(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.original.as_str()).collect()
    }
}

/// Files that would be archived: every `*.live` plus the current image if present
pub fn archive_candidates(dir: &InstanceDirectory, image: Option<&str>) -> Vec<String> {
    let mut names = dir.live_files();
    if let Some(image) = image {
        if dir.contains(image) && !names.iter().any(|n| n == image) {
            names.push(image.to_string());
        }
    }
    names
}

/// Archive a directory whose domain was just undefined
///
/// Returns the new directory, the journal to replay and the manifest. When
/// there are no `*.live` files the input is returned untouched with an empty
/// journal and no manifest: the VM was never defined from this directory, or
/// its files were already archived.
pub fn archive_on_undefine(
    dir: &InstanceDirectory,
    image: Option<&str>,
    stamp: &str,
) -> (InstanceDirectory, DirectoryJournal, Option<ArchiveManifest>) {
    let mut journal = DirectoryJournal::new();
    if dir.live_files().is_empty() {
        debug!("No live files to archive");
        return (dir.clone(), journal, None);
    }

    let names = archive_candidates(dir, image);
    let mut next = dir.clone();
    next.replace_archive(&names, stamp, &mut journal);

    let manifest = ArchiveManifest {
        stamp: stamp.to_string(),
        entries: names
            .iter()
            .map(|name| ArchivedFile {
                original: name.clone(),
                archived: format!("{}-{}", name, stamp),
            })
            .collect(),
    };
    info!(
        files = manifest.entries.len(),
        stamp, "Archived runtime files into {}", ARCHIVE_DIR
    );
    (next, journal, Some(manifest))
}
