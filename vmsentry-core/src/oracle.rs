//! Invariants checked after every lifecycle command a scenario runs

use crate::config::defaults::*;
use crate::instance_dir::InstanceDirectory;
use crate::lifecycle::{CommandOutcome, LifecycleCommand};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub invariant: String,
    pub detail: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.invariant, self.detail)
    }
}

fn violation(invariant: &str, detail: String) -> Violation {
    Violation {
        invariant: invariant.to_string(),
        detail,
    }
}

/// Compares an instance directory before and after one command
pub struct InvariantOracle;

impl InvariantOracle {
    pub fn check(
        before: &InstanceDirectory,
        after: &InstanceDirectory,
        outcome: &CommandOutcome,
    ) -> Vec<Violation> {
        let mut violations = Vec::new();
        Self::cloud_init_untouched(before, after, &mut violations);
        Self::archive_matches_manifest(before, after, outcome, &mut violations);
        Self::noop_changes_nothing(before, after, outcome, &mut violations);
        Self::undefine_leaves_no_live_files(after, outcome, &mut violations);
        violations
    }

    fn cloud_init_untouched(
        before: &InstanceDirectory,
        after: &InstanceDirectory,
        violations: &mut Vec<Violation>,
    ) {
        for file in [META_DATA_FILE, NETWORK_CONFIG_FILE, USER_DATA_FILE, CONFIG_FILE] {
            if before.file(file) != after.file(file) {
                violations.push(violation(
                    "cloud-init-untouched",
                    format!("{} changed during a lifecycle command", file),
                ));
            }
        }
    }

    fn archive_matches_manifest(
        before: &InstanceDirectory,
        after: &InstanceDirectory,
        outcome: &CommandOutcome,
        violations: &mut Vec<Violation>,
    ) {
        let Some(manifest) = &outcome.archive else {
            if before.archive_listing() != after.archive_listing() {
                violations.push(violation(
                    "archive-stable",
                    "archive changed without an archive operation".to_string(),
                ));
            }
            return;
        };

        let mut expected: Vec<String> = manifest.entries.iter().map(|e| e.archived.clone()).collect();
        expected.sort();
        if after.archive_listing().as_ref() != Some(&expected) {
            violations.push(violation(
                "archive-correspondence",
                format!(
                    "expected archive {:?}, found {:?}",
                    expected,
                    after.archive_listing()
                ),
            ));
        }

        for live in before.live_files() {
            if !manifest.entries.iter().any(|e| e.original == live) {
                violations.push(violation(
                    "archive-correspondence",
                    format!("{} was not archived", live),
                ));
            }
        }

        for entry in &manifest.entries {
            if entry.archived != format!("{}-{}", entry.original, manifest.stamp) {
                violations.push(violation(
                    "archive-naming",
                    format!("{} is not {}-<timestamp>", entry.archived, entry.original),
                ));
            }
            if before.file(&entry.original) != after.archived(&entry.archived) {
                violations.push(violation(
                    "archive-content",
                    format!("{} differs from {}", entry.archived, entry.original),
                ));
            }
        }
    }

    fn noop_changes_nothing(
        before: &InstanceDirectory,
        after: &InstanceDirectory,
        outcome: &CommandOutcome,
        violations: &mut Vec<Violation>,
    ) {
        if outcome.noop && before != after {
            violations.push(violation(
                "idempotence",
                format!("no-op {} changed the instance directory", outcome.command),
            ));
        }
    }

    fn undefine_leaves_no_live_files(
        after: &InstanceDirectory,
        outcome: &CommandOutcome,
        violations: &mut Vec<Violation>,
    ) {
        let undefines = matches!(
            outcome.command,
            LifecycleCommand::StopUndefine { .. } | LifecycleCommand::ForceStopUndefine
        );
        if undefines && outcome.exit_code() == 0 && !after.live_files().is_empty() {
            violations.push(violation(
                "archive-correspondence",
                format!("live files left after undefine: {:?}", after.live_files()),
            ));
        }
    }
}
