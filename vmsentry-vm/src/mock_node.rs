//! Scripted [`Node`] for backend tests

use crate::node::{CommandResult, Node};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use vmsentry_core::error::{VmSentryError, VmSentryResult};

/// Records every command and answers from a list of `(prefix, result)` rules
///
/// The first rule whose prefix matches the command wins; unmatched commands
/// succeed with empty output. Files live in an in-memory map.
#[derive(Default)]
pub struct MockNode {
    rules: Mutex<Vec<(String, CommandResult)>>,
    commands: Mutex<Vec<String>>,
    files: Mutex<BTreeMap<PathBuf, Vec<String>>>,
}

impl MockNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, prefix: &str, result: CommandResult) {
        self.rules.lock().push((prefix.to_string(), result));
    }

    pub fn on_stdout(&self, prefix: &str, stdout: &[&str]) {
        self.on(
            prefix,
            CommandResult {
                stdout: stdout.iter().map(|s| s.to_string()).collect(),
                stderr: Vec::new(),
                exit_code: 0,
            },
        );
    }

    pub fn on_failure(&self, prefix: &str, exit_code: i32, stderr: &str) {
        self.on(
            prefix,
            CommandResult {
                stdout: Vec::new(),
                stderr: vec![stderr.to_string()],
                exit_code,
            },
        );
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    pub fn file(&self, path: &Path) -> Option<Vec<String>> {
        self.files.lock().get(path).cloned()
    }
}

#[async_trait]
impl Node for MockNode {
    fn name(&self) -> &str {
        "mock"
    }

    async fn run(&self, command: &str, _as_root: bool) -> VmSentryResult<CommandResult> {
        self.commands.lock().push(command.to_string());
        let rules = self.rules.lock();
        Ok(rules
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, result)| result.clone())
            .unwrap_or_default())
    }

    async fn copy_file(&self, from: &Path, to: &Path) -> VmSentryResult<()> {
        let mut files = self.files.lock();
        let content = files.get(from).cloned().unwrap_or_default();
        files.insert(to.to_path_buf(), content);
        Ok(())
    }

    async fn create_file(&self, path: &Path, lines: &[String], _permissions: Option<u32>) -> VmSentryResult<()> {
        self.files.lock().insert(path.to_path_buf(), lines.to_vec());
        Ok(())
    }

    async fn read_file(&self, path: &Path) -> VmSentryResult<Vec<String>> {
        self.file(path)
            .ok_or_else(|| VmSentryError::vm_operation("read_file", path.display().to_string()))
    }

    async fn list_dir(&self, path: &Path) -> VmSentryResult<Vec<String>> {
        Ok(self
            .files
            .lock()
            .keys()
            .filter(|p| p.parent() == Some(path))
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect())
    }

    async fn exists(&self, path: &Path) -> VmSentryResult<bool> {
        Ok(self.files.lock().keys().any(|p| p.starts_with(path)))
    }

    async fn create_dir(&self, _path: &Path) -> VmSentryResult<()> {
        Ok(())
    }

    async fn move_item(&self, from: &Path, to: &Path) -> VmSentryResult<()> {
        let mut files = self.files.lock();
        let content = files
            .remove(from)
            .ok_or_else(|| VmSentryError::vm_operation("move_item", from.display().to_string()))?;
        files.insert(to.to_path_buf(), content);
        Ok(())
    }

    async fn remove_item(&self, path: &Path) -> VmSentryResult<()> {
        self.files.lock().retain(|p, _| !p.starts_with(path));
        Ok(())
    }
}
