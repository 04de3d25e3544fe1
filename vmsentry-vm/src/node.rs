//! Command execution and file staging on a peer node
//!
//! Everything the libvirt backend does on a node goes through the [`Node`]
//! trait: running `virsh`, staging instance files and moving them into the
//! archive. [`LocalNode`] works on the machine the harness runs on and
//! [`SshNode`] drives a remote node through the `ssh` client.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};
use vmsentry_core::error::{VmSentryError, VmSentryResult};
use vmsentry_core::instance_config::join_lines;

/// Output of one command, split into lines
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub exit_code: i32,
}

impl CommandResult {
    pub fn from_output(output: &std::process::Output) -> Self {
        Self {
            stdout: split_lines(&output.stdout),
            stderr: split_lines(&output.stderr),
            exit_code: output.status.code().unwrap_or(-1),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stderr_text(&self) -> String {
        self.stderr.join("\n")
    }

    /// Turn a non-zero exit into [`VmSentryError::RemoteCommand`]
    pub fn into_checked(self, node: &str, command: &str) -> VmSentryResult<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(VmSentryError::RemoteCommand {
                node: node.to_string(),
                command: command.to_string(),
                exit_code: self.exit_code,
                stderr: self.stderr_text(),
            })
        }
    }
}

fn split_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::to_string)
        .collect()
}

/// Quote `value` for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@%+,".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

fn quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

#[async_trait]
pub trait Node: Send + Sync {
    /// Host name used in logs and errors
    fn name(&self) -> &str;

    /// Run a shell command; a non-zero exit is not an error here
    async fn run(&self, command: &str, as_root: bool) -> VmSentryResult<CommandResult>;

    async fn copy_file(&self, from: &Path, to: &Path) -> VmSentryResult<()>;

    /// Write `lines` to `path`, replacing any existing file
    async fn create_file(&self, path: &Path, lines: &[String], permissions: Option<u32>) -> VmSentryResult<()>;

    async fn read_file(&self, path: &Path) -> VmSentryResult<Vec<String>>;

    /// Entry names in lexicographic order
    async fn list_dir(&self, path: &Path) -> VmSentryResult<Vec<String>>;

    async fn exists(&self, path: &Path) -> VmSentryResult<bool>;

    /// Create `path` and its parents; succeeds if it already exists
    async fn create_dir(&self, path: &Path) -> VmSentryResult<()>;

    async fn move_item(&self, from: &Path, to: &Path) -> VmSentryResult<()>;

    /// Remove a file or a directory tree; succeeds if nothing is there
    async fn remove_item(&self, path: &Path) -> VmSentryResult<()>;

    /// Run a command and fail on a non-zero exit
    async fn run_checked(&self, command: &str, as_root: bool) -> VmSentryResult<CommandResult> {
        self.run(command, as_root)
            .await?
            .into_checked(self.name(), command)
    }
}

/// The machine the harness itself runs on
#[derive(Debug, Clone)]
pub struct LocalNode {
    name: String,
    sudo: bool,
}

impl LocalNode {
    pub fn new() -> Self {
        Self {
            name: "localhost".to_string(),
            sudo: false,
        }
    }

    /// Prefix root commands with `sudo -n`
    pub fn with_sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }
}

impl Default for LocalNode {
    fn default() -> Self {
        Self::new()
    }
}

fn io_context<'a>(operation: &'static str, path: &'a Path) -> impl FnOnce(std::io::Error) -> VmSentryError + 'a {
    move |e| VmSentryError::vm_operation(operation, format!("{}: {}", path.display(), e))
}

#[async_trait]
impl Node for LocalNode {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, command: &str, as_root: bool) -> VmSentryResult<CommandResult> {
        let command = if as_root && self.sudo {
            format!("sudo -n sh -c {}", shell_quote(command))
        } else {
            command.to_string()
        };
        debug!(node = %self.name, %command, "Running command");

        let output = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        Ok(CommandResult::from_output(&output))
    }

    async fn copy_file(&self, from: &Path, to: &Path) -> VmSentryResult<()> {
        tokio::fs::copy(from, to)
            .await
            .map_err(io_context("copy_file", from))?;
        info!(node = %self.name, from = %from.display(), to = %to.display(), "Copied file");
        Ok(())
    }

    async fn create_file(&self, path: &Path, lines: &[String], permissions: Option<u32>) -> VmSentryResult<()> {
        let content = join_lines(lines);
        let target = path.to_path_buf();
        let dir = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        // Write next to the target and rename so readers never see half a file
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut file = tempfile::NamedTempFile::new_in(&dir)?;
            file.write_all(content.as_bytes())?;
            if let Some(mode) = permissions {
                use std::os::unix::fs::PermissionsExt;
                file.as_file()
                    .set_permissions(std::fs::Permissions::from_mode(mode))?;
            }
            file.persist(&target).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| VmSentryError::internal(format!("create_file task failed: {}", e)))?
        .map_err(io_context("create_file", path))?;

        debug!(node = %self.name, path = %path.display(), lines = lines.len(), "Created file");
        Ok(())
    }

    async fn read_file(&self, path: &Path) -> VmSentryResult<Vec<String>> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(io_context("read_file", path))?;
        Ok(content.lines().map(str::to_string).collect())
    }

    async fn list_dir(&self, path: &Path) -> VmSentryResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(path)
            .await
            .map_err(io_context("list_dir", path))?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    async fn exists(&self, path: &Path) -> VmSentryResult<bool> {
        match tokio::fs::metadata(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_context("exists", path)(e)),
        }
    }

    async fn create_dir(&self, path: &Path) -> VmSentryResult<()> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(io_context("create_dir", path))
    }

    async fn move_item(&self, from: &Path, to: &Path) -> VmSentryResult<()> {
        tokio::fs::rename(from, to)
            .await
            .map_err(io_context("move_item", from))
    }

    async fn remove_item(&self, path: &Path) -> VmSentryResult<()> {
        let metadata = match tokio::fs::symlink_metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(io_context("remove_item", path)(e)),
        };
        let result = if metadata.is_dir() {
            tokio::fs::remove_dir_all(path).await
        } else {
            tokio::fs::remove_file(path).await
        };
        result.map_err(io_context("remove_item", path))
    }
}

/// A peer node reached with the system `ssh` client
///
/// Authentication is left to the ssh configuration; commands run in batch
/// mode so a missing key fails instead of prompting.
#[derive(Debug, Clone)]
pub struct SshNode {
    host: String,
    user: Option<String>,
    options: Vec<String>,
    ssh: String,
}

impl SshNode {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: None,
            options: Vec::new(),
            ssh: "ssh".to_string(),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Extra `-o` option, e.g. `StrictHostKeyChecking=no`
    pub fn with_option(mut self, option: impl Into<String>) -> Self {
        self.options.push(option.into());
        self
    }

    fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    fn is_root(&self) -> bool {
        self.user.as_deref() == Some("root")
    }

    /// Wrap `command` so it runs as root on the remote side
    fn as_root(&self, command: &str) -> String {
        if self.is_root() {
            command.to_string()
        } else {
            format!("sudo -n sh -c {}", shell_quote(command))
        }
    }

    async fn ssh(&self, command: &str, stdin: Option<&[u8]>) -> VmSentryResult<CommandResult> {
        debug!(node = %self.host, %command, "Running remote command");
        let mut cmd = Command::new(&self.ssh);
        cmd.arg("-o").arg("BatchMode=yes");
        for option in &self.options {
            cmd.arg("-o").arg(option);
        }
        cmd.arg(self.destination())
            .arg(command)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input).await?;
            pipe.shutdown().await?;
        }
        let output = child.wait_with_output().await?;
        Ok(CommandResult::from_output(&output))
    }

    async fn root_checked(&self, command: &str) -> VmSentryResult<CommandResult> {
        let wrapped = self.as_root(command);
        self.ssh(&wrapped, None)
            .await?
            .into_checked(&self.host, command)
    }
}

#[async_trait]
impl Node for SshNode {
    fn name(&self) -> &str {
        &self.host
    }

    async fn run(&self, command: &str, as_root: bool) -> VmSentryResult<CommandResult> {
        if as_root {
            self.ssh(&self.as_root(command), None).await
        } else {
            self.ssh(command, None).await
        }
    }

    async fn copy_file(&self, from: &Path, to: &Path) -> VmSentryResult<()> {
        self.root_checked(&format!("cp -f {} {}", quote_path(from), quote_path(to)))
            .await?;
        info!(node = %self.host, from = %from.display(), to = %to.display(), "Copied file");
        Ok(())
    }

    async fn create_file(&self, path: &Path, lines: &[String], permissions: Option<u32>) -> VmSentryResult<()> {
        let command = self.as_root(&format!("cat > {}", quote_path(path)));
        let content = join_lines(lines);
        self.ssh(&command, Some(content.as_bytes()))
            .await?
            .into_checked(&self.host, &command)?;
        if let Some(mode) = permissions {
            self.root_checked(&format!("chmod {:o} {}", mode, quote_path(path)))
                .await?;
        }
        debug!(node = %self.host, path = %path.display(), lines = lines.len(), "Created file");
        Ok(())
    }

    async fn read_file(&self, path: &Path) -> VmSentryResult<Vec<String>> {
        Ok(self
            .root_checked(&format!("cat {}", quote_path(path)))
            .await?
            .stdout)
    }

    async fn list_dir(&self, path: &Path) -> VmSentryResult<Vec<String>> {
        let mut names = self
            .root_checked(&format!("ls -1A {}", quote_path(path)))
            .await?
            .stdout;
        names.sort();
        Ok(names)
    }

    async fn exists(&self, path: &Path) -> VmSentryResult<bool> {
        let result = self
            .run(&format!("test -e {}", quote_path(path)), true)
            .await?;
        Ok(result.success())
    }

    async fn create_dir(&self, path: &Path) -> VmSentryResult<()> {
        self.root_checked(&format!("mkdir -p {}", quote_path(path)))
            .await
            .map(|_| ())
    }

    async fn move_item(&self, from: &Path, to: &Path) -> VmSentryResult<()> {
        self.root_checked(&format!("mv -f {} {}", quote_path(from), quote_path(to)))
            .await
            .map(|_| ())
    }

    async fn remove_item(&self, path: &Path) -> VmSentryResult<()> {
        self.root_checked(&format!("rm -rf {}", quote_path(path)))
            .await
            .map(|_| ())
    }
}
