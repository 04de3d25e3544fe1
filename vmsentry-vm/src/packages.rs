//! Prerequisite packages on a node

use crate::node::{shell_quote, Node};
use tracing::info;
use vmsentry_core::error::VmSentryResult;

/// Install `package` with yum unless `rpm -q` already finds it
///
/// Returns true when the package had to be installed.
pub async fn ensure_installed(node: &dyn Node, package: &str) -> VmSentryResult<bool> {
    let package = shell_quote(package);
    if node.run(&format!("rpm -q {}", package), true).await?.success() {
        info!(node = node.name(), %package, "Package already installed");
        return Ok(false);
    }

    node.run_checked(&format!("yum install -y {}", package), true)
        .await?;
    info!(node = node.name(), %package, "Installed package");
    Ok(true)
}
