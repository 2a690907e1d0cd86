//! Local copy of the cluster's admin kubeconfig.

use anvil_common::Address;
use anvil_common::constants::installer::KUBECONFIG_LOOPBACK;
use std::path::Path;

use crate::state::write_private;

/// Point a coordinator-local kubeconfig at the coordinator's public address
pub fn rewrite_server(raw: &str, coordinator: &Address) -> String {
    raw.replace(
        KUBECONFIG_LOOPBACK,
        &format!("https://{}:", coordinator.url_host()),
    )
}

/// Write the kubeconfig with owner-only permissions, creating parent directories
pub fn write(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    write_private(path, contents.as_bytes())
}
