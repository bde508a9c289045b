//! The LXD side of things: instance lookups and device attachment, all through the `lxc` CLI.

use std::{collections::BTreeMap, path::PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;

use crate::command::{checked_stdout, CommandOutput, CommandRunner};

/// Where the snap-packaged LXD keeps its storage pools.
pub const STORAGE_POOLS_DIR: &str = "/var/snap/lxd/common/lxd/storage-pools";

#[derive(Debug, Deserialize)]
struct Instance {
    #[serde(default)]
    expanded_devices: BTreeMap<String, BTreeMap<String, Value>>,
}

/// The host directory holding `container`'s root filesystem in the given storage pool.
pub fn rootfs_path(pool: &str, container: &str) -> PathBuf {
    [STORAGE_POOLS_DIR, pool, "containers", container, "rootfs"]
        .iter()
        .collect()
}

/// Finds the host network a container's NIC is attached to, from `lxc query /1.0/instances/<name>`.
///
/// Managed networks are named by `network`; NICs bridged directly onto a host interface name it in
/// `parent`.
pub fn parse_instance_network(json: &str) -> Result<String> {
    let instance: Instance = serde_json::from_str(json).context("Parsing instance")?;
    for device in instance.expanded_devices.values() {
        let field = |key: &str| device.get(key).and_then(Value::as_str);
        if field("type") != Some("nic") {
            continue;
        }
        if let Some(network) = field("network").or_else(|| field("parent")) {
            return Ok(network.to_string());
        }
    }
    bail!("No network device with parent found for container");
}

/// A thin wrapper over the `lxc` client.
#[derive(Debug, Clone)]
pub struct Lxc {
    pub program: String,
}

impl Default for Lxc {
    fn default() -> Self {
        Lxc {
            program: "lxc".into(),
        }
    }
}

impl Lxc {
    /// The network (bridge) `container` is attached to.
    pub async fn container_network(
        &self,
        runner: &impl CommandRunner,
        container: &str,
    ) -> Result<String> {
        let args = ["query".to_string(), format!("/1.0/instances/{container}")];
        let json = checked_stdout(runner, &self.program, &args)
            .await
            .with_context(|| format!("Failed to query container {container}"))?;
        parse_instance_network(&json)
    }

    /// Arguments of the directive adding a host block device to `container` at the same path.
    pub fn add_unix_block_args(container: &str, name: &str, path: &str) -> Vec<String> {
        vec![
            "config".into(),
            "device".into(),
            "add".into(),
            container.into(),
            name.into(),
            "unix-block".into(),
            format!("source={path}"),
            format!("path={path}"),
        ]
    }

    /// Adds a host block device to `container`, named `name`, at the same path it has on the host.
    pub async fn add_unix_block(
        &self,
        runner: &impl CommandRunner,
        container: &str,
        name: &str,
        path: &str,
    ) -> std::io::Result<CommandOutput> {
        runner
            .run(&self.program, &Self::add_unix_block_args(container, name, path))
            .await
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::test::RecordingRunner;

    const INSTANCE: &str = r#"{
        "name": "builder",
        "status": "Running",
        "expanded_devices": {
            "root": {"path": "/", "pool": "default", "type": "disk"},
            "eth0": {"name": "eth0", "network": "lxdbr0", "type": "nic"}
        }
    }"#;

    #[test]
    fn test_rootfs_path() {
        assert_eq!(
            rootfs_path("default", "builder"),
            PathBuf::from("/var/snap/lxd/common/lxd/storage-pools/default/containers/builder/rootfs")
        );
    }

    #[test]
    fn test_parse_network() {
        assert_eq!(parse_instance_network(INSTANCE).unwrap(), "lxdbr0");

        let bridged = r#"{"expanded_devices": {"eth0": {"nictype": "bridged", "parent": "br0", "type": "nic"}}}"#;
        assert_eq!(parse_instance_network(bridged).unwrap(), "br0");

        let none = r#"{"expanded_devices": {"root": {"path": "/", "type": "disk"}}}"#;
        assert!(parse_instance_network(none).is_err());
        assert!(parse_instance_network("{}").is_err());
    }

    #[tokio::test]
    async fn test_container_network() {
        let runner = RecordingRunner::canned(0, INSTANCE, "");
        let network = Lxc::default()
            .container_network(&runner, "builder")
            .await
            .unwrap();
        assert_eq!(network, "lxdbr0");
        assert_eq!(runner.calls(), [["lxc", "query", "/1.0/instances/builder"]]);

        let runner = RecordingRunner::canned(1, "", "Error: Instance not found\n");
        assert!(Lxc::default()
            .container_network(&runner, "ghost")
            .await
            .is_err());
    }

    #[test]
    fn test_add_unix_block_args() {
        assert_eq!(
            Lxc::add_unix_block_args("builder", "loop7p1", "/dev/loop7p1"),
            [
                "config",
                "device",
                "add",
                "builder",
                "loop7p1",
                "unix-block",
                "source=/dev/loop7p1",
                "path=/dev/loop7p1"
            ]
        );
    }
}
