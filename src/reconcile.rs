//! Making a freshly attached loop device visible inside the container.
//!
//! The device node is created by the host kernel, so the container never sees it on its own.
//! After a successful `losetup --show` the agent adds the device, and any partitions the kernel
//! scanned on it, to the container as `unix-block` devices.  This is a best-effort side effect:
//! failures are logged and never reach the response, which has already been decided.

use std::path::Path;

use glob::Pattern;

use crate::{command::CommandRunner, lxc::Lxc};

/// Prefix every reported device must have before anything is attached.
pub const DEVICE_PREFIX: &str = "/dev/";

/// A loop device and its partitions, about to be attached to a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceBinding {
    pub device_path: String,
    pub container: String,
    pub partition_paths: Vec<String>,
}

/// Lists the partition nodes of `device` (`<device>p<N>`), sorted.
pub fn find_partitions(device: &str) -> Vec<String> {
    let pattern = format!("{}p[0-9]*", Pattern::escape(device));
    let mut partitions: Vec<String> = match glob::glob(&pattern) {
        Ok(paths) => paths
            .filter_map(Result::ok)
            .map(|path| path.to_string_lossy().into_owned())
            .collect(),
        Err(err) => {
            log::warn!("Bad partition pattern {pattern:?}: {err}");
            vec![]
        }
    };
    partitions.sort();
    partitions
}

impl DeviceBinding {
    /// Builds a binding from the stdout of a successful `losetup --show`.
    ///
    /// Returns `None` if the output does not name a device.
    pub fn from_losetup_stdout(stdout: &str, container: &str) -> Option<Self> {
        let device_path = stdout.trim();
        if !device_path.starts_with(DEVICE_PREFIX) {
            return None;
        }
        Some(DeviceBinding {
            device_path: device_path.to_string(),
            container: container.to_string(),
            partition_paths: find_partitions(device_path),
        })
    }

    /// The base device followed by its partitions.
    pub fn devices(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.device_path.as_str())
            .chain(self.partition_paths.iter().map(String::as_str))
    }

    /// Attaches every device to the container, one directive each.
    ///
    /// A failed attachment is logged and does not stop the others.  Returns how many succeeded.
    pub async fn attach(&self, runner: &impl CommandRunner, lxc: &Lxc) -> usize {
        let mut attached = 0;
        for path in self.devices() {
            let name = match Path::new(path).file_name() {
                Some(name) => name.to_string_lossy(),
                None => continue,
            };
            log::info!("Adding device {path} to container {}", self.container);
            match lxc.add_unix_block(runner, &self.container, &name, path).await {
                Ok(output) if output.success() => attached += 1,
                Ok(output) => log::warn!(
                    "Failed to add {path} to {} ({}): {}",
                    self.container,
                    output.returncode,
                    output.stderr.trim()
                ),
                Err(err) => log::warn!("Failed to add {path} to {}: {err}", self.container),
            }
        }
        attached
    }
}
