//! Loop device setup for unprivileged LXD containers.
//!
//! A container cannot create loop devices itself.  Inside it, `losetup` is replaced by a client
//! which forwards its arguments to an agent on the host, and `mount` by a wrapper which sets up
//! loop mounts through that client.  The agent runs the real losetup against the container's
//! rootfs and attaches the resulting devices to the container.

pub mod client;
pub mod command;
pub mod error;
pub mod losetup;
pub mod lxc;
pub mod net;
pub mod options;
pub mod paths;
pub mod protocol;
pub mod reconcile;
pub mod server;
pub mod wrapper;
