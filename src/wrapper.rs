//! A `mount(8)` replacement which sets up loop devices through losetup.
//!
//! When asked for a loop mount of a regular file, the wrapper runs losetup itself (which inside
//! the container is the delegating client), then hands the real mount the resulting device with
//! the loop-only options removed.  Everything else goes to the real mount untouched.

use std::{
    ffi::{OsStr, OsString},
    io::Error,
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    process::Command,
};

use rustix::fs::{stat, FileType};

use crate::{
    command::CommandRunner,
    error::LoopSetupError,
    losetup::setup_loop_device,
    options::{rebuild_options, ArgLayout, MountInvocation, LOOP_OPTIONS},
};

/// The real mount binary.
pub const REAL_MOUNT_ENV: &str = "MOUNT_WRAPPER_REAL_MOUNT";
/// The losetup to run for loop mounts.
pub const LOSETUP_ENV: &str = "MOUNT_WRAPPER_LOSETUP";
/// Set to `1` to talk to the agent directly instead of running losetup.
pub const DELEGATE_ENV: &str = "MOUNT_WRAPPER_DELEGATE";

pub const DEFAULT_REAL_MOUNT: &str = "/usr/bin/mount.REAL";
pub const DEFAULT_LOSETUP: &str = "losetup";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrapperConfig {
    pub real_mount: PathBuf,
    pub losetup: String,
    pub delegate: bool,
}

impl Default for WrapperConfig {
    fn default() -> Self {
        WrapperConfig {
            real_mount: DEFAULT_REAL_MOUNT.into(),
            losetup: DEFAULT_LOSETUP.into(),
            delegate: false,
        }
    }
}

impl WrapperConfig {
    /// Builds the configuration from the values of the wrapper's environment variables.
    pub fn from_vars(
        real_mount: Option<OsString>,
        losetup: Option<String>,
        delegate: Option<String>,
    ) -> Self {
        let defaults = WrapperConfig::default();
        WrapperConfig {
            real_mount: real_mount.map(PathBuf::from).unwrap_or(defaults.real_mount),
            losetup: losetup.unwrap_or(defaults.losetup),
            delegate: delegate.is_some_and(|value| value == "1"),
        }
    }

    pub fn from_env() -> Self {
        Self::from_vars(
            std::env::var_os(REAL_MOUNT_ENV),
            std::env::var(LOSETUP_ENV).ok(),
            std::env::var(DELEGATE_ENV).ok(),
        )
    }
}

fn is_regular_file(path: &str) -> bool {
    stat(path).is_ok_and(|st| FileType::from_raw_mode(st.st_mode) == FileType::RegularFile)
}

/// A loop mount, ready for its device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopMount {
    /// The backing file.
    pub source: String,
    pub invocation: MountInvocation,
    /// The flags and the target exactly as given, so that they reach the real mount unchanged.
    pub flags: Vec<OsString>,
    pub target: Option<OsString>,
}

/// What the wrapper is going to do with an invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountPlan {
    /// Hand the arguments to the real mount as they are.
    PassThrough,
    /// Set up a loop device first.
    Loop(LoopMount),
}

impl MountPlan {
    /// Plans a raw argument vector (without `argv[0]`).
    pub fn from_args(args: &[OsString]) -> Self {
        let lossy: Vec<_> = args.iter().map(|arg| arg.to_string_lossy()).collect();
        let layout = ArgLayout::of(&lossy);
        let invocation = MountInvocation::from_layout(&lossy, &layout);
        log::debug!("parsed {invocation:?}");

        // the backing file crosses the wire as a string, so it must be valid UTF-8
        let source = layout.source().and_then(|index| args[index].to_str());
        match source {
            Some(source) if invocation.wants_loop() && is_regular_file(source) => {
                MountPlan::Loop(LoopMount {
                    source: source.to_string(),
                    flags: layout.flags.iter().map(|&i| args[i].clone()).collect(),
                    target: layout.target().map(|i| args[i].clone()),
                    invocation,
                })
            }
            _ => MountPlan::PassThrough,
        }
    }
}

/// The real mount's arguments once `device` stands in for the backing file.
///
/// `ro` is dropped along with the loop options: it has already been applied to the device.
pub fn loop_mount_args(mount: &LoopMount, device: &str) -> Vec<OsString> {
    let mut invocation = mount.invocation.clone();
    invocation.remove_options(&LOOP_OPTIONS);
    invocation.remove_options(&["ro"]);

    let mut args = mount.flags.clone();
    let options = rebuild_options(&invocation.options);
    if !options.is_empty() {
        args.extend(["-o".into(), options.into()]);
    }
    args.push(device.into());
    args.extend(mount.target.clone());
    args
}

/// Sets up the loop device and returns the real mount's arguments.
///
/// A failure here is fatal: the real mount must not run.
pub async fn loop_mount(
    runner: &impl CommandRunner,
    config: &WrapperConfig,
    mount: &LoopMount,
) -> Result<Vec<OsString>, LoopSetupError> {
    log::debug!("loop mount requested for {}", mount.source);
    let options = &mount.invocation.options;
    let device = setup_loop_device(runner, &config.losetup, &mount.source, options).await?;
    log::debug!("losetup returned device {device}");

    Ok(loop_mount_args(mount, &device))
}

/// Replaces the current process with `program`, which also becomes `argv[0]`.
///
/// Only returns if the exec failed.
pub fn exec(program: &Path, args: &[impl AsRef<OsStr>]) -> Error {
    let shown: Vec<&OsStr> = args.iter().map(AsRef::as_ref).collect();
    log::debug!("executing {} {shown:?}", program.display());
    Command::new(program).arg0(program).args(args).exec()
}
