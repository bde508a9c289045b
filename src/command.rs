//! Execution of external tools.
//!
//! Every external program (losetup, lxc, ip) goes through a [`CommandRunner`] so that the logic
//! around them can be exercised without spawning real processes.

use std::{
    future::Future,
    io::{Error, Result},
    os::unix::process::ExitStatusExt,
    process::{ExitStatus, Stdio},
};

use tokio::process::Command;

/// The captured outcome of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status, or the negated signal number if the process was killed.
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.returncode == 0
    }
}

fn returncode(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => -signal,
        (None, None) => -1,
    }
}

/// Something that can run a program to completion and capture its output.
///
/// An `Err` means the program could not be run at all.  A program which ran and failed is an `Ok`
/// with a non-zero `returncode`.
pub trait CommandRunner: Send + Sync {
    fn run(
        &self,
        program: &str,
        args: &[String],
    ) -> impl Future<Output = Result<CommandOutput>> + Send;
}

/// Runs programs on the local machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostRunner;

impl CommandRunner for HostRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| Error::new(err.kind(), format!("failed to run {program}: {err}")))?;

        Ok(CommandOutput {
            returncode: returncode(output.status),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Runs a program and fails unless it exits successfully, returning its stdout.
pub async fn checked_stdout(
    runner: &impl CommandRunner,
    program: &str,
    args: &[String],
) -> Result<String> {
    let output = runner.run(program, args).await?;
    if !output.success() {
        return Err(Error::other(format!(
            "{program} {} exited with {}: {}",
            args.join(" "),
            output.returncode,
            output.stderr.trim()
        )));
    }
    Ok(output.stdout)
}
