//! Loop device setup through `losetup(8)`.

use indexmap::IndexMap;

use crate::{command::CommandRunner, error::LoopSetupError};

/// Asks losetup to pick a free device node.
pub const FIND_FLAG: &str = "-f";
/// Asks losetup to print the device it picked.
pub const SHOW_FLAG: &str = "--show";

/// Builds the losetup argument vector for attaching `source` with the given mount options.
///
/// Only `partscan`, `offset`, `sizelimit` and `ro` are looked at.  The backing file always comes
/// last.
pub fn losetup_args(source: &str, options: &IndexMap<String, Option<String>>) -> Vec<String> {
    let mut args = vec![FIND_FLAG.to_string(), SHOW_FLAG.to_string()];

    if options.contains_key("partscan") {
        args.push("-P".into());
    }

    for (option, flag) in [("offset", "-o"), ("sizelimit", "--sizelimit")] {
        match options.get(option) {
            Some(Some(value)) => args.extend([flag.to_string(), value.clone()]),
            Some(None) => log::warn!("ignoring '{option}' without a value"),
            None => {}
        }
    }

    if options.contains_key("ro") {
        args.push("-r".into());
    }

    args.push(source.to_string());
    args
}

/// Attaches `source` to a free loop device and returns the device path.
///
/// `program` is handed to the runner untouched: locally it is the losetup binary to execute,
/// while a delegating runner ignores it.
pub async fn setup_loop_device(
    runner: &impl CommandRunner,
    program: &str,
    source: &str,
    options: &IndexMap<String, Option<String>>,
) -> Result<String, LoopSetupError> {
    let args = losetup_args(source, options);
    log::debug!("running {program} {args:?}");

    let output = runner.run(program, &args).await?;
    if !output.success() {
        return Err(LoopSetupError::Failed {
            returncode: output.returncode,
            stderr: output.stderr,
        });
    }

    match output.stdout.trim() {
        "" => Err(LoopSetupError::NoDevice),
        device => Ok(device.to_string()),
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::{options::MountInvocation, test::RecordingRunner};

    #[test]
    fn test_args_minimal() {
        let options = MountInvocation::parse(&["-o", "loop,noatime"]).options;
        assert_eq!(
            losetup_args("/abs/path/to/file", &options),
            ["-f", "--show", "/abs/path/to/file"]
        );
    }

    #[test]
    fn test_args_all() {
        let options =
            MountInvocation::parse(&["-o", "ro,sizelimit=1M,loop,offset=512,partscan"]).options;
        assert_eq!(
            losetup_args("disk.img", &options),
            ["-f", "--show", "-P", "-o", "512", "--sizelimit", "1M", "-r", "disk.img"]
        );
    }

    #[test]
    fn test_args_valueless_offset() {
        let options = MountInvocation::parse(&["-o", "loop,offset"]).options;
        assert_eq!(losetup_args("x", &options), ["-f", "--show", "x"]);
    }

    #[tokio::test]
    async fn test_setup_success() {
        let runner = RecordingRunner::canned(0, "/dev/loop7\n", "");
        let options = MountInvocation::parse(&["-o", "loop,offset=512,ro"]).options;
        let device = setup_loop_device(&runner, "losetup", "/tmp/disk.img", &options)
            .await
            .unwrap();
        assert_eq!(device, "/dev/loop7");
        assert_eq!(
            runner.calls(),
            [["losetup", "-f", "--show", "-o", "512", "-r", "/tmp/disk.img"]]
        );
    }

    #[tokio::test]
    async fn test_setup_failure() {
        let runner =
            RecordingRunner::canned(1, "", "losetup: disk.img: failed to set up loop device\n");
        let err = setup_loop_device(&runner, "losetup", "disk.img", &IndexMap::new())
            .await
            .unwrap_err();
        match err {
            LoopSetupError::Failed { returncode, stderr } => {
                assert_eq!(returncode, 1);
                assert!(stderr.contains("failed to set up"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_setup_empty_output() {
        let runner = RecordingRunner::canned(0, "\n", "");
        let err = setup_loop_device(&runner, "losetup", "disk.img", &IndexMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LoopSetupError::NoDevice));
    }

    #[tokio::test]
    async fn test_setup_spawn_failure() {
        let runner = RecordingRunner::new(|_, _| {
            Err(std::io::Error::from(std::io::ErrorKind::NotFound))
        });
        let err = setup_loop_device(&runner, "losetup", "disk.img", &IndexMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LoopSetupError::Spawn(_)));
    }
}
