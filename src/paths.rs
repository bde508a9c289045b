//! Translation of file arguments between the container and the host.
//!
//! Inside the container a backing file is named relative to the container's own root.  Before it
//! crosses the wire it is made absolute and stripped of its leading `/`; the agent then joins it
//! onto the container's rootfs directory on the host.

use std::{
    io::Result,
    path::{Component, Path, PathBuf},
};

/// True for tokens which are never translated: options and device nodes.
pub fn is_passthrough(arg: &str) -> bool {
    arg.starts_with('-') || arg.starts_with("/dev/")
}

/// Makes `path` absolute against `cwd` and removes `.` and `..` components lexically.
///
/// Symlinks are not resolved: the result names the path as the caller spelled it.
fn absolutize(cwd: &Path, path: &Path) -> PathBuf {
    let mut result = PathBuf::from("/");
    for component in cwd.join(path).components() {
        match component {
            Component::Prefix(..) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                result.pop();
            }
            Component::Normal(name) => result.push(name),
        }
    }
    result
}

/// Translates one argument for the wire, resolving relative paths against `cwd`.
pub fn to_wire_in(cwd: &Path, arg: &str) -> String {
    if is_passthrough(arg) {
        return arg.to_string();
    }
    let absolute = absolutize(cwd, Path::new(arg));
    let absolute = absolute.to_string_lossy();
    absolute[1..].to_string()
}

/// losetup options whose separate argument is a number or a name, never a file.
const VALUE_OPTIONS: [&str; 8] = [
    "-o",
    "--offset",
    "--sizelimit",
    "-b",
    "--sector-size",
    "-O",
    "--output",
    "--loop-ref",
];

/// Translates a losetup argument vector for the wire, resolving paths against `cwd`.
///
/// The values of options such as `-o 512` are left alone.
pub fn args_to_wire_in(cwd: &Path, args: &[String]) -> Vec<String> {
    let mut result = Vec::with_capacity(args.len());
    let mut is_value = false;
    for arg in args {
        if is_value {
            result.push(arg.clone());
        } else {
            result.push(to_wire_in(cwd, arg));
        }
        is_value = VALUE_OPTIONS.contains(&arg.as_str());
    }
    result
}

/// Translates a losetup argument vector for the wire, relative to the current directory.
pub fn to_wire(args: &[String]) -> Result<Vec<String>> {
    let cwd = std::env::current_dir()?;
    Ok(args_to_wire_in(&cwd, args))
}

/// Re-roots the backing file argument under `rootfs`.
///
/// The backing file is always the last positional argument, so only the last token which is
/// neither an option nor a device node is rewritten.  Returns the index of the rewritten token, if
/// there was one.
pub fn reroot(args: &mut [String], rootfs: &Path) -> Option<usize> {
    let index = args.iter().rposition(|arg| !is_passthrough(arg))?;
    let relative = args[index].trim_start_matches('/');
    args[index] = rootfs.join(relative).to_string_lossy().into_owned();
    Some(index)
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_passthrough() {
        let cwd = Path::new("/home/user");
        for arg in ["-f", "--show", "-o", "/dev/loop3", "--sizelimit"] {
            let once = to_wire_in(cwd, arg);
            assert_eq!(once, arg);
            assert_eq!(to_wire_in(cwd, &once), once);
        }
    }

    #[test]
    fn test_to_wire() {
        let cwd = Path::new("/home/user");
        assert_eq!(to_wire_in(cwd, "/tmp/disk.img"), "tmp/disk.img");
        assert_eq!(to_wire_in(cwd, "disk.img"), "home/user/disk.img");
        assert_eq!(to_wire_in(cwd, "./a/../b.img"), "home/user/b.img");
        assert_eq!(to_wire_in(cwd, "../../../x"), "x");
        assert_eq!(to_wire_in(cwd, "//srv//img"), "srv/img");
        // numeric option values get the same treatment as any other positional
        assert_eq!(to_wire_in(Path::new("/"), "512"), "512");
    }

    #[test]
    fn test_args_to_wire_keeps_option_values() {
        let args: Vec<String> = ["-f", "--show", "-o", "512", "--sizelimit", "4096", "-r", "disk.img"]
            .map(String::from)
            .to_vec();
        assert_eq!(
            args_to_wire_in(Path::new("/home/user"), &args),
            ["-f", "--show", "-o", "512", "--sizelimit", "4096", "-r", "home/user/disk.img"]
        );
    }

    #[test]
    fn test_reroot_last_positional() {
        let mut args: Vec<String> = ["-f", "--show", "-o", "512", "-r", "tmp/disk.img"]
            .map(String::from)
            .to_vec();
        let rootfs = Path::new("/var/lib/c1/rootfs");
        assert_eq!(reroot(&mut args, rootfs), Some(5));
        assert_eq!(args[3], "512");
        assert_eq!(args[5], "/var/lib/c1/rootfs/tmp/disk.img");
    }

    #[test]
    fn test_reroot_skips_devices() {
        let mut args: Vec<String> = ["-d", "/dev/loop0"].map(String::from).to_vec();
        assert_eq!(reroot(&mut args, Path::new("/rootfs")), None);
        assert_eq!(args, ["-d", "/dev/loop0"]);

        let mut args: Vec<String> = ["img", "-j", "/dev/loop1"].map(String::from).to_vec();
        assert_eq!(reroot(&mut args, Path::new("/rootfs")), Some(0));
        assert_eq!(args[0], "/rootfs/img");
    }

    #[test]
    fn test_reroot_stays_under_rootfs() {
        let mut args = vec!["/etc/shadow".to_string()];
        reroot(&mut args, Path::new("/rootfs"));
        assert_eq!(args[0], "/rootfs/etc/shadow");
    }

    #[test]
    fn test_compose_to_original() {
        let cwd = Path::new("/work");
        for path in ["/tmp/disk.img", "disk.img", "sub/dir/x.raw"] {
            let mut args = vec!["--show".to_string(), to_wire_in(cwd, path)];
            reroot(&mut args, Path::new("/"));
            assert_eq!(
                PathBuf::from(&args[1]),
                absolutize(cwd, Path::new(path)),
                "{path}"
            );
        }
    }
}
