//! Parsing of `mount(8)`-style argument vectors.
//!
//! Only as much of the mount grammar is understood as is needed to find the
//! option list and the two positional arguments.  Everything else is carried
//! through untouched so that it can be replayed to the real tool.

use indexmap::IndexMap;

/// Options which only make sense to the loop setup step and must not reach the real mount.
pub const LOOP_OPTIONS: [&str; 4] = ["loop", "offset", "sizelimit", "partscan"];

/// Flags whose following token is their argument.
const FLAGS_WITH_VALUE: [&str; 6] = ["-t", "--types", "-L", "-U", "--source", "--target"];

/// A parsed mount invocation.
///
/// `options` maps each `-o` item to its value (`None` for boolean options) in first-seen order.
/// `flags` holds every other dash-token verbatim, in order, including the values of flags that
/// take one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountInvocation {
    pub options: IndexMap<String, Option<String>>,
    pub flags: Vec<String>,
    pub source: Option<String>,
    pub target: Option<String>,
}

/// Where each part of a mount invocation sits in its argument vector.
///
/// Lets a caller pick the original tokens back out of an argument vector that was parsed from a
/// lossy copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgLayout {
    /// Index of every option list, with the length of the prefix (`-o`, `--options=`) fused to it.
    pub option_lists: Vec<(usize, usize)>,
    /// Indices of the flags and their values, in order.
    pub flags: Vec<usize>,
    /// Indices of the positional arguments, in order.
    pub positionals: Vec<usize>,
}

impl ArgLayout {
    pub fn of<S: AsRef<str>>(args: &[S]) -> Self {
        let mut layout = ArgLayout::default();
        let mut index = 0;
        while index < args.len() {
            let arg = args[index].as_ref();
            if arg == "-o" || arg == "--options" {
                // a trailing -o with nothing after it is dropped
                if index + 1 < args.len() {
                    layout.option_lists.push((index + 1, 0));
                }
                index += 1;
            } else if arg.starts_with("--options=") {
                layout.option_lists.push((index, "--options=".len()));
            } else if arg.starts_with("-o") {
                layout.option_lists.push((index, "-o".len()));
            } else if arg.starts_with('-') {
                layout.flags.push(index);
                if FLAGS_WITH_VALUE.contains(&arg) && index + 1 < args.len() {
                    index += 1;
                    layout.flags.push(index);
                }
            } else {
                layout.positionals.push(index);
            }
            index += 1;
        }
        layout
    }

    pub fn source(&self) -> Option<usize> {
        self.positionals.first().copied()
    }

    pub fn target(&self) -> Option<usize> {
        self.positionals.get(1).copied()
    }
}

impl MountInvocation {
    /// Parses a raw argument vector (without the program name).
    ///
    /// Parsing never fails.  Positional arguments beyond the second are dropped.
    pub fn parse<S: AsRef<str>>(args: &[S]) -> Self {
        Self::from_layout(args, &ArgLayout::of(args))
    }

    /// Builds the invocation for `args` from its already computed layout.
    pub fn from_layout<S: AsRef<str>>(args: &[S], layout: &ArgLayout) -> Self {
        let arg = |index: usize| args[index].as_ref();
        let mut invocation = MountInvocation::default();
        for &(index, prefix) in &layout.option_lists {
            invocation.add_options(&arg(index)[prefix..]);
        }
        invocation.flags = layout.flags.iter().map(|&i| arg(i).to_string()).collect();
        invocation.source = layout.source().map(|i| arg(i).to_string());
        invocation.target = layout.target().map(|i| arg(i).to_string());
        invocation
    }

    fn add_options(&mut self, list: &str) {
        for item in list.split(',').filter(|item| !item.is_empty()) {
            match item.split_once('=') {
                Some((key, value)) => self.options.insert(key.to_string(), Some(value.to_string())),
                None => self.options.insert(item.to_string(), None),
            };
        }
    }

    /// True if the `loop` option was given.
    pub fn wants_loop(&self) -> bool {
        self.options.contains_key("loop")
    }

    /// Looks up the value of an option, returning `None` for both absent and value-less options.
    pub fn option_value(&self, key: &str) -> Option<&str> {
        self.options.get(key)?.as_deref()
    }

    /// Removes the given options, keeping the order of the remaining ones.
    pub fn remove_options(&mut self, keys: &[&str]) {
        for key in keys {
            self.options.shift_remove(*key);
        }
    }
}

/// Joins an option map back into a single `-o` argument.
///
/// The `loop` marker is never emitted.  Value-less options are rendered as bare keys.
pub fn rebuild_options(options: &IndexMap<String, Option<String>>) -> String {
    options
        .iter()
        .filter(|(key, _)| *key != "loop")
        .map(|(key, value)| match value {
            Some(value) => format!("{key}={value}"),
            None => key.clone(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    fn opts(pairs: &[(&str, Option<&str>)]) -> IndexMap<String, Option<String>> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
            .collect()
    }

    #[test]
    fn test_parse_separate_options() {
        let inv = MountInvocation::parse(&["-o", "loop,offset=512,ro", "/tmp/disk.img", "/mnt/x"]);
        assert_eq!(
            inv.options,
            opts(&[("loop", None), ("offset", Some("512")), ("ro", None)])
        );
        assert!(inv.flags.is_empty());
        assert_eq!(inv.source.as_deref(), Some("/tmp/disk.img"));
        assert_eq!(inv.target.as_deref(), Some("/mnt/x"));
    }

    #[test]
    fn test_parse_fused_options() {
        let inv = MountInvocation::parse(&["-oloop,sizelimit=4096", "img", "mnt"]);
        assert_eq!(
            inv.options,
            opts(&[("loop", None), ("sizelimit", Some("4096"))])
        );

        let inv = MountInvocation::parse(&["--options=ro,uid=1000", "img"]);
        assert_eq!(inv.options, opts(&[("ro", None), ("uid", Some("1000"))]));
        assert_eq!(inv.target, None);
    }

    #[test]
    fn test_parse_value_split_once() {
        let inv = MountInvocation::parse(&["--options", "context=a=b,k"]);
        assert_eq!(inv.options, opts(&[("context", Some("a=b")), ("k", None)]));
    }

    #[test]
    fn test_parse_flags() {
        let inv = MountInvocation::parse(&[
            "-v", "-t", "ext4", "--source", "x", "-L", "root", "-n", "a", "b", "c",
        ]);
        assert_eq!(
            inv.flags,
            ["-v", "-t", "ext4", "--source", "x", "-L", "root", "-n"]
        );
        assert_eq!(inv.source.as_deref(), Some("a"));
        assert_eq!(inv.target.as_deref(), Some("b"));
        assert!(inv.options.is_empty());
    }

    #[test]
    fn test_parse_dangling() {
        // -o without a list disappears, -t without a type is kept as a bare flag
        let inv = MountInvocation::parse(&["img", "-t"]);
        assert_eq!(inv.flags, ["-t"]);
        let inv = MountInvocation::parse(&["img", "-o"]);
        assert!(inv.flags.is_empty());
        assert!(inv.options.is_empty());
        assert_eq!(inv.source.as_deref(), Some("img"));

        let empty: [&str; 0] = [];
        assert_eq!(MountInvocation::parse(&empty), MountInvocation::default());
    }

    #[test]
    fn test_parse_repeated_options() {
        // later values win, first position is kept
        let inv = MountInvocation::parse(&["-o", "a=1,b", "-o", "a=2,,c"]);
        assert_eq!(
            inv.options,
            opts(&[("a", Some("2")), ("b", None), ("c", None)])
        );
    }

    #[test]
    fn test_rebuild_round_trip() {
        let inv = MountInvocation::parse(&["-o", "k1=v1,k2,k3=v3"]);
        assert_eq!(
            inv.options,
            opts(&[("k1", Some("v1")), ("k2", None), ("k3", Some("v3"))])
        );
        assert_eq!(rebuild_options(&inv.options), "k1=v1,k2,k3=v3");

        let inv = MountInvocation::parse(&["-o", "loop,k1=v1,k2"]);
        assert_eq!(rebuild_options(&inv.options), "k1=v1,k2");
    }

    #[test]
    fn test_layout() {
        let args = ["-t", "ext4", "-oloop", "img", "-o", "ro", "--options=x", "-v", "mnt", "extra"];
        let layout = ArgLayout::of(&args);
        assert_eq!(layout.option_lists, [(2, 2), (5, 0), (6, 10)]);
        assert_eq!(layout.flags, [0, 1, 7]);
        assert_eq!(layout.positionals, [3, 8, 9]);
        assert_eq!(layout.source(), Some(3));
        assert_eq!(layout.target(), Some(8));
    }

    #[test]
    fn test_remove_options_keeps_order() {
        let mut inv =
            MountInvocation::parse(&["-o", "nodev,loop,offset=1,noexec,partscan,sizelimit=9,ro"]);
        inv.remove_options(&LOOP_OPTIONS);
        assert_eq!(rebuild_options(&inv.options), "nodev,noexec,ro");
        assert_eq!(inv.option_value("offset"), None);
        assert!(!inv.wants_loop());
    }
}
