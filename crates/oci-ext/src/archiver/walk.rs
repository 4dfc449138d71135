//! Directory walker feeding a bounded channel from a producer thread.

use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, Receiver};

use anyhow::Context;
use fn_error_context::context;
use tokio_util::sync::CancellationToken;

use crate::Result;

/// Items buffered between the walker thread and its consumer.
const WALK_CHANNEL_DEPTH: usize = 32;

/// Which kinds of filesystem objects a walk emits; a union.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileTypes {
    /// Regular files.
    pub regular: bool,
    /// Directories.
    pub directory: bool,
    /// Symbolic links.
    pub symlink: bool,
}

impl FileTypes {
    /// Every type, including those not listed individually (devices, fifos).
    pub const ALL: FileTypes = FileTypes {
        regular: true,
        directory: true,
        symlink: true,
    };

    fn is_all(&self) -> bool {
        *self == Self::ALL
    }

    fn matches(&self, ft: std::fs::FileType) -> bool {
        if self.is_all() {
            return true;
        }
        (self.regular && ft.is_file())
            || (self.directory && ft.is_dir())
            || (self.symlink && ft.is_symlink())
    }
}

impl Default for FileTypes {
    fn default() -> Self {
        Self::ALL
    }
}

/// Options for [`walk`].
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Do not emit the root itself.
    pub skip_root: bool,
    /// Maximum number of path separators in an emitted relative path;
    /// `None` is unlimited.
    pub max_recurse_depth: Option<usize>,
    /// Shell globs matched against the basename; an item is emitted if any
    /// matches. Empty matches everything.
    pub glob_patterns: Vec<String>,
    /// Kinds of objects to emit.
    pub file_types: FileTypes,
}

/// One object found by [`walk`].
#[derive(Debug)]
pub struct WalkItem {
    /// Absolute (or root-prefixed) path on disk.
    pub full_path: PathBuf,
    /// Path relative to the walk root; `.` for the root itself.
    pub rel_path: PathBuf,
    /// `lstat` metadata; the root is `stat`ed when it is a symlink.
    pub metadata: Metadata,
    /// Target of a symbolic link.
    pub link_target: Option<PathBuf>,
}

/// Walk `root`, sending items to the returned channel from a background
/// thread.
///
/// A symlink at the root is followed; symlinks below it are reported as
/// links. The first walk error is sent as the last item. Once `cancel`
/// fires no further items are sent.
#[context("Walking {root:?}")]
pub fn walk(
    root: &Path,
    opts: WalkOptions,
    cancel: CancellationToken,
) -> Result<Receiver<Result<WalkItem>>> {
    let globs = opts
        .glob_patterns
        .iter()
        .map(|g| glob::Pattern::new(g).with_context(|| format!("Invalid glob {g:?}")))
        .collect::<Result<Vec<_>>>()?;
    let mut walker = walkdir::WalkDir::new(root)
        .follow_root_links(true)
        .follow_links(false)
        .sort_by_file_name();
    if let Some(depth) = opts.max_recurse_depth {
        walker = walker.max_depth(depth + 1);
    }
    if opts.skip_root {
        walker = walker.min_depth(1);
    }

    let (tx, rx) = sync_channel(WALK_CHANNEL_DEPTH);
    let root = root.to_owned();
    std::thread::spawn(move || {
        for entry in walker {
            if cancel.is_cancelled() {
                return;
            }
            let item = entry
                .map_err(anyhow::Error::from)
                .and_then(|entry| to_item(&root, entry));
            let item = match item {
                Ok(item) => item,
                Err(e) => {
                    let _ = tx.send(Err(e));
                    return;
                }
            };
            if !opts.file_types.matches(item.metadata.file_type()) {
                continue;
            }
            if !globs.is_empty() {
                let name = item
                    .full_path
                    .file_name()
                    .map(Path::new)
                    .unwrap_or(item.full_path.as_path());
                if !globs.iter().any(|g| g.matches_path(name)) {
                    continue;
                }
            }
            if cancel.is_cancelled() || tx.send(Ok(item)).is_err() {
                return;
            }
        }
    });
    Ok(rx)
}

fn to_item(root: &Path, entry: walkdir::DirEntry) -> Result<WalkItem> {
    let full_path = entry.path().to_owned();
    let rel_path = match full_path.strip_prefix(root)? {
        p if p.as_os_str().is_empty() => PathBuf::from("."),
        p => p.to_owned(),
    };
    let metadata = entry.metadata()?;
    let link_target = if entry.path_is_symlink() && entry.depth() > 0 {
        Some(
            std::fs::read_link(&full_path)
                .with_context(|| format!("Reading link {full_path:?}"))?,
        )
    } else {
        None
    };
    Ok(WalkItem {
        full_path,
        rel_path,
        metadata,
        link_target,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> Result<tempfile::TempDir> {
        let td = tempfile::tempdir()?;
        let p = td.path();
        std::fs::create_dir_all(p.join("etc/talos"))?;
        std::fs::write(p.join("etc/hostname"), "node")?;
        std::fs::write(p.join("etc/talos/config.yaml"), "version: v1alpha1")?;
        std::fs::write(p.join("README.md"), "hi")?;
        std::os::unix::fs::symlink("etc/hostname", p.join("hostname"))?;
        Ok(td)
    }

    fn collect(root: &Path, opts: WalkOptions) -> Vec<String> {
        walk(root, opts, CancellationToken::new())
            .unwrap()
            .into_iter()
            .map(|i| i.unwrap().rel_path.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_walk_all() -> Result<()> {
        let td = fixture()?;
        let items = collect(td.path(), WalkOptions::default());
        similar_asserts::assert_eq!(
            items,
            [
                ".",
                "README.md",
                "etc",
                "etc/hostname",
                "etc/talos",
                "etc/talos/config.yaml",
                "hostname"
            ]
        );
        Ok(())
    }

    #[test]
    fn test_walk_options() -> Result<()> {
        let td = fixture()?;
        let opts = WalkOptions {
            skip_root: true,
            max_recurse_depth: Some(1),
            ..Default::default()
        };
        assert_eq!(
            collect(td.path(), opts),
            ["README.md", "etc", "etc/hostname", "etc/talos", "hostname"]
        );

        let opts = WalkOptions {
            glob_patterns: vec!["*.yaml".into(), "READ??.md".into()],
            ..Default::default()
        };
        assert_eq!(
            collect(td.path(), opts),
            ["README.md", "etc/talos/config.yaml"]
        );

        let opts = WalkOptions {
            file_types: FileTypes {
                regular: false,
                directory: true,
                symlink: true,
            },
            skip_root: true,
            ..Default::default()
        };
        assert_eq!(collect(td.path(), opts), ["etc", "etc/talos", "hostname"]);
        Ok(())
    }

    #[test]
    fn test_walk_symlinks() -> Result<()> {
        let td = fixture()?;
        let link = td.path().join("etc/talos/root");
        std::os::unix::fs::symlink(td.path(), &link)?;
        let rx = walk(
            &link,
            WalkOptions {
                max_recurse_depth: Some(0),
                ..Default::default()
            },
            CancellationToken::new(),
        )?;
        let items = rx.into_iter().collect::<Result<Vec<_>>>()?;
        // The root link is followed, inner links are reported as links.
        assert!(items[0].metadata.is_dir());
        let inner = items
            .iter()
            .find(|i| i.rel_path == Path::new("hostname"))
            .unwrap();
        assert_eq!(
            inner.link_target.as_deref(),
            Some(Path::new("etc/hostname"))
        );
        assert!(inner.metadata.file_type().is_symlink());
        Ok(())
    }

    #[test]
    fn test_walk_error_is_terminal() {
        let rx = walk(
            Path::new("/nonexistent/root"),
            WalkOptions::default(),
            CancellationToken::new(),
        )
        .unwrap();
        let items = rx.into_iter().collect::<Vec<_>>();
        assert_eq!(items.len(), 1);
        assert!(items[0].is_err());
    }

    #[test]
    fn test_walk_cancelled() -> Result<()> {
        let td = fixture()?;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let rx = walk(td.path(), WalkOptions::default(), cancel)?;
        assert_eq!(rx.into_iter().count(), 0);
        Ok(())
    }

    #[test]
    fn test_walk_glob_syntax() -> Result<()> {
        let td = tempfile::tempdir()?;
        for name in ["a.txt", "b.txt", "*.txt", "vmlinuz-6", "vmlinuz-66"] {
            std::fs::write(td.path().join(name), "")?;
        }
        let matching = |glob: &str| {
            collect(
                td.path(),
                WalkOptions {
                    skip_root: true,
                    glob_patterns: vec![glob.into()],
                    ..Default::default()
                },
            )
        };
        assert_eq!(matching("[!a]*.txt"), ["*.txt", "b.txt"]);
        assert_eq!(matching("[*].txt"), ["*.txt"]);
        assert_eq!(matching("vmlinuz-?"), ["vmlinuz-6"]);
        assert_eq!(matching("**"), ["*.txt", "a.txt", "b.txt", "vmlinuz-6", "vmlinuz-66"]);

        let e = walk(
            td.path(),
            WalkOptions {
                glob_patterns: vec!["[unclosed".into()],
                ..Default::default()
            },
            CancellationToken::new(),
        )
        .unwrap_err();
        assert!(format!("{e:#}").contains("Invalid glob"), "{e:#}");
        Ok(())
    }
}
