//! Writing walked trees as tar streams, and unpacking tar streams.

use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::mpsc::Receiver;

use anyhow::Context;
use fn_error_context::context;

use super::WalkItem;
use crate::Result;

const WHITEOUT_PREFIX: &str = ".wh.";
const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";

/// Feeds exactly `remaining` bytes: short reads are zero-padded and
/// anything past `remaining` is ignored.
struct SizedReader<R> {
    inner: R,
    remaining: u64,
    short: bool,
}

impl<R: Read> Read for SizedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let max = buf.len().min(self.remaining.try_into().unwrap_or(usize::MAX));
        let n = if self.short {
            0
        } else {
            self.inner.read(&mut buf[..max])?
        };
        let n = if n == 0 {
            self.short = true;
            buf[..max].fill(0);
            max
        } else {
            n
        };
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Record `name` in a PAX `path` record for an entry whose name does not fit
/// a ustar header, leaving a truncated placeholder in the header itself.
pub(crate) fn set_pax_path<W: Write>(
    builder: &mut tar::Builder<W>,
    h: &mut tar::Header,
    name: &str,
) -> Result<()> {
    builder.append_pax_extensions([("path", name.as_bytes())])?;
    let mut end = name.len().min(99);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    h.set_path(&name[..end])?;
    Ok(())
}

/// Append `f` under `h`, whose path is already set, as exactly `size`
/// bytes. A file that grew meanwhile is truncated with a warning; one that
/// shrank is an error.
pub(crate) fn append_sized<W: Write>(
    builder: &mut tar::Builder<W>,
    h: &mut tar::Header,
    f: File,
    size: u64,
    name: &str,
) -> Result<()> {
    h.set_size(size);
    h.set_cksum();
    let mut r = SizedReader {
        inner: f,
        remaining: size,
        short: false,
    };
    builder.append(h, &mut r)?;
    anyhow::ensure!(!r.short, "{name}: file shrank below {size} bytes while archiving");
    let mut probe = [0u8; 1];
    if r.inner.read(&mut probe)? > 0 {
        tracing::warn!("{name}: file grew while archiving, truncated to {size} bytes");
    }
    Ok(())
}

/// Write every walked item into a tar stream on `w`, returning the writer.
///
/// A walk error ends the stream. Failures on individual files do not
/// abort it; they are collected and returned together once the archive
/// is complete.
pub fn write_tar<W: Write>(items: Receiver<Result<WalkItem>>, w: W) -> Result<W> {
    let mut builder = tar::Builder::new(w);
    let mut errors = Vec::new();
    let mut walk_err = None;
    for item in items {
        let item = match item {
            Ok(item) => item,
            Err(e) => {
                walk_err = Some(e);
                break;
            }
        };
        if let Err(e) = append_item(&mut builder, &item) {
            errors.push(format!("{}: {e:#}", item.full_path.display()));
        }
    }
    let w = builder.into_inner()?;
    if let Some(e) = walk_err {
        return Err(e.context("Walking tree"));
    }
    if !errors.is_empty() {
        anyhow::bail!(
            "Failed to archive {} files: {}",
            errors.len(),
            errors.join("; ")
        );
    }
    Ok(w)
}

fn append_item<W: Write>(builder: &mut tar::Builder<W>, item: &WalkItem) -> Result<()> {
    let mut h = tar::Header::new_ustar();
    h.set_metadata_in_mode(&item.metadata, tar::HeaderMode::Complete);
    let ft = item.metadata.file_type();
    let name = item.rel_path.to_str().context("Non UTF-8 path")?;
    if ft.is_dir() {
        h.set_size(0);
        builder.append_data(&mut h, format!("{}/", name.trim_end_matches('/')), std::io::empty())?;
    } else if let Some(target) = item.link_target.as_deref() {
        h.set_entry_type(tar::EntryType::Symlink);
        h.set_size(0);
        builder.append_link(&mut h, name, target)?;
    } else if !ft.is_file() || item.metadata.len() == 0 {
        h.set_size(0);
        builder.append_data(&mut h, name, std::io::empty())?;
    } else {
        // Open first so an unreadable file is skipped rather than leaving
        // a header without a body.
        let f = File::open(&item.full_path)?;
        h.set_path(name)
            .or_else(|_| set_pax_path(builder, &mut h, name))?;
        append_sized(builder, &mut h, f, item.metadata.len(), name)?;
    }
    Ok(())
}

/// Options for [`untar`].
#[derive(Debug, Clone, Copy, Default)]
pub struct UntarOptions {
    /// Treat the stream as a container image layer: apply OCI whiteouts and
    /// replace files left by earlier layers.
    pub layer: bool,
    /// Restore `SCHILY.xattr.*` PAX records as extended attributes.
    pub xattrs: bool,
}

/// PAX record prefix carrying an extended attribute.
const PAX_XATTR_PREFIX: &str = "SCHILY.xattr.";

/// The entry name relative to the destination. Leading `/` and `.` are
/// dropped, any `..` is refused.
fn entry_rel_path(name: &Path) -> Result<PathBuf> {
    let mut rel = PathBuf::new();
    for c in name.components() {
        match c {
            Component::Normal(c) => rel.push(c),
            Component::ParentDir => anyhow::bail!("Entry {name:?} escapes the destination"),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    Ok(rel)
}

/// Resolve `rel` below the canonical destination `root`, following links in
/// its parent directories. `None` if the parent does not exist.
fn resolve_below(root: &Path, rel: &Path) -> Result<Option<PathBuf>> {
    let Some(file_name) = rel.file_name() else {
        return Ok(None);
    };
    let parent = root.join(rel.parent().unwrap_or(Path::new("")));
    let parent = match parent.canonicalize() {
        Ok(p) => p,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    anyhow::ensure!(
        parent.starts_with(root),
        "Entry {rel:?} resolves outside of the destination"
    );
    Ok(Some(parent.join(file_name)))
}

fn remove_existing(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(m) if m.is_dir() => std::fs::remove_dir_all(path)?,
        Ok(_) => std::fs::remove_file(path)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Handle `rel` if it is a whiteout marker, returning whether it was one.
fn apply_whiteout(root: &Path, rel: &Path) -> Result<bool> {
    let Some(file_name) = rel.file_name().and_then(|n| n.to_str()) else {
        return Ok(false);
    };
    if file_name == WHITEOUT_OPAQUE {
        let dir = resolve_below(root, rel)?;
        if let Some(dir) = dir.as_deref().and_then(Path::parent) {
            for child in std::fs::read_dir(dir)? {
                remove_existing(&child?.path())?;
            }
        }
        return Ok(true);
    }
    if let Some(target) = file_name.strip_prefix(WHITEOUT_PREFIX) {
        if let Some(target) = resolve_below(root, &rel.with_file_name(target))? {
            remove_existing(&target)?;
        }
        return Ok(true);
    }
    Ok(false)
}

fn pax_xattrs<R: Read>(entry: &mut tar::Entry<'_, R>) -> Result<Vec<(String, Vec<u8>)>> {
    let Some(exts) = entry.pax_extensions()? else {
        return Ok(Vec::new());
    };
    let mut xattrs = Vec::new();
    for ext in exts {
        let ext = ext?;
        if let Some(name) = ext.key()?.strip_prefix(PAX_XATTR_PREFIX) {
            xattrs.push((name.to_owned(), ext.value_bytes().to_vec()));
        }
    }
    Ok(xattrs)
}

/// Set `xattrs` on `path`. A host that refuses the namespace (no privileges,
/// no filesystem support) only gets a warning.
fn set_xattrs(path: &Path, xattrs: &[(String, Vec<u8>)]) -> Result<()> {
    use rustix::io::Errno;
    for (name, value) in xattrs {
        match rustix::fs::lsetxattr(path, name.as_str(), value, rustix::fs::XattrFlags::empty()) {
            Ok(()) => {}
            Err(e) if e == Errno::PERM || e == Errno::ACCESS || e == Errno::NOTSUP => {
                tracing::warn!("Not setting {name} on {path:?}: {e}");
            }
            Err(e) => {
                return Err(anyhow::Error::from(e).context(format!("Setting {name} on {path:?}")))
            }
        }
    }
    Ok(())
}

/// Unpack a tar stream into `dest`.
///
/// Entries go through [`tar::Entry::unpack_in`], so nothing is written
/// through a symlink that leads outside of `dest`. Modes are kept as
/// archived, except that directories get at least `0o700`. Outside of
/// layer mode an entry never replaces an existing file.
#[context("Unpacking into {dest:?}")]
pub fn untar<R: Read>(r: R, dest: &Path, opts: UntarOptions) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    let root = dest.canonicalize()?;
    let mut archive = tar::Archive::new(r);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(opts.layer);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.into_owned();
        let rel = entry_rel_path(&name)?;
        let etype = entry.header().entry_type();
        if rel.as_os_str().is_empty() {
            if etype.is_dir() {
                continue;
            }
            anyhow::bail!("Entry {name:?} has no file name");
        }
        if opts.layer && apply_whiteout(&root, &rel)? {
            continue;
        }
        if matches!(
            etype,
            tar::EntryType::Char | tar::EntryType::Block | tar::EntryType::Fifo
        ) {
            tracing::debug!("Skipping {name:?} of type {etype:?}");
            continue;
        }
        let existing = resolve_below(&root, &rel)?
            .and_then(|p| std::fs::symlink_metadata(&p).ok().map(|m| (p, m)));
        if let Some((path, meta)) = existing {
            if etype.is_dir() && !meta.is_dir() {
                anyhow::ensure!(opts.layer, "Directory {name:?} would replace a non-directory");
                remove_existing(&path)?;
            } else if opts.layer && !etype.is_dir() {
                remove_existing(&path)?;
            }
        }
        let xattrs = if opts.xattrs {
            pax_xattrs(&mut entry)?
        } else {
            Vec::new()
        };
        let unpacked = entry
            .unpack_in(&root)
            .with_context(|| format!("Unpacking {name:?}"))?;
        anyhow::ensure!(unpacked, "Entry {name:?} escapes the destination");
        let path = root.join(&rel);
        if etype.is_dir() {
            let mode = entry.header().mode()? & 0o7777;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode | 0o700))?;
        }
        set_xattrs(&path, &xattrs)?;
    }
    Ok(())
}

/// Unpack a gzip-compressed tar stream into `dest`.
pub fn untar_gz<R: Read>(r: R, dest: &Path) -> Result<()> {
    untar(flate2::read::GzDecoder::new(r), dest, UntarOptions::default())
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::super::{walk, WalkOptions};
    use super::*;

    fn tar_of(entries: &[(&str, tar::EntryType, &str, u32)]) -> Vec<u8> {
        let mut b = tar::Builder::new(Vec::new());
        for (name, ty, body, mode) in entries {
            let mut h = tar::Header::new_gnu();
            h.set_entry_type(*ty);
            h.set_size(body.len() as u64);
            h.set_mode(*mode);
            // Bypass set_path() validation to exercise hostile names
            let raw = &mut h.as_old_mut().name;
            raw[..name.len()].copy_from_slice(name.as_bytes());
            h.set_cksum();
            b.append(&h, body.as_bytes()).unwrap();
        }
        b.into_inner().unwrap()
    }

    #[test]
    fn test_untar_rejects_escapes() {
        let td = tempfile::tempdir().unwrap();
        for name in ["../evil", "a/../../evil", "./../evil"] {
            let t = tar_of(&[(name, tar::EntryType::Regular, "x", 0o644)]);
            let e = untar(t.as_slice(), td.path(), UntarOptions::default()).unwrap_err();
            assert!(format!("{e:#}").contains("escapes"), "{name}: {e:#}");
        }
        assert!(!td.path().parent().unwrap().join("evil").exists());
    }

    /// `a` links to `target`, followed by `entries` below `a/`.
    fn through_link(target: &Path, entries: &[&str]) -> Vec<u8> {
        let mut b = tar::Builder::new(Vec::new());
        let mut h = tar::Header::new_ustar();
        h.set_entry_type(tar::EntryType::Symlink);
        h.set_mode(0o777);
        h.set_size(0);
        b.append_link(&mut h, "a", target).unwrap();
        for name in entries {
            let mut h = tar::Header::new_ustar();
            h.set_entry_type(tar::EntryType::Regular);
            h.set_mode(0o644);
            h.set_size(1);
            b.append_data(&mut h, name, &b"x"[..]).unwrap();
        }
        b.into_inner().unwrap()
    }

    #[test]
    fn test_untar_refuses_symlink_traversal() -> Result<()> {
        let outside = tempfile::tempdir()?;
        std::fs::write(outside.path().join("keep"), "keep")?;
        std::fs::create_dir(outside.path().join("sub"))?;
        std::fs::write(outside.path().join("sub/keep"), "keep")?;

        for (layer, entries) in [
            (false, ["a/pwned"].as_slice()),
            (true, ["a/pwned"].as_slice()),
            (true, ["a/.wh.keep"].as_slice()),
            (true, ["a/sub/.wh..wh..opq"].as_slice()),
            (true, ["a/keep"].as_slice()),
        ] {
            let dest = tempfile::tempdir()?;
            let t = through_link(outside.path(), entries);
            let opts = UntarOptions {
                layer,
                ..Default::default()
            };
            let r = untar(t.as_slice(), dest.path(), opts);
            assert!(r.is_err(), "{entries:?} layer={layer}");
            assert!(!outside.path().join("pwned").exists(), "{entries:?}");
            assert_eq!(std::fs::read(outside.path().join("keep"))?, b"keep");
            assert!(outside.path().join("sub/keep").exists(), "{entries:?}");
            // The link itself is kept as data.
            assert_eq!(std::fs::read_link(dest.path().join("a"))?, outside.path());
        }
        Ok(())
    }

    #[test]
    fn test_untar_xattrs() -> Result<()> {
        let td = tempfile::tempdir()?;
        let canary = td.path().join("canary");
        std::fs::write(&canary, "")?;
        let flags = rustix::fs::XattrFlags::empty();
        if rustix::fs::lsetxattr(&canary, "user.imager", b"1", flags).is_err() {
            eprintln!("no user xattr support, skipping");
            return Ok(());
        }

        let mut b = tar::Builder::new(Vec::new());
        b.append_pax_extensions([("SCHILY.xattr.user.imager", &b"state"[..])])?;
        let mut h = tar::Header::new_ustar();
        h.set_mode(0o644);
        h.set_size(6);
        b.append_data(&mut h, "etc/config", &b"config"[..])?;
        let t = b.into_inner()?;

        let get = |p: &Path| {
            let mut buf = [0u8; 16];
            rustix::fs::lgetxattr(p, "user.imager", &mut buf[..]).map(|n| buf[..n].to_vec())
        };
        let with = td.path().join("with");
        let opts = UntarOptions {
            xattrs: true,
            ..Default::default()
        };
        untar(t.as_slice(), &with, opts)?;
        assert_eq!(get(&with.join("etc/config"))?, b"state");

        let without = td.path().join("without");
        untar(t.as_slice(), &without, UntarOptions::default())?;
        assert_eq!(std::fs::read(without.join("etc/config"))?, b"config");
        assert!(get(&without.join("etc/config")).is_err());
        Ok(())
    }

    #[test]
    fn test_untar_skips_devices() -> Result<()> {
        let td = tempfile::tempdir()?;
        let t = tar_of(&[
            ("dev/null", tar::EntryType::Char, "", 0o666),
            ("run/fifo", tar::EntryType::Fifo, "", 0o600),
            ("etc/hostname", tar::EntryType::Regular, "node", 0o644),
        ]);
        untar(t.as_slice(), td.path(), UntarOptions::default())?;
        assert!(!td.path().join("dev/null").exists());
        assert!(!td.path().join("run/fifo").exists());
        assert_eq!(std::fs::read(td.path().join("etc/hostname"))?, b"node");
        Ok(())
    }

    #[test]
    fn test_untar_modes() -> Result<()> {
        let td = tempfile::tempdir()?;
        let t = tar_of(&[
            ("d/", tar::EntryType::Directory, "", 0o500),
            ("d/secret", tar::EntryType::Regular, "s3cr3t", 0o000),
            ("/abs/file", tar::EntryType::Regular, "abs", 0o640),
        ]);
        untar(t.as_slice(), td.path(), UntarOptions::default())?;
        let mode = |p: &str| {
            std::fs::symlink_metadata(td.path().join(p))
                .unwrap()
                .permissions()
                .mode()
                & 0o7777
        };
        assert_eq!(mode("d"), 0o700);
        assert_eq!(mode("d/secret"), 0o000);
        assert_eq!(mode("abs/file"), 0o640);
        assert_eq!(std::fs::read(td.path().join("abs/file"))?, b"abs");

        // Files are created exclusively outside of layer mode
        let t = tar_of(&[("abs/file", tar::EntryType::Regular, "again", 0o644)]);
        assert!(untar(t.as_slice(), td.path(), UntarOptions::default()).is_err());
        Ok(())
    }

    #[test]
    fn test_untar_layer_whiteouts() -> Result<()> {
        let td = tempfile::tempdir()?;
        let base = tar_of(&[
            ("usr/", tar::EntryType::Directory, "", 0o755),
            ("usr/a", tar::EntryType::Regular, "a", 0o644),
            ("usr/b", tar::EntryType::Regular, "b", 0o644),
            ("opt/", tar::EntryType::Directory, "", 0o755),
            ("opt/c", tar::EntryType::Regular, "c", 0o644),
        ]);
        let upper = tar_of(&[
            ("usr/.wh.a", tar::EntryType::Regular, "", 0o644),
            ("usr/b", tar::EntryType::Regular, "b2", 0o644),
            ("opt/.wh..wh..opq", tar::EntryType::Regular, "", 0o644),
            ("opt/d", tar::EntryType::Regular, "d", 0o644),
        ]);
        let opts = UntarOptions {
            layer: true,
            ..Default::default()
        };
        untar(base.as_slice(), td.path(), opts)?;
        untar(upper.as_slice(), td.path(), opts)?;
        let p = td.path();
        assert!(!p.join("usr/a").exists());
        assert_eq!(std::fs::read(p.join("usr/b"))?, b"b2");
        assert!(!p.join("opt/c").exists());
        assert_eq!(std::fs::read(p.join("opt/d"))?, b"d");
        assert!(!p.join("usr/.wh.a").exists());
        Ok(())
    }

    #[test]
    fn test_roundtrip() -> Result<()> {
        let src = tempfile::tempdir()?;
        let s = src.path();
        std::fs::create_dir_all(s.join("etc/talos"))?;
        std::fs::set_permissions(s.join("etc/talos"), std::fs::Permissions::from_mode(0o750))?;
        std::fs::write(s.join("etc/talos/config.yaml"), "machine: {}\n")?;
        std::fs::set_permissions(
            s.join("etc/talos/config.yaml"),
            std::fs::Permissions::from_mode(0o600),
        )?;
        std::fs::write(s.join("empty"), "")?;
        std::os::unix::fs::symlink("etc/talos/config.yaml", s.join("config"))?;

        let items = walk(
            s,
            WalkOptions {
                skip_root: true,
                ..Default::default()
            },
            CancellationToken::new(),
        )?;
        let buf = write_tar(items, Vec::new())?;

        let dest = tempfile::tempdir()?;
        let d = dest.path().join("out");
        untar(buf.as_slice(), &d, UntarOptions::default())?;

        assert_eq!(
            std::fs::read_to_string(d.join("etc/talos/config.yaml"))?,
            "machine: {}\n"
        );
        let mode = |p: &Path| std::fs::symlink_metadata(p).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode(&d.join("etc/talos/config.yaml")), 0o600);
        assert_eq!(mode(&d.join("etc/talos")), 0o750);
        assert_eq!(std::fs::read(d.join("empty"))?.len(), 0);
        assert_eq!(
            std::fs::read_link(d.join("config"))?,
            Path::new("etc/talos/config.yaml")
        );
        Ok(())
    }

    #[test]
    fn test_write_tar_walk_error() {
        let items = walk(
            Path::new("/nonexistent/tree"),
            WalkOptions::default(),
            CancellationToken::new(),
        )
        .unwrap();
        assert!(write_tar(items, Vec::new()).is_err());
    }

    #[test]
    fn test_append_sized() -> Result<()> {
        let td = tempfile::tempdir()?;
        let p = td.path().join("f");
        std::fs::write(&p, "abcdef")?;

        let mut b = tar::Builder::new(Vec::new());
        let mut h = tar::Header::new_ustar();
        h.set_path("f")?;
        h.set_mode(0o644);
        append_sized(&mut b, &mut h, File::open(&p)?, 4, "f")?;
        let buf = b.into_inner()?;
        let mut a = tar::Archive::new(buf.as_slice());
        let mut e = a.entries()?.next().unwrap()?;
        let mut body = Vec::new();
        e.read_to_end(&mut body)?;
        assert_eq!(body, b"abcd");

        let mut b = tar::Builder::new(Vec::new());
        let e = append_sized(&mut b, &mut h, File::open(&p)?, 10, "f").unwrap_err();
        assert!(e.to_string().contains("shrank"), "{e}");
        Ok(())
    }

    #[test]
    fn test_sized_reader() {
        let mut out = Vec::new();
        let mut r = SizedReader {
            inner: &b"abcdef"[..],
            remaining: 4,
            short: false,
        };
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abcd");
        assert!(!r.short);

        let mut out = Vec::new();
        let mut r = SizedReader {
            inner: &b"ab"[..],
            remaining: 4,
            short: false,
        };
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"ab\0\0");
        assert!(r.short);
    }
}
