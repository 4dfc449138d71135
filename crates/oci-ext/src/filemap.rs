//! Deterministic tar layers from a `(source path -> image path, mode)` map.
//!
//! Entries are always emitted in lexicographic order of their image path
//! with a caller supplied modification time and root ownership, so the
//! same map produces byte-identical output no matter the input order or
//! the state of the source files' timestamps. Headers are ustar; a name
//! that does not fit one is carried in a PAX `path` record.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use fn_error_context::context;
use sha2::{Digest, Sha256};

use crate::archiver::{append_sized, set_pax_path};
use crate::Result;

/// A single file placed into a layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileItem {
    /// Where to read the content from on the host.
    pub source_path: PathBuf,
    /// Path inside the image, relative and `/`-separated.
    pub image_path: String,
    /// Permission bits recorded in the header.
    pub mode: u32,
}

impl FileItem {
    /// Convenience constructor.
    pub fn new(source_path: impl Into<PathBuf>, image_path: impl Into<String>, mode: u32) -> Self {
        Self {
            source_path: source_path.into(),
            image_path: image_path.into(),
            mode,
        }
    }
}

/// A gzip-compressed layer blob written to disk.
#[derive(Debug, Clone)]
pub struct Layer {
    /// The compressed blob.
    pub path: PathBuf,
    /// `sha256:<hex>` of the compressed blob.
    pub digest: String,
    /// Size of the compressed blob in bytes.
    pub size: u64,
    /// `sha256:<hex>` of the uncompressed tar stream.
    pub diff_id: String,
}

/// A writer which hashes and counts everything passing through it.
#[derive(Debug)]
pub(crate) struct HashWriter<W> {
    inner: W,
    hasher: Sha256,
    count: u64,
}

impl<W: Write> HashWriter<W> {
    pub(crate) fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            count: 0,
        }
    }

    /// Returns the inner writer, the digest and the number of bytes written.
    pub(crate) fn finish(self) -> (W, String, u64) {
        (self.inner, crate::sha256_digest(self.hasher), self.count)
    }
}

impl<W: Write> Write for HashWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Write a tar stream for the items to `w` and return the writer.
///
/// The input order does not matter; entries are sorted by image path.
#[context("Building tar stream")]
pub fn build<W: Write>(items: &[FileItem], mtime: u64, w: W) -> Result<W> {
    let mut sorted = items.iter().collect::<Vec<_>>();
    sorted.sort_by(|a, b| a.image_path.cmp(&b.image_path));

    let mut builder = tar::Builder::new(w);
    for item in sorted {
        append_item(&mut builder, item, mtime)
            .with_context(|| format!("Adding {}", item.image_path))?;
    }
    builder.into_inner().map_err(Into::into)
}

fn append_item<W: Write>(builder: &mut tar::Builder<W>, item: &FileItem, mtime: u64) -> Result<()> {
    let meta = std::fs::metadata(&item.source_path)
        .with_context(|| format!("Reading metadata of {:?}", item.source_path))?;
    let mut h = tar::Header::new_ustar();
    h.set_mode(item.mode);
    h.set_mtime(mtime);
    h.set_uid(0);
    h.set_gid(0);
    let name = if meta.is_dir() {
        h.set_entry_type(tar::EntryType::Directory);
        format!("{}/", item.image_path.trim_end_matches('/'))
    } else {
        h.set_entry_type(tar::EntryType::Regular);
        item.image_path.clone()
    };
    h.set_path(&name)
        .or_else(|_| set_pax_path(builder, &mut h, &name))?;
    if meta.is_dir() {
        h.set_size(0);
        h.set_cksum();
        builder.append(&h, std::io::empty())?;
    } else {
        let f = File::open(&item.source_path)
            .with_context(|| format!("Opening {:?}", item.source_path))?;
        append_sized(builder, &mut h, f, meta.len(), &name)?;
    }
    Ok(())
}

/// Build a gzip-compressed layer blob for the items at `dest`.
#[context("Building layer {dest:?}")]
pub fn layer(items: &[FileItem], mtime: u64, dest: &Path) -> Result<Layer> {
    let f = BufWriter::new(File::create(dest)?);
    let compressed = HashWriter::new(f);
    let gz = flate2::write::GzEncoder::new(compressed, flate2::Compression::default());
    let uncompressed = HashWriter::new(gz);
    let uncompressed = build(items, mtime, uncompressed)?;
    let (gz, diff_id, _) = uncompressed.finish();
    let compressed = gz.finish()?;
    let (f, digest, size) = compressed.finish();
    f.into_inner()
        .map_err(|e| e.into_error())?
        .sync_all()?;
    tracing::debug!("Built layer {digest} ({size} bytes), diff_id {diff_id}");
    Ok(Layer {
        path: dest.to_owned(),
        digest,
        size,
        diff_id,
    })
}

/// Expand `source` into file items placed under `image_prefix`.
///
/// A regular file maps directly to `image_prefix`. A directory maps every
/// directory and regular file below it, keeping their permission bits.
#[context("Walking {source:?}")]
pub fn walk(source: &Path, image_prefix: &str) -> Result<Vec<FileItem>> {
    use std::os::unix::fs::PermissionsExt;

    let prefix = image_prefix.trim_matches('/');
    let mut r = Vec::new();
    for entry in walkdir::WalkDir::new(source).follow_links(false) {
        let entry = entry?;
        let ft = entry.file_type();
        if !(ft.is_dir() || ft.is_file()) {
            continue;
        }
        let rel = entry.path().strip_prefix(source)?;
        let rel = rel
            .to_str()
            .with_context(|| format!("Non UTF-8 path {:?}", entry.path()))?;
        let image_path = match (prefix.is_empty(), rel.is_empty()) {
            (_, true) if ft.is_dir() => continue,
            (_, true) => prefix.to_owned(),
            (true, false) => rel.to_owned(),
            (false, false) => format!("{prefix}/{rel}"),
        };
        let mode = entry.metadata()?.permissions().mode() & 0o7777;
        r.push(FileItem::new(entry.path(), image_path, mode));
    }
    Ok(r)
}
