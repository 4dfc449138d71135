//! Post-processors applied to a finished artifact.
//!
//! Each one writes a new file next to its input, removes the input on
//! success and returns the path of the new file.

use std::ffi::OsString;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use fn_error_context::context;

use crate::Result;

/// The gzip level used for `.gz` outputs.
pub const GZIP_LEVEL: u32 = 6;

/// The xz preset used for `.xz` outputs.
pub const XZ_PRESET: u32 = 0;

/// Name the raw disk gets inside a `.tar.gz` artifact.
pub const TAR_DISK_NAME: &str = "disk.raw";

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = OsString::from(path.as_os_str());
    s.push(suffix);
    PathBuf::from(s)
}

/// Encode `src` into `dest` with `encode`, then remove `src`.
fn replace_with<F>(src: &Path, dest: &Path, encode: F) -> Result<()>
where
    F: FnOnce(BufReader<File>, BufWriter<File>) -> Result<BufWriter<File>>,
{
    let input = BufReader::new(File::open(src).with_context(|| format!("Opening {src:?}"))?);
    let out = BufWriter::new(File::create(dest).with_context(|| format!("Creating {dest:?}"))?);
    let mut out = encode(input, out)?;
    out.flush()?;
    std::fs::remove_file(src).with_context(|| format!("Removing {src:?}"))?;
    Ok(())
}

/// Compress with gzip into `<path>.gz`.
#[context("Compressing {path:?} with gzip")]
pub fn gzip(path: &Path) -> Result<PathBuf> {
    let dest = with_suffix(path, ".gz");
    replace_with(path, &dest, |mut r, w| {
        let mut enc = flate2::write::GzEncoder::new(w, flate2::Compression::new(GZIP_LEVEL));
        std::io::copy(&mut r, &mut enc)?;
        Ok(enc.finish()?)
    })?;
    Ok(dest)
}

/// Compress with multithreaded xz into `<path>.xz`.
#[context("Compressing {path:?} with xz")]
pub fn xz(path: &Path) -> Result<PathBuf> {
    let dest = with_suffix(path, ".xz");
    let threads = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1);
    replace_with(path, &dest, |mut r, w| {
        let stream = xz2::stream::MtStreamBuilder::new()
            .preset(XZ_PRESET)
            .threads(threads)
            .check(xz2::stream::Check::Crc64)
            .encoder()?;
        let mut enc = xz2::write::XzEncoder::new_stream(w, stream);
        std::io::copy(&mut r, &mut enc)?;
        Ok(enc.finish()?)
    })?;
    Ok(dest)
}

/// Compress with zstd into `<path>.zst`.
#[context("Compressing {path:?} with zstd")]
pub fn zstd(path: &Path) -> Result<PathBuf> {
    let dest = with_suffix(path, ".zst");
    replace_with(path, &dest, |mut r, w| {
        let mut enc = zstd::stream::write::Encoder::new(w, zstd::DEFAULT_COMPRESSION_LEVEL)?;
        std::io::copy(&mut r, &mut enc)?;
        Ok(enc.finish()?)
    })?;
    Ok(dest)
}

/// Rename `path` to `disk.raw` in the same directory and pack it into
/// `<path>.tar.gz`.
#[context("Packing {path:?} into a tar.gz")]
pub fn tar_gz(path: &Path) -> Result<PathBuf> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let disk = dir.join(TAR_DISK_NAME);
    std::fs::rename(path, &disk).with_context(|| format!("Renaming to {disk:?}"))?;
    let dest = with_suffix(path, ".tar.gz");
    let out = BufWriter::new(File::create(&dest)?);
    let gz = flate2::write::GzEncoder::new(out, flate2::Compression::new(GZIP_LEVEL));
    let mut builder = tar::Builder::new(gz);
    builder.mode(tar::HeaderMode::Deterministic);
    builder.append_path_with_name(&disk, TAR_DISK_NAME)?;
    builder.into_inner()?.finish()?.flush()?;
    std::fs::remove_file(&disk).with_context(|| format!("Removing {disk:?}"))?;
    Ok(dest)
}
