//! Walk directory trees and pack or unpack them as tar streams.

use std::io::Write;
use std::path::Path;

use fn_error_context::context;
use tokio_util::sync::CancellationToken;

use crate::Result;

mod tarball;
mod walk;

pub use tarball::*;
pub(crate) use tarball::{append_sized, set_pax_path};
pub use walk::*;

/// Write the tree below `root` (not including `root` itself) as a tar
/// stream to `w`.
#[context("Archiving {root:?}")]
pub fn tar_dir<W: Write>(root: &Path, w: W, cancel: &CancellationToken) -> Result<W> {
    let items = walk(
        root,
        WalkOptions {
            skip_root: true,
            ..Default::default()
        },
        cancel.clone(),
    )?;
    let w = write_tar(items, w)?;
    // The walker stops silently on cancellation; don't hand back a
    // truncated archive as if it were complete.
    crate::check_cancelled(cancel)?;
    Ok(w)
}

/// Like [`tar_dir`], gzip-compressed.
pub fn tar_gz_dir<W: Write>(root: &Path, w: W, cancel: &CancellationToken) -> Result<W> {
    let gz = flate2::write::GzEncoder::new(w, flate2::Compression::default());
    let gz = tar_dir(root, gz, cancel)?;
    Ok(gz.finish()?)
}
