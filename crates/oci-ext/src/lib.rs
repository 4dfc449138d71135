//! # OCI and tar helpers for the imager
//!
//! This crate holds the pieces of the imager that deal with bytes on the
//! way into and out of container images: deterministic tar layers built
//! from file maps, directory walking and (un)tarring, compression
//! post-processors, pulling images through a registry client, and
//! writing OCI archive tarballs.

// Re-export our dependencies.  Users will need e.g. `oci_spec::image::Descriptor`,
// so this avoids them needing to update matching versions.
pub use containers_image_proxy;
pub use containers_image_proxy::oci_spec;

/// Our generic catchall fatal error, expected to be converted
/// to a string to output to a terminal or logs.
type Result<T> = anyhow::Result<T>;

pub mod archiver;
pub mod compress;
pub mod filemap;
#[cfg(any(test, feature = "internal-testing-api"))]
pub mod fixture;
pub(crate) mod generic_decompress;
pub mod oci_archive;
pub mod registry;

pub use imager_utils::Cancelled;

/// Fail with [`Cancelled`] if the token has fired.
pub fn check_cancelled(cancel: &tokio_util::sync::CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Cancelled.into());
    }
    Ok(())
}

/// Format a SHA-256 hasher's output as an OCI digest string.
pub(crate) fn sha256_digest(hasher: sha2::Sha256) -> String {
    use sha2::Digest;
    format!("sha256:{}", hex::encode(hasher.finalize()))
}
