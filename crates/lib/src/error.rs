//! Error taxonomy for the imager.
//!
//! Internally everything is an [`anyhow::Error`]. On the way out of a
//! stage the orchestrator attaches an [`ImagerError`] (and the [`Stage`])
//! as context, so callers can `downcast_ref` either one.

use camino::Utf8PathBuf;

use imager_oci_ext::registry::RegistryError;
use imager_utils::{Cancelled, CommandError};

use crate::profile::OutputKind;

/// A profile violated one of its invariants.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub(crate) fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// The classified imager failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImagerError {
    /// The profile is invalid.
    #[error("invalid profile: {0}")]
    Validation(#[from] ValidationError),
    /// A required input file does not exist.
    #[error("input not found: {0}")]
    InputNotFound(Utf8PathBuf),
    /// Pulling from a registry failed.
    #[error("registry failure")]
    Registry(RegistryError),
    /// An external tool exited unsuccessfully; carries its message verbatim.
    #[error("external tool failed")]
    ExternalTool(String),
    /// Local I/O failed.
    #[error("filesystem failure")]
    Filesystem(String),
    /// The build was cancelled.
    #[error("cancelled")]
    Cancelled,
}

/// The pipeline stage an error occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Pulling the overlay and querying its installer.
    PrepareOverlay,
    /// Rebuilding the initramfs with system extensions.
    RebuildInitramfs,
    /// Assembling the kernel command line.
    BuildCmdline,
    /// Assembling and signing the UKI.
    BuildUki,
    /// Producing the requested output kind.
    Emit(OutputKind),
    /// Compressing or archiving the output.
    PostProcess,
    /// Copying the artifact into the output directory.
    WriteOutput,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::PrepareOverlay => f.write_str("prepare overlay"),
            Stage::RebuildInitramfs => f.write_str("rebuild initramfs"),
            Stage::BuildCmdline => f.write_str("build cmdline"),
            Stage::BuildUki => f.write_str("build UKI"),
            Stage::Emit(kind) => write!(f, "emit {kind}"),
            Stage::PostProcess => f.write_str("post-process"),
            Stage::WriteOutput => f.write_str("write output"),
        }
    }
}

/// Find the most specific classification for `e`.
fn classify_chain(e: &anyhow::Error) -> Option<ImagerError> {
    // Cancellation wins: a killed child also looks like a failed command.
    if e.chain().any(|c| c.is::<Cancelled>()) {
        return Some(ImagerError::Cancelled);
    }
    e.chain().find_map(|c| {
        if let Some(r) = c.downcast_ref::<RegistryError>() {
            Some(ImagerError::Registry(r.clone()))
        } else if let Some(c) = c.downcast_ref::<CommandError>() {
            Some(ImagerError::ExternalTool(c.to_string()))
        } else {
            c.downcast_ref::<std::io::Error>()
                .map(|io| ImagerError::Filesystem(io.to_string()))
        }
    })
}

/// Attach an [`ImagerError`] classification (unless one is already
/// present) and the stage tag to `e`.
pub(crate) fn in_stage(e: anyhow::Error, stage: Stage) -> anyhow::Error {
    let e = if e.downcast_ref::<ImagerError>().is_some() {
        e
    } else {
        match classify_chain(&e) {
            Some(class) => e.context(class),
            None => e,
        }
    };
    e.context(stage)
}

/// A fresh cancellation error observed at a stage boundary.
pub(crate) fn cancelled(stage: Stage) -> anyhow::Error {
    anyhow::Error::new(ImagerError::Cancelled).context(stage)
}
