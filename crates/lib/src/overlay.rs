//! Board-support overlays: pulling the overlay image and asking its
//! installer for the kernel arguments the board needs.

use std::collections::BTreeMap;
use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use imager_oci_ext::registry::{self, Registry};
use imager_utils::CommandRunExt;

use crate::constants::{OVERLAY_ARTIFACTS_PATH, OVERLAY_EXTRA_OPTIONS_PATH, OVERLAY_INSTALLERS_PATH};
use crate::profile::OverlayOptions;

/// What an overlay installer reports about itself.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct InstallerOptions {
    /// Human readable board name.
    pub name: String,
    /// Kernel arguments the board needs.
    pub kernel_args: Vec<String>,
}

/// An overlay extracted into the build's temporary directory.
#[derive(Debug, Clone)]
pub struct PreparedOverlay {
    /// Name of the selected overlay installer.
    pub name: String,
    /// The directory holding `overlay/`.
    pub root: Utf8PathBuf,
    /// Options handed to the overlay installer.
    pub extra_options: BTreeMap<String, serde_yaml::Value>,
    /// What the installer reported.
    pub installer_options: InstallerOptions,
}

impl PreparedOverlay {
    /// The selected overlay installer executable.
    pub fn installer_path(&self) -> Utf8PathBuf {
        self.root.join(OVERLAY_INSTALLERS_PATH).join(&self.name)
    }

    /// Firmware and other files the installer copies onto the disk.
    pub fn artifacts_path(&self) -> Utf8PathBuf {
        self.root.join(OVERLAY_ARTIFACTS_PATH)
    }

    /// Write the extra options as YAML where an installer image expects
    /// them, returning the path.
    #[context("Writing overlay extra options")]
    pub fn write_extra_options(&self) -> Result<Utf8PathBuf> {
        let path = self.root.join(OVERLAY_EXTRA_OPTIONS_PATH);
        std::fs::write(&path, serde_yaml::to_string(&self.extra_options)?)?;
        Ok(path)
    }
}

/// Run `installer get-options`, feeding it `extra_options` as YAML.
#[context("Querying overlay installer {installer}")]
pub fn query_options(
    installer: &Utf8Path,
    extra_options: &BTreeMap<String, serde_yaml::Value>,
) -> Result<InstallerOptions> {
    let input = serde_yaml::to_string(extra_options)?;
    let out = Command::new(installer)
        .arg("get-options")
        .log_debug()
        .run_with_stdin(input.as_bytes())?;
    serde_yaml::from_str(&out).context("Parsing installer output")
}

/// Pull the overlay image into `<root>/overlay` and query its installer.
#[instrument(level = "debug", skip_all, fields(overlay = %overlay.name))]
pub async fn prepare(
    registry: &dyn Registry,
    overlay: &OverlayOptions,
    arch: &str,
    root: &Utf8Path,
    cancel: &CancellationToken,
) -> Result<PreparedOverlay> {
    let source = overlay
        .image
        .source()
        .context("Overlay image is not set")?;
    let image = registry.pull(&source, arch).await?;
    registry::extract(registry, &image, root.join("overlay").as_std_path(), cancel).await?;

    let mut prepared = PreparedOverlay {
        name: overlay.name.clone(),
        root: root.to_owned(),
        extra_options: overlay.options.clone(),
        installer_options: InstallerOptions::default(),
    };
    let installer = prepared.installer_path();
    if !installer.is_file() {
        anyhow::bail!("Overlay {} has no installer {:?}", image.reference(), overlay.name);
    }
    let extra = prepared.extra_options.clone();
    prepared.installer_options =
        tokio::task::spawn_blocking(move || query_options(&installer, &extra)).await??;
    tracing::debug!(
        "Overlay {} kernel args: {:?}",
        prepared.installer_options.name,
        prepared.installer_options.kernel_args
    );
    Ok(prepared)
}
