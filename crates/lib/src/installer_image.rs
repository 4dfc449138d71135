//! Installer container images: the base installer plus this build's boot
//! assets, and the overlay if there is one.

use anyhow::{Context, Result};
use camino::Utf8Path;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use imager_oci_ext::filemap::{self, FileItem, Layer};
use imager_oci_ext::oci_archive;
use imager_oci_ext::registry::Registry;

use crate::constants::{
    asset_path, INITRAMFS_ASSET, KERNEL_ASSET, OVERLAY_ARTIFACTS_PATH, OVERLAY_EXTRA_OPTIONS_PATH,
    OVERLAY_INSTALLER_DEFAULT_PATH, SD_BOOT_ASSET, UKI_ASSET,
};
use crate::install::BootAssets;
use crate::overlay::PreparedOverlay;
use crate::profile::Profile;

/// Modification time of every entry in the added layers.
const LAYER_MTIME: u64 = 0;

fn asset_items(arch: &str, assets: &BootAssets) -> Vec<FileItem> {
    match (&assets.uki, &assets.sd_boot) {
        (Some(uki), Some(sd_boot)) => vec![
            FileItem::new(uki.as_std_path(), asset_path(arch, UKI_ASSET), 0o644),
            FileItem::new(sd_boot.as_std_path(), asset_path(arch, SD_BOOT_ASSET), 0o644),
        ],
        _ => vec![
            FileItem::new(assets.kernel.as_std_path(), asset_path(arch, KERNEL_ASSET), 0o644),
            FileItem::new(assets.initramfs.as_std_path(), asset_path(arch, INITRAMFS_ASSET), 0o644),
        ],
    }
}

fn overlay_items(overlay: &PreparedOverlay) -> Result<Vec<FileItem>> {
    let mut items = filemap::walk(overlay.artifacts_path().as_std_path(), OVERLAY_ARTIFACTS_PATH)?;
    items.push(FileItem::new(
        overlay.installer_path(),
        OVERLAY_INSTALLER_DEFAULT_PATH,
        0o755,
    ));
    items.push(FileItem::new(
        overlay.write_extra_options()?,
        OVERLAY_EXTRA_OPTIONS_PATH,
        0o644,
    ));
    Ok(items)
}

async fn build_layer(items: Vec<FileItem>, dest: &Utf8Path) -> Result<Layer> {
    let dest = dest.to_owned();
    tokio::task::spawn_blocking(move || filemap::layer(&items, LAYER_MTIME, dest.as_std_path())).await?
}

/// Write an OCI archive of the base installer with `assets` (and the
/// overlay) layered on top to `out_path`.
#[instrument(level = "debug", skip_all, fields(out = %out_path))]
pub async fn build(
    registry: &dyn Registry,
    profile: &Profile,
    assets: &BootAssets,
    overlay: Option<&PreparedOverlay>,
    tempdir: &Utf8Path,
    out_path: &Utf8Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let source = profile
        .input
        .base_installer
        .source()
        .context("Base installer image is not set")?;
    let base = registry.pull(&source, &profile.arch).await?;
    tracing::debug!("Base installer {} ({})", base.reference(), base.manifest_digest);

    let assets = asset_items(&profile.arch, assets);
    let mut layers = vec![build_layer(assets, &tempdir.join("layer-assets.tar.gz")).await?];
    if let Some(overlay) = overlay {
        let items = overlay_items(overlay)?;
        layers.push(build_layer(items, &tempdir.join("layer-overlay.tar.gz")).await?);
    }

    oci_archive::write(registry, &base, &layers, out_path.as_std_path(), cancel).await?;
    Ok(())
}
