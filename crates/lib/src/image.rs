//! Disk images: a sparse file, a loop device, the installer, and an
//! optional format conversion.

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use imager_blockdev::LoopbackDevice;

use crate::constants::BOARD_NONE;
use crate::install::{BootAssets, InstallOptions, Installer, Mode};
use crate::kernel_cmdline::Cmdline;
use crate::overlay::PreparedOverlay;
use crate::profile::{DiskFormat, Profile};
use crate::qemuimg::{Converter, OvaOptions};

/// A block device exposing a disk image file.
pub trait AttachedDisk: std::fmt::Debug + Send {
    /// The block device.
    fn path(&self) -> &Utf8Path;

    /// Detach the device.
    fn detach(self: Box<Self>) -> Result<()>;
}

/// Attaches disk image files as block devices.
pub trait DiskAttach: std::fmt::Debug + Send + Sync {
    /// Expose `file` as a block device.
    fn attach(&self, file: &Utf8Path) -> Result<Box<dyn AttachedDisk>>;
}

/// Loop devices via `losetup`.
#[derive(Debug, Default)]
pub struct LosetupAttach;

impl AttachedDisk for LoopbackDevice {
    fn path(&self) -> &Utf8Path {
        LoopbackDevice::path(self)
    }

    fn detach(self: Box<Self>) -> Result<()> {
        (*self).close()
    }
}

impl DiskAttach for LosetupAttach {
    fn attach(&self, file: &Utf8Path) -> Result<Box<dyn AttachedDisk>> {
        Ok(Box::new(LoopbackDevice::new(file.as_std_path())?))
    }
}

/// Everything a disk image build needs besides the profile.
#[derive(Debug)]
pub struct ImageInputs<'a> {
    /// Kernel command line.
    pub cmdline: &'a Cmdline,
    /// Kernel and initramfs, or the signed UKI and systemd-boot.
    pub boot_assets: BootAssets,
    /// A prepared overlay.
    pub overlay: Option<&'a PreparedOverlay>,
    /// The build's temporary directory.
    pub tempdir: &'a Utf8Path,
}

/// The capabilities a disk image build drives.
#[derive(Debug, Clone, Copy)]
pub struct ImageTools<'a> {
    /// Exposes the image file as a block device.
    pub attach: &'a dyn DiskAttach,
    /// Installs onto the block device.
    pub installer: &'a dyn Installer,
    /// Converts the raw image.
    pub converter: &'a dyn Converter,
}

fn install_options(profile: &Profile, inputs: &ImageInputs<'_>, disk: &Utf8Path) -> InstallOptions {
    let board = if profile.board.is_empty() {
        BOARD_NONE.to_owned()
    } else {
        profile.board.clone()
    };
    InstallOptions {
        disk: disk.to_owned(),
        platform: profile.platform.clone(),
        arch: profile.arch.clone(),
        board,
        meta_values: profile.customization.meta_contents.clone(),
        secure_boot: profile.secure_boot_enabled(),
        version: profile.version.clone(),
        boot_assets: inputs.boot_assets.clone(),
        mount_prefix: inputs.tempdir.join("image"),
        bootloader: profile
            .output
            .image_options
            .as_ref()
            .and_then(|o| o.bootloader)
            .unwrap_or_default(),
        cmdline: inputs.cmdline.clone(),
        overlay: inputs.overlay.cloned(),
    }
}

/// Build the disk image at `path`.
#[instrument(level = "debug", skip_all, fields(path = %path))]
pub async fn build(
    profile: &Profile,
    tools: ImageTools<'_>,
    inputs: &ImageInputs<'_>,
    path: &Utf8Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let image_options = profile.output.image_options.clone().unwrap_or_default();
    create(path, image_options.disk_size)?;

    let disk = tools.attach.attach(path)?;
    let opts = install_options(profile, inputs, disk.path());
    let r = tools.installer.install(&opts, Mode::Image, cancel).await;
    // Detach even if installation failed; that error wins.
    let detached = disk.detach().context("Detaching disk");
    r?;
    detached?;

    match image_options.disk_format.unwrap_or_default() {
        DiskFormat::Raw => {}
        DiskFormat::Ova => {
            let ova = OvaOptions {
                name: format!("{}-{}", profile.platform, profile.arch),
                arch: profile.arch.clone(),
                disk_size: image_options.disk_size,
                scratch_dir: inputs.tempdir.join("ova"),
            };
            tools.converter.create_ova(path, &ova, cancel).await?;
        }
        format => {
            tools
                .converter
                .convert(path, format, &image_options.disk_format_options, cancel)
                .await?;
        }
    }
    Ok(())
}

#[context("Creating disk image {path}")]
fn create(path: &Utf8Path, size: u64) -> Result<()> {
    imager_blockdev::create_raw_disk(path.as_std_path(), size)
}
