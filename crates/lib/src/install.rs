//! Running the installer against a block device.
//!
//! Partitioning, filesystems and bootloader setup belong to the
//! installer; this module only describes what it should install.

use std::fmt::Display;
use std::process::Command;

use anyhow::{Context, Result};
use async_trait::async_trait;
use camino::Utf8PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use imager_utils::AsyncCommandRunExt;

use crate::kernel_cmdline::Cmdline;
use crate::meta::MetaValue;
use crate::overlay::PreparedOverlay;
use crate::profile::Bootloader;

/// What kind of installation to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// A fresh installation onto a real disk.
    Install,
    /// Building a disk image: no hardware probing, no reboot.
    Image,
}

impl Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Mode::Install => "install",
            Mode::Image => "image",
        })
    }
}

/// The boot files to install.
#[derive(Debug, Clone, Default)]
pub struct BootAssets {
    /// The kernel.
    pub kernel: Utf8PathBuf,
    /// The initramfs.
    pub initramfs: Utf8PathBuf,
    /// The signed UKI, with SecureBoot.
    pub uki: Option<Utf8PathBuf>,
    /// The signed systemd-boot, with SecureBoot.
    pub sd_boot: Option<Utf8PathBuf>,
}

/// Options for [`Installer::install`].
#[derive(Debug, Clone)]
pub struct InstallOptions {
    /// The target block device.
    pub disk: Utf8PathBuf,
    /// Platform.
    pub platform: String,
    /// Architecture.
    pub arch: String,
    /// Board, `none` if there is none.
    pub board: String,
    /// Values written into META.
    pub meta_values: Vec<MetaValue>,
    /// Whether SecureBoot is on.
    pub secure_boot: bool,
    /// OS version.
    pub version: String,
    /// Files to install.
    pub boot_assets: BootAssets,
    /// Where the installer mounts the target's filesystems.
    pub mount_prefix: Utf8PathBuf,
    /// Bootloader to set up.
    pub bootloader: Bootloader,
    /// The kernel command line.
    pub cmdline: Cmdline,
    /// Overlay whose installer and artifacts the installer uses.
    pub overlay: Option<PreparedOverlay>,
}

/// Installs the OS onto a block device.
#[async_trait]
pub trait Installer: std::fmt::Debug + Send + Sync {
    /// Install according to `opts`.
    async fn install(&self, opts: &InstallOptions, mode: Mode, cancel: &CancellationToken) -> Result<()>;
}

/// Drives an external `installer` executable.
#[derive(Debug)]
pub struct CommandInstaller {
    program: Utf8PathBuf,
}

impl Default for CommandInstaller {
    fn default() -> Self {
        Self::new("installer")
    }
}

impl CommandInstaller {
    /// Use the installer at `program`.
    pub fn new(program: impl Into<Utf8PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, opts: &InstallOptions, mode: Mode) -> Command {
        let mut c = Command::new(&self.program);
        c.arg("install")
            .arg(format!("--mode={mode}"))
            .arg(format!("--disk={}", opts.disk))
            .arg(format!("--platform={}", opts.platform))
            .arg(format!("--arch={}", opts.arch))
            .arg(format!("--board={}", opts.board))
            .arg(format!("--version={}", opts.version))
            .arg(format!("--bootloader={}", opts.bootloader))
            .arg(format!("--mount-prefix={}", opts.mount_prefix))
            .arg(format!("--kernel={}", opts.boot_assets.kernel))
            .arg(format!("--initramfs={}", opts.boot_assets.initramfs));
        if let Some(uki) = &opts.boot_assets.uki {
            c.arg(format!("--uki={uki}"));
        }
        if let Some(sd_boot) = &opts.boot_assets.sd_boot {
            c.arg(format!("--sd-boot={sd_boot}"));
        }
        if opts.secure_boot {
            c.arg("--secure-boot");
        }
        for m in &opts.meta_values {
            c.arg(format!("--meta=0x{:x}={}", m.key, m.value));
        }
        if let Some(overlay) = &opts.overlay {
            c.arg(format!("--overlay-name={}", overlay.name))
                .arg(format!("--overlay-installer={}", overlay.installer_path()))
                .arg(format!("--overlay-artifacts={}", overlay.artifacts_path()));
        }
        c.arg(format!("--cmdline={}", opts.cmdline));
        c
    }
}

#[async_trait]
impl Installer for CommandInstaller {
    #[instrument(level = "debug", skip_all, fields(disk = %opts.disk))]
    async fn install(&self, opts: &InstallOptions, mode: Mode, cancel: &CancellationToken) -> Result<()> {
        if let Some(overlay) = &opts.overlay {
            overlay.write_extra_options()?;
        }
        tokio::process::Command::from(self.command(opts, mode))
            .run_cancellable(cancel)
            .await
            .with_context(|| format!("Installing to {}", opts.disk))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Records every installation and writes a marker at the start of the disk.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingInstaller {
        pub(crate) installs: Mutex<Vec<InstallOptions>>,
    }

    #[async_trait]
    impl Installer for RecordingInstaller {
        async fn install(&self, opts: &InstallOptions, mode: Mode, _cancel: &CancellationToken) -> Result<()> {
            use std::io::Write;
            assert_eq!(mode, Mode::Image);
            let mut f = std::fs::OpenOptions::new().write(true).open(&opts.disk)?;
            f.write_all(b"installed")?;
            self.installs.lock().unwrap().push(opts.clone());
            Ok(())
        }
    }

    fn opts() -> InstallOptions {
        InstallOptions {
            disk: "/dev/loop3".into(),
            platform: "aws".into(),
            arch: "amd64".into(),
            board: crate::constants::BOARD_NONE.into(),
            meta_values: vec![MetaValue {
                key: 12,
                value: "v".into(),
            }],
            secure_boot: false,
            version: "v1.8.0".into(),
            boot_assets: BootAssets {
                kernel: "/usr/install/amd64/vmlinuz".into(),
                initramfs: "/tmp/imager/initramfs.xz".into(),
                ..Default::default()
            },
            mount_prefix: "/tmp/imager/image".into(),
            bootloader: Bootloader::DualBoot,
            cmdline: Cmdline::parse("talos.platform=aws console=tty1"),
            overlay: None,
        }
    }

    #[test]
    fn test_command() {
        let c = CommandInstaller::default().command(&opts(), Mode::Image);
        let args = c
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        similar_asserts::assert_eq!(
            args,
            [
                "install",
                "--mode=image",
                "--disk=/dev/loop3",
                "--platform=aws",
                "--arch=amd64",
                "--board=none",
                "--version=v1.8.0",
                "--bootloader=dual-boot",
                "--mount-prefix=/tmp/imager/image",
                "--kernel=/usr/install/amd64/vmlinuz",
                "--initramfs=/tmp/imager/initramfs.xz",
                "--meta=0xc=v",
                "--cmdline=talos.platform=aws console=tty1",
            ]
        );
    }

    #[test]
    fn test_command_secureboot() {
        let mut o = opts();
        o.secure_boot = true;
        o.boot_assets.uki = Some("/tmp/imager/vmlinuz.efi.signed".into());
        o.boot_assets.sd_boot = Some("/tmp/imager/systemd-boot.efi.signed".into());
        let c = CommandInstaller::new("/bin/installer").command(&o, Mode::Install);
        assert_eq!(c.get_program(), "/bin/installer");
        let args = c
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        assert_eq!(args[1], "--mode=install");
        assert!(args.contains(&"--uki=/tmp/imager/vmlinuz.efi.signed".to_string()));
        assert!(args.contains(&"--secure-boot".to_string()));
    }
}
