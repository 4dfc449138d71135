//! Assembling and signing the unified kernel image.

use std::process::Command;

use anyhow::{Context, Result};
use async_trait::async_trait;
use camino::Utf8PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use imager_utils::AsyncCommandRunExt;

/// Everything needed to produce a signed UKI and a signed systemd-boot.
#[derive(Debug, Clone)]
pub struct UkiOptions {
    /// The kernel.
    pub kernel: Utf8PathBuf,
    /// The (possibly rebuilt) initramfs.
    pub initramfs: Utf8PathBuf,
    /// systemd-stub to wrap everything in.
    pub sd_stub: Utf8PathBuf,
    /// systemd-boot to sign.
    pub sd_boot: Utf8PathBuf,
    /// Kernel command line to embed.
    pub cmdline: String,
    /// SecureBoot signing key.
    pub signing_key: Utf8PathBuf,
    /// SecureBoot signing certificate.
    pub signing_cert: Utf8PathBuf,
    /// Key signing the PCR policy.
    pub pcr_signing_key: Utf8PathBuf,
    /// Target architecture.
    pub arch: String,
    /// OS version embedded in `.osrel`.
    pub version: String,
    /// Where the signed UKI goes.
    pub out_uki: Utf8PathBuf,
    /// Where the signed systemd-boot goes.
    pub out_sd_boot: Utf8PathBuf,
}

/// Builds and signs UKIs.
#[async_trait]
pub trait UkiBuilder: std::fmt::Debug + Send + Sync {
    /// Write `opts.out_uki` and `opts.out_sd_boot`.
    async fn build(&self, opts: &UkiOptions, cancel: &CancellationToken) -> Result<()>;
}

/// The EFI architecture name used in file names and by `ukify`.
pub fn efi_arch(arch: &str) -> Result<&'static str> {
    match arch {
        "amd64" => Ok("x64"),
        "arm64" => Ok("aa64"),
        o => anyhow::bail!("Unsupported architecture {o}"),
    }
}

fn os_release(version: &str) -> String {
    format!(
        "NAME=\"Talos\"\nID=talos\nVERSION_ID={version}\nPRETTY_NAME=\"Talos ({version})\"\nHOME_URL=\"https://www.talos.dev/\"\n"
    )
}

/// `ukify` for the UKI, `sbsign` for systemd-boot.
#[derive(Debug, Default)]
pub struct UkifyBuilder;

impl UkifyBuilder {
    fn ukify(opts: &UkiOptions, os_release: &camino::Utf8Path) -> Result<Command> {
        let mut c = Command::new("ukify");
        c.arg("build")
            .arg(format!("--efi-arch={}", efi_arch(&opts.arch)?))
            .arg(format!("--linux={}", opts.kernel))
            .arg(format!("--initrd={}", opts.initramfs))
            .arg(format!("--stub={}", opts.sd_stub))
            .arg(format!("--cmdline={}", opts.cmdline))
            .arg(format!("--os-release=@{os_release}"))
            .arg(format!("--uname={}", opts.version))
            .arg("--signtool=sbsign")
            .arg(format!("--secureboot-private-key={}", opts.signing_key))
            .arg(format!("--secureboot-certificate={}", opts.signing_cert))
            .arg(format!("--pcr-private-key={}", opts.pcr_signing_key))
            .arg("--pcr-banks=sha256,sha384,sha512")
            .arg(format!("--output={}", opts.out_uki));
        Ok(c)
    }

    fn sbsign(opts: &UkiOptions) -> Command {
        let mut c = Command::new("sbsign");
        c.arg("--key")
            .arg(&opts.signing_key)
            .arg("--cert")
            .arg(&opts.signing_cert)
            .arg("--output")
            .arg(&opts.out_sd_boot)
            .arg(&opts.sd_boot);
        c
    }
}

#[async_trait]
impl UkiBuilder for UkifyBuilder {
    #[instrument(level = "debug", skip_all, fields(out = %opts.out_uki))]
    async fn build(&self, opts: &UkiOptions, cancel: &CancellationToken) -> Result<()> {
        let scratch = opts
            .out_uki
            .parent()
            .context("UKI output has no parent directory")?;
        let osrel = scratch.join("os-release");
        tokio::fs::write(&osrel, os_release(&opts.version)).await?;

        tokio::process::Command::from(Self::sbsign(opts))
            .run_cancellable(cancel)
            .await
            .context("Signing systemd-boot")?;
        tokio::process::Command::from(Self::ukify(opts, &osrel)?)
            .run_cancellable(cancel)
            .await
            .context("Running ukify")?;
        Ok(())
    }
}
