//! Bootable ISOs: GRUB for plain boots, systemd-boot plus a signed UKI
//! for SecureBoot.

use std::process::Command;

use anyhow::{Context, Result};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use tokio_util::sync::CancellationToken;

use imager_utils::AsyncCommandRunExt;

use crate::constants::{KEY_EXCHANGE_KEY_ASSET, PLATFORM_KEY_ASSET, SIGNATURE_KEY_ASSET};
use crate::profile::SdBootEnrollKeys;
use crate::quirks::Quirks;
use crate::uki::efi_arch;

/// Owner GUID recorded in generated signature lists.
const SIGNATURE_OWNER: &str = "9e7ef1c7-3bd3-4f1b-9c4f-3f6b8f3c1e52";

/// The volume label for `version` on `arch`, if the version boots by label.
pub fn label(version: &str, arch: &str) -> Option<String> {
    Quirks::new(version)
        .supports_iso_label()
        .then(|| format!("Talos-{version}-{arch}"))
}

/// Convert a PEM file holding exactly one certificate to DER.
#[context("Converting certificate to DER")]
pub fn cert_pem_to_der(pem: &[u8]) -> Result<Vec<u8>> {
    let certs = openssl::x509::X509::stack_from_pem(pem)?;
    match certs.as_slice() {
        [cert] => Ok(cert.to_der()?),
        [] => anyhow::bail!("No certificate found in PEM data"),
        _ => anyhow::bail!("More than one PEM block found in PEM data"),
    }
}

/// Inputs of a GRUB ISO.
#[derive(Debug, Clone)]
pub struct GrubOptions {
    /// The kernel.
    pub kernel: Utf8PathBuf,
    /// The initramfs.
    pub initramfs: Utf8PathBuf,
    /// Kernel command line.
    pub cmdline: String,
    /// OS version.
    pub version: String,
    /// Target architecture.
    pub arch: String,
    /// Scratch space for the ISO tree.
    pub scratch_dir: Utf8PathBuf,
    /// The ISO to write.
    pub out_path: Utf8PathBuf,
    /// Volume label.
    pub label: Option<String>,
}

/// Inputs of a SecureBoot ISO.
#[derive(Debug, Clone)]
pub struct UefiOptions {
    /// The signed UKI.
    pub uki: Utf8PathBuf,
    /// The signed systemd-boot.
    pub sd_boot: Utf8PathBuf,
    /// The UKI signing certificate in DER, for manual enrollment.
    pub uki_signing_cert_der: Utf8PathBuf,
    /// Auto-enrollment keys.
    pub keys: EnrollmentKeys,
    /// Target architecture.
    pub arch: String,
    /// OS version.
    pub version: String,
    /// Scratch space for the ISO tree.
    pub scratch_dir: Utf8PathBuf,
    /// The ISO to write.
    pub out_path: Utf8PathBuf,
    /// systemd-boot key enrollment policy.
    pub sd_boot_enroll_keys: SdBootEnrollKeys,
    /// Volume label.
    pub label: Option<String>,
}

/// Signed EFI variable updates enrolling SecureBoot keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentKeys {
    /// Platform key.
    pub platform_key: Utf8PathBuf,
    /// Key exchange key.
    pub key_exchange_key: Utf8PathBuf,
    /// Signature database.
    pub signature_db: Utf8PathBuf,
}

/// Creates ISOs.
#[async_trait]
pub trait IsoCreator: std::fmt::Debug + Send + Sync {
    /// Build a GRUB ISO.
    async fn create_grub(&self, opts: &GrubOptions, cancel: &CancellationToken) -> Result<()>;

    /// Build a systemd-boot ISO.
    async fn create_uefi(&self, opts: &UefiOptions, cancel: &CancellationToken) -> Result<()>;

    /// Generate `PK`, `KEK` and `db` updates enrolling `cert` (PEM), each
    /// signed with `key`, into `out_dir`.
    async fn generate_enrollment(
        &self,
        cert: &Utf8Path,
        key: &Utf8Path,
        out_dir: &Utf8Path,
        cancel: &CancellationToken,
    ) -> Result<EnrollmentKeys>;
}

fn grub_config(opts: &GrubOptions) -> String {
    let mut cfg = String::from(
        "set default=0\nset timeout=3\n\ninsmod all_video\n\nterminal_input console\nterminal_output console\n",
    );
    let entry = |title: &str, extra: &str| {
        format!(
            "\nmenuentry \"{title}\" {{\n  set gfxmode=auto\n  set gfxpayload=text\n  linux /boot/vmlinuz {}{extra}\n  initrd /boot/initramfs.xz\n}}\n",
            opts.cmdline
        )
    };
    cfg.push_str(&entry(&format!("Talos ISO {}", opts.version), ""));
    if Quirks::new(&opts.version).supports_reset_grub_option() {
        cfg.push_str(&entry("Reset Talos installation", " talos.experimental.wipe=system"));
    }
    cfg
}

fn loader_conf(enroll: SdBootEnrollKeys) -> String {
    format!("timeout 10\nsecure-boot-enroll {enroll}\n")
}

/// Populate the GRUB ISO tree.
#[context("Preparing GRUB ISO tree")]
fn grub_tree(opts: &GrubOptions) -> Result<()> {
    let boot = opts.scratch_dir.join("boot");
    std::fs::create_dir_all(boot.join("grub"))?;
    std::fs::copy(&opts.kernel, boot.join("vmlinuz"))
        .with_context(|| format!("Copying {}", opts.kernel))?;
    std::fs::copy(&opts.initramfs, boot.join("initramfs.xz"))
        .with_context(|| format!("Copying {}", opts.initramfs))?;
    std::fs::write(boot.join("grub/grub.cfg"), grub_config(opts))?;
    Ok(())
}

/// Populate the systemd-boot ESP tree, returning its total size in bytes.
#[context("Preparing UEFI ISO tree")]
fn uefi_tree(opts: &UefiOptions) -> Result<u64> {
    let esp = opts.scratch_dir.join("esp");
    let boot_dir = esp.join("EFI/BOOT");
    let linux_dir = esp.join("EFI/Linux");
    let keys_dir = esp.join("loader/keys/auto");
    for d in [&boot_dir, &linux_dir, &keys_dir] {
        std::fs::create_dir_all(d)?;
    }
    let efi = efi_arch(&opts.arch)?.to_uppercase();
    let copies = [
        (&opts.sd_boot, boot_dir.join(format!("BOOT{efi}.EFI"))),
        (&opts.uki, linux_dir.join(format!("Talos-{}.efi", opts.version))),
        (&opts.keys.platform_key, keys_dir.join(PLATFORM_KEY_ASSET)),
        (&opts.keys.key_exchange_key, keys_dir.join(KEY_EXCHANGE_KEY_ASSET)),
        (&opts.keys.signature_db, keys_dir.join(SIGNATURE_KEY_ASSET)),
        (&opts.uki_signing_cert_der, esp.join("uki-signing-cert.der")),
    ];
    let mut total = 0;
    for (src, dest) in copies {
        total += std::fs::copy(src, &dest).with_context(|| format!("Copying {src}"))?;
    }
    std::fs::write(esp.join("loader/loader.conf"), loader_conf(opts.sd_boot_enroll_keys))?;
    Ok(total)
}

/// FAT image size in KiB for `content` bytes, with room for metadata.
fn esp_size_kib(content: u64) -> u64 {
    let kib = content.div_ceil(1024);
    kib + kib / 10 + 1024
}

/// `grub-mkrescue`, `xorriso` and the `sbsigntools`.
#[derive(Debug, Default)]
pub struct CommandIso;

async fn run(cmd: Command, cancel: &CancellationToken) -> Result<()> {
    tokio::process::Command::from(cmd)
        .run_cancellable(cancel)
        .await
}

#[async_trait]
impl IsoCreator for CommandIso {
    async fn create_grub(&self, opts: &GrubOptions, cancel: &CancellationToken) -> Result<()> {
        grub_tree(opts)?;
        let mut c = Command::new("grub-mkrescue");
        c.arg("--compress=xz")
            .arg("--output")
            .arg(&opts.out_path)
            .arg(&opts.scratch_dir)
            .arg("--");
        if let Some(label) = &opts.label {
            c.args(["-volid", label]);
        }
        c.args(["-padding", "0"]);
        run(c, cancel).await.context("Creating GRUB ISO")
    }

    async fn create_uefi(&self, opts: &UefiOptions, cancel: &CancellationToken) -> Result<()> {
        let size = uefi_tree(opts)?;
        let esp = opts.scratch_dir.join("esp");
        let img = opts.scratch_dir.join("efiboot.img");

        let mut c = Command::new("mkfs.vfat");
        c.arg("-C").arg(&img).arg(esp_size_kib(size).to_string());
        run(c, cancel).await.context("Formatting ESP")?;

        let mut c = Command::new("mcopy");
        c.arg("-s").arg("-i").arg(&img);
        for entry in ["EFI", "loader", "uki-signing-cert.der"] {
            c.arg(esp.join(entry));
        }
        c.arg("::");
        run(c, cancel).await.context("Populating ESP")?;

        let iso_root = opts.scratch_dir.join("iso");
        tokio::fs::create_dir_all(&iso_root).await?;
        tokio::fs::rename(&img, iso_root.join("efiboot.img")).await?;

        let mut c = Command::new("xorriso");
        c.args(["-as", "mkisofs"]);
        if let Some(label) = &opts.label {
            c.args(["-V", label]);
        }
        c.args(["-e", "efiboot.img", "-no-emul-boot", "-o"])
            .arg(&opts.out_path)
            .arg(&iso_root);
        run(c, cancel).await.context("Creating UEFI ISO")
    }

    async fn generate_enrollment(
        &self,
        cert: &Utf8Path,
        key: &Utf8Path,
        out_dir: &Utf8Path,
        cancel: &CancellationToken,
    ) -> Result<EnrollmentKeys> {
        let esl = out_dir.join("enroll.esl");
        let mut c = Command::new("sbsiglist");
        c.args(["--owner", SIGNATURE_OWNER, "--type", "x509", "--output"])
            .arg(&esl)
            .arg(cert);
        run(c, cancel).await.context("Creating signature list")?;

        let mut outputs = Vec::with_capacity(3);
        for (var, asset) in [
            ("PK", PLATFORM_KEY_ASSET),
            ("KEK", KEY_EXCHANGE_KEY_ASSET),
            ("db", SIGNATURE_KEY_ASSET),
        ] {
            let out = out_dir.join(asset);
            let mut c = Command::new("sbvarsign");
            c.arg("--key")
                .arg(key)
                .arg("--cert")
                .arg(cert)
                .arg("--output")
                .arg(&out)
                .arg(var)
                .arg(&esl);
            run(c, cancel)
                .await
                .with_context(|| format!("Signing {var}"))?;
            outputs.push(out);
        }
        let [platform_key, key_exchange_key, signature_db]: [Utf8PathBuf; 3] = outputs
            .try_into()
            .map_err(|_| anyhow::anyhow!("Expected three enrollment keys"))?;
        Ok(EnrollmentKeys {
            platform_key,
            key_exchange_key,
            signature_db,
        })
    }
}
