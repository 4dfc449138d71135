//! The declarative description of an artifact to build.
//!
//! A [`Profile`] usually starts from one of the [built-in](builtin)
//! presets and layers the user's document over it (see [`merge`]).
//! Strings use "empty" to mean unset, which is also how they serialize.

use std::collections::BTreeMap;
use std::fmt::Display;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use imager_oci_ext::registry::ImageSource;

use crate::constants::{self, MIN_RAW_DISK_SIZE};
use crate::error::{ImagerError, ValidationError};
use crate::meta::MetaValue;
use crate::quirks::Quirks;

pub mod builtin;
pub mod merge;

use merge::{merge_by_replace, replace_if_set, Merge};

const AMD64: &str = "amd64";
const ARM64: &str = "arm64";

/// What to build.
#[derive(
    clap::ValueEnum, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord,
)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// A bootable ISO.
    Iso,
    /// A disk image.
    Image,
    /// An installer container image, as an OCI archive.
    Installer,
    /// The kernel.
    Kernel,
    /// The initramfs, with system extensions.
    Initramfs,
    /// A signed unified kernel image.
    Uki,
    /// The kernel command line.
    Cmdline,
}

impl Display for OutputKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OutputKind::Iso => "iso",
            OutputKind::Image => "image",
            OutputKind::Installer => "installer",
            OutputKind::Kernel => "kernel",
            OutputKind::Initramfs => "initramfs",
            OutputKind::Uki => "uki",
            OutputKind::Cmdline => "cmdline",
        };
        f.write_str(s)
    }
}

/// How the finished artifact is packed.
#[derive(clap::ValueEnum, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutFormat {
    /// As is.
    #[default]
    #[serde(rename = "raw")]
    #[value(name = "raw")]
    Raw,
    /// A `.tar.gz` holding the artifact as `disk.raw`.
    #[serde(rename = ".tar.gz", alias = "tar")]
    #[value(name = "tar")]
    Tar,
    /// xz compressed.
    #[serde(rename = ".xz", alias = "xz")]
    #[value(name = "xz")]
    Xz,
    /// gzip compressed.
    #[serde(rename = ".gz", alias = "gz")]
    #[value(name = "gz")]
    Gz,
    /// zstd compressed.
    #[serde(rename = ".zst", alias = "zstd")]
    #[value(name = "zstd")]
    Zstd,
}

/// Disk image formats.
#[derive(clap::ValueEnum, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    /// A raw disk.
    #[default]
    Raw,
    /// QEMU copy-on-write.
    Qcow2,
    /// Virtual PC (`.vhd`).
    Vpc,
    /// A VMware appliance.
    Ova,
}

impl DiskFormat {
    fn extension(&self) -> &'static str {
        match self {
            DiskFormat::Raw => "raw",
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Vpc => "vhd",
            DiskFormat::Ova => "ova",
        }
    }
}

/// Bootloader installed into disk images.
#[derive(clap::ValueEnum, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Bootloader {
    /// GRUB for BIOS, systemd-boot for UEFI.
    #[default]
    DualBoot,
    /// systemd-boot only.
    SdBoot,
    /// GRUB only.
    Grub,
}

impl Display for Bootloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Bootloader::DualBoot => "dual-boot",
            Bootloader::SdBoot => "sd-boot",
            Bootloader::Grub => "grub",
        })
    }
}

/// When systemd-boot enrolls SecureBoot keys from the ISO.
#[derive(clap::ValueEnum, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SdBootEnrollKeys {
    /// Only on virtual machines.
    #[default]
    IfSafe,
    /// Offer an enrollment menu entry.
    Manual,
    /// Always.
    Force,
    /// Never.
    Off,
}

impl Display for SdBootEnrollKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SdBootEnrollKeys::IfSafe => "if-safe",
            SdBootEnrollKeys::Manual => "manual",
            SdBootEnrollKeys::Force => "force",
            SdBootEnrollKeys::Off => "off",
        })
    }
}

merge_by_replace!(OutputKind, OutFormat, DiskFormat, Bootloader, SdBootEnrollKeys);

/// A file input.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct FileAsset {
    /// Path to the file.
    pub path: Utf8PathBuf,
}

impl FileAsset {
    fn is_unset(&self) -> bool {
        self.path.as_str().is_empty()
    }
}

impl Merge for FileAsset {
    fn merge(&mut self, other: Self) {
        self.path.merge(other.path);
    }
}

/// A container image input.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ContainerAsset {
    /// Registry reference.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub image_ref: String,
    /// Skip TLS verification for the registry.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub force_insecure: bool,
    /// A `docker save` tarball; takes precedence over `imageRef`.
    #[serde(skip_serializing_if = "path_is_empty")]
    pub tarball_path: Utf8PathBuf,
    /// An OCI layout directory; takes precedence over `imageRef`.
    #[serde(skip_serializing_if = "path_is_empty")]
    pub oci_path: Utf8PathBuf,
}

fn path_is_empty(p: &Utf8PathBuf) -> bool {
    p.as_str().is_empty()
}

impl ContainerAsset {
    /// A registry image.
    pub fn registry(image_ref: impl Into<String>, force_insecure: bool) -> Self {
        Self {
            image_ref: image_ref.into(),
            force_insecure,
            ..Default::default()
        }
    }

    /// Where to pull this asset from, if it names anything.
    pub fn source(&self) -> Option<ImageSource> {
        if !path_is_empty(&self.tarball_path) {
            Some(ImageSource::DockerArchive(self.tarball_path.clone().into()))
        } else if !path_is_empty(&self.oci_path) {
            Some(ImageSource::OciLayout(self.oci_path.clone().into()))
        } else if !self.image_ref.is_empty() {
            Some(ImageSource::Registry {
                reference: self.image_ref.clone(),
                insecure: self.force_insecure,
            })
        } else {
            None
        }
    }
}

impl Merge for ContainerAsset {
    fn merge(&mut self, other: Self) {
        self.image_ref.merge(other.image_ref);
        self.force_insecure.merge(other.force_insecure);
        self.tarball_path.merge(other.tarball_path);
        self.oci_path.merge(other.oci_path);
    }
}

/// A signing key with its certificate.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct SigningKeyAndCertificate {
    /// PEM private key.
    pub key_path: Utf8PathBuf,
    /// PEM certificate.
    pub cert_path: Utf8PathBuf,
}

/// A signing key.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct SigningKey {
    /// PEM private key.
    pub key_path: Utf8PathBuf,
}

/// Signing material for SecureBoot builds.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct SecureBootAssets {
    /// Signs the UKI and systemd-boot.
    pub secure_boot_signer: SigningKeyAndCertificate,
    /// Signs the PCR policy embedded in the UKI.
    pub pcr_signer: SigningKey,
    /// Auto-enrollment platform key.
    #[serde(skip_serializing_if = "path_is_empty")]
    pub platform_key_path: Utf8PathBuf,
    /// Auto-enrollment key exchange key.
    #[serde(skip_serializing_if = "path_is_empty")]
    pub key_exchange_key_path: Utf8PathBuf,
    /// Auto-enrollment signature database.
    #[serde(skip_serializing_if = "path_is_empty")]
    pub signature_key_path: Utf8PathBuf,
}

impl Merge for SecureBootAssets {
    fn merge(&mut self, other: Self) {
        self.secure_boot_signer
            .key_path
            .merge(other.secure_boot_signer.key_path);
        self.secure_boot_signer
            .cert_path
            .merge(other.secure_boot_signer.cert_path);
        self.pcr_signer.key_path.merge(other.pcr_signer.key_path);
        self.platform_key_path.merge(other.platform_key_path);
        self.key_exchange_key_path.merge(other.key_exchange_key_path);
        self.signature_key_path.merge(other.signature_key_path);
    }
}

/// Inputs consumed by the build.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Input {
    /// The kernel.
    pub kernel: FileAsset,
    /// The initramfs, without system extensions.
    pub initramfs: FileAsset,
    /// systemd-stub (SecureBoot only).
    pub sd_stub: FileAsset,
    /// systemd-boot (SecureBoot only).
    pub sd_boot: FileAsset,
    /// The installer image to derive from.
    pub base_installer: ContainerAsset,
    /// Signing material (SecureBoot only).
    #[serde(rename = "secureboot", skip_serializing_if = "Option::is_none")]
    pub secure_boot: Option<SecureBootAssets>,
    /// System extensions to add to the initramfs. Later entries win file
    /// conflicts.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub system_extensions: Vec<ContainerAsset>,
}

impl Merge for Input {
    fn merge(&mut self, other: Self) {
        self.kernel.merge(other.kernel);
        self.initramfs.merge(other.initramfs);
        self.sd_stub.merge(other.sd_stub);
        self.sd_boot.merge(other.sd_boot);
        self.base_installer.merge(other.base_installer);
        self.secure_boot.merge(other.secure_boot);
        self.system_extensions.merge(other.system_extensions);
    }
}

impl Input {
    /// Point unset inputs at their standard locations inside the installer
    /// image.
    pub fn fill_defaults(&mut self, arch: &str, version: &str, secure_boot: bool) {
        self.fill_defaults_with(
            arch,
            version,
            secure_boot,
            Utf8Path::new(constants::DEFAULT_SECUREBOOT_PREFIX),
        )
    }

    fn fill_defaults_with(
        &mut self,
        arch: &str,
        version: &str,
        secure_boot: bool,
        secureboot_prefix: &Utf8Path,
    ) {
        let installed = |name: &str| Utf8PathBuf::from(format!("/{}", constants::asset_path(arch, name)));
        if self.kernel.is_unset() {
            self.kernel.path = installed(constants::KERNEL_ASSET);
        }
        if self.initramfs.is_unset() {
            self.initramfs.path = installed(constants::INITRAMFS_ASSET);
        }
        if self.base_installer.source().is_none() {
            self.base_installer.image_ref =
                format!("{}:{version}", constants::DEFAULT_INSTALLER_REPOSITORY);
        }
        if !secure_boot {
            return;
        }
        if self.sd_stub.is_unset() {
            self.sd_stub.path = installed(constants::SD_STUB_ASSET);
        }
        if self.sd_boot.is_unset() {
            self.sd_boot.path = installed(constants::SD_BOOT_ASSET);
        }
        let sb = self.secure_boot.get_or_insert_with(Default::default);
        if sb.secure_boot_signer == SigningKeyAndCertificate::default() {
            sb.secure_boot_signer = SigningKeyAndCertificate {
                key_path: secureboot_prefix.join(constants::SECUREBOOT_SIGNING_KEY_ASSET),
                cert_path: secureboot_prefix.join(constants::SECUREBOOT_SIGNING_CERT_ASSET),
            };
        }
        if sb.pcr_signer == SigningKey::default() {
            sb.pcr_signer.key_path = secureboot_prefix.join(constants::PCR_SIGNING_KEY_ASSET);
        }
        for (field, name) in [
            (&mut sb.platform_key_path, constants::PLATFORM_KEY_ASSET),
            (&mut sb.key_exchange_key_path, constants::KEY_EXCHANGE_KEY_ASSET),
            (&mut sb.signature_key_path, constants::SIGNATURE_KEY_ASSET),
        ] {
            let candidate = secureboot_prefix.join(name);
            if path_is_empty(field) && candidate.exists() {
                *field = candidate;
            }
        }
    }
}

/// Options for disk images.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ImageOptions {
    /// Disk size in bytes.
    pub disk_size: u64,
    /// Output format; raw when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_format: Option<DiskFormat>,
    /// Extra `qemu-img` options for the format, e.g. `cluster_size=8k`.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub disk_format_options: String,
    /// Bootloader; dual-boot when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bootloader: Option<Bootloader>,
}

impl Merge for ImageOptions {
    fn merge(&mut self, other: Self) {
        self.disk_size.merge(other.disk_size);
        self.disk_format.merge(other.disk_format);
        self.disk_format_options.merge(other.disk_format_options);
        self.bootloader.merge(other.bootloader);
    }
}

/// Options for ISOs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct IsoOptions {
    /// SecureBoot key enrollment policy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sd_boot_enroll_keys: Option<SdBootEnrollKeys>,
}

impl Merge for IsoOptions {
    fn merge(&mut self, other: Self) {
        self.sd_boot_enroll_keys.merge(other.sd_boot_enroll_keys);
    }
}

/// The artifact to produce.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Output {
    /// Output kind.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<OutputKind>,
    /// Disk image options.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_options: Option<ImageOptions>,
    /// ISO options.
    #[serde(rename = "isoOptions", skip_serializing_if = "Option::is_none")]
    pub iso_options: Option<IsoOptions>,
    /// Post-processing; raw when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub out_format: Option<OutFormat>,
}

impl Output {
    /// The post-processing format.
    pub fn out_format(&self) -> OutFormat {
        self.out_format.unwrap_or_default()
    }

    /// The disk format of image outputs.
    pub fn disk_format(&self) -> DiskFormat {
        self.image_options
            .as_ref()
            .and_then(|o| o.disk_format)
            .unwrap_or_default()
    }
}

impl Merge for Output {
    fn merge(&mut self, other: Self) {
        self.kind.merge(other.kind);
        self.image_options.merge(other.image_options);
        self.iso_options.merge(other.iso_options);
        self.out_format.merge(other.out_format);
    }
}

/// Customizations of the booted system.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Customization {
    /// Extra kernel arguments, applied last.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extra_kernel_args: Vec<String>,
    /// Values to write into the META partition.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub meta_contents: Vec<MetaValue>,
    /// A machine configuration to embed as a system extension.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub embedded_machine_configuration: String,
}

impl Merge for Customization {
    fn merge(&mut self, other: Self) {
        self.extra_kernel_args.merge(other.extra_kernel_args);
        replace_if_set(&mut self.meta_contents, other.meta_contents);
        self.embedded_machine_configuration
            .merge(other.embedded_machine_configuration);
    }
}

/// A board-support overlay.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct OverlayOptions {
    /// Name of the overlay installer to run.
    pub name: String,
    /// The overlay image.
    pub image: ContainerAsset,
    /// Options passed to the overlay installer.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, serde_yaml::Value>,
}

impl Merge for OverlayOptions {
    fn merge(&mut self, other: Self) {
        self.name.merge(other.name);
        self.image.merge(other.image);
        self.options.merge(other.options);
    }
}

/// The full description of a build.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Profile {
    /// Name of a built-in profile to start from.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub base_profile_name: String,
    /// `amd64` or `arm64`.
    pub arch: String,
    /// The platform the artifact boots on.
    pub platform: String,
    /// Single-board computer (metal arm64 only).
    #[serde(skip_serializing_if = "String::is_empty")]
    pub board: String,
    /// SecureBoot; off when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secure_boot: Option<bool>,
    /// The OS version being imaged.
    pub version: String,
    /// System customizations.
    pub customization: Customization,
    /// Board-support overlay.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlay: Option<OverlayOptions>,
    /// Inputs.
    pub input: Input,
    /// Output.
    pub output: Output,
}

impl Merge for Profile {
    fn merge(&mut self, other: Self) {
        self.base_profile_name.merge(other.base_profile_name);
        self.arch.merge(other.arch);
        self.platform.merge(other.platform);
        self.board.merge(other.board);
        self.secure_boot.merge(other.secure_boot);
        self.version.merge(other.version);
        self.customization.merge(other.customization);
        self.overlay.merge(other.overlay);
        self.input.merge(other.input);
        self.output.merge(other.output);
    }
}

fn invalid(msg: impl Into<String>) -> anyhow::Error {
    ImagerError::Validation(ValidationError::new(msg)).into()
}

fn require_file(path: &Utf8Path) -> Result<()> {
    if path.as_str().is_empty() || !path.exists() {
        return Err(ImagerError::InputNotFound(path.to_owned()).into());
    }
    Ok(())
}

impl Profile {
    /// Parse a YAML document.
    pub fn from_yaml(s: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(s)?)
    }

    /// Serialize as YAML.
    pub fn dump(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Whether SecureBoot is enabled.
    pub fn secure_boot_enabled(&self) -> bool {
        self.secure_boot.unwrap_or(false)
    }

    /// Version-dependent behavior for this profile.
    pub fn quirks(&self) -> Quirks {
        Quirks::new(&self.version)
    }

    /// The output kind; an error if unset.
    pub fn kind(&self) -> Result<OutputKind> {
        self.output
            .kind
            .ok_or_else(|| invalid("output kind is required"))
    }

    /// If a base profile is named, layer `self` over a copy of it.
    pub fn resolve_base(self) -> Result<Self> {
        if self.base_profile_name.is_empty() {
            return Ok(self);
        }
        let mut base = builtin::get(&self.base_profile_name).ok_or_else(|| {
            invalid(format!("unknown base profile: {}", self.base_profile_name))
        })?;
        base.merge(self);
        base.base_profile_name.clear();
        Ok(base)
    }

    /// File name of the artifact, relative to the output directory.
    pub fn output_path(&self) -> Result<String> {
        let sb = if self.secure_boot_enabled() {
            "-secureboot"
        } else {
            ""
        };
        let mut base = self.platform.clone();
        if !self.board.is_empty() {
            base.push('-');
            base.push_str(&self.board);
        }
        base.push('-');
        base.push_str(&self.arch);
        base.push_str(sb);
        let arch = &self.arch;
        let r = match self.kind()? {
            OutputKind::Iso => format!("{base}.iso"),
            OutputKind::Image => format!("{base}.{}", self.output.disk_format().extension()),
            OutputKind::Installer => format!("installer-{arch}{sb}.tar"),
            OutputKind::Kernel => format!("kernel-{arch}"),
            OutputKind::Initramfs => format!("initramfs-{arch}.xz"),
            OutputKind::Uki => format!("{base}-uki.efi"),
            OutputKind::Cmdline => format!("cmdline-{base}"),
        };
        Ok(r)
    }

    /// Check every invariant of a resolved, defaulted profile.
    ///
    /// Only reads the filesystem; calling it twice gives the same answer.
    pub fn validate(&self) -> Result<()> {
        if self.arch != AMD64 && self.arch != ARM64 {
            return Err(invalid(format!("invalid arch {:?}", self.arch)));
        }
        if self.platform.is_empty() {
            return Err(invalid("platform is required"));
        }
        if !self.board.is_empty() && (self.arch != ARM64 || self.platform != "metal") {
            return Err(invalid("board is only supported for metal arm64"));
        }
        let quirks = self.quirks();
        if let Some(overlay) = &self.overlay {
            if !self.board.is_empty() {
                return Err(invalid("board and overlay are mutually exclusive"));
            }
            if !quirks.supports_overlay() {
                return Err(invalid(format!(
                    "overlays are not supported by version {}",
                    self.version
                )));
            }
            if overlay.name.is_empty() {
                return Err(invalid("overlay name is required"));
            }
            if overlay.image.source().is_none() {
                return Err(invalid("overlay image is required"));
            }
        }

        let kind = self.kind()?;
        let sb = self.secure_boot_enabled();
        if sb && !quirks.supports_uki() {
            return Err(invalid(format!(
                "SecureBoot is not supported by version {}",
                self.version
            )));
        }
        match kind {
            OutputKind::Uki if !sb => {
                return Err(invalid("UKI output requires SecureBoot"));
            }
            OutputKind::Kernel | OutputKind::Initramfs if sb => {
                return Err(invalid(format!("{kind} output is not supported with SecureBoot")));
            }
            _ => {}
        }
        if !sb && matches!(kind, OutputKind::Kernel | OutputKind::Initramfs | OutputKind::Installer) {
            if !self.customization.extra_kernel_args.is_empty() {
                return Err(invalid(format!(
                    "extra kernel arguments are not supported for {kind} output without SecureBoot"
                )));
            }
            if !self.customization.meta_contents.is_empty() {
                return Err(invalid(format!(
                    "META contents are not supported for {kind} output without SecureBoot"
                )));
            }
        }
        match kind {
            OutputKind::Image => {
                let size = self
                    .output
                    .image_options
                    .as_ref()
                    .map(|o| o.disk_size)
                    .unwrap_or_default();
                if size == 0 {
                    return Err(invalid("disk size is required for image output"));
                }
                if size < MIN_RAW_DISK_SIZE {
                    return Err(invalid(format!(
                        "disk size {size} is below the minimum of {MIN_RAW_DISK_SIZE} bytes"
                    )));
                }
            }
            OutputKind::Installer => {
                if self.input.base_installer.source().is_none() {
                    return Err(invalid("base installer image is required"));
                }
            }
            _ => {}
        }

        // The cmdline kind reads no input files.
        if kind == OutputKind::Cmdline {
            return Ok(());
        }
        if kind != OutputKind::Initramfs {
            require_file(&self.input.kernel.path)?;
        }
        if kind != OutputKind::Kernel {
            require_file(&self.input.initramfs.path)?;
        }
        if sb {
            let assets = self.input.secure_boot.clone().unwrap_or_default();
            require_file(&assets.secure_boot_signer.cert_path)?;
            require_file(&assets.secure_boot_signer.key_path)?;
            require_file(&assets.pcr_signer.key_path)?;
        }
        Ok(())
    }
}
