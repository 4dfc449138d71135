//! Well known names, paths and sizes.

/// The version tag of this build, used when a profile does not name one.
pub const VERSION_TAG: &str = match option_env!("IMAGER_VERSION_TAG") {
    Some(v) => v,
    None => concat!("v", env!("CARGO_PKG_VERSION")),
};

const MIB: u64 = 1024 * 1024;

/// The smallest disk image the installer can lay out.
pub const MIN_RAW_DISK_SIZE: u64 = 1246 * MIB;

/// Disk size of cloud images whose platform has no better default.
pub const DEFAULT_RAW_DISK_SIZE: u64 = 8192 * MIB;

/// Kernel parameter naming the platform.
pub const KERNEL_PARAM_PLATFORM: &str = "talos.platform";
/// Kernel parameter naming the board.
pub const KERNEL_PARAM_BOARD: &str = "talos.board";
/// Kernel parameter passing environment variables to the init process.
pub const KERNEL_PARAM_ENVIRONMENT: &str = "talos.environment";
/// Environment variable the installer reads META values from.
pub const META_VALUES_ENV_VAR: &str = "INSTALLER_META_BASE64";

/// Board name passed to the installer when there is none.
pub const BOARD_NONE: &str = "none";

/// Repository of the default base installer image.
pub const DEFAULT_INSTALLER_REPOSITORY: &str = "ghcr.io/siderolabs/installer";

/// Where signing material lives when the profile does not say.
pub const DEFAULT_SECUREBOOT_PREFIX: &str = "/secureboot";
/// Default name of the SecureBoot signing key.
pub const SECUREBOOT_SIGNING_KEY_ASSET: &str = "uki-signing-key.pem";
/// Default name of the SecureBoot signing certificate.
pub const SECUREBOOT_SIGNING_CERT_ASSET: &str = "uki-signing-cert.pem";
/// Default name of the PCR signing key.
pub const PCR_SIGNING_KEY_ASSET: &str = "pcr-signing-key.pem";
/// Auto-enrollment platform key.
pub const PLATFORM_KEY_ASSET: &str = "PK.auth";
/// Auto-enrollment key exchange key.
pub const KEY_EXCHANGE_KEY_ASSET: &str = "KEK.auth";
/// Auto-enrollment signature database.
pub const SIGNATURE_KEY_ASSET: &str = "db.auth";

/// Overlay artifacts, relative to the overlay extraction root.
pub const OVERLAY_ARTIFACTS_PATH: &str = "overlay/artifacts";
/// Overlay installers, relative to the overlay extraction root.
pub const OVERLAY_INSTALLERS_PATH: &str = "overlay/installers";
/// Where the selected overlay installer lives inside an installer image.
pub const OVERLAY_INSTALLER_DEFAULT_PATH: &str = "overlay/installers/default";
/// The serialized overlay extra options.
pub const OVERLAY_EXTRA_OPTIONS_PATH: &str = "overlay/extra-options";

/// SELinux label of the machine configuration in the state partition.
pub const STATE_SELINUX_LABEL: &str = "system_u:object_r:system_state_t:s0";

/// Path of an installed asset, without the leading `/`.
pub fn asset_path(arch: &str, name: &str) -> String {
    format!("usr/install/{arch}/{name}")
}

/// Kernel file name.
pub const KERNEL_ASSET: &str = "vmlinuz";
/// Initramfs file name.
pub const INITRAMFS_ASSET: &str = "initramfs.xz";
/// UKI file name.
pub const UKI_ASSET: &str = "vmlinuz.efi";
/// systemd-stub file name.
pub const SD_STUB_ASSET: &str = "systemd-stub.efi";
/// systemd-boot file name.
pub const SD_BOOT_ASSET: &str = "systemd-boot.efi";
