//! Behavior that depends on the version of the OS being imaged.

use std::sync::OnceLock;

use regex::Regex;

/// A `major.minor.patch` triple; pre-release and build suffixes are
/// ignored.
type Triple = (u64, u64, u64);

/// Version-dependent switches. An unparseable version is treated as the
/// latest release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Quirks {
    v: Option<Triple>,
}

fn parse(version: &str) -> Option<Triple> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = REGEX.get_or_init(|| Regex::new(r"^v?(\d+)\.(\d+)(?:\.(\d+))?").unwrap());
    let caps = regex.captures(version.trim())?;
    let num = |i: usize| -> Option<u64> {
        caps.get(i).map_or(Some(0), |m| m.as_str().parse().ok())
    };
    Some((num(1)?, num(2)?, num(3)?))
}

impl Quirks {
    /// Quirks for `version` (e.g. `v1.8.0-alpha.1`).
    pub fn new(version: &str) -> Self {
        Self { v: parse(version) }
    }

    /// `true` when the version is at least `min`; `latest` when unknown.
    fn at_least(&self, min: Triple, latest: bool) -> bool {
        self.v.map_or(latest, |v| v >= min)
    }

    /// The parsed version, if any.
    pub fn version(&self) -> Option<(u64, u64, u64)> {
        self.v
    }

    /// The GRUB menu has a reset entry.
    pub fn supports_reset_grub_option(&self) -> bool {
        self.at_least((1, 4, 0), true)
    }

    /// UKIs can be built.
    pub fn supports_uki(&self) -> bool {
        self.at_least((1, 5, 0), true)
    }

    /// META may be passed compressed in the environment.
    pub fn supports_compressed_encoded_meta(&self) -> bool {
        self.at_least((1, 6, 3), true)
    }

    /// Overlays are supported.
    pub fn supports_overlay(&self) -> bool {
        self.at_least((1, 7, 0), true)
    }

    /// Initramfs extension archives use zstd instead of xz.
    pub fn use_zstd_compression(&self) -> bool {
        self.at_least((1, 8, 0), true)
    }

    /// ISOs carry a volume label.
    pub fn supports_iso_label(&self) -> bool {
        self.at_least((1, 8, 0), true)
    }

    /// The metal platform still wants `console=ttyS0` on amd64.
    pub fn supports_metal_platform_console_ttys0(&self) -> bool {
        self.v.is_some_and(|v| v < (1, 8, 0))
    }

    /// `selinux=1` is part of the default arguments.
    pub fn supports_selinux(&self) -> bool {
        self.at_least((1, 10, 0), true)
    }

    /// UEFI boots through systemd-boot only.
    pub fn use_sd_boot_for_uefi(&self) -> bool {
        self.at_least((1, 10, 0), false)
    }

    /// IMA arguments are part of the default arguments.
    pub fn supports_ima(&self) -> bool {
        self.v.is_some_and(|v| v < (1, 11, 0))
    }
}
