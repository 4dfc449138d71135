//! Built-in profiles, one per platform and common artifact.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use super::{DiskFormat, ImageOptions, Output, OutFormat, OutputKind, Profile};
use crate::constants::{DEFAULT_RAW_DISK_SIZE, MIN_RAW_DISK_SIZE};
use crate::platforms::BOARDS;

const GIB: u64 = 1024 * 1024 * 1024;

fn profile(platform: &str, secure_boot: bool, output: Output) -> Profile {
    Profile {
        platform: platform.to_owned(),
        secure_boot: Some(secure_boot),
        output,
        ..Default::default()
    }
}

fn simple(kind: OutputKind, out_format: OutFormat) -> Output {
    Output {
        kind: Some(kind),
        out_format: Some(out_format),
        ..Default::default()
    }
}

fn image(disk_size: u64, format: DiskFormat, options: &str, out_format: OutFormat) -> Output {
    Output {
        kind: Some(OutputKind::Image),
        image_options: Some(ImageOptions {
            disk_size,
            disk_format: Some(format),
            disk_format_options: options.to_owned(),
            bootloader: None,
        }),
        out_format: Some(out_format),
        ..Default::default()
    }
}

fn build() -> BTreeMap<&'static str, Profile> {
    use DiskFormat::*;
    use OutFormat as F;

    let mut m = BTreeMap::new();
    for (iso, metal, installer, sb) in [
        ("iso", "metal", "installer", false),
        ("secureboot-iso", "secureboot-metal", "secureboot-installer", true),
    ] {
        m.insert(iso, profile("metal", sb, simple(OutputKind::Iso, F::Raw)));
        m.insert(
            metal,
            profile("metal", sb, image(MIN_RAW_DISK_SIZE, Raw, "", F::Xz)),
        );
        m.insert(
            installer,
            profile("metal", sb, simple(OutputKind::Installer, F::Raw)),
        );
    }
    // A UKI is always signed; the plain preset only builds once the
    // profile layered over it enables SecureBoot.
    m.insert("metal-uki", profile("metal", false, simple(OutputKind::Uki, F::Raw)));
    m.insert(
        "secureboot-metal-uki",
        profile("metal", true, simple(OutputKind::Uki, F::Raw)),
    );

    let clouds: [(&'static str, u64, DiskFormat, &str, OutFormat); 14] = [
        ("akamai", DEFAULT_RAW_DISK_SIZE, Raw, "", F::Gz),
        ("aws", DEFAULT_RAW_DISK_SIZE, Raw, "", F::Xz),
        ("azure", DEFAULT_RAW_DISK_SIZE, Vpc, "subformat=fixed,force_size", F::Xz),
        ("digital-ocean", DEFAULT_RAW_DISK_SIZE, Raw, "", F::Gz),
        ("exoscale", 10 * GIB, Qcow2, "cluster_size=8k", F::Xz),
        ("gcp", DEFAULT_RAW_DISK_SIZE, Raw, "", F::Tar),
        ("hcloud", MIN_RAW_DISK_SIZE, Raw, "", F::Xz),
        ("nocloud", MIN_RAW_DISK_SIZE, Raw, "", F::Xz),
        ("openstack", MIN_RAW_DISK_SIZE, Raw, "", F::Xz),
        ("oracle", DEFAULT_RAW_DISK_SIZE, Qcow2, "cluster_size=8k", F::Xz),
        ("scaleway", MIN_RAW_DISK_SIZE, Raw, "", F::Xz),
        ("upcloud", DEFAULT_RAW_DISK_SIZE, Raw, "", F::Xz),
        ("vultr", DEFAULT_RAW_DISK_SIZE, Raw, "", F::Xz),
        ("vmware", DEFAULT_RAW_DISK_SIZE, Ova, "", F::Raw),
    ];
    for (platform, size, format, options, out) in clouds {
        m.insert(platform, profile(platform, false, image(size, format, options, out)));
    }

    for board in BOARDS {
        let mut p = profile("metal", false, image(MIN_RAW_DISK_SIZE, Raw, "", F::Xz));
        p.arch = "arm64".into();
        p.board = (*board).to_owned();
        m.insert(*board, p);
    }
    m
}

static BUILTIN: OnceLock<BTreeMap<&'static str, Profile>> = OnceLock::new();

fn table() -> &'static BTreeMap<&'static str, Profile> {
    BUILTIN.get_or_init(build)
}

/// A copy of the built-in profile called `name`.
pub fn get(name: &str) -> Option<Profile> {
    table().get(name).cloned()
}

/// Names of every built-in profile, sorted.
pub fn names() -> impl Iterator<Item = &'static str> {
    table().keys().copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::merge::Merge;

    #[test]
    fn test_known() {
        let names: Vec<_> = names().collect();
        for n in ["iso", "secureboot-iso", "metal", "metal-uki", "secureboot-metal-uki", "aws", "vmware", "rpi_generic"] {
            assert!(names.contains(&n), "{n}");
        }
        assert!(get("nope").is_none());

        let azure = get("azure").unwrap();
        let opts = azure.output.image_options.unwrap();
        assert_eq!(opts.disk_format, Some(DiskFormat::Vpc));
        assert_eq!(opts.disk_format_options, "subformat=fixed,force_size");

        let rpi = get("rpi_generic").unwrap();
        assert_eq!((rpi.arch.as_str(), rpi.board.as_str()), ("arm64", "rpi_generic"));

        assert_eq!(get("secureboot-installer").unwrap().secure_boot, Some(true));
    }

    #[test]
    fn test_every_builtin_well_formed() {
        for name in names() {
            let p = get(name).unwrap();
            assert!(!p.platform.is_empty(), "{name}");
            assert!(p.secure_boot.is_some(), "{name}");
            let kind = p.output.kind.unwrap();
            if kind == OutputKind::Image {
                assert!(p.output.image_options.as_ref().unwrap().disk_size >= MIN_RAW_DISK_SIZE);
            }
        }
    }

    #[test]
    fn test_merge_empty_is_identity() {
        for name in names() {
            let mut p = get(name).unwrap();
            p.merge(Profile::default());
            assert_eq!(p, get(name).unwrap(), "{name}");
        }
    }
}
