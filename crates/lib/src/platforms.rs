//! Static kernel arguments of platforms and single-board computers.

use anyhow::Result;

use crate::quirks::Quirks;

const AMD64: &str = "amd64";

/// Kernel arguments a platform needs to boot, e.g. its serial console.
///
/// Unknown platforms need nothing beyond the defaults.
pub fn platform_kernel_args(platform: &str, arch: &str, quirks: &Quirks) -> Vec<&'static str> {
    match platform {
        "metal" if arch == AMD64 => {
            if quirks.supports_metal_platform_console_ttys0() {
                vec!["console=ttyS0", "console=tty0"]
            } else {
                vec!["console=tty0"]
            }
        }
        "metal" => vec!["console=ttyAMA0", "console=tty0"],
        "aws" | "hcloud" | "oracle" | "scaleway" | "upcloud" | "vultr" | "akamai" => {
            vec!["console=tty1", "console=ttyS0", "net.ifnames=0"]
        }
        "azure" => vec![
            "console=ttyS0,115200n8",
            "earlyprintk=ttyS0,115200",
            "rootdelay=300",
            "net.ifnames=0",
            "talos.dashboard.disabled=1",
            "sysctl.kernel.kexec_load_disabled=1",
        ],
        "digital-ocean" => vec![
            "console=ttyS0",
            "console=tty0",
            "console=tty1",
            "net.ifnames=0",
        ],
        "equinixMetal" => vec!["console=ttyS1,115200n8"],
        "exoscale" => vec!["console=tty0", "console=ttyS0"],
        "gcp" => vec!["console=ttyS0", "net.ifnames=0"],
        "nocloud" => vec!["console=tty1", "console=ttyS0"],
        "openstack" | "opennebula" => vec!["console=tty1", "console=ttyS0", "net.ifnames=0"],
        "vmware" => vec!["console=tty0", "earlyprintk=ttyS0,115200"],
        _ => Vec::new(),
    }
}

/// Every single-board computer with built-in kernel arguments.
pub const BOARDS: &[&str] = &[
    "rpi_generic",
    "rock64",
    "bananapi_m64",
    "libretech_all_h3_cc_h5",
    "rockpi_4",
    "rockpi_4c",
    "pine64",
    "jetson_nano",
    "nanopi_r4s",
];

/// Kernel arguments a board needs to boot.
pub fn board_kernel_args(board: &str) -> Result<Vec<&'static str>> {
    let r = match board {
        "rpi_generic" => vec!["console=tty0", "console=ttyAMA0,115200"],
        "rock64" | "rockpi_4" | "rockpi_4c" | "nanopi_r4s" => {
            vec!["console=tty0", "console=ttyS2,1500000n8"]
        }
        "bananapi_m64" | "libretech_all_h3_cc_h5" | "pine64" => {
            vec!["console=tty0", "console=ttyS0,115200"]
        }
        "jetson_nano" => vec![
            "console=tty0",
            "console=ttyS0,115200",
            "talos.dashboard.disabled=1",
            "sysctl.kernel.kexec_load_disabled=1",
        ],
        o => anyhow::bail!("unknown board: {o}"),
    };
    Ok(r)
}
