//! Assembling the kernel command line of a profile.

use anyhow::Result;
use fn_error_context::context;

use crate::constants::{KERNEL_PARAM_BOARD, KERNEL_PARAM_ENVIRONMENT, KERNEL_PARAM_PLATFORM, META_VALUES_ENV_VAR};
use crate::kernel_cmdline::{AppendOptions, Cmdline};
use crate::platforms::{board_kernel_args, platform_kernel_args};
use crate::profile::{OutputKind, Profile};

const DEFAULT_ARGS: &[&str] = &[
    "console=tty0",
    "init_on_alloc=1",
    "slab_nomerge",
    "pti=on",
    "consoleblank=0",
    "nvme_core.io_timeout=4294967295",
    "printk.devkmsg=on",
];

const IMA_ARGS: &[&str] = &["ima_template=ima-ng", "ima_appraise=fix", "ima_hash=sha512"];

const SELINUX_ARGS: &[&str] = &["selinux=1"];

const SECUREBOOT_ARGS: &[&str] = &["lockdown=confidentiality"];

/// The kernel arguments every artifact of `profile` boots with.
fn default_args(profile: &Profile) -> Vec<&'static str> {
    let quirks = profile.quirks();
    let mut r = DEFAULT_ARGS.to_vec();
    if quirks.supports_ima() {
        r.extend_from_slice(IMA_ARGS);
    }
    if quirks.supports_selinux() {
        r.extend_from_slice(SELINUX_ARGS);
    }
    r
}

/// Build the command line: platform, board or overlay, defaults,
/// SecureBoot lockdown, META, then the user's extra arguments.
#[context("Assembling kernel command line")]
pub fn build(profile: &Profile, overlay_args: &[String]) -> Result<Cmdline> {
    let mut cmdline = Cmdline::default();

    cmdline.append(KERNEL_PARAM_PLATFORM, &profile.platform);
    cmdline.set_all(&platform_kernel_args(
        &profile.platform,
        &profile.arch,
        &profile.quirks(),
    ));

    if !profile.board.is_empty() {
        cmdline.append(KERNEL_PARAM_BOARD, &profile.board);
        cmdline.set_all(&board_kernel_args(&profile.board)?);
    } else if !overlay_args.is_empty() {
        cmdline.set_all(overlay_args);
    }

    let plain = AppendOptions::default();
    cmdline.append_all(&default_args(profile), &plain);

    if profile.secure_boot_enabled() {
        cmdline.append_all(SECUREBOOT_ARGS, &plain);
    }

    // Images get META written directly; everything else hands it to the
    // installer through the environment.
    let meta = &profile.customization.meta_contents;
    if !meta.is_empty() && profile.output.kind != Some(OutputKind::Image) {
        let encoded = crate::meta::encode(meta, profile.quirks().supports_compressed_encoded_meta())?;
        cmdline.append(
            KERNEL_PARAM_ENVIRONMENT,
            &format!("{META_VALUES_ENV_VAR}={encoded}"),
        );
    }

    let custom = AppendOptions::default()
        .overwrite_args("console")
        .overwrite_args(KERNEL_PARAM_PLATFORM)
        .delete_negated_args();
    cmdline.append_all(&profile.customization.extra_kernel_args, &custom);

    Ok(cmdline)
}
