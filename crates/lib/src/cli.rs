//! # Imager command line
//!
//! Command line tool to build boot assets from a profile.

use std::ffi::OsString;
use std::io::{Read, Write};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use fn_error_context::context;
use tokio_util::sync::CancellationToken;

use imager_blockdev::{parse_size, run_loopback_cleanup_helper, CLEANUP_HELPER_FLAG};
use imager_oci_ext::archiver::tar_gz_dir;

use crate::constants::MIN_RAW_DISK_SIZE;
use crate::imager::{Capabilities, Imager};
use crate::meta::MetaValue;
use crate::profile::{ContainerAsset, OutputKind, OverlayOptions, Profile};
use crate::reporter::{ConsoleReporter, Reporter, Status, Update};

/// Build boot assets from a profile.
#[derive(Debug, Parser)]
#[clap(name = "imager", disable_version_flag = true)]
pub(crate) struct Opt {
    /// A built-in profile name, or `-` to read a YAML profile from stdin.
    profile: String,

    /// The platform to build for.
    #[clap(long)]
    platform: Option<String>,

    /// The architecture to build for; defaults to the host's.
    #[clap(long)]
    arch: Option<String>,

    /// The board to build for (metal arm64 only).
    #[clap(long, conflicts_with_all = ["overlay_name", "overlay_image"])]
    board: Option<String>,

    /// The installer image to add boot assets to.
    #[clap(long)]
    base_installer_image: Option<String>,

    /// Disk image size, such as `6GiB`.
    #[clap(long, value_parser = parse_disk_size)]
    image_disk_size: Option<u64>,

    /// Extra kernel argument; may be repeated.
    #[clap(long)]
    extra_kernel_arg: Vec<String>,

    /// META value as `key=value`; may be repeated.
    #[clap(long, value_parser = parse_meta)]
    meta: Vec<MetaValue>,

    /// System extension image; may be repeated.
    #[clap(long)]
    system_extension_image: Vec<String>,

    /// Directory to write the artifact to.
    #[clap(long, default_value = "/out")]
    output: Utf8PathBuf,

    /// Override the profile's output kind.
    #[clap(long, value_enum)]
    output_kind: Option<OutputKind>,

    /// After a successful build, write a gzip tarball of the output
    /// directory to stdout.
    #[clap(long)]
    tar_to_stdout: bool,

    /// Name of the overlay installer.
    #[clap(long, requires = "overlay_image")]
    overlay_name: Option<String>,

    /// The overlay image.
    #[clap(long, requires = "overlay_name")]
    overlay_image: Option<String>,

    /// Overlay option as `key=value`, the value parsed as YAML; may be
    /// repeated.
    #[clap(long = "overlay-option", value_parser = parse_key_value)]
    overlay_options: Vec<(String, String)>,

    /// A machine configuration to embed in the initramfs.
    #[clap(long)]
    embedded_config_path: Option<Utf8PathBuf>,

    /// Allow plain HTTP and unverified TLS for the images named on the
    /// command line.
    #[clap(long)]
    insecure: bool,

    /// The Talos version the assets are for.
    #[clap(long)]
    version: Option<String>,
}

fn parse_disk_size(s: &str) -> Result<u64> {
    let size = parse_size(s)?;
    anyhow::ensure!(
        size >= MIN_RAW_DISK_SIZE,
        "disk size {size} is below the minimum of {MIN_RAW_DISK_SIZE} bytes"
    );
    Ok(size)
}

fn parse_meta(s: &str) -> Result<MetaValue> {
    s.parse()
}

fn parse_key_value(s: &str) -> Result<(String, String)> {
    let (k, v) = s
        .split_once('=')
        .with_context(|| format!("Invalid option {s:?}, expected key=value"))?;
    Ok((k.to_owned(), v.to_owned()))
}

/// The host architecture in the names profiles use.
fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        o => o,
    }
}

impl Opt {
    /// Load the profile named on the command line (reading `stdin` for
    /// `-`) and apply the flags on top of it.
    #[context("Loading profile")]
    fn load_profile(&self, mut stdin: impl Read) -> Result<Profile> {
        let profile = if self.profile == "-" {
            let mut buf = String::new();
            stdin.read_to_string(&mut buf).context("Reading stdin")?;
            Profile::from_yaml(&buf)?
        } else {
            Profile {
                base_profile_name: self.profile.clone(),
                ..Default::default()
            }
        };
        let mut p = profile.resolve_base()?;

        if let Some(platform) = &self.platform {
            p.platform = platform.clone();
        }
        match &self.arch {
            Some(arch) => p.arch = arch.clone(),
            None if p.arch.is_empty() => p.arch = host_arch().to_owned(),
            None => {}
        }
        if let Some(board) = &self.board {
            p.board = board.clone();
        }
        if let Some(version) = &self.version {
            p.version = version.clone();
        }
        if let Some(image) = &self.base_installer_image {
            p.input.base_installer = ContainerAsset::registry(image.as_str(), self.insecure);
        }
        if let Some(size) = self.image_disk_size {
            p.output.image_options.get_or_insert_with(Default::default).disk_size = size;
        }
        if let Some(kind) = self.output_kind {
            p.output.kind = Some(kind);
        }
        p.customization
            .extra_kernel_args
            .extend(self.extra_kernel_arg.iter().cloned());
        p.customization.meta_contents.extend(self.meta.iter().cloned());
        p.input.system_extensions.extend(
            self.system_extension_image
                .iter()
                .map(|i| ContainerAsset::registry(i.as_str(), self.insecure)),
        );
        if let (Some(name), Some(image)) = (&self.overlay_name, &self.overlay_image) {
            let mut options = std::collections::BTreeMap::new();
            for (k, v) in &self.overlay_options {
                let v = serde_yaml::from_str(v)
                    .with_context(|| format!("Parsing overlay option {k}"))?;
                options.insert(k.clone(), v);
            }
            p.overlay = Some(OverlayOptions {
                name: name.clone(),
                image: ContainerAsset::registry(image.as_str(), self.insecure),
                options,
            });
        }
        if let Some(path) = &self.embedded_config_path {
            p.customization.embedded_machine_configuration =
                std::fs::read_to_string(path).with_context(|| format!("Reading {path}"))?;
        }
        Ok(p)
    }
}

/// Gzip-tar `dir` to stdout.
async fn tar_to_stdout(dir: &Utf8Path, cancel: &CancellationToken) -> Result<()> {
    let dir = dir.to_owned();
    let cancel = cancel.clone();
    tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout().lock();
        let mut w = tar_gz_dir(dir.as_std_path(), stdout, &cancel)?;
        w.flush()?;
        anyhow::Ok(())
    })
    .await?
}

/// Cancel `token` on SIGINT.
async fn cancel_on_interrupt(token: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::warn!("Interrupted, cancelling");
        token.cancel();
    }
}

async fn run(opt: Opt, reporter: &dyn Reporter) -> Result<()> {
    let report = |e: &anyhow::Error| reporter.report(Update::new(format!("{e:#}"), Status::Error));
    let imager = opt
        .load_profile(std::io::stdin().lock())
        .and_then(|p| Imager::new(p, Capabilities::command_backed()))
        .inspect_err(report)?;

    let cancel = CancellationToken::new();
    let _interrupt = tokio::spawn(cancel_on_interrupt(cancel.clone()));
    // Reports its own failure.
    let artifact = imager.execute(&opt.output, reporter, &cancel).await?;
    tracing::debug!("Wrote {artifact}");

    if opt.tar_to_stdout {
        tar_to_stdout(&opt.output, &cancel).await.inspect_err(report)?;
    }
    Ok(())
}

/// Parse the provided arguments and build. Every failure has been
/// reported as a [`Status::Error`] update by the time it is returned.
pub async fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
    if let [_, flag, device] = args.as_slice() {
        if flag == CLEANUP_HELPER_FLAG {
            let device = device.to_str().context("Non UTF-8 device path")?;
            return run_loopback_cleanup_helper(device).await;
        }
    }
    let opt = Opt::parse_from(args);
    run(opt, &ConsoleReporter::default()).await
}
