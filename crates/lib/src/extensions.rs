//! Rebuilding the initramfs with system extensions.
//!
//! Extensions are container images whose `rootfs/` is overlaid onto the
//! booted system. Each is pulled into `<tempdir>/extensions/<index>`; a
//! machine configuration to embed becomes one more, synthetic, extension.
//! An [`InitramfsRebuilder`] then folds the trees into a copy of the
//! initramfs.

use std::fs::OpenOptions;
use std::io::{BufReader, BufWriter, Write};
use std::process::Command;

use anyhow::{Context, Result};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use imager_oci_ext::archiver::{untar, UntarOptions};
use imager_oci_ext::registry::{self, Registry};
use imager_utils::{AsyncCommandRunExt, CommandRunExt};

use crate::constants::STATE_SELINUX_LABEL;
use crate::profile::Profile;

/// Manifest schema version of extensions.
pub const MANIFEST_VERSION: &str = "v1alpha1";

/// Name of the synthetic extension holding the machine configuration.
pub const EMBEDDED_CONFIG_NAME: &str = "embedded-config";

const EMBEDDED_CONFIG_DIRS: &[&str] = &[
    "rootfs",
    "rootfs/usr",
    "rootfs/usr/local",
    "rootfs/usr/local/etc",
    "rootfs/usr/local/etc/talos",
];
const EMBEDDED_CONFIG_PATH: &str = "rootfs/usr/local/etc/talos/config.yaml";
const SELINUX_XATTR: &str = "SCHILY.xattr.security.selinux";

/// The embedded config tree keeps its SELinux label on disk for mksquashfs.
const EMBEDDED_CONFIG_UNTAR: UntarOptions = UntarOptions {
    layer: false,
    xattrs: true,
};

/// An extension's `manifest.yaml`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Manifest {
    /// Schema version.
    pub version: String,
    /// What the extension is.
    pub metadata: Metadata,
}

/// Identity of an extension.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Metadata {
    /// Extension name.
    pub name: String,
    /// Extension version.
    pub version: String,
    /// Who built it.
    pub author: String,
    /// Free form description.
    pub description: String,
    /// Which OS versions it works with.
    pub compatibility: Compatibility,
}

/// Version constraints of an extension.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Compatibility {
    /// Constraint on the OS version.
    pub talos: VersionConstraint,
}

/// A version constraint such as `>= 1.0.0`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct VersionConstraint {
    /// The constraint expression.
    pub version: String,
}

impl Manifest {
    /// Read `<dir>/manifest.yaml`.
    #[context("Reading manifest of {dir}")]
    pub fn load(dir: &Utf8Path) -> Result<Self> {
        let f = std::fs::File::open(dir.join("manifest.yaml"))?;
        Ok(serde_yaml::from_reader(BufReader::new(f))?)
    }
}

fn embedded_config_manifest(config: &[u8]) -> Manifest {
    Manifest {
        version: MANIFEST_VERSION.to_owned(),
        metadata: Metadata {
            name: EMBEDDED_CONFIG_NAME.to_owned(),
            version: hex::encode(Sha256::digest(config)),
            author: "Imager".to_owned(),
            description: "Virtual extension which embeds the machine configuration.".to_owned(),
            compatibility: Compatibility {
                talos: VersionConstraint {
                    version: ">= 1.0.0".to_owned(),
                },
            },
        },
    }
}

fn header(entry_type: tar::EntryType, mode: u32, size: u64) -> tar::Header {
    let mut h = tar::Header::new_ustar();
    h.set_entry_type(entry_type);
    h.set_mode(mode);
    h.set_size(size);
    h.set_mtime(0);
    h.set_uid(0);
    h.set_gid(0);
    h
}

/// Build the extension tarball carrying `config` as the machine
/// configuration.
///
/// The configuration is unreadable (mode 0) and labelled for the state
/// partition through a PAX xattr record.
#[context("Building embedded configuration extension")]
pub fn embedded_config_tar(config: &[u8]) -> Result<Vec<u8>> {
    let manifest = serde_yaml::to_string(&embedded_config_manifest(config))?;
    let mut b = tar::Builder::new(Vec::new());
    let mut h = header(tar::EntryType::Regular, 0o644, manifest.len() as u64);
    b.append_data(&mut h, "manifest.yaml", manifest.as_bytes())?;
    for dir in EMBEDDED_CONFIG_DIRS {
        let mut h = header(tar::EntryType::Directory, 0o755, 0);
        b.append_data(&mut h, dir, std::io::empty())?;
    }
    b.append_pax_extensions([(SELINUX_XATTR, STATE_SELINUX_LABEL.as_bytes())])?;
    let mut h = header(tar::EntryType::Regular, 0, config.len() as u64);
    b.append_data(&mut h, EMBEDDED_CONFIG_PATH, config)?;
    Ok(b.into_inner()?)
}

/// Drop every extension whose manifest name and version were already
/// seen. Trees without a readable manifest are kept.
pub fn dedup(trees: Vec<Utf8PathBuf>) -> Vec<Utf8PathBuf> {
    let mut seen = std::collections::HashSet::new();
    trees
        .into_iter()
        .filter(|dir| match Manifest::load(dir) {
            Ok(m) => {
                let fresh = seen.insert((m.metadata.name.clone(), m.metadata.version.clone()));
                if !fresh {
                    tracing::debug!(
                        "Skipping duplicate extension {} {} in {dir}",
                        m.metadata.name,
                        m.metadata.version
                    );
                }
                fresh
            }
            Err(_) => true,
        })
        .collect()
}

/// What an [`InitramfsRebuilder`] works on.
#[derive(Debug, Clone)]
pub struct RebuildRequest {
    /// The initramfs to extend, modified in place.
    pub initramfs: Utf8PathBuf,
    /// Extracted extension trees, in overlay order.
    pub extensions: Vec<Utf8PathBuf>,
    /// Target architecture.
    pub arch: String,
    /// Scratch space owned by the rebuilder.
    pub scratch_dir: Utf8PathBuf,
    /// Compress with zstd rather than xz.
    pub zstd: bool,
}

/// Folds extension trees into an initramfs.
#[async_trait]
pub trait InitramfsRebuilder: std::fmt::Debug + Send + Sync {
    /// Extend `req.initramfs` with `req.extensions`.
    async fn rebuild(&self, req: &RebuildRequest, cancel: &CancellationToken) -> Result<()>;
}

/// Entry of `extensions.yaml`.
#[derive(Serialize, Debug)]
struct LayerEntry {
    image: String,
    metadata: Metadata,
}

#[derive(Serialize, Debug)]
struct ExtensionsConfig {
    layers: Vec<LayerEntry>,
}

/// Builds one squashfs image per extension with `mksquashfs`, then appends
/// a compressed `cpio` archive holding them and `extensions.yaml` to the
/// initramfs.
#[derive(Debug, Default)]
pub struct CommandRebuilder;

impl CommandRebuilder {
    /// Write `extensions.yaml` describing `images` into `dir`.
    fn write_config(dir: &Utf8Path, images: &[(String, Metadata)]) -> Result<()> {
        let config = ExtensionsConfig {
            layers: images
                .iter()
                .map(|(image, metadata)| LayerEntry {
                    image: image.clone(),
                    metadata: metadata.clone(),
                })
                .collect(),
        };
        std::fs::write(dir.join("extensions.yaml"), serde_yaml::to_string(&config)?)?;
        Ok(())
    }

    /// Archive `files` (relative to `dir`) as newc cpio into `out`.
    #[context("Creating cpio archive")]
    fn cpio(dir: &Utf8Path, files: &[String], out: &Utf8Path) -> Result<()> {
        let list = dir.join(".cpio-list");
        std::fs::write(&list, files.join("\n") + "\n")?;
        Command::new("cpio")
            .args(["--create", "--format=newc", "--reproducible", "--owner=0:0", "-O"])
            .arg(out)
            .current_dir(dir)
            .stdin(std::fs::File::open(&list)?)
            .log_debug()
            .run_capture_stderr()?;
        std::fs::remove_file(&list)?;
        Ok(())
    }
}

/// Compress `src` and append the result to `dest`.
#[context("Appending {src} to {dest}")]
fn compress_append(src: &Utf8Path, dest: &Utf8Path, zstd: bool) -> Result<()> {
    let mut input = BufReader::new(std::fs::File::open(src)?);
    let out = OpenOptions::new().append(true).open(dest)?;
    let mut out = BufWriter::new(out);
    if zstd {
        zstd::stream::copy_encode(&mut input, &mut out, 19)?;
    } else {
        // The kernel only understands the CRC32 check.
        let stream = xz2::stream::Stream::new_easy_encoder(9, xz2::stream::Check::Crc32)?;
        let mut enc = xz2::write::XzEncoder::new_stream(&mut out, stream);
        std::io::copy(&mut input, &mut enc)?;
        enc.finish()?;
    }
    out.flush()?;
    out.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    Ok(())
}

#[async_trait]
impl InitramfsRebuilder for CommandRebuilder {
    #[instrument(level = "debug", skip_all, fields(initramfs = %req.initramfs))]
    async fn rebuild(&self, req: &RebuildRequest, cancel: &CancellationToken) -> Result<()> {
        let root = req.scratch_dir.join("initramfs-ext");
        let images_dir = root.join("extensions");
        tokio::fs::create_dir_all(&images_dir).await?;

        let mut images = Vec::with_capacity(req.extensions.len());
        let mut files = vec!["extensions".to_owned()];
        for (i, tree) in req.extensions.iter().enumerate() {
            let manifest = Manifest::load(tree)?;
            let image = format!("{i:03}.{}.sqsh", manifest.metadata.name);
            tokio::process::Command::new("mksquashfs")
                .arg(tree.join("rootfs"))
                .arg(images_dir.join(&image))
                .args(["-all-root", "-noappend", "-no-progress", "-comp", "xz", "-Xdict-size", "100%"])
                .run_cancellable(cancel)
                .await
                .with_context(|| format!("Building squashfs for {}", manifest.metadata.name))?;
            files.push(format!("extensions/{image}"));
            images.push((image, manifest.metadata));
        }
        Self::write_config(&root, &images)?;
        files.push("extensions.yaml".to_owned());

        imager_oci_ext::check_cancelled(cancel)?;
        let cpio = req.scratch_dir.join("extensions.cpio");
        let (root_c, cpio_c, initramfs, zstd) =
            (root.clone(), cpio.clone(), req.initramfs.clone(), req.zstd);
        tokio::task::spawn_blocking(move || -> Result<()> {
            Self::cpio(&root_c, &files, &cpio_c)?;
            compress_append(&cpio_c, &initramfs, zstd)
        })
        .await??;
        Ok(())
    }
}

/// Produce the initramfs the rest of the build uses.
///
/// Without extensions or an embedded configuration this is the input
/// unchanged; otherwise a rebuilt copy under `tempdir`.
#[instrument(level = "debug", skip_all)]
pub async fn build_initramfs(
    registry: &dyn Registry,
    rebuilder: &dyn InitramfsRebuilder,
    profile: &Profile,
    tempdir: &Utf8Path,
    cancel: &CancellationToken,
) -> Result<Utf8PathBuf> {
    let extensions = &profile.input.system_extensions;
    let embedded = &profile.customization.embedded_machine_configuration;
    if extensions.is_empty() && embedded.is_empty() {
        return Ok(profile.input.initramfs.path.clone());
    }

    let initramfs = tempdir.join("initramfs.xz");
    tokio::fs::copy(&profile.input.initramfs.path, &initramfs)
        .await
        .with_context(|| format!("Copying {}", profile.input.initramfs.path))?;

    let checkout = tempdir.join("extensions");
    let arch = profile.arch.as_str();
    let pulls = extensions.iter().enumerate().map(|(j, ext)| {
        let dest = checkout.join(j.to_string());
        async move {
            let source = ext
                .source()
                .with_context(|| format!("System extension {j} has no source"))?;
            let image = registry.pull(&source, arch).await?;
            registry::extract(registry, &image, dest.as_std_path(), cancel).await?;
            anyhow::Ok(dest)
        }
    });
    let mut trees = futures_util::future::try_join_all(pulls).await?;

    if !embedded.is_empty() {
        let dest = checkout.join(trees.len().to_string());
        let tar = embedded_config_tar(embedded.as_bytes())?;
        untar(tar.as_slice(), dest.as_std_path(), EMBEDDED_CONFIG_UNTAR)?;
        trees.push(dest);
    }

    let req = RebuildRequest {
        initramfs: initramfs.clone(),
        extensions: dedup(trees),
        arch: profile.arch.clone(),
        scratch_dir: tempdir.join("rebuild"),
        zstd: profile.quirks().use_zstd_compression(),
    };
    tokio::fs::create_dir_all(&req.scratch_dir).await?;
    rebuilder.rebuild(&req, cancel).await?;
    Ok(initramfs)
}
