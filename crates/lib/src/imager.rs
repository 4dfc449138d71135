//! The build pipeline: resolve and validate a profile once, then run the
//! stages for its output kind in a private temporary directory.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use imager_oci_ext::compress;
use imager_oci_ext::registry::{Registry, SkopeoRegistry};
use imager_utils::ResultExt;

use crate::cmdline;
use crate::constants::VERSION_TAG;
use crate::error::{cancelled, in_stage, Stage};
use crate::extensions::{self, CommandRebuilder, InitramfsRebuilder};
use crate::image::{self, DiskAttach, ImageInputs, ImageTools, LosetupAttach};
use crate::install::{BootAssets, CommandInstaller, Installer};
use crate::installer_image;
use crate::iso::{self, CommandIso, EnrollmentKeys, GrubOptions, IsoCreator, UefiOptions};
use crate::kernel_cmdline::Cmdline;
use crate::overlay::{self, PreparedOverlay};
use crate::profile::{OutFormat, OutputKind, Profile};
use crate::qemuimg::{Converter, QemuImg};
use crate::reporter::{Reporter, Status, Update};
use crate::uki::{UkiBuilder, UkiOptions, UkifyBuilder};

/// The external collaborators a build drives.
#[derive(Debug, Clone)]
pub struct Capabilities {
    /// Pulls container images.
    pub registry: Arc<dyn Registry>,
    /// Adds system extensions to the initramfs.
    pub rebuilder: Arc<dyn InitramfsRebuilder>,
    /// Builds and signs UKIs.
    pub uki: Arc<dyn UkiBuilder>,
    /// Builds ISOs.
    pub iso: Arc<dyn IsoCreator>,
    /// Installs onto disk images.
    pub installer: Arc<dyn Installer>,
    /// Attaches disk images as block devices.
    pub attach: Arc<dyn DiskAttach>,
    /// Converts disk image formats.
    pub converter: Arc<dyn Converter>,
}

impl Capabilities {
    /// The implementations backed by external tools.
    pub fn command_backed() -> Self {
        Self {
            registry: Arc::new(SkopeoRegistry::new()),
            rebuilder: Arc::new(CommandRebuilder),
            uki: Arc::new(UkifyBuilder),
            iso: Arc::new(CommandIso),
            installer: Arc::new(CommandInstaller::default()),
            attach: Arc::new(LosetupAttach),
            converter: Arc::new(QemuImg),
        }
    }
}

/// A validated build, ready to [execute](Imager::execute).
#[derive(Debug)]
pub struct Imager {
    profile: Profile,
    caps: Capabilities,
    tempdir_root: Option<Utf8PathBuf>,
}

/// Signed boot files produced by the UKI stage.
#[derive(Debug)]
struct SignedAssets {
    uki: Utf8PathBuf,
    sd_boot: Utf8PathBuf,
}

/// State shared by the stages of one execution.
#[derive(Debug)]
struct Run<'a> {
    tempdir: &'a Utf8Path,
    reporter: &'a dyn Reporter,
    cancel: &'a CancellationToken,
}

impl Run<'_> {
    /// Run one stage: check for cancellation, report progress and tag
    /// errors with `stage`.
    async fn stage<T>(&self, stage: Stage, message: &str, f: impl Future<Output = Result<T>>) -> Result<T> {
        if self.cancel.is_cancelled() {
            return Err(cancelled(stage));
        }
        self.reporter.report(Update::new(message, Status::Running));
        let v = f.await.map_err(|e| in_stage(e, stage))?;
        self.reporter.report(Update::new(message, Status::Succeeded));
        Ok(v)
    }

    fn skip(&self, message: &str) {
        self.reporter.report(Update::new(message, Status::Skipped));
    }
}

impl Imager {
    /// Resolve the base profile, apply defaults and validate.
    pub fn new(profile: Profile, caps: Capabilities) -> Result<Self> {
        let mut profile = profile.resolve_base()?;
        if profile.version.is_empty() {
            profile.version = VERSION_TAG.to_owned();
        }
        let sb = profile.secure_boot_enabled();
        let (arch, version) = (profile.arch.clone(), profile.version.clone());
        profile.input.fill_defaults(&arch, &version, sb);
        profile.validate()?;
        Ok(Self {
            profile,
            caps,
            tempdir_root: None,
        })
    }

    /// Create temporary directories below `root` instead of `TMPDIR`.
    pub fn with_tempdir_root(mut self, root: impl Into<Utf8PathBuf>) -> Self {
        self.tempdir_root = Some(root.into());
        self
    }

    /// The resolved profile.
    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Build the artifact into `output_dir`, returning its path.
    ///
    /// A failure is reported once with [`Status::Error`] before it is
    /// returned. The temporary directory is removed either way.
    #[instrument(level = "info", skip_all, fields(platform = %self.profile.platform, arch = %self.profile.arch))]
    pub async fn execute(
        &self,
        output_dir: &Utf8Path,
        reporter: &dyn Reporter,
        cancel: &CancellationToken,
    ) -> Result<Utf8PathBuf> {
        let r = self.execute_in_tempdir(output_dir, reporter, cancel).await;
        if let Err(e) = &r {
            reporter.report(Update::new(format!("{e:#}"), Status::Error));
        }
        r
    }

    async fn execute_in_tempdir(
        &self,
        output_dir: &Utf8Path,
        reporter: &dyn Reporter,
        cancel: &CancellationToken,
    ) -> Result<Utf8PathBuf> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("imager");
        let td = match &self.tempdir_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .context("Creating temporary directory")?;
        let tempdir = Utf8Path::from_path(td.path())
            .context("Temporary directory is not UTF-8")?
            .to_owned();
        tracing::debug!("Working in {tempdir}");

        let run = Run {
            tempdir: &tempdir,
            reporter,
            cancel,
        };
        let r = self.run_stages(&run, output_dir).await;
        td.close().log_err_ok("Removing temporary directory");
        r
    }

    async fn run_stages(&self, run: &Run<'_>, output_dir: &Utf8Path) -> Result<Utf8PathBuf> {
        let p = &self.profile;
        let kind = p.kind()?;
        let sb = p.secure_boot_enabled();
        tracing::info!("Building {kind} from profile:\n{}", p.dump()?);

        let overlay = match &p.overlay {
            Some(o) => Some(
                run.stage(
                    Stage::PrepareOverlay,
                    "preparing overlay",
                    overlay::prepare(&*self.caps.registry, o, &p.arch, run.tempdir, run.cancel),
                )
                .await?,
            ),
            None => None,
        };

        let initramfs = if matches!(kind, OutputKind::Kernel | OutputKind::Cmdline) {
            run.skip("rebuilding initramfs");
            p.input.initramfs.path.clone()
        } else {
            run.stage(
                Stage::RebuildInitramfs,
                "rebuilding initramfs",
                extensions::build_initramfs(
                    &*self.caps.registry,
                    &*self.caps.rebuilder,
                    p,
                    run.tempdir,
                    run.cancel,
                ),
            )
            .await?
        };

        let overlay_args = overlay
            .as_ref()
            .map(|o| o.installer_options.kernel_args.clone())
            .unwrap_or_default();
        let cmdline = run
            .stage(Stage::BuildCmdline, "assembling kernel command line", async {
                cmdline::build(p, &overlay_args)
            })
            .await?;
        tracing::debug!("Kernel command line: {cmdline}");

        let signed = if sb
            && matches!(
                kind,
                OutputKind::Iso | OutputKind::Image | OutputKind::Installer | OutputKind::Uki
            ) {
            Some(
                run.stage(
                    Stage::BuildUki,
                    "building UKI",
                    self.build_uki(run, &initramfs, &cmdline),
                )
                .await?,
            )
        } else {
            run.skip("building UKI");
            None
        };

        let staged = run.tempdir.join(p.output_path()?);
        let emit = EmitInputs {
            initramfs: &initramfs,
            cmdline: &cmdline,
            signed: signed.as_ref(),
            overlay: overlay.as_ref(),
        };
        run.stage(
            Stage::Emit(kind),
            &format!("building {kind}"),
            self.emit(run, kind, &emit, &staged),
        )
        .await?;

        let out_format = p.output.out_format();
        let message = "post-processing output";
        let processed = if out_format == OutFormat::Raw {
            run.skip(message);
            staged
        } else {
            run.stage(Stage::PostProcess, message, post_process(staged, out_format))
                .await?
        };

        let file_name = processed
            .file_name()
            .context("Output has no file name")?
            .to_owned();
        let dest = output_dir.join(file_name);
        run.stage(Stage::WriteOutput, "writing output", async {
            let (src, dest) = (processed.clone(), dest.clone());
            tokio::task::spawn_blocking(move || copy_out(&src, &dest)).await?
        })
        .await?;
        run.reporter
            .report(Update::new(format!("output written to {dest}"), Status::Succeeded));
        Ok(dest)
    }

    async fn build_uki(&self, run: &Run<'_>, initramfs: &Utf8Path, cmdline: &Cmdline) -> Result<SignedAssets> {
        let p = &self.profile;
        let sb = p.input.secure_boot.clone().unwrap_or_default();
        let opts = UkiOptions {
            kernel: p.input.kernel.path.clone(),
            initramfs: initramfs.to_owned(),
            sd_stub: p.input.sd_stub.path.clone(),
            sd_boot: p.input.sd_boot.path.clone(),
            cmdline: cmdline.to_string(),
            signing_key: sb.secure_boot_signer.key_path,
            signing_cert: sb.secure_boot_signer.cert_path,
            pcr_signing_key: sb.pcr_signer.key_path,
            arch: p.arch.clone(),
            version: p.version.clone(),
            out_uki: run.tempdir.join("vmlinuz.efi.signed"),
            out_sd_boot: run.tempdir.join("systemd-boot.efi.signed"),
        };
        self.caps.uki.build(&opts, run.cancel).await?;
        Ok(SignedAssets {
            uki: opts.out_uki,
            sd_boot: opts.out_sd_boot,
        })
    }

    fn boot_assets(&self, inputs: &EmitInputs<'_>) -> BootAssets {
        BootAssets {
            kernel: self.profile.input.kernel.path.clone(),
            initramfs: inputs.initramfs.to_owned(),
            uki: inputs.signed.map(|s| s.uki.clone()),
            sd_boot: inputs.signed.map(|s| s.sd_boot.clone()),
        }
    }

    async fn emit(&self, run: &Run<'_>, kind: OutputKind, inputs: &EmitInputs<'_>, dest: &Utf8Path) -> Result<()> {
        let p = &self.profile;
        match kind {
            OutputKind::Kernel => copy(&p.input.kernel.path, dest).await,
            OutputKind::Initramfs => copy(inputs.initramfs, dest).await,
            OutputKind::Cmdline => {
                tokio::fs::write(dest, inputs.cmdline.to_string())
                    .await
                    .with_context(|| format!("Writing {dest}"))
            }
            OutputKind::Uki => {
                let signed = inputs.signed.context("UKI was not built")?;
                copy(&signed.uki, dest).await
            }
            OutputKind::Iso => self.emit_iso(run, inputs, dest).await,
            OutputKind::Image => {
                let tools = ImageTools {
                    attach: &*self.caps.attach,
                    installer: &*self.caps.installer,
                    converter: &*self.caps.converter,
                };
                let image_inputs = ImageInputs {
                    cmdline: inputs.cmdline,
                    boot_assets: self.boot_assets(inputs),
                    overlay: inputs.overlay,
                    tempdir: run.tempdir,
                };
                image::build(p, tools, &image_inputs, dest, run.cancel).await
            }
            OutputKind::Installer => {
                installer_image::build(
                    &*self.caps.registry,
                    p,
                    &self.boot_assets(inputs),
                    inputs.overlay,
                    run.tempdir,
                    dest,
                    run.cancel,
                )
                .await
            }
        }
    }

    async fn emit_iso(&self, run: &Run<'_>, inputs: &EmitInputs<'_>, dest: &Utf8Path) -> Result<()> {
        let p = &self.profile;
        let label = iso::label(&p.version, &p.arch);
        let scratch_dir = run.tempdir.join("iso");
        tokio::fs::create_dir_all(&scratch_dir).await?;

        let Some(signed) = inputs.signed else {
            let opts = GrubOptions {
                kernel: p.input.kernel.path.clone(),
                initramfs: inputs.initramfs.to_owned(),
                cmdline: inputs.cmdline.to_string(),
                version: p.version.clone(),
                arch: p.arch.clone(),
                scratch_dir,
                out_path: dest.to_owned(),
                label,
            };
            return self.caps.iso.create_grub(&opts, run.cancel).await;
        };

        let sb = p.input.secure_boot.clone().unwrap_or_default();
        let cert = &sb.secure_boot_signer.cert_path;
        let pem = tokio::fs::read(cert)
            .await
            .with_context(|| format!("Reading {cert}"))?;
        let der = run.tempdir.join("uki.der");
        tokio::fs::write(&der, iso::cert_pem_to_der(&pem)?).await?;

        let keys = if sb.platform_key_path.as_str().is_empty() {
            let enroll_dir = run.tempdir.join("enroll");
            tokio::fs::create_dir_all(&enroll_dir).await?;
            self.caps
                .iso
                .generate_enrollment(cert, &sb.secure_boot_signer.key_path, &enroll_dir, run.cancel)
                .await?
        } else {
            if sb.key_exchange_key_path.as_str().is_empty() || sb.signature_key_path.as_str().is_empty() {
                anyhow::bail!("A platform key requires a key exchange key and a signature database");
            }
            EnrollmentKeys {
                platform_key: sb.platform_key_path.clone(),
                key_exchange_key: sb.key_exchange_key_path.clone(),
                signature_db: sb.signature_key_path.clone(),
            }
        };

        let opts = UefiOptions {
            uki: signed.uki.clone(),
            sd_boot: signed.sd_boot.clone(),
            uki_signing_cert_der: der,
            keys,
            arch: p.arch.clone(),
            version: p.version.clone(),
            scratch_dir,
            out_path: dest.to_owned(),
            sd_boot_enroll_keys: p
                .output
                .iso_options
                .as_ref()
                .and_then(|o| o.sd_boot_enroll_keys)
                .unwrap_or_default(),
            label,
        };
        self.caps.iso.create_uefi(&opts, run.cancel).await
    }
}

/// What the emit stage consumes from earlier stages.
#[derive(Debug)]
struct EmitInputs<'a> {
    initramfs: &'a Utf8Path,
    cmdline: &'a Cmdline,
    signed: Option<&'a SignedAssets>,
    overlay: Option<&'a PreparedOverlay>,
}

async fn copy(src: &Utf8Path, dest: &Utf8Path) -> Result<()> {
    tokio::fs::copy(src, dest)
        .await
        .with_context(|| format!("Copying {src}"))?;
    Ok(())
}

async fn post_process(path: Utf8PathBuf, format: OutFormat) -> Result<Utf8PathBuf> {
    let processed = tokio::task::spawn_blocking(move || -> Result<PathBuf> {
        let path = path.as_std_path();
        match format {
            OutFormat::Raw => Ok(path.to_owned()),
            OutFormat::Tar => compress::tar_gz(path),
            OutFormat::Xz => compress::xz(path),
            OutFormat::Gz => compress::gzip(path),
            OutFormat::Zstd => compress::zstd(path),
        }
    })
    .await??;
    Utf8PathBuf::from_path_buf(processed).map_err(|p| anyhow::anyhow!("Non UTF-8 path {p:?}"))
}

/// Copy the finished artifact out and flush it to disk.
#[context("Writing {dest}")]
fn copy_out(src: &Utf8Path, dest: &Utf8Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(src, dest)?;
    std::fs::File::open(dest)?.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use imager_oci_ext::fixture::{gzip_tar, MemoryRegistry};
    use imager_oci_ext::registry::RegistryError;

    use super::*;
    use crate::error::{ImagerError, ValidationError};
    use crate::extensions::tests::RecordingRebuilder;
    use crate::image::tests::FakeAttach;
    use crate::install::tests::RecordingInstaller;
    use crate::iso::tests::{self_signed_pem, FakeIso};
    use crate::profile::{
        ContainerAsset, DiskFormat, FileAsset, ImageOptions, Input, Output, SecureBootAssets,
        SigningKey, SigningKeyAndCertificate,
    };
    use crate::qemuimg::tests::FakeConverter;
    use crate::reporter::tests::RecordingReporter;
    use crate::uki::tests::FakeUki;

    static_assertions::assert_impl_all!(Imager: Send, Sync);

    #[derive(Debug, Default)]
    struct Fakes {
        registry: Arc<MemoryRegistry>,
        rebuilder: Arc<RecordingRebuilder>,
        uki: Arc<FakeUki>,
        iso: Arc<FakeIso>,
        installer: Arc<RecordingInstaller>,
        converter: Arc<FakeConverter>,
    }

    impl Fakes {
        fn caps(&self) -> Capabilities {
            Capabilities {
                registry: self.registry.clone(),
                rebuilder: self.rebuilder.clone(),
                uki: self.uki.clone(),
                iso: self.iso.clone(),
                installer: self.installer.clone(),
                attach: Arc::new(FakeAttach::default()),
                converter: self.converter.clone(),
            }
        }
    }

    /// A scratch area with input files, a tempdir root and an output dir.
    struct Env {
        _td: tempfile::TempDir,
        dir: Utf8PathBuf,
    }

    impl Env {
        fn new() -> Self {
            let td = tempfile::tempdir().unwrap();
            let dir = Utf8Path::from_path(td.path()).unwrap().to_owned();
            for d in ["tmp", "out", "in"] {
                std::fs::create_dir(dir.join(d)).unwrap();
            }
            for (name, content) in [
                ("vmlinuz", "kernel"),
                ("initramfs.xz", "base\n"),
                ("uki-signing-key.pem", "key"),
                ("pcr-signing-key.pem", "pcr"),
            ] {
                std::fs::write(dir.join("in").join(name), content).unwrap();
            }
            std::fs::write(dir.join("in/uki-signing-cert.pem"), self_signed_pem()).unwrap();
            Self { _td: td, dir }
        }

        fn input(&self) -> Input {
            Input {
                kernel: FileAsset {
                    path: self.dir.join("in/vmlinuz"),
                },
                initramfs: FileAsset {
                    path: self.dir.join("in/initramfs.xz"),
                },
                ..Default::default()
            }
        }

        fn secure_boot(&self) -> SecureBootAssets {
            SecureBootAssets {
                secure_boot_signer: SigningKeyAndCertificate {
                    key_path: self.dir.join("in/uki-signing-key.pem"),
                    cert_path: self.dir.join("in/uki-signing-cert.pem"),
                },
                pcr_signer: SigningKey {
                    key_path: self.dir.join("in/pcr-signing-key.pem"),
                },
                ..Default::default()
            }
        }

        fn out(&self) -> Utf8PathBuf {
            self.dir.join("out")
        }

        fn tempdir_is_clean(&self) -> bool {
            std::fs::read_dir(self.dir.join("tmp")).unwrap().next().is_none()
        }

        fn imager(&self, profile: Profile, fakes: &Fakes) -> Result<Imager> {
            Ok(Imager::new(profile, fakes.caps())?.with_tempdir_root(self.dir.join("tmp")))
        }
    }

    fn profile(env: &Env, arch: &str, version: &str, kind: OutputKind) -> Profile {
        Profile {
            arch: arch.into(),
            platform: "metal".into(),
            version: version.into(),
            input: env.input(),
            output: Output {
                kind: Some(kind),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn execute(env: &Env, imager: &Imager, reporter: &RecordingReporter) -> Result<Utf8PathBuf> {
        imager
            .execute(&env.out(), reporter, &CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn test_cmdline() {
        let env = Env::new();
        let fakes = Fakes::default();
        let reporter = RecordingReporter::default();
        let mut p = profile(&env, "amd64", "v1.11.0", OutputKind::Cmdline);
        // Inputs are not needed for a command line.
        p.input = Input::default();
        let imager = env.imager(p, &fakes).unwrap();
        let out = execute(&env, &imager, &reporter).await.unwrap();
        assert_eq!(out, env.out().join("cmdline-metal-amd64"));
        similar_asserts::assert_eq!(
            std::fs::read_to_string(&out).unwrap(),
            "talos.platform=metal console=tty0 init_on_alloc=1 slab_nomerge pti=on consoleblank=0 \
             nvme_core.io_timeout=4294967295 printk.devkmsg=on selinux=1"
        );
        assert!(env.tempdir_is_clean());
        let statuses = reporter.statuses();
        assert!(statuses.contains(&("rebuilding initramfs".into(), Status::Skipped)));
        assert!(!statuses.iter().any(|(_, s)| *s == Status::Error));
    }

    #[tokio::test]
    async fn test_kernel_xz() {
        let env = Env::new();
        let fakes = Fakes::default();
        let mut p = profile(&env, "amd64", "v1.8.0", OutputKind::Kernel);
        p.output.out_format = Some(OutFormat::Xz);
        let imager = env.imager(p, &fakes).unwrap();
        let out = execute(&env, &imager, &RecordingReporter::default())
            .await
            .unwrap();
        assert_eq!(out, env.out().join("kernel-amd64.xz"));
        let mut content = String::new();
        xz2::read::XzDecoder::new(std::fs::File::open(&out).unwrap())
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "kernel");
        assert!(env.tempdir_is_clean());
    }

    #[tokio::test]
    async fn test_initramfs_with_embedded_config() {
        let env = Env::new();
        let fakes = Fakes::default();
        let mut p = profile(&env, "amd64", "v1.8.0", OutputKind::Initramfs);
        p.customization.embedded_machine_configuration = "machine: {}\n".into();
        let imager = env.imager(p, &fakes).unwrap();
        let out = execute(&env, &imager, &RecordingReporter::default())
            .await
            .unwrap();
        assert_eq!(out, env.out().join("initramfs-amd64.xz"));
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "base\n+embedded-config\n");
        // The input is untouched.
        assert_eq!(
            std::fs::read_to_string(env.dir.join("in/initramfs.xz")).unwrap(),
            "base\n"
        );
    }

    #[tokio::test]
    async fn test_secureboot_uki() {
        let env = Env::new();
        let fakes = Fakes::default();
        let mut p = profile(&env, "arm64", "v1.8.0", OutputKind::Uki);
        p.secure_boot = Some(true);
        p.input.secure_boot = Some(env.secure_boot());
        let imager = env.imager(p, &fakes).unwrap();
        let out = execute(&env, &imager, &RecordingReporter::default())
            .await
            .unwrap();
        assert_eq!(out, env.out().join("metal-arm64-secureboot-uki.efi"));
        let uki = std::fs::read_to_string(&out).unwrap();
        assert!(uki.starts_with("uki:talos.platform=metal console=ttyAMA0 "), "{uki}");
        assert!(uki.contains(" lockdown=confidentiality"), "{uki}");
    }

    #[tokio::test]
    async fn test_secureboot_iso_generates_enrollment() {
        let env = Env::new();
        let fakes = Fakes::default();
        let mut p = profile(&env, "amd64", "v1.8.0", OutputKind::Iso);
        p.secure_boot = Some(true);
        p.input.secure_boot = Some(env.secure_boot());
        let imager = env.imager(p, &fakes).unwrap();
        let out = execute(&env, &imager, &RecordingReporter::default())
            .await
            .unwrap();
        assert_eq!(out, env.out().join("metal-amd64-secureboot.iso"));
        assert_eq!(*fakes.iso.calls.lock().unwrap(), ["enroll", "uefi"]);
        assert_eq!(fakes.uki.cmdlines.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_grub_iso() {
        let env = Env::new();
        let fakes = Fakes::default();
        let p = profile(&env, "amd64", "v1.8.0", OutputKind::Iso);
        let imager = env.imager(p, &fakes).unwrap();
        let out = execute(&env, &imager, &RecordingReporter::default())
            .await
            .unwrap();
        assert_eq!(out, env.out().join("metal-amd64.iso"));
        assert!(std::fs::read_to_string(&out)
            .unwrap()
            .starts_with("grub:talos.platform=metal "));
        assert_eq!(*fakes.iso.calls.lock().unwrap(), ["grub"]);
        assert!(fakes.uki.cmdlines.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_image_converted_and_compressed() {
        let env = Env::new();
        let fakes = Fakes::default();
        let mut p = profile(&env, "arm64", "v1.8.0", OutputKind::Image);
        p.board = "rpi_generic".into();
        p.customization.meta_contents = vec!["10=x".parse().unwrap()];
        p.output.image_options = Some(ImageOptions {
            disk_size: crate::constants::MIN_RAW_DISK_SIZE,
            disk_format: Some(DiskFormat::Qcow2),
            ..Default::default()
        });
        p.output.out_format = Some(OutFormat::Zstd);
        let imager = env.imager(p, &fakes).unwrap();
        let out = execute(&env, &imager, &RecordingReporter::default())
            .await
            .unwrap();
        assert_eq!(out, env.out().join("metal-rpi_generic-arm64.qcow2.zst"));
        let content = zstd::decode_all(std::fs::File::open(&out).unwrap()).unwrap();
        assert_eq!(content, b"Qcow2");

        let installs = fakes.installer.installs.lock().unwrap();
        assert_eq!(installs.len(), 1);
        assert_eq!(installs[0].board, "rpi_generic");
        assert_eq!(installs[0].meta_values, imager.profile().customization.meta_contents);
        // Images get META from the installer, not the command line.
        assert!(installs[0]
            .cmdline
            .find(crate::constants::KERNEL_PARAM_ENVIRONMENT)
            .is_none());
        assert!(env.tempdir_is_clean());
    }

    #[tokio::test]
    async fn test_installer() {
        let env = Env::new();
        let fakes = Fakes::default();
        let base = "ghcr.io/siderolabs/installer-base:v1.8.0";
        fakes.registry.insert(
            base,
            "amd64",
            vec![
                gzip_tar(&[("usr/bin/installer", Some("bin"))]),
                gzip_tar(&[("usr/install/amd64/vmlinuz", Some("old"))]),
            ],
        );
        let mut p = profile(&env, "amd64", "v1.8.0", OutputKind::Installer);
        p.input.base_installer = ContainerAsset::registry(base, false);
        let imager = env.imager(p, &fakes).unwrap();
        let out = execute(&env, &imager, &RecordingReporter::default())
            .await
            .unwrap();
        assert_eq!(out, env.out().join("installer-amd64.tar"));
        assert_eq!(fakes.registry.pulls(), [base]);
        assert!(std::fs::metadata(&out).unwrap().len() > 0);
    }

    #[tokio::test]
    async fn test_missing_extension() {
        let env = Env::new();
        let fakes = Fakes::default();
        let reporter = RecordingReporter::default();
        let mut p = profile(&env, "amd64", "v1.8.0", OutputKind::Initramfs);
        p.input.system_extensions = vec![ContainerAsset::registry("ghcr.io/siderolabs/gvisor:1.0", false)];
        let imager = env.imager(p, &fakes).unwrap();
        let e = execute(&env, &imager, &reporter).await.unwrap_err();
        assert_eq!(e.downcast_ref::<Stage>(), Some(&Stage::RebuildInitramfs));
        assert!(matches!(
            e.downcast_ref::<ImagerError>(),
            Some(ImagerError::Registry(RegistryError::Permanent(_)))
        ));
        let errors = reporter
            .statuses()
            .into_iter()
            .filter(|(_, s)| *s == Status::Error)
            .count();
        assert_eq!(errors, 1);
        assert!(env.tempdir_is_clean());
        assert!(std::fs::read_dir(env.out()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_unwritable_output_dir() {
        let env = Env::new();
        let fakes = Fakes::default();
        let reporter = RecordingReporter::default();
        let imager = env
            .imager(profile(&env, "amd64", "v1.8.0", OutputKind::Kernel), &fakes)
            .unwrap();
        // A regular file cannot hold the output directory.
        let output_dir = env.dir.join("in/vmlinuz/out");
        let e = imager
            .execute(&output_dir, &reporter, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(e.downcast_ref::<Stage>(), Some(&Stage::WriteOutput));
        let statuses = reporter.statuses();
        let (message, status) = statuses.last().unwrap();
        assert_eq!(*status, Status::Error);
        assert!(message.contains("write output"), "{message}");
        assert!(statuses
            .iter()
            .any(|(m, s)| m == "post-processing output" && *s == Status::Skipped));
        assert!(env.tempdir_is_clean());
    }

    #[tokio::test]
    async fn test_cancelled() {
        let env = Env::new();
        let fakes = Fakes::default();
        let imager = env
            .imager(profile(&env, "amd64", "v1.8.0", OutputKind::Kernel), &fakes)
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let e = imager
            .execute(&env.out(), &RecordingReporter::default(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(e.downcast_ref::<ImagerError>(), Some(&ImagerError::Cancelled));
        assert!(env.tempdir_is_clean());
    }

    #[test]
    fn test_new_validates() {
        let env = Env::new();
        let fakes = Fakes::default();
        let mut p = profile(&env, "amd64", "v1.8.0", OutputKind::Image);
        p.board = "rpi_generic".into();
        let e = env.imager(p, &fakes).unwrap_err();
        assert_eq!(
            e.downcast_ref::<ImagerError>(),
            Some(&ImagerError::Validation(ValidationError(
                "board is only supported for metal arm64".into()
            )))
        );

        let mut p = profile(&env, "amd64", "v1.8.0", OutputKind::Kernel);
        p.input.kernel.path = env.dir.join("in/missing");
        let e = env.imager(p, &fakes).unwrap_err();
        assert_eq!(
            e.downcast_ref::<ImagerError>(),
            Some(&ImagerError::InputNotFound(env.dir.join("in/missing")))
        );
    }

    #[test]
    fn test_new_resolves_base_profile() {
        let env = Env::new();
        let fakes = Fakes::default();
        let p = Profile {
            base_profile_name: "aws".into(),
            arch: "amd64".into(),
            version: "v1.8.0".into(),
            input: env.input(),
            ..Default::default()
        };
        let imager = env.imager(p, &fakes).unwrap();
        assert_eq!(imager.profile().platform, "aws");
        assert!(imager.profile().base_profile_name.is_empty());
        assert_eq!(imager.profile().output_path().unwrap(), "aws-amd64.raw");
        assert_eq!(
            imager.profile().input.base_installer.image_ref,
            "ghcr.io/siderolabs/installer:v1.8.0"
        );
    }
}
