//! Pulling container images and extracting their layers.
//!
//! The [`Registry`] trait is the seam between the imager and the transport;
//! the production implementation drives `skopeo` through
//! [`containers_image_proxy`], which gives us registry mirroring,
//! `docker-archive:` and `oci:` transports and the usual containers
//! authentication files for free.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use containers_image_proxy::{ImageProxy, ImageProxyConfig, OpenedImage};
use fn_error_context::context;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::archiver::{untar, UntarOptions};
use crate::generic_decompress::Decompressor;
use crate::oci_spec::image as oci_image;
use crate::{Cancelled, Result};

/// Bytes buffered between a blob download and its decompressing consumer.
const PIPE_CAPACITY: usize = 1024 * 1024;

/// Where an image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// A registry reference such as `ghcr.io/siderolabs/installer:v1.8.0`.
    Registry {
        /// The image reference; a transport prefix is added if missing.
        reference: String,
        /// Skip TLS verification (and allow plain HTTP) for this registry.
        insecure: bool,
    },
    /// A `docker save` style tarball.
    DockerArchive(PathBuf),
    /// An OCI image layout directory.
    OciLayout(PathBuf),
}

impl ImageSource {
    /// The reference string handed to the image proxy.
    pub fn transport_ref(&self) -> String {
        match self {
            ImageSource::Registry { reference, .. } => {
                // Transports look like `docker://`, `oci:`, `containers-storage:`
                let has_transport = reference
                    .split_once(':')
                    .is_some_and(|(t, rest)| !t.contains(['/', '.']) && !rest.starts_with(|c: char| c.is_ascii_digit()));
                if has_transport {
                    reference.clone()
                } else {
                    format!("docker://{reference}")
                }
            }
            ImageSource::DockerArchive(p) => format!("docker-archive:{}", p.display()),
            ImageSource::OciLayout(p) => format!("oci:{}", p.display()),
        }
    }

    fn insecure(&self) -> bool {
        matches!(self, ImageSource::Registry { insecure: true, .. })
    }
}

impl std::fmt::Display for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageSource::Registry { reference, .. } => f.write_str(reference),
            o => f.write_str(&o.transport_ref()),
        }
    }
}

/// An image whose manifest and configuration have been fetched.
#[derive(Debug, Clone)]
pub struct PulledImage {
    /// Where the image came from.
    pub source: ImageSource,
    /// The manifest selected for `arch`.
    pub manifest: oci_image::ImageManifest,
    /// Digest of the manifest.
    pub manifest_digest: String,
    /// The image configuration.
    pub config: oci_image::ImageConfiguration,
    /// The architecture the image was pulled for.
    pub arch: String,
}

impl PulledImage {
    /// The human readable reference this image was pulled from.
    pub fn reference(&self) -> String {
        self.source.to_string()
    }
}

/// Registry failures, classified for retrying.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// A network-level failure which may succeed if retried.
    #[error("transient registry error: {0}")]
    Transient(String),
    /// A failure which will not go away on its own (unknown manifest, wrong
    /// architecture, malformed data).
    #[error("registry error: {0}")]
    Permanent(String),
    /// The registry rejected every credential we have.
    #[error("registry authentication failed: {0}")]
    Auth(String),
}

impl RegistryError {
    /// Classify an error message from the transport.
    pub fn from_message(msg: impl Into<String>) -> Self {
        const AUTH: &[&str] = &[
            "unauthorized",
            "authentication required",
            "access denied",
            "denied:",
            "status 401",
            "status 403",
            "401 unauthorized",
            "403 forbidden",
        ];
        const TRANSIENT: &[&str] = &[
            "timeout",
            "timed out",
            "connection reset",
            "connection refused",
            "temporary failure",
            "unexpected eof",
            "too many requests",
            "status 429",
            "status 502",
            "status 503",
            "status 504",
            "tls handshake",
            "i/o timeout",
        ];
        let msg = msg.into();
        let lower = msg.to_ascii_lowercase();
        if AUTH.iter().any(|p| lower.contains(p)) {
            RegistryError::Auth(msg)
        } else if TRANSIENT.iter().any(|p| lower.contains(p)) {
            RegistryError::Transient(msg)
        } else {
            RegistryError::Permanent(msg)
        }
    }

    fn is_transient(&self) -> bool {
        matches!(self, RegistryError::Transient(_))
    }
}

/// Convert a transport error into a classified [`RegistryError`].
fn classify(e: impl Into<anyhow::Error>) -> anyhow::Error {
    let e = e.into();
    RegistryError::from_message(format!("{e:#}")).into()
}

/// Access to container images.
#[async_trait]
pub trait Registry: std::fmt::Debug + Send + Sync {
    /// Fetch the manifest and configuration of `source` for `{arch, os=linux}`.
    async fn pull(&self, source: &ImageSource, arch: &str) -> Result<PulledImage>;

    /// Stream the (compressed) blob for `descriptor` into `sink`.
    async fn copy_blob(
        &self,
        image: &PulledImage,
        descriptor: &oci_image::Descriptor,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()>;
}

/// How often, and how patiently, transient failures are retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Delay before the second attempt; doubled after every failure.
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_secs(1),
        }
    }
}

/// Run `f` until it succeeds, fails with something other than
/// [`RegistryError::Transient`], or the attempts run out.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, what: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = policy.initial_backoff;
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                let transient = e
                    .downcast_ref::<RegistryError>()
                    .is_some_and(RegistryError::is_transient);
                if !transient || attempt >= policy.attempts {
                    return Err(e);
                }
                tracing::warn!(
                    "{what}: attempt {attempt}/{} failed: {e:#}; retrying in {backoff:?}",
                    policy.attempts
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                attempt += 1;
            }
        }
    }
}

/// The authentication files consulted, in order. Later entries are only
/// used when earlier ones do not exist.
pub fn auth_file_chain() -> Vec<PathBuf> {
    let mut r = Vec::new();
    if let Some(p) = std::env::var_os("REGISTRY_AUTH_FILE") {
        r.push(PathBuf::from(p));
    }
    if let Some(p) = std::env::var_os("XDG_RUNTIME_DIR") {
        r.push(Path::new(&p).join("containers/auth.json"));
    }
    if let Some(home) = std::env::var_os("HOME") {
        let home = Path::new(&home);
        r.push(home.join(".config/containers/auth.json"));
        r.push(home.join(".docker/config.json"));
    }
    r
}

/// Pulls images by running `skopeo experimental-image-proxy`.
#[derive(Debug, Clone, Default)]
pub struct SkopeoRegistry {
    retry: RetryPolicy,
}

impl SkopeoRegistry {
    /// Create a client with the default retry policy.
    pub fn new() -> Self {
        Self::default()
    }

    fn proxy_config(&self, source: &ImageSource, arch: &str) -> ImageProxyConfig {
        let mut skopeo = std::process::Command::new("skopeo");
        skopeo.args(["--override-arch", arch, "--override-os", "linux"]);
        let authfile = auth_file_chain().into_iter().find(|p| p.exists());
        if let Some(p) = authfile.as_deref() {
            tracing::debug!("Using registry credentials from {}", p.display());
        }
        ImageProxyConfig {
            skopeo_cmd: Some(skopeo),
            authfile,
            insecure_skip_tls_verification: source.insecure().then_some(true),
            ..Default::default()
        }
    }

    async fn open(&self, source: &ImageSource, arch: &str) -> Result<(ImageProxy, OpenedImage)> {
        let proxy = ImageProxy::new_with_config(self.proxy_config(source, arch))
            .await
            .context("Starting image proxy")?;
        let img = proxy
            .open_image(&source.transport_ref())
            .await
            .map_err(classify)?;
        Ok((proxy, img))
    }

    async fn pull_once(&self, source: &ImageSource, arch: &str) -> Result<PulledImage> {
        let (proxy, img) = self.open(source, arch).await?;
        let (manifest_digest, manifest) = proxy.fetch_manifest(&img).await.map_err(classify)?;
        let config = proxy.fetch_config(&img).await.map_err(classify)?;
        proxy.close_image(&img).await.map_err(classify)?;
        proxy.finalize().await.map_err(classify)?;

        let found = config.architecture().to_string();
        if found != arch {
            return Err(RegistryError::Permanent(format!(
                "{source} is built for {found}, not {arch}"
            ))
            .into());
        }
        Ok(PulledImage {
            source: source.clone(),
            manifest,
            manifest_digest,
            config,
            arch: arch.to_owned(),
        })
    }
}

#[async_trait]
impl Registry for SkopeoRegistry {
    #[instrument(level = "debug", skip(self))]
    async fn pull(&self, source: &ImageSource, arch: &str) -> Result<PulledImage> {
        let what = format!("Pulling {source}");
        with_retry(self.retry, &what, || self.pull_once(source, arch))
            .await
            .context(what)
    }

    async fn copy_blob(
        &self,
        image: &PulledImage,
        descriptor: &oci_image::Descriptor,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        let (proxy, img) = self.open(&image.source, &image.arch).await?;
        let (mut blob, driver) = proxy
            .get_descriptor(&img, descriptor)
            .await
            .map_err(classify)?;
        let worker = async move {
            tokio::io::copy(&mut blob, sink).await?;
            drop(blob);
            Ok(())
        };
        let driver = async { driver.await.map_err(Into::into) };
        join_fetch(worker, driver)
            .await
            .with_context(|| format!("Fetching {}", descriptor.digest()))?;
        proxy.close_image(&img).await.map_err(classify)?;
        proxy.finalize().await.map_err(classify)?;
        Ok(())
    }
}

/// Use this to process potential errors from a worker and a driver.
/// An error can occur on either side; if our side fails it drops its end
/// of the pipe, which makes the other side fail with a broken pipe too.
/// In that case only the worker's error is interesting.
pub(crate) async fn join_fetch<T: std::fmt::Debug>(
    worker: impl Future<Output = Result<T>>,
    driver: impl Future<Output = Result<()>>,
) -> Result<T> {
    let (worker, driver) = tokio::join!(worker, driver);
    match (worker, driver) {
        (Ok(t), Ok(())) => Ok(t),
        (Err(worker), Err(driver)) => {
            let text = driver.root_cause().to_string();
            if text.ends_with("broken pipe") {
                tracing::trace!("Ignoring broken pipe failure from driver");
                Err(worker)
            } else {
                Err(worker.context(format!("proxy failure: {} and client error", text)))
            }
        }
        (Ok(_), Err(driver)) => Err(driver),
        (Err(worker), Ok(())) => Err(worker),
    }
}

async fn extract_layer(
    registry: &dyn Registry,
    image: &PulledImage,
    layer: &oci_image::Descriptor,
    dest: &Path,
) -> Result<()> {
    let (mut tx, rx) = tokio::io::duplex(PIPE_CAPACITY);
    let media_type = layer.media_type().clone();
    let dest = dest.to_owned();
    let rx = SyncIoBridge::new(rx);
    let consumer = async move {
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut d = Decompressor::new(&media_type, rx)?;
            untar(
                &mut d,
                &dest,
                UntarOptions {
                    layer: true,
                    ..Default::default()
                },
            )?;
            d.finish()
        })
        .await?
    };
    let producer = async move {
        registry.copy_blob(image, layer, &mut tx).await?;
        tx.shutdown().await?;
        Ok(())
    };
    join_fetch(consumer, producer).await
}

/// Extract every layer of `image` into `dest`, in order, applying whiteouts.
///
/// Each layer is downloaded and unpacked concurrently, connected by a
/// bounded in-memory pipe.
#[context("Extracting {} into {dest:?}", image.reference())]
#[instrument(level = "debug", skip_all, fields(image = %image.source))]
pub async fn extract(
    registry: &dyn Registry,
    image: &PulledImage,
    dest: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    tokio::fs::create_dir_all(dest).await?;
    for (i, layer) in image.manifest.layers().iter().enumerate() {
        crate::check_cancelled(cancel)?;
        tracing::debug!("Extracting layer {i} {}", layer.digest());
        tokio::select! {
            r = extract_layer(registry, image, layer, dest) => {
                r.with_context(|| format!("Layer {i} ({})", layer.digest()))?
            }
            _ = cancel.cancelled() => return Err(Cancelled.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::fixture::{gzip_tar, MemoryRegistry};

    static_assertions::assert_impl_all!(SkopeoRegistry: Registry, Send, Sync);
    static_assertions::assert_impl_all!(PulledImage: Send, Sync);

    #[test]
    fn test_transport_ref() {
        let cases = [
            (
                ImageSource::Registry {
                    reference: "ghcr.io/siderolabs/installer:v1.8.0".into(),
                    insecure: false,
                },
                "docker://ghcr.io/siderolabs/installer:v1.8.0",
            ),
            (
                ImageSource::Registry {
                    reference: "localhost:5000/installer:latest".into(),
                    insecure: true,
                },
                "docker://localhost:5000/installer:latest",
            ),
            (
                ImageSource::Registry {
                    reference: "containers-storage:localhost/installer".into(),
                    insecure: false,
                },
                "containers-storage:localhost/installer",
            ),
            (
                ImageSource::DockerArchive("/tmp/installer.tar".into()),
                "docker-archive:/tmp/installer.tar",
            ),
            (
                ImageSource::OciLayout("/tmp/oci".into()),
                "oci:/tmp/oci",
            ),
        ];
        for (src, expected) in cases {
            assert_eq!(src.transport_ref(), expected);
        }
    }

    #[test]
    fn test_classify() {
        for (msg, expected) in [
            (
                "reading manifest v1: unauthorized: authentication required",
                "auth",
            ),
            ("pinging registry: received unexpected HTTP status 503", "transient"),
            ("dial tcp 10.0.0.1:443: i/o timeout", "transient"),
            ("manifest unknown", "permanent"),
        ] {
            let got = match RegistryError::from_message(msg) {
                RegistryError::Auth(_) => "auth",
                RegistryError::Transient(_) => "transient",
                RegistryError::Permanent(_) => "permanent",
            };
            assert_eq!(got, expected, "{msg}");
        }
    }

    #[tokio::test]
    async fn test_retry() {
        let policy = RetryPolicy {
            attempts: 3,
            initial_backoff: Duration::ZERO,
        };

        // Transient failures are retried until the attempts run out
        let calls = AtomicU32::new(0);
        let r: Result<()> = with_retry(policy, "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RegistryError::Transient("connection reset".into()).into())
        })
        .await;
        assert!(r.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Recovering on the second attempt
        let calls = AtomicU32::new(0);
        let r = with_retry(policy, "test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(RegistryError::Transient("timeout".into()).into())
            } else {
                Ok(42)
            }
        })
        .await
        .unwrap();
        assert_eq!(r, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Auth errors are final
        let calls = AtomicU32::new(0);
        let e = with_retry(policy, "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(RegistryError::Auth("denied: requested access".into()).into())
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            e.downcast_ref::<RegistryError>(),
            Some(RegistryError::Auth(_))
        ));
    }

    #[tokio::test]
    async fn test_extract_layers_in_order() -> Result<()> {
        let base = gzip_tar(&[
            ("usr/lib/", None),
            ("usr/lib/a.ko", Some("a")),
            ("usr/lib/b.ko", Some("b")),
        ]);
        let upper = gzip_tar(&[
            ("usr/lib/.wh.a.ko", Some("")),
            ("usr/lib/b.ko", Some("b2")),
            ("manifest.yaml", Some("name: ext")),
        ]);
        let registry = MemoryRegistry::default();
        let source = registry.insert("example.com/ext:v1", "amd64", vec![base, upper]);
        let image = registry.pull(&source, "amd64").await?;

        let td = tempfile::tempdir()?;
        let dest = td.path().join("ext");
        extract(&registry, &image, &dest, &CancellationToken::new()).await?;
        assert!(!dest.join("usr/lib/a.ko").exists());
        assert_eq!(std::fs::read_to_string(dest.join("usr/lib/b.ko"))?, "b2");
        assert_eq!(
            std::fs::read_to_string(dest.join("manifest.yaml"))?,
            "name: ext"
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_extract_corrupt_layer() -> Result<()> {
        let registry = MemoryRegistry::default();
        let source = registry.insert(
            "example.com/ext:v1",
            "amd64",
            vec![b"definitely not gzip".to_vec()],
        );
        let image = registry.pull(&source, "amd64").await?;
        let td = tempfile::tempdir()?;
        let e = extract(&registry, &image, td.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        // Only the consumer's failure is reported, not the broken pipe
        assert!(!format!("{e:#}").contains("proxy failure"), "{e:#}");
        Ok(())
    }

    #[tokio::test]
    async fn test_extract_cancelled() -> Result<()> {
        let registry = MemoryRegistry::default();
        let source = registry.insert(
            "example.com/ext:v1",
            "amd64",
            vec![gzip_tar(&[("a", Some("a"))])],
        );
        let image = registry.pull(&source, "amd64").await?;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let td = tempfile::tempdir()?;
        let e = extract(&registry, &image, td.path(), &cancel)
            .await
            .unwrap_err();
        assert!(e.root_cause().is::<Cancelled>());
        Ok(())
    }

    #[tokio::test]
    async fn test_pull_wrong_arch() {
        let registry = MemoryRegistry::default();
        let source = registry.insert("example.com/ext:v1", "amd64", vec![]);
        let e = registry.pull(&source, "arm64").await.unwrap_err();
        assert!(matches!(
            e.downcast_ref::<RegistryError>(),
            Some(RegistryError::Permanent(_))
        ));
    }
}
