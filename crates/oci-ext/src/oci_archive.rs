//! Write a derived image as an OCI archive tarball.
//!
//! The result is an OCI image layout (`oci-layout`, `index.json`,
//! `blobs/sha256/...`) packed into a single tar file, loadable with e.g.
//! `skopeo copy oci-archive:...`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use fn_error_context::context;
use serde::Serialize;
use sha2::{Digest as _, Sha256};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::filemap::Layer;
use crate::oci_spec::image::{
    Descriptor, DescriptorBuilder, Digest, ImageConfigurationBuilder, ImageIndexBuilder,
    ImageManifestBuilder, MediaType, RootFsBuilder, SCHEMA_VERSION,
};
use crate::registry::{PulledImage, Registry};
use crate::Result;

/// Annotation naming the image inside the index.
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

const OCI_LAYOUT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;

/// The layers of `base` carried into a derived image.
///
/// An image with exactly two layers keeps only the first one; the second
/// holds the content the derived image replaces.
pub fn base_layers(base: &PulledImage) -> &[Descriptor] {
    let layers = base.manifest.layers();
    if layers.len() == 2 {
        &layers[..1]
    } else {
        layers
    }
}

fn blob_path(layout: &Path, digest: &str) -> Result<PathBuf> {
    let hex = digest
        .strip_prefix("sha256:")
        .with_context(|| format!("Unsupported digest {digest}"))?;
    Ok(layout.join("blobs/sha256").join(hex))
}

fn descriptor(media_type: MediaType, digest: &str, size: u64) -> Result<Descriptor> {
    Ok(DescriptorBuilder::default()
        .media_type(media_type)
        .digest(Digest::from_str(digest)?)
        .size(size)
        .build()?)
}

async fn write_json_blob(
    layout: &Path,
    media_type: MediaType,
    value: &impl Serialize,
) -> Result<Descriptor> {
    let buf = serde_json::to_vec(value)?;
    let mut h = Sha256::new();
    h.update(&buf);
    let digest = crate::sha256_digest(h);
    tokio::fs::write(blob_path(layout, &digest)?, &buf).await?;
    descriptor(media_type, &digest, buf.len() as u64)
}

/// Write `base` plus `layers` on top as an OCI archive at `out_path`.
///
/// The configuration is regenerated: architecture, OS and runtime config
/// come from `base`, the layer history does not. The manifest is named
/// after the base reference in the index. Returns the manifest digest.
#[context("Writing OCI archive {out_path:?}")]
pub async fn write(
    registry: &dyn Registry,
    base: &PulledImage,
    layers: &[Layer],
    out_path: &Path,
    cancel: &CancellationToken,
) -> Result<String> {
    let td = tempfile::tempdir()?;
    let layout = td.path();
    tokio::fs::create_dir_all(layout.join("blobs/sha256")).await?;

    let kept = base_layers(base);
    let mut descriptors = Vec::with_capacity(kept.len() + layers.len());
    let mut diff_ids = base
        .config
        .rootfs()
        .diff_ids()
        .iter()
        .take(kept.len())
        .cloned()
        .collect::<Vec<_>>();
    if diff_ids.len() != kept.len() {
        anyhow::bail!(
            "{} has {} layers but {} diff_ids",
            base.reference(),
            kept.len(),
            diff_ids.len()
        );
    }

    for layer in kept {
        crate::check_cancelled(cancel)?;
        let digest = layer.digest().to_string();
        let dest = blob_path(layout, &digest)?;
        let mut f = tokio::fs::File::create(&dest).await?;
        registry
            .copy_blob(base, layer, &mut f)
            .await
            .with_context(|| format!("Copying base layer {digest}"))?;
        f.flush().await?;
        descriptors.push(layer.clone());
    }
    for layer in layers {
        crate::check_cancelled(cancel)?;
        tokio::fs::copy(&layer.path, blob_path(layout, &layer.digest)?)
            .await
            .with_context(|| format!("Copying layer {:?}", layer.path))?;
        descriptors.push(descriptor(
            MediaType::ImageLayerGzip,
            &layer.digest,
            layer.size,
        )?);
        diff_ids.push(layer.diff_id.clone());
    }

    let mut config = ImageConfigurationBuilder::default()
        .architecture(base.config.architecture().clone())
        .os(base.config.os().clone())
        .created(chrono::Utc::now().to_rfc3339())
        .rootfs(
            RootFsBuilder::default()
                .typ("layers")
                .diff_ids(diff_ids)
                .build()?,
        );
    if let Some(inner) = base.config.config() {
        config = config.config(inner.clone());
    }
    let config = config.build()?;
    let config_desc = write_json_blob(layout, MediaType::ImageConfig, &config).await?;

    let manifest = ImageManifestBuilder::default()
        .schema_version(SCHEMA_VERSION)
        .media_type(MediaType::ImageManifest)
        .config(config_desc)
        .layers(descriptors)
        .build()?;
    let manifest_desc = write_json_blob(layout, MediaType::ImageManifest, &manifest).await?;
    let manifest_digest = manifest_desc.digest().to_string();
    let manifest_desc = DescriptorBuilder::default()
        .media_type(MediaType::ImageManifest)
        .digest(manifest_desc.digest().clone())
        .size(manifest_desc.size())
        .annotations(HashMap::from([(
            REF_NAME_ANNOTATION.to_owned(),
            base.reference(),
        )]))
        .build()?;

    let index = ImageIndexBuilder::default()
        .schema_version(SCHEMA_VERSION)
        .media_type(MediaType::ImageIndex)
        .manifests(vec![manifest_desc])
        .build()?;
    tokio::fs::write(layout.join("index.json"), serde_json::to_vec(&index)?).await?;
    tokio::fs::write(layout.join("oci-layout"), OCI_LAYOUT).await?;

    let layout = layout.to_owned();
    let out_path = out_path.to_owned();
    let cancel = cancel.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let f = std::io::BufWriter::new(std::fs::File::create(&out_path)?);
        let f = crate::archiver::tar_dir(&layout, f, &cancel)?;
        f.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        Ok(())
    })
    .await??;
    drop(td);
    tracing::debug!("Wrote OCI archive with manifest {manifest_digest}");
    Ok(manifest_digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filemap::{self, FileItem};
    use crate::fixture::{gzip_tar, MemoryRegistry};
    use crate::oci_spec::image::{ImageConfiguration, ImageIndex, ImageManifest};

    fn read_blob(dir: &Path, digest: &str) -> Vec<u8> {
        std::fs::read(blob_path(dir, digest).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_write_archive() -> Result<()> {
        let registry = MemoryRegistry::default();
        let source = registry.insert_with_env(
            "ghcr.io/siderolabs/installer-base:v1.8.0",
            "arm64",
            vec![
                gzip_tar(&[("usr/bin/installer", Some("bin"))]),
                gzip_tar(&[("usr/install/arm64/vmlinuz", Some("kernel"))]),
            ],
            &["PATH=/usr/bin"],
        );
        let base = registry.pull(&source, "arm64").await?;

        let td = tempfile::tempdir()?;
        std::fs::write(td.path().join("extra-options"), "board: rpi_generic\n")?;
        let items = vec![FileItem::new(
            td.path().join("extra-options"),
            "overlay/extra-options",
            0o644,
        )];
        let layer = filemap::layer(&items, 0, &td.path().join("layer.tar.gz"))?;

        let out = td.path().join("installer-arm64.tar");
        let digest = write(
            &registry,
            &base,
            std::slice::from_ref(&layer),
            &out,
            &CancellationToken::new(),
        )
        .await?;

        let unpacked = td.path().join("unpacked");
        crate::archiver::untar(std::fs::File::open(&out)?, &unpacked, Default::default())?;
        assert_eq!(
            std::fs::read_to_string(unpacked.join("oci-layout"))?,
            OCI_LAYOUT
        );

        let index: ImageIndex =
            serde_json::from_slice(&std::fs::read(unpacked.join("index.json"))?)?;
        let m = &index.manifests()[0];
        assert_eq!(m.digest().to_string(), digest);
        assert_eq!(
            m.annotations().as_ref().unwrap()[REF_NAME_ANNOTATION],
            "ghcr.io/siderolabs/installer-base:v1.8.0"
        );

        let manifest: ImageManifest = serde_json::from_slice(&read_blob(&unpacked, &digest))?;
        let layer_digests = manifest
            .layers()
            .iter()
            .map(|l| l.digest().to_string())
            .collect::<Vec<_>>();
        assert_eq!(
            layer_digests,
            [
                base.manifest.layers()[0].digest().to_string(),
                layer.digest.clone()
            ]
        );
        for l in manifest.layers() {
            assert_eq!(
                read_blob(&unpacked, &l.digest().to_string()).len() as u64,
                l.size()
            );
        }

        let config: ImageConfiguration = serde_json::from_slice(&read_blob(
            &unpacked,
            &manifest.config().digest().to_string(),
        ))?;
        assert_eq!(config.architecture().to_string(), "arm64");
        assert_eq!(
            config.rootfs().diff_ids(),
            &vec![
                base.config.rootfs().diff_ids()[0].clone(),
                layer.diff_id.clone()
            ]
        );
        assert_eq!(
            config.config().as_ref().unwrap().env().as_ref().unwrap(),
            &vec!["PATH=/usr/bin".to_string()]
        );
        assert!(config.history().as_ref().map_or(true, |h| h.is_empty()));
        Ok(())
    }

    #[tokio::test]
    async fn test_base_layers() -> Result<()> {
        let registry = MemoryRegistry::default();
        let layer = || gzip_tar(&[("a", Some("a"))]);
        for (n, kept) in [(1, 1), (2, 1), (3, 3)] {
            let source = registry.insert(
                &format!("example.com/base:{n}"),
                "amd64",
                (0..n).map(|_| layer()).collect(),
            );
            let base = registry.pull(&source, "amd64").await?;
            assert_eq!(base_layers(&base).len(), kept, "{n} layers");
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_write_cancelled() -> Result<()> {
        let registry = MemoryRegistry::default();
        let source = registry.insert(
            "example.com/base:v1",
            "amd64",
            vec![gzip_tar(&[("a", Some("a"))])],
        );
        let base = registry.pull(&source, "amd64").await?;
        let td = tempfile::tempdir()?;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let e = write(&registry, &base, &[], &td.path().join("out.tar"), &cancel)
            .await
            .unwrap_err();
        assert!(e.root_cause().is::<crate::Cancelled>());
        Ok(())
    }
}
