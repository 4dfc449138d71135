//! In-memory test doubles for code that pulls images.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::io::{Read, Write};
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::oci_spec::image::{
    Arch, ConfigBuilder, Descriptor, DescriptorBuilder, Digest, ImageConfiguration,
    ImageConfigurationBuilder, ImageManifest, ImageManifestBuilder, MediaType, Os,
    RootFsBuilder, SCHEMA_VERSION,
};
use crate::registry::{ImageSource, PulledImage, Registry, RegistryError};
use crate::Result;

fn digest_of(data: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(data);
    crate::sha256_digest(h)
}

/// Build a gzip-compressed tar from `(path, content)` pairs; `None` content
/// makes a directory.
pub fn gzip_tar(entries: &[(&str, Option<&str>)]) -> Vec<u8> {
    let gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    let mut b = tar::Builder::new(gz);
    for (path, content) in entries {
        let mut h = tar::Header::new_ustar();
        match content {
            Some(c) => {
                h.set_entry_type(tar::EntryType::Regular);
                h.set_mode(0o644);
                h.set_size(c.len() as u64);
                b.append_data(&mut h, path, c.as_bytes()).unwrap();
            }
            None => {
                h.set_entry_type(tar::EntryType::Directory);
                h.set_mode(0o755);
                h.set_size(0);
                b.append_data(&mut h, path, std::io::empty()).unwrap();
            }
        }
    }
    let mut gz = b.into_inner().unwrap();
    gz.flush().unwrap();
    gz.finish().unwrap()
}

#[derive(Debug)]
struct Stored {
    manifest: ImageManifest,
    manifest_digest: String,
    config: ImageConfiguration,
}

#[derive(Debug, Default)]
struct Inner {
    images: HashMap<String, Stored>,
    blobs: HashMap<String, Vec<u8>>,
    pulls: Vec<String>,
    transient_failures: u32,
}

/// A [`Registry`] serving images from memory.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    inner: Mutex<Inner>,
}

impl MemoryRegistry {
    /// Store an image with the given gzip layer blobs and return a source
    /// pointing at it.
    pub fn insert(&self, reference: &str, arch: &str, layers: Vec<Vec<u8>>) -> ImageSource {
        self.insert_with_env(reference, arch, layers, &[])
    }

    /// Like [`Self::insert`], also recording environment variables in the
    /// image configuration.
    pub fn insert_with_env(
        &self,
        reference: &str,
        arch: &str,
        layers: Vec<Vec<u8>>,
        env: &[&str],
    ) -> ImageSource {
        let mut inner = self.inner.lock().unwrap();
        let mut descriptors = Vec::new();
        let mut diff_ids = Vec::new();
        for blob in layers {
            let digest = digest_of(&blob);
            let mut tar = Vec::new();
            let diff_id = match flate2::read::GzDecoder::new(blob.as_slice()).read_to_end(&mut tar) {
                Ok(_) => digest_of(&tar),
                Err(_) => digest.clone(),
            };
            descriptors.push(
                DescriptorBuilder::default()
                    .media_type(MediaType::ImageLayerGzip)
                    .size(blob.len() as u64)
                    .digest(Digest::from_str(&digest).unwrap())
                    .build()
                    .unwrap(),
            );
            diff_ids.push(diff_id);
            inner.blobs.insert(digest, blob);
        }
        let inner_config = ConfigBuilder::default()
            .env(env.iter().map(|s| s.to_string()).collect::<Vec<_>>())
            .build()
            .unwrap();
        let config = ImageConfigurationBuilder::default()
            .architecture(Arch::from(arch))
            .os(Os::Linux)
            .config(inner_config)
            .rootfs(
                RootFsBuilder::default()
                    .typ("layers")
                    .diff_ids(diff_ids)
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        let config_blob = serde_json::to_vec(&config).unwrap();
        let config_digest = digest_of(&config_blob);
        let config_desc = DescriptorBuilder::default()
            .media_type(MediaType::ImageConfig)
            .size(config_blob.len() as u64)
            .digest(Digest::from_str(&config_digest).unwrap())
            .build()
            .unwrap();
        inner.blobs.insert(config_digest, config_blob);
        let manifest = ImageManifestBuilder::default()
            .schema_version(SCHEMA_VERSION)
            .media_type(MediaType::ImageManifest)
            .config(config_desc)
            .layers(descriptors)
            .build()
            .unwrap();
        let manifest_digest = digest_of(&serde_json::to_vec(&manifest).unwrap());
        inner.images.insert(
            reference.to_owned(),
            Stored {
                manifest,
                manifest_digest,
                config,
            },
        );
        ImageSource::Registry {
            reference: reference.to_owned(),
            insecure: false,
        }
    }

    /// Fail the next `n` pulls with a transient error.
    pub fn fail_next_pulls(&self, n: u32) {
        self.inner.lock().unwrap().transient_failures = n;
    }

    /// Every reference pulled so far, in order.
    pub fn pulls(&self) -> Vec<String> {
        self.inner.lock().unwrap().pulls.clone()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn pull(&self, source: &ImageSource, arch: &str) -> Result<PulledImage> {
        let mut inner = self.inner.lock().unwrap();
        let reference = source.to_string();
        inner.pulls.push(reference.clone());
        if inner.transient_failures > 0 {
            inner.transient_failures -= 1;
            return Err(RegistryError::Transient("connection reset by peer".into()).into());
        }
        let stored = inner
            .images
            .get(&reference)
            .ok_or_else(|| RegistryError::Permanent(format!("{reference}: manifest unknown")))?;
        let found = stored.config.architecture().to_string();
        if found != arch {
            return Err(RegistryError::Permanent(format!(
                "{reference} is built for {found}, not {arch}"
            ))
            .into());
        }
        Ok(PulledImage {
            source: source.clone(),
            manifest: stored.manifest.clone(),
            manifest_digest: stored.manifest_digest.clone(),
            config: stored.config.clone(),
            arch: arch.to_owned(),
        })
    }

    async fn copy_blob(
        &self,
        _image: &PulledImage,
        descriptor: &Descriptor,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        let digest = descriptor.digest().to_string();
        let blob = self
            .inner
            .lock()
            .unwrap()
            .blobs
            .get(&digest)
            .cloned()
            .with_context(|| format!("blob unknown: {digest}"))?;
        sink.write_all(&blob).await?;
        Ok(())
    }
}
