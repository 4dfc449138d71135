//! Layer blob decompression keyed by OCI media type.

use std::io::{BufRead, BufReader, Read};

use crate::oci_spec::image::MediaType;

/// Uncompressed layer type reported for `docker-archive:` sources.
const DOCKER_LAYER_TAR: &str = "application/vnd.docker.image.rootfs.diff.tar";

/// Gzip layer type of Docker v2 schema 2 manifests.
const DOCKER_LAYER_TAR_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

type Source = BufReader<Box<dyn Read + Send>>;

enum Codec {
    Plain(Source),
    Gzip(flate2::bufread::GzDecoder<Source>),
    Zstd(zstd::stream::read::Decoder<'static, Source>),
}

/// Reads the uncompressed tar stream of a layer blob.
///
/// Call [`Decompressor::finish`] once the tar reader is done: it consumes
/// whatever trails the archive so the producer feeding the blob is never
/// left blocked on a full pipe. Dropping an unfinished decompressor does
/// the same, logging instead of failing.
pub(crate) struct Decompressor {
    codec: Codec,
    drained: bool,
}

impl std::fmt::Debug for Decompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let codec = match self.codec {
            Codec::Plain(_) => "plain",
            Codec::Gzip(_) => "gzip",
            Codec::Zstd(_) => "zstd",
        };
        f.debug_struct("Decompressor")
            .field("codec", &codec)
            .field("drained", &self.drained)
            .finish()
    }
}

impl Read for Decompressor {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.codec {
            Codec::Plain(r) => r.read(buf),
            Codec::Gzip(r) => r.read(buf),
            Codec::Zstd(r) => r.read(buf),
        }
    }
}

impl Drop for Decompressor {
    fn drop(&mut self) {
        if !self.drained {
            if let Err(e) = self.drain() {
                tracing::debug!("Draining layer stream: {e}");
            }
        }
    }
}

impl Decompressor {
    /// Wrap `src`, a blob of `media_type`.
    pub(crate) fn new(media_type: &MediaType, src: impl Read + Send + 'static) -> anyhow::Result<Self> {
        let src: Source = BufReader::new(Box::new(src));
        let codec = match media_type {
            MediaType::ImageLayer => Codec::Plain(src),
            MediaType::ImageLayerGzip => Codec::Gzip(flate2::bufread::GzDecoder::new(src)),
            MediaType::ImageLayerZstd => Codec::Zstd(zstd::stream::read::Decoder::with_buffer(src)?),
            MediaType::Other(t) if t == DOCKER_LAYER_TAR => Codec::Plain(src),
            MediaType::Other(t) if t == DOCKER_LAYER_TAR_GZIP => {
                Codec::Gzip(flate2::bufread::GzDecoder::new(src))
            }
            o => anyhow::bail!("Unsupported layer media type {o}"),
        };
        Ok(Self {
            codec,
            drained: false,
        })
    }

    fn source(&mut self) -> &mut Source {
        match &mut self.codec {
            Codec::Plain(r) => r,
            Codec::Gzip(r) => r.get_mut(),
            Codec::Zstd(r) => r.get_mut(),
        }
    }

    fn drain(&mut self) -> std::io::Result<u64> {
        self.drained = true;
        let src = self.source();
        let mut n = src.buffer().len() as u64;
        src.consume(n as usize);
        n += std::io::copy(src, &mut std::io::sink())?;
        Ok(n)
    }

    /// Consume the rest of the compressed stream.
    pub(crate) fn finish(mut self) -> anyhow::Result<()> {
        let n = self.drain()?;
        if n > 0 {
            tracing::debug!("Discarded {n} trailing bytes of layer stream");
        }
        Ok(())
    }
}
