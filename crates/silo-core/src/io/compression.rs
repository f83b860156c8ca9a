//! Compression adapters over the store's algorithm set.
//!
//! Compression is one-shot (the NAR is already in memory when it runs);
//! decompression is a streaming sink so extraction can pipe straight into
//! the caller. Decompression sinks hold trailing state and must be
//! `finish()`ed on success paths.

use anyhow::{Context, Result};
use std::fmt;
use std::io::Write;
use std::str::FromStr;

use super::Sink;
use crate::FormatError;

/// Compression applied to stored blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionAlgo {
    None,
    #[default]
    Xz,
    Bzip2,
    Brotli,
}

impl CompressionAlgo {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Xz => "xz",
            Self::Bzip2 => "bzip2",
            Self::Brotli => "br",
        }
    }

    /// File extension appended to blob keys, empty for `none`.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Xz => ".xz",
            Self::Bzip2 => ".bz2",
            Self::Brotli => ".br",
        }
    }
}

impl fmt::Display for CompressionAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionAlgo {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "xz" => Ok(Self::Xz),
            "bzip2" => Ok(Self::Bzip2),
            "br" => Ok(Self::Brotli),
            other => Err(FormatError(format!("unknown compression method '{other}'")).into()),
        }
    }
}

const XZ_PRESET: u32 = 6;
const BROTLI_QUALITY: u32 = 6;
const BROTLI_WINDOW: u32 = 22;

/// Compress a buffer with the given algorithm. `parallel` enables the
/// multi-threaded xz encoder and is ignored for the other algorithms.
pub fn compress(algo: CompressionAlgo, data: &[u8], parallel: bool) -> Result<Vec<u8>> {
    match algo {
        CompressionAlgo::None => Ok(data.to_vec()),
        CompressionAlgo::Xz => {
            let mut encoder = if parallel {
                let threads = std::thread::available_parallelism()
                    .map(|n| n.get() as u32)
                    .unwrap_or(1);
                let stream = xz2::stream::MtStreamBuilder::new()
                    .preset(XZ_PRESET)
                    .threads(threads)
                    .encoder()
                    .context("failed to set up multi-threaded xz encoder")?;
                xz2::write::XzEncoder::new_stream(Vec::new(), stream)
            } else {
                xz2::write::XzEncoder::new(Vec::new(), XZ_PRESET)
            };
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
        CompressionAlgo::Bzip2 => {
            let mut encoder =
                bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
        CompressionAlgo::Brotli => {
            let mut encoder = brotli::CompressorWriter::new(
                Vec::new(),
                4096,
                BROTLI_QUALITY,
                BROTLI_WINDOW,
            );
            encoder.write_all(data)?;
            encoder.flush()?;
            Ok(encoder.into_inner())
        }
    }
}

/// Bridges a [`Sink`] into the `std::io::Write` world the decoder crates
/// expect.
pub struct SinkWriter<'a>(&'a mut dyn Sink);

impl Write for SinkWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .write(buf)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

enum Decoder<'a> {
    Passthrough(SinkWriter<'a>),
    Xz(xz2::write::XzDecoder<SinkWriter<'a>>),
    Bzip2(bzip2::write::BzDecoder<SinkWriter<'a>>),
    Brotli(Box<brotli::DecompressorWriter<SinkWriter<'a>>>),
}

/// Streaming decompressor writing into an inner sink.
pub struct DecompressionSink<'a> {
    decoder: Option<Decoder<'a>>,
}

impl<'a> DecompressionSink<'a> {
    pub fn new(algo: CompressionAlgo, inner: &'a mut dyn Sink) -> Self {
        let writer = SinkWriter(inner);
        let decoder = match algo {
            CompressionAlgo::None => Decoder::Passthrough(writer),
            CompressionAlgo::Xz => Decoder::Xz(xz2::write::XzDecoder::new(writer)),
            CompressionAlgo::Bzip2 => Decoder::Bzip2(bzip2::write::BzDecoder::new(writer)),
            CompressionAlgo::Brotli => {
                Decoder::Brotli(Box::new(brotli::DecompressorWriter::new(writer, 4096)))
            }
        };
        Self {
            decoder: Some(decoder),
        }
    }

    /// Flush trailing decoder state. Must run once after the final write;
    /// dropping without finishing discards buffered output.
    pub fn finish(mut self) -> Result<()> {
        match self.decoder.take().expect("finish called once") {
            Decoder::Passthrough(_) => Ok(()),
            Decoder::Xz(mut d) => {
                d.finish().context("truncated xz stream")?;
                Ok(())
            }
            Decoder::Bzip2(mut d) => {
                d.finish().context("truncated bzip2 stream")?;
                Ok(())
            }
            Decoder::Brotli(d) => match d.into_inner() {
                Ok(_) => Ok(()),
                Err(_) => Err(FormatError("truncated brotli stream".into()).into()),
            },
        }
    }
}

impl Sink for DecompressionSink<'_> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        match self.decoder.as_mut().expect("sink not finished") {
            Decoder::Passthrough(w) => w.write_all(data)?,
            Decoder::Xz(d) => d.write_all(data)?,
            Decoder::Bzip2(d) => d.write_all(data)?,
            Decoder::Brotli(d) => d.write_all(data)?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::VecSink;

    fn round_trip(algo: CompressionAlgo, parallel: bool) -> Result<()> {
        let data: Vec<u8> = (0..50_000u32).flat_map(|n| n.to_le_bytes()).collect();
        let compressed = compress(algo, &data, parallel)?;
        let mut out = VecSink::default();
        let mut sink = DecompressionSink::new(algo, &mut out);
        // Feed in uneven chunks to exercise decoder buffering.
        for chunk in compressed.chunks(1000) {
            sink.write(chunk)?;
        }
        sink.finish()?;
        assert_eq!(out.bytes, data, "{algo} round trip");
        Ok(())
    }

    #[test]
    fn all_algorithms_round_trip() -> Result<()> {
        for algo in [
            CompressionAlgo::None,
            CompressionAlgo::Xz,
            CompressionAlgo::Bzip2,
            CompressionAlgo::Brotli,
        ] {
            round_trip(algo, false)?;
        }
        Ok(())
    }

    #[test]
    fn parallel_xz_output_decompresses() -> Result<()> {
        round_trip(CompressionAlgo::Xz, true)
    }

    #[test]
    fn algo_names_parse_back() -> Result<()> {
        for algo in [
            CompressionAlgo::None,
            CompressionAlgo::Xz,
            CompressionAlgo::Bzip2,
            CompressionAlgo::Brotli,
        ] {
            assert_eq!(algo.as_str().parse::<CompressionAlgo>()?, algo);
        }
        assert!("zstd".parse::<CompressionAlgo>().is_err());
        Ok(())
    }
}
