//! Streaming byte consumers and producers.
//!
//! The store drains NARs, hashes while streaming and interposes
//! (de)compression by composing small decorators over two traits rather
//! than building writer hierarchies.

use anyhow::Result;

use crate::hash::{Hash, HashAlgo};

pub mod compression;
pub mod framed;

pub use compression::{compress, CompressionAlgo, DecompressionSink};

/// A streaming byte consumer.
pub trait Sink {
    fn write(&mut self, data: &[u8]) -> Result<()>;
}

/// A streaming byte producer. `read` returns 0 at end of stream.
pub trait Source {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Pull the remainder of the stream into memory.
    fn drain(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = self.read(&mut buf)?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }
}

/// Read exactly `buf.len()` bytes or fail.
pub fn read_exact(source: &mut dyn Source, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..])?;
        if n == 0 {
            return Err(crate::FormatError("unexpected end of stream".into()).into());
        }
        filled += n;
    }
    Ok(())
}

/// Sink that accumulates into a buffer.
#[derive(Debug, Default)]
pub struct VecSink {
    pub bytes: Vec<u8>,
}

impl Sink for VecSink {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.bytes.extend_from_slice(data);
        Ok(())
    }
}

/// Sink wrapping a closure; used to interpose counting or forwarding
/// behavior without naming a type.
pub struct FnSink<F: FnMut(&[u8]) -> Result<()>>(pub F);

impl<F: FnMut(&[u8]) -> Result<()>> Sink for FnSink<F> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        (self.0)(data)
    }
}

/// Counts bytes on their way into an inner sink.
pub struct CountingSink<'a> {
    inner: &'a mut dyn Sink,
    count: u64,
}

impl<'a> CountingSink<'a> {
    pub fn new(inner: &'a mut dyn Sink) -> Self {
        Self { inner, count: 0 }
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }
}

impl Sink for CountingSink<'_> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.inner.write(data)?;
        self.count += data.len() as u64;
        Ok(())
    }
}

/// Hashes bytes as they stream through, keeping a running length.
pub struct HashSink {
    hasher: Hasher,
    len: u64,
}

enum Hasher {
    Md5(md5::Md5),
    Sha1(sha1::Sha1),
    Sha256(sha2::Sha256),
    Sha512(sha2::Sha512),
}

impl HashSink {
    #[must_use]
    pub fn new(algo: HashAlgo) -> Self {
        use sha2::Digest as _;
        let hasher = match algo {
            HashAlgo::Md5 => Hasher::Md5(md5::Md5::new()),
            HashAlgo::Sha1 => Hasher::Sha1(sha1::Sha1::new()),
            HashAlgo::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
            HashAlgo::Sha512 => Hasher::Sha512(sha2::Sha512::new()),
        };
        Self { hasher, len: 0 }
    }

    /// Consume the sink, yielding the digest and total byte count.
    #[must_use]
    pub fn finish(self) -> (Hash, u64) {
        use sha2::Digest as _;
        let (algo, digest) = match self.hasher {
            Hasher::Md5(h) => (HashAlgo::Md5, h.finalize().to_vec()),
            Hasher::Sha1(h) => (HashAlgo::Sha1, h.finalize().to_vec()),
            Hasher::Sha256(h) => (HashAlgo::Sha256, h.finalize().to_vec()),
            Hasher::Sha512(h) => (HashAlgo::Sha512, h.finalize().to_vec()),
        };
        let hash = Hash::from_bytes(algo, digest).expect("digest length matches algorithm");
        (hash, self.len)
    }
}

impl Sink for HashSink {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        use sha2::Digest as _;
        match &mut self.hasher {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
        self.len += data.len() as u64;
        Ok(())
    }
}

/// Source over a borrowed byte slice.
pub struct SliceSource<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SliceSource<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl Source for SliceSource<'_> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_reads_to_the_end() -> Result<()> {
        let data: Vec<u8> = (0..=255u8).cycle().take(20_000).collect();
        let mut src = SliceSource::new(&data);
        assert_eq!(src.drain()?, data);
        Ok(())
    }

    #[test]
    fn counting_sink_tracks_length() -> Result<()> {
        let mut inner = VecSink::default();
        let mut counting = CountingSink::new(&mut inner);
        counting.write(b"abc")?;
        counting.write(b"defg")?;
        assert_eq!(counting.count(), 7);
        assert_eq!(inner.bytes, b"abcdefg");
        Ok(())
    }

    #[test]
    fn fn_sink_forwards_every_chunk() -> Result<()> {
        let mut seen = Vec::new();
        {
            let mut sink = FnSink(|data: &[u8]| {
                seen.extend_from_slice(data);
                Ok(())
            });
            sink.write(b"ab")?;
            sink.write(b"cd")?;
        }
        assert_eq!(seen, b"abcd");
        Ok(())
    }

    #[test]
    fn hash_sink_matches_one_shot() -> Result<()> {
        let mut sink = HashSink::new(HashAlgo::Sha256);
        sink.write(b"split ")?;
        sink.write(b"input")?;
        let (hash, len) = sink.finish();
        assert_eq!(len, 11);
        assert_eq!(hash, Hash::of_bytes(HashAlgo::Sha256, b"split input"));
        Ok(())
    }
}
