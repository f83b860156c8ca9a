//! Framed wire primitives shared by the NAR codec and the derivation
//! binary codec: little-endian u64 numbers and length-prefixed byte
//! strings padded to 8-byte boundaries.

use anyhow::Result;

use super::{read_exact, Sink, Source};
use crate::FormatError;

/// Refuse to allocate for absurd frame lengths.
const MAX_STRING_LEN: u64 = 1 << 33;

pub fn write_num(sink: &mut dyn Sink, n: u64) -> Result<()> {
    sink.write(&n.to_le_bytes())
}

pub fn write_bytes(sink: &mut dyn Sink, data: &[u8]) -> Result<()> {
    write_num(sink, data.len() as u64)?;
    sink.write(data)?;
    write_padding(sink, data.len() as u64)
}

pub fn write_string(sink: &mut dyn Sink, s: &str) -> Result<()> {
    write_bytes(sink, s.as_bytes())
}

pub fn write_string_list<S: AsRef<str>>(
    sink: &mut dyn Sink,
    items: impl ExactSizeIterator<Item = S>,
) -> Result<()> {
    write_num(sink, items.len() as u64)?;
    for item in items {
        write_string(sink, item.as_ref())?;
    }
    Ok(())
}

pub fn write_padding(sink: &mut dyn Sink, len: u64) -> Result<()> {
    let pad = (8 - len % 8) % 8;
    if pad > 0 {
        sink.write(&[0u8; 8][..pad as usize])?;
    }
    Ok(())
}

pub fn read_num(source: &mut dyn Source) -> Result<u64> {
    let mut buf = [0u8; 8];
    read_exact(source, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub fn read_bytes(source: &mut dyn Source) -> Result<Vec<u8>> {
    let len = read_num(source)?;
    if len > MAX_STRING_LEN {
        return Err(FormatError(format!("framed string of {len} bytes is too long")).into());
    }
    let mut data = vec![0u8; len as usize];
    read_exact(source, &mut data)?;
    read_padding(source, len)?;
    Ok(data)
}

pub fn read_string(source: &mut dyn Source) -> Result<String> {
    let data = read_bytes(source)?;
    String::from_utf8(data)
        .map_err(|e| FormatError(format!("framed string is not UTF-8: {e}")).into())
}

pub fn read_string_list(source: &mut dyn Source) -> Result<Vec<String>> {
    let n = read_num(source)?;
    let mut items = Vec::with_capacity(n.min(1024) as usize);
    for _ in 0..n {
        items.push(read_string(source)?);
    }
    Ok(items)
}

pub fn read_padding(source: &mut dyn Source, len: u64) -> Result<()> {
    let pad = (8 - len % 8) % 8;
    if pad > 0 {
        let mut buf = [0u8; 8];
        read_exact(source, &mut buf[..pad as usize])?;
        if buf[..pad as usize].iter().any(|&b| b != 0) {
            return Err(FormatError("non-zero padding in framed stream".into()).into());
        }
    }
    Ok(())
}
