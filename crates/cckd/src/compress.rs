//! Track-image compression codecs (spec §3 "Track Image": "Header byte
//! (compression kind: none, zlib, or bzip2)").

use std::io::{Read, Write};

use crate::error::{CckdError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionKind {
    None = 0,
    Zlib = 1,
    Bzip2 = 2,
}

impl CompressionKind {
    pub const MAX: u8 = 2;

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(b: u8) -> Result<Self> {
        match b {
            0 => Ok(CompressionKind::None),
            1 => Ok(CompressionKind::Zlib),
            2 => Ok(CompressionKind::Bzip2),
            other => Err(CckdError::UnknownCompression(other)),
        }
    }
}

pub fn compress(kind: CompressionKind, data: &[u8]) -> Result<Vec<u8>> {
    match kind {
        CompressionKind::None => Ok(data.to_vec()),
        CompressionKind::Zlib => {
            let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(data)?;
            Ok(enc.finish()?)
        }
        CompressionKind::Bzip2 => {
            let mut enc = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
            enc.write_all(data)?;
            Ok(enc.finish()?)
        }
    }
}

pub fn decompress(kind: CompressionKind, data: &[u8]) -> Result<Vec<u8>> {
    match kind {
        CompressionKind::None => Ok(data.to_vec()),
        CompressionKind::Zlib => {
            let mut dec = flate2::read::ZlibDecoder::new(data);
            let mut out = Vec::new();
            dec.read_to_end(&mut out)?;
            Ok(out)
        }
        CompressionKind::Bzip2 => {
            let mut dec = bzip2::read::BzDecoder::new(data);
            let mut out = Vec::new();
            dec.read_to_end(&mut out)?;
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_is_a_passthrough() {
        let data = b"home address + records".to_vec();
        let c = compress(CompressionKind::None, &data).unwrap();
        assert_eq!(c, data);
        assert_eq!(decompress(CompressionKind::None, &c).unwrap(), data);
    }

    #[test]
    fn zlib_roundtrips() {
        let data = vec![0xAAu8; 4096];
        let c = compress(CompressionKind::Zlib, &data).unwrap();
        assert!(c.len() < data.len());
        assert_eq!(decompress(CompressionKind::Zlib, &c).unwrap(), data);
    }

    #[test]
    fn bzip2_roundtrips() {
        let data = vec![0x55u8; 4096];
        let c = compress(CompressionKind::Bzip2, &data).unwrap();
        assert_eq!(decompress(CompressionKind::Bzip2, &c).unwrap(), data);
    }

    #[test]
    fn unknown_compression_byte_is_rejected() {
        assert!(CompressionKind::from_u8(9).is_err());
    }
}
