//! Compression for spill segments (feature-gated backends).

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Codec {
    None = 0,
    Zstd = 1,
    Lz4 = 2,
}

impl Codec {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Codec::None),
            1 => Ok(Codec::Zstd),
            2 => Ok(Codec::Lz4),
            other => Err(Error::CodecUnsupported(format!("codec tag {other}"))),
        }
    }

    /// Parse the configuration name (`none`, `zstd`, `lz4`). Fails if the
    /// backend was not compiled in.
    pub fn from_name(name: &str) -> Result<Self> {
        let codec = match name.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Codec::None,
            "zstd" => Codec::Zstd,
            "lz4" => Codec::Lz4,
            other => return Err(Error::CodecUnsupported(other.to_string())),
        };
        if !codec.is_available() {
            return Err(Error::CodecUnsupported(format!(
                "{} (feature not enabled)",
                codec.name()
            )));
        }
        Ok(codec)
    }

    pub fn name(self) -> &'static str {
        match self {
            Codec::None => "none",
            Codec::Zstd => "zstd",
            Codec::Lz4 => "lz4",
        }
    }

    pub fn is_available(self) -> bool {
        match self {
            Codec::None => true,
            Codec::Zstd => cfg!(feature = "zstd"),
            Codec::Lz4 => cfg!(feature = "lz4"),
        }
    }
}

pub fn compress(codec: Codec, input: &[u8]) -> Result<Vec<u8>> {
    match codec {
        Codec::None => Ok(input.to_vec()),
        Codec::Zstd => zstd_compress(input),
        Codec::Lz4 => lz4_compress(input),
    }
}

pub fn decompress(codec: Codec, input: &[u8]) -> Result<Vec<u8>> {
    match codec {
        Codec::None => Ok(input.to_vec()),
        Codec::Zstd => zstd_decompress(input),
        Codec::Lz4 => lz4_decompress(input),
    }
}

#[cfg(feature = "zstd")]
fn zstd_compress(input: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    zstd::stream::copy_encode(input, &mut out, 3).map_err(|e| Error::Codec(format!("zstd: {e}")))?;
    Ok(out)
}

#[cfg(feature = "zstd")]
fn zstd_decompress(input: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    zstd::stream::copy_decode(input, &mut out).map_err(|e| Error::Codec(format!("zstd: {e}")))?;
    Ok(out)
}

#[cfg(not(feature = "zstd"))]
fn zstd_compress(_input: &[u8]) -> Result<Vec<u8>> {
    Err(Error::CodecUnsupported("zstd".into()))
}

#[cfg(not(feature = "zstd"))]
fn zstd_decompress(_input: &[u8]) -> Result<Vec<u8>> {
    Err(Error::CodecUnsupported("zstd".into()))
}

#[cfg(feature = "lz4")]
fn lz4_compress(input: &[u8]) -> Result<Vec<u8>> {
    Ok(lz4_flex::compress_prepend_size(input))
}

#[cfg(feature = "lz4")]
fn lz4_decompress(input: &[u8]) -> Result<Vec<u8>> {
    lz4_flex::decompress_size_prepended(input).map_err(|e| Error::Codec(format!("lz4: {e}")))
}

#[cfg(not(feature = "lz4"))]
fn lz4_compress(_input: &[u8]) -> Result<Vec<u8>> {
    Err(Error::CodecUnsupported("lz4".into()))
}

#[cfg(not(feature = "lz4"))]
fn lz4_decompress(_input: &[u8]) -> Result<Vec<u8>> {
    Err(Error::CodecUnsupported("lz4".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        assert_eq!(Codec::from_name("none").unwrap(), Codec::None);
        assert_eq!(Codec::from_name("").unwrap(), Codec::None);
        assert!(Codec::from_name("snappy").is_err());
        assert_eq!(Codec::from_name("zstd").is_ok(), cfg!(feature = "zstd"));
    }
}
