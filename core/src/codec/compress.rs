//! Compression methods negotiated per link

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use super::CodecError;

/// A compression method with its wire identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Compression {
    Bz2 = 0x10,
    Gzip = 0x11,
    Lzma = 0x12,
    Zlib = 0x13,
    Snappy = 0x20,
}

impl Compression {
    /// Every supported method, most preferred first
    pub const PREFERENCE: [Compression; 5] = [
        Compression::Snappy,
        Compression::Zlib,
        Compression::Gzip,
        Compression::Bz2,
        Compression::Lzma,
    ];

    pub fn from_u8(id: u8) -> Result<Self, CodecError> {
        match id {
            0x10 => Ok(Compression::Bz2),
            0x11 => Ok(Compression::Gzip),
            0x12 => Ok(Compression::Lzma),
            0x13 => Ok(Compression::Zlib),
            0x20 => Ok(Compression::Snappy),
            other => Err(CodecError::UnknownCompression(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn supported() -> Vec<Compression> {
        Self::PREFERENCE.to_vec()
    }

    pub fn name(self) -> &'static str {
        match self {
            Compression::Bz2 => "bz2",
            Compression::Gzip => "gzip",
            Compression::Lzma => "lzma",
            Compression::Zlib => "zlib",
            Compression::Snappy => "snappy",
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Parse a list of wire identifiers, dropping the ones this build does not know
pub fn from_ids<I: IntoIterator<Item = i64>>(ids: I) -> Vec<Compression> {
    ids.into_iter()
        .filter_map(|id| u8::try_from(id).ok())
        .filter_map(|id| Compression::from_u8(id).ok())
        .collect()
}

/// Methods of `preferred` that also appear in `other`, in `preferred` order
pub fn intersect(preferred: &[Compression], other: &[Compression]) -> Vec<Compression> {
    let mut out = Vec::new();
    for method in preferred {
        if other.contains(method) && !out.contains(method) {
            out.push(*method);
        }
    }
    out
}

fn io_err(e: std::io::Error) -> CodecError {
    CodecError::DecompressionFailed(e.to_string())
}

/// Compress `data` with `method`
pub fn compress(data: &[u8], method: Compression) -> Result<Vec<u8>, CodecError> {
    let pack_err = |e: std::io::Error| CodecError::Pack(format!("{} compression: {}", method, e));
    match method {
        Compression::Snappy => snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(|e| CodecError::Pack(e.to_string())),
        Compression::Zlib => {
            let mut enc =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(data).map_err(pack_err)?;
            enc.finish().map_err(pack_err)
        }
        Compression::Gzip => {
            let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(data).map_err(pack_err)?;
            enc.finish().map_err(pack_err)
        }
        Compression::Bz2 => {
            let mut enc = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
            enc.write_all(data).map_err(pack_err)?;
            enc.finish().map_err(pack_err)
        }
        Compression::Lzma => {
            let mut enc = xz2::write::XzEncoder::new(Vec::new(), 6);
            enc.write_all(data).map_err(pack_err)?;
            enc.finish().map_err(pack_err)
        }
    }
}

/// Decompress `data` that was produced by `compress(_, method)`
pub fn decompress(data: &[u8], method: Compression) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    match method {
        Compression::Snappy => {
            return snap::raw::Decoder::new()
                .decompress_vec(data)
                .map_err(|e| CodecError::DecompressionFailed(e.to_string()))
        }
        Compression::Zlib => {
            flate2::read::ZlibDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(io_err)?;
        }
        Compression::Gzip => {
            flate2::read::MultiGzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(io_err)?;
        }
        Compression::Bz2 => {
            bzip2::read::BzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(io_err)?;
        }
        Compression::Lzma => {
            xz2::read::XzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(io_err)?;
        }
    }
    Ok(out)
}
