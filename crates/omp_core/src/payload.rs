//! Science-program payload encoding.
//!
//! # Responsibility
//! - Decode submitted payloads, inflating gzip data detected by magic bytes.
//! - Encode returned payloads as plain text or gzip per the caller's choice.
//! - Compress stored program blobs above the configured threshold.
//!
//! # Invariants
//! - Writes sniff content (`1f 8b`); reads never do, the return format is
//!   chosen by the caller.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io::{Read, Write};

/// Gzip stream magic number.
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug)]
pub enum PayloadError {
    Compression(std::io::Error),
    Decompression(std::io::Error),
    NotUtf8(std::string::FromUtf8Error),
}

impl Display for PayloadError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Compression(err) => write!(f, "payload compression failed: {err}"),
            Self::Decompression(err) => write!(f, "payload decompression failed: {err}"),
            Self::NotUtf8(err) => write!(f, "payload is not valid UTF-8: {err}"),
        }
    }
}

impl Error for PayloadError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Compression(err) | Self::Decompression(err) => Some(err),
            Self::NotUtf8(err) => Some(err),
        }
    }
}

/// Return encoding requested by a caller of a fetch operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnFormat {
    Plain,
    Compressed,
    /// Compress only above the configured threshold.
    #[default]
    Auto,
}

/// Encoded response payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Plain(String),
    Gzip(Vec<u8>),
}

impl Payload {
    pub fn is_compressed(&self) -> bool {
        matches!(self, Self::Gzip(_))
    }

    /// Returns the text, inflating compressed payloads.
    pub fn into_text(self) -> Result<String, PayloadError> {
        match self {
            Self::Plain(text) => Ok(text),
            Self::Gzip(bytes) => decode_submission(&bytes),
        }
    }
}

pub fn is_gzip(bytes: &[u8]) -> bool {
    bytes.starts_with(&GZIP_MAGIC)
}

/// Decodes a submitted payload, inflating it when it starts with the gzip
/// magic number.
pub fn decode_submission(bytes: &[u8]) -> Result<String, PayloadError> {
    if !is_gzip(bytes) {
        return String::from_utf8(bytes.to_vec()).map_err(PayloadError::NotUtf8);
    }
    let mut decoder = GzDecoder::new(bytes);
    let mut inflated = Vec::new();
    decoder
        .read_to_end(&mut inflated)
        .map_err(PayloadError::Decompression)?;
    String::from_utf8(inflated).map_err(PayloadError::NotUtf8)
}

pub fn compress(text: &str) -> Result<Vec<u8>, PayloadError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(text.as_bytes())
        .map_err(PayloadError::Compression)?;
    encoder.finish().map_err(PayloadError::Compression)
}

/// Encodes `text` for return according to `format`.
pub fn encode_response(
    text: String,
    format: ReturnFormat,
    threshold_bytes: usize,
) -> Result<Payload, PayloadError> {
    let compress_it = match format {
        ReturnFormat::Plain => false,
        ReturnFormat::Compressed => true,
        ReturnFormat::Auto => text.len() > threshold_bytes,
    };
    if compress_it {
        Ok(Payload::Gzip(compress(&text)?))
    } else {
        Ok(Payload::Plain(text))
    }
}

/// Encodes a program document for storage: gzip above `threshold_bytes`.
pub fn encode_for_storage(text: &str, threshold_bytes: usize) -> Result<Vec<u8>, PayloadError> {
    if text.len() > threshold_bytes {
        compress(text)
    } else {
        Ok(text.as_bytes().to_vec())
    }
}
