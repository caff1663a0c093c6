//! PNG chunk injection: a `pHYs`, `tEXt` or `zTXt` chunk placed right before the first `IDAT`.
//!
//! Everything else in the stream is copied through untouched, so the image data and any chunk
//! after it stay byte-identical.

use crate::error::{CoreError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::write::DeflateEncoder;
use std::io::Write;

pub const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
const IDAT: &[u8; 4] = b"IDAT";
/// Reserved key that produces a `pHYs` chunk instead of a text chunk.
pub const DPI_KEY: &str = "dpi";
/// Key under which the editor stores its diagram source.
pub const DIAGRAM_KEY: &str = "mxGraphModel";
const MAX_KEYWORD_LEN: usize = 79;
/// 100 DPI in pixels per meter.
const DEFAULT_PIXELS_PER_METER: u32 = 3937;
const INCH_IN_METERS: f64 = 0.0254;

/// Output of [`inject_chunk`]: raw bytes or, on request, base64 text for IPC transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PngOutput {
    Bytes(Vec<u8>),
    Base64(String),
}

impl PngOutput {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Bytes(bytes) => bytes,
            Self::Base64(text) => text.into_bytes(),
        }
    }
}

/// A chunk as it sits in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRef<'a> {
    pub kind: [u8; 4],
    pub data: &'a [u8],
    pub crc: u32,
    /// Offset of the chunk's length field.
    pub offset: usize,
}

impl ChunkRef<'_> {
    /// Length field + type + data + CRC.
    pub fn encoded_len(&self) -> usize {
        12 + self.data.len()
    }
}

/// Walks the chunk sequence after the signature. Fails on a bad signature or a truncated chunk.
pub fn chunks(png: &[u8]) -> Result<Vec<ChunkRef<'_>>> {
    check_signature(png)?;
    let mut offset = PNG_SIGNATURE.len();
    let mut out = Vec::new();
    while offset < png.len() {
        let chunk = read_chunk(png, offset)?;
        offset += chunk.encoded_len();
        out.push(chunk);
    }
    Ok(out)
}

fn check_signature(png: &[u8]) -> Result<()> {
    if png.len() < PNG_SIGNATURE.len() || png[..PNG_SIGNATURE.len()] != PNG_SIGNATURE {
        return Err(CoreError::MalformedPng("bad signature".into()));
    }
    Ok(())
}

fn read_chunk(png: &[u8], offset: usize) -> Result<ChunkRef<'_>> {
    let header = png
        .get(offset..offset + 8)
        .ok_or_else(|| CoreError::MalformedPng(format!("truncated chunk header at {offset}")))?;
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let kind = [header[4], header[5], header[6], header[7]];
    let data_start = offset + 8;
    let data = png
        .get(data_start..data_start + len)
        .ok_or_else(|| CoreError::MalformedPng(format!("truncated chunk data at {offset}")))?;
    let crc_bytes = png
        .get(data_start + len..data_start + len + 4)
        .ok_or_else(|| CoreError::MalformedPng(format!("missing chunk CRC at {offset}")))?;
    Ok(ChunkRef {
        kind,
        data,
        crc: u32::from_be_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]),
        offset,
    })
}

/// PNG chunk CRC over type tag and payload.
pub fn chunk_crc(kind: &[u8; 4], data: &[u8]) -> u32 {
    let mut crc = flate2::Crc::new();
    crc.update(kind);
    crc.update(data);
    crc.sum()
}

/// Pixels per meter for a DPI value given as text; falls back to 100 DPI.
pub fn pixels_per_meter(dpi: &str) -> u32 {
    match leading_int(dpi) {
        Some(dpi) if dpi > 0 => {
            let ppm = (dpi as f64 / INCH_IN_METERS).round();
            if ppm >= 1.0 && ppm <= u32::MAX as f64 {
                ppm as u32
            } else {
                DEFAULT_PIXELS_PER_METER
            }
        }
        _ => DEFAULT_PIXELS_PER_METER,
    }
}

/// Integer prefix of `text` after leading whitespace, e.g. `"96.5dpi"` is 96.
fn leading_int(text: &str) -> Option<i64> {
    let text = text.trim_start();
    let (sign, digits) = match text.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, text.strip_prefix('+').unwrap_or(text)),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end].parse::<i64>().ok().map(|v| v * sign)
}

fn validate_keyword(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEYWORD_LEN || key.contains('\0') {
        return Err(CoreError::InvalidKeyword(format!(
            "{key:?} must be 1-{MAX_KEYWORD_LEN} bytes without NUL"
        )));
    }
    Ok(())
}

/// Builds the chunk type and payload to insert.
fn build_chunk(key: &str, text: &str, compressed: bool) -> Result<([u8; 4], Vec<u8>)> {
    if key == DPI_KEY {
        let ppm = pixels_per_meter(text).to_be_bytes();
        let mut data = Vec::with_capacity(9);
        data.extend_from_slice(&ppm);
        data.extend_from_slice(&ppm);
        data.push(1); // unit: meter
        return Ok((*b"pHYs", data));
    }

    validate_keyword(key)?;
    let mut data = Vec::with_capacity(key.len() + text.len() + 2);
    data.extend_from_slice(key.as_bytes());
    data.push(0);
    if compressed {
        data.push(0); // compression method: deflate
        let mut encoder = DeflateEncoder::new(data, Compression::default());
        encoder
            .write_all(urlencoding::encode(text).as_bytes())
            .and_then(|_| encoder.finish())
            .map(|data| (*b"zTXt", data))
            .map_err(|e| CoreError::MalformedPng(format!("deflate failed: {e}")))
    } else {
        data.extend_from_slice(text.as_bytes());
        Ok((*b"tEXt", data))
    }
}

/// Inserts a metadata chunk before the first `IDAT` chunk of `png`.
///
/// `key == "dpi"` writes a `pHYs` chunk from the DPI in `text`. Any other key writes `tEXt`, or
/// `zTXt` with a percent-encoded, deflated payload when `compressed` is set.
pub fn inject_chunk(
    png: &[u8],
    key: &str,
    text: &str,
    compressed: bool,
    base64_encode: bool,
) -> Result<PngOutput> {
    check_signature(png)?;
    let (kind, data) = build_chunk(key, text, compressed)?;

    let mut offset = PNG_SIGNATURE.len();
    let idat_offset = loop {
        if offset >= png.len() {
            return Err(CoreError::MalformedPng("no IDAT chunk".into()));
        }
        let chunk = read_chunk(png, offset)?;
        if &chunk.kind == IDAT {
            break offset;
        }
        offset += chunk.encoded_len();
    };

    let chunk_len = u32::try_from(data.len())
        .map_err(|_| CoreError::MalformedPng("chunk payload too large".into()))?;
    let mut out = Vec::with_capacity(png.len() + data.len() + 12);
    out.extend_from_slice(&png[..idat_offset]);
    out.extend_from_slice(&chunk_len.to_be_bytes());
    out.extend_from_slice(&kind);
    out.extend_from_slice(&data);
    out.extend_from_slice(&chunk_crc(&kind, &data).to_be_bytes());
    out.extend_from_slice(&png[idat_offset..]);

    tracing::debug!(
        chunk = %String::from_utf8_lossy(&kind),
        key,
        len = data.len(),
        "injected PNG chunk"
    );

    Ok(if base64_encode {
        PngOutput::Base64(STANDARD.encode(&out))
    } else {
        PngOutput::Bytes(out)
    })
}
