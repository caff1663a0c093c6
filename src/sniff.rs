//! Header-byte content sniffing.
//!
//! A cheap gate, not a validator: it only has to stop obviously wrong payloads (empty strings,
//! truncated responses) from replacing or deleting a user's document. Signatures are checked
//! in table order; the first match wins.

use crate::model::{Encoding, FileData};
use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};

/// Bytes inspected from a binary payload or decoded from a text one.
const HEAD_LEN: usize = 16;
/// Base64 characters decoded for the head (enough to cover `HEAD_LEN` bytes).
const BASE64_HEAD_CHARS: usize = 24;

const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Html,
    Xml,
    Svg,
    Pdf,
    Png,
    Jpeg,
    Webp,
    Zip,
    Json,
    MxDiagram,
}

#[derive(Debug, Clone, Copy)]
enum Pattern {
    /// Exact leading bytes.
    Prefix(&'static [u8]),
    /// Leading bytes, ASCII case-insensitive.
    PrefixNoCase(&'static [u8]),
    /// Every `(offset, bytes)` part must match.
    Parts(&'static [(usize, &'static [u8])]),
}

impl Pattern {
    fn matches(&self, head: &[u8]) -> bool {
        match *self {
            Self::Prefix(bytes) => head.starts_with(bytes),
            Self::PrefixNoCase(bytes) => {
                head.len() >= bytes.len() && head[..bytes.len()].eq_ignore_ascii_case(bytes)
            }
            Self::Parts(parts) => parts.iter().all(|&(offset, bytes)| {
                head.get(offset..offset + bytes.len())
                    .is_some_and(|window| window == bytes)
            }),
        }
    }
}

const SIGNATURES: &[(Pattern, ContentKind)] = &[
    (Pattern::Prefix(b"<!"), ContentKind::Html),
    (Pattern::PrefixNoCase(b"<html"), ContentKind::Html),
    (Pattern::PrefixNoCase(b"<head"), ContentKind::Html),
    (Pattern::PrefixNoCase(b"<body"), ContentKind::Html),
    (Pattern::Prefix(b"<?xml "), ContentKind::Xml),
    (Pattern::Prefix(b"<svg "), ContentKind::Svg),
    (Pattern::PrefixNoCase(b"<img "), ContentKind::Html),
    (Pattern::PrefixNoCase(b"<iframe "), ContentKind::Html),
    // UTF-8 BOM
    (Pattern::Prefix(b"\xEF\xBB\xBF<?x"), ContentKind::Xml),
    // UTF-16 BE / LE
    (Pattern::Prefix(b"\xFE\xFF\0<\0?\0x"), ContentKind::Xml),
    (Pattern::Prefix(b"\xFF\xFE<\0?\0x\0"), ContentKind::Xml),
    // UTF-32 BE / LE
    (
        Pattern::Prefix(b"\0\0\xFE\xFF\0\0\0<\0\0\0?\0\0\0x"),
        ContentKind::Xml,
    ),
    (
        Pattern::Prefix(b"\xFF\xFE\0\0<\0\0\0?\0\0\0x\0\0\0"),
        ContentKind::Xml,
    ),
    (Pattern::Prefix(b"%PDF-"), ContentKind::Pdf),
    (Pattern::Prefix(b"\x89PNG\r\n\x1a\n"), ContentKind::Png),
    // PNG+XML produced by the editor itself
    (Pattern::Prefix(b"\xC2\x89PNG\r\n\x1a\n"), ContentKind::Png),
    (Pattern::Prefix(b"\xFF\xD8\xFF\xE0"), ContentKind::Jpeg),
    (Pattern::Prefix(b"\xFF\xD8\xFF\xEE"), ContentKind::Jpeg),
    (
        Pattern::Parts(&[
            (0, b"\xFF\xD8\xFF\xE1".as_slice()),
            (6, b"Exif\0".as_slice()),
        ]),
        ContentKind::Jpeg,
    ),
    (
        Pattern::Parts(&[(0, b"RIFF".as_slice()), (8, b"WEBP".as_slice())]),
        ContentKind::Webp,
    ),
    // vsdx, vssx, zip, jar, odt, docx, xlsx, pptx, ...
    (Pattern::Prefix(b"PK\x03\x04"), ContentKind::Zip),
    (Pattern::Prefix(b"PK\x03\x06"), ContentKind::Zip),
    (Pattern::Prefix(b"{"), ContentKind::Json),
    (Pattern::Prefix(b"["), ContentKind::Json),
    // mxfile, mxlibrary, mxGraphModel
    (Pattern::Prefix(b"<mx"), ContentKind::MxDiagram),
];

/// Classifies raw header bytes.
pub fn sniff_bytes(bytes: &[u8]) -> Option<ContentKind> {
    let head = &bytes[..bytes.len().min(HEAD_LEN)];
    SIGNATURES
        .iter()
        .find(|(pattern, _)| pattern.matches(head))
        .map(|&(_, kind)| kind)
}

/// Classifies a payload as it would be written with `encoding`.
pub fn sniff(data: &FileData, encoding: Option<Encoding>) -> Option<ContentKind> {
    match data {
        FileData::Binary(bytes) => sniff_bytes(bytes),
        FileData::Text(text) => sniff_bytes(&text_head(text, encoding.unwrap_or_default())?),
    }
}

/// True when the payload plausibly is a document. Never fails: unknown means `false`.
pub fn check_file_content(data: &FileData, encoding: Option<Encoding>) -> bool {
    sniff(data, encoding).is_some()
}

fn text_head(text: &str, encoding: Encoding) -> Option<Vec<u8>> {
    match encoding {
        Encoding::Base64 => {
            let trimmed = text.trim_start();
            let mut head: String = trimmed.chars().take(BASE64_HEAD_CHARS).collect();
            // Non-ASCII can never be base64.
            if !head.is_ascii() {
                return None;
            }
            if head.len() < trimmed.len() {
                head.truncate(head.len() - head.len() % 4);
            }
            LENIENT_BASE64.decode(head.trim_end()).ok()
        }
        Encoding::Utf8 => {
            let end = text
                .char_indices()
                .nth(HEAD_LEN)
                .map_or(text.len(), |(idx, _)| idx);
            Some(text.as_bytes()[..end].to_vec())
        }
        Encoding::Latin1 => Some(text.chars().take(HEAD_LEN).map(|c| c as u32 as u8).collect()),
    }
}
