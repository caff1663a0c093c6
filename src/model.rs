use crate::error::{CoreError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fs::Metadata;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Text encodings accepted for file payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    #[serde(alias = "utf-8")]
    Utf8,
    Base64,
    #[serde(alias = "binary")]
    Latin1,
}

impl Encoding {
    /// Bytes that end up on disk for `data` written with this encoding.
    pub fn encode<'a>(&self, data: &'a FileData) -> Result<Cow<'a, [u8]>> {
        match data {
            FileData::Binary(bytes) => Ok(Cow::Borrowed(bytes.as_slice())),
            FileData::Text(text) => match self {
                Self::Utf8 => Ok(Cow::Borrowed(text.as_bytes())),
                Self::Base64 => STANDARD
                    .decode(text.trim())
                    .map(Cow::Owned)
                    .map_err(|_| CoreError::InvalidContent),
                Self::Latin1 => Ok(Cow::Owned(text.chars().map(|c| c as u32 as u8).collect())),
            },
        }
    }

    /// Inverse of [`Encoding::encode`] for data read back from disk.
    pub fn decode(&self, bytes: Vec<u8>) -> FileData {
        match self {
            Self::Utf8 => FileData::Text(match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
            }),
            Self::Base64 => FileData::Text(STANDARD.encode(bytes)),
            Self::Latin1 => FileData::Text(bytes.iter().map(|&b| b as char).collect()),
        }
    }
}

/// A payload crossing the core boundary: text (interpreted through an [`Encoding`]) or raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileData {
    Text(String),
    Binary(Vec<u8>),
}

impl From<&str> for FileData {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FileData {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<u8>> for FileData {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(value)
    }
}

/// Identifies a target file across a save's lifetime. Owned by the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentHandle {
    pub path: PathBuf,
    #[serde(default)]
    pub encoding: Option<Encoding>,
    /// Draft path chosen by an earlier `save_draft` call, reused on later ones.
    #[serde(default)]
    pub draft_file_name: Option<PathBuf>,
}

impl DocumentHandle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

/// Size and timestamps of a file, in the shape the editor keeps as its `origStat` baseline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStat {
    pub size: u64,
    pub mtime_ms: f64,
    pub ctime_ms: f64,
    #[serde(default)]
    pub is_file: bool,
}

impl FileStat {
    pub fn from_metadata(meta: &Metadata) -> Self {
        let mtime_ms = meta.modified().map(millis).unwrap_or(0.0);
        Self {
            size: meta.len(),
            mtime_ms,
            ctime_ms: change_time_ms(meta).unwrap_or(mtime_ms),
            is_file: meta.is_file(),
        }
    }
}

/// True when the live file's modification time no longer matches the caller's baseline.
pub fn is_conflict(orig: Option<&FileStat>, current: Option<&FileStat>) -> bool {
    match (orig, current) {
        (Some(orig), Some(current)) => orig.mtime_ms != current.mtime_ms,
        _ => false,
    }
}

fn millis(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}

#[cfg(unix)]
fn change_time_ms(meta: &Metadata) -> Option<f64> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.ctime() as f64 * 1000.0 + meta.ctime_nsec() as f64 / 1_000_000.0)
}

#[cfg(not(unix))]
fn change_time_ms(meta: &Metadata) -> Option<f64> {
    meta.created().ok().map(millis)
}

/// One recovered autosave snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub data: String,
    pub created: f64,
    pub modified: f64,
    pub path: PathBuf,
}
