//! Error taxonomy shared by the save, draft and export paths.
//!
//! Every fatal failure reaches the caller as a [`CoreError`]; the IPC layer flattens it to a
//! `(kind, message)` pair via [`CoreError::kind`].

use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Sniffer rejection, undecodable payload, or a path under the application's base dir.
    #[error("Invalid file data")]
    InvalidContent,

    /// The file on disk changed since the caller last read it.
    #[error("conflict")]
    Conflict,

    /// Read-back after write kept mismatching.
    #[error("all saving trials failed")]
    WriteVerificationFailed,

    #[error("malformed PNG: {0}")]
    MalformedPng(String),

    /// PNG text keywords must be 1-79 bytes without NUL.
    #[error("invalid PNG keyword: {0}")]
    InvalidKeyword(String),

    #[error("render error: {0}")]
    Render(String),

    #[error("Error during PDF combination: {0}")]
    Assembly(String),

    #[error("invalid export request: {0}")]
    InvalidRequest(String),

    #[error("fileExists")]
    FileExists(PathBuf),

    #[error("failed to {operation} {}", path.display())]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Serialisable discriminant used for structured failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    InvalidContent,
    Conflict,
    WriteVerificationFailed,
    MalformedPng,
    InvalidKeyword,
    RenderError,
    AssemblyError,
    InvalidRequest,
    FileExists,
    Io,
}

impl CoreError {
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidContent => ErrorKind::InvalidContent,
            Self::Conflict => ErrorKind::Conflict,
            Self::WriteVerificationFailed => ErrorKind::WriteVerificationFailed,
            Self::MalformedPng(_) => ErrorKind::MalformedPng,
            Self::InvalidKeyword(_) => ErrorKind::InvalidKeyword,
            Self::Render(_) => ErrorKind::RenderError,
            Self::Assembly(_) => ErrorKind::AssemblyError,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::FileExists(_) => ErrorKind::FileExists,
            Self::Io { .. } => ErrorKind::Io,
        }
    }

    /// True when the underlying I/O error is "not found".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
