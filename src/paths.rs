//! Sibling file names derived from a document path, and the base-directory exclusion rule.
//!
//! Drafts: `.$<name>[_<n>].dtmp` (legacy `~$...`). Backups: `.$<name>.bkp` (legacy `~$...`).

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

pub const DRAFT_PREFIX: &str = ".$";
pub const LEGACY_DRAFT_PREFIX: &str = "~$";
pub const DRAFT_EXT: &str = ".dtmp";
pub const BACKUP_PREFIX: &str = ".$";
pub const LEGACY_BACKUP_PREFIX: &str = "~$";
pub const BACKUP_EXT: &str = ".bkp";

fn sibling(path: &Path, prefix: &str, suffix: &str) -> PathBuf {
    let mut name = OsString::from(prefix);
    if let Some(base) = path.file_name() {
        name.push(base);
    }
    name.push(suffix);
    match path.parent() {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    }
}

fn draft_suffix(index: usize) -> String {
    if index == 0 {
        DRAFT_EXT.to_string()
    } else {
        format!("_{index}{DRAFT_EXT}")
    }
}

/// Draft slot `index` of the current scheme; slot 0 carries no numeric suffix.
pub fn draft_path(path: &Path, index: usize) -> PathBuf {
    sibling(path, DRAFT_PREFIX, &draft_suffix(index))
}

pub fn legacy_draft_path(path: &Path, index: usize) -> PathBuf {
    sibling(path, LEGACY_DRAFT_PREFIX, &draft_suffix(index))
}

pub fn backup_path(path: &Path) -> PathBuf {
    sibling(path, BACKUP_PREFIX, BACKUP_EXT)
}

pub fn legacy_backup_path(path: &Path) -> PathBuf {
    sibling(path, LEGACY_BACKUP_PREFIX, BACKUP_EXT)
}

/// Absolute form of `path` with `.` and `..` folded away, without touching the file system.
pub fn normalize(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Prefix(_) | Component::RootDir | Component::Normal(_) => {
                out.push(component.as_os_str());
            }
        }
    }
    out
}

/// True when `path` resolves to `base` or anything below it.
pub fn is_within(path: &Path, base: &Path) -> bool {
    normalize(path).starts_with(normalize(base))
}
