//! Autosave drafts kept next to the document as `.$<name>[_<n>].dtmp`.
//!
//! Drafts are best-effort: written once without read-back, and skipped when unreadable on
//! listing. Listing also migrates drafts left under the legacy `~$` prefix.

use crate::error::Result;
use crate::model::{DocumentHandle, Draft, Encoding, FileData, FileStat};
use crate::paths;
use crate::store::{FileStore, mark_hidden, write_synced};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

async fn exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

/// First slot of the numbered sequence with no file on disk.
pub async fn free_draft_path(path: &Path) -> PathBuf {
    let mut index = 0;
    loop {
        let candidate = paths::draft_path(path, index);
        if !exists(&candidate).await {
            return candidate;
        }
        index += 1;
    }
}

impl FileStore {
    /// Writes a draft, reusing `handle.draft_file_name` when the caller already has one.
    pub async fn save_draft(&self, handle: &DocumentHandle, data: &FileData) -> Result<PathBuf> {
        let draft = match &handle.draft_file_name {
            Some(draft) => draft.clone(),
            None => free_draft_path(&handle.path).await,
        };
        self.admit(data, Some(Encoding::Utf8), &draft)?;
        let bytes = Encoding::Utf8.encode(data)?;
        write_synced(&draft, &bytes).await?;
        mark_hidden(&draft);
        debug!(path = %draft.display(), "saved draft");
        Ok(draft)
    }

    /// Drafts of `handle.path`: the contiguous current sequence, then any migrated legacy ones.
    pub async fn get_file_drafts(&self, handle: &DocumentHandle) -> Vec<Draft> {
        let path = handle.path.as_path();
        let mut found = Vec::new();

        let mut index = 0;
        loop {
            let candidate = paths::draft_path(path, index);
            if !exists(&candidate).await {
                break;
            }
            found.push(candidate);
            index += 1;
        }

        let mut legacy_index = 0;
        loop {
            let legacy = paths::legacy_draft_path(path, legacy_index);
            if !exists(&legacy).await {
                break;
            }
            // Never overwrite: the first free slot keeps the sequence contiguous.
            let target = free_draft_path(path).await;
            match fs::rename(&legacy, &target).await {
                Ok(()) => {
                    info!(from = %legacy.display(), to = %target.display(), "migrated legacy draft");
                    found.push(target);
                }
                Err(err) => {
                    warn!(path = %legacy.display(), error = %err, "legacy draft migration failed");
                }
            }
            legacy_index += 1;
        }

        let mut drafts = Vec::with_capacity(found.len());
        for draft in found {
            match read_draft(&draft).await {
                Ok(entry) => drafts.push(entry),
                Err(err) => debug!(path = %draft.display(), error = %err, "skipping draft"),
            }
        }
        drafts
    }
}

async fn read_draft(path: &Path) -> std::io::Result<Draft> {
    let meta = fs::symlink_metadata(path).await?;
    let stat = FileStat::from_metadata(&meta);
    let data = fs::read_to_string(path).await?;
    Ok(Draft {
        data,
        created: stat.ctime_ms,
        modified: stat.mtime_ms,
        path: path.to_path_buf(),
    })
}
