//! Document persistence: verified saves with sibling backups, plus the plain file helpers the
//! editor calls (write, read, delete, stat).
//!
//! Every entry point that writes, deletes or hands back content goes through the same gate:
//! the payload must sniff as a document and the path must stay outside the install directory.

use crate::config::StorageConfig;
use crate::error::{CoreError, Result};
use crate::model::{DocumentHandle, Encoding, FileData, FileStat, is_conflict};
use crate::paths;
use crate::sniff;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Write-then-verify attempts before a save gives up.
pub const MAX_WRITE_ATTEMPTS: u32 = 3;
/// Header bytes read before agreeing to delete a file.
const DELETE_PROBE_LEN: u64 = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistsCheck {
    pub exists: bool,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct FileStore {
    app_base_dir: Option<PathBuf>,
    enable_backups: bool,
}

impl FileStore {
    pub fn new(config: &StorageConfig) -> Self {
        Self::with_base_dir(config.app_base_dir.clone(), config.enable_backups)
    }

    pub fn with_base_dir(app_base_dir: Option<PathBuf>, enable_backups: bool) -> Self {
        Self {
            app_base_dir,
            enable_backups,
        }
    }

    /// Rejects paths under the install directory.
    pub(crate) fn check_path(&self, path: &Path) -> Result<()> {
        match &self.app_base_dir {
            Some(base) if paths::is_within(path, base) => {
                warn!(path = %path.display(), "refusing path under the application directory");
                Err(CoreError::InvalidContent)
            }
            _ => Ok(()),
        }
    }

    /// Content and path gate shared by every write.
    pub(crate) fn admit(
        &self,
        data: &FileData,
        encoding: Option<Encoding>,
        path: &Path,
    ) -> Result<()> {
        if !sniff::check_file_content(data, encoding) {
            warn!(path = %path.display(), "refusing unrecognised content");
            return Err(CoreError::InvalidContent);
        }
        self.check_path(path)
    }

    /// Saves `data` over `handle.path`, returning the new stat as the caller's next baseline.
    ///
    /// Without `overwrite`, a live file whose mtime differs from `orig_stat` aborts with
    /// [`CoreError::Conflict`] before anything is touched, and an existing file is first copied
    /// to its `.bkp` sibling when backups are enabled. The write itself is read back and
    /// compared, up to [`MAX_WRITE_ATTEMPTS`] times.
    pub async fn save_file(
        &self,
        handle: &DocumentHandle,
        data: &FileData,
        orig_stat: Option<&FileStat>,
        overwrite: bool,
        def_enc: Option<Encoding>,
    ) -> Result<FileStat> {
        let path = handle.path.as_path();
        let encoding = def_enc.or(handle.encoding).unwrap_or_default();
        self.admit(data, Some(encoding), path)?;
        let bytes = encoding.encode(data)?;
        let bytes: &[u8] = &bytes;

        let is_new = if overwrite {
            true
        } else {
            let current = stat_if_exists(path).await?;
            if is_conflict(orig_stat, current.as_ref()) {
                info!(path = %path.display(), "save aborted, file changed on disk");
                return Err(CoreError::Conflict);
            }
            current.is_none()
        };

        let backup_created = if self.enable_backups && !is_new {
            self.write_backup(path).await
        } else {
            false
        };

        retry_verified(|_| write_and_verify(path, bytes)).await?;

        if backup_created {
            let legacy = paths::legacy_backup_path(path);
            if fs::try_exists(&legacy).await.unwrap_or(false) {
                if let Err(err) = fs::remove_file(&legacy).await {
                    debug!(path = %legacy.display(), error = %err, "legacy backup cleanup failed");
                }
            }
        }

        let stat = self.file_stat(path).await?;
        debug!(path = %path.display(), size = stat.size, "saved file");
        Ok(stat)
    }

    /// Copies the current file to its backup sibling. Failure only costs the backup.
    async fn write_backup(&self, path: &Path) -> bool {
        let backup = paths::backup_path(path);
        match copy_synced(path, &backup).await {
            Ok(()) => {
                mark_hidden(&backup);
                true
            }
            Err(err) => {
                warn!(path = %backup.display(), error = %err, "backup write failed");
                false
            }
        }
    }

    /// Plain gated write: no conflict check, no backup, no verification.
    pub async fn write_file(
        &self,
        path: &Path,
        data: &FileData,
        encoding: Option<Encoding>,
    ) -> Result<()> {
        self.admit(data, encoding, path)?;
        let bytes = encoding.unwrap_or_default().encode(data)?;
        write_synced(path, &bytes).await
    }

    /// Reads a file, refusing to return anything that does not sniff as a document.
    /// Without an encoding the raw bytes come back.
    pub async fn read_file(&self, path: &Path, encoding: Option<Encoding>) -> Result<FileData> {
        let bytes = fs::read(path)
            .await
            .map_err(|e| CoreError::io("read", path, e))?;
        if sniff::sniff_bytes(&bytes).is_none() {
            warn!(path = %path.display(), "read content not recognised");
            return Err(CoreError::InvalidContent);
        }
        self.check_path(path)?;
        Ok(match encoding {
            Some(encoding) => encoding.decode(bytes),
            None => FileData::Binary(bytes),
        })
    }

    /// Deletes a file only when its header sniffs as a document.
    pub async fn delete_file(&self, path: &Path) -> Result<()> {
        let file = fs::File::open(path)
            .await
            .map_err(|e| CoreError::io("open", path, e))?;
        let mut head = Vec::with_capacity(DELETE_PROBE_LEN as usize);
        file.take(DELETE_PROBE_LEN)
            .read_to_end(&mut head)
            .await
            .map_err(|e| CoreError::io("read", path, e))?;

        if sniff::sniff_bytes(&head).is_none() {
            warn!(path = %path.display(), "refusing to delete unrecognised file");
            return Err(CoreError::InvalidContent);
        }
        self.check_path(path)?;
        fs::remove_file(path)
            .await
            .map_err(|e| CoreError::io("delete", path, e))
    }

    pub async fn file_stat(&self, path: &Path) -> Result<FileStat> {
        let meta = fs::metadata(path)
            .await
            .map_err(|e| CoreError::io("stat", path, e))?;
        Ok(FileStat::from_metadata(&meta))
    }

    /// `false` for missing or read-only files; never fails.
    pub async fn is_file_writable(&self, path: &Path) -> bool {
        match fs::metadata(path).await {
            Ok(meta) => !meta.permissions().readonly(),
            Err(_) => false,
        }
    }

    pub async fn check_file_exists<S: AsRef<Path>>(&self, parts: &[S]) -> ExistsCheck {
        let path: PathBuf = parts.iter().map(AsRef::as_ref).collect();
        let exists = fs::try_exists(&path).await.unwrap_or(false);
        ExistsCheck { exists, path }
    }
}

/// Parent directory, `.` for a bare file name.
pub fn dirname(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

pub fn documents_folder() -> PathBuf {
    dirs::document_dir().unwrap_or_else(|| PathBuf::from("."))
}

async fn stat_if_exists(path: &Path) -> Result<Option<FileStat>> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(Some(FileStat::from_metadata(&meta))),
        Err(err) if err.kind() == IoErrorKind::NotFound => Ok(None),
        Err(err) => Err(CoreError::io("stat", path, err)),
    }
}

/// Create-or-truncate write, flushed and synced to storage before the handle is released.
pub(crate) async fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .await
        .map_err(|e| CoreError::io("open", path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| CoreError::io("write", path, e))?;
    file.flush()
        .await
        .map_err(|e| CoreError::io("flush", path, e))?;
    file.sync_all()
        .await
        .map_err(|e| CoreError::io("sync", path, e))
}

async fn copy_synced(from: &Path, to: &Path) -> Result<()> {
    let content = fs::read(from)
        .await
        .map_err(|e| CoreError::io("read", from, e))?;
    write_synced(to, &content).await
}

/// One write attempt; `Ok(false)` when the read-back differs.
async fn write_and_verify(path: &Path, bytes: &[u8]) -> Result<bool> {
    write_synced(path, bytes).await?;
    let written = fs::read(path)
        .await
        .map_err(|e| CoreError::io("read", path, e))?;
    Ok(written == bytes)
}

/// Runs `attempt` until it reports a verified write, at most [`MAX_WRITE_ATTEMPTS`] times.
/// Hard errors end the loop immediately.
async fn retry_verified<F, Fut>(mut attempt: F) -> Result<()>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    for n in 1..=MAX_WRITE_ATTEMPTS {
        if attempt(n).await? {
            return Ok(());
        }
        warn!(attempt = n, "written content did not read back identically");
    }
    Err(CoreError::WriteVerificationFailed)
}

/// Sets the hidden attribute on Windows; a no-op elsewhere, where the dot prefix suffices.
#[cfg(windows)]
pub(crate) fn mark_hidden(path: &Path) {
    if let Err(err) = tokio::process::Command::new("attrib")
        .arg("+h")
        .arg(path)
        .spawn()
    {
        warn!(path = %path.display(), error = %err, "hiding file failed");
    }
}

#[cfg(not(windows))]
pub(crate) fn mark_hidden(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    const DOC: &str = "<mxfile><diagram/></mxfile>";

    fn store() -> FileStore {
        FileStore::with_base_dir(None, true)
    }

    #[tokio::test]
    async fn retry_gives_up_after_three_mismatches() {
        let calls = AtomicU32::new(0);
        let result = retry_verified(|_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(false) }
        })
        .await;
        assert!(matches!(result, Err(CoreError::WriteVerificationFailed)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_stops_at_first_verified_write() {
        let result = retry_verified(|n| async move { Ok(n == 2) }).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn retry_propagates_io_errors_without_retrying() {
        let calls = AtomicU32::new(0);
        let result = retry_verified(|_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(CoreError::io(
                    "open",
                    "/nope",
                    std::io::Error::from(IoErrorKind::PermissionDenied),
                ))
            }
        })
        .await;
        assert!(matches!(result, Err(CoreError::Io { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejected_content_never_touches_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.xml");
        let err = store()
            .save_file(&DocumentHandle::new(&path), &FileData::from(""), None, true, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidContent));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn install_dir_is_off_limits() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::with_base_dir(Some(dir.path().to_path_buf()), true);
        let path = dir.path().join("resources").join("app.xml");
        let err = store
            .write_file(&path, &FileData::from(DOC), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidContent));
    }

    #[tokio::test]
    async fn overwrite_skips_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.xml");
        std::fs::write(&path, "<mxfile>old</mxfile>").unwrap();
        store()
            .save_file(&DocumentHandle::new(&path), &FileData::from(DOC), None, true, None)
            .await
            .unwrap();
        assert!(!paths::backup_path(&path).exists());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), DOC);
    }

    #[tokio::test]
    async fn backup_failure_does_not_abort_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.xml");
        std::fs::write(&path, "<mxfile>old</mxfile>").unwrap();
        // A directory squatting on the backup name makes the backup write fail.
        std::fs::create_dir(paths::backup_path(&path)).unwrap();
        std::fs::write(paths::legacy_backup_path(&path), "<mxfile/>").unwrap();

        let store = store();
        let orig = store.file_stat(&path).await.unwrap();
        store
            .save_file(&DocumentHandle::new(&path), &FileData::from(DOC), Some(&orig), false, None)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), DOC);
        // No backup this time, so the legacy one stays.
        assert!(paths::legacy_backup_path(&path).exists());
    }

    #[tokio::test]
    async fn base64_saves_decode_to_binary() {
        use base64::Engine;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.pdf");
        let text = base64::engine::general_purpose::STANDARD.encode(b"%PDF-1.7\n%%EOF");
        store()
            .save_file(
                &DocumentHandle::new(&path),
                &FileData::from(text),
                None,
                false,
                Some(Encoding::Base64),
            )
            .await
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"%PDF-1.7\n%%EOF");
    }

    #[tokio::test]
    async fn read_refuses_unrecognised_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "plain text").unwrap();
        let err = store().read_file(&path, None).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidContent));
    }

    #[tokio::test]
    async fn read_honours_encoding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.xml");
        std::fs::write(&path, DOC).unwrap();
        let store = store();
        assert_eq!(
            store.read_file(&path, Some(Encoding::Utf8)).await.unwrap(),
            FileData::from(DOC)
        );
        assert_eq!(
            store.read_file(&path, None).await.unwrap(),
            FileData::Binary(DOC.as_bytes().to_vec())
        );
    }

    #[tokio::test]
    async fn delete_checks_the_header() {
        let dir = tempfile::tempdir().unwrap();
        let keep = dir.path().join("keep.bin");
        std::fs::write(&keep, [0u8, 1, 2, 3]).unwrap();
        let gone = dir.path().join("gone.png");
        std::fs::write(&gone, b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR").unwrap();

        let store = store();
        assert!(matches!(
            store.delete_file(&keep).await,
            Err(CoreError::InvalidContent)
        ));
        assert!(keep.exists());
        store.delete_file(&gone).await.unwrap();
        assert!(!gone.exists());
    }

    #[tokio::test]
    async fn writable_and_exists_probes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.xml");
        let store = store();
        assert!(!store.is_file_writable(&path).await);
        std::fs::write(&path, DOC).unwrap();
        assert!(store.is_file_writable(&path).await);

        let check = store
            .check_file_exists(&[dir.path().to_path_buf(), PathBuf::from("d.xml")])
            .await;
        assert!(check.exists);
        assert_eq!(check.path, path);
        assert!(!store.check_file_exists(&[dir.path().join("x.xml")]).await.exists);
    }

    #[test]
    fn dirname_of_bare_name_is_dot() {
        assert_eq!(dirname(Path::new("d.xml")), PathBuf::from("."));
        assert_eq!(dirname(Path::new("/tmp/d.xml")), PathBuf::from("/tmp"));
    }
}
