//! Periodic offsite backup: archive all stores, upload, delete the local
//! copy. Failures are logged and the next tick proceeds.

use std::path::Path;

use anyhow::{Context, Result};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{archive::StoreSet, cloud::ObjectStorage, config::BackupSettings};

/// Local archive path between export and upload.
pub const ARCHIVE_FILE: &str = "haven_backup.zip";
/// Content type for uploaded archives.
pub const ARCHIVE_CONTENT_TYPE: &str = "application/zip";

/// Tick every `interval`; uploads are serial, and ticks that fire while an
/// upload is still running are dropped rather than queued.
pub async fn run(
    stores: &StoreSet,
    settings: &BackupSettings,
    storage: &dyn ObjectStorage,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // interval() fires immediately; the first backup should wait a period.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if let Err(e) = backup_once(stores, settings, storage, Path::new(ARCHIVE_FILE)).await {
            warn!("backup failed, will retry next tick: {e}");
        }
    }
}

/// One backup cycle: export, upload, remove the local archive.
pub async fn backup_once(
    stores: &StoreSet,
    settings: &BackupSettings,
    storage: &dyn ObjectStorage,
    archive_path: &Path,
) -> Result<()> {
    info!("creating backup archive at {}", archive_path.display());
    let file = std::fs::File::create(archive_path)
        .with_context(|| format!("creating {}", archive_path.display()))?;
    crate::archive::export_archive(stores, file).context("exporting archive")?;

    let object = archive_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(ARCHIVE_FILE);
    storage
        .upload(&settings.s3.bucket, object, archive_path, ARCHIVE_CONTENT_TYPE)
        .await
        .context("uploading archive")?;
    std::fs::remove_file(archive_path)
        .with_context(|| format!("removing {}", archive_path.display()))?;
    info!("backup uploaded to bucket {}", settings.s3.bucket);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DbEngine, S3Settings};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    struct RecordingStorage {
        uploads: Mutex<Vec<(String, String, u64)>>,
        fail: bool,
    }

    #[async_trait]
    impl ObjectStorage for RecordingStorage {
        async fn upload(
            &self,
            bucket: &str,
            object: &str,
            source: &Path,
            _content_type: &str,
        ) -> Result<()> {
            if self.fail {
                anyhow::bail!("upload rejected");
            }
            let size = std::fs::metadata(source)?.len();
            self.uploads
                .lock()
                .unwrap()
                .push((bucket.to_string(), object.to_string(), size));
            Ok(())
        }

        async fn download(&self, _bucket: &str, _object: &str, _dest: &Path) -> Result<()> {
            anyhow::bail!("not used in this test")
        }
    }

    fn settings() -> BackupSettings {
        BackupSettings {
            interval: Duration::from_secs(3600),
            s3: S3Settings {
                endpoint: "s3.example.com".into(),
                region: "us-east-1".into(),
                access_key_id: "key".into(),
                secret_access_key: "secret".into(),
                bucket: "haven-backups".into(),
                secure: true,
            },
        }
    }

    fn store_set(dir: &TempDir) -> StoreSet {
        let open = |name: &str| crate::store::open(DbEngine::Redb, dir.path().join(name)).unwrap();
        StoreSet {
            private: open("private"),
            chat: open("chat"),
            outbox: open("outbox"),
            inbox: open("inbox"),
            blossom: open("blossom"),
        }
    }

    #[tokio::test]
    async fn backup_uploads_then_removes_local_archive() {
        let dir = TempDir::new().unwrap();
        let stores = store_set(&dir);
        let storage = RecordingStorage {
            uploads: Mutex::new(Vec::new()),
            fail: false,
        };
        let archive_path = dir.path().join(ARCHIVE_FILE);

        backup_once(&stores, &settings(), &storage, &archive_path)
            .await
            .unwrap();

        let uploads = storage.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].0, "haven-backups");
        assert_eq!(uploads[0].1, ARCHIVE_FILE);
        assert!(uploads[0].2 > 0);
        assert!(!archive_path.exists());
    }

    #[tokio::test]
    async fn failed_upload_leaves_error_not_panic() {
        let dir = TempDir::new().unwrap();
        let stores = store_set(&dir);
        let storage = RecordingStorage {
            uploads: Mutex::new(Vec::new()),
            fail: true,
        };
        let archive_path = dir.path().join(ARCHIVE_FILE);
        assert!(backup_once(&stores, &settings(), &storage, &archive_path)
            .await
            .is_err());
    }
}
