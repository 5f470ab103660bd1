//! 基于本地文件系统的分片存储：`<root>/<uploadId>/<chunkIndex>`。

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::{
    ActivityProbe, AssembledFile, PartStore, PartWriter, SessionMetadata, StoreError,
    StoreResult, SweepPolicy, SweepReport, missing_chunks,
};
use crate::atomic::AtomicFile;
use crate::flow::{FlowDescriptor, is_valid_upload_id};

const META_FILE: &str = "meta.json";

#[derive(Clone, Debug)]
pub struct FsPartStore {
    root: PathBuf,
}

impl FsPartStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, upload_id: &str) -> StoreResult<PathBuf> {
        if !is_valid_upload_id(upload_id) {
            return Err(StoreError::InvalidUploadId(upload_id.to_string()));
        }
        Ok(self.root.join(upload_id))
    }

    async fn ensure_metadata(&self, dir: &Path, descriptor: &FlowDescriptor) -> StoreResult<()> {
        let meta_path = dir.join(META_FILE);
        if fs::try_exists(&meta_path).await? {
            return Ok(());
        }
        let content = serde_json::to_vec(&SessionMetadata::from_descriptor(descriptor))
            .map_err(std::io::Error::other)?;
        AtomicFile::write(&meta_path, &content).await?;
        Ok(())
    }

    async fn read_metadata(&self, dir: &Path) -> Option<SessionMetadata> {
        let bytes = fs::read(dir.join(META_FILE)).await.ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(metadata) => Some(metadata),
            Err(err) => {
                warn!(path = ?dir, error = %err, "unreadable session metadata");
                None
            }
        }
    }
}

/// Streams one chunk into a temp file inside its session directory, so the
/// `Entries` activity probe sees bytes as they arrive.
struct FsPartWriter {
    upload_id: String,
    chunk_index: u64,
    file: AtomicFile,
    written: u64,
}

#[async_trait]
impl PartWriter for FsPartWriter {
    async fn write(&mut self, bytes: &[u8]) -> StoreResult<()> {
        let file = self.file.file_mut();
        file.write_all(bytes).await?;
        file.flush().await?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<u64> {
        let Self {
            upload_id,
            chunk_index,
            file,
            written,
        } = *self;
        file.finalize().await?;
        debug!(upload_id, chunk_index, bytes = written, "chunk persisted");
        Ok(written)
    }

    async fn abort(self: Box<Self>) {
        self.file.cleanup().await;
    }
}

#[async_trait]
impl PartStore for FsPartStore {
    async fn has_part(&self, upload_id: &str, chunk_index: u64) -> StoreResult<bool> {
        let path = self.session_dir(upload_id)?.join(chunk_index.to_string());
        Ok(fs::try_exists(&path).await?)
    }

    async fn open_part(&self, descriptor: &FlowDescriptor) -> StoreResult<Box<dyn PartWriter>> {
        let dir = self.session_dir(&descriptor.upload_id)?;
        fs::create_dir_all(&dir).await?;
        self.ensure_metadata(&dir, descriptor).await?;

        let file = AtomicFile::new(&dir.join(descriptor.chunk_index.to_string())).await?;
        Ok(Box::new(FsPartWriter {
            upload_id: descriptor.upload_id.clone(),
            chunk_index: descriptor.chunk_index,
            file,
            written: 0,
        }))
    }

    async fn list_parts(&self, upload_id: &str) -> StoreResult<BTreeSet<u64>> {
        let dir = self.session_dir(upload_id)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(err) => return Err(err.into()),
        };
        let mut parts = BTreeSet::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            if let Ok(index) = name.parse::<u64>() {
                parts.insert(index);
            }
        }
        Ok(parts)
    }

    async fn assemble(
        &self,
        upload_id: &str,
        total_chunks: u64,
        destination: &Path,
    ) -> StoreResult<AssembledFile> {
        let dir = self.session_dir(upload_id)?;
        let missing = missing_chunks(&self.list_parts(upload_id).await?, total_chunks);
        if !missing.is_empty() {
            return Err(StoreError::IncompleteUpload {
                upload_id: upload_id.to_string(),
                missing,
            });
        }
        let metadata = self.read_metadata(&dir).await;

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut atomic = AtomicFile::new(destination).await?;
        let merged: StoreResult<u64> = async {
            let mut written: u64 = 0;
            for index in 1..=total_chunks {
                let mut part = match File::open(dir.join(index.to_string())).await {
                    Ok(file) => file,
                    Err(err) if err.kind() == ErrorKind::NotFound => {
                        return Err(StoreError::IncompleteUpload {
                            upload_id: upload_id.to_string(),
                            missing: vec![index],
                        });
                    }
                    Err(err) => return Err(err.into()),
                };
                written += tokio::io::copy(&mut part, atomic.file_mut()).await?;
            }
            atomic.file_mut().flush().await?;
            Ok(written)
        }
        .await;
        let written = match merged {
            Ok(written) => written,
            Err(err) => {
                atomic.cleanup().await;
                return Err(err);
            }
        };

        if let Some(metadata) = metadata
            && metadata.total_size > 0
            && metadata.total_size != written
        {
            warn!(
                upload_id,
                expected = metadata.total_size,
                actual = written,
                "size mismatch after merge"
            );
            atomic.cleanup().await;
            return Err(StoreError::SizeMismatch {
                expected: metadata.total_size,
                actual: written,
            });
        }
        atomic.finalize().await?;

        // The file is already in place; a leftover session is reclaimed by the sweeper.
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(upload_id, error = %err, "failed to remove assembled session"),
        }

        Ok(AssembledFile {
            path: destination.to_path_buf(),
            size: written,
        })
    }

    async fn sweep(&self, policy: &SweepPolicy, now: SystemTime) -> StoreResult<SweepReport> {
        let mut report = SweepReport::default();
        if !policy.is_enabled() {
            return Ok(report);
        }
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(report),
            Err(err) => {
                report.failed += 1;
                warn!(path = ?self.root, error = %err, "failed to list upload sessions");
                return Ok(report);
            }
        };

        loop {
            let entry = match dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    report.failed += 1;
                    warn!(path = ?self.root, error = %err, "upload session listing aborted");
                    break;
                }
            };
            let path = entry.path();
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(err) => {
                    debug!(path = ?path, error = %err, "session vanished during sweep");
                    continue;
                }
            };
            if !metadata.is_dir() {
                continue;
            }
            report.scanned += 1;

            let Some(touched) = last_activity(&path, &metadata, policy.activity).await else {
                continue;
            };
            if !policy.is_stale(touched, now) {
                continue;
            }
            match fs::remove_dir_all(&path).await {
                Ok(()) => {
                    report.deleted += 1;
                    info!(path = ?path, "removed stale upload session");
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    debug!(path = ?path, "stale session already removed");
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(path = ?path, error = %err, "failed to remove stale upload session");
                }
            }
        }

        Ok(report)
    }

    async fn remove_session(&self, upload_id: &str) -> StoreResult<bool> {
        let dir = self.session_dir(upload_id)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

async fn last_activity(
    dir: &Path,
    metadata: &std::fs::Metadata,
    probe: ActivityProbe,
) -> Option<SystemTime> {
    let mut newest = metadata.modified().ok()?;
    if probe == ActivityProbe::Directory {
        return Some(newest);
    }
    let Ok(mut entries) = fs::read_dir(dir).await else {
        return Some(newest);
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) {
            newest = newest.max(modified);
        }
    }
    Some(newest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use std::time::Duration;
    use tempfile::tempdir;

    fn make_store() -> (tempfile::TempDir, FsPartStore) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("parts");
        std::fs::create_dir_all(&root).expect("create parts root");
        (temp, FsPartStore::new(root))
    }

    fn descriptor(upload_id: &str, chunk_index: u64, total_chunks: u64, total_size: u64) -> FlowDescriptor {
        FlowDescriptor {
            upload_id: upload_id.into(),
            chunk_index,
            chunk_size: 4,
            current_chunk_size: None,
            total_chunks,
            total_size,
            file_name: "out.bin".into(),
        }
    }

    fn dir_mtime(path: &Path) -> SystemTime {
        std::fs::metadata(path)
            .expect("metadata")
            .modified()
            .expect("mtime")
    }

    #[tokio::test]
    async fn has_part_does_not_create_session() {
        let (_temp, store) = make_store();
        assert!(!store.has_part("ghost", 1).await.expect("has_part"));
        assert!(!store.root_path().join("ghost").exists());
        assert!(store.list_parts("ghost").await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn write_part_is_idempotent() {
        let (_temp, store) = make_store();
        let d = descriptor("u1", 2, 3, 10);
        store.write_part(&d, Bytes::from_static(b"bbbb")).await.expect("write");
        store.write_part(&d, Bytes::from_static(b"bbbb")).await.expect("rewrite");

        let session = store.root_path().join("u1");
        assert_eq!(std::fs::read(session.join("2")).expect("read"), b"bbbb");
        let mut names: Vec<String> = std::fs::read_dir(&session)
            .expect("read dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["2".to_string(), META_FILE.to_string()]);
        assert!(store.has_part("u1", 2).await.expect("has_part"));
        assert!(!store.has_part("u1", 1).await.expect("has_part"));
    }

    #[tokio::test]
    async fn list_parts_ignores_temp_and_metadata() {
        let (_temp, store) = make_store();
        store
            .write_part(&descriptor("u1", 3, 3, 10), Bytes::from_static(b"cc"))
            .await
            .expect("write");
        let session = store.root_path().join("u1");
        std::fs::write(session.join(".1.tmp.abc"), b"half").expect("temp file");

        let parts = store.list_parts("u1").await.expect("list");
        assert_eq!(parts.into_iter().collect::<Vec<_>>(), vec![3]);
    }

    #[tokio::test]
    async fn assemble_in_index_order_and_remove_session() {
        let (temp, store) = make_store();
        for (index, bytes) in [(3, &b"cc"[..]), (1, b"aaaa"), (2, b"bbbb")] {
            store
                .write_part(&descriptor("u1", index, 3, 10), Bytes::copy_from_slice(bytes))
                .await
                .expect("write");
        }
        let destination = temp.path().join("done").join("out.bin");
        let assembled = store.assemble("u1", 3, &destination).await.expect("assemble");

        assert_eq!(assembled.size, 10);
        assert_eq!(std::fs::read(&destination).expect("read"), b"aaaabbbbcc");
        assert!(!store.root_path().join("u1").exists());
    }

    #[tokio::test]
    async fn assemble_incomplete_keeps_session() {
        let (temp, store) = make_store();
        store
            .write_part(&descriptor("u1", 1, 3, 10), Bytes::from_static(b"aaaa"))
            .await
            .expect("write");
        let destination = temp.path().join("out.bin");
        let result = store.assemble("u1", 3, &destination).await;

        match result {
            Err(StoreError::IncompleteUpload { missing, .. }) => assert_eq!(missing, vec![2, 3]),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(!destination.exists());
        assert!(store.has_part("u1", 1).await.expect("has_part"));
    }

    #[tokio::test]
    async fn assemble_rejects_size_mismatch() {
        let (temp, store) = make_store();
        store
            .write_part(&descriptor("u1", 1, 2, 8), Bytes::from_static(b"aaaa"))
            .await
            .expect("write");
        store
            .write_part(&descriptor("u1", 2, 2, 8), Bytes::from_static(b"b"))
            .await
            .expect("write");
        let destination = temp.path().join("out.bin");
        let result = store.assemble("u1", 2, &destination).await;

        assert!(matches!(
            result,
            Err(StoreError::SizeMismatch {
                expected: 8,
                actual: 5
            })
        ));
        assert!(!destination.exists());
        assert_eq!(store.list_parts("u1").await.expect("list").len(), 2);
    }

    #[tokio::test]
    async fn sweep_boundary_is_exclusive() {
        let (_temp, store) = make_store();
        store
            .write_part(&descriptor("u1", 1, 3, 10), Bytes::from_static(b"aaaa"))
            .await
            .expect("write");
        let touched = dir_mtime(&store.root_path().join("u1"));
        let policy = SweepPolicy {
            max_age: Duration::from_secs(300),
            activity: ActivityProbe::Directory,
        };

        let report = store
            .sweep(&policy, touched + Duration::from_secs(300))
            .await
            .expect("sweep");
        assert_eq!(report.deleted, 0);
        assert!(store.has_part("u1", 1).await.expect("has_part"));

        let report = store
            .sweep(&policy, touched + Duration::from_secs(300) + Duration::from_nanos(1))
            .await
            .expect("sweep");
        assert_eq!(report.deleted, 1);
        assert!(!store.root_path().join("u1").exists());
    }

    #[tokio::test]
    async fn sweep_removes_six_minute_old_session_keeps_four_minute_old() {
        let (_temp, store) = make_store();
        store
            .write_part(&descriptor("old", 1, 1, 4), Bytes::from_static(b"aaaa"))
            .await
            .expect("write");
        store
            .write_part(&descriptor("fresh", 1, 1, 4), Bytes::from_static(b"aaaa"))
            .await
            .expect("write");
        let old = dir_mtime(&store.root_path().join("old"));
        let fresh = dir_mtime(&store.root_path().join("fresh"));
        let policy = SweepPolicy {
            max_age: Duration::from_secs(5 * 60),
            activity: ActivityProbe::Directory,
        };

        store
            .sweep(&policy, fresh + Duration::from_secs(4 * 60))
            .await
            .expect("sweep");
        assert!(store.root_path().join("fresh").exists());

        store
            .sweep(&policy, old.max(fresh) + Duration::from_secs(6 * 60))
            .await
            .expect("sweep");
        assert!(!store.root_path().join("old").exists());
        assert!(!store.root_path().join("fresh").exists());
    }

    #[tokio::test]
    async fn entries_probe_counts_in_flight_chunks() {
        let (_temp, store) = make_store();
        store
            .write_part(&descriptor("slow", 1, 3, 10), Bytes::from_static(b"aaaa"))
            .await
            .expect("write");
        let session = store.root_path().join("slow");
        let in_flight = session.join(".2.tmp.streaming");
        let file = std::fs::File::create(&in_flight).expect("temp chunk");
        let touched = dir_mtime(&session);
        file.set_modified(touched + Duration::from_secs(3 * 60))
            .expect("set mtime");
        drop(file);

        let now = touched + Duration::from_secs(6 * 60);
        let entries = SweepPolicy {
            max_age: Duration::from_secs(5 * 60),
            activity: ActivityProbe::Entries,
        };
        let report = store.sweep(&entries, now).await.expect("sweep");
        assert_eq!(report.deleted, 0);
        assert!(session.exists());

        let directory_only = SweepPolicy {
            activity: ActivityProbe::Directory,
            ..entries
        };
        let report = store.sweep(&directory_only, now).await.expect("sweep");
        assert_eq!(report.deleted, 1);
        assert!(!session.exists());
    }

    #[tokio::test]
    async fn zero_max_age_disables_sweep() {
        let (_temp, store) = make_store();
        store
            .write_part(&descriptor("u1", 1, 1, 4), Bytes::from_static(b"aaaa"))
            .await
            .expect("write");
        let policy = SweepPolicy {
            max_age: Duration::ZERO,
            activity: ActivityProbe::Entries,
        };
        let far_future = SystemTime::now() + Duration::from_secs(365 * 24 * 3600);
        let report = store.sweep(&policy, far_future).await.expect("sweep");
        assert_eq!(report, SweepReport::default());
        assert!(store.root_path().join("u1").exists());
    }

    #[tokio::test]
    async fn rejects_traversal_upload_id() {
        let (_temp, store) = make_store();
        assert!(matches!(
            store.has_part("../escape", 1).await,
            Err(StoreError::InvalidUploadId(_))
        ));
        assert!(matches!(
            store.remove_session("..").await,
            Err(StoreError::InvalidUploadId(_))
        ));
    }

    #[tokio::test]
    async fn unreadable_root_is_counted_not_raised() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("parts");
        std::fs::write(&root, b"not a directory").expect("file root");
        let store = FsPartStore::new(root);
        let policy = SweepPolicy {
            max_age: Duration::from_secs(300),
            activity: ActivityProbe::Entries,
        };

        let report = store
            .sweep(&policy, SystemTime::now())
            .await
            .expect("sweep reports instead of failing");
        assert_eq!(report.failed, 1);
        assert_eq!(report.deleted, 0);
    }

    #[tokio::test]
    async fn aborted_part_leaves_no_chunk() {
        let (_temp, store) = make_store();
        let mut writer = store
            .open_part(&descriptor("u1", 2, 3, 10))
            .await
            .expect("open");
        writer.write(b"bb").await.expect("write");
        writer.abort().await;

        let session = store.root_path().join("u1");
        let names: Vec<String> = std::fs::read_dir(&session)
            .expect("read dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![META_FILE.to_string()]);
        assert!(!store.has_part("u1", 2).await.expect("has_part"));
    }
}
