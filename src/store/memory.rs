//! In-memory part store used by coordinator and sweeper tests.

use async_trait::async_trait;
use axum::body::Bytes;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Mutex;

use super::{
    AssembledFile, PartStore, PartWriter, StoreError, StoreResult, SweepPolicy, SweepReport,
    missing_chunks,
};
use crate::flow::FlowDescriptor;

#[derive(Debug)]
struct Session {
    parts: BTreeMap<u64, Bytes>,
    total_size: u64,
    touched: SystemTime,
}

type Sessions = Arc<Mutex<HashMap<String, Session>>>;

#[derive(Debug, Default)]
pub struct MemoryPartStore {
    sessions: Sessions,
    assembled: Mutex<HashMap<PathBuf, Vec<u8>>>,
}

impl MemoryPartStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the last-activity time of a session.
    pub async fn touch(&self, upload_id: &str, at: SystemTime) {
        if let Some(session) = self.sessions.lock().await.get_mut(upload_id) {
            session.touched = at;
        }
    }

    pub async fn has_session(&self, upload_id: &str) -> bool {
        self.sessions.lock().await.contains_key(upload_id)
    }

    pub async fn stored_part(&self, upload_id: &str, chunk_index: u64) -> Option<Bytes> {
        self.sessions
            .lock()
            .await
            .get(upload_id)
            .and_then(|session| session.parts.get(&chunk_index).cloned())
    }

    pub async fn assembled(&self, destination: &Path) -> Option<Vec<u8>> {
        self.assembled.lock().await.get(destination).cloned()
    }
}

/// Buffers the chunk and inserts it on commit.
struct MemoryPartWriter {
    sessions: Sessions,
    upload_id: String,
    chunk_index: u64,
    total_size: u64,
    buffer: Vec<u8>,
}

#[async_trait]
impl PartWriter for MemoryPartWriter {
    async fn write(&mut self, bytes: &[u8]) -> StoreResult<()> {
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<u64> {
        let Self {
            sessions,
            upload_id,
            chunk_index,
            total_size,
            buffer,
        } = *self;
        let size = buffer.len() as u64;
        let mut sessions = sessions.lock().await;
        let session = sessions.entry(upload_id).or_insert_with(|| Session {
            parts: BTreeMap::new(),
            total_size,
            touched: SystemTime::now(),
        });
        session.parts.insert(chunk_index, Bytes::from(buffer));
        session.touched = SystemTime::now();
        Ok(size)
    }

    async fn abort(self: Box<Self>) {}
}

#[async_trait]
impl PartStore for MemoryPartStore {
    async fn has_part(&self, upload_id: &str, chunk_index: u64) -> StoreResult<bool> {
        Ok(self
            .sessions
            .lock()
            .await
            .get(upload_id)
            .is_some_and(|session| session.parts.contains_key(&chunk_index)))
    }

    async fn open_part(&self, descriptor: &FlowDescriptor) -> StoreResult<Box<dyn PartWriter>> {
        Ok(Box::new(MemoryPartWriter {
            sessions: self.sessions.clone(),
            upload_id: descriptor.upload_id.clone(),
            chunk_index: descriptor.chunk_index,
            total_size: descriptor.total_size,
            buffer: Vec::new(),
        }))
    }

    async fn list_parts(&self, upload_id: &str) -> StoreResult<BTreeSet<u64>> {
        Ok(self
            .sessions
            .lock()
            .await
            .get(upload_id)
            .map(|session| session.parts.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn assemble(
        &self,
        upload_id: &str,
        total_chunks: u64,
        destination: &Path,
    ) -> StoreResult<AssembledFile> {
        let mut sessions = self.sessions.lock().await;
        let parts: BTreeSet<u64> = sessions
            .get(upload_id)
            .map(|session| session.parts.keys().copied().collect())
            .unwrap_or_default();
        let missing = missing_chunks(&parts, total_chunks);
        let Some(session) = sessions.get(upload_id).filter(|_| missing.is_empty()) else {
            return Err(StoreError::IncompleteUpload {
                upload_id: upload_id.to_string(),
                missing,
            });
        };

        let mut merged = Vec::new();
        for bytes in session.parts.range(1..=total_chunks).map(|(_, bytes)| bytes) {
            merged.extend_from_slice(bytes);
        }
        let size = merged.len() as u64;
        if session.total_size > 0 && session.total_size != size {
            return Err(StoreError::SizeMismatch {
                expected: session.total_size,
                actual: size,
            });
        }
        sessions.remove(upload_id);
        self.assembled
            .lock()
            .await
            .insert(destination.to_path_buf(), merged);

        Ok(AssembledFile {
            path: destination.to_path_buf(),
            size,
        })
    }

    async fn sweep(&self, policy: &SweepPolicy, now: SystemTime) -> StoreResult<SweepReport> {
        let mut report = SweepReport::default();
        if !policy.is_enabled() {
            return Ok(report);
        }
        let mut sessions = self.sessions.lock().await;
        report.scanned = sessions.len() as u64;
        sessions.retain(|_, session| {
            let stale = policy.is_stale(session.touched, now);
            if stale {
                report.deleted += 1;
            }
            !stale
        });
        Ok(report)
    }

    async fn remove_session(&self, upload_id: &str) -> StoreResult<bool> {
        Ok(self.sessions.lock().await.remove(upload_id).is_some())
    }
}
