//! 分片存储能力接口。
//!
//! A session is everything stored for one upload id: one entry per
//! received chunk plus bookkeeping metadata. The coordinator only talks to
//! [`PartStore`], so the filesystem backend can be swapped for the
//! in-memory one in tests.

mod fs;
#[cfg(test)]
mod memory;

use async_trait::async_trait;
use axum::body::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;

use crate::flow::FlowDescriptor;

pub use fs::FsPartStore;
#[cfg(test)]
pub use memory::MemoryPartStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid upload id: {0}")]
    InvalidUploadId(String),

    #[error("storage failure: {0}")]
    Storage(#[from] io::Error),

    #[error("upload {upload_id} incomplete, missing chunks {missing:?}")]
    IncompleteUpload { upload_id: String, missing: Vec<u64> },

    #[error("assembled size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Bookkeeping written once per session.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub file_name: String,
    pub chunk_size: u64,
    pub total_chunks: u64,
    pub total_size: u64,
    pub created_at: DateTime<Utc>,
}

impl SessionMetadata {
    pub fn from_descriptor(descriptor: &FlowDescriptor) -> Self {
        Self {
            file_name: descriptor.file_name.clone(),
            chunk_size: descriptor.chunk_size,
            total_chunks: descriptor.total_chunks,
            total_size: descriptor.total_size,
            created_at: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssembledFile {
    pub path: PathBuf,
    pub size: u64,
}

/// What counts as activity when deciding whether a session is stale.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ActivityProbe {
    /// Only the session directory itself. A chunk that is still streaming
    /// into a temp file does not refresh it.
    Directory,
    /// The newest of the session directory and everything inside it,
    /// in-flight temp files included.
    Entries,
}

#[derive(Clone, Copy, Debug)]
pub struct SweepPolicy {
    /// Zero disables sweeping.
    pub max_age: Duration,
    pub activity: ActivityProbe,
}

impl SweepPolicy {
    pub fn is_enabled(&self) -> bool {
        !self.max_age.is_zero()
    }

    /// Stale strictly past `max_age`; timestamps in the future are never stale.
    pub fn is_stale(&self, last_activity: SystemTime, now: SystemTime) -> bool {
        match now.duration_since(last_activity) {
            Ok(age) => age > self.max_age,
            Err(_) => false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: u64,
    pub deleted: u64,
    pub failed: u64,
}

/// A chunk being received. Nothing is visible under the chunk's index
/// until [`PartWriter::commit`] succeeds.
#[async_trait]
pub trait PartWriter: Send {
    async fn write(&mut self, bytes: &[u8]) -> StoreResult<()>;

    /// Publishes the chunk and returns its size.
    async fn commit(self: Box<Self>) -> StoreResult<u64>;

    async fn abort(self: Box<Self>);
}

#[async_trait]
pub trait PartStore: Send + Sync {
    /// Existence check only; unknown uploads are simply absent.
    async fn has_part(&self, upload_id: &str, chunk_index: u64) -> StoreResult<bool>;

    /// Starts receiving one chunk, creating the session on first use.
    /// Committing over an existing chunk succeeds.
    async fn open_part(&self, descriptor: &FlowDescriptor) -> StoreResult<Box<dyn PartWriter>>;

    /// Persists one chunk all-or-nothing.
    async fn write_part(&self, descriptor: &FlowDescriptor, payload: Bytes) -> StoreResult<()> {
        let mut writer = self.open_part(descriptor).await?;
        if let Err(err) = writer.write(&payload).await {
            writer.abort().await;
            return Err(err);
        }
        writer.commit().await.map(|_| ())
    }

    async fn list_parts(&self, upload_id: &str) -> StoreResult<BTreeSet<u64>>;

    /// Concatenates chunks `1..=total_chunks` into `destination` and removes
    /// the session. Fails with [`StoreError::IncompleteUpload`] if any chunk
    /// is missing, leaving the session untouched.
    async fn assemble(
        &self,
        upload_id: &str,
        total_chunks: u64,
        destination: &Path,
    ) -> StoreResult<AssembledFile>;

    /// Deletes every session whose last activity is older than the policy
    /// allows, complete or not.
    async fn sweep(&self, policy: &SweepPolicy, now: SystemTime) -> StoreResult<SweepReport>;

    /// Returns false if the session did not exist.
    async fn remove_session(&self, upload_id: &str) -> StoreResult<bool>;
}

/// Upper bound on the gaps reported by [`missing_chunks`].
pub const MISSING_REPORT_LIMIT: usize = 32;

/// Whether every index in `1..=total_chunks` is present. Only walks `parts`.
pub fn is_complete(parts: &BTreeSet<u64>, total_chunks: u64) -> bool {
    parts.range(1..=total_chunks).count() as u64 == total_chunks
}

/// The first [`MISSING_REPORT_LIMIT`] indices in `1..=total_chunks` not
/// present in `parts`.
pub fn missing_chunks(parts: &BTreeSet<u64>, total_chunks: u64) -> Vec<u64> {
    (1..=total_chunks)
        .filter(|index| !parts.contains(index))
        .take(MISSING_REPORT_LIMIT)
        .collect()
}
