//! 上传协调器：分片去重、持久化、完整性判断与合并。
//!
//! Per upload id the lifecycle is `NEW -> RECEIVING -> COMPLETE`, or
//! `RECEIVING -> ABANDONED` when the sweeper reclaims an idle session.
//! Both terminal states remove the session from the part store.

#[cfg(test)]
use axum::body::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::flow::{FlowDescriptor, FlowError};
use crate::locking::LockManager;
use crate::output::{OutputDir, OutputError};
use crate::store::{PartStore, PartWriter, StoreError, is_complete};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    Flow(#[from] FlowError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<OutputError> for UploadError {
    fn from(err: OutputError) -> Self {
        match err {
            OutputError::InvalidPath => {
                UploadError::Flow(FlowError::MalformedRequest("invalid file name".into()))
            }
            OutputError::Io(err) => UploadError::Store(StoreError::Storage(err)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartStatus {
    Present,
    Absent,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedUpload {
    /// As declared by the client.
    pub file_name: String,
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadOutcome {
    Continuing,
    Complete(CompletedUpload),
}

/// A chunk whose bytes are still arriving.
pub struct IncomingPart {
    destination: PathBuf,
    /// None for a duplicate.
    writer: Option<Box<dyn PartWriter>>,
    received: u64,
}

impl IncomingPart {
    pub fn received(&self) -> u64 {
        self.received
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), UploadError> {
        if let Some(writer) = self.writer.as_mut() {
            writer.write(bytes).await?;
        }
        self.received += bytes.len() as u64;
        Ok(())
    }

    pub async fn abort(self) {
        if let Some(writer) = self.writer {
            writer.abort().await;
        }
    }
}

pub struct UploadCoordinator {
    store: Arc<dyn PartStore>,
    output: OutputDir,
    locks: LockManager,
    assembly_wait: Duration,
}

impl UploadCoordinator {
    pub fn new(store: Arc<dyn PartStore>, output: OutputDir, assembly_wait: Duration) -> Self {
        Self {
            store,
            output,
            locks: LockManager::new(),
            assembly_wait,
        }
    }

    /// Read-only check used by clients resuming an interrupted upload.
    pub async fn status(&self, descriptor: &FlowDescriptor) -> Result<PartStatus, UploadError> {
        let present = self
            .store
            .has_part(&descriptor.upload_id, descriptor.chunk_index)
            .await?;
        debug!(
            upload_id = descriptor.upload_id,
            chunk_index = descriptor.chunk_index,
            present,
            "chunk status"
        );
        Ok(if present {
            PartStatus::Present
        } else {
            PartStatus::Absent
        })
    }

    /// Starts receiving one chunk. A chunk that is already stored is
    /// drained without touching the store.
    pub async fn begin_part(&self, descriptor: &FlowDescriptor) -> Result<IncomingPart, UploadError> {
        let destination = self.output.resolve_destination(&descriptor.file_name).await?;
        let writer = if self
            .store
            .has_part(&descriptor.upload_id, descriptor.chunk_index)
            .await?
        {
            debug!(
                upload_id = descriptor.upload_id,
                chunk_index = descriptor.chunk_index,
                "duplicate chunk, keeping stored copy"
            );
            None
        } else {
            Some(self.store.open_part(descriptor).await?)
        };
        Ok(IncomingPart {
            destination,
            writer,
            received: 0,
        })
    }

    /// Publishes a fully received chunk and assembles the upload once every
    /// chunk is present.
    pub async fn finish_part(
        &self,
        descriptor: &FlowDescriptor,
        part: IncomingPart,
    ) -> Result<UploadOutcome, UploadError> {
        let IncomingPart {
            destination,
            writer,
            received,
        } = part;
        if let Some(writer) = writer {
            if let Some(declared) = descriptor.current_chunk_size
                && declared != received
            {
                writer.abort().await;
                return Err(FlowError::MalformedRequest(format!(
                    "chunk declared {declared} bytes but carried {received}"
                ))
                .into());
            }
            writer.commit().await?;
        }

        let upload_id = descriptor.upload_id.as_str();
        let parts = self.store.list_parts(upload_id).await?;
        if !is_complete(&parts, descriptor.total_chunks) {
            debug!(
                upload_id,
                received = parts.len(),
                total = descriptor.total_chunks,
                "waiting for more chunks"
            );
            return Ok(UploadOutcome::Continuing);
        }

        self.assemble(descriptor, destination).await
    }

    /// Stores one already buffered chunk.
    #[cfg(test)]
    pub async fn upload_part(
        &self,
        descriptor: &FlowDescriptor,
        payload: Bytes,
    ) -> Result<UploadOutcome, UploadError> {
        let mut part = self.begin_part(descriptor).await?;
        if let Err(err) = part.write(&payload).await {
            part.abort().await;
            return Err(err);
        }
        self.finish_part(descriptor, part).await
    }

    async fn assemble(
        &self,
        descriptor: &FlowDescriptor,
        destination: PathBuf,
    ) -> Result<UploadOutcome, UploadError> {
        let upload_id = descriptor.upload_id.as_str();
        let guard = match self
            .locks
            .lock_with_timeout(upload_id, self.assembly_wait)
            .await
        {
            Ok(guard) => guard,
            Err(err) => {
                debug!(upload_id, error = %err, "assembly already running elsewhere");
                return Ok(UploadOutcome::Continuing);
            }
        };
        let result = self
            .store
            .assemble(upload_id, descriptor.total_chunks, &destination)
            .await;
        drop(guard);
        self.locks.prune(upload_id).await;

        match result {
            Ok(assembled) => {
                info!(
                    upload_id,
                    name = descriptor.file_name,
                    path = ?assembled.path,
                    size = assembled.size,
                    "upload complete"
                );
                Ok(UploadOutcome::Complete(CompletedUpload {
                    file_name: descriptor.file_name.clone(),
                    path: assembled.path,
                    size: assembled.size,
                }))
            }
            Err(StoreError::IncompleteUpload { missing, .. }) => {
                debug!(upload_id, ?missing, "assembly raced, waiting for retry");
                Ok(UploadOutcome::Continuing)
            }
            Err(err @ StoreError::SizeMismatch { .. }) => {
                // Retried chunks are skipped as duplicates, so a corrupt session can never heal.
                warn!(upload_id, error = %err, "discarding session after size mismatch");
                if let Err(remove_err) = self.store.remove_session(upload_id).await {
                    warn!(upload_id, error = %remove_err, "failed to discard session");
                }
                Err(err.into())
            }
            Err(err) => {
                warn!(upload_id, error = %err, "assembly failed");
                Err(err.into())
            }
        }
    }
}
