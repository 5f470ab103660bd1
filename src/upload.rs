//! `/upload` 端点：GET 查询分片状态，POST 上传分片。

use axum::Router;
use axum::extract::multipart::Field;
use axum::extract::{DefaultBodyLimit, Extension, Multipart, Query};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::coordinator::{IncomingPart, PartStatus, UploadCoordinator, UploadOutcome};
use crate::error::ApiError;
use crate::flow::FlowDescriptor;

/// Room for multipart boundaries and the flow text fields.
const MULTIPART_OVERHEAD: u64 = 64 * 1024;

#[derive(Debug)]
pub struct UploadConfig {
    pub max_chunk_size: u64,
    pub absent_status: StatusCode,
}

/// Builds the `/upload` route; callers add the coordinator and config extensions.
pub fn upload_routes(config: &UploadConfig) -> Router {
    let body_limit = usize::try_from(config.max_chunk_size.saturating_add(MULTIPART_OVERHEAD))
        .unwrap_or(usize::MAX);
    Router::new().route(
        "/upload",
        get(part_status)
            .post(upload_part)
            .fallback(bad_method)
            .layer(DefaultBodyLimit::max(body_limit)),
    )
}

/// 查询分片是否已上传。
pub async fn part_status(
    Query(params): Query<HashMap<String, String>>,
    Extension(coordinator): Extension<Arc<UploadCoordinator>>,
    Extension(upload): Extension<Arc<UploadConfig>>,
) -> Result<Response, ApiError> {
    let descriptor = FlowDescriptor::from_params(&params)?;
    match coordinator.status(&descriptor).await? {
        PartStatus::Present => Ok((StatusCode::OK, "found").into_response()),
        PartStatus::Absent => Ok(absent_response(upload.absent_status)),
    }
}

fn absent_response(status: StatusCode) -> Response {
    if status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
        status.into_response()
    } else {
        (status, "not found").into_response()
    }
}

/// 上传单个分片，全部到齐后合并。
///
/// flow.js and resumable.js send the text fields before the `file` field,
/// so the descriptor is known when the payload starts and its bytes go
/// straight into the session.
pub async fn upload_part(
    Extension(coordinator): Extension<Arc<UploadCoordinator>>,
    Extension(upload): Extension<Arc<UploadConfig>>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut params = HashMap::new();
    let mut received: Option<(FlowDescriptor, IncomingPart)> = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::Malformed(err.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if field.file_name().is_none() && name != "file" {
            let value = field
                .text()
                .await
                .map_err(|err| ApiError::Malformed(err.body_text()))?;
            params.insert(name, value);
            continue;
        }
        if received.is_some() {
            return Err(ApiError::Malformed("more than one chunk payload".into()));
        }

        let descriptor = FlowDescriptor::from_params(&params)?;
        let mut part = coordinator.begin_part(&descriptor).await?;
        if let Err(err) = stream_field(&mut field, &mut part, upload.max_chunk_size).await {
            part.abort().await;
            return Err(err);
        }
        received = Some((descriptor, part));
    }

    let Some((descriptor, part)) = received else {
        FlowDescriptor::from_params(&params)?;
        return Err(ApiError::Malformed("missing chunk payload".into()));
    };
    debug!(
        upload_id = descriptor.upload_id,
        chunk_index = descriptor.chunk_index,
        bytes = part.received(),
        "chunk received"
    );

    match coordinator.finish_part(&descriptor, part).await {
        Ok(UploadOutcome::Continuing) => {
            Ok((StatusCode::OK, "continuing to upload parts").into_response())
        }
        Ok(UploadOutcome::Complete(done)) => {
            info!(
                upload_id = descriptor.upload_id,
                path = ?done.path,
                size = done.size,
                "part upload done"
            );
            Ok((StatusCode::OK, format!("{} is done", done.file_name)).into_response())
        }
        Err(err) => {
            warn!(
                upload_id = descriptor.upload_id,
                chunk_index = descriptor.chunk_index,
                error = %err,
                "part upload failed"
            );
            Err(err.into())
        }
    }
}

async fn stream_field(
    field: &mut Field<'_>,
    part: &mut IncomingPart,
    limit: u64,
) -> Result<(), ApiError> {
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|err| ApiError::Malformed(err.body_text()))?
    {
        if part.received() + chunk.len() as u64 > limit {
            return Err(ApiError::Malformed("chunk too large".into()));
        }
        part.write(&chunk).await?;
    }
    Ok(())
}

/// 其它方法一律拒绝。
pub async fn bad_method() -> ApiError {
    ApiError::BadMethod
}
