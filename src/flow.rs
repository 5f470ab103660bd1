//! flow.js / resumable.js 分片请求参数解析。
//!
//! Both client libraries send the same set of fields and differ only in
//! the parameter prefix (`flowChunkNumber` vs `resumableChunkNumber`).

use std::collections::HashMap;
use thiserror::Error;

const PARAM_PREFIXES: [&str; 2] = ["flow", "resumable"];
const MAX_UPLOAD_ID_LEN: usize = 255;
/// One million chunks of flow.js's default 1 MiB is about a terabyte.
pub const MAX_TOTAL_CHUNKS: u64 = 1_000_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlowError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),
}

impl FlowError {
    fn malformed(msg: impl Into<String>) -> Self {
        FlowError::MalformedRequest(msg.into())
    }
}

/// Identity and declared totals of one chunk of one upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowDescriptor {
    pub upload_id: String,
    /// 1-based.
    pub chunk_index: u64,
    pub chunk_size: u64,
    pub current_chunk_size: Option<u64>,
    pub total_chunks: u64,
    pub total_size: u64,
    pub file_name: String,
}

impl FlowDescriptor {
    /// 从请求参数（GET 查询串或 POST 表单字段）构建描述符。
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self, FlowError> {
        let prefix = PARAM_PREFIXES
            .iter()
            .copied()
            .find(|prefix| params.contains_key(&format!("{prefix}Identifier")))
            .ok_or_else(|| FlowError::malformed("missing flowIdentifier"))?;
        let lookup = |suffix: &str| {
            params
                .get(&format!("{prefix}{suffix}"))
                .map(|value| value.trim())
        };
        let required = |suffix: &str| {
            lookup(suffix)
                .filter(|value| !value.is_empty())
                .ok_or_else(|| FlowError::malformed(format!("missing {prefix}{suffix}")))
        };
        let number = |suffix: &str| {
            required(suffix)?.parse::<u64>().map_err(|_| {
                FlowError::malformed(format!("{prefix}{suffix} must be a non-negative integer"))
            })
        };

        let upload_id = required("Identifier")?.to_string();
        if !is_valid_upload_id(&upload_id) {
            return Err(FlowError::malformed(format!(
                "{prefix}Identifier contains unsupported characters"
            )));
        }
        let chunk_index = number("ChunkNumber")?;
        let chunk_size = number("ChunkSize")?;
        let total_chunks = number("TotalChunks")?;
        let total_size = number("TotalSize")?;
        let current_chunk_size = match lookup("CurrentChunkSize").filter(|v| !v.is_empty()) {
            Some(_) => Some(number("CurrentChunkSize")?),
            None => None,
        };
        let file_name = lookup("RelativePath")
            .filter(|value| !value.is_empty())
            .or_else(|| lookup("Filename").filter(|value| !value.is_empty()))
            .ok_or_else(|| FlowError::malformed(format!("missing {prefix}Filename")))?
            .to_string();

        if chunk_size == 0 {
            return Err(FlowError::malformed("chunk size must be positive"));
        }
        if total_chunks == 0 {
            return Err(FlowError::malformed("total chunks must be positive"));
        }
        if total_chunks > MAX_TOTAL_CHUNKS {
            return Err(FlowError::malformed(format!(
                "total chunks {total_chunks} exceeds {MAX_TOTAL_CHUNKS}"
            )));
        }
        if chunk_index == 0 || chunk_index > total_chunks {
            return Err(FlowError::malformed(format!(
                "chunk number {chunk_index} outside 1..={total_chunks}"
            )));
        }
        check_declared_size(chunk_size, total_chunks, total_size)?;

        Ok(Self {
            upload_id,
            chunk_index,
            chunk_size,
            current_chunk_size,
            total_chunks,
            total_size,
            file_name,
        })
    }
}

/// Session ids double as directory names under the parts root.
pub fn is_valid_upload_id(upload_id: &str) -> bool {
    !upload_id.is_empty()
        && upload_id.len() <= MAX_UPLOAD_ID_LEN
        && upload_id != "."
        && upload_id != ".."
        && upload_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

/// The declared size must fit `total_chunks` chunks within one chunk of
/// slack either way: clients that round up send a short last chunk, flow.js
/// rounds down and folds the remainder into the last chunk.
fn check_declared_size(chunk_size: u64, total_chunks: u64, total_size: u64) -> Result<(), FlowError> {
    if total_size == 0 {
        return if total_chunks == 1 {
            Ok(())
        } else {
            Err(FlowError::malformed("empty file must be sent as a single chunk"))
        };
    }
    let lower = chunk_size.checked_mul(total_chunks - 1);
    let upper = chunk_size.saturating_mul(total_chunks.saturating_add(1));
    match lower {
        Some(lower) if total_size > lower && total_size < upper => Ok(()),
        _ => Err(FlowError::malformed(format!(
            "total size {total_size} inconsistent with {total_chunks} chunks of {chunk_size} bytes"
        ))),
    }
}
