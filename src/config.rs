//! CLI arguments and server configuration defaults.

use axum::http::StatusCode;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::store::{ActivityProbe, SweepPolicy};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_RETENTION_SECS: u64 = 5 * 60;
pub const DEFAULT_ABSENT_STATUS: u16 = 204;
pub const ASSEMBLY_LOCK_WAIT_SECS: u64 = 30;
pub const SHUTDOWN_GRACE_SECS: u64 = 10;
pub const DEFAULT_LOG_FILTER: &str = "info";
const WORK_DIR: &str = "axo-flow";

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "axo-flow", version, about = "Resumable chunked upload server for flow.js clients")]
pub struct Args {
    #[arg(
        short = 'b',
        long,
        env = "AXO_FLOW_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub bind: String,
    #[arg(
        short = 'p',
        long,
        env = "AXO_FLOW_PORT",
        default_value_t = DEFAULT_PORT,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        long,
        env = "AXO_FLOW_PARTS_DIR",
        help = "Directory holding in-progress chunks [default: <tmp>/axo-flow/parts]"
    )]
    pub parts_dir: Option<PathBuf>,
    #[arg(
        short = 'o',
        long,
        env = "AXO_FLOW_OUTPUT_DIR",
        help = "Directory receiving assembled files [default: <tmp>/axo-flow/done]"
    )]
    pub output_dir: Option<PathBuf>,
    #[arg(
        long,
        env = "AXO_FLOW_CLEANUP_INTERVAL_SECS",
        default_value_t = DEFAULT_CLEANUP_INTERVAL_SECS,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Seconds between stale session sweeps"
    )]
    pub cleanup_interval_secs: u64,
    #[arg(
        long,
        env = "AXO_FLOW_RETENTION_SECS",
        default_value_t = DEFAULT_RETENTION_SECS,
        help = "Idle seconds before a session is deleted (0 to disable)"
    )]
    pub retention_secs: u64,
    #[arg(
        long,
        env = "AXO_FLOW_SWEEP_ACTIVITY",
        value_enum,
        default_value_t = ActivityProbe::Entries,
        help = "What refreshes a session's idle clock"
    )]
    pub sweep_activity: ActivityProbe,
    #[arg(
        long,
        env = "AXO_FLOW_MAX_CHUNK_SIZE",
        default_value_t = DEFAULT_MAX_CHUNK_SIZE,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Max bytes accepted per chunk"
    )]
    pub max_chunk_size: u64,
    #[arg(
        long,
        env = "AXO_FLOW_ABSENT_STATUS",
        default_value_t = DEFAULT_ABSENT_STATUS,
        help = "Status answered when a probed chunk is missing (e.g. 204 or 404)"
    )]
    pub absent_status: u16,
    #[arg(long, env = "AXO_FLOW_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
}

impl Args {
    pub fn parts_dir(&self) -> PathBuf {
        self.parts_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(WORK_DIR).join("parts"))
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(WORK_DIR).join("done"))
    }

    pub fn sweep_policy(&self) -> SweepPolicy {
        SweepPolicy {
            max_age: Duration::from_secs(self.retention_secs),
            activity: self.sweep_activity,
        }
    }

    /// flow.js treats 200-202 as "already uploaded", so those cannot mean absent.
    pub fn absent_status(&self) -> Result<StatusCode, String> {
        let status = StatusCode::from_u16(self.absent_status)
            .map_err(|err| format!("invalid absent status {}: {err}", self.absent_status))?;
        if (200..=202).contains(&status.as_u16()) {
            return Err(format!(
                "absent status {status} would tell clients the chunk is present"
            ));
        }
        Ok(status)
    }
}

/// Every directory under the parts root counts as a session, so neither
/// root may contain the other. Both must already exist.
pub fn check_disjoint_roots(parts_dir: &Path, output_dir: &Path) -> Result<(), String> {
    let canonical = |path: &Path| {
        std::fs::canonicalize(path).map_err(|err| format!("cannot resolve {}: {err}", path.display()))
    };
    let parts = canonical(parts_dir)?;
    let output = canonical(output_dir)?;
    if parts.starts_with(&output) || output.starts_with(&parts) {
        return Err(format!(
            "parts dir {} and output dir {} must not contain one another",
            parts.display(),
            output.display()
        ));
    }
    Ok(())
}
