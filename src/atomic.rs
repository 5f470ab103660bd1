//! 临时写入与原子替换：分片与合并结果都先写临时文件再 rename。

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Prefix shared by every temporary file this module creates.
pub const TEMP_MARKER: &str = ".tmp.";

/// Whether `name` has the `.<base>.tmp.<uuid>` shape of a temp file.
pub fn is_temp_name(name: &str) -> bool {
    name.starts_with('.')
        && name
            .rsplit_once(TEMP_MARKER)
            .is_some_and(|(base, id)| base.len() > 1 && Uuid::parse_str(id).is_ok())
}

/// 可用于原子替换的临时文件封装。
pub struct AtomicFile {
    target: PathBuf,
    temp_path: PathBuf,
    file: File,
}

impl AtomicFile {
    /// 在目标路径同目录创建临时文件。
    pub async fn new(target: &Path) -> io::Result<Self> {
        let parent = target.parent().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "target path has no parent")
        })?;
        let base = target
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_else(|| "file".into());
        let temp_path = parent.join(format!(".{base}{TEMP_MARKER}{}", Uuid::new_v4()));
        let file = File::create(&temp_path).await?;
        Ok(Self {
            target: target.to_path_buf(),
            temp_path,
            file,
        })
    }

    /// Writes `bytes` to `target` atomically in one call.
    pub async fn write(target: &Path, bytes: &[u8]) -> io::Result<()> {
        let mut atomic = Self::new(target).await?;
        if let Err(err) = atomic.file.write_all(bytes).await {
            atomic.cleanup().await;
            return Err(err);
        }
        atomic.finalize().await
    }

    /// 返回临时文件的可写句柄。
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// 放弃并清理临时文件。
    pub async fn cleanup(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
    }

    /// 同步并原子替换目标文件。
    pub async fn finalize(mut self) -> io::Result<()> {
        if let Err(err) = self.file.flush().await {
            self.cleanup().await;
            return Err(err);
        }
        if let Err(err) = self.file.sync_all().await {
            self.cleanup().await;
            return Err(err);
        }
        drop(self.file);

        if let Err(err) = fs::rename(&self.temp_path, &self.target).await {
            #[cfg(windows)]
            {
                if fs::remove_file(&self.target).await.is_ok()
                    && fs::rename(&self.temp_path, &self.target).await.is_ok()
                {
                    return Ok(());
                }
            }
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(err);
        }

        if let Some(parent) = self.target.parent() {
            let _ = sync_dir(parent).await;
        }

        Ok(())
    }
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}
