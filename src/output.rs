//! 合并完成文件的输出目录与路径校验。

use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::ErrorKind;
use tracing::{debug, warn};

use crate::atomic::is_temp_name;

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("invalid file name")]
    InvalidPath,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Directory receiving assembled files, kept apart from the parts root so
/// a sweep never races with a finished file.
#[derive(Clone, Debug)]
pub struct OutputDir {
    root: PathBuf,
}

impl OutputDir {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// Deletes temp files left by assemblies that died before their rename.
    /// Only safe before requests are served.
    pub async fn remove_stale_temp_files(&self) -> io::Result<u64> {
        let mut removed = 0;
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if !file_type.is_file() || !entry.file_name().to_str().is_some_and(is_temp_name) {
                    continue;
                }
                match fs::remove_file(&path).await {
                    Ok(()) => {
                        removed += 1;
                        debug!(path = ?path, "removed stale assembly temp file");
                    }
                    Err(err) => warn!(path = ?path, error = %err, "failed to remove temp file"),
                }
            }
        }
        Ok(removed)
    }

    /// Resolves a client supplied relative name to a destination path.
    /// Traversal, absolute paths and symlinked components are rejected.
    pub async fn resolve_destination(&self, relative: &str) -> Result<PathBuf, OutputError> {
        let target = self.resolve(relative)?;
        self.ensure_no_symlink_components(&target).await?;
        Ok(target)
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf, OutputError> {
        let mut normalized = PathBuf::new();
        let trimmed = relative.trim().trim_start_matches(['/', '\\']);
        for component in Path::new(trimmed).components() {
            match component {
                Component::Normal(segment) => normalized.push(segment),
                Component::CurDir => continue,
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(OutputError::InvalidPath);
                }
            }
        }
        if normalized.as_os_str().is_empty() {
            return Err(OutputError::InvalidPath);
        }
        Ok(self.root.join(normalized))
    }

    async fn ensure_no_symlink_components(&self, target: &Path) -> Result<(), OutputError> {
        let relative = target
            .strip_prefix(&self.root)
            .map_err(|_| OutputError::InvalidPath)?;
        let mut current = PathBuf::from(&self.root);
        let mut components = relative.components().peekable();

        while let Some(component) = components.next() {
            current.push(component.as_os_str());
            match fs::symlink_metadata(&current).await {
                Ok(metadata) => {
                    if metadata.file_type().is_symlink() {
                        return Err(OutputError::InvalidPath);
                    }
                    if components.peek().is_some() && !metadata.is_dir() {
                        return Err(OutputError::InvalidPath);
                    }
                    if components.peek().is_none() && metadata.is_dir() {
                        return Err(OutputError::InvalidPath);
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
                Err(err) => return Err(OutputError::Io(err)),
            }
        }

        Ok(())
    }
}
