use super::{Download, FileStore, FileStream, StoredFile, Upload};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

/// Backups kept on the server's disk under one directory.
#[derive(Debug, Clone)]
pub struct LocalStore {
    dir: PathBuf,
}

impl LocalStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    pub fn path_for(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(AppError::InvalidInput(format!("Invalid backup file name: {id}")));
        }
        Ok(self.dir.join(id))
    }
}

#[async_trait]
impl FileStore for LocalStore {
    async fn upload(&self, id: &str, content_type: &str) -> Result<Upload> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(id)?.with_extension("partial");
        let file = tokio::fs::File::create(&path).await?;
        Ok(Upload {
            file,
            path,
            content_type: content_type.to_string(),
            _staging: None,
        })
    }

    async fn commit(&self, id: &str, upload: Upload) -> Result<StoredFile> {
        let target = self.path_for(id)?;
        drop(upload.file);
        tokio::fs::rename(&upload.path, &target).await?;
        let size_bytes = tokio::fs::metadata(&target).await?.len();
        Ok(StoredFile {
            size_bytes,
            local_filepath: Some(target.display().to_string()),
        })
    }

    async fn discard(&self, upload: Upload) {
        drop(upload.file);
        if let Err(e) = tokio::fs::remove_file(&upload.path).await {
            let path = upload.path.display();
            tracing::debug!(path = %path, "Failed to remove partial backup: {}", e);
        }
    }

    async fn get_file_stream(&self, id: &str) -> Result<FileStream> {
        let path = self.path_for(id)?;
        let file = tokio::fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AppError::BackupNotFound(format!("file missing for {id}"))
            } else {
                e.into()
            }
        })?;
        Ok(Box::new(file))
    }

    async fn delete_file(&self, id: &str) -> Result<()> {
        tokio::fs::remove_file(self.path_for(id)?).await?;
        Ok(())
    }

    async fn download(&self, id: &str, _expires_in: Duration) -> Result<Download> {
        let path = self.path_for(id)?;
        if !path.is_file() {
            return Err(AppError::BackupNotFound(format!("file missing for {id}")));
        }
        Ok(Download::LocalFile(path))
    }
}
