use super::{Download, FileStore, FileStream, StoredFile, Upload};
use crate::error::{AppError, Result};
use crate::models::Credential;
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::presigning::PresigningConfig;
use s3::primitives::ByteStream;
use std::time::Duration;

/// S3-compatible bucket. Dumps are staged in a temp file and uploaded once the
/// dump succeeded, so a failed dump never leaves a partial object.
#[derive(Clone)]
pub struct S3Store {
    client: s3::Client,
    bucket: String,
}

impl S3Store {
    pub async fn from_credential(credential: &Credential) -> Self {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .region(Region::new(credential.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &credential.key_id,
                &credential.key_secret,
                None,
                None,
                "Static",
            ));
        if let Some(endpoint) = credential.endpoint_url.as_deref().filter(|e| !e.is_empty()) {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        Self {
            client: s3::Client::new(&sdk_config),
            bucket: credential.bucket.clone(),
        }
    }
}

fn storage_error(action: &str, id: &str, err: impl std::fmt::Display) -> AppError {
    AppError::Storage(format!("Failed to {action} {id}: {err}"))
}

#[async_trait]
impl FileStore for S3Store {
    async fn upload(&self, _id: &str, content_type: &str) -> Result<Upload> {
        let staging = tempfile::Builder::new()
            .prefix("pg_orchestrator-")
            .tempfile()?
            .into_temp_path();
        let path = staging.to_path_buf();
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;
        Ok(Upload {
            file,
            path,
            content_type: content_type.to_string(),
            _staging: Some(staging),
        })
    }

    async fn commit(&self, id: &str, upload: Upload) -> Result<StoredFile> {
        drop(upload.file);
        let size_bytes = tokio::fs::metadata(&upload.path).await?.len();
        let body = ByteStream::from_path(&upload.path)
            .await
            .map_err(|e| storage_error("read staged", id, e))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(id)
            .content_type(&upload.content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| storage_error("upload", id, e))?;

        tracing::info!(bucket = %self.bucket, key = %id, size_bytes, "Uploaded backup");
        Ok(StoredFile {
            size_bytes,
            local_filepath: None,
        })
    }

    async fn discard(&self, upload: Upload) {
        drop(upload);
    }

    async fn get_file_stream(&self, id: &str) -> Result<FileStream> {
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(id)
            .send()
            .await
            .map_err(|e| storage_error("download", id, e))?;
        Ok(Box::new(object.body.into_async_read()))
    }

    async fn delete_file(&self, id: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(id)
            .send()
            .await
            .map_err(|e| storage_error("delete", id, e))?;
        Ok(())
    }

    async fn download(&self, id: &str, expires_in: Duration) -> Result<Download> {
        let config = PresigningConfig::expires_in(expires_in)
            .map_err(|e| storage_error("presign", id, e))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(id)
            .presigned(config)
            .await
            .map_err(|e| storage_error("presign", id, e))?;
        Ok(Download::Url(request.uri().to_string()))
    }
}
