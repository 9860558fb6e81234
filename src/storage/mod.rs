//! Artifact stores for backup files and the free space probe used before local dumps.

pub mod local;
pub mod s3;

use crate::error::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncRead;

pub use local::LocalStore;
pub use s3::S3Store;

pub type FileStream = Box<dyn AsyncRead + Send + Unpin>;

/// A file being written. The store decides where it is staged; the bytes only
/// become visible under the artifact id after [`FileStore::commit`].
pub struct Upload {
    pub file: tokio::fs::File,
    pub(crate) path: PathBuf,
    pub(crate) content_type: String,
    pub(crate) _staging: Option<tempfile::TempPath>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub size_bytes: u64,
    pub local_filepath: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Download {
    LocalFile(PathBuf),
    Url(String),
}

#[async_trait]
pub trait FileStore: Send + Sync {
    async fn upload(&self, id: &str, content_type: &str) -> Result<Upload>;

    async fn commit(&self, id: &str, upload: Upload) -> Result<StoredFile>;

    async fn discard(&self, upload: Upload);

    async fn get_file_stream(&self, id: &str) -> Result<FileStream>;

    async fn delete_file(&self, id: &str) -> Result<()>;

    async fn download(&self, id: &str, expires_in: Duration) -> Result<Download>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskSpace {
    pub total: u64,
    pub free: u64,
}

pub trait DiskSpaceProbe: Send + Sync {
    fn disk_space(&self, path: &Path) -> Result<DiskSpace>;
}

pub struct Fs2DiskSpace;

impl DiskSpaceProbe for Fs2DiskSpace {
    fn disk_space(&self, path: &Path) -> Result<DiskSpace> {
        Ok(DiskSpace {
            total: fs2::total_space(path)?,
            free: fs2::available_space(path)?,
        })
    }
}

pub fn bytes_to_size(bytes: u64) -> String {
    const SIZES: [&str; 5] = ["Bytes", "KB", "MB", "GB", "TB"];
    if bytes == 0 {
        return "0 Bytes".to_string();
    }
    let i = ((bytes as f64).ln() / 1024f64.ln()).floor() as usize;
    let i = i.min(SIZES.len() - 1);
    format!("{} {}", (bytes as f64 / 1024f64.powi(i as i32)).round(), SIZES[i])
}
