use crate::worker::WorkerError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Could not find the connection: {0}")]
    ConnectionNotFound(String),

    #[error("Could not find the backup: {0}")]
    BackupNotFound(String),

    #[error("Could not find the credentials: {0}")]
    CredentialNotFound(i64),

    #[error("Database config not found for connection: {0}")]
    DatabaseConfigNotFound(String),

    #[error("{0}")]
    InsufficientSpace(String),

    #[error("Cannot backup while another backup is in progress")]
    BackupInProgress,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Command failed: {0}")]
    Command(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),
}

pub type Result<T> = std::result::Result<T, AppError>;
