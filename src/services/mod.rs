pub mod backup_service;
pub mod connection_manager;
pub mod db_registry;
pub mod scheduler;
pub mod upload_streams;

pub use backup_service::BackupService;
pub use connection_manager::{ConnectionManager, WorkerStats};
pub use db_registry::{DatabaseRegistry, ManagedDatabases};
pub use scheduler::{AUTO_INITIATOR, BackupScheduler};
pub use upload_streams::UploadStreams;
