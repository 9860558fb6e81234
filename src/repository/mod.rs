pub mod backup_repository;
pub mod connection;
pub mod connection_repository;
pub mod database_config_repository;

pub use backup_repository::BackupRepository;
pub use connection::establish_connection;
pub use connection_repository::ConnectionRepository;
pub use database_config_repository::{DatabaseConfigRepository, LogColumn};

pub type DbPool = sqlx::SqlitePool;
