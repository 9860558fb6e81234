pub mod backup;
pub mod backup_config;
pub mod connection;

pub use backup::{
    BackupJob, BackupStatus, Destination, DumpFormat, DumpOptions, PgDumpAllOptions,
    PgDumpOptions, PgRestoreOptions, Progress, PsqlRestoreOptions, RestoreOptions,
};
pub use backup_config::{AutomaticBackupConfig, Frequency};
pub use connection::{Connection, Credential, DatabaseConfig};
