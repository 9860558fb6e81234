use serde::{Deserialize, Serialize};
use sqlx::types::Json;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BackupJob {
    pub id: String,
    /// Cleared when the connection is deleted; the history is kept.
    pub connection_id: Option<String>,
    pub credential_id: Option<i64>,
    pub destination: Destination,
    pub initiator: String,
    pub dump_command: String,
    pub restore_command: Option<String>,
    pub options: Json<DumpOptions>,
    pub restore_options: Option<Json<RestoreOptions>>,
    pub status: Json<BackupStatus>,
    pub restore_status: Option<Json<BackupStatus>>,
    pub content_type: String,
    pub db_size_bytes: Option<i64>,
    pub size_bytes: Option<i64>,
    pub local_filepath: Option<String>,
    pub dump_logs: Option<String>,
    pub restore_logs: Option<String>,
    pub created: i64,
    pub last_updated: i64,
    pub uploaded: Option<i64>,
    pub restore_start: Option<i64>,
    pub restore_end: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[repr(i32)]
pub enum Destination {
    Local = 0,
    Cloud = 1,
    TempStream = 2,
}

impl Destination {
    pub fn label(self) -> &'static str {
        match self {
            Destination::Local => "Local",
            Destination::Cloud => "Cloud",
            Destination::TempStream => "None (temp stream)",
        }
    }
}

/// Job status. Once `Ok` or `Err` is set the job never returns to `Loading`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Ok(String),
    Err(String),
    Loading(Progress),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Progress {
    pub loaded: u64,
    pub total: u64,
}

impl BackupStatus {
    pub fn loading(loaded: u64, total: u64) -> Self {
        BackupStatus::Loading(Progress { loaded, total })
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, BackupStatus::Loading(_))
    }

    pub fn is_err(&self) -> bool {
        matches!(self, BackupStatus::Err(_))
    }

    pub fn is_finished(&self) -> bool {
        !self.is_loading()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DumpFormat {
    #[serde(rename = "p")]
    Plain,
    #[serde(rename = "c")]
    Custom,
    #[serde(rename = "t")]
    Tar,
}

impl DumpFormat {
    pub fn as_flag(self) -> &'static str {
        match self {
            DumpFormat::Plain => "p",
            DumpFormat::Custom => "c",
            DumpFormat::Tar => "t",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "command")]
pub enum DumpOptions {
    #[serde(rename = "pg_dump")]
    PgDump(PgDumpOptions),
    #[serde(rename = "pg_dumpall")]
    PgDumpAll(PgDumpAllOptions),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PgDumpOptions {
    pub format: DumpFormat,
    #[serde(default)]
    pub clean: bool,
    #[serde(default)]
    pub create: bool,
    #[serde(default)]
    pub no_owner: bool,
    #[serde(default)]
    pub if_exists: bool,
    #[serde(default)]
    pub data_only: bool,
    #[serde(default)]
    pub schema_only: bool,
    pub encoding: Option<String>,
    pub exclude_schema: Option<String>,
    pub compression_level: Option<u8>,
    pub number_of_jobs: Option<u32>,
    #[serde(default)]
    pub keep_logs: bool,
}

impl PgDumpOptions {
    pub fn new(format: DumpFormat) -> Self {
        Self {
            format,
            clean: false,
            create: false,
            no_owner: false,
            if_exists: false,
            data_only: false,
            schema_only: false,
            encoding: None,
            exclude_schema: None,
            compression_level: None,
            number_of_jobs: None,
            keep_logs: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PgDumpAllOptions {
    #[serde(default)]
    pub clean: bool,
    #[serde(default)]
    pub if_exists: bool,
    #[serde(default)]
    pub globals_only: bool,
    #[serde(default)]
    pub roles_only: bool,
    #[serde(default)]
    pub data_only: bool,
    #[serde(default)]
    pub schema_only: bool,
    pub encoding: Option<String>,
    #[serde(default)]
    pub keep_logs: bool,
}

impl DumpOptions {
    pub fn keep_logs(&self) -> bool {
        match self {
            DumpOptions::PgDump(o) => o.keep_logs,
            DumpOptions::PgDumpAll(o) => o.keep_logs,
        }
    }

    pub fn is_dump_all(&self) -> bool {
        matches!(self, DumpOptions::PgDumpAll(_))
    }

    /// Plain SQL output is restored with psql, everything else with pg_restore.
    pub fn is_plain_sql(&self) -> bool {
        match self {
            DumpOptions::PgDump(o) => o.format == DumpFormat::Plain,
            DumpOptions::PgDumpAll(_) => true,
        }
    }

    pub fn content_type(&self) -> &'static str {
        if self.is_plain_sql() {
            "text/sql"
        } else {
            "application/gzip"
        }
    }

    pub fn file_extension(&self) -> &'static str {
        if self.is_plain_sql() { "sql" } else { "dump" }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "command")]
pub enum RestoreOptions {
    #[serde(rename = "pg_restore")]
    PgRestore(PgRestoreOptions),
    #[serde(rename = "psql")]
    Psql(PsqlRestoreOptions),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PgRestoreOptions {
    pub format: Option<DumpFormat>,
    #[serde(default)]
    pub clean: bool,
    #[serde(default)]
    pub create: bool,
    #[serde(default)]
    pub no_owner: bool,
    #[serde(default)]
    pub data_only: bool,
    #[serde(default)]
    pub if_exists: bool,
    pub number_of_jobs: Option<u32>,
    pub new_db_name: Option<String>,
    #[serde(default)]
    pub keep_logs: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PsqlRestoreOptions {
    pub new_db_name: Option<String>,
}

impl RestoreOptions {
    pub fn new_db_name(&self) -> Option<&str> {
        match self {
            RestoreOptions::PgRestore(o) => o.new_db_name.as_deref(),
            RestoreOptions::Psql(o) => o.new_db_name.as_deref(),
        }
        .filter(|name| !name.trim().is_empty())
    }

    pub fn validate(&self) -> Result<(), String> {
        if let RestoreOptions::PgRestore(o) = self {
            if o.create && self.new_db_name().is_some() {
                return Err("Cannot use 'new_db_name' together with 'create'. --create will still restore into the database named within the dump file".to_string());
            }
            if o.format == Some(DumpFormat::Plain) {
                return Err("Plain SQL dumps must be restored with psql".to_string());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_uses_tagged_json_shape() {
        let loading = serde_json::to_value(BackupStatus::loading(10, 20)).unwrap();
        assert_eq!(loading, serde_json::json!({ "loading": { "loaded": 10, "total": 20 } }));

        let err: BackupStatus = serde_json::from_str(r#"{ "err": "boom" }"#).unwrap();
        assert!(err.is_err());
        assert!(err.is_finished());
    }

    #[test]
    fn dump_options_are_tagged_by_command() {
        let options: DumpOptions = serde_json::from_str(
            r#"{ "command": "pg_dump", "format": "c", "clean": true, "number_of_jobs": 2 }"#,
        )
        .unwrap();
        let DumpOptions::PgDump(o) = &options else {
            panic!("expected pg_dump options");
        };
        assert_eq!(o.format, DumpFormat::Custom);
        assert!(o.clean);
        assert_eq!(o.number_of_jobs, Some(2));
        assert_eq!(options.content_type(), "application/gzip");

        let all: DumpOptions = serde_json::from_str(r#"{ "command": "pg_dumpall" }"#).unwrap();
        assert!(all.is_dump_all());
        assert_eq!(all.file_extension(), "sql");
    }

    #[test]
    fn restore_rejects_new_db_name_with_create() {
        let options = RestoreOptions::PgRestore(PgRestoreOptions {
            create: true,
            new_db_name: Some("copy".to_string()),
            ..Default::default()
        });
        assert!(options.validate().is_err());

        let options = RestoreOptions::PgRestore(PgRestoreOptions {
            new_db_name: Some("  ".to_string()),
            ..Default::default()
        });
        assert_eq!(options.new_db_name(), None);
        assert!(options.validate().is_ok());
    }
}
