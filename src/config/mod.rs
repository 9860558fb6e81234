use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub backup_dir: PathBuf,
    /// Directory holding pg_dump/pg_restore/psql. Resolved through PATH when unset.
    pub pg_bin_dir: Option<PathBuf>,
    pub backup: BackupSettings,
    pub worker: WorkerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSettings {
    pub check_interval_secs: u64,
    /// A `{loading}` job not updated within this window is considered dead.
    pub freshness_window_secs: u64,
    pub progress_interval_ms: u64,
    pub min_free_space_bytes: u64,
    pub upload_idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Program started as the forked worker. Defaults to this executable.
    pub program: Option<PathBuf>,
    pub restart_debounce_ms: u64,
    pub restart_delay_ms: u64,
    pub startup_timeout_secs: u64,
    pub log_lines: usize,
    /// Interpreter used by workers for user scripts: program followed by leading args.
    pub runtime: Vec<String>,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            check_interval_secs: 15 * 60,
            freshness_window_secs: 5,
            progress_interval_ms: 1000,
            min_free_space_bytes: 100_000_000,
            upload_idle_timeout_secs: 60,
        }
    }
}

impl BackupSettings {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.freshness_window_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn upload_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_idle_timeout_secs)
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            program: None,
            restart_debounce_ms: 400,
            restart_delay_ms: 1000,
            startup_timeout_secs: 30,
            log_lines: 500,
            runtime: vec!["python3".to_string(), "-c".to_string()],
        }
    }
}

impl WorkerSettings {
    pub fn restart_debounce(&self) -> Duration {
        Duration::from_millis(self.restart_debounce_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        let database_url = crate::paths::data_dir()
            .map(|dir| format!("sqlite:{}", dir.join("pg_orchestrator.db").display()))
            .unwrap_or_else(|_| "sqlite:pg_orchestrator.db".to_string());
        let backup_dir = crate::paths::backups_dir().unwrap_or_else(|_| PathBuf::from("backups"));
        Self {
            database_url,
            backup_dir,
            pg_bin_dir: None,
            backup: BackupSettings::default(),
            worker: WorkerSettings::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(file_config) = Self::from_conf_file()? {
            config.apply_file(file_config);
        }

        if let Ok(db_url) = std::env::var("DATABASE_URL") {
            config.database_url = db_url;
        }

        if let Ok(dir) = std::env::var("BACKUP_DIR") {
            config.backup_dir = PathBuf::from(dir);
        }

        if let Ok(dir) = std::env::var("PG_BIN_DIR") {
            config.pg_bin_dir = Some(PathBuf::from(dir));
        }

        if let Ok(secs) = std::env::var("BACKUP_CHECK_INTERVAL_SECS") {
            config.backup.check_interval_secs = secs
                .parse()
                .with_context(|| format!("Invalid BACKUP_CHECK_INTERVAL_SECS: {}", secs))?;
        }

        if let Ok(runtime) = std::env::var("WORKER_RUNTIME") {
            config.worker.runtime = runtime.split_whitespace().map(str::to_string).collect();
        }

        config.validate()?;
        Ok(config)
    }

    fn from_conf_file() -> Result<Option<FileConfig>> {
        let path = crate::paths::conf_dir()?.join("config.json");
        if !path.is_file() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let file_config = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(Some(file_config))
    }

    fn apply_file(&mut self, file_config: FileConfig) {
        if let Some(database_url) = file_config.database_url {
            self.database_url = database_url;
        }
        if let Some(backup_dir) = file_config.backup_dir {
            self.backup_dir = PathBuf::from(backup_dir);
        }
        if let Some(pg_bin_dir) = file_config.pg_bin_dir {
            self.pg_bin_dir = Some(PathBuf::from(pg_bin_dir));
        }
        if let Some(secs) = file_config.backup_check_interval_secs {
            self.backup.check_interval_secs = secs;
        }
        if let Some(secs) = file_config.backup_freshness_window_secs {
            self.backup.freshness_window_secs = secs;
        }
        if let Some(runtime) = file_config.worker_runtime {
            self.worker.runtime = runtime;
        }
        if let Some(program) = file_config.worker_program {
            self.worker.program = Some(PathBuf::from(program));
        }
    }

    fn validate(&self) -> Result<()> {
        if self.worker.runtime.is_empty() {
            anyhow::bail!("worker runtime cannot be empty");
        }
        if self.backup.check_interval_secs == 0 {
            anyhow::bail!("backup check interval must be greater than zero");
        }
        if self.backup_dir.as_os_str().is_empty() {
            anyhow::bail!("backup_dir cannot be empty");
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    database_url: Option<String>,
    backup_dir: Option<String>,
    pg_bin_dir: Option<String>,
    backup_check_interval_secs: Option<u64>,
    backup_freshness_window_secs: Option<u64>,
    worker_runtime: Option<Vec<String>>,
    worker_program: Option<String>,
}
