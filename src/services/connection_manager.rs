//! Owns the per-connection runtime: the managed database pool and the forked
//! workers that run user scripts against it.

use crate::config::WorkerSettings;
use crate::error::{AppError, Result};
use crate::models::{Connection, DatabaseConfig};
use crate::repository::{
    BackupRepository, ConnectionRepository, DatabaseConfigRepository, LogColumn,
};
use crate::services::DatabaseRegistry;
use crate::worker::process::InitArgs;
use crate::worker::{ForkedWorker, ProcStats, WorkerKind, WorkerLogSink, WorkerOptions};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{error, info, warn};

const WORKER_SUBCOMMAND: &str = "worker";

/// Writes a worker's rolling log into its column of `database_config_logs`.
pub struct ConfigLogSink {
    configs: DatabaseConfigRepository,
    database_config_id: i64,
    column: LogColumn,
}

#[async_trait]
impl WorkerLogSink for ConfigLogSink {
    async fn persist(&self, logs: String) {
        if let Err(e) = self
            .configs
            .write_logs(self.database_config_id, self.column, Some(&logs))
            .await
        {
            warn!(config_id = self.database_config_id, "Failed to persist worker logs: {}", e);
        }
    }
}

/// User scripts configured per database, each run by its own worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptSetting {
    TableConfig,
    OnMount,
}

impl ScriptSetting {
    fn kind(self, code: String) -> WorkerKind {
        match self {
            ScriptSetting::TableConfig => WorkerKind::TableConfig { code },
            ScriptSetting::OnMount => WorkerKind::OnMount { code },
        }
    }

    fn label(self) -> &'static str {
        match self {
            ScriptSetting::TableConfig => "table_config",
            ScriptSetting::OnMount => "on_mount",
        }
    }

    fn log_column(self) -> LogColumn {
        match self {
            ScriptSetting::TableConfig => LogColumn::TableConfig,
            ScriptSetting::OnMount => LogColumn::OnMount,
        }
    }

    /// Code that should be running, `None` when unset or disabled.
    fn desired(self, config: &DatabaseConfig) -> Option<String> {
        let (code, disabled) = match self {
            ScriptSetting::TableConfig => (&config.table_config_code, config.table_config_disabled),
            ScriptSetting::OnMount => (&config.on_mount_code, config.on_mount_disabled),
        };
        code.clone().filter(|c| !disabled && !c.trim().is_empty())
    }
}

struct ScriptWorker {
    code: String,
    worker: Arc<ForkedWorker>,
}

struct ConnectionSession {
    connection: Connection,
    config: DatabaseConfig,
    run: Arc<ForkedWorker>,
    table_config: Option<ScriptWorker>,
    on_mount: Option<ScriptWorker>,
}

impl ConnectionSession {
    fn script(&self, setting: ScriptSetting) -> &Option<ScriptWorker> {
        match setting {
            ScriptSetting::TableConfig => &self.table_config,
            ScriptSetting::OnMount => &self.on_mount,
        }
    }

    fn script_mut(&mut self, setting: ScriptSetting) -> &mut Option<ScriptWorker> {
        match setting {
            ScriptSetting::TableConfig => &mut self.table_config,
            ScriptSetting::OnMount => &mut self.on_mount,
        }
    }

    fn workers(&self) -> Vec<Arc<ForkedWorker>> {
        let mut workers = vec![self.run.clone()];
        workers.extend(self.table_config.as_ref().map(|s| s.worker.clone()));
        workers.extend(self.on_mount.as_ref().map(|s| s.worker.clone()));
        workers
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub kind: &'static str,
    #[serde(flatten)]
    pub stats: ProcStats,
}

#[derive(Clone)]
pub struct ConnectionManager {
    connections: ConnectionRepository,
    configs: DatabaseConfigRepository,
    backups: BackupRepository,
    registry: DatabaseRegistry,
    backup_waker: Arc<Notify>,
    settings: WorkerSettings,
    sessions: Arc<Mutex<HashMap<String, ConnectionSession>>>,
}

impl ConnectionManager {
    pub fn new(
        connections: ConnectionRepository,
        configs: DatabaseConfigRepository,
        backups: BackupRepository,
        registry: DatabaseRegistry,
        backup_waker: Arc<Notify>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            connections,
            configs,
            backups,
            registry,
            backup_waker,
            settings,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn is_started(&self, connection_id: &str) -> bool {
        self.sessions.lock().await.contains_key(connection_id)
    }

    /// Opens the database and starts the workers. A broken table-config or
    /// on-mount script is disabled and reported as an alert; it does not fail
    /// the start.
    pub async fn start_connection(&self, connection_id: &str) -> Result<()> {
        if self.is_started(connection_id).await {
            return Ok(());
        }
        let connection = self.connections.get(connection_id).await?;
        let config = match self.configs.get_by_connection(connection_id).await {
            Ok(config) => config,
            Err(AppError::DatabaseConfigNotFound(_)) => self.configs.create(connection_id).await?,
            Err(e) => return Err(e),
        };
        self.configs.ensure_logs(config.id).await?;
        self.registry.open(&connection).await?;

        let run = match self.spawn_worker(&connection, &config, WorkerKind::Run).await {
            Ok(worker) => worker,
            Err(e) => {
                self.registry.close(connection_id).await;
                return Err(e);
            }
        };

        {
            let mut sessions = self.sessions.lock().await;
            if sessions.contains_key(connection_id) {
                // Lost a race with a concurrent start.
                run.destroy().await;
                return Ok(());
            }
            sessions.insert(
                connection_id.to_string(),
                ConnectionSession {
                    connection,
                    config: config.clone(),
                    run,
                    table_config: None,
                    on_mount: None,
                },
            );
        }

        for setting in [ScriptSetting::TableConfig, ScriptSetting::OnMount] {
            if let Err(e) = self.apply_script(connection_id, setting).await {
                warn!(connection_id, setting = setting.label(), "Script disabled: {}", e);
            }
        }
        info!(connection_id, "Connection started");
        Ok(())
    }

    pub async fn stop_connection(&self, connection_id: &str) {
        let session = self.sessions.lock().await.remove(connection_id);
        if let Some(session) = session {
            for worker in session.workers() {
                worker.destroy().await;
            }
            info!(connection_id, "Connection stopped");
        }
        self.registry.close(connection_id).await;
    }

    pub async fn set_table_config(
        &self,
        connection_id: &str,
        code: Option<&str>,
        disabled: bool,
    ) -> Result<()> {
        self.set_script(connection_id, ScriptSetting::TableConfig, code, disabled)
            .await
    }

    pub async fn set_on_mount(
        &self,
        connection_id: &str,
        code: Option<&str>,
        disabled: bool,
    ) -> Result<()> {
        self.set_script(connection_id, ScriptSetting::OnMount, code, disabled)
            .await
    }

    async fn set_script(
        &self,
        connection_id: &str,
        setting: ScriptSetting,
        code: Option<&str>,
        disabled: bool,
    ) -> Result<()> {
        let config = self.configs.get_by_connection(connection_id).await?;
        match setting {
            ScriptSetting::TableConfig => {
                self.configs
                    .set_table_config(config.id, code, disabled)
                    .await?
            }
            ScriptSetting::OnMount => self.configs.set_on_mount(config.id, code, disabled).await?,
        }
        self.refresh_config(connection_id).await?;
        self.apply_script(connection_id, setting).await
    }

    /// Re-reads the stored config and brings running workers in line with it.
    pub async fn reload_config(&self, connection_id: &str) -> Result<()> {
        let previous = self.refresh_config(connection_id).await?;
        if let Some(previous) = previous {
            let current = self.configs.get_by_connection(connection_id).await?;
            if previous.pass_process_env_vars != current.pass_process_env_vars {
                self.respawn_workers(connection_id).await?;
            }
            for setting in [ScriptSetting::TableConfig, ScriptSetting::OnMount] {
                if let Err(e) = self.apply_script(connection_id, setting).await {
                    warn!(connection_id, setting = setting.label(), "Script disabled: {}", e);
                }
            }
        }
        self.backup_waker.notify_one();
        Ok(())
    }

    /// Stores the latest config in the session. Returns the previous one.
    async fn refresh_config(&self, connection_id: &str) -> Result<Option<DatabaseConfig>> {
        let config = self.configs.get_by_connection(connection_id).await?;
        let mut sessions = self.sessions.lock().await;
        Ok(sessions
            .get_mut(connection_id)
            .map(|session| std::mem::replace(&mut session.config, config)))
    }

    /// Restarts every worker of a connection with freshly built options.
    async fn respawn_workers(&self, connection_id: &str) -> Result<()> {
        let (connection, config) = match self.sessions.lock().await.get(connection_id) {
            Some(session) => (session.connection.clone(), session.config.clone()),
            None => return Ok(()),
        };
        let run = self.spawn_worker(&connection, &config, WorkerKind::Run).await?;

        let old = match self.sessions.lock().await.get_mut(connection_id) {
            Some(session) => {
                let mut old = vec![std::mem::replace(&mut session.run, run)];
                old.extend(session.table_config.take().map(|s| s.worker));
                old.extend(session.on_mount.take().map(|s| s.worker));
                old
            }
            None => vec![run],
        };
        for worker in old {
            worker.destroy().await;
        }
        Ok(())
    }

    /// Starts, replaces or stops the worker for `setting` so it matches the
    /// session's config. Unchanged code is left running.
    async fn apply_script(&self, connection_id: &str, setting: ScriptSetting) -> Result<()> {
        let (connection, config, running) = match self.sessions.lock().await.get(connection_id) {
            Some(session) => (
                session.connection.clone(),
                session.config.clone(),
                session.script(setting).as_ref().map(|s| s.code.clone()),
            ),
            None => return Ok(()),
        };
        let desired = setting.desired(&config);
        if running == desired {
            return Ok(());
        }

        let old = self
            .sessions
            .lock()
            .await
            .get_mut(connection_id)
            .and_then(|session| session.script_mut(setting).take());
        if let Some(old) = old {
            old.worker.destroy().await;
        }
        self.configs
            .write_logs(config.id, setting.log_column(), None)
            .await?;

        let Some(code) = desired else {
            return Ok(());
        };
        let worker = match self.start_script(&connection, &config, setting, &code).await {
            Ok(worker) => worker,
            Err(e) => {
                self.disable_script(connection_id, &config, setting, &e).await;
                return Err(e);
            }
        };

        let orphan = match self.sessions.lock().await.get_mut(connection_id) {
            Some(session) => {
                *session.script_mut(setting) = Some(ScriptWorker { code, worker });
                None
            }
            None => Some(worker),
        };
        if let Some(worker) = orphan {
            worker.destroy().await;
        }
        Ok(())
    }

    async fn start_script(
        &self,
        connection: &Connection,
        config: &DatabaseConfig,
        setting: ScriptSetting,
        code: &str,
    ) -> Result<Arc<ForkedWorker>> {
        let worker = self
            .spawn_worker(connection, config, setting.kind(code.to_string()))
            .await?;
        let result = match setting {
            ScriptSetting::OnMount => worker.on_mount(code).await,
            ScriptSetting::TableConfig => worker.run(code, Value::Null, Value::Null).await,
        };
        if let Err(e) = result {
            worker.destroy().await;
            return Err(e.into());
        }
        info!(connection_id = %connection.id, setting = setting.label(), "Script worker started");
        Ok(worker)
    }

    async fn disable_script(
        &self,
        connection_id: &str,
        config: &DatabaseConfig,
        setting: ScriptSetting,
        err: &AppError,
    ) {
        let message = format!("{} failed and was disabled: {}", setting.label(), err);
        error!(connection_id, "{}", message);
        let disabled = match setting {
            ScriptSetting::TableConfig => {
                self.configs
                    .set_table_config_disabled(config.id, true)
                    .await
            }
            ScriptSetting::OnMount => self.configs.set_on_mount_disabled(config.id, true).await,
        };
        if let Err(e) = disabled {
            warn!(connection_id, "Failed to disable {}: {}", setting.label(), e);
        }
        if let Err(e) = self.configs.insert_alert(config.id, "error", &message).await {
            warn!(connection_id, "Failed to record alert: {}", e);
        }
        if let Err(e) = self.refresh_config(connection_id).await {
            warn!(connection_id, "Failed to refresh config: {}", e);
        }
    }

    async fn spawn_worker(
        &self,
        connection: &Connection,
        config: &DatabaseConfig,
        kind: WorkerKind,
    ) -> Result<Arc<ForkedWorker>> {
        let program = match &self.settings.program {
            Some(program) => program.clone(),
            None => std::env::current_exe()?,
        };
        let init = InitArgs {
            runtime: self.settings.runtime.clone(),
            kind: kind.label().to_string(),
            env: connection.env_vars().into_iter().collect(),
            check_database: true,
        };
        let sink = Arc::new(ConfigLogSink {
            configs: self.configs.clone(),
            database_config_id: config.id,
            column: kind.log_column(),
        });
        let options = WorkerOptions {
            program,
            args: vec![WORKER_SUBCOMMAND.to_string()],
            init_args: serde_json::to_value(&init)?,
            kind,
            pass_process_env_vars: config.pass_process_env_vars,
            settings: self.settings.clone(),
        };
        Ok(Arc::new(ForkedWorker::create(options, sink).await?))
    }

    async fn run_worker(&self, connection_id: &str) -> Result<Arc<ForkedWorker>> {
        self.sessions
            .lock()
            .await
            .get(connection_id)
            .map(|session| session.run.clone())
            .ok_or_else(|| AppError::ConnectionNotFound(connection_id.to_string()))
    }

    /// Runs a published method body in the connection's worker.
    pub async fn run_method(
        &self,
        connection_id: &str,
        code: &str,
        args: Value,
        user: Value,
    ) -> Result<Value> {
        let worker = self.run_worker(connection_id).await?;
        Ok(worker.run(code, args, user).await?)
    }

    pub async fn process_stats(&self, connection_id: &str) -> Result<Vec<WorkerStats>> {
        let workers = self
            .sessions
            .lock()
            .await
            .get(connection_id)
            .map(ConnectionSession::workers)
            .ok_or_else(|| AppError::ConnectionNotFound(connection_id.to_string()))?;

        let mut stats = Vec::with_capacity(workers.len());
        for worker in workers {
            match worker.get_process_stats().await {
                Ok(proc) => stats.push(WorkerStats {
                    kind: worker.kind().label(),
                    stats: proc,
                }),
                Err(e) => warn!(connection_id, kind = worker.kind().label(), "No stats: {}", e),
            }
        }
        Ok(stats)
    }

    /// Stops the connection and removes it. Its backups are kept without a connection.
    pub async fn delete_connection(&self, connection_id: &str) -> Result<()> {
        self.stop_connection(connection_id).await;
        let detached = self.backups.detach_connection(connection_id).await?;
        self.configs.delete_by_connection(connection_id).await?;
        self.connections.delete(connection_id).await?;
        info!(connection_id, detached_backups = detached, "Connection deleted");
        Ok(())
    }

    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        for id in ids {
            self.stop_connection(&id).await;
        }
        self.registry.close_all().await;
    }
}
