use crate::config::BackupSettings;
use crate::error::{AppError, Result};
use crate::executor::{
    CommandSpec, PgTool, PipeEvent, dump_args, pg_tools, pipe_from_command, pipe_to_command,
    resolve_tool, restore_args,
};
use crate::models::{
    BackupJob, BackupStatus, Connection, Destination, DumpFormat, DumpOptions, PgDumpOptions,
    Progress, RestoreOptions,
};
use crate::repository::{BackupRepository, ConnectionRepository};
use crate::services::db_registry::ManagedDatabases;
use crate::storage::{
    DiskSpaceProbe, Download, FileStore, FileStream, LocalStore, S3Store, Upload, bytes_to_size,
};
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const MANUAL_INITIATOR: &str = "manual_backup";

const SPACE_MARGIN: f64 = 1.1;
const DOWNLOAD_BYTES_PER_SEC: u64 = 50 * 1024;
const MIN_DOWNLOAD_EXPIRY: Duration = Duration::from_secs(60);
const MIN_RESTORE_SAMPLE: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct BackupService {
    backups: BackupRepository,
    connections: ConnectionRepository,
    local: LocalStore,
    databases: Arc<dyn ManagedDatabases>,
    disk: Arc<dyn DiskSpaceProbe>,
    pg_bin_dir: Option<PathBuf>,
    settings: BackupSettings,
}

impl BackupService {
    pub fn new(
        backups: BackupRepository,
        connections: ConnectionRepository,
        local: LocalStore,
        databases: Arc<dyn ManagedDatabases>,
        disk: Arc<dyn DiskSpaceProbe>,
        pg_bin_dir: Option<PathBuf>,
        settings: BackupSettings,
    ) -> Self {
        Self {
            backups,
            connections,
            local,
            databases,
            disk,
            pg_bin_dir,
            settings,
        }
    }

    pub fn backups(&self) -> &BackupRepository {
        &self.backups
    }

    /// Local dumps need 1.1x the database size plus the configured floor.
    /// Returns the database size.
    pub async fn check_if_enough_space(&self, connection: &Connection) -> Result<u64> {
        let db_size = self.databases.database_size(connection).await?;
        tokio::fs::create_dir_all(self.local.dir()).await?;
        let space = self.disk.disk_space(self.local.dir())?;
        let required = (db_size as f64 * SPACE_MARGIN) as u64 + self.settings.min_free_space_bytes;
        if space.free < required {
            return Err(AppError::InsufficientSpace(format!(
                "There is not enough space on server for local backups:\nTotal: {}\nRemaining: {}\nRequired: {}",
                bytes_to_size(space.total),
                bytes_to_size(space.free),
                bytes_to_size(required),
            )));
        }
        Ok(db_size)
    }

    pub async fn check_space(&self, connection_id: &str) -> Result<u64> {
        let connection = self.connections.get(connection_id).await?;
        self.check_if_enough_space(&connection).await
    }

    async fn store_for(&self, credential_id: Option<i64>) -> Result<Arc<dyn FileStore>> {
        match credential_id {
            None => Ok(Arc::new(self.local.clone())),
            Some(id) => {
                let credential = self.connections.get_credential(id).await?;
                Ok(Arc::new(S3Store::from_credential(&credential).await))
            }
        }
    }

    /// Starts a dump and returns its backup id right away. The dump keeps
    /// running in the background and reports through the job row.
    pub async fn dump(
        &self,
        connection_id: &str,
        credential_id: Option<i64>,
        options: DumpOptions,
        initiator: &str,
    ) -> Result<String> {
        let (id, _handle) = self
            .start_dump(connection_id, credential_id, options, initiator)
            .await?;
        Ok(id)
    }

    /// Runs a dump to completion and returns the finished job.
    pub async fn dump_and_wait(
        &self,
        connection_id: &str,
        credential_id: Option<i64>,
        options: DumpOptions,
        initiator: &str,
    ) -> Result<BackupJob> {
        let (id, handle) = self
            .start_dump(connection_id, credential_id, options, initiator)
            .await?;
        if let Err(e) = handle.await {
            error!(backup_id = %id, "Dump task failed: {}", e);
        }
        self.backups.get(&id).await
    }

    pub async fn start_dump(
        &self,
        connection_id: &str,
        credential_id: Option<i64>,
        options: DumpOptions,
        initiator: &str,
    ) -> Result<(String, JoinHandle<()>)> {
        let connection = self.connections.get(connection_id).await?;
        let db_size = match credential_id {
            None => Some(self.check_if_enough_space(&connection).await?),
            Some(_) => match self.databases.database_size(&connection).await {
                Ok(size) => Some(size),
                Err(e) => {
                    warn!(connection_id, "Could not read database size: {}", e);
                    None
                }
            },
        };

        if let Some(running) = self
            .backups
            .find_in_progress(connection_id, self.settings.freshness_window())
            .await?
        {
            info!(connection_id, backup_id = %running.id, "Dump already in progress");
            return Err(AppError::BackupInProgress);
        }

        let program = resolve_tool(self.pg_bin_dir.as_deref(), PgTool::for_dump(&options))?;
        let spec = CommandSpec::new(program)
            .args(dump_args(&options, &connection))
            .envs(connection.env_vars());
        let store = self.store_for(credential_id).await?;

        let created = Utc::now();
        let created_ms = created.timestamp_millis();
        let job = BackupJob {
            id: backup_id(&connection.db_name, created, &options),
            connection_id: Some(connection.id.clone()),
            credential_id,
            destination: if credential_id.is_some() {
                Destination::Cloud
            } else {
                Destination::Local
            },
            initiator: initiator.to_string(),
            dump_command: spec.display(),
            restore_command: None,
            content_type: options.content_type().to_string(),
            options: Json(options),
            restore_options: None,
            status: Json(BackupStatus::loading(0, 0)),
            restore_status: None,
            db_size_bytes: db_size.map(|size| size as i64),
            size_bytes: None,
            local_filepath: None,
            dump_logs: None,
            restore_logs: None,
            created: created_ms,
            last_updated: created_ms,
            uploaded: None,
            restore_start: None,
            restore_end: None,
        };
        self.backups.insert(&job).await?;

        let upload = match store.upload(&job.id, &job.content_type).await {
            Ok(upload) => upload,
            Err(e) => {
                self.backups.finish_err(&job.id, &e.to_string()).await?;
                return Err(e);
            }
        };

        info!(backup_id = %job.id, connection_id, initiator, "Dump started");
        let id = job.id.clone();
        let service = self.clone();
        let handle = tokio::spawn(async move {
            let id = job.id.clone();
            if let Err(e) = service.run_dump(job, spec, store, upload).await {
                error!(backup_id = %id, "Failed to record dump result: {}", e);
            }
        });
        Ok((id, handle))
    }

    async fn run_dump(
        &self,
        job: BackupJob,
        spec: CommandSpec,
        store: Arc<dyn FileStore>,
        mut upload: Upload,
    ) -> Result<()> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let logs_since = job.options.keep_logs().then_some(job.created);

        let backups = self.backups.clone();
        let id = job.id.clone();
        let monitor = tokio::spawn(track_progress(
            events_rx,
            self.settings.progress_interval(),
            logs_since,
            cancel.clone(),
            move |bytes, logs| {
                let backups = backups.clone();
                let id = id.clone();
                async move {
                    if !logs.is_empty() {
                        backups.append_dump_logs(&id, &logs).await?;
                    }
                    backups
                        .update_progress(&id, Progress { loaded: bytes, total: 0 })
                        .await
                }
            },
        ));

        let result = pipe_from_command(&spec, &mut upload.file, &events_tx, &cancel).await;
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                drop(events_tx);
                if let Err(e) = monitor.await {
                    warn!(backup_id = %job.id, "Progress monitor failed: {}", e);
                }
                store.discard(upload).await;
                error!(backup_id = %job.id, "Dump failed: {}", e);
                self.backups.finish_err(&job.id, &e.to_string()).await?;
                return Ok(());
            }
        };

        // The monitor keeps refreshing the row while the artifact is stored, so
        // a slow cloud upload still counts as in progress.
        let stored = tokio::select! {
            stored = store.commit(&job.id, upload) => stored,
            _ = cancel.cancelled() => Err(AppError::Cancelled(format!(
                "backup {} was removed while uploading", job.id
            ))),
        };
        drop(events_tx);
        if let Err(e) = monitor.await {
            warn!(backup_id = %job.id, "Progress monitor failed: {}", e);
        }

        let recorded = match &stored {
            Ok(file) => {
                self.backups
                    .finish_ok(&job.id, file.size_bytes, file.local_filepath.as_deref())
                    .await?
            }
            Err(e) => {
                error!(backup_id = %job.id, "Failed to store dump: {}", e);
                self.backups.finish_err(&job.id, &e.to_string()).await?
            }
        };
        match stored {
            Ok(file) if recorded => info!(
                backup_id = %job.id,
                size = %bytes_to_size(file.size_bytes),
                streamed = outcome.bytes,
                "Dump finished"
            ),
            Ok(_) | Err(AppError::Cancelled(_)) => {
                // The job was deleted while the artifact was being written.
                warn!(backup_id = %job.id, "Dump finished for a removed job, deleting artifact");
                if let Err(e) = store.delete_file(&job.id).await {
                    debug!(backup_id = %job.id, "No orphan artifact removed: {}", e);
                }
            }
            Err(_) => {}
        }
        Ok(())
    }

    /// Restores a backup into its connection (or `connection_id`). The source is
    /// the stored artifact unless `source` is given. Failures of the restore
    /// itself end up in `restore_status`; only caller mistakes are returned as errors.
    pub async fn restore(
        &self,
        backup_id: &str,
        connection_id: Option<&str>,
        source: Option<FileStream>,
        options: RestoreOptions,
    ) -> Result<BackupStatus> {
        let job = self.backups.get(backup_id).await?;
        let connection_id = connection_id
            .map(str::to_string)
            .or_else(|| job.connection_id.clone())
            .ok_or_else(|| {
                AppError::InvalidInput(
                    "Must provide a connection id if backup does not have a connection_id"
                        .to_string(),
                )
            })?;
        let connection = self.connections.get(&connection_id).await?;
        options.validate().map_err(AppError::InvalidInput)?;
        let tool = PgTool::for_restore(&options);
        if job.options.is_plain_sql() && tool == PgTool::PgRestore {
            return Err(AppError::InvalidInput(
                "Plain SQL dumps must be restored with psql".to_string(),
            ));
        }

        match self
            .run_restore(&job, &connection, source, &options, tool)
            .await
        {
            Ok(()) => {
                self.backups.finish_restore_ok(&job.id).await?;
                info!(backup_id = %job.id, connection_id = %connection.id, "Restore finished");
            }
            Err(e) => {
                error!(backup_id = %job.id, "Restore failed: {}", e);
                self.backups.finish_restore_err(&job.id, &e.to_string()).await?;
            }
        }

        let job = self.backups.get(&job.id).await?;
        Ok(job
            .restore_status
            .map(|status| status.0)
            .unwrap_or_else(|| BackupStatus::Err("Restore status missing".to_string())))
    }

    async fn run_restore(
        &self,
        job: &BackupJob,
        connection: &Connection,
        source: Option<FileStream>,
        options: &RestoreOptions,
        tool: PgTool,
    ) -> Result<()> {
        let target = match options.new_db_name() {
            Some(name) => {
                self.databases.create_database(connection, name).await?;
                connection.with_database(name)
            }
            None => connection.clone(),
        };

        let from_local_file = tool == PgTool::PgRestore && pg_tools::restore_from_local_file();
        let local_file = match (&source, &job.local_filepath) {
            (None, Some(path)) if from_local_file => Some(PathBuf::from(path)),
            _ => None,
        };

        let program = resolve_tool(self.pg_bin_dir.as_deref(), tool)?;
        let spec = CommandSpec::new(program)
            .args(restore_args(options, &target.db_name, local_file.as_deref()))
            .envs(target.env_vars());
        let total = job.size_bytes.unwrap_or(0).max(0) as u64;
        let restore_start = self
            .backups
            .start_restore(&job.id, &spec.display(), options, total)
            .await?;

        let mut source = match source {
            Some(source) => Some(source),
            None if local_file.is_some() => None,
            None => {
                let store = self.store_for(job.credential_id).await?;
                Some(store.get_file_stream(&job.id).await?)
            }
        };

        info!(
            backup_id = %job.id,
            database = %target.db_name,
            tool = tool.name(),
            "Restore started"
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let backups = self.backups.clone();
        let id = job.id.clone();
        let monitor = tokio::spawn(track_progress(
            events_rx,
            self.settings.progress_interval().max(MIN_RESTORE_SAMPLE),
            Some(restore_start),
            cancel.clone(),
            move |bytes, logs| {
                let backups = backups.clone();
                let id = id.clone();
                async move {
                    if !logs.is_empty() {
                        backups.append_restore_logs(&id, &logs).await?;
                    }
                    backups
                        .update_restore_progress(&id, Progress { loaded: bytes, total })
                        .await
                }
            },
        ));

        let result = pipe_to_command(&spec, source.as_mut(), &events_tx, &cancel).await;
        drop(events_tx);
        if let Err(e) = monitor.await {
            warn!(backup_id = %job.id, "Progress monitor failed: {}", e);
        }
        result.map(|_| ())
    }

    /// Restores a payload that was never stored as a backup. A synthetic job row
    /// tracks it. Returns the job id with the final restore status.
    pub async fn restore_from_uploaded_stream(
        &self,
        file_name: &str,
        connection_id: &str,
        stream: FileStream,
        size_bytes: u64,
        options: RestoreOptions,
    ) -> Result<(String, BackupStatus)> {
        let connection = self.connections.get(connection_id).await?;
        options.validate().map_err(AppError::InvalidInput)?;

        let format = match PgTool::for_restore(&options) {
            PgTool::Psql => DumpFormat::Plain,
            _ => DumpFormat::Custom,
        };
        let dump_options = DumpOptions::PgDump(PgDumpOptions {
            clean: true,
            if_exists: true,
            ..PgDumpOptions::new(format)
        });
        let now = Utc::now().timestamp_millis();
        let job = BackupJob {
            id: uuid::Uuid::new_v4().to_string(),
            connection_id: Some(connection.id.clone()),
            credential_id: None,
            destination: Destination::TempStream,
            initiator: format!("manual_restore_from_file: {file_name}"),
            dump_command: format!("pg_dump --format={} --clean --if-exists", format.as_flag()),
            restore_command: None,
            content_type: dump_options.content_type().to_string(),
            options: Json(dump_options),
            restore_options: None,
            status: Json(BackupStatus::Ok(now.to_string())),
            restore_status: None,
            db_size_bytes: None,
            size_bytes: Some(size_bytes as i64),
            local_filepath: None,
            dump_logs: None,
            restore_logs: None,
            created: now,
            last_updated: now,
            uploaded: Some(now),
            restore_start: None,
            restore_end: None,
        };
        self.backups.insert(&job).await?;
        info!(backup_id = %job.id, connection_id, file_name, "Restoring uploaded file");

        let status = self
            .restore(&job.id, Some(connection_id), Some(stream), options)
            .await?;
        Ok((job.id, status))
    }

    /// Deletes the artifact then the row. With `force`, a missing or
    /// unreachable artifact does not keep the row alive.
    pub async fn delete_backup(&self, backup_id: &str, force: bool) -> Result<()> {
        let job = self.backups.get(backup_id).await?;
        if job.destination != Destination::TempStream {
            let deleted = match self.store_for(job.credential_id).await {
                Ok(store) => store.delete_file(&job.id).await,
                Err(e) => Err(e),
            };
            if let Err(e) = deleted {
                if !force {
                    return Err(e);
                }
                warn!(backup_id, "Ignoring artifact delete failure: {}", e);
            }
        }
        self.backups.delete(backup_id).await?;
        info!(backup_id, "Backup deleted");
        Ok(())
    }

    /// Local path or a presigned URL valid long enough to fetch the file at 50 KB/s.
    pub async fn backup_download(&self, backup_id: &str) -> Result<Download> {
        let job = self.backups.get(backup_id).await?;
        if job.destination == Destination::TempStream {
            return Err(AppError::InvalidInput(format!(
                "Backup {backup_id} has no stored file"
            )));
        }
        if !matches!(job.status.0, BackupStatus::Ok(_)) {
            return Err(AppError::InvalidInput(format!(
                "Backup {backup_id} is not finished"
            )));
        }
        let size = job.size_bytes.unwrap_or(0).max(0) as u64;
        let expires_in =
            Duration::from_secs(size / DOWNLOAD_BYTES_PER_SEC).max(MIN_DOWNLOAD_EXPIRY);
        self.store_for(job.credential_id)
            .await?
            .download(&job.id, expires_in)
            .await
    }
}

/// `<db>__<created>_pg_dump[all]_<uuid>.<ext>`, with non-word runs in the
/// database name replaced by `_`.
pub fn backup_id(db_name: &str, created: DateTime<Utc>, options: &DumpOptions) -> String {
    let mut name = String::with_capacity(db_name.len());
    let mut in_run = false;
    for c in db_name.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            name.push(c);
            in_run = false;
        } else if !in_run {
            name.push('_');
            in_run = true;
        }
    }
    format!(
        "{}__{}_pg_dump{}_{}.{}",
        name,
        created.format("%Y-%m-%dT%H-%M-%S"),
        if options.is_dump_all() { "all" } else { "" },
        uuid::Uuid::new_v4().simple(),
        options.file_extension(),
    )
}

/// `T+ HH:MM:SS   ` relative to `start_ms`.
fn elapsed_prefix(start_ms: i64, now_ms: i64) -> String {
    let secs = (now_ms - start_ms).max(0) / 1000;
    format!(
        "T+ {:02}:{:02}:{:02}   ",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60
    )
}

/// Drains pipe events, persisting the byte count and buffered log lines on every
/// tick. `persist` returning `false` means the job is gone and the pipe is cancelled.
async fn track_progress<F, Fut>(
    mut events: UnboundedReceiver<PipeEvent>,
    every: Duration,
    logs_since: Option<i64>,
    cancel: CancellationToken,
    mut persist: F,
) where
    F: FnMut(u64, String) -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut bytes = 0;
    let mut logs = String::new();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(PipeEvent::Progress { bytes: total }) => bytes = total,
                Some(PipeEvent::Stderr(line)) | Some(PipeEvent::Stdout(line)) => {
                    if let Some(start) = logs_since {
                        logs.push_str(&elapsed_prefix(start, Utc::now().timestamp_millis()));
                        logs.push_str(&line);
                        logs.push('\n');
                    }
                }
                None => break,
            },
            _ = tick.tick() => {
                match persist(bytes, std::mem::take(&mut logs)).await {
                    Ok(true) => {}
                    Ok(false) => {
                        if !cancel.is_cancelled() {
                            warn!("Job removed or finished while running, aborting");
                            cancel.cancel();
                        }
                    }
                    Err(e) => warn!("Failed to persist progress: {}", e),
                }
            }
        }
    }
    if let Err(e) = persist(bytes, logs).await {
        warn!("Failed to persist progress: {}", e);
    }
}

#[cfg(all(test, unix))]
pub(crate) mod tests {
    use super::*;
    use crate::models::{PgRestoreOptions, PsqlRestoreOptions};
    use crate::repository::connection::test_pool;
    use crate::repository::connection_repository::sample_connection;
    use crate::services::UploadStreams;
    use crate::repository::backup_repository::sample_job;
    use crate::storage::{DiskSpace, StoredFile};
    use bytes::Bytes;
    use chrono::TimeZone;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    pub(crate) struct FakeDatabases {
        pub size: u64,
        pub created: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl ManagedDatabases for FakeDatabases {
        async fn database_size(&self, _connection: &Connection) -> Result<u64> {
            Ok(self.size)
        }

        async fn create_database(&self, _connection: &Connection, name: &str) -> Result<()> {
            self.created
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(name.to_string());
            Ok(())
        }
    }

    pub(crate) struct FixedSpace(pub u64);

    impl DiskSpaceProbe for FixedSpace {
        fn disk_space(&self, _path: &Path) -> Result<DiskSpace> {
            Ok(DiskSpace {
                total: self.0 * 2,
                free: self.0,
            })
        }
    }

    pub(crate) struct Harness {
        pub service: BackupService,
        pub backups: BackupRepository,
        pub connections: ConnectionRepository,
        pub databases: Arc<FakeDatabases>,
        pub pool: crate::repository::DbPool,
        pub bin: TempDir,
        pub files: TempDir,
        _state: TempDir,
    }

    impl Harness {
        pub fn tool(&self, name: &str, body: &str) {
            let path = self.bin.path().join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        pub fn scratch(&self, name: &str) -> PathBuf {
            self.files.path().join(name)
        }
    }

    pub(crate) async fn harness(free_space: u64) -> Harness {
        let (pool, state) = test_pool().await;
        let backups = BackupRepository::new(pool.clone());
        let connections = ConnectionRepository::new(pool.clone());
        connections.create(&sample_connection("c1")).await.unwrap();

        let bin = TempDir::new().unwrap();
        let files = TempDir::new().unwrap();
        let databases = Arc::new(FakeDatabases {
            size: 1_000_000,
            created: Mutex::new(Vec::new()),
        });
        let settings = BackupSettings {
            progress_interval_ms: 50,
            ..BackupSettings::default()
        };
        let service = BackupService::new(
            backups.clone(),
            connections.clone(),
            LocalStore::new(files.path().join("backups")),
            databases.clone(),
            Arc::new(FixedSpace(free_space)),
            Some(bin.path().to_path_buf()),
            settings,
        );
        Harness {
            service,
            backups,
            connections,
            databases,
            pool,
            bin,
            files,
            _state: state,
        }
    }

    pub(crate) fn custom_dump() -> DumpOptions {
        DumpOptions::PgDump(PgDumpOptions {
            clean: true,
            keep_logs: true,
            ..PgDumpOptions::new(DumpFormat::Custom)
        })
    }

    const PLENTY: u64 = 10_000_000_000;

    #[tokio::test]
    async fn dump_produces_artifact_and_masks_password() {
        let h = harness(PLENTY).await;
        h.tool(
            "pg_dump",
            "echo 'pg_dump: dumping contents of table orders' >&2\nhead -c 20000 /dev/zero",
        );

        let job = h
            .service
            .dump_and_wait("c1", None, custom_dump(), MANUAL_INITIATOR)
            .await
            .unwrap();

        assert!(matches!(job.status.0, BackupStatus::Ok(_)), "{:?}", job.status);
        assert_eq!(job.size_bytes, Some(20000));
        assert!(job.dump_command.contains("--format c"));
        assert!(job.dump_command.contains("--clean"));
        assert!(job.dump_command.contains("PGPASSWORD=\"***\""));
        assert!(!job.dump_command.contains("s3cr3t-pass"));
        assert!(job.id.starts_with("shop_db__"));
        assert!(job.id.ends_with(".dump"));
        let logs = job.dump_logs.unwrap_or_default();
        assert!(logs.contains("T+ 00:00:0"));
        assert!(logs.contains("dumping contents of table orders"));

        let path = PathBuf::from(job.local_filepath.unwrap());
        assert_eq!(std::fs::metadata(path).unwrap().len(), 20000);
    }

    #[tokio::test]
    async fn low_space_rejects_before_spawning() {
        let h = harness(50_000_000).await;
        let marker = h.scratch("spawned");
        h.tool("pg_dump", &format!("touch '{}'", marker.display()));

        let err = h
            .service
            .dump("c1", None, custom_dump(), MANUAL_INITIATOR)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InsufficientSpace(_)));
        assert!(err.to_string().contains("Required"));
        assert!(!marker.exists());
        assert!(h.backups.list_by_connection("c1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_dump_is_rejected_while_first_is_fresh() {
        let h = harness(PLENTY).await;
        h.tool("pg_dump", "sleep 1\necho data");

        let (first, handle) = h
            .service
            .start_dump("c1", None, custom_dump(), MANUAL_INITIATOR)
            .await
            .unwrap();
        let err = h
            .service
            .dump("c1", None, custom_dump(), MANUAL_INITIATOR)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BackupInProgress));

        handle.await.unwrap();
        let job = h.backups.get(&first).await.unwrap();
        assert!(matches!(job.status.0, BackupStatus::Ok(_)));
    }

    #[tokio::test]
    async fn failing_dump_records_stderr_and_leaves_no_file() {
        let h = harness(PLENTY).await;
        h.tool(
            "pg_dump",
            "echo 'pg_dump: error: connection to server failed' >&2\nexit 1",
        );

        let job = h
            .service
            .dump_and_wait("c1", None, custom_dump(), MANUAL_INITIATOR)
            .await
            .unwrap();
        let BackupStatus::Err(message) = &job.status.0 else {
            panic!("expected an error status, got {:?}", job.status);
        };
        assert!(message.contains("connection to server failed"));
        let leftovers = std::fs::read_dir(h.files.path().join("backups")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn deleting_the_job_aborts_the_dump() {
        let h = harness(PLENTY).await;
        h.tool("pg_dump", "echo started\nexec sleep 30");

        let (id, handle) = h
            .service
            .start_dump("c1", None, custom_dump(), MANUAL_INITIATOR)
            .await
            .unwrap();
        h.backups.delete(&id).await.unwrap();

        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("dump should stop once its job is gone")
            .unwrap();
        let leftovers = std::fs::read_dir(h.files.path().join("backups")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn restore_streams_stored_artifact_into_pg_restore() {
        let h = harness(PLENTY).await;
        h.tool("pg_dump", "printf 'PAYLOAD'");
        let out = h.scratch("restored");
        h.tool(
            "pg_restore",
            &format!(
                "echo 'pg_restore: processing data' >&2\ncat > '{}'",
                out.display()
            ),
        );

        let job = h
            .service
            .dump_and_wait("c1", None, custom_dump(), MANUAL_INITIATOR)
            .await
            .unwrap();
        let options = RestoreOptions::PgRestore(PgRestoreOptions {
            clean: true,
            ..Default::default()
        });
        let status = h.service.restore(&job.id, None, None, options).await.unwrap();

        assert!(matches!(status, BackupStatus::Ok(_)), "{status:?}");
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "PAYLOAD");
        let job = h.backups.get(&job.id).await.unwrap();
        let command = job.restore_command.unwrap();
        assert!(command.contains("--dbname=shop db"));
        assert!(command.contains("--clean"));
        assert!(job.restore_logs.unwrap_or_default().contains("processing data"));
        assert!(job.restore_end.is_some());
    }

    #[tokio::test]
    async fn plain_dump_needs_psql() {
        let h = harness(PLENTY).await;
        h.tool("pg_dump", "echo 'SELECT 1;'");
        let options = DumpOptions::PgDump(PgDumpOptions::new(DumpFormat::Plain));
        let job = h
            .service
            .dump_and_wait("c1", None, options, MANUAL_INITIATOR)
            .await
            .unwrap();

        let err = h
            .service
            .restore(&job.id, None, None, RestoreOptions::PgRestore(Default::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn failed_restore_is_recorded_not_returned() {
        let h = harness(PLENTY).await;
        h.tool("pg_dump", "printf 'PAYLOAD'");
        h.tool(
            "pg_restore",
            "cat > /dev/null\necho 'pg_restore: error: role \"app\" does not exist' >&2\nexit 1",
        );
        let job = h
            .service
            .dump_and_wait("c1", None, custom_dump(), MANUAL_INITIATOR)
            .await
            .unwrap();

        let status = h
            .service
            .restore(&job.id, None, None, RestoreOptions::PgRestore(Default::default()))
            .await
            .unwrap();
        let BackupStatus::Err(message) = status else {
            panic!("expected restore error");
        };
        assert!(message.contains("does not exist"));
        let job = h.backups.get(&job.id).await.unwrap();
        assert!(matches!(job.status.0, BackupStatus::Ok(_)));
    }

    #[tokio::test]
    async fn uploaded_chunks_reach_psql_in_a_new_database() {
        let h = harness(PLENTY).await;
        let out = h.scratch("uploaded.sql");
        let db = h.scratch("target_db");
        h.tool(
            "psql",
            &format!(
                "echo \"$PGDATABASE\" > '{}'\ncat > '{}'",
                db.display(),
                out.display()
            ),
        );

        let uploads = UploadStreams::new(Duration::from_secs(60));
        let (stream_id, reader) = uploads.begin_upload_stream("u1", "shop.sql").await.unwrap();
        let chunks = ["CREATE TABLE a(id int);\n", "INSERT INTO a ", "VALUES (1);\n"];
        let size: usize = chunks.iter().map(|c| c.len()).sum();
        let writer = uploads.clone();
        let push = tokio::spawn(async move {
            for chunk in chunks {
                writer.push_chunk(&stream_id, Bytes::from(chunk)).await.unwrap();
            }
            writer.end_upload_stream(&stream_id).await.unwrap();
        });

        let options = RestoreOptions::Psql(PsqlRestoreOptions {
            new_db_name: Some("shop_copy".to_string()),
        });
        let (id, status) = h
            .service
            .restore_from_uploaded_stream("shop.sql", "c1", reader, size as u64, options)
            .await
            .unwrap();
        push.await.unwrap();

        assert!(matches!(status, BackupStatus::Ok(_)), "{status:?}");
        assert_eq!(
            std::fs::read_to_string(&out).unwrap(),
            "CREATE TABLE a(id int);\nINSERT INTO a VALUES (1);\n"
        );
        assert_eq!(std::fs::read_to_string(&db).unwrap().trim(), "shop_copy");
        assert_eq!(
            *h.databases.created.lock().unwrap(),
            vec!["shop_copy".to_string()]
        );

        let job = h.backups.get(&id).await.unwrap();
        assert_eq!(job.destination, Destination::TempStream);
        assert_eq!(job.initiator, "manual_restore_from_file: shop.sql");
        assert_eq!(job.size_bytes, Some(size as i64));
        assert!(h.service.backup_download(&id).await.is_err());
    }

    #[tokio::test]
    async fn delete_removes_file_and_row() {
        let h = harness(PLENTY).await;
        h.tool("pg_dump", "printf 'PAYLOAD'");
        let job = h
            .service
            .dump_and_wait("c1", None, custom_dump(), MANUAL_INITIATOR)
            .await
            .unwrap();
        let path = PathBuf::from(job.local_filepath.clone().unwrap());
        assert_eq!(
            h.service.backup_download(&job.id).await.unwrap(),
            Download::LocalFile(path.clone())
        );

        h.service.delete_backup(&job.id, false).await.unwrap();
        assert!(!path.exists());
        assert!(h.backups.find(&job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn forced_delete_ignores_missing_artifact() {
        let h = harness(PLENTY).await;
        h.tool("pg_dump", "printf 'PAYLOAD'");
        let job = h
            .service
            .dump_and_wait("c1", None, custom_dump(), MANUAL_INITIATOR)
            .await
            .unwrap();
        std::fs::remove_file(job.local_filepath.clone().unwrap()).unwrap();

        assert!(h.service.delete_backup(&job.id, false).await.is_err());
        h.service.delete_backup(&job.id, true).await.unwrap();
        assert!(h.backups.find(&job.id).await.unwrap().is_none());
    }

    /// Local store whose commit waits until the gate opens.
    struct GatedStore {
        inner: LocalStore,
        gate: Arc<Notify>,
    }

    #[async_trait::async_trait]
    impl FileStore for GatedStore {
        async fn upload(&self, id: &str, content_type: &str) -> Result<Upload> {
            self.inner.upload(id, content_type).await
        }

        async fn commit(&self, id: &str, upload: Upload) -> Result<StoredFile> {
            self.gate.notified().await;
            self.inner.commit(id, upload).await
        }

        async fn discard(&self, upload: Upload) {
            self.inner.discard(upload).await
        }

        async fn get_file_stream(&self, id: &str) -> Result<FileStream> {
            self.inner.get_file_stream(id).await
        }

        async fn delete_file(&self, id: &str) -> Result<()> {
            self.inner.delete_file(id).await
        }

        async fn download(&self, id: &str, expires_in: Duration) -> Result<Download> {
            self.inner.download(id, expires_in).await
        }
    }

    async fn gated_dump(h: &Harness) -> (Arc<Notify>, JoinHandle<Result<()>>) {
        h.tool("pg_dump", "printf 'PAYLOAD'");
        let gate = Arc::new(Notify::new());
        let store: Arc<dyn FileStore> = Arc::new(GatedStore {
            inner: LocalStore::new(h.scratch("gated")),
            gate: gate.clone(),
        });
        let job = sample_job("b1", "c1", Utc::now().timestamp_millis());
        h.backups.insert(&job).await.unwrap();
        let upload = store.upload("b1", "application/gzip").await.unwrap();
        let spec = CommandSpec::new(h.bin.path().join("pg_dump"));

        let service = h.service.clone();
        let run = tokio::spawn(async move { service.run_dump(job, spec, store, upload).await });
        (gate, run)
    }

    #[tokio::test]
    async fn slow_upload_keeps_the_dump_in_progress() {
        let h = harness(PLENTY).await;
        let (gate, run) = gated_dump(&h).await;

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let running = h
            .backups
            .find_in_progress("c1", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(running.map(|job| job.id).as_deref(), Some("b1"));

        gate.notify_one();
        run.await.unwrap().unwrap();
        let job = h.backups.get("b1").await.unwrap();
        assert!(matches!(job.status.0, BackupStatus::Ok(_)), "{:?}", job.status);
        assert_eq!(job.size_bytes, Some(7));
    }

    #[tokio::test]
    async fn removing_the_job_abandons_its_upload() {
        let h = harness(PLENTY).await;
        let (_gate, run) = gated_dump(&h).await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        h.backups.delete("b1").await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("upload kept running for a removed job")
            .unwrap()
            .unwrap();
        assert!(!h.scratch("gated").join("b1").exists());
    }

    #[test]
    fn backup_ids_are_file_safe() {
        let created = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let id = backup_id("shop db/eu", created, &custom_dump());
        assert!(id.starts_with("shop_db_eu__2024-01-02T03-04-05_pg_dump_"));
        assert!(id.ends_with(".dump"));

        let all = DumpOptions::PgDumpAll(Default::default());
        let id = backup_id("main", created, &all);
        assert!(id.starts_with("main__2024-01-02T03-04-05_pg_dumpall_"));
        assert!(id.ends_with(".sql"));
    }

    #[test]
    fn log_prefix_is_relative() {
        assert_eq!(elapsed_prefix(0, 3_725_000), "T+ 01:02:05   ");
        assert_eq!(elapsed_prefix(10, 0), "T+ 00:00:00   ");
    }
}
