use crate::error::{AppError, Result};
use crate::models::{BackupJob, BackupStatus, Progress, RestoreOptions};
use crate::repository::DbPool;
use chrono::Utc;
use sqlx::types::Json;
use std::time::Duration;

/// Status predicate shared by every conditional write: only in-flight rows move.
const STATUS_IS_LOADING: &str = "json_extract(status, '$.loading') IS NOT NULL";
const RESTORE_IS_LOADING: &str = "json_extract(restore_status, '$.loading') IS NOT NULL";

#[derive(Clone)]
pub struct BackupRepository {
    pool: DbPool,
}

impl BackupRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, job: &BackupJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO backups (id, connection_id, credential_id, destination, initiator, dump_command,
                                 restore_command, options, restore_options, status, restore_status,
                                 content_type, db_size_bytes, size_bytes, local_filepath, dump_logs,
                                 restore_logs, created, last_updated, uploaded, restore_start, restore_end)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.connection_id)
        .bind(job.credential_id)
        .bind(job.destination as i32)
        .bind(&job.initiator)
        .bind(&job.dump_command)
        .bind(&job.restore_command)
        .bind(&job.options)
        .bind(&job.restore_options)
        .bind(&job.status)
        .bind(&job.restore_status)
        .bind(&job.content_type)
        .bind(job.db_size_bytes)
        .bind(job.size_bytes)
        .bind(&job.local_filepath)
        .bind(&job.dump_logs)
        .bind(&job.restore_logs)
        .bind(job.created)
        .bind(job.last_updated)
        .bind(job.uploaded)
        .bind(job.restore_start)
        .bind(job.restore_end)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn find(&self, id: &str) -> Result<Option<BackupJob>> {
        let job = sqlx::query_as::<_, BackupJob>("SELECT * FROM backups WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    pub async fn get(&self, id: &str) -> Result<BackupJob> {
        self.find(id)
            .await?
            .ok_or_else(|| AppError::BackupNotFound(id.to_string()))
    }

    pub async fn list_by_connection(&self, connection_id: &str) -> Result<Vec<BackupJob>> {
        let jobs = sqlx::query_as::<_, BackupJob>(
            "SELECT * FROM backups WHERE connection_id = ? ORDER BY created DESC",
        )
        .bind(connection_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    /// Most recent first.
    pub async fn list_by_initiator(
        &self,
        connection_id: &str,
        initiator: &str,
    ) -> Result<Vec<BackupJob>> {
        let jobs = sqlx::query_as::<_, BackupJob>(
            "SELECT * FROM backups WHERE connection_id = ? AND initiator = ? ORDER BY created DESC",
        )
        .bind(connection_id)
        .bind(initiator)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    /// A dump counts as in flight only while it keeps refreshing `last_updated`.
    pub async fn find_in_progress(
        &self,
        connection_id: &str,
        freshness: Duration,
    ) -> Result<Option<BackupJob>> {
        let threshold = Utc::now().timestamp_millis() - freshness.as_millis() as i64;
        let job = sqlx::query_as::<_, BackupJob>(&format!(
            "SELECT * FROM backups WHERE connection_id = ? AND {STATUS_IS_LOADING} AND last_updated > ? \
             ORDER BY created DESC LIMIT 1"
        ))
        .bind(connection_id)
        .bind(threshold)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    /// Returns false when the job is gone or already finished.
    pub async fn update_progress(&self, id: &str, progress: Progress) -> Result<bool> {
        let status = Json(BackupStatus::Loading(progress));
        let result = sqlx::query(&format!(
            "UPDATE backups SET status = ?, last_updated = ? WHERE id = ? AND {STATUS_IS_LOADING}"
        ))
        .bind(status)
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn finish_ok(
        &self,
        id: &str,
        size_bytes: u64,
        local_filepath: Option<&str>,
    ) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let status = Json(BackupStatus::Ok(now.to_string()));
        let result = sqlx::query(&format!(
            r#"
            UPDATE backups
            SET status = ?, size_bytes = ?, local_filepath = ?, uploaded = ?, last_updated = ?
            WHERE id = ? AND {STATUS_IS_LOADING}
            "#
        ))
        .bind(status)
        .bind(size_bytes as i64)
        .bind(local_filepath)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn finish_err(&self, id: &str, message: &str) -> Result<bool> {
        let status = Json(BackupStatus::Err(message.to_string()));
        let result = sqlx::query(&format!(
            "UPDATE backups SET status = ?, last_updated = ? WHERE id = ? AND {STATUS_IS_LOADING}"
        ))
        .bind(status)
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn append_dump_logs(&self, id: &str, logs: &str) -> Result<()> {
        sqlx::query(
            "UPDATE backups SET dump_logs = COALESCE(dump_logs, '') || ?, last_updated = ? WHERE id = ?",
        )
        .bind(logs)
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn start_restore(
        &self,
        id: &str,
        restore_command: &str,
        options: &RestoreOptions,
        total: u64,
    ) -> Result<i64> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            r#"
            UPDATE backups
            SET restore_start = ?, restore_end = NULL, restore_command = ?, restore_options = ?,
                restore_status = ?, restore_logs = NULL, last_updated = ?
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(restore_command)
        .bind(Json(options))
        .bind(Json(BackupStatus::loading(0, total)))
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(now)
    }

    pub async fn update_restore_progress(&self, id: &str, progress: Progress) -> Result<bool> {
        let result = sqlx::query(&format!(
            "UPDATE backups SET restore_status = ?, last_updated = ? WHERE id = ? AND {RESTORE_IS_LOADING}"
        ))
        .bind(Json(BackupStatus::Loading(progress)))
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn finish_restore_ok(&self, id: &str) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(&format!(
            r#"
            UPDATE backups SET restore_status = ?, restore_end = ?, last_updated = ?
            WHERE id = ? AND {RESTORE_IS_LOADING}
            "#
        ))
        .bind(Json(BackupStatus::Ok(now.to_string())))
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// A restore error also covers failures before the restore started.
    pub async fn finish_restore_err(&self, id: &str, message: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            "UPDATE backups SET restore_status = ?, restore_end = ?, last_updated = ? WHERE id = ?",
        )
        .bind(Json(BackupStatus::Err(message.to_string())))
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn append_restore_logs(&self, id: &str, logs: &str) -> Result<()> {
        sqlx::query(
            "UPDATE backups SET restore_logs = COALESCE(restore_logs, '') || ?, last_updated = ? WHERE id = ?",
        )
        .bind(logs)
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM backups WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn detach_connection(&self, connection_id: &str) -> Result<u64> {
        let result = sqlx::query("UPDATE backups SET connection_id = NULL WHERE connection_id = ?")
            .bind(connection_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
pub(crate) fn sample_job(id: &str, connection_id: &str, created: i64) -> BackupJob {
    use crate::models::{Destination, DumpFormat, DumpOptions, PgDumpOptions};
    BackupJob {
        id: id.to_string(),
        connection_id: Some(connection_id.to_string()),
        credential_id: None,
        destination: Destination::Local,
        initiator: "manual_backup".to_string(),
        dump_command: "pg_dump --format c -v".to_string(),
        restore_command: None,
        options: Json(DumpOptions::PgDump(PgDumpOptions::new(DumpFormat::Custom))),
        restore_options: None,
        status: Json(BackupStatus::loading(0, 0)),
        restore_status: None,
        content_type: "application/gzip".to_string(),
        db_size_bytes: Some(1024),
        size_bytes: None,
        local_filepath: None,
        dump_logs: None,
        restore_logs: None,
        created,
        last_updated: created,
        uploaded: None,
        restore_start: None,
        restore_end: None,
    }
}
