use crate::error::{AppError, Result};
use crate::models::{AutomaticBackupConfig, DatabaseConfig};
use crate::repository::DbPool;
use chrono::Utc;
use sqlx::types::Json;

/// Column of `database_config_logs` a worker writes its rolling log into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogColumn {
    OnMount,
    TableConfig,
    OnRun,
}

impl LogColumn {
    fn update_sql(self) -> &'static str {
        match self {
            LogColumn::OnMount => "UPDATE database_config_logs SET on_mount_logs = ? WHERE id = ?",
            LogColumn::TableConfig => {
                "UPDATE database_config_logs SET table_config_logs = ? WHERE id = ?"
            }
            LogColumn::OnRun => "UPDATE database_config_logs SET on_run_logs = ? WHERE id = ?",
        }
    }

    fn select_sql(self) -> &'static str {
        match self {
            LogColumn::OnMount => "SELECT on_mount_logs FROM database_config_logs WHERE id = ?",
            LogColumn::TableConfig => {
                "SELECT table_config_logs FROM database_config_logs WHERE id = ?"
            }
            LogColumn::OnRun => "SELECT on_run_logs FROM database_config_logs WHERE id = ?",
        }
    }
}

#[derive(Clone)]
pub struct DatabaseConfigRepository {
    pool: DbPool,
}

impl DatabaseConfigRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, connection_id: &str) -> Result<DatabaseConfig> {
        sqlx::query("INSERT INTO database_configs (connection_id) VALUES (?)")
            .bind(connection_id)
            .execute(&self.pool)
            .await?;
        self.get_by_connection(connection_id).await
    }

    pub async fn get_by_connection(&self, connection_id: &str) -> Result<DatabaseConfig> {
        let config = sqlx::query_as::<_, DatabaseConfig>(
            "SELECT * FROM database_configs WHERE connection_id = ?",
        )
        .bind(connection_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::DatabaseConfigNotFound(connection_id.to_string()))?;
        Ok(config)
    }

    pub async fn list_with_automatic_backups(&self) -> Result<Vec<DatabaseConfig>> {
        let configs = sqlx::query_as::<_, DatabaseConfig>(
            "SELECT * FROM database_configs WHERE json_extract(backups_config, '$.enabled') = 1 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(configs)
    }

    pub async fn update_backups_config(
        &self,
        id: i64,
        config: Option<&AutomaticBackupConfig>,
    ) -> Result<()> {
        sqlx::query("UPDATE database_configs SET backups_config = ? WHERE id = ?")
            .bind(config.map(Json))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_backup_error(&self, id: i64, err: Option<&str>) -> Result<()> {
        sqlx::query(
            "UPDATE database_configs SET backups_config = json_set(backups_config, '$.err', ?) \
             WHERE id = ? AND backups_config IS NOT NULL",
        )
        .bind(err)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_table_config(
        &self,
        id: i64,
        code: Option<&str>,
        disabled: bool,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE database_configs SET table_config_code = ?, table_config_disabled = ? WHERE id = ?",
        )
        .bind(code)
        .bind(disabled)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_on_mount(&self, id: i64, code: Option<&str>, disabled: bool) -> Result<()> {
        sqlx::query(
            "UPDATE database_configs SET on_mount_code = ?, on_mount_disabled = ? WHERE id = ?",
        )
        .bind(code)
        .bind(disabled)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_table_config_disabled(&self, id: i64, disabled: bool) -> Result<()> {
        sqlx::query("UPDATE database_configs SET table_config_disabled = ? WHERE id = ?")
            .bind(disabled)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_on_mount_disabled(&self, id: i64, disabled: bool) -> Result<()> {
        sqlx::query("UPDATE database_configs SET on_mount_disabled = ? WHERE id = ?")
            .bind(disabled)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_pass_process_env_vars(&self, id: i64, pass: bool) -> Result<()> {
        sqlx::query("UPDATE database_configs SET pass_process_env_vars = ? WHERE id = ?")
            .bind(pass)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_by_connection(&self, connection_id: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM database_config_logs WHERE id IN (SELECT id FROM database_configs WHERE connection_id = ?)",
        )
        .bind(connection_id)
        .execute(&self.pool)
        .await?;
        sqlx::query("DELETE FROM database_configs WHERE connection_id = ?")
            .bind(connection_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_alert(
        &self,
        database_config_id: i64,
        severity: &str,
        message: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO alerts (severity, message, database_config_id, created) VALUES (?, ?, ?, ?)",
        )
        .bind(severity)
        .bind(message)
        .bind(database_config_id)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_alerts(&self, database_config_id: i64) -> Result<Vec<String>> {
        let messages = sqlx::query_scalar(
            "SELECT message FROM alerts WHERE database_config_id = ? ORDER BY id",
        )
        .bind(database_config_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }

    pub async fn ensure_logs(&self, database_config_id: i64) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO database_config_logs (id) VALUES (?)")
            .bind(database_config_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Overwrites the whole column; workers always persist their full rolling buffer.
    pub async fn write_logs(
        &self,
        database_config_id: i64,
        column: LogColumn,
        logs: Option<&str>,
    ) -> Result<()> {
        sqlx::query(column.update_sql())
            .bind(logs)
            .bind(database_config_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn read_logs(
        &self,
        database_config_id: i64,
        column: LogColumn,
    ) -> Result<Option<String>> {
        let logs: Option<Option<String>> = sqlx::query_scalar(column.select_sql())
            .bind(database_config_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(logs.flatten())
    }
}
