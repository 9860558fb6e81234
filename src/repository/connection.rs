use crate::repository::DbPool;
use anyhow::Result;
use sqlx::Row;

pub async fn establish_connection(database_url: &str) -> Result<DbPool> {
    // Ensure the database URL has the correct format
    let db_url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{}", database_url)
    };

    // Create connection with create_if_missing option
    let connection_string = format!("{}?mode=rwc", db_url);
    let pool = sqlx::SqlitePool::connect(&connection_string).await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS connections (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            db_name TEXT NOT NULL,
            db_host TEXT NOT NULL,
            db_port INTEGER NOT NULL DEFAULT 5432,
            db_user TEXT NOT NULL,
            db_pass TEXT,
            db_ssl TEXT,
            ssl_root_cert_path TEXT,
            ssl_client_cert_path TEXT,
            ssl_client_key_path TEXT,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS database_configs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            connection_id TEXT NOT NULL UNIQUE,
            backups_config TEXT,
            on_mount_code TEXT,
            on_mount_disabled BOOLEAN NOT NULL DEFAULT 0,
            table_config_code TEXT,
            table_config_disabled BOOLEAN NOT NULL DEFAULT 0,
            pass_process_env_vars BOOLEAN NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS database_config_logs (
            id INTEGER PRIMARY KEY,
            on_mount_logs TEXT,
            table_config_logs TEXT,
            on_run_logs TEXT
        );

        CREATE TABLE IF NOT EXISTS credentials (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            type TEXT NOT NULL DEFAULT 's3',
            key_id TEXT NOT NULL,
            key_secret TEXT NOT NULL,
            bucket TEXT NOT NULL,
            region TEXT NOT NULL,
            endpoint_url TEXT
        );

        CREATE TABLE IF NOT EXISTS backups (
            id TEXT PRIMARY KEY,
            connection_id TEXT,
            credential_id INTEGER,
            destination INTEGER NOT NULL,
            initiator TEXT NOT NULL,
            dump_command TEXT NOT NULL,
            restore_command TEXT,
            options TEXT NOT NULL,
            restore_options TEXT,
            status TEXT NOT NULL,
            restore_status TEXT,
            content_type TEXT NOT NULL,
            db_size_bytes INTEGER,
            size_bytes INTEGER,
            local_filepath TEXT,
            dump_logs TEXT,
            restore_logs TEXT,
            created INTEGER NOT NULL,
            last_updated INTEGER NOT NULL,
            uploaded INTEGER,
            restore_start INTEGER,
            restore_end INTEGER
        );

        CREATE TABLE IF NOT EXISTS alerts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            severity TEXT NOT NULL,
            message TEXT NOT NULL,
            database_config_id INTEGER,
            created INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_backups_connection_id ON backups(connection_id);
        CREATE INDEX IF NOT EXISTS idx_backups_created ON backups(created);
        "#,
    )
    .execute(&pool)
    .await?;

    ensure_backup_columns(&pool).await?;

    Ok(pool)
}

async fn ensure_backup_columns(pool: &DbPool) -> Result<()> {
    let columns = sqlx::query("PRAGMA table_info(backups)")
        .fetch_all(pool)
        .await?;
    let has_column = columns
        .iter()
        .any(|row| row.get::<String, _>("name") == "local_filepath");
    if !has_column {
        sqlx::query("ALTER TABLE backups ADD COLUMN local_filepath TEXT")
            .execute(pool)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) async fn test_pool() -> (DbPool, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}", dir.path().join("state.db").display());
    let pool = establish_connection(&url).await.unwrap();
    (pool, dir)
}
