use crate::error::{AppError, Result};
use crate::models::Connection;
use async_trait::async_trait;
use sqlx::Connection as _;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPool, PgPoolOptions, PgSslMode};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const POOL_SIZE: u32 = 2;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);
const DATABASE_SIZE: &str = "SELECT pg_database_size(current_database())";

/// What the backup engine needs from a managed PostgreSQL server.
#[async_trait]
pub trait ManagedDatabases: Send + Sync {
    async fn database_size(&self, connection: &Connection) -> Result<u64>;

    async fn create_database(&self, connection: &Connection, name: &str) -> Result<()>;
}

/// Open pools to managed databases, keyed by connection id. Pools live between
/// an explicit `open` and `close`.
#[derive(Clone, Default)]
pub struct DatabaseRegistry {
    pools: Arc<Mutex<HashMap<String, PgPool>>>,
}

impl DatabaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or returns the already open) pool for a connection. Sockets
    /// are established on first use.
    pub async fn open(&self, connection: &Connection) -> Result<PgPool> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(&connection.id) {
            return Ok(pool.clone());
        }
        let pool = PgPoolOptions::new()
            .max_connections(POOL_SIZE)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_lazy_with(connect_options(connection)?);
        pools.insert(connection.id.clone(), pool.clone());
        tracing::info!(connection_id = %connection.id, "Opened database pool");
        Ok(pool)
    }

    pub async fn get(&self, connection_id: &str) -> Option<PgPool> {
        self.pools.lock().await.get(connection_id).cloned()
    }

    pub async fn close(&self, connection_id: &str) {
        let pool = self.pools.lock().await.remove(connection_id);
        if let Some(pool) = pool {
            pool.close().await;
            tracing::info!(connection_id = %connection_id, "Closed database pool");
        }
    }

    pub async fn close_all(&self) {
        let pools: Vec<PgPool> = self.pools.lock().await.drain().map(|(_, p)| p).collect();
        for pool in pools {
            pool.close().await;
        }
    }

    pub async fn is_open(&self, connection_id: &str) -> bool {
        self.pools.lock().await.contains_key(connection_id)
    }
}

/// Uses the open pool when the connection is started, otherwise a single
/// connection that is closed again. Never registers a pool.
#[async_trait]
impl ManagedDatabases for DatabaseRegistry {
    async fn database_size(&self, connection: &Connection) -> Result<u64> {
        let size: i64 = match self.get(&connection.id).await {
            Some(pool) => sqlx::query_scalar(DATABASE_SIZE).fetch_one(&pool).await?,
            None => {
                let mut conn = connect_once(connection).await?;
                let size = sqlx::query_scalar(DATABASE_SIZE).fetch_one(&mut conn).await;
                close_quietly(conn).await;
                size?
            }
        };
        Ok(size.max(0) as u64)
    }

    async fn create_database(&self, connection: &Connection, name: &str) -> Result<()> {
        let statement = format!("CREATE DATABASE {}", quote_ident(name));
        match self.get(&connection.id).await {
            Some(pool) => {
                sqlx::query(&statement).execute(&pool).await?;
            }
            None => {
                let mut conn = connect_once(connection).await?;
                let created = sqlx::query(&statement).execute(&mut conn).await;
                close_quietly(conn).await;
                created?;
            }
        }
        tracing::info!(connection_id = %connection.id, database = %name, "Created database");
        Ok(())
    }
}

async fn connect_once(connection: &Connection) -> Result<PgConnection> {
    let options = connect_options(connection)?;
    let conn = tokio::time::timeout(ACQUIRE_TIMEOUT, PgConnection::connect_with(&options))
        .await
        .map_err(|_| sqlx::Error::PoolTimedOut)??;
    Ok(conn)
}

async fn close_quietly(conn: PgConnection) {
    if let Err(e) = conn.close().await {
        tracing::debug!("Failed to close database connection: {}", e);
    }
}

pub fn connect_options(connection: &Connection) -> Result<PgConnectOptions> {
    let port = u16::try_from(connection.db_port)
        .map_err(|_| AppError::InvalidInput(format!("Invalid port {}", connection.db_port)))?;
    let mut options = PgConnectOptions::new_without_pgpass()
        .host(&connection.db_host)
        .port(port)
        .username(&connection.db_user)
        .database(&connection.db_name);
    if let Some(pass) = connection.db_pass.as_deref().filter(|p| !p.is_empty()) {
        options = options.password(pass);
    }
    if let Some(mode) = connection.db_ssl.as_deref().filter(|m| !m.is_empty()) {
        let mode = PgSslMode::from_str(mode)
            .map_err(|e| AppError::InvalidInput(format!("Invalid sslmode {mode}: {e}")))?;
        options = options.ssl_mode(mode);
    }
    if let Some(path) = connection.ssl_root_cert_path.as_deref().filter(|p| !p.is_empty()) {
        options = options.ssl_root_cert(path);
    }
    if let Some(path) = connection.ssl_client_cert_path.as_deref().filter(|p| !p.is_empty()) {
        options = options.ssl_client_cert(path);
    }
    if let Some(path) = connection.ssl_client_key_path.as_deref().filter(|p| !p.is_empty()) {
        options = options.ssl_client_key(path);
    }
    Ok(options)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::connection_repository::sample_connection;

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("shop copy"), "\"shop copy\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn connect_options_reject_bad_sslmode() {
        let mut connection = sample_connection("c1");
        assert!(connect_options(&connection).is_ok());
        connection.db_ssl = Some("sometimes".to_string());
        assert!(matches!(
            connect_options(&connection),
            Err(AppError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn open_is_idempotent_and_close_forgets() {
        let registry = DatabaseRegistry::new();
        let connection = sample_connection("c1");
        registry.open(&connection).await.unwrap();
        registry.open(&connection).await.unwrap();
        assert!(registry.is_open("c1").await);

        registry.close("c1").await;
        assert!(!registry.is_open("c1").await);
    }

    #[tokio::test]
    async fn size_probe_does_not_open_a_pool() {
        let registry = DatabaseRegistry::new();
        let mut connection = sample_connection("c1");
        connection.db_host = "127.0.0.1".to_string();
        connection.db_port = 1;

        assert!(registry.database_size(&connection).await.is_err());
        assert!(registry.create_database(&connection, "copy").await.is_err());
        assert!(!registry.is_open("c1").await);
    }

    #[tokio::test]
    async fn closing_an_unknown_connection_is_a_no_op() {
        let registry = DatabaseRegistry::new();
        registry.close("missing").await;
        assert!(!registry.is_open("missing").await);
        assert!(registry.get("missing").await.is_none());
    }
}
