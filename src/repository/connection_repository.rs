use crate::error::{AppError, Result};
use crate::models::{Connection, Credential};
use crate::repository::DbPool;

#[derive(Clone)]
pub struct ConnectionRepository {
    pool: DbPool,
}

impl ConnectionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn list(&self) -> Result<Vec<Connection>> {
        let connections =
            sqlx::query_as::<_, Connection>("SELECT * FROM connections ORDER BY created_at DESC")
                .fetch_all(&self.pool)
                .await?;
        Ok(connections)
    }

    pub async fn get(&self, id: &str) -> Result<Connection> {
        let connection = sqlx::query_as::<_, Connection>("SELECT * FROM connections WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::ConnectionNotFound(id.to_string()))?;
        Ok(connection)
    }

    pub async fn create(&self, connection: &Connection) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO connections (id, name, db_name, db_host, db_port, db_user, db_pass, db_ssl,
                                     ssl_root_cert_path, ssl_client_cert_path, ssl_client_key_path, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&connection.id)
        .bind(&connection.name)
        .bind(&connection.db_name)
        .bind(&connection.db_host)
        .bind(connection.db_port)
        .bind(&connection.db_user)
        .bind(&connection.db_pass)
        .bind(&connection.db_ssl)
        .bind(&connection.ssl_root_cert_path)
        .bind(&connection.ssl_client_cert_path)
        .bind(&connection.ssl_client_key_path)
        .bind(connection.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM connections WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::ConnectionNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn get_credential(&self, id: i64) -> Result<Credential> {
        let credential = sqlx::query_as::<_, Credential>(
            "SELECT * FROM credentials WHERE id = ? AND type = 's3'",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::CredentialNotFound(id))?;
        Ok(credential)
    }

    pub async fn create_credential(
        &self,
        key_id: &str,
        key_secret: &str,
        bucket: &str,
        region: &str,
        endpoint_url: Option<&str>,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO credentials (type, key_id, key_secret, bucket, region, endpoint_url)
            VALUES ('s3', ?, ?, ?, ?, ?)
            "#,
        )
        .bind(key_id)
        .bind(key_secret)
        .bind(bucket)
        .bind(region)
        .bind(endpoint_url)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }
}

#[cfg(test)]
pub(crate) fn sample_connection(id: &str) -> Connection {
    Connection {
        id: id.to_string(),
        name: format!("{id} connection"),
        db_name: "shop db".to_string(),
        db_host: "localhost".to_string(),
        db_port: 5432,
        db_user: "postgres".to_string(),
        db_pass: Some("s3cr3t-pass".to_string()),
        db_ssl: None,
        ssl_root_cert_path: None,
        ssl_client_cert_path: None,
        ssl_client_key_path: None,
        created_at: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::connection::test_pool;

    #[tokio::test]
    async fn connection_round_trip_and_delete() {
        let (pool, _dir) = test_pool().await;
        let repo = ConnectionRepository::new(pool);
        repo.create(&sample_connection("c1")).await.unwrap();

        let loaded = repo.get("c1").await.unwrap();
        assert_eq!(loaded.db_name, "shop db");
        assert_eq!(loaded.db_pass.as_deref(), Some("s3cr3t-pass"));

        repo.delete("c1").await.unwrap();
        assert!(matches!(
            repo.get("c1").await,
            Err(AppError::ConnectionNotFound(_))
        ));
        assert!(repo.delete("c1").await.is_err());
    }

    #[tokio::test]
    async fn missing_credential_is_reported() {
        let (pool, _dir) = test_pool().await;
        let repo = ConnectionRepository::new(pool);
        let id = repo
            .create_credential("key", "secret", "bucket", "eu-west-1", None)
            .await
            .unwrap();
        assert_eq!(repo.get_credential(id).await.unwrap().bucket, "bucket");
        assert!(matches!(
            repo.get_credential(id + 1).await,
            Err(AppError::CredentialNotFound(_))
        ));
    }
}
