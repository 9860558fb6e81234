use super::AutomaticBackupConfig;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Connection {
    pub id: String,
    pub name: String,
    pub db_name: String,
    pub db_host: String,
    pub db_port: i64,
    pub db_user: String,
    #[serde(skip_serializing)]
    pub db_pass: Option<String>,
    /// libpq sslmode, e.g. `require` or `verify-full`.
    pub db_ssl: Option<String>,
    pub ssl_root_cert_path: Option<String>,
    pub ssl_client_cert_path: Option<String>,
    pub ssl_client_key_path: Option<String>,
    pub created_at: i64,
}

impl Connection {
    /// libpq environment for the external utilities. Credentials never go into argv.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let mut vars = vec![
            ("PGHOST".to_string(), self.db_host.clone()),
            ("PGPORT".to_string(), self.db_port.to_string()),
            ("PGDATABASE".to_string(), self.db_name.clone()),
            ("PGUSER".to_string(), self.db_user.clone()),
        ];
        if let Some(pass) = self.db_pass.as_ref().filter(|p| !p.is_empty()) {
            vars.push(("PGPASSWORD".to_string(), pass.clone()));
        }
        let ssl = [
            ("PGSSLMODE", &self.db_ssl),
            ("PGSSLROOTCERT", &self.ssl_root_cert_path),
            ("PGSSLCERT", &self.ssl_client_cert_path),
            ("PGSSLKEY", &self.ssl_client_key_path),
        ];
        for (name, value) in ssl {
            if let Some(value) = value.as_ref().filter(|v| !v.is_empty()) {
                vars.push((name.to_string(), value.clone()));
            }
        }
        vars
    }

    /// Connection URI without the password, safe to show in a process listing.
    pub fn uri_without_password(&self) -> String {
        format!(
            "postgres://{}@{}:{}/{}",
            self.db_user, self.db_host, self.db_port, self.db_name
        )
    }

    /// Same target with a different database name.
    pub fn with_database(&self, db_name: &str) -> Self {
        Self {
            db_name: db_name.to_string(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DatabaseConfig {
    pub id: i64,
    pub connection_id: String,
    pub backups_config: Option<Json<AutomaticBackupConfig>>,
    pub on_mount_code: Option<String>,
    pub on_mount_disabled: bool,
    pub table_config_code: Option<String>,
    pub table_config_disabled: bool,
    pub pass_process_env_vars: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Credential {
    pub id: i64,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub credential_type: String,
    pub key_id: String,
    #[serde(skip_serializing)]
    pub key_secret: String,
    pub bucket: String,
    pub region: String,
    pub endpoint_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> Connection {
        Connection {
            id: "c1".to_string(),
            name: "main".to_string(),
            db_name: "shop".to_string(),
            db_host: "db.internal".to_string(),
            db_port: 5433,
            db_user: "admin".to_string(),
            db_pass: Some("hunter2".to_string()),
            db_ssl: Some("require".to_string()),
            ssl_root_cert_path: None,
            ssl_client_cert_path: Some("/certs/client.crt".to_string()),
            ssl_client_key_path: None,
            created_at: 0,
        }
    }

    #[test]
    fn env_vars_carry_credentials_and_ssl() {
        let vars = connection().env_vars();
        let get = |name: &str| {
            vars.iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("PGPORT"), Some("5433"));
        assert_eq!(get("PGPASSWORD"), Some("hunter2"));
        assert_eq!(get("PGSSLMODE"), Some("require"));
        assert_eq!(get("PGSSLCERT"), Some("/certs/client.crt"));
        assert_eq!(get("PGSSLKEY"), None);
    }

    #[test]
    fn uri_never_contains_password() {
        let uri = connection().uri_without_password();
        assert_eq!(uri, "postgres://admin@db.internal:5433/shop");
        assert!(!uri.contains("hunter2"));
    }
}
