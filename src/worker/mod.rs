//! Forked workers: one OS process per managed database and script kind, running
//! user code behind a line-delimited JSON request/response channel.

pub mod process;
pub mod protocol;
pub mod supervisor;

use crate::repository::LogColumn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use protocol::{
    ProcStats, RequestBody, WorkerEvent, WorkerMessage, WorkerRequest, WorkerResponse,
};
pub use supervisor::{ForkedWorker, WorkerLogSink, WorkerOptions};

/// Error code PostgreSQL reports for a database that does not exist.
pub const DATABASE_NOT_FOUND_CODE: &str = "3D000";

/// Environment marker set on every worker process.
pub const FORKED_PROC_ENV_NAME: &str = "IS_FORKED_PROC";

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Forked process error")]
    ProcessError,

    #[error("Forked process not connected")]
    NotConnected,

    #[error("Forked process retired: {0}")]
    Retired(String),

    #[error("Forked process failed to start: {0}")]
    Startup(String),

    #[error("{0}")]
    Remote(serde_json::Value),

    #[error("Failed to spawn forked process: {0}")]
    Spawn(String),

    #[error("Malformed worker message: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("Worker IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerKind {
    /// Published method bodies.
    Run,
    OnMount { code: String },
    TableConfig { code: String },
}

impl WorkerKind {
    pub fn label(&self) -> &'static str {
        match self {
            WorkerKind::Run => "run",
            WorkerKind::OnMount { .. } => "on_mount",
            WorkerKind::TableConfig { .. } => "table_config",
        }
    }

    pub fn log_column(&self) -> LogColumn {
        match self {
            WorkerKind::Run => LogColumn::OnRun,
            WorkerKind::OnMount { .. } => LogColumn::OnMount,
            WorkerKind::TableConfig { .. } => LogColumn::TableConfig,
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            WorkerKind::Run => None,
            WorkerKind::OnMount { code } | WorkerKind::TableConfig { code } => Some(code),
        }
    }
}
