use crate::error::{AppError, Result};
use crate::models::{Connection, DumpOptions, RestoreOptions};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgTool {
    PgDump,
    PgDumpAll,
    PgRestore,
    Psql,
}

impl PgTool {
    pub fn name(self) -> &'static str {
        match self {
            PgTool::PgDump => "pg_dump",
            PgTool::PgDumpAll => "pg_dumpall",
            PgTool::PgRestore => "pg_restore",
            PgTool::Psql => "psql",
        }
    }

    pub fn for_dump(options: &DumpOptions) -> Self {
        match options {
            DumpOptions::PgDump(_) => PgTool::PgDump,
            DumpOptions::PgDumpAll(_) => PgTool::PgDumpAll,
        }
    }

    pub fn for_restore(options: &RestoreOptions) -> Self {
        match options {
            RestoreOptions::PgRestore(_) => PgTool::PgRestore,
            RestoreOptions::Psql(_) => PgTool::Psql,
        }
    }
}

/// Finds a client binary in `bin_dir`, or on `PATH` when no directory is configured.
pub fn resolve_tool(bin_dir: Option<&Path>, tool: PgTool) -> Result<PathBuf> {
    match bin_dir {
        Some(dir) => {
            let file_name = if cfg!(windows) {
                format!("{}.exe", tool.name())
            } else {
                tool.name().to_string()
            };
            let path = dir.join(file_name);
            if path.is_file() {
                Ok(path)
            } else {
                Err(AppError::Command(format!(
                    "{} not found in {}",
                    tool.name(),
                    dir.display()
                )))
            }
        }
        None => which::which(tool.name()).map_err(|_| {
            AppError::Command(format!(
                "{} executable not found in PATH. Please ensure PostgreSQL client tools are installed",
                tool.name()
            ))
        }),
    }
}

/// Dump flags. Connection parameters travel through the environment, never argv.
pub fn dump_args(options: &DumpOptions, connection: &Connection) -> Vec<String> {
    let mut args = Vec::new();
    match options {
        DumpOptions::PgDump(o) => {
            args.push("--format".to_string());
            args.push(o.format.as_flag().to_string());
            push_flag(&mut args, o.clean, "--clean");
            push_flag(&mut args, o.create, "--create");
            push_flag(&mut args, o.no_owner, "--no-owner");
            push_flag(&mut args, o.if_exists, "--if-exists");
            push_flag(&mut args, o.data_only, "--data-only");
            push_value(&mut args, "--encoding", o.encoding.as_deref());
            push_flag(&mut args, o.schema_only, "--schema-only");
            push_value(&mut args, "--exclude-schema", o.exclude_schema.as_deref());
            push_value(
                &mut args,
                "--compress",
                o.compression_level.map(|l| l.to_string()).as_deref(),
            );
            push_value(
                &mut args,
                "--jobs",
                o.number_of_jobs.map(|n| n.to_string()).as_deref(),
            );
        }
        DumpOptions::PgDumpAll(o) => {
            args.push("-d".to_string());
            args.push(connection.uri_without_password());
            push_flag(&mut args, o.clean, "--clean");
            push_flag(&mut args, o.if_exists, "--if-exists");
            push_flag(&mut args, o.globals_only, "--globals-only");
            push_flag(&mut args, o.roles_only, "--roles-only");
            push_flag(&mut args, o.data_only, "--data-only");
            push_flag(&mut args, o.schema_only, "--schema-only");
            push_value(&mut args, "--encoding", o.encoding.as_deref());
        }
    }
    args.push("-v".to_string());
    args
}

/// Restore flags. `local_file` is set when the artifact is read from disk
/// instead of stdin.
pub fn restore_args(
    options: &RestoreOptions,
    target_db: &str,
    local_file: Option<&Path>,
) -> Vec<String> {
    let mut args = Vec::new();
    match options {
        RestoreOptions::PgRestore(o) => {
            // pg_restore needs a target or it asks for -f.
            args.push(format!("--dbname={target_db}"));
            args.push("-w".to_string());
            push_flag(&mut args, o.clean, "--clean");
            push_flag(&mut args, o.create, "--create");
            push_flag(&mut args, o.no_owner, "--no-owner");
            push_value(&mut args, "--format", o.format.map(|f| f.as_flag()));
            push_flag(&mut args, o.data_only, "--data-only");
            push_flag(&mut args, o.if_exists, "--if-exists");
            push_value(
                &mut args,
                "--jobs",
                o.number_of_jobs.map(|n| n.to_string()).as_deref(),
            );
            args.push("-v".to_string());
            if let Some(file) = local_file {
                args.push(file.display().to_string());
            }
        }
        RestoreOptions::Psql(_) => {
            if let Some(file) = local_file {
                args.push("-f".to_string());
                args.push(file.display().to_string());
            }
        }
    }
    args
}

/// Windows builds of pg_restore reject some streamed archives; read from disk there.
pub fn restore_from_local_file() -> bool {
    cfg!(windows)
}

fn push_flag(args: &mut Vec<String>, enabled: bool, flag: &str) {
    if enabled {
        args.push(flag.to_string());
    }
}

fn push_value(args: &mut Vec<String>, flag: &str, value: Option<&str>) {
    if let Some(value) = value.filter(|v| !v.is_empty()) {
        args.push(flag.to_string());
        args.push(value.to_string());
    }
}
