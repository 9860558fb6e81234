//! The worker side of the channel, run by the `worker` subcommand. Requests arrive
//! on stdin, responses leave on stdout, everything else goes to stderr.

use super::DATABASE_NOT_FOUND_CODE;
use super::protocol::{ProcStats, RequestBody, START_ID, WorkerEvent, WorkerRequest, WorkerResponse};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sqlx::ConnectOptions;
use sqlx::postgres::PgConnectOptions;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

const STDERR_TAIL_LINES: usize = 10;
const DATABASE_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Parameters of the start handshake.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InitArgs {
    /// Script interpreter: program followed by leading args. The code is appended.
    pub runtime: Vec<String>,
    #[serde(default)]
    pub kind: String,
    /// Extra environment for scripts, typically the libpq `PG*` variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Connect once at start so a dropped database retires the worker.
    #[serde(default)]
    pub check_database: bool,
}

struct WorkerState {
    init: InitArgs,
    raw_init: Value,
    system: Mutex<System>,
}

pub async fn run_worker() -> anyhow::Result<()> {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    });

    let mut state: Option<Arc<WorkerState>> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let request = match serde_json::from_str::<WorkerRequest>(&line) {
            Ok(request) => request,
            Err(e) => {
                let error = json!({ "message": format!("Malformed request: {e}") });
                match request_id(&line) {
                    Some(id) => send(&out_tx, &WorkerResponse::err(id, error)),
                    None => send(&out_tx, &WorkerEvent::Error { error }),
                }
                continue;
            }
        };

        match request.body {
            RequestBody::Start { init_args } => {
                let init: InitArgs = match serde_json::from_value(init_args.clone()) {
                    Ok(init) => init,
                    Err(e) => {
                        let error = json!({ "message": e.to_string() });
                        send(&out_tx, &WorkerResponse::err(request.id, error));
                        continue;
                    }
                };
                info!(kind = %init.kind, pid = std::process::id(), "Worker starting");
                if init.check_database {
                    if let Some(error) = check_database(&init.env).await {
                        send(&out_tx, &WorkerResponse::ok(START_ID, json!("ok")));
                        send(&out_tx, &WorkerEvent::Error { error });
                        continue;
                    }
                }
                state = Some(Arc::new(WorkerState {
                    init,
                    raw_init: init_args,
                    system: Mutex::new(System::new()),
                }));
                send(&out_tx, &WorkerResponse::ok(request.id, json!("ok")));
            }
            body => {
                let Some(worker) = state.clone() else {
                    let error = json!({ "message": "Worker not started" });
                    send(&out_tx, &WorkerResponse::err(request.id, error));
                    continue;
                };
                let out_tx = out_tx.clone();
                let id = request.id;
                tokio::spawn(async move {
                    let response = match worker.handle(body).await {
                        Ok(result) => WorkerResponse::ok(id, result),
                        Err(error) => WorkerResponse::err(id, error),
                    };
                    send(&out_tx, &response);
                });
            }
        }
    }

    debug!("stdin closed, worker exiting");
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

impl WorkerState {
    async fn handle(&self, body: RequestBody) -> Result<Value, Value> {
        match body {
            RequestBody::Run {
                code,
                validated_args,
                user,
            } => run_script(&self.init, &self.raw_init, &code, &validated_args, &user).await,
            RequestBody::OnMount { code } => {
                run_script(&self.init, &self.raw_init, &code, &Value::Null, &Value::Null).await
            }
            RequestBody::ProcStats => {
                let mut system = self.system.lock().await;
                serde_json::to_value(proc_stats(&mut system))
                    .map_err(|e| json!({ "message": e.to_string() }))
            }
            RequestBody::Start { .. } => Err(json!({ "message": "Worker already started" })),
        }
    }
}

/// Runs user code with the configured interpreter in its own child process.
/// A JSON stdout becomes the result, any other output is returned as a string.
pub async fn run_script(
    init: &InitArgs,
    raw_init: &Value,
    code: &str,
    args: &Value,
    user: &Value,
) -> Result<Value, Value> {
    let Some((program, leading)) = init.runtime.split_first() else {
        return Err(json!({ "message": "No script runtime configured" }));
    };
    let output = Command::new(program)
        .args(leading)
        .arg(code)
        .envs(&init.env)
        .env("WORKER_ARGS", args.to_string())
        .env("WORKER_USER", user.to_string())
        .env("WORKER_INIT", raw_init.to_string())
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| json!({ "message": format!("Failed to start {program}: {e}") }))?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    for line in stderr.lines() {
        warn!(target: "pg_orchestrator::script", "{}", line);
    }
    if !output.status.success() {
        let lines: Vec<&str> = stderr.lines().collect();
        let mut message = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");
        if message.is_empty() {
            message = format!("Script exited with {}", output.status);
        }
        return Err(json!({ "message": message, "exit_code": output.status.code() }));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stdout = stdout.trim();
    if stdout.is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(stdout).unwrap_or_else(|_| Value::String(stdout.to_string())))
}

pub fn proc_stats(system: &mut System) -> ProcStats {
    let pid = Pid::from_u32(std::process::id());
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::everything(),
    );
    match system.process(pid) {
        Some(process) => ProcStats {
            pid: std::process::id(),
            cpu: process.cpu_usage(),
            mem: process.memory(),
            uptime: process.run_time(),
        },
        None => ProcStats {
            pid: std::process::id(),
            cpu: 0.0,
            mem: 0,
            uptime: 0,
        },
    }
}

/// Returns an error payload only when the target database does not exist.
async fn check_database(env: &BTreeMap<String, String>) -> Option<Value> {
    let mut options = PgConnectOptions::new_without_pgpass();
    if let Some(host) = env.get("PGHOST") {
        options = options.host(host);
    }
    if let Some(port) = env.get("PGPORT").and_then(|p| p.parse().ok()) {
        options = options.port(port);
    }
    if let Some(user) = env.get("PGUSER") {
        options = options.username(user);
    }
    if let Some(password) = env.get("PGPASSWORD") {
        options = options.password(password);
    }
    if let Some(database) = env.get("PGDATABASE") {
        options = options.database(database);
    }

    match tokio::time::timeout(DATABASE_CHECK_TIMEOUT, options.connect()).await {
        Ok(Ok(_connection)) => None,
        Ok(Err(sqlx::Error::Database(e)))
            if e.code().as_deref() == Some(DATABASE_NOT_FOUND_CODE) =>
        {
            Some(json!({ "code": DATABASE_NOT_FOUND_CODE, "message": e.message() }))
        }
        Ok(Err(e)) => {
            warn!("Database check failed: {}", e);
            None
        }
        Err(_) => {
            warn!("Database check timed out");
            None
        }
    }
}

/// Id of a request whose body could not be decoded, so it can still be answered.
fn request_id(line: &str) -> Option<String> {
    let value: Value = serde_json::from_str(line).ok()?;
    match value.get("id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

fn send<T: Serialize>(out: &mpsc::UnboundedSender<String>, message: &T) {
    match serde_json::to_string(message) {
        Ok(mut line) => {
            line.push('\n');
            let _ = out.send(line);
        }
        Err(e) => warn!("Failed to encode worker message: {}", e),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh_init() -> InitArgs {
        InitArgs {
            runtime: vec!["sh".to_string(), "-c".to_string()],
            kind: "run".to_string(),
            env: BTreeMap::from([("PGDATABASE".to_string(), "shop".to_string())]),
            check_database: false,
        }
    }

    #[tokio::test]
    async fn json_stdout_becomes_the_result() {
        let result = run_script(
            &sh_init(),
            &Value::Null,
            r#"echo "{\"db\":\"$PGDATABASE\",\"args\":$WORKER_ARGS}""#,
            &json!({ "n": 1 }),
            &Value::Null,
        )
        .await
        .unwrap();
        assert_eq!(result, json!({ "db": "shop", "args": { "n": 1 } }));
    }

    #[test]
    fn undecodable_requests_keep_their_id() {
        assert_eq!(request_id(r#"{"id":"7","type":"teleport"}"#).as_deref(), Some("7"));
        assert_eq!(request_id(r#"{"id":8,"type":"run"}"#).as_deref(), Some("8"));
        assert_eq!(request_id(r#"{"type":"run"}"#), None);
        assert_eq!(request_id("not json"), None);
    }

    #[tokio::test]
    async fn plain_stdout_is_returned_as_text() {
        let result = run_script(&sh_init(), &Value::Null, "echo hello", &Value::Null, &Value::Null)
            .await
            .unwrap();
        assert_eq!(result, json!("hello"));
    }

    #[tokio::test]
    async fn failing_script_reports_stderr() {
        let error = run_script(
            &sh_init(),
            &Value::Null,
            "echo 'relation missing' >&2; exit 4",
            &Value::Null,
            &Value::Null,
        )
        .await
        .unwrap_err();
        assert_eq!(error["message"], "relation missing");
        assert_eq!(error["exit_code"], 4);
    }

    #[test]
    fn proc_stats_describe_this_process() {
        let mut system = System::new();
        let stats = proc_stats(&mut system);
        assert_eq!(stats.pid, std::process::id());
        assert!(stats.mem > 0);
    }
}
