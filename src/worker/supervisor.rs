use super::protocol::{ProcStats, RequestBody, START_ID, WorkerEvent, WorkerMessage, WorkerRequest};
use super::{DATABASE_NOT_FOUND_CODE, FORKED_PROC_ENV_NAME, WorkerError, WorkerKind};
use crate::config::WorkerSettings;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, Notify, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub type WorkerResult<T> = std::result::Result<T, WorkerError>;

/// Receives the full rolling log every time it changes.
#[async_trait]
pub trait WorkerLogSink: Send + Sync {
    async fn persist(&self, logs: String);
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Sent verbatim with every start handshake, including restarts.
    pub init_args: Value,
    pub kind: WorkerKind,
    pub pass_process_env_vars: bool,
    pub settings: WorkerSettings,
}

/// Supervisor for one forked worker process.
pub struct ForkedWorker {
    inner: Arc<Inner>,
}

struct Inner {
    options: WorkerOptions,
    session: Mutex<Session>,
    next_id: AtomicU64,
    restart_seq: AtomicU64,
    restarting: AtomicBool,
    retired: AtomicBool,
    destroyed: AtomicBool,
    shutdown: CancellationToken,
    logs: Arc<LogBuffer>,
}

#[derive(Default)]
struct Session {
    generation: u64,
    stdin: Option<ChildStdin>,
    pid: Option<u32>,
    kill: Option<CancellationToken>,
    pending: HashMap<String, oneshot::Sender<WorkerResult<Value>>>,
}

struct Spawned {
    child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
}

impl ForkedWorker {
    pub async fn create(
        options: WorkerOptions,
        log_sink: Arc<dyn WorkerLogSink>,
    ) -> WorkerResult<Self> {
        let logs = Arc::new(LogBuffer::new(options.settings.log_lines));
        spawn_log_persister(logs.clone(), log_sink);

        let spawned = match spawn_process(&options, &logs).await {
            Ok(spawned) => spawned,
            Err(e) => {
                logs.push(&format!("Failed to start: {e}"));
                logs.close();
                return Err(e);
            }
        };

        let inner = Arc::new(Inner {
            options,
            session: Mutex::new(Session::default()),
            next_id: AtomicU64::new(1),
            restart_seq: AtomicU64::new(0),
            restarting: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            logs,
        });
        inner.install(spawned).await;
        let pid = inner.session.lock().await.pid;
        info!(kind = inner.options.kind.label(), pid = ?pid, "Forked worker started");
        Ok(Self { inner })
    }

    pub fn kind(&self) -> &WorkerKind {
        &self.inner.options.kind
    }

    pub fn init_args(&self) -> &Value {
        &self.inner.options.init_args
    }

    pub async fn run(&self, code: &str, validated_args: Value, user: Value) -> WorkerResult<Value> {
        self.inner
            .request(RequestBody::Run {
                code: code.to_string(),
                validated_args,
                user,
            })
            .await
    }

    pub async fn on_mount(&self, code: &str) -> WorkerResult<Value> {
        self.inner
            .request(RequestBody::OnMount {
                code: code.to_string(),
            })
            .await
    }

    pub async fn request(&self, body: RequestBody) -> WorkerResult<Value> {
        self.inner.request(body).await
    }

    pub async fn get_process_stats(&self) -> WorkerResult<ProcStats> {
        let value = self.inner.request(RequestBody::ProcStats).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn pid(&self) -> Option<u32> {
        self.inner.session.lock().await.pid
    }

    /// Kills the current process. The crash path restarts it.
    pub async fn kill_process(&self) {
        self.inner.kill_process().await;
    }

    pub async fn destroy(&self) {
        self.inner.stop("destroyed").await;
    }

    pub fn is_retired(&self) -> bool {
        self.inner.retired.load(Ordering::SeqCst)
    }

    pub fn logs(&self) -> String {
        self.inner.logs.snapshot()
    }
}

impl Drop for ForkedWorker {
    fn drop(&mut self) {
        self.inner.destroyed.store(true, Ordering::SeqCst);
        self.inner.shutdown.cancel();
        self.inner.logs.close();
    }
}

impl Inner {
    async fn request(&self, body: RequestBody) -> WorkerResult<Value> {
        if self.retired.load(Ordering::SeqCst) {
            return Err(WorkerError::Retired("database not found".to_string()));
        }
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(WorkerError::Retired("destroyed".to_string()));
        }

        let id = (self.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string();
        let (tx, rx) = oneshot::channel();
        {
            let mut guard = self.session.lock().await;
            let session = &mut *guard;
            let Some(stdin) = session.stdin.as_mut() else {
                return Err(WorkerError::NotConnected);
            };
            session.pending.insert(id.clone(), tx);
            let request = WorkerRequest {
                id: id.clone(),
                body,
            };
            if let Err(e) = write_message(stdin, &request).await {
                warn!(kind = self.options.kind.label(), "Failed to send request: {}", e);
                session.pending.remove(&id);
                return Err(WorkerError::NotConnected);
            }
        }

        rx.await.unwrap_or(Err(WorkerError::ProcessError))
    }

    async fn install(self: &Arc<Self>, spawned: Spawned) {
        let Spawned {
            mut child,
            stdin,
            lines,
        } = spawned;
        let kill = self.shutdown.child_token();
        let generation = {
            let mut session = self.session.lock().await;
            session.generation += 1;
            session.stdin = Some(stdin);
            session.pid = child.id();
            session.kill = Some(kill.clone());
            session.generation
        };

        let inner = self.clone();
        tokio::spawn(async move {
            inner.read_messages(generation, lines).await;
        });

        let inner = self.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => status.to_string(),
                    Err(e) => e.to_string(),
                },
                _ = kill.cancelled() => {
                    let _ = child.kill().await;
                    "killed".to_string()
                }
            };
            inner.logs.push(&format!("Forked process exited: {status}"));
            inner.schedule_restart(generation, format!("process exited: {status}"));
        });
    }

    async fn read_messages(
        self: Arc<Self>,
        generation: u64,
        mut lines: Lines<BufReader<ChildStdout>>,
    ) {
        while let Ok(Some(line)) = lines.next_line().await {
            match serde_json::from_str::<WorkerMessage>(&line) {
                Ok(WorkerMessage::Event(event)) => self.on_event(event).await,
                Ok(WorkerMessage::Response(response)) => {
                    if response.is_reload() {
                        if matches!(self.options.kind, WorkerKind::TableConfig { .. }) {
                            debug!("Ignoring reload request from table config worker");
                        } else {
                            info!(kind = self.options.kind.label(), "Worker requested a reload");
                            self.kill_process().await;
                        }
                        continue;
                    }
                    let mut session = self.session.lock().await;
                    if session.generation != generation {
                        debug!(id = %response.id, "Dropping response from a previous process");
                        continue;
                    }
                    match session.pending.remove(&response.id) {
                        Some(tx) => {
                            let result = match response.error {
                                Some(error) if !error.is_null() => Err(WorkerError::Remote(error)),
                                _ => Ok(response.result),
                            };
                            let _ = tx.send(result);
                        }
                        None => warn!(id = %response.id, "Worker response has no pending request"),
                    }
                }
                Err(_) => self.logs.push(&line),
            }
        }
        self.schedule_restart(generation, "stdout closed".to_string());
    }

    async fn on_event(&self, event: WorkerEvent) {
        let WorkerEvent::Error { error } = &event;
        let text = serde_json::to_string_pretty(error).unwrap_or_else(|_| error.to_string());
        error!(kind = self.options.kind.label(), "Forked worker error: {}", text);
        self.logs.push(&text);
        if event.error_code() == Some(DATABASE_NOT_FOUND_CODE) {
            self.retired.store(true, Ordering::SeqCst);
            self.stop("database not found").await;
        }
    }

    fn schedule_restart(self: &Arc<Self>, generation: u64, reason: String) {
        if self.retired.load(Ordering::SeqCst) || self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let seq = self.restart_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.options.settings.restart_debounce()).await;
            if inner.restart_seq.load(Ordering::SeqCst) != seq {
                return;
            }
            inner.restart(generation, reason).await;
        });
    }

    async fn restart(self: Arc<Self>, generation: u64, reason: String) {
        if self.retired.load(Ordering::SeqCst) || self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        if self.restarting.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut session = self.session.lock().await;
            if session.generation != generation {
                self.restarting.store(false, Ordering::SeqCst);
                return;
            }
            session.stdin = None;
            session.pid = None;
            session.kill = None;
            for (_, tx) in session.pending.drain() {
                let _ = tx.send(Err(WorkerError::ProcessError));
            }
        }

        let kind = self.options.kind.label();
        error!(kind, reason = %reason, "Forked worker failed, restarting");
        tokio::time::sleep(self.options.settings.restart_delay()).await;
        if self.destroyed.load(Ordering::SeqCst) || self.retired.load(Ordering::SeqCst) {
            self.restarting.store(false, Ordering::SeqCst);
            return;
        }

        match spawn_process(&self.options, &self.logs).await {
            Ok(spawned) => {
                self.install(spawned).await;
                self.restarting.store(false, Ordering::SeqCst);
                info!(kind, "Forked worker restarted");
                if let WorkerKind::OnMount { code } = &self.options.kind {
                    let inner = self.clone();
                    let code = code.clone();
                    tokio::spawn(async move {
                        if let Err(e) = inner.request(RequestBody::OnMount { code }).await {
                            warn!("on_mount after restart failed: {}", e);
                        }
                    });
                }
            }
            Err(e) => {
                self.restarting.store(false, Ordering::SeqCst);
                self.logs.push(&format!("Restart failed: {e}"));
                error!(kind, "Forked worker restart failed: {}", e);
                self.schedule_restart(generation, e.to_string());
            }
        }
    }

    async fn kill_process(&self) {
        if let Some(kill) = self.session.lock().await.kill.take() {
            kill.cancel();
        }
    }

    async fn stop(&self, reason: &str) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
        {
            let mut session = self.session.lock().await;
            session.stdin = None;
            session.pid = None;
            for (_, tx) in session.pending.drain() {
                let _ = tx.send(Err(WorkerError::Retired(reason.to_string())));
            }
        }
        info!(kind = self.options.kind.label(), reason, "Forked worker stopped");
        self.logs.close();
    }
}

async fn spawn_process(options: &WorkerOptions, logs: &Arc<LogBuffer>) -> WorkerResult<Spawned> {
    let mut cmd = Command::new(&options.program);
    cmd.args(&options.args);
    if !options.pass_process_env_vars {
        cmd.env_clear();
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }
    }
    cmd.env(FORKED_PROC_ENV_NAME, "true");
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| WorkerError::Spawn(format!("{}: {}", options.program.display(), e)))?;
    let (Some(mut stdin), Some(stdout), Some(stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        return Err(WorkerError::Spawn("stdio not captured".to_string()));
    };

    let stderr_logs = logs.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            stderr_logs.push(&line);
        }
    });

    let mut lines = BufReader::new(stdout).lines();
    let start = WorkerRequest {
        id: START_ID.to_string(),
        body: RequestBody::Start {
            init_args: options.init_args.clone(),
        },
    };
    let handshake = async {
        write_message(&mut stdin, &start).await?;
        wait_for_start(&mut lines, logs).await
    };
    match tokio::time::timeout(options.settings.startup_timeout(), handshake).await {
        Ok(Ok(())) => Ok(Spawned {
            child,
            stdin,
            lines,
        }),
        Ok(Err(e)) => {
            let _ = child.kill().await;
            Err(e)
        }
        Err(_) => {
            let _ = child.kill().await;
            Err(WorkerError::Startup("timed out waiting for the start reply".to_string()))
        }
    }
}

async fn wait_for_start(
    lines: &mut Lines<BufReader<ChildStdout>>,
    logs: &LogBuffer,
) -> WorkerResult<()> {
    while let Some(line) = lines.next_line().await? {
        match serde_json::from_str::<WorkerMessage>(&line) {
            Ok(WorkerMessage::Response(response)) if response.id == START_ID => {
                return match response.error {
                    Some(error) if !error.is_null() => Err(WorkerError::Startup(error.to_string())),
                    _ => Ok(()),
                };
            }
            Ok(WorkerMessage::Response(response)) => {
                debug!(id = %response.id, "Unexpected response during startup");
            }
            Ok(WorkerMessage::Event(WorkerEvent::Error { error })) => {
                logs.push(&error.to_string());
                return Err(WorkerError::Startup(error.to_string()));
            }
            Err(_) => logs.push(&line),
        }
    }
    Err(WorkerError::Startup(
        "process exited before completing the start handshake".to_string(),
    ))
}

async fn write_message(stdin: &mut ChildStdin, request: &WorkerRequest) -> WorkerResult<()> {
    let mut line = serde_json::to_vec(request)?;
    line.push(b'\n');
    stdin.write_all(&line).await?;
    stdin.flush().await?;
    Ok(())
}

/// Last N log entries of a worker, each prefixed with an ISO-8601 timestamp.
struct LogBuffer {
    lines: std::sync::Mutex<VecDeque<String>>,
    capacity: usize,
    changed: Notify,
    closed: CancellationToken,
}

impl LogBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            lines: std::sync::Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            changed: Notify::new(),
            closed: CancellationToken::new(),
        }
    }

    fn push(&self, text: &str) {
        let entry = format!(
            "{} {}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            text.trim_end()
        );
        {
            let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
            lines.push_back(entry);
            while lines.len() > self.capacity {
                lines.pop_front();
            }
        }
        self.changed.notify_one();
    }

    fn snapshot(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        lines.iter().map(String::as_str).collect()
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

fn spawn_log_persister(logs: Arc<LogBuffer>, sink: Arc<dyn WorkerLogSink>) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = logs.changed.notified() => sink.persist(logs.snapshot()).await,
                _ = logs.closed.cancelled() => {
                    sink.persist(logs.snapshot()).await;
                    break;
                }
            }
        }
    });
}
