use crate::error::{AppError, Result};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const STDERR_TAIL_LINES: usize = 10;
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// An external program invocation. Spawned with a cleared environment so only
/// `PATH` and the variables listed here reach the child.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipeEvent {
    Stderr(String),
    Stdout(String),
    Progress { bytes: u64 },
}

#[derive(Debug, Default)]
pub struct PipeOutcome {
    pub bytes: u64,
    pub stderr: String,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs(mut self, vars: Vec<(String, String)>) -> Self {
        self.env.extend(vars);
        self
    }

    /// Shell-like rendering for job records. Secret values are masked.
    pub fn display(&self) -> String {
        let mut parts: Vec<String> = self
            .env
            .iter()
            .map(|(name, value)| {
                if is_secret(name) {
                    format!("{name}=\"***\"")
                } else {
                    format!("{name}={value:?}")
                }
            })
            .collect();
        parts.push(self.program.display().to_string());
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.env_clear();
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }
        #[cfg(windows)]
        if let Ok(root) = std::env::var("SystemRoot") {
            cmd.env("SystemRoot", root);
        }
        for (name, value) in &self.env {
            cmd.env(name, value);
        }
        cmd.kill_on_drop(true);
        cmd
    }
}

fn is_secret(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    upper == "PGPASSWORD" || upper.contains("KEY") || upper.contains("SECRET")
}

/// Runs `spec` and streams its stdout into `sink`. The sink is shut down only
/// after a zero exit, so a failed dump never produces a finished artifact.
pub async fn pipe_from_command<W>(
    spec: &CommandSpec,
    sink: &mut W,
    events: &UnboundedSender<PipeEvent>,
    cancel: &CancellationToken,
) -> Result<PipeOutcome>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut child = spawn(spec, false)?;
    let stderr = collect_lines(child.stderr.take(), events.clone(), PipeEvent::Stderr);
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Command("stdout not captured".to_string()))?;

    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut bytes = 0u64;
    loop {
        let n = tokio::select! {
            read = stdout.read(&mut buf) => read?,
            _ = cancel.cancelled() => return Err(kill(&mut child, spec).await),
        };
        if n == 0 {
            break;
        }
        if let Err(e) = sink.write_all(&buf[..n]).await {
            let _ = child.kill().await;
            return Err(e.into());
        }
        bytes += n as u64;
        let _ = events.send(PipeEvent::Progress { bytes });
    }

    let status = wait(&mut child, spec, cancel).await?;
    let stderr = join_lines(stderr).await;
    if !status.success() {
        return Err(exit_error(spec, status, &stderr));
    }
    sink.flush().await?;
    sink.shutdown().await?;
    Ok(PipeOutcome { bytes, stderr })
}

/// Runs `spec` feeding `source` into its stdin. Without a source the program
/// reads its input from the arguments (local file restore).
pub async fn pipe_to_command<R>(
    spec: &CommandSpec,
    source: Option<&mut R>,
    events: &UnboundedSender<PipeEvent>,
    cancel: &CancellationToken,
) -> Result<PipeOutcome>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut child = spawn(spec, source.is_some())?;
    let stderr = collect_lines(child.stderr.take(), events.clone(), PipeEvent::Stderr);
    let stdout = collect_lines(child.stdout.take(), events.clone(), PipeEvent::Stdout);

    let mut bytes = 0u64;
    let mut write_error = None;
    if let Some(source) = source {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Command("stdin not captured".to_string()))?;
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let read = tokio::select! {
                read = source.read(&mut buf) => read,
                _ = cancel.cancelled() => return Err(kill(&mut child, spec).await),
            };
            let n = match read {
                Ok(n) => n,
                Err(e) => {
                    let _ = child.kill().await;
                    return Err(e.into());
                }
            };
            if n == 0 {
                break;
            }
            // The child may exit early; its exit status explains why better than EPIPE.
            if let Err(e) = stdin.write_all(&buf[..n]).await {
                write_error = Some(e);
                break;
            }
            bytes += n as u64;
            let _ = events.send(PipeEvent::Progress { bytes });
        }
        drop(stdin);
    }

    let status = wait(&mut child, spec, cancel).await?;
    let stderr = join_lines(stderr).await;
    join_lines(stdout).await;
    if !status.success() {
        return Err(exit_error(spec, status, &stderr));
    }
    if let Some(e) = write_error {
        return Err(e.into());
    }
    Ok(PipeOutcome { bytes, stderr })
}

fn spawn(spec: &CommandSpec, with_stdin: bool) -> Result<Child> {
    let mut cmd = spec.command();
    cmd.stdin(if with_stdin { Stdio::piped() } else { Stdio::null() });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.spawn().map_err(|e| {
        AppError::Command(format!(
            "Failed to start {}: {}",
            spec.program.display(),
            e
        ))
    })
}

fn collect_lines<S>(
    stream: Option<S>,
    events: UnboundedSender<PipeEvent>,
    wrap: fn(String) -> PipeEvent,
) -> JoinHandle<String>
where
    S: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut collected = String::new();
        let Some(stream) = stream else {
            return collected;
        };
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            collected.push_str(&line);
            collected.push('\n');
            let _ = events.send(wrap(line));
        }
        collected
    })
}

async fn join_lines(handle: JoinHandle<String>) -> String {
    handle.await.unwrap_or_default()
}

async fn wait(
    child: &mut Child,
    spec: &CommandSpec,
    cancel: &CancellationToken,
) -> Result<ExitStatus> {
    tokio::select! {
        status = child.wait() => Ok(status?),
        _ = cancel.cancelled() => Err(kill(child, spec).await),
    }
}

async fn kill(child: &mut Child, spec: &CommandSpec) -> AppError {
    let _ = child.kill().await;
    AppError::Cancelled(format!("{} was stopped", spec.program.display()))
}

fn exit_error(spec: &CommandSpec, status: ExitStatus, stderr: &str) -> AppError {
    let lines: Vec<&str> = stderr.lines().collect();
    let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");
    if tail.is_empty() {
        AppError::Command(format!("{} exited with {}", spec.program.display(), status))
    } else {
        AppError::Command(tail)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn stdout_reaches_the_sink_and_stderr_is_reported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sink = Vec::new();
        let outcome = pipe_from_command(
            &sh("printf 'dump-bytes'; echo 'progress line' >&2"),
            &mut sink,
            &tx,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(sink, b"dump-bytes");
        assert_eq!(outcome.bytes, 10);
        assert_eq!(outcome.stderr, "progress line\n");
        drop(tx);
        let mut saw_stderr = false;
        while let Some(event) = rx.recv().await {
            if event == PipeEvent::Stderr("progress line".to_string()) {
                saw_stderr = true;
            }
        }
        assert!(saw_stderr);
    }

    #[tokio::test]
    async fn non_zero_exit_reports_stderr_tail() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut sink = Vec::new();
        let err = pipe_from_command(
            &sh("for i in $(seq 1 15); do echo line$i >&2; done; exit 3"),
            &mut sink,
            &tx,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        let AppError::Command(message) = err else {
            panic!("expected a command error");
        };
        assert!(message.starts_with("line6"));
        assert!(message.ends_with("line15"));
    }

    #[tokio::test]
    async fn source_is_fed_to_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("restored");
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut source: &[u8] = b"CREATE TABLE t();\n";
        let outcome = pipe_to_command(
            &sh(&format!("cat > {}", out.display())),
            Some(&mut source),
            &tx,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.bytes, 18);
        assert_eq!(std::fs::read(&out).unwrap(), b"CREATE TABLE t();\n");
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let mut sink = Vec::new();
        let err = pipe_from_command(&sh("sleep 30"), &mut sink, &tx, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Cancelled(_)));
    }

    #[test]
    fn display_masks_secrets() {
        let spec = CommandSpec::new("pg_dump").arg("-v").envs(vec![
            ("PGUSER".to_string(), "admin".to_string()),
            ("PGPASSWORD".to_string(), "hunter2".to_string()),
        ]);
        let shown = spec.display();
        assert_eq!(shown, "PGUSER=\"admin\" PGPASSWORD=\"***\" pg_dump -v");
        assert!(!shown.contains("hunter2"));
    }
}
