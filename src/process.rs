//! Subprocess execution with a hard timeout.
//!
//! Every external program the control plane runs (hooks, blocker checks,
//! recovery probes) goes through [`run`]. The child inherits the parent
//! environment plus any extra variables, has its output captured, and is
//! killed at the timeout boundary or when the cancellation token fires.
//!
//! On unix each child leads its own process group, and a kill signals the
//! whole group so nothing the child started outlives the timeout. Completion
//! means the child exited; descendants that still hold its output pipes
//! only get a short grace period to flush.
//!
//! Exit codes follow the shell conventions the hooks rely on:
//! `124` timed out (or cancelled), `126` permission denied, `127` not found.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{klog_trace, Error, Result};

pub const EXIT_TIMEOUT: i32 = 124;
pub const EXIT_PERMISSION_DENIED: i32 = 126;
pub const EXIT_NOT_FOUND: i32 = 127;

/// How long output readers may run on after the child exits.
const PIPE_GRACE: Duration = Duration::from_millis(200);

/// What to run.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub timeout: Duration,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.envs.push((key.to_string(), value.into()));
        self
    }

    /// Run `command` through the system shell.
    pub fn shell(command: &str, timeout: Duration) -> Result<Self> {
        let sh = which::which("sh").map_err(|e| Error::Subprocess(format!("sh not found: {}", e)))?;
        Ok(Self::new(sh, timeout).arg("-c").arg(command))
    }
}

/// Captured result of one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stderr followed by stdout, for failure excerpts and classification.
    pub fn combined(&self) -> String {
        match (self.stderr.trim().is_empty(), self.stdout.trim().is_empty()) {
            (true, _) => self.stdout.clone(),
            (false, true) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stderr, self.stdout),
        }
    }

    fn failed_to_start(err: &std::io::Error, started: Instant) -> Self {
        let exit_code = match err.kind() {
            std::io::ErrorKind::NotFound => EXIT_NOT_FOUND,
            std::io::ErrorKind::PermissionDenied => EXIT_PERMISSION_DENIED,
            _ => 1,
        };
        Self {
            exit_code,
            stdout: String::new(),
            stderr: err.to_string(),
            duration_ms: elapsed_ms(started),
            timed_out: false,
        }
    }

    fn timed_out(timeout: Duration, started: Instant, reason: &str) -> Self {
        Self {
            exit_code: EXIT_TIMEOUT,
            stdout: String::new(),
            stderr: format!("{} after {}s", reason, timeout.as_secs()),
            duration_ms: elapsed_ms(started),
            timed_out: true,
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

/// Output read from one pipe, shared so a reader cut off after the grace
/// period still leaves what it had read.
#[derive(Clone, Default)]
struct PipeBuffer(Arc<Mutex<Vec<u8>>>);

impl PipeBuffer {
    fn append(&self, chunk: &[u8]) {
        match self.0.lock() {
            Ok(mut buf) => buf.extend_from_slice(chunk),
            Err(poisoned) => poisoned.into_inner().extend_from_slice(chunk),
        }
    }

    fn text(&self) -> String {
        match self.0.lock() {
            Ok(buf) => String::from_utf8_lossy(&buf).into_owned(),
            Err(poisoned) => String::from_utf8_lossy(&poisoned.into_inner()).into_owned(),
        }
    }
}

struct PipeReader {
    buffer: PipeBuffer,
    task: JoinHandle<()>,
}

impl PipeReader {
    fn spawn<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = PipeBuffer::default();
        let sink = buffer.clone();
        let task = tokio::spawn(async move {
            let Some(mut pipe) = pipe else { return };
            let mut chunk = [0u8; 4096];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => sink.append(&chunk[..n]),
                }
            }
        });
        Self { buffer, task }
    }

    /// Wait up to `grace` for EOF, then stop reading.
    async fn finish(mut self, grace: Duration) -> String {
        if tokio::time::timeout(grace, &mut self.task).await.is_err() {
            self.task.abort();
        }
        self.buffer.text()
    }
}

/// Kill the child's process group and reap the child.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                klog_trace!("killpg {} failed: {}", pid, e);
            }
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// Run a process to completion, its timeout, or cancellation.
///
/// Never fails: spawn errors and timeouts are reported through the exit
/// code so callers can record them like any other failure.
pub async fn run(spec: &ProcessSpec, cancel: &CancellationToken) -> ProcessOutput {
    let started = Instant::now();
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    // ETXTBSY: a freshly written script can still be open for writing in a
    // concurrently forked process.
    let mut attempts = 0;
    let mut child = loop {
        match command.spawn() {
            Ok(child) => break child,
            Err(e) if e.raw_os_error() == Some(26) && attempts < 3 => {
                attempts += 1;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => return ProcessOutput::failed_to_start(&e, started),
        }
    };

    let stdout = PipeReader::spawn(child.stdout.take());
    let stderr = PipeReader::spawn(child.stderr.take());

    let waited = tokio::select! {
        res = tokio::time::timeout(spec.timeout, child.wait()) => res,
        _ = cancel.cancelled() => {
            terminate(&mut child).await;
            stdout.task.abort();
            stderr.task.abort();
            return ProcessOutput::timed_out(spec.timeout, started, "cancelled by deadline");
        }
    };

    match waited {
        Ok(Ok(status)) => {
            let result = ProcessOutput {
                exit_code: exit_code_of(status),
                stdout: stdout.finish(PIPE_GRACE).await,
                stderr: stderr.finish(PIPE_GRACE).await,
                duration_ms: elapsed_ms(started),
                timed_out: false,
            };
            klog_trace!(
                "{} exited {} in {}ms",
                spec.program.display(),
                result.exit_code,
                result.duration_ms
            );
            result
        }
        Ok(Err(e)) => {
            terminate(&mut child).await;
            stdout.task.abort();
            stderr.task.abort();
            ProcessOutput::failed_to_start(&e, started)
        }
        Err(_) => {
            terminate(&mut child).await;
            stdout.task.abort();
            stderr.task.abort();
            ProcessOutput::timed_out(spec.timeout, started, "timed out")
        }
    }
}
