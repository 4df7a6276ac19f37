//! Script execution in an isolated working directory.
//!
//! The working directory is wiped and recreated before every run, so a run
//! never sees residue from an earlier one. On unix the script runs in its own
//! process group; the whole group is killed when the run ends (timeout or
//! not) and on cancellation, so background processes it started do not
//! outlive it. Captured output is held as a bounded tail while reading.

use std::collections::BTreeSet;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use evoloop_state::{tail_chars, ExecutionOutcome};

use crate::config::ExecutorConfig;

/// Grace period for draining pipes after the child exits or is killed.
const READER_GRACE: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 8 * 1024;

/// Runs source text and reports what happened. Never fails: infrastructure
/// problems become failed outcomes.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn run(&self, source: &str, working_dir: &Path, timeout: Duration) -> ExecutionOutcome;
}

/// Executes scripts with an external interpreter.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    interpreter: String,
    interpreter_args: Vec<String>,
    script_name: String,
    required_outputs: Vec<String>,
    tail_chars: usize,
}

impl ProcessExecutor {
    pub fn new(config: &ExecutorConfig, tail_chars: usize) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            interpreter_args: config.interpreter_args.clone(),
            script_name: config.script_name.clone(),
            required_outputs: config.required_outputs.clone(),
            tail_chars: tail_chars.max(1),
        }
    }

    pub fn script_name(&self) -> &str {
        &self.script_name
    }

    fn failed(&self, message: String, started: Instant) -> ExecutionOutcome {
        let mut outcome = ExecutionOutcome::failed(tail_chars(&message, self.tail_chars));
        outcome.duration_ms = started.elapsed().as_millis() as u64;
        outcome
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn run(&self, source: &str, working_dir: &Path, timeout: Duration) -> ExecutionOutcome {
        let started = Instant::now();

        if let Err(e) = prepare_working_dir(working_dir).await {
            return self.failed(
                format!(
                    "failed to prepare working directory {}: {}",
                    working_dir.display(),
                    e
                ),
                started,
            );
        }
        let script_path = working_dir.join(&self.script_name);
        if let Err(e) = tokio::fs::write(&script_path, source).await {
            return self.failed(format!("failed to write script: {}", e), started);
        }

        let mut command = Command::new(&self.interpreter);
        command
            .args(&self.interpreter_args)
            .arg(&self.script_name)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        let spawned = command.spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                return self.failed(
                    format!("failed to spawn {}: {}", self.interpreter, e),
                    started,
                )
            }
        };
        debug!(pid = ?child.id(), dir = %working_dir.display(), "script started");
        let mut group = ProcessGroup::new(child.id());

        // Up to 4 bytes per character.
        let byte_cap = self.tail_chars.saturating_mul(4);
        let stdout_reader = spawn_reader(child.stdout.take(), byte_cap);
        let stderr_reader = spawn_reader(child.stderr.take(), byte_cap);

        let mut timed_out = false;
        let mut wait_error = None;
        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                wait_error = Some(e.to_string());
                None
            }
            Err(_) => {
                timed_out = true;
                warn!(
                    timeout_secs = timeout.as_secs_f64(),
                    "script timed out, killing process"
                );
                group.kill();
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to kill timed-out script");
                }
                None
            }
        };
        // Stragglers left by the script would hold the pipes open.
        group.kill();

        let (stdout, stderr) =
            futures::future::join(drain(stdout_reader), drain(stderr_reader)).await;
        let stdout = String::from_utf8_lossy(&stdout).into_owned();
        let stderr = String::from_utf8_lossy(&stderr).into_owned();

        let produced_files = list_produced(working_dir, &self.script_name);
        let missing: Vec<&str> = self
            .required_outputs
            .iter()
            .filter(|f| !produced_files.contains(*f))
            .map(String::as_str)
            .collect();

        let exit_code = status.and_then(|s| s.code());
        let exited_ok = status.map(|s| s.success()).unwrap_or(false);
        let succeeded = !timed_out && exited_ok && missing.is_empty();

        let stderr_tail = if succeeded {
            None
        } else {
            let mut text = stderr.trim_end().to_string();
            let mut note = |line: String| {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(&line);
            };
            if let Some(e) = wait_error {
                note(format!("failed to wait for script: {}", e));
            }
            if timed_out {
                note(format!(
                    "Execution timed out after {:.1}s",
                    timeout.as_secs_f64()
                ));
            } else if !exited_ok && stderr.trim().is_empty() {
                match exit_code {
                    Some(code) => note(format!("process exited with status {}", code)),
                    None => note("process terminated by signal".to_string()),
                }
            }
            if !missing.is_empty() {
                note(format!("missing required output(s): {}", missing.join(", ")));
            }
            Some(tail_chars(&text, self.tail_chars))
        };

        ExecutionOutcome {
            succeeded,
            attempts_used: 1,
            exit_code,
            timed_out,
            stderr_tail,
            stdout_tail: (!stdout.is_empty()).then(|| tail_chars(&stdout, self.tail_chars)),
            produced_files,
            work_dir: Some(working_dir.to_path_buf()),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Remove anything left at `dir` and recreate it empty.
pub async fn prepare_working_dir(dir: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::fs::create_dir_all(dir).await
}

/// Kills the script's process group once, at the latest when dropped.
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    /// With `process_group(0)` the group id is the child's pid.
    fn new(pid: Option<u32>) -> Self {
        Self { pgid: pid }
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_group(pgid);
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: killpg only takes integers and sends a signal.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pgid, error = %err, "failed to kill script process group");
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

/// Keeps only the last `cap` bytes pushed into it.
#[derive(Debug)]
struct TailBuffer {
    buf: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl TailBuffer {
    fn new(cap: usize) -> Self {
        Self {
            buf: Vec::new(),
            cap: cap.max(1),
            truncated: false,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        if bytes.len() >= self.cap {
            self.buf.clear();
            self.buf.extend_from_slice(&bytes[bytes.len() - self.cap..]);
            self.truncated = true;
            return;
        }
        let overflow = (self.buf.len() + bytes.len()).saturating_sub(self.cap);
        if overflow > 0 {
            self.buf.drain(..overflow);
            self.truncated = true;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Tail bytes, minus a leading partial UTF-8 sequence left by the cut.
    fn into_bytes(mut self) -> Vec<u8> {
        if self.truncated {
            let partial = self
                .buf
                .iter()
                .take(3)
                .take_while(|b| (**b & 0xC0) == 0x80)
                .count();
            self.buf.drain(..partial);
        }
        self.buf
    }
}

fn spawn_reader<R>(pipe: Option<R>, cap: usize) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut tail = TailBuffer::new(cap);
        if let Some(mut pipe) = pipe {
            let mut chunk = vec![0u8; READ_CHUNK];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => tail.push(&chunk[..n]),
                    Err(e) => {
                        debug!(error = %e, "pipe read failed");
                        break;
                    }
                }
            }
        }
        tail.into_bytes()
    })
}

/// Wait briefly for a reader; grandchildren holding the pipe open must not
/// stall the run.
async fn drain(mut handle: JoinHandle<Vec<u8>>) -> Vec<u8> {
    match tokio::time::timeout(READER_GRACE, &mut handle).await {
        Ok(Ok(buf)) => buf,
        Ok(Err(_)) => Vec::new(),
        Err(_) => {
            handle.abort();
            Vec::new()
        }
    }
}

/// Relative paths of files under `dir`, excluding the script itself.
fn list_produced(dir: &Path, script_name: &str) -> BTreeSet<String> {
    let mut files = BTreeSet::new();
    collect_files(dir, dir, &mut files);
    files.remove(script_name);
    files
}

fn collect_files(root: &Path, dir: &Path, out: &mut BTreeSet<String>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "cannot list directory");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        match entry.file_type() {
            Ok(ft) if ft.is_dir() => collect_files(root, &path, out),
            Ok(ft) if ft.is_file() => {
                if let Ok(rel) = path.strip_prefix(root) {
                    let rel: Vec<String> = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect();
                    out.insert(rel.join("/"));
                }
            }
            _ => {}
        }
    }
}
