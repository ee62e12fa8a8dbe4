use crate::backend::{Backend, Backends};
use crate::queue::{Consumer, Progress, WorkItem};
use anyhow::{bail, Context, Error};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

/// Stderr kept per job. Older output is discarded as more arrives.
const MAX_STDERR_BYTES: usize = 64 * 1024;

/// Longest error detail kept from stderr.
const MAX_DETAIL_BYTES: usize = 2048;

#[derive(Debug)]
pub enum WorkMessage {
    JobStarted(Uuid),
    JobProgress(Uuid, f64),
    JobFinished(Uuid, Outcome),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(PathBuf),
    Failed(String),
    Cancelled,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Completed(path) => write!(f, "completed ({})", path.display()),
            Outcome::Failed(detail) => write!(f, "failed ({detail})"),
            Outcome::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Shared settings for every job a worker runs.
pub struct Executor {
    pub backends: Backends,
    pub data_dir: PathBuf,
    pub job_timeout: Option<Duration>,
    pub http: reqwest::Client,
}

impl Executor {
    pub fn new(backends: Backends, data_dir: PathBuf, job_timeout: Option<Duration>) -> Self {
        Executor {
            backends,
            data_dir,
            job_timeout,
            http: reqwest::Client::new(),
        }
    }

    pub fn output_path(&self, id: Uuid) -> PathBuf {
        self.data_dir.join("gcode").join(format!("{id}.gcode"))
    }

    /// Local copy of a remote input, or `None` for local inputs.
    pub fn download_path(&self, id: Uuid, location: &str) -> Option<PathBuf> {
        if !(location.starts_with("http://") || location.starts_with("https://")) {
            return None;
        }
        let path = location.split(['?', '#']).next().unwrap_or_default();
        let ext = Path::new(path.rsplit('/').next().unwrap_or_default())
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("stl")
            .to_ascii_lowercase();
        Some(self.data_dir.join("inputs").join(format!("{id}.{ext}")))
    }
}

struct Job {
    id: Uuid,
    input_location: String,
    backend: String,
    preset: String,
}

pub async fn start(cancel_token: CancellationToken, consumer: Consumer, executor: Arc<Executor>) {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Worker Cancelled");
                break;
            },
            item = consumer.next() => {
                let WorkItem { id, input_location, backend, preset, cancel, reporter } = item;
                reporter.started();

                let job = Job { id, input_location, backend, preset };
                let progress = reporter.progress();
                let task = tokio::spawn(process(executor.clone(), job, cancel, progress).in_current_span());

                // A panic inside the job task stops here.
                let outcome = match task.await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        error!(message = "Job task died", job_id = %id, error = ?err);
                        Outcome::Failed(format!("worker crashed: {err}"))
                    }
                };
                reporter.finish(outcome);
            }
        }
    }
    info!("Worker stopped.");
}

#[instrument(skip_all, fields(job_id = %job.id, backend = %job.backend))]
async fn process(
    executor: Arc<Executor>,
    job: Job,
    cancel: oneshot::Receiver<()>,
    progress: Progress,
) -> Outcome {
    let Some(backend) = executor.backends.get(&job.backend) else {
        return Outcome::Failed(format!("unsupported backend {:?}", job.backend));
    };

    let cancelled = cancelled(cancel);
    tokio::pin!(cancelled);

    let input = tokio::select! {
        biased;
        () = &mut cancelled => {
            info!("Cancelled while fetching input");
            return Outcome::Cancelled;
        },
        input = materialize(&executor, job.id, &job.input_location) => match input {
            Ok(input) => input,
            Err(err) => return Outcome::Failed(format!("{err:#}")),
        },
    };

    let output = executor.output_path(job.id);
    match run(&executor, backend, &job, &input, &output, cancelled, progress).await {
        Ok(outcome) => outcome,
        Err(err) => Outcome::Failed(format!("{err:#}")),
    }
}

/// Resolves once the job is cancelled. A dropped handle never cancels.
async fn cancelled(signal: oneshot::Receiver<()>) {
    if signal.await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Resolves the job input to a local file, downloading remote meshes.
async fn materialize(executor: &Executor, id: Uuid, location: &str) -> Result<PathBuf, Error> {
    let Some(path) = executor.download_path(id, location) else {
        let path = PathBuf::from(location.strip_prefix("file://").unwrap_or(location));
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            bail!("input mesh {} does not exist", path.display());
        }
        return Ok(path);
    };
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }

    debug!(url = location, "Downloading mesh");
    let bytes = executor
        .http
        .get(location)
        .send()
        .await
        .and_then(|resp| resp.error_for_status())
        .with_context(|| format!("fetching {location}"))?
        .bytes()
        .await
        .with_context(|| format!("reading {location}"))?;
    tokio::fs::write(&path, &bytes).await?;
    Ok(path)
}

/// Spawns the backend and waits for exit, cancellation or timeout,
/// whichever is seen first.
async fn run(
    executor: &Executor,
    backend: Arc<dyn Backend>,
    job: &Job,
    input: &Path,
    output: &Path,
    mut cancelled: Pin<&mut impl Future<Output = ()>>,
    progress: Progress,
) -> Result<Outcome, Error> {
    let invocation = backend.invocation(input, output, &job.preset)?;
    if let Some(parent) = output.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    debug!(program = %invocation.program.display(), args = ?invocation.args, "Spawning backend");
    let mut command = Command::new(&invocation.program);
    command
        .args(&invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Own process group, so helpers the backend forks are killed with it.
    #[cfg(unix)]
    command.process_group(0);
    let mut child = command
        .spawn()
        .with_context(|| format!("{}", invocation.program.display()))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let progress_task = tokio::spawn(watch_progress(stdout, backend, progress).in_current_span());
    let stderr_task = tokio::spawn(read_tail(stderr));

    let deadline = async {
        match executor.job_timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    let status = tokio::select! {
        biased;
        () = &mut cancelled => {
            info!("Cancelling backend process");
            terminate(&mut child).await;
            progress_task.abort();
            stderr_task.abort();
            return Ok(Outcome::Cancelled);
        },
        _ = deadline => {
            warn!(timeout = ?executor.job_timeout, "Backend timed out");
            terminate(&mut child).await;
            progress_task.abort();
            stderr_task.abort();
            bail!("timed out after {:?}", executor.job_timeout.unwrap_or_default());
        },
        status = child.wait() => status.context("waiting for backend")?,
    };

    let _ = progress_task.await;
    let stderr = stderr_task.await.unwrap_or_default();
    Ok(finished(&invocation.program, status, &stderr, output).await)
}

async fn finished(program: &Path, status: ExitStatus, stderr: &[u8], output: &Path) -> Outcome {
    if !status.success() {
        let detail = summarize(stderr)
            .unwrap_or_else(|| format!("{} exited with {}", program.display(), status));
        debug!(%status, "Backend failed");
        return Outcome::Failed(detail);
    }
    match tokio::fs::metadata(output).await {
        Ok(meta) if meta.is_file() => Outcome::Completed(output.to_path_buf()),
        _ => Outcome::Failed(format!(
            "{} exited successfully but produced no output at {}",
            program.display(),
            output.display()
        )),
    }
}

/// Kills the backend's process group and reaps the backend. Errors are
/// logged; the caller reports the job as cancelled either way.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // Safety: killpg only sends a signal to the group led by our child.
        let ret = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
        if ret != 0 {
            debug!(message = "Failed to kill process group", error = %std::io::Error::last_os_error());
        }
    }
    if let Err(err) = child.kill().await {
        warn!(message = "Failed to kill backend process", error = %err);
    }
}

async fn watch_progress<R: AsyncRead + Unpin>(
    stdout: Option<R>,
    backend: Arc<dyn Backend>,
    progress: Progress,
) {
    let Some(stdout) = stdout else {
        return;
    };
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        trace!(line = %line, "backend stdout");
        if let Some(fraction) = backend.progress(&line) {
            progress.report(fraction);
        }
    }
}

/// Reads the stream to its end and keeps the last `MAX_STDERR_BYTES`. The
/// pipe stays drained so a chatty backend never blocks or gets SIGPIPE.
async fn read_tail<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut tail = Vec::new();
    let Some(mut h) = handle else {
        return tail;
    };
    let mut chunk = [0u8; 8192];
    loop {
        match h.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&chunk[..n]);
                if tail.len() > MAX_STDERR_BYTES {
                    let excess = tail.len() - MAX_STDERR_BYTES;
                    tail.drain(..excess);
                }
            }
        }
    }
    tail
}

/// Tail of stderr, trimmed, or `None` when the backend printed nothing.
fn summarize(stderr: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let mut start = text.len().saturating_sub(MAX_DETAIL_BYTES);
    while !text.is_char_boundary(start) {
        start += 1;
    }
    Some(text[start..].to_string())
}
