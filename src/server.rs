use crate::backend::Backends;
use crate::db::DbHandle;
use crate::notifier::{Handles, Notifier};
use crate::queue::{JobQueue, Scheduler};
use crate::worker::{self, Executor};
use crate::{Error, JobRecord, Mesh, Result, Status};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

const MESH_EXTENSIONS: &[&str] = &["stl", "amf"];

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Uploaded meshes, downloaded inputs and generated G-code live here.
    pub data_dir: PathBuf,
    /// Public prefix for job and G-code URLs, without a trailing slash.
    pub base_url: String,
    pub workers: u16,
    pub job_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            data_dir: PathBuf::from("data"),
            base_url: "http://localhost:8888/slicer".into(),
            workers: 3,
            job_timeout: None,
        }
    }
}

/// The running job service: a worker pool, the notifier, and the
/// operations callers use to submit and track jobs.
pub struct Server {
    store: DbHandle,
    scheduler: Scheduler,
    executor: Arc<Executor>,
    handles: Handles,
    updates: broadcast::Sender<JobRecord>,
    config: ServerConfig,
    worker_token: CancellationToken,
    notifier_token: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    notifier: JoinHandle<()>,
}

impl Server {
    pub async fn start(store: DbHandle, backends: Backends, config: ServerConfig) -> Result<Self> {
        tokio::fs::create_dir_all(config.data_dir.join("meshes")).await?;

        let (send_to_server, recv_from_worker) = mpsc::unbounded_channel();
        let (scheduler, consumer) = JobQueue::new(send_to_server);
        let (updates, _) = broadcast::channel(256);
        let handles = Handles::default();

        recover(&store, &scheduler, &handles).await?;

        let notifier_token = CancellationToken::new();
        let notifier = {
            let notifier = Notifier::new(
                store.clone(),
                handles.clone(),
                updates.clone(),
                config.base_url.clone(),
            );
            tokio::spawn(
                notifier
                    .run(notifier_token.clone(), recv_from_worker)
                    .instrument(info_span!("notifier")),
            )
        };

        let executor = Arc::new(Executor::new(
            backends,
            config.data_dir.clone(),
            config.job_timeout,
        ));
        let worker_token = CancellationToken::new();
        let mut workers = vec![];
        for index in 0..config.workers.max(1) {
            let cancel_token = worker_token.clone();
            let consumer = consumer.clone();
            let executor = executor.clone();
            let join_handle = tokio::spawn(
                async move {
                    worker::start(cancel_token, consumer, executor).await;
                }
                .instrument(info_span!("worker", index)),
            );
            workers.push(join_handle);
        }

        info!(workers = workers.len(), "Server started");
        Ok(Server {
            store,
            scheduler,
            executor,
            handles,
            updates,
            config,
            worker_token,
            notifier_token,
            workers,
            notifier,
        })
    }

    /// Validates and records a new job, then queues it.
    #[instrument(skip(self, mesh), fields(job_id))]
    pub async fn submit(&self, mesh: Mesh, backend: &str, preset: &str) -> Result<JobRecord> {
        self.executor.backends.validate(backend, preset)?;

        let id = Uuid::new_v4();
        Span::current().record("job_id", tracing::field::display(id));
        let (input_location, staged) = self.stage_mesh(id, mesh).await?;

        let record = JobRecord::new(
            id,
            format!("{}/jobs/{}", self.config.base_url, id),
            input_location,
            backend.to_string(),
            preset.to_string(),
        );
        if let Err(err) = self.store.put(&record).await {
            if let Some(path) = staged {
                let _ = tokio::fs::remove_file(path).await;
            }
            return Err(err);
        }

        enqueue(&self.scheduler, &self.handles, &record);
        info!(depth = self.scheduler.len(), "Accepted job");
        Ok(record)
    }

    /// Resolves the submitted mesh to an input location, writing uploaded
    /// bytes under the data directory.
    async fn stage_mesh(&self, id: Uuid, mesh: Mesh) -> Result<(String, Option<PathBuf>)> {
        match mesh {
            Mesh::Bytes { name, data } => {
                let ext = mesh_extension(Path::new(&name)).ok_or_else(|| {
                    Error::Validation(format!("{name:?} is not a mesh file"))
                })?;
                if data.is_empty() {
                    return Err(Error::Validation("mesh is empty".into()));
                }
                let path = self.config.data_dir.join("meshes").join(format!("{id}.{ext}"));
                tokio::fs::write(&path, &data).await?;
                Ok((format!("file://{}", path.display()), Some(path)))
            }
            Mesh::Reference(location)
                if location.starts_with("http://") || location.starts_with("https://") =>
            {
                let path = location.split(['?', '#']).next().unwrap_or_default();
                if mesh_extension(Path::new(path)).is_none() {
                    return Err(Error::Validation(format!("{location} is not a mesh file")));
                }
                Ok((location, None))
            }
            Mesh::Reference(location) => {
                let path = Path::new(location.strip_prefix("file://").unwrap_or(&location));
                if mesh_extension(path).is_none() {
                    return Err(Error::Validation(format!(
                        "{} is not a mesh file",
                        path.display()
                    )));
                }
                match tokio::fs::metadata(path).await {
                    Ok(meta) if meta.is_file() => Ok((location.clone(), None)),
                    _ => Err(Error::Validation(format!(
                        "mesh {} is not readable",
                        path.display()
                    ))),
                }
            }
        }
    }

    pub async fn status(&self, id: Uuid) -> Result<JobRecord> {
        self.store.get(id).await
    }

    /// Opens the generated G-code of a completed job.
    pub async fn result(&self, id: Uuid) -> Result<tokio::fs::File> {
        let record = self.store.get(id).await?;
        match (record.status, record.output_path) {
            (Status::Complete, Some(path)) => Ok(tokio::fs::File::open(path).await?),
            (status, _) => Err(Error::NotReady { id, status }),
        }
    }

    /// Requests cancellation. Jobs that already finished are left alone.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: Uuid) -> Result<()> {
        let record = self.store.get(id).await?;
        if record.status.is_terminal() {
            debug!(status = %record.status, "Job already finished");
            return Ok(());
        }
        if let Some(handle) = self.handles.take(id) {
            let how = handle.cancel();
            debug!(?how, "Cancel requested");
        }
        Ok(())
    }

    /// Deletes a finished job and the files it owns.
    #[instrument(skip(self))]
    pub async fn remove(&self, id: Uuid) -> Result<()> {
        let record = self.store.get(id).await?;
        if !record.status.is_terminal() {
            return Err(Error::NotReady {
                id,
                status: record.status,
            });
        }

        let mut files = vec![self.executor.output_path(id)];
        if let Some(path) = self.executor.download_path(id, &record.input_location) {
            files.push(path);
        }
        let input = Path::new(
            record
                .input_location
                .strip_prefix("file://")
                .unwrap_or(&record.input_location),
        );
        if input.starts_with(self.config.data_dir.join("meshes")) {
            files.push(input.to_path_buf());
        }
        for file in files {
            match tokio::fs::remove_file(&file).await {
                Ok(()) => debug!(file = %file.display(), "Removed job file"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!(file = %file.display(), error = %err, "Failed to remove job file"),
            }
        }

        self.store.delete(id).await
    }

    /// Waits for the job to reach a terminal state.
    pub async fn wait(&self, id: Uuid) -> Result<JobRecord> {
        let mut updates = self.updates.subscribe();
        loop {
            let record = self.store.get(id).await?;
            if record.status.is_terminal() {
                return Ok(record);
            }
            loop {
                match updates.recv().await {
                    Ok(update) if update.id == id && update.status.is_terminal() => {
                        return Ok(update)
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(_)) => break,
                    Err(RecvError::Closed) => return self.store.get(id).await,
                }
            }
        }
    }

    /// Snapshots published after every persisted transition.
    pub fn subscribe(&self) -> broadcast::Receiver<JobRecord> {
        self.updates.subscribe()
    }

    pub fn queue_depth(&self) -> usize {
        self.scheduler.len()
    }

    /// Stops taking new work, lets running jobs finish and flushes their
    /// outcomes. Jobs still queued stay `Accepted` for the next start.
    pub async fn shutdown(self) -> Result<(), JoinError> {
        self.worker_token.cancel();
        futures::future::join_all(self.workers)
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;

        self.notifier_token.cancel();
        self.notifier.await?;

        info!("Server stopped.");
        Ok(())
    }
}

/// Startup policy for records left behind by a previous run.
///
/// A `Processing` job lost its backend process with the old server, so it
/// is marked failed. `Accepted` jobs never started and are queued again in
/// submission order.
async fn recover(store: &DbHandle, scheduler: &Scheduler, handles: &Handles) -> Result<()> {
    for mut job in store.list_by_status(Status::Processing).await? {
        warn!(job_id = %job.id, "Job interrupted by restart, marking failed");
        job.fail("interrupted by restart".into())?;
        store.put(&job).await?;
    }

    let accepted = store.list_by_status(Status::Accepted).await?;
    if !accepted.is_empty() {
        info!(count = accepted.len(), "Re-enqueueing accepted jobs");
    }
    for job in &accepted {
        enqueue(scheduler, handles, job);
    }
    Ok(())
}

fn enqueue(scheduler: &Scheduler, handles: &Handles, job: &JobRecord) {
    // Held across schedule so the notifier cannot release the handle before
    // it is registered.
    let mut handles = handles.lock();
    let handle = scheduler.schedule(
        job.id,
        job.input_location.clone(),
        job.backend.clone(),
        job.preset.clone(),
    );
    handles.insert(job.id, handle);
}

fn mesh_extension(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    MESH_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}
