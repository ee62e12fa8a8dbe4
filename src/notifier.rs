//! Persists worker events and wakes anyone waiting on a job.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

use crate::db::DbHandle;
use crate::queue::CancelHandle;
use crate::worker::{Outcome, WorkMessage};
use crate::{Error, JobRecord, Result, Status};

const STORE_ATTEMPTS: u32 = 3;

/// Cancel handles of jobs that have not reached a terminal state yet.
#[derive(Clone, Default)]
pub struct Handles {
    inner: Arc<Mutex<HashMap<Uuid, CancelHandle>>>,
}

impl Handles {
    pub fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, CancelHandle>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn take(&self, id: Uuid) -> Option<CancelHandle> {
        self.lock().remove(&id)
    }
}

pub struct Notifier {
    store: DbHandle,
    handles: Handles,
    updates: broadcast::Sender<JobRecord>,
    base_url: String,
}

impl Notifier {
    pub fn new(
        store: DbHandle,
        handles: Handles,
        updates: broadcast::Sender<JobRecord>,
        base_url: String,
    ) -> Self {
        Notifier {
            store,
            handles,
            updates,
            base_url,
        }
    }

    /// Handles worker events until `stop_token` fires or every sender is
    /// gone, then drains whatever is already queued.
    pub async fn run(
        self,
        stop_token: CancellationToken,
        mut recv_from_worker: mpsc::UnboundedReceiver<WorkMessage>,
    ) {
        loop {
            tokio::select! {
                _ = stop_token.cancelled() => {
                    debug!("Notifier Cancelled");
                    break;
                },
                chan_msg = recv_from_worker.recv() => {
                    match chan_msg {
                        None => {
                            debug!("Worker channel closed, exiting");
                            break;
                        },
                        Some(msg) => self.handle(msg).await,
                    }
                }
            }
        }

        while let Ok(msg) = recv_from_worker.try_recv() {
            self.handle(msg).await;
        }
        info!("Notifier stopped.");
    }

    pub async fn handle(&self, msg: WorkMessage) {
        match msg {
            WorkMessage::JobStarted(job_id) => {
                debug!(message = "Starting job", job_id = %job_id);
                self.update(job_id, |job| job.begin()).await;
            }
            WorkMessage::JobProgress(job_id, fraction) => {
                trace!(message = "Job progress", job_id = %job_id, fraction);
                self.update(job_id, |job| job.set_progress(fraction)).await;
            }
            WorkMessage::JobFinished(job_id, outcome) => {
                info!(message = "Job finished", job_id = %job_id, outcome = %outcome);
                self.handles.take(job_id);
                let output_url = format!("{}/gcodes/{}", self.base_url, job_id);
                self.update(job_id, |job| {
                    if job.status == Status::Accepted && outcome != Outcome::Cancelled {
                        // The start was never persisted, but the job did run.
                        job.begin()?;
                    }
                    match &outcome {
                        Outcome::Completed(path) => {
                            job.complete(path.display().to_string(), output_url.clone())
                        }
                        Outcome::Failed(detail) => job.fail(detail.clone()),
                        Outcome::Cancelled => job.cancel(),
                    }
                })
                .await;
            }
        }
    }

    /// Applies one transition to the stored record. Failures are logged
    /// and stay with this job.
    async fn update<F>(&self, job_id: Uuid, apply: F)
    where
        F: Fn(&mut JobRecord) -> Result<()>,
    {
        for attempt in 1..=STORE_ATTEMPTS {
            match self.try_update(job_id, &apply).await {
                Ok(record) => {
                    // Nobody listening is fine.
                    let _ = self.updates.send(record);
                    return;
                }
                Err(err @ (Error::Transition { .. } | Error::NotFound(_))) => {
                    warn!(message = "Dropping job event", job_id = %job_id, error = %err);
                    return;
                }
                Err(err) if attempt < STORE_ATTEMPTS => {
                    warn!(message = "Store update failed, retrying", job_id = %job_id, attempt, error = %err);
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                }
                Err(err) => {
                    error!(message = "Store update failed", job_id = %job_id, error = %err);
                }
            }
        }
    }

    async fn try_update<F>(&self, job_id: Uuid, apply: &F) -> Result<JobRecord>
    where
        F: Fn(&mut JobRecord) -> Result<()>,
    {
        let mut record = self.store.get(job_id).await?;
        apply(&mut record)?;
        self.store.put(&record).await?;
        Ok(record)
    }
}
