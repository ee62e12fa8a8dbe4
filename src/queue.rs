//! In-memory pending list shared by producers and worker consumers.
//!
//! [`JobQueue::new`] hands back the two halves: a [`Scheduler`] for
//! submission and cancellation, and a [`Consumer`] for workers. Items are
//! delivered FIFO and each to exactly one consumer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc::UnboundedSender, oneshot, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::worker::{Outcome, WorkMessage};

/// Everything a worker needs to run one job.
#[derive(Debug)]
pub struct WorkItem {
    pub id: Uuid,
    pub input_location: String,
    pub backend: String,
    pub preset: String,
    /// Fires if the job is cancelled after it was handed to a worker.
    pub cancel: oneshot::Receiver<()>,
    pub reporter: Reporter,
}

/// Sends a job's lifecycle events to the notifier.
///
/// [`Reporter::finish`] consumes the reporter, so a job can only report one
/// outcome. A reporter dropped without finishing reports a failure.
#[derive(Debug)]
pub struct Reporter {
    id: Uuid,
    events: Option<UnboundedSender<WorkMessage>>,
}

impl Reporter {
    fn new(id: Uuid, events: UnboundedSender<WorkMessage>) -> Self {
        Reporter {
            id,
            events: Some(events),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn started(&self) {
        self.send(WorkMessage::JobStarted(self.id));
    }

    pub fn progress(&self) -> Progress {
        Progress {
            id: self.id,
            events: self.events.clone(),
        }
    }

    pub fn finish(mut self, outcome: Outcome) {
        if let Some(events) = self.events.take() {
            if events.send(WorkMessage::JobFinished(self.id, outcome)).is_err() {
                warn!(job_id = %self.id, "Notifier is gone, outcome dropped");
            }
        }
    }

    fn send(&self, msg: WorkMessage) {
        if let Some(events) = &self.events {
            if events.send(msg).is_err() {
                warn!(job_id = %self.id, "Notifier is gone, event dropped");
            }
        }
    }
}

impl Drop for Reporter {
    fn drop(&mut self) {
        if let Some(events) = self.events.take() {
            warn!(job_id = %self.id, "Job dropped without an outcome");
            let _ = events.send(WorkMessage::JobFinished(
                self.id,
                Outcome::Failed("worker terminated without reporting an outcome".into()),
            ));
        }
    }
}

/// Progress sink for a running job.
#[derive(Debug, Clone)]
pub struct Progress {
    id: Uuid,
    events: Option<UnboundedSender<WorkMessage>>,
}

impl Progress {
    pub(crate) fn new(id: Uuid, events: UnboundedSender<WorkMessage>) -> Self {
        Progress {
            id,
            events: Some(events),
        }
    }

    pub fn report(&self, fraction: f64) {
        if let Some(events) = &self.events {
            let _ = events.send(WorkMessage::JobProgress(self.id, fraction));
        }
    }
}

struct Shared {
    pending: Mutex<VecDeque<WorkItem>>,
    available: Notify,
    events: UnboundedSender<WorkMessage>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, VecDeque<WorkItem>> {
        // The list stays consistent even if a holder panicked: every
        // critical section is a single push, pop or remove.
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct JobQueue;

impl JobQueue {
    /// Creates an empty queue. Terminal events for jobs cancelled before
    /// dequeue, and every event sent by a [`Reporter`], go to `events`.
    pub fn new(events: UnboundedSender<WorkMessage>) -> (Scheduler, Consumer) {
        let shared = Arc::new(Shared {
            pending: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            events,
        });
        (
            Scheduler {
                shared: shared.clone(),
            },
            Consumer { shared },
        )
    }
}

#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn schedule(
        &self,
        id: Uuid,
        input_location: String,
        backend: String,
        preset: String,
    ) -> CancelHandle {
        let (signal, cancel) = oneshot::channel();
        let item = WorkItem {
            id,
            input_location,
            backend,
            preset,
            cancel,
            reporter: Reporter::new(id, self.shared.events.clone()),
        };

        let depth = {
            let mut pending = self.shared.pending();
            pending.push_back(item);
            pending.len()
        };
        self.shared.available.notify_one();
        debug!(job_id = %id, depth, "Scheduled job");

        CancelHandle {
            id,
            shared: self.shared.clone(),
            signal,
        }
    }

    pub fn len(&self) -> usize {
        self.shared.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone)]
pub struct Consumer {
    shared: Arc<Shared>,
}

impl Consumer {
    /// Waits until an item is pending and takes the oldest one.
    ///
    /// Cancel-safe: the pop happens synchronously, so dropping this future
    /// never loses an item.
    pub async fn next(&self) -> WorkItem {
        loop {
            let notified = self.shared.available.notified();
            if let Some(item) = self.try_next() {
                return item;
            }
            notified.await;
        }
    }

    pub fn try_next(&self) -> Option<WorkItem> {
        let (item, more) = {
            let mut pending = self.shared.pending();
            let item = pending.pop_front();
            (item, !pending.is_empty())
        };
        if item.is_some() && more {
            // Pass the wakeup on so idle consumers drain a batch.
            self.shared.available.notify_one();
        }
        item
    }
}

/// Requests cancellation of one scheduled job.
#[derive(Debug)]
pub struct CancelHandle {
    id: Uuid,
    shared: Arc<Shared>,
    signal: oneshot::Sender<()>,
}

/// What [`CancelHandle::cancel`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cancelled {
    /// The job was still pending and will never reach a worker.
    Dequeued,
    /// The job's worker was signalled.
    Signalled,
    /// The job had already finished.
    Finished,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared").finish_non_exhaustive()
    }
}

impl CancelHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cancel(self) -> Cancelled {
        let removed = {
            let mut pending = self.shared.pending();
            pending
                .iter()
                .position(|item| item.id == self.id)
                .and_then(|idx| pending.remove(idx))
        };

        if let Some(item) = removed {
            debug!(job_id = %self.id, "Cancelled pending job");
            item.reporter.finish(Outcome::Cancelled);
            return Cancelled::Dequeued;
        }

        match self.signal.send(()) {
            Ok(()) => {
                debug!(job_id = %self.id, "Signalled running job");
                Cancelled::Signalled
            }
            Err(()) => Cancelled::Finished,
        }
    }
}
