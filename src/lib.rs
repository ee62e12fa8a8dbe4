use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

pub mod backend;
pub mod db;
pub mod error;
pub mod notifier;
pub mod queue;
pub mod server;
pub mod telemetry;
pub mod worker;

pub use error::{Error, Result};

/// Where a submitted mesh comes from.
#[derive(Debug, Clone)]
pub enum Mesh {
    /// Uploaded content. `name` is only used for its extension.
    Bytes { name: String, data: Vec<u8> },
    /// A local path (optionally `file://`) or an `http(s)://` URL.
    Reference(String),
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: Uuid,
    pub status: Status,
    pub progress: f64,
    pub url: String,
    #[serde(skip)]
    pub input_location: String,
    pub backend: String,
    pub preset: String,
    #[serde(skip)]
    pub output_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type, Serialize)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Accepted,
    Processing,
    Complete,
    Failed,
    Cancelled,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Complete | Status::Failed | Status::Cancelled)
    }

    /// Edges of the job state machine. Terminal states have none.
    pub fn can_transition_to(self, next: Status) -> bool {
        use Status::*;
        matches!(
            (self, next),
            (Accepted, Processing)
                | (Accepted, Cancelled)
                | (Processing, Complete)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Accepted => "accepted",
            Status::Processing => "processing",
            Status::Complete => "complete",
            Status::Failed => "failed",
            Status::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl JobRecord {
    pub fn new(
        id: Uuid,
        url: String,
        input_location: String,
        backend: String,
        preset: String,
    ) -> Self {
        let now = Utc::now();
        JobRecord {
            id,
            status: Status::Accepted,
            progress: 0.0,
            url,
            input_location,
            backend,
            preset,
            output_path: None,
            output_url: None,
            error_detail: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn transition(&mut self, next: Status) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::Transition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn begin(&mut self) -> Result<()> {
        self.transition(Status::Processing)?;
        self.progress = 0.0;
        Ok(())
    }

    /// Records backend-reported progress. Values are clamped to `[0, 1]` and
    /// anything lower than the current progress is ignored.
    pub fn set_progress(&mut self, progress: f64) -> Result<()> {
        if self.status != Status::Processing {
            return Err(Error::Transition {
                from: self.status,
                to: Status::Processing,
            });
        }
        if progress.is_nan() {
            return Ok(());
        }
        let progress = progress.clamp(0.0, 1.0);
        if progress > self.progress {
            self.progress = progress;
            self.updated_at = Utc::now();
        }
        Ok(())
    }

    pub fn complete(&mut self, output_path: String, output_url: String) -> Result<()> {
        self.transition(Status::Complete)?;
        self.progress = 1.0;
        self.output_path = Some(output_path);
        self.output_url = Some(output_url);
        Ok(())
    }

    pub fn fail(&mut self, detail: String) -> Result<()> {
        self.transition(Status::Failed)?;
        self.error_detail = Some(detail);
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<()> {
        self.transition(Status::Cancelled)
    }
}
