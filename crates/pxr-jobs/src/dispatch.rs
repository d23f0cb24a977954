//! Handler registry and the outcome vocabulary handlers speak.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use pxr_db::JobRow;

/// How a handler finished without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Normal completion; the executor transitions the job to `completed`.
    Completed,
    /// The handler already released the job's lock itself (e.g. a run batch
    /// re-queued the job); the executor must not touch the row.
    LockReleased,
}

/// Handler failure classification. The executor pattern-matches this into
/// job-store transitions; see the state machine in `pxr_db::jobs`.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Will never succeed; straight to the deadletter queue.
    #[error("permanent: {0}")]
    Permanent(String),
    /// Known-unavailable until `run_after`; re-queue without consuming an
    /// attempt.
    #[error("defer until {run_after}: {msg}")]
    Defer { msg: String, run_after: String },
    /// Might succeed later; consume an attempt and back off.
    #[error("recoverable: {0}")]
    Recoverable(String),
}

impl HandlerError {
    pub fn permanent(msg: impl Into<String>) -> Self {
        HandlerError::Permanent(msg.into())
    }

    pub fn defer(msg: impl Into<String>, run_after: impl Into<String>) -> Self {
        HandlerError::Defer {
            msg: msg.into(),
            run_after: run_after.into(),
        }
    }

    pub fn recoverable(msg: impl Into<String>) -> Self {
        HandlerError::Recoverable(msg.into())
    }
}

impl From<anyhow::Error> for HandlerError {
    /// Unclassified errors (store failures, bugs) are retried.
    fn from(err: anyhow::Error) -> Self {
        HandlerError::Recoverable(format!("{err:#}"))
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: &JobRow) -> Result<HandlerOutcome, HandlerError>;
}

/// `type → handler` map. Unknown types are permanent errors so a typo'd
/// enqueue cannot spin forever.
#[derive(Default)]
pub struct JobDispatcher {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job_type: &str, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type.to_string(), handler);
    }

    pub fn handler_for(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub async fn dispatch(&self, job: &JobRow) -> Result<HandlerOutcome, HandlerError> {
        match self.handler_for(&job.job_type) {
            Some(handler) => handler.run(job).await,
            None => Err(HandlerError::permanent(format!(
                "no handler registered for job type '{}'",
                job.job_type
            ))),
        }
    }
}
