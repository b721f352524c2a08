use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::task::JoinError;

use crate::job::{Job, JobType};
use crate::retry::error_code;

/// Structured error returned from a handler: an optional machine-readable
/// code plus a human-readable message. Renders as `CODE: message` so the
/// retry engine can classify it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub code: Option<String>,
    pub message: String,
}

impl HandlerError {
    pub fn coded(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    pub fn msg(message: impl Into<String>) -> Self {
        let message = message.into();
        match error_code(&message) {
            // Peel an embedded `CODE:` prefix so the code survives as data.
            Some(code) => {
                let code = code.to_string();
                let rest = message
                    .split_once(':')
                    .map(|(_, m)| m.trim().to_string())
                    .unwrap_or_default();
                Self {
                    code: Some(code),
                    message: rest,
                }
            }
            None => Self {
                code: None,
                message,
            },
        }
    }

    /// Malformed payload reaching a handler is a programming error, never
    /// worth retrying.
    pub fn invalid_payload(err: impl fmt::Display) -> Self {
        Self::coded("INVALID_PAYLOAD", err.to_string())
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{}: {}", code, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_payload(err)
    }
}

/// Error type for one dispatch of a job
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("No handler registered for job type: {0}")]
    HandlerNotFound(JobType),

    #[error("{0}")]
    Execution(HandlerError),
}

/// A job the handler wants enqueued after its own success is recorded.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: JobType,
    pub payload: Value,
    pub priority: i32,
}

impl NewJob {
    pub fn new(job_type: JobType, payload: Value) -> Self {
        Self {
            job_type,
            payload,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// What a handler hands back on success: its result value plus any
/// follow-on pipeline jobs. Chaining is explicit here rather than a side
/// effect inside the handler, so handlers stay pure with respect to the
/// queue.
#[derive(Debug, Clone, Default)]
pub struct HandlerOutcome {
    pub result: Value,
    pub next_jobs: Vec<NewJob>,
}

impl HandlerOutcome {
    pub fn of(result: Value) -> Self {
        Self {
            result,
            next_jobs: Vec::new(),
        }
    }

    pub fn then(mut self, job: NewJob) -> Self {
        self.next_jobs.push(job);
        self
    }
}

pub type HandlerResult = Result<HandlerOutcome, HandlerError>;

pub type BoxedHandler =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = HandlerResult> + Send>> + Send + Sync>;

/// Registry mapping job types to their handlers
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<JobType, BoxedHandler>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler for a job type. Registering twice overwrites.
    pub fn register<F, Fut>(&self, job_type: JobType, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let boxed: BoxedHandler = Arc::new(move |payload: Value| Box::pin(handler(payload)));
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.insert(job_type, boxed);
    }

    /// Execute a job using its registered handler
    pub async fn execute(&self, job: &Job) -> Result<HandlerOutcome, JobError> {
        let handler = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            handlers
                .get(&job.job_type)
                .cloned()
                .ok_or(JobError::HandlerNotFound(job.job_type))?
        };

        let future = handler(job.payload.clone());
        let handle = tokio::spawn(async move { future.await });

        let join_to_error = |e: JoinError| {
            if e.is_panic() {
                JobError::Execution(HandlerError::coded("HANDLER_PANIC", "Handler panicked"))
            } else {
                JobError::Execution(HandlerError::coded("HANDLER_CANCELLED", "Handler cancelled"))
            }
        };

        handle
            .await
            .map_err(join_to_error)?
            .map_err(JobError::Execution)
    }

    /// Check if a handler is registered for a job type
    pub fn has_handler(&self, job_type: JobType) -> bool {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.contains_key(&job_type)
    }

    /// Get the list of registered job types
    pub fn job_types(&self) -> Vec<JobType> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.keys().copied().collect()
    }
}
