mod alert;
mod clock;
mod collaborators;
mod config;
mod handler;
mod job;
mod queue;
mod retry;
mod runner;

pub use alert::{AlertSink, LogAlertSink, Severity};
pub use clock::{Clock, ManualClock, SystemClock};
pub use collaborators::{
    DeployOutcome, Deployer, Discovery, EmailOutcome, EmailSender, GalleryOutput, Lead, LeadStore,
    SiteAuditor, ThemeManifest, ThemeStudio,
};
pub use config::{PipelineConfig, PipelineConfigPatch};
pub use handler::{
    BoxedHandler, HandlerError, HandlerOutcome, HandlerRegistry, HandlerResult, JobError, NewJob,
};
pub use job::{DrainOutcome, Job, JobId, JobStatus, JobType, QueueStats};
pub use queue::{EnqueueOpts, JobQueue, QueueConfig, QueueError};
pub use retry::{
    backoff_delay_ms, calculate_retry_delay, error_code, policy_for, should_retry, Backoff,
    RetryContext, RetryDecision, RetryPolicy, DEFAULT_POLICY,
};
pub use runner::{Collaborators, PipelineRunner, RunnerStatus};
