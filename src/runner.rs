use std::sync::{Arc, Mutex, RwLock};

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collaborators::{
    Deployer, Discovery, EmailSender, LeadStore, SiteAuditor, ThemeManifest, ThemeStudio,
};
use crate::config::{PipelineConfig, PipelineConfigPatch};
use crate::handler::{HandlerError, HandlerOutcome, HandlerResult, NewJob};
use crate::job::{DrainOutcome, JobType, QueueStats};
use crate::queue::{EnqueueOpts, JobQueue, QueueError};

/// Leads are followed up this long after the first outreach email.
const FOLLOW_UP_AFTER_DAYS: i64 = 3;

/// The external services each pipeline stage talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub discovery: Arc<dyn Discovery>,
    pub auditor: Arc<dyn SiteAuditor>,
    pub themes: Arc<dyn ThemeStudio>,
    pub deployer: Arc<dyn Deployer>,
    pub leads: Arc<dyn LeadStore>,
    pub email: Arc<dyn EmailSender>,
}

/// Date-keyed lead/email counters, reset on UTC day rollover.
#[derive(Debug)]
struct DayBudgets {
    day: NaiveDate,
    leads_saved: u32,
    emails_sent: u32,
}

impl DayBudgets {
    fn new() -> Self {
        Self {
            day: Utc::now().date_naive(),
            leads_saved: 0,
            emails_sent: 0,
        }
    }

    fn roll(&mut self) {
        let today = Utc::now().date_naive();
        if today != self.day {
            self.day = today;
            self.leads_saved = 0;
            self.emails_sent = 0;
        }
    }

    fn try_take_lead(&mut self, max: u32) -> bool {
        self.roll();
        if self.leads_saved < max {
            self.leads_saved += 1;
            true
        } else {
            false
        }
    }

    /// Reserve one email slot. The slot is taken before the send happens,
    /// so concurrent email jobs race on the reservation, not on the send.
    fn try_take_email(&mut self, max: u32) -> bool {
        self.roll();
        if self.emails_sent < max {
            self.emails_sent += 1;
            true
        } else {
            false
        }
    }

    /// Give a reserved slot back when no email actually went out.
    fn refund_email(&mut self) {
        self.emails_sent = self.emails_sent.saturating_sub(1);
    }
}

/// Everything a stage handler needs, cloned into each registered closure.
#[derive(Clone)]
struct HandlerCtx {
    collab: Collaborators,
    config: Arc<RwLock<PipelineConfig>>,
    budgets: Arc<Mutex<DayBudgets>>,
}

impl HandlerCtx {
    fn config(&self) -> PipelineConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn try_take_email(&self, max: u32) -> bool {
        let mut budgets = self.budgets.lock().unwrap_or_else(|e| e.into_inner());
        budgets.try_take_email(max)
    }

    fn refund_email(&self) {
        let mut budgets = self.budgets.lock().unwrap_or_else(|e| e.into_inner());
        budgets.refund_email();
    }
}

struct SchedulerState {
    shutdown: CancellationToken,
    timers: Vec<JoinHandle<()>>,
}

/// Snapshot returned by `runner_status`.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerStatus {
    pub config: PipelineConfig,
    pub queue_stats: QueueStats,
    pub is_running: bool,
}

/// Wires job types to collaborators, chains pipeline stages through
/// priorities, and drives the periodic discovery and follow-up sweeps.
pub struct PipelineRunner {
    queue: Arc<JobQueue>,
    config: Arc<RwLock<PipelineConfig>>,
    ctx: HandlerCtx,
    scheduler: Mutex<Option<SchedulerState>>,
}

impl PipelineRunner {
    pub fn new(queue: Arc<JobQueue>, collab: Collaborators) -> Self {
        let config = Arc::new(RwLock::new(PipelineConfig::default()));
        let ctx = HandlerCtx {
            collab,
            config: Arc::clone(&config),
            budgets: Arc::new(Mutex::new(DayBudgets::new())),
        };
        Self {
            queue,
            config,
            ctx,
            scheduler: Mutex::new(None),
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Merge a partial config into the active one.
    pub fn configure(&self, patch: PipelineConfigPatch) {
        let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
        config.apply(patch);
        debug!(?config, "Pipeline configured");
    }

    pub fn config(&self) -> PipelineConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Bind every pipeline stage's handler on the queue. Must run before
    /// anything is enqueued.
    pub fn register_handlers(&self) {
        let handlers = self.queue.handlers();

        let ctx = self.ctx.clone();
        handlers.register(JobType::Discover, move |payload| {
            let ctx = ctx.clone();
            async move { discover_job(ctx, payload).await }
        });

        let ctx = self.ctx.clone();
        handlers.register(JobType::Capture, move |payload| {
            let ctx = ctx.clone();
            async move { capture_job(ctx, payload).await }
        });

        let ctx = self.ctx.clone();
        handlers.register(JobType::Score, move |payload| {
            let ctx = ctx.clone();
            async move { score_job(ctx, payload).await }
        });

        let ctx = self.ctx.clone();
        handlers.register(JobType::Generate, move |payload| {
            let ctx = ctx.clone();
            async move { generate_job(ctx, payload).await }
        });

        let ctx = self.ctx.clone();
        handlers.register(JobType::Deploy, move |payload| {
            let ctx = ctx.clone();
            async move { deploy_job(ctx, payload).await }
        });

        let ctx = self.ctx.clone();
        handlers.register(JobType::Email, move |payload| {
            let ctx = ctx.clone();
            async move { email_job(ctx, payload).await }
        });

        let ctx = self.ctx.clone();
        handlers.register(JobType::Followup, move |payload| {
            let ctx = ctx.clone();
            async move { followup_job(ctx, payload).await }
        });
    }

    /// Seed one discovery run and drain the pipeline to completion.
    pub async fn run_discovery(&self, query: &str) -> Result<DrainOutcome, QueueError> {
        self.queue
            .enqueue(JobType::Discover, json!({ "query": query }), EnqueueOpts::default())?;
        Ok(self.queue.process_all().await)
    }

    /// Start the queue workers and arm the periodic sweeps. Starting twice
    /// does not double-arm the timers.
    pub fn start_scheduler(&self) {
        let mut scheduler = self.scheduler.lock().unwrap_or_else(|e| e.into_inner());
        if scheduler.is_some() {
            return;
        }

        self.queue.start();

        let shutdown = CancellationToken::new();
        let timers = vec![
            self.spawn_discovery_sweep(shutdown.clone()),
            self.spawn_followup_sweep(shutdown.clone()),
        ];

        *scheduler = Some(SchedulerState { shutdown, timers });
        info!("Pipeline scheduler started");
    }

    /// Cancel the sweeps and stop the queue. Safe to call when nothing is
    /// running; in-flight handlers finish their current attempt.
    pub async fn stop_scheduler(&self) {
        let state = {
            let mut scheduler = self.scheduler.lock().unwrap_or_else(|e| e.into_inner());
            scheduler.take()
        };

        let Some(state) = state else { return };
        state.shutdown.cancel();
        for timer in state.timers {
            let _ = timer.await;
        }
        self.queue.stop().await;
        info!("Pipeline scheduler stopped");
    }

    pub fn runner_status(&self) -> RunnerStatus {
        let is_running = self
            .scheduler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some();
        RunnerStatus {
            config: self.config(),
            queue_stats: self.queue.get_stats(),
            is_running,
        }
    }

    fn spawn_discovery_sweep(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let config = Arc::clone(&self.config);

        tokio::spawn(async move {
            loop {
                let period = config
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .discovery_schedule;
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }

                let queries = config
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .discovery_queries
                    .clone();
                if queries.is_empty() {
                    debug!("Discovery sweep skipped, no queries configured");
                    continue;
                }

                for query in &queries {
                    if let Err(e) =
                        queue.enqueue(JobType::Discover, json!({ "query": query }), EnqueueOpts::default())
                    {
                        error!(query = %query, error = %e, "Failed to enqueue discovery job");
                    }
                }
                info!(queries = queries.len(), "Discovery sweep enqueued");
            }
        })
    }

    fn spawn_followup_sweep(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let config = Arc::clone(&self.config);

        tokio::spawn(async move {
            loop {
                let period = config
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .follow_up_schedule;
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }

                if let Err(e) = queue.enqueue(JobType::Followup, json!({}), EnqueueOpts::default()) {
                    error!(error = %e, "Failed to enqueue follow-up job");
                } else {
                    info!("Follow-up sweep enqueued");
                }
            }
        })
    }
}

#[derive(Debug, Deserialize)]
struct DiscoverPayload {
    query: String,
}

#[derive(Debug, Deserialize)]
struct CapturePayload {
    url: String,
}

#[derive(Debug, Deserialize)]
struct LeadPayload {
    lead_id: String,
}

#[derive(Debug, Deserialize)]
struct DeployPayload {
    lead_id: String,
    directory: String,
}

fn lead_not_found(lead_id: &str) -> HandlerError {
    HandlerError::coded("INVALID_INPUT", format!("lead {} not found", lead_id))
}

/// Discovery stage: save qualifying leads, then fan out one generate job
/// per saved lead when auto-deploy is on.
async fn discover_job(ctx: HandlerCtx, payload: Value) -> HandlerResult {
    let p: DiscoverPayload = serde_json::from_value(payload)?;
    let cfg = ctx.config();

    let found = ctx
        .collab
        .discovery
        .discover(&p.query, cfg.leads_per_query, cfg.score_threshold)
        .await?;
    let leads_found = found.len();

    let mut saved = Vec::new();
    for lead in found {
        if ctx.collab.leads.get_by_url(&lead.url).await?.is_some() {
            debug!(url = %lead.url, "Lead already known, skipping");
            continue;
        }
        let budget_ok = {
            let mut budgets = ctx.budgets.lock().unwrap_or_else(|e| e.into_inner());
            budgets.try_take_lead(cfg.max_leads_per_day)
        };
        if !budget_ok {
            warn!(query = %p.query, "Daily lead budget exhausted, dropping remainder");
            break;
        }
        let lead = ctx.collab.leads.create(lead).await?;
        info!(lead_id = %lead.id, url = %lead.url, "Lead saved");
        saved.push(lead);
    }

    let mut outcome = HandlerOutcome::of(json!({
        "query": p.query,
        "leads_found": leads_found,
        "leads_saved": saved.len(),
    }));

    if cfg.auto_deploy {
        for lead in &saved {
            outcome = outcome.then(
                NewJob::new(JobType::Generate, json!({ "lead_id": lead.id })).with_priority(1),
            );
        }
    }

    Ok(outcome)
}

/// Capture stage: snapshot a site, score it, and record the score when the
/// URL belongs to a known lead.
async fn capture_job(ctx: HandlerCtx, payload: Value) -> HandlerResult {
    let p: CapturePayload = serde_json::from_value(payload)?;

    let screenshot = ctx.collab.auditor.capture(&p.url).await?;
    let score = ctx.collab.auditor.score(&p.url).await?;

    if let Some(lead) = ctx.collab.leads.get_by_url(&p.url).await? {
        ctx.collab.leads.set_score(&lead.id, score).await?;
    }

    Ok(HandlerOutcome::of(json!({
        "url": p.url,
        "screenshot": screenshot,
        "score": score,
    })))
}

/// Score stage: re-audit a known lead's site.
async fn score_job(ctx: HandlerCtx, payload: Value) -> HandlerResult {
    let p: LeadPayload = serde_json::from_value(payload)?;

    let lead = ctx
        .collab
        .leads
        .get(&p.lead_id)
        .await?
        .ok_or_else(|| lead_not_found(&p.lead_id))?;

    let score = ctx.collab.auditor.score(&lead.url).await?;
    ctx.collab.leads.set_score(&lead.id, score).await?;

    Ok(HandlerOutcome::of(json!({
        "lead_id": lead.id,
        "score": score,
    })))
}

/// Generate stage: themed mockups into a gallery directory, then chain the
/// deploy.
async fn generate_job(ctx: HandlerCtx, payload: Value) -> HandlerResult {
    let p: LeadPayload = serde_json::from_value(payload)?;
    let cfg = ctx.config();

    let lead = ctx
        .collab
        .leads
        .get(&p.lead_id)
        .await?
        .ok_or_else(|| lead_not_found(&p.lead_id))?;

    let manifest = ThemeManifest {
        lead_id: lead.id.clone(),
        business_name: lead.business_name.clone(),
        url: lead.url.clone(),
        score: lead.score,
    };
    let gallery = ctx.collab.themes.generate(&manifest).await?;
    info!(lead_id = %lead.id, themes = gallery.themes.len(), "Gallery generated");

    let mut outcome = HandlerOutcome::of(json!({
        "lead_id": lead.id,
        "directory": gallery.directory,
        "themes": gallery.themes.len(),
    }));

    if cfg.auto_deploy {
        outcome = outcome.then(
            NewJob::new(
                JobType::Deploy,
                json!({ "lead_id": lead.id, "directory": gallery.directory }),
            )
            .with_priority(2),
        );
    }

    Ok(outcome)
}

/// Deploy stage: publish the gallery, store the preview URL, then chain the
/// outreach email when auto-email is opted in.
async fn deploy_job(ctx: HandlerCtx, payload: Value) -> HandlerResult {
    let p: DeployPayload = serde_json::from_value(payload)?;
    let cfg = ctx.config();

    let deployed = ctx.collab.deployer.deploy(&p.directory).await?;
    if !deployed.success {
        let reason = deployed.error.unwrap_or_else(|| "deploy failed".to_string());
        return Err(HandlerError::msg(reason));
    }
    let url = deployed
        .url
        .ok_or_else(|| HandlerError::msg("deploy reported success without a url"))?;

    ctx.collab.leads.set_preview_url(&p.lead_id, &url).await?;
    info!(lead_id = %p.lead_id, url = %url, "Preview deployed");

    let mut outcome = HandlerOutcome::of(json!({
        "lead_id": p.lead_id,
        "url": url,
    }));

    if cfg.auto_email {
        outcome = outcome
            .then(NewJob::new(JobType::Email, json!({ "lead_id": p.lead_id })).with_priority(3));
    }

    Ok(outcome)
}

/// Email stage: first outreach with the preview link. Terminal. The daily
/// budget slot is reserved up front and refunded if nothing was sent, so
/// two email jobs running concurrently cannot both squeeze past the cap.
async fn email_job(ctx: HandlerCtx, payload: Value) -> HandlerResult {
    let p: LeadPayload = serde_json::from_value(payload)?;
    let cfg = ctx.config();

    if !ctx.try_take_email(cfg.max_emails_per_day) {
        warn!(lead_id = %p.lead_id, "Daily email budget exhausted, skipping send");
        return Ok(HandlerOutcome::of(json!({
            "lead_id": p.lead_id,
            "sent": false,
            "skipped": "daily email limit reached",
        })));
    }

    let result = send_preview_email(&ctx, &p.lead_id).await;
    if result.is_err() {
        ctx.refund_email();
    }
    result
}

async fn send_preview_email(ctx: &HandlerCtx, lead_id: &str) -> HandlerResult {
    let lead = ctx
        .collab
        .leads
        .get(lead_id)
        .await?
        .ok_or_else(|| lead_not_found(lead_id))?;

    if lead.email.is_none() {
        return Err(HandlerError::coded(
            "INVALID_RECIPIENT",
            format!("lead {} has no email address", lead.id),
        ));
    }
    let preview_url = lead.preview_url.clone().ok_or_else(|| {
        HandlerError::coded("INVALID_INPUT", format!("lead {} has no preview url", lead.id))
    })?;

    let sent = ctx
        .collab
        .email
        .send_preview(&lead, &preview_url, lead.score)
        .await?;
    if !sent.success {
        let reason = sent.error.unwrap_or_else(|| "email send failed".to_string());
        return Err(HandlerError::msg(reason));
    }

    // The email is out. A store error past this point is logged, not
    // propagated: failing the job now would retry it into a resend.
    if let Err(e) = ctx.collab.leads.mark_emailed(&lead.id, Utc::now()).await {
        warn!(lead_id = %lead.id, error = %e, "Email sent but lead not marked as emailed");
    }
    info!(lead_id = %lead.id, message_id = ?sent.message_id, "Outreach email sent");

    Ok(HandlerOutcome::of(json!({
        "lead_id": lead.id,
        "sent": true,
        "message_id": sent.message_id,
    })))
}

/// Follow-up stage: one sweep over leads emailed a while ago. Individual
/// send failures are logged and counted rather than failing the sweep.
async fn followup_job(ctx: HandlerCtx, _payload: Value) -> HandlerResult {
    let cfg = ctx.config();
    let cutoff = Utc::now() - chrono::Duration::days(FOLLOW_UP_AFTER_DAYS);

    let candidates = ctx.collab.leads.followup_candidates(cutoff).await?;
    let total = candidates.len();
    let mut sent = 0usize;
    let mut failed = 0usize;

    for lead in candidates {
        if !ctx.try_take_email(cfg.max_emails_per_day) {
            warn!("Daily email budget exhausted, stopping follow-up sweep");
            break;
        }

        match ctx.collab.email.send_followup(&lead).await {
            Ok(outcome) if outcome.success => {
                // A store error after a delivered send is counted, not
                // propagated: failing the sweep would retry it and resend
                // every follow-up already delivered.
                match ctx.collab.leads.mark_emailed(&lead.id, Utc::now()).await {
                    Ok(()) => sent += 1,
                    Err(e) => {
                        warn!(lead_id = %lead.id, error = %e, "Follow-up sent but lead not marked");
                        failed += 1;
                    }
                }
            }
            Ok(outcome) => {
                ctx.refund_email();
                warn!(lead_id = %lead.id, error = ?outcome.error, "Follow-up send rejected");
                failed += 1;
            }
            Err(e) => {
                ctx.refund_email();
                warn!(lead_id = %lead.id, error = %e, "Follow-up send errored");
                failed += 1;
            }
        }
    }

    Ok(HandlerOutcome::of(json!({
        "candidates": total,
        "sent": sent,
        "failed": failed,
    })))
}
