use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;

use repitch::{
    Collaborators, DeployOutcome, Deployer, Discovery, EmailOutcome, EmailSender, EnqueueOpts,
    GalleryOutput, HandlerError, HandlerOutcome, JobQueue, JobStatus, JobType, Lead, LeadStore,
    ManualClock, PipelineConfigPatch, PipelineRunner, QueueConfig, SiteAuditor, ThemeManifest,
    ThemeStudio,
};

// ---------------------------------------------------------------------------
// Mock collaborators
// ---------------------------------------------------------------------------

struct MockDiscovery {
    results: Vec<Lead>,
    calls: AtomicU32,
}

impl MockDiscovery {
    fn returning(results: Vec<Lead>) -> Arc<Self> {
        Arc::new(Self {
            results,
            calls: AtomicU32::new(0),
        })
    }

    fn empty() -> Arc<Self> {
        Self::returning(Vec::new())
    }
}

#[async_trait]
impl Discovery for MockDiscovery {
    async fn discover(
        &self,
        _query: &str,
        max_results: u32,
        _score_threshold: f64,
    ) -> Result<Vec<Lead>, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .results
            .iter()
            .take(max_results as usize)
            .cloned()
            .collect())
    }
}

struct MockAuditor;

#[async_trait]
impl SiteAuditor for MockAuditor {
    async fn capture(&self, url: &str) -> Result<String, HandlerError> {
        Ok(format!("captures/{}.png", url.len()))
    }

    async fn score(&self, _url: &str) -> Result<f64, HandlerError> {
        Ok(3.5)
    }
}

struct MockThemeStudio;

#[async_trait]
impl ThemeStudio for MockThemeStudio {
    async fn generate(&self, manifest: &ThemeManifest) -> Result<GalleryOutput, HandlerError> {
        Ok(GalleryOutput {
            directory: format!("galleries/{}", manifest.lead_id),
            themes: vec!["modern".into(), "bold".into()],
        })
    }
}

struct MockDeployer;

#[async_trait]
impl Deployer for MockDeployer {
    async fn deploy(&self, directory: &str) -> Result<DeployOutcome, HandlerError> {
        Ok(DeployOutcome {
            success: true,
            url: Some(format!("https://previews.test/{}", directory)),
            error: None,
        })
    }
}

#[derive(Default)]
struct MockLeadStore {
    leads: Mutex<HashMap<String, Lead>>,
    fail_mark_for: Mutex<Option<String>>,
}

impl MockLeadStore {
    fn all(&self) -> Vec<Lead> {
        self.leads.lock().unwrap().values().cloned().collect()
    }

    fn fail_mark_for(&self, id: &str) {
        *self.fail_mark_for.lock().unwrap() = Some(id.to_string());
    }
}

#[async_trait]
impl LeadStore for MockLeadStore {
    async fn get(&self, id: &str) -> Result<Option<Lead>, HandlerError> {
        Ok(self.leads.lock().unwrap().get(id).cloned())
    }

    async fn get_by_url(&self, url: &str) -> Result<Option<Lead>, HandlerError> {
        Ok(self
            .leads
            .lock()
            .unwrap()
            .values()
            .find(|l| l.url == url)
            .cloned())
    }

    async fn create(&self, lead: Lead) -> Result<Lead, HandlerError> {
        self.leads
            .lock()
            .unwrap()
            .insert(lead.id.clone(), lead.clone());
        Ok(lead)
    }

    async fn set_score(&self, id: &str, score: f64) -> Result<(), HandlerError> {
        if let Some(lead) = self.leads.lock().unwrap().get_mut(id) {
            lead.score = Some(score);
        }
        Ok(())
    }

    async fn set_preview_url(&self, id: &str, url: &str) -> Result<(), HandlerError> {
        if let Some(lead) = self.leads.lock().unwrap().get_mut(id) {
            lead.preview_url = Some(url.to_string());
        }
        Ok(())
    }

    async fn mark_emailed(&self, id: &str, at: DateTime<Utc>) -> Result<(), HandlerError> {
        if self.fail_mark_for.lock().unwrap().as_deref() == Some(id) {
            return Err(HandlerError::coded("STORE_UNAVAILABLE", "lead row locked"));
        }
        if let Some(lead) = self.leads.lock().unwrap().get_mut(id) {
            lead.emailed_at = Some(at);
        }
        Ok(())
    }

    async fn followup_candidates(&self, cutoff: DateTime<Utc>) -> Result<Vec<Lead>, HandlerError> {
        Ok(self
            .leads
            .lock()
            .unwrap()
            .values()
            .filter(|l| matches!(l.emailed_at, Some(at) if at <= cutoff))
            .cloned()
            .collect())
    }
}

#[derive(Default)]
struct MockEmailSender {
    sent: Mutex<Vec<String>>,
}

#[async_trait]
impl EmailSender for MockEmailSender {
    async fn send_preview(
        &self,
        lead: &Lead,
        _preview_url: &str,
        _score: Option<f64>,
    ) -> Result<EmailOutcome, HandlerError> {
        self.sent.lock().unwrap().push(lead.id.clone());
        Ok(EmailOutcome {
            success: true,
            message_id: Some(format!("msg-{}", lead.id)),
            error: None,
        })
    }

    async fn send_followup(&self, lead: &Lead) -> Result<EmailOutcome, HandlerError> {
        self.sent.lock().unwrap().push(format!("fu-{}", lead.id));
        Ok(EmailOutcome {
            success: true,
            message_id: None,
            error: None,
        })
    }
}

struct SlowEmailSender {
    sent: AtomicU32,
}

#[async_trait]
impl EmailSender for SlowEmailSender {
    async fn send_preview(
        &self,
        _lead: &Lead,
        _preview_url: &str,
        _score: Option<f64>,
    ) -> Result<EmailOutcome, HandlerError> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(EmailOutcome {
            success: true,
            message_id: None,
            error: None,
        })
    }

    async fn send_followup(&self, _lead: &Lead) -> Result<EmailOutcome, HandlerError> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(EmailOutcome {
            success: true,
            message_id: None,
            error: None,
        })
    }
}

struct TestHarness {
    queue: Arc<JobQueue>,
    runner: PipelineRunner,
    leads: Arc<MockLeadStore>,
    email: Arc<MockEmailSender>,
}

fn harness(discovery: Arc<MockDiscovery>) -> TestHarness {
    let queue = Arc::new(JobQueue::new());
    let leads = Arc::new(MockLeadStore::default());
    let email = Arc::new(MockEmailSender::default());
    let collab = Collaborators {
        discovery,
        auditor: Arc::new(MockAuditor),
        themes: Arc::new(MockThemeStudio),
        deployer: Arc::new(MockDeployer),
        leads: leads.clone(),
        email: email.clone(),
    };
    let runner = PipelineRunner::new(Arc::clone(&queue), collab);
    runner.register_handlers();
    TestHarness {
        queue,
        runner,
        leads,
        email,
    }
}

fn lead(name: &str, url: &str, score: f64) -> Lead {
    Lead::new(name, url)
        .with_email(format!("owner@{}", name))
        .with_score(score)
}

// ---------------------------------------------------------------------------
// Discovery fan-out and stage chaining
// ---------------------------------------------------------------------------

#[tokio::test]
async fn discovery_fans_out_one_generate_job_per_saved_lead() {
    let discovery = MockDiscovery::returning(vec![
        lead("Ajax Plumbing", "https://ajax.example", 2.0),
        lead("Budget Rooter", "https://rooter.example", 3.5),
        lead("Pipe Dreams", "https://pipes.example", 5.0),
    ]);
    let h = harness(discovery);

    let seed = h
        .queue
        .enqueue(
            JobType::Discover,
            json!({"query": "plumbers in Austin TX"}),
            EnqueueOpts::priority(0),
        )
        .unwrap();
    h.queue.process_all().await;

    let done = h.queue.job(&seed.id).unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    let result = done.result.unwrap();
    assert_eq!(result["leads_found"], 3);
    assert_eq!(result["leads_saved"], 3);

    let generates = h.queue.jobs_by_type(JobType::Generate);
    assert_eq!(generates.len(), 3);
    for job in &generates {
        assert_eq!(job.priority, 1);
        assert_eq!(job.status, JobStatus::Completed);
    }

    // auto_deploy chained deploys at priority 2; auto_email defaults off.
    let deploys = h.queue.jobs_by_type(JobType::Deploy);
    assert_eq!(deploys.len(), 3);
    assert!(deploys.iter().all(|j| j.priority == 2));
    assert!(h.queue.jobs_by_type(JobType::Email).is_empty());

    // Every saved lead got a preview URL from the deploy stage.
    assert!(h.leads.all().iter().all(|l| l.preview_url.is_some()));
}

#[tokio::test]
async fn pipeline_chains_to_email_when_opted_in() {
    let discovery = MockDiscovery::returning(vec![
        lead("Ajax Plumbing", "https://ajax.example", 2.0),
        lead("Budget Rooter", "https://rooter.example", 3.5),
    ]);
    let h = harness(discovery);
    h.runner.configure(PipelineConfigPatch {
        auto_email: Some(true),
        ..PipelineConfigPatch::default()
    });

    h.queue
        .enqueue(JobType::Discover, json!({"query": "plumbers"}), EnqueueOpts::default())
        .unwrap();
    let outcome = h.queue.process_all().await;

    // discover + 2 generate + 2 deploy + 2 email
    assert_eq!(outcome.completed, 7);
    assert_eq!(outcome.failed, 0);

    let emails = h.queue.jobs_by_type(JobType::Email);
    assert_eq!(emails.len(), 2);
    assert!(emails.iter().all(|j| j.priority == 3));
    assert_eq!(h.email.sent.lock().unwrap().len(), 2);
    assert!(h.leads.all().iter().all(|l| l.emailed_at.is_some()));
}

#[tokio::test]
async fn duplicate_leads_are_not_saved_twice() {
    let discovery = MockDiscovery::returning(vec![lead(
        "Ajax Plumbing",
        "https://ajax.example",
        2.0,
    )]);
    let h = harness(discovery);

    h.runner.run_discovery("plumbers").await.unwrap();
    h.runner.run_discovery("plumbers again").await.unwrap();

    assert_eq!(h.leads.all().len(), 1);
    // Only the first run fans out a generate job.
    assert_eq!(h.queue.jobs_by_type(JobType::Generate).len(), 1);
}

#[tokio::test]
async fn daily_email_budget_skips_instead_of_failing() {
    let discovery = MockDiscovery::returning(vec![
        lead("Ajax Plumbing", "https://ajax.example", 2.0),
        lead("Budget Rooter", "https://rooter.example", 3.5),
    ]);
    let h = harness(discovery);
    h.runner.configure(PipelineConfigPatch {
        auto_email: Some(true),
        max_emails_per_day: Some(1),
        ..PipelineConfigPatch::default()
    });

    let outcome = h.runner.run_discovery("plumbers").await.unwrap();
    assert_eq!(outcome.failed, 0);

    let emails = h.queue.jobs_by_type(JobType::Email);
    assert_eq!(emails.len(), 2);
    let sent: Vec<bool> = emails
        .iter()
        .map(|j| j.result.as_ref().unwrap()["sent"].as_bool().unwrap())
        .collect();
    assert_eq!(sent.iter().filter(|s| **s).count(), 1);
    assert_eq!(h.email.sent.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_workers_cannot_exceed_the_daily_email_cap() {
    let queue = Arc::new(JobQueue::new().with_config(QueueConfig {
        workers: 2,
        poll_interval: Duration::from_millis(50),
    }));
    let leads = Arc::new(MockLeadStore::default());
    let email = Arc::new(SlowEmailSender {
        sent: AtomicU32::new(0),
    });
    let collab = Collaborators {
        discovery: MockDiscovery::empty(),
        auditor: Arc::new(MockAuditor),
        themes: Arc::new(MockThemeStudio),
        deployer: Arc::new(MockDeployer),
        leads: leads.clone(),
        email: email.clone(),
    };
    let runner = PipelineRunner::new(Arc::clone(&queue), collab);
    runner.register_handlers();
    runner.configure(PipelineConfigPatch {
        max_emails_per_day: Some(1),
        ..PipelineConfigPatch::default()
    });

    for l in [
        lead("Ajax Plumbing", "https://ajax.example", 2.0),
        lead("Budget Rooter", "https://rooter.example", 3.5),
    ] {
        let l = leads.create(l).await.unwrap();
        leads
            .set_preview_url(&l.id, "https://previews.test/x")
            .await
            .unwrap();
        queue
            .enqueue(JobType::Email, json!({ "lead_id": l.id }), EnqueueOpts::default())
            .unwrap();
    }

    // Both jobs are ready at once; the sender is slow enough that the
    // second dispatch starts while the first send is still in flight.
    queue.start();
    tokio::time::sleep(Duration::from_secs(5)).await;
    queue.stop().await;

    assert_eq!(email.sent.load(Ordering::SeqCst), 1);
    let emails = queue.jobs_by_type(JobType::Email);
    assert_eq!(emails.len(), 2);
    assert!(emails.iter().all(|j| j.status == JobStatus::Completed));
    let sent_flags: Vec<bool> = emails
        .iter()
        .map(|j| j.result.as_ref().unwrap()["sent"].as_bool().unwrap())
        .collect();
    assert_eq!(sent_flags.iter().filter(|s| **s).count(), 1);
}

#[tokio::test]
async fn followup_sweep_survives_a_mark_emailed_error() {
    let h = harness(MockDiscovery::empty());

    let emailed_at = Utc::now() - chrono::Duration::days(5);
    let a = h
        .leads
        .create(lead("Ajax Plumbing", "https://ajax.example", 2.0))
        .await
        .unwrap();
    let b = h
        .leads
        .create(lead("Budget Rooter", "https://rooter.example", 3.5))
        .await
        .unwrap();
    h.leads.mark_emailed(&a.id, emailed_at).await.unwrap();
    h.leads.mark_emailed(&b.id, emailed_at).await.unwrap();
    // From here on, recording lead A errors like a flaky store would.
    h.leads.fail_mark_for(&a.id);

    let job = h
        .queue
        .enqueue(JobType::Followup, json!({}), EnqueueOpts::default())
        .unwrap();
    let outcome = h.queue.process_all().await;
    assert_eq!(outcome.failed, 0);

    let done = h.queue.job(&job.id).unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    let result = done.result.unwrap();
    assert_eq!(result["candidates"], 2);
    assert_eq!(result["sent"], 1);
    assert_eq!(result["failed"], 1);
    // Both follow-ups went out exactly once.
    assert_eq!(h.email.sent.lock().unwrap().len(), 2);
}

// ---------------------------------------------------------------------------
// Exponential retry with jitter band, then a terminal error
// ---------------------------------------------------------------------------

#[tokio::test]
async fn email_retries_within_jitter_band_then_fails_on_terminal_error() {
    let clock = Arc::new(ManualClock::new());
    let queue = JobQueue::new().with_clock(clock.clone());

    let attempts = Arc::new(AtomicU32::new(0));
    {
        let attempts = Arc::clone(&attempts);
        queue.handlers().register(JobType::Email, move |_payload| {
            let attempts = Arc::clone(&attempts);
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= 2 {
                    Err(HandlerError::coded("RATE_LIMIT", "too many"))
                } else {
                    Err(HandlerError::coded("INVALID_RECIPIENT", "mailbox gone"))
                }
            }
        });
    }

    let job = queue
        .enqueue(JobType::Email, json!({}), EnqueueOpts::default())
        .unwrap();

    // Attempt 1: 60s base, jitter 0.25 -> [45s, 75s].
    queue.process_all().await;
    let stored = queue.job(&job.id).unwrap();
    assert_eq!(stored.status, JobStatus::Pending);
    assert_eq!(stored.attempts, 1);
    let delta = (stored.next_run_at.unwrap() - stored.updated_at).num_milliseconds();
    assert!((45_000..=75_000).contains(&delta), "delta was {}", delta);

    // Attempt 2: 120s base -> [90s, 150s].
    clock.advance(Duration::from_millis(75_000));
    queue.process_all().await;
    let stored = queue.job(&job.id).unwrap();
    assert_eq!(stored.attempts, 2);
    let delta = (stored.next_run_at.unwrap() - stored.updated_at).num_milliseconds();
    assert!((90_000..=150_000).contains(&delta), "delta was {}", delta);

    // Attempt 3 hits a non-retryable error with attempts to spare (max 5).
    clock.advance(Duration::from_millis(150_000));
    queue.process_all().await;
    let stored = queue.job(&job.id).unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.attempts, 3);
    assert!(stored.last_error.unwrap().starts_with("INVALID_RECIPIENT"));
}

// ---------------------------------------------------------------------------
// Fixed backoff, attempts exhausted
// ---------------------------------------------------------------------------

#[tokio::test]
async fn score_retries_after_exactly_its_fixed_delay_then_exhausts() {
    let clock = Arc::new(ManualClock::new());
    let queue = JobQueue::new().with_clock(clock.clone());
    queue.handlers().register(JobType::Score, |_payload| async {
        Err::<HandlerOutcome, _>(HandlerError::coded("TIMEOUT", "page load"))
    });

    let job = queue
        .enqueue(JobType::Score, json!({}), EnqueueOpts::default())
        .unwrap();

    queue.process_all().await;
    let stored = queue.job(&job.id).unwrap();
    assert_eq!(stored.attempts, 1);
    // Fixed 60s, zero jitter: exact.
    let delta = (stored.next_run_at.unwrap() - stored.updated_at).num_milliseconds();
    assert_eq!(delta, 60_000);

    // One second early: not ready yet.
    clock.advance(Duration::from_millis(59_000));
    queue.process_all().await;
    assert_eq!(queue.job(&job.id).unwrap().attempts, 1);

    // Past the delay: second attempt exceeds max_attempts = 2.
    clock.advance(Duration::from_millis(2_000));
    let outcome = queue.process_all().await;
    assert_eq!(outcome.failed, 1);
    let stored = queue.job(&job.id).unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.attempts, 2);
}

// ---------------------------------------------------------------------------
// Periodic sweeps
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn scheduler_sweeps_fire_until_stopped() {
    let h = harness(MockDiscovery::empty());
    h.runner.configure(PipelineConfigPatch {
        discovery_queries: Some(vec![
            "plumbers in Austin TX".to_string(),
            "dentists in Boise ID".to_string(),
        ]),
        discovery_schedule: Some(Duration::from_secs(60)),
        follow_up_schedule: Some(Duration::from_secs(90)),
        ..PipelineConfigPatch::default()
    });

    h.runner.start_scheduler();
    h.runner.start_scheduler(); // must not double-arm the timers
    assert!(h.runner.runner_status().is_running);

    // Two discovery ticks (60s, 120s) and one follow-up tick (90s).
    tokio::time::sleep(Duration::from_secs(130)).await;
    assert_eq!(h.queue.jobs_by_type(JobType::Discover).len(), 4);
    assert_eq!(h.queue.jobs_by_type(JobType::Followup).len(), 1);

    h.runner.stop_scheduler().await;
    assert!(!h.runner.runner_status().is_running);

    // No further periodic jobs after stop.
    let discover_count = h.queue.jobs_by_type(JobType::Discover).len();
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(h.queue.jobs_by_type(JobType::Discover).len(), discover_count);

    // Stopping again is safe.
    h.runner.stop_scheduler().await;
}

// ---------------------------------------------------------------------------
// Exclusive dispatch across concurrent workers
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn no_job_id_is_dispatched_concurrently() {
    let queue = Arc::new(JobQueue::new().with_config(QueueConfig {
        workers: 2,
        poll_interval: Duration::from_millis(50),
    }));

    let in_flight: Arc<Mutex<HashMap<i64, u32>>> = Arc::new(Mutex::new(HashMap::new()));
    let overlapped = Arc::new(AtomicU32::new(0));
    {
        let in_flight = Arc::clone(&in_flight);
        let overlapped = Arc::clone(&overlapped);
        queue.handlers().register(JobType::Capture, move |payload| {
            let in_flight = Arc::clone(&in_flight);
            let overlapped = Arc::clone(&overlapped);
            async move {
                let n = payload["n"].as_i64().unwrap();
                {
                    let mut map = in_flight.lock().unwrap();
                    let entry = map.entry(n).or_insert(0);
                    *entry += 1;
                    if *entry > 1 {
                        overlapped.fetch_add(1, Ordering::SeqCst);
                    }
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
                in_flight.lock().unwrap().entry(n).and_modify(|e| *e -= 1);
                Ok(HandlerOutcome::default())
            }
        });
    }

    for n in 0..3 {
        queue
            .enqueue(JobType::Capture, json!({ "n": n }), EnqueueOpts::default())
            .unwrap();
    }

    queue.start();
    tokio::time::sleep(Duration::from_secs(5)).await;
    queue.stop().await;

    assert_eq!(overlapped.load(Ordering::SeqCst), 0);
    let stats = queue.get_stats();
    assert_eq!(stats.by_status.get("completed"), Some(&3));
}
