use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use repitch::{
    Collaborators, DeployOutcome, Deployer, Discovery, EmailOutcome, EmailSender, GalleryOutput,
    HandlerError, JobQueue, JobStatus, Lead, LeadStore, PipelineConfigPatch, PipelineRunner,
    SiteAuditor, ThemeManifest, ThemeStudio,
};

#[derive(Parser, Debug)]
#[command(name = "repitch")]
#[command(version)]
#[command(about = "Website-redesign lead pipeline: discover, mock up, deploy, reach out")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scheduler controls
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommands,
    },

    /// Queue inspection and maintenance
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ScheduleCommands {
    /// Start the background scheduler and run until Ctrl+C
    Start {
        /// Discovery queries to sweep periodically
        queries: Vec<String>,

        /// Send outreach emails automatically after each deploy
        #[arg(long)]
        auto_email: bool,
    },

    /// Show how to stop the in-process scheduler
    Stop,

    /// Show scheduler and queue status
    Status,

    /// Run one discovery query through the whole pipeline and exit
    Run { query: String },
}

#[derive(Subcommand, Debug)]
enum QueueCommands {
    /// Show job counts by status and type
    Stats,

    /// List pending jobs in dispatch order
    Pending,

    /// Remove jobs, optionally only those with the given status
    Clear { status: Option<String> },

    /// Process all ready jobs now
    Process,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let queue = Arc::new(JobQueue::new());
    let runner = PipelineRunner::new(Arc::clone(&queue), demo_collaborators());
    runner.register_handlers();

    match args.command {
        Commands::Schedule { command } => match command {
            ScheduleCommands::Start { queries, auto_email } => {
                runner.configure(PipelineConfigPatch {
                    discovery_queries: Some(queries),
                    auto_email: Some(auto_email),
                    ..PipelineConfigPatch::default()
                });
                runner.start_scheduler();
                println!("Scheduler running, press Ctrl+C to stop");
                tokio::signal::ctrl_c().await?;
                runner.stop_scheduler().await;
            }
            ScheduleCommands::Stop => {
                // Queue state is in-memory, so there is no separate
                // scheduler process this command could reach.
                println!(
                    "The scheduler runs inside `schedule start`; stop it with Ctrl+C there"
                );
            }
            ScheduleCommands::Status => {
                let status = runner.runner_status();
                println!("{}", serde_json::to_string_pretty(&status)?);
            }
            ScheduleCommands::Run { query } => {
                println!("Running pipeline for query: {}", query);
                let outcome = runner.run_discovery(&query).await?;
                println!("Done: {} completed, {} failed", outcome.completed, outcome.failed);
            }
        },
        Commands::Queue { command } => match command {
            QueueCommands::Stats => {
                println!("{}", serde_json::to_string_pretty(&queue.get_stats())?);
            }
            QueueCommands::Pending => {
                let pending = queue.get_pending_jobs();
                if pending.is_empty() {
                    println!("No pending jobs");
                }
                for job in pending {
                    println!(
                        "{}  {}  priority={}  attempts={}  next_run_at={}",
                        job.id,
                        job.job_type,
                        job.priority,
                        job.attempts,
                        job.next_run_at
                            .map(|t| t.to_rfc3339())
                            .unwrap_or_else(|| "now".to_string()),
                    );
                }
            }
            QueueCommands::Clear { status } => {
                let status = status.map(|s| JobStatus::from_str(&s)).transpose()?;
                let removed = queue.clear(status);
                println!("Removed {} job(s)", removed);
            }
            QueueCommands::Process => {
                let outcome = queue.process_all().await;
                println!("{} completed, {} failed", outcome.completed, outcome.failed);
            }
        },
    }

    Ok(())
}

/// Self-contained collaborators so the binary works without any external
/// services: deterministic fake discovery/scoring, an in-memory lead store,
/// and log-only deploy/email.
fn demo_collaborators() -> Collaborators {
    let leads = Arc::new(MemoryLeadStore::default());
    Collaborators {
        discovery: Arc::new(DemoDiscovery),
        auditor: Arc::new(DemoAuditor),
        themes: Arc::new(DemoThemeStudio),
        deployer: Arc::new(DemoDeployer),
        leads,
        email: Arc::new(DemoEmailSender),
    }
}

fn stable_hash(input: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    input.hash(&mut hasher);
    hasher.finish()
}

struct DemoDiscovery;

#[async_trait]
impl Discovery for DemoDiscovery {
    async fn discover(
        &self,
        query: &str,
        max_results: u32,
        score_threshold: f64,
    ) -> Result<Vec<Lead>, HandlerError> {
        let slug: String = query
            .chars()
            .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
            .collect();
        let leads = (0..max_results)
            .map(|n| {
                let score = (stable_hash(&format!("{}-{}", slug, n)) % 100) as f64 / 10.0;
                Lead::new(format!("{} #{}", query, n + 1), format!("https://{}-{}.example.com", slug, n))
                    .with_email(format!("owner@{}-{}.example.com", slug, n))
                    .with_score(score)
            })
            .filter(|l| l.score.unwrap_or(10.0) <= score_threshold)
            .collect();
        Ok(leads)
    }
}

struct DemoAuditor;

#[async_trait]
impl SiteAuditor for DemoAuditor {
    async fn capture(&self, url: &str) -> Result<String, HandlerError> {
        Ok(format!("/tmp/captures/{}.png", stable_hash(url)))
    }

    async fn score(&self, url: &str) -> Result<f64, HandlerError> {
        Ok((stable_hash(url) % 100) as f64 / 10.0)
    }
}

struct DemoThemeStudio;

#[async_trait]
impl ThemeStudio for DemoThemeStudio {
    async fn generate(&self, manifest: &ThemeManifest) -> Result<GalleryOutput, HandlerError> {
        Ok(GalleryOutput {
            directory: format!("/tmp/galleries/{}", manifest.lead_id),
            themes: vec!["modern".into(), "bold".into(), "minimal".into()],
        })
    }
}

struct DemoDeployer;

#[async_trait]
impl Deployer for DemoDeployer {
    async fn deploy(&self, directory: &str) -> Result<DeployOutcome, HandlerError> {
        info!(directory = directory, "Demo deploy");
        Ok(DeployOutcome {
            success: true,
            url: Some(format!("https://previews.example.com/{}", stable_hash(directory))),
            error: None,
        })
    }
}

struct DemoEmailSender;

#[async_trait]
impl EmailSender for DemoEmailSender {
    async fn send_preview(
        &self,
        lead: &Lead,
        preview_url: &str,
        _score: Option<f64>,
    ) -> Result<EmailOutcome, HandlerError> {
        info!(lead_id = %lead.id, preview_url = preview_url, "Demo preview email");
        Ok(EmailOutcome {
            success: true,
            message_id: Some(format!("demo-{}", stable_hash(&lead.id))),
            error: None,
        })
    }

    async fn send_followup(&self, lead: &Lead) -> Result<EmailOutcome, HandlerError> {
        info!(lead_id = %lead.id, "Demo follow-up email");
        Ok(EmailOutcome {
            success: true,
            message_id: Some(format!("demo-fu-{}", stable_hash(&lead.id))),
            error: None,
        })
    }
}

#[derive(Default)]
struct MemoryLeadStore {
    leads: Mutex<HashMap<String, Lead>>,
}

#[async_trait]
impl LeadStore for MemoryLeadStore {
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
        self.leads.lock().unwrap().insert(lead.id.clone(), lead.clone());
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
