//! External collaborators the pipeline calls into.
//!
//! The core only knows these by shape: payload in, result or error out. An
//! error rendered with an `UPPER_SNAKE_CASE:` prefix is classified by the
//! retry engine; everything else defaults per policy.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::handler::HandlerError;

/// A prospective customer with a site worth redesigning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: String,
    pub business_name: String,
    pub url: String,
    pub email: Option<String>,
    /// Site quality score, lower is worse.
    pub score: Option<f64>,
    /// Deployed mockup gallery, once one exists.
    pub preview_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub emailed_at: Option<DateTime<Utc>>,
}

impl Lead {
    pub fn new(business_name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            business_name: business_name.into(),
            url: url.into(),
            email: None,
            score: None,
            preview_url: None,
            created_at: Utc::now(),
            emailed_at: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }
}

/// Input to theme generation for one lead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThemeManifest {
    pub lead_id: String,
    pub business_name: String,
    pub url: String,
    pub score: Option<f64>,
}

/// Where generated themes landed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryOutput {
    pub directory: String,
    pub themes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployOutcome {
    pub success: bool,
    pub url: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailOutcome {
    pub success: bool,
    pub message_id: Option<String>,
    pub error: Option<String>,
}

/// Finds businesses whose sites score badly enough to pitch.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn discover(
        &self,
        query: &str,
        max_results: u32,
        score_threshold: f64,
    ) -> Result<Vec<Lead>, HandlerError>;
}

/// Captures a site and scores its current design.
#[async_trait]
pub trait SiteAuditor: Send + Sync {
    /// Returns the path of the captured screenshot/DOM snapshot.
    async fn capture(&self, url: &str) -> Result<String, HandlerError>;

    async fn score(&self, url: &str) -> Result<f64, HandlerError>;
}

/// Generates themed mockups into a gallery directory.
#[async_trait]
pub trait ThemeStudio: Send + Sync {
    async fn generate(&self, manifest: &ThemeManifest) -> Result<GalleryOutput, HandlerError>;
}

/// Deploys a gallery directory to a public preview URL.
#[async_trait]
pub trait Deployer: Send + Sync {
    async fn deploy(&self, directory: &str) -> Result<DeployOutcome, HandlerError>;
}

/// Lead persistence (the CRM side).
#[async_trait]
pub trait LeadStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Lead>, HandlerError>;

    async fn get_by_url(&self, url: &str) -> Result<Option<Lead>, HandlerError>;

    async fn create(&self, lead: Lead) -> Result<Lead, HandlerError>;

    async fn set_score(&self, id: &str, score: f64) -> Result<(), HandlerError>;

    async fn set_preview_url(&self, id: &str, url: &str) -> Result<(), HandlerError>;

    async fn mark_emailed(&self, id: &str, at: DateTime<Utc>) -> Result<(), HandlerError>;

    /// Leads emailed before `cutoff` that never replied.
    async fn followup_candidates(&self, cutoff: DateTime<Utc>) -> Result<Vec<Lead>, HandlerError>;
}

/// Sends outreach email.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_preview(
        &self,
        lead: &Lead,
        preview_url: &str,
        score: Option<f64>,
    ) -> Result<EmailOutcome, HandlerError>;

    async fn send_followup(&self, lead: &Lead) -> Result<EmailOutcome, HandlerError>;
}
