use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Process-wide pipeline configuration. Mutated only through
/// `PipelineRunner::configure`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Search queries seeded into each discovery sweep.
    pub discovery_queries: Vec<String>,
    pub leads_per_query: u32,
    /// Sites scoring at or below this need a redesign and qualify as leads.
    pub score_threshold: f64,
    /// Chain generate/deploy automatically after discovery.
    pub auto_deploy: bool,
    /// Emailing is explicit opt-in.
    pub auto_email: bool,
    #[serde(with = "duration_secs")]
    pub discovery_schedule: Duration,
    #[serde(with = "duration_secs")]
    pub follow_up_schedule: Duration,
    pub max_leads_per_day: u32,
    pub max_emails_per_day: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            discovery_queries: Vec::new(),
            leads_per_query: 10,
            score_threshold: 6.0,
            auto_deploy: true,
            auto_email: false,
            discovery_schedule: Duration::from_secs(24 * 60 * 60),
            follow_up_schedule: Duration::from_secs(60 * 60),
            max_leads_per_day: 50,
            max_emails_per_day: 25,
        }
    }
}

/// Partial update merged into the active config; `None` fields keep their
/// current value.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfigPatch {
    pub discovery_queries: Option<Vec<String>>,
    pub leads_per_query: Option<u32>,
    pub score_threshold: Option<f64>,
    pub auto_deploy: Option<bool>,
    pub auto_email: Option<bool>,
    pub discovery_schedule: Option<Duration>,
    pub follow_up_schedule: Option<Duration>,
    pub max_leads_per_day: Option<u32>,
    pub max_emails_per_day: Option<u32>,
}

impl PipelineConfig {
    pub fn apply(&mut self, patch: PipelineConfigPatch) {
        if let Some(v) = patch.discovery_queries {
            self.discovery_queries = v;
        }
        if let Some(v) = patch.leads_per_query {
            self.leads_per_query = v;
        }
        if let Some(v) = patch.score_threshold {
            self.score_threshold = v;
        }
        if let Some(v) = patch.auto_deploy {
            self.auto_deploy = v;
        }
        if let Some(v) = patch.auto_email {
            self.auto_email = v;
        }
        if let Some(v) = patch.discovery_schedule {
            self.discovery_schedule = v;
        }
        if let Some(v) = patch.follow_up_schedule {
            self.follow_up_schedule = v;
        }
        if let Some(v) = patch.max_leads_per_day {
            self.max_leads_per_day = v;
        }
        if let Some(v) = patch.max_emails_per_day {
            self.max_emails_per_day = v;
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
