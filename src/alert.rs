use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

/// How bad a notification is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        f.write_str(s)
    }
}

/// Receives terminal-failure notifications from the queue. One call per
/// permanently-failed job; no response expected.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, kind: &str, severity: Severity, title: &str, detail: &str);
}

/// Default sink that routes alerts into the process log.
#[derive(Debug, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn notify(&self, kind: &str, severity: Severity, title: &str, detail: &str) {
        match severity {
            Severity::Error => error!(kind = kind, title = title, detail = detail, "Alert"),
            _ => warn!(kind = kind, severity = %severity, title = title, detail = detail, "Alert"),
        }
    }
}
