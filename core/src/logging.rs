//! Structured run logging with correlation IDs
//!
//! Every run gets a [`RunCorrelation`] so interleaved log lines from
//! back-to-back configurations can be told apart. Round summaries are emitted
//! as single-line JSON through `tracing`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use uuid::Uuid;

static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Correlation ID tying log lines to one run of one configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RunCorrelation {
    /// Unique run ID
    pub run_id: String,
    /// Configuration name
    pub config_name: String,
    /// Round in progress, if any
    pub round: Option<usize>,
}

impl RunCorrelation {
    /// Create a correlation ID for a fresh run
    pub fn new(config_name: impl Into<String>) -> Self {
        let run_id = format!(
            "{}-{}",
            Uuid::new_v4().simple(),
            RUN_COUNTER.fetch_add(1, Ordering::SeqCst)
        );

        Self {
            run_id,
            config_name: config_name.into(),
            round: None,
        }
    }

    /// Add round context
    pub fn with_round(&self, round: usize) -> Self {
        Self {
            round: Some(round),
            ..self.clone()
        }
    }
}

/// One structured round summary
#[derive(Debug, Serialize)]
pub struct RoundLogEntry {
    /// ISO 8601 timestamp
    pub timestamp: String,
    /// Phase or event name
    pub event: String,
    pub correlation: RunCorrelation,
    /// Additional context fields
    #[serde(flatten)]
    pub fields: serde_json::Value,
}

impl RoundLogEntry {
    pub fn new(event: &str, correlation: RunCorrelation) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            event: event.to_string(),
            correlation,
            fields: serde_json::json!({}),
        }
    }

    /// Add additional context fields
    pub fn with_fields(mut self, fields: serde_json::Value) -> Self {
        self.fields = fields;
        self
    }

    /// Single-line JSON for log aggregation
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"log_error\":\"{}\"}}", e))
    }

    /// Emit through `tracing` at INFO
    pub fn emit(&self) {
        tracing::info!(target: "fedclust::rounds", "{}", self.to_json_line());
    }
}

/// Logs how long a phase took when dropped
pub struct PhaseTimer {
    start: Instant,
    phase: &'static str,
    correlation: RunCorrelation,
}

impl PhaseTimer {
    pub fn new(phase: &'static str, correlation: RunCorrelation) -> Self {
        tracing::trace!(phase, run = %correlation.run_id, round = ?correlation.round, "Starting phase");
        Self {
            start: Instant::now(),
            phase,
            correlation,
        }
    }
}

impl Drop for PhaseTimer {
    fn drop(&mut self) {
        tracing::debug!(
            phase = self.phase,
            run = %self.correlation.run_id,
            round = ?self.correlation.round,
            duration_ms = self.start.elapsed().as_millis() as u64,
            "Completed phase"
        );
    }
}
