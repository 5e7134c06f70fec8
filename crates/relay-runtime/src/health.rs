use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse health state of a proxied service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
    Starting,
    Stopped,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Starting => "starting",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health snapshot of one service, also serialized into the record's
/// `health_details_json` column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(default)]
    pub response_time_ms: u64,
    #[serde(default)]
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub up_time_seconds: u64,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failure_count: u64,
    #[serde(default)]
    pub warning_level: u8,
    #[serde(default)]
    pub tool_count: usize,
    #[serde(default)]
    pub tools_fetched: bool,
}

/// Warning level derived from the consecutive failure count.
///
/// healthy is always level 0; unhealthy escalates with the failure count
/// (1 up to 3 failures, 2 up to 10, 3 beyond). Other statuses carry no
/// severity of their own and report 0.
pub fn warning_level_for(status: HealthStatus, failure_count: u64) -> u8 {
    match status {
        HealthStatus::Healthy => 0,
        HealthStatus::Unhealthy => match failure_count {
            0..=3 => 1,
            4..=10 => 2,
            _ => 3,
        },
        _ => 0,
    }
}

impl ServiceHealth {
    /// Applies the outcome of one health observation: sets status, response
    /// time and error message, bumps the matching counter and recomputes the
    /// warning level.
    pub fn apply(&mut self, status: HealthStatus, response_time_ms: u64, error_message: &str) {
        self.status = status;
        self.response_time_ms = response_time_ms;
        self.error_message = error_message.to_string();
        self.last_checked = Some(Utc::now());
        match status {
            HealthStatus::Healthy => self.success_count += 1,
            HealthStatus::Unhealthy => self.failure_count += 1,
            _ => {}
        }
        self.warning_level = warning_level_for(status, self.failure_count);
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to serialize service health")
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("failed to parse service health")
    }
}
