//! Scheduler configuration.

use crate::error::Result;
use crate::time::parse_timezone;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Scheduler name. The worker pool is named `"{name}-scheduler"`.
    #[serde(default = "default_name")]
    pub name: String,

    /// IANA timezone name used for calendar tasks.
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Upper bound on the day-by-day search for the next calendar firing.
    #[serde(default = "default_max_search_iterations")]
    pub max_search_iterations: u32,
}

fn default_name() -> String {
    "default".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

fn default_max_search_iterations() -> u32 {
    400
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            timezone: default_timezone(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            max_search_iterations: default_max_search_iterations(),
        }
    }
}

impl SchedulerConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the scheduler name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the timezone name.
    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    /// Set the graceful shutdown timeout in seconds.
    pub fn with_shutdown_timeout_secs(mut self, secs: u64) -> Self {
        self.shutdown_timeout_secs = secs;
        self
    }

    /// Set the calendar search bound.
    pub fn with_max_search_iterations(mut self, iterations: u32) -> Self {
        self.max_search_iterations = iterations;
        self
    }

    /// Graceful shutdown timeout.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Parsed timezone.
    pub fn timezone(&self) -> Result<Tz> {
        parse_timezone(&self.timezone)
    }
}
