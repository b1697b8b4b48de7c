//! Error types for the scheduler.

use thiserror::Error;

/// Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Invalid or ambiguous task configuration, raised by `start()`.
    #[error("Invalid task configuration: {0}")]
    Configuration(String),

    /// Lookup of a task name that is not registered.
    #[error("No task found with the name: ({name}). Registered tasks are ({registered:?})")]
    TaskNotFound {
        /// The requested name.
        name: String,
        /// Names registered at the time of the lookup.
        registered: Vec<String>,
    },

    /// The task target failed during a firing.
    #[error("Task ({task}) failed: {source}")]
    Execution {
        /// Task name.
        task: String,
        /// Error raised by the target.
        #[source]
        source: anyhow::Error,
    },

    /// No eligible instant could be found for a calendar task.
    #[error("No eligible run time for task ({task}): {reason}")]
    SearchExhausted {
        /// Task name.
        task: String,
        /// Why the search gave up.
        reason: String,
    },

    /// The task is disabled and cannot be started.
    #[error("Task ({0}) is disabled")]
    Disabled(String),

    /// Time-of-day string is not `HH:mm`.
    #[error("Invalid time representation ({0}). Time is represented in 24 hour minute format => HH:mm")]
    InvalidTime(String),

    /// Date string is not `yyyy-MM-dd`.
    #[error("Invalid date representation ({0}). Dates are represented as yyyy-MM-dd")]
    InvalidDate(String),

    /// Unknown IANA timezone name.
    #[error("Unknown timezone: {0}")]
    InvalidTimezone(String),

    /// Worker pool rejected or failed an operation.
    #[error("Worker pool error: {0}")]
    Pool(String),

    /// Lookup of a scheduler name that is not registered with the service.
    #[error("Scheduler [{name}] not registered. Registered schedulers are: {registered:?}")]
    SchedulerNotFound {
        /// The requested name.
        name: String,
        /// Names registered at the time of the lookup.
        registered: Vec<String>,
    },

    /// A scheduler with the same name is already registered.
    #[error("A scheduler with the name [{0}] already exists")]
    SchedulerExists(String),
}

impl SchedulerError {
    /// Renders the error and its source chain, one cause per line.
    pub fn chain(&self) -> String {
        let mut rendered = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            rendered.push_str("\n  caused by: ");
            rendered.push_str(&cause.to_string());
            source = cause.source();
        }
        rendered
    }

    /// Returns true for errors that come from bad task configuration.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::InvalidTime(_)
                | Self::InvalidDate(_)
                | Self::InvalidTimezone(_)
                | Self::SearchExhausted { .. }
        )
    }
}
