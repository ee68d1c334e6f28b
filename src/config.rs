//! Worker configuration resolution and validation
//!
//! Each declared job type gets one [`WorkerConfig`], produced by layering
//! the handler's per-type overrides over the process-wide
//! [`WorkerDefaults`]. Resolution is a pure function and validation runs
//! eagerly at pool start, before any call to the broker, so a single bad
//! entry rejects the whole pool instead of leaving it partially started.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::registry::HandlerDescriptor;

/// Process-wide default values for worker configuration
///
/// Every field is optional. A field that is absent here *and* absent from
/// the per-type override resolves to [`ConfigError::MissingField`], never
/// to a silent zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerDefaults {
    /// Maximum concurrently-active jobs per worker
    pub max_jobs_active: Option<usize>,

    /// Interval between poll requests to the broker
    #[serde(default, with = "duration_millis_opt")]
    pub poll_interval: Option<Duration>,

    /// How long a single poll request may wait for jobs
    #[serde(default, with = "duration_millis_opt")]
    pub poll_timeout: Option<Duration>,

    /// How long the broker waits for a job to be reported complete or
    /// failed before the lease expires
    #[serde(default, with = "duration_millis_opt")]
    pub job_timeout: Option<Duration>,

    /// Display name reported to the broker for every worker
    pub worker_name: Option<String>,
}

impl WorkerDefaults {
    /// Create empty defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default maximum of concurrently-active jobs
    pub fn with_max_jobs_active(mut self, max: usize) -> Self {
        self.max_jobs_active = Some(max);
        self
    }

    /// Set the default poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Set the default poll timeout
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }

    /// Set the default job timeout
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    /// Set the default worker display name
    pub fn with_worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = Some(name.into());
        self
    }
}

/// Validated configuration for one job worker
///
/// Constructed once per job type at pool start via [`WorkerConfig::resolve`]
/// and never mutated afterwards. The worker loop it configures is its only
/// consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    job_type: String,
    max_jobs_active: usize,
    poll_interval: Duration,
    poll_timeout: Duration,
    job_timeout: Duration,
    worker_name: Option<String>,
    fetch_variables: Vec<String>,
}

impl WorkerConfig {
    /// Resolve the effective configuration for one job type
    ///
    /// For every field the per-type override wins when present, otherwise
    /// the process-wide default applies. A field with no value in either
    /// source is an error. The merged result is validated before it is
    /// returned; any violation fails the whole pool start.
    pub fn resolve(
        defaults: &WorkerDefaults,
        descriptor: &HandlerDescriptor,
    ) -> Result<Self, ConfigError> {
        let job_type = descriptor.job_type.clone();

        let missing = |field: &'static str| ConfigError::MissingField {
            job_type: job_type.clone(),
            field,
        };

        let config = Self {
            max_jobs_active: descriptor
                .max_jobs_active
                .or(defaults.max_jobs_active)
                .ok_or_else(|| missing("max_jobs_active"))?,
            poll_interval: descriptor
                .poll_interval
                .or(defaults.poll_interval)
                .ok_or_else(|| missing("poll_interval"))?,
            poll_timeout: descriptor
                .poll_timeout
                .or(defaults.poll_timeout)
                .ok_or_else(|| missing("poll_timeout"))?,
            job_timeout: descriptor
                .job_timeout
                .or(defaults.job_timeout)
                .ok_or_else(|| missing("job_timeout"))?,
            // The name stays optional: unset in both sources is allowed,
            // blank-but-present is not.
            worker_name: descriptor
                .worker_name
                .clone()
                .or_else(|| defaults.worker_name.clone()),
            fetch_variables: descriptor.fetch_variables.clone(),
            job_type,
        };

        config.validate()?;
        Ok(config)
    }

    /// Get the job type this worker polls
    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    /// Get the maximum of concurrently-active jobs
    pub fn max_jobs_active(&self) -> usize {
        self.max_jobs_active
    }

    /// Get the interval between poll requests
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Get the poll request timeout
    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    /// Get the job lease timeout
    pub fn job_timeout(&self) -> Duration {
        self.job_timeout
    }

    /// Get the worker display name, if one was configured
    pub fn worker_name(&self) -> Option<&str> {
        self.worker_name.as_deref()
    }

    /// Get the variable names fetched with every job
    pub fn fetch_variables(&self) -> &[String] {
        &self.fetch_variables
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: &'static str| ConfigError::Invalid {
            job_type: self.job_type.clone(),
            field,
            reason,
        };

        if self.job_type.trim().is_empty() {
            return Err(ConfigError::Invalid {
                job_type: self.job_type.clone(),
                field: "job_type",
                reason: "must not be empty",
            });
        }
        if self.max_jobs_active < 1 {
            return Err(invalid("max_jobs_active", "must be at least 1"));
        }
        if self.poll_interval.is_zero() {
            return Err(invalid("poll_interval", "must be greater than zero"));
        }
        if self.poll_timeout.is_zero() {
            return Err(invalid("poll_timeout", "must be greater than zero"));
        }
        if self.job_timeout.is_zero() {
            return Err(invalid("job_timeout", "must be greater than zero"));
        }
        if let Some(name) = &self.worker_name {
            if name.trim().is_empty() {
                return Err(invalid("worker_name", "must not be blank when set"));
            }
        }

        Ok(())
    }
}

/// Configuration errors
///
/// Any of these is fatal to pool start: no worker opens.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A resolved field violates its invariant
    #[error("invalid configuration for job type '{job_type}': {field} {reason}")]
    Invalid {
        /// Job type whose configuration is invalid
        job_type: String,
        /// Name of the offending field
        field: &'static str,
        /// What the field must satisfy
        reason: &'static str,
    },

    /// A field has no value in the override or the defaults
    #[error("no value for '{field}' on job type '{job_type}' in the handler override or the defaults")]
    MissingField {
        /// Job type whose configuration is incomplete
        job_type: String,
        /// Name of the unresolved field
        field: &'static str,
    },
}

impl ConfigError {
    /// Name of the field this error is about
    pub fn field(&self) -> &'static str {
        match self {
            Self::Invalid { field, .. } => field,
            Self::MissingField { field, .. } => field,
        }
    }
}

/// Serde support for Option<Duration> as milliseconds
mod duration_millis_opt {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
