use std::time::Duration;

use serde::Serialize;

/// Token and request consumption reported by a job when it finishes one
/// attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUsage {
    /// Uncached input tokens.
    pub input_tokens: u64,
    /// Cached input tokens.
    pub cached_tokens: u64,
    /// Output tokens.
    pub output_tokens: u64,
    /// Requests actually issued.
    pub request_count: u64,
}

impl JobUsage {
    /// Tokens counted against token windows: input plus output.
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// One attempt's usage, annotated with the model it ran on and its cost.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEntry {
    /// Model the attempt ran on.
    pub model_id: String,
    /// Uncached input tokens.
    pub input_tokens: u64,
    /// Cached input tokens.
    pub cached_tokens: u64,
    /// Output tokens.
    pub output_tokens: u64,
    /// Requests actually issued.
    pub request_count: u64,
    /// Cost from the model's price table.
    pub cost: f64,
}

/// How one attempt of a job ended, reported by the job itself.
///
/// This is a closed alternative to callback pairs: the job returns exactly
/// one outcome, so there is no "callback fired twice / never" hazard.
#[derive(Debug)]
pub enum JobOutcome<T> {
    /// The attempt succeeded.
    Resolved {
        /// The job's result.
        value: T,
        /// What the attempt consumed.
        usage: JobUsage,
    },
    /// The attempt failed. With `delegate` set, the limiter refunds this
    /// model's reservation and retries on the next model in the escalation
    /// order; without it, the failure is surfaced to the caller.
    Rejected {
        /// What the attempt consumed, if anything.
        usage: Option<JobUsage>,
        /// Request fallback to another model.
        delegate: bool,
    },
}

impl<T> JobOutcome<T> {
    /// A successful attempt.
    pub fn resolved(value: T, usage: JobUsage) -> Self {
        Self::Resolved { value, usage }
    }

    /// A failed attempt asking to be retried on another model.
    pub fn delegate(usage: Option<JobUsage>) -> Self {
        Self::Rejected {
            usage,
            delegate: true,
        }
    }

    /// A failed attempt which should be surfaced to the caller.
    pub fn rejected(usage: Option<JobUsage>) -> Self {
        Self::Rejected {
            usage,
            delegate: false,
        }
    }
}

/// What the limiter tells a job about the attempt it is running.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Caller-facing job id.
    pub job_id: String,
    /// The job type admission ran under.
    pub job_type: String,
    /// The model selected for this attempt.
    pub model_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// A completed `queue_job` call.
#[derive(Debug)]
pub struct JobResult<T> {
    /// The job's result.
    pub value: T,
    /// The model the successful attempt ran on.
    pub model_used: String,
    /// One entry per attempt.
    pub usage: Vec<UsageEntry>,
    /// Total cost across attempts.
    pub total_cost: f64,
}

/// Summary of a finished job, kept in a bounded ring and passed to the
/// completion hooks.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedJob {
    /// Caller-facing job id.
    pub job_id: String,
    /// The job type admission ran under.
    pub job_type: String,
    /// Model of the successful attempt, absent for failed jobs.
    pub model_used: Option<String>,
    /// Whether the job succeeded.
    pub succeeded: bool,
    /// Total cost across attempts.
    pub total_cost: f64,
    /// One entry per attempt.
    pub usage: Vec<UsageEntry>,
}

/// Introspection record for a job currently inside `queue_job`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveJobInfo {
    /// Caller-facing job id.
    pub job_id: String,
    /// The job type admission ran under.
    pub job_type: String,
    /// Model the job is currently executing on.
    pub model_in_progress: Option<String>,
    /// Model the selector is currently waiting on.
    pub waiting_on_model: Option<String>,
    /// Remaining wait budget on that model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_wait_remaining: Option<Duration>,
    /// Models already tried by this job.
    pub tried_models: Vec<String>,
}

/// Hook invoked with the summary of a finished job.
pub type JobHook = Box<dyn FnOnce(&CompletedJob) + Send>;

/// Per-call options for [`queue_job`](crate::AdmissionLimiter::queue_job).
#[derive(Default)]
pub struct JobOptions {
    /// Caller-facing job id. Generated when absent.
    pub job_id: Option<String>,
    /// Job type to admit under. Defaults to `default`.
    pub job_type: Option<String>,
    /// Invoked after a successful job, before `queue_job` returns.
    pub on_complete: Option<JobHook>,
    /// Invoked after a failed job, before `queue_job` returns.
    pub on_error: Option<JobHook>,
}

impl std::fmt::Debug for JobOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobOptions")
            .field("job_id", &self.job_id)
            .field("job_type", &self.job_type)
            .field("on_complete", &self.on_complete.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl JobOptions {
    /// Options with an explicit job id.
    pub fn with_id(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            ..Self::default()
        }
    }

    /// Set the job type.
    pub fn job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }
}
