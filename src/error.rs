use thiserror::Error;

use crate::job::UsageEntry;

/// Boxed error type carried by user-job failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by the limiter.
#[derive(Debug, Error)]
pub enum LimiterError {
    /// Local selection timed out on every model in the escalation order.
    #[error("no capacity available within maxWait on any model")]
    AllModelsExhausted,

    /// The coordination backend refused admission on every model.
    #[error("every model was rejected by the coordination backend")]
    AllModelsRejectedByBackend,

    /// A model id which was never declared.
    #[error("unknown model `{0}`")]
    UnknownModel(String),

    /// A job type which was never declared.
    #[error("unknown job type `{0}`")]
    UnknownJobType(String),

    /// The configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The coordination backend failed while deciding admission.
    #[error("coordinator error")]
    Coordinator(#[source] BoxError),

    /// The job reported failure without requesting delegation.
    #[error("job `{job_id}` was rejected")]
    JobRejected {
        /// Caller-facing job id.
        job_id: String,
        /// Usage accumulated across attempts.
        usage: Vec<UsageEntry>,
        /// Total cost accumulated across attempts.
        total_cost: f64,
    },

    /// The job future returned an error.
    #[error("job `{job_id}` failed")]
    JobFailed {
        /// Caller-facing job id.
        job_id: String,
        /// Usage accumulated across attempts.
        usage: Vec<UsageEntry>,
        /// Total cost accumulated across attempts.
        total_cost: f64,
        /// The underlying error.
        #[source]
        source: BoxError,
    },
}
