use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::LimiterError;

/// Price per one million tokens, by token category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Pricing {
    /// Price per 1e6 input tokens.
    #[serde(default)]
    pub input: f64,
    /// Price per 1e6 cached input tokens.
    #[serde(default)]
    pub cached: f64,
    /// Price per 1e6 output tokens.
    #[serde(default)]
    pub output: f64,
}

/// Cost of one event when its actual cost is unknown at admission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ResourceEstimates {
    /// Requests reserved per event.
    #[serde(default = "default_one")]
    pub estimated_number_of_requests: u64,
    /// Tokens reserved per event.
    #[serde(default)]
    pub estimated_used_tokens: u64,
    /// Working-set memory reserved per event, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_used_memory_kb: Option<u64>,
}

fn default_one() -> u64 {
    1
}

impl Default for ResourceEstimates {
    fn default() -> Self {
        Self {
            estimated_number_of_requests: 1,
            estimated_used_tokens: 0,
            estimated_used_memory_kb: None,
        }
    }
}

/// Declared ceilings and pricing for one model.
///
/// Any absent ceiling means "no limit of that kind".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ModelConfig {
    /// Requests per minute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpm: Option<u64>,
    /// Requests per day.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpd: Option<u64>,
    /// Tokens per minute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tpm: Option<u64>,
    /// Tokens per day.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tpd: Option<u64>,
    /// In-flight request ceiling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_requests: Option<u64>,
    /// Price table used for per-attempt cost accounting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing: Option<Pricing>,
    /// Reservation shape when a job type declares no estimates of its own.
    #[serde(default)]
    pub resources_per_event: ResourceEstimates,
}

/// Share of the slot pool assigned to a job type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RatioConfig {
    /// Starting ratio. Ratios across job types should sum to 1; they are
    /// renormalized when they do not.
    pub initial_value: f64,
    /// Whether the adjustment loop may move this ratio.
    #[serde(default)]
    pub flexible: bool,
    /// Lower bound for adjustment, flexible ratios only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_ratio: Option<f64>,
    /// Upper bound for adjustment, flexible ratios only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ratio: Option<f64>,
}

/// Per-model slot clamp applied to a job type's availability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CapacityBounds {
    /// Minimum slots reported even when the computed share is lower.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<u64>,
    /// Maximum slots reported even when the computed share is higher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u64>,
}

/// Per-job-type settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct JobTypeConfig {
    /// Tokens reserved per event, overriding the model's estimate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_used_tokens: Option<u64>,
    /// Requests reserved per event, overriding the model's estimate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_number_of_requests: Option<u64>,
    /// Memory reserved per event, overriding the model's estimate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_used_memory_kb: Option<u64>,
    /// Slot pool share.
    pub ratio: RatioConfig,
    /// Per-model wait bound in milliseconds. 0 means fail-fast. Absent
    /// models use the default wait, which reaches into the next minute
    /// window.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub max_wait_ms: HashMap<String, u64>,
    /// Minimum allocated slots even when `floor(pool * ratio)` is 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_job_type_capacity: Option<u64>,
    /// Per-model slot clamps for distributed availability.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub capacity_bounds: HashMap<String, CapacityBounds>,
}

impl Default for JobTypeConfig {
    fn default() -> Self {
        Self {
            estimated_used_tokens: None,
            estimated_number_of_requests: None,
            estimated_used_memory_kb: None,
            ratio: RatioConfig {
                initial_value: 1.0,
                flexible: false,
                min_ratio: None,
                max_ratio: None,
            },
            max_wait_ms: HashMap::new(),
            min_job_type_capacity: None,
            capacity_bounds: HashMap::new(),
        }
    }
}

/// Parameters of the optional ratio adjustment loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RatioAdjustmentConfig {
    /// How long a flexible job type must stay pressured before its ratio
    /// grows.
    #[serde(default = "default_observation_window_ms")]
    pub observation_window_ms: u64,
    /// Ratio moved per adjustment.
    #[serde(default = "default_adjustment_step")]
    pub step: f64,
    /// In-flight over allocated fraction treated as pressure.
    #[serde(default = "default_pressure_threshold")]
    pub pressure_threshold: f64,
    /// Cadence of the adjustment check.
    #[serde(default = "default_adjustment_interval_ms")]
    pub interval_ms: u64,
}

fn default_observation_window_ms() -> u64 {
    10_000
}

fn default_adjustment_step() -> f64 {
    0.05
}

fn default_pressure_threshold() -> f64 {
    0.9
}

fn default_adjustment_interval_ms() -> u64 {
    1_000
}

impl Default for RatioAdjustmentConfig {
    fn default() -> Self {
        Self {
            observation_window_ms: default_observation_window_ms(),
            step: default_adjustment_step(),
            pressure_threshold: default_pressure_threshold(),
            interval_ms: default_adjustment_interval_ms(),
        }
    }
}

/// Top-level limiter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LimiterConfig {
    /// Identity of this instance in the fleet. Generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// Models in the order the selector tries them.
    pub escalation_order: Vec<String>,
    /// Per-model declared limits, keyed by model id.
    pub models: HashMap<String, ModelConfig>,
    /// Per-job-type settings, keyed by job type name. When empty, a single
    /// `default` job type owning the whole pool is installed.
    #[serde(default)]
    pub job_types: HashMap<String, JobTypeConfig>,
    /// Fraction of host free memory handed to the memory arbiter.
    #[serde(default = "default_free_memory_ratio")]
    pub free_memory_ratio: f64,
    /// Fixed memory pool size, bypassing the host probe. Useful under
    /// containers with opaque host memory, and in tests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_capacity_kb: Option<u64>,
    /// Cadence of the memory pool recalculation.
    #[serde(default = "default_memory_recalculation_interval_ms")]
    pub memory_recalculation_interval_ms: u64,
    /// Upper bound between capacity re-checks while a job waits on a model.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Cadence of coordinator heartbeats.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Completed jobs kept for introspection.
    #[serde(default = "default_completed_ring_size")]
    pub completed_ring_size: usize,
    /// Ratio adjustment loop, disabled when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ratio_adjustment: Option<RatioAdjustmentConfig>,
}

fn default_free_memory_ratio() -> f64 {
    0.5
}

fn default_memory_recalculation_interval_ms() -> u64 {
    30_000
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

fn default_completed_ring_size() -> usize {
    128
}

impl LimiterConfig {
    /// Check the configuration for inconsistencies which would otherwise
    /// surface as confusing admission behaviour at runtime.
    pub fn validate(&self) -> Result<(), LimiterError> {
        if self.escalation_order.is_empty() {
            return Err(LimiterError::InvalidConfig(
                "escalation order must name at least one model".into(),
            ));
        }
        for model_id in &self.escalation_order {
            if !self.models.contains_key(model_id) {
                return Err(LimiterError::InvalidConfig(format!(
                    "escalation order references undeclared model `{model_id}`"
                )));
            }
        }
        for (model_id, model) in &self.models {
            if !self.escalation_order.iter().any(|id| id == model_id) {
                return Err(LimiterError::InvalidConfig(format!(
                    "model `{model_id}` is missing from the escalation order"
                )));
            }
            let token_limited = model.tpm.is_some() || model.tpd.is_some();
            if token_limited && model.resources_per_event.estimated_used_tokens == 0 {
                let typed = self
                    .job_types
                    .values()
                    .all(|job_type| job_type.estimated_used_tokens.unwrap_or(0) > 0);
                if self.job_types.is_empty() || !typed {
                    return Err(LimiterError::InvalidConfig(format!(
                        "model `{model_id}` has a token limit but no token estimate"
                    )));
                }
            }
            if model.resources_per_event.estimated_number_of_requests == 0 {
                return Err(LimiterError::InvalidConfig(format!(
                    "model `{model_id}` must estimate at least one request per event"
                )));
            }
        }
        for (name, job_type) in &self.job_types {
            let ratio = job_type.ratio.initial_value;
            if !(0.0..=1.0).contains(&ratio) {
                return Err(LimiterError::InvalidConfig(format!(
                    "job type `{name}` ratio {ratio} is outside [0, 1]"
                )));
            }
            for model_id in job_type.max_wait_ms.keys() {
                if !self.models.contains_key(model_id) {
                    return Err(LimiterError::InvalidConfig(format!(
                        "job type `{name}` sets maxWait for undeclared model `{model_id}`"
                    )));
                }
            }
        }
        if !(0.0..=1.0).contains(&self.free_memory_ratio) {
            return Err(LimiterError::InvalidConfig(format!(
                "free memory ratio {} is outside [0, 1]",
                self.free_memory_ratio
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(LimiterError::InvalidConfig(
                "poll interval must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Job types, with the implicit `default` type installed when none are
    /// configured.
    pub(crate) fn effective_job_types(&self) -> HashMap<String, JobTypeConfig> {
        if self.job_types.is_empty() {
            let mut types = HashMap::new();
            types.insert("default".to_owned(), JobTypeConfig::default());
            types
        } else {
            self.job_types.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> LimiterConfig {
        serde_json::from_value(serde_json::json!({
            "escalationOrder": ["primary"],
            "models": {
                "primary": {
                    "rpm": 60,
                    "resourcesPerEvent": { "estimatedNumberOfRequests": 1 }
                }
            }
        }))
        .expect("minimal config should parse")
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config = minimal_config();
        assert_eq!(config.poll_interval_ms, 100);
        assert_eq!(config.free_memory_ratio, 0.5);
        config.validate().unwrap();

        let job_types = config.effective_job_types();
        assert!(job_types.contains_key("default"));
        assert_eq!(job_types["default"].ratio.initial_value, 1.0);
    }

    #[test]
    fn rejects_unknown_fields() {
        let result: Result<LimiterConfig, _> = serde_json::from_value(serde_json::json!({
            "escalationOrder": ["primary"],
            "models": { "primary": {} },
            "burstiness": 3
        }));
        assert!(result.is_err());
    }

    #[test]
    fn rejects_unknown_model_in_escalation_order() {
        let mut config = minimal_config();
        config.escalation_order.push("phantom".into());
        assert!(matches!(
            config.validate(),
            Err(LimiterError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_token_limit_without_estimate() {
        let mut config = minimal_config();
        config.models.get_mut("primary").unwrap().tpm = Some(1000);
        assert!(matches!(
            config.validate(),
            Err(LimiterError::InvalidConfig(_))
        ));
    }

    #[test]
    fn accepts_token_limit_with_job_type_estimates() {
        let mut config = minimal_config();
        config.models.get_mut("primary").unwrap().tpm = Some(1000);
        config.job_types.insert(
            "chat".into(),
            JobTypeConfig {
                estimated_used_tokens: Some(100),
                ..JobTypeConfig::default()
            },
        );
        config.validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_ratio() {
        let mut config = minimal_config();
        config.job_types.insert(
            "chat".into(),
            JobTypeConfig {
                ratio: RatioConfig {
                    initial_value: 1.5,
                    flexible: false,
                    min_ratio: None,
                    max_ratio: None,
                },
                ..JobTypeConfig::default()
            },
        );
        assert!(matches!(
            config.validate(),
            Err(LimiterError::InvalidConfig(_))
        ));
    }
}
