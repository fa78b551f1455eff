use std::str::FromStr;

use envconfig::Envconfig;
use thiserror::Error;

use log_common::config::{EnvMsDuration, NonEmptyString};

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "::")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3301")]
    pub port: u16,

    #[envconfig(from = "DATABASE_URL")]
    pub database_url: String,

    #[envconfig(from = "QUEUE_NAME")]
    pub queue_name: NonEmptyString,

    #[envconfig(from = "STORE_TABLE")]
    pub store_table: NonEmptyString,

    #[envconfig(from = "MAX_PG_CONNECTIONS", default = "10")]
    pub max_pg_connections: u32,

    #[envconfig(from = "WORKER_NAME", default = "worker")]
    pub worker_name: String,

    #[envconfig(from = "POLL_INTERVAL", default = "100")]
    pub poll_interval: EnvMsDuration,

    #[envconfig(from = "BATCH_SIZE", default = "10")]
    pub batch_size: usize,

    #[envconfig(from = "MAX_CONCURRENT_JOBS", default = "64")]
    pub max_concurrent_jobs: usize,

    /// How long a received message stays hidden from other consumers.
    #[envconfig(from = "VISIBILITY_TIMEOUT", default = "30000")]
    pub visibility_timeout: EnvMsDuration,

    /// Deadline for processing a single message. Keep it below the visibility timeout.
    #[envconfig(from = "PROCESSING_TIMEOUT", default = "25000")]
    pub processing_timeout: EnvMsDuration,

    #[envconfig(from = "FAULT_INJECTION_PROBABILITY", default = "0.0")]
    pub fault_injection_probability: Probability,

    #[envconfig(from = "FAULT_INJECTION_SEED")]
    pub fault_injection_seed: Option<u64>,

    #[envconfig(from = "SIMULATED_DELAY_PER_CHAR_MS", default = "0")]
    pub simulated_delay_per_char: EnvMsDuration,

    #[envconfig(from = "REDACTION_RULES", default = "phone")]
    pub redaction_rules: RuleNames,

    #[envconfig(from = "DEAD_LETTER_MALFORMED", default = "false")]
    pub dead_letter_malformed: bool,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(from = "RETRY_POLICY_BACKOFF_COEFFICIENT", default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(from = "RETRY_POLICY_INITIAL_INTERVAL", default = "1000")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(from = "RETRY_POLICY_MAXIMUM_INTERVAL", default = "100000")]
    pub maximum_interval: EnvMsDuration,
}

/// A probability within `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Probability(pub f64);

#[derive(Error, Debug, PartialEq, Eq)]
#[error("expected a probability between 0 and 1, got '{0}'")]
pub struct ParseProbabilityError(String);

impl FromStr for Probability {
    type Err = ParseProbabilityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s
            .trim()
            .parse::<f64>()
            .map_err(|_| ParseProbabilityError(s.to_owned()))?;

        if (0.0..=1.0).contains(&value) {
            Ok(Probability(value))
        } else {
            Err(ParseProbabilityError(s.to_owned()))
        }
    }
}

/// A comma separated list of redaction rule names, like `phone,email`.
/// Names are only checked against the known rules when the redactor is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleNames(pub Vec<String>);

#[derive(Error, Debug, PartialEq, Eq)]
#[error("expected at least one redaction rule name")]
pub struct NoRuleNamesError;

impl FromStr for RuleNames {
    type Err = NoRuleNamesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let names: Vec<String> = s
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_lowercase)
            .collect();

        if names.is_empty() {
            Err(NoRuleNamesError)
        } else {
            Ok(RuleNames(names))
        }
    }
}
