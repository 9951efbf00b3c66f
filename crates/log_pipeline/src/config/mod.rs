//! Per-container settings: programmatic construction, environment loading,
//! and validation. Validation runs once inside `Container::configure` and is
//! the only place configuration errors can surface.

use std::time::Duration;

use common::{
    errors::ConfigurationError,
    Level,
};
use serde::Deserialize;

use crate::consts;

mod env;
pub mod uri;

pub use uri::{
    QueryValue,
    SinkUri,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum OverflowPolicy {
    Drop,
    Block,
    Sample,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ConsoleFormat {
    Auto,
    Json,
    Pretty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ThrottleStrategy {
    Drop,
    Sample,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoreSettings {
    /// Minimum level at which events enter the chain.
    pub level: Level,
    pub json_console: ConsoleFormat,
    /// Ordered sink URIs.
    pub sinks: Vec<String>,
    /// Global pre-queue sampling in [0, 1].
    pub sampling_rate: f64,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            level: Level::Info,
            json_console: ConsoleFormat::Auto,
            sinks: vec!["stdout".to_string()],
            sampling_rate: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub enabled: bool,
    pub maxsize: usize,
    pub overflow: OverflowPolicy,
    pub batch_size: usize,
    /// Max wait in seconds for the first event of a worker batch.
    pub batch_timeout: f64,
    /// Base retry delay in seconds.
    pub retry_delay: f64,
    pub max_retries: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            maxsize: consts::DEFAULT_QUEUE_MAXSIZE,
            overflow: OverflowPolicy::Drop,
            batch_size: consts::DEFAULT_BATCH_SIZE,
            batch_timeout: consts::DEFAULT_BATCH_TIMEOUT.as_secs_f64(),
            retry_delay: consts::DEFAULT_RETRY_DELAY.as_secs_f64(),
            max_retries: consts::DEFAULT_MAX_RETRIES,
        }
    }
}

impl QueueSettings {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.batch_timeout)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecuritySettings {
    pub redact_patterns: Vec<String>,
    /// Dotted paths into event fields.
    pub redact_fields: Vec<String>,
    pub redact_replacement: String,
    /// Minimum level at which redaction applies.
    pub redact_level: Level,
    pub enable_auto_redact_pii: bool,
    pub enable_throttling: bool,
    pub throttle_max_rate: usize,
    pub throttle_window_seconds: u64,
    pub throttle_key_field: String,
    pub throttle_strategy: ThrottleStrategy,
    pub enable_deduplication: bool,
    pub dedupe_window_seconds: u64,
    pub dedupe_fields: Vec<String>,
    pub dedupe_max_cache_size: usize,
    pub dedupe_hash_algorithm: HashAlgorithm,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            redact_patterns: Vec::new(),
            redact_fields: Vec::new(),
            redact_replacement: "REDACTED".to_string(),
            redact_level: Level::Info,
            enable_auto_redact_pii: false,
            enable_throttling: false,
            throttle_max_rate: consts::DEFAULT_THROTTLE_MAX_RATE,
            throttle_window_seconds: consts::DEFAULT_THROTTLE_WINDOW.as_secs(),
            throttle_key_field: consts::DEFAULT_THROTTLE_KEY_FIELD.to_string(),
            throttle_strategy: ThrottleStrategy::Drop,
            enable_deduplication: false,
            dedupe_window_seconds: consts::DEFAULT_DEDUPE_WINDOW.as_secs(),
            dedupe_fields: vec!["event".to_string(), "level".to_string()],
            dedupe_max_cache_size: consts::DEFAULT_DEDUPE_MAX_CACHE_SIZE,
            dedupe_hash_algorithm: HashAlgorithm::Md5,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ValidationSettings {
    pub enabled: bool,
    pub required_fields: Vec<String>,
    /// Field name to expected type name (bool, integer, float, string,
    /// timestamp, list, map).
    pub field_types: std::collections::BTreeMap<String, String>,
    pub mode: ValidationModeSetting,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ValidationModeSetting {
    Strict,
    #[default]
    Lenient,
    Fix,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,
    /// Number of latency samples kept for moving averages.
    pub sample_window: usize,
    pub prometheus_enabled: bool,
    pub prometheus_host: String,
    pub prometheus_port: u16,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_window: consts::DEFAULT_METRICS_SAMPLE_WINDOW,
            prometheus_enabled: false,
            prometheus_host: consts::DEFAULT_PROMETHEUS_HOST.to_string(),
            prometheus_port: consts::DEFAULT_PROMETHEUS_PORT,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub core: CoreSettings,
    pub queue: QueueSettings,
    pub security: SecuritySettings,
    pub validation: ValidationSettings,
    pub metrics: MetricsSettings,
}

impl Settings {
    /// Load settings from `LOGWIRE_*` environment variables on top of the
    /// defaults.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        let mut settings = Settings::default();

        if let Some(level) = env::parse("LOGWIRE_LEVEL", "a log level (DEBUG..CRITICAL)")? {
            settings.core.level = level;
        }
        if let Some(format) = env::parse("LOGWIRE_JSON_CONSOLE", "one of auto, json, pretty")? {
            settings.core.json_console = format;
        }
        if let Some(sinks) = env::parse_list("LOGWIRE_SINKS") {
            settings.core.sinks = sinks;
        }
        if let Some(rate) = env::parse("LOGWIRE_SAMPLING_RATE", "a float in [0, 1]")? {
            settings.core.sampling_rate = rate;
        }

        if let Some(enabled) = env::parse_bool("LOGWIRE_QUEUE_ENABLED")? {
            settings.queue.enabled = enabled;
        }
        if let Some(maxsize) = env::parse("LOGWIRE_QUEUE_MAXSIZE", "an integer > 0")? {
            settings.queue.maxsize = maxsize;
        }
        if let Some(overflow) = env::parse("LOGWIRE_QUEUE_OVERFLOW", "one of drop, block, sample")? {
            settings.queue.overflow = overflow;
        }
        if let Some(batch_size) = env::parse("LOGWIRE_QUEUE_BATCH_SIZE", "an integer >= 1")? {
            settings.queue.batch_size = batch_size;
        }
        if let Some(batch_timeout) = env::parse("LOGWIRE_QUEUE_BATCH_TIMEOUT", "a float > 0")? {
            settings.queue.batch_timeout = batch_timeout;
        }
        if let Some(retry_delay) = env::parse("LOGWIRE_QUEUE_RETRY_DELAY", "a float > 0")? {
            settings.queue.retry_delay = retry_delay;
        }
        if let Some(max_retries) = env::parse("LOGWIRE_QUEUE_MAX_RETRIES", "an integer >= 0")? {
            settings.queue.max_retries = max_retries;
        }

        if let Some(patterns) = env::parse_list("LOGWIRE_REDACT_PATTERNS") {
            settings.security.redact_patterns = patterns;
        }
        if let Some(fields) = env::parse_list("LOGWIRE_REDACT_FIELDS") {
            settings.security.redact_fields = fields;
        }
        if let Some(replacement) = env::read("LOGWIRE_REDACT_REPLACEMENT") {
            settings.security.redact_replacement = replacement;
        }
        if let Some(level) = env::parse("LOGWIRE_REDACT_LEVEL", "a log level (DEBUG..CRITICAL)")? {
            settings.security.redact_level = level;
        }
        if let Some(enabled) = env::parse_bool("LOGWIRE_ENABLE_AUTO_REDACT_PII")? {
            settings.security.enable_auto_redact_pii = enabled;
        }

        if let Some(enabled) = env::parse_bool("LOGWIRE_ENABLE_THROTTLING")? {
            settings.security.enable_throttling = enabled;
        }
        if let Some(max_rate) = env::parse("LOGWIRE_THROTTLE_MAX_RATE", "an integer > 0")? {
            settings.security.throttle_max_rate = max_rate;
        }
        if let Some(window) = env::parse("LOGWIRE_THROTTLE_WINDOW_SECONDS", "an integer > 0")? {
            settings.security.throttle_window_seconds = window;
        }
        if let Some(key_field) = env::read("LOGWIRE_THROTTLE_KEY_FIELD") {
            settings.security.throttle_key_field = key_field;
        }
        if let Some(strategy) = env::parse("LOGWIRE_THROTTLE_STRATEGY", "one of drop, sample")? {
            settings.security.throttle_strategy = strategy;
        }

        if let Some(enabled) = env::parse_bool("LOGWIRE_ENABLE_DEDUPLICATION")? {
            settings.security.enable_deduplication = enabled;
        }
        if let Some(window) = env::parse("LOGWIRE_DEDUPE_WINDOW_SECONDS", "an integer > 0")? {
            settings.security.dedupe_window_seconds = window;
        }
        if let Some(fields) = env::parse_list("LOGWIRE_DEDUPE_FIELDS") {
            settings.security.dedupe_fields = fields;
        }
        if let Some(size) = env::parse("LOGWIRE_DEDUPE_MAX_CACHE_SIZE", "an integer > 0")? {
            settings.security.dedupe_max_cache_size = size;
        }
        if let Some(algorithm) =
            env::parse("LOGWIRE_DEDUPE_HASH_ALGORITHM", "one of md5, sha1, sha256")?
        {
            settings.security.dedupe_hash_algorithm = algorithm;
        }

        if let Some(enabled) = env::parse_bool("LOGWIRE_VALIDATION_ENABLED")? {
            settings.validation.enabled = enabled;
        }
        if let Some(fields) = env::parse_list("LOGWIRE_VALIDATION_REQUIRED_FIELDS") {
            settings.validation.required_fields = fields;
        }
        if let Some(mode) =
            env::parse("LOGWIRE_VALIDATION_MODE", "one of strict, lenient, fix")?
        {
            settings.validation.mode = mode;
        }

        if let Some(enabled) = env::parse_bool("LOGWIRE_METRICS_ENABLED")? {
            settings.metrics.enabled = enabled;
        }
        if let Some(window) = env::parse("LOGWIRE_METRICS_SAMPLE_WINDOW", "an integer > 0")? {
            settings.metrics.sample_window = window;
        }
        if let Some(enabled) = env::parse_bool("LOGWIRE_PROMETHEUS_ENABLED")? {
            settings.metrics.prometheus_enabled = enabled;
        }
        if let Some(host) = env::read("LOGWIRE_PROMETHEUS_HOST") {
            settings.metrics.prometheus_host = host;
        }
        if let Some(port) = env::parse("LOGWIRE_PROMETHEUS_PORT", "a port number")? {
            settings.metrics.prometheus_port = port;
        }

        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !(0.0..=1.0).contains(&self.core.sampling_rate) {
            return Err(ConfigurationError::new(
                "core.sampling_rate",
                self.core.sampling_rate.to_string(),
                "a float in [0, 1]",
            ));
        }
        if self.core.sinks.is_empty() {
            return Err(ConfigurationError::new(
                "core.sinks",
                "[]",
                "at least one sink URI",
            ));
        }
        for sink in &self.core.sinks {
            SinkUri::parse(sink)?;
        }

        if self.queue.maxsize == 0 {
            return Err(ConfigurationError::new(
                "queue.maxsize",
                "0",
                "an integer > 0",
            ));
        }
        if self.queue.batch_size == 0 {
            return Err(ConfigurationError::new(
                "queue.batch_size",
                "0",
                "an integer >= 1",
            ));
        }
        if self.queue.batch_timeout <= 0.0 {
            return Err(ConfigurationError::new(
                "queue.batch_timeout",
                self.queue.batch_timeout.to_string(),
                "a float > 0",
            ));
        }
        if self.queue.retry_delay <= 0.0 {
            return Err(ConfigurationError::new(
                "queue.retry_delay",
                self.queue.retry_delay.to_string(),
                "a float > 0",
            ));
        }

        for pattern in &self.security.redact_patterns {
            if let Err(e) = regex::Regex::new(pattern) {
                return Err(ConfigurationError::new(
                    "security.redact_patterns",
                    pattern,
                    format!("a valid regex ({e})"),
                ));
            }
        }
        if self.security.enable_throttling {
            if self.security.throttle_max_rate == 0 {
                return Err(ConfigurationError::new(
                    "security.throttle_max_rate",
                    "0",
                    "an integer > 0",
                ));
            }
            if self.security.throttle_window_seconds == 0 {
                return Err(ConfigurationError::new(
                    "security.throttle_window_seconds",
                    "0",
                    "an integer > 0",
                ));
            }
            if self.security.throttle_key_field.trim().is_empty() {
                return Err(ConfigurationError::new(
                    "security.throttle_key_field",
                    &self.security.throttle_key_field,
                    "a non-empty field name",
                ));
            }
        }
        if self.security.enable_deduplication {
            if self.security.dedupe_window_seconds == 0 {
                return Err(ConfigurationError::new(
                    "security.dedupe_window_seconds",
                    "0",
                    "an integer > 0",
                ));
            }
            if self.security.dedupe_fields.is_empty() {
                return Err(ConfigurationError::new(
                    "security.dedupe_fields",
                    "[]",
                    "at least one signature field",
                ));
            }
            if self.security.dedupe_max_cache_size == 0 {
                return Err(ConfigurationError::new(
                    "security.dedupe_max_cache_size",
                    "0",
                    "an integer > 0",
                ));
            }
        }

        if self.validation.enabled {
            for (field, type_name) in &self.validation.field_types {
                if type_name
                    .parse::<crate::processors::validate::FieldType>()
                    .is_err()
                {
                    return Err(ConfigurationError::new(
                        format!("validation.field_types.{field}"),
                        type_name,
                        "one of bool, integer, float, string, timestamp, list, map",
                    ));
                }
            }
        }

        if self.metrics.sample_window == 0 {
            return Err(ConfigurationError::new(
                "metrics.sample_window",
                "0",
                "an integer > 0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use common::Level;

    use super::{
        OverflowPolicy,
        Settings,
    };

    #[test]
    fn test_defaults_validate() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn test_invalid_sampling_rate() {
        let mut settings = Settings::default();
        settings.core.sampling_rate = 1.5;
        let err = settings.validate().unwrap_err();
        assert_eq!(err.setting, "core.sampling_rate");
    }

    #[test]
    fn test_zero_queue_size_rejected() {
        let mut settings = Settings::default();
        settings.queue.maxsize = 0;
        let err = settings.validate().unwrap_err();
        assert_eq!(err.setting, "queue.maxsize");
    }

    #[test]
    fn test_bad_redact_pattern_rejected() {
        let mut settings = Settings::default();
        settings.security.redact_patterns = vec!["(unclosed".to_string()];
        let err = settings.validate().unwrap_err();
        assert_eq!(err.setting, "security.redact_patterns");
    }

    #[test]
    fn test_enum_parsing() {
        assert_eq!(
            "block".parse::<OverflowPolicy>().unwrap(),
            OverflowPolicy::Block
        );
        assert_eq!("WARN".parse::<Level>().unwrap(), Level::Warn);
    }

    #[test]
    fn test_validate_checks_sink_uris() {
        let mut settings = Settings::default();
        settings.core.sinks = vec!["bad_scheme://x".to_string()];
        assert!(settings.validate().is_err());
    }
}
