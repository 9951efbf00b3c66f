//! Pattern- and field-based redaction. Patterns apply to every string value
//! in the event (message included, nested values included); field paths
//! overwrite whatever they resolve to. Events below `redact_level` pass
//! through untouched.
//!
//! Pattern order is significant: more specific patterns must be listed
//! before more general ones, and replacement is non-overlapping.

use async_trait::async_trait;
use common::{
    errors::ProcessorError,
    EventValue,
    Level,
    LogEvent,
};
use regex::{
    Regex,
    RegexBuilder,
};

use super::{
    Processor,
    ProcessorOutcome,
};

/// Built-in PII patterns, in fixed order: credit-card, IPv4, phone, email.
/// The specific patterns come first so the general ones cannot eat their
/// matches.
pub const DEFAULT_PII_PATTERNS: &[&str] = &[
    r"\b\d{4}(?:[ -]?\d{4}){3}\b",
    r"\b(?:\d{1,3}\.){3}\d{1,3}\b",
    r"(?:\+?\d{1,3}[-.\s]?)?(?:\(?\d{3}\)?[-.\s]?)?\d{3}[-.\s]?\d{4}",
    r"[\w\.-]+@[\w\.-]+\.\w+",
];

pub struct RedactionProcessor {
    name: &'static str,
    patterns: Vec<Regex>,
    field_paths: Vec<String>,
    replacement: String,
    redact_level: Level,
}

impl RedactionProcessor {
    pub fn new(
        patterns: &[String],
        field_paths: Vec<String>,
        replacement: String,
        redact_level: Level,
    ) -> Result<Self, ProcessorError> {
        Self::with_name("redaction_processor", patterns, field_paths, replacement, redact_level)
    }

    /// The PII auto-redactor is the same mechanism with the built-in pattern
    /// set.
    pub fn auto_pii(replacement: String, redact_level: Level) -> Result<Self, ProcessorError> {
        let patterns: Vec<String> = DEFAULT_PII_PATTERNS
            .iter()
            .map(|p| p.to_string())
            .collect();
        Self::with_name("pii_redaction_processor", &patterns, Vec::new(), replacement, redact_level)
    }

    fn with_name(
        name: &'static str,
        patterns: &[String],
        field_paths: Vec<String>,
        replacement: String,
        redact_level: Level,
    ) -> Result<Self, ProcessorError> {
        let mut compiled = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let regex = RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| {
                    ProcessorError::configuration(name, format!("invalid pattern `{pattern}`: {e}"))
                })?;
            compiled.push(regex);
        }
        Ok(Self {
            name,
            patterns: compiled,
            field_paths,
            replacement,
            redact_level,
        })
    }

    /// Non-overlapping replacement, patterns in declared order. Splicing
    /// runs back to front so match spans stay valid.
    fn redact_string(&self, value: &str) -> String {
        let mut redacted = value.to_string();
        for pattern in &self.patterns {
            let spans: Vec<(usize, usize)> = pattern
                .find_iter(&redacted)
                .map(|m| (m.start(), m.end()))
                .collect();
            for (start, end) in spans.into_iter().rev() {
                if &redacted[start..end] != self.replacement {
                    redacted.replace_range(start..end, &self.replacement);
                }
            }
        }
        redacted
    }

    fn redact_value(&self, value: &mut EventValue) {
        match value {
            EventValue::String(s) => {
                let redacted = self.redact_string(s);
                if redacted != *s {
                    *s = redacted;
                }
            },
            EventValue::List(items) => {
                for item in items {
                    self.redact_value(item);
                }
            },
            EventValue::Map(entries) => {
                for item in entries.values_mut() {
                    self.redact_value(item);
                }
            },
            _ => {},
        }
    }
}

#[async_trait]
impl Processor for RedactionProcessor {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn process(&self, event: &mut LogEvent) -> Result<ProcessorOutcome, ProcessorError> {
        if event.level < self.redact_level {
            return Ok(ProcessorOutcome::Continue);
        }

        if !self.patterns.is_empty() {
            let message = self.redact_string(&event.message);
            if message != event.message {
                event.message = message;
            }
            for value in event.fields.values_mut() {
                self.redact_value(value);
            }
        }

        let replacement = EventValue::String(self.replacement.clone());
        for path in &self.field_paths {
            event.replace_at_path(path, &replacement);
        }
        Ok(ProcessorOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use common::{
        EventValue,
        Level,
        LogEvent,
    };

    use super::RedactionProcessor;
    use crate::processors::Processor;

    fn test_event(level: Level, message: &str) -> LogEvent {
        LogEvent::new(Utc::now(), level, message)
    }

    fn card_redactor() -> RedactionProcessor {
        RedactionProcessor::new(
            &[r"\b\d{16}\b".to_string()],
            Vec::new(),
            "REDACTED".to_string(),
            Level::Info,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_redacts_message_pattern() {
        let redactor = card_redactor();
        let mut event = test_event(Level::Info, "card 4111111111111111");
        redactor.process(&mut event).await.unwrap();
        assert_eq!(event.message, "card REDACTED");
    }

    #[tokio::test]
    async fn test_below_redact_level_passes_through() {
        let redactor = card_redactor();
        let mut event = test_event(Level::Debug, "card 4111111111111111");
        redactor.process(&mut event).await.unwrap();
        assert_eq!(event.message, "card 4111111111111111");
    }

    #[tokio::test]
    async fn test_redacts_nested_field_values() {
        let redactor = card_redactor();
        let mut event = test_event(Level::Warn, "payment");
        event.insert(
            "details",
            EventValue::Map(maplit::btreemap! {
                "card".to_string() => EventValue::from("4111111111111111"),
            }),
        );
        redactor.process(&mut event).await.unwrap();
        let EventValue::Map(details) = event.get("details").unwrap() else {
            panic!("expected map");
        };
        assert_eq!(details["card"], EventValue::from("REDACTED"));
    }

    #[tokio::test]
    async fn test_field_path_redaction() {
        let redactor = RedactionProcessor::new(
            &[],
            vec!["user.password".to_string()],
            "***".to_string(),
            Level::Info,
        )
        .unwrap();
        let mut event = test_event(Level::Info, "login");
        event.insert(
            "user",
            EventValue::Map(maplit::btreemap! {
                "password".to_string() => EventValue::from("hunter2"),
                "name".to_string() => EventValue::from("sam"),
            }),
        );
        redactor.process(&mut event).await.unwrap();
        let EventValue::Map(user) = event.get("user").unwrap() else {
            panic!("expected map");
        };
        assert_eq!(user["password"], EventValue::from("***"));
        assert_eq!(user["name"], EventValue::from("sam"));
    }

    #[tokio::test]
    async fn test_auto_pii_order_credit_card_before_phone() {
        let redactor =
            RedactionProcessor::auto_pii("[PII]".to_string(), Level::Debug).unwrap();
        let mut event = test_event(
            Level::Info,
            "card 4111 1111 1111 1111 ip 10.0.0.1 mail a@b.io",
        );
        redactor.process(&mut event).await.unwrap();
        assert_eq!(event.message, "card [PII] ip [PII] mail [PII]");
    }

    #[tokio::test]
    async fn test_invalid_pattern_is_configuration_error() {
        let result = RedactionProcessor::new(
            &["(unclosed".to_string()],
            Vec::new(),
            "x".to_string(),
            Level::Info,
        );
        assert!(result.is_err());
    }
}
