//! Schema-ish validation: required fields and expected types, with three
//! postures. Strict drops invalid events, lenient annotates them, fix
//! repairs what it can losslessly and drops what it cannot.

use std::collections::BTreeMap;

use async_trait::async_trait;
use common::{
    errors::ProcessorError,
    EventValue,
    LogEvent,
};

use super::{
    Processor,
    ProcessorOutcome,
};

pub const VALIDATION_ERRORS_KEY: &str = "_validation_errors";

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ValidationMode {
    Strict,
    Lenient,
    Fix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum FieldType {
    Bool,
    Integer,
    Float,
    String,
    Timestamp,
    List,
    Map,
}

impl FieldType {
    fn matches(&self, value: &EventValue) -> bool {
        matches!(
            (self, value),
            (FieldType::Bool, EventValue::Bool(_))
                | (FieldType::Integer, EventValue::Integer(_))
                | (FieldType::Float, EventValue::Float(_))
                | (FieldType::String, EventValue::String(_))
                | (FieldType::Timestamp, EventValue::Timestamp(_))
                | (FieldType::List, EventValue::List(_))
                | (FieldType::Map, EventValue::Map(_))
        )
    }

    /// Lossless coercion into this type, if one exists.
    fn coerce(&self, value: &EventValue) -> Option<EventValue> {
        match (self, value) {
            (FieldType::Float, EventValue::Integer(i)) => Some(EventValue::Float(*i as f64)),
            (FieldType::String, EventValue::Integer(i)) => {
                Some(EventValue::String(i.to_string()))
            },
            (FieldType::String, EventValue::Float(f)) => Some(EventValue::String(f.to_string())),
            (FieldType::String, EventValue::Bool(b)) => Some(EventValue::String(b.to_string())),
            (FieldType::Integer, EventValue::String(s)) => {
                s.parse::<i64>().ok().map(EventValue::Integer)
            },
            (FieldType::Float, EventValue::String(s)) => {
                s.parse::<f64>().ok().map(EventValue::Float)
            },
            (FieldType::Bool, EventValue::String(s)) => match s.as_str() {
                "true" => Some(EventValue::Bool(true)),
                "false" => Some(EventValue::Bool(false)),
                _ => None,
            },
            _ => None,
        }
    }
}

pub struct ValidationProcessor {
    required_fields: Vec<String>,
    field_types: BTreeMap<String, FieldType>,
    mode: ValidationMode,
}

impl ValidationProcessor {
    pub fn new(
        required_fields: Vec<String>,
        field_types: BTreeMap<String, FieldType>,
        mode: ValidationMode,
    ) -> Self {
        Self {
            required_fields,
            field_types,
            mode,
        }
    }

    fn collect_errors(&self, event: &LogEvent) -> Vec<String> {
        let mut errors = Vec::new();
        for field in &self.required_fields {
            if !event.contains_key(field) {
                errors.push(format!("missing required field `{field}`"));
            }
        }
        for (field, expected) in &self.field_types {
            if let Some(value) = event.get(field) {
                if !expected.matches(&value) {
                    errors.push(format!("field `{field}` is not of type {expected}"));
                }
            }
        }
        errors
    }

    fn try_fix(&self, event: &mut LogEvent) {
        // The typed core always carries timestamp/level/message, so repairs
        // only apply to map fields.
        for (field, expected) in &self.field_types {
            let Some(current) = event.fields.get(field) else {
                continue;
            };
            if expected.matches(current) {
                continue;
            }
            if let Some(coerced) = expected.coerce(current) {
                event.fields.insert(field.clone(), coerced);
            }
        }
    }
}

#[async_trait]
impl Processor for ValidationProcessor {
    fn name(&self) -> &'static str {
        "validation_processor"
    }

    async fn process(&self, event: &mut LogEvent) -> Result<ProcessorOutcome, ProcessorError> {
        let errors = self.collect_errors(event);
        if errors.is_empty() {
            return Ok(ProcessorOutcome::Continue);
        }
        match self.mode {
            ValidationMode::Strict => Ok(ProcessorOutcome::Drop),
            ValidationMode::Lenient => {
                event.insert(
                    VALIDATION_ERRORS_KEY,
                    EventValue::List(errors.into_iter().map(EventValue::from).collect()),
                );
                Ok(ProcessorOutcome::Continue)
            },
            ValidationMode::Fix => {
                self.try_fix(event);
                if self.collect_errors(event).is_empty() {
                    Ok(ProcessorOutcome::Continue)
                } else {
                    Ok(ProcessorOutcome::Drop)
                }
            },
        }
    }
}
