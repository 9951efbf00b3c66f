//! Environment variable parsing helpers. Unset and empty variables mean
//! "use the default"; present-but-malformed values are configuration errors
//! that name the variable.

use std::{
    env,
    str::FromStr,
};

use common::errors::ConfigurationError;

pub(crate) fn read(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.is_empty())
}

pub(crate) fn parse<T: FromStr>(
    name: &str,
    expected: &str,
) -> Result<Option<T>, ConfigurationError> {
    match read(name) {
        None => Ok(None),
        Some(raw) => match raw.parse::<T>() {
            Ok(value) => Ok(Some(value)),
            Err(_) => Err(ConfigurationError::new(name, raw, expected)),
        },
    }
}

pub(crate) fn parse_bool(name: &str) -> Result<Option<bool>, ConfigurationError> {
    match read(name) {
        None => Ok(None),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(Some(true)),
            "false" | "0" | "no" => Ok(Some(false)),
            _ => Err(ConfigurationError::new(name, raw, "a boolean (true/false)")),
        },
    }
}

/// Comma-separated list; entries are trimmed, empties dropped.
pub(crate) fn parse_list(name: &str) -> Option<Vec<String>> {
    read(name).map(|raw| {
        raw.split(',')
            .map(|entry| entry.trim().to_string())
            .filter(|entry| !entry.is_empty())
            .collect()
    })
}
