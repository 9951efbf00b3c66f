use std::{
    collections::BTreeMap,
    fmt,
};

use chrono::{
    DateTime,
    SecondsFormat,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
    Serializer,
};
use serde_json::Value as JsonValue;

/// Severity of a log event. Comparisons are numeric on the weight, so
/// `Level::Warn >= Level::Info`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum Level {
    Debug = 10,
    Info = 20,
    Warn = 30,
    Error = 40,
    Critical = 50,
}

impl Level {
    pub fn weight(self) -> u8 {
        self as u8
    }
}

/// A single value in a structured log event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    List(Vec<EventValue>),
    Map(BTreeMap<String, EventValue>),
}

impl EventValue {
    pub fn is_null(&self) -> bool {
        matches!(self, EventValue::Null)
    }

    pub fn is_scalar(&self) -> bool {
        !matches!(
            self,
            EventValue::List(_) | EventValue::Map(_) | EventValue::Null
        )
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            EventValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Project into JSON. Byte strings become base64, timestamps ISO-8601.
    pub fn to_json(&self) -> JsonValue {
        match self {
            EventValue::Null => JsonValue::Null,
            EventValue::Bool(b) => JsonValue::Bool(*b),
            EventValue::Integer(i) => JsonValue::from(*i),
            EventValue::Float(f) => JsonValue::from(*f),
            EventValue::String(s) => JsonValue::String(s.clone()),
            EventValue::Bytes(b) => JsonValue::String(base64::encode(b)),
            EventValue::Timestamp(ts) => {
                JsonValue::String(ts.to_rfc3339_opts(SecondsFormat::Micros, true))
            },
            EventValue::List(items) => {
                JsonValue::Array(items.iter().map(|v| v.to_json()).collect())
            },
            EventValue::Map(entries) => JsonValue::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Lossy inverse of `to_json`: bytes and timestamps come back as strings.
    pub fn from_json(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => EventValue::Null,
            JsonValue::Bool(b) => EventValue::Bool(b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    EventValue::Integer(i)
                } else {
                    EventValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            },
            JsonValue::String(s) => EventValue::String(s),
            JsonValue::Array(items) => {
                EventValue::List(items.into_iter().map(EventValue::from_json).collect())
            },
            JsonValue::Object(entries) => EventValue::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, EventValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Best-effort string form, used for per-key state such as throttling.
    pub fn to_key_string(&self) -> String {
        match self {
            EventValue::String(s) => s.clone(),
            other => other.to_json().to_string(),
        }
    }
}

impl Serialize for EventValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl fmt::Display for EventValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl From<&str> for EventValue {
    fn from(value: &str) -> Self {
        EventValue::String(value.to_string())
    }
}

impl From<String> for EventValue {
    fn from(value: String) -> Self {
        EventValue::String(value)
    }
}

impl From<bool> for EventValue {
    fn from(value: bool) -> Self {
        EventValue::Bool(value)
    }
}

impl From<i64> for EventValue {
    fn from(value: i64) -> Self {
        EventValue::Integer(value)
    }
}

impl From<u32> for EventValue {
    fn from(value: u32) -> Self {
        EventValue::Integer(i64::from(value))
    }
}

impl From<f64> for EventValue {
    fn from(value: f64) -> Self {
        EventValue::Float(value)
    }
}

impl From<DateTime<Utc>> for EventValue {
    fn from(value: DateTime<Utc>) -> Self {
        EventValue::Timestamp(value)
    }
}

/// Keys the pipeline itself populates. Everything else in an event is
/// caller-supplied.
pub mod reserved {
    pub const TIMESTAMP: &str = "timestamp";
    pub const LEVEL: &str = "level";
    pub const EVENT: &str = "event";
    pub const MESSAGE: &str = "message";
    pub const TRACE_ID: &str = "trace_id";
    pub const SPAN_ID: &str = "span_id";
    pub const HOSTNAME: &str = "hostname";
    pub const PID: &str = "pid";
}

/// A structured log event: a typed core plus caller-supplied fields.
///
/// Events are mutable while the processor chain owns them and are shared as
/// `Arc<LogEvent>` once enqueued, so the worker can never observe later
/// caller mutations.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub message: String,
    pub fields: BTreeMap<String, EventValue>,
}

impl LogEvent {
    pub fn new(timestamp: DateTime<Utc>, level: Level, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            level,
            message: message.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<EventValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Resolve a key against the typed core first, then the field map.
    pub fn get(&self, key: &str) -> Option<EventValue> {
        match key {
            reserved::TIMESTAMP => Some(EventValue::Timestamp(self.timestamp)),
            reserved::LEVEL => Some(EventValue::String(self.level.to_string())),
            reserved::EVENT | reserved::MESSAGE => {
                Some(EventValue::String(self.message.clone()))
            },
            _ => self.fields.get(key).cloned(),
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        matches!(
            key,
            reserved::TIMESTAMP | reserved::LEVEL | reserved::EVENT | reserved::MESSAGE
        ) || self.fields.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<EventValue>) {
        self.fields.insert(key.into(), value.into());
    }

    /// All addressable keys, reserved first. Used for error context.
    pub fn keys(&self) -> Vec<String> {
        let mut keys = vec![
            reserved::TIMESTAMP.to_string(),
            reserved::LEVEL.to_string(),
            reserved::EVENT.to_string(),
        ];
        keys.extend(self.fields.keys().cloned());
        keys
    }

    /// Replace the value at a dotted path with `replacement`, if the path
    /// resolves. Lists along the way apply the remaining path to each
    /// mapping element. Returns whether anything was replaced.
    pub fn replace_at_path(&mut self, path: &str, replacement: &EventValue) -> bool {
        let segments: Vec<&str> = path.split('.').collect();
        let Some((first, rest)) = segments.split_first() else {
            return false;
        };
        match *first {
            reserved::EVENT | reserved::MESSAGE if rest.is_empty() => {
                if let EventValue::String(s) = replacement {
                    self.message = s.clone();
                    return true;
                }
                false
            },
            _ => {
                if rest.is_empty() {
                    match self.fields.get_mut(*first) {
                        Some(slot) => {
                            *slot = replacement.clone();
                            true
                        },
                        None => false,
                    }
                } else {
                    match self.fields.get_mut(*first) {
                        Some(value) => replace_in_value(value, rest, replacement),
                        None => false,
                    }
                }
            },
        }
    }

    /// Project the whole event into a JSON object. The message renders under
    /// the `event` key and the timestamp as ISO-8601 UTC.
    pub fn to_json_map(&self) -> serde_json::Map<String, JsonValue> {
        let mut map = serde_json::Map::new();
        map.insert(
            reserved::TIMESTAMP.to_string(),
            JsonValue::String(self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
        map.insert(
            reserved::LEVEL.to_string(),
            JsonValue::String(self.level.to_string()),
        );
        map.insert(
            reserved::EVENT.to_string(),
            JsonValue::String(self.message.clone()),
        );
        for (key, value) in &self.fields {
            map.insert(key.clone(), value.to_json());
        }
        map
    }

    /// Length of the compact JSON rendering, used for byte accounting.
    pub fn serialized_len(&self) -> usize {
        serde_json::to_string(&self.to_json_map())
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

fn replace_in_value(value: &mut EventValue, segments: &[&str], replacement: &EventValue) -> bool {
    let Some((first, rest)) = segments.split_first() else {
        return false;
    };
    match value {
        EventValue::Map(entries) => {
            if rest.is_empty() {
                match entries.get_mut(*first) {
                    Some(slot) => {
                        *slot = replacement.clone();
                        true
                    },
                    None => false,
                }
            } else {
                match entries.get_mut(*first) {
                    Some(child) => replace_in_value(child, rest, replacement),
                    None => false,
                }
            }
        },
        EventValue::List(items) => {
            let mut replaced = false;
            for item in items {
                if matches!(item, EventValue::Map(_) | EventValue::List(_)) {
                    replaced |= replace_in_value(item, segments, replacement);
                }
            }
            replaced
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{
        TimeZone,
        Utc,
    };

    use super::{
        EventValue,
        Level,
        LogEvent,
    };

    fn test_event() -> LogEvent {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        LogEvent::new(ts, Level::Info, "request complete")
    }

    #[test]
    fn test_level_ordering_is_numeric() {
        assert!(Level::Debug < Level::Info);
        assert!(Level::Critical > Level::Error);
        assert_eq!(Level::Warn.weight(), 30);
        assert_eq!("warn".parse::<Level>().unwrap(), Level::Warn);
        assert_eq!(Level::Error.to_string(), "ERROR");
    }

    #[test]
    fn test_reserved_key_resolution() {
        let event = test_event().with_field("status", 200u32);
        assert_eq!(
            event.get("event"),
            Some(EventValue::String("request complete".to_string()))
        );
        assert_eq!(
            event.get("message"),
            Some(EventValue::String("request complete".to_string()))
        );
        assert_eq!(event.get("status"), Some(EventValue::Integer(200)));
        assert_eq!(event.get("missing"), None);
    }

    #[test]
    fn test_json_projection() {
        let event = test_event().with_field("status", 200u32);
        let map = event.to_json_map();
        assert_eq!(map["level"], "INFO");
        assert_eq!(map["event"], "request complete");
        assert_eq!(map["status"], 200);
        assert!(map["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn test_replace_at_nested_path() {
        let mut inner = BTreeMap::new();
        inner.insert("card".to_string(), EventValue::from("4111"));
        let mut event = test_event().with_field("payment", EventValue::Map(inner));
        assert!(event.replace_at_path("payment.card", &EventValue::from("REDACTED")));
        let EventValue::Map(payment) = event.get("payment").unwrap() else {
            panic!("expected map");
        };
        assert_eq!(payment["card"], EventValue::from("REDACTED"));
        assert!(!event.replace_at_path("payment.missing", &EventValue::from("x")));
    }

    #[test]
    fn test_replace_at_path_applies_to_list_elements() {
        let entry = |card: &str| {
            let mut m = BTreeMap::new();
            m.insert("card".to_string(), EventValue::from(card));
            EventValue::Map(m)
        };
        let mut event = test_event().with_field(
            "charges",
            EventValue::List(vec![entry("1111"), entry("2222")]),
        );
        assert!(event.replace_at_path("charges.card", &EventValue::from("REDACTED")));
        let EventValue::List(items) = event.get("charges").unwrap() else {
            panic!("expected list");
        };
        for item in items {
            let EventValue::Map(m) = item else {
                panic!("expected map");
            };
            assert_eq!(m["card"], EventValue::from("REDACTED"));
        }
    }
}
