//! Event rendering. The chain carries structured events end to end; sinks
//! call into here when they need text. JSON mode is canonical, UTF-8, and
//! compact; pretty mode is for humans on a terminal.

use colored::Colorize;
use common::{
    Level,
    LogEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    Json,
    Pretty { color: bool },
}

pub fn render(event: &LogEvent, mode: RenderMode) -> String {
    match mode {
        RenderMode::Json => render_json(event),
        RenderMode::Pretty { color } => render_pretty(event, color),
    }
}

/// One compact JSON object per event.
pub fn render_json(event: &LogEvent) -> String {
    match serde_json::to_string(&event.to_json_map()) {
        Ok(line) => line,
        Err(e) => {
            tracing::warn!("failed to render event as JSON: {e}");
            format!(
                "{{\"level\":\"{}\",\"event\":{}}}",
                event.level,
                serde_json::Value::String(event.message.clone()),
            )
        },
    }
}

/// Human-readable single line with optional ANSI color on the level.
pub fn render_pretty(event: &LogEvent, color: bool) -> String {
    let timestamp = event.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ");
    let level = format!("{:<8}", event.level.to_string());
    let level = if color {
        match event.level {
            Level::Debug => level.dimmed().to_string(),
            Level::Info => level.green().to_string(),
            Level::Warn => level.yellow().to_string(),
            Level::Error => level.red().to_string(),
            Level::Critical => level.red().bold().to_string(),
        }
    } else {
        level
    };
    let mut line = format!("{timestamp} [{level}] {}", event.message);
    for (key, value) in &event.fields {
        line.push_str(&format!(" {key}={value}"));
    }
    line
}

#[cfg(test)]
mod tests {
    use chrono::{
        TimeZone,
        Utc,
    };
    use common::{
        Level,
        LogEvent,
    };

    use super::{
        render_json,
        render_pretty,
    };

    fn test_event() -> LogEvent {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        LogEvent::new(ts, Level::Info, "started").with_field("port", 8080u32)
    }

    #[test]
    fn test_json_rendering_is_compact() {
        let line = render_json(&test_event());
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["level"], "INFO");
        assert_eq!(parsed["event"], "started");
        assert_eq!(parsed["port"], 8080);
        assert!(!line.contains('\n'));
    }

    #[test]
    fn test_pretty_rendering_without_color() {
        let line = render_pretty(&test_event(), false);
        assert!(line.starts_with("2024-05-01T12:00:00.000Z [INFO    ] started"));
        assert!(line.ends_with("port=8080"));
        assert!(!line.contains('\u{1b}'));
    }
}
