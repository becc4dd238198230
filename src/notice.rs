//! Purpose: Define a stable, structured schema for non-fatal stderr notices.
//! Exports: `Notice`, `notice_json`, `expiry_notice`.
//! Role: Shared contract helper for CLI diagnostics such as background buffer clears.
//! Invariants: Notices are non-fatal and never alter stdout payloads.
//! Invariants: JSON schema is additive-only; `kind` values are stable once published.
use serde_json::{Map, Value, json};

use crate::core::expiry::ExpiryEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: String,
    pub time: String,
    pub cmd: String,
    pub device: String,
    pub message: String,
    pub details: Map<String, Value>,
}

pub fn notice_json(notice: &Notice) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(notice.kind));
    inner.insert("time".to_string(), json!(notice.time));
    inner.insert("cmd".to_string(), json!(notice.cmd));
    inner.insert("device".to_string(), json!(notice.device));
    inner.insert("message".to_string(), json!(notice.message));
    inner.insert("details".to_string(), Value::Object(notice.details.clone()));

    let mut outer = Map::new();
    outer.insert("notice".to_string(), Value::Object(inner));
    Value::Object(outer)
}

/// Notice for a timer callback outcome. Only clears that discarded data are reported.
pub fn expiry_notice(event: &ExpiryEvent, cmd: &str, device: &str, time: String) -> Option<Notice> {
    match event {
        ExpiryEvent::Cleared { discarded, idle } if *discarded > 0 => {
            let mut details = Map::new();
            details.insert("discarded".to_string(), json!(discarded));
            details.insert("idle_ms".to_string(), json!(idle.as_millis() as u64));
            Some(Notice {
                kind: "expired".to_string(),
                time,
                cmd: cmd.to_string(),
                device: device.to_string(),
                message: format!("buffer cleared after {}ms idle ({discarded} bytes)", idle.as_millis()),
                details,
            })
        }
        ExpiryEvent::Cleared { .. } | ExpiryEvent::Rescheduled { .. } => None,
    }
}
