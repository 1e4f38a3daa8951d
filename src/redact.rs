//! Allow-list redaction applied to event payloads before they leave the
//! process boundary (insert into [`crate::history::HistoryStore`], or
//! publication to the web socket). Fields not on the allow-list are
//! replaced with a marker rather than dropped, so downstream consumers
//! can see that redaction happened instead of silently losing the field.

use serde_json::Value;

pub const REDACTED_MARKER: &str = "[redacted]";

/// Field names that are allowed to pass through unredacted: file paths,
/// branch names, commit SHAs, PR numbers, status/duration/exit-code
/// fields, and resume-marker bookkeeping.
const ALLOW_LIST: &[&str] = &[
    "path",
    "paths",
    "file",
    "branch",
    "branches",
    "sha",
    "head_sha",
    "base_sha",
    "pr",
    "pr_number",
    "pr_url",
    "status",
    "review_status",
    "ci_status",
    "duration_ms",
    "exit_code",
    "reason",
    "resumed_from_seq",
    "nodes",
    "edges",
    "levels",
    "unit",
    "task",
    "task_index",
    "title",
    "conflicted_files",
    "attempts",
];

/// Redacts every object key not on the allow-list, recursively. Arrays
/// and scalars are passed through unchanged; only object fields are
/// candidates for redaction.
pub fn redact_payload(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    if ALLOW_LIST.contains(&k.as_str()) {
                        (k.clone(), redact_payload(v))
                    } else {
                        (k.clone(), Value::String(REDACTED_MARKER.to_string()))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_payload).collect()),
        other => other.clone(),
    }
}
