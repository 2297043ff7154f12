//! Locates the agent's final structured-result JSON in an execution log and
//! persists it at most once per conversation.

use std::sync::LazyLock;

use db::{
    DBService,
    models::{conversation_result::ConversationResult, execution_log::ExecutionLog},
};
use regex::Regex;
use serde_json::{Map, Value};
use uuid::Uuid;

/// Matches `[HH:MM:SS] PREFIX: {json}` with both the timestamp and the
/// prefix optional, capturing the JSON object.
static LOG_LINE_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\[\d{2}:\d{2}:\d{2}\]\s*)?(?:\w+:\s*)?(\{.*\})\s*$")
        .expect("log line pattern is valid")
});

/// Extract the JSON-object portion of a log line, if any.
pub fn extract_json_from_log_line(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    if let Some(captures) = LOG_LINE_JSON.captures(trimmed) {
        return captures.get(1).map(|m| m.as_str());
    }
    // Plain JSON line without timestamp or stream prefix
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return Some(trimmed);
    }
    None
}

/// The result object must carry `type == "result"`, a `subtype`, a boolean
/// `is_error`, and a non-empty string `session_id`.
fn validate_result_data(data: &Map<String, Value>) -> bool {
    if data.get("type").and_then(Value::as_str) != Some("result") {
        return false;
    }
    if !data.contains_key("subtype") {
        return false;
    }
    if data.get("is_error").and_then(Value::as_bool).is_none() {
        return false;
    }
    matches!(data.get("session_id").and_then(Value::as_str), Some(s) if !s.is_empty())
}

/// Scan the log blob from the last line backwards (the result is emitted near
/// the end) for the first line that decodes to a valid result object.
pub fn parse_execution_result(execution_logs: &str) -> Option<Map<String, Value>> {
    if execution_logs.is_empty() {
        return None;
    }
    for line in execution_logs.lines().rev() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some(json_str) = extract_json_from_log_line(line) else {
            continue;
        };
        let Ok(Value::Object(data)) = serde_json::from_str::<Value>(json_str) else {
            continue;
        };
        if validate_result_data(&data) {
            return Some(data);
        }
    }
    None
}

#[derive(Clone)]
pub struct ResultParser {
    db: DBService,
}

impl ResultParser {
    pub fn new(db: DBService) -> Self {
        Self { db }
    }

    /// Parse the freshest copy of the execution log and create the result
    /// record if one is found and none exists yet. Runs after the container
    /// has exited on every terminal path; never alters conversation state,
    /// and every failure is logged and swallowed.
    pub async fn parse_and_store_result(&self, conversation_id: Uuid, exec_log_id: Uuid) {
        // The caller's in-memory row predates the reader appends.
        let exec_log = match ExecutionLog::find_by_id(&self.db.pool, exec_log_id).await {
            Ok(Some(log)) => log,
            Ok(None) => {
                tracing::warn!("Execution log {exec_log_id} vanished before result parsing");
                return;
            }
            Err(e) => {
                tracing::error!("Failed to re-read execution log {exec_log_id}: {e}");
                return;
            }
        };

        let Some(data) = parse_execution_result(&exec_log.execution_logs) else {
            tracing::info!("No result JSON found in execution logs for conversation {conversation_id}");
            return;
        };

        match ConversationResult::exists_by_conversation_id(&self.db.pool, conversation_id).await {
            Ok(true) => {
                tracing::warn!("Result already exists for conversation {conversation_id}, skipping");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!("Failed to check existing result for {conversation_id}: {e}");
                return;
            }
        }

        match ConversationResult::create(&self.db.pool, conversation_id, &data).await {
            Ok(result) => {
                tracing::info!(
                    "Created conversation result for {conversation_id} (session {})",
                    result.session_id
                );
            }
            Err(e) => {
                tracing::error!("Failed to create conversation result for {conversation_id}: {e}");
            }
        }
    }
}
