//! Parses the runner's stdout, one line at a time. Lines that aren't valid
//! JSON are noise (piped-through logging, a stray progress indicator) and
//! are skipped silently rather than failing the whole execution.

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
pub struct ToolUseInfo {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolResultInfo {
    pub tool_use_id: String,
}

/// Everything extracted from a runner's stdout stream.
#[derive(Debug, Clone, Serialize, Default)]
pub struct StreamAggregate {
    pub session_id: Option<String>,
    pub is_error: bool,
    pub error_message: Option<String>,
    pub tool_uses: Vec<ToolUseInfo>,
    pub tool_results: Vec<ToolResultInfo>,
    pub events: Vec<Value>,
}

pub struct StreamParser {
    aggregate: StreamAggregate,
}

impl StreamParser {
    pub fn new() -> Self {
        Self {
            aggregate: StreamAggregate::default(),
        }
    }

    /// Feed one line of the runner's stdout. Tolerates terminal-escape
    /// prefixes, malformed JSON, and missing fields.
    pub fn feed_line(&mut self, line: &str) {
        let stripped = strip_ansi(line);
        let trimmed = stripped.trim();
        if trimmed.is_empty() {
            return;
        }
        let value: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, line = trimmed, "skipping unparseable runner output line");
                return;
            }
        };

        match value.get("type").and_then(Value::as_str) {
            Some("system") => {
                if value.get("subtype").and_then(Value::as_str) == Some("init") {
                    if let Some(sid) = value.get("session_id").and_then(Value::as_str) {
                        // Record as early as possible: don't overwrite once set.
                        self.aggregate.session_id.get_or_insert_with(|| sid.to_string());
                    }
                }
            }
            Some("assistant") => {
                if let Some(items) = value.pointer("/message/content").and_then(Value::as_array) {
                    for item in items {
                        if item.get("type").and_then(Value::as_str) == Some("tool_use") {
                            let id = item.get("id").and_then(Value::as_str).unwrap_or_default();
                            let name = item.get("name").and_then(Value::as_str).unwrap_or_default();
                            self.aggregate.tool_uses.push(ToolUseInfo {
                                id: id.to_string(),
                                name: name.to_string(),
                            });
                        }
                    }
                }
            }
            Some("user") => {
                if let Some(items) = value.pointer("/message/content").and_then(Value::as_array) {
                    for item in items {
                        if item.get("type").and_then(Value::as_str) == Some("tool_result") {
                            let tool_use_id = item
                                .get("tool_use_id")
                                .and_then(Value::as_str)
                                .unwrap_or_default();
                            self.aggregate.tool_results.push(ToolResultInfo {
                                tool_use_id: tool_use_id.to_string(),
                            });
                        }
                    }
                }
            }
            Some("result") => {
                self.aggregate.is_error = value.get("is_error").and_then(Value::as_bool).unwrap_or(false);
                if let Some(msg) = value.get("error_message").and_then(Value::as_str) {
                    self.aggregate.error_message = Some(msg.to_string());
                }
            }
            _ => {}
        }

        self.aggregate.events.push(value);
    }

    pub fn finish(self) -> StreamAggregate {
        self.aggregate
    }
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Strip ANSI CSI escape sequences (`ESC [ ... <final-byte>`) from a line.
fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' && chars.peek() == Some(&'[') {
            chars.next(); // consume '['
            for c2 in chars.by_ref() {
                if c2.is_ascii_alphabetic() {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_session_id_from_init_event() {
        let mut parser = StreamParser::new();
        parser.feed_line(r#"{"type":"system","subtype":"init","session_id":"abc123"}"#);
        let agg = parser.finish();
        assert_eq!(agg.session_id.as_deref(), Some("abc123"));
    }

    #[test]
    fn session_id_survives_error_before_final_result() {
        let mut parser = StreamParser::new();
        parser.feed_line(r#"{"type":"system","subtype":"init","session_id":"abc123"}"#);
        parser.feed_line(r#"{"type":"result","is_error":true,"error_message":"boom"}"#);
        let agg = parser.finish();
        assert_eq!(agg.session_id.as_deref(), Some("abc123"));
        assert!(agg.is_error);
        assert_eq!(agg.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn counts_tool_uses() {
        let mut parser = StreamParser::new();
        parser.feed_line(
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"1","name":"bash"},{"type":"text","text":"hi"}]}}"#,
        );
        let agg = parser.finish();
        assert_eq!(agg.tool_uses.len(), 1);
        assert_eq!(agg.tool_uses[0].name, "bash");
    }

    #[test]
    fn extracts_tool_results() {
        let mut parser = StreamParser::new();
        parser.feed_line(r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"1"}]}}"#);
        let agg = parser.finish();
        assert_eq!(agg.tool_results.len(), 1);
        assert_eq!(agg.tool_results[0].tool_use_id, "1");
    }

    #[test]
    fn skips_noise_lines_silently() {
        let mut parser = StreamParser::new();
        parser.feed_line("not json at all");
        parser.feed_line("");
        parser.feed_line(r#"{"type":"system","subtype":"init","session_id":"x"}"#);
        let agg = parser.finish();
        assert_eq!(agg.session_id.as_deref(), Some("x"));
        assert_eq!(agg.events.len(), 1);
    }

    #[test]
    fn strips_ansi_csi_prefix_before_parsing() {
        let mut parser = StreamParser::new();
        parser.feed_line("\u{1b}[32m{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"green\"}\u{1b}[0m");
        let agg = parser.finish();
        assert_eq!(agg.session_id.as_deref(), Some("green"));
    }

    #[test]
    fn missing_fields_treated_as_absent() {
        let mut parser = StreamParser::new();
        parser.feed_line(r#"{"type":"system","subtype":"init"}"#);
        let agg = parser.finish();
        assert!(agg.session_id.is_none());
    }
}
