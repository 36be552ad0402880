//! Translator for the claude `stream-json` event dialect.
//!
//! One JSON object per line. Assistant messages carry cumulative content
//! snapshots; the translator emits only unseen text so no character is
//! delivered twice.

use serde_json::Value;
use std::collections::HashSet;

use super::{EventTranslator, OutputConfig};
use crate::event::{AgentEvent, StructuredOutput, TodoItem};

pub struct ClaudeTranslator {
    output_config: Option<OutputConfig>,
    session_id: Option<String>,
    /// Assistant text emitted so far this turn.
    emitted_text: String,
    emitted_thinking: HashSet<String>,
    emitted_tools: HashSet<String>,
    structured: Option<StructuredOutput>,
    finished: bool,
}

impl ClaudeTranslator {
    pub fn new(output_config: Option<OutputConfig>) -> Self {
        Self {
            output_config,
            session_id: None,
            emitted_text: String::new(),
            emitted_thinking: HashSet::new(),
            emitted_tools: HashSet::new(),
            structured: None,
            finished: false,
        }
    }

    /// `mcp__server__tool` -> `server:tool`; other names pass through.
    fn map_tool_name(name: &str) -> String {
        match name.strip_prefix("mcp__") {
            Some(rest) => rest.replacen("__", ":", 1),
            None => name.to_string(),
        }
    }

    fn capture_session(&mut self, obj: &serde_json::Map<String, Value>) {
        if self.session_id.is_none() {
            if let Some(session) = obj.get("session_id").and_then(Value::as_str) {
                self.session_id = Some(session.to_string());
            }
        }
    }

    fn text_delta(&mut self, snapshot: &str) -> Option<AgentEvent> {
        let delta = if let Some(rest) = snapshot.strip_prefix(self.emitted_text.as_str()) {
            rest.to_string()
        } else {
            // A fresh message rather than a longer snapshot of the last one.
            snapshot.to_string()
        };
        if delta.is_empty() {
            return None;
        }
        self.emitted_text.push_str(&delta);
        Some(AgentEvent::TextDelta { content: delta })
    }

    fn translate_tool_use(
        &mut self,
        block: &serde_json::Map<String, Value>,
        out: &mut Vec<AgentEvent>,
    ) {
        let id = block
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        if !self.emitted_tools.insert(id.clone()) {
            return;
        }
        let name = block.get("name").and_then(Value::as_str).unwrap_or("unknown");
        let input = block.get("input").cloned().unwrap_or(Value::Null);

        out.push(AgentEvent::ToolUse {
            id,
            name: Self::map_tool_name(name),
            input: input.clone(),
        });

        // A TodoWrite invocation additionally surfaces the plan state.
        if name == "TodoWrite" {
            if let Some(todos) = input.get("todos").and_then(Value::as_array) {
                let items = todos
                    .iter()
                    .map(|t| TodoItem {
                        text: t
                            .get("activeForm")
                            .and_then(Value::as_str)
                            .filter(|s| !s.is_empty())
                            .or_else(|| t.get("content").and_then(Value::as_str))
                            .unwrap_or_default()
                            .to_string(),
                        completed: t.get("status").and_then(Value::as_str) == Some("completed"),
                    })
                    .collect();
                out.push(AgentEvent::TodoList { items });
            }
        }
    }

    fn stringify_result_content(content: &Value) -> String {
        match content {
            Value::String(s) => s.clone(),
            Value::Array(blocks) => {
                // Arrays of text blocks flatten to their joined text.
                let texts: Vec<&str> = blocks
                    .iter()
                    .filter_map(|b| b.get("text").and_then(Value::as_str))
                    .collect();
                if texts.is_empty() {
                    content.to_string()
                } else {
                    texts.join("\n")
                }
            }
            other => other.to_string(),
        }
    }

    fn terminal_success(&mut self, obj: &serde_json::Map<String, Value>) -> Vec<AgentEvent> {
        self.finished = true;
        let result_text = obj
            .get("result")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| self.emitted_text.clone());

        if let Some(cfg) = &self.output_config {
            // Prefer the service's structured payload; fall back to parsing
            // the final text.
            if let Some(structured) = obj.get("structured_output").filter(|v| !v.is_null()) {
                self.structured = Some(StructuredOutput {
                    format: "json".into(),
                    content: structured.to_string(),
                    parsed: Some(structured.clone()),
                    file_path: cfg.file_path.clone(),
                });
            } else if result_text.is_empty() {
                return vec![AgentEvent::Error {
                    message: "Structured output requested, but no response was returned".into(),
                }];
            } else {
                match serde_json::from_str::<Value>(&result_text) {
                    Ok(parsed) => {
                        self.structured = Some(StructuredOutput {
                            format: "json".into(),
                            content: result_text.clone(),
                            parsed: Some(parsed),
                            file_path: cfg.file_path.clone(),
                        });
                    }
                    Err(e) => {
                        return vec![AgentEvent::Error {
                            message: format!("Failed to parse structured output JSON: {e}"),
                        }];
                    }
                }
            }
        }

        vec![AgentEvent::Complete {
            result: Value::String(result_text),
        }]
    }

    fn terminal_failure(&mut self, obj: &serde_json::Map<String, Value>) -> Vec<AgentEvent> {
        self.finished = true;
        let joined = obj
            .get("errors")
            .and_then(Value::as_array)
            .map(|errs| {
                errs.iter()
                    .filter_map(|e| match e {
                        Value::String(s) => Some(s.clone()),
                        other => other.get("message").and_then(Value::as_str).map(String::from),
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .filter(|s| !s.is_empty());
        let message = joined
            .or_else(|| {
                obj.get("subtype")
                    .and_then(Value::as_str)
                    .map(String::from)
            })
            .unwrap_or_else(|| "Unknown error".to_string());
        vec![AgentEvent::Error { message }]
    }
}

impl EventTranslator for ClaudeTranslator {
    fn translate(&mut self, native: &Value) -> Vec<AgentEvent> {
        let Some(obj) = native.as_object() else {
            return Vec::new();
        };
        self.capture_session(obj);

        let mut out = Vec::new();
        match obj.get("type").and_then(Value::as_str) {
            Some("system") => {}
            Some("assistant") => {
                let blocks = obj
                    .get("message")
                    .and_then(|m| m.get("content"))
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();

                let mut snapshot = String::new();
                for block in &blocks {
                    let Some(block) = block.as_object() else {
                        continue;
                    };
                    match block.get("type").and_then(Value::as_str) {
                        Some("text") => {
                            if let Some(text) = block.get("text").and_then(Value::as_str) {
                                snapshot.push_str(text);
                            }
                        }
                        Some("thinking") => {
                            if let Some(thinking) =
                                block.get("thinking").and_then(Value::as_str)
                            {
                                if self.emitted_thinking.insert(thinking.to_string()) {
                                    out.push(AgentEvent::Thinking {
                                        content: thinking.to_string(),
                                    });
                                }
                            }
                        }
                        Some("tool_use") => self.translate_tool_use(block, &mut out),
                        _ => {}
                    }
                }
                if !snapshot.is_empty() {
                    if let Some(delta) = self.text_delta(&snapshot) {
                        out.push(delta);
                    }
                }
            }
            Some("user") => {
                let blocks = obj
                    .get("message")
                    .and_then(|m| m.get("content"))
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                for block in &blocks {
                    if block.get("type").and_then(Value::as_str) != Some("tool_result") {
                        continue;
                    }
                    let name = block
                        .get("tool_use_id")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string();
                    let result = block
                        .get("content")
                        .map(Self::stringify_result_content)
                        .unwrap_or_default();
                    out.push(AgentEvent::ToolResult { name, result });
                }
            }
            Some("result") => {
                let subtype = obj.get("subtype").and_then(Value::as_str).unwrap_or("");
                if subtype == "success" {
                    out.extend(self.terminal_success(obj));
                } else {
                    out.extend(self.terminal_failure(obj));
                }
            }
            _ => {}
        }
        out
    }

    fn finish(&mut self) -> Vec<AgentEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        if self.output_config.is_some() {
            vec![AgentEvent::Error {
                message: "Structured output requested, but no response was returned".into(),
            }]
        } else {
            vec![AgentEvent::Error {
                message: "agent stream ended without a result".into(),
            }]
        }
    }

    fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn structured_output(&self) -> Option<&StructuredOutput> {
        self.structured.as_ref()
    }

    fn finished(&self) -> bool {
        self.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn translate_all(translator: &mut ClaudeTranslator, lines: &[Value]) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        for line in lines {
            out.extend(translator.translate(line));
        }
        out
    }

    fn text_of(events: &[AgentEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::TextDelta { content } => Some(content.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn captures_session_from_init() {
        let mut t = ClaudeTranslator::new(None);
        t.translate(&json!({"type": "system", "subtype": "init", "session_id": "abc123"}));
        assert_eq!(t.session_id(), Some("abc123"));
    }

    #[test]
    fn cumulative_snapshots_emit_only_deltas() {
        let mut t = ClaudeTranslator::new(None);
        let events = translate_all(
            &mut t,
            &[
                json!({"type": "assistant", "message": {"content": [{"type": "text", "text": "Hel"}]}}),
                json!({"type": "assistant", "message": {"content": [{"type": "text", "text": "Hello, wor"}]}}),
                json!({"type": "assistant", "message": {"content": [{"type": "text", "text": "Hello, world"}]}}),
            ],
        );
        let deltas: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::TextDelta { content } => Some(content.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, vec!["Hel", "lo, wor", "ld"]);
        assert_eq!(text_of(&events), "Hello, world");
    }

    #[test]
    fn repeated_identical_snapshot_emits_nothing() {
        let mut t = ClaudeTranslator::new(None);
        let line =
            json!({"type": "assistant", "message": {"content": [{"type": "text", "text": "same"}]}});
        let first = t.translate(&line);
        let second = t.translate(&line);
        assert_eq!(text_of(&first), "same");
        assert!(second.is_empty());
    }

    #[test]
    fn tool_use_and_result() {
        let mut t = ClaudeTranslator::new(None);
        let events = translate_all(
            &mut t,
            &[
                json!({"type": "assistant", "message": {"content": [
                    {"type": "tool_use", "id": "t1", "name": "Read", "input": {"file_path": "src/main.rs"}}
                ]}}),
                json!({"type": "user", "message": {"content": [
                    {"type": "tool_result", "tool_use_id": "t1", "content": "fn main() {}"}
                ]}}),
            ],
        );
        assert!(matches!(
            &events[0],
            AgentEvent::ToolUse { id, name, .. } if id == "t1" && name == "Read"
        ));
        assert!(matches!(
            &events[1],
            AgentEvent::ToolResult { name, result } if name == "t1" && result.contains("fn main")
        ));
    }

    #[test]
    fn duplicate_tool_use_id_suppressed() {
        let mut t = ClaudeTranslator::new(None);
        let line = json!({"type": "assistant", "message": {"content": [
            {"type": "tool_use", "id": "t1", "name": "Read", "input": {}}
        ]}});
        assert_eq!(t.translate(&line).len(), 1);
        assert!(t.translate(&line).is_empty());
    }

    #[test]
    fn todo_write_emits_todo_list() {
        let mut t = ClaudeTranslator::new(None);
        let events = t.translate(&json!({"type": "assistant", "message": {"content": [
            {"type": "tool_use", "id": "t2", "name": "TodoWrite", "input": {"todos": [
                {"content": "write tests", "activeForm": "Writing tests", "status": "in_progress"},
                {"content": "ship it", "activeForm": "", "status": "completed"}
            ]}}
        ]}}));
        assert_eq!(events.len(), 2);
        match &events[1] {
            AgentEvent::TodoList { items } => {
                assert_eq!(items[0].text, "Writing tests");
                assert!(!items[0].completed);
                // Empty activeForm falls back to content.
                assert_eq!(items[1].text, "ship it");
                assert!(items[1].completed);
            }
            other => panic!("expected todo-list, got {other:?}"),
        }
    }

    #[test]
    fn mcp_tool_names_are_rewritten() {
        let mut t = ClaudeTranslator::new(None);
        let events = t.translate(&json!({"type": "assistant", "message": {"content": [
            {"type": "tool_use", "id": "m1", "name": "mcp__files__read_file", "input": {}}
        ]}}));
        assert!(matches!(
            &events[0],
            AgentEvent::ToolUse { name, .. } if name == "files:read_file"
        ));
    }

    #[test]
    fn thinking_emitted_once() {
        let mut t = ClaudeTranslator::new(None);
        let line = json!({"type": "assistant", "message": {"content": [
            {"type": "thinking", "thinking": "consider the options"}
        ]}});
        assert_eq!(t.translate(&line).len(), 1);
        assert!(t.translate(&line).is_empty());
    }

    #[test]
    fn success_terminal_uses_result_text() {
        let mut t = ClaudeTranslator::new(None);
        let events = t.translate(
            &json!({"type": "result", "subtype": "success", "result": "all done", "session_id": "s"}),
        );
        assert!(matches!(
            &events[0],
            AgentEvent::Complete { result } if result == "all done"
        ));
        assert!(t.finished());
        assert!(t.finish().is_empty());
    }

    #[test]
    fn failure_terminal_joins_errors() {
        let mut t = ClaudeTranslator::new(None);
        let events = t.translate(&json!({
            "type": "result", "subtype": "error_during_execution",
            "errors": ["rate limited", "connection reset"]
        }));
        match &events[0] {
            AgentEvent::Error { message } => {
                assert_eq!(message, "rate limited\nconnection reset")
            }
            other => panic!("expected error, got {other:?}"),
        }

        let mut t = ClaudeTranslator::new(None);
        let events =
            t.translate(&json!({"type": "result", "subtype": "error_max_turns", "errors": []}));
        assert!(matches!(
            &events[0],
            AgentEvent::Error { message } if message == "error_max_turns"
        ));
    }

    #[test]
    fn structured_output_from_terminal_payload() {
        let mut t = ClaudeTranslator::new(Some(OutputConfig {
            schema: "{}".into(),
            file_path: Some("/tmp/out.json".into()),
        }));
        let events = t.translate(&json!({
            "type": "result", "subtype": "success", "result": "{\"answer\": 42}",
            "structured_output": {"answer": 42}
        }));
        assert!(matches!(events[0], AgentEvent::Complete { .. }));
        let structured = t.structured_output().unwrap();
        assert_eq!(structured.format, "json");
        assert_eq!(structured.parsed.as_ref().unwrap()["answer"], 42);
        assert_eq!(structured.file_path.as_deref(), Some("/tmp/out.json"));
    }

    #[test]
    fn structured_output_parses_result_text_fallback() {
        let mut t = ClaudeTranslator::new(Some(OutputConfig {
            schema: "{}".into(),
            file_path: None,
        }));
        let events = t.translate(
            &json!({"type": "result", "subtype": "success", "result": "{\"ok\": true}"}),
        );
        assert!(matches!(events[0], AgentEvent::Complete { .. }));
        assert!(t.structured_output().is_some());
    }

    #[test]
    fn structured_output_invalid_json_errors() {
        let mut t = ClaudeTranslator::new(Some(OutputConfig {
            schema: "{}".into(),
            file_path: None,
        }));
        let events =
            t.translate(&json!({"type": "result", "subtype": "success", "result": "not json"}));
        assert!(matches!(
            &events[0],
            AgentEvent::Error { message } if message.starts_with("Failed to parse structured output JSON")
        ));
    }

    #[test]
    fn structured_output_missing_response_errors() {
        let mut t = ClaudeTranslator::new(Some(OutputConfig {
            schema: "{}".into(),
            file_path: None,
        }));
        let events = t.translate(&json!({"type": "result", "subtype": "success", "result": ""}));
        assert!(matches!(
            &events[0],
            AgentEvent::Error { message }
                if message == "Structured output requested, but no response was returned"
        ));
    }

    #[test]
    fn unterminated_stream_finishes_with_error() {
        let mut t = ClaudeTranslator::new(None);
        t.translate(&json!({"type": "assistant", "message": {"content": [{"type": "text", "text": "partial"}]}}));
        let tail = t.finish();
        assert!(matches!(tail[0], AgentEvent::Error { .. }));
    }
}
