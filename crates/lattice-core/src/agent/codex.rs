//! Translator for the codex `exec --json` thread-event dialect.
//!
//! Items progress through `item.started` / `item.updated` / `item.completed`
//! envelopes; unstable partials (reasoning, file changes) are only surfaced
//! once completed, while agent-message snapshots are reduced to text deltas.

use serde_json::Value;
use std::collections::HashSet;

use super::{EventTranslator, OutputConfig};
use crate::event::{AgentEvent, StructuredOutput, TodoItem};

pub struct CodexTranslator {
    output_config: Option<OutputConfig>,
    thread_id: Option<String>,
    emitted_text: String,
    announced_tools: HashSet<String>,
    structured: Option<StructuredOutput>,
    finished: bool,
}

impl CodexTranslator {
    pub fn new(output_config: Option<OutputConfig>) -> Self {
        Self {
            output_config,
            thread_id: None,
            emitted_text: String::new(),
            announced_tools: HashSet::new(),
            structured: None,
            finished: false,
        }
    }

    fn item_id(item: &serde_json::Map<String, Value>) -> String {
        item.get("id")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string()
    }

    fn text_delta(&mut self, snapshot: &str) -> Option<AgentEvent> {
        let delta = match snapshot.strip_prefix(self.emitted_text.as_str()) {
            Some(rest) => rest.to_string(),
            None => snapshot.to_string(),
        };
        if delta.is_empty() {
            return None;
        }
        self.emitted_text.push_str(&delta);
        Some(AgentEvent::TextDelta { content: delta })
    }

    fn announce_tool(
        &mut self,
        id: &str,
        name: String,
        input: Value,
        out: &mut Vec<AgentEvent>,
    ) {
        if self.announced_tools.insert(id.to_string()) {
            out.push(AgentEvent::ToolUse {
                id: id.to_string(),
                name,
                input,
            });
        }
    }

    fn translate_item(
        &mut self,
        phase: &str,
        item: &serde_json::Map<String, Value>,
    ) -> Vec<AgentEvent> {
        let completed = phase == "item.completed";
        let id = Self::item_id(item);
        let mut out = Vec::new();

        match item.get("item_type").or(item.get("type")).and_then(Value::as_str) {
            Some("agent_message") => {
                if let Some(text) = item.get("text").and_then(Value::as_str) {
                    if let Some(delta) = self.text_delta(text) {
                        out.push(delta);
                    }
                }
            }
            Some("reasoning") => {
                // Partial reasoning is unstable; only completed items count.
                if completed {
                    if let Some(text) = item.get("text").and_then(Value::as_str) {
                        out.push(AgentEvent::Thinking {
                            content: text.to_string(),
                        });
                    }
                }
            }
            Some("command_execution") => {
                let command = item
                    .get("command")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                self.announce_tool(
                    &id,
                    "command".to_string(),
                    serde_json::json!({"command": command}),
                    &mut out,
                );
                if completed {
                    let mut result = item
                        .get("aggregated_output")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    if let Some(code) = item.get("exit_code").and_then(Value::as_i64) {
                        if code != 0 {
                            result.push_str(&format!("\n[Exit code: {code}]"));
                        }
                    }
                    out.push(AgentEvent::ToolResult { name: id, result });
                }
            }
            Some("file_change") => {
                if completed {
                    let changes: Vec<String> = item
                        .get("changes")
                        .and_then(Value::as_array)
                        .map(|list| {
                            list.iter()
                                .map(|c| {
                                    format!(
                                        "{}: {}",
                                        c.get("kind").and_then(Value::as_str).unwrap_or("change"),
                                        c.get("path").and_then(Value::as_str).unwrap_or("?")
                                    )
                                })
                                .collect()
                        })
                        .unwrap_or_default();
                    self.announce_tool(
                        &id,
                        "FileChange".to_string(),
                        serde_json::json!({ "changes": changes }),
                        &mut out,
                    );
                    out.push(AgentEvent::ToolResult {
                        name: id,
                        result: format!("Success\n{}", changes.join("\n")),
                    });
                }
            }
            Some("web_search") => {
                let query = item.get("query").and_then(Value::as_str).unwrap_or_default();
                self.announce_tool(
                    &id,
                    "WebSearch".to_string(),
                    serde_json::json!({ "query": query }),
                    &mut out,
                );
                if completed {
                    out.push(AgentEvent::ToolResult {
                        name: id,
                        result: "Search completed".to_string(),
                    });
                }
            }
            Some("mcp_tool_call") => {
                let server = item.get("server").and_then(Value::as_str).unwrap_or("mcp");
                let tool = item.get("tool").and_then(Value::as_str).unwrap_or("tool");
                self.announce_tool(
                    &id,
                    format!("{server}:{tool}"),
                    item.get("arguments").cloned().unwrap_or(Value::Null),
                    &mut out,
                );
                if completed {
                    let result = if let Some(err) = item.get("error").and_then(Value::as_str) {
                        format!("Error: {err}")
                    } else {
                        item.get("structured_content")
                            .map(|v| v.to_string())
                            .unwrap_or_default()
                    };
                    out.push(AgentEvent::ToolResult { name: id, result });
                }
            }
            Some("todo_list") => {
                let items = item
                    .get("items")
                    .and_then(Value::as_array)
                    .map(|list| {
                        list.iter()
                            .map(|t| TodoItem {
                                text: t
                                    .get("text")
                                    .and_then(Value::as_str)
                                    .unwrap_or_default()
                                    .to_string(),
                                completed: t
                                    .get("completed")
                                    .and_then(Value::as_bool)
                                    .unwrap_or(false),
                            })
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                out.push(AgentEvent::TodoList { items });
            }
            _ => {}
        }
        out
    }

    fn terminal_success(&mut self) -> Vec<AgentEvent> {
        self.finished = true;
        let final_text = self.emitted_text.clone();

        if let Some(cfg) = &self.output_config {
            if final_text.is_empty() {
                return vec![AgentEvent::Error {
                    message: "Structured output requested, but no response was returned".into(),
                }];
            }
            match serde_json::from_str::<Value>(&final_text) {
                Ok(parsed) => {
                    self.structured = Some(StructuredOutput {
                        format: "json".into(),
                        content: final_text.clone(),
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

        vec![AgentEvent::Complete {
            result: Value::String(final_text),
        }]
    }
}

impl EventTranslator for CodexTranslator {
    fn translate(&mut self, native: &Value) -> Vec<AgentEvent> {
        let Some(obj) = native.as_object() else {
            return Vec::new();
        };

        match obj.get("type").and_then(Value::as_str) {
            Some("thread.started") => {
                if self.thread_id.is_none() {
                    self.thread_id = obj
                        .get("thread_id")
                        .and_then(Value::as_str)
                        .map(String::from);
                }
                Vec::new()
            }
            Some(phase @ ("item.started" | "item.updated" | "item.completed")) => {
                match obj.get("item").and_then(Value::as_object) {
                    Some(item) => self.translate_item(phase, item),
                    None => Vec::new(),
                }
            }
            Some("turn.completed") => self.terminal_success(),
            Some("turn.failed") => {
                self.finished = true;
                let message = obj
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown error")
                    .to_string();
                vec![AgentEvent::Error { message }]
            }
            _ => Vec::new(),
        }
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
        self.thread_id.as_deref()
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

    fn translate_all(t: &mut CodexTranslator, lines: &[Value]) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        for line in lines {
            out.extend(t.translate(line));
        }
        out
    }

    #[test]
    fn captures_thread_id() {
        let mut t = CodexTranslator::new(None);
        t.translate(&json!({"type": "thread.started", "thread_id": "thr-1"}));
        assert_eq!(t.session_id(), Some("thr-1"));
    }

    #[test]
    fn agent_message_snapshots_become_deltas() {
        let mut t = CodexTranslator::new(None);
        let events = translate_all(
            &mut t,
            &[
                json!({"type": "item.updated", "item": {"id": "m1", "type": "agent_message", "text": "par"}}),
                json!({"type": "item.completed", "item": {"id": "m1", "type": "agent_message", "text": "partial done"}}),
                json!({"type": "turn.completed", "usage": {}}),
            ],
        );
        let text: String = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::TextDelta { content } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "partial done");
        match events.last() {
            Some(AgentEvent::Complete { result }) => assert_eq!(result, "partial done"),
            other => panic!("expected complete, got {other:?}"),
        }
    }

    #[test]
    fn reasoning_only_on_completed() {
        let mut t = CodexTranslator::new(None);
        let partial = t.translate(
            &json!({"type": "item.updated", "item": {"id": "r1", "type": "reasoning", "text": "thin"}}),
        );
        assert!(partial.is_empty());
        let done = t.translate(
            &json!({"type": "item.completed", "item": {"id": "r1", "type": "reasoning", "text": "thinking done"}}),
        );
        assert!(matches!(
            &done[0],
            AgentEvent::Thinking { content } if content == "thinking done"
        ));
    }

    #[test]
    fn command_execution_appends_exit_code() {
        let mut t = CodexTranslator::new(None);
        let events = translate_all(
            &mut t,
            &[
                json!({"type": "item.started", "item": {"id": "c1", "type": "command_execution", "command": "cargo test"}}),
                json!({"type": "item.completed", "item": {
                    "id": "c1", "type": "command_execution", "command": "cargo test",
                    "aggregated_output": "2 tests failed", "exit_code": 101
                }}),
            ],
        );
        assert!(matches!(
            &events[0],
            AgentEvent::ToolUse { id, name, .. } if id == "c1" && name == "command"
        ));
        match &events[1] {
            AgentEvent::ToolResult { name, result } => {
                assert_eq!(name, "c1");
                assert!(result.ends_with("[Exit code: 101]"));
            }
            other => panic!("expected tool-result, got {other:?}"),
        }
    }

    #[test]
    fn zero_exit_code_not_appended() {
        let mut t = CodexTranslator::new(None);
        let events = translate_all(
            &mut t,
            &[json!({"type": "item.completed", "item": {
                "id": "c2", "type": "command_execution", "command": "true",
                "aggregated_output": "ok", "exit_code": 0
            }})],
        );
        let result = events
            .iter()
            .find_map(|e| match e {
                AgentEvent::ToolResult { result, .. } => Some(result.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(result, "ok");
    }

    #[test]
    fn file_change_pairs_use_and_result() {
        let mut t = CodexTranslator::new(None);
        let events = t.translate(&json!({"type": "item.completed", "item": {
            "id": "f1", "type": "file_change", "status": "completed",
            "changes": [{"kind": "edit", "path": "src/lib.rs"}, {"kind": "add", "path": "src/new.rs"}]
        }}));
        assert!(matches!(
            &events[0],
            AgentEvent::ToolUse { name, input, .. }
                if name == "FileChange" && input["changes"][0] == "edit: src/lib.rs"
        ));
        assert!(matches!(
            &events[1],
            AgentEvent::ToolResult { result, .. } if result.starts_with("Success\n")
        ));
    }

    #[test]
    fn web_search_translates() {
        let mut t = CodexTranslator::new(None);
        let events = t.translate(&json!({"type": "item.completed", "item": {
            "id": "w1", "type": "web_search", "query": "rust async traits"
        }}));
        assert!(matches!(
            &events[0],
            AgentEvent::ToolUse { name, input, .. }
                if name == "WebSearch" && input["query"] == "rust async traits"
        ));
        assert!(matches!(
            &events[1],
            AgentEvent::ToolResult { result, .. } if result == "Search completed"
        ));
    }

    #[test]
    fn mcp_tool_call_success_and_error() {
        let mut t = CodexTranslator::new(None);
        let ok = t.translate(&json!({"type": "item.completed", "item": {
            "id": "mcp1", "type": "mcp_tool_call", "server": "files", "tool": "read",
            "structured_content": {"bytes": 40}
        }}));
        assert!(matches!(
            &ok[0],
            AgentEvent::ToolUse { name, .. } if name == "files:read"
        ));
        assert!(matches!(
            &ok[1],
            AgentEvent::ToolResult { result, .. } if result.contains("\"bytes\":40")
        ));

        let err = t.translate(&json!({"type": "item.completed", "item": {
            "id": "mcp2", "type": "mcp_tool_call", "server": "files", "tool": "write",
            "error": "permission denied"
        }}));
        assert!(matches!(
            &err[1],
            AgentEvent::ToolResult { result, .. } if result == "Error: permission denied"
        ));
    }

    #[test]
    fn todo_list_items() {
        let mut t = CodexTranslator::new(None);
        let events = t.translate(&json!({"type": "item.updated", "item": {
            "id": "td1", "type": "todo_list",
            "items": [{"text": "plan", "completed": true}, {"text": "build", "completed": false}]
        }}));
        match &events[0] {
            AgentEvent::TodoList { items } => {
                assert_eq!(items.len(), 2);
                assert!(items[0].completed);
            }
            other => panic!("expected todo-list, got {other:?}"),
        }
    }

    #[test]
    fn turn_failed_surfaces_message() {
        let mut t = CodexTranslator::new(None);
        let events =
            t.translate(&json!({"type": "turn.failed", "error": {"message": "quota exhausted"}}));
        assert!(matches!(
            &events[0],
            AgentEvent::Error { message } if message == "quota exhausted"
        ));
        assert!(t.finished());
    }

    #[test]
    fn structured_output_parsed_from_final_text() {
        let mut t = CodexTranslator::new(Some(OutputConfig {
            schema: "{}".into(),
            file_path: None,
        }));
        translate_all(
            &mut t,
            &[
                json!({"type": "item.completed", "item": {"id": "m1", "type": "agent_message", "text": "{\"score\": 7}"}}),
                json!({"type": "turn.completed", "usage": {}}),
            ],
        );
        assert_eq!(t.structured_output().unwrap().parsed.as_ref().unwrap()["score"], 7);
    }

    #[test]
    fn structured_output_invalid_json_fails_turn() {
        let mut t = CodexTranslator::new(Some(OutputConfig {
            schema: "{}".into(),
            file_path: None,
        }));
        let events = translate_all(
            &mut t,
            &[
                json!({"type": "item.completed", "item": {"id": "m1", "type": "agent_message", "text": "plain prose"}}),
                json!({"type": "turn.completed", "usage": {}}),
            ],
        );
        assert!(matches!(
            events.last(),
            Some(AgentEvent::Error { message }) if message.starts_with("Failed to parse structured output JSON")
        ));
    }
}
