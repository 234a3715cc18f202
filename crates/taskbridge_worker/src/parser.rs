//! Stream-format parser for the assistant CLI's stream-json output.
//!
//! A stateful byte-to-event translator: newline-delimited JSON arrives in
//! arbitrary chunks, the incomplete tail carries over between calls, and
//! each well-formed record produces zero or more typed events. Lines that
//! fail to decode are logged and skipped, never propagated as errors.

use serde_json::Value;
use taskbridge_protocol::types::{StreamEvent, TokenUsage};
use tracing::debug;

/// Bash command portion of a tool summary is cut at this many characters.
const BASH_SUMMARY_CAP: usize = 60;
/// Tool-result content is cut at this many characters.
const RESULT_SUMMARY_CAP: usize = 80;

/// Single-owner, non-concurrent line splitter and record classifier.
#[derive(Debug, Default)]
pub struct StreamParser {
    buffer: Vec<u8>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one chunk of CLI stdout and return the events it completes.
    /// Splitting a stream into different chunk boundaries never changes the
    /// event sequence.
    pub fn parse(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = match std::str::from_utf8(&line) {
                Ok(text) => text.trim(),
                Err(_) => {
                    debug!("Skipping non-UTF-8 stream line");
                    continue;
                }
            };
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(line) {
                Ok(record) => events.extend(classify(&record)),
                Err(e) => {
                    debug!("Skipping malformed stream line: {}", e);
                }
            }
        }
        events
    }

    /// Drop any buffered partial line.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

/// Map one decoded record to its events by `type`-field dispatch. Unknown
/// record types still surface a `token_usage` when they carry a top-level
/// `usage` object.
fn classify(record: &Value) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    match record.get("type").and_then(Value::as_str) {
        Some("assistant") => {
            if let Some(text) = assistant_text(record) {
                events.push(StreamEvent::AssistantMessage { text });
            }
            if let Some(usage) = record
                .pointer("/message/usage")
                .map(usage_from_snake_case)
            {
                events.push(StreamEvent::TokenUsage { usage });
            }
        }
        Some("tool_use") => {
            let tool = str_field(record, &["name", "tool_name"])
                .unwrap_or_else(|| "unknown".to_string());
            let summary = tool_summary(&tool, record.get("input"));
            events.push(StreamEvent::ToolUseBegin { tool, summary });
        }
        // Fallback record shape for the same concept as an AskUserQuestion
        // tool use.
        Some("ask_user") => {
            let summary = str_field(record, &["question", "prompt"])
                .unwrap_or_else(|| "AskUserQuestion".to_string());
            events.push(StreamEvent::ToolUseBegin {
                tool: "AskUserQuestion".to_string(),
                summary,
            });
        }
        Some("tool_result") => {
            let tool = str_field(record, &["tool_name", "name"]).unwrap_or_default();
            let success = !record
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let summary = truncate(&content_text(record.get("content")), RESULT_SUMMARY_CAP);
            events.push(StreamEvent::ToolUseEnd {
                tool,
                summary,
                success,
            });
        }
        Some("result") => {
            let text = record
                .get("result")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let session_id = record
                .get("session_id")
                .and_then(Value::as_str)
                .map(str::to_string);
            events.push(StreamEvent::Result { text, session_id });
            if let Some(usage) = result_usage(record) {
                events.push(StreamEvent::TokenUsage { usage });
            }
        }
        Some("rate_limit_event") => {
            if let Some(info) = record.get("rate_limit_info") {
                events.push(StreamEvent::RateLimit { info: info.clone() });
            }
        }
        _ => {
            if let Some(usage) = record.get("usage").map(usage_from_snake_case) {
                events.push(StreamEvent::TokenUsage { usage });
            }
        }
    }
    events
}

/// Text blocks of an assistant record. Two nestings occur in the wild:
/// a direct `content` array and `message.content`; both are supported.
fn assistant_text(record: &Value) -> Option<String> {
    let content = record
        .get("content")
        .or_else(|| record.pointer("/message/content"))?;

    if let Some(text) = content.as_str() {
        return Some(text.to_string());
    }

    let blocks = content.as_array()?;
    let mut text = String::new();
    for block in blocks {
        if block.get("type").and_then(Value::as_str) == Some("text") {
            if let Some(piece) = block.get("text").and_then(Value::as_str) {
                text.push_str(piece);
            }
        }
    }
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// One-line summary for a tool invocation, shaped per tool.
fn tool_summary(tool: &str, input: Option<&Value>) -> String {
    let field = |keys: &[&str]| -> Option<String> {
        let input = input?;
        keys.iter()
            .find_map(|key| input.get(*key).and_then(Value::as_str))
            .map(str::to_string)
    };

    match tool {
        "Read" | "Edit" | "Write" => field(&["file_path", "path", "notebook_path"])
            .map(|path| format!("{}: {}", tool, path))
            .unwrap_or_else(|| tool.to_string()),
        "Bash" => field(&["command"])
            .map(|command| format!("Bash: {}", truncate(&command, BASH_SUMMARY_CAP)))
            .unwrap_or_else(|| tool.to_string()),
        "Grep" => {
            let pattern = field(&["pattern"]).unwrap_or_default();
            let path = field(&["path"]).unwrap_or_else(|| ".".to_string());
            format!("Grep: {} in {}", pattern, path)
        }
        "Glob" => field(&["pattern"])
            .map(|pattern| format!("Glob: {}", pattern))
            .unwrap_or_else(|| tool.to_string()),
        "AskUserQuestion" => field(&["question", "prompt"])
            .or_else(|| {
                input?
                    .pointer("/questions/0/question")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| tool.to_string()),
        _ => tool.to_string(),
    }
}

/// Render tool-result content, which may be a bare string or a block array.
fn content_text(content: Option<&Value>) -> String {
    let Some(content) = content else {
        return String::new();
    };
    if let Some(text) = content.as_str() {
        return text.to_string();
    }
    if let Some(blocks) = content.as_array() {
        let mut text = String::new();
        for block in blocks {
            if let Some(piece) = block.get("text").and_then(Value::as_str) {
                text.push_str(piece);
            }
        }
        return text;
    }
    content.to_string()
}

/// Usage for a `result` record: per-model aggregation when present,
/// otherwise the top-level `usage` object.
fn result_usage(record: &Value) -> Option<TokenUsage> {
    if let Some(models) = record.get("modelUsage").and_then(Value::as_object) {
        let mut total = TokenUsage::default();
        for usage in models.values() {
            total.add(&usage_from_camel_case(usage));
        }
        return Some(total);
    }
    record.get("usage").map(usage_from_snake_case)
}

fn usage_from_snake_case(usage: &Value) -> TokenUsage {
    TokenUsage {
        input: u64_field(usage, "input_tokens"),
        output: u64_field(usage, "output_tokens"),
        cache_read: u64_field(usage, "cache_read_input_tokens"),
        cache_write: u64_field(usage, "cache_creation_input_tokens"),
    }
}

fn usage_from_camel_case(usage: &Value) -> TokenUsage {
    TokenUsage {
        input: u64_field(usage, "inputTokens"),
        output: u64_field(usage, "outputTokens"),
        cache_read: u64_field(usage, "cacheReadInputTokens"),
        cache_write: u64_field(usage, "cacheCreationInputTokens"),
    }
}

fn u64_field(value: &Value, key: &str) -> u64 {
    value.get(key).and_then(Value::as_u64).unwrap_or(0)
}

fn str_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

fn truncate(text: &str, cap: usize) -> String {
    if text.chars().count() <= cap {
        return text.to_string();
    }
    text.chars().take(cap).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(lines: &str) -> Vec<StreamEvent> {
        let mut parser = StreamParser::new();
        parser.parse(lines.as_bytes())
    }

    #[test]
    fn test_carry_over_across_chunks() {
        let mut parser = StreamParser::new();
        let first = parser.parse(br#"{"type":"result","resu"#);
        assert!(first.is_empty());
        let second = parser.parse(b"lt\":\"ok\",\"session_id\":null}\n");
        assert_eq!(
            second,
            vec![StreamEvent::Result {
                text: "ok".to_string(),
                session_id: None,
            }]
        );
    }

    #[test]
    fn test_chunk_split_equivalence() {
        let stream = concat!(
            r#"{"type":"assistant","content":[{"type":"text","text":"Hi"}]}"#,
            "\n",
            r#"{"type":"tool_use","name":"Bash","input":{"command":"ls"}}"#,
            "\n",
            r#"{"type":"result","result":"done","session_id":"s1"}"#,
            "\n",
        );
        let whole = parse_all(stream);

        for split in [1, 7, 20, stream.len() - 1] {
            let mut parser = StreamParser::new();
            let mut events = parser.parse(stream[..split].as_bytes());
            events.extend(parser.parse(stream[split..].as_bytes()));
            assert_eq!(events, whole, "split at {}", split);
        }
    }

    #[test]
    fn test_empty_and_malformed_lines_skipped() {
        let events = parse_all("\n\n{not json}\n  \n{\"type\":\"result\",\"result\":\"ok\"}\n");
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Result { .. }));
    }

    #[test]
    fn test_assistant_direct_content() {
        let events = parse_all(
            "{\"type\":\"assistant\",\"content\":[{\"type\":\"text\",\"text\":\"Hello\"}]}\n",
        );
        assert_eq!(
            events,
            vec![StreamEvent::AssistantMessage {
                text: "Hello".to_string()
            }]
        );
    }

    #[test]
    fn test_assistant_message_nesting_with_usage() {
        let line = concat!(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hi"}],"#,
            r#""usage":{"input_tokens":10,"output_tokens":2}}}"#,
            "\n",
        );
        let events = parse_all(line);
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            StreamEvent::AssistantMessage {
                text: "Hi".to_string()
            }
        );
        assert_eq!(
            events[1],
            StreamEvent::TokenUsage {
                usage: TokenUsage {
                    input: 10,
                    output: 2,
                    cache_read: 0,
                    cache_write: 0,
                }
            }
        );
    }

    #[test]
    fn test_assistant_without_text_block_emits_nothing() {
        let events =
            parse_all("{\"type\":\"assistant\",\"content\":[{\"type\":\"thinking\"}]}\n");
        assert!(events.is_empty());
    }

    #[test]
    fn test_tool_summaries_per_tool() {
        let cases = [
            (
                r#"{"type":"tool_use","name":"Read","input":{"file_path":"/src/lib.rs"}}"#,
                ("Read", "Read: /src/lib.rs".to_string()),
            ),
            (
                r#"{"type":"tool_use","name":"Grep","input":{"pattern":"fn main","path":"src"}}"#,
                ("Grep", "Grep: fn main in src".to_string()),
            ),
            (
                r#"{"type":"tool_use","name":"Glob","input":{"pattern":"**/*.rs"}}"#,
                ("Glob", "Glob: **/*.rs".to_string()),
            ),
            (
                r#"{"type":"tool_use","name":"WebFetch","input":{"url":"https://x"}}"#,
                ("WebFetch", "WebFetch".to_string()),
            ),
            (
                r#"{"type":"tool_use","name":"AskUserQuestion","input":{"question":"Deploy now?"}}"#,
                ("AskUserQuestion", "Deploy now?".to_string()),
            ),
        ];
        for (line, (tool, summary)) in cases {
            let events = parse_all(&format!("{}\n", line));
            assert_eq!(
                events,
                vec![StreamEvent::ToolUseBegin {
                    tool: tool.to_string(),
                    summary,
                }],
                "line: {}",
                line
            );
        }
    }

    #[test]
    fn test_bash_summary_truncated_to_sixty() {
        let command = "x".repeat(100);
        let line = format!(
            "{{\"type\":\"tool_use\",\"name\":\"Bash\",\"input\":{{\"command\":\"{}\"}}}}\n",
            command
        );
        let events = parse_all(&line);
        match &events[0] {
            StreamEvent::ToolUseBegin { tool, summary } => {
                assert_eq!(tool, "Bash");
                assert_eq!(summary, &format!("Bash: {}", "x".repeat(60)));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_ask_user_fallback_record() {
        let events = parse_all("{\"type\":\"ask_user\",\"question\":\"Which env?\"}\n");
        assert_eq!(
            events,
            vec![StreamEvent::ToolUseBegin {
                tool: "AskUserQuestion".to_string(),
                summary: "Which env?".to_string(),
            }]
        );
    }

    #[test]
    fn test_tool_result_maps_is_error_and_caps_content() {
        let content = "y".repeat(200);
        let line = format!(
            "{{\"type\":\"tool_result\",\"tool_name\":\"Bash\",\"is_error\":true,\"content\":\"{}\"}}\n",
            content
        );
        let events = parse_all(&line);
        match &events[0] {
            StreamEvent::ToolUseEnd { tool, summary, success } => {
                assert_eq!(tool, "Bash");
                assert!(!success);
                assert_eq!(summary.chars().count(), 80);
            }
            other => panic!("unexpected event {:?}", other),
        }

        let ok = parse_all(
            "{\"type\":\"tool_result\",\"tool_name\":\"Read\",\"content\":[{\"text\":\"file body\"}]}\n",
        );
        assert_eq!(
            ok,
            vec![StreamEvent::ToolUseEnd {
                tool: "Read".to_string(),
                summary: "file body".to_string(),
                success: true,
            }]
        );
    }

    #[test]
    fn test_result_with_per_model_usage_aggregation() {
        let line = concat!(
            r#"{"type":"result","result":"done","session_id":"s9","modelUsage":{"#,
            r#""model-a":{"inputTokens":10,"outputTokens":2,"cacheReadInputTokens":1,"cacheCreationInputTokens":0},"#,
            r#""model-b":{"inputTokens":5,"outputTokens":3,"cacheReadInputTokens":0,"cacheCreationInputTokens":4}}}"#,
            "\n",
        );
        let events = parse_all(line);
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            StreamEvent::Result {
                text: "done".to_string(),
                session_id: Some("s9".to_string()),
            }
        );
        assert_eq!(
            events[1],
            StreamEvent::TokenUsage {
                usage: TokenUsage {
                    input: 15,
                    output: 5,
                    cache_read: 1,
                    cache_write: 4,
                }
            }
        );
    }

    #[test]
    fn test_result_usage_fallback_with_missing_fields() {
        let line = concat!(
            r#"{"type":"result","result":"ok","usage":{"input_tokens":7}}"#,
            "\n",
        );
        let events = parse_all(line);
        assert_eq!(
            events[1],
            StreamEvent::TokenUsage {
                usage: TokenUsage {
                    input: 7,
                    output: 0,
                    cache_read: 0,
                    cache_write: 0,
                }
            }
        );
    }

    #[test]
    fn test_rate_limit_event() {
        let events =
            parse_all("{\"type\":\"rate_limit_event\",\"rate_limit_info\":{\"retry_after\":30}}\n");
        match &events[0] {
            StreamEvent::RateLimit { info } => assert_eq!(info["retry_after"], 30),
            other => panic!("unexpected event {:?}", other),
        }

        // No info object, no event.
        assert!(parse_all("{\"type\":\"rate_limit_event\"}\n").is_empty());
    }

    #[test]
    fn test_unknown_record_with_usage() {
        let events = parse_all(
            "{\"type\":\"system\",\"usage\":{\"input_tokens\":3,\"output_tokens\":1}}\n",
        );
        assert_eq!(
            events,
            vec![StreamEvent::TokenUsage {
                usage: TokenUsage {
                    input: 3,
                    output: 1,
                    cache_read: 0,
                    cache_write: 0,
                }
            }]
        );
        assert!(parse_all("{\"type\":\"system\"}\n").is_empty());
    }

    #[test]
    fn test_reset_discards_partial_line() {
        let mut parser = StreamParser::new();
        parser.parse(br#"{"type":"result","#);
        parser.reset();
        let events = parser.parse(b"{\"type\":\"result\",\"result\":\"ok\"}\n");
        assert_eq!(events.len(), 1);
    }
}
