//! Streaming usage extraction: a byte-through pipe also feeds a stateful,
//! provider-tagged parser so the full response body is never buffered.
//! Each variant understands its provider's native event framing; the
//! proxy engine picks one based on account platform and feeds it chunks
//! as they arrive.

use gateway_core::TokenUsage;
use serde_json::Value;

/// Accumulates bytes until a full line is available, since SSE and NDJSON
/// framing are both newline-delimited. Keeps at most one partial line in
/// memory regardless of response size.
#[derive(Default)]
struct LineBuffer {
    partial: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line).trim_end().to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }
}

/// What the engine hands the billing pipeline once a stream or a
/// non-streamed body has been fully consumed.
#[derive(Debug, Clone, Default)]
pub struct ExtractedUsage {
    pub usage: TokenUsage,
    pub model: Option<String>,
}

pub trait UsageExtractor: Send {
    fn feed(&mut self, chunk: &[u8]);
    fn parse_full(&mut self, body: &[u8]);
    fn finish(self: Box<Self>) -> ExtractedUsage;
}

#[derive(Default)]
pub struct ClaudeExtractor {
    lines: LineBuffer,
    usage: TokenUsage,
    model: Option<String>,
}

impl ClaudeExtractor {
    fn observe_event(&mut self, data: &Value) {
        let event_type = data.get("type").and_then(Value::as_str).unwrap_or_default();
        match event_type {
            "message_start" => {
                if let Some(message) = data.get("message") {
                    self.model = message.get("model").and_then(Value::as_str).map(str::to_string);
                    if let Some(usage) = message.get("usage") {
                        self.merge_initial(usage);
                    }
                }
            }
            "message_delta" => {
                if let Some(usage) = data.get("usage") {
                    self.merge_delta(usage);
                }
            }
            _ => {}
        }
    }

    fn merge_initial(&mut self, usage: &Value) {
        self.usage.input_tokens = field_i64(usage, "input_tokens");
        self.usage.cache_creation_tokens = field_i64(usage, "cache_creation_input_tokens");
        self.usage.cache_read_tokens = field_i64(usage, "cache_read_input_tokens");
        if let Some(breakdown) = usage.get("cache_creation") {
            self.usage.cache_creation_5m_tokens = field_i64(breakdown, "ephemeral_5m_input_tokens");
            self.usage.cache_creation_1h_tokens = field_i64(breakdown, "ephemeral_1h_input_tokens");
        }
    }

    fn merge_delta(&mut self, usage: &Value) {
        if let Some(v) = usage.get("output_tokens") {
            self.usage.output_tokens = v.as_i64().unwrap_or(self.usage.output_tokens);
        }
    }
}

impl UsageExtractor for ClaudeExtractor {
    fn feed(&mut self, chunk: &[u8]) {
        for line in self.lines.push(chunk) {
            if let Some(payload) = line.strip_prefix("data:") {
                if let Ok(data) = serde_json::from_str::<Value>(payload.trim()) {
                    self.observe_event(&data);
                }
            }
        }
    }

    fn parse_full(&mut self, body: &[u8]) {
        if let Ok(data) = serde_json::from_slice::<Value>(body) {
            self.model = data.get("model").and_then(Value::as_str).map(str::to_string);
            if let Some(usage) = data.get("usage") {
                self.merge_initial(usage);
                self.merge_delta(usage);
            }
        }
    }

    fn finish(self: Box<Self>) -> ExtractedUsage {
        ExtractedUsage { usage: self.usage, model: self.model }
    }
}

#[derive(Default)]
pub struct OpenAiExtractor {
    lines: LineBuffer,
    usage: TokenUsage,
    model: Option<String>,
}

impl OpenAiExtractor {
    fn observe_event(&mut self, data: &Value) {
        let event_type = data.get("type").and_then(Value::as_str).unwrap_or_default();
        if event_type != "response.completed" {
            return;
        }
        let Some(response) = data.get("response") else { return };
        self.model = response.get("model").and_then(Value::as_str).map(str::to_string);
        if let Some(usage) = response.get("usage") {
            self.usage.input_tokens = field_i64(usage, "input_tokens");
            self.usage.output_tokens = field_i64(usage, "output_tokens");
            if let Some(details) = usage.get("input_tokens_details") {
                self.usage.cache_read_tokens = field_i64(details, "cached_tokens");
            }
        }
    }
}

impl UsageExtractor for OpenAiExtractor {
    fn feed(&mut self, chunk: &[u8]) {
        for line in self.lines.push(chunk) {
            if let Some(payload) = line.strip_prefix("data:") {
                if let Ok(data) = serde_json::from_str::<Value>(payload.trim()) {
                    self.observe_event(&data);
                }
            }
        }
    }

    fn parse_full(&mut self, body: &[u8]) {
        if let Ok(response) = serde_json::from_slice::<Value>(body) {
            self.model = response.get("model").and_then(Value::as_str).map(str::to_string);
            if let Some(usage) = response.get("usage") {
                self.usage.input_tokens = field_i64(&usage, "input_tokens");
                self.usage.output_tokens = field_i64(&usage, "output_tokens");
            }
        }
    }

    fn finish(self: Box<Self>) -> ExtractedUsage {
        ExtractedUsage { usage: self.usage, model: self.model }
    }
}

#[derive(Default)]
pub struct GeminiExtractor {
    lines: LineBuffer,
    usage: TokenUsage,
    model: Option<String>,
}

impl GeminiExtractor {
    fn observe_chunk(&mut self, data: &Value) {
        if let Some(model) = data.get("modelVersion").and_then(Value::as_str) {
            self.model = Some(model.to_string());
        }
        let Some(meta) = data.get("usageMetadata") else { return };
        // Gemini reports cumulative totals per chunk, not deltas.
        self.usage.input_tokens = field_i64(meta, "promptTokenCount");
        self.usage.output_tokens = field_i64(meta, "candidatesTokenCount");
        self.usage.cache_read_tokens = field_i64(meta, "cachedContentTokenCount");
    }
}

impl UsageExtractor for GeminiExtractor {
    fn feed(&mut self, chunk: &[u8]) {
        for line in self.lines.push(chunk) {
            let trimmed = line.trim_start_matches(['[', ',']).trim_end_matches(']');
            if trimmed.is_empty() {
                continue;
            }
            if let Ok(data) = serde_json::from_str::<Value>(trimmed) {
                self.observe_chunk(&data);
            }
        }
    }

    fn parse_full(&mut self, body: &[u8]) {
        if let Ok(data) = serde_json::from_slice::<Value>(body) {
            self.observe_chunk(&data);
        }
    }

    fn finish(self: Box<Self>) -> ExtractedUsage {
        ExtractedUsage { usage: self.usage, model: self.model }
    }
}

fn field_i64(value: &Value, key: &str) -> i64 {
    value.get(key).and_then(Value::as_i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_extractor_combines_start_and_delta_events() {
        let mut extractor = ClaudeExtractor::default();
        extractor.feed(b"event: message_start\n");
        extractor.feed(br#"data: {"type":"message_start","message":{"model":"claude-3-5-sonnet","usage":{"input_tokens":10,"cache_read_input_tokens":2}}}"#);
        extractor.feed(b"\n\n");
        extractor.feed(br#"data: {"type":"message_delta","usage":{"output_tokens":42}}"#);
        extractor.feed(b"\n\n");
        let result = Box::new(extractor).finish();
        assert_eq!(result.usage.input_tokens, 10);
        assert_eq!(result.usage.cache_read_tokens, 2);
        assert_eq!(result.usage.output_tokens, 42);
        assert_eq!(result.model.as_deref(), Some("claude-3-5-sonnet"));
    }

    #[test]
    fn claude_extractor_handles_chunked_partial_lines() {
        let mut extractor = ClaudeExtractor::default();
        let full = br#"data: {"type":"message_start","message":{"model":"m","usage":{"input_tokens":5}}}
"#;
        extractor.feed(&full[..20]);
        extractor.feed(&full[20..]);
        let result = Box::new(extractor).finish();
        assert_eq!(result.usage.input_tokens, 5);
    }

    #[test]
    fn openai_extractor_reads_response_completed_usage() {
        let mut extractor = OpenAiExtractor::default();
        extractor.feed(br#"data: {"type":"response.completed","response":{"model":"gpt-4.1","usage":{"input_tokens":3,"output_tokens":7,"input_tokens_details":{"cached_tokens":1}}}}"#);
        extractor.feed(b"\n\n");
        let result = Box::new(extractor).finish();
        assert_eq!(result.usage.input_tokens, 3);
        assert_eq!(result.usage.output_tokens, 7);
        assert_eq!(result.usage.cache_read_tokens, 1);
    }

    #[test]
    fn gemini_extractor_takes_latest_cumulative_usage() {
        let mut extractor = GeminiExtractor::default();
        extractor.feed(br#"[{"usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":1}},"#);
        extractor.feed(b"\n");
        extractor.feed(br#"{"usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":9}}]"#);
        extractor.feed(b"\n");
        let result = Box::new(extractor).finish();
        assert_eq!(result.usage.input_tokens, 4);
        assert_eq!(result.usage.output_tokens, 9);
    }

    #[test]
    fn non_streamed_body_parses_in_one_shot() {
        let mut extractor = ClaudeExtractor::default();
        extractor.parse_full(br#"{"model":"claude-3-5-sonnet","usage":{"input_tokens":1,"output_tokens":2}}"#);
        let result = Box::new(extractor).finish();
        assert_eq!(result.usage.input_tokens, 1);
        assert_eq!(result.usage.output_tokens, 2);
    }
}
