use gateway_core::{Account, Platform};
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{json, Value};

use crate::Translator;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

#[derive(Debug, Default)]
pub struct GeminiTranslator;

impl Translator for GeminiTranslator {
    fn platform(&self) -> Platform {
        Platform::Gemini
    }

    fn base_url(&self, account: &Account) -> String {
        account
            .credentials
            .extras
            .get("base_url")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
    }

    fn inject_headers(&self, account: &Account, _model: &str, _beta_for_apikey: bool, headers: &mut HeaderMap) {
        // Gemini accepts the key as a header or a query parameter; the
        // proxy engine appends `?key=` for apikey accounts when building
        // the request URL, so this only covers OAuth (Code-Assist) flow.
        if let Some(token) = &account.credentials.access_token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                headers.insert(reqwest::header::AUTHORIZATION, value);
            }
        } else if let Some(key) = &account.credentials.api_key {
            if let Ok(value) = HeaderValue::from_str(key) {
                headers.insert("x-goog-api-key", value);
            }
        }
        headers.insert("user-agent", HeaderValue::from_static("google-genai-sdk/gemini-cli"));
    }

    /// Rewrites a Claude-shaped `{system, messages: [{role, content}]}`
    /// body into Gemini's `{systemInstruction, contents: [{role, parts}]}`
    /// shape. OpenAI-shaped bodies (`{input: [...]}`) are detected by the
    /// absence of `messages` and passed through unchanged — full
    /// Responses-API translation is tracked separately and out of scope
    /// here.
    fn translate_body(&self, body: &[u8]) -> Vec<u8> {
        let Ok(value) = serde_json::from_slice::<Value>(body) else {
            return body.to_vec();
        };
        let Some(messages) = value.get("messages").and_then(Value::as_array) else {
            return body.to_vec();
        };

        let contents: Vec<Value> = messages
            .iter()
            .map(|msg| {
                let role = match msg.get("role").and_then(Value::as_str) {
                    Some("assistant") => "model",
                    _ => "user",
                };
                let text = message_text(msg);
                json!({ "role": role, "parts": [{ "text": text }] })
            })
            .collect();

        let mut translated = json!({ "contents": contents });
        if let Some(system) = value.get("system") {
            translated["systemInstruction"] =
                json!({ "parts": [{ "text": system.as_str().unwrap_or_default() }] });
        }

        serde_json::to_vec(&translated).unwrap_or_else(|_| body.to_vec())
    }
}

fn message_text(msg: &Value) -> String {
    match msg.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_shaped_body_translates_to_gemini_contents() {
        let translator = GeminiTranslator::default();
        let body = json!({
            "system": "be terse",
            "messages": [
                { "role": "user", "content": "hello" },
                { "role": "assistant", "content": "hi there" },
            ],
        });
        let out: Value = serde_json::from_slice(&translator.translate_body(
            &serde_json::to_vec(&body).unwrap(),
        ))
        .unwrap();
        assert_eq!(out["contents"][0]["role"], "user");
        assert_eq!(out["contents"][1]["role"], "model");
        assert_eq!(out["systemInstruction"]["parts"][0]["text"], "be terse");
    }

    #[test]
    fn non_claude_shaped_body_passes_through() {
        let translator = GeminiTranslator::default();
        let body = br#"{"input":[{"role":"user","content":"hi"}]}"#;
        assert_eq!(translator.translate_body(body), body);
    }
}
