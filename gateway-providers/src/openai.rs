use gateway_core::{Account, Platform};
use reqwest::header::{HeaderMap, HeaderValue};

use crate::{inject_auth_header, Translator};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

#[derive(Debug, Default)]
pub struct OpenAiTranslator;

impl Translator for OpenAiTranslator {
    fn platform(&self) -> Platform {
        Platform::OpenAi
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
        inject_auth_header(account, "openai-api-key", headers);
        headers.insert("user-agent", HeaderValue::from_static("codex-cli/1.0.0"));
        if let Some(org) = account.credentials.extras.get("organization") {
            if let Ok(value) = HeaderValue::from_str(org) {
                headers.insert("openai-organization", value);
            }
        }
    }
}
