use gateway_core::{Account, Platform};
use reqwest::header::HeaderMap;

use crate::gemini::GeminiTranslator;
use crate::Translator;

const DEFAULT_BASE_URL: &str = "https://antigravity.googleapis.com";

/// Antigravity is Gemini's sibling surface: same native wire shape, its own
/// origin and account pool (forced-platform at the HTTP layer, per
/// northbound route table), so header/body handling delegates to
/// [`GeminiTranslator`] and only the base URL differs.
#[derive(Debug, Default)]
pub struct AntigravityTranslator {
    inner: GeminiTranslator,
}

impl Translator for AntigravityTranslator {
    fn platform(&self) -> Platform {
        Platform::Antigravity
    }

    fn base_url(&self, account: &Account) -> String {
        account
            .credentials
            .extras
            .get("base_url")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
    }

    fn inject_headers(&self, account: &Account, model: &str, beta_for_apikey: bool, headers: &mut HeaderMap) {
        self.inner.inject_headers(account, model, beta_for_apikey, headers);
    }

    fn translate_body(&self, body: &[u8]) -> Vec<u8> {
        self.inner.translate_body(body)
    }
}
