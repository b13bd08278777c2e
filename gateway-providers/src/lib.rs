//! Southbound translators: per-platform auth header injection, base URL
//! selection, and (for Gemini/Antigravity) body translation between
//! provider dialects. The proxy engine calls through a single interface;
//! translators themselves are stateless and hold no per-request state.

mod antigravity;
mod claude;
mod gemini;
mod openai;

use gateway_core::{Account, AccountType, Platform};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

pub use antigravity::AntigravityTranslator;
pub use claude::ClaudeTranslator;
pub use gemini::GeminiTranslator;
pub use openai::OpenAiTranslator;

/// Southbound request shape the proxy engine hands to a translator before
/// it opens the upstream connection.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub base_url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// Per-platform southbound behavior: where the upstream lives, what auth
/// and compatibility headers it expects, and (where the provider's wire
/// shape differs from what the client sent) how to reshape the body.
pub trait Translator: Send + Sync {
    fn platform(&self) -> Platform;

    /// Upstream origin for this account, e.g. `https://api.anthropic.com`.
    /// Accounts may carry a platform-specific override (project/region) via
    /// `extras`; translators consult those before falling back to the
    /// provider default.
    fn base_url(&self, account: &Account) -> String;

    /// Mutates `headers` in place: auth header per credential type, plus
    /// any provider-mandated compatibility headers (`anthropic-beta`,
    /// `User-Agent`, API version headers). `beta_for_apikey` carries
    /// `GatewaySchedulingConfig::inject_beta_for_apikey` — translators that
    /// gate a header on that flag (currently only Claude's `anthropic-beta`)
    /// consult it; the rest ignore it.
    fn inject_headers(&self, account: &Account, model: &str, beta_for_apikey: bool, headers: &mut HeaderMap);

    /// Reshape a client-shaped request body into this provider's native
    /// shape. Claude and OpenAI translators are passthrough; Gemini and
    /// Antigravity rewrite Claude/OpenAI-shaped bodies into `parts`/`tools`.
    fn translate_body(&self, body: &[u8]) -> Vec<u8> {
        body.to_vec()
    }
}

/// Sets the `Authorization: Bearer ...` header for OAuth accounts or the
/// provider's native api-key header for API-key accounts. Shared by every
/// translator since the OAuth/apikey split is identical across platforms;
/// only the header *name* for the api-key case differs.
pub(crate) fn inject_auth_header(account: &Account, api_key_header: &str, headers: &mut HeaderMap) {
    match account.account_type {
        AccountType::OAuth => {
            if let Some(token) = &account.credentials.access_token {
                if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                    headers.insert(reqwest::header::AUTHORIZATION, value);
                }
            }
        }
        AccountType::ApiKey => {
            if let Some(key) = &account.credentials.api_key {
                if let (Ok(name), Ok(value)) =
                    (HeaderName::from_bytes(api_key_header.as_bytes()), HeaderValue::from_str(key))
                {
                    headers.insert(name, value);
                }
            }
        }
    }
}

pub fn translator_for(platform: Platform) -> Box<dyn Translator> {
    match platform {
        Platform::Claude => Box::new(ClaudeTranslator::default()),
        Platform::OpenAi => Box::new(OpenAiTranslator::default()),
        Platform::Gemini => Box::new(GeminiTranslator::default()),
        Platform::Antigravity => Box::new(AntigravityTranslator::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gateway_core::{AccountCredentials, AccountId, AccountStatus};
    use std::collections::HashMap;

    fn account(account_type: AccountType, platform: Platform) -> Account {
        let now = Utc::now();
        Account {
            id: AccountId::from("acc-1".to_string()),
            name: "test".into(),
            platform,
            account_type,
            credentials: AccountCredentials {
                access_token: Some("oauth-token".into()),
                refresh_token: None,
                api_key: Some("sk-test".into()),
                expires_at: None,
                extras: HashMap::new(),
            },
            proxy_id: None,
            priority: 1,
            concurrency_limit: 1,
            status: AccountStatus::Active,
            error_message: None,
            schedulable: true,
            rate_limited_at: None,
            rate_limit_reset_at: None,
            overload_until: None,
            temp_unschedulable_until: None,
            temp_unschedulable_reason: None,
            session_window_start: None,
            session_window_end: None,
            session_window_status: None,
            last_used_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn oauth_account_gets_bearer_header() {
        let acc = account(AccountType::OAuth, Platform::Claude);
        let translator = translator_for(Platform::Claude);
        let mut headers = HeaderMap::new();
        translator.inject_headers(&acc, "claude-3-5-sonnet", true, &mut headers);
        assert_eq!(headers.get(reqwest::header::AUTHORIZATION).unwrap(), "Bearer oauth-token");
    }

    #[test]
    fn apikey_account_gets_native_header_not_bearer() {
        let acc = account(AccountType::ApiKey, Platform::Claude);
        let translator = translator_for(Platform::Claude);
        let mut headers = HeaderMap::new();
        translator.inject_headers(&acc, "claude-3-5-sonnet", true, &mut headers);
        assert!(headers.get(reqwest::header::AUTHORIZATION).is_none());
        assert_eq!(headers.get("x-api-key").unwrap(), "sk-test");
    }

    #[test]
    fn translator_for_dispatches_by_platform() {
        assert_eq!(translator_for(Platform::Claude).platform(), Platform::Claude);
        assert_eq!(translator_for(Platform::Gemini).platform(), Platform::Gemini);
        assert_eq!(translator_for(Platform::Antigravity).platform(), Platform::Antigravity);
        assert_eq!(translator_for(Platform::OpenAi).platform(), Platform::OpenAi);
    }
}
