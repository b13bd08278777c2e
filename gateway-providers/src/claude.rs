use gateway_core::{Account, AccountType, Platform};
use reqwest::header::{HeaderMap, HeaderValue};

use crate::{inject_auth_header, Translator};

/// `anthropic-beta` values keyed by the leading model family segment, e.g.
/// `claude-3-5-sonnet-20241022` matches `claude-3-5`. Only applied to
/// api-key accounts, and only when `beta_for_apikey` is set.
const BETA_HEADERS_BY_MODEL_FAMILY: &[(&str, &str)] = &[
    ("claude-3-5", "prompt-caching-2024-07-31"),
    ("claude-3-7", "output-128k-2025-02-19,prompt-caching-2024-07-31"),
    ("claude-opus-4", "output-128k-2025-02-19,prompt-caching-2024-07-31"),
];

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

#[derive(Debug, Default)]
pub struct ClaudeTranslator;

impl Translator for ClaudeTranslator {
    fn platform(&self) -> Platform {
        Platform::Claude
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
        inject_auth_header(account, "x-api-key", headers);
        headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
        headers.insert("user-agent", HeaderValue::from_static("claude-cli/1.0.0 (external, cli)"));

        if account.account_type != AccountType::ApiKey || !beta_for_apikey {
            return;
        }

        if let Some((_, beta)) =
            BETA_HEADERS_BY_MODEL_FAMILY.iter().find(|(family, _)| model.starts_with(family))
        {
            if let Ok(value) = HeaderValue::from_str(beta) {
                headers.insert("anthropic-beta", value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gateway_core::{AccountCredentials, AccountId, AccountStatus, AccountType};
    use std::collections::HashMap;

    fn apikey_account() -> Account {
        let now = Utc::now();
        Account {
            id: AccountId::from("acc-1".to_string()),
            name: "test".into(),
            platform: Platform::Claude,
            account_type: AccountType::ApiKey,
            credentials: AccountCredentials {
                access_token: None,
                refresh_token: None,
                api_key: Some("sk-ant-test".into()),
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

    fn oauth_account() -> Account {
        let mut account = apikey_account();
        account.account_type = AccountType::OAuth;
        account.credentials.api_key = None;
        account.credentials.access_token = Some("oauth-token".into());
        account
    }

    #[test]
    fn known_model_family_gets_beta_header_for_apikey_account_when_flag_set() {
        let translator = ClaudeTranslator::default();
        let mut headers = HeaderMap::new();
        translator.inject_headers(&apikey_account(), "claude-3-5-sonnet-20241022", true, &mut headers);
        assert!(headers.get("anthropic-beta").is_some());
    }

    #[test]
    fn unknown_model_family_gets_no_beta_header() {
        let translator = ClaudeTranslator::default();
        let mut headers = HeaderMap::new();
        translator.inject_headers(&apikey_account(), "claude-1.0", true, &mut headers);
        assert!(headers.get("anthropic-beta").is_none());
    }

    #[test]
    fn beta_header_withheld_when_flag_is_false() {
        let translator = ClaudeTranslator::default();
        let mut headers = HeaderMap::new();
        translator.inject_headers(&apikey_account(), "claude-3-5-sonnet-20241022", false, &mut headers);
        assert!(headers.get("anthropic-beta").is_none());
    }

    #[test]
    fn beta_header_withheld_for_oauth_account_even_when_flag_set() {
        let translator = ClaudeTranslator::default();
        let mut headers = HeaderMap::new();
        translator.inject_headers(&oauth_account(), "claude-3-5-sonnet-20241022", true, &mut headers);
        assert!(headers.get("anthropic-beta").is_none());
    }

    #[test]
    fn base_url_falls_back_to_default_without_override() {
        let translator = ClaudeTranslator::default();
        assert_eq!(translator.base_url(&apikey_account()), DEFAULT_BASE_URL);
    }
}
