//! Per-request state machine: INIT -> LEASE_HELD ->
//! UPSTREAM_OPEN -> STREAMING -> {COMPLETED, FAILED, FAILING_OVER} -> CLOSED.
//!
//! `ProxyEngine::execute` owns one request end to end; failover re-enters
//! at LEASE_HELD against a fresh account, excluding the one that just
//! failed, bounded by `max_failover_attempts`.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use gateway_core::{
    AccountId, AccountType, ErrorKind, GatewayError, GatewaySchedulingConfig, GroupId, Platform,
    SessionWindowStatus, TokenUsage, UserId,
};
use gateway_httpclient::{ClientKey, ClientPool};
use gateway_providers::translator_for;
use gateway_scheduler::{ScheduleRequest, Scheduler};
use gateway_store::AccountRepository;
use tracing::{info, warn};

use crate::classify::{classify, Disposition};
use crate::extractor::{ClaudeExtractor, ExtractedUsage, GeminiExtractor, OpenAiExtractor, UsageExtractor};

#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub user_id: UserId,
    pub user_concurrency_limit: i64,
    pub platform: Platform,
    pub allowed_group_ids: Vec<GroupId>,
    pub sticky_session_id: Option<String>,
    pub model: String,
    /// Upstream path, e.g. `/v1/messages` — the northbound route table that
    /// resolves this from the inbound request lives outside this crate.
    pub upstream_path: String,
    pub body: Vec<u8>,
    pub stream: bool,
}

#[derive(Debug)]
pub struct ProxyOutcome {
    pub account_id: AccountId,
    pub usage: TokenUsage,
    pub model: Option<String>,
    pub stream: bool,
    pub duration_ms: i64,
    pub first_token_ms: Option<i64>,
    pub response_body: Vec<u8>,
    pub content_type: Option<String>,
}

pub struct ProxyEngine {
    scheduler: Scheduler,
    accounts: Arc<dyn AccountRepository>,
    clients: Arc<ClientPool>,
    config: GatewaySchedulingConfig,
    max_failover_attempts: u32,
}

enum Attempt {
    Completed(ProxyOutcome),
    Failover(AccountId, GatewayError),
    Terminal(GatewayError),
}

impl ProxyEngine {
    pub fn new(
        scheduler: Scheduler,
        accounts: Arc<dyn AccountRepository>,
        clients: Arc<ClientPool>,
        config: GatewaySchedulingConfig,
        max_failover_attempts: u32,
    ) -> Self {
        Self { scheduler, accounts, clients, config, max_failover_attempts }
    }

    pub async fn execute(&self, req: &ProxyRequest) -> Result<ProxyOutcome, GatewayError> {
        let mut excluded: Vec<AccountId> = Vec::new();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.try_once(req, &excluded).await {
                Attempt::Completed(outcome) => return Ok(outcome),
                Attempt::Failover(account_id, err) => {
                    warn!(%account_id, attempt, reason = %err.reason, "account-local failure, failing over");
                    excluded.push(account_id);
                    if attempt >= self.max_failover_attempts {
                        return Err(err);
                    }
                }
                Attempt::Terminal(err) => return Err(err),
            }
        }
    }

    async fn try_once(&self, req: &ProxyRequest, excluded: &[AccountId]) -> Attempt {
        // INIT -> LEASE_HELD
        let lease = match self
            .scheduler
            .acquire(ScheduleRequest {
                user_id: req.user_id.clone(),
                user_concurrency_limit: req.user_concurrency_limit,
                platform: req.platform,
                allowed_group_ids: req.allowed_group_ids.clone(),
                sticky_session_id: req.sticky_session_id.clone(),
            })
            .await
        {
            Ok(lease) => lease,
            Err(err) => return Attempt::Terminal(err),
        };

        if excluded.contains(lease.account_id()) {
            lease.release().await;
            return Attempt::Terminal(GatewayError::no_eligible_accounts());
        }

        let account = match self.accounts.get(lease.account_id()).await {
            Ok(Some(account)) => account,
            _ => {
                lease.release().await;
                return Attempt::Terminal(GatewayError::new(
                    ErrorKind::Internal,
                    "ACCOUNT_VANISHED",
                    "scheduled account no longer exists",
                ));
            }
        };

        // LEASE_HELD -> UPSTREAM_OPEN
        let translator = translator_for(account.platform);
        let base_url = translator.base_url(&account);
        let mut headers = reqwest::header::HeaderMap::new();
        translator.inject_headers(&account, &req.model, self.config.inject_beta_for_apikey, &mut headers);
        let body = translator.translate_body(&req.body);

        let client_key = ClientKey::new(
            self.config.connection_pool_isolation,
            &account.id,
            account.proxy_id.as_ref(),
            None,
            Some(self.config.response_header_timeout_secs),
            false,
        );
        let client = match self.clients.get_or_build(&client_key) {
            Ok(client) => client,
            Err(err) => {
                lease.release().await;
                return Attempt::Terminal(GatewayError::new(
                    ErrorKind::Internal,
                    "CLIENT_BUILD_FAILED",
                    err.to_string(),
                ));
            }
        };

        let started_at = Utc::now();
        let send_result = tokio::time::timeout(
            Duration::from_secs(self.config.response_header_timeout_secs.max(1)),
            client.post(format!("{base_url}{}", req.upstream_path)).headers(headers).body(body).send(),
        )
        .await;

        let response = match send_result {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                let account_id = account.id.clone();
                self.mark_cooldown(&account_id, Disposition::Transient, started_at).await;
                lease.release().await;
                return Attempt::Failover(
                    account_id,
                    GatewayError::new(ErrorKind::UpstreamError, "UPSTREAM_CONNECT_FAILED", err.to_string()),
                );
            }
            Err(_) => {
                let account_id = account.id.clone();
                self.mark_cooldown(&account_id, Disposition::Transient, started_at).await;
                lease.release().await;
                return Attempt::Failover(
                    account_id,
                    GatewayError::new(ErrorKind::Timeout, "RESPONSE_HEADER_TIMEOUT", "upstream did not respond in time"),
                );
            }
        };

        let status = response.status().as_u16();
        if status >= 400 {
            let disposition = classify(
                status,
                response.headers(),
                started_at,
                self.config.overload_cooldown_minutes,
                self.config.failover_on_400,
            );
            let account_id = account.id.clone();
            self.mark_cooldown(&account_id, disposition.clone(), started_at).await;
            lease.release().await;

            return match disposition {
                Disposition::BadRequest => Attempt::Terminal(GatewayError::new(
                    ErrorKind::Validation,
                    "UPSTREAM_BAD_REQUEST",
                    "upstream rejected the request",
                )),
                Disposition::ClientClosed => Attempt::Terminal(GatewayError::new(
                    ErrorKind::ClientClosed,
                    "CLIENT_CLOSED",
                    "client closed the connection",
                )),
                Disposition::Ok => unreachable!("status >= 400 cannot classify as Ok"),
                _ => Attempt::Failover(
                    account_id,
                    GatewayError::new(ErrorKind::UpstreamError, "UPSTREAM_ERROR", format!("upstream returned {status}")),
                ),
            };
        }

        // UPSTREAM_OPEN -> STREAMING -> COMPLETED
        let mut extractor: Box<dyn UsageExtractor> = match account.platform {
            Platform::Claude => Box::new(ClaudeExtractor::default()),
            Platform::OpenAi => Box::new(OpenAiExtractor::default()),
            Platform::Gemini | Platform::Antigravity => Box::new(GeminiExtractor::default()),
        };

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let session_window_reset_at = session_window_reset(response.headers());

        let mut first_token_ms: Option<i64> = None;
        let mut response_body = Vec::new();
        let mut bytes_stream = response.bytes_stream();
        while let Some(chunk) = next_chunk(&mut bytes_stream).await {
            match chunk {
                Ok(bytes) => {
                    if first_token_ms.is_none() {
                        first_token_ms = Some((Utc::now() - started_at).num_milliseconds());
                    }
                    extractor.feed(&bytes);
                    response_body.extend_from_slice(&bytes);
                }
                Err(err) => {
                    lease.release().await;
                    return Attempt::Terminal(GatewayError::new(
                        ErrorKind::ClientClosed,
                        "STREAM_READ_FAILED",
                        err.to_string(),
                    ));
                }
            }
        }

        let ExtractedUsage { usage, model } = extractor.finish();
        let duration_ms = (Utc::now() - started_at).num_milliseconds();
        let account_id = account.id.clone();

        if account.platform == Platform::Claude && account.account_type == AccountType::OAuth {
            if let Some(reset_at) = session_window_reset_at {
                let _ = self
                    .accounts
                    .update_session_window(&account_id, reset_at - chrono::Duration::hours(5), reset_at, SessionWindowStatus::Active)
                    .await;
            }
        }

        let _ = self.accounts.touch_last_used(&account_id, Utc::now()).await;
        lease.release().await;

        info!(%account_id, duration_ms, "request completed");

        Attempt::Completed(ProxyOutcome {
            account_id,
            usage,
            model,
            stream: req.stream,
            duration_ms,
            first_token_ms,
            response_body,
            content_type,
        })
    }

    async fn mark_cooldown(&self, account_id: &AccountId, disposition: Disposition, now: DateTime<Utc>) {
        match disposition {
            Disposition::AuthFailed => {
                let _ = self.accounts.mark_error(account_id, "upstream rejected credentials").await;
            }
            Disposition::RateLimited { reset_at } => {
                let _ = self.accounts.mark_rate_limited(account_id, reset_at).await;
            }
            Disposition::Overloaded => {
                let until = now + chrono::Duration::minutes(self.config.overload_cooldown_minutes);
                let _ = self.accounts.mark_overload(account_id, until).await;
            }
            Disposition::Transient => {
                let until = now + chrono::Duration::seconds(30);
                let _ = self.accounts.mark_temp_unschedulable(account_id, until, "transient upstream fault").await;
            }
            Disposition::BadRequest | Disposition::ClientClosed | Disposition::Ok => {}
        }
    }
}

async fn next_chunk<S>(stream: &mut S) -> Option<Result<Bytes, reqwest::Error>>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
{
    stream.next().await
}

/// Claude's unified rate-limit header reports when the current 5-hour
/// session window resets, as an RFC3339 timestamp. Absent on responses
/// outside an active session window (or on providers that don't send it),
/// in which case the caller should leave the account's window untouched
/// rather than stamp a synthetic one.
fn session_window_reset(headers: &reqwest::header::HeaderMap) -> Option<DateTime<Utc>> {
    let raw = headers.get("anthropic-ratelimit-unified-reset")?.to_str().ok()?;
    DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    #[test]
    fn session_window_reset_parses_rfc3339_header() {
        let mut headers = HeaderMap::new();
        headers.insert("anthropic-ratelimit-unified-reset", HeaderValue::from_static("2024-06-01T12:00:00Z"));
        let reset = session_window_reset(&headers).unwrap();
        assert_eq!(reset.to_rfc3339(), "2024-06-01T12:00:00+00:00");
    }

    #[test]
    fn session_window_reset_is_none_when_header_absent() {
        let headers = HeaderMap::new();
        assert!(session_window_reset(&headers).is_none());
    }

    #[test]
    fn session_window_reset_is_none_when_header_unparseable() {
        let mut headers = HeaderMap::new();
        headers.insert("anthropic-ratelimit-unified-reset", HeaderValue::from_static("not-a-date"));
        assert!(session_window_reset(&headers).is_none());
    }
}
