use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error kinds (not error types). Each member crate raises its own local
/// `thiserror` error and feeds it into `GatewayError` through a `From`
/// impl, so every crate-local failure mode ends up wearing one of these
/// kinds by the time it reaches a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Unauthenticated,
    Forbidden,
    NotFound,
    Conflict,
    RateLimited,
    NoCapacity,
    Timeout,
    ClientClosed,
    UpstreamOverloaded,
    UpstreamError,
    Internal,
}

impl ErrorKind {
    /// HTTP status this kind maps to for the generic REST envelope. Provider
    /// dialect routes may re-shape the body but keep this status.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::Unauthenticated => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::RateLimited => 429,
            ErrorKind::NoCapacity => 503,
            ErrorKind::Timeout => 504,
            ErrorKind::ClientClosed => 499,
            ErrorKind::UpstreamOverloaded => 529,
            ErrorKind::UpstreamError => 502,
            ErrorKind::Internal => 500,
        }
    }
}

#[derive(Debug, Error)]
#[error("{kind:?}: {reason} ({message})")]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub reason: String,
    pub message: String,
    pub metadata: HashMap<String, String>,
}

impl GatewayError {
    pub fn new(kind: ErrorKind, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind, reason: reason.into(), message: message.into(), metadata: HashMap::new() }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn insufficient_balance() -> Self {
        Self::new(
            ErrorKind::Forbidden,
            "INSUFFICIENT_BALANCE",
            "account balance or subscription cap exceeded",
        )
    }

    pub fn no_eligible_accounts() -> Self {
        Self::new(ErrorKind::NoCapacity, "NO_ELIGIBLE_ACCOUNTS", "no schedulable account available")
    }

    pub fn unknown_api_key() -> Self {
        Self::new(ErrorKind::Unauthenticated, "UNKNOWN_API_KEY", "api key not recognized")
    }

    /// Wire envelope returned to REST clients: `{code, reason, message, metadata}`.
    pub fn to_envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            code: self.kind.http_status(),
            reason: self.reason.clone(),
            message: self.message.clone(),
            metadata: if self.metadata.is_empty() { None } else { Some(self.metadata.clone()) },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub code: u16,
    pub reason: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

/// How the proxy engine and scheduler should react to an upstream failure,
/// decided by each provider's error classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Mark account health and attempt failover; request is retried against
    /// another eligible account if one exists.
    AccountLocal,
    /// Surface directly to the caller, no account health change (400, 499).
    RequestLocal,
    /// Surface as a 5xx; no further failover attempted.
    Fatal,
}
