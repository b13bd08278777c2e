//! Northbound authentication: resolves an `Authorization: Bearer <token>`
//! header against the API key store.

use std::sync::Arc;

use gateway_core::{ApiKeyId, ErrorKind, GatewayError, GroupId, UserId};
use gateway_store::ApiKeyRepository;
use sha2::{Digest, Sha256};

/// Identity resolved from a valid API key: which user is billed, which
/// account groups the request may draw from, and whether the key is
/// pinned to exactly one of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub api_key_id: ApiKeyId,
    pub user_id: UserId,
    pub allowed_group_ids: Vec<GroupId>,
    pub bound_group_id: Option<GroupId>,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing or malformed Authorization header")]
    MissingCredential,
    #[error(transparent)]
    Store(#[from] gateway_store::StoreError),
}

impl From<AuthError> for GatewayError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingCredential => GatewayError::unknown_api_key(),
            AuthError::Store(e) => GatewayError::new(ErrorKind::Internal, "AUTH_STORE_ERROR", e.to_string()),
        }
    }
}

pub struct Authenticator {
    keys: Arc<dyn ApiKeyRepository>,
    users: Arc<dyn gateway_store::UserRepository>,
}

impl Authenticator {
    pub fn new(keys: Arc<dyn ApiKeyRepository>, users: Arc<dyn gateway_store::UserRepository>) -> Self {
        Self { keys, users }
    }

    /// Strips a leading `Bearer ` scheme if present, hashes the remainder,
    /// and resolves it against the active API key table. The `Bearer`
    /// prefix is optional since several northbound routes accept the raw
    /// token in a provider-native header instead (`x-api-key`, `x-goog-api-key`).
    pub async fn authenticate(&self, credential: &str) -> Result<AuthContext, AuthError> {
        let token = credential.strip_prefix("Bearer ").unwrap_or(credential).trim();
        if token.is_empty() {
            return Err(AuthError::MissingCredential);
        }

        let hash = hash_token(token);
        let key = self.keys.find_active_by_hash(&hash).await?.ok_or(AuthError::MissingCredential)?;

        let allowed_group_ids = match &key.bound_group_id {
            Some(group_id) => vec![group_id.clone()],
            None => self.users.allowed_group_ids(&key.user_id).await?,
        };

        Ok(AuthContext {
            api_key_id: key.id,
            user_id: key.user_id,
            allowed_group_ids,
            bound_group_id: key.bound_group_id,
        })
    }
}

fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::ApiKey;
    use gateway_store::{InMemoryApiKeyRepository, InMemoryUserRepository};

    fn authenticator(key: ApiKey) -> Authenticator {
        Authenticator::new(
            Arc::new(InMemoryApiKeyRepository::new(vec![key])),
            Arc::new(InMemoryUserRepository::new(vec![])),
        )
    }

    fn key_for(token: &str, bound_group_id: Option<GroupId>) -> ApiKey {
        ApiKey {
            id: ApiKeyId::from("key-1".to_string()),
            user_id: UserId::from("user-1".to_string()),
            bound_group_id,
            prefix: token[..6].to_string(),
            token_hash: hash_token(token),
            active: true,
        }
    }

    #[tokio::test]
    async fn valid_bearer_token_resolves_to_user() {
        let token = "gw_live_abc123";
        let auth = authenticator(key_for(token, None));
        let ctx = auth.authenticate(&format!("Bearer {token}")).await.unwrap();
        assert_eq!(ctx.user_id.as_str(), "user-1");
    }

    #[tokio::test]
    async fn raw_token_without_bearer_prefix_also_resolves() {
        let token = "gw_live_abc123";
        let auth = authenticator(key_for(token, None));
        let ctx = auth.authenticate(token).await.unwrap();
        assert_eq!(ctx.api_key_id.as_str(), "key-1");
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let auth = authenticator(key_for("gw_live_abc123", None));
        let err = auth.authenticate("Bearer gw_live_wrong").await.unwrap_err();
        assert!(matches!(err, AuthError::MissingCredential));
    }

    #[tokio::test]
    async fn bound_group_key_restricts_to_single_group() {
        let token = "gw_live_bound";
        let group_id = GroupId::from("group-1".to_string());
        let auth = authenticator(key_for(token, Some(group_id.clone())));
        let ctx = auth.authenticate(token).await.unwrap();
        assert_eq!(ctx.allowed_group_ids, vec![group_id]);
    }

    #[tokio::test]
    async fn empty_credential_is_rejected() {
        let auth = authenticator(key_for("gw_live_abc123", None));
        let err = auth.authenticate("Bearer ").await.unwrap_err();
        assert!(matches!(err, AuthError::MissingCredential));
    }
}
