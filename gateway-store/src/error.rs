use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("credential decrypt failed: {0}")]
    Decrypt(#[from] gateway_crypto::DecryptError),
    #[error("credential encrypt failed: {0}")]
    Encrypt(#[from] gateway_crypto::EncryptError),
    #[error("row decode error: {0}")]
    Decode(String),
    #[error("not found")]
    NotFound,
}

impl From<StoreError> for gateway_core::GatewayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => gateway_core::GatewayError::new(
                gateway_core::ErrorKind::NotFound,
                "NOT_FOUND",
                err.to_string(),
            ),
            other => gateway_core::GatewayError::new(
                gateway_core::ErrorKind::Internal,
                "STORE_ERROR",
                other.to_string(),
            ),
        }
    }
}
