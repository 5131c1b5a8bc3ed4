//! Durable per-identity token persistence behind a pluggable trait. The
//! session writes through on every mutation; the backend's only obligation
//! is last-write-wins per user id.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use tokio::sync::RwLock;

/// The working token set for one authenticated identity. Overwritten
/// wholesale on every refresh; never partially merged.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: SmolStr,
    pub refresh_token: Option<SmolStr>,
    /// Absent means the server issued a non-expiring token.
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

/// Errors emitted by token stores.
#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum TokenStoreError {
    /// Filesystem or I/O error
    #[error("I/O error: {0}")]
    #[diagnostic(code(weft_oauth::token_store::io))]
    Io(#[from] std::io::Error),
    /// Serialization error (e.g., JSON)
    #[error("serialization error: {0}")]
    #[diagnostic(code(weft_oauth::token_store::serde))]
    Serde(#[from] serde_json::Error),
    /// Any other error from a backend implementation
    #[error(transparent)]
    #[diagnostic(code(weft_oauth::token_store::other))]
    Other(#[from] Box<dyn StdError + Send + Sync>),
}

/// Pluggable durable storage, keyed by an opaque caller-supplied user id.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn save_tokens(&self, user_id: &str, record: &TokenRecord)
    -> Result<(), TokenStoreError>;

    async fn load_tokens(&self, user_id: &str) -> Result<Option<TokenRecord>, TokenStoreError>;

    async fn delete_tokens(&self, user_id: &str) -> Result<(), TokenStoreError>;
}

/// In-memory store suitable for short-lived sessions and tests.
#[derive(Clone, Default)]
pub struct MemoryTokenStore(Arc<RwLock<HashMap<SmolStr, TokenRecord>>>);

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn save_tokens(
        &self,
        user_id: &str,
        record: &TokenRecord,
    ) -> Result<(), TokenStoreError> {
        self.0
            .write()
            .await
            .insert(user_id.into(), record.clone());
        Ok(())
    }

    async fn load_tokens(&self, user_id: &str) -> Result<Option<TokenRecord>, TokenStoreError> {
        Ok(self.0.read().await.get(user_id).cloned())
    }

    async fn delete_tokens(&self, user_id: &str) -> Result<(), TokenStoreError> {
        self.0.write().await.remove(user_id);
        Ok(())
    }
}

#[async_trait]
impl<T: TokenStore> TokenStore for Arc<T> {
    async fn save_tokens(
        &self,
        user_id: &str,
        record: &TokenRecord,
    ) -> Result<(), TokenStoreError> {
        self.as_ref().save_tokens(user_id, record).await
    }

    async fn load_tokens(&self, user_id: &str) -> Result<Option<TokenRecord>, TokenStoreError> {
        self.as_ref().load_tokens(user_id).await
    }

    async fn delete_tokens(&self, user_id: &str) -> Result<(), TokenStoreError> {
        self.as_ref().delete_tokens(user_id).await
    }
}
