//! Process-wide OAuth token slot.
//!
//! The slot lock is held across the refresh call, so concurrent callers that
//! find the token stale queue behind one in-flight exchange and then read its
//! result instead of refreshing again.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;
use tracing::{info, warn};

use billsync_core::clock::Clock;

use crate::error::{CrmError, TokenError};

/// Longest lifetime accepted from the token endpoint.
pub const MAX_TOKEN_LIFETIME_SECS: i64 = 86_400;

/// Result of a refresh-token exchange.
#[derive(Clone, Debug)]
pub struct TokenGrant {
    pub access_token: SecretString,
    pub expires_in_secs: i64,
    /// Set when the provider rotated the refresh token.
    pub refresh_token: Option<SecretString>,
}

#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn refresh(&self, refresh_token: &SecretString) -> Result<TokenGrant, CrmError>;
}

struct CachedToken {
    value: SecretString,
    expires_at: DateTime<Utc>,
}

struct TokenSlot {
    refresh_token: SecretString,
    current: Option<CachedToken>,
}

pub struct CrmTokenCache {
    exchanger: Arc<dyn TokenExchanger>,
    clock: Arc<dyn Clock>,
    expiry_margin: Duration,
    slot: Mutex<TokenSlot>,
}

impl CrmTokenCache {
    pub fn new(
        exchanger: Arc<dyn TokenExchanger>,
        clock: Arc<dyn Clock>,
        refresh_token: SecretString,
        expiry_margin: Duration,
    ) -> Self {
        Self {
            exchanger,
            clock,
            expiry_margin,
            slot: Mutex::new(TokenSlot { refresh_token, current: None }),
        }
    }

    /// Returns the cached token while it is fresh, otherwise refreshes it.
    pub async fn get_token(&self) -> Result<SecretString, TokenError> {
        let mut slot = self.slot.lock().await;
        let now = self.clock.now();

        if let Some(current) = slot.current.as_ref() {
            if now < current.expires_at {
                return Ok(current.value.clone());
            }
        }

        let grant = self.exchanger.refresh(&slot.refresh_token).await.map_err(|error| {
            warn!(
                event_name = "system.crm.token_refresh_failed",
                error = %error,
                "crm token refresh failed"
            );
            TokenError::Refresh(error)
        })?;

        if grant.access_token.expose_secret().trim().is_empty() {
            return Err(TokenError::EmptyToken);
        }

        let lifetime = grant
            .expires_in_secs
            .saturating_sub(self.expiry_margin.num_seconds())
            .clamp(0, MAX_TOKEN_LIFETIME_SECS);
        let refreshed_at = self.clock.now();
        let expires_at = Duration::try_seconds(lifetime)
            .and_then(|ttl| refreshed_at.checked_add_signed(ttl))
            .unwrap_or(refreshed_at);

        if let Some(rotated) = grant.refresh_token {
            if rotated.expose_secret() != slot.refresh_token.expose_secret() {
                info!(event_name = "system.crm.refresh_token_rotated", "crm refresh token rotated");
                slot.refresh_token = rotated;
            }
        }

        info!(
            event_name = "system.crm.token_refreshed",
            expires_at = %expires_at.to_rfc3339(),
            "crm access token refreshed"
        );
        let value = grant.access_token;
        slot.current = Some(CachedToken { value: value.clone(), expires_at });
        Ok(value)
    }

    #[cfg(test)]
    async fn cached_until(&self) -> Option<DateTime<Utc>> {
        self.slot.lock().await.current.as_ref().map(|current| current.expires_at)
    }

    /// Drops the cached token if it is still `stale`. A token another caller
    /// already replaced is left alone.
    pub async fn invalidate(&self, stale: &SecretString) {
        let mut slot = self.slot.lock().await;
        let matches = slot
            .current
            .as_ref()
            .map(|current| current.value.expose_secret() == stale.expose_secret())
            .unwrap_or(false);
        if matches {
            slot.current = None;
        }
    }
}
