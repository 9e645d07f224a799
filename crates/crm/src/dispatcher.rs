use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use tracing::{info, warn};

use crate::error::{CrmError, DispatchError};
use crate::token::CrmTokenCache;

#[async_trait]
pub trait CrmTransport: Send + Sync {
    /// Create-or-update of the contact keyed by `email`.
    async fn upsert_contact(&self, token: &SecretString, email: &str) -> Result<(), CrmError>;

    async fn create_contact(&self, token: &SecretString, email: &str) -> Result<(), CrmError>;

    async fn send_conversion(
        &self,
        token: &SecretString,
        email: &str,
        conversion_identifier: &str,
    ) -> Result<(), CrmError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, base_delay_ms: 1_000, max_delay_ms: 30_000 }
    }
}

impl RetryPolicy {
    /// Linear backoff: the wait after attempt `n` is `n * base_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay_ms =
            self.base_delay_ms.saturating_mul(u64::from(attempt.max(1))).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeliveryReport {
    pub attempts: u32,
    pub contact_created: bool,
}

pub struct ConversionDispatcher {
    transport: Arc<dyn CrmTransport>,
    tokens: Arc<CrmTokenCache>,
    policy: RetryPolicy,
}

impl ConversionDispatcher {
    pub fn new(
        transport: Arc<dyn CrmTransport>,
        tokens: Arc<CrmTokenCache>,
        policy: RetryPolicy,
    ) -> Self {
        Self { transport, tokens, policy }
    }

    /// Upserts the contact and reports the conversion, retrying transient
    /// failures up to the policy's attempt ceiling.
    pub async fn send(
        &self,
        email: &str,
        conversion_identifier: &str,
    ) -> Result<DeliveryReport, DispatchError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            info!(
                event_name = "system.crm.dispatch_attempt",
                conversion_identifier,
                attempt,
                max_attempts,
                "sending conversion"
            );

            match self.attempt(email, conversion_identifier).await {
                Ok(contact_created) => {
                    info!(
                        event_name = "system.crm.dispatch_succeeded",
                        conversion_identifier,
                        attempt,
                        "conversion delivered"
                    );
                    return Ok(DeliveryReport { attempts: attempt, contact_created });
                }
                Err(AttemptError::Terminal(message)) => {
                    warn!(
                        event_name = "system.crm.dispatch_rejected",
                        conversion_identifier,
                        attempt,
                        error = %message,
                        "conversion rejected by crm"
                    );
                    return Err(DispatchError::Rejected(message));
                }
                Err(AttemptError::Retryable(message)) => {
                    warn!(
                        event_name = "system.crm.dispatch_attempt_failed",
                        conversion_identifier,
                        attempt,
                        max_attempts,
                        error = %message,
                        "conversion attempt failed"
                    );
                    last_error = message;
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.policy.backoff(attempt)).await;
            }
        }

        Err(DispatchError::Exhausted { attempts: max_attempts, last_error })
    }

    async fn attempt(
        &self,
        email: &str,
        conversion_identifier: &str,
    ) -> Result<bool, AttemptError> {
        let token = self.tokens.get_token().await.map_err(|error| {
            if error.is_retryable() {
                AttemptError::Retryable(error.to_string())
            } else {
                AttemptError::Terminal(error.to_string())
            }
        })?;

        let contact_created = match self.transport.upsert_contact(&token, email).await {
            Ok(()) => false,
            Err(CrmError::NotFound) => {
                info!(
                    event_name = "system.crm.contact_create_fallback",
                    "contact missing, creating it"
                );
                self.call(&token, self.transport.create_contact(&token, email).await).await?;
                self.call(&token, self.transport.upsert_contact(&token, email).await).await?;
                true
            }
            Err(error) => return Err(self.classify(&token, error).await),
        };

        let delivered = self.transport.send_conversion(&token, email, conversion_identifier).await;
        self.call(&token, delivered).await?;

        Ok(contact_created)
    }

    async fn call(
        &self,
        token: &SecretString,
        result: Result<(), CrmError>,
    ) -> Result<(), AttemptError> {
        match result {
            Ok(()) => Ok(()),
            Err(error) => Err(self.classify(token, error).await),
        }
    }

    async fn classify(&self, token: &SecretString, error: CrmError) -> AttemptError {
        if matches!(error, CrmError::Unauthorized) {
            self.tokens.invalidate(token).await;
        }

        if error.is_retryable() {
            AttemptError::Retryable(error.to_string())
        } else {
            AttemptError::Terminal(error.to_string())
        }
    }
}

enum AttemptError {
    Retryable(String),
    Terminal(String),
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::Duration;
    use secrecy::{ExposeSecret, SecretString};

    use billsync_core::clock::SystemClock;

    use super::{ConversionDispatcher, CrmTransport, RetryPolicy};
    use crate::error::{CrmError, DispatchError};
    use crate::token::{CrmTokenCache, TokenExchanger, TokenGrant};

    #[derive(Default)]
    struct ScriptedTransport {
        upserts: Mutex<VecDeque<Result<(), CrmError>>>,
        conversions: Mutex<VecDeque<Result<(), CrmError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn with_conversions(results: Vec<Result<(), CrmError>>) -> Self {
            Self { conversions: Mutex::new(results.into()), ..Self::default() }
        }

        fn record(&self, call: String) {
            self.calls.lock().expect("lock").push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl CrmTransport for ScriptedTransport {
        async fn upsert_contact(&self, token: &SecretString, email: &str) -> Result<(), CrmError> {
            self.record(format!("upsert:{email}:{}", token.expose_secret()));
            self.upserts.lock().expect("lock").pop_front().unwrap_or(Ok(()))
        }

        async fn create_contact(&self, _token: &SecretString, email: &str) -> Result<(), CrmError> {
            self.record(format!("create:{email}"));
            Ok(())
        }

        async fn send_conversion(
            &self,
            token: &SecretString,
            _email: &str,
            conversion_identifier: &str,
        ) -> Result<(), CrmError> {
            self.record(format!("conversion:{conversion_identifier}:{}", token.expose_secret()));
            self.conversions.lock().expect("lock").pop_front().unwrap_or(Ok(()))
        }
    }

    #[derive(Default)]
    struct CountingExchanger {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenExchanger for CountingExchanger {
        async fn refresh(&self, _refresh_token: &SecretString) -> Result<TokenGrant, CrmError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(TokenGrant {
                access_token: SecretString::from(format!("token-{call}")),
                expires_in_secs: 3_600,
                refresh_token: None,
            })
        }
    }

    fn dispatcher(
        transport: Arc<ScriptedTransport>,
        exchanger: Arc<CountingExchanger>,
    ) -> ConversionDispatcher {
        let tokens = Arc::new(CrmTokenCache::new(
            exchanger,
            Arc::new(SystemClock),
            SecretString::from("refresh"),
            Duration::seconds(60),
        ));
        ConversionDispatcher::new(
            transport,
            tokens,
            RetryPolicy { max_attempts: 3, base_delay_ms: 0, max_delay_ms: 0 },
        )
    }

    #[test]
    fn backoff_is_linear_and_capped() {
        let policy = RetryPolicy { max_attempts: 5, base_delay_ms: 1_000, max_delay_ms: 2_500 };
        assert_eq!(policy.backoff(1).as_millis(), 1_000);
        assert_eq!(policy.backoff(2).as_millis(), 2_000);
        assert_eq!(policy.backoff(3).as_millis(), 2_500);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let transport = Arc::new(ScriptedTransport::with_conversions(vec![
            Err(CrmError::Timeout),
            Err(CrmError::Transient("status 503".to_string())),
            Ok(()),
        ]));
        let dispatcher = dispatcher(transport.clone(), Arc::new(CountingExchanger::default()));

        let report = dispatcher.send("ana@example.com", "pos-graduacao-ccih-pago").await;

        assert_eq!(report.map(|report| report.attempts), Ok(3));
    }

    #[tokio::test]
    async fn exhausted_attempts_surface_last_error() {
        let transport = Arc::new(ScriptedTransport::with_conversions(vec![
            Err(CrmError::Timeout),
            Err(CrmError::Timeout),
            Err(CrmError::Transient("status 502: bad gateway".to_string())),
        ]));
        let dispatcher = dispatcher(transport.clone(), Arc::new(CountingExchanger::default()));

        let error = dispatcher
            .send("ana@example.com", "pos-graduacao-ccih-pago")
            .await
            .expect_err("delivery should fail");

        assert_eq!(
            error,
            DispatchError::Exhausted {
                attempts: 3,
                last_error: "transient crm failure: status 502: bad gateway".to_string(),
            }
        );
        let conversions = transport.calls().iter().filter(|call| call.starts_with("conversion")).count();
        assert_eq!(conversions, 3);
    }

    #[tokio::test]
    async fn missing_contact_is_created_then_upserted() {
        let transport = Arc::new(ScriptedTransport {
            upserts: Mutex::new(vec![Err(CrmError::NotFound)].into()),
            ..ScriptedTransport::default()
        });
        let dispatcher = dispatcher(transport.clone(), Arc::new(CountingExchanger::default()));

        let report = dispatcher.send("novo@example.com", "jornada-multi-r-pendente").await.expect("sent");

        assert_eq!(report.attempts, 1);
        assert!(report.contact_created);
        assert_eq!(
            transport.calls(),
            vec![
                "upsert:novo@example.com:token-1".to_string(),
                "create:novo@example.com".to_string(),
                "upsert:novo@example.com:token-1".to_string(),
                "conversion:jornada-multi-r-pendente:token-1".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let transport = Arc::new(ScriptedTransport::with_conversions(vec![Err(CrmError::Rejected {
            status: 400,
            body: "invalid conversion".to_string(),
        })]));
        let dispatcher = dispatcher(transport.clone(), Arc::new(CountingExchanger::default()));

        let error = dispatcher.send("ana@example.com", "x").await.expect_err("rejected");

        assert!(matches!(error, DispatchError::Rejected(_)));
        assert_eq!(transport.calls().len(), 2);
    }

    #[tokio::test]
    async fn unauthorized_invalidates_token_before_retry() {
        let transport = Arc::new(ScriptedTransport::with_conversions(vec![Err(CrmError::Unauthorized)]));
        let exchanger = Arc::new(CountingExchanger::default());
        let dispatcher = dispatcher(transport.clone(), exchanger.clone());

        let report = dispatcher.send("ana@example.com", "x").await.expect("sent on retry");

        assert_eq!(report.attempts, 2);
        assert_eq!(exchanger.calls.load(Ordering::SeqCst), 2);
        assert_eq!(transport.calls().last().map(String::as_str), Some("conversion:x:token-2"));
    }
}
