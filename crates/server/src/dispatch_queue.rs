use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use billsync_core::intake::ConversionJob;
use billsync_crm::ConversionDispatcher;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Queued,
    /// Queue at capacity; the job was dropped.
    Full,
    Closed,
}

/// Producer side of the bounded conversion queue. Cheap to clone.
#[derive(Clone)]
pub struct DispatchQueue {
    sender: mpsc::Sender<ConversionJob>,
}

impl DispatchQueue {
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<ConversionJob>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Never waits. Webhook acknowledgement must not depend on CRM latency.
    pub fn enqueue(&self, job: ConversionJob) -> EnqueueOutcome {
        match self.sender.try_send(job) {
            Ok(()) => EnqueueOutcome::Queued,
            Err(TrySendError::Full(job)) => {
                warn!(
                    event_name = "system.dispatch.queue_full",
                    conversion_identifier = %job.conversion_identifier,
                    "conversion queue full, dropping job"
                );
                EnqueueOutcome::Full
            }
            Err(TrySendError::Closed(_)) => EnqueueOutcome::Closed,
        }
    }
}

/// Drains the queue one job at a time until every producer is dropped.
pub fn spawn_worker(
    mut receiver: mpsc::Receiver<ConversionJob>,
    dispatcher: Arc<ConversionDispatcher>,
) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut handled = 0;
        while let Some(job) = receiver.recv().await {
            handled += 1;
            match dispatcher.send(&job.email, &job.conversion_identifier).await {
                Ok(report) => info!(
                    event_name = "system.dispatch.delivered",
                    conversion_identifier = %job.conversion_identifier,
                    attempts = report.attempts,
                    contact_created = report.contact_created,
                    "conversion delivered"
                ),
                Err(error) => warn!(
                    event_name = "system.dispatch.failed",
                    conversion_identifier = %job.conversion_identifier,
                    error_class = error.error_class(),
                    error = %error,
                    "conversion delivery failed"
                ),
            }
        }
        info!(event_name = "system.dispatch.worker_stopped", handled, "dispatch worker stopped");
        handled
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::Duration;
    use secrecy::SecretString;

    use billsync_core::clock::SystemClock;
    use billsync_core::intake::ConversionJob;
    use billsync_crm::{
        ConversionDispatcher, CrmError, CrmTokenCache, CrmTransport, RetryPolicy, TokenExchanger,
        TokenGrant,
    };

    use super::{spawn_worker, DispatchQueue, EnqueueOutcome};

    #[derive(Default)]
    struct RecordingTransport {
        conversions: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CrmTransport for RecordingTransport {
        async fn upsert_contact(&self, _token: &SecretString, _email: &str) -> Result<(), CrmError> {
            Ok(())
        }

        async fn create_contact(&self, _token: &SecretString, _email: &str) -> Result<(), CrmError> {
            Ok(())
        }

        async fn send_conversion(
            &self,
            _token: &SecretString,
            email: &str,
            conversion_identifier: &str,
        ) -> Result<(), CrmError> {
            if email.starts_with("fail") {
                return Err(CrmError::Rejected { status: 400, body: "bad".to_string() });
            }
            self.conversions.lock().expect("lock").push(format!("{email}:{conversion_identifier}"));
            Ok(())
        }
    }

    struct StaticExchanger;

    #[async_trait]
    impl TokenExchanger for StaticExchanger {
        async fn refresh(&self, _refresh_token: &SecretString) -> Result<TokenGrant, CrmError> {
            Ok(TokenGrant {
                access_token: SecretString::from("access"),
                expires_in_secs: 3_600,
                refresh_token: None,
            })
        }
    }

    fn job(email: &str) -> ConversionJob {
        ConversionJob {
            email: email.to_string(),
            conversion_identifier: "pos-graduacao-ccih-pago".to_string(),
        }
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_waiting() {
        let (queue, _receiver) = DispatchQueue::bounded(1);

        assert_eq!(queue.enqueue(job("a@example.com")), EnqueueOutcome::Queued);
        assert_eq!(queue.enqueue(job("b@example.com")), EnqueueOutcome::Full);
    }

    #[tokio::test]
    async fn worker_delivers_in_order_and_survives_failures() {
        let transport = Arc::new(RecordingTransport::default());
        let tokens = Arc::new(CrmTokenCache::new(
            Arc::new(StaticExchanger),
            Arc::new(SystemClock),
            SecretString::from("refresh"),
            Duration::seconds(60),
        ));
        let dispatcher = Arc::new(ConversionDispatcher::new(
            transport.clone(),
            tokens,
            RetryPolicy { max_attempts: 2, base_delay_ms: 0, max_delay_ms: 0 },
        ));
        let (queue, receiver) = DispatchQueue::bounded(8);
        let worker = spawn_worker(receiver, dispatcher);

        queue.enqueue(job("a@example.com"));
        queue.enqueue(job("fail@example.com"));
        queue.enqueue(job("b@example.com"));
        drop(queue);

        assert_eq!(worker.await.expect("join"), 3);
        assert_eq!(
            transport.conversions.lock().expect("lock").clone(),
            vec![
                "a@example.com:pos-graduacao-ccih-pago".to_string(),
                "b@example.com:pos-graduacao-ccih-pago".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn closed_queue_reports_closed() {
        let (queue, receiver) = DispatchQueue::bounded(1);
        drop(receiver);
        assert_eq!(queue.enqueue(job("a@example.com")), EnqueueOutcome::Closed);
    }
}
