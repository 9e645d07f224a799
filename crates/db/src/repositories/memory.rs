use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use billsync_core::domain::bill::{Bill, BillId};
use billsync_core::domain::customer::{Customer, CustomerId};
use billsync_core::domain::event::{BillingEvent, EventId, EventState, NewBillingEvent};
use billsync_core::domain::subscription::{Subscription, SubscriptionId};
use billsync_core::reconcile::ReconciliationPlan;

use super::{AppliedPlan, EntityStore, EventCounts, EventLogRepository, RepositoryError};

/// Event log and entity store in one lock, so `apply` is atomic.
#[derive(Default)]
pub struct InMemoryBillingStore {
    state: RwLock<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    events: BTreeMap<EventId, BillingEvent>,
    customers: HashMap<String, Customer>,
    subscriptions: HashMap<String, Subscription>,
    bills: HashMap<String, Bill>,
}

impl MemoryState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

impl InMemoryBillingStore {
    /// Clears the processed flag, as an operator replaying an event would.
    pub async fn reset_processed(&self, id: EventId) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        let event = state.events.get_mut(&id).ok_or(RepositoryError::UnknownEvent(id))?;
        event.processed = false;
        event.processed_at = None;
        Ok(())
    }
}

#[async_trait::async_trait]
impl EventLogRepository for InMemoryBillingStore {
    async fn append(&self, event: NewBillingEvent) -> Result<EventId, RepositoryError> {
        let mut state = self.state.write().await;
        let id = EventId(state.allocate_id());
        state.events.insert(
            id,
            BillingEvent {
                id,
                source: event.source,
                event_type: event.event_type,
                payload: event.payload,
                processed: false,
                attempts: 0,
                last_error: None,
                received_at: event.received_at,
                processed_at: None,
            },
        );
        Ok(id)
    }

    async fn find(&self, id: EventId) -> Result<Option<BillingEvent>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.events.get(&id).cloned())
    }

    async fn list_pending(&self, limit: u32) -> Result<Vec<BillingEvent>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state
            .events
            .values()
            .filter(|event| !event.processed)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn record_failure(&self, id: EventId, error: &str) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        let event = state.events.get_mut(&id).ok_or(RepositoryError::UnknownEvent(id))?;
        if !event.processed {
            event.attempts = event.attempts.saturating_add(1);
            event.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn counts(&self) -> Result<EventCounts, RepositoryError> {
        let state = self.state.read().await;
        let mut counts = EventCounts::default();
        for event in state.events.values() {
            if event.processed {
                counts.processed += 1;
            } else {
                counts.pending += 1;
                if event.attempts > 0 {
                    counts.failing += 1;
                }
            }
        }
        Ok(counts)
    }
}

#[async_trait::async_trait]
impl EntityStore for InMemoryBillingStore {
    async fn apply(
        &self,
        event_id: EventId,
        plan: &ReconciliationPlan,
        processed_at: DateTime<Utc>,
    ) -> Result<AppliedPlan, RepositoryError> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let event = state.events.get(&event_id).ok_or(RepositoryError::UnknownEvent(event_id))?;
        if event.state().transition(EventState::InProgress).is_err() {
            return Err(RepositoryError::AlreadyProcessed(event_id));
        }

        let customer_id = match &plan.customer {
            Some(upsert) => Some(match state.customers.get_mut(&upsert.email) {
                Some(existing) => {
                    upsert.merge_into(existing);
                    existing.id
                }
                None => {
                    let id = CustomerId(state.allocate_id());
                    state.customers.insert(upsert.email.clone(), upsert.clone().into_new(id));
                    id
                }
            }),
            None => None,
        };

        let subscription_id = match &plan.subscription {
            Some(upsert) => Some(match state.subscriptions.get_mut(&upsert.external_id) {
                Some(existing) => {
                    upsert.merge_into(existing, customer_id);
                    existing.id
                }
                None => {
                    let id = SubscriptionId(state.allocate_id());
                    state
                        .subscriptions
                        .insert(upsert.external_id.clone(), upsert.clone().into_new(id, customer_id));
                    id
                }
            }),
            None => None,
        };

        let bill_id = match &plan.bill {
            Some(upsert) => Some(match state.bills.get_mut(&upsert.external_id) {
                Some(existing) => {
                    upsert.merge_into(existing, customer_id);
                    existing.id
                }
                None => {
                    let id = BillId(state.allocate_id());
                    state
                        .bills
                        .insert(upsert.external_id.clone(), upsert.clone().into_new(id, customer_id));
                    id
                }
            }),
            None => None,
        };

        if let Some(event) = state.events.get_mut(&event_id) {
            event.processed = true;
            event.processed_at = Some(processed_at);
            event.last_error = None;
        }

        Ok(AppliedPlan { customer_id, subscription_id, bill_id })
    }

    async fn find_customer_by_email(
        &self,
        email: &str,
    ) -> Result<Option<Customer>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.customers.get(email).cloned())
    }

    async fn find_subscription(
        &self,
        external_id: &str,
    ) -> Result<Option<Subscription>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.subscriptions.get(external_id).cloned())
    }

    async fn find_bill(&self, external_id: &str) -> Result<Option<Bill>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.bills.get(external_id).cloned())
    }
}
