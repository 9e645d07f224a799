pub mod classifier;
pub mod clock;
pub mod config;
pub mod domain;
pub mod errors;
pub mod intake;
pub mod normalize;
pub mod reconcile;

pub use classifier::{Campaign, ConversionClassifier, ConversionRule};
pub use clock::{Clock, ManualClock, SystemClock};
pub use domain::bill::{Bill, BillId, BillStatus};
pub use domain::customer::{Customer, CustomerId};
pub use domain::event::{BillingEvent, EventId, EventSource, EventState, NewBillingEvent};
pub use domain::subscription::{Subscription, SubscriptionId, SubscriptionStatus};
pub use errors::{ApplicationError, DomainError};
pub use intake::{ConversionJob, Intake};
pub use normalize::{
    BillFacts, ConversionStage, NormalizedRecord, PayloadNormalizer, PayloadShape,
    SubscriptionFacts,
};
pub use reconcile::{BillUpsert, CustomerUpsert, ReconciliationPlan, SubscriptionUpsert};
