pub mod dispatcher;
pub mod error;
pub mod http;
pub mod token;

pub use dispatcher::{ConversionDispatcher, CrmTransport, DeliveryReport, RetryPolicy};
pub use error::{CrmError, DispatchError, TokenError};
pub use http::{HttpCrmTransport, HttpTokenExchanger};
pub use token::{CrmTokenCache, TokenExchanger, TokenGrant};
