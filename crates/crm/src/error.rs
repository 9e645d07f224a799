use thiserror::Error;

/// Outcome of one CRM HTTP call that did not succeed.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CrmError {
    #[error("crm rejected the access token")]
    Unauthorized,
    #[error("crm resource not found")]
    NotFound,
    #[error("crm rejected the request with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("transient crm failure: {0}")]
    Transient(String),
    #[error("crm request timed out")]
    Timeout,
    #[error("could not decode crm response: {0}")]
    Decode(String),
}

impl CrmError {
    /// Maps a non-success HTTP status to an error.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 => Self::Unauthorized,
            404 => Self::NotFound,
            408 | 429 => Self::Transient(format!("status {status}")),
            500..=599 => Self::Transient(format!("status {status}: {body}")),
            _ => Self::Rejected { status, body },
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unauthorized | Self::Transient(_) | Self::Timeout)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token refresh failed: {0}")]
    Refresh(#[source] CrmError),
    #[error("token endpoint returned an empty access token")]
    EmptyToken,
}

impl TokenError {
    /// Bad client credentials at the token endpoint will not fix themselves.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Refresh(CrmError::Unauthorized) => false,
            Self::Refresh(error) => error.is_retryable(),
            Self::EmptyToken => false,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("conversion delivery failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
    #[error("conversion delivery rejected: {0}")]
    Rejected(String),
}

impl DispatchError {
    pub fn error_class(&self) -> &'static str {
        match self {
            Self::Exhausted { .. } => "dispatch_exhausted",
            Self::Rejected(_) => "dispatch_rejected",
        }
    }
}
