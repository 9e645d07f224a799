//! reqwest-backed CRM client for the RD Station platform API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::dispatcher::CrmTransport;
use crate::error::CrmError;
use crate::token::{TokenExchanger, TokenGrant};

/// Builds the shared client. Every request, token refresh included, is
/// bounded by `timeout`.
pub fn build_client(timeout: Duration) -> Result<Client, CrmError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|error| CrmError::Transient(format!("failed to build http client: {error}")))
}

pub struct HttpTokenExchanger {
    client: Client,
    auth_url: String,
    client_id: String,
    client_secret: SecretString,
}

impl HttpTokenExchanger {
    pub fn new(
        client: Client,
        auth_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: SecretString,
    ) -> Self {
        Self { client, auth_url: auth_url.into(), client_id: client_id.into(), client_secret }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    refresh_token: Option<String>,
}

#[async_trait]
impl TokenExchanger for HttpTokenExchanger {
    async fn refresh(&self, refresh_token: &SecretString) -> Result<TokenGrant, CrmError> {
        let request = self.client.post(&self.auth_url).json(&json!({
            "client_id": self.client_id,
            "client_secret": self.client_secret.expose_secret(),
            "refresh_token": refresh_token.expose_secret(),
            "grant_type": "refresh_token",
        }));

        let body = execute(request).await?;
        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|error| CrmError::Decode(format!("token response: {error}")))?;

        Ok(TokenGrant {
            access_token: SecretString::from(token.access_token),
            expires_in_secs: token.expires_in,
            refresh_token: token
                .refresh_token
                .filter(|value| !value.trim().is_empty())
                .map(SecretString::from),
        })
    }
}

pub struct HttpCrmTransport {
    client: Client,
    api_base_url: String,
}

impl HttpCrmTransport {
    pub fn new(client: Client, api_base_url: impl Into<String>) -> Self {
        let api_base_url = api_base_url.into().trim_end_matches('/').to_string();
        Self { client, api_base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_base_url)
    }
}

#[async_trait]
impl CrmTransport for HttpCrmTransport {
    async fn upsert_contact(&self, token: &SecretString, email: &str) -> Result<(), CrmError> {
        let request = self
            .client
            .patch(self.url(&format!("/platform/contacts/email:{email}")))
            .bearer_auth(token.expose_secret())
            .json(&json!({}));
        execute(request).await.map(|_| ())
    }

    async fn create_contact(&self, token: &SecretString, email: &str) -> Result<(), CrmError> {
        let request = self
            .client
            .post(self.url("/platform/contacts"))
            .bearer_auth(token.expose_secret())
            .json(&json!({ "email": email }));
        execute(request).await.map(|_| ())
    }

    async fn send_conversion(
        &self,
        token: &SecretString,
        email: &str,
        conversion_identifier: &str,
    ) -> Result<(), CrmError> {
        let request = self
            .client
            .post(self.url("/platform/conversions"))
            .bearer_auth(token.expose_secret())
            .json(&json!({
                "event_type": "CONVERSION",
                "event_family": "CDP",
                "payload": {
                    "conversion_identifier": conversion_identifier,
                    "email": email,
                }
            }));
        execute(request).await.map(|_| ())
    }
}

async fn execute(request: RequestBuilder) -> Result<String, CrmError> {
    let response = request.send().await.map_err(transport_error)?;
    let status = response.status();
    let body = response.text().await.map_err(transport_error)?;

    if status.is_success() {
        debug!(status = status.as_u16(), "crm request succeeded");
        Ok(body)
    } else {
        Err(CrmError::from_status(status.as_u16(), body))
    }
}

fn transport_error(error: reqwest::Error) -> CrmError {
    if error.is_timeout() {
        CrmError::Timeout
    } else {
        CrmError::Transient(error.to_string())
    }
}
