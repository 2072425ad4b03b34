//! Connection parameters for vendor endpoints.
//!
//! Adapters never hold API keys directly. They ask a [`CredentialSource`] for
//! a [`SignedEndpoint`] right before connecting, so a signing scheme with
//! short-lived tokens can be swapped in without touching the adapters.

use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request as WsRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, Uri};

use super::{ProviderError, ProviderResult};

/// A URL plus the headers required to call it.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedEndpoint {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl SignedEndpoint {
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    /// Host part of the URL. Safe to log; the query may carry a signature.
    pub fn host(&self) -> Option<String> {
        self.url
            .parse::<Uri>()
            .ok()
            .and_then(|uri| uri.host().map(str::to_string))
    }

    /// Build a WebSocket handshake request carrying the endpoint headers.
    pub fn into_ws_request(self, provider: &str) -> ProviderResult<WsRequest> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ProviderError::request(provider, e))?;

        for (name, value) in self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ProviderError::request(provider, e))?;
            let value =
                HeaderValue::from_str(&value).map_err(|e| ProviderError::request(provider, e))?;
            request.headers_mut().insert(name, value);
        }
        Ok(request)
    }
}

pub trait CredentialSource: Send + Sync {
    fn sign(&self, url: &str) -> ProviderResult<SignedEndpoint>;
}

/// Static API key sent as `Authorization: Bearer <key>`.
pub struct BearerToken {
    token: String,
}

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

impl CredentialSource for BearerToken {
    fn sign(&self, url: &str) -> ProviderResult<SignedEndpoint> {
        Ok(SignedEndpoint {
            url: url.to_string(),
            headers: vec![("Authorization".to_string(), format!("Bearer {}", self.token))],
        })
    }
}

impl std::fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BearerToken").field("token", &"<redacted>").finish()
    }
}
