//! WebSocket connections to vendor endpoints.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use super::credentials::SignedEndpoint;
use super::{ProviderError, ProviderResult};

pub(crate) type VendorSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open a WebSocket to a signed endpoint, bounded by `timeout`.
pub(crate) async fn connect_ws(
    provider: &str,
    endpoint: SignedEndpoint,
    timeout: Duration,
) -> ProviderResult<VendorSocket> {
    let host = endpoint.host().unwrap_or_default();
    let request = endpoint.into_ws_request(provider)?;

    let (socket, response) = tokio::time::timeout(timeout, connect_async(request))
        .await
        .map_err(|_| ProviderError::Timeout {
            provider: provider.to_string(),
            seconds: timeout.as_secs(),
        })?
        .map_err(|e| ProviderError::request(provider, e))?;

    debug!(provider, host = %host, status = %response.status(), "Vendor WebSocket connected");
    Ok(socket)
}
