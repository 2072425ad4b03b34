//! iFlytek (xfyun) speech adapters.
//!
//! Both services speak JSON over WebSocket with base64 audio. Requests are
//! authenticated by an HMAC-SHA256 signature carried in the URL query rather
//! than a header, which [`IflytekSigner`] produces per connection.

mod asr;
mod tts;

pub use asr::IflytekAsr;
pub use tts::IflytekTts;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tokio_tungstenite::tungstenite::http::Uri;

use super::credentials::{CredentialSource, SignedEndpoint};
use super::{ProviderError, ProviderResult};

/// Registry name of the iFlytek adapters.
pub const IFLYTEK: &str = "iflytek";

/// `data.status` of the last frame in either direction.
const STATUS_LAST: u8 = 2;

type HmacSha256 = Hmac<Sha256>;

/// Signs WebSocket URLs with the `host date request-line` scheme.
pub struct IflytekSigner {
    api_key: String,
    api_secret: String,
}

impl IflytekSigner {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    /// Sign `url` for the given RFC 1123 date.
    fn sign_at(&self, url: &str, date: &str) -> ProviderResult<SignedEndpoint> {
        let uri: Uri = url.parse().map_err(|e| ProviderError::request(IFLYTEK, e))?;
        let host = uri
            .authority()
            .map(|authority| authority.as_str().to_string())
            .ok_or_else(|| ProviderError::request(IFLYTEK, format!("no host in {}", url)))?;

        let canonical = format!("host: {}\ndate: {}\nGET {} HTTP/1.1", host, date, uri.path());
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| ProviderError::request(IFLYTEK, e))?;
        mac.update(canonical.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());

        let authorization = BASE64.encode(format!(
            r#"api_key="{}", algorithm="hmac-sha256", headers="host date request-line", signature="{}""#,
            self.api_key, signature
        ));

        Ok(SignedEndpoint {
            url: format!(
                "{}?authorization={}&date={}&host={}",
                url,
                urlencoding::encode(&authorization),
                urlencoding::encode(date),
                urlencoding::encode(&host),
            ),
            headers: Vec::new(),
        })
    }
}

impl CredentialSource for IflytekSigner {
    fn sign(&self, url: &str) -> ProviderResult<SignedEndpoint> {
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        self.sign_at(url, &date)
    }
}

impl std::fmt::Debug for IflytekSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IflytekSigner")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

/// Envelope shared by recognition and synthesis responses.
#[derive(Deserialize, Debug)]
struct Envelope<T> {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    sid: String,
    data: Option<T>,
}

impl<T> Envelope<T> {
    /// Non-zero codes are vendor errors.
    fn into_data(self) -> ProviderResult<Option<T>> {
        if self.code != 0 {
            return Err(ProviderError::invalid(
                IFLYTEK,
                format!("code {} ({}): {}", self.code, self.sid, self.message),
            ));
        }
        Ok(self.data)
    }
}
