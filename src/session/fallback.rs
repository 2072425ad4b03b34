//! Provider fallback chains.
//!
//! A chain is the session's configured provider (or the kind's default)
//! followed by the kind's alternates with duplicates removed. Each candidate
//! is tried at most once, in order, until one succeeds.

use std::future::Future;
use std::sync::Arc;
use tracing::warn;

use crate::providers::{ProviderError, ProviderKind, ProviderResult};

pub const DEFAULT_ASR_PROVIDER: &str = "qiniu";
pub const DEFAULT_LLM_PROVIDER: &str = "qiniu";
pub const DEFAULT_TTS_PROVIDER: &str = "qiniu";

pub const ASR_FALLBACKS: &[&str] = &["qiniu", "iflytek"];
pub const LLM_FALLBACKS: &[&str] = &["qiniu", "qwen"];
pub const TTS_FALLBACKS: &[&str] = &["qiniu", "iflytek"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackChain {
    kind: ProviderKind,
    names: Vec<String>,
}

impl FallbackChain {
    pub fn new(kind: ProviderKind, configured: Option<&str>, default: &str, alternates: &[&str]) -> Self {
        let primary = configured
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(default);

        let mut names = vec![primary.to_string()];
        for name in alternates {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
        Self { kind, names }
    }

    pub fn for_kind(kind: ProviderKind, configured: Option<&str>) -> Self {
        match kind {
            ProviderKind::Asr => Self::new(kind, configured, DEFAULT_ASR_PROVIDER, ASR_FALLBACKS),
            ProviderKind::Llm => Self::new(kind, configured, DEFAULT_LLM_PROVIDER, LLM_FALLBACKS),
            ProviderKind::Tts => Self::new(kind, configured, DEFAULT_TTS_PROVIDER, TTS_FALLBACKS),
            // Moderation is opt-in and never falls back.
            ProviderKind::Moderation => Self::new(kind, configured, "", &[]),
        }
    }

    pub fn primary(&self) -> &str {
        &self.names[0]
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Try each candidate in order.
    ///
    /// `resolve` maps a name to a provider (usually a registry lookup);
    /// `call` runs the operation. Unresolvable names and retryable failures
    /// move on to the next candidate. Cancellation and non-retryable failures
    /// stop the chain immediately. When every candidate fails the result is
    /// [`ProviderError::Exhausted`] carrying the last failure.
    pub async fn run<P, T, R, F, Fut>(&self, resolve: R, mut call: F) -> ProviderResult<(String, T)>
    where
        P: ?Sized,
        R: Fn(&str) -> ProviderResult<Arc<P>>,
        F: FnMut(Arc<P>) -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let mut last = None;

        for name in &self.names {
            let provider = match resolve(name) {
                Ok(provider) => provider,
                Err(e) => {
                    warn!(kind = %self.kind, provider = %name, "Provider unavailable, trying next");
                    last = Some(e);
                    continue;
                }
            };

            match call(provider).await {
                Ok(value) => return Ok((name.clone(), value)),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(kind = %self.kind, provider = %name, error = %e, "Provider failed, trying next");
                    last = Some(e);
                }
            }
        }

        Err(ProviderError::Exhausted {
            kind: self.kind,
            last: Box::new(last.unwrap_or_else(|| ProviderError::NotFound {
                kind: self.kind,
                name: self.primary().to_string(),
            })),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_chain_order_and_dedup() {
        let chain = FallbackChain::for_kind(ProviderKind::Asr, Some("iflytek"));
        assert_eq!(chain.names(), &["iflytek".to_string(), "qiniu".to_string()]);

        let default = FallbackChain::for_kind(ProviderKind::Llm, None);
        assert_eq!(default.names(), &["qiniu".to_string(), "qwen".to_string()]);

        let blank = FallbackChain::for_kind(ProviderKind::Tts, Some("  "));
        assert_eq!(blank.primary(), "qiniu");

        let custom = FallbackChain::for_kind(ProviderKind::Llm, Some("openai"));
        assert_eq!(custom.names().len(), 3);
        assert_eq!(custom.primary(), "openai");
    }

    #[tokio::test]
    async fn test_run_skips_unresolved_and_failed() {
        let chain = FallbackChain::new(ProviderKind::Llm, Some("missing"), "a", &["a", "b"]);
        let attempts = AtomicUsize::new(0);

        let result = chain
            .run(
                |name| {
                    if name == "missing" {
                        Err(ProviderError::NotFound { kind: ProviderKind::Llm, name: name.into() })
                    } else {
                        Ok(Arc::new(name.to_string()))
                    }
                },
                |provider: Arc<String>| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if provider.as_str() == "a" {
                            Err(ProviderError::request("a", "down"))
                        } else {
                            Ok(42)
                        }
                    }
                },
            )
            .await
            .unwrap();

        assert_eq!(result, ("b".to_string(), 42));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_run_exhausted_reports_last_error() {
        let chain = FallbackChain::new(ProviderKind::Tts, None, "a", &["b"]);
        let err = chain
            .run(
                |name| Ok(Arc::new(name.to_string())),
                |provider: Arc<String>| async move {
                    Err::<(), _>(ProviderError::request(provider.as_str(), "down"))
                },
            )
            .await
            .unwrap_err();

        match err {
            ProviderError::Exhausted { kind, last } => {
                assert_eq!(kind, ProviderKind::Tts);
                assert!(last.to_string().contains("request to b failed"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancellation_stops_chain() {
        let chain = FallbackChain::new(ProviderKind::Asr, None, "a", &["b"]);
        let attempts = AtomicUsize::new(0);
        let err = chain
            .run(
                |name| Ok(Arc::new(name.to_string())),
                |_provider: Arc<String>| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(ProviderError::Cancelled) }
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Cancelled));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
