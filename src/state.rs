//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket upgrade through
//! `web::Data<AppState>`.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc<RwLock<T>> Pattern
//! - **Arc**: many handlers (on many worker threads) hold the same state
//! - **RwLock**: any number of readers, or one writer
//! - Used for the runtime configuration and the request metrics, the two
//!   pieces that change while the server runs
//!
//! ### Immutable sharing
//! The provider registry and role catalog are built once at startup and never
//! change, so a plain `Arc` is enough for them.
//!
//! ### RAII session permits
//! [`SessionPermit`] holds one slot of the concurrent-session cap and gives it
//! back in `Drop`, so a session that ends for any reason (clean close, error,
//! panic in the actor) always frees its slot.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use crate::config::AppConfig;
use crate::providers::ProviderRegistry;
use crate::roles::RoleCatalog;
use crate::session::SessionDeps;

#[derive(Clone)]
pub struct AppState {
    /// Runtime configuration; `PUT /api/v1/config` replaces the session defaults
    pub config: Arc<RwLock<AppConfig>>,

    /// Request and session counters, updated by middleware and the WebSocket bridge
    pub metrics: Arc<RwLock<AppMetrics>>,

    pub registry: Arc<ProviderRegistry>,

    pub roles: Arc<RoleCatalog>,

    pub start_time: Instant,
}

#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total HTTP requests since server start
    pub request_count: u64,

    /// Total HTTP requests answered with an error status
    pub error_count: u64,

    /// Live WebSocket chat sessions
    pub active_sessions: usize,

    /// Chat sessions accepted since server start
    pub total_sessions: u64,

    /// Upgrades refused because the session cap was reached
    pub rejected_sessions: u64,

    /// Key: matched route pattern, e.g. "GET /api/v1/services/{kind}"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

/// One occupied slot of `performance.max_concurrent_sessions`.
#[derive(Debug)]
pub struct SessionPermit {
    metrics: Arc<RwLock<AppMetrics>>,
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.active_sessions = metrics.active_sessions.saturating_sub(1);
    }
}

impl AppState {
    pub fn new(config: AppConfig, registry: ProviderRegistry, roles: RoleCatalog) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            registry: Arc::new(registry),
            roles: Arc::new(roles),
            start_time: Instant::now(),
        }
    }

    fn metrics_mut(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn config_ref(&self) -> RwLockReadGuard<'_, AppConfig> {
        self.config.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the current configuration; the lock is released immediately.
    pub fn get_config(&self) -> AppConfig {
        self.config_ref().clone()
    }

    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
        Ok(())
    }

    /// Dependencies for a new chat session, using the session defaults as
    /// they are right now.
    pub fn session_deps(&self) -> SessionDeps {
        SessionDeps {
            registry: self.registry.clone(),
            roles: self.roles.clone(),
            settings: self.config_ref().session.clone(),
        }
    }

    /// Claim a session slot, or `None` when the cap is reached.
    pub fn try_acquire_session(&self) -> Option<SessionPermit> {
        let limit = self.config_ref().performance.max_concurrent_sessions;
        let mut metrics = self.metrics_mut();

        if metrics.active_sessions >= limit {
            metrics.rejected_sessions += 1;
            return None;
        }
        metrics.active_sessions += 1;
        metrics.total_sessions += 1;

        Some(SessionPermit {
            metrics: self.metrics.clone(),
        })
    }

    pub fn increment_request_count(&self) {
        self.metrics_mut().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics_mut().error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_mut();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_limit(limit: usize) -> AppState {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = limit;
        AppState::new(config, ProviderRegistry::new(), RoleCatalog::builtin())
    }

    #[test]
    fn test_session_cap_and_release() {
        let state = state_with_limit(2);

        let first = state.try_acquire_session().unwrap();
        let _second = state.try_acquire_session().unwrap();
        assert!(state.try_acquire_session().is_none());

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.active_sessions, 2);
        assert_eq!(metrics.rejected_sessions, 1);

        drop(first);
        assert_eq!(state.get_metrics_snapshot().active_sessions, 1);
        assert!(state.try_acquire_session().is_some());
        assert_eq!(state.get_metrics_snapshot().total_sessions, 3);
    }

    #[test]
    fn test_endpoint_metrics() {
        let state = state_with_limit(1);
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let metrics = state.get_metrics_snapshot();
        let health = &metrics.endpoint_metrics["GET /health"];
        assert_eq!(health.average_duration_ms(), 20.0);
        assert_eq!(health.error_rate(), 0.5);
    }

    #[test]
    fn test_session_deps_follow_config_updates() {
        let state = state_with_limit(4);
        let mut config = state.get_config();
        config.session.default_voice = "calm".to_string();
        state.update_config(config).unwrap();

        assert_eq!(state.session_deps().settings.default_voice, "calm");
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let state = state_with_limit(4);
        let mut config = state.get_config();
        config.performance.max_concurrent_sessions = 0;
        assert!(state.update_config(config).is_err());
        assert_eq!(state.get_config().performance.max_concurrent_sessions, 4);
    }
}
