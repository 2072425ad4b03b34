//! Request middleware: `RequestLogging` tags every request with an id and logs
//! it, `MetricsMiddleware` keeps per-route counters in [`crate::state::AppState`].

pub mod logging;
pub mod metrics;

pub use logging::RequestLogging;
pub use metrics::MetricsMiddleware;
