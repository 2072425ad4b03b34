//! # CosTalk Backend - Main Application Entry Point
//!
//! Streaming voice-chat server. A client connects to `/ws/chat`, sends
//! speech or text, and gets back streamed reply text plus synthesized speech,
//! sentence by sentence, while the model is still generating.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: every vendor call and socket write is asynchronous
//! - **trait objects**: vendors sit behind `Arc<dyn LlmProvider>` and friends,
//!   so sessions never name a concrete vendor
//! - **channels**: pipeline stages talk through bounded `tokio::sync::mpsc` queues
//! - **Result<T, E>**: startup errors bubble up through `anyhow::Result`
//!
//! ## Application Architecture:
//! - **config**: TOML file + environment variables
//! - **protocol**: binary wire frames and JSON client envelopes
//! - **providers**: vendor contracts, the registry, and the Qiniu adapters
//! - **pipeline**: sentence segmentation and ordered speech synthesis
//! - **session**: per-connection orchestration
//! - **roles**: assistant personas
//! - **websocket**: actix actor bridging a socket to a session
//! - **state / health / middleware / handlers / error**: the HTTP surface

mod cancel;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod pipeline;
mod protocol;
mod providers;
mod roles;
mod session;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::{Context, Result};
use config::AppConfig;
use providers::{ProviderKind, ProviderRegistry};
use roles::RoleCatalog;
use state::AppState;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// ## What this function does:
/// 1. Loads `.env`, sets up logging, loads and validates configuration
/// 2. Registers every vendor adapter that has credentials
/// 3. Loads the role catalog
/// 4. Serves HTTP + WebSocket until SIGINT/SIGTERM, then stops gracefully
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load().context("Failed to load configuration")?;
    config.validate()?;

    info!("Starting costalk-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let registry = ProviderRegistry::from_config(&config.providers)
        .context("Failed to initialize providers")?;
    for kind in ProviderKind::ALL {
        info!(kind = %kind, providers = ?registry.names(kind), "Providers registered");
    }
    if registry.count(ProviderKind::Llm) == 0 {
        warn!("No LLM provider configured; set QINIU_API_KEY to enable the Qiniu adapters");
    }

    let roles = RoleCatalog::load(config.roles.catalog_path.as_deref())?;

    let app_state = AppState::new(config.clone(), registry, roles);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/services", web::get().to(handlers::list_services))
                    .route("/services/{kind}", web::get().to(handlers::services_by_kind))
                    .route("/services/{kind}/{name}", web::get().to(handlers::service_info))
                    .route("/roles", web::get().to(handlers::list_roles)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/ws/chat", web::get().to(websocket::chat_websocket))
    })
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` controls the filter; the default is
/// `costalk_backend=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "costalk_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("Failed to initialize tracing")?;

    Ok(())
}

/// Resolves on SIGINT (Ctrl+C) or SIGTERM.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received SIGINT");
}
