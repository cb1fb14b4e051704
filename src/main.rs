//! # STT Relay - Main Application Entry Point
//!
//! A WebSocket relay that lets clients stream audio to a hosted
//! speech-to-text service without ever holding the service credential.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: Every connection is served by async tasks and actors
//! - **modules**: Code is organized into separate modules (mod statements)
//! - **Result<T, E>**: Startup errors bubble up to `main` with `?`
//! - **Arc & RwLock**: Shared configuration, metrics and session registry
//!
//! ## Application Architecture:
//! - **config**: Configuration (defaults, optional config.toml, environment)
//! - **state**: Shared application state, metrics and the session registry handle
//! - **relay**: Probe, upstream connection, close translation, sessions and registry
//! - **websocket**: The per-client relay actor and the `/ws` upgrade handler
//! - **health**: Health, metrics and status page endpoints
//! - **middleware**: Request logging and metrics collection
//! - **handlers**: Remaining JSON API handlers
//! - **error**: Error types and HTTP error responses

mod config;      // Configuration management (config.rs)
mod error;       // Error handling types (error.rs)
mod state;       // Application state management (state.rs)
mod health;      // Health check and status endpoints (health.rs)
mod middleware;  // Custom middleware (middleware/ directory)
mod handlers;    // HTTP request handlers (handlers/ directory)
mod relay;       // Relay core (relay/ directory)
mod websocket;   // WebSocket relay actor (websocket.rs)

use actix_cors::Cors;
use actix_web::dev::ServerHandle;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use relay::registry::{DrainOutcome, SessionRegistry};
use state::AppState;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Grace period for plain HTTP requests once sessions have drained.
const HTTP_SHUTDOWN_TIMEOUT_SECS: u64 = 5;

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from defaults, `config.toml` and the environment
/// 2. **Sets up logging**
/// 3. **Creates shared application state** (metrics, probe client, session registry)
/// 4. **Configures the HTTP server** with middleware and routes
/// 5. **Drains sessions** on SIGINT/SIGTERM before exiting
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(config = %config.redacted(), "Configuration loaded");

    let app_state = AppState::new(config.clone())?;
    let sessions = app_state.sessions.clone();
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
                    .route("/config", web::get().to(handlers::get_config)),
            )
            .route("/ws", web::get().to(websocket::relay_websocket))
            .route("/health", web::get().to(health::health_check))
            .route("/", web::get().to(health::status_page))
    })
    // Signals are handled below so sessions can be drained first
    .disable_signals()
    .shutdown_timeout(HTTP_SHUTDOWN_TIMEOUT_SECS)
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
            }
        }
        _ = wait_for_shutdown() => {
            info!(active = sessions.active_count(), "Shutdown signal received, draining sessions");
            drain_and_stop(&sessions, &server_handle, config.drain_timeout()).await;
        }
    }

    info!("Server stopped");
    Ok(())
}

/// Graceful shutdown.
///
/// ## Order matters:
/// 1. New upgrades are refused with 503 (the listener stays up so clients get an answer)
/// 2. Live sessions get up to `timeout` to finish while the workers are still running
/// 3. Only then is the server stopped; if sessions remain they are killed with it,
///    and the number is reported
async fn drain_and_stop(sessions: &SessionRegistry, server: &ServerHandle, timeout: Duration) -> DrainOutcome {
    sessions.begin_drain();

    let outcome = sessions.wait_drained(timeout).await;
    match outcome {
        DrainOutcome::Drained => {
            info!("All sessions finished");
            server.stop(true).await;
        }
        DrainOutcome::TimedOut { remaining } => {
            warn!(
                remaining,
                timeout_secs = timeout.as_secs_f64(),
                "Drain timed out, terminating remaining sessions"
            );
            server.stop(false).await;
        }
    }
    outcome
}

/// Initialize the tracing (logging) system.
///
/// `RUST_LOG` overrides the default `stt_relay=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stt_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Resolve when SIGTERM or SIGINT (Ctrl+C) arrives.
#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            error!("Failed to install signal handlers: {}", e);
            std::future::pending::<()>().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}
