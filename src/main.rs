//! # EduScope Voice - Main Application Entry Point
//!
//! Realtime voice tutoring service. The browser streams microphone audio over a
//! WebSocket, the server relays it to the live conversational endpoint and streams
//! the tutor's spoken reply back for gapless playback.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: The entire application is asynchronous for better performance
//! - **modules**: Code is organized into separate modules (mod statements)
//! - **Result<T, E>**: Error handling using Rust's Result type
//! - **Arc & trait objects**: One live transport shared by every session
//!
//! ## Application Architecture:
//! - **audio**: PCM codec, microphone capture pipeline, playback scheduler
//! - **live**: Transport to the live endpoint (wire protocol + WebSocket client)
//! - **session**: Session controller state machine and session registry
//! - **websocket**: Browser-facing WebSocket actor
//! - **config**, **state**, **health**, **middleware**, **handlers**, **error**: service plumbing

mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod live;
mod middleware;
mod session;
mod state;
mod websocket;

#[cfg(test)]
mod testing;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use live::GeminiLiveTransport;
use state::AppState;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging** for debugging and monitoring
/// 3. **Creates shared application state** with the live transport
/// 4. **Configures the HTTP server** with middleware, REST routes and the voice WebSocket
/// 5. **Handles graceful shutdown**, stopping every voice session first
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting eduscope-voice v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    info!(model = %config.live.model, voice = %config.live.voice, "Live endpoint configured");
    if !config.has_api_key() {
        warn!("No live endpoint API key configured (set GEMINI_API_KEY); voice sessions will fail to connect");
    }

    let app_state = AppState::new(config.clone(), Arc::new(GeminiLiveTransport::new()));
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    let shutdown = setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server_state = app_state.clone();
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(server_state.clone()))
            // Middleware executes in reverse order for responses
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/sessions", web::get().to(handlers::list_sessions))
                    .route("/sessions/{id}", web::delete().to(handlers::stop_session)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/ws/voice", web::get().to(websocket::voice_websocket))
    })
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
        _ = wait_for_shutdown(shutdown) => {
            info!("Shutdown signal received, stopping voice sessions...");
            let stopped = app_state.sessions.stop_all();
            info!(stopped, "Voice sessions stopped, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "eduscope_voice=trace")
/// - If not set, defaults to "eduscope_voice=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "eduscope_voice=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Listen for SIGTERM and SIGINT; the returned receiver flips to `true` on either.
///
/// If a handler cannot be installed the error is logged and that signal is ignored,
/// so the server still runs (and still stops on the other signal).
fn setup_signal_handlers() -> watch::Receiver<bool> {
    use tokio::signal::unix::{signal, SignalKind};

    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| error!("Failed to install SIGTERM handler: {}", e))
            .ok();
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| error!("Failed to install SIGINT handler: {}", e))
            .ok();

        tokio::select! {
            Some(_) = async { sigterm.as_mut()?.recv().await } => {
                info!("Received SIGTERM");
            }
            Some(_) = async { sigint.as_mut()?.recv().await } => {
                info!("Received SIGINT");
            }
            else => {
                warn!("No shutdown signal handlers available");
                return;
            }
        }

        tx.send_replace(true);
    });

    rx
}

/// Wait until the shutdown flag is raised.
async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        // Signal task gave up; run until the server exits on its own
        std::future::pending::<()>().await;
    }
}
