use block_relay::config::{environment::Config, RelayConfig};
use block_relay::services::metrics::RelayMetrics;
use block_relay::services::persist::StateStore;
use block_relay::services::relay::{Relay, StartupError};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Exit codes: 0 clean shutdown, 1 configuration error, 2 fatal startup,
/// 3 unrecoverable internal state
const EXIT_CONFIG: i32 = 1;
const EXIT_STARTUP: i32 = 2;
const EXIT_INTERNAL: i32 = 3;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "block_relay=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let env = match Config::from_env() {
        Ok(env) => env,
        Err(err) => {
            tracing::error!(error = %err, "Invalid environment configuration");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let mut relay_config = match RelayConfig::load(&env.config_path) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, path = %env.config_path, "Invalid relay configuration");
            std::process::exit(EXIT_CONFIG);
        }
    };
    if let Some(tier) = env.tier_override {
        relay_config.tier = tier;
    }

    let metrics = match RelayMetrics::new() {
        Ok(metrics) => metrics,
        Err(err) => {
            tracing::error!(error = %err, "Could not build metrics registry");
            std::process::exit(EXIT_INTERNAL);
        }
    };

    let state_store = env.state_dir.as_deref().map(StateStore::new);
    let relay = Arc::new(Relay::new(relay_config, metrics, state_store));

    if let Err(err) = relay.start().await {
        match err {
            StartupError::NoHealthyEndpoints(chain) => {
                tracing::error!(chain = %chain, "No healthy endpoints after startup grace");
                std::process::exit(EXIT_STARTUP);
            }
            StartupError::AlreadyStopped => {
                tracing::error!("Relay in unrecoverable state at startup");
                std::process::exit(EXIT_INTERNAL);
            }
        }
    }

    let app = block_relay::create_app(relay.clone());
    let listener = match tokio::net::TcpListener::bind(&env.bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(error = %err, addr = %env.bind_addr, "Could not bind");
            std::process::exit(EXIT_STARTUP);
        }
    };
    tracing::info!(addr = %env.bind_addr, "Operational surface listening");

    let server_relay = relay.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_signal().await;
        server_relay.shutdown().await;
    });

    if let Err(err) = server.await {
        tracing::error!(error = %err, "Server error");
        relay.shutdown().await;
        std::process::exit(EXIT_INTERNAL);
    }

    // Idempotent: a second call after the graceful path is a no-op
    relay.shutdown().await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown signal received");
}
