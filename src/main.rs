use anyhow::{Context, Result};
use clap::Parser;
use portfolio_server_rs::{cli, config, db, openapi, routes, services, state};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::cors::{Any, CorsLayer};

async fn bind_listener(addr: &str) -> Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Failed to bind portfolio-server-rs listener on {addr}: port already in use. Stop the other service using this port or re-run with --port to choose another port.",
            );
        }
        Err(err) => Err(err)
            .with_context(|| format!("failed to bind portfolio-server-rs listener on {addr}")),
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for shutdown signal");
        cancel.cancelled().await;
    }
    tracing::info!("shutdown requested");
    cancel.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    if args.print_openapi {
        println!(
            "{}",
            serde_json::to_string_pretty(&openapi::openapi_json())?
        );
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = config::CoreConfig::from_env()?;
    let pool = db::connect_lazy(&config.database_url, config.database_max_connections)?;
    let http = reqwest::Client::new();

    let redundancy = Arc::new(
        services::redundancy::RedundancyAnalysisService::from_config(
            pool.clone(),
            &config,
            http.clone(),
        ),
    );

    let state = state::AppState {
        config: config.clone(),
        db: pool,
        redundancy: redundancy.clone(),
        http,
    };

    let cancel = CancellationToken::new();
    redundancy.start(cancel.clone());

    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(20)
            .burst_size(60)
            .methods(vec![axum::http::Method::POST, axum::http::Method::DELETE])
            .use_headers()
            .finish()
            .context("failed to build rate limiter config")?,
    );

    let governor_limiter = governor_conf.limiter().clone();
    std::thread::spawn(move || loop {
        std::thread::sleep(std::time::Duration::from_secs(60));
        governor_limiter.retain_recent();
    });

    let app = routes::router(state)
        .layer(GovernorLayer::new(governor_conf))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    let addr = format!("{}:{}", args.host, args.port);
    let listener = bind_listener(&addr).await?;
    tracing::info!(%addr, "portfolio server listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(cancel.clone()))
    .await?;
    cancel.cancel();
    Ok(())
}
