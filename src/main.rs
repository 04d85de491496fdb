use std::{process, sync::Arc, time::Duration};

use tokio::try_join;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;
use verbatim::{
    cache::{InvalidationRegistry, MemoryStore, OutputCache},
    config,
    infra::{
        error::InfraError,
        http::{self, FeedCatalog},
        telemetry,
    },
};

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| InfraError::configuration(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), InfraError> {
    let registry = Arc::new(InvalidationRegistry::new());
    http::register_invalidation(&registry)?;

    let cache = OutputCache::new(
        settings.cache.clone(),
        Arc::new(MemoryStore::new()),
        registry,
    );

    // Spawn the expiration sweeper
    let sweeper = cache.spawn_sweeper();

    let result = serve_http(&settings, cache).await;

    if let Some(handle) = sweeper {
        handle.abort();
    }

    result
}

async fn serve_http(settings: &config::Settings, cache: OutputCache) -> Result<(), InfraError> {
    let public_router = http::build_demo_router(cache.clone(), FeedCatalog::new());
    let admin_router = http::build_admin_router(cache);

    let grace = settings.server.graceful_shutdown;

    let public_listener = tokio::net::TcpListener::bind(settings.server.public_addr).await?;
    let admin_listener = tokio::net::TcpListener::bind(settings.server.admin_addr).await?;

    info!(
        public = %settings.server.public_addr,
        admin = %settings.server.admin_addr,
        "listening"
    );

    let public_server = axum::serve(public_listener, public_router.into_make_service())
        .with_graceful_shutdown(shutdown_signal(grace));
    let admin_server = axum::serve(admin_listener, admin_router.into_make_service())
        .with_graceful_shutdown(shutdown_signal(grace));

    try_join!(public_server, admin_server)?;

    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM; connections that outlive `grace` are cut off.
async fn shutdown_signal(grace: Duration) {
    let interrupt = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let received = tokio::select! {
        _ = interrupt => "SIGINT",
        _ = terminate => "SIGTERM",
    };
    info!(signal = received, grace_secs = grace.as_secs(), "shutdown signal received");

    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        warn!("graceful shutdown timed out");
        process::exit(1);
    });
}
