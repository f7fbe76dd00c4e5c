use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderValue, Method};
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

use staykit_api::{
    adapters::pms::HttpPmsClient,
    adapters::psp::HttpPspClient,
    config,
    handlers,
    migrator::Migrator,
    store::{postgres, PostgresStore},
    AppState,
};
use sea_orm_migration::MigratorTrait;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::load_config()?;
    config::init_tracing(&config.log_level);
    tracing::info!("Starting StayKit checkout API...");

    // Document store
    let db = postgres::connect(&config.database_url).await?;
    tracing::info!("Document store connection established");

    if config.auto_migrate {
        Migrator::up(&db, None).await?;
        tracing::info!("Migrations applied");
    }

    // One adapter per upstream, shared read-only after construction
    let store = Arc::new(PostgresStore::new(db));
    let pms = Arc::new(HttpPmsClient::new(&config.pms)?);
    let psp = Arc::new(HttpPspClient::new(&config.psp, &config.currency)?);

    let addr = format!("{}:{}", config.host, config.port);
    let state = AppState::build(config.clone(), store, pms, psp);

    let app = handlers::routes(state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(TimeoutLayer::new(Duration::from_secs(35)))
            .layer(cors_layer(&config)),
    );

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

fn cors_layer(config: &config::AppConfig) -> CorsLayer {
    let methods = [
        Method::GET,
        Method::POST,
        Method::PATCH,
        Method::OPTIONS,
    ];
    match config
        .cors_allowed_origins
        .as_deref()
        .filter(|origins| !origins.trim().is_empty())
    {
        Some(origins) => {
            let origins: Vec<HeaderValue> = origins
                .split(',')
                .filter_map(|o| o.trim().parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(methods)
                .allow_headers(tower_http::cors::Any)
        }
        None => CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods(methods)
            .allow_headers(tower_http::cors::Any),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to listen for ctrl-c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
