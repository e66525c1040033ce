use std::sync::Arc;

use bsky_publisher::{PublishFormat, PublisherConfig, PublishingService};
use miette::{IntoDiagnostic, Result, miette};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use url::Url;

mod db;
mod jobs;
mod routes;

use db::SqliteStore;
use jobs::{JobRunner, RetryPolicy};
use routes::AppState;

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_url(name: &str, default: &str) -> Result<Url> {
    let value = env_or(name, default);
    Url::parse(&value).map_err(|e| miette!("{} is not a valid URL ({}): {}", name, value, e))
}

fn load_config() -> Result<PublisherConfig> {
    let publish_format: PublishFormat = env_or("PUBLISH_FORMAT", "blog")
        .parse()
        .into_diagnostic()?;

    Ok(PublisherConfig::new(env_url("APP_URL", "http://localhost:3000")?)
        .with_default_pds(env_url("DEFAULT_PDS", "https://bsky.social")?)
        .with_identity_directory(env_url("IDENTITY_DIRECTORY", "https://plc.directory")?)
        .with_key_dir(env_or("KEY_DIR", "config"))
        .with_publish_format(publish_format))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,server=debug,bsky_publisher=debug")),
        )
        .init();

    let config = load_config()?;
    let db_url = env_or("DATABASE_URL", "sqlite:blog.db");
    let bind_addr = env_or("BIND_ADDR", "0.0.0.0:3000");

    let pool = db::init_db(&db_url).await.into_diagnostic()?;
    let store = Arc::new(SqliteStore::new(pool));

    let service = PublishingService::builder()
        .config(config)
        .credential_store(store.clone())
        .post_store(store.clone())
        .build()
        .into_diagnostic()?;

    // Fail at startup rather than on the first signed request
    let jwk = service.keys().current_public_jwk().into_diagnostic()?;
    tracing::info!("signing key {} ready", jwk.thumbprint());

    let forms_service = service.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            match forms_service.preserved_forms().purge_expired() {
                Ok(0) => {}
                Ok(n) => tracing::debug!("purged {} expired preserved forms", n),
                Err(e) => tracing::warn!("failed to purge preserved forms: {}", e),
            }
        }
    });

    let jobs = JobRunner::new(service.clone(), store.clone(), RetryPolicy::default()).spawn();
    let app = routes::router(AppState {
        service: service.clone(),
        store,
        jobs,
    })
    .layer(TraceLayer::new_for_http())
    .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .into_diagnostic()?;
    tracing::info!(
        "serving {} on {} (client_id {})",
        service.config().app_url,
        bind_addr,
        service.config().client_id()
    );
    axum::serve(listener, app).await.into_diagnostic()?;
    Ok(())
}
