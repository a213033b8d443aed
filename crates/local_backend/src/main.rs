use std::sync::Arc;

use aws_s3::S3Storage;
use clap::Parser;
use common::{
    knobs::DEFAULT_TIER_LIMIT_BYTES,
    runtime::ProdRuntime,
};
use file_storage::FileStorage;
use keybroker::{
    KeyBroker,
    Secret,
};
use local_backend::{
    config::LocalConfig,
    http::router,
    LocalAppState,
    StaticTokenAuthenticator,
};
use model::Database;
use storage::{
    LocalDirStorage,
    StorageProvider,
};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

const DEFAULT_TIER: &str = "default";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let config = LocalConfig::parse();
    let rt = ProdRuntime::new();

    let db = Database::open(&config.db_path)?;
    db.create_tier(DEFAULT_TIER, "Default", *DEFAULT_TIER_LIMIT_BYTES)?;
    for (_, owner_id) in &config.access_tokens {
        db.ensure_user(*owner_id, DEFAULT_TIER)?;
    }

    let provider: Arc<dyn StorageProvider> = match &config.s3_bucket {
        Some(bucket) => Arc::new(
            S3Storage::new_with_prefix(bucket.clone(), config.s3_key_prefix.clone()).await?,
        ),
        None => Arc::new(LocalDirStorage::new_at_path(
            rt.clone(),
            config.storage_dir.clone(),
        )?),
    };
    tracing::info!("storage provider: {provider:?}");

    let secret = match &config.instance_secret {
        Some(hex) => Secret::try_from(hex.as_str())?,
        None => {
            tracing::warn!(
                "no instance secret configured; generating one for this run, which invalidates \
                 any in-flight multipart uploads"
            );
            Secret::random()
        },
    };

    let file_storage = FileStorage::new(rt, db, provider, KeyBroker::new(secret));
    file_storage.clone().start_session_sweeper();

    let state = LocalAppState {
        file_storage,
        authenticator: Arc::new(StaticTokenAuthenticator::new(config.access_tokens.clone())),
    };
    let app = router(state).layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.interface, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}
