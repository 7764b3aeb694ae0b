//! Scratch-file sweep entry point
//!
//! Deletes `.cache` files a crashed process left in the store's scratch
//! directory. Takes an optional JSON store config path; without one the
//! default scratch directory and age threshold are used.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cloudstore::{sweep, StoreConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cloudstore=info,cloudstore_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => StoreConfig::from_json_file(&path)?,
        None => StoreConfig::default(),
    };

    tracing::info!(
        dir = %config.cache.dir.display(),
        max_age_secs = config.cache.max_age.as_secs(),
        "Sweeping cache directory"
    );

    let report = sweep(&config.cache.dir, config.cache.max_age).await?;
    if report.failures > 0 {
        tracing::warn!(failures = report.failures, "Some cache entries could not be swept");
    }

    Ok(())
}
