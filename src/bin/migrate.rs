//! Create the tables backing every configured collection.
//!
//! Reads settings from the environment (and `.env`), loads collection configs from
//! `ARCHITECT_CONFIG_PATH` (or the first argument), then applies the DDL.

use architect_cms::{apply_migrations, load_from_path, resolve_in_schema, PgDatabase, Settings};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("architect_cms=info")),
        )
        .init();

    let settings = Settings::from_env();
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| settings.config_path.clone())
        .unwrap_or_else(|| "collections".into());

    let configs = load_from_path(&config_path).await?;
    let registry = resolve_in_schema(&configs, &settings.db_schema)?;
    tracing::info!(path = %config_path, collections = registry.len(), "configs loaded");

    let db = PgDatabase::connect(&settings).await?;
    let applied = apply_migrations(&db, &registry).await?;
    tracing::info!(statements = applied, "done");
    Ok(())
}
