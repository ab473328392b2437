use std::sync::Arc;

use registrar::construct::Database;
use registrar::server;
use registrar::settings::Settings;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::load()?;

    // RUST_LOG wins over the configured filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.logging.filter)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let database = Database::with_rendering(settings.persistence.mode(), settings.rendering.clone())?;
    let app = server::router(Arc::new(database), settings.server.default_owner.clone());

    let listener = tokio::net::TcpListener::bind(&settings.server.bind).await?;
    info!(bind = %settings.server.bind, "registrar listening");
    axum::serve(listener, app).await?;
    Ok(())
}
