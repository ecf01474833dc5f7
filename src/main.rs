use std::env::args;
use std::error::Error;
use std::path::Path;

use screen_relay::app::config::AppConfig;
use screen_relay::app::App;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("LOG"))
        .init();

    let config_file = args().nth(1).unwrap_or("default.yaml".to_string());
    let config = AppConfig::from_file(Path::new(&config_file))?;
    tracing::debug!(?config, "read configuration");

    let mut app = App::start(config).await?;
    tracing::info!("relay started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    app.stop().await;

    Ok(())
}
