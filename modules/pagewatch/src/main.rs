use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pagewatch::connectivity::HttpProbe;
use pagewatch::delivery::DiscordNotifier;
use pagewatch::media::HttpMediaFetcher;
use pagewatch::monitor::{Monitor, MonitorDeps};
use pagewatch::store::JsonFileStore;
use pagewatch::{fetcher, Config};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("pagewatch=info".parse()?))
        .init();

    info!("pagewatch starting...");

    let config = Config::from_env()?;

    tokio::fs::create_dir_all(&config.media_dir)
        .await
        .with_context(|| format!("failed to create media dir {}", config.media_dir.display()))?;

    let store = JsonFileStore::load(&config.storage_path).await?;

    let notifier = DiscordNotifier::new(&config.discord_token)?;
    if let Err(e) = notifier.authenticate().await {
        error!(error = %e, "Could not log in to Discord");
        std::process::exit(1);
    }

    let deps = MonitorDeps {
        fetcher: fetcher::from_backend(&config.page_backend)?,
        store: Arc::new(store),
        media: Arc::new(HttpMediaFetcher::new(&config.media_dir, &config.ffmpeg_path)?),
        notifier: Arc::new(notifier),
        probe: Arc::new(HttpProbe::with_defaults()?),
    };

    let monitor = Monitor::new(
        config.targets.clone(),
        &config.page_url_template,
        config.check_interval.as_duration(),
        deps,
    );

    monitor
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await;

    info!("pagewatch stopped");
    Ok(())
}
