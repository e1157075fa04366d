use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use interfaces::{EmptyFeedProvider, FeedProvider, PostCandidate, ScriptedFeedProvider};
use post_ingestion::{AccountPool, HttpFeedProvider, IngestConfig, IngestController, PostStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "post-ingestion")]
#[command(about = "Incrementally pull account timelines into a local post store")]
#[command(version)]
struct Cli {
    /// Path to the TOML config (default: config/ingest.toml)
    #[arg(short, long, env = "INGEST_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,

    /// Serve generated timelines instead of calling the HTTP service
    #[arg(long)]
    demo: bool,

    /// Run against a feed that never yields (storage and scheduling only)
    #[arg(long, conflicts_with = "demo")]
    idle: bool,

    #[arg(long, default_value = "info")]
    log_level: tracing::Level,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt().with_max_level(cli.log_level).init();

    info!("Starting post ingestion");

    let config = match &cli.config {
        Some(path) => {
            let mut config = IngestConfig::load_from(path)?;
            config.apply_env_overrides(|key| std::env::var(key).ok());
            config
        }
        None => IngestConfig::load_default()?,
    };
    info!(
        sources = ?config.sources,
        interval_secs = config.poll_interval_secs,
        "Loaded configuration"
    );

    let store = Arc::new(
        PostStore::new(&config.database_url)
            .await
            .with_context(|| format!("opening post store at {}", config.database_url))?,
    );

    match store.get_stats().await {
        Ok(stats) => {
            info!("Store statistics:");
            for (key, value) in stats {
                info!("  {}: {}", key, value);
            }
        }
        Err(e) => warn!("Failed to read store statistics: {}", e),
    }

    let provider: Arc<dyn FeedProvider> = if cli.demo {
        Arc::new(demo_provider(&config))
    } else if cli.idle {
        Arc::new(EmptyFeedProvider)
    } else {
        let accounts = AccountPool::load(&config.http.credentials_path)?;
        info!(accounts = accounts.len(), "Loaded account pool");
        Arc::new(HttpFeedProvider::new(config.http.clone(), accounts)?)
    };

    let mut controller = IngestController::new(config, provider, store.clone())?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested, finishing current source"),
            Err(e) => error!("Failed to listen for ctrl-c: {}", e),
        }
        let _ = shutdown_tx.send(true);
    });

    if cli.once {
        controller.recover_all().await;
        let report = controller.run_cycle(&shutdown_rx).await;
        for source in &report.sources {
            info!(
                source = source.source.as_str(),
                status = ?source.status,
                new_posts = source.inserted,
                watermark = %source.watermark_after,
                "Source result"
            );
        }
    } else {
        controller.run(shutdown_rx).await;
    }

    for (source, mark) in controller.watermarks().snapshot().await {
        info!(source = source.as_str(), watermark = %mark, "Final watermark");
    }

    store.close().await;
    info!("Post ingestion finished");
    Ok(())
}

/// Seeds every source with a short timeline and keeps adding a fresh post,
/// plus the odd repost, once per poll interval.
fn demo_provider(config: &IngestConfig) -> ScriptedFeedProvider {
    let provider = ScriptedFeedProvider::new();
    let base = Utc::now().timestamp_millis().max(1) as u64 * 1000;

    for (i, source) in config.sources.iter().enumerate() {
        let start = base + (i as u64) * 100;
        let now = Utc::now();
        provider.set_posts(
            source,
            vec![
                PostCandidate::original(start + 1, source, "first demo post", now),
                PostCandidate::repost(start + 2, source, start - 7, now),
                PostCandidate::original(start + 3, source, "second demo post", now),
            ],
        );
    }

    let feeder = provider.clone();
    let sources = config.sources.clone();
    let interval = config.poll_interval();
    tokio::spawn(async move {
        let mut tick = 0u64;
        loop {
            tokio::time::sleep(interval.max(Duration::from_secs(1))).await;
            tick += 1;
            let id = Utc::now().timestamp_millis().max(1) as u64 * 1000 + tick % 1000;
            let source = &sources[(tick as usize) % sources.len()];
            let post = if tick % 4 == 0 {
                PostCandidate::repost(id, source, id - 1, Utc::now())
            } else {
                PostCandidate::original(id, source, &format!("demo update #{}", tick), Utc::now())
            };
            feeder.push_posts(source, vec![post]);
        }
    });

    provider
}
