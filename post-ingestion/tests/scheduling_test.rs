mod common;

use anyhow::Result;
use common::{config, init_tracing, original, MemorySink, SlowProvider};
use interfaces::ScriptedFeedProvider;
use post_ingestion::IngestController;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

fn scripted(sources: &[&str]) -> ScriptedFeedProvider {
    let provider = ScriptedFeedProvider::new();
    for (i, source) in sources.iter().enumerate() {
        let base = (i as u64 + 1) * 100;
        provider.set_posts(source, vec![original(base + 1, source), original(base, source)]);
    }
    provider
}

fn offsets(starts: &[(String, Instant)], t0: Instant) -> Vec<u64> {
    starts.iter().map(|(_, at)| (*at - t0).as_secs()).collect()
}

#[tokio::test(start_paused = true)]
async fn test_cycles_run_once_per_interval() -> Result<()> {
    init_tracing();
    let sink = MemorySink::new();
    let provider = Arc::new(scripted(&["WuBlockchain"]));
    let controller = IngestController::new(config(&["WuBlockchain"]), provider, sink.clone())?;

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let mut controller = controller;
        controller.run(rx).await
    });

    tokio::time::sleep(Duration::from_secs(95)).await;
    tx.send(true)?;
    let cycles = handle.await?;

    // Cycles at 0s, 30s, 60s and 90s.
    assert_eq!(cycles, 4);
    assert_eq!(sink.ids("WuBlockchain"), vec![101, 100]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_slow_fetch_does_not_shift_cycle_starts() -> Result<()> {
    init_tracing();
    let sink = MemorySink::new();
    let provider = Arc::new(SlowProvider::new(scripted(&["PANewsCN"]), Duration::from_secs(10)));
    let controller = IngestController::new(config(&["PANewsCN"]), provider.clone(), sink.clone())?;

    let t0 = Instant::now();
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let mut controller = controller;
        controller.run(rx).await
    });

    tokio::time::sleep(Duration::from_secs(65)).await;
    tx.send(true)?;
    let cycles = handle.await?;

    assert_eq!(cycles, 3);
    assert_eq!(offsets(&provider.starts(), t0), vec![0, 30, 60]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_overrunning_cycle_starts_next_immediately() -> Result<()> {
    init_tracing();
    let sink = MemorySink::new();
    let provider = Arc::new(SlowProvider::new(scripted(&["ChainCatcher_"]), Duration::from_secs(45)));
    let controller = IngestController::new(config(&["ChainCatcher_"]), provider.clone(), sink.clone())?;

    let t0 = Instant::now();
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let mut controller = controller;
        controller.run(rx).await
    });

    tokio::time::sleep(Duration::from_secs(100)).await;
    tx.send(true)?;
    let cycles = handle.await?;

    assert_eq!(cycles, 3);
    assert_eq!(offsets(&provider.starts(), t0), vec![0, 45, 90]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_lets_current_source_finish_and_skips_the_rest() -> Result<()> {
    init_tracing();
    let sink = MemorySink::new();
    let sources = ["WatcherGuru", "TheBlock__", "lookonchain"];
    let provider = Arc::new(SlowProvider::new(scripted(&sources), Duration::from_secs(10)));
    let controller = IngestController::new(config(&sources), provider.clone(), sink.clone())?;

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let mut controller = controller;
        let cycles = controller.run(rx).await;
        (cycles, controller)
    });

    tokio::time::sleep(Duration::from_secs(5)).await;
    tx.send(true)?;
    let (cycles, controller) = handle.await?;

    assert_eq!(cycles, 1);
    assert_eq!(controller.cycles_completed(), 1);
    let fetched: Vec<String> = provider.starts().into_iter().map(|(s, _)| s).collect();
    assert_eq!(fetched, vec!["WatcherGuru".to_string()]);
    assert_eq!(sink.ids("WatcherGuru"), vec![101, 100]);
    assert!(sink.ids("TheBlock__").is_empty());
    assert_eq!(sink.len(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_dropped_shutdown_sender_stops_the_loop() -> Result<()> {
    init_tracing();
    let sink = MemorySink::new();
    let provider = Arc::new(scripted(&["WuBlockchain"]));
    let mut controller = IngestController::new(config(&["WuBlockchain"]), provider, sink.clone())?;

    let (tx, rx) = watch::channel(false);
    drop(tx);
    let cycles = controller.run(rx).await;
    assert_eq!(cycles, 1);
    Ok(())
}
