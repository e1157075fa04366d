use crate::config::IngestConfig;
use crate::export::JsonExporter;
use crate::filter::is_original;
use crate::types::{CycleReport, IngestError, PostRecord, Result, SourceReport, SourceStatus};
use crate::watermark::WatermarkStore;
use chrono::Utc;
use futures::{future, stream, StreamExt};
use interfaces::{FeedProvider, PostId, PostSink};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Time left to wait before the next cycle so that cycle starts stay on a
/// fixed period. Zero when the last cycle overran the interval.
pub fn next_delay(interval: Duration, elapsed: Duration) -> Duration {
    interval.saturating_sub(elapsed)
}

/// Drives the fetch → filter → persist → advance loop over every source.
pub struct IngestController {
    config: Arc<IngestConfig>,
    provider: Arc<dyn FeedProvider>,
    sink: Arc<dyn PostSink>,
    watermarks: WatermarkStore,
    exporter: Option<JsonExporter>,
    cycles: u64,
}

impl IngestController {
    pub fn new(config: IngestConfig, provider: Arc<dyn FeedProvider>, sink: Arc<dyn PostSink>) -> Result<Self> {
        config.validate()?;
        let exporter = match &config.export_dir {
            Some(dir) => Some(JsonExporter::new(dir.clone())?),
            None => None,
        };

        Ok(Self {
            config: Arc::new(config),
            watermarks: WatermarkStore::new(sink.clone()),
            provider,
            sink,
            exporter,
            cycles: 0,
        })
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn watermarks(&self) -> &WatermarkStore {
        &self.watermarks
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles
    }

    /// Read every source's watermark back from storage. Sources that fail
    /// here are retried lazily at the start of their next pull.
    pub async fn recover_all(&self) -> usize {
        let mut recovered = 0;
        for source in &self.config.sources {
            match self.watermarks.recover(source).await {
                Ok(_) => recovered += 1,
                Err(e) => warn!(source = source.as_str(), error = %e, "Watermark recovery failed, will retry"),
            }
        }
        recovered
    }

    /// Run cycles until `shutdown` flips to true (or its sender goes away).
    /// Returns the number of cycles that ran.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> u64 {
        info!(
            provider = self.provider.name(),
            sources = self.config.sources.len(),
            interval_secs = self.config.poll_interval_secs,
            page_limit = self.config.page_limit,
            "Starting ingestion loop"
        );
        self.recover_all().await;

        let started_with = self.cycles;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let started = Instant::now();
            let report = self.run_cycle(&shutdown).await;
            if report.interrupted {
                break;
            }

            let delay = next_delay(self.config.poll_interval(), started.elapsed());
            debug!(delay_ms = delay.as_millis() as u64, "Sleeping until next cycle");
            if sleep_or_shutdown(delay, &mut shutdown).await {
                break;
            }
        }

        info!(cycles = self.cycles - started_with, "Ingestion loop stopped");
        self.cycles - started_with
    }

    /// One pass over all sources. Sources are visited in configured order,
    /// at most `max_concurrent_sources` at a time, and no new source is
    /// started once shutdown has been requested.
    pub async fn run_cycle(&mut self, shutdown: &watch::Receiver<bool>) -> CycleReport {
        self.cycles += 1;
        let cycle = self.cycles;
        let started_at = Utc::now();
        let started = Instant::now();

        let this: &Self = self;
        let sources: Vec<SourceReport> = stream::iter(this.config.sources.iter())
            .take_while(|_| future::ready(!*shutdown.borrow()))
            .map(|source| this.ingest_source(source))
            .buffered(this.config.max_concurrent_sources)
            .boxed()
            .collect()
            .await;

        let report = CycleReport {
            cycle,
            started_at,
            elapsed_ms: started.elapsed().as_millis() as u64,
            interrupted: sources.len() < self.config.sources.len(),
            sources,
        };

        info!(
            cycle = report.cycle,
            sources = report.sources.len(),
            ok = report.succeeded(),
            failed = report.failed(),
            skipped = report.skipped(),
            new_posts = report.inserted(),
            reposts = report.reposts_skipped(),
            elapsed_ms = report.elapsed_ms,
            "Cycle complete"
        );
        if report.interrupted {
            info!(cycle = report.cycle, "Cycle interrupted by shutdown");
        }

        report
    }

    /// Pull one source down to its seen boundary, store the originals and
    /// the new high mark in one commit, and only then move the in-memory
    /// watermark.
    pub async fn ingest_source(&self, source: &str) -> SourceReport {
        let watermark = match self.watermarks.ensure(source).await {
            Ok(mark) => mark,
            Err(e) => {
                warn!(source, error = %e, "Skipping source this cycle");
                return SourceReport::new(source, PostId::ZERO, SourceStatus::Skipped(e.to_string()));
            }
        };

        let mut report = SourceReport::new(source, watermark, SourceStatus::Ingested);
        let mut high = watermark;
        let mut fresh: Vec<PostRecord> = Vec::new();

        let page_limit = self.config.page_limit;
        let mut candidates = self.provider.fetch(source, page_limit).take(page_limit);
        while let Some(item) = candidates.next().await {
            let candidate = match item {
                Ok(candidate) => candidate,
                Err(e) => {
                    let err = IngestError::feed(source, e);
                    warn!(source, error = %err, "Feed fetch failed, watermark left at {}", watermark);
                    report.status = SourceStatus::FeedFailed(err.to_string());
                    return report;
                }
            };

            // Unusable ids neither end the pull nor move the watermark.
            if candidate.id == PostId::ZERO || candidate.id.get() > i64::MAX as u64 {
                let err = IngestError::InvalidCandidate(format!("post id {} is out of range", candidate.id));
                warn!(source, error = %err, "Ignoring candidate");
                report.rejected += 1;
                continue;
            }
            if candidate.id <= watermark {
                debug!(source, id = %candidate.id, watermark = %watermark, "Reached already-seen posts");
                break;
            }

            report.examined += 1;
            high = high.max(candidate.id);

            if !is_original(&candidate) {
                report.reposts_skipped += 1;
                continue;
            }

            match PostRecord::from_candidate(&candidate, source, &self.config.url_base) {
                Ok(record) => fresh.push(record),
                Err(e) => {
                    let err = IngestError::InvalidCandidate(format!("{:#}", e));
                    warn!(source, error = %err, "Ignoring candidate");
                    report.rejected += 1;
                }
            }
        }
        drop(candidates);

        if high == watermark && fresh.is_empty() {
            debug!(source, "Nothing new");
            return report;
        }

        let inserted = match self.sink.persist_batch(source, &fresh, high).await {
            Ok(inserted) => inserted,
            Err(e) => {
                let err = IngestError::persistence(source, e);
                error!(source, error = %err, "Commit failed, watermark not advanced");
                report.status = SourceStatus::PersistFailed(err.to_string());
                return report;
            }
        };

        report.inserted = inserted.len();
        report.watermark_after = self.watermarks.advance(source, high).await;

        info!(
            source,
            examined = report.examined,
            new_posts = report.inserted,
            reposts = report.reposts_skipped,
            watermark = %report.watermark_after,
            "Source ingested"
        );

        if let Some(exporter) = &self.exporter {
            let inserted: HashSet<PostId> = inserted.into_iter().collect();
            for record in fresh.iter().filter(|r| inserted.contains(&r.id)) {
                if let Err(e) = exporter.export(record).await {
                    warn!(source, id = %record.id, error = %e, "JSON export failed");
                }
            }
        }

        report
    }
}

/// Sleep for `delay` unless shutdown is requested first.
/// Returns true when the caller should stop.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_is_interval_minus_elapsed() {
        let interval = Duration::from_secs(30);
        assert_eq!(next_delay(interval, Duration::from_secs(12)), Duration::from_secs(18));
        assert_eq!(next_delay(interval, Duration::ZERO), interval);
    }

    #[test]
    fn overrun_means_no_sleep() {
        let interval = Duration::from_secs(30);
        assert_eq!(next_delay(interval, Duration::from_secs(30)), Duration::ZERO);
        assert_eq!(next_delay(interval, Duration::from_secs(95)), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_returns_early_on_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        let sleeper = tokio::spawn(async move { sleep_or_shutdown(Duration::from_secs(3600), &mut rx).await });
        tokio::time::sleep(Duration::from_secs(5)).await;
        tx.send(true).unwrap();
        assert!(sleeper.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_ignores_unrelated_updates() {
        let (tx, mut rx) = watch::channel(false);
        let started = Instant::now();
        let sleeper = tokio::spawn(async move {
            let stop = sleep_or_shutdown(Duration::from_secs(30), &mut rx).await;
            (stop, rx)
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(false).unwrap();
        let (stop, _rx) = sleeper.await.unwrap();
        assert!(!stop);
        assert!(started.elapsed() >= Duration::from_secs(30));
    }
}
