use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use killfeed_common::dedup::DedupFilter;
use killfeed_common::health::{ComponentStatus, HealthHandle};
use killfeed_common::log::{EntryId, EventLog, LogError};
use killfeed_common::record::{RawEvent, Record, RecordError};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn, Instrument};

use crate::enrichment::{EnrichError, Enricher};
use crate::feed::EventFeed;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Enrich(#[from] EnrichError),
    #[error("failed to encode killmail: {0}")]
    Encode(#[from] RecordError),
    #[error("failed to add killmail to the log: {0}")]
    Append(#[from] LogError),
}

pub struct IngestSettings {
    pub dedup_capacity: NonZeroUsize,
    pub max_concurrent_enrichments: NonZeroUsize,
    /// Pause after a failed feed poll.
    pub feed_backoff: Duration,
    /// How long in-flight enrichments may run on after shutdown.
    pub drain_timeout: Duration,
}

/// Polls the feed, drops recently seen killmails and hands the rest to a
/// bounded pool of enrichment tasks that append to the log.
///
/// A full pool stops the feed loop until a slot frees up, so a slow ESI
/// cannot pile up unbounded work.
pub struct Ingester {
    feed: Arc<dyn EventFeed>,
    enricher: Arc<dyn Enricher>,
    log: Arc<dyn EventLog>,
    dedup: DedupFilter,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    tasks: TaskTracker,
    feed_backoff: Duration,
    drain_timeout: Duration,
    liveness: HealthHandle,
    append_failing: Arc<AtomicBool>,
}

impl Ingester {
    pub fn new(
        feed: Arc<dyn EventFeed>,
        enricher: Arc<dyn Enricher>,
        log: Arc<dyn EventLog>,
        settings: IngestSettings,
        liveness: HealthHandle,
    ) -> Self {
        let max_concurrent = settings.max_concurrent_enrichments.get();

        Self {
            feed,
            enricher,
            log,
            dedup: DedupFilter::new(settings.dedup_capacity),
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            tasks: TaskTracker::new(),
            feed_backoff: settings.feed_backoff,
            drain_timeout: settings.drain_timeout,
            liveness,
            append_failing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run until `cancel` fires, then give in-flight enrichments
    /// `drain_timeout` to finish.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("starting ingestion loop");

        loop {
            self.report_health();

            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.feed.next_event() => next,
            };

            let event = match next {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(err) => {
                    error!("failed to fetch: {}", err);
                    metrics::counter!("killfeed_feed_errors_total").increment(1);

                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.feed_backoff) => continue,
                    }
                }
            };

            if self.dedup.seen(event.killmail_id) {
                debug!(killmail_id = event.killmail_id, "skipping known killmail");
                metrics::counter!("killfeed_duplicate_events_total").increment(1);
                continue;
            }

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            self.spawn_enrichment(event, permit);
            self.report_saturation();
        }

        self.drain().await;
        info!("ingestion loop stopped");
    }

    fn spawn_enrichment(&self, event: RawEvent, permit: tokio::sync::OwnedSemaphorePermit) {
        let enricher = self.enricher.clone();
        let log = self.log.clone();
        let liveness = self.liveness.clone();
        let append_failing = self.append_failing.clone();
        let span = tracing::info_span!("enrichment", killmail_id = event.killmail_id);

        self.tasks.spawn(
            async move {
                let result = enrich_and_append(enricher.as_ref(), log.as_ref(), event).await;
                drop(permit);

                match result {
                    Ok(id) => {
                        append_failing.store(false, Ordering::Relaxed);
                        metrics::counter!("killfeed_enrichments_total", "outcome" => "appended")
                            .increment(1);
                        debug!(entry_id = %id, "added killmail to the log");
                    }
                    Err(IngestError::Append(err)) => {
                        append_failing.store(true, Ordering::Relaxed);
                        liveness.report_status(ComponentStatus::Unhealthy);
                        metrics::counter!("killfeed_enrichments_total", "outcome" => "append_failed")
                            .increment(1);
                        error!("failed to add killmail to the log: {}", err);
                    }
                    Err(err) => {
                        metrics::counter!("killfeed_enrichments_total", "outcome" => "dropped")
                            .increment(1);
                        error!("{}", err);
                    }
                }
            }
            .instrument(span),
        );
    }

    fn report_health(&self) {
        if self.append_failing.load(Ordering::Relaxed) {
            self.liveness.report_status(ComponentStatus::Unhealthy);
        } else {
            self.liveness.report_healthy();
        }
    }

    fn report_saturation(&self) {
        let available = self.permits.available_permits() as f64;
        metrics::gauge!("killfeed_enrichment_saturation_percent")
            .set(1f64 - available / self.max_concurrent as f64);
    }

    async fn drain(&self) {
        self.tasks.close();
        if self.tasks.is_empty() {
            return;
        }

        info!(
            in_flight = self.tasks.len(),
            "waiting for in-flight enrichments"
        );
        if tokio::time::timeout(self.drain_timeout, self.tasks.wait())
            .await
            .is_err()
        {
            warn!(
                abandoned = self.tasks.len(),
                "gave up waiting for in-flight enrichments"
            );
        }
    }
}

/// Fetch the full killmail, combine it with the feed metadata and append the
/// result. Nothing here is retried.
pub async fn enrich_and_append(
    enricher: &dyn Enricher,
    log: &dyn EventLog,
    event: RawEvent,
) -> Result<EntryId, IngestError> {
    let killmail = enricher
        .fetch_detail(event.killmail_id, &event.zkb.hash)
        .await?;

    let fields = Record::new(killmail, event.zkb).to_fields()?;

    Ok(log.append(&fields).await?)
}

#[cfg(test)]
mod tests {
    use std::collections::{HashSet, VecDeque};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use killfeed_common::health::HealthRegistry;
    use killfeed_common::log::{MemoryLog, ReadWait};
    use killfeed_common::record::Killmail;
    use killfeed_common::test_utils::{killmail, zkb, UnavailableLog};
    use reqwest::StatusCode;

    use super::*;
    use crate::feed::FeedError;

    /// Replays scripted poll results, then idles like a quiet feed.
    struct ScriptedFeed {
        script: Mutex<VecDeque<Result<Option<RawEvent>, FeedError>>>,
    }

    impl ScriptedFeed {
        fn new(script: Vec<Result<Option<RawEvent>, FeedError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
            })
        }
    }

    #[async_trait]
    impl EventFeed for ScriptedFeed {
        async fn next_event(&self) -> Result<Option<RawEvent>, FeedError> {
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(next) => next,
                None => std::future::pending().await,
            }
        }
    }

    #[derive(Default)]
    struct FakeEsi {
        failing: HashSet<i64>,
        delay: Duration,
        calls: Mutex<Vec<i64>>,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    #[async_trait]
    impl Enricher for FakeEsi {
        async fn fetch_detail(&self, killmail_id: i64, _hash: &str) -> Result<Killmail, EnrichError> {
            self.calls.lock().unwrap().push(killmail_id);
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(running, Ordering::SeqCst);

            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            if self.failing.contains(&killmail_id) {
                return Err(EnrichError::UnexpectedStatus(StatusCode::NOT_FOUND));
            }
            Ok(killmail(killmail_id))
        }
    }

    fn event(killmail_id: i64) -> Result<Option<RawEvent>, FeedError> {
        Ok(Some(RawEvent {
            killmail_id,
            zkb: zkb(&format!("hash{killmail_id}")),
        }))
    }

    fn settings() -> IngestSettings {
        IngestSettings {
            dedup_capacity: NonZeroUsize::new(1024).unwrap(),
            max_concurrent_enrichments: NonZeroUsize::new(8).unwrap(),
            feed_backoff: Duration::from_millis(50),
            drain_timeout: Duration::from_secs(5),
        }
    }

    struct Harness {
        ingester: Arc<Ingester>,
        registry: HealthRegistry,
        cancel: CancellationToken,
        handle: tokio::task::JoinHandle<()>,
    }

    fn start(
        feed: Arc<ScriptedFeed>,
        esi: Arc<FakeEsi>,
        log: Arc<dyn EventLog>,
        settings: IngestSettings,
    ) -> Harness {
        let registry = HealthRegistry::new();
        let liveness = registry.register("ingestion", Duration::from_secs(30));
        let ingester = Arc::new(Ingester::new(feed, esi, log, settings, liveness));
        let cancel = CancellationToken::new();

        let handle = {
            let ingester = ingester.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { ingester.run(cancel).await })
        };

        Harness {
            ingester,
            registry,
            cancel,
            handle,
        }
    }

    impl Harness {
        async fn stop(self) {
            self.cancel.cancel();
            tokio::time::timeout(Duration::from_secs(2), self.handle)
                .await
                .expect("ingestion loop did not stop")
                .unwrap();
        }
    }

    async fn wait_for_len(log: &MemoryLog, len: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while log.len() < len {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("log did not fill up in time");
    }

    async fn logged_killmails(log: &MemoryLog) -> Vec<(EntryId, i64)> {
        log.read(EntryId::ZERO, 1000, ReadWait::Immediate)
            .await
            .unwrap()
            .iter()
            .map(|entry| {
                let record = Record::from_entry(entry).unwrap();
                (entry.id, record.killmail.killmail_id)
            })
            .collect()
    }

    #[tokio::test]
    async fn appends_every_distinct_event_once() {
        let feed = ScriptedFeed::new((1..=20).map(event).collect());
        let esi = Arc::new(FakeEsi::default());
        let log = Arc::new(MemoryLog::new(1000));

        let harness = start(feed, esi, log.clone(), settings());
        wait_for_len(&log, 20).await;
        harness.stop().await;

        let logged = logged_killmails(&log).await;
        assert_eq!(logged.len(), 20);
        assert!(logged.windows(2).all(|pair| pair[0].0 < pair[1].0));

        let killmail_ids: HashSet<i64> = logged.iter().map(|(_, id)| *id).collect();
        assert_eq!(killmail_ids, (1..=20).collect());
    }

    #[tokio::test]
    async fn duplicates_are_not_enriched() {
        let feed = ScriptedFeed::new(vec![event(1), event(2), event(1), event(3), event(2)]);
        let esi = Arc::new(FakeEsi::default());
        let log = Arc::new(MemoryLog::new(1000));

        let harness = start(feed, esi.clone(), log.clone(), settings());
        wait_for_len(&log, 3).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        harness.stop().await;

        assert_eq!(log.len(), 3);
        let mut calls = esi.calls.lock().unwrap().clone();
        calls.sort();
        assert_eq!(calls, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn empty_polls_and_failures_keep_the_loop_going() {
        let feed = ScriptedFeed::new(vec![
            Ok(None),
            Err(FeedError::UnexpectedStatus(StatusCode::BAD_GATEWAY)),
            event(1),
            Ok(None),
            event(2),
            event(3),
        ]);
        let esi = Arc::new(FakeEsi {
            failing: HashSet::from([2]),
            ..Default::default()
        });
        let log = Arc::new(MemoryLog::new(1000));

        let started = tokio::time::Instant::now();
        let harness = start(feed, esi.clone(), log.clone(), settings());
        wait_for_len(&log, 2).await;
        assert!(started.elapsed() >= Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(50)).await;
        harness.stop().await;

        let killmail_ids: Vec<i64> = logged_killmails(&log).await.iter().map(|(_, id)| *id).collect();
        assert_eq!(killmail_ids.len(), 2);
        assert!(killmail_ids.contains(&1));
        assert!(killmail_ids.contains(&3));
        assert_eq!(esi.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_backoff() {
        let feed = ScriptedFeed::new(vec![Err(FeedError::UnexpectedStatus(
            StatusCode::SERVICE_UNAVAILABLE,
        ))]);
        let esi = Arc::new(FakeEsi::default());
        let log = Arc::new(MemoryLog::new(1000));

        let harness = start(
            feed,
            esi,
            log,
            IngestSettings {
                feed_backoff: Duration::from_secs(3600),
                ..settings()
            },
        );
        tokio::time::sleep(Duration::from_millis(20)).await;

        harness.stop().await;
    }

    #[tokio::test]
    async fn enrichment_concurrency_is_bounded() {
        let feed = ScriptedFeed::new((1..=10).map(event).collect());
        let esi = Arc::new(FakeEsi {
            delay: Duration::from_millis(30),
            ..Default::default()
        });
        let log = Arc::new(MemoryLog::new(1000));

        let harness = start(
            feed,
            esi.clone(),
            log.clone(),
            IngestSettings {
                max_concurrent_enrichments: NonZeroUsize::new(2).unwrap(),
                ..settings()
            },
        );
        wait_for_len(&log, 10).await;
        harness.stop().await;

        assert_eq!(esi.max_running.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_lets_in_flight_enrichments_finish() {
        let feed = ScriptedFeed::new(vec![event(1)]);
        let esi = Arc::new(FakeEsi {
            delay: Duration::from_millis(100),
            ..Default::default()
        });
        let log = Arc::new(MemoryLog::new(1000));

        let harness = start(feed, esi.clone(), log.clone(), settings());
        tokio::time::timeout(Duration::from_secs(1), async {
            while esi.calls.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        harness.stop().await;

        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn append_failures_fail_the_liveness_check() {
        let feed = ScriptedFeed::new(vec![event(1)]);
        let esi = Arc::new(FakeEsi::default());

        let harness = start(feed, esi.clone(), Arc::new(UnavailableLog), settings());

        tokio::time::timeout(Duration::from_secs(1), async {
            while harness.registry.get_status().healthy
                || esi.calls.lock().unwrap().is_empty()
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("ingestion never reported the failing log");

        assert!(harness.ingester.append_failing.load(Ordering::Relaxed));
        harness.stop().await;
    }
}
