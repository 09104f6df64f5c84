use crate::config::Thresholds;
use crate::engine::{transition, TransitionEvent};
use crate::evaluator::evaluate;
use crate::metrics::Metrics;
use crate::notify::NotificationSink;
use crate::source::{fetch_with_timeout, SnapshotSource};
use crate::state::CheckStateStore;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[async_trait]
pub trait PeriodicJob: Send + Sync {
    fn name(&self) -> &'static str;

    async fn tick(&self);
}

/// Крутит задачу до сигнала остановки. Сигнал не прерывает текущий тик:
/// он проверяется только между тиками.
pub async fn run_periodic(
    job: Arc<dyn PeriodicJob>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(job = job.name(), period_secs = period.as_secs(), "запуск периодической задачи");

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                job.tick().await;
            }
        }
    }
    info!(job = job.name(), "периодическая задача остановлена");
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    FetchFailed,
    PersistFailed { events_dropped: usize },
    Completed { checks: usize, events: usize },
}

pub struct MonitorJob {
    source: Arc<dyn SnapshotSource>,
    store: Arc<CheckStateStore>,
    sink: Arc<dyn NotificationSink>,
    metrics: Arc<Metrics>,
    thresholds: Thresholds,
    min_consecutive: u32,
    fetch_timeout: Duration,
}

impl MonitorJob {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        store: Arc<CheckStateStore>,
        sink: Arc<dyn NotificationSink>,
        metrics: Arc<Metrics>,
        thresholds: Thresholds,
        min_consecutive: u32,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            source,
            store,
            sink,
            metrics,
            thresholds,
            min_consecutive,
            fetch_timeout,
        }
    }

    pub async fn run_tick(&self, now_unix: i64) -> TickOutcome {
        let snapshot =
            match fetch_with_timeout(self.fetch_timeout, self.source.fetch_snapshot()).await {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    warn!(source = self.source.name(), error = %err, "замер не получен, тик пропущен");
                    self.metrics.inc_fetch_error(self.source.name());
                    return TickOutcome::FetchFailed;
                }
            };

        let results = evaluate(&snapshot, &self.thresholds);
        self.metrics.observe_results(&results);

        let mut batch = Vec::with_capacity(results.len());
        let mut events: Vec<TransitionEvent> = Vec::new();
        for result in &results {
            let prior = self.store.get(&result.check_id);
            let (state, event) =
                transition(result, prior.as_ref(), self.min_consecutive, now_unix);
            batch.push((result.check_id.clone(), state));
            events.extend(event);
        }

        if let Err(err) = self.store.commit(&batch) {
            error!(
                store = %self.store.describe(),
                error = %err,
                events = events.len(),
                "не удалось сохранить состояние проверок, уведомления не отправлены"
            );
            self.metrics.inc_persist_error("check_state");
            return TickOutcome::PersistFailed {
                events_dropped: events.len(),
            };
        }

        if !events.is_empty() {
            self.metrics.observe_events(&events);
            info!(events = events.len(), "переходы состояния проверок");
            if let Err(err) = self.sink.notify_events(&events).await {
                warn!(error = %err, "не удалось доставить уведомления о переходах");
                self.metrics.inc_notify_error("events");
            }
        }

        debug!(checks = results.len(), events = events.len(), "тик мониторинга завершён");
        TickOutcome::Completed {
            checks: results.len(),
            events: events.len(),
        }
    }
}

#[async_trait]
impl PeriodicJob for MonitorJob {
    fn name(&self) -> &'static str {
        "monitoring"
    }

    async fn tick(&self) {
        let now = crate::now_unix();
        self.run_tick(now).await;
        self.metrics.mark_tick(self.name(), now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EventKind;
    use crate::notify::tests::RecordingSink;
    use crate::snapshot::{FilesystemEntry, Snapshot};
    use crate::source::tests::ScriptedSource;
    use crate::source::FetchError;
    use crate::state::StateStatus;
    use crate::storage::tests::MemoryBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cpu_snapshot(load5: f64) -> Snapshot {
        Snapshot {
            load5: Some(load5),
            cpu_cores: 2,
            ..Snapshot::default()
        }
    }

    fn thresholds() -> Thresholds {
        Thresholds {
            cpu_load_per_core_warn: 0.9,
            mem_available_pct_warn: 0.10,
            disk_usage_pct_warn: 0.85,
            ..Thresholds::default()
        }
    }

    struct Harness {
        job: MonitorJob,
        store: Arc<CheckStateStore>,
        sink: Arc<RecordingSink>,
        backend: MemoryBackend,
    }

    fn harness(replies: Vec<Result<Snapshot, FetchError>>) -> Harness {
        let backend = MemoryBackend::default();
        let store = Arc::new(CheckStateStore::open(Box::new(backend.clone())).expect("store"));
        let sink = Arc::new(RecordingSink::default());
        let job = MonitorJob::new(
            Arc::new(ScriptedSource::new(replies)),
            store.clone(),
            sink.clone(),
            Metrics::new().expect("metrics"),
            thresholds(),
            3,
            Duration::from_secs(1),
        );
        Harness {
            job,
            store,
            sink,
            backend,
        }
    }

    #[tokio::test]
    async fn cpu_scenario_alerts_on_third_tick_and_recovers() {
        let h = harness(vec![
            Ok(cpu_snapshot(2.0)),
            Ok(cpu_snapshot(2.0)),
            Ok(cpu_snapshot(2.0)),
            Ok(cpu_snapshot(1.0)),
        ]);

        for tick in 1..=2 {
            h.job.run_tick(tick).await;
            let state = h.store.get("cpu").expect("state");
            assert_eq!(state.status, StateStatus::Alert);
            assert_eq!(state.consecutive, tick as u32);
            assert!(h.sink.batches.lock().unwrap().is_empty());
        }

        let outcome = h.job.run_tick(3).await;
        assert_eq!(outcome, TickOutcome::Completed { checks: 1, events: 1 });
        {
            let batches = h.sink.batches.lock().unwrap();
            assert_eq!(batches.len(), 1);
            assert_eq!(batches[0][0].kind, EventKind::Alert);
            assert_eq!(batches[0][0].check_id, "cpu");
        }

        h.job.run_tick(4).await;
        let batches = h.sink.batches.lock().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1][0].kind, EventKind::Recovered);
        let state = h.store.get("cpu").expect("state");
        assert_eq!(state.status, StateStatus::Ok);
        assert_eq!(state.consecutive, 0);
    }

    #[tokio::test]
    async fn failed_fetch_leaves_state_untouched() {
        let h = harness(vec![
            Ok(cpu_snapshot(2.0)),
            Err(FetchError::Status(500)),
        ]);
        h.job.run_tick(1).await;
        let before = h.backend.body.lock().unwrap().clone();

        assert_eq!(h.job.run_tick(2).await, TickOutcome::FetchFailed);
        assert_eq!(*h.backend.body.lock().unwrap(), before);
        assert_eq!(h.store.get("cpu").map(|s| s.consecutive), Some(1));
        assert!(h.sink.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn persist_failure_suppresses_notification() {
        let h = harness(vec![
            Ok(cpu_snapshot(2.0)),
            Ok(cpu_snapshot(2.0)),
            Ok(cpu_snapshot(2.0)),
        ]);
        h.job.run_tick(1).await;
        h.job.run_tick(2).await;
        h.backend.fail.store(true, Ordering::SeqCst);

        let outcome = h.job.run_tick(3).await;
        assert_eq!(outcome, TickOutcome::PersistFailed { events_dropped: 1 });
        assert!(h.sink.batches.lock().unwrap().is_empty());
        assert_eq!(h.store.get("cpu").map(|s| s.consecutive), Some(2));
    }

    #[tokio::test]
    async fn sink_failure_keeps_committed_state() {
        let h = harness(vec![Ok(cpu_snapshot(2.0))]);
        h.sink.fail.store(true, Ordering::SeqCst);
        let job = MonitorJob {
            min_consecutive: 1,
            ..h.job
        };
        let outcome = job.run_tick(1).await;
        assert_eq!(outcome, TickOutcome::Completed { checks: 1, events: 1 });
        assert_eq!(h.store.get("cpu").map(|s| s.status), Some(StateStatus::Alert));
    }

    #[tokio::test]
    async fn batch_preserves_evaluation_order() {
        let snapshot = Snapshot {
            load5: Some(4.0),
            cpu_cores: 2,
            mem_total_bytes: Some(8_000_000_000),
            mem_available_bytes: Some(400_000_000),
            filesystems: vec![FilesystemEntry {
                size_bytes: Some(1000),
                avail_bytes: Some(100),
                ..FilesystemEntry::new("/dev/sdb1", "/data", "ext4")
            }],
            ..Snapshot::default()
        };
        let h = harness(vec![Ok(snapshot)]);
        let job = MonitorJob {
            min_consecutive: 1,
            ..h.job
        };
        job.run_tick(1).await;
        let batches = h.sink.batches.lock().unwrap();
        let ids: Vec<&str> = batches[0].iter().map(|e| e.check_id.as_str()).collect();
        assert_eq!(ids, vec!["cpu", "mem", "disk:/data"]);
    }

    struct CountingJob {
        ticks: AtomicUsize,
    }

    #[async_trait]
    impl PeriodicJob for CountingJob {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn tick(&self) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn run_periodic_stops_on_shutdown() {
        let job = Arc::new(CountingJob {
            ticks: AtomicUsize::new(0),
        });
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_periodic(job.clone(), Duration::from_secs(10), rx));

        tokio::time::sleep(Duration::from_secs(25)).await;
        tx.send(true).expect("send");
        handle.await.expect("join");

        assert_eq!(job.ticks.load(Ordering::SeqCst), 3);
    }
}
