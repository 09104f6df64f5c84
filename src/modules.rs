use crate::config::Config;
use crate::feeds::jobs::{FeedDigestJob, FeedPollJob};
use crate::feeds::source::HttpFeedSource;
use crate::feeds::store::FeedStore;
use crate::metrics::Metrics;
use crate::notify::NotificationSink;
use crate::scheduler::{run_periodic, MonitorJob, PeriodicJob};
use crate::source::SnapshotSource;
use crate::state::CheckStateStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppContext {
    pub cfg: Config,
    pub host: String,
    pub metrics: Arc<Metrics>,
    pub http_client: reqwest::Client,
    pub check_store: Arc<CheckStateStore>,
    pub feed_store: Arc<FeedStore>,
    pub source: Arc<dyn SnapshotSource>,
    pub sink: Arc<dyn NotificationSink>,
    pub shutdown: watch::Receiver<bool>,
}

pub struct ModuleEntry {
    pub name: &'static str,
    pub start: fn(&AppContext) -> Vec<JoinHandle<()>>,
}

pub const REGISTRY: &[ModuleEntry] = &[
    ModuleEntry {
        name: "monitoring",
        start: start_monitoring,
    },
    ModuleEntry {
        name: "feeds",
        start: start_feeds,
    },
];

pub fn lookup(name: &str) -> Option<&'static ModuleEntry> {
    REGISTRY.iter().find(|m| m.name == name)
}

pub fn start_enabled(ctx: &AppContext) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    for name in &ctx.cfg.modules {
        match lookup(name) {
            Some(entry) => {
                let started = (entry.start)(ctx);
                info!(module = entry.name, tasks = started.len(), "модуль запущен");
                handles.extend(started);
            }
            None => warn!(module = %name, "неизвестный модуль пропущен"),
        }
    }
    handles
}

fn spawn_job(job: Arc<dyn PeriodicJob>, period: Duration, ctx: &AppContext) -> JoinHandle<()> {
    tokio::spawn(run_periodic(job, period, ctx.shutdown.clone()))
}

fn start_monitoring(ctx: &AppContext) -> Vec<JoinHandle<()>> {
    let monitor = &ctx.cfg.monitor;
    let job = MonitorJob::new(
        ctx.source.clone(),
        ctx.check_store.clone(),
        ctx.sink.clone(),
        ctx.metrics.clone(),
        monitor.thresholds.clone(),
        monitor.alert_min_consecutive,
        monitor.fetch_timeout(),
    );
    vec![spawn_job(Arc::new(job), monitor.sample_interval(), ctx)]
}

fn start_feeds(ctx: &AppContext) -> Vec<JoinHandle<()>> {
    let feeds = &ctx.cfg.feeds;
    let source = HttpFeedSource::new(
        ctx.http_client.clone(),
        Duration::from_secs(feeds.fetch_timeout_secs),
    );
    let poll = FeedPollJob::new(
        ctx.feed_store.clone(),
        Arc::new(source),
        ctx.metrics.clone(),
        feeds.max_seen_ids,
    );
    let digest = FeedDigestJob::new(
        ctx.feed_store.clone(),
        ctx.sink.clone(),
        ctx.metrics.clone(),
        ctx.host.clone(),
        feeds.digest_interval_secs,
        feeds.items_per_feed,
        feeds.max_items_total,
    );
    vec![
        spawn_job(
            Arc::new(poll),
            Duration::from_secs(feeds.poll_interval_secs),
            ctx,
        ),
        spawn_job(
            Arc::new(digest),
            Duration::from_secs(feeds.digest_check_secs),
            ctx,
        ),
    ]
}
