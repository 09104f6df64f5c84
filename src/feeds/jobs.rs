use crate::feeds::source::{FeedFetch, FeedSource};
use crate::feeds::store::{FeedItem, FeedStore};
use crate::metrics::Metrics;
use crate::notify::NotificationSink;
use crate::render;
use crate::scheduler::PeriodicJob;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct FeedPollJob {
    store: Arc<FeedStore>,
    source: Arc<dyn FeedSource>,
    metrics: Arc<Metrics>,
    max_seen_ids: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollOutcome {
    pub feeds: usize,
    pub failed: usize,
    pub new_items: usize,
}

impl FeedPollJob {
    pub fn new(
        store: Arc<FeedStore>,
        source: Arc<dyn FeedSource>,
        metrics: Arc<Metrics>,
        max_seen_ids: usize,
    ) -> Self {
        Self {
            store,
            source,
            metrics,
            max_seen_ids,
        }
    }

    pub async fn poll_once(&self) -> PollOutcome {
        let mut outcome = PollOutcome::default();
        for url in self.store.all_feeds() {
            outcome.feeds += 1;
            let meta = self.store.feed_meta(&url);
            let fetched = self
                .source
                .fetch(&url, meta.etag.as_deref(), meta.last_modified.as_deref())
                .await;

            match fetched {
                Ok(FeedFetch::NotModified) => {
                    debug!(feed = %url, "лента не изменилась");
                }
                Ok(FeedFetch::Fetched {
                    items,
                    etag,
                    last_modified,
                }) => {
                    self.store.update_feed_meta(&url, etag, last_modified);
                    let fresh = self.store.ingest(&url, items, self.max_seen_ids);
                    if fresh > 0 {
                        info!(
                            feed = %url,
                            new_items = fresh,
                            subscribers = self.store.subscribers(&url).len(),
                            "новые записи в ленте"
                        );
                    }
                    outcome.new_items += fresh;
                }
                Err(err) => {
                    warn!(feed = %url, error = %err, "не удалось получить ленту");
                    self.metrics.inc_fetch_error("feed");
                    outcome.failed += 1;
                }
            }
        }

        self.metrics.add_feed_items(outcome.new_items);
        if outcome.feeds > 0 {
            if let Err(err) = self.store.save() {
                error!(store = %self.store.describe(), error = %err, "не удалось сохранить состояние лент");
                self.metrics.inc_persist_error("feeds");
            }
        }
        outcome
    }
}

#[async_trait]
impl PeriodicJob for FeedPollJob {
    fn name(&self) -> &'static str {
        "feed_poll"
    }

    async fn tick(&self) {
        self.poll_once().await;
        self.metrics.mark_tick(self.name(), crate::now_unix());
    }
}

pub struct FeedDigestJob {
    store: Arc<FeedStore>,
    sink: Arc<dyn NotificationSink>,
    metrics: Arc<Metrics>,
    host: String,
    digest_interval_secs: i64,
    items_per_feed: usize,
    max_items_total: usize,
}

impl FeedDigestJob {
    pub fn new(
        store: Arc<FeedStore>,
        sink: Arc<dyn NotificationSink>,
        metrics: Arc<Metrics>,
        host: String,
        digest_interval_secs: u64,
        items_per_feed: usize,
        max_items_total: usize,
    ) -> Self {
        Self {
            store,
            sink,
            metrics,
            host,
            digest_interval_secs: i64::try_from(digest_interval_secs).unwrap_or(i64::MAX),
            items_per_feed,
            max_items_total,
        }
    }

    pub async fn run_due(&self, now_unix: i64) -> usize {
        let mut sent = 0_usize;
        let mut touched = false;

        for chat_id in self.store.chats() {
            let last = self.store.last_digest(chat_id);
            if now_unix.saturating_sub(last) < self.digest_interval_secs {
                continue;
            }
            touched = true;

            let batch = self.store.pop_pending(chat_id);
            let parts = render::digest_html(
                &self.host,
                now_unix,
                &batch,
                self.items_per_feed,
                self.max_items_total,
            );
            if parts.is_empty() {
                self.store.set_last_digest(chat_id, now_unix);
                continue;
            }

            let mut delivered: HashSet<(String, String)> = HashSet::new();
            let mut failure = None;
            for part in &parts {
                match self.sink.send_html(chat_id, &part.html).await {
                    Ok(()) => delivered.extend(part.item_ids.iter().cloned()),
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }

            match failure {
                None => {
                    self.store.set_last_digest(chat_id, now_unix);
                    self.metrics.inc_digest_sent();
                    sent += 1;
                }
                Some(err) => {
                    let undelivered: Vec<(String, Vec<FeedItem>)> = batch
                        .into_iter()
                        .map(|(url, items)| {
                            let items = items
                                .into_iter()
                                .filter(|it| !delivered.contains(&(url.clone(), it.id.clone())))
                                .collect();
                            (url, items)
                        })
                        .collect();
                    warn!(
                        chat_id,
                        parts = parts.len(),
                        delivered = delivered.len(),
                        error = %err,
                        "дайджест не доставлен, записи возвращены в очередь"
                    );
                    self.metrics.inc_notify_error("digest");
                    self.store.restore_pending(chat_id, undelivered);
                }
            }
        }

        if touched {
            if let Err(err) = self.store.save() {
                error!(store = %self.store.describe(), error = %err, "не удалось сохранить состояние лент");
                self.metrics.inc_persist_error("feeds");
            }
        }
        sent
    }
}

#[async_trait]
impl PeriodicJob for FeedDigestJob {
    fn name(&self) -> &'static str {
        "feed_digest"
    }

    async fn tick(&self) {
        let now = crate::now_unix();
        self.run_due(now).await;
        self.metrics.mark_tick(self.name(), now);
    }
}
