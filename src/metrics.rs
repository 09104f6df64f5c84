use crate::engine::TransitionEvent;
use crate::evaluator::CheckResult;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    started_at_unix: i64,
    pub tgmon_uptime_seconds: Gauge,
    pub tgmon_check_status: GaugeVec,
    pub tgmon_check_value: GaugeVec,
    pub tgmon_checks_total: Gauge,
    pub tgmon_checks_alerting: Gauge,
    pub tgmon_job_ticks_total: CounterVec,
    pub tgmon_job_last_tick_timestamp_seconds: GaugeVec,
    pub tgmon_fetch_errors_total: CounterVec,
    pub tgmon_persist_errors_total: CounterVec,
    pub tgmon_notify_errors_total: CounterVec,
    pub tgmon_events_total: CounterVec,
    pub tgmon_feed_items_total: Counter,
    pub tgmon_digests_sent_total: Counter,
    pub tgmon_scrape_count_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let tgmon_uptime_seconds =
            Gauge::with_opts(opts!("tgmon_uptime_seconds", "Agent uptime in seconds"))?;
        let tgmon_check_status = GaugeVec::new(
            opts!(
                "tgmon_check_status",
                "Last evaluated status by check (0 = ok, 1 = alert)"
            ),
            &["check"],
        )?;
        let tgmon_check_value = GaugeVec::new(
            opts!(
                "tgmon_check_value",
                "Last evaluated ratio by check"
            ),
            &["check"],
        )?;
        let tgmon_checks_total = Gauge::with_opts(opts!(
            "tgmon_checks_total",
            "Number of checks evaluated on the last tick"
        ))?;
        let tgmon_checks_alerting = Gauge::with_opts(opts!(
            "tgmon_checks_alerting",
            "Number of checks above threshold on the last tick"
        ))?;
        let tgmon_job_ticks_total = CounterVec::new(
            opts!("tgmon_job_ticks_total", "Completed scheduler ticks by job"),
            &["job"],
        )?;
        let tgmon_job_last_tick_timestamp_seconds = GaugeVec::new(
            opts!(
                "tgmon_job_last_tick_timestamp_seconds",
                "Unix timestamp of the last tick by job"
            ),
            &["job"],
        )?;
        let tgmon_fetch_errors_total = CounterVec::new(
            opts!("tgmon_fetch_errors_total", "Failed fetches by source"),
            &["source"],
        )?;
        let tgmon_persist_errors_total = CounterVec::new(
            opts!("tgmon_persist_errors_total", "Failed durable writes by store"),
            &["store"],
        )?;
        let tgmon_notify_errors_total = CounterVec::new(
            opts!("tgmon_notify_errors_total", "Failed notification deliveries by kind"),
            &["kind"],
        )?;
        let tgmon_events_total = CounterVec::new(
            opts!("tgmon_events_total", "Transition events by kind"),
            &["kind"],
        )?;
        let tgmon_feed_items_total = Counter::with_opts(opts!(
            "tgmon_feed_items_total",
            "New feed items queued for digests"
        ))?;
        let tgmon_digests_sent_total = Counter::with_opts(opts!(
            "tgmon_digests_sent_total",
            "Digest messages delivered"
        ))?;
        let tgmon_scrape_count_total = Counter::with_opts(opts!(
            "tgmon_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;

        register(&registry, &tgmon_uptime_seconds)?;
        register(&registry, &tgmon_check_status)?;
        register(&registry, &tgmon_check_value)?;
        register(&registry, &tgmon_checks_total)?;
        register(&registry, &tgmon_checks_alerting)?;
        register(&registry, &tgmon_job_ticks_total)?;
        register(&registry, &tgmon_job_last_tick_timestamp_seconds)?;
        register(&registry, &tgmon_fetch_errors_total)?;
        register(&registry, &tgmon_persist_errors_total)?;
        register(&registry, &tgmon_notify_errors_total)?;
        register(&registry, &tgmon_events_total)?;
        register(&registry, &tgmon_feed_items_total)?;
        register(&registry, &tgmon_digests_sent_total)?;
        register(&registry, &tgmon_scrape_count_total)?;

        Ok(Arc::new(Self {
            registry,
            started_at_unix: crate::now_unix(),
            tgmon_uptime_seconds,
            tgmon_check_status,
            tgmon_check_value,
            tgmon_checks_total,
            tgmon_checks_alerting,
            tgmon_job_ticks_total,
            tgmon_job_last_tick_timestamp_seconds,
            tgmon_fetch_errors_total,
            tgmon_persist_errors_total,
            tgmon_notify_errors_total,
            tgmon_events_total,
            tgmon_feed_items_total,
            tgmon_digests_sent_total,
            tgmon_scrape_count_total,
        }))
    }

    pub fn observe_results(&self, results: &[CheckResult]) {
        let mut alerting = 0;
        for r in results {
            let alert = r.is_alert();
            if alert {
                alerting += 1;
            }
            self.tgmon_check_status
                .with_label_values(&[&r.check_id])
                .set(if alert { 1.0 } else { 0.0 });
            self.tgmon_check_value
                .with_label_values(&[&r.check_id])
                .set(r.value);
        }
        self.tgmon_checks_total.set(results.len() as f64);
        self.tgmon_checks_alerting.set(alerting as f64);
    }

    pub fn observe_events(&self, events: &[TransitionEvent]) {
        for e in events {
            self.tgmon_events_total
                .with_label_values(&[e.kind.as_str()])
                .inc();
        }
    }

    pub fn mark_tick(&self, job: &str, now_unix: i64) {
        self.tgmon_job_ticks_total.with_label_values(&[job]).inc();
        self.tgmon_job_last_tick_timestamp_seconds
            .with_label_values(&[job])
            .set(now_unix as f64);
    }

    pub fn refresh_uptime(&self) {
        let uptime = crate::now_unix().saturating_sub(self.started_at_unix) as f64;
        self.tgmon_uptime_seconds.set(uptime);
    }

    pub fn inc_scrape_count(&self) {
        self.tgmon_scrape_count_total.inc();
    }

    pub fn inc_fetch_error(&self, source: &str) {
        self.tgmon_fetch_errors_total
            .with_label_values(&[source])
            .inc();
    }

    pub fn inc_persist_error(&self, store: &str) {
        self.tgmon_persist_errors_total
            .with_label_values(&[store])
            .inc();
    }

    pub fn inc_notify_error(&self, kind: &str) {
        self.tgmon_notify_errors_total
            .with_label_values(&[kind])
            .inc();
    }

    pub fn add_feed_items(&self, count: usize) {
        self.tgmon_feed_items_total.inc_by(count as f64);
    }

    pub fn inc_digest_sent(&self) {
        self.tgmon_digests_sent_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::{CheckMeta, CheckStatus};

    #[test]
    fn encodes_check_gauges() {
        let metrics = Metrics::new().expect("metrics");
        metrics.observe_results(&[CheckResult {
            check_id: "disk:/data".to_string(),
            status: CheckStatus::Alert,
            value: 0.9,
            message: String::new(),
            meta: CheckMeta::Disk {
                mount: "/data".to_string(),
                fstype: "ext4".to_string(),
                device: "/dev/sdb1".to_string(),
                size_bytes: 1000,
                avail_bytes: 100,
            },
        }]);
        metrics.inc_fetch_error("node_exporter");
        let text = String::from_utf8(metrics.encode_metrics().expect("encode")).expect("utf8");
        assert!(text.contains("tgmon_check_status{check=\"disk:/data\"} 1"));
        assert!(text.contains("tgmon_checks_alerting 1"));
        assert!(text.contains("tgmon_fetch_errors_total{source=\"node_exporter\"} 1"));
    }
}
