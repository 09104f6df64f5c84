use crate::config::Thresholds;
use crate::evaluator::{evaluate, CheckKind, CheckResult};
use crate::render;
use crate::source::{fetch_with_timeout, SnapshotSource};
use crate::state::CheckStateStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub enum StatusReport {
    Live {
        host: String,
        timestamp_unix: i64,
        results: Vec<CheckResult>,
    },
    Unavailable {
        host: String,
        reason: String,
    },
}

impl StatusReport {
    pub fn render_html(&self) -> String {
        match self {
            StatusReport::Live {
                host,
                timestamp_unix,
                results,
            } => render::status_html(host, *timestamp_unix, results),
            StatusReport::Unavailable { host, reason } => {
                render::status_unavailable_html(host, reason)
            }
        }
    }
}

/// Отвечает на запросы состояния по свежему замеру. Хранилище состояний
/// и счётчики дебаунса этот путь не трогает.
pub struct StatusService {
    source: Arc<dyn SnapshotSource>,
    thresholds: Thresholds,
    fetch_timeout: Duration,
    host: String,
}

impl StatusService {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        thresholds: Thresholds,
        fetch_timeout: Duration,
        host: String,
    ) -> Self {
        Self {
            source,
            thresholds,
            fetch_timeout,
            host,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub async fn live_report(&self) -> StatusReport {
        match fetch_with_timeout(self.fetch_timeout, self.source.fetch_snapshot()).await {
            Ok(snapshot) => StatusReport::Live {
                host: self.host.clone(),
                timestamp_unix: snapshot.timestamp_unix,
                results: order_for_display(evaluate(&snapshot, &self.thresholds)),
            },
            Err(err) => {
                warn!(source = self.source.name(), error = %err, "запрос состояния: замер не получен");
                StatusReport::Unavailable {
                    host: self.host.clone(),
                    reason: err.to_string(),
                }
            }
        }
    }

    pub fn checks_report(&self, store: &CheckStateStore, min_consecutive: u32) -> String {
        render::checks_html(&self.host, &store.iterate(), min_consecutive)
    }
}

pub fn order_for_display(results: Vec<CheckResult>) -> Vec<CheckResult> {
    let mut cpu = Vec::new();
    let mut mem = Vec::new();
    let mut disks = Vec::new();
    let mut inodes = Vec::new();
    for r in results {
        match r.kind() {
            CheckKind::Cpu => cpu.push(r),
            CheckKind::Mem => mem.push(r),
            CheckKind::Disk => disks.push(r),
            CheckKind::Inode => inodes.push(r),
        }
    }
    disks.sort_by(|a, b| b.value.total_cmp(&a.value));
    inodes.sort_by(|a, b| a.value.total_cmp(&b.value));

    cpu.into_iter()
        .chain(mem)
        .chain(disks)
        .chain(inodes)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{FilesystemEntry, Snapshot};
    use crate::source::tests::ScriptedSource;
    use crate::source::FetchError;

    fn fs(mount: &str, avail: u64, inode_free: u64) -> FilesystemEntry {
        FilesystemEntry {
            size_bytes: Some(100),
            avail_bytes: Some(avail),
            inode_total: Some(100),
            inode_free: Some(inode_free),
            ..FilesystemEntry::new("/dev/sda", mount, "ext4")
        }
    }

    fn thresholds() -> Thresholds {
        Thresholds {
            enable_inodes: true,
            ..Thresholds::default()
        }
    }

    #[tokio::test]
    async fn live_report_is_ordered_for_display() {
        let snapshot = Snapshot {
            timestamp_unix: 5,
            load5: Some(1.0),
            cpu_cores: 4,
            mem_total_bytes: Some(100),
            mem_available_bytes: Some(50),
            filesystems: vec![fs("/a", 80, 70), fs("/b", 10, 20), fs("/c", 50, 40)],
        };
        let service = StatusService::new(
            Arc::new(ScriptedSource::new(vec![Ok(snapshot)])),
            thresholds(),
            Duration::from_secs(1),
            "host".to_string(),
        );
        let StatusReport::Live { results, .. } = service.live_report().await else {
            panic!("ожидался живой отчёт");
        };
        let ids: Vec<&str> = results.iter().map(|r| r.check_id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["cpu", "mem", "disk:/b", "disk:/c", "disk:/a", "inode:/b", "inode:/c", "inode:/a"]
        );
    }

    #[tokio::test]
    async fn failed_fetch_reports_unavailable() {
        let service = StatusService::new(
            Arc::new(ScriptedSource::new(vec![Err(FetchError::Status(503))])),
            thresholds(),
            Duration::from_secs(1),
            "host".to_string(),
        );
        let report = service.live_report().await;
        assert!(matches!(report, StatusReport::Unavailable { .. }));
        assert!(report.render_html().contains("Состояние недоступно"));
    }
}
