pub mod exporter;
pub mod local;

use crate::config::{MonitorConfig, SourceKind};
use crate::snapshot::Snapshot;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use exporter::{parse_node_exporter, NodeExporterSource};
pub use local::LocalSource;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP-запрос не выполнен: {0}")]
    Http(#[from] reqwest::Error),
    #[error("источник ответил статусом {0}")]
    Status(u16),
    #[error("превышено время ожидания {0:?}")]
    Timeout(Duration),
    #[error("локальный сбор не выполнен: {0}")]
    Local(String),
}

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(&self) -> Result<Snapshot, FetchError>;

    fn name(&self) -> &'static str;
}

pub async fn fetch_with_timeout<F>(timeout: Duration, fut: F) -> Result<Snapshot, FetchError>
where
    F: Future<Output = Result<Snapshot, FetchError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout(timeout)),
    }
}

type SourceFactory = fn(&MonitorConfig, reqwest::Client) -> Arc<dyn SnapshotSource>;

const SOURCES: &[(SourceKind, SourceFactory)] = &[
    (SourceKind::NodeExporter, node_exporter_source),
    (SourceKind::Local, local_source),
];

fn node_exporter_source(cfg: &MonitorConfig, client: reqwest::Client) -> Arc<dyn SnapshotSource> {
    Arc::new(NodeExporterSource::new(
        client,
        cfg.node_exporter_url.clone(),
        cfg.fetch_timeout(),
    ))
}

fn local_source(cfg: &MonitorConfig, _client: reqwest::Client) -> Arc<dyn SnapshotSource> {
    Arc::new(LocalSource::new(cfg.fetch_timeout()))
}

pub fn build_source(cfg: &MonitorConfig, client: reqwest::Client) -> Arc<dyn SnapshotSource> {
    let factory = SOURCES
        .iter()
        .find(|(kind, _)| *kind == cfg.source)
        .map(|(_, factory)| *factory)
        .unwrap_or(SOURCES[0].1);
    factory(cfg, client)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    pub(crate) struct ScriptedSource {
        replies: Mutex<Vec<Result<Snapshot, FetchError>>>,
    }

    impl ScriptedSource {
        pub(crate) fn new(mut replies: Vec<Result<Snapshot, FetchError>>) -> Self {
            replies.reverse();
            Self {
                replies: Mutex::new(replies),
            }
        }
    }

    #[async_trait]
    impl SnapshotSource for ScriptedSource {
        async fn fetch_snapshot(&self) -> Result<Snapshot, FetchError> {
            self.replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(FetchError::Local("ответы закончились".to_string())))
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    #[tokio::test]
    async fn timeout_becomes_fetch_error() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Snapshot::default())
        };
        let err = fetch_with_timeout(Duration::from_millis(20), slow)
            .await
            .expect_err("должен истечь таймаут");
        assert!(matches!(err, FetchError::Timeout(_)));
    }

    #[test]
    fn registry_builds_configured_source() {
        let cfg = MonitorConfig {
            source: SourceKind::Local,
            ..MonitorConfig::default()
        };
        assert_eq!(build_source(&cfg, reqwest::Client::new()).name(), "local");
        let cfg = MonitorConfig::default();
        assert_eq!(build_source(&cfg, reqwest::Client::new()).name(), "node_exporter");
    }
}
