use crate::feeds::store::FeedItem;
use async_trait::async_trait;
use reqwest::header::{HeaderName, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("HTTP-запрос ленты не выполнен: {0}")]
    Http(#[from] reqwest::Error),
    #[error("лента ответила статусом {0}")]
    Status(u16),
    #[error("не удалось разобрать ленту: {0}")]
    Parse(#[from] feed_rs::parser::ParseFeedError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedFetch {
    NotModified,
    Fetched {
        items: Vec<FeedItem>,
        etag: Option<String>,
        last_modified: Option<String>,
    },
}

#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<FeedFetch, FeedError>;
}

pub struct HttpFeedSource {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFeedSource {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn fetch(
        &self,
        url: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<FeedFetch, FeedError> {
        let mut req = self.client.get(url).timeout(self.timeout);
        if let Some(etag) = etag {
            req = req.header(IF_NONE_MATCH, etag);
        }
        if let Some(lm) = last_modified {
            req = req.header(IF_MODIFIED_SINCE, lm);
        }

        let resp = req.send().await?;
        if resp.status() == StatusCode::NOT_MODIFIED {
            return Ok(FeedFetch::NotModified);
        }
        if !resp.status().is_success() {
            return Err(FeedError::Status(resp.status().as_u16()));
        }

        let header = |name: HeaderName| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let etag = header(ETAG);
        let last_modified = header(LAST_MODIFIED);
        let body = resp.bytes().await?;

        Ok(FeedFetch::Fetched {
            items: parse_feed(&body)?,
            etag,
            last_modified,
        })
    }
}

/// Записи ленты в порядке документа. Записи без id и ссылки пропускаются.
pub fn parse_feed(body: &[u8]) -> Result<Vec<FeedItem>, FeedError> {
    let feed = feed_rs::parser::parse(body)?;
    let items = feed
        .entries
        .into_iter()
        .filter_map(|entry| {
            let link = entry
                .links
                .first()
                .map(|l| l.href.clone())
                .unwrap_or_default();
            let id = if entry.id.trim().is_empty() {
                link.clone()
            } else {
                entry.id
            };
            if id.is_empty() {
                return None;
            }
            Some(FeedItem {
                id,
                title: entry
                    .title
                    .map(|t| t.content.trim().to_string())
                    .unwrap_or_default(),
                link,
                author: entry
                    .authors
                    .first()
                    .map(|p| p.name.trim().to_string())
                    .unwrap_or_default(),
                published_ts: entry
                    .published
                    .or(entry.updated)
                    .map(|t| t.timestamp())
                    .unwrap_or(0),
            })
        })
        .collect();
    Ok(items)
}
