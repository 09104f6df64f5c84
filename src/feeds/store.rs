use crate::storage::{DocumentBackend, PersistedDocument, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedItem {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub published_ts: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatFeeds {
    #[serde(default)]
    pub feeds: Vec<String>,
    #[serde(default)]
    pub last_digest_ts: i64,
    #[serde(default)]
    pub pending: BTreeMap<String, Vec<FeedItem>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedMeta {
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub last_modified: Option<String>,
    #[serde(default)]
    pub seen_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedDocument {
    #[serde(default)]
    pub chats: BTreeMap<i64, ChatFeeds>,
    #[serde(default)]
    pub feeds_meta: BTreeMap<String, FeedMeta>,
}

pub struct FeedStore {
    doc: PersistedDocument<FeedDocument>,
}

impl FeedStore {
    pub fn open(backend: Box<dyn DocumentBackend>) -> Result<Self, StorageError> {
        Ok(Self {
            doc: PersistedDocument::load(backend)?,
        })
    }

    pub fn describe(&self) -> String {
        self.doc.describe()
    }

    pub fn save(&self) -> Result<(), StorageError> {
        self.doc.save()
    }

    pub fn add_feed(&self, chat_id: i64, url: &str) -> bool {
        self.doc.update(|d| {
            d.feeds_meta.entry(url.to_string()).or_default();
            let chat = d.chats.entry(chat_id).or_default();
            if chat.feeds.iter().any(|f| f == url) {
                return false;
            }
            chat.feeds.push(url.to_string());
            true
        })
    }

    pub fn remove_feed(&self, chat_id: i64, url: &str) -> bool {
        self.doc.update(|d| {
            let Some(chat) = d.chats.get_mut(&chat_id) else {
                return false;
            };
            chat.pending.remove(url);
            let before = chat.feeds.len();
            chat.feeds.retain(|f| f != url);
            chat.feeds.len() != before
        })
    }

    pub fn list_feeds(&self, chat_id: i64) -> Vec<String> {
        self.doc.read(|d| {
            d.chats
                .get(&chat_id)
                .map(|c| c.feeds.clone())
                .unwrap_or_default()
        })
    }

    pub fn chats(&self) -> Vec<i64> {
        self.doc.read(|d| d.chats.keys().copied().collect())
    }

    pub fn all_feeds(&self) -> Vec<String> {
        self.doc.read(|d| {
            let mut seen = HashSet::new();
            d.chats
                .values()
                .flat_map(|c| c.feeds.iter())
                .filter(|url| seen.insert(url.as_str()))
                .cloned()
                .collect()
        })
    }

    pub fn subscribers(&self, url: &str) -> Vec<i64> {
        self.doc.read(|d| {
            d.chats
                .iter()
                .filter(|(_, c)| c.feeds.iter().any(|f| f == url))
                .map(|(id, _)| *id)
                .collect()
        })
    }

    pub fn feed_meta(&self, url: &str) -> FeedMeta {
        self.doc
            .read(|d| d.feeds_meta.get(url).cloned())
            .unwrap_or_default()
    }

    pub fn update_feed_meta(&self, url: &str, etag: Option<String>, last_modified: Option<String>) {
        self.doc.update(|d| {
            let meta = d.feeds_meta.entry(url.to_string()).or_default();
            if etag.is_some() {
                meta.etag = etag;
            }
            if last_modified.is_some() {
                meta.last_modified = last_modified;
            }
        });
    }

    pub fn ingest(&self, url: &str, items: Vec<FeedItem>, max_seen: usize) -> usize {
        self.doc.update(|d| {
            let meta = d.feeds_meta.entry(url.to_string()).or_default();
            let mut fresh = Vec::new();
            for item in items {
                if item.id.is_empty() || meta.seen_ids.contains(&item.id) {
                    continue;
                }
                meta.seen_ids.push(item.id.clone());
                fresh.push(item);
            }
            if meta.seen_ids.len() > max_seen {
                let excess = meta.seen_ids.len() - max_seen;
                meta.seen_ids.drain(..excess);
            }

            for chat in d.chats.values_mut() {
                if !chat.feeds.iter().any(|f| f == url) {
                    continue;
                }
                let pending = chat.pending.entry(url.to_string()).or_default();
                for item in &fresh {
                    if !pending.iter().any(|p| p.id == item.id) {
                        pending.push(item.clone());
                    }
                }
            }
            fresh.len()
        })
    }

    pub fn pending_counts(&self, chat_id: i64) -> BTreeMap<String, usize> {
        self.doc.read(|d| {
            d.chats
                .get(&chat_id)
                .map(|c| {
                    c.pending
                        .iter()
                        .map(|(url, items)| (url.clone(), items.len()))
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    pub fn pop_pending(&self, chat_id: i64) -> Vec<(String, Vec<FeedItem>)> {
        self.doc.update(|d| {
            let Some(chat) = d.chats.get_mut(&chat_id) else {
                return Vec::new();
            };
            let mut pending = std::mem::take(&mut chat.pending);
            let mut out: Vec<(String, Vec<FeedItem>)> = chat
                .feeds
                .iter()
                .filter_map(|url| pending.remove_entry(url))
                .collect();
            out.extend(pending);
            out
        })
    }

    pub fn restore_pending(&self, chat_id: i64, batch: Vec<(String, Vec<FeedItem>)>) {
        self.doc.update(|d| {
            let chat = d.chats.entry(chat_id).or_default();
            for (url, items) in batch.into_iter().filter(|(_, items)| !items.is_empty()) {
                let queue = chat.pending.entry(url).or_default();
                let newer = std::mem::take(queue);
                queue.extend(items);
                for item in newer {
                    if !queue.iter().any(|q| q.id == item.id) {
                        queue.push(item);
                    }
                }
            }
        });
    }

    pub fn last_digest(&self, chat_id: i64) -> i64 {
        self.doc
            .read(|d| d.chats.get(&chat_id).map(|c| c.last_digest_ts))
            .unwrap_or(0)
    }

    pub fn set_last_digest(&self, chat_id: i64, ts: i64) {
        self.doc.update(|d| d.chats.entry(chat_id).or_default().last_digest_ts = ts);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::tests::MemoryBackend;
    use crate::storage::JsonFileBackend;

    pub(crate) fn item(id: &str, ts: i64) -> FeedItem {
        FeedItem {
            id: id.to_string(),
            title: format!("Запись {id}"),
            link: format!("https://example.org/{id}"),
            author: String::new(),
            published_ts: ts,
        }
    }

    fn store() -> FeedStore {
        FeedStore::open(Box::new(MemoryBackend::default())).expect("store")
    }

    const A: &str = "https://a.example/rss";
    const B: &str = "https://b.example/atom";

    #[test]
    fn subscribe_and_unsubscribe() {
        let s = store();
        assert!(s.add_feed(1, A));
        assert!(!s.add_feed(1, A));
        s.add_feed(2, A);
        s.add_feed(2, B);

        assert_eq!(s.all_feeds(), vec![A.to_string(), B.to_string()]);
        assert_eq!(s.subscribers(A), vec![1, 2]);
        assert!(s.remove_feed(2, A));
        assert!(!s.remove_feed(2, A));
        assert_eq!(s.list_feeds(2), vec![B.to_string()]);
        assert!(!s.remove_feed(99, A));
    }

    #[test]
    fn ingest_dedupes_and_fans_out() {
        let s = store();
        s.add_feed(1, A);
        s.add_feed(2, A);

        assert_eq!(s.ingest(A, vec![item("x", 1), item("y", 2)], 200), 2);
        assert_eq!(s.ingest(A, vec![item("x", 1), item("z", 3)], 200), 1);

        assert_eq!(s.pending_counts(1).get(A), Some(&3));
        assert_eq!(s.pending_counts(2).get(A), Some(&3));
    }

    #[test]
    fn seen_ids_keep_tail() {
        let s = store();
        s.add_feed(1, A);
        let items = (0..5).map(|i| item(&i.to_string(), i)).collect();
        s.ingest(A, items, 3);
        assert_eq!(s.feed_meta(A).seen_ids, vec!["2", "3", "4"]);
    }

    #[test]
    fn unsubscribe_drops_pending_for_feed() {
        let s = store();
        s.add_feed(1, A);
        s.add_feed(1, B);
        s.ingest(A, vec![item("x", 1)], 200);
        s.ingest(B, vec![item("y", 1)], 200);
        s.remove_feed(1, A);
        let counts = s.pending_counts(1);
        assert!(counts.get(A).is_none());
        assert_eq!(counts.get(B), Some(&1));
    }

    #[test]
    fn pop_then_restore_keeps_items() {
        let s = store();
        s.add_feed(1, B);
        s.add_feed(1, A);
        s.ingest(A, vec![item("a", 1)], 200);
        s.ingest(B, vec![item("b", 1)], 200);

        let batch = s.pop_pending(1);
        let urls: Vec<&str> = batch.iter().map(|(u, _)| u.as_str()).collect();
        assert_eq!(urls, vec![B, A]);
        assert!(s.pending_counts(1).is_empty());

        s.ingest(A, vec![item("c", 2)], 200);
        s.restore_pending(1, batch);
        let restored = s.pop_pending(1);
        let a_items: Vec<&str> = restored
            .iter()
            .find(|(u, _)| u == A)
            .map(|(_, items)| items.iter().map(|i| i.id.as_str()).collect())
            .unwrap();
        assert_eq!(a_items, vec!["a", "c"]);
    }

    #[test]
    fn meta_update_keeps_existing_headers() {
        let s = store();
        s.update_feed_meta(A, Some("\"v1\"".to_string()), Some("Mon".to_string()));
        s.update_feed_meta(A, None, Some("Tue".to_string()));
        let meta = s.feed_meta(A);
        assert_eq!(meta.etag.as_deref(), Some("\"v1\""));
        assert_eq!(meta.last_modified.as_deref(), Some("Tue"));
    }

    #[test]
    fn document_survives_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("feeds.json");
        let s = FeedStore::open(Box::new(JsonFileBackend::new(&path))).expect("open");
        s.add_feed(-100123, A);
        s.set_last_digest(-100123, 1_700_000_000);
        s.save().expect("save");

        let s = FeedStore::open(Box::new(JsonFileBackend::new(&path))).expect("open");
        assert_eq!(s.list_feeds(-100123), vec![A.to_string()]);
        assert_eq!(s.last_digest(-100123), 1_700_000_000);
    }
}
