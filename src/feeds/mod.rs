pub mod jobs;
pub mod source;
pub mod store;

use store::FeedStore;
use teloxide::utils::html::escape;
use tracing::error;

const MAX_FEED_URL_LEN: usize = 2000;

pub fn valid_feed_url(url: &str) -> bool {
    if url.is_empty() || url.len() > MAX_FEED_URL_LEN || url.chars().any(char::is_whitespace) {
        return false;
    }
    match reqwest::Url::parse(url) {
        Ok(parsed) => {
            matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some_and(|h| !h.is_empty())
        }
        Err(_) => false,
    }
}

fn persist(store: &FeedStore) -> bool {
    match store.save() {
        Ok(()) => true,
        Err(err) => {
            error!(store = %store.describe(), error = %err, "не удалось сохранить подписки");
            false
        }
    }
}

fn with_persist_note(store: &FeedStore, text: String) -> String {
    if persist(store) {
        text
    } else {
        format!("{text}\n⚠️ Изменение не сохранено на диск.")
    }
}

pub fn subscribe(store: &FeedStore, chat_id: i64, arg: &str) -> String {
    let url = arg.trim();
    if url.is_empty() {
        return "Использование: /rss_add &lt;url&gt;".to_string();
    }
    if !valid_feed_url(url) {
        return "Некорректный URL (поддерживаются только http и https)".to_string();
    }
    if !store.add_feed(chat_id, url) {
        return format!("Подписка уже есть:\n{}", escape(url));
    }
    with_persist_note(store, format!("Подписка оформлена:\n{}", escape(url)))
}

pub fn unsubscribe(store: &FeedStore, chat_id: i64, arg: &str) -> String {
    let url = arg.trim();
    if url.is_empty() {
        return "Использование: /rss_rm &lt;url&gt;".to_string();
    }
    if !store.remove_feed(chat_id, url) {
        return format!("Такой подписки нет:\n{}", escape(url));
    }
    with_persist_note(store, format!("Подписка удалена:\n{}", escape(url)))
}

pub fn list_html(store: &FeedStore, chat_id: i64, now_unix: i64, digest_interval_secs: u64) -> String {
    let feeds = store.list_feeds(chat_id);
    let counts = store.pending_counts(chat_id);
    let interval = i64::try_from(digest_interval_secs).unwrap_or(i64::MAX);
    let next = store.last_digest(chat_id).saturating_add(interval);
    let minutes = next.saturating_sub(now_unix).max(0) / 60;

    let mut lines = vec!["<b>Подписки на ленты</b>".to_string()];
    if feeds.is_empty() {
        lines.push("(нет)".to_string());
    }
    for url in &feeds {
        let pending = counts.get(url).copied().unwrap_or(0);
        lines.push(format!("• {} (в очереди: {pending})", escape(url)));
    }
    lines.push(format!("\nСледующий дайджест через ~{minutes} мин"));
    lines.join("\n")
}
