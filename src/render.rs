use crate::engine::{EventKind, TransitionEvent};
use crate::evaluator::{fmt_pct, CheckKind, CheckResult, CheckStatus};
use crate::feeds::store::FeedItem;
use crate::state::{CheckState, StateStatus};
use std::time::{Duration, UNIX_EPOCH};
use teloxide::utils::html::escape;

pub fn bar(fraction: f64, width: usize) -> String {
    let fraction = if fraction.is_finite() {
        fraction.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let filled = (fraction * width as f64).round() as usize;
    "█".repeat(filled) + &"░".repeat(width - filled)
}

fn decorate(result: &CheckResult) -> String {
    let pct = format!("{:.0}%", result.value * 100.0);
    let mount = escape(result.mount().unwrap_or("?"));
    let line = match result.kind() {
        CheckKind::Cpu => format!("CPU {pct}"),
        CheckKind::Mem => format!("RAM занято {pct}"),
        CheckKind::Disk => format!("{mount}: {pct}"),
        CheckKind::Inode => format!("inode {mount}: свободно {pct}"),
    };
    format!("{line} {}", bar(result.value, 10))
}

fn status_emoji(status: CheckStatus) -> &'static str {
    match status {
        CheckStatus::Alert => "🔴",
        CheckStatus::Ok => "🟢",
    }
}

pub fn events_html(host: &str, events: &[TransitionEvent]) -> String {
    let mut lines = vec![format!("<b>Мониторинг сервера: {}</b>", escape(host))];
    for (kind, title) in [
        (EventKind::Alert, "🔴 <b>АЛЕРТ</b>"),
        (EventKind::Recovered, "🟢 <b>ВОССТАНОВЛЕНО</b>"),
    ] {
        let section: Vec<String> = events
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| format!("• {}", decorate(&e.result)))
            .collect();
        if !section.is_empty() {
            lines.push(format!("\n{title}"));
            lines.extend(section);
        }
    }
    lines.join("\n")
}

pub fn status_html(host: &str, timestamp_unix: i64, results: &[CheckResult]) -> String {
    let mut lines = vec![
        format!("<b>Состояние сервера: {}</b>", escape(host)),
        format!("<i>{}</i>", format_unix(timestamp_unix)),
    ];

    for r in results.iter().filter(|r| r.kind() == CheckKind::Cpu) {
        lines.push(format!("\n<b>CPU</b> {}\n{}", status_emoji(r.status), escape(&r.message)));
    }
    for r in results.iter().filter(|r| r.kind() == CheckKind::Mem) {
        lines.push(format!("\n<b>Память</b> {}\n{}", status_emoji(r.status), decorate(r)));
    }
    for (kind, title) in [(CheckKind::Disk, "Диски"), (CheckKind::Inode, "Inode")] {
        let group: Vec<&CheckResult> = results.iter().filter(|r| r.kind() == kind).collect();
        if group.is_empty() {
            continue;
        }
        let worst = if group.iter().any(|r| r.is_alert()) {
            CheckStatus::Alert
        } else {
            CheckStatus::Ok
        };
        lines.push(format!("\n<b>{title}</b> {}", status_emoji(worst)));
        lines.extend(group.iter().map(|r| format!("• {}", decorate(r))));
    }

    if results.is_empty() {
        lines.push("\nНет данных для проверок.".to_string());
    }
    lines.join("\n")
}

pub fn status_unavailable_html(host: &str, reason: &str) -> String {
    format!(
        "<b>Состояние сервера: {}</b>\nСостояние недоступно: не удалось получить замер.\n<i>{}</i>",
        escape(host),
        escape(reason)
    )
}

pub fn checks_html(host: &str, states: &[(String, CheckState)], min_consecutive: u32) -> String {
    let mut lines = vec![format!("<b>Проверки: {}</b>", escape(host))];
    if states.is_empty() {
        lines.push("Пока нет ни одного наблюдения.".to_string());
        return lines.join("\n");
    }
    for (id, state) in states {
        let emoji = match state.status {
            StateStatus::Alert if state.consecutive >= min_consecutive => "🔴",
            StateStatus::Alert => "🟠",
            StateStatus::Ok => "🟢",
            StateStatus::Unknown => "⚪",
        };
        let value = state.last_value.map(fmt_pct).unwrap_or_else(|| "н/д".to_string());
        let seen = state
            .last_ts
            .map(format_unix)
            .unwrap_or_else(|| "н/д".to_string());
        lines.push(format!(
            "{emoji} <code>{}</code> {value} (подряд: {}, {seen})",
            escape(id),
            state.consecutive
        ));
    }
    lines.join("\n")
}

pub const MESSAGE_LIMIT: usize = 4096;
const LINE_LIMIT: usize = 1024;
const TITLE_LIMIT: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestPart {
    pub html: String,
    pub item_ids: Vec<(String, String)>,
}

struct DigestWriter {
    parts: Vec<DigestPart>,
    html: String,
    item_ids: Vec<(String, String)>,
}

impl DigestWriter {
    fn new(header: String) -> Self {
        Self {
            parts: Vec::new(),
            html: header,
            item_ids: Vec::new(),
        }
    }

    fn push(&mut self, line: &str, heading: &str, item: Option<(&str, &str)>) {
        if tg_len(&self.html) + 1 + tg_len(line) > MESSAGE_LIMIT {
            let html = std::mem::take(&mut self.html);
            let item_ids = std::mem::take(&mut self.item_ids);
            self.parts.push(DigestPart { html, item_ids });
            if item.is_some() && !heading.is_empty() {
                self.html = heading.trim_start().to_string();
            }
        }
        if self.html.is_empty() {
            self.html.push_str(line.trim_start());
        } else {
            self.html.push('\n');
            self.html.push_str(line);
        }
        if let Some((url, id)) = item {
            self.item_ids.push((url.to_string(), id.to_string()));
        }
    }

    fn finish(mut self) -> Vec<DigestPart> {
        if !self.html.is_empty() {
            self.parts.push(DigestPart {
                html: self.html,
                item_ids: self.item_ids,
            });
        }
        self.parts
    }
}

fn tg_len(text: &str) -> usize {
    text.encode_utf16().count()
}

fn clip(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}

fn digest_line(it: &FeedItem) -> String {
    let title = if it.title.trim().is_empty() {
        "(без заголовка)".to_string()
    } else {
        escape(&clip(it.title.trim(), TITLE_LIMIT))
    };
    let mut line = format!("• <a href=\"{}\">{title}</a>", escape(&it.link));
    if !it.author.is_empty() {
        line.push_str(&format!(", {}", escape(&clip(&it.author, 64))));
    }
    if it.published_ts > 0 {
        line.push_str(&format!(" ({})", format_unix(it.published_ts)));
    }
    if tg_len(&line) > LINE_LIMIT {
        line = format!("• {title}");
    }
    line
}

/// Дайджест по лентам, разбитый на сообщения не длиннее `MESSAGE_LIMIT`.
/// Пустой вектор, если выводить нечего.
pub fn digest_html(
    host: &str,
    now_unix: i64,
    by_feed: &[(String, Vec<FeedItem>)],
    items_per_feed: usize,
    max_total: usize,
) -> Vec<DigestPart> {
    let mut writer = DigestWriter::new(format!(
        "<b>Дайджест лент: {}</b>\n<i>{}</i>",
        escape(host),
        format_unix(now_unix)
    ));
    let mut total = 0_usize;

    for (url, items) in by_feed {
        if items.is_empty() {
            continue;
        }
        if total >= max_total {
            break;
        }
        let mut items: Vec<&FeedItem> = items.iter().collect();
        items.sort_by_key(|it| it.published_ts);
        let cap = items.len().min(items_per_feed).min(max_total - total);

        let heading = format!("\n<b>{}</b>", escape(&clip(url, 200)));
        writer.push(&heading, "", None);
        for it in &items[..cap] {
            writer.push(&digest_line(it), &heading, Some((url.as_str(), it.id.as_str())));
        }
        total += cap;
        let more = items.len() - cap;
        if more > 0 {
            writer.push(&format!("(+{more} ещё)"), "", None);
        }
    }

    if total == 0 {
        return Vec::new();
    }
    writer.finish()
}

pub fn format_unix(ts: i64) -> String {
    let st = UNIX_EPOCH + Duration::from_secs(ts.max(0) as u64);
    humantime::format_rfc3339_seconds(st).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::CheckMeta;

    fn disk(mount: &str, value: f64, status: CheckStatus) -> CheckResult {
        CheckResult {
            check_id: format!("disk:{mount}"),
            status,
            value,
            message: String::new(),
            meta: CheckMeta::Disk {
                mount: mount.to_string(),
                fstype: "ext4".to_string(),
                device: "/dev/sda1".to_string(),
                size_bytes: 100,
                avail_bytes: 10,
            },
        }
    }

    fn item(title: &str, ts: i64) -> FeedItem {
        FeedItem {
            id: title.to_string(),
            title: title.to_string(),
            link: format!("https://example.org/{title}"),
            author: String::new(),
            published_ts: ts,
        }
    }

    #[test]
    fn bar_is_clamped() {
        assert_eq!(bar(0.5, 4), "██░░");
        assert_eq!(bar(2.0, 3), "███");
        assert_eq!(bar(f64::NAN, 2), "░░");
    }

    #[test]
    fn events_grouped_alerts_first() {
        let events = vec![
            TransitionEvent {
                kind: EventKind::Recovered,
                check_id: "disk:/".to_string(),
                result: disk("/", 0.5, CheckStatus::Ok),
            },
            TransitionEvent {
                kind: EventKind::Alert,
                check_id: "disk:/data".to_string(),
                result: disk("/data", 0.9, CheckStatus::Alert),
            },
        ];
        let html = events_html("web<1>", &events);
        assert!(html.starts_with("<b>Мониторинг сервера: web&lt;1&gt;</b>"));
        let alert_at = html.find("АЛЕРТ").unwrap();
        let recovered_at = html.find("ВОССТАНОВЛЕНО").unwrap();
        assert!(alert_at < recovered_at);
        assert!(html.contains("/data: 90%"));
    }

    #[test]
    fn digest_caps_per_feed_and_total() {
        let feeds = vec![
            (
                "https://a.example/feed".to_string(),
                vec![item("a3", 3), item("a1", 1), item("a2", 2)],
            ),
            ("https://b.example/feed".to_string(), vec![item("b1", 1), item("b2", 2)]),
        ];
        let parts = digest_html("host", 0, &feeds, 2, 3);
        assert_eq!(parts.len(), 1);
        let html = &parts[0].html;
        assert_eq!(parts[0].item_ids.len(), 3);
        assert!(html.contains("a1"));
        assert!(html.contains("a2"));
        assert!(!html.contains(">a3<"));
        assert!(html.contains("(+1 ещё)"));
        assert!(html.contains(">b1<"));
        assert!(!html.contains(">b2<"));
        assert!(html.find("a1").unwrap() < html.find("a2").unwrap());
    }

    #[test]
    fn empty_digest_is_none() {
        let feeds = vec![("https://a.example/feed".to_string(), Vec::new())];
        assert!(digest_html("host", 0, &feeds, 5, 40).is_empty());
    }

    #[test]
    fn checks_report_marks_pending_alerts() {
        let states = vec![(
            "mem".to_string(),
            CheckState {
                status: StateStatus::Alert,
                consecutive: 1,
                last_value: Some(0.95),
                last_ts: Some(0),
                message: String::new(),
            },
        )];
        let html = checks_html("host", &states, 3);
        assert!(html.contains("🟠 <code>mem</code> 95.0%"));
    }

    fn long_item(feed: usize, n: usize) -> FeedItem {
        FeedItem {
            id: format!("{feed}-{n}"),
            title: format!("Подробный разбор релиза номер {n} с длинным заголовком ленты {feed}"),
            link: format!("https://news{feed}.example.org/2026/10/18/very-long-article-slug-{n}?utm_source=rss&utm_medium=feed"),
            author: "Редакция".to_string(),
            published_ts: 1_700_000_000 + n as i64,
        }
    }

    #[test]
    fn large_digest_is_split_within_message_limit() {
        let feeds: Vec<(String, Vec<FeedItem>)> = (0..8)
            .map(|f| {
                (
                    format!("https://news{f}.example.org/feed.xml"),
                    (0..5).map(|n| long_item(f, n)).collect(),
                )
            })
            .collect();
        let parts = digest_html("host", 0, &feeds, 5, 40);
        assert!(parts.len() > 1);
        assert!(parts.iter().all(|p| p.html.encode_utf16().count() <= MESSAGE_LIMIT));
        let ids: usize = parts.iter().map(|p| p.item_ids.len()).sum();
        assert_eq!(ids, 40);
        assert!(parts[1].html.starts_with("<b>https://news"));
    }

    #[test]
    fn oversized_title_is_clipped() {
        let mut it = item("x", 1);
        it.title = "я".repeat(5000);
        it.link = format!("https://example.org/{}", "a".repeat(3000));
        let feeds = vec![("https://a.example/feed".to_string(), vec![it])];
        let parts = digest_html("host", 0, &feeds, 5, 40);
        assert_eq!(parts.len(), 1);
        assert!(parts[0].html.encode_utf16().count() <= MESSAGE_LIMIT);
        assert!(parts[0].html.contains("…"));
    }
}
