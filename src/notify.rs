use crate::engine::TransitionEvent;
use crate::render;
use crate::status::StatusReport;
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("ошибка запроса Telegram: {0}")]
    Telegram(#[from] teloxide::RequestError),
    #[error("доставлено {delivered} из {total} сообщений")]
    Partial { delivered: usize, total: usize },
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify_events(&self, events: &[TransitionEvent]) -> Result<(), NotifyError>;

    async fn broadcast_html(&self, text: &str) -> Result<(), NotifyError>;

    async fn send_html(&self, chat_id: i64, text: &str) -> Result<(), NotifyError>;

    fn answer_status_query(&self, report: &StatusReport) -> String {
        report.render_html()
    }
}

pub struct TelegramSink {
    bot: Bot,
    targets: Vec<i64>,
    host: String,
}

impl TelegramSink {
    pub fn new(bot: Bot, targets: Vec<i64>, host: String) -> Self {
        Self { bot, targets, host }
    }
}

#[async_trait]
impl NotificationSink for TelegramSink {
    async fn notify_events(&self, events: &[TransitionEvent]) -> Result<(), NotifyError> {
        if events.is_empty() {
            return Ok(());
        }
        self.broadcast_html(&render::events_html(&self.host, events))
            .await
    }

    async fn broadcast_html(&self, text: &str) -> Result<(), NotifyError> {
        let mut delivered = 0_usize;
        for chat_id in &self.targets {
            match self.send_html(*chat_id, text).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(chat_id = *chat_id, error = %err, "не удалось отправить уведомление");
                }
            }
        }
        if delivered < self.targets.len() {
            return Err(NotifyError::Partial {
                delivered,
                total: self.targets.len(),
            });
        }
        Ok(())
    }

    async fn send_html(&self, chat_id: i64, text: &str) -> Result<(), NotifyError> {
        self.bot
            .send_message(ChatId(chat_id), text)
            .parse_mode(ParseMode::Html)
            .disable_web_page_preview(true)
            .await?;
        Ok(())
    }
}

pub struct LogSink {
    host: String,
}

impl LogSink {
    pub fn new(host: String) -> Self {
        Self { host }
    }
}

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify_events(&self, events: &[TransitionEvent]) -> Result<(), NotifyError> {
        for e in events {
            info!(
                host = %self.host,
                check = %e.check_id,
                kind = e.kind.as_str(),
                value = e.result.value,
                "{}",
                e.result.message
            );
        }
        Ok(())
    }

    async fn broadcast_html(&self, text: &str) -> Result<(), NotifyError> {
        info!(host = %self.host, "{text}");
        Ok(())
    }

    async fn send_html(&self, chat_id: i64, text: &str) -> Result<(), NotifyError> {
        info!(chat_id, "{text}");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub batches: Mutex<Vec<Vec<TransitionEvent>>>,
        pub messages: Mutex<Vec<(Option<i64>, String)>>,
        pub fail: AtomicBool,
        pub max_len: AtomicUsize,
        pub accept_only: Mutex<Option<usize>>,
    }

    impl RecordingSink {
        fn check(&self) -> Result<(), NotifyError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(NotifyError::Partial {
                    delivered: 0,
                    total: 1,
                });
            }
            Ok(())
        }

        fn check_message(&self, text: &str) -> Result<(), NotifyError> {
            self.check()?;
            let max_len = self.max_len.load(Ordering::SeqCst);
            let too_long = max_len > 0 && text.encode_utf16().count() > max_len;
            let mut accept_only = self.accept_only.lock().unwrap();
            let exhausted = match accept_only.as_mut() {
                Some(0) => true,
                Some(left) => {
                    *left -= 1;
                    false
                }
                None => false,
            };
            if too_long || exhausted {
                return Err(NotifyError::Partial {
                    delivered: 0,
                    total: 1,
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn notify_events(&self, events: &[TransitionEvent]) -> Result<(), NotifyError> {
            self.check()?;
            self.batches.lock().unwrap().push(events.to_vec());
            Ok(())
        }

        async fn broadcast_html(&self, text: &str) -> Result<(), NotifyError> {
            self.check()?;
            self.messages.lock().unwrap().push((None, text.to_string()));
            Ok(())
        }

        async fn send_html(&self, chat_id: i64, text: &str) -> Result<(), NotifyError> {
            self.check_message(text)?;
            self.messages
                .lock()
                .unwrap()
                .push((Some(chat_id), text.to_string()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn log_sink_never_fails() {
        let sink = LogSink::new("host".to_string());
        sink.notify_events(&[]).await.expect("ok");
        sink.broadcast_html("<b>x</b>").await.expect("ok");
        sink.send_html(1, "x").await.expect("ok");
    }
}
