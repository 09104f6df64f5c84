use crate::config::TelegramConfig;
use crate::feeds;
use crate::feeds::store::FeedStore;
use crate::notify::NotificationSink;
use crate::state::CheckStateStore;
use crate::status::StatusService;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::{
    BotCommand, CallbackQuery, ChatId, InlineKeyboardButton, InlineKeyboardMarkup, Message,
    ParseMode,
};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("ошибка запроса Telegram: {0}")]
    Request(#[from] teloxide::RequestError),
}

#[derive(Clone)]
pub struct BotDeps {
    pub status: Arc<StatusService>,
    pub check_store: Arc<CheckStateStore>,
    pub feed_store: Arc<FeedStore>,
    pub sink: Arc<dyn NotificationSink>,
    pub min_consecutive: u32,
    pub digest_interval_secs: u64,
    pub feeds_enabled: bool,
}

#[derive(Clone)]
struct TelegramRuntime {
    deps: BotDeps,
    allowed_chats: HashSet<i64>,
    limiter: Arc<Mutex<RateLimiter>>,
}

impl TelegramRuntime {
    fn record_update(&self, upd: &Update) {
        self.deps
            .check_store
            .set_last_update_cursor(i64::from(upd.id));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Action {
    Start,
    Help,
    Status,
    Checks,
    RssAdd(String),
    RssRemove(String),
    RssList,
    Version,
}

impl Action {
    fn from_command(text: &str) -> Option<Self> {
        let text = text.trim();
        let (first, rest) = match text.split_once(char::is_whitespace) {
            Some((first, rest)) => (first, rest.trim()),
            None => (text, ""),
        };
        let normalized = first.split('@').next()?.to_lowercase();
        match normalized.as_str() {
            "/start" => Some(Self::Start),
            "/help" => Some(Self::Help),
            "/status" => Some(Self::Status),
            "/checks" => Some(Self::Checks),
            "/rss_add" => Some(Self::RssAdd(rest.to_string())),
            "/rss_rm" => Some(Self::RssRemove(rest.to_string())),
            "/rss_ls" => Some(Self::RssList),
            "/version" => Some(Self::Version),
            _ => None,
        }
    }

    fn from_callback(data: &str) -> Option<Self> {
        match data {
            "status" => Some(Self::Status),
            "checks" => Some(Self::Checks),
            "rss" => Some(Self::RssList),
            "help" => Some(Self::Help),
            _ => None,
        }
    }
}

struct RenderedView {
    text: String,
    keyboard: Option<InlineKeyboardMarkup>,
}

impl RenderedView {
    fn plain(text: String) -> Self {
        Self {
            text,
            keyboard: None,
        }
    }

    fn with_menu(text: String) -> Self {
        Self {
            text,
            keyboard: Some(main_menu()),
        }
    }
}

fn bot_commands() -> Vec<BotCommand> {
    vec![
        BotCommand::new("help", "Справка и быстрые кнопки"),
        BotCommand::new("status", "Текущее состояние сервера"),
        BotCommand::new("checks", "Сохранённые состояния проверок"),
        BotCommand::new("rss_add", "Подписаться на ленту"),
        BotCommand::new("rss_rm", "Отписаться от ленты"),
        BotCommand::new("rss_ls", "Список подписок"),
        BotCommand::new("version", "Версия агента"),
    ]
}

pub async fn run_bot(
    bot: Bot,
    cfg: TelegramConfig,
    deps: BotDeps,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), TelegramError> {
    let runtime = TelegramRuntime {
        deps,
        allowed_chats: cfg.allowed_chat_ids.iter().copied().collect(),
        limiter: Arc::new(Mutex::new(RateLimiter::new(cfg.rate_limit_per_minute))),
    };

    if let Err(err) = bot.set_my_commands(bot_commands()).await {
        warn!(error = %err, "не удалось установить меню команд");
    }

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(handle_message))
        .branch(Update::filter_callback_query().endpoint(handle_callback));

    let mut dispatcher = Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![runtime])
        .build();

    let mut dispatch_handle = tokio::spawn(async move {
        dispatcher.dispatch().await;
    });

    tokio::select! {
        _ = shutdown.changed() => {
            dispatch_handle.abort();
            let _ = (&mut dispatch_handle).await;
            info!("остановка Telegram-бота");
            Ok(())
        }
        result = &mut dispatch_handle => {
            match result {
                Ok(()) => Ok(()),
                Err(join_err) if join_err.is_cancelled() => Ok(()),
                Err(join_err) => {
                    warn!(error = %join_err, "задача Telegram завершилась с ошибкой");
                    Ok(())
                }
            }
        }
    }
}

async fn handle_message(
    bot: Bot,
    upd: Update,
    msg: Message,
    runtime: TelegramRuntime,
) -> ResponseResult<()> {
    runtime.record_update(&upd);
    let chat_id = msg.chat.id.0;
    if !should_handle_message(chat_id, &runtime.allowed_chats) {
        debug!(chat_id, "сообщение из чата вне списка разрешённых");
        return Ok(());
    }
    let Some(action) = msg.text().and_then(Action::from_command) else {
        return Ok(());
    };

    if !consume_rate_limit(&runtime, chat_id).await {
        bot.send_message(
            msg.chat.id,
            "Слишком много запросов. Попробуйте чуть позже.",
        )
        .await?;
        return Ok(());
    }

    let view = render_action(action, chat_id, &runtime).await;
    send_view(&bot, msg.chat.id, view).await
}

async fn handle_callback(
    bot: Bot,
    upd: Update,
    q: CallbackQuery,
    runtime: TelegramRuntime,
) -> ResponseResult<()> {
    runtime.record_update(&upd);
    let Some(data) = q.data.as_deref() else {
        return Ok(());
    };
    let Some(message) = q.message.as_ref() else {
        bot.answer_callback_query(q.id).await?;
        return Ok(());
    };

    let chat_id = message.chat.id.0;
    if !should_handle_message(chat_id, &runtime.allowed_chats) {
        bot.answer_callback_query(q.id).await?;
        return Ok(());
    }

    if !consume_rate_limit(&runtime, chat_id).await {
        bot.answer_callback_query(q.id)
            .text("Слишком много запросов. Попробуйте позже.")
            .await?;
        return Ok(());
    }

    if let Some(action) = Action::from_callback(data) {
        let view = render_action(action, chat_id, &runtime).await;
        send_view(&bot, message.chat.id, view).await?;
    }

    bot.answer_callback_query(q.id).await?;
    Ok(())
}

async fn send_view(bot: &Bot, chat_id: ChatId, view: RenderedView) -> ResponseResult<()> {
    let mut request = bot
        .send_message(chat_id, view.text)
        .parse_mode(ParseMode::Html)
        .disable_web_page_preview(true);
    if let Some(keyboard) = view.keyboard {
        request = request.reply_markup(keyboard);
    }
    request.await?;
    Ok(())
}

async fn render_action(action: Action, chat_id: i64, runtime: &TelegramRuntime) -> RenderedView {
    let deps = &runtime.deps;
    match action {
        Action::Start => RenderedView::with_menu(format!(
            "<b>tgmond</b> следит за сервером <code>{}</code>. Кнопки ниже.",
            teloxide::utils::html::escape(deps.status.host())
        )),
        Action::Help => RenderedView::with_menu(help_text()),
        Action::Status => {
            let report = deps.status.live_report().await;
            RenderedView::with_menu(deps.sink.answer_status_query(&report))
        }
        Action::Checks => RenderedView::with_menu(
            deps.status
                .checks_report(&deps.check_store, deps.min_consecutive),
        ),
        Action::Version => RenderedView::plain(format!(
            "tgmond версия: <code>{}</code>",
            env!("CARGO_PKG_VERSION")
        )),
        Action::RssAdd(_) | Action::RssRemove(_) | Action::RssList if !deps.feeds_enabled => {
            RenderedView::plain("Модуль лент выключен в конфигурации.".to_string())
        }
        Action::RssAdd(url) => {
            RenderedView::plain(feeds::subscribe(&deps.feed_store, chat_id, &url))
        }
        Action::RssRemove(url) => {
            RenderedView::plain(feeds::unsubscribe(&deps.feed_store, chat_id, &url))
        }
        Action::RssList => RenderedView::with_menu(feeds::list_html(
            &deps.feed_store,
            chat_id,
            crate::now_unix(),
            deps.digest_interval_secs,
        )),
    }
}

fn main_menu() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![
            InlineKeyboardButton::callback("Состояние", "status"),
            InlineKeyboardButton::callback("Проверки", "checks"),
        ],
        vec![
            InlineKeyboardButton::callback("Ленты", "rss"),
            InlineKeyboardButton::callback("Помощь", "help"),
        ],
    ])
}

fn help_text() -> String {
    [
        "<b>Команды</b>",
        "• /status - текущее состояние сервера",
        "• /checks - сохранённые состояния проверок",
        "• /rss_add &lt;url&gt; - подписаться на ленту",
        "• /rss_rm &lt;url&gt; - отписаться от ленты",
        "• /rss_ls - подписки и время до дайджеста",
        "• /version - версия агента",
    ]
    .join("\n")
}

async fn consume_rate_limit(runtime: &TelegramRuntime, chat_id: i64) -> bool {
    let now = crate::now_unix();
    let mut limiter = runtime.limiter.lock().await;
    limiter.allow(chat_id, now)
}

/// Пустой список разрешённых чатов закрывает бота для всех.
pub fn should_handle_message(chat_id: i64, allowed: &HashSet<i64>) -> bool {
    allowed.contains(&chat_id)
}

#[derive(Debug)]
struct RateLimiter {
    limit_per_minute: u32,
    timestamps_by_chat: HashMap<i64, VecDeque<i64>>,
}

impl RateLimiter {
    fn new(limit_per_minute: u32) -> Self {
        Self {
            limit_per_minute,
            timestamps_by_chat: HashMap::new(),
        }
    }

    fn allow(&mut self, chat_id: i64, now_unix: i64) -> bool {
        let queue = self.timestamps_by_chat.entry(chat_id).or_default();
        while let Some(ts) = queue.front().copied() {
            if now_unix - ts >= 60 {
                queue.pop_front();
            } else {
                break;
            }
        }

        if queue.len() >= self.limit_per_minute as usize {
            return false;
        }

        queue.push_back(now_unix);
        true
    }
}
