mod config;
mod engine;
mod evaluator;
mod feeds;
mod http;
mod lock;
mod metrics;
mod modules;
mod notify;
mod render;
mod scheduler;
mod snapshot;
mod source;
mod state;
mod status;
mod storage;
mod telegram;

use axum::serve;
use clap::Parser;
use config::Config;
use feeds::store::FeedStore;
use metrics::Metrics;
use modules::AppContext;
use notify::{LogSink, NotificationSink, TelegramSink};
use reqwest::Client;
use state::CheckStateStore;
use status::StatusService;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use storage::DocumentKind;
use sysinfo::SystemExt;
use teloxide::utils::html::escape;
use teloxide::Bot;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tgmond")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    #[arg(long, conflicts_with = "telegram_off")]
    telegram_on: bool,
    #[arg(long, conflicts_with = "telegram_on")]
    telegram_off: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let mut cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "не удалось загрузить конфигурацию");
            std::process::exit(1);
        }
    };
    if cli.telegram_on {
        cfg.telegram.enabled = true;
    } else if cli.telegram_off {
        cfg.telegram.enabled = false;
    }

    let telegram_token = if cfg.telegram.enabled {
        match ensure_telegram_settings(&cfg) {
            Ok(token) => Some(token),
            Err(err) => {
                error!(error = %err, "не удалось подготовить настройки Telegram");
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    let instance_lock = match lock::acquire_exclusive_lock(&cfg.lock_file) {
        Ok(l) => l,
        Err(err) => {
            error!(error = %err, "второй экземпляр не запускается");
            std::process::exit(1);
        }
    };

    let host = host_name();
    info!(
        listen = %cfg.listen,
        lock = %instance_lock.path().display(),
        host = %host,
        modules = ?cfg.modules,
        source = ?cfg.monitor.source,
        "запуск tgmond"
    );

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "не удалось инициализировать метрики");
            std::process::exit(1);
        }
    };

    let check_store = match storage::open_backend(&cfg.storage, DocumentKind::CheckState)
        .and_then(CheckStateStore::open)
    {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!(error = %err, "не удалось открыть хранилище состояний");
            std::process::exit(1);
        }
    };
    let feed_store = match storage::open_backend(&cfg.storage, DocumentKind::Feeds)
        .and_then(FeedStore::open)
    {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!(error = %err, "не удалось открыть хранилище лент");
            std::process::exit(1);
        }
    };
    info!(
        checks = %check_store.describe(),
        feeds = %feed_store.describe(),
        known_checks = check_store.len(),
        "хранилища открыты"
    );

    let client = Client::builder()
        .user_agent(concat!("tgmond/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| Client::new());
    let source = source::build_source(&cfg.monitor, client.clone());

    let telegram_bot = telegram_token.map(Bot::new);
    let sink: Arc<dyn NotificationSink> = match &telegram_bot {
        Some(bot) => Arc::new(TelegramSink::new(
            bot.clone(),
            cfg.telegram.alert_targets(),
            host.clone(),
        )),
        None => Arc::new(LogSink::new(host.clone())),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let listen = cfg.listen.clone();
        let http_state = http::HttpAppState {
            metrics: metrics.clone(),
            check_store: check_store.clone(),
            host: host.clone(),
            min_consecutive: cfg.monitor.alert_min_consecutive,
        };
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(http_state);
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "некорректный адрес listen");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "не удалось запустить HTTP-сервер");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "ошибка HTTP-сервера");
            }
        })
    };

    let telegram_task = if let Some(bot) = telegram_bot {
        let deps = telegram::BotDeps {
            status: Arc::new(StatusService::new(
                source.clone(),
                cfg.monitor.thresholds.clone(),
                cfg.monitor.fetch_timeout(),
                host.clone(),
            )),
            check_store: check_store.clone(),
            feed_store: feed_store.clone(),
            sink: sink.clone(),
            min_consecutive: cfg.monitor.alert_min_consecutive,
            digest_interval_secs: cfg.feeds.digest_interval_secs,
            feeds_enabled: cfg.module_enabled("feeds"),
        };
        let telegram_cfg = cfg.telegram.clone();
        let shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            if let Err(err) = telegram::run_bot(bot, telegram_cfg, deps, shutdown).await {
                error!(error = %err, "ошибка задачи Telegram");
            }
        }))
    } else {
        None
    };

    let ctx = AppContext {
        cfg: cfg.clone(),
        host: host.clone(),
        metrics: metrics.clone(),
        http_client: client,
        check_store: check_store.clone(),
        feed_store: feed_store.clone(),
        source,
        sink: sink.clone(),
        shutdown: shutdown_rx.clone(),
    };
    let module_tasks = modules::start_enabled(&ctx);

    if let Err(err) = sink
        .broadcast_html(&lifecycle_notice(&host, "запущен", &cfg.modules))
        .await
    {
        warn!(error = %err, "не удалось отправить уведомление о запуске");
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "не удалось дождаться Ctrl+C");
    }
    info!("получен Ctrl+C, выполняется остановка");

    let _ = shutdown_tx.send(true);

    for task in module_tasks {
        let _ = task.await;
    }
    if let Err(err) = check_store.save() {
        error!(error = %err, "не удалось сохранить состояние проверок при остановке");
    }
    if let Err(err) = feed_store.save() {
        error!(error = %err, "не удалось сохранить состояние лент при остановке");
    }

    if let Err(err) = sink
        .broadcast_html(&lifecycle_notice(&host, "остановлен", &cfg.modules))
        .await
    {
        warn!(error = %err, "не удалось отправить уведомление об остановке");
    }

    if let Some(task) = telegram_task {
        let _ = task.await;
    }
    let _ = http_task.await;
    drop(instance_lock);
    info!("tgmond остановлен");
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub(crate) fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn host_name() -> String {
    sysinfo::System::new()
        .host_name()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn lifecycle_notice(host: &str, what: &str, modules: &[String]) -> String {
    format!(
        "<b>tgmond {what}</b> на <code>{}</code>\nМодули: {}",
        escape(host),
        escape(&modules.join(", "))
    )
}

fn resolve_telegram_token_from_env(env_name: &str) -> Option<String> {
    if let Ok(v) = std::env::var(env_name) {
        if !v.trim().is_empty() {
            return Some(v.trim().to_string());
        }
    }
    None
}

fn ensure_telegram_settings(cfg: &Config) -> Result<String, String> {
    let env_name = cfg.telegram.bot_token_env.clone();
    let env_token = resolve_telegram_token_from_env(&env_name);
    let cfg_token = cfg
        .telegram
        .bot_token
        .as_ref()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    if cfg.telegram.allowed_chat_ids.is_empty() {
        return Err(
            "telegram.allowed_chat_ids пуст: укажите хотя бы один chat id в config".to_string(),
        );
    }

    if let Some(v) = env_token {
        return Ok(v);
    }
    if let Some(v) = cfg_token {
        return Ok(v);
    }

    Err(format!(
        "не найден токен Telegram: задайте '{}' в окружении или telegram.bot_token в config",
        env_name
    ))
}
