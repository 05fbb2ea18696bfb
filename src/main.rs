//! Hogar - 终端聊天客户端
//!
//! 入口：初始化日志与配置、恢复会话身份、打开存储与回调订阅，然后运行行式聊天循环。
//! 输入普通文本发送消息；`/voice <文件> <秒数>` 发送语音；`/quit` 退出。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use hogar::config::{load_config, AppConfig};
use hogar::core::{
    ChatOrchestrator, IdentityFile, OrchestratorOptions, SessionContext, SessionIdentity, UiState,
};
use hogar::delivery::{create_callback_queue, CallbackDelivery, CallbackQueue, DeliveryConfig};
use hogar::memory::{FileWaitingFlags, Role};
use hogar::store::create_session_store;
use hogar::worker::{ChatWorker, HttpWorker, MockWorker, VoicePayload};
use tokio::io::{AsyncBufReadExt, BufReader};

enum Input {
    Empty,
    Quit,
    Text(String),
    Voice { path: PathBuf, seconds: f64 },
    Invalid(&'static str),
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    if line == "/quit" {
        return Input::Quit;
    }
    if let Some(rest) = line.strip_prefix("/voice") {
        let mut parts = rest.split_whitespace();
        let (Some(path), Some(seconds)) = (parts.next(), parts.next()) else {
            return Input::Invalid("usage: /voice <file> <seconds>");
        };
        return match seconds.parse::<f64>() {
            Ok(seconds) if seconds > 0.0 => Input::Voice {
                path: PathBuf::from(path),
                seconds,
            },
            _ => Input::Invalid("seconds must be a positive number"),
        };
    }
    Input::Text(line.to_string())
}

fn mime_for(path: &std::path::Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("ogg") => "audio/ogg",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("m4a") => "audio/mp4",
        _ => "audio/webm",
    }
}

/// 打印自上次以来新增的消息与结果集
fn print_new(ui: &UiState, printed_messages: &mut usize, printed_sets: &mut usize) {
    for set in ui.property_sets.iter().skip(*printed_sets) {
        for property in &set.properties {
            let title = property.title.as_deref().unwrap_or("(sin título)");
            let city = property.city.as_deref().unwrap_or("-");
            match property.price {
                Some(price) => println!("    · {} | {} | {:.0} €", title, city, price),
                None => println!("    · {} | {}", title, city),
            }
        }
    }
    *printed_sets = ui.property_sets.len();

    for message in ui.messages.iter().skip(*printed_messages) {
        let who = match message.role {
            Role::User => "Tú",
            Role::Assistant => "Asistente",
            Role::Error => "Error",
        };
        println!("{}: {}", who, message.content);
    }
    *printed_messages = ui.messages.len();
}

fn create_worker(cfg: &AppConfig) -> anyhow::Result<Arc<dyn ChatWorker>> {
    if cfg.worker.endpoint.trim().is_empty() {
        tracing::warn!("No worker endpoint configured, using Mock worker");
        return Ok(Arc::new(MockWorker::new()));
    }
    let worker = HttpWorker::from_config(&cfg.worker).context("Failed to build HTTP worker client")?;
    tracing::info!("Using HTTP worker at {}", cfg.worker.endpoint);
    Ok(Arc::new(worker))
}

#[cfg(feature = "realtime")]
fn with_realtime(queue: Arc<dyn CallbackQueue>, cfg: &AppConfig) -> Arc<dyn CallbackQueue> {
    match cfg.delivery.realtime_url.as_deref() {
        Some(url) if !url.is_empty() => {
            tracing::info!("Realtime push enabled: {}", url);
            Arc::new(hogar::delivery::RealtimeCallbackQueue::new(queue, url))
        }
        _ => queue,
    }
}

#[cfg(not(feature = "realtime"))]
fn with_realtime(queue: Arc<dyn CallbackQueue>, cfg: &AppConfig) -> Arc<dyn CallbackQueue> {
    if cfg.delivery.realtime_url.is_some() {
        tracing::warn!("realtime_url set but realtime feature not enabled, polling only");
    }
    queue
}

/// 发送与回调都算活动，刷新会话身份的最近活动时间
fn record_activity(file: &IdentityFile, identity: &mut SessionIdentity) {
    if let Err(e) = file.touch(identity, Utc::now()) {
        tracing::warn!("Failed to save session identity: {:#}", e);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hogar::observability::init();

    let cfg = load_config(None).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let data_dir = cfg.app.data_dir.clone();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data dir {}", data_dir.display()))?;

    let identity_file = IdentityFile::new(data_dir.join("session.json"));
    let mut identity = identity_file
        .resume(Utc::now(), Duration::from_secs(cfg.app.session_inactivity_secs))
        .context("Failed to resume session identity")?;

    let db_path = cfg.store.database_path.as_deref();
    let store = create_session_store(db_path).await;
    let queue = with_realtime(create_callback_queue(db_path).await, &cfg);
    let flags = Arc::new(FileWaitingFlags::new(data_dir.join("waiting_flags.json")));

    let context = SessionContext::new(identity.session_id.clone())
        .with_client(
            std::env::var("HOGAR_CLIENT_ADDRESS").ok(),
            Some(format!("hogar-cli/{}", env!("CARGO_PKG_VERSION"))),
        )
        .with_language(cfg.app.language.clone());

    let orchestrator = Arc::new(ChatOrchestrator::new(
        context,
        create_worker(&cfg)?,
        store,
        flags,
        OrchestratorOptions {
            debounce: Duration::from_millis(cfg.persistence.debounce_ms),
        },
    ));
    orchestrator.load().await.context("Failed to load session history")?;

    let delivery = Arc::new(CallbackDelivery::new(queue, DeliveryConfig::from(&cfg.delivery)));
    let mut subscription = delivery.subscribe(orchestrator.session_id()).await;
    tracing::info!(
        "Session {} ready (push: {})",
        orchestrator.session_id(),
        subscription.is_push_active()
    );

    let mut state_rx = orchestrator.subscribe_state();
    let (mut printed_messages, mut printed_sets) = (0, 0);
    print_new(&state_rx.borrow_and_update(), &mut printed_messages, &mut printed_sets);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                match parse_input(&line) {
                    Input::Empty => {}
                    Input::Quit => break,
                    Input::Invalid(hint) => eprintln!("{}", hint),
                    Input::Text(text) => {
                        record_activity(&identity_file, &mut identity);
                        let orchestrator = Arc::clone(&orchestrator);
                        tokio::spawn(async move {
                            if let Err(e) = orchestrator.send_message(&text).await {
                                tracing::warn!("Send failed: {}", e);
                            }
                        });
                    }
                    Input::Voice { path, seconds } => {
                        let bytes = match tokio::fs::read(&path).await {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                eprintln!("cannot read {}: {}", path.display(), e);
                                continue;
                            }
                        };
                        record_activity(&identity_file, &mut identity);
                        let audio = VoicePayload::new(bytes, mime_for(&path));
                        let orchestrator = Arc::clone(&orchestrator);
                        tokio::spawn(async move {
                            if let Err(e) = orchestrator.send_voice_message(audio, seconds).await {
                                tracing::warn!("Voice send failed: {}", e);
                            }
                        });
                    }
                }
            }
            record = subscription.recv() => match record {
                Some(record) => {
                    record_activity(&identity_file, &mut identity);
                    orchestrator.on_callback(&record).await;
                }
                None => {
                    tracing::warn!("Callback subscription ended");
                    break;
                }
            },
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let ui = state_rx.borrow_and_update().clone();
                print_new(&ui, &mut printed_messages, &mut printed_sets);
            }
        }
    }

    subscription.close().await;
    orchestrator.shutdown().await;
    Ok(())
}
