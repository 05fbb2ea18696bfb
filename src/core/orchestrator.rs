//! 对话编排器：状态机主控
//!
//! 负责：乐观追加本地消息、发出请求并根据同步响应切换状态、
//! 分发投递层送来的回调、维护等待标志与去抖回写，并把一切投影到 UiState（watch 通道）。
//!
//! 内部状态由一把 tokio Mutex 保护；等待 worker 响应期间不持锁，回调可以并发到达。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex};

use super::debounce::DebouncedWriter;
use super::error::ChatError;
use super::session::SessionContext;
use super::state::{ChatState, RecordingState, UiState};
use crate::delivery::{extract_text, CallbackPayload, CallbackRecord};
use crate::memory::{
    load_history, ConversationMemory, Message, PropertyRecord, PropertySet, WaitingFlagStore,
};
use crate::store::{append_property_set, SessionPatch, SessionRecordStore};
use crate::worker::{ChatRequest, ChatWorker, MessageKind, VoicePayload, WorkerReply};

const SEND_FAILED_TEXT: &str =
    "Lo siento, no he podido enviar tu mensaje. Por favor, inténtalo de nuevo.";
const NO_RESULTS_TEXT: &str =
    "No he encontrado propiedades con esos criterios. ¿Quieres ajustar los filtros?";
const SEARCH_STARTED_TEXT: &str = "Estoy buscando propiedades que encajen con lo que me pides...";
const MALFORMED_CALLBACK_TEXT: &str =
    "Ha ocurrido un problema al procesar los resultados de la búsqueda.";

fn results_summary(count: usize) -> String {
    if count == 1 {
        "He encontrado 1 propiedad que coincide con tu búsqueda.".to_string()
    } else {
        format!("He encontrado {} propiedades que coinciden con tu búsqueda.", count)
    }
}

/// 编排器参数
#[derive(Clone, Debug)]
pub struct OrchestratorOptions {
    pub debounce: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1000),
        }
    }
}

struct Inner {
    chat: ChatState,
    recording: RecordingState,
    /// 展示用时间线（可能包含同地址其它会话的历史）
    timeline: ConversationMemory,
    /// 当前会话自己的消息，回写只用这一份
    own_messages: Vec<Message>,
    /// 已进入后台搜索、尚未收到结束回调
    search_pending: bool,
    /// 同步响应还在路上时已经收到了结束回调：迟到的 search_started 不再进入等待
    completed_in_flight: bool,
    /// 本次发送开始时已有搜索在等待
    pending_at_send: bool,
    record_ready: bool,
    title: Option<String>,
}

impl Inner {
    fn new() -> Self {
        Self {
            chat: ChatState::Idle,
            recording: RecordingState::Idle,
            timeline: ConversationMemory::new(),
            own_messages: Vec::new(),
            search_pending: false,
            completed_in_flight: false,
            pending_at_send: false,
            record_ready: false,
            title: None,
        }
    }

    fn append(&mut self, message: Message) {
        self.own_messages.push(message.clone());
        self.timeline.push(message);
    }

    fn project(&self) -> UiState {
        UiState {
            chat: self.chat,
            recording: self.recording,
            messages: self.timeline.messages().to_vec(),
            property_sets: self.timeline.property_sets().to_vec(),
            title: self.title.clone(),
        }
    }

    /// 结束等待；同步响应未返回时只做记号
    fn finish_search(&mut self) {
        self.search_pending = false;
        match self.chat {
            // 结束的是发送前就在等的旧搜索，与在途请求无关
            ChatState::AwaitingReply if self.pending_at_send => self.pending_at_send = false,
            ChatState::AwaitingReply => self.completed_in_flight = true,
            ChatState::AwaitingCallback => self.chat = ChatState::Idle,
            ChatState::Idle => {}
        }
    }

    /// 同步响应/传输失败后回落的状态
    fn settle(&mut self, search_started: bool) {
        if search_started && !self.completed_in_flight {
            self.search_pending = true;
        }
        self.chat = if self.search_pending {
            ChatState::AwaitingCallback
        } else {
            ChatState::Idle
        };
        self.completed_in_flight = false;
        self.pending_at_send = false;
    }
}

/// 待落库的副作用（锁外执行）
#[derive(Default)]
struct Effects {
    write_back: Option<Vec<Message>>,
    property_set: Option<PropertySet>,
    waiting_flag: Option<bool>,
    title: Option<String>,
}

pub struct ChatOrchestrator {
    context: SessionContext,
    worker: Arc<dyn ChatWorker>,
    store: Arc<dyn SessionRecordStore>,
    flags: Arc<dyn WaitingFlagStore>,
    writer: DebouncedWriter,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<UiState>,
}

impl ChatOrchestrator {
    pub fn new(
        context: SessionContext,
        worker: Arc<dyn ChatWorker>,
        store: Arc<dyn SessionRecordStore>,
        flags: Arc<dyn WaitingFlagStore>,
        options: OrchestratorOptions,
    ) -> Self {
        let writer = DebouncedWriter::new(Arc::clone(&store), context.session_id.clone(), options.debounce);
        let (state_tx, _) = watch::channel(UiState::default());
        Self {
            context,
            worker,
            store,
            flags,
            writer,
            inner: Mutex::new(Inner::new()),
            state_tx,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.context.session_id
    }

    pub fn subscribe_state(&self) -> watch::Receiver<UiState> {
        self.state_tx.subscribe()
    }

    pub async fn snapshot(&self) -> UiState {
        self.inner.lock().await.project()
    }

    pub async fn state(&self) -> ChatState {
        self.inner.lock().await.chat
    }

    fn publish(&self, inner: &Inner) {
        self.state_tx.send_replace(inner.project());
    }

    /// 会话启动：聚合历史，恢复等待状态
    pub async fn load(&self) -> Result<(), ChatError> {
        let history = load_history(
            self.store.as_ref(),
            self.session_id(),
            self.context.client_address.as_deref(),
        )
        .await?;
        let waiting = match self.flags.get(self.session_id()).await {
            Ok(waiting) => waiting,
            Err(e) => {
                tracing::warn!("Failed to read waiting flag for {}: {:#}", self.session_id(), e);
                false
            }
        };

        let mut inner = self.inner.lock().await;
        inner.record_ready = history.has_own_record;
        inner.timeline = ConversationMemory::from_parts(history.messages, history.property_sets);
        inner.own_messages = history.own_messages;
        inner.title = history.title;
        if waiting {
            inner.search_pending = true;
            inner.chat = ChatState::AwaitingCallback;
        }
        tracing::info!(
            "Loaded session {} ({} messages, waiting: {})",
            self.session_id(),
            inner.timeline.len(),
            waiting
        );
        self.publish(&inner);
        Ok(())
    }

    /// 发送文本消息
    pub async fn send_message(&self, text: &str) -> Result<(), ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyInput);
        }
        let request = {
            let mut inner = self.inner.lock().await;
            self.begin_send(&mut inner, Message::user(text), MessageKind::Text, None, None)?
        };
        self.dispatch(request).await
    }

    /// 发送语音消息：本地显示为「Mensaje de voz (Ns)」，音频作为二进制部分随请求发出
    pub async fn send_voice_message(&self, audio: VoicePayload, duration_secs: f64) -> Result<(), ChatError> {
        if audio.bytes.is_empty() {
            return Err(ChatError::EmptyInput);
        }
        let request = {
            let mut inner = self.inner.lock().await;
            if inner.chat == ChatState::AwaitingReply {
                return Err(ChatError::Busy);
            }
            inner.recording = RecordingState::Preparing;
            self.publish(&inner);
            let message = Message::voice(duration_secs);
            self.begin_send(&mut inner, message, MessageKind::Voice, Some(duration_secs), Some(audio))?
        };
        {
            let mut inner = self.inner.lock().await;
            inner.recording = RecordingState::Sending;
            self.publish(&inner);
        }

        let result = self.dispatch(request).await;

        let mut inner = self.inner.lock().await;
        inner.recording = RecordingState::Idle;
        self.publish(&inner);
        result
    }

    /// 乐观追加用户消息并构造请求；必须在任何 await 之前完成
    fn begin_send(
        &self,
        inner: &mut Inner,
        message: Message,
        kind: MessageKind,
        audio_duration: Option<f64>,
        audio: Option<VoicePayload>,
    ) -> Result<ChatRequest, ChatError> {
        if inner.chat == ChatState::AwaitingReply {
            return Err(ChatError::Busy);
        }
        let content = message.content.clone();
        inner.append(message);
        inner.chat = ChatState::AwaitingReply;
        inner.completed_in_flight = false;
        inner.pending_at_send = inner.search_pending;
        self.writer.schedule(inner.own_messages.clone());
        self.publish(inner);

        Ok(ChatRequest {
            message: content,
            message_type: kind,
            session_id: self.context.session_id.clone(),
            timestamp: Utc::now(),
            audio_duration,
            language: self.context.language.clone(),
            conversation_text: inner.timeline.transcript(),
            conversation_stats: inner.timeline.stats(),
            audio,
        })
    }

    async fn dispatch(&self, request: ChatRequest) -> Result<(), ChatError> {
        self.ensure_record().await;

        let result = self.worker.send(&request).await;

        let mut effects = Effects::default();
        let outcome = {
            let mut inner = self.inner.lock().await;
            let was_pending = inner.search_pending;
            let outcome = match result {
                Ok(reply) => {
                    self.apply_reply(&mut inner, &reply, &mut effects);
                    Ok(())
                }
                Err(e) => {
                    tracing::error!("Sending message for {} failed: {}", self.session_id(), e);
                    inner.append(Message::error(SEND_FAILED_TEXT));
                    inner.settle(false);
                    Err(ChatError::Worker(e))
                }
            };
            if inner.search_pending != was_pending {
                effects.waiting_flag = Some(inner.search_pending);
            }
            effects.write_back = Some(inner.own_messages.clone());
            self.publish(&inner);
            outcome
        };

        self.apply_effects(effects).await;
        outcome
    }

    fn apply_reply(&self, inner: &mut Inner, reply: &WorkerReply, effects: &mut Effects) {
        if let Some(text) = reply.reply_text() {
            inner.append(Message::assistant(text));
        }
        if let Some(title) = reply.conversation_title.as_deref().filter(|t| !t.trim().is_empty()) {
            if inner.title.as_deref() != Some(title) {
                inner.title = Some(title.to_string());
                effects.title = Some(title.to_string());
            }
        }
        if reply.search_started && inner.completed_in_flight {
            tracing::debug!("Search already completed for {}, not waiting", self.session_id());
        }
        inner.settle(reply.search_started);
    }

    /// 首次发送前确保会话记录存在，并带上来源地址与客户端描述
    async fn ensure_record(&self) {
        {
            let inner = self.inner.lock().await;
            if inner.record_ready {
                return;
            }
        }
        let patch = SessionPatch::default().with_client(
            self.context.client_address.clone(),
            self.context.client_descriptor.clone(),
        );
        match self.store.upsert(self.session_id(), patch).await {
            Ok(()) => self.inner.lock().await.record_ready = true,
            Err(e) => tracing::warn!("Failed to create session record {}: {}", self.session_id(), e),
        }
    }

    /// 分发一条已去重的回调
    pub async fn on_callback(&self, record: &CallbackRecord) {
        if record.session_id != self.context.session_id {
            tracing::debug!("Ignoring callback {} for another session", record.id);
            return;
        }

        let mut effects = Effects::default();
        {
            let mut inner = self.inner.lock().await;
            let clears = match record.parse_payload() {
                Ok(payload) => {
                    let clears = payload.clears_waiting();
                    self.apply_payload(&mut inner, payload, &mut effects);
                    clears
                }
                Err(e) => {
                    tracing::warn!("Malformed callback {}: {}", record.id, e);
                    match extract_text(&record.payload) {
                        Some(text) => inner.append(Message::assistant(text)),
                        None => inner.append(Message::error(MALFORMED_CALLBACK_TEXT)),
                    }
                    true
                }
            };
            if clears {
                inner.finish_search();
                // 无条件清除：标志可能是上一次进程遗留的
                effects.waiting_flag = Some(false);
            }
            effects.write_back = Some(inner.own_messages.clone());
            self.publish(&inner);
        }
        self.apply_effects(effects).await;
    }

    fn apply_payload(&self, inner: &mut Inner, payload: CallbackPayload, effects: &mut Effects) {
        match payload {
            CallbackPayload::AssistantMessage { message } => inner.append(Message::assistant(message)),
            CallbackPayload::SearchCompleted {
                properties_count,
                properties,
                message,
            } => {
                if properties.is_empty() && properties_count.unwrap_or(0) > 0 {
                    tracing::warn!(
                        "Callback reported {} properties but none were attached",
                        properties_count.unwrap_or(0)
                    );
                }
                self.apply_results(inner, properties, message, effects);
            }
            CallbackPayload::Results { properties, message } => {
                self.apply_results(inner, properties, message, effects);
            }
            CallbackPayload::SearchStarted { message } => {
                inner.append(Message::assistant(
                    message.unwrap_or_else(|| SEARCH_STARTED_TEXT.to_string()),
                ));
            }
            CallbackPayload::Unknown { tag, message } => match message {
                Some(text) => inner.append(Message::assistant(text)),
                None => tracing::debug!("Callback with tag {:?} carried no text", tag),
            },
        }
    }

    fn apply_results(
        &self,
        inner: &mut Inner,
        properties: Vec<PropertyRecord>,
        message: Option<String>,
        effects: &mut Effects,
    ) {
        if properties.is_empty() {
            inner.append(Message::assistant(NO_RESULTS_TEXT));
            return;
        }
        let set = PropertySet::new(properties);
        let summary = message.unwrap_or_else(|| results_summary(set.len()));
        inner.timeline.push_property_set(set.clone());
        inner.append(Message::assistant(summary));
        effects.property_set = Some(set);
    }

    async fn apply_effects(&self, effects: Effects) {
        let session_id = self.session_id();

        if let Some(messages) = effects.write_back {
            self.writer.schedule(messages);
        }
        if let Some(set) = effects.property_set {
            if let Err(e) = append_property_set(self.store.as_ref(), session_id, set).await {
                tracing::warn!("Failed to persist property set for {}: {}", session_id, e);
            }
        }
        if let Some(waiting) = effects.waiting_flag {
            if let Err(e) = self.flags.set(session_id, waiting).await {
                tracing::warn!("Failed to persist waiting flag for {}: {:#}", session_id, e);
            }
        }
        if let Some(title) = effects.title {
            if let Err(e) = self.store.update(session_id, SessionPatch::title(title)).await {
                tracing::warn!("Failed to store conversation title for {}: {}", session_id, e);
            }
        }
    }

    /// 退出前写出未落盘的消息
    pub async fn shutdown(&self) {
        self.writer.flush().await;
        tracing::info!("Session {} flushed", self.session_id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryWaitingFlags;
    use crate::store::MemorySessionStore;
    use crate::worker::{MockWorker, WorkerError};
    use serde_json::json;

    struct Harness {
        orchestrator: ChatOrchestrator,
        worker: Arc<MockWorker>,
        store: Arc<MemorySessionStore>,
        flags: Arc<MemoryWaitingFlags>,
    }

    fn harness(worker: MockWorker) -> Harness {
        let worker = Arc::new(worker);
        let store = Arc::new(MemorySessionStore::new());
        let flags = Arc::new(MemoryWaitingFlags::new());
        let orchestrator = ChatOrchestrator::new(
            SessionContext::new("s1").with_client(Some("10.0.0.7".into()), None),
            worker.clone(),
            store.clone(),
            flags.clone(),
            OrchestratorOptions {
                debounce: Duration::from_millis(10),
            },
        );
        Harness {
            orchestrator,
            worker,
            store,
            flags,
        }
    }

    fn callback(payload: serde_json::Value) -> CallbackRecord {
        CallbackRecord::new("s1", payload)
    }

    #[tokio::test]
    async fn test_rejects_empty_input() {
        let h = harness(MockWorker::new());
        assert!(matches!(h.orchestrator.send_message("   ").await, Err(ChatError::EmptyInput)));
        assert!(h.orchestrator.snapshot().await.messages.is_empty());
        assert!(h.worker.requests().is_empty());
    }

    #[tokio::test]
    async fn test_search_started_enters_waiting() {
        let h = harness(MockWorker::with_replies([WorkerReply::searching("Buscando...")]));
        h.orchestrator.send_message("piso en Madrid").await.unwrap();

        let ui = h.orchestrator.snapshot().await;
        assert_eq!(ui.chat, ChatState::AwaitingCallback);
        assert_eq!(ui.messages.len(), 2);
        assert_eq!(ui.messages[0].content, "piso en Madrid");
        assert_eq!(ui.messages[1].content, "Buscando...");
        assert!(h.flags.get("s1").await.unwrap());

        let req = &h.worker.requests()[0];
        assert_eq!(req.language, "spanish");
        assert_eq!(req.conversation_stats.user, 1);
        assert_eq!(req.conversation_text, "Usuario: piso en Madrid");
    }

    #[tokio::test]
    async fn test_transport_failure_appends_error() {
        let worker = MockWorker::new();
        worker.push_error(WorkerError::Timeout);
        let h = harness(worker);

        let err = h.orchestrator.send_message("hola").await.unwrap_err();
        assert!(matches!(err, ChatError::Worker(WorkerError::Timeout)));
        let ui = h.orchestrator.snapshot().await;
        assert_eq!(ui.chat, ChatState::Idle);
        assert_eq!(ui.messages.len(), 2);
        assert_eq!(ui.messages[1].role, crate::memory::Role::Error);
    }

    #[tokio::test]
    async fn test_completion_with_results_clears_waiting() {
        let h = harness(MockWorker::with_replies([WorkerReply::searching("Buscando...")]));
        h.orchestrator.send_message("piso en Madrid").await.unwrap();

        h.orchestrator
            .on_callback(&callback(json!({
                "type": "properties_search_completed",
                "properties_count": 3,
                "properties": [{"id": 1}, {"id": 2}, {"id": 3}]
            })))
            .await;

        let ui = h.orchestrator.snapshot().await;
        assert_eq!(ui.chat, ChatState::Idle);
        assert_eq!(ui.property_sets.len(), 1);
        assert_eq!(ui.property_sets[0].len(), 3);
        assert_eq!(ui.messages.last().unwrap().content, results_summary(3));
        assert!(!h.flags.get("s1").await.unwrap());

        let record = h.store.get("s1").await.unwrap().unwrap();
        assert_eq!(record.property_sets.len(), 1);
        assert_eq!(record.client_address.as_deref(), Some("10.0.0.7"));
    }

    #[tokio::test]
    async fn test_empty_completion_asks_to_adjust_filters() {
        let h = harness(MockWorker::with_replies([WorkerReply::searching("Buscando...")]));
        h.orchestrator.send_message("ático con piscina").await.unwrap();

        h.orchestrator
            .on_callback(&callback(json!({"type": "properties_search_completed", "properties": []})))
            .await;

        let ui = h.orchestrator.snapshot().await;
        assert_eq!(ui.chat, ChatState::Idle);
        assert!(ui.property_sets.is_empty());
        assert_eq!(ui.messages.last().unwrap().content, NO_RESULTS_TEXT);
    }

    #[tokio::test]
    async fn test_search_started_callback_keeps_waiting() {
        let h = harness(MockWorker::with_replies([WorkerReply::searching("Buscando...")]));
        h.orchestrator.send_message("piso").await.unwrap();

        h.orchestrator.on_callback(&callback(json!({"type": "search_started"}))).await;
        let ui = h.orchestrator.snapshot().await;
        assert_eq!(ui.chat, ChatState::AwaitingCallback);
        assert_eq!(ui.messages.last().unwrap().content, SEARCH_STARTED_TEXT);
    }

    #[tokio::test]
    async fn test_malformed_callback_clears_waiting() {
        let h = harness(MockWorker::with_replies([WorkerReply::searching("Buscando...")]));
        h.orchestrator.send_message("piso").await.unwrap();

        h.orchestrator
            .on_callback(&callback(json!({"type": "properties_search_completed", "properties": "oops"})))
            .await;
        let ui = h.orchestrator.snapshot().await;
        assert_eq!(ui.chat, ChatState::Idle);
        assert_eq!(ui.messages.last().unwrap().role, crate::memory::Role::Error);
        assert!(!h.flags.get("s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_bare_results_callback_creates_property_set() {
        let h = harness(MockWorker::with_replies([WorkerReply::searching("Buscando...")]));
        h.orchestrator.send_message("casa en Valencia").await.unwrap();
        assert_eq!(h.orchestrator.state().await, ChatState::AwaitingCallback);

        h.orchestrator
            .on_callback(&callback(json!({
                "properties": [{"id": "v1"}, {"id": "v2"}],
                "message": "Mira estas dos casas"
            })))
            .await;

        let ui = h.orchestrator.snapshot().await;
        assert_eq!(ui.chat, ChatState::Idle);
        assert_eq!(ui.property_sets.len(), 1);
        assert_eq!(ui.property_sets[0].len(), 2);
        assert_eq!(ui.messages.last().unwrap().content, "Mira estas dos casas");
        assert!(!h.flags.get("s1").await.unwrap());

        let record = h.store.get("s1").await.unwrap().unwrap();
        assert_eq!(record.property_sets.len(), 1);
        assert_eq!(record.property_sets[0].properties[0].id.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn test_unknown_tag_with_text_ends_waiting() {
        let h = harness(MockWorker::with_replies([WorkerReply::searching("Buscando...")]));
        h.orchestrator.send_message("piso").await.unwrap();

        h.orchestrator
            .on_callback(&callback(json!({"type": "agent_note", "message": "Sigo aquí"})))
            .await;

        let ui = h.orchestrator.snapshot().await;
        assert_eq!(ui.chat, ChatState::Idle);
        let last = ui.messages.last().unwrap();
        assert_eq!(last.role, crate::memory::Role::Assistant);
        assert_eq!(last.content, "Sigo aquí");
        assert!(!h.flags.get("s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_tag_without_text_ends_waiting_silently() {
        let h = harness(MockWorker::with_replies([WorkerReply::searching("Buscando...")]));
        h.orchestrator.send_message("piso").await.unwrap();
        let before = h.orchestrator.snapshot().await.messages.len();

        h.orchestrator.on_callback(&callback(json!({"type": "heartbeat"}))).await;

        let ui = h.orchestrator.snapshot().await;
        assert_eq!(ui.chat, ChatState::Idle);
        assert_eq!(ui.messages.len(), before);
        assert!(!h.flags.get("s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_old_search_completion_during_new_send_keeps_new_wait() {
        let worker = MockWorker::with_replies([
            WorkerReply::searching("Buscando pisos..."),
            WorkerReply::searching("Buscando áticos..."),
        ])
        .with_delay(Duration::from_millis(200));
        let h = Arc::new(harness(worker));
        h.orchestrator.send_message("piso en Madrid").await.unwrap();
        assert_eq!(h.orchestrator.state().await, ChatState::AwaitingCallback);

        let second = {
            let h = h.clone();
            tokio::spawn(async move { h.orchestrator.send_message("mejor un ático").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.orchestrator.state().await, ChatState::AwaitingReply);

        // 第一次搜索的结束回调在第二次请求途中到达
        h.orchestrator
            .on_callback(&callback(json!({"type": "properties_search_completed", "properties": [{"id": 1}]})))
            .await;

        second.await.unwrap().unwrap();
        assert_eq!(h.orchestrator.state().await, ChatState::AwaitingCallback);
        assert!(h.flags.get("s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_busy_while_awaiting_reply() {
        let worker = MockWorker::with_replies([WorkerReply::text("ok")]).with_delay(Duration::from_millis(200));
        let h = Arc::new(harness(worker));

        let first = {
            let h = h.clone();
            tokio::spawn(async move { h.orchestrator.send_message("uno").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.orchestrator.state().await, ChatState::AwaitingReply);
        assert!(matches!(h.orchestrator.send_message("dos").await, Err(ChatError::Busy)));

        first.await.unwrap().unwrap();
        assert_eq!(h.orchestrator.state().await, ChatState::Idle);
    }

    #[tokio::test]
    async fn test_title_is_stored() {
        let h = harness(MockWorker::with_replies([WorkerReply::text("Hola").with_title("Pisos en Madrid")]));
        h.orchestrator.send_message("hola").await.unwrap();

        assert_eq!(h.orchestrator.snapshot().await.title.as_deref(), Some("Pisos en Madrid"));
        let record = h.store.get("s1").await.unwrap().unwrap();
        assert_eq!(record.title.as_deref(), Some("Pisos en Madrid"));
    }

    #[tokio::test]
    async fn test_voice_message_resets_recording() {
        let h = harness(MockWorker::with_replies([WorkerReply::text("Recibido")]));
        let mut state = h.orchestrator.subscribe_state();

        h.orchestrator
            .send_voice_message(VoicePayload::new(vec![1, 2, 3], "audio/webm"), 3.0)
            .await
            .unwrap();

        let ui = state.borrow_and_update().clone();
        assert_eq!(ui.recording, RecordingState::Idle);
        assert_eq!(ui.messages[0].content, "Mensaje de voz (3s)");
        let req = &h.worker.requests()[0];
        assert_eq!(req.message_type, MessageKind::Voice);
        assert_eq!(req.audio_duration, Some(3.0));
        assert!(req.audio.is_some());
    }

    #[tokio::test]
    async fn test_load_restores_waiting_flag() {
        let h = harness(MockWorker::new());
        h.flags.set("s1", true).await.unwrap();

        h.orchestrator.load().await.unwrap();
        assert_eq!(h.orchestrator.state().await, ChatState::AwaitingCallback);
    }

    #[tokio::test]
    async fn test_callback_for_other_session_is_ignored() {
        let h = harness(MockWorker::new());
        h.orchestrator
            .on_callback(&CallbackRecord::new("other", json!({"type": "assistant_message", "message": "x"})))
            .await;
        assert!(h.orchestrator.snapshot().await.messages.is_empty());
    }
}
