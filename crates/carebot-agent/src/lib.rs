//! # Carebot Agent
//! The conversation orchestrator: turns one user message into a streamed,
//! knowledge-grounded answer.
//!
//! ## Features
//! - **Multi-round tool calling**: up to `max_tool_rounds` knowledge lookups per turn
//! - **Streaming**: answer tokens flow through a bounded channel as they arrive
//! - **Per-chat serialization**: turns on one chat run in arrival order
//! - **Cancellation**: a dropped receiver stops the turn; nothing half-done is persisted

pub mod locks;
pub mod prompts;
pub mod turn;

use std::sync::Arc;

use carebot_core::config::ChatConfig;
use carebot_core::error::{CarebotError, Result};
use carebot_core::traits::Provider;
use carebot_core::traits::provider::GenerateParams;
use carebot_memory::{Chat, ChatStore, Storage};
use carebot_tools::ToolRegistry;
use tokio::sync::mpsc;

pub use locks::ChatLocks;
pub use turn::{TurnEvent, TurnState};

use turn::{Turn, TurnContext};

/// Receiving end of a turn.
pub type TurnStream = mpsc::Receiver<TurnEvent>;

/// Attempts at finding an unused chat id.
const CREATE_ATTEMPTS: usize = 3;

/// Health assessment assistant.
#[derive(Clone)]
pub struct Assistant {
    ctx: Arc<TurnContext>,
    locks: ChatLocks,
}

fn new_chat_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

impl Assistant {
    pub fn new(
        provider: Arc<dyn Provider>,
        tools: ToolRegistry,
        storage: Arc<Storage>,
        chat: ChatConfig,
        params: GenerateParams,
    ) -> Self {
        tracing::info!(
            "Assistant ready: provider={}, model={}, tools={}",
            provider.name(),
            params.model,
            tools.definitions().len()
        );
        Self {
            ctx: Arc::new(TurnContext {
                provider,
                tools,
                storage,
                chat,
                params,
            }),
            locks: ChatLocks::new(),
        }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.ctx.storage
    }

    pub fn provider_name(&self) -> &str {
        self.ctx.provider.name()
    }

    pub fn model_name(&self) -> &str {
        &self.ctx.params.model
    }

    /// Number of chats with a turn running or queued.
    pub fn active_turns(&self) -> usize {
        self.locks.active()
    }

    /// Create an empty chat with a fresh 8-character id.
    pub async fn create_chat(&self) -> Result<Chat> {
        let created = chrono::Utc::now().timestamp();
        let mut conn = self.ctx.storage.acquire().await?;
        let mut store = ChatStore::new(&mut conn);

        let mut last_err = None;
        for _ in 0..CREATE_ATTEMPTS {
            match store.create(&new_chat_id(), created) {
                Ok(chat) => {
                    tracing::info!("Chat {} created", chat.id);
                    return Ok(chat);
                }
                Err(CarebotError::ChatExists(id)) => {
                    tracing::warn!("Chat id {id} already taken, retrying");
                    last_err = Some(CarebotError::ChatExists(id));
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| CarebotError::Storage("chat creation failed".into())))
    }

    pub async fn get_chat(&self, chat_id: &str) -> Result<Chat> {
        let mut conn = self.ctx.storage.acquire().await?;
        ChatStore::new(&mut conn).get(chat_id)
    }

    pub async fn list_chats(&self) -> Result<Vec<Chat>> {
        let mut conn = self.ctx.storage.acquire().await?;
        ChatStore::new(&mut conn).list_chats()
    }

    /// Start a turn on `chat_id` and return its event stream.
    ///
    /// Fails with `ChatNotFound` before any model call when the chat does not
    /// exist. Otherwise waits for earlier turns on the same chat, then spawns
    /// the turn. Dropping the returned receiver cancels it.
    pub async fn converse(&self, chat_id: &str, message: &str) -> Result<TurnStream> {
        let message = message.trim();
        if message.is_empty() {
            return Err(CarebotError::InvalidRequest("message must not be empty".into()));
        }

        let exists = {
            let mut conn = self.ctx.storage.acquire().await?;
            ChatStore::new(&mut conn).exists(chat_id)?
        };
        if !exists {
            return Err(CarebotError::ChatNotFound(chat_id.to_string()));
        }

        let guard = self.locks.lock(chat_id).await;
        let (tx, rx) = mpsc::channel(self.ctx.chat.stream_buffer.max(1));
        let mut turn = Turn::new(self.ctx.clone(), chat_id, message);

        tokio::spawn(async move {
            let _guard = guard;
            let outcome = tokio::select! {
                result = turn.drive(&tx) => Some(result),
                _ = tx.closed() => None,
            };

            match outcome {
                Some(Ok(answer)) => {
                    let _ = tx.send(TurnEvent::Done { answer }).await;
                }
                Some(Err(CarebotError::Cancelled(_))) | None => turn.cancel().await,
                Some(Err(e)) => {
                    let at = turn.state();
                    turn.fail();
                    tracing::warn!("Turn failed during {at:?}: {e}");
                    let _ = tx.send(TurnEvent::Error(e.to_string())).await;
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use carebot_core::traits::Tool;
    use carebot_core::traits::provider::ProviderStream;
    use carebot_core::types::{
        Message, Role, StreamEvent, ToolCall, ToolDefinition, ToolResult,
    };
    use carebot_tools::KNOWLEDGE_TOOL_NAME;
    use futures::StreamExt;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Script {
        events: Vec<StreamEvent>,
        delay: Duration,
    }

    fn answer(text: &str) -> Script {
        let mut events: Vec<StreamEvent> = text
            .split_inclusive(' ')
            .map(|w| StreamEvent::TextDelta(w.to_string()))
            .collect();
        events.push(StreamEvent::Finished {
            finish_reason: Some("stop".into()),
        });
        Script {
            events,
            delay: Duration::ZERO,
        }
    }

    fn slow_answer(text: &str, delay_ms: u64) -> Script {
        Script {
            delay: Duration::from_millis(delay_ms),
            ..answer(text)
        }
    }

    fn tool_request(call_id: &str, query: &str) -> Script {
        let args = serde_json::json!({ "query_input": query }).to_string();
        Script {
            events: vec![
                StreamEvent::ToolCall(ToolCall::new(call_id, KNOWLEDGE_TOOL_NAME, args)),
                StreamEvent::Finished {
                    finish_reason: Some("tool_calls".into()),
                },
            ],
            delay: Duration::ZERO,
        }
    }

    /// Plays back scripted responses in call order and records what it saw.
    struct ScriptedProvider {
        scripts: Mutex<VecDeque<Script>>,
        calls: Mutex<Vec<(Vec<Message>, usize)>>,
    }

    impl ScriptedProvider {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn next(&self, messages: &[Message], tools: &[ToolDefinition]) -> Result<Script> {
            self.calls
                .lock()
                .unwrap()
                .push((messages.to_vec(), tools.len()));
            self.scripts
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| CarebotError::Provider("no script left".into()))
        }

        fn calls(&self) -> Vec<(Vec<Message>, usize)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn chat_stream(
            &self,
            messages: &[Message],
            tools: &[ToolDefinition],
            _params: &GenerateParams,
        ) -> Result<ProviderStream> {
            let script = self.next(messages, tools)?;
            let delay = script.delay;
            let stream = futures::stream::iter(script.events).then(move |event| async move {
                tokio::time::sleep(delay).await;
                Ok::<_, CarebotError>(event)
            });
            Ok(Box::pin(stream))
        }
    }

    #[derive(Clone, Copy)]
    enum Behavior {
        Passages,
        Fail,
        Exhausted,
        Rejected,
    }

    struct FakeKnowledgeTool {
        behavior: Behavior,
    }

    #[async_trait]
    impl Tool for FakeKnowledgeTool {
        fn name(&self) -> &str {
            KNOWLEDGE_TOOL_NAME
        }

        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: KNOWLEDGE_TOOL_NAME.into(),
                description: "Query the knowledge base".into(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": { "query_input": { "type": "string" } },
                    "required": ["query_input"]
                }),
            }
        }

        async fn execute(&self, _arguments: &str) -> Result<ToolResult> {
            match self.behavior {
                Behavior::Passages => Ok(ToolResult::ok(
                    r#"[{"text":"Diabetes causes thirst.","doc_name":"Diabetes","score":0.9}]"#,
                )),
                Behavior::Fail => Err(CarebotError::Tool("index offline".into())),
                Behavior::Exhausted => Err(CarebotError::EmbeddingFailed {
                    batch: 0,
                    attempts: 4,
                    reason: "timeout".into(),
                    transient: true,
                }),
                Behavior::Rejected => Err(CarebotError::EmbeddingFailed {
                    batch: 0,
                    attempts: 1,
                    reason: "embeddings API error 401: invalid key".into(),
                    transient: false,
                }),
            }
        }
    }

    fn assistant_with(
        provider: Arc<ScriptedProvider>,
        behavior: Behavior,
        chat: ChatConfig,
    ) -> (tempfile::TempDir, Assistant) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(&dir.path().join("chat.db"), 4, Duration::from_secs(1)).unwrap();
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(FakeKnowledgeTool { behavior }));
        let assistant = Assistant::new(provider, tools, storage, chat, GenerateParams::default());
        (dir, assistant)
    }

    async fn collect(mut rx: TurnStream) -> Vec<TurnEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn streamed_text(events: &[TurnEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                TurnEvent::Token(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    async fn messages(assistant: &Assistant, chat_id: &str) -> Vec<Message> {
        assistant.get_chat(chat_id).await.unwrap().messages
    }

    #[tokio::test]
    async fn test_tool_round_then_streamed_answer() {
        let provider = ScriptedProvider::new(vec![
            tool_request("call_1", "diabetes symptoms"),
            answer("Diabetes often causes thirst."),
        ]);
        let (_dir, assistant) = assistant_with(provider.clone(), Behavior::Passages, ChatConfig::default());
        let chat = assistant.create_chat().await.unwrap();

        let events = collect(assistant.converse(&chat.id, "What are diabetes symptoms?").await.unwrap()).await;
        assert_eq!(streamed_text(&events), "Diabetes often causes thirst.");
        assert_eq!(
            events.last(),
            Some(&TurnEvent::Done {
                answer: "Diabetes often causes thirst.".into()
            })
        );

        let calls = provider.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1, 1);
        assert_eq!(calls[0].0[0].role, Role::System);
        let second = &calls[1].0;
        assert!(second.iter().any(|m| m.tool_calls.is_some()));
        let tool_msg = second.iter().find(|m| m.role == Role::Tool).unwrap();
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call_1"));
        assert!(tool_msg.content.contains("Diabetes causes thirst."));

        let stored = messages(&assistant, &chat.id).await;
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0], Message::user("What are diabetes symptoms?"));
        assert_eq!(stored[1], Message::assistant("Diabetes often causes thirst."));
    }

    #[tokio::test]
    async fn test_unknown_chat_and_empty_message_are_rejected() {
        let provider = ScriptedProvider::new(vec![]);
        let (_dir, assistant) = assistant_with(provider.clone(), Behavior::Passages, ChatConfig::default());

        let err = assistant.converse("missing1", "hello").await.unwrap_err();
        assert!(matches!(err, CarebotError::ChatNotFound(id) if id == "missing1"));

        let chat = assistant.create_chat().await.unwrap();
        let err = assistant.converse(&chat.id, "   ").await.unwrap_err();
        assert!(matches!(err, CarebotError::InvalidRequest(_)));
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_tool_rounds_are_bounded() {
        let provider = ScriptedProvider::new(vec![
            tool_request("c1", "a"),
            tool_request("c2", "b"),
            tool_request("c3", "c"),
            tool_request("c4", "d"),
        ]);
        let (_dir, assistant) = assistant_with(provider.clone(), Behavior::Passages, ChatConfig::default());
        let chat = assistant.create_chat().await.unwrap();

        let events = collect(assistant.converse(&chat.id, "loop forever").await.unwrap()).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], TurnEvent::Error(msg) if msg.contains("no answer")));

        let tool_counts: Vec<usize> = provider.calls().iter().map(|(_, n)| *n).collect();
        assert_eq!(tool_counts, vec![1, 1, 1, 0]);
        assert!(messages(&assistant, &chat.id).await.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_discards_turn() {
        let provider = ScriptedProvider::new(vec![
            slow_answer("Drink plenty of water and rest well today.", 30),
            answer("ok"),
        ]);
        let (_dir, assistant) = assistant_with(provider, Behavior::Passages, ChatConfig::default());
        let chat = assistant.create_chat().await.unwrap();

        let mut rx = assistant.converse(&chat.id, "first").await.unwrap();
        assert!(matches!(rx.recv().await, Some(TurnEvent::Token(_))));
        drop(rx);

        // Waits for the cancelled turn to release the chat
        let events = collect(assistant.converse(&chat.id, "second").await.unwrap()).await;
        assert!(matches!(events.last(), Some(TurnEvent::Done { .. })));

        let stored = messages(&assistant, &chat.id).await;
        assert_eq!(stored, vec![Message::user("second"), Message::assistant("ok")]);
    }

    #[tokio::test]
    async fn test_disconnect_keeps_partial_answer_when_enabled() {
        let full = "Drink plenty of water and rest well today.";
        let provider = ScriptedProvider::new(vec![slow_answer(full, 30), answer("ok")]);
        let chat_config = ChatConfig {
            persist_partial: true,
            ..ChatConfig::default()
        };
        let (_dir, assistant) = assistant_with(provider, Behavior::Passages, chat_config);
        let chat = assistant.create_chat().await.unwrap();

        let mut rx = assistant.converse(&chat.id, "first").await.unwrap();
        assert!(matches!(rx.recv().await, Some(TurnEvent::Token(_))));
        drop(rx);
        collect(assistant.converse(&chat.id, "second").await.unwrap()).await;

        let stored = messages(&assistant, &chat.id).await;
        assert_eq!(stored.len(), 4);
        assert_eq!(stored[0], Message::user("first"));
        assert_eq!(stored[1].role, Role::Assistant);
        assert!(stored[1].content.starts_with("Drink "));
        assert!(stored[1].content.len() < full.len());
        assert_eq!(stored[2], Message::user("second"));
    }

    #[tokio::test]
    async fn test_same_chat_turns_run_in_order() {
        let provider = ScriptedProvider::new(vec![slow_answer("first answer", 20), answer("second answer")]);
        let (_dir, assistant) = assistant_with(provider.clone(), Behavior::Passages, ChatConfig::default());
        let chat = assistant.create_chat().await.unwrap();

        let rx_one = assistant.converse(&chat.id, "one").await.unwrap();
        let second = {
            let assistant = assistant.clone();
            let id = chat.id.clone();
            tokio::spawn(async move { collect(assistant.converse(&id, "two").await.unwrap()).await })
        };

        let one = collect(rx_one).await;
        let two = second.await.unwrap();
        assert_eq!(streamed_text(&one), "first answer");
        assert_eq!(streamed_text(&two), "second answer");

        // The second turn saw the first one's persisted answer
        let calls = provider.calls();
        assert!(calls[1].0.contains(&Message::assistant("first answer")));

        let stored = messages(&assistant, &chat.id).await;
        let contents: Vec<&str> = stored.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "first answer", "two", "second answer"]);
    }

    #[tokio::test]
    async fn test_distinct_chats_do_not_block_each_other() {
        let provider = ScriptedProvider::new(vec![slow_answer("a b c", 100), slow_answer("a b c", 100)]);
        let (_dir, assistant) = assistant_with(provider, Behavior::Passages, ChatConfig::default());
        let a = assistant.create_chat().await.unwrap();
        let b = assistant.create_chat().await.unwrap();

        let rx_a = assistant.converse(&a.id, "hello").await.unwrap();
        let rx_b = tokio::time::timeout(Duration::from_millis(50), assistant.converse(&b.id, "hello"))
            .await
            .expect("second chat should not wait")
            .unwrap();
        assert_eq!(assistant.active_turns(), 2);

        let (ea, eb) = tokio::join!(collect(rx_a), collect(rx_b));
        assert!(matches!(ea.last(), Some(TurnEvent::Done { .. })));
        assert!(matches!(eb.last(), Some(TurnEvent::Done { .. })));
    }

    #[tokio::test]
    async fn test_tool_error_is_fed_back_to_model() {
        let provider = ScriptedProvider::new(vec![
            tool_request("c1", "asthma"),
            answer("I do not have enough information."),
        ]);
        let (_dir, assistant) = assistant_with(provider.clone(), Behavior::Fail, ChatConfig::default());
        let chat = assistant.create_chat().await.unwrap();

        let events = collect(assistant.converse(&chat.id, "asthma?").await.unwrap()).await;
        assert!(matches!(events.last(), Some(TurnEvent::Done { .. })));

        let calls = provider.calls();
        let tool_msg = calls[1].0.iter().find(|m| m.role == Role::Tool).unwrap();
        assert!(tool_msg.content.starts_with("Tool error:"));
    }

    #[tokio::test]
    async fn test_exhausted_tool_error_fails_turn() {
        let provider = ScriptedProvider::new(vec![tool_request("c1", "asthma"), answer("unused")]);
        let (_dir, assistant) = assistant_with(provider.clone(), Behavior::Exhausted, ChatConfig::default());
        let chat = assistant.create_chat().await.unwrap();

        let events = collect(assistant.converse(&chat.id, "asthma?").await.unwrap()).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], TurnEvent::Error(msg) if msg.contains("Embedding failed")));
        assert_eq!(provider.calls().len(), 1);
        assert!(messages(&assistant, &chat.id).await.is_empty());
    }

    #[tokio::test]
    async fn test_permanent_embedding_failure_is_fed_back_to_model() {
        let provider = ScriptedProvider::new(vec![
            tool_request("c1", "asthma"),
            answer("The knowledge base is unavailable right now."),
        ]);
        let (_dir, assistant) = assistant_with(provider.clone(), Behavior::Rejected, ChatConfig::default());
        let chat = assistant.create_chat().await.unwrap();

        let events = collect(assistant.converse(&chat.id, "asthma?").await.unwrap()).await;
        assert!(matches!(events.last(), Some(TurnEvent::Done { .. })));

        let calls = provider.calls();
        assert_eq!(calls.len(), 2);
        let tool_msg = calls[1].0.iter().find(|m| m.role == Role::Tool).unwrap();
        assert!(tool_msg.content.starts_with("Tool error:"));
        assert!(tool_msg.content.contains("401"));
        assert_eq!(messages(&assistant, &chat.id).await.len(), 2);
    }

    #[tokio::test]
    async fn test_tool_records_are_replayed_as_notes() {
        let provider = ScriptedProvider::new(vec![
            tool_request("c1", "asthma triggers"),
            answer("Pollen can trigger asthma."),
            answer("ok"),
        ]);
        let chat_config = ChatConfig {
            record_tool_queries: true,
            ..ChatConfig::default()
        };
        let (_dir, assistant) = assistant_with(provider.clone(), Behavior::Passages, chat_config);
        let chat = assistant.create_chat().await.unwrap();

        collect(assistant.converse(&chat.id, "What triggers asthma?").await.unwrap()).await;
        let stored = messages(&assistant, &chat.id).await;
        assert_eq!(stored.len(), 3);
        assert_eq!(stored[1].role, Role::Tool);
        assert!(stored[1].content.starts_with(KNOWLEDGE_TOOL_NAME));
        assert!(stored[1].content.contains("asthma triggers"));

        collect(assistant.converse(&chat.id, "thanks").await.unwrap()).await;
        let replayed = &provider.calls()[2].0;
        assert!(replayed.iter().all(|m| m.role != Role::Tool));
        assert!(
            replayed
                .iter()
                .any(|m| m.role == Role::System && m.content.contains("asthma triggers"))
        );
    }

    #[tokio::test]
    async fn test_create_and_list_chats() {
        let (_dir, assistant) = assistant_with(ScriptedProvider::new(vec![]), Behavior::Passages, ChatConfig::default());
        let a = assistant.create_chat().await.unwrap();
        let b = assistant.create_chat().await.unwrap();
        assert_eq!(a.id.len(), 8);
        assert_ne!(a.id, b.id);
        assert!(a.messages.is_empty());

        let listed = assistant.list_chats().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(assistant.get_chat(&b.id).await.unwrap().id, b.id);
    }
}
