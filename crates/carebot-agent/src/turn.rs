//! One conversation turn: context loading, the tool-calling loop, streaming
//! and persistence.

use std::sync::Arc;

use carebot_core::config::ChatConfig;
use carebot_core::error::{CarebotError, Result};
use carebot_core::traits::Provider;
use carebot_core::traits::provider::GenerateParams;
use carebot_core::types::{Message, Role, StreamEvent, ToolCall, ToolDefinition};
use carebot_memory::{ChatStore, Storage};
use carebot_tools::ToolRegistry;
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::prompts;

/// Lifecycle of a turn. `Complete` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    LoadingContext,
    Generating,
    ToolRequested,
    ToolExecuting,
    StreamingAnswer,
    Complete,
    Failed,
}

impl TurnState {
    pub fn can_transition_to(self, next: TurnState) -> bool {
        use TurnState::*;
        match (self, next) {
            (Complete | Failed, _) => false,
            (_, Failed) => true,
            (LoadingContext, Generating)
            | (Generating, ToolRequested)
            | (Generating, StreamingAnswer)
            | (ToolRequested, ToolExecuting)
            | (ToolExecuting, Generating)
            | (StreamingAnswer, Complete) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TurnState::Complete | TurnState::Failed)
    }
}

/// What the consumer of a turn receives.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// A fragment of the answer, in order.
    Token(String),
    /// The answer was persisted; no more events follow.
    Done { answer: String },
    /// The turn failed; nothing was persisted.
    Error(String),
}

/// Everything a turn needs, shared by all turns of an assistant.
pub(crate) struct TurnContext {
    pub provider: Arc<dyn Provider>,
    pub tools: ToolRegistry,
    pub storage: Arc<Storage>,
    pub chat: ChatConfig,
    pub params: GenerateParams,
}

pub(crate) struct Turn {
    ctx: Arc<TurnContext>,
    chat_id: String,
    user_message: String,
    state: TurnState,
    answer: String,
    tool_records: Vec<Message>,
}

impl Turn {
    pub fn new(ctx: Arc<TurnContext>, chat_id: &str, user_message: &str) -> Self {
        Self {
            ctx,
            chat_id: chat_id.to_string(),
            user_message: user_message.to_string(),
            state: TurnState::LoadingContext,
            answer: String::new(),
            tool_records: Vec::new(),
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    fn advance(&mut self, next: TurnState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(CarebotError::InvalidRequest(format!(
                "invalid turn transition {:?} -> {next:?}",
                self.state
            )));
        }
        tracing::debug!("chat {}: {:?} -> {next:?}", self.chat_id, self.state);
        self.state = next;
        Ok(())
    }

    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            tracing::debug!("chat {}: {:?} -> Failed", self.chat_id, self.state);
            self.state = TurnState::Failed;
        }
    }

    /// System prompt, recent history and the new user message.
    async fn load_context(&self) -> Result<Vec<Message>> {
        let history = {
            let mut conn = self.ctx.storage.acquire().await?;
            ChatStore::new(&mut conn).get_messages(&self.chat_id, Some(self.ctx.chat.context_window))?
        };

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(Message::system(prompts::system_prompt()));
        for msg in history {
            match msg.role {
                Role::Tool => messages.push(Message::system(prompts::tool_note(&msg.content))),
                _ => messages.push(msg),
            }
        }
        messages.push(Message::user(self.user_message.clone()));
        Ok(messages)
    }

    /// Run the turn to completion, forwarding answer tokens into `tx`.
    pub async fn drive(&mut self, tx: &mpsc::Sender<TurnEvent>) -> Result<String> {
        let mut messages = self.load_context().await?;
        let tool_defs = self.ctx.tools.definitions();
        let max_rounds = self.ctx.chat.max_tool_rounds;

        for round in 0..=max_rounds {
            self.advance(TurnState::Generating)?;
            // Final round: no tools, the model has to answer
            let current_tools: &[ToolDefinition] = if round < max_rounds { &tool_defs } else { &[] };

            let mut stream = self
                .ctx
                .provider
                .chat_stream(&messages, current_tools, &self.ctx.params)
                .await?;

            let mut tool_calls: Vec<ToolCall> = Vec::new();
            while let Some(event) = stream.next().await {
                match event? {
                    StreamEvent::TextDelta(text) => {
                        if self.state == TurnState::Generating {
                            self.advance(TurnState::StreamingAnswer)?;
                        }
                        self.answer.push_str(&text);
                        if tx.send(TurnEvent::Token(text)).await.is_err() {
                            return Err(CarebotError::Cancelled("client disconnected".into()));
                        }
                    }
                    StreamEvent::ToolCall(call) => tool_calls.push(call),
                    StreamEvent::Finished { .. } => break,
                }
            }

            if self.state == TurnState::StreamingAnswer {
                if !tool_calls.is_empty() {
                    tracing::warn!(
                        "chat {}: ignoring {} tool call(s) after the answer started",
                        self.chat_id,
                        tool_calls.len()
                    );
                }
                self.persist().await?;
                self.advance(TurnState::Complete)?;
                return Ok(self.answer.clone());
            }

            if tool_calls.is_empty() || current_tools.is_empty() {
                break;
            }

            tracing::info!(
                "chat {}: tool round {}/{max_rounds}: {} call(s)",
                self.chat_id,
                round + 1,
                tool_calls.len()
            );
            self.advance(TurnState::ToolRequested)?;
            messages.push(Message::assistant_tool_calls("", tool_calls.clone()));
            self.advance(TurnState::ToolExecuting)?;
            for call in &tool_calls {
                let result = self.run_tool(call).await?;
                messages.push(Message::tool(result, &call.id));
            }
        }

        Err(CarebotError::Provider(format!(
            "model produced no answer within {max_rounds} tool round(s)"
        )))
    }

    /// Execute one call. Ordinary failures become a tool-error result for the
    /// model; failures that already exhausted their retries end the turn.
    async fn run_tool(&mut self, call: &ToolCall) -> Result<String> {
        let name = &call.function.name;
        let args = &call.function.arguments;
        tracing::info!("  → {name} ({})", truncate(args, 100));

        match self.ctx.tools.execute(name, args).await {
            Ok(result) => {
                if self.ctx.chat.record_tool_queries {
                    self.tool_records
                        .push(Message::tool_record(format!("{name} {args}")));
                }
                Ok(result.output)
            }
            Err(e) if e.is_exhausted() => Err(e),
            Err(e) => {
                tracing::warn!("chat {}: tool {name} failed: {e}", self.chat_id);
                Ok(format!("Tool error: {e}"))
            }
        }
    }

    /// Append the user message, tool records and answer in one write.
    async fn persist(&self) -> Result<()> {
        let mut batch = Vec::with_capacity(self.tool_records.len() + 2);
        batch.push(Message::user(self.user_message.clone()));
        batch.extend(self.tool_records.iter().cloned());
        batch.push(Message::assistant(self.answer.clone()));

        let mut conn = self.ctx.storage.acquire().await?;
        ChatStore::new(&mut conn).append_messages(&self.chat_id, &batch)
    }

    /// Handle a client disconnect: drop the turn, or keep what was streamed
    /// when partial persistence is enabled.
    pub async fn cancel(&mut self) {
        let persist = self.ctx.chat.persist_partial && !self.answer.is_empty();
        self.fail();
        if !persist {
            tracing::info!("chat {}: client disconnected, turn discarded", self.chat_id);
            return;
        }
        let batch = [
            Message::user(self.user_message.clone()),
            Message::assistant(self.answer.clone()),
        ];
        let result = match self.ctx.storage.acquire().await {
            Ok(mut conn) => ChatStore::new(&mut conn).append_messages(&self.chat_id, &batch),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => tracing::info!("chat {}: client disconnected, partial answer kept", self.chat_id),
            Err(e) => tracing::warn!("chat {}: failed to keep partial answer: {e}", self.chat_id),
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
