// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The in-process worker: drives a [`Generator`] and translates its
//! stream into typed events. Tool activity surfaces as `tool_group`
//! messages merged by `callId`, so a started call and its completion
//! collapse into one group element.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use async_trait::async_trait;
use futures::StreamExt;

use freja_storage::{Conversation, ConversationKind, MessageContent, Position};

use crate::events::{EventKind, WorkerEvent};
use crate::generate::{ContextMessage, GenEvent, GenRequest, GeneratorPool};
use crate::pipeline::Pipeline;
use crate::worker::{Confirmation, SendRequest, StatusCell, TurnSlot, Worker, WorkerStatus};
use crate::{Result, WorkerError};

/// How many recent rows `reload_context` replays.
const CONTEXT_RELOAD_ROWS: u32 = 50;

pub struct IntegratedWorker {
    conversation_id: String,
    workspace: PathBuf,
    model: Option<Value>,
    rules: Option<String>,
    pool: Arc<GeneratorPool>,
    pipeline: Arc<Pipeline>,
    status: StatusCell,
    turn: TurnSlot,
    cancel: std::sync::Mutex<Option<CancellationToken>>,
    context: Arc<Mutex<Vec<ContextMessage>>>,
}

impl IntegratedWorker {
    pub fn new(
        conversation: &Conversation,
        pool: Arc<GeneratorPool>,
        pipeline: Arc<Pipeline>,
    ) -> Arc<Self> {
        let mut seed = Vec::new();
        if let Some(preset) = &conversation.extra.preset_context {
            seed.push(ContextMessage {
                role: "user".into(),
                content: preset.clone(),
            });
        }
        Arc::new(Self {
            conversation_id: conversation.id.clone(),
            workspace: conversation.extra.workspace.clone(),
            model: conversation.model.clone(),
            rules: conversation.extra.rules.clone(),
            pool,
            pipeline,
            status: StatusCell::new(WorkerStatus::Idle),
            turn: TurnSlot::default(),
            cancel: std::sync::Mutex::new(None),
            context: Arc::new(Mutex::new(seed)),
        })
    }

    fn event(&self, kind: EventKind, data: Value, msg_id: &str) -> WorkerEvent {
        WorkerEvent::new(kind, data, msg_id, &self.conversation_id)
    }

    /// The turn body, run on its own task so `send_message` returns at
    /// acceptance. The turn guard travels with it and frees the slot on
    /// every exit path.
    async fn run_turn(self: Arc<Self>, req: SendRequest, token: CancellationToken) {
        let msg_id = req.msg_id.clone();
        let tools_msg_id = format!("{msg_id}-tools");

        let _ = self
            .pipeline
            .ingest(self.event(EventKind::Start, Value::Null, &msg_id))
            .await;

        let generator = match self.pool.get(self.model.as_ref()).await {
            Ok(g) => g,
            Err(e) => {
                self.fail_turn(&msg_id, format!("generator unavailable: {e}"))
                    .await;
                return;
            }
        };

        let request = GenRequest {
            model: self.model.clone(),
            input: req.input.clone(),
            context: self.context.lock().await.clone(),
            rules: self.rules.clone(),
        };

        let mut stream = match generator.generate(request).await {
            Ok(s) => s,
            Err(e) => {
                self.fail_turn(&msg_id, format!("generation failed: {e}")).await;
                return;
            }
        };

        let mut assistant_text = String::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                item = stream.next() => item,
            };
            let Some(item) = next else {
                if token.is_cancelled() {
                    debug!(conversation_id = %self.conversation_id, "turn cancelled");
                    self.remember(&req.input, &assistant_text).await;
                    self.status.set(WorkerStatus::Idle);
                    return;
                }
                break;
            };

            match item {
                Ok(GenEvent::TextDelta(delta)) => {
                    assistant_text.push_str(&delta);
                    let _ = self
                        .pipeline
                        .ingest(self.event(EventKind::Content, json!(delta), &msg_id))
                        .await;
                }
                Ok(GenEvent::ToolCallStarted { call_id, name, args }) => {
                    let item = json!([{
                        "callId": call_id,
                        "name": name,
                        "description": args.to_string(),
                        "renderOutputAsMarkdown": false,
                        "status": "Executing",
                    }]);
                    let _ = self
                        .pipeline
                        .ingest(self.event(EventKind::ToolGroup, item, &tools_msg_id))
                        .await;
                }
                Ok(GenEvent::ToolCallFinished {
                    call_id,
                    output,
                    is_error,
                }) => {
                    let status = if is_error { "Error" } else { "Success" };
                    let item = json!([{
                        "callId": call_id,
                        "name": "",
                        "status": status,
                        "resultDisplay": output,
                    }]);
                    let _ = self
                        .pipeline
                        .ingest(self.event(EventKind::ToolGroup, item, &tools_msg_id))
                        .await;
                }
                Ok(GenEvent::Done) => break,
                Err(e) => {
                    self.fail_turn(&msg_id, format!("stream error: {e}")).await;
                    return;
                }
            }
        }

        let _ = self
            .pipeline
            .ingest(self.event(EventKind::Finish, Value::Null, &msg_id))
            .await;
        self.remember(&req.input, &assistant_text).await;
        self.status.set(WorkerStatus::Idle);
    }

    /// Transport-level failure: one center tips message, turn ends, the
    /// worker stays usable.
    async fn fail_turn(&self, msg_id: &str, message: String) {
        warn!(conversation_id = %self.conversation_id, %message, "turn failed");
        let _ = self
            .pipeline
            .ingest(self.event(EventKind::Error, json!(message), msg_id))
            .await;
        self.status.set(WorkerStatus::Error);
    }

    async fn remember(&self, input: &str, assistant_text: &str) {
        let mut ctx = self.context.lock().await;
        ctx.push(ContextMessage {
            role: "user".into(),
            content: input.to_string(),
        });
        if !assistant_text.is_empty() {
            ctx.push(ContextMessage {
                role: "assistant".into(),
                content: assistant_text.to_string(),
            });
        }
    }
}

#[async_trait]
impl Worker for IntegratedWorker {
    fn kind(&self) -> ConversationKind {
        ConversationKind::Integrated
    }

    fn workspace(&self) -> &Path {
        &self.workspace
    }

    fn status(&self) -> WorkerStatus {
        self.status.get()
    }

    async fn send_message(&self, req: SendRequest) -> Result<()> {
        let guard = self.turn.try_begin()?;
        self.status.set(WorkerStatus::Busy);

        // The user's message is durable as soon as the turn is accepted.
        let user_msg_id = uuid::Uuid::new_v4().to_string();
        self.pipeline
            .ingest(WorkerEvent::new(
                EventKind::UserContent,
                json!(req.input.clone()),
                user_msg_id,
                &self.conversation_id,
            ))
            .await?;

        let token = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.clone());

        let this = Arc::new(self.clone_handle());
        tokio::spawn(async move {
            let _guard = guard;
            this.run_turn(req, token).await;
        });
        Ok(())
    }

    async fn confirm_message(&self, confirmation: Confirmation) -> Result<()> {
        // The integrated generator auto-executes its tools; there is no
        // pending prompt to resolve.
        Err(WorkerError::not_found(format!(
            "no pending confirmation for call {}",
            confirmation.call_id
        )))
    }

    async fn stop(&self) {
        if let Some(token) = self
            .cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            token.cancel();
        }
    }

    async fn reload_context(&self) -> Result<()> {
        let page = self.pipeline.storage().get_conversation_messages(
            &self.conversation_id,
            1,
            CONTEXT_RELOAD_ROWS,
        )?;
        let mut rebuilt = Vec::new();
        for row in &page.data {
            if let MessageContent::Text { content } = &row.content {
                let role = if row.position == Position::Right {
                    "user"
                } else {
                    "assistant"
                };
                rebuilt.push(ContextMessage {
                    role: role.into(),
                    content: content.clone(),
                });
            }
        }
        debug!(
            conversation_id = %self.conversation_id,
            turns = rebuilt.len(),
            "context reloaded from history"
        );
        *self.context.lock().await = rebuilt;
        Ok(())
    }

    async fn shutdown(&self) {
        self.stop().await;
        self.status.set(WorkerStatus::Closed);
    }
}

impl IntegratedWorker {
    /// Cheap clone sharing all interior state, used to move a handle into
    /// the turn task.
    fn clone_handle(&self) -> Self {
        Self {
            conversation_id: self.conversation_id.clone(),
            workspace: self.workspace.clone(),
            model: self.model.clone(),
            rules: self.rules.clone(),
            pool: Arc::clone(&self.pool),
            pipeline: Arc::clone(&self.pipeline),
            status: self.status.clone(),
            turn: self.turn.clone(),
            cancel: std::sync::Mutex::new(None),
            context: Arc::clone(&self.context),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::generate::{GenEvent, Generator, MockGenerator};
    use freja_storage::{ConversationExtra, MessageStatus, Storage};
    use freja_stream::{BufferOptions, StreamBuffer};

    fn harness(script: Vec<GenEvent>) -> (Arc<IntegratedWorker>, Arc<Storage>, String) {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        storage.ensure_system_user().unwrap();
        let mut extra = ConversationExtra::default();
        extra.workspace = "/tmp/ws".into();
        let conversation = Conversation::new("it", ConversationKind::Integrated, extra);
        storage.create_conversation(&conversation).unwrap();

        let buffer = StreamBuffer::new(storage.clone(), BufferOptions::default());
        let pipeline = Pipeline::new(storage.clone(), buffer, EventBus::default());
        let pool = GeneratorPool::new(Box::new(move |_| {
            Ok(Arc::new(MockGenerator::new(script.clone())) as Arc<dyn Generator>)
        }));
        let worker = IntegratedWorker::new(&conversation, pool, pipeline);
        (worker, storage, conversation.id)
    }

    async fn wait_idle(worker: &IntegratedWorker) {
        for _ in 0..200 {
            if worker.status() != WorkerStatus::Busy {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("worker never left busy state");
    }

    fn send(msg_id: &str) -> SendRequest {
        SendRequest {
            input: "do the thing".into(),
            msg_id: msg_id.into(),
            files: None,
            loading_id: None,
        }
    }

    fn text_script(text: &str) -> Vec<GenEvent> {
        let mut script: Vec<GenEvent> = text
            .chars()
            .map(|c| GenEvent::TextDelta(c.to_string()))
            .collect();
        script.push(GenEvent::Done);
        script
    }

    #[tokio::test(start_paused = true)]
    async fn turn_streams_text_and_finishes() {
        let (worker, storage, cid) = harness(text_script("ok then"));
        worker.send_message(send("m1")).await.unwrap();
        wait_idle(&worker).await;

        let row = storage.get_message_by_msg_id(&cid, "m1").unwrap().unwrap();
        assert_eq!(
            row.content,
            MessageContent::Text {
                content: "ok then".into()
            }
        );
        assert_eq!(row.status, MessageStatus::Finish);

        // The user message landed on the right.
        let page = storage.get_conversation_messages(&cid, 1, 10).unwrap();
        assert!(page
            .data
            .iter()
            .any(|m| m.position == Position::Right));
    }

    #[tokio::test(start_paused = true)]
    async fn busy_worker_rejects_second_send() {
        let (worker, _storage, _cid) = harness(vec![]);
        // Claim the slot by hand to model an in-flight turn.
        let _guard = worker.turn.try_begin().unwrap();
        let err = worker.send_message(send("m2")).await.unwrap_err();
        assert!(matches!(err, WorkerError::Busy));
    }

    #[tokio::test(start_paused = true)]
    async fn tool_calls_merge_into_one_group() {
        let script = vec![
            GenEvent::ToolCallStarted {
                call_id: "t1".into(),
                name: "shell".into(),
                args: serde_json::json!({"cmd": "ls"}),
            },
            GenEvent::ToolCallFinished {
                call_id: "t1".into(),
                output: "src".into(),
                is_error: false,
            },
            GenEvent::Done,
        ];
        let (worker, storage, cid) = harness(script);
        worker.send_message(send("m1")).await.unwrap();
        wait_idle(&worker).await;

        let page = storage.get_conversation_messages(&cid, 1, 20).unwrap();
        let groups: Vec<_> = page
            .data
            .iter()
            .filter_map(|m| match &m.content {
                MessageContent::ToolGroup { items } => Some(items),
                _ => None,
            })
            .collect();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 1);
        assert_eq!(groups[0][0].status, "Success");
        assert_eq!(groups[0][0].result_display, Some(serde_json::json!("src")));
    }

    #[tokio::test(start_paused = true)]
    async fn generator_error_produces_tips_and_keeps_worker() {
        struct Failing;
        #[async_trait]
        impl Generator for Failing {
            fn name(&self) -> &str {
                "failing"
            }
            async fn generate(&self, _req: GenRequest) -> anyhow::Result<crate::generate::GenStream> {
                anyhow::bail!("socket closed")
            }
        }

        let storage = Arc::new(Storage::open_in_memory().unwrap());
        storage.ensure_system_user().unwrap();
        let conversation = Conversation::new(
            "it",
            ConversationKind::Integrated,
            ConversationExtra::default(),
        );
        storage.create_conversation(&conversation).unwrap();
        let buffer = StreamBuffer::new(storage.clone(), BufferOptions::default());
        let pipeline = Pipeline::new(storage.clone(), buffer, EventBus::default());
        let pool = GeneratorPool::new(Box::new(|_| Ok(Arc::new(Failing) as Arc<dyn Generator>)));
        let worker = IntegratedWorker::new(&conversation, pool, pipeline);

        worker.send_message(send("m1")).await.unwrap();
        wait_idle(&worker).await;

        let page = storage
            .get_conversation_messages(&conversation.id, 1, 10)
            .unwrap();
        assert!(page.data.iter().any(|m| matches!(
            &m.content,
            MessageContent::Tips { .. }
        )));
        assert_eq!(worker.status(), WorkerStatus::Error);

        // Still usable: the slot is free again.
        assert!(!worker.turn.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn reload_context_replays_text_history() {
        let (worker, storage, cid) = harness(vec![GenEvent::Done]);
        for (content, position) in [("question", Position::Right), ("answer", Position::Left)] {
            let m = freja_storage::StoredMessage::new(
                &cid,
                Some(uuid::Uuid::new_v4().to_string()),
                MessageContent::Text {
                    content: content.into(),
                },
                position,
                MessageStatus::Finish,
            );
            storage.insert_message(&m).unwrap();
        }

        worker.reload_context().await.unwrap();
        let ctx = worker.context.lock().await;
        assert_eq!(ctx.len(), 2);
        assert_eq!(ctx[0].role, "user");
        assert_eq!(ctx[1].role, "assistant");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_first_emission_persists_only_the_user_message() {
        struct Hanging;
        #[async_trait]
        impl Generator for Hanging {
            fn name(&self) -> &str {
                "hanging"
            }
            async fn generate(&self, _req: GenRequest) -> anyhow::Result<crate::generate::GenStream> {
                Ok(Box::pin(futures::stream::pending()))
            }
        }

        let storage = Arc::new(Storage::open_in_memory().unwrap());
        storage.ensure_system_user().unwrap();
        let conversation = Conversation::new(
            "it",
            ConversationKind::Integrated,
            ConversationExtra::default(),
        );
        storage.create_conversation(&conversation).unwrap();
        let buffer = StreamBuffer::new(storage.clone(), BufferOptions::default());
        let pipeline = Pipeline::new(storage.clone(), buffer, EventBus::default());
        let pool = GeneratorPool::new(Box::new(|_| Ok(Arc::new(Hanging) as Arc<dyn Generator>)));
        let worker = IntegratedWorker::new(&conversation, pool, pipeline);

        worker.send_message(send("m1")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        worker.stop().await;
        wait_idle(&worker).await;

        // Only the user's own message made it to storage; the cancelled
        // turn left nothing behind.
        let page = storage
            .get_conversation_messages(&conversation.id, 1, 10)
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.data[0].position, Position::Right);

        // The slot is free; the worker takes the next turn.
        assert!(!worker.turn.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn unsupported_confirm_is_not_found() {
        let (worker, _s, _c) = harness(vec![GenEvent::Done]);
        let err = worker
            .confirm_message(Confirmation {
                confirm_key: "allow".into(),
                msg_id: "m".into(),
                call_id: "c".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::NotFound(_)));
    }
}
