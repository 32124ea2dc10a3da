//! Per-user chat session handler.
//!
//! One handler owns a user's running turn. It consumes client events,
//! spawns/cancels the turn task, and completes approval futures. Sockets
//! come and go (reconnects swap the socket under the same handler); the
//! handler's lifetime is bounded by the registry.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use cq_domain::event::{ChatRequest, ClientEvent, ServerEvent};

use crate::connections::Outbound;
use crate::runtime::approval::ApprovalStore;
use crate::runtime::turn::{run_chat_turn, TurnHandle};
use crate::state::AppState;

struct RunningTurn {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

pub struct SessionHandler {
    pub user_id: i64,
    state: AppState,
    outbound: Arc<Outbound>,
    approvals: Arc<ApprovalStore>,
    running: Mutex<Option<RunningTurn>>,
}

impl SessionHandler {
    pub fn new(state: AppState, user_id: i64) -> Arc<Self> {
        let timeout = Duration::from_secs(state.config.approvals.timeout_secs);
        Arc::new(Self {
            user_id,
            state,
            outbound: Arc::new(Outbound::new()),
            approvals: Arc::new(ApprovalStore::new(timeout)),
            running: Mutex::new(None),
        })
    }

    pub fn outbound(&self) -> Arc<Outbound> {
        self.outbound.clone()
    }

    /// Whether a turn task is currently in flight.
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .map(|turn| !turn.task.is_finished())
            .unwrap_or(false)
    }

    /// Dispatch one client event.
    pub fn handle_event(self: &Arc<Self>, event: ClientEvent) {
        match event {
            ClientEvent::ChatRequest(req) => self.start_turn(req),
            ClientEvent::ToolApprovalResponse(resp) => {
                // Unmatched approval ids are ignored.
                if !self
                    .approvals
                    .resolve(&resp.approval_id, resp.approved, resp.modified_args)
                {
                    tracing::debug!(
                        approval_id = %resp.approval_id,
                        "ignoring approval response with no pending request"
                    );
                }
            }
            ClientEvent::Cancel => self.cancel_running(),
        }
    }

    /// Start a new turn, cancelling any running one first (a chat_request
    /// mid-turn supersedes it, same as an explicit cancel). The superseded
    /// turn finishes its unwind (error + done) before the new turn emits.
    fn start_turn(self: &Arc<Self>, req: ChatRequest) {
        let previous = self.running.lock().take();
        if let Some(previous) = &previous {
            if !previous.task.is_finished() {
                tracing::info!(user_id = self.user_id, "superseding running turn");
                previous.cancel.cancel();
                self.approvals.deny_all();
            }
        }

        let cancel = CancellationToken::new();
        let handle = TurnHandle {
            outbound: self.outbound.clone(),
            approvals: self.approvals.clone(),
            cancel: cancel.clone(),
        };

        let state = self.state.clone();
        let outbound = self.outbound.clone();
        let user_id = self.user_id;
        let span = tracing::info_span!("turn", user_id);
        let task = tokio::spawn(tracing::Instrument::instrument(
            async move {
                if let Some(previous) = previous {
                    let _ = previous.task.await;
                }
                outbound.begin_turn();
                run_chat_turn(state, handle, user_id, req).await;
            },
            span,
        ));

        *self.running.lock() = Some(RunningTurn { cancel, task });
    }

    /// Flag cancellation and release suspended approvals. The turn task
    /// unwinds cooperatively at its next suspension point.
    pub fn cancel_running(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            if !running.task.is_finished() {
                tracing::info!(user_id = self.user_id, "cancelling running turn");
                running.cancel.cancel();
                self.approvals.deny_all();
            }
        }
    }

    /// Surface a boundary error (bad event, socket issue) to the client.
    pub fn send_error(&self, err: &cq_domain::error::Error) {
        self.outbound.send(ServerEvent::error_from(err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cq_domain::event::ServerEvent;
    use cq_store::Store;

    use crate::testing::{scripted_state, seed_agent};

    async fn handler() -> Arc<SessionHandler> {
        let store = Store::in_memory().await.unwrap();
        let state = AppState::new(cq_domain::config::Config::default(), store);
        SessionHandler::new(state, 1)
    }

    fn chat(text: &str) -> ClientEvent {
        ClientEvent::ChatRequest(ChatRequest {
            text: text.into(),
            model_name: "m1".into(),
            conversation_id: None,
            agent_id: None,
            images: vec![],
        })
    }

    #[tokio::test]
    async fn idle_handler_is_not_running() {
        let handler = handler().await;
        assert!(!handler.is_running());
        // Cancel with nothing running is a no-op.
        handler.cancel_running();
    }

    #[tokio::test]
    async fn unmatched_approval_response_is_ignored() {
        let handler = handler().await;
        handler.handle_event(ClientEvent::ToolApprovalResponse(
            cq_domain::event::ToolApprovalResponse {
                approval_id: "ghost".into(),
                approved: true,
                modified_args: None,
            },
        ));
        assert!(!handler.is_running());
    }

    #[tokio::test]
    async fn chat_request_runs_a_turn_to_done() {
        let (state, lm, user) = scripted_state().await;
        seed_agent(&state, user.id, "Echo").await;
        lm.push_content(&["hello"]);

        let handler = SessionHandler::new(state, user.id);
        let (mut rx, _, _) = handler.outbound().attach();
        handler.handle_event(chat("hi"));

        loop {
            let envelope = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(envelope.event, ServerEvent::Done { .. }) {
                break;
            }
        }
    }

    #[tokio::test]
    async fn chat_request_supersedes_running_turn() {
        let (state, lm, user) = scripted_state().await;
        seed_agent(&state, user.id, "Echo").await;
        lm.push_content_then_stall(&["first"]);
        lm.push_content(&["second"]);

        let handler = SessionHandler::new(state, user.id);
        let (mut rx, _, _) = handler.outbound().attach();
        handler.handle_event(chat("one"));

        // Wait for the first turn to stream, then supersede it.
        loop {
            let envelope = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(&envelope.event, ServerEvent::StreamChunk(c) if c.content == "first") {
                break;
            }
        }
        handler.handle_event(chat("two"));

        // The superseded turn unwinds (CANCELLED, done) before the new one
        // completes.
        let mut saw_cancelled = false;
        let mut saw_second = false;
        loop {
            let envelope = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            match &envelope.event {
                ServerEvent::Error { code, .. } if code == "CANCELLED" => {
                    assert!(!saw_second, "old turn unwinds before the new one streams");
                    saw_cancelled = true;
                }
                ServerEvent::StreamChunk(c) if c.content == "second" => {
                    saw_second = true;
                }
                ServerEvent::Done { .. } if saw_second => break,
                _ => {}
            }
        }
        assert!(saw_cancelled);
    }

    #[tokio::test]
    async fn cancel_event_stops_running_turn() {
        let (state, lm, user) = scripted_state().await;
        seed_agent(&state, user.id, "Echo").await;
        lm.push_content_then_stall(&["partial"]);

        let handler = SessionHandler::new(state, user.id);
        let (mut rx, _, _) = handler.outbound().attach();
        handler.handle_event(chat("go"));

        loop {
            let envelope = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(&envelope.event, ServerEvent::StreamChunk(c) if c.content == "partial") {
                break;
            }
        }
        handler.handle_event(ClientEvent::Cancel);

        let mut saw_cancelled = false;
        loop {
            let envelope = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            match &envelope.event {
                ServerEvent::Error { code, .. } if code == "CANCELLED" => saw_cancelled = true,
                ServerEvent::Done { .. } => break,
                _ => {}
            }
        }
        assert!(saw_cancelled);
    }
}
