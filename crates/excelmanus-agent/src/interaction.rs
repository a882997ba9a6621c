//! Future-based rendezvous between the running loop and out-of-band
//! user decisions.
//!
//! When a tool calls `ask_user` or trips an approval, the engine
//! registers a oneshot slot here and awaits it. The transport resolves
//! the slot from its own handler; the tool call then continues inside
//! the same loop iteration. All registry operations happen on the
//! session's task; cross-task resolution goes through the async mutex.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::events::QuestionOption;

/// Default blocking wait: 10 minutes.
pub const DEFAULT_INTERACTION_TIMEOUT: Duration = Duration::from_secs(600);

/// Outcome of awaiting an interaction.
#[derive(Debug)]
pub enum AwaitOutcome {
    /// The user answered; payload as submitted by the transport.
    Resolved(Value),
    /// Nobody answered within the timeout.
    TimedOut,
    /// The session (or this interaction) was cancelled.
    Cancelled,
}

#[derive(Default)]
pub struct InteractionRegistry {
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
}

impl InteractionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new interaction slot and return its receiver.
    ///
    /// An unresolved slot under the same id is cancelled first (its
    /// receiver observes a closed channel).
    pub async fn create(&self, interaction_id: &str) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().await;
        if pending.insert(interaction_id.to_string(), tx).is_some() {
            log::warn!("replacing unresolved interaction: {}", interaction_id);
        }
        log::debug!("registered interaction wait: {}", interaction_id);
        rx
    }

    /// Submit the user's answer/decision for a pending interaction.
    ///
    /// Returns `false` when the id is unknown or already resolved.
    pub async fn resolve(&self, interaction_id: &str, payload: Value) -> bool {
        let sender = {
            let mut pending = self.pending.lock().await;
            pending.remove(interaction_id)
        };
        match sender {
            Some(tx) => {
                if tx.send(payload).is_err() {
                    log::warn!("interaction receiver dropped: {}", interaction_id);
                    return false;
                }
                log::debug!("interaction resolved: {}", interaction_id);
                true
            }
            None => {
                log::warn!("resolve for unknown interaction: {}", interaction_id);
                false
            }
        }
    }

    /// Cancel one interaction; its awaiting side observes `Cancelled`.
    pub async fn cancel(&self, interaction_id: &str) -> bool {
        let mut pending = self.pending.lock().await;
        pending.remove(interaction_id).is_some()
    }

    /// Cancel every pending interaction. Returns how many were dropped.
    pub async fn cancel_all(&self) -> usize {
        let mut pending = self.pending.lock().await;
        let count = pending.len();
        pending.clear();
        if count > 0 {
            log::info!("cancelled {} pending interactions", count);
        }
        count
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn has_pending(&self, interaction_id: &str) -> bool {
        self.pending.lock().await.contains_key(interaction_id)
    }

    /// Drop slots whose awaiting side has gone away.
    pub async fn cleanup_done(&self) -> usize {
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        pending.retain(|_, tx| !tx.is_closed());
        before - pending.len()
    }

    /// Await a previously created receiver with timeout and
    /// cancellation.
    pub async fn await_response(
        rx: oneshot::Receiver<Value>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> AwaitOutcome {
        tokio::select! {
            result = rx => match result {
                Ok(payload) => AwaitOutcome::Resolved(payload),
                Err(_) => AwaitOutcome::Cancelled,
            },
            _ = tokio::time::sleep(timeout) => AwaitOutcome::TimedOut,
            _ = cancel.cancelled() => AwaitOutcome::Cancelled,
        }
    }
}

// ── question flow ───────────────────────────────────────────────

/// A question the LLM asked the user mid-loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingQuestion {
    pub question_id: String,
    pub tool_call_id: String,
    pub header: String,
    pub text: String,
    pub options: Vec<QuestionOption>,
    pub multi_select: bool,
    pub iteration: usize,
}

/// FIFO queue of pending questions; only the head is "current" and
/// displayed/awaited by the transport.
#[derive(Default)]
pub struct QuestionFlow {
    queue: std::collections::VecDeque<PendingQuestion>,
}

impl QuestionFlow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, question: PendingQuestion) {
        self.queue.push_back(question);
    }

    pub fn current(&self) -> Option<&PendingQuestion> {
        self.queue.front()
    }

    /// Advance past the head question, returning it.
    pub fn pop_current(&mut self) -> Option<PendingQuestion> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── create / resolve lifecycle ─────────────────────────────

    #[tokio::test]
    async fn resolve_delivers_payload_to_awaiter() {
        let registry = InteractionRegistry::new();
        let rx = registry.create("q1").await;

        assert!(registry.resolve("q1", json!({"answer": "yes"})).await);
        let payload = rx.await.unwrap();
        assert_eq!(payload["answer"], "yes");
    }

    #[tokio::test]
    async fn resolve_unknown_id_returns_false() {
        let registry = InteractionRegistry::new();
        assert!(!registry.resolve("ghost", json!(null)).await);
    }

    #[tokio::test]
    async fn resolve_twice_returns_false_second_time() {
        let registry = InteractionRegistry::new();
        let _rx = registry.create("q1").await;
        assert!(registry.resolve("q1", json!(1)).await);
        assert!(!registry.resolve("q1", json!(2)).await);
    }

    #[tokio::test]
    async fn create_replaces_unresolved_slot() {
        let registry = InteractionRegistry::new();
        let old_rx = registry.create("q1").await;
        let new_rx = registry.create("q1").await;

        assert!(registry.resolve("q1", json!("latest")).await);
        // the replaced receiver observes a closed channel
        assert!(old_rx.await.is_err());
        assert_eq!(new_rx.await.unwrap(), json!("latest"));
    }

    #[tokio::test]
    async fn cancel_drops_pending_slot() {
        let registry = InteractionRegistry::new();
        let rx = registry.create("q1").await;
        assert!(registry.cancel("q1").await);
        assert!(rx.await.is_err());
        assert!(!registry.has_pending("q1").await);
    }

    #[tokio::test]
    async fn cancel_all_counts_pending() {
        let registry = InteractionRegistry::new();
        let _a = registry.create("a").await;
        let _b = registry.create("b").await;
        assert_eq!(registry.cancel_all().await, 2);
        assert_eq!(registry.pending_count().await, 0);
    }

    #[tokio::test]
    async fn cleanup_done_drops_closed_receivers() {
        let registry = InteractionRegistry::new();
        let rx = registry.create("gone").await;
        let _kept = registry.create("kept").await;
        drop(rx);
        assert_eq!(registry.cleanup_done().await, 1);
        assert!(registry.has_pending("kept").await);
    }

    // ── await semantics ────────────────────────────────────────

    #[tokio::test]
    async fn await_times_out_without_answer() {
        let registry = InteractionRegistry::new();
        let rx = registry.create("slow").await;
        let cancel = CancellationToken::new();
        let outcome =
            InteractionRegistry::await_response(rx, Duration::from_millis(20), &cancel).await;
        assert!(matches!(outcome, AwaitOutcome::TimedOut));
    }

    #[tokio::test]
    async fn await_observes_cancellation() {
        let registry = InteractionRegistry::new();
        let rx = registry.create("c").await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome =
            InteractionRegistry::await_response(rx, Duration::from_secs(60), &cancel).await;
        assert!(matches!(outcome, AwaitOutcome::Cancelled));
    }

    #[tokio::test]
    async fn await_resolves_before_timeout() {
        let registry = InteractionRegistry::new();
        let rx = registry.create("fast").await;
        registry.resolve("fast", json!(["opt1"])).await;
        let cancel = CancellationToken::new();
        let outcome =
            InteractionRegistry::await_response(rx, Duration::from_secs(60), &cancel).await;
        match outcome {
            AwaitOutcome::Resolved(payload) => assert_eq!(payload, json!(["opt1"])),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    // ── question flow ──────────────────────────────────────────

    fn question(id: &str) -> PendingQuestion {
        PendingQuestion {
            question_id: id.to_string(),
            tool_call_id: "tc".to_string(),
            header: "Pick one".to_string(),
            text: "Which sheet?".to_string(),
            options: vec![],
            multi_select: false,
            iteration: 1,
        }
    }

    #[test]
    fn question_flow_is_fifo() {
        let mut flow = QuestionFlow::new();
        flow.enqueue(question("a"));
        flow.enqueue(question("b"));

        assert_eq!(flow.current().unwrap().question_id, "a");
        assert_eq!(flow.pop_current().unwrap().question_id, "a");
        assert_eq!(flow.current().unwrap().question_id, "b");
        assert_eq!(flow.len(), 1);
    }

    #[test]
    fn pop_on_empty_queue_is_none() {
        let mut flow = QuestionFlow::new();
        assert!(flow.pop_current().is_none());
        assert!(flow.is_empty());
    }
}
