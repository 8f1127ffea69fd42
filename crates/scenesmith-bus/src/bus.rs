use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use scenesmith_types::{Message, MessagePayload, Priority, Role};
use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{BusError, Result};
use crate::inbox::Inbox;

enum Outcome {
    Response(Message),
    Cancelled,
}

struct Pending {
    tx: oneshot::Sender<Outcome>,
    sender: Role,
    recipient: Role,
    session_id: Uuid,
}

/// Typed request/response routing between agent roles over bounded priority
/// inboxes (spec.md §4.3). One `Bus` is shared for the lifetime of the
/// process; each session's workflow engine and each registered worker hold a
/// clone of the same handle.
#[derive(Clone)]
pub struct Bus {
    inboxes: Arc<Mutex<HashMap<Role, Arc<Inbox>>>>,
    pending: Arc<Mutex<HashMap<Uuid, Pending>>>,
    inbox_capacity: usize,
    progress: broadcast::Sender<(Uuid, String)>,
}

impl Bus {
    pub fn new(inbox_capacity: usize) -> Self {
        let (progress, _) = broadcast::channel(256);
        Self {
            inboxes: Arc::new(Mutex::new(HashMap::new())),
            pending: Arc::new(Mutex::new(HashMap::new())),
            inbox_capacity,
            progress,
        }
    }

    /// Out-of-band notice for events that aren't a reply to any particular
    /// request — currently only the Agent Runtime's `rate_limiting` notice
    /// between backoff attempts (spec.md §4.4 item 4). Subscribers are the
    /// Workflow Engine instances watching their own session's id; a notice
    /// with no subscriber listening is simply dropped.
    pub fn notify_progress(&self, session_id: Uuid, text: impl Into<String>) {
        let _ = self.progress.send((session_id, text.into()));
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<(Uuid, String)> {
        self.progress.subscribe()
    }

    /// Returns the shared inbox for `role`, creating it on first use. Every
    /// worker in a role's pool calls this to obtain the same inbox handle.
    pub async fn inbox_for(&self, role: Role) -> Arc<Inbox> {
        let mut inboxes = self.inboxes.lock().await;
        inboxes
            .entry(role)
            .or_insert_with(|| Arc::new(Inbox::new(self.inbox_capacity)))
            .clone()
    }

    /// Fire-and-forget delivery, subject to the recipient inbox's backpressure.
    pub async fn send(&self, msg: Message) -> Result<()> {
        let recipient = msg.to.ok_or(BusError::NoRecipient)?;
        let wait = msg.timeout().unwrap_or(Duration::from_secs(u64::MAX / 2));
        let inbox = self.inbox_for(recipient).await;
        inbox.push(msg, wait).await
    }

    /// Synchronous-looking request/response built on send + a correlated
    /// completion handle (spec.md §4.3). Resolves when a matching `respond`
    /// call arrives, `cancel` is invoked for this request id, or `timeout`
    /// elapses.
    pub async fn request(
        &self,
        sender: Role,
        recipient: Role,
        priority: Priority,
        payload: MessagePayload,
        timeout: Duration,
    ) -> Result<Message> {
        let msg = Message::new(sender, Some(recipient), priority, payload).with_timeout(timeout);
        let request_id = msg.id;
        let session_id = msg.payload.session_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(request_id, Pending { tx, sender, recipient, session_id });
        }

        if let Err(err) = self.send(msg).await {
            self.pending.lock().await.remove(&request_id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Outcome::Response(response))) => Ok(response),
            Ok(Ok(Outcome::Cancelled)) => Err(BusError::Cancelled(request_id)),
            Ok(Err(_closed)) => Err(BusError::WorkerFailed(request_id)),
            Err(_elapsed) => {
                self.pending.lock().await.remove(&request_id);
                Err(BusError::ResponseTimeout(request_id))
            }
        }
    }

    /// Called by an agent worker once it has produced a reply to a request
    /// it received. `request_id` is the id of the original request message
    /// (echoed as the response's `correlation_id`).
    pub async fn respond(&self, request_id: Uuid, response: Message) {
        let entry = self.pending.lock().await.remove(&request_id);
        match entry {
            Some(pending) => {
                if pending.tx.send(Outcome::Response(response)).is_err() {
                    debug!(%request_id, "response arrived after requester stopped waiting");
                }
            }
            None => {
                warn!(%request_id, "response arrived for an unknown or already-resolved request");
            }
        }
    }

    /// Fans a cancellation out: resolves the pending waiter (if any) with
    /// `Cancelled`, and pushes a `Cancel` message into the recipient's
    /// inbox so an in-progress worker abandons the task instead of
    /// publishing a response.
    pub async fn cancel(&self, session_id: Uuid, request_id: Uuid) -> Result<()> {
        let entry = self.pending.lock().await.remove(&request_id);
        let Some(pending) = entry else {
            return Ok(());
        };
        let sender = pending.sender;
        let recipient = pending.recipient;
        let _ = pending.tx.send(Outcome::Cancelled);
        let cancel_msg = Message::new(sender, Some(recipient), Priority::Critical, MessagePayload::Cancel { session_id });
        let inbox = self.inbox_for(pending.recipient).await;
        // Cancellation is best-effort and must not itself block on
        // backpressure; critical priority plus a zero wait is the signal
        // that it should be dropped rather than queued behind real work
        // only in the pathological case where the inbox is already full of
        // other critical messages.
        let _ = inbox.push(cancel_msg, Duration::from_millis(50)).await;
        Ok(())
    }

    /// Cancels every pending request belonging to `session_id`. This is how
    /// the Workflow Engine's per-session cancellation token fans out across
    /// however many sibling fan-out requests happen to be outstanding
    /// (spec.md §5, suspension point (ii)).
    pub async fn cancel_session(&self, session_id: Uuid) {
        let ids: Vec<Uuid> = self
            .pending
            .lock()
            .await
            .iter()
            .filter(|(_, p)| p.session_id == session_id)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            let _ = self.cancel(session_id, id).await;
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}
