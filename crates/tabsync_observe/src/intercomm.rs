//! The intercomm mailbox.
//!
//! A table-backed request/reply channel between nodes. A sender inserts a
//! row addressed to a node; the addressee picks it up on its next poll or
//! notification, runs the handler registered for the message type and
//! deletes the row, writing a reply row back in the same transaction when
//! the sender asked for one. Replies are rows of type [`RESPONSE_TYPE`]
//! carrying the request's id.
//!
//! When an addressee is evicted, cleanup hands its reply-expecting messages
//! to the evicting node (see [`redirect`]) so requesters always get an
//! answer, if only a failure.

use crate::error::{ObserveError, ObserveResult};
use crate::node::{self, NodeKind};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tabsync_core::{CoreResult, Database, NodeId, Transaction};
use tabsync_storage::Value;
use tokio::sync::oneshot;

/// Table holding intercomm messages.
pub const INTERCOMM_TABLE: &str = "_intercomm";

/// Message type of reply rows.
pub const RESPONSE_TYPE: &str = "response";

/// One mailbox row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntercommMessage {
    /// Row key; assigned on insert.
    pub id: u64,
    /// Addressee.
    pub destination_node: NodeId,
    /// Sender.
    pub sender_node: NodeId,
    /// Selects the handler on the receiving side.
    pub message_type: String,
    /// Message body. For failed replies, the failure text.
    pub payload: Value,
    /// Whether the sender waits for a reply.
    pub want_reply: bool,
    /// Correlates a request with its reply.
    pub request_id: Option<String>,
    /// Set on replies reporting a failure.
    pub is_failure: bool,
}

impl IntercommMessage {
    fn new(
        destination: NodeId,
        sender: NodeId,
        message_type: &str,
        payload: Value,
        want_reply: bool,
    ) -> Self {
        Self {
            id: 0,
            destination_node: destination,
            sender_node: sender,
            message_type: message_type.to_string(),
            payload,
            want_reply,
            request_id: None,
            is_failure: false,
        }
    }
}

fn message_key(id: u64) -> Value {
    Value::Integer(i64::try_from(id).unwrap_or(i64::MAX))
}

/// Inserts a message and returns its id.
pub fn enqueue(txn: &mut Transaction<'_, '_>, mut message: IntercommMessage) -> CoreResult<u64> {
    let id = txn.allocate_key(INTERCOMM_TABLE)?;
    message.id = id;
    txn.put(INTERCOMM_TABLE, message_key(id), &message)?;
    Ok(id)
}

/// Returns every message addressed to `node`, oldest first.
pub fn addressed_to(
    txn: &Transaction<'_, '_>,
    node: NodeId,
) -> CoreResult<Vec<IntercommMessage>> {
    Ok(txn
        .scan::<IntercommMessage>(INTERCOMM_TABLE)?
        .into_iter()
        .map(|(_, m)| m)
        .filter(|m| m.destination_node == node)
        .collect())
}

/// Removes a message.
pub fn remove(txn: &mut Transaction<'_, '_>, id: u64) -> CoreResult<bool> {
    txn.delete(INTERCOMM_TABLE, &message_key(id))
}

/// Hands the messages of an evicted node over to `to`.
///
/// Messages expecting a reply are readdressed; the rest are deleted.
/// Returns `(redirected, deleted)`.
pub fn redirect(
    txn: &mut Transaction<'_, '_>,
    evicted: NodeId,
    to: NodeId,
) -> CoreResult<(usize, usize)> {
    let mut redirected = 0;
    let mut deleted = 0;
    for mut message in addressed_to(txn, evicted)? {
        if message.want_reply {
            message.destination_node = to;
            txn.put(INTERCOMM_TABLE, message_key(message.id), &message)?;
            redirected += 1;
        } else {
            remove(txn, message.id)?;
            deleted += 1;
        }
    }
    Ok((redirected, deleted))
}

/// Returns the number of messages waiting in the mailbox.
pub fn pending_count(txn: &Transaction<'_, '_>) -> CoreResult<usize> {
    txn.count(INTERCOMM_TABLE)
}

/// Handles one message type. Returns the reply payload or a failure text.
pub type MessageHandler = Arc<dyn Fn(&IntercommMessage) -> Result<Value, String> + Send + Sync>;

type ReplySender = oneshot::Sender<Result<Value, String>>;

/// Waits for the reply to one request.
#[derive(Debug)]
pub struct ReplyHandle {
    request_id: String,
    rx: oneshot::Receiver<Result<Value, String>>,
    timeout: Duration,
    pending: Arc<Mutex<HashMap<String, ReplySender>>>,
}

impl ReplyHandle {
    /// Returns the request id.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Waits for the reply.
    ///
    /// # Errors
    ///
    /// - `ReplyTimeout` if no reply arrived within the configured timeout
    /// - `RemoteFailure` if the addressee answered with a failure
    /// - `Cancelled` if the mailbox was dropped
    pub async fn wait(self) -> ObserveResult<Value> {
        match tokio::time::timeout(self.timeout, self.rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(ObserveError::RemoteFailure(message)),
            Ok(Err(_)) => Err(ObserveError::Cancelled),
            Err(_) => {
                self.pending.lock().remove(&self.request_id);
                Err(ObserveError::ReplyTimeout {
                    request_id: self.request_id,
                })
            }
        }
    }
}

/// Result of one consume pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeReport {
    /// Requests handled (with or without a reply).
    pub handled: usize,
    /// Replies delivered to waiting requesters.
    pub replies_received: usize,
    /// Nodes a reply row was written for.
    pub replied_to: Vec<NodeId>,
}

/// Per-node mailbox: handler registry and pending replies.
pub struct Mailbox {
    db: Arc<Database>,
    reply_timeout: Duration,
    handlers: RwLock<HashMap<String, MessageHandler>>,
    pending: Arc<Mutex<HashMap<String, ReplySender>>>,
}

impl Mailbox {
    /// Creates a mailbox over `db`.
    pub fn new(db: Arc<Database>, reply_timeout: Duration) -> Self {
        Self {
            db,
            reply_timeout,
            handlers: RwLock::new(HashMap::new()),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Registers the handler for `message_type`, replacing any previous one.
    ///
    /// Handlers run inside the consuming transaction, which holds the
    /// mailbox table; they must not send messages themselves.
    pub fn on_message(
        &self,
        message_type: impl Into<String>,
        handler: impl Fn(&IntercommMessage) -> Result<Value, String> + Send + Sync + 'static,
    ) {
        self.handlers
            .write()
            .insert(message_type.into(), Arc::new(handler));
    }

    /// Sends a message from `sender` to `destination`.
    ///
    /// Returns a reply handle when `want_reply` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be stored.
    pub fn send(
        &self,
        sender: NodeId,
        destination: NodeId,
        message_type: &str,
        payload: Value,
        want_reply: bool,
    ) -> ObserveResult<Option<ReplyHandle>> {
        let mut message = IntercommMessage::new(destination, sender, message_type, payload, want_reply);
        let handle = if want_reply {
            let request_id = uuid::Uuid::new_v4().to_string();
            message.request_id = Some(request_id.clone());
            let (tx, rx) = oneshot::channel();
            self.pending.lock().insert(request_id.clone(), tx);
            Some(ReplyHandle {
                request_id,
                rx,
                timeout: self.reply_timeout,
                pending: Arc::clone(&self.pending),
            })
        } else {
            None
        };

        let stored = self
            .db
            .transaction(&[INTERCOMM_TABLE], |txn| enqueue(txn, message));
        if let Err(e) = stored {
            if let Some(handle) = &handle {
                self.pending.lock().remove(handle.request_id());
            }
            return Err(e.into());
        }
        tracing::debug!(from = %sender, to = %destination, message_type, "intercomm message sent");
        Ok(handle)
    }

    /// Sends a message without reply to every other local node, and to
    /// `sender` as well when `include_self` is set.
    ///
    /// Returns the addressees.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be read or a message cannot
    /// be stored.
    pub fn broadcast(
        &self,
        sender: NodeId,
        message_type: &str,
        payload: &Value,
        include_self: bool,
    ) -> ObserveResult<Vec<NodeId>> {
        let addressees = self
            .db
            .transaction(&[node::NODES_TABLE, INTERCOMM_TABLE], |txn| {
                let targets: Vec<NodeId> = node::all(txn)?
                    .into_iter()
                    .filter(|n| n.kind == NodeKind::Local)
                    .filter(|n| include_self || n.id != sender)
                    .map(|n| n.id)
                    .collect();
                for target in &targets {
                    enqueue(
                        txn,
                        IntercommMessage::new(*target, sender, message_type, payload.clone(), false),
                    )?;
                }
                Ok(targets)
            })?;
        Ok(addressees)
    }

    /// Processes every message addressed to `me`.
    ///
    /// Requests are handed to their handler; a request without a handler
    /// is answered with a failure. Replies resolve pending reply handles.
    /// All rows are removed in the same transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the mailbox cannot be read or written.
    pub fn consume(&self, me: NodeId) -> ObserveResult<ConsumeReport> {
        let handlers = self.handlers.read().clone();
        let (report, replies) = self.db.transaction(&[INTERCOMM_TABLE], |txn| {
            let mut report = ConsumeReport::default();
            let mut replies = Vec::new();
            for message in addressed_to(txn, me)? {
                remove(txn, message.id)?;

                if message.message_type == RESPONSE_TYPE {
                    if let Some(request_id) = message.request_id.clone() {
                        let outcome = if message.is_failure {
                            Err(failure_text(&message.payload))
                        } else {
                            Ok(message.payload.clone())
                        };
                        replies.push((request_id, outcome));
                    }
                    continue;
                }

                let outcome = match handlers.get(&message.message_type) {
                    Some(handler) => handler(&message),
                    None => Err(format!(
                        "no handler for message type {:?}",
                        message.message_type
                    )),
                };
                report.handled += 1;

                if message.want_reply {
                    let (payload, is_failure) = match outcome {
                        Ok(value) => (value, false),
                        Err(text) => (Value::Text(text), true),
                    };
                    enqueue(
                        txn,
                        IntercommMessage {
                            id: 0,
                            destination_node: message.sender_node,
                            sender_node: me,
                            message_type: RESPONSE_TYPE.to_string(),
                            payload,
                            want_reply: false,
                            request_id: message.request_id.clone(),
                            is_failure,
                        },
                    )?;
                    report.replied_to.push(message.sender_node);
                } else if let Err(text) = outcome {
                    tracing::warn!(node = %me, message_type = %message.message_type, error = %text, "intercomm message failed");
                }
            }
            Ok((report, replies))
        })?;

        let mut report = report;
        let mut pending = self.pending.lock();
        for (request_id, outcome) in replies {
            if let Some(tx) = pending.remove(&request_id) {
                let _ = tx.send(outcome);
                report.replies_received += 1;
            }
        }
        Ok(report)
    }

    /// Returns the number of requests still waiting for a reply.
    pub fn pending_replies(&self) -> usize {
        self.pending.lock().len()
    }
}

fn failure_text(payload: &Value) -> String {
    payload
        .as_text()
        .map_or_else(|| format!("{payload:?}"), str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabsync_core::Revision;

    fn setup() -> (Arc<Database>, NodeId, NodeId) {
        let db = Arc::new(Database::open_in_memory());
        let (a, b) = db
            .transaction(&[node::NODES_TABLE], |txn| {
                Ok((
                    node::insert_local(txn, Revision::ZERO, 0)?,
                    node::insert_local(txn, Revision::ZERO, 0)?,
                ))
            })
            .unwrap();
        (db, a, b)
    }

    fn pending(db: &Database) -> usize {
        db.transaction(&[INTERCOMM_TABLE], |txn| pending_count(txn))
            .unwrap()
    }

    #[tokio::test]
    async fn request_and_reply() {
        let (db, a, b) = setup();
        let sender = Mailbox::new(Arc::clone(&db), Duration::from_secs(1));
        let receiver = Mailbox::new(Arc::clone(&db), Duration::from_secs(1));
        receiver.on_message("ping", |m| Ok(Value::Array(vec![Value::from("pong"), m.payload.clone()])));

        let handle = sender
            .send(a, b, "ping", Value::Integer(7), true)
            .unwrap()
            .unwrap();
        assert_eq!(sender.pending_replies(), 1);

        let report = receiver.consume(b).unwrap();
        assert_eq!(report.handled, 1);
        assert_eq!(report.replied_to, vec![a]);

        let report = sender.consume(a).unwrap();
        assert_eq!(report.replies_received, 1);
        assert_eq!(
            handle.wait().await.unwrap(),
            Value::Array(vec![Value::from("pong"), Value::Integer(7)])
        );
        assert_eq!(pending(&db), 0);
    }

    #[tokio::test]
    async fn missing_handler_answers_with_failure() {
        let (db, a, b) = setup();
        let sender = Mailbox::new(Arc::clone(&db), Duration::from_secs(1));
        let receiver = Mailbox::new(Arc::clone(&db), Duration::from_secs(1));

        let handle = sender.send(a, b, "unknown", Value::Null, true).unwrap().unwrap();
        receiver.consume(b).unwrap();
        sender.consume(a).unwrap();
        assert!(matches!(
            handle.wait().await,
            Err(ObserveError::RemoteFailure(text)) if text.contains("unknown")
        ));
    }

    #[tokio::test]
    async fn unanswered_request_times_out() {
        let (db, a, b) = setup();
        let sender = Mailbox::new(db, Duration::from_millis(20));
        let handle = sender.send(a, b, "ping", Value::Null, true).unwrap().unwrap();
        assert!(matches!(
            handle.wait().await,
            Err(ObserveError::ReplyTimeout { .. })
        ));
        assert_eq!(sender.pending_replies(), 0);
    }

    #[test]
    fn fire_and_forget_is_consumed_once() {
        let (db, a, b) = setup();
        let mailbox = Mailbox::new(Arc::clone(&db), Duration::from_secs(1));
        assert!(mailbox.send(a, b, "note", Value::Null, false).unwrap().is_none());
        assert_eq!(pending(&db), 1);
        assert_eq!(mailbox.consume(a).unwrap().handled, 0);
        assert_eq!(mailbox.consume(b).unwrap().handled, 1);
        assert_eq!(mailbox.consume(b).unwrap().handled, 0);
        assert_eq!(pending(&db), 0);
    }

    #[test]
    fn broadcast_skips_sender_unless_asked() {
        let (db, a, b) = setup();
        let mailbox = Mailbox::new(Arc::clone(&db), Duration::from_secs(1));
        assert_eq!(mailbox.broadcast(a, "hello", &Value::Null, false).unwrap(), vec![b]);
        assert_eq!(
            mailbox.broadcast(a, "hello", &Value::Null, true).unwrap(),
            vec![a, b]
        );
        assert_eq!(pending(&db), 3);
    }

    #[test]
    fn redirect_keeps_only_reply_expecting_messages() {
        let (db, a, b) = setup();
        let mailbox = Mailbox::new(Arc::clone(&db), Duration::from_secs(1));
        mailbox.send(a, b, "ask", Value::Null, true).unwrap();
        mailbox.send(a, b, "tell", Value::Null, false).unwrap();

        let (redirected, deleted) = db
            .transaction(&[INTERCOMM_TABLE], |txn| redirect(txn, b, a))
            .unwrap();
        assert_eq!((redirected, deleted), (1, 1));

        let for_a = db
            .transaction(&[INTERCOMM_TABLE], |txn| addressed_to(txn, a))
            .unwrap();
        assert_eq!(for_a.len(), 1);
        assert_eq!(for_a[0].message_type, "ask");
        assert!(for_a[0].want_reply);
    }
}
