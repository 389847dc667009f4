/// Message bus interface used for embedding request/reply and event fan-out.
///
/// The transport itself lives outside this crate; `InProcessBus` is the
/// channel-backed implementation used by the service binary and tests.
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("no responders for subject {0}")]
    NoResponders(String),
    #[error("request on {subject} timed out after {timeout:?}")]
    Timeout { subject: String, timeout: Duration },
    #[error("responder on {0} dropped the request without replying")]
    ReplyDropped(String),
    #[error("message has no reply channel")]
    NoReplyExpected,
    #[error("bus transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Fire-and-forget delivery to every subscriber of `subject`.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Send `payload` to one responder and wait at most `timeout` for its reply.
    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, BusError>;
}

/// A message delivered to a subscriber.
#[derive(Debug)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    reply_to: Option<oneshot::Sender<Vec<u8>>>,
}

impl BusMessage {
    pub fn expects_reply(&self) -> bool {
        self.reply_to.is_some()
    }

    pub fn respond(self, payload: Vec<u8>) -> Result<(), BusError> {
        let reply_to = self.reply_to.ok_or(BusError::NoReplyExpected)?;
        // The requester may already have timed out.
        reply_to
            .send(payload)
            .map_err(|_| BusError::ReplyDropped(self.subject))
    }
}

#[derive(Default)]
pub struct InProcessBus {
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<BusMessage>>>>,
    round_robin: AtomicUsize,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subject: &str) -> mpsc::UnboundedReceiver<BusMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.entry(subject.to_string()).or_default().push(tx);
        debug!("New subscriber on {}", subject);
        rx
    }

    pub fn subscriber_count(&self, subject: &str) -> usize {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match subscribers.get_mut(subject) {
            Some(senders) => {
                senders.retain(|tx| !tx.is_closed());
                senders.len()
            }
            None => 0,
        }
    }

    /// Hands `message` to one live subscriber, pruning closed ones.
    fn deliver_to_one(&self, mut message: BusMessage) -> Result<(), BusError> {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let senders = subscribers
            .get_mut(&message.subject)
            .ok_or_else(|| BusError::NoResponders(message.subject.clone()))?;

        while !senders.is_empty() {
            let idx = self.round_robin.fetch_add(1, Ordering::Relaxed) % senders.len();
            match senders[idx].send(message) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => {
                    senders.remove(idx);
                    message = returned;
                }
            }
        }

        Err(BusError::NoResponders(message.subject))
    }
}

#[async_trait]
impl MessageBus for InProcessBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let Some(senders) = subscribers.get_mut(subject) else {
            debug!("No subscribers on {}, dropping message", subject);
            return Ok(());
        };

        senders.retain(|tx| {
            tx.send(BusMessage {
                subject: subject.to_string(),
                payload: payload.clone(),
                reply_to: None,
            })
            .is_ok()
        });

        Ok(())
    }

    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, BusError> {
        let (tx, rx) = oneshot::channel();
        self.deliver_to_one(BusMessage {
            subject: subject.to_string(),
            payload,
            reply_to: Some(tx),
        })?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(BusError::ReplyDropped(subject.to_string())),
            Err(_) => Err(BusError::Timeout {
                subject: subject.to_string(),
                timeout,
            }),
        }
    }
}
