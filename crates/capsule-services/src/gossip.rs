//! Gossip bus: topic-based, best-effort publish/subscribe fan-out.
//!
//! Two backends:
//!   - Local relay: a single dispatcher task owns the topic registry and
//!     drains one command queue. Joins, subscribes, leaves, and publishes
//!     are applied in queue order, so a publish reaches exactly the
//!     subscribers registered before it was enqueued.
//!   - Overlay: delegates to an external `PubSubCapability`.
//!
//! There is no replay and no delivery confirmation. A subscriber whose
//! channel is closed or full is dropped from the registry; dispatch never
//! waits on a subscriber.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashSet;
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

pub type SubscriberId = u64;

#[derive(Debug, Error)]
pub enum GossipError {
    #[error("gossip bus is shut down")]
    Closed,
    #[error("overlay pub/sub failed: {0}")]
    Overlay(String),
}

/// An overlay pub/sub network, when one is available.
#[async_trait]
pub trait PubSubCapability: Send + Sync {
    async fn join(&self, topic: &str) -> Result<(), GossipError>;
    async fn publish(&self, topic: &str, data: Bytes) -> Result<(), GossipError>;
    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, Bytes>, GossipError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicInfo {
    pub name: String,
    pub subscribers: usize,
}

// ── Relay dispatcher ─────────────────────────────────────────────────────────

enum Command {
    Join {
        topic: String,
        ack: oneshot::Sender<()>,
    },
    Subscribe {
        topic: String,
        id: SubscriberId,
        tx: mpsc::Sender<Bytes>,
        ack: oneshot::Sender<()>,
    },
    Leave {
        topic: String,
        id: SubscriberId,
    },
    Publish {
        topic: String,
        message: Bytes,
    },
    Topics {
        reply: oneshot::Sender<Vec<TopicInfo>>,
    },
    Shutdown,
}

/// Owns the registry. Nothing else touches it.
struct RelayDispatcher {
    topics: HashMap<String, HashMap<SubscriberId, mpsc::Sender<Bytes>>>,
    commands: mpsc::Receiver<Command>,
}

impl RelayDispatcher {
    async fn run(mut self) {
        tracing::debug!("gossip dispatcher starting");
        while let Some(cmd) = self.commands.recv().await {
            match cmd {
                Command::Join { topic, ack } => {
                    self.topics.entry(topic).or_default();
                    let _ = ack.send(());
                }
                Command::Subscribe { topic, id, tx, ack } => {
                    self.topics.entry(topic).or_default().insert(id, tx);
                    let _ = ack.send(());
                }
                Command::Leave { topic, id } => self.leave(&topic, id),
                Command::Publish { topic, message } => self.fan_out(&topic, message),
                Command::Topics { reply } => {
                    let info = self
                        .topics
                        .iter()
                        .map(|(name, subs)| TopicInfo {
                            name: name.clone(),
                            subscribers: subs.len(),
                        })
                        .collect();
                    let _ = reply.send(info);
                }
                Command::Shutdown => break,
            }
        }
        tracing::debug!(topics = self.topics.len(), "gossip dispatcher stopped");
    }

    fn leave(&mut self, topic: &str, id: SubscriberId) {
        if let Some(subs) = self.topics.get_mut(topic) {
            subs.remove(&id);
            if subs.is_empty() {
                self.topics.remove(topic);
            }
        }
    }

    fn fan_out(&mut self, topic: &str, message: Bytes) {
        let Some(subs) = self.topics.get_mut(topic) else {
            tracing::trace!(topic, "publish to topic with no subscribers");
            return;
        };

        subs.retain(|id, tx| match tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(topic, subscriber = id, "subscriber not keeping up, dropping it");
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(topic, subscriber = id, "subscriber disconnected");
                false
            }
        });

        tracing::trace!(topic, delivered = subs.len(), "message fanned out");
        if subs.is_empty() {
            self.topics.remove(topic);
        }
    }
}

// ── Bus ──────────────────────────────────────────────────────────────────────

enum Backend {
    Relay {
        commands: mpsc::Sender<Command>,
    },
    Overlay {
        capability: Arc<dyn PubSubCapability>,
        joined: DashSet<String>,
    },
}

struct BusInner {
    backend: Backend,
    next_id: AtomicU64,
    subscriber_buffer: usize,
}

/// Cloneable handle to one bus instance.
#[derive(Clone)]
pub struct GossipBus {
    inner: Arc<BusInner>,
}

impl GossipBus {
    /// Local relay mode. Spawns the dispatcher; must be called inside a runtime.
    pub fn local(queue_capacity: usize, subscriber_buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let dispatcher = RelayDispatcher {
            topics: HashMap::new(),
            commands: rx,
        };
        tokio::spawn(dispatcher.run());
        Self::with_backend(Backend::Relay { commands: tx }, subscriber_buffer)
    }

    /// Backed by an overlay pub/sub capability.
    pub fn overlay(capability: Arc<dyn PubSubCapability>, subscriber_buffer: usize) -> Self {
        Self::with_backend(
            Backend::Overlay {
                capability,
                joined: DashSet::new(),
            },
            subscriber_buffer,
        )
    }

    fn with_backend(backend: Backend, subscriber_buffer: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                backend,
                next_id: AtomicU64::new(1),
                subscriber_buffer: subscriber_buffer.max(1),
            }),
        }
    }

    /// Join a topic. Idempotent: every call yields a handle to the same topic.
    pub async fn join(&self, topic: &str) -> Result<TopicHandle, GossipError> {
        match &self.inner.backend {
            Backend::Relay { commands } => {
                let (ack, done) = oneshot::channel();
                commands
                    .send(Command::Join {
                        topic: topic.to_string(),
                        ack,
                    })
                    .await
                    .map_err(|_| GossipError::Closed)?;
                done.await.map_err(|_| GossipError::Closed)?;
            }
            Backend::Overlay { capability, joined } => {
                if !joined.contains(topic) {
                    capability.join(topic).await?;
                    joined.insert(topic.to_string());
                }
            }
        }
        Ok(TopicHandle {
            bus: self.clone(),
            name: topic.to_string(),
        })
    }

    /// Best-effort delivery to every subscriber registered at call time.
    pub async fn publish(&self, topic: &str, message: impl Into<Bytes>) -> Result<(), GossipError> {
        let message = message.into();
        match &self.inner.backend {
            Backend::Relay { commands } => commands
                .send(Command::Publish {
                    topic: topic.to_string(),
                    message,
                })
                .await
                .map_err(|_| GossipError::Closed),
            Backend::Overlay { capability, .. } => capability.publish(topic, message).await,
        }
    }

    /// Unbounded message stream for `topic`, until cancelled or the bus is torn down.
    pub async fn subscribe(&self, topic: &str) -> Result<Subscription, GossipError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.subscriber_buffer);

        let cancel = match &self.inner.backend {
            Backend::Relay { commands } => {
                let (ack, done) = oneshot::channel();
                commands
                    .send(Command::Subscribe {
                        topic: topic.to_string(),
                        id,
                        tx,
                        ack,
                    })
                    .await
                    .map_err(|_| GossipError::Closed)?;
                done.await.map_err(|_| GossipError::Closed)?;
                CancelHook::Relay(commands.clone())
            }
            Backend::Overlay { capability, joined } => {
                if !joined.contains(topic) {
                    capability.join(topic).await?;
                    joined.insert(topic.to_string());
                }
                let mut upstream = capability.subscribe(topic).await?;
                let forwarder = tokio::spawn(async move {
                    while let Some(msg) = upstream.next().await {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                });
                CancelHook::Overlay(forwarder.abort_handle())
            }
        };

        tracing::debug!(topic, subscriber = id, "subscribed");
        Ok(Subscription {
            topic: topic.to_string(),
            id,
            rx,
            cancel: Some(cancel),
        })
    }

    /// Topics currently known to this bus with their subscriber counts.
    pub async fn topics(&self) -> Result<Vec<TopicInfo>, GossipError> {
        match &self.inner.backend {
            Backend::Relay { commands } => {
                let (reply, rx) = oneshot::channel();
                commands
                    .send(Command::Topics { reply })
                    .await
                    .map_err(|_| GossipError::Closed)?;
                rx.await.map_err(|_| GossipError::Closed)
            }
            Backend::Overlay { joined, .. } => Ok(joined
                .iter()
                .map(|t| TopicInfo {
                    name: t.clone(),
                    subscribers: 0,
                })
                .collect()),
        }
    }

    /// Tear the bus down. Every open subscription stream ends.
    pub async fn shutdown(&self) {
        if let Backend::Relay { commands } = &self.inner.backend {
            let _ = commands.send(Command::Shutdown).await;
        }
    }
}

/// A joined topic.
#[derive(Clone)]
pub struct TopicHandle {
    bus: GossipBus,
    name: String,
}

impl TopicHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn publish(&self, message: impl Into<Bytes>) -> Result<(), GossipError> {
        self.bus.publish(&self.name, message).await
    }

    pub async fn subscribe(&self) -> Result<Subscription, GossipError> {
        self.bus.subscribe(&self.name).await
    }
}

enum CancelHook {
    Relay(mpsc::Sender<Command>),
    Overlay(AbortHandle),
}

/// A cancellable stream of messages from one topic.
///
/// Dropping the subscription cancels it.
pub struct Subscription {
    topic: String,
    id: SubscriberId,
    rx: mpsc::Receiver<Bytes>,
    cancel: Option<CancelHook>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next message, or `None` once cancelled or the bus is gone.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Stop receiving. Messages already buffered are discarded.
    pub fn cancel(&mut self) {
        match self.cancel.take() {
            Some(CancelHook::Relay(commands)) => {
                // If the queue is full the dispatcher still drops us on the
                // next delivery, when it finds the receiver closed.
                let _ = commands.try_send(Command::Leave {
                    topic: self.topic.clone(),
                    id: self.id,
                });
            }
            Some(CancelHook::Overlay(forwarder)) => forwarder.abort(),
            None => {}
        }
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl Stream for Subscription {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn all_current_subscribers_receive() {
        let bus = GossipBus::local(64, 16);
        let room = bus.join("room1").await.unwrap();
        let mut subs = Vec::new();
        for _ in 0..3 {
            subs.push(room.subscribe().await.unwrap());
        }

        room.publish("hello").await.unwrap();
        for sub in subs.iter_mut() {
            let msg = timeout(WAIT, sub.recv()).await.unwrap().unwrap();
            assert_eq!(msg, "hello");
        }
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_publish() {
        let bus = GossipBus::local(64, 16);
        let mut early = bus.subscribe("room1").await.unwrap();
        bus.publish("room1", "first").await.unwrap();

        let mut late = bus.subscribe("room1").await.unwrap();
        bus.publish("room1", "second").await.unwrap();

        assert_eq!(timeout(WAIT, early.recv()).await.unwrap().unwrap(), "first");
        assert_eq!(timeout(WAIT, early.recv()).await.unwrap().unwrap(), "second");
        assert_eq!(timeout(WAIT, late.recv()).await.unwrap().unwrap(), "second");
    }

    #[tokio::test]
    async fn join_is_idempotent() {
        let bus = GossipBus::local(64, 16);
        let a = bus.join("t").await.unwrap();
        let b = bus.join("t").await.unwrap();
        assert_eq!(a.name(), b.name());
        let topics = bus.topics().await.unwrap();
        assert_eq!(topics, vec![TopicInfo { name: "t".into(), subscribers: 0 }]);
    }

    #[tokio::test]
    async fn subscriber_ids_are_unique() {
        let bus = GossipBus::local(64, 16);
        let a = bus.subscribe("t").await.unwrap();
        let b = bus.subscribe("t").await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(bus.topics().await.unwrap()[0].subscribers, 2);
    }

    #[tokio::test]
    async fn cancelled_subscriber_leaves_the_registry() {
        let bus = GossipBus::local(64, 16);
        let mut keep = bus.subscribe("t").await.unwrap();
        let gone = bus.subscribe("t").await.unwrap();
        drop(gone);

        bus.publish("t", "m").await.unwrap();
        assert_eq!(timeout(WAIT, keep.recv()).await.unwrap().unwrap(), "m");
        assert_eq!(bus.topics().await.unwrap()[0].subscribers, 1);
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_without_blocking_others() {
        let bus = GossipBus::local(64, 1);
        let mut slow = bus.subscribe("t").await.unwrap();
        let mut fast = bus.subscribe("t").await.unwrap();

        bus.publish("t", "1").await.unwrap();
        assert_eq!(timeout(WAIT, fast.recv()).await.unwrap().unwrap(), "1");
        bus.publish("t", "2").await.unwrap();
        assert_eq!(timeout(WAIT, fast.recv()).await.unwrap().unwrap(), "2");

        // The slow subscriber got the first message, then was removed.
        assert_eq!(timeout(WAIT, slow.recv()).await.unwrap().unwrap(), "1");
        assert!(timeout(WAIT, slow.recv()).await.unwrap().is_none());
        assert_eq!(bus.topics().await.unwrap()[0].subscribers, 1);
    }

    #[tokio::test]
    async fn shutdown_ends_every_stream() {
        let bus = GossipBus::local(64, 16);
        let mut sub = bus.subscribe("t").await.unwrap();
        bus.shutdown().await;
        assert!(timeout(WAIT, sub.recv()).await.unwrap().is_none());
        assert!(matches!(bus.publish("t", "x").await, Err(GossipError::Closed)));
    }

    #[tokio::test]
    async fn subscription_is_a_stream() {
        let bus = GossipBus::local(64, 16);
        let sub = bus.subscribe("t").await.unwrap();
        bus.publish("t", "a").await.unwrap();
        bus.publish("t", "b").await.unwrap();
        let got: Vec<Bytes> = timeout(WAIT, sub.take(2).collect()).await.unwrap();
        assert_eq!(got, vec!["a", "b"]);
    }

    /// Overlay stub: a broadcast channel per process.
    struct LoopbackOverlay {
        tx: tokio::sync::broadcast::Sender<(String, Bytes)>,
        joins: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PubSubCapability for LoopbackOverlay {
        async fn join(&self, topic: &str) -> Result<(), GossipError> {
            self.joins.lock().unwrap().push(topic.to_string());
            Ok(())
        }

        async fn publish(&self, topic: &str, data: Bytes) -> Result<(), GossipError> {
            self.tx
                .send((topic.to_string(), data))
                .map(|_| ())
                .map_err(|e| GossipError::Overlay(e.to_string()))
        }

        async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, Bytes>, GossipError> {
            let topic = topic.to_string();
            let rx = self.tx.subscribe();
            Ok(futures::stream::unfold(rx, move |mut rx| {
                let topic = topic.clone();
                async move {
                    loop {
                        match rx.recv().await {
                            Ok((t, data)) if t == topic => return Some((data, rx)),
                            Ok(_) => continue,
                            Err(_) => return None,
                        }
                    }
                }
            })
            .boxed())
        }
    }

    #[tokio::test]
    async fn overlay_backend_delegates_to_capability() {
        let (tx, _) = tokio::sync::broadcast::channel(16);
        let overlay = Arc::new(LoopbackOverlay {
            tx,
            joins: std::sync::Mutex::new(Vec::new()),
        });
        let bus = GossipBus::overlay(overlay.clone(), 16);

        bus.join("t").await.unwrap();
        bus.join("t").await.unwrap();
        let mut sub = bus.subscribe("t").await.unwrap();
        bus.publish("other", "ignored").await.unwrap();
        bus.publish("t", "via overlay").await.unwrap();

        assert_eq!(
            timeout(WAIT, sub.recv()).await.unwrap().unwrap(),
            "via overlay"
        );
        assert_eq!(overlay.joins.lock().unwrap().len(), 1);
    }
}
