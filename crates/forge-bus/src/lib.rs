use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use forge_chaos::FaultInjector;
use forge_justice::{JusticeLog, event_type};
use forge_protocol::{AgentId, DeliveryReport, HarnessError, HarnessResult, Message, MessageHandler};
use futures_util::FutureExt;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BusStats {
    pub published: u64,
    pub targets: u64,
    /// Targets whose handler accepted the message.
    pub delivered: u64,
    pub dropped: u64,
    pub handler_errors: u64,
}

impl BusStats {
    /// Fraction of delivery targets that actually received a message.
    pub fn propagation_ratio(&self) -> f64 {
        if self.targets == 0 {
            1.0
        } else {
            self.delivered as f64 / self.targets as f64
        }
    }
}

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    subscriber: AgentId,
    handler: Arc<dyn MessageHandler>,
}

/// Topic-based pub/sub under simulated message loss.
///
/// Every subscriber registered on a topic when `publish` runs is a delivery
/// target, and each target gets its own drop draw. Delivery happens inline,
/// so one subscriber sees messages in publish order.
pub struct MessageBus {
    topics: Mutex<IndexMap<String, Vec<Subscription>>>,
    injector: Arc<FaultInjector>,
    justice: Arc<JusticeLog>,
    drop_rate: Mutex<f64>,
    stats: Mutex<BusStats>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("topics", &self.topics())
            .field("drop_rate", &self.drop_rate())
            .field("stats", &self.stats())
            .finish()
    }
}

impl MessageBus {
    pub fn new(injector: Arc<FaultInjector>, justice: Arc<JusticeLog>, drop_rate: f64) -> Self {
        Self {
            topics: Mutex::new(IndexMap::new()),
            injector,
            justice,
            drop_rate: Mutex::new(sanitize_rate(drop_rate)),
            stats: Mutex::new(BusStats::default()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn drop_rate(&self) -> f64 {
        *self.drop_rate.lock()
    }

    pub fn set_drop_rate(&self, drop_rate: f64) {
        *self.drop_rate.lock() = sanitize_rate(drop_rate);
    }

    pub fn subscribe(
        &self,
        topic: impl Into<String>,
        subscriber: AgentId,
        handler: Arc<dyn MessageHandler>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let topic = topic.into();
        debug!(topic = %topic, subscriber = %subscriber, "subscribed");
        self.topics
            .lock()
            .entry(topic)
            .or_default()
            .push(Subscription {
                id,
                subscriber,
                handler,
            });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut topics = self.topics.lock();
        let mut removed = false;
        for subscriptions in topics.values_mut() {
            let before = subscriptions.len();
            subscriptions.retain(|subscription| subscription.id != id);
            removed |= subscriptions.len() != before;
        }
        topics.retain(|_, subscriptions| !subscriptions.is_empty());
        removed
    }

    /// Drop every subscription held by `subscriber`.
    pub fn unsubscribe_all(&self, subscriber: &AgentId) -> usize {
        let mut topics = self.topics.lock();
        let mut removed = 0;
        for subscriptions in topics.values_mut() {
            let before = subscriptions.len();
            subscriptions.retain(|subscription| &subscription.subscriber != subscriber);
            removed += before - subscriptions.len();
        }
        topics.retain(|_, subscriptions| !subscriptions.is_empty());
        removed
    }

    pub fn clear(&self) {
        self.topics.lock().clear();
    }

    pub fn topics(&self) -> Vec<String> {
        self.topics.lock().keys().cloned().collect()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.lock().get(topic).map_or(0, Vec::len)
    }

    pub fn stats(&self) -> BusStats {
        *self.stats.lock()
    }

    #[instrument(skip(self, payload), fields(topic = %topic, sender = %sender))]
    pub async fn publish(&self, topic: &str, payload: Value, sender: &AgentId) -> Result<DeliveryReport> {
        let message = Message::new(sender.clone(), topic, payload);
        let targets: Vec<Subscription> = self
            .topics
            .lock()
            .get(topic)
            .cloned()
            .unwrap_or_default();
        let drop_rate = self.drop_rate();

        let mut report = DeliveryReport {
            trace_id: Some(message.trace_id.clone()),
            targets: targets.len(),
            ..DeliveryReport::default()
        };

        for target in &targets {
            let entry = delivery_payload(&message, &target.subscriber);
            if self.injector.should_drop(drop_rate) {
                report.dropped += 1;
                warn!(recipient = %target.subscriber, trace_id = %message.trace_id, "message dropped");
                self.record(event_type::MESSAGE_DROPPED, &message.sender, entry).await;
                continue;
            }

            self.record(event_type::MESSAGE_SENT, &message.sender, entry.clone())
                .await;
            let outcome = AssertUnwindSafe(target.handler.handle(&message))
                .catch_unwind()
                .await;
            let rejection = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(error)) => Some(error.to_string()),
                Err(_) => Some("handler panicked".to_owned()),
            };
            match rejection {
                None => {
                    report.delivered += 1;
                    self.record(event_type::MESSAGE_RECEIVED, &target.subscriber, entry)
                        .await;
                }
                Some(reason) => {
                    report.handler_errors += 1;
                    warn!(recipient = %target.subscriber, %reason, "message handler failed");
                    let mut entry = entry;
                    entry["error"] = json!(reason);
                    self.record(event_type::MESSAGE_REJECTED, &target.subscriber, entry)
                        .await;
                }
            }
        }

        {
            let mut stats = self.stats.lock();
            stats.published += 1;
            stats.targets += report.targets as u64;
            stats.delivered += report.delivered as u64;
            stats.dropped += report.dropped as u64;
            stats.handler_errors += report.handler_errors as u64;
        }
        debug!(
            targets = report.targets,
            delivered = report.delivered,
            dropped = report.dropped,
            "message published"
        );
        Ok(report)
    }
}

impl MessageBus {
    /// Append a delivery event. A failed write is reported and skipped so the
    /// remaining recipients are still served.
    async fn record(&self, event: &str, agent_id: &AgentId, payload: Value) {
        if let Err(error) = self.justice.log(event, Some(agent_id), payload).await {
            warn!(event, agent_id = %agent_id, %error, "failed to record delivery event");
        }
    }
}

fn delivery_payload(message: &Message, recipient: &AgentId) -> Value {
    json!({
        "topic": message.topic,
        "payload": message.payload,
        "sender": message.sender,
        "recipient": recipient,
        "trace_id": message.trace_id,
    })
}

fn sanitize_rate(rate: f64) -> f64 {
    if rate.is_finite() {
        rate.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Forwards every delivered message into an unbounded inbox.
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    sender: mpsc::UnboundedSender<Message>,
}

impl ChannelHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl MessageHandler for ChannelHandler {
    async fn handle(&self, message: &Message) -> HarnessResult<()> {
        self.sender
            .send(message.clone())
            .map_err(|_| HarnessError::Io("inbox closed".to_owned()))
    }
}
