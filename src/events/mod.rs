//! Topic-filtered publish/subscribe fan-out.
//!
//! Grounded on the teacher's `ws.rs` connection-table pattern (an
//! `Arc<Mutex<HashMap<..>>>` of per-client channels fed by an
//! `mpsc::unbounded_channel`), generalised from a single chat socket to an
//! arbitrary number of topic-filtered subscribers.

pub mod topics;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};

/// The narrow capability the rest of the core depends on. The in-process
/// `EventBus` below is one implementation; a network adapter living outside
/// this crate (e.g. fanning out over a message broker) is another.
pub trait Publisher: Send + Sync {
    fn publish(&self, channel: Option<&str>, message: Value);
}

struct Subscriber {
    channels: HashSet<String>,
    connected_at: chrono::DateTime<Utc>,
    sender: mpsc::UnboundedSender<Value>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ClientInfo {
    pub client_id: String,
    pub channels: Vec<String>,
    pub connected_at: chrono::DateTime<Utc>,
}

/// Builds a canonical outgoing envelope: every message carries a `type` and
/// an ISO-8601 `timestamp`, with the caller's fields flattened alongside
/// rather than nested, so consumers can read them positionally.
pub fn envelope(message_type: &str, fields: Value) -> Value {
    let mut map = match fields {
        Value::Object(map) => map,
        Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };
    map.insert("type".to_string(), json!(message_type));
    map.insert("timestamp".to_string(), json!(Utc::now().to_rfc3339()));
    Value::Object(map)
}

pub struct EventBus {
    subscribers: Arc<Mutex<HashMap<String, Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(EventBus {
            subscribers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Registers `client_id`, returning the receiving half of its outgoing
    /// channel. The caller (a WebSocket handler, an in-process test, ...)
    /// drains this channel and forwards each message to the real transport.
    pub async fn register(
        &self,
        client_id: impl Into<String>,
        channels: impl IntoIterator<Item = String>,
    ) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        let client_id = client_id.into();
        let mut subs = self.subscribers.lock().await;
        subs.insert(
            client_id,
            Subscriber {
                channels: channels.into_iter().collect(),
                connected_at: Utc::now(),
                sender: tx,
            },
        );
        rx
    }

    pub async fn deregister(&self, client_id: &str) {
        self.subscribers.lock().await.remove(client_id);
    }

    pub async fn subscribe(&self, client_id: &str, channels: impl IntoIterator<Item = String>) {
        let mut subs = self.subscribers.lock().await;
        if let Some(sub) = subs.get_mut(client_id) {
            sub.channels.extend(channels);
        }
    }

    pub async fn unsubscribe(&self, client_id: &str, channels: impl IntoIterator<Item = String>) {
        let mut subs = self.subscribers.lock().await;
        if let Some(sub) = subs.get_mut(client_id) {
            for channel in channels {
                sub.channels.remove(&channel);
            }
        }
    }

    pub async fn subscriptions(&self, client_id: &str) -> Vec<String> {
        let subs = self.subscribers.lock().await;
        subs.get(client_id)
            .map(|s| s.channels.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Delivers `message` to every subscriber whose channel set contains
    /// `channel`, or to every live subscriber when `channel` is `None`.
    /// Best-effort: a dead subscriber (closed receiver) is pruned and every
    /// other subscriber is still attempted — one failing transport never
    /// blocks delivery to the rest.
    pub async fn broadcast(&self, message: Value, channel: Option<&str>) {
        broadcast_to(&self.subscribers, message, channel).await;
    }

    pub async fn send_to_client(&self, client_id: &str, message: Value) -> bool {
        let subs = self.subscribers.lock().await;
        match subs.get(client_id) {
            Some(sub) => sub.sender.send(message).is_ok(),
            None => false,
        }
    }

    pub async fn client_info(&self) -> Vec<ClientInfo> {
        let subs = self.subscribers.lock().await;
        subs.iter()
            .map(|(id, sub)| ClientInfo {
                client_id: id.clone(),
                channels: sub.channels.iter().cloned().collect(),
                connected_at: sub.connected_at,
            })
            .collect()
    }

    /// Spawns the 30-second liveness probe: a `pong`-shaped heartbeat that
    /// also serves to prune subscribers whose receiver has been dropped.
    pub fn spawn_liveness_probe(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                bus.broadcast(envelope("pong", json!({})), None).await;
            }
        })
    }
}

async fn broadcast_to(subscribers: &Mutex<HashMap<String, Subscriber>>, message: Value, channel: Option<&str>) {
    let mut subs = subscribers.lock().await;
    subs.retain(|_, sub| {
        let deliver = channel.map(|c| sub.channels.contains(c)).unwrap_or(true);
        if deliver {
            sub.sender.send(message.clone()).is_ok()
        } else {
            !sub.sender.is_closed()
        }
    });
}

impl Publisher for EventBus {
    /// Dispatches onto the runtime so the narrow `Publisher` seam stays
    /// synchronous for callers (the retry engine, activity feed, ...) that
    /// don't want to `.await` every event they emit.
    fn publish(&self, channel: Option<&str>, message: Value) {
        let subscribers = Arc::clone(&self.subscribers);
        let channel = channel.map(|c| c.to_string());
        tokio::spawn(async move {
            broadcast_to(&subscribers, message, channel.as_deref()).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_respects_channel_filter() {
        let bus = EventBus::new();
        let mut a_rx = bus.register("a", ["jobs".to_string()]).await;
        let mut b_rx = bus.register("b", ["other".to_string()]).await;

        bus.broadcast(envelope("job:created", json!({"job_id": "1"})), Some("jobs"))
            .await;

        let received = a_rx.recv().await.unwrap();
        assert_eq!(received["type"], "job:created");
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_with_no_channel_reaches_everyone() {
        let bus = EventBus::new();
        let mut a_rx = bus.register("a", ["jobs".to_string()]).await;
        let mut b_rx = bus.register("b", Vec::<String>::new()).await;

        bus.broadcast(envelope("activity:new", json!({})), None).await;

        assert!(a_rx.recv().await.is_some());
        assert!(b_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn subscribe_is_idempotent_and_unsubscribe_drops_to_zero() {
        let bus = EventBus::new();
        let _rx = bus.register("a", Vec::<String>::new()).await;

        bus.subscribe("a", ["x".to_string()]).await;
        bus.subscribe("a", ["x".to_string()]).await;
        assert_eq!(bus.subscriptions("a").await.len(), 1);

        bus.unsubscribe("a", ["x".to_string()]).await;
        assert_eq!(bus.subscriptions("a").await.len(), 0);
    }

    #[tokio::test]
    async fn a_failing_subscriber_does_not_block_others() {
        let bus = EventBus::new();
        let rx = bus.register("dead", Vec::<String>::new()).await;
        drop(rx);
        let mut alive_rx = bus.register("alive", Vec::<String>::new()).await;

        bus.broadcast(envelope("stats:update", json!({})), None).await;

        assert!(alive_rx.recv().await.is_some());
        assert!(bus.client_info().await.iter().all(|c| c.client_id != "dead"));
    }

    #[tokio::test]
    async fn send_to_client_reports_delivery_success() {
        let bus = EventBus::new();
        let mut rx = bus.register("a", Vec::<String>::new()).await;
        assert!(bus.send_to_client("a", json!({"type": "pong"})).await);
        assert!(rx.recv().await.is_some());
        assert!(!bus.send_to_client("missing", json!({})).await);
    }
}
