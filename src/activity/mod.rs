//! Bounded ring buffer of lifecycle activities, fed from the event bus.
//!
//! Grounded on the teacher's `context/worker.rs` pattern of subscribing to
//! its own bus and projecting events into a summarised, bounded log.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::events::{envelope, topics, EventBus, Publisher};

#[derive(Debug, Clone, Serialize)]
pub struct Activity {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub activity_type: String,
    pub message: String,
    pub icon: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<Value>,
}

/// Fields a caller supplies when recording an activity; `id` and
/// `timestamp` are always stamped by the feed itself.
#[derive(Debug, Default, Clone)]
pub struct NewActivity {
    pub activity_type: String,
    pub message: String,
    pub icon: &'static str,
    pub job_id: Option<String>,
    pub job_type: Option<String>,
    pub status: Option<String>,
    pub error: Option<Value>,
    pub duration: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct RecentActivityCounts {
    pub last_hour: usize,
    pub last_day: usize,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct ActivityStats {
    pub type_count: std::collections::HashMap<String, usize>,
    pub recent_activities: RecentActivityCounts,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

fn icon_for(activity_type: &str) -> &'static str {
    match activity_type {
        t if t == topics::JOB_CREATED => "📥",
        t if t == topics::JOB_STARTED => "▶️",
        t if t == topics::JOB_COMPLETED => "✅",
        t if t == topics::JOB_FAILED => "❌",
        t if t == topics::RETRY_CREATED => "🔁",
        t if t == topics::RETRY_MAX_ATTEMPTS => "⛔",
        _ => "•",
    }
}

/// Coerces an arbitrary JSON payload into a non-empty error record. The
/// spec requires this to tolerate any shape a misbehaving pipeline might
/// hand back, never panicking and never producing an empty `message`.
fn normalize_error(raw: &Value, fallback: &str) -> Value {
    match raw {
        Value::Null => json!({ "message": fallback }),
        Value::String(s) if s.is_empty() => json!({ "message": fallback }),
        Value::String(s) => json!({ "message": s }),
        Value::Object(map) => {
            let message = map
                .get("message")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .unwrap_or(fallback)
                .to_string();
            let mut out = serde_json::Map::new();
            out.insert("message".to_string(), json!(message));
            if let Some(code) = map.get("code") {
                out.insert("code".to_string(), code.clone());
            }
            Value::Object(out)
        }
        other => json!({ "message": other.to_string(), "fallback": fallback.is_empty() == false }),
    }
}

pub struct ActivityFeed {
    max_activities: usize,
    activities: Mutex<VecDeque<Activity>>,
    next_id: AtomicU64,
    events: Arc<dyn Publisher>,
}

impl ActivityFeed {
    pub fn new(max_activities: usize, events: Arc<dyn Publisher>) -> Arc<Self> {
        Arc::new(ActivityFeed {
            max_activities,
            activities: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
            events,
        })
    }

    pub async fn add_activity(&self, partial: NewActivity) -> Activity {
        let activity = Activity {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            timestamp: Utc::now(),
            icon: if partial.icon.is_empty() {
                icon_for(&partial.activity_type)
            } else {
                partial.icon
            },
            activity_type: partial.activity_type,
            message: partial.message,
            job_id: partial.job_id,
            job_type: partial.job_type,
            status: partial.status,
            error: partial.error,
            duration: partial.duration,
        };

        {
            let mut activities = self.activities.lock().await;
            activities.push_back(activity.clone());
            while activities.len() > self.max_activities {
                activities.pop_front();
            }
        }

        self.events.publish(
            Some(topics::CHANNEL_ACTIVITY),
            envelope(topics::ACTIVITY_NEW, json!(activity)),
        );

        activity
    }

    pub async fn recent(&self, n: usize) -> Vec<Activity> {
        let activities = self.activities.lock().await;
        activities.iter().rev().take(n).cloned().collect()
    }

    pub async fn stats(&self) -> ActivityStats {
        let activities = self.activities.lock().await;
        let now = Utc::now();
        let mut type_count = std::collections::HashMap::new();
        let mut last_hour = 0;
        let mut last_day = 0;
        for activity in activities.iter() {
            *type_count.entry(activity.activity_type.clone()).or_insert(0) += 1;
            if now - activity.timestamp <= ChronoDuration::hours(1) {
                last_hour += 1;
            }
            if now - activity.timestamp <= ChronoDuration::days(1) {
                last_day += 1;
            }
        }
        ActivityStats {
            type_count,
            recent_activities: RecentActivityCounts {
                last_hour,
                last_day,
                total: activities.len(),
            },
            oldest: activities.front().map(|a| a.timestamp),
            newest: activities.back().map(|a| a.timestamp),
        }
    }

    pub async fn clear(&self) {
        self.activities.lock().await.clear();
    }

    /// Subscribes to the bus's lifecycle channel and converts each message
    /// into an activity record. Runs until the bus drops the receiver.
    pub fn listen(self: &Arc<Self>, bus: &Arc<EventBus>) -> tokio::task::JoinHandle<()> {
        let feed = Arc::clone(self);
        let bus = Arc::clone(bus);
        tokio::spawn(async move {
            let client_id = format!("activity-feed-{}", uuid::Uuid::new_v4());
            let mut rx = bus
                .register(client_id.clone(), [topics::CHANNEL_JOBS.to_string()])
                .await;
            while let Some(message) = rx.recv().await {
                feed.on_message(message).await;
            }
            bus.deregister(&client_id).await;
        })
    }

    async fn on_message(&self, message: Value) {
        let message_type = match message.get("type").and_then(Value::as_str) {
            Some(t) => t.to_string(),
            None => return,
        };

        // `job:*` messages nest the full job record under `job`; `retry:*`
        // messages carry a flat `job_id` instead (no job snapshot exists
        // for the attempt yet). Either way, a reference with no id at all
        // is dropped silently rather than producing a malformed activity.
        let job = message.get("job");
        let job_id = job
            .and_then(|j| j.get("job_id"))
            .or_else(|| message.get("job_id"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty());
        let job_id = match job_id {
            Some(id) => id.to_string(),
            None => return,
        };
        let job_type = job
            .and_then(|j| j.get("pipeline_id"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let (human_message, error, status) = match message_type.as_str() {
            t if t == topics::JOB_CREATED => (format!("Job {job_id} queued"), None, None),
            t if t == topics::JOB_STARTED => (format!("Job {job_id} started"), None, None),
            t if t == topics::JOB_COMPLETED => (
                format!("Job {job_id} completed"),
                None,
                Some("completed".to_string()),
            ),
            t if t == topics::JOB_FAILED => {
                let err = normalize_error(
                    job.and_then(|j| j.get("error")).unwrap_or(&Value::Null),
                    "Job failed with no error details",
                );
                (format!("Job {job_id} failed"), Some(err), Some("failed".to_string()))
            }
            t if t == topics::RETRY_CREATED => {
                let err = normalize_error(message.get("reason").unwrap_or(&Value::Null), "Unknown error");
                let attempt = message.get("attempt").and_then(Value::as_u64).unwrap_or(0);
                (
                    format!("Job {job_id} scheduled for retry (attempt {attempt})"),
                    Some(err),
                    Some("retrying".to_string()),
                )
            }
            t if t == topics::RETRY_MAX_ATTEMPTS => (
                format!("Job {job_id} exhausted its retry budget"),
                None,
                Some("failed".to_string()),
            ),
            _ => return,
        };

        self.add_activity(NewActivity {
            activity_type: message_type,
            message: human_message,
            icon: "",
            job_id: Some(job_id),
            job_type,
            status,
            error,
            duration: message.get("delay_ms").cloned(),
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingPublisher {
        messages: StdMutex<Vec<Value>>,
    }

    impl Publisher for RecordingPublisher {
        fn publish(&self, _channel: Option<&str>, message: Value) {
            self.messages.lock().unwrap().push(message);
        }
    }

    fn feed_with_cap(cap: usize) -> Arc<ActivityFeed> {
        ActivityFeed::new(
            cap,
            Arc::new(RecordingPublisher {
                messages: StdMutex::new(Vec::new()),
            }),
        )
    }

    #[tokio::test]
    async fn add_activity_stamps_monotonic_ids() {
        let feed = feed_with_cap(50);
        let a = feed
            .add_activity(NewActivity {
                activity_type: topics::JOB_CREATED.to_string(),
                message: "x".to_string(),
                ..Default::default()
            })
            .await;
        let b = feed
            .add_activity(NewActivity {
                activity_type: topics::JOB_CREATED.to_string(),
                message: "y".to_string(),
                ..Default::default()
            })
            .await;
        assert!(b.id > a.id);
    }

    #[tokio::test]
    async fn ring_buffer_evicts_oldest_past_capacity() {
        let feed = feed_with_cap(3);
        for i in 0..5 {
            feed.add_activity(NewActivity {
                activity_type: topics::JOB_CREATED.to_string(),
                message: format!("activity {i}"),
                ..Default::default()
            })
            .await;
        }
        let recent = feed.recent(10).await;
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].message, "activity 4");
        assert_eq!(recent[2].message, "activity 2");
    }

    #[tokio::test]
    async fn on_message_drops_events_with_no_job_id() {
        let feed = feed_with_cap(50);
        feed.on_message(envelope(topics::JOB_CREATED, json!({}))).await;
        assert!(feed.recent(10).await.is_empty());
    }

    #[tokio::test]
    async fn job_failed_normalizes_a_non_object_error_payload() {
        let feed = feed_with_cap(50);
        feed.on_message(envelope(
            topics::JOB_FAILED,
            json!({"job": {"job_id": "j1", "error": "boom"}}),
        ))
        .await;
        let recent = feed.recent(1).await;
        assert_eq!(recent[0].error.as_ref().unwrap()["message"], "boom");
    }

    #[tokio::test]
    async fn job_failed_with_null_error_falls_back_to_a_default_message() {
        let feed = feed_with_cap(50);
        feed.on_message(envelope(topics::JOB_FAILED, json!({"job": {"job_id": "j1"}})))
            .await;
        let recent = feed.recent(1).await;
        assert_eq!(
            recent[0].error.as_ref().unwrap()["message"],
            "Job failed with no error details"
        );
    }

    #[tokio::test]
    async fn job_failed_with_an_empty_object_error_falls_back_too() {
        let feed = feed_with_cap(50);
        feed.on_message(envelope(
            topics::JOB_FAILED,
            json!({"job": {"job_id": "j1", "error": {}}}),
        ))
        .await;
        let recent = feed.recent(1).await;
        assert_eq!(
            recent[0].error.as_ref().unwrap()["message"],
            "Job failed with no error details"
        );
    }

    #[tokio::test]
    async fn unrecognised_message_types_are_ignored() {
        let feed = feed_with_cap(50);
        feed.on_message(envelope("scan:progress", json!({"job_id": "j1"}))).await;
        assert!(feed.recent(10).await.is_empty());
    }

    #[tokio::test]
    async fn stats_reports_type_counts_and_bounds() {
        let feed = feed_with_cap(50);
        feed.add_activity(NewActivity {
            activity_type: topics::JOB_CREATED.to_string(),
            message: "a".to_string(),
            ..Default::default()
        })
        .await;
        feed.add_activity(NewActivity {
            activity_type: topics::JOB_CREATED.to_string(),
            message: "b".to_string(),
            ..Default::default()
        })
        .await;
        let stats = feed.stats().await;
        assert_eq!(stats.type_count[topics::JOB_CREATED], 2);
        assert_eq!(stats.recent_activities.total, 2);
        assert_eq!(stats.recent_activities.last_hour, 2);
        assert!(stats.oldest.is_some() && stats.newest.is_some());
    }

    #[tokio::test]
    async fn clear_empties_the_feed() {
        let feed = feed_with_cap(50);
        feed.add_activity(NewActivity {
            activity_type: topics::JOB_CREATED.to_string(),
            message: "a".to_string(),
            ..Default::default()
        })
        .await;
        feed.clear().await;
        assert!(feed.recent(10).await.is_empty());
    }
}
