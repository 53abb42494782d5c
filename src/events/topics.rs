//! Canonical message `type` strings and channel names emitted by the core.

pub const CHANNEL_ACTIVITY: &str = "activity";
pub const CHANNEL_JOBS: &str = "jobs";

pub const JOB_CREATED: &str = "job:created";
pub const JOB_STARTED: &str = "job:started";
pub const JOB_COMPLETED: &str = "job:completed";
pub const JOB_FAILED: &str = "job:failed";
pub const RETRY_CREATED: &str = "retry:created";
pub const RETRY_MAX_ATTEMPTS: &str = "retry:max-attempts";
pub const ACTIVITY_NEW: &str = "activity:new";

pub const CONNECTED: &str = "connected";
pub const SUBSCRIBED: &str = "subscribed";
pub const UNSUBSCRIBED: &str = "unsubscribed";
pub const PONG: &str = "pong";
pub const SUBSCRIPTIONS: &str = "subscriptions";
pub const ERROR: &str = "error";
