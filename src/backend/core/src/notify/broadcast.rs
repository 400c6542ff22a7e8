//! Live job status/progress/log fan-out to dashboard observers.
//!
//! Delivery is best-effort: events sent while nobody is subscribed are
//! dropped, and lagging subscribers lose the oldest events.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// Severity attached to a job log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// One event pushed to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BroadcastEvent {
    Status {
        job: String,
        state: String,
        extra: Option<serde_json::Value>,
        at: DateTime<Utc>,
    },
    Progress {
        job: String,
        percent: u8,
        at: DateTime<Utc>,
    },
    Log {
        job: String,
        message: String,
        level: LogLevel,
        at: DateTime<Utc>,
    },
}

/// Sink for live status events. Calls never block and never fail.
pub trait BroadcastSink: Send + Sync {
    fn status(&self, job: &str, state: &str, extra: Option<serde_json::Value>);
    fn progress(&self, job: &str, percent: u8);
    fn log(&self, job: &str, message: &str, level: LogLevel);
}

/// [`BroadcastSink`] backed by a tokio broadcast channel.
pub struct ChannelBroadcaster {
    sender: broadcast::Sender<BroadcastEvent>,
    total_sent: AtomicU64,
    total_dropped: AtomicU64,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            total_sent: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// `(sent, dropped)` counters.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.total_sent.load(Ordering::Relaxed),
            self.total_dropped.load(Ordering::Relaxed),
        )
    }

    fn send(&self, event: BroadcastEvent) {
        match self.sender.send(event) {
            Ok(_) => self.total_sent.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.total_dropped.fetch_add(1, Ordering::Relaxed),
        };
    }
}

impl Default for ChannelBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

impl BroadcastSink for ChannelBroadcaster {
    fn status(&self, job: &str, state: &str, extra: Option<serde_json::Value>) {
        self.send(BroadcastEvent::Status {
            job: job.to_string(),
            state: state.to_string(),
            extra,
            at: Utc::now(),
        });
    }

    fn progress(&self, job: &str, percent: u8) {
        self.send(BroadcastEvent::Progress {
            job: job.to_string(),
            percent: percent.min(100),
            at: Utc::now(),
        });
    }

    fn log(&self, job: &str, message: &str, level: LogLevel) {
        self.send(BroadcastEvent::Log {
            job: job.to_string(),
            message: message.to_string(),
            level,
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_reach_subscribers() {
        let broadcaster = ChannelBroadcaster::new(16);
        let mut rx = broadcaster.subscribe();

        broadcaster.status("processStakingPositions", "running", None);
        broadcaster.progress("processStakingPositions", 140);
        broadcaster.log("processStakingPositions", "done", LogLevel::Success);

        assert!(matches!(rx.recv().await.unwrap(), BroadcastEvent::Status { state, .. } if state == "running"));
        assert!(matches!(rx.recv().await.unwrap(), BroadcastEvent::Progress { percent: 100, .. }));
        assert!(matches!(rx.recv().await.unwrap(), BroadcastEvent::Log { level: LogLevel::Success, .. }));
        assert_eq!(broadcaster.stats(), (3, 0));
    }

    #[test]
    fn test_send_without_subscribers_is_dropped() {
        let broadcaster = ChannelBroadcaster::default();
        broadcaster.progress("job", 10);
        assert_eq!(broadcaster.stats(), (0, 1));
    }
}
