//! Per-execution event bus: an append-only journal with live fan-out and
//! after-timestamp catch-up for late subscribers.
//!
//! Publishes and subscriptions briefly hold the same per-execution lock, so
//! a new subscriber's replay can never interleave with a concurrent publish:
//! the stream it observes is always a prefix-consistent view of the journal.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::event::{ExecutionEvent, ExecutionEventRecord};

struct Subscriber {
    tx: mpsc::Sender<ExecutionEventRecord>,
}

#[derive(Default)]
struct Channel {
    journal: Vec<ExecutionEventRecord>,
    subscribers: Vec<Subscriber>,
    closed: bool,
}

/// Fan-out hub for all executions in this process.
pub struct ExecutionBus {
    channels: Mutex<HashMap<String, Arc<Mutex<Channel>>>>,
    subscriber_capacity: usize,
}

impl ExecutionBus {
    pub fn new(subscriber_capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            subscriber_capacity,
        }
    }

    fn channel(&self, execution_id: &str) -> Arc<Mutex<Channel>> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(execution_id.to_string())
            .or_default()
            .clone()
    }

    /// Seed a channel with a pre-existing journal (e.g. reloaded from disk),
    /// so late subscribers can replay a completed execution.
    pub fn restore(&self, execution_id: &str, journal: Vec<ExecutionEventRecord>, closed: bool) {
        let channel = self.channel(execution_id);
        let mut channel = channel.lock().unwrap();
        if channel.journal.is_empty() {
            channel.journal = journal;
            channel.closed = closed;
        }
    }

    /// Append and fan out. Returns the journaled record, or `None` if the
    /// channel no longer accepts events.
    pub fn publish(
        &self,
        execution_id: &str,
        event: ExecutionEvent,
    ) -> Option<ExecutionEventRecord> {
        let channel = self.channel(execution_id);
        let mut channel = channel.lock().unwrap();
        if channel.closed {
            return None;
        }

        // Timestamps order the journal; keep them strictly increasing even
        // under a coarse clock.
        let mut timestamp = Utc::now();
        if let Some(last) = channel.journal.last() {
            if timestamp <= last.timestamp {
                timestamp = last.timestamp + ChronoDuration::microseconds(1);
            }
        }

        let record = ExecutionEventRecord { timestamp, event };
        channel.journal.push(record.clone());

        channel.subscribers.retain(|subscriber| {
            match subscriber.tx.try_send(record.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Desynchronized: drop it; the client reconnects with
                    // afterTimestamp and catches up from the journal.
                    warn!(execution_id, "subscriber queue overflow, dropping subscriber");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });

        Some(record)
    }

    /// Subscribe, replaying journaled events with `timestamp > after` first
    /// (the whole journal when `after` is `None`), then live events in order
    /// with no gap or duplicate.
    pub fn subscribe(
        &self,
        execution_id: &str,
        after: Option<DateTime<Utc>>,
    ) -> mpsc::Receiver<ExecutionEventRecord> {
        let channel = self.channel(execution_id);
        let mut channel = channel.lock().unwrap();

        let backlog: Vec<ExecutionEventRecord> = channel
            .journal
            .iter()
            .filter(|record| after.is_none_or(|after| record.timestamp > after))
            .cloned()
            .collect();

        // The replay must fit without blocking while the lock is held.
        let capacity = self.subscriber_capacity.max(backlog.len() + 1);
        let (tx, rx) = mpsc::channel(capacity);
        for record in backlog {
            // Cannot fail: the queue was sized for the backlog.
            let _ = tx.try_send(record);
        }

        if !channel.closed {
            channel.subscribers.push(Subscriber { tx });
        }
        debug!(execution_id, "subscriber attached");
        rx
    }

    /// Stop accepting events; live subscribers see end-of-stream after the
    /// backlog. The journal stays readable.
    pub fn close(&self, execution_id: &str) {
        let channel = self.channel(execution_id);
        let mut channel = channel.lock().unwrap();
        channel.closed = true;
        channel.subscribers.clear();
    }

    /// Snapshot of the journal so far.
    pub fn journal(&self, execution_id: &str) -> Vec<ExecutionEventRecord> {
        self.channel(execution_id).lock().unwrap().journal.clone()
    }
}
