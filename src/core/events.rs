//! Runner events and the observer registry that fans them out
//!
//! Subscribers are plain callbacks. A panicking subscriber is logged and
//! skipped; delivery to the others continues.

use super::record::ProcessRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Events published by the script runner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerEvent {
    /// A script was launched
    Started { pid: u32, path: PathBuf },
    /// One line of stdout (`is_error = false`) or stderr
    Output {
        pid: u32,
        line: String,
        is_error: bool,
    },
    /// A process exited; `record` is set when the pid was still tracked
    Exited {
        pid: u32,
        exit_code: Option<i32>,
        record: Option<ProcessRecord>,
    },
}

impl RunnerEvent {
    pub fn pid(&self) -> u32 {
        match self {
            Self::Started { pid, .. } | Self::Output { pid, .. } | Self::Exited { pid, .. } => *pid,
        }
    }

    /// Serialize to JSON line
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Registry of event callbacks keyed by subscription
pub struct Observers<E> {
    next_id: AtomicU64,
    subscribers: Mutex<BTreeMap<SubscriptionId, Callback<E>>>,
}

impl<E> Observers<E> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(callback));
        id
    }

    /// Returns false if the id was not subscribed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Deliver `event` to every subscriber registered at call time
    pub fn publish(&self, event: &E) {
        // Snapshot so callbacks can (un)subscribe without deadlocking.
        let callbacks: Vec<(SubscriptionId, Callback<E>)> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, cb)| (*id, Arc::clone(cb)))
            .collect();

        for (id, callback) in callbacks {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                log::warn!("Subscriber {:?} panicked; event dropped for it", id);
            }
        }
    }
}

impl<E> Default for Observers<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_reaches_all_subscribers() {
        let observers = Observers::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in 0..3u32 {
            let seen = seen.clone();
            observers.subscribe(move |e: &u32| seen.lock().unwrap().push((tag, *e)));
        }

        observers.publish(&7);
        assert_eq!(*seen.lock().unwrap(), vec![(0, 7), (1, 7), (2, 7)]);
    }

    #[test]
    fn test_panicking_subscriber_is_isolated() {
        let observers = Observers::<u32>::new();
        let count = Arc::new(AtomicU64::new(0));

        observers.subscribe(|_| panic!("broken subscriber"));
        let c = count.clone();
        observers.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        observers.publish(&1);
        observers.publish(&2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe() {
        let observers = Observers::<u32>::new();
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        let id = observers.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        observers.publish(&1);
        assert!(observers.unsubscribe(id));
        assert!(!observers.unsubscribe(id));
        observers.publish(&2);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(observers.is_empty());
    }

    #[test]
    fn test_subscribe_from_callback_does_not_deadlock() {
        let observers = Arc::new(Observers::<u32>::new());
        let inner = observers.clone();
        observers.subscribe(move |_| {
            inner.subscribe(|_| {});
        });

        observers.publish(&1);
        assert_eq!(observers.len(), 2);
    }

    #[test]
    fn test_event_serialization() {
        let event = RunnerEvent::Output {
            pid: 12,
            line: "hello".to_string(),
            is_error: true,
        };
        let json = event.to_json_line();
        assert!(json.contains("\"type\":\"output\""));
        assert!(json.contains("\"is_error\":true"));
        assert_eq!(event.pid(), 12);
    }
}
