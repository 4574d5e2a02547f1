//! A per-task publish/subscribe topic with lossy-latest delivery and
//! reap-on-broadcast-failure subscriber cleanup.
//!
//! A per-task subscriber set broadcasts to live connections, dropping ones
//! that fail to receive. Delivery is lossy-latest-per-`(language, stage)`:
//! instead of a queue per subscriber, each subscriber holds a small
//! coalescing mailbox keyed by `(language, stage)`, so a slow subscriber
//! only ever sees the newest message for a key rather than piling up a
//! backlog.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};

use crate::sync_ext::{CondvarExt, MutexExt};

pub type Key = (Option<String>, String);

/// `{type: "progress", language, stage, progress: 0..100, message}`, or a
/// terminal `done`/`error` variant naming the stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressMessage {
    Progress {
        language: Option<String>,
        stage: String,
        progress: u8,
        message: String,
    },
    Done {
        language: Option<String>,
        stage: String,
    },
    Error {
        language: Option<String>,
        stage: String,
        error: String,
    },
}

impl ProgressMessage {
    fn key(&self) -> Key {
        match self {
            Self::Progress { language, stage, .. }
            | Self::Done { language, stage }
            | Self::Error { language, stage, .. } => (language.clone(), stage.clone()),
        }
    }
}

struct Mailbox {
    pending: Mutex<HashMap<Key, ProgressMessage>>,
    cv: std::sync::Condvar,
    closed: Mutex<bool>,
}

impl Mailbox {
    fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            cv: std::sync::Condvar::new(),
            closed: Mutex::new(false),
        }
    }

    fn deliver(&self, msg: ProgressMessage) {
        let mut pending = self.pending.lock_unpoisoned();
        pending.insert(msg.key(), msg);
        drop(pending);
        self.cv.notify_one();
    }

    fn close(&self) {
        *self.closed.lock_unpoisoned() = true;
        self.cv.notify_all();
    }
}

/// A live subscription. Drop it to unsubscribe; the bus reaps the dead
/// `Weak` reference on its next publish.
pub struct Subscription {
    mailbox: Arc<Mailbox>,
}

impl Subscription {
    /// Block until a message is available or the topic is closed. Returns
    /// `None` once closed and drained.
    pub fn recv(&self) -> Option<ProgressMessage> {
        let mut pending = self.mailbox.pending.lock_unpoisoned();
        loop {
            if let Some(key) = pending.keys().next().cloned() {
                return pending.remove(&key);
            }
            if *self.mailbox.closed.lock_unpoisoned() {
                return None;
            }
            pending = self.mailbox.cv.wait_unpoisoned(pending);
        }
    }
}

/// Per-task topic. Cheap to clone; all clones share the same subscriber
/// list.
#[derive(Clone)]
pub struct ProgressBus {
    subscribers: Arc<Mutex<Vec<Weak<Mailbox>>>>,
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBus {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Non-blocking: registers a new mailbox and returns the handle to read
    /// from it.
    pub fn subscribe(&self) -> Subscription {
        let mailbox = Arc::new(Mailbox::new());
        self.subscribers
            .lock_unpoisoned()
            .push(Arc::downgrade(&mailbox));
        Subscription { mailbox }
    }

    /// Deliver `msg` to every live subscriber, coalescing on `(language,
    /// stage)`. Dead subscribers (their `Subscription` was dropped) are
    /// reaped from the list here.
    pub fn publish(&self, msg: ProgressMessage) {
        let mut subscribers = self.subscribers.lock_unpoisoned();
        subscribers.retain(|weak| {
            if let Some(mailbox) = weak.upgrade() {
                mailbox.deliver(msg.clone());
                true
            } else {
                false
            }
        });
    }

    /// Closes the topic: every live subscriber's `recv` unblocks and
    /// returns `None` once drained, per the task-deletion lifetime rule.
    pub fn close(&self) {
        let subscribers = self.subscribers.lock_unpoisoned();
        for weak in subscribers.iter() {
            if let Some(mailbox) = weak.upgrade() {
                mailbox.close();
            }
        }
    }
}
