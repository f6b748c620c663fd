//! Commit notifications.
//!
//! Each database has a `watch` channel carrying its head. Subscribers are
//! woken after every commit; slow subscribers only ever see the newest head.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::watch;

use rowsync_core::{DbId, Seq};

/// Publishes the head of each database after commits.
#[derive(Debug, Default)]
pub struct CommitNotifier {
    channels: Mutex<HashMap<DbId, watch::Sender<Seq>>>,
}

impl CommitNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to head changes of `dbid`.
    pub fn subscribe(&self, dbid: &DbId) -> watch::Receiver<Seq> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(*dbid)
            .or_insert_with(|| watch::channel(Seq::ZERO).0)
            .subscribe()
    }

    /// Record a new head for `dbid` and wake subscribers.
    pub fn publish(&self, dbid: &DbId, head: Seq) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(*dbid)
            .or_insert_with(|| watch::channel(Seq::ZERO).0)
            .send_replace(head);
    }
}
