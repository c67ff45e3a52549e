use std::sync::{Arc, Mutex};

use ahash::AHashMap;
use cid::Cid;
use tokio::sync::Notify;

/// Parks fetches until something relevant to their cid happens.
///
/// Waiters must call [`Notify::notified`] and `enable` the future *before* inspecting the
/// state they wait on, wakeups in between are otherwise lost.
#[derive(Debug, Default)]
pub struct Blocker {
    waiters: Mutex<AHashMap<Cid, Arc<Notify>>>,
}

impl Blocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The notifier for `cid`, created on first use.
    pub fn get(&self, cid: &Cid) -> Arc<Notify> {
        self.waiters
            .lock()
            .expect("poisoned")
            .entry(*cid)
            .or_default()
            .clone()
    }

    pub fn wake(&self, cid: &Cid) {
        if let Some(notify) = self.waiters.lock().expect("poisoned").get(cid) {
            notify.notify_waiters();
        }
    }

    pub fn wake_all(&self) {
        for notify in self.waiters.lock().expect("poisoned").values() {
            notify.notify_waiters();
        }
    }

    pub fn remove(&self, cid: &Cid) {
        self.waiters.lock().expect("poisoned").remove(cid);
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().expect("poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
