//! Tracks connection state per peer and turns it into connected / disconnected events.
//!
//! A peer can have several live connections, and can stop answering on a connection that
//! is still open. Listeners only ever see a single `peer_connected` for each transition to
//! "usable" and a single `peer_disconnected` for each transition away from it.

use std::fmt::Debug;
use std::sync::{Arc, Mutex, RwLock};

use ahash::AHashMap;
use libp2p_identity::PeerId;
use tracing::{debug, trace};

/// Receives connectivity transitions from the [`ConnectEventManager`].
///
/// Callbacks run while the manager holds its lock, implementations must not call back
/// into the manager.
pub trait ConnectionListener: Debug + Send + Sync + 'static {
    fn peer_connected(&self, peer: &PeerId);
    fn peer_disconnected(&self, peer: &PeerId);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ConnState {
    refs: usize,
    responsive: bool,
}

#[derive(Debug, Default)]
pub struct ConnectEventManager {
    conns: Mutex<AHashMap<PeerId, ConnState>>,
    listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,
}

impl ConnectEventManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners
            .write()
            .expect("poisoned")
            .push(listener);
    }

    /// Drops all listeners.
    pub fn clear_listeners(&self) {
        self.listeners.write().expect("poisoned").clear();
    }

    /// A new connection to `peer` was established.
    pub fn connected(&self, peer: &PeerId) {
        let conns = &mut *self.conns.lock().expect("poisoned");
        let state = conns.entry(*peer).or_insert(ConnState {
            refs: 0,
            responsive: true,
        });
        state.refs += 1;
        trace!(%peer, refs = state.refs, "connected");

        if state.refs == 1 && state.responsive {
            self.notify(peer, true);
        }
    }

    /// A connection to `peer` was closed.
    pub fn disconnected(&self, peer: &PeerId) {
        let conns = &mut *self.conns.lock().expect("poisoned");
        let Some(state) = conns.get_mut(peer) else {
            return;
        };
        state.refs = state.refs.saturating_sub(1);
        trace!(%peer, refs = state.refs, "disconnected");

        if state.refs == 0 {
            let was_responsive = state.responsive;
            conns.remove(peer);
            if was_responsive {
                self.notify(peer, false);
            }
        }
    }

    /// The peer failed to respond, treat it as gone until it sends us something.
    pub fn mark_unresponsive(&self, peer: &PeerId) {
        let conns = &mut *self.conns.lock().expect("poisoned");
        let Some(state) = conns.get_mut(peer) else {
            return;
        };
        if !state.responsive {
            return;
        }
        debug!(%peer, "marking unresponsive");
        state.responsive = false;
        self.notify(peer, false);
    }

    /// Any message from a peer proves it responsive again.
    pub fn on_message(&self, peer: &PeerId) {
        let conns = &mut *self.conns.lock().expect("poisoned");
        let Some(state) = conns.get_mut(peer) else {
            return;
        };
        if state.responsive {
            return;
        }
        debug!(%peer, "responsive again");
        state.responsive = true;
        self.notify(peer, true);
    }

    /// Returns `true` if the peer has a live connection and is responsive.
    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.conns
            .lock()
            .expect("poisoned")
            .get(peer)
            .map(|s| s.refs > 0 && s.responsive)
            .unwrap_or_default()
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.conns
            .lock()
            .expect("poisoned")
            .iter()
            .filter(|(_, s)| s.refs > 0 && s.responsive)
            .map(|(p, _)| *p)
            .collect()
    }

    fn notify(&self, peer: &PeerId, connected: bool) {
        let listeners = self.listeners.read().expect("poisoned");
        for listener in listeners.iter() {
            if connected {
                listener.peer_connected(peer);
            } else {
                listener.peer_disconnected(peer);
            }
        }
    }
}
