use ahash::{AHashMap, AHashSet};
use cid::Cid;
use libp2p_identity::PeerId;

use crate::{
    message::{Priority, WantType},
    wantlist::{Entry, Wantlist},
};

/// Tracks the wantlist for a given partner.
#[derive(Debug)]
pub struct Ledger {
    /// The remote peer.
    partner: PeerId,
    wantlist: Wantlist,
}

impl Ledger {
    pub fn new(partner: PeerId) -> Self {
        Ledger {
            partner,
            wantlist: Wantlist::default(),
        }
    }

    pub fn partner(&self) -> &PeerId {
        &self.partner
    }

    /// Empties the wantlist, returning the cids it held.
    pub fn clear_wantlist(&mut self) -> Vec<Cid> {
        let cids = self.wantlist.entries().map(|e| e.cid).collect();
        self.wantlist.clear();
        cids
    }

    pub fn wants(&mut self, cid: Cid, priority: Priority, want_type: WantType) {
        self.wantlist.add(cid, priority, want_type);
    }

    pub fn cancel_want(&mut self, cid: &Cid) -> Option<Entry> {
        self.wantlist.remove(cid)
    }

    pub fn wantlist_get(&self, cid: &Cid) -> Option<&Entry> {
        self.wantlist.get(cid)
    }

    pub fn wantlist_mut(&mut self) -> &mut Wantlist {
        &mut self.wantlist
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.wantlist.entries()
    }
}

/// Tracks which peers want which cids.
#[derive(Debug, Default)]
pub struct PeerLedger {
    cids: AHashMap<Cid, AHashSet<PeerId>>,
}

impl PeerLedger {
    /// Records that `peer` wants `cid`.
    pub fn wants(&mut self, peer: PeerId, cid: Cid) {
        self.cids.entry(cid).or_default().insert(peer);
    }

    /// Records that `peer` no longer wants `cid`.
    pub fn cancel_want(&mut self, peer: &PeerId, cid: &Cid) {
        if let Some(peers) = self.cids.get_mut(cid) {
            peers.remove(peer);
            if peers.is_empty() {
                self.cids.remove(cid);
            }
        }
    }

    /// Peers waiting for the given cid.
    pub fn peers(&self, cid: &Cid) -> Vec<PeerId> {
        self.cids
            .get(cid)
            .map(|peers| peers.iter().copied().collect())
            .unwrap_or_default()
    }
}
