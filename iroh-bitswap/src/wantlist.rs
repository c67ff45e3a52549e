use std::collections::hash_map;

use ahash::AHashMap;
use cid::Cid;

use crate::message::{Priority, WantType};

/// A raw list of wanted blocks and their priorities.
///
/// A want-block is strictly stronger than a want-have: it is never replaced by a later
/// want-have, and it can only be removed as a want-block or unconditionally.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Wantlist {
    set: AHashMap<Cid, Entry>,
}

/// An entry in a wantlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub cid: Cid,
    pub priority: Priority,
    pub want_type: WantType,
}

impl Entry {
    pub fn new(cid: Cid, priority: Priority, want_type: WantType) -> Self {
        Entry {
            cid,
            priority,
            want_type,
        }
    }
}

impl Wantlist {
    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn clear(&mut self) {
        self.set.clear();
    }

    /// Adds an entry to the wantlist. Returns `true` if the wantlist changed.
    pub fn add(&mut self, cid: Cid, priority: Priority, want_type: WantType) -> bool {
        match self.set.entry(cid) {
            hash_map::Entry::Vacant(entry) => {
                entry.insert(Entry::new(cid, priority, want_type));
                true
            }
            hash_map::Entry::Occupied(mut entry) => {
                // Adding want-have should not override want-block
                if entry.get().want_type == WantType::Block || want_type == WantType::Have {
                    return false;
                }
                *entry.get_mut() = Entry::new(cid, priority, want_type);
                true
            }
        }
    }

    /// Removes the given Cid from the wantlist, regardless of its type.
    pub fn remove(&mut self, cid: &Cid) -> Option<Entry> {
        self.set.remove(cid)
    }

    /// Removes the given Cid from the wantlist, respecting the type.
    ///
    /// Removing a want-have leaves an existing want-block in place.
    pub fn remove_type(&mut self, cid: &Cid, want_type: WantType) -> Option<Entry> {
        match self.set.entry(*cid) {
            hash_map::Entry::Vacant(_) => None,
            hash_map::Entry::Occupied(entry) => {
                if entry.get().want_type == WantType::Block && want_type == WantType::Have {
                    return None;
                }
                Some(entry.remove())
            }
        }
    }

    /// Returns the entry if present, otherwise `None`.
    pub fn get(&self, cid: &Cid) -> Option<&Entry> {
        self.set.get(cid)
    }

    pub fn contains(&self, cid: &Cid) -> bool {
        self.set.contains_key(cid)
    }

    /// All entries, in no particular order.
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.set.values()
    }

    /// All entries sorted by ascending priority, ties broken by cid.
    pub fn sorted_entries(&self) -> Vec<Entry> {
        let mut entries: Vec<_> = self.set.values().cloned().collect();
        entries.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.cid.to_bytes().cmp(&b.cid.to_bytes()))
        });
        entries
    }

    /// Merges the second wantlist into this one, following the same rules as [`Self::add`].
    pub fn extend(&mut self, other: Self) {
        for (cid, entry) in other.set.into_iter() {
            match self.set.entry(cid) {
                hash_map::Entry::Occupied(mut e) => {
                    if e.get().want_type == WantType::Block || entry.want_type == WantType::Have {
                        continue;
                    }
                    *e.get_mut() = entry;
                }
                hash_map::Entry::Vacant(e) => {
                    e.insert(entry);
                }
            }
        }
    }
}
