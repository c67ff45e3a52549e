//! The bitswap message model and its wire representation.
//!
//! The framing of messages on a stream is handled by [`crate::network`]; this module only
//! turns a [`BitswapMessage`] into bytes and back.

use std::fmt::{self, Debug};

use ahash::AHashMap;
use bytes::Bytes;
use cid::Cid;
use tracing::warn;

use crate::block::Block;
use crate::error::Error;
use crate::prefix::Prefix;

mod wire {
    //! Serialized form of a message. Cids travel as their binary representation.
    use bytes::Bytes;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Default, Serialize, Deserialize)]
    pub struct Message {
        pub wantlist: Wantlist,
        pub payload: Vec<Block>,
        pub block_presences: Vec<BlockPresence>,
        pub pending_bytes: i32,
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    pub struct Wantlist {
        pub entries: Vec<Entry>,
        pub full: bool,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct Entry {
        pub block: Vec<u8>,
        pub priority: i32,
        pub cancel: bool,
        pub want_type: i32,
        pub send_dont_have: bool,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct Block {
        pub prefix: Vec<u8>,
        pub data: Bytes,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct BlockPresence {
        pub cid: Vec<u8>,
        pub typ: i32,
    }
}

/// Represents a HAVE / DONT_HAVE for a given Cid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPresence {
    pub cid: Cid,
    pub typ: BlockPresenceType,
}

impl BlockPresence {
    pub fn encoded_len(&self) -> usize {
        let bp = wire::BlockPresence {
            cid: self.cid.to_bytes(),
            typ: self.typ.into(),
        };
        postcard::to_stdvec(&bp).map(|v| v.len()).unwrap_or_default()
    }

    /// The encoded length of a presence for `cid`, used as the work estimate of
    /// HAVE and DONT_HAVE responses.
    pub fn encoded_len_for_cid(cid: Cid) -> usize {
        BlockPresence {
            cid,
            typ: BlockPresenceType::Have,
        }
        .encoded_len()
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, num_enum::IntoPrimitive, num_enum::TryFromPrimitive,
)]
#[repr(i32)]
pub enum BlockPresenceType {
    Have = 0,
    DontHave = 1,
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    num_enum::IntoPrimitive,
    num_enum::TryFromPrimitive,
)]
#[repr(i32)]
pub enum WantType {
    Block = 0,
    Have = 1,
}

/// A wantlist entry in a bitswap message, with flags indicating
/// - whether the entry is a cancel
/// - whether the requester wants a DONT_HAVE response
/// - whether the requester wants a HAVE (instead of the block)
#[derive(Clone, PartialEq, Eq)]
pub struct Entry {
    pub cid: Cid,
    pub priority: Priority,
    pub want_type: WantType,
    pub cancel: bool,
    pub send_dont_have: bool,
}

impl Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("cid", &self.cid.to_string())
            .field("priority", &self.priority)
            .field("want_type", &self.want_type)
            .field("cancel", &self.cancel)
            .field("send_dont_have", &self.send_dont_have)
            .finish()
    }
}

impl Entry {
    /// Returns the encoded length of this entry.
    pub fn encoded_len(&self) -> usize {
        let entry: wire::Entry = self.into();
        postcard::to_stdvec(&entry)
            .map(|v| v.len())
            .unwrap_or_default()
    }
}

impl From<&Entry> for wire::Entry {
    fn from(e: &Entry) -> Self {
        wire::Entry {
            block: e.cid.to_bytes(),
            priority: e.priority,
            want_type: e.want_type.into(),
            cancel: e.cancel,
            send_dont_have: e.send_dont_have,
        }
    }
}

/// Priority of a wanted block.
pub type Priority = i32;

/// A bitswap message.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct BitswapMessage {
    full: bool,
    wantlist: AHashMap<Cid, Entry>,
    blocks: AHashMap<Cid, Block>,
    block_presences: AHashMap<Cid, BlockPresenceType>,
    pending_bytes: i32,
}

struct Fmt<F>(pub F)
where
    F: Fn(&mut fmt::Formatter) -> fmt::Result;

impl<F> fmt::Debug for Fmt<F>
where
    F: Fn(&mut fmt::Formatter) -> fmt::Result,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        (self.0)(f)
    }
}

impl Debug for BitswapMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitswapMessage")
            .field("full", &self.full)
            .field(
                "wantlist",
                &Fmt(|f| {
                    f.debug_list()
                        .entries(self.wantlist.values())
                        .finish()
                }),
            )
            .field(
                "blocks",
                &Fmt(|f| {
                    f.debug_map()
                        .entries(
                            self.blocks
                                .iter()
                                .map(|(cid, block)| (cid.to_string(), block.len())),
                        )
                        .finish()
                }),
            )
            .field(
                "block_presences",
                &Fmt(|f| {
                    f.debug_map()
                        .entries(
                            self.block_presences
                                .iter()
                                .map(|(cid, typ)| (cid.to_string(), typ)),
                        )
                        .finish()
                }),
            )
            .field("pending_bytes", &self.pending_bytes)
            .finish()
    }
}

impl BitswapMessage {
    pub fn new(full: bool) -> Self {
        BitswapMessage {
            full,
            ..Default::default()
        }
    }

    /// Clears all contents of this message for it to be reused.
    pub fn clear(&mut self, full: bool) {
        self.full = full;
        self.wantlist.clear();
        self.blocks.clear();
        self.block_presences.clear();
        self.pending_bytes = 0;
    }

    pub fn full(&self) -> bool {
        self.full
    }

    /// Removes all blocks whose data does not match their cid.
    pub fn verify_blocks(&mut self) {
        self.blocks.retain(|cid, block| match block.verify() {
            Some(true) => true,
            Some(false) => {
                warn!(%cid, "invalid block received");
                false
            }
            None => {
                warn!(%cid, "unknown hash function {}", cid.hash().code());
                false
            }
        });
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.wantlist.is_empty() && self.block_presences.is_empty()
    }

    pub fn wantlist(&self) -> impl Iterator<Item = &Entry> {
        self.wantlist.values()
    }

    pub fn wantlist_len(&self) -> usize {
        self.wantlist.len()
    }

    pub fn blocks_len(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.values()
    }

    pub fn block_presences(&self) -> impl Iterator<Item = BlockPresence> + '_ {
        self.block_presences.iter().map(|(cid, typ)| BlockPresence {
            cid: *cid,
            typ: *typ,
        })
    }

    pub fn haves(&self) -> impl Iterator<Item = &Cid> {
        self.get_block_presence_by_type(BlockPresenceType::Have)
    }

    pub fn dont_haves(&self) -> impl Iterator<Item = &Cid> {
        self.get_block_presence_by_type(BlockPresenceType::DontHave)
    }

    fn get_block_presence_by_type(&self, typ: BlockPresenceType) -> impl Iterator<Item = &Cid> {
        self.block_presences
            .iter()
            .filter_map(move |(cid, t)| (*t == typ).then_some(cid))
    }

    pub fn pending_bytes(&self) -> i32 {
        self.pending_bytes
    }

    pub fn set_pending_bytes(&mut self, bytes: i32) {
        self.pending_bytes = bytes;
    }

    pub fn remove(&mut self, cid: &Cid) {
        self.wantlist.remove(cid);
    }

    pub fn cancel(&mut self, cid: Cid) -> usize {
        self.add_full_entry(cid, 0, true, WantType::Block, false)
    }

    pub fn add_entry(
        &mut self,
        cid: Cid,
        priority: Priority,
        want_type: WantType,
        send_dont_have: bool,
    ) -> usize {
        self.add_full_entry(cid, priority, false, want_type, send_dont_have)
    }

    fn add_full_entry(
        &mut self,
        cid: Cid,
        priority: Priority,
        cancel: bool,
        want_type: WantType,
        send_dont_have: bool,
    ) -> usize {
        if let Some(entry) = self.wantlist.get_mut(&cid) {
            // only change priority if want is of the same type
            if entry.want_type == want_type {
                entry.priority = priority;
            }

            // only change from dont cancel to cancel
            if cancel {
                entry.cancel = cancel;
            }

            // only change from dont send to do send DONT_HAVE
            if send_dont_have {
                entry.send_dont_have = send_dont_have;
            }

            // want block overrides existing want have
            if want_type == WantType::Block && entry.want_type == WantType::Have {
                entry.want_type = want_type;
            }

            return 0;
        }

        let entry = Entry {
            cid,
            priority,
            want_type,
            send_dont_have,
            cancel,
        };
        let size = entry.encoded_len();
        self.wantlist.insert(cid, entry);
        size
    }

    pub fn add_block(&mut self, block: Block) {
        self.block_presences.remove(block.cid());
        self.blocks.insert(*block.cid(), block);
    }

    pub fn add_block_presence(&mut self, cid: Cid, typ: BlockPresenceType) {
        if self.blocks.contains_key(&cid) {
            return;
        }
        self.block_presences.insert(cid, typ);
    }

    pub fn add_have(&mut self, cid: Cid) {
        self.add_block_presence(cid, BlockPresenceType::Have);
    }

    pub fn add_dont_have(&mut self, cid: Cid) {
        self.add_block_presence(cid, BlockPresenceType::DontHave);
    }

    /// Approximate size of this message on the wire.
    pub fn encoded_len(&self) -> usize {
        let block_size: usize = self.blocks.values().map(|b| b.data.len()).sum();
        let block_presence_size: usize = self.block_presences().map(|bp| bp.encoded_len()).sum();
        let wantlist_size: usize = self.wantlist.values().map(|e| e.encoded_len()).sum();

        block_size + block_presence_size + wantlist_size
    }

    /// Serializes the message.
    ///
    /// Wantlist entries are written in ascending priority order (ties broken by cid), so
    /// the same message always encodes to the same bytes.
    pub fn encode(&self) -> Result<Bytes, Error> {
        let mut entries: Vec<&Entry> = self.wantlist.values().collect();
        entries.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.cid.to_bytes().cmp(&b.cid.to_bytes()))
        });

        let mut blocks: Vec<&Block> = self.blocks.values().collect();
        blocks.sort_by_key(|b| b.cid.to_bytes());
        let mut presences: Vec<_> = self.block_presences.iter().collect();
        presences.sort_by_key(|(cid, _)| cid.to_bytes());

        let message = wire::Message {
            wantlist: wire::Wantlist {
                entries: entries.into_iter().map(Into::into).collect(),
                full: self.full,
            },
            payload: blocks
                .into_iter()
                .map(|block| wire::Block {
                    prefix: Prefix::from(block.cid()).to_bytes(),
                    data: block.data().clone(),
                })
                .collect(),
            block_presences: presences
                .into_iter()
                .map(|(cid, typ)| wire::BlockPresence {
                    cid: cid.to_bytes(),
                    typ: (*typ).into(),
                })
                .collect(),
            pending_bytes: self.pending_bytes,
        };

        let bytes = postcard::to_stdvec(&message)?;
        Ok(bytes.into())
    }
}

impl BitswapMessage {
    /// Converts the wire form, skipping entries, blocks and presences that are malformed.
    fn from_wire(wm: wire::Message) -> Self {
        let mut message = BitswapMessage::new(wm.wantlist.full);

        for entry in wm.wantlist.entries {
            let parsed = Cid::try_from(&entry.block[..])
                .map_err(Error::from)
                .and_then(|cid| Ok((cid, WantType::try_from(entry.want_type)?)));
            match parsed {
                Ok((cid, want_type)) => {
                    message.add_full_entry(
                        cid,
                        entry.priority,
                        entry.cancel,
                        want_type,
                        entry.send_dont_have,
                    );
                }
                Err(err) => warn!("skipping malformed wantlist entry: {err}"),
            }
        }

        for block in wm.payload {
            let cid = Prefix::new(&block.prefix).and_then(|prefix| prefix.to_cid(&block.data));
            match cid {
                Ok(cid) => message.add_block(Block::new(block.data, cid)),
                Err(err) => warn!("skipping malformed block: {err}"),
            }
        }

        for block_presence in wm.block_presences {
            let parsed = Cid::try_from(&block_presence.cid[..])
                .map_err(Error::from)
                .and_then(|cid| Ok((cid, BlockPresenceType::try_from(block_presence.typ)?)));
            match parsed {
                Ok((cid, typ)) => message.add_block_presence(cid, typ),
                Err(err) => warn!("skipping malformed block presence: {err}"),
            }
        }

        message.pending_bytes = wm.pending_bytes;

        message
    }
}

impl TryFrom<Bytes> for BitswapMessage {
    type Error = Error;

    fn try_from(value: Bytes) -> Result<Self, Self::Error> {
        BitswapMessage::try_from(&value[..])
    }
}

impl TryFrom<&[u8]> for BitswapMessage {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let wm: wire::Message = postcard::from_bytes(value)?;
        Ok(BitswapMessage::from_wire(wm))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{create_block_v1, tests::create_random_block_v1};

    #[test]
    fn test_entry_overrides() {
        let cid = *create_random_block_v1().cid();
        let mut msg = BitswapMessage::default();

        assert!(msg.add_entry(cid, 1, WantType::Have, false) > 0);
        // second add is folded into the first
        assert_eq!(msg.add_entry(cid, 5, WantType::Block, true), 0);

        let entry = msg.wantlist().next().unwrap();
        assert_eq!(entry.want_type, WantType::Block);
        assert!(entry.send_dont_have);
        // priority only changes for the same want type
        assert_eq!(entry.priority, 1);

        msg.cancel(cid);
        assert!(msg.wantlist().next().unwrap().cancel);
    }

    #[test]
    fn test_block_replaces_presence() {
        let block = create_random_block_v1();
        let mut msg = BitswapMessage::default();
        msg.add_have(*block.cid());
        assert_eq!(msg.haves().count(), 1);

        msg.add_block(block.clone());
        assert_eq!(msg.haves().count(), 0);
        assert_eq!(msg.blocks_len(), 1);

        // presences for cids with a block are ignored
        msg.add_dont_have(*block.cid());
        assert_eq!(msg.dont_haves().count(), 0);
    }

    #[test]
    fn test_encode_decode() {
        let b0 = create_block_v1(&b"block 0"[..]);
        let b1 = create_random_block_v1();
        let b2 = create_random_block_v1();
        let b3 = create_random_block_v1();

        let mut msg = BitswapMessage::new(true);
        msg.add_entry(*b1.cid(), 10, WantType::Block, true);
        msg.add_entry(*b2.cid(), 3, WantType::Have, false);
        msg.cancel(*b3.cid());
        msg.add_block(b0.clone());
        msg.add_have(*b2.cid());
        msg.add_dont_have(*b3.cid());
        msg.set_pending_bytes(1234);

        let bytes = msg.encode().unwrap();
        let decoded = BitswapMessage::try_from(bytes.clone()).unwrap();
        assert_eq!(decoded, msg);

        // deterministic
        assert_eq!(decoded.encode().unwrap(), bytes);
    }

    #[test]
    fn test_empty_message() {
        let msg = BitswapMessage::default();
        assert!(msg.is_empty());
        let decoded = BitswapMessage::try_from(msg.encode().unwrap()).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_decode_garbage() {
        let res = BitswapMessage::try_from(&[0xff, 0xff, 0xff, 0xff, 0xff, 0xff][..]);
        assert!(res.is_err());
    }

    #[test]
    fn test_malformed_entries_skipped() {
        let good = create_random_block_v1();
        let wm = wire::Message {
            wantlist: wire::Wantlist {
                entries: vec![
                    wire::Entry {
                        block: good.cid().to_bytes(),
                        priority: 1,
                        cancel: false,
                        want_type: WantType::Block.into(),
                        send_dont_have: true,
                    },
                    wire::Entry {
                        block: vec![0xff, 0x01],
                        priority: 1,
                        cancel: false,
                        want_type: WantType::Block.into(),
                        send_dont_have: true,
                    },
                    wire::Entry {
                        block: good.cid().to_bytes(),
                        priority: 2,
                        cancel: false,
                        want_type: 7,
                        send_dont_have: true,
                    },
                ],
                full: false,
            },
            payload: vec![wire::Block {
                prefix: vec![0xff],
                data: good.data().clone(),
            }],
            block_presences: vec![
                wire::BlockPresence {
                    cid: vec![0x01],
                    typ: BlockPresenceType::Have.into(),
                },
                wire::BlockPresence {
                    cid: good.cid().to_bytes(),
                    typ: BlockPresenceType::DontHave.into(),
                },
            ],
            pending_bytes: 0,
        };
        let bytes = postcard::to_stdvec(&wm).unwrap();

        let msg = BitswapMessage::try_from(&bytes[..]).unwrap();
        let entries: Vec<_> = msg.wantlist().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].cid, *good.cid());
        assert_eq!(entries[0].priority, 1);
        assert_eq!(msg.blocks_len(), 0);
        assert_eq!(msg.dont_haves().collect::<Vec<_>>(), vec![good.cid()]);
        assert_eq!(msg.haves().count(), 0);
    }

    #[test]
    fn test_verify_blocks() {
        let good = create_random_block_v1();
        let other = create_random_block_v1();
        let bad = Block::new(other.data().clone(), *good.cid());

        let mut msg = BitswapMessage::default();
        msg.add_block(bad);
        msg.verify_blocks();
        assert_eq!(msg.blocks_len(), 0);

        msg.add_block(good);
        msg.verify_blocks();
        assert_eq!(msg.blocks_len(), 1);
    }
}
