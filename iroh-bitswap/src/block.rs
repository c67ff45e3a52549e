use bytes::Bytes;
use cid::Cid;
use multihash::{Code, MultihashDigest};

/// Multicodec code for raw binary data.
const RAW: u64 = 0x55;

/// A wrapper around bytes with their `Cid`.
///
/// Blocks are never mutated after construction, cloning only bumps the refcount of the
/// underlying [`Bytes`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Block {
    pub cid: Cid,
    pub data: Bytes,
}

impl Block {
    pub fn new(data: Bytes, cid: Cid) -> Self {
        Self { cid, data }
    }

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Size of the payload in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Checks that the data hashes to the multihash in the cid.
    ///
    /// Returns `None` if the hash function is not supported.
    pub fn verify(&self) -> Option<bool> {
        let code = Code::try_from(self.cid.hash().code()).ok()?;
        Some(&code.digest(&self.data) == self.cid.hash())
    }
}

/// Creates a raw, sha2-256 hashed, CIDv1 block from the given bytes.
pub fn create_block_v1<B: Into<Bytes>>(bytes: B) -> Block {
    let bytes = bytes.into();
    let digest = Code::Sha2_256.digest(&bytes);
    let cid = Cid::new_v1(RAW, digest);
    Block::new(bytes, cid)
}
