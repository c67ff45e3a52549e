use std::{
    fmt::Debug,
    sync::{Arc, RwLock},
};

use ahash::AHashMap;
use anyhow::Result;
use async_trait::async_trait;
use cid::Cid;

use crate::block::Block;

/// The local block store.
///
/// Implementations must be safe for concurrent use, no locking is done on top.
#[async_trait]
pub trait Store: Debug + Send + Sync + 'static {
    async fn get(&self, cid: &Cid) -> Result<Option<Block>>;
    async fn get_size(&self, cid: &Cid) -> Result<Option<usize>>;
    async fn has(&self, cid: &Cid) -> Result<bool>;
    async fn put(&self, block: Block) -> Result<()>;

    /// Looks up the sizes of many blocks at once. Absent blocks are missing from the map.
    async fn get_sizes(&self, cids: &[Cid]) -> Result<AHashMap<Cid, usize>> {
        let mut sizes = AHashMap::with_capacity(cids.len());
        for cid in cids {
            if let Some(size) = self.get_size(cid).await? {
                sizes.insert(*cid, size);
            }
        }
        Ok(sizes)
    }
}

/// A [`Store`] keeping all blocks in memory.
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    blocks: Arc<RwLock<AHashMap<Cid, Block>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.read().expect("poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Store for MemStore {
    async fn get(&self, cid: &Cid) -> Result<Option<Block>> {
        Ok(self.blocks.read().expect("poisoned").get(cid).cloned())
    }

    async fn get_size(&self, cid: &Cid) -> Result<Option<usize>> {
        Ok(self
            .blocks
            .read()
            .expect("poisoned")
            .get(cid)
            .map(Block::len))
    }

    async fn has(&self, cid: &Cid) -> Result<bool> {
        Ok(self.blocks.read().expect("poisoned").contains_key(cid))
    }

    async fn put(&self, block: Block) -> Result<()> {
        self.blocks
            .write()
            .expect("poisoned")
            .insert(*block.cid(), block);
        Ok(())
    }
}
