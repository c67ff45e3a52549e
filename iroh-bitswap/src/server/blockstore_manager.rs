use std::sync::Arc;

use ahash::AHashMap;
use anyhow::Result;
use cid::Cid;
use futures::{stream, StreamExt, TryStreamExt};

use crate::{block::Block, store::Store};

/// Batches lookups against the blockstore, with a bounded number of concurrent requests.
#[derive(Debug, Clone)]
pub struct BlockstoreManager {
    store: Arc<dyn Store>,
    worker_count: usize,
}

impl BlockstoreManager {
    pub fn new(store: Arc<dyn Store>, worker_count: usize) -> Self {
        BlockstoreManager {
            store,
            worker_count: worker_count.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Sizes of all blocks in `keys` that are present in the store.
    pub async fn get_block_sizes(&self, keys: &[Cid]) -> Result<AHashMap<Cid, usize>> {
        if keys.is_empty() {
            return Ok(AHashMap::new());
        }
        self.store.get_sizes(keys).await
    }

    /// All blocks in `keys` that are present in the store.
    pub async fn get_blocks(&self, keys: &[Cid]) -> Result<AHashMap<Cid, Block>> {
        if keys.is_empty() {
            return Ok(AHashMap::new());
        }

        let store = &self.store;
        let blocks: Vec<Option<Block>> = stream::iter(keys.iter().copied())
            .map(|cid| async move { store.get(&cid).await })
            .buffer_unordered(self.worker_count)
            .try_collect()
            .await?;

        Ok(blocks
            .into_iter()
            .flatten()
            .map(|block| (*block.cid(), block))
            .collect())
    }
}
