use std::collections::HashSet;
use std::sync::Mutex;

use crate::services::event::{BlockHash, Chain};

/// Shard count is fixed so the table cannot grow under adversarial hashes
const LOCK_SHARDS: usize = 64;

/// Bounded per-hash advisory lock table.
///
/// Serializes expensive work (full-block fetches) across workers that observe
/// the same hash simultaneously. `try_begin` is non-blocking; the returned
/// guard releases on drop, so cancellation can never leak a held hash.
pub struct HashLockTable {
    shards: Vec<Mutex<HashSet<(Chain, BlockHash)>>>,
}

impl HashLockTable {
    pub fn new() -> Self {
        Self {
            shards: (0..LOCK_SHARDS).map(|_| Mutex::new(HashSet::new())).collect(),
        }
    }

    fn shard_for(&self, hash: &BlockHash) -> usize {
        hash.shard_byte() as usize % LOCK_SHARDS
    }

    /// Claim the hash. `None` means another worker already holds it.
    pub fn try_begin(&self, chain: Chain, hash: &BlockHash) -> Option<HashGuard<'_>> {
        let shard = self.shard_for(hash);
        let key = (chain, hash.clone());
        let mut held = self.shards[shard].lock().unwrap_or_else(|e| e.into_inner());
        if held.insert(key.clone()) {
            Some(HashGuard {
                table: self,
                shard,
                key,
            })
        } else {
            None
        }
    }

    fn release(&self, shard: usize, key: &(Chain, BlockHash)) {
        let mut held = self.shards[shard].lock().unwrap_or_else(|e| e.into_inner());
        held.remove(key);
    }

    #[cfg(test)]
    fn held_count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap().len())
            .sum()
    }
}

impl Default for HashLockTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Advisory hold on one `(chain, hash)`; released on drop
pub struct HashGuard<'a> {
    table: &'a HashLockTable,
    shard: usize,
    key: (Chain, BlockHash),
}

impl Drop for HashGuard<'_> {
    fn drop(&mut self) {
        self.table.release(self.shard, &self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> BlockHash {
        BlockHash::new(vec![byte; 32])
    }

    #[test]
    fn test_second_begin_fails_while_held() {
        let table = HashLockTable::new();
        let guard = table.try_begin(Chain::Bitcoin, &hash(1));
        assert!(guard.is_some());
        assert!(table.try_begin(Chain::Bitcoin, &hash(1)).is_none());
    }

    #[test]
    fn test_release_on_drop() {
        let table = HashLockTable::new();
        {
            let _guard = table.try_begin(Chain::Bitcoin, &hash(1)).unwrap();
            assert_eq!(table.held_count(), 1);
        }
        assert_eq!(table.held_count(), 0);
        assert!(table.try_begin(Chain::Bitcoin, &hash(1)).is_some());
    }

    #[test]
    fn test_same_hash_different_chains_are_independent() {
        let table = HashLockTable::new();
        let _btc = table.try_begin(Chain::Bitcoin, &hash(1)).unwrap();
        assert!(table.try_begin(Chain::Ethereum, &hash(1)).is_some());
    }

    #[test]
    fn test_colliding_shards_do_not_block_each_other() {
        let table = HashLockTable::new();
        // Same shard byte, different hashes
        let a = BlockHash::new({
            let mut v = vec![7u8; 32];
            v[31] = 1;
            v
        });
        let b = BlockHash::new({
            let mut v = vec![7u8; 32];
            v[31] = 2;
            v
        });
        let _ga = table.try_begin(Chain::Bitcoin, &a).unwrap();
        assert!(table.try_begin(Chain::Bitcoin, &b).is_some());
    }
}
