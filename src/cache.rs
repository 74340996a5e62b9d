//! Bounded LRU cache of decompressed blocks.
//!
//! The cache is the only shared mutable resource on the read path.  Two
//! invariants hold at all times:
//!
//! - every resident entry was checksum-verified before insertion (the
//!   loader runs the full verify/repair/decompress pipeline), and
//! - under N concurrent misses on the same `block_id`, the loader runs
//!   exactly once — late arrivals park on a per-key one-shot and receive
//!   the published buffer (or a replica of the failure).
//!
//! A failed load publishes nothing: the pending slot is torn down and the
//! next request retries from disk.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Condvar, Mutex};

use lru::LruCache;

use crate::error::{MempackError, Result};

/// One-shot rendezvous for a single in-flight block load.
struct Pending {
    slot: Mutex<Option<std::result::Result<Arc<Vec<u8>>, MempackError>>>,
    ready: Condvar,
}

impl Pending {
    fn new() -> Self {
        Pending {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn publish(&self, value: std::result::Result<Arc<Vec<u8>>, MempackError>) {
        *self.slot.lock().unwrap() = Some(value);
        self.ready.notify_all();
    }

    fn wait(&self) -> Result<Arc<Vec<u8>>> {
        let mut guard = self.slot.lock().unwrap();
        while guard.is_none() {
            guard = self.ready.wait(guard).unwrap();
        }
        match guard.as_ref().unwrap() {
            Ok(buf) => Ok(buf.clone()),
            Err(e) => Err(e.replicate()),
        }
    }
}

pub struct BlockCache {
    resident: Mutex<LruCache<u32, Arc<Vec<u8>>>>,
    pending: Mutex<HashMap<u32, Arc<Pending>>>,
}

impl BlockCache {
    /// `capacity` is the maximum number of resident decompressed blocks.
    pub fn new(capacity: usize) -> BlockCache {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap();
        BlockCache {
            resident: Mutex::new(LruCache::new(cap)),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch `block_id`, running `load` on a miss.
    ///
    /// The closure performs the verified fetch-and-decompress; its output
    /// is published atomically so no reader ever observes a partial or
    /// unverified buffer.
    pub fn get_or_load<F>(&self, block_id: u32, load: F) -> Result<Arc<Vec<u8>>>
    where
        F: FnOnce() -> Result<Vec<u8>>,
    {
        if let Some(buf) = self.resident.lock().unwrap().get(&block_id) {
            return Ok(buf.clone());
        }

        // Register as leader or join the in-flight load.
        let (pending, leader) = {
            let mut p = self.pending.lock().unwrap();
            match p.get(&block_id) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let fresh = Arc::new(Pending::new());
                    p.insert(block_id, fresh.clone());
                    (fresh, true)
                }
            }
        };

        if !leader {
            return pending.wait();
        }

        // Re-check under the pending claim: the block may have landed
        // between the resident miss and the claim.
        let cached = self.resident.lock().unwrap().get(&block_id).cloned();
        let outcome = match cached {
            Some(buf) => Ok(buf),
            None => match load() {
                Ok(bytes) => {
                    let buf = Arc::new(bytes);
                    self.resident.lock().unwrap().put(block_id, buf.clone());
                    Ok(buf)
                }
                Err(e) => Err(e),
            },
        };

        pending.publish(match &outcome {
            Ok(buf) => Ok(buf.clone()),
            Err(e) => Err(e.replicate()),
        });
        self.pending.lock().unwrap().remove(&block_id);
        outcome
    }

    /// Number of resident blocks.
    pub fn len(&self) -> usize {
        self.resident.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, block_id: u32) -> bool {
        self.resident.lock().unwrap().contains(&block_id)
    }

    /// Resident block ids, most- to least-recently used.
    pub fn resident_ids(&self) -> Vec<u32> {
        self.resident.lock().unwrap().iter().map(|(k, _)| *k).collect()
    }
}
