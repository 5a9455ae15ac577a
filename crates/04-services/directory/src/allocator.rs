//! NodeId allocation.
//!
//! Ids are handed out in increasing order starting at 1 and are never reused.
//! Once the configured limit is passed every further request yields
//! [`NodeId::INVALID`].

use std::sync::{Arc, OnceLock};

use device_abi::NodeId;
use log::warn;
use parking_lot::Mutex;

pub type SharedAllocator = Arc<Mutex<NodeIdAllocator>>;

#[derive(Debug)]
pub struct NodeIdAllocator {
    next: u64,
    limit: u32,
}

impl NodeIdAllocator {
    pub fn new(limit: u32) -> Self {
        Self { next: 1, limit }
    }

    pub fn shared(limit: u32) -> SharedAllocator {
        Arc::new(Mutex::new(Self::new(limit)))
    }

    pub fn allocate(&mut self) -> NodeId {
        if self.next > u64::from(self.limit) {
            warn!("node id space exhausted at limit {}", self.limit);
            return NodeId::INVALID;
        }
        let id = NodeId(self.next as u32);
        self.next += 1;
        id
    }

    pub fn is_exhausted(&self) -> bool {
        self.next > u64::from(self.limit)
    }
}

static GLOBAL: OnceLock<SharedAllocator> = OnceLock::new();

/// Process-wide allocator, created on first use with the default limit.
/// It lives for the rest of the process; ids are never recycled.
pub fn global_allocator() -> SharedAllocator {
    Arc::clone(GLOBAL.get_or_init(|| NodeIdAllocator::shared(u32::MAX >> 1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn starts_at_one_and_stops_at_limit() {
        let mut alloc = NodeIdAllocator::new(2);
        assert_eq!(alloc.allocate(), NodeId(1));
        assert_eq!(alloc.allocate(), NodeId(2));
        assert_eq!(alloc.allocate(), NodeId::INVALID);
        assert_eq!(alloc.allocate(), NodeId::INVALID);
        assert!(alloc.is_exhausted());
    }

    #[test]
    fn full_range_does_not_wrap() {
        let mut alloc = NodeIdAllocator {
            next: u64::from(u32::MAX),
            limit: u32::MAX,
        };
        assert_eq!(alloc.allocate(), NodeId(u32::MAX));
        assert_eq!(alloc.allocate(), NodeId::INVALID);
    }

    proptest! {
        #[test]
        fn ids_are_unique_and_bounded(limit in 0u32..64, requests in 0usize..128) {
            let mut alloc = NodeIdAllocator::new(limit);
            let ids: Vec<NodeId> = (0..requests).map(|_| alloc.allocate()).collect();
            let valid: Vec<NodeId> = ids.iter().copied().filter(|id| id.is_valid()).collect();
            prop_assert_eq!(valid.len(), requests.min(limit as usize));
            let mut dedup = valid.clone();
            dedup.sort();
            dedup.dedup();
            prop_assert_eq!(dedup.len(), valid.len());
            prop_assert!(valid.iter().all(|id| id.0 >= 1 && id.0 <= limit));
            // Once the sentinel shows up it never goes away.
            if let Some(first) = ids.iter().position(|id| !id.is_valid()) {
                prop_assert!(ids[first..].iter().all(|id| !id.is_valid()));
            }
        }
    }
}
