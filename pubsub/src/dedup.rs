use rustc_hash::FxHashSet;

const NUM_BUCKETS: usize = 256;

/// Aging set of recently seen message ids: a hash set for the membership test plus a ring of
///  256 buckets recording insertion time. A periodic tick advances the ring by one bucket and
///  forgets that bucket's ids, so with a 10s tick an id is remembered for ~2560s.
pub struct DedupRing {
    seen: FxHashSet<u64>,
    events: Vec<Vec<u64>>,
    idx: u8,
}

impl Default for DedupRing {
    fn default() -> Self {
        Self::new()
    }
}

impl DedupRing {
    pub fn new() -> DedupRing {
        DedupRing {
            seen: FxHashSet::default(),
            events: vec![Vec::new(); NUM_BUCKETS],
            idx: 0,
        }
    }

    pub fn contains(&self, message_id: u64) -> bool {
        self.seen.contains(&message_id)
    }

    /// returns false if the id was already present
    pub fn insert(&mut self, message_id: u64) -> bool {
        if !self.seen.insert(message_id) {
            return false;
        }
        self.events[self.idx as usize].push(message_id);
        true
    }

    /// advance the ring, forgetting the ids that have aged out
    pub fn tick(&mut self) {
        // overflow behaviour desirable: 255 + 1 wraps to 0
        self.idx = self.idx.wrapping_add(1);

        let aged_out = std::mem::take(&mut self.events[self.idx as usize]);
        for message_id in aged_out {
            self.seen.remove(&message_id);
        }
    }
}
