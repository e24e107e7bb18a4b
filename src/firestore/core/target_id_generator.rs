const RESERVED_BITS: i32 = 1;

/// Hands out target ids from two disjoint sequences: even ids for targets
/// persisted in the target cache and odd ids for the sync engine's limbo
/// resolution targets, which are never persisted.
#[derive(Clone, Debug)]
pub struct TargetIdGenerator {
    last_id: i32,
}

impl TargetIdGenerator {
    /// Generator continuing after `highest_target_id`, the largest id the
    /// target cache has seen.
    pub fn for_target_cache(highest_target_id: i32) -> Self {
        let last_id = if highest_target_id % 2 == 0 {
            highest_target_id
        } else {
            highest_target_id - 1
        };
        Self { last_id }
    }

    pub fn for_sync_engine() -> Self {
        Self { last_id: -1 }
    }

    pub fn next(&mut self) -> i32 {
        self.last_id += 1 << RESERVED_BITS;
        self.last_id
    }
}
