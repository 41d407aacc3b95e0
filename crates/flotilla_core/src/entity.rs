//! Entity identity and spatial index tokens
//!
//! Ships carry a stable numeric id for their whole lifetime. Their slot in the
//! spatial index is addressed by a generation-indexed token so a token held
//! past removal can never alias a newer record.

use std::fmt;

/// Stable ship identity
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle to a record's slot inside the spatial index (generation-indexed)
///
/// - Index: slot number, reused after removal
/// - Generation: incremented on removal (stale tokens are rejected)
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SpatialToken {
    index: u32,
    generation: u32,
}

impl SpatialToken {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

/// Slot allocator with generation bumping on release.
#[derive(Debug, Default)]
pub(crate) struct TokenSlots {
    generations: Vec<u32>,
    free: Vec<u32>,
}

impl TokenSlots {
    pub fn alloc(&mut self) -> SpatialToken {
        if let Some(index) = self.free.pop() {
            SpatialToken::new(index, self.generations[index as usize])
        } else {
            let index = self.generations.len() as u32;
            self.generations.push(0);
            SpatialToken::new(index, 0)
        }
    }

    /// Returns the slot to the free list. Stale tokens are ignored.
    pub fn release(&mut self, token: SpatialToken) -> bool {
        match self.generations.get_mut(token.index as usize) {
            Some(generation) if *generation == token.generation => {
                *generation = generation.wrapping_add(1);
                self.free.push(token.index);
                true
            }
            _ => false,
        }
    }
}
