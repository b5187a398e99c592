use bumpalo::{collections::Vec as BumpVec, Bump};

/// Scratch memory for decoding batches.
///
/// Everything allocated from the arena is borrowed from it, so the borrow
/// checker refuses any decoded value that would outlive a call to
/// [`Arena::reset`].
#[derive(Default)]
pub struct Arena {
    bump: Bump,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bump: Bump::with_capacity(capacity),
        }
    }

    pub fn alloc_str(&self, value: &str) -> &str {
        self.bump.alloc_str(value)
    }

    pub fn vec<T>(&self, capacity: usize) -> BumpVec<'_, T> {
        BumpVec::with_capacity_in(capacity, &self.bump)
    }

    /// Frees every allocation at once. The chunk backing the largest
    /// allocation is kept for reuse.
    pub fn reset(&mut self) {
        self.bump.reset();
    }

    pub fn allocated_bytes(&self) -> usize {
        self.bump.allocated_bytes()
    }
}
