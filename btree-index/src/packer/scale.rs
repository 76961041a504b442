//! Element weights and bin identifiers.

/// Measures how much of a bin an element takes up.
pub trait Weigh<T> {
    fn weigh(&self, item: &T) -> u32;
}

impl<T, F> Weigh<T> for F
where
    F: Fn(&T) -> u32,
{
    fn weigh(&self, item: &T) -> u32 {
        self(item)
    }
}

/// Weighs a string by its length in bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteLength;

impl Weigh<String> for ByteLength {
    fn weigh(&self, item: &String) -> u32 {
        u32::try_from(item.len()).unwrap_or(u32::MAX)
    }
}

/// Hands out bin identifiers that never collide with any seen so far.
#[derive(Debug, Clone, Default)]
pub struct IdGenerator {
    next: u64,
}

impl IdGenerator {
    #[must_use]
    pub const fn new() -> Self {
        Self { next: 0 }
    }

    /// A generator whose first id is `next`, for a store that already
    /// holds bins below it.
    #[must_use]
    pub const fn starting_at(next: u64) -> Self {
        Self { next }
    }

    /// Record an identifier that is already in use.
    pub fn register(&mut self, id: u64) {
        self.next = self.next.max(id.saturating_add(1));
    }

    pub const fn next_id(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }
}
