//! Head/tail arithmetic over the circular command buffer.
//!
//! Head and tail alone can't tell a full ring from an empty one, since both
//! have `head == tail`. Each position therefore carries a wrap flag that flips
//! every time it passes the end of the ring: equal indices with equal flags is
//! empty, equal indices with different flags is full. Every slot is usable.

use std::num::NonZeroU32;

use crate::error::{Error, Result};

/// A slot index plus the parity of the laps taken around the ring.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Position {
    pub index: u32,
    pub wrap: bool,
}

impl Position {
    pub const ZERO: Position = Position {
        index: 0,
        wrap: false,
    };
}

/// Moves `pos` one slot forward.
pub fn advance(pos: Position, capacity: NonZeroU32) -> Position {
    advance_by(pos, 1, capacity)
}

/// Moves `pos` forward by `n` slots, `n <= capacity`.
pub fn advance_by(pos: Position, n: u32, capacity: NonZeroU32) -> Position {
    let capacity = capacity.get();
    debug_assert!(n <= capacity);
    let next = u64::from(pos.index) + u64::from(n);
    if next >= u64::from(capacity) {
        Position {
            index: (next - u64::from(capacity)) as u32,
            wrap: !pos.wrap,
        }
    } else {
        Position {
            index: next as u32,
            wrap: pos.wrap,
        }
    }
}

pub fn is_empty(head: Position, tail: Position) -> bool {
    head == tail
}

pub fn is_full(head: Position, tail: Position) -> bool {
    head.index == tail.index && head.wrap != tail.wrap
}

/// Slots between `head` and `tail`.
///
/// Both indices must be below `capacity` and `tail` must be at most one lap
/// ahead of `head`, as it always is for positions moved with [`advance`].
pub fn occupied(head: Position, tail: Position, capacity: NonZeroU32) -> u32 {
    debug_assert!(head.index < capacity.get() && tail.index < capacity.get());
    debug_assert!(
        head.wrap != tail.wrap || head.index <= tail.index,
        "tail {tail:?} is behind head {head:?}"
    );
    debug_assert!(
        head.wrap == tail.wrap || tail.index <= head.index,
        "tail {tail:?} is more than a lap ahead of head {head:?}"
    );
    if head.wrap == tail.wrap {
        tail.index - head.index
    } else {
        capacity.get() - head.index + tail.index
    }
}

/// Slots that can still be filled before the ring is full. Same
/// preconditions as [`occupied`].
pub fn slots_available(head: Position, tail: Position, capacity: NonZeroU32) -> u32 {
    capacity.get() - occupied(head, tail, capacity)
}

/// Forward distance in slots from index `from` to index `to`, ignoring wrap.
pub fn distance(from: u32, to: u32, capacity: NonZeroU32) -> u32 {
    if to >= from {
        to - from
    } else {
        capacity.get() - from + to
    }
}

/// The driver's view of the ring: entries between `head` and `tail` are in
/// flight or answered but not yet consumed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RingCursor {
    head: Position,
    tail: Position,
    capacity: NonZeroU32,
}

impl RingCursor {
    pub fn new(capacity: NonZeroU32) -> Self {
        Self {
            head: Position::ZERO,
            tail: Position::ZERO,
            capacity,
        }
    }

    pub fn head(&self) -> Position {
        self.head
    }

    pub fn tail(&self) -> Position {
        self.tail
    }

    pub fn capacity(&self) -> NonZeroU32 {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        is_empty(self.head, self.tail)
    }

    pub fn is_full(&self) -> bool {
        is_full(self.head, self.tail)
    }

    pub fn occupied(&self) -> u32 {
        occupied(self.head, self.tail, self.capacity)
    }

    pub fn slots_available(&self) -> u32 {
        slots_available(self.head, self.tail, self.capacity)
    }

    /// Claims the slot at the tail. Leaves the cursor untouched when full.
    pub fn advance_tail(&mut self) -> Result<Position> {
        if self.is_full() {
            return Err(Error::RingFull {
                capacity: self.capacity.get(),
            });
        }
        self.tail = advance(self.tail, self.capacity);
        Ok(self.tail)
    }

    /// Releases the slot at the head, or returns `None` when nothing is
    /// occupied.
    pub fn advance_head(&mut self) -> Option<Position> {
        if self.is_empty() {
            return None;
        }
        self.head = advance(self.head, self.capacity);
        Some(self.head)
    }

    pub fn reset(&mut self) {
        self.reset_at(0);
    }

    /// Empties the ring with both positions on slot `index`.
    pub fn reset_at(&mut self, index: u32) {
        debug_assert!(index < self.capacity.get());
        let start = Position { index, wrap: false };
        self.head = start;
        self.tail = start;
    }
}
