//! Ring-buffer cursor discipline.
//!
//! The request ring has a single consumer-owned head; the response ring
//! runs three tails:
//!
//! - `tail_a` advances at reservation time,
//! - `tail_b` advances as responses complete,
//! - `tail_c` advances as responses are published to the host,
//!
//! with `head_consumer <= tail_c <= tail_b <= tail_a` in ring-modulo
//! order at all times.

use dstore_wire::RingSize;

/// Forward distance from `head` to `tail` on a ring of `capacity` bytes.
#[inline]
pub fn distance(tail: RingSize, head: RingSize, capacity: RingSize) -> RingSize {
    if tail >= head {
        tail - head
    } else {
        capacity - head + tail
    }
}

/// How many split DMA transfers are still outstanding for one logical
/// range: two when the range straddled the wrap, one otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitState {
    remaining: u8,
}

impl SplitState {
    pub const IDLE: SplitState = SplitState { remaining: 0 };

    pub fn start(split: bool) -> Self {
        SplitState {
            remaining: if split { 2 } else { 1 },
        }
    }

    /// Records one completion; returns true when all parts have landed.
    pub fn complete_one(&mut self) -> bool {
        debug_assert!(self.remaining > 0);
        self.remaining -= 1;
        self.remaining == 0
    }
}

/// Consumer-side state of the request ring.
#[derive(Debug)]
pub struct RequestRing {
    pub capacity: RingSize,
    /// Next byte to read; mirrors the head word the host polls.
    pub head: RingSize,
}

impl RequestRing {
    pub fn new(capacity: RingSize) -> Self {
        RequestRing { capacity, head: 0 }
    }
}

/// Producer-side state of the response ring.
#[derive(Debug)]
pub struct ResponseRing {
    pub capacity: RingSize,
    /// Reservation tail.
    pub tail_a: RingSize,
    /// Completion tail.
    pub tail_b: RingSize,
    /// Publication tail.
    pub tail_c: RingSize,
}

impl ResponseRing {
    pub fn new(capacity: RingSize) -> Self {
        ResponseRing {
            capacity,
            tail_a: 0,
            tail_b: 0,
            tail_c: 0,
        }
    }

    /// Bytes that can still be reserved without `tail_a` running into
    /// `tail_b`. One byte is kept back so a full ring is distinguishable
    /// from an empty one.
    #[inline]
    pub fn reservable(&self) -> RingSize {
        self.capacity - distance(self.tail_a, self.tail_b, self.capacity) - 1
    }

    /// Bytes completed but not yet published.
    #[inline]
    pub fn unpublished(&self) -> RingSize {
        distance(self.tail_b, self.tail_c, self.capacity)
    }

    #[inline]
    pub fn advance_a(&mut self, bytes: RingSize) {
        self.tail_a = (self.tail_a + bytes) % self.capacity;
        self.assert_order();
    }

    #[inline]
    pub fn advance_b(&mut self, bytes: RingSize) {
        self.tail_b = (self.tail_b + bytes) % self.capacity;
        self.assert_order();
    }

    #[inline]
    pub fn advance_c(&mut self, bytes: RingSize) {
        self.tail_c = (self.tail_c + bytes) % self.capacity;
        self.assert_order();
    }

    /// `tail_c <= tail_b <= tail_a` in ring-modulo order.
    #[inline]
    fn assert_order(&self) {
        debug_assert!(
            distance(self.tail_b, self.tail_c, self.capacity)
                <= distance(self.tail_a, self.tail_c, self.capacity)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_wraps() {
        assert_eq!(distance(100, 40, 4096), 60);
        assert_eq!(distance(40, 100, 4096), 4096 - 60);
        assert_eq!(distance(0, 0, 4096), 0);
    }

    #[test]
    fn split_state_counts_parts() {
        let mut s = SplitState::start(false);
        assert!(s.complete_one());

        let mut s = SplitState::start(true);
        assert!(!s.complete_one());
        assert!(s.complete_one());
    }

    #[test]
    fn response_tails_keep_order() {
        let mut r = ResponseRing::new(4096);
        r.advance_a(120);
        assert_eq!(r.reservable(), 4096 - 120 - 1);
        r.advance_b(24);
        r.advance_b(96);
        assert_eq!(r.unpublished(), 120);
        r.advance_c(120);
        assert_eq!(r.unpublished(), 0);
        assert_eq!(r.tail_a, 120);
    }

    #[test]
    fn reservation_wraps_modulo() {
        let mut r = ResponseRing::new(128);
        r.advance_a(120);
        r.advance_b(120);
        r.advance_c(120);
        r.advance_a(24);
        assert_eq!(r.tail_a, 16);
        assert_eq!(distance(r.tail_a, r.tail_c, 128), 24);
    }
}
