//! Bounded lock-free stack over a pre-allocated slot array.
//!
//! The stack head packs a read counter and a write counter into a single
//! atomic word. `push` reserves a slot by bumping the write counter, writes
//! the element, then raises the read counter over it; `pop` only proceeds
//! when both counters agree, so it never observes a slot whose element has
//! not been published yet.

use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Slot value meaning "empty".
const EMPTY: u32 = u32::MAX;

#[inline]
fn pack(read_head: u32, write_head: u32) -> u64 {
    ((read_head as u64) << 32) | write_head as u64
}

#[inline]
fn unpack(head: u64) -> (u32, u32) {
    ((head >> 32) as u32, head as u32)
}

/// Fixed-capacity stack of `u32` values (page indices in practice).
pub(crate) struct FixedSizeStack {
    slots: Box<[AtomicU32]>,
    head: CachePadded<AtomicU64>,
}

impl FixedSizeStack {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "stack capacity must be non-zero");
        assert!(capacity < EMPTY as usize, "stack capacity exceeds u32 range");
        let slots = (0..capacity).map(|_| AtomicU32::new(EMPTY)).collect();
        Self {
            slots,
            head: CachePadded::new(AtomicU64::new(pack(0, 0))),
        }
    }

    /// Pops the most recently pushed value, or `None` when empty.
    pub fn pop(&self) -> Option<u32> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let (read_head, write_head) = unpack(head);
            // A push is still publishing its element; wait for the read
            // head to catch up before taking anything.
            if read_head != write_head {
                std::hint::spin_loop();
                continue;
            }
            if read_head == 0 {
                return None;
            }
            let value = self.slots[read_head as usize - 1].load(Ordering::Acquire);
            if self
                .head
                .compare_exchange(
                    head,
                    pack(read_head - 1, write_head - 1),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Some(value);
            }
        }
    }

    /// Pushes a value; returns `false` when the stack is full.
    pub fn push(&self, value: u32) -> bool {
        debug_assert_ne!(value, EMPTY, "EMPTY is reserved as a slot sentinel");
        loop {
            let head = self.head.load(Ordering::Acquire);
            let (read_head, write_head) = unpack(head);
            if write_head as usize == self.slots.len() {
                return false;
            }
            if self
                .head
                .compare_exchange(
                    head,
                    pack(read_head, write_head + 1),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                continue;
            }
            self.slots[write_head as usize].store(value, Ordering::Release);

            // The element is in place; raise the read head over our slot so
            // poppers may take it. Other pushers below us raise theirs first.
            let mut head = self.head.load(Ordering::Acquire);
            loop {
                let (read_head, current_write) = unpack(head);
                if read_head > write_head {
                    break;
                }
                if read_head == write_head {
                    let _ = self.head.compare_exchange(
                        head,
                        pack(write_head + 1, current_write),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                }
                head = self.head.load(Ordering::Acquire);
            }
            return true;
        }
    }

    /// Number of elements currently poppable. Approximate under concurrency.
    pub fn len(&self) -> usize {
        let (read_head, _) = unpack(self.head.load(Ordering::Acquire));
        read_head as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn push_pop_single_threaded() {
        let stack = FixedSizeStack::new(4);
        assert_eq!(stack.pop(), None);
        assert!(stack.push(7));
        assert!(stack.push(9));
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.pop(), Some(9));
        assert_eq!(stack.pop(), Some(7));
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn push_fails_when_full() {
        let stack = FixedSizeStack::new(2);
        assert!(stack.push(0));
        assert!(stack.push(1));
        assert!(!stack.push(2));
        assert_eq!(stack.pop(), Some(1));
        assert!(stack.push(2));
    }

    #[test]
    fn concurrent_push_pop_preserves_elements() {
        const PER_THREAD: usize = 512;
        const THREADS: usize = 4;

        let stack = Arc::new(FixedSizeStack::new(THREADS * PER_THREAD));
        let mut handles = Vec::new();
        for t in 0..THREADS {
            let stack = Arc::clone(&stack);
            handles.push(std::thread::spawn(move || {
                for i in 0..PER_THREAD {
                    assert!(stack.push((t * PER_THREAD + i) as u32));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let mut seen = vec![false; THREADS * PER_THREAD];
        while let Some(value) = stack.pop() {
            let value = value as usize;
            assert!(!seen[value], "value {value} popped twice");
            seen[value] = true;
        }
        assert!(seen.iter().all(|&s| s), "elements lost under concurrency");
    }
}
