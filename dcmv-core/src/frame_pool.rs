//! # Frame Pool - Fixed Decoded-Frame Slots
//!
//! N pre-allocated buffers, each guarded by an atomic state machine:
//!
//! ```text
//!            try_claim            publish
//!   EMPTY ─────────────► LOADING ─────────► READY
//!     ▲                     │                 │
//!     │        abort        │     release     │
//!     └─────────────────────┴─────────────────┘
//! ```
//!
//! Unique frame `u` always lives in slot `u % N`. A non-EMPTY slot is busy;
//! nobody schedules work into it. `try_claim` is the only way into LOADING,
//! so two decodes can never target the same slot.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use parking_lot::{RwLock, RwLockReadGuard};
use serde::Serialize;

const NO_FRAME: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum SlotState {
    Empty = 0,
    Loading = 1,
    Ready = 2,
}

impl SlotState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Empty,
            1 => Self::Loading,
            _ => Self::Ready,
        }
    }
}

struct FrameSlot {
    state: AtomicU8,
    /// Unique frame claimed into this slot
    unique: AtomicU32,
    /// Unique frame that last failed to decode here, and how often in a row
    failed_unique: AtomicU32,
    failures: AtomicU32,
    data: RwLock<Box<[u8]>>,
}

impl FrameSlot {
    fn new(frame_size: usize) -> Self {
        Self {
            state: AtomicU8::new(SlotState::Empty as u8),
            unique: AtomicU32::new(NO_FRAME),
            failed_unique: AtomicU32::new(NO_FRAME),
            failures: AtomicU32::new(0),
            data: RwLock::new(vec![0u8; frame_size].into_boxed_slice()),
        }
    }
}

/// A READY frame borrowed for upload. Holding it keeps the buffer from being
/// overwritten; it does not pin the slot state.
pub struct FrameRef<'a> {
    pub unique: u32,
    pub slot: usize,
    data: RwLockReadGuard<'a, Box<[u8]>>,
}

impl FrameRef<'_> {
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub slots: usize,
    pub empty: usize,
    pub loading: usize,
    pub ready: usize,
    pub decoded: u64,
    pub failed: u64,
    pub released: u64,
    pub resets: u64,
}

pub struct FramePool {
    slots: Box<[FrameSlot]>,
    frame_size: usize,
    decoded: AtomicU64,
    failed: AtomicU64,
    released: AtomicU64,
    resets: AtomicU64,
}

impl FramePool {
    pub fn new(slot_count: usize, frame_size: usize) -> Self {
        assert!(slot_count > 0, "frame pool needs at least one slot");
        Self {
            slots: (0..slot_count).map(|_| FrameSlot::new(frame_size)).collect(),
            frame_size,
            decoded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            released: AtomicU64::new(0),
            resets: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Slot that caches `unique`.
    pub fn slot_for(&self, unique: u32) -> usize {
        unique as usize % self.slots.len()
    }

    pub fn state(&self, slot: usize) -> SlotState {
        SlotState::from_raw(self.slots[slot].state.load(Ordering::Acquire))
    }

    /// EMPTY -> LOADING for `unique`. False if the slot is busy.
    pub fn try_claim(&self, slot: usize, unique: u32) -> bool {
        let s = &self.slots[slot];
        let claimed = s
            .state
            .compare_exchange(
                SlotState::Empty as u8,
                SlotState::Loading as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if claimed {
            s.unique.store(unique, Ordering::Release);
        }
        claimed
    }

    /// Write decoded bytes into a LOADING slot. If the slot is flushed
    /// meanwhile the bytes are simply never published.
    pub fn fill<E>(&self, slot: usize, f: impl FnOnce(&mut [u8]) -> Result<(), E>) -> Result<(), E> {
        let mut data = self.slots[slot].data.write();
        f(&mut data)
    }

    /// LOADING -> READY. A slot flushed while its decode ran is left EMPTY.
    pub fn publish(&self, slot: usize) {
        if self.transition(slot, SlotState::Loading, SlotState::Ready) {
            let s = &self.slots[slot];
            s.failures.store(0, Ordering::Relaxed);
            s.failed_unique.store(NO_FRAME, Ordering::Relaxed);
            self.decoded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// LOADING -> EMPTY after a failed decode. Returns how many times in a
    /// row this unique frame has now failed.
    pub fn abort(&self, slot: usize) -> u32 {
        let s = &self.slots[slot];
        if self.state(slot) == SlotState::Empty {
            tracing::debug!("Slot {} flushed before its decode failed", slot);
            return 0;
        }
        let unique = s.unique.load(Ordering::Acquire);
        let failures = if s.failed_unique.swap(unique, Ordering::AcqRel) == unique {
            s.failures.fetch_add(1, Ordering::AcqRel) + 1
        } else {
            s.failures.store(1, Ordering::Release);
            1
        };
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.transition(slot, SlotState::Loading, SlotState::Empty);
        failures
    }

    /// READY -> EMPTY once the frame's display quota is used up.
    ///
    /// Returns false if a flush already emptied the slot.
    pub fn release(&self, slot: usize) -> bool {
        let s = &self.slots[slot];
        match s.state.compare_exchange(
            SlotState::Ready as u8,
            SlotState::Empty as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.released.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(raw) if raw == SlotState::Empty as u8 => {
                tracing::debug!("Slot {} already flushed before release", slot);
                false
            }
            Err(raw) => {
                self.illegal(slot, SlotState::Ready, SlotState::from_raw(raw), SlotState::Empty);
                false
            }
        }
    }

    /// Force every slot back to EMPTY and forget decode failures.
    pub fn reset_all(&self) {
        for s in self.slots.iter() {
            s.state.store(SlotState::Empty as u8, Ordering::Release);
            s.unique.store(NO_FRAME, Ordering::Relaxed);
            s.failed_unique.store(NO_FRAME, Ordering::Relaxed);
            s.failures.store(0, Ordering::Relaxed);
        }
        self.resets.fetch_add(1, Ordering::Relaxed);
    }

    /// True if `slot` is READY and holds `unique`.
    pub fn holds_ready(&self, slot: usize, unique: u32) -> bool {
        self.state(slot) == SlotState::Ready
            && self.slots[slot].unique.load(Ordering::Acquire) == unique
    }

    /// Borrow `unique`'s decoded bytes if its slot is READY.
    pub fn read(&self, unique: u32) -> Option<FrameRef<'_>> {
        let slot = self.slot_for(unique);
        if !self.holds_ready(slot, unique) {
            return None;
        }
        Some(FrameRef {
            unique,
            slot,
            data: self.slots[slot].data.read(),
        })
    }

    /// True once `unique` has failed `max_failures` decodes in a row.
    pub fn has_given_up(&self, unique: u32, max_failures: u32) -> bool {
        let s = &self.slots[self.slot_for(unique)];
        max_failures > 0
            && s.failed_unique.load(Ordering::Acquire) == unique
            && s.failures.load(Ordering::Acquire) >= max_failures
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            slots: self.slots.len(),
            decoded: self.decoded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
            ..Default::default()
        };
        for slot in 0..self.slots.len() {
            match self.state(slot) {
                SlotState::Empty => stats.empty += 1,
                SlotState::Loading => stats.loading += 1,
                SlotState::Ready => stats.ready += 1,
            }
        }
        stats
    }

    fn transition(&self, slot: usize, from: SlotState, to: SlotState) -> bool {
        match self.slots[slot].state.compare_exchange(
            from as u8,
            to as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(raw) if raw == SlotState::Empty as u8 && from == SlotState::Loading => {
                tracing::debug!("Slot {} flushed while loading, result dropped", slot);
                false
            }
            Err(raw) => {
                self.illegal(slot, from, SlotState::from_raw(raw), to);
                false
            }
        }
    }

    fn illegal(&self, slot: usize, expected: SlotState, found: SlotState, to: SlotState) {
        debug_assert!(
            false,
            "illegal slot transition on {slot}: expected {expected:?}, found {found:?}, wanted {to:?}"
        );
        tracing::error!(
            "Illegal slot transition on {}: expected {:?}, found {:?}, wanted {:?}",
            slot,
            expected,
            found,
            to
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn test_slot_lifecycle() {
        let pool = FramePool::new(4, 16);
        let slot = pool.slot_for(6);
        assert_eq!(slot, 2);
        assert_eq!(pool.state(slot), SlotState::Empty);

        assert!(pool.try_claim(slot, 6));
        assert_eq!(pool.state(slot), SlotState::Loading);
        assert!(!pool.try_claim(slot, 6));
        assert!(pool.read(6).is_none());

        pool.fill(slot, |buf| {
            buf.fill(0xAB);
            Ok::<_, ()>(())
        })
        .unwrap();
        pool.publish(slot);
        assert_eq!(pool.state(slot), SlotState::Ready);
        assert!(pool.holds_ready(slot, 6));
        assert!(!pool.holds_ready(slot, 2));
        assert!(pool.read(2).is_none());
        assert!(pool.read(6).unwrap().data().iter().all(|&b| b == 0xAB));

        assert!(pool.release(slot));
        assert_eq!(pool.state(slot), SlotState::Empty);

        let stats = pool.stats();
        assert_eq!(stats.decoded, 1);
        assert_eq!(stats.released, 1);
        assert_eq!(stats.empty, 4);
    }

    #[test]
    fn test_concurrent_claim_succeeds_once() {
        for _ in 0..50 {
            let pool = Arc::new(FramePool::new(2, 8));
            let barrier = Arc::new(Barrier::new(8));
            let wins = Arc::new(AtomicUsize::new(0));

            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let pool = pool.clone();
                    let barrier = barrier.clone();
                    let wins = wins.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        if pool.try_claim(1, 3) {
                            wins.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            assert_eq!(wins.load(Ordering::SeqCst), 1);
            assert_eq!(pool.state(1), SlotState::Loading);
        }
    }

    #[test]
    fn test_abort_tracks_failures() {
        let pool = FramePool::new(4, 8);
        for expected in 1..=3 {
            assert!(pool.try_claim(1, 5));
            assert_eq!(pool.abort(1), expected);
            assert_eq!(pool.state(1), SlotState::Empty);
        }
        assert!(pool.has_given_up(5, 3));
        assert!(!pool.has_given_up(5, 4));
        assert!(!pool.has_given_up(1, 3));

        // A different frame failing in the same slot starts over.
        assert!(pool.try_claim(1, 9));
        assert_eq!(pool.abort(1), 1);
        assert!(!pool.has_given_up(5, 3));

        // Success clears the record.
        assert!(pool.try_claim(1, 9));
        pool.publish(1);
        assert!(!pool.has_given_up(9, 1));
    }

    #[test]
    fn test_release_after_flush_is_quiet() {
        let pool = FramePool::new(2, 8);
        assert!(pool.try_claim(0, 0));
        pool.publish(0);
        pool.reset_all();
        assert!(!pool.release(0));
        assert_eq!(pool.stats().resets, 1);
    }

    #[test]
    fn test_decode_finishing_after_flush_is_dropped() {
        let pool = FramePool::new(2, 8);
        assert!(pool.try_claim(0, 4));
        pool.reset_all();
        pool.publish(0);
        assert_eq!(pool.state(0), SlotState::Empty);
        assert!(pool.read(4).is_none());
        assert_eq!(pool.stats().decoded, 0);

        assert!(pool.try_claim(1, 5));
        pool.reset_all();
        assert_eq!(pool.abort(1), 0);
        assert_eq!(pool.state(1), SlotState::Empty);
        assert!(!pool.has_given_up(5, 1));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "illegal slot transition")]
    fn test_double_publish_panics_in_debug() {
        let pool = FramePool::new(2, 8);
        assert!(pool.try_claim(0, 0));
        pool.publish(0);
        pool.publish(0);
    }

    #[test]
    fn test_reset_all_empties_everything() {
        let pool = FramePool::new(3, 8);
        assert!(pool.try_claim(0, 0));
        assert!(pool.try_claim(1, 1));
        pool.publish(1);
        pool.reset_all();
        let stats = pool.stats();
        assert_eq!(stats.empty, 3);
        assert!(pool.read(1).is_none());
    }
}
