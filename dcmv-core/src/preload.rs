//! # Preload Job Queue
//!
//! Bounded ring of `(total frame, generation)` decode jobs.
//!
//! Capacity is `slots + 1` and at most `capacity - 1` jobs are ever live, the
//! classic one-spare-cell ring. Each cell carries a sequence stamp: a producer
//! reserves a position with a CAS on `head` and only then writes the cell,
//! publishing it by bumping the stamp. The consumer never sees a half-written
//! job and two producers can never claim the same position.
//!
//! ```text
//!  cell.seq == pos          free for the producer at `pos`
//!  cell.seq == pos + 1      holds a published job for the consumer at `pos`
//!  cell.seq == pos + cap    consumed, free again one lap later
//! ```

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::container::FrameIndex;
use crate::frame_pool::{FramePool, SlotState};

const NO_FRAME: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreloadJob {
    /// Target total frame
    pub frame: u32,
    /// Seek generation at enqueue time
    pub generation: u64,
}

/// Why a job was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejected {
    OutOfRange,
    SlotBusy,
    Duplicate,
    Full,
}

struct Cell {
    seq: AtomicUsize,
    frame: AtomicU32,
    unique: AtomicU32,
    generation: AtomicU64,
}

pub struct PreloadQueue {
    cells: Box<[Cell]>,
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl PreloadQueue {
    /// Queue sized for a pool of `slot_count` buffers.
    pub fn new(slot_count: usize) -> Self {
        let capacity = slot_count + 1;
        Self {
            cells: (0..capacity)
                .map(|i| Cell {
                    seq: AtomicUsize::new(i),
                    frame: AtomicU32::new(NO_FRAME),
                    unique: AtomicU32::new(NO_FRAME),
                    generation: AtomicU64::new(0),
                })
                .collect(),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    /// Live jobs, including any a producer is still publishing.
    ///
    /// Safe to call from any thread while the queue is in use or being reset;
    /// the answer never exceeds `capacity - 1`.
    pub fn len(&self) -> usize {
        let max = self.cells.len() - 1;
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            let head = self.head.load(Ordering::Acquire);
            if self.tail.load(Ordering::Acquire) == tail {
                let len = head.wrapping_sub(tail);
                // A reset between the two loads can leave head behind tail.
                return if len > max { 0 } else { len };
            }
            std::hint::spin_loop();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue a decode of `frame` unless it is pointless or impossible.
    pub fn try_enqueue(
        &self,
        frame: u32,
        generation: u64,
        index: &FrameIndex,
        pool: &FramePool,
    ) -> bool {
        self.enqueue(frame, generation, index, pool).is_ok()
    }

    /// Like [`try_enqueue`](Self::try_enqueue), reporting why a job was dropped.
    pub fn enqueue(
        &self,
        frame: u32,
        generation: u64,
        index: &FrameIndex,
        pool: &FramePool,
    ) -> Result<(), Rejected> {
        if frame >= index.total_count() {
            return Err(Rejected::OutOfRange);
        }
        let unique = index.unique_for(frame);
        if pool.state(pool.slot_for(unique)) != SlotState::Empty {
            return Err(Rejected::SlotBusy);
        }

        let cap = self.cells.len();
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            if head.wrapping_sub(tail) >= cap - 1 {
                return Err(Rejected::Full);
            }
            if self.is_queued(unique, tail, head) {
                return Err(Rejected::Duplicate);
            }

            let cell = &self.cells[head % cap];
            let seq = cell.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(head) as isize;
            if diff < 0 {
                // Consumer is still recycling this cell.
                return Err(Rejected::Full);
            }
            if diff > 0 {
                // Another producer got here first; look again.
                std::hint::spin_loop();
                continue;
            }

            if self
                .head
                .compare_exchange_weak(head, head.wrapping_add(1), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                cell.frame.store(frame, Ordering::Relaxed);
                cell.unique.store(unique, Ordering::Relaxed);
                cell.generation.store(generation, Ordering::Relaxed);
                cell.seq.store(head.wrapping_add(1), Ordering::Release);
                return Ok(());
            }
        }
    }

    /// Take the oldest published job.
    pub fn dequeue(&self) -> Option<PreloadJob> {
        let cap = self.cells.len();
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            let cell = &self.cells[tail % cap];
            let seq = cell.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(tail.wrapping_add(1)) as isize;
            if diff < 0 {
                // Empty, or the producer at `tail` has not published yet.
                return None;
            }
            if diff > 0 {
                std::hint::spin_loop();
                continue;
            }

            if self
                .tail
                .compare_exchange_weak(tail, tail.wrapping_add(1), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let job = PreloadJob {
                    frame: cell.frame.load(Ordering::Relaxed),
                    generation: cell.generation.load(Ordering::Relaxed),
                };
                cell.seq.store(tail.wrapping_add(cap), Ordering::Release);
                return Some(job);
            }
        }
    }

    /// Drop every job and stamp every cell with `generation`.
    ///
    /// Callers must ensure no enqueue or dequeue runs concurrently; the engine
    /// only resets while the decode worker is held off.
    pub fn reset(&self, generation: u64) {
        for (i, cell) in self.cells.iter().enumerate() {
            cell.frame.store(NO_FRAME, Ordering::Relaxed);
            cell.unique.store(NO_FRAME, Ordering::Relaxed);
            cell.generation.store(generation, Ordering::Relaxed);
            cell.seq.store(i, Ordering::Release);
        }
        self.tail.store(0, Ordering::Release);
        self.head.store(0, Ordering::Release);
    }

    /// Published jobs between tail and head, oldest first.
    pub fn snapshot(&self) -> Vec<PreloadJob> {
        let cap = self.cells.len();
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        let mut jobs = Vec::new();
        let mut pos = tail;
        while pos != head {
            let cell = &self.cells[pos % cap];
            if cell.seq.load(Ordering::Acquire) == pos.wrapping_add(1) {
                jobs.push(PreloadJob {
                    frame: cell.frame.load(Ordering::Relaxed),
                    generation: cell.generation.load(Ordering::Relaxed),
                });
            }
            pos = pos.wrapping_add(1);
        }
        jobs
    }

    fn is_queued(&self, unique: u32, tail: usize, head: usize) -> bool {
        let cap = self.cells.len();
        let mut pos = tail;
        while pos != head {
            let cell = &self.cells[pos % cap];
            if cell.seq.load(Ordering::Acquire) == pos.wrapping_add(1)
                && cell.unique.load(Ordering::Relaxed) == unique
            {
                return true;
            }
            pos = pos.wrapping_add(1);
        }
        false
    }
}
