//! # Seek Controller
//!
//! ```text
//! Idle -> Requested -> Flushing -> Reseeding -> Settling -> Idle
//! ```
//!
//! Nothing here blocks the tick. A request raises `preload_paused` and waits,
//! tick by tick, until the decode worker is seen outside a pass; the worker
//! checks the same flag before every pass, so once the two have crossed the
//! pool and queue belong to the seek. Flushing waits out the reopen delay and
//! settling waits out the unmute delay, both as deadlines on later ticks.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::audio;
use crate::engine::EngineShared;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SeekPhase {
    Idle,
    /// Waiting for the decode worker to finish its pass
    Requested(u32),
    /// Pool and queue flushed, waiting to reopen media
    Flushing(u32),
    Reseeding(u32),
    /// Frames flowing, audio still muted
    Settling(u32),
}

pub struct SeekController {
    shared: Arc<EngineShared>,
    phase: SeekPhase,
    reopen_at: Duration,
    settle_until: Duration,
}

impl SeekController {
    pub(crate) fn new(shared: Arc<EngineShared>) -> Self {
        Self {
            shared,
            phase: SeekPhase::Idle,
            reopen_at: Duration::ZERO,
            settle_until: Duration::ZERO,
        }
    }

    pub fn phase(&self) -> SeekPhase {
        self.phase
    }

    /// True while the cursor must not move: the flush has not happened yet,
    /// or media is not reopened.
    pub fn holds_cursor(&self) -> bool {
        matches!(self.phase, SeekPhase::Requested(_) | SeekPhase::Flushing(_))
    }

    /// Move the seek along as far as it can go this tick. Returns the target
    /// frame when the cursor was moved to it on this call.
    pub(crate) fn step(&mut self, now: Duration) -> Option<u32> {
        let moved = self.try_flush(now);

        match self.phase {
            SeekPhase::Flushing(target) if now >= self.reopen_at => {
                self.reseed(target, now);
            }
            SeekPhase::Settling(target) if now >= self.settle_until => {
                let shared = &self.shared;
                if !shared.paused.load(Ordering::Acquire) {
                    shared.audio.set_muted(false);
                }
                shared.seek_active.store(false, Ordering::Release);
                self.phase = SeekPhase::Idle;
                tracing::debug!("Seek to frame {} settled", target);
            }
            _ => {}
        }
        moved
    }

    /// Flush for the latest pending request once the worker is out of its pass.
    fn try_flush(&mut self, now: Duration) -> Option<u32> {
        let shared = self.shared.clone();
        let requested = shared.peek_pending_seek()?;
        if self.phase != SeekPhase::Requested(requested) {
            tracing::debug!("Seeking to frame {}", requested);
            self.phase = SeekPhase::Requested(requested);
        }

        shared.audio.set_muted(true);
        shared.preload_paused.store(true, Ordering::SeqCst);
        if shared.worker_in_pass.load(Ordering::SeqCst) {
            return None;
        }
        let target = shared.take_pending_seek()?;

        shared.pool.reset_all();
        let generation = shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        shared.queue.reset(generation);
        shared.cursor.store(target, Ordering::Release);

        self.phase = SeekPhase::Flushing(target);
        self.reopen_at = now + shared.config.reopen_delay();
        Some(target)
    }

    /// Reopen media at the target, queue its window and let the worker go.
    fn reseed(&mut self, target: u32, now: Duration) {
        let shared = self.shared.clone();
        self.reposition(target);

        self.phase = SeekPhase::Reseeding(target);
        let generation = shared.generation.load(Ordering::Acquire);
        let end = target
            .saturating_add(shared.config.seek_window())
            .min(shared.index.total_count());
        let seeded = (target..end)
            .filter(|&frame| {
                shared
                    .queue
                    .try_enqueue(frame, generation, &shared.index, &shared.pool)
            })
            .count();

        shared.preload_paused.store(false, Ordering::SeqCst);
        shared.doorbell.ring();
        shared.counters.seeks.fetch_add(1, Ordering::Relaxed);

        self.settle_until = now + shared.config.seek_settle();
        self.phase = SeekPhase::Settling(target);
        tracing::info!(
            "Seek to frame {} (generation {}, {} frames queued)",
            target,
            generation,
            seeded
        );
    }

    /// Reopen media handles at the target's video block and audio position.
    fn reposition(&self, target: u32) {
        let shared = &self.shared;
        let unique = shared.index.unique_for(target);
        let video_offset = shared.index.block(unique).map_or(0, |(offset, _)| offset);
        let audio_pos = audio::seek_offset(
            target,
            &shared.header,
            &shared.audio_layout,
            shared.config.audio_bits_per_sample,
            shared.config.audio_alignment,
        );

        if let Err(e) = shared.io.reopen(video_offset, audio_pos) {
            tracing::warn!("Reopening media for frame {} failed: {}", target, e);
        }
        shared.audio.flush();
    }
}
