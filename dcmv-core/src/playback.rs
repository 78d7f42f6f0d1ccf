//! # Playback Clock
//!
//! Foreground per-tick driver. Maps elapsed time to a target frame with the
//! stream's exact timebase, shows READY frames in order, and retires each
//! slot once its unique frame has been shown for the rest of its run.
//!
//! The clock is anchored to `(frame, instant)`; the cursor frame is due once
//! `anchor_frame + frames_in(now - anchor_time) >= cursor`. Seeks and pauses
//! re-anchor, so no drift accumulates across either.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::clock::Clock;
use crate::engine::{EngineShared, NO_END_FRAME};
use crate::render::{DisplayGeometry, FrameSink};
use crate::seek::{SeekController, SeekPhase};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlaybackState {
    Playing,
    Paused,
    Stopped,
    Seeking,
    Ended,
}

/// What a tick did with the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Cursor frame shown and the cursor advanced. `uploaded` is false for
    /// repeats of the previous unique frame.
    Shown { frame: u32, unique: u32, uploaded: bool },
    /// Frame could not be decoded; the previous picture stands in for it.
    Skipped { frame: u32 },
    /// Not due yet.
    Early,
    /// Due but not decoded yet; the previous picture stays up.
    Waiting { frame: u32 },
    /// A seek is waiting on the worker or on media; the cursor is held.
    Seeking,
    Paused,
    Ended,
}

pub struct PlaybackClock {
    shared: Arc<EngineShared>,
    clock: Arc<dyn Clock>,
    seek: SeekController,
    geometry: DisplayGeometry,
    anchor_time: Duration,
    anchor_frame: u32,
    last_unique: Option<u32>,
    /// Times `last_unique` has been shown, and how many it gets
    shown: u32,
    quota: u32,
}

impl PlaybackClock {
    pub(crate) fn new(shared: Arc<EngineShared>, clock: Arc<dyn Clock>) -> Self {
        let anchor_time = clock.now();
        let anchor_frame = shared.cursor.load(Ordering::Acquire);
        Self {
            geometry: DisplayGeometry::for_header(&shared.header),
            seek: SeekController::new(shared.clone()),
            shared,
            clock,
            anchor_time,
            anchor_frame,
            last_unique: None,
            shown: 0,
            quota: 0,
        }
    }

    pub fn geometry(&self) -> &DisplayGeometry {
        &self.geometry
    }

    pub fn seek_phase(&self) -> SeekPhase {
        self.seek.phase()
    }

    pub fn last_unique_drawn(&self) -> Option<u32> {
        self.last_unique
    }

    /// Advance playback by one display tick and submit the quad.
    pub fn tick(&mut self, sink: &mut dyn FrameSink) -> TickOutcome {
        let now = self.clock.now();
        if let Some(target) = self.seek.step(now) {
            self.re_anchor(target, now);
            self.last_unique = None;
        }

        let outcome = if self.seek.holds_cursor() {
            let cursor = self.shared.cursor.load(Ordering::Acquire);
            self.re_anchor(cursor, now);
            TickOutcome::Seeking
        } else {
            self.advance(now, sink)
        };
        sink.draw(&self.geometry);
        outcome
    }

    fn advance(&mut self, now: Duration, sink: &mut dyn FrameSink) -> TickOutcome {
        let shared = self.shared.clone();
        let cursor = shared.cursor.load(Ordering::Acquire);

        if shared.paused.load(Ordering::Acquire) {
            self.re_anchor(cursor, now);
            self.show_still(cursor, sink);
            return TickOutcome::Paused;
        }
        if cursor >= shared.index.total_count() {
            return TickOutcome::Ended;
        }
        self.check_end_frame(cursor);

        let elapsed = now.saturating_sub(self.anchor_time);
        let due = u64::from(self.anchor_frame) + shared.header.timebase.frames_in(elapsed)
            >= u64::from(cursor);
        if !due {
            return TickOutcome::Early;
        }

        let unique = shared.index.unique_for(cursor);
        if let Some(frame) = shared.pool.read(unique) {
            let uploaded = self.last_unique != Some(unique);
            if uploaded {
                sink.upload(&frame);
                self.adopt(unique, cursor);
            }
            let slot = frame.slot;
            drop(frame);

            self.shown += 1;
            if self.shown >= self.quota {
                shared.pool.release(slot);
            }
            self.step_cursor(cursor);
            return TickOutcome::Shown {
                frame: cursor,
                unique,
                uploaded,
            };
        }

        if shared
            .pool
            .has_given_up(unique, shared.config.max_decode_retries)
        {
            tracing::warn!(
                "Frame {} (unique {}) undecodable, repeating previous picture",
                cursor,
                unique
            );
            shared.counters.skipped_frames.fetch_add(1, Ordering::Relaxed);
            self.step_cursor(cursor);
            return TickOutcome::Skipped { frame: cursor };
        }

        TickOutcome::Waiting { frame: cursor }
    }

    /// While paused with nothing on screen (after a search, or before the
    /// first frame), put the cursor's picture up once it is decoded. Preload
    /// is held while paused, so the frame is asked for explicitly.
    fn show_still(&mut self, cursor: u32, sink: &mut dyn FrameSink) {
        let shared = &self.shared;
        if self.last_unique.is_some() || cursor >= shared.index.total_count() {
            return;
        }
        let unique = shared.index.unique_for(cursor);
        let Some(frame) = shared.pool.read(unique) else {
            if !shared
                .pool
                .has_given_up(unique, shared.config.max_decode_retries)
            {
                shared.request_still(cursor);
            }
            return;
        };
        sink.upload(&frame);
        drop(frame);
        self.adopt(unique, cursor);
    }

    /// Start counting displays for a newly uploaded unique frame. Its quota
    /// is what is left of its run from `cursor`, so a seek into the middle of
    /// a run still frees the slot.
    fn adopt(&mut self, unique: u32, cursor: u32) {
        self.last_unique = Some(unique);
        self.shown = 0;
        self.quota = self
            .shared
            .index
            .run_end(unique)
            .saturating_sub(cursor)
            .max(1);
        self.shared.counters.uploads.fetch_add(1, Ordering::Relaxed);
    }

    fn step_cursor(&self, cursor: u32) {
        self.shared.cursor.store(cursor + 1, Ordering::Release);
        self.shared.displayed.fetch_add(1, Ordering::AcqRel);
        self.shared.doorbell.ring();
    }

    fn check_end_frame(&self, cursor: u32) {
        let shared = &self.shared;
        let end = shared.end_frame.load(Ordering::Acquire);
        if end != NO_END_FRAME
            && cursor >= end
            && shared
                .end_frame
                .compare_exchange(end, NO_END_FRAME, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            shared.audio.set_muted(true);
            tracing::info!("Reached end frame {}, audio muted", end);
        }
    }

    fn re_anchor(&mut self, frame: u32, now: Duration) {
        self.anchor_frame = frame;
        self.anchor_time = now;
    }
}
