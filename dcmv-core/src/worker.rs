//! # Decode Worker
//!
//! Background thread that drains the preload queue into the frame pool.
//!
//! Each pass:
//! 1. housekeep the audio stream (unless muted)
//! 2. dequeue one job; stale generations are dropped without touching the pool
//! 3. claim the slot, read the block, decompress, publish or abort
//! 4. top up the rolling window from the cursor
//! 5. watch for starvation and flush if the pipeline wedged
//!
//! While playback is paused a pass only decodes the still frame the display
//! asked for. A seek raises `preload_paused`; the worker flags itself with
//! `worker_in_pass` before it looks at that flag, so the seek either sees the
//! worker mid-pass and retries on a later tick, or the worker sees the seek
//! and starts no pass.
//!
//! Between passes the worker waits on the [`Doorbell`] rather than sleeping,
//! so seeks and control commands wake it straight away.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::codec::{create_decoder, FrameDecoder};
use crate::engine::EngineShared;
use crate::error::DecodeError;
use crate::preload::PreloadJob;

/// Periodic hook the worker drives for the audio stream.
pub trait AudioPump: Send + Sync {
    fn poll(&self);
}

// ============================================================================
// Doorbell
// ============================================================================

/// Wake-up flag with a bounded wait.
#[derive(Default)]
pub struct Doorbell {
    rung: Mutex<bool>,
    cond: Condvar,
}

impl Doorbell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ring(&self) {
        *self.rung.lock() = true;
        self.cond.notify_one();
    }

    /// Wait until rung or `timeout` passes. Returns true if it was rung.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut rung = self.rung.lock();
        if !*rung {
            self.cond.wait_for(&mut rung, timeout);
        }
        std::mem::replace(&mut *rung, false)
    }
}

// ============================================================================
// Worker
// ============================================================================

/// What one pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub decoded: Option<u32>,
    pub failed: Option<u32>,
    pub stale: bool,
    pub scheduled: usize,
    pub recovered: bool,
}

impl PassReport {
    fn did_work(&self) -> bool {
        self.decoded.is_some() || self.failed.is_some() || self.stale || self.scheduled > 0
    }
}

pub struct DecodeWorker {
    shared: Arc<EngineShared>,
    decoder: Box<dyn FrameDecoder>,
    pump: Arc<dyn AudioPump>,
    /// Compressed block scratch
    block: Vec<u8>,
    idle_passes: u32,
}

impl DecodeWorker {
    pub(crate) fn new(shared: Arc<EngineShared>) -> Result<Self, DecodeError> {
        let decoder = create_decoder(shared.header.compression)?;
        let pump: Arc<dyn AudioPump> = shared.audio.clone();
        let block = Vec::with_capacity(shared.header.max_compressed_size as usize);
        tracing::debug!("Decode worker using {}", decoder.name());
        Ok(Self {
            shared,
            decoder,
            pump,
            block,
            idle_passes: 0,
        })
    }

    pub(crate) fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("dcmv-decode".into())
            .spawn(move || self.run())
    }

    fn run(mut self) {
        tracing::info!("Decode worker started");
        let shared = self.shared.clone();
        while !shared.shutdown.load(Ordering::Acquire) {
            shared.worker_in_pass.store(true, Ordering::SeqCst);
            if shared.preload_paused.load(Ordering::SeqCst) {
                shared.worker_in_pass.store(false, Ordering::SeqCst);
                shared.doorbell.wait(shared.config.paused_poll());
                continue;
            }
            let report = self.run_pass();
            shared.worker_in_pass.store(false, Ordering::SeqCst);

            if !report.did_work() {
                let poll = if shared.paused.load(Ordering::Acquire) {
                    shared.config.paused_poll()
                } else {
                    shared.config.worker_poll()
                };
                shared.doorbell.wait(poll);
            }
        }
        tracing::info!("Decode worker stopped");
    }

    /// One worker pass. Does nothing while a seek holds preload.
    pub(crate) fn run_pass(&mut self) -> PassReport {
        let mut report = PassReport::default();
        if self.shared.preload_paused.load(Ordering::SeqCst) {
            return report;
        }

        if !self.shared.audio.is_muted() {
            self.pump.poll();
        }

        if self.shared.paused.load(Ordering::Acquire) {
            self.idle_passes = 0;
            if let Some(frame) = self.shared.take_still_request() {
                self.load(frame, &mut report);
            }
            return report;
        }

        if let Some(job) = self.shared.queue.dequeue() {
            self.process(job, &mut report);
        }

        report.scheduled = self.top_up();
        report.recovered = self.watch_starvation(report.scheduled);
        report
    }

    fn process(&mut self, job: PreloadJob, report: &mut PassReport) {
        let shared = self.shared.clone();
        let current = shared.generation.load(Ordering::Acquire);
        if job.generation != current {
            tracing::debug!(
                "Dropping stale job for frame {} (generation {} != {})",
                job.frame,
                job.generation,
                current
            );
            shared.counters.stale_jobs.fetch_add(1, Ordering::Relaxed);
            report.stale = true;
            return;
        }
        self.load(job.frame, report);
    }

    /// Claim the frame's slot and decode into it.
    fn load(&mut self, frame: u32, report: &mut PassReport) {
        let shared = self.shared.clone();
        let unique = shared.index.unique_for(frame);
        let slot = shared.pool.slot_for(unique);
        if shared.pool.holds_ready(slot, unique) {
            return;
        }
        if !shared.pool.try_claim(slot, unique) {
            tracing::debug!("Slot {} busy, skipping frame {}", slot, frame);
            return;
        }

        match self.decode(unique, slot) {
            Ok(()) => {
                shared.pool.publish(slot);
                report.decoded = Some(unique);
            }
            Err(e) => {
                let failures = shared.pool.abort(slot);
                shared.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "Decode of frame {} (unique {}) failed, attempt {}: {}",
                    frame,
                    unique,
                    failures,
                    e
                );
                report.failed = Some(unique);
            }
        }
    }

    fn decode(&mut self, unique: u32, slot: usize) -> Result<(), DecodeError> {
        let shared = &self.shared;
        let (offset, size) = shared
            .index
            .block(unique)
            .ok_or(DecodeError::BlankBlock(unique))?;
        if size == 0 {
            return Err(DecodeError::BlankBlock(unique));
        }
        let max = shared.header.max_compressed_size as usize;
        if max > 0 && size > max {
            return Err(DecodeError::BlockTooLarge { size, max });
        }

        self.block.resize(size, 0);
        shared.io.read_block(offset, &mut self.block)?;

        let decoder = &mut self.decoder;
        let block = &self.block;
        shared.pool.fill(slot, |out| decoder.decode_into(block, out))
    }

    /// Queue the cursor frame and the window after it. Returns jobs queued.
    fn top_up(&self) -> usize {
        let shared = &self.shared;
        let cursor = shared.cursor.load(Ordering::Acquire);
        let generation = shared.generation.load(Ordering::Acquire);
        let total = shared.index.total_count();
        if cursor >= total {
            return 0;
        }
        let last = cursor
            .saturating_add(shared.config.preload_window())
            .min(total - 1);

        let mut scheduled = 0;
        for frame in cursor..=last {
            let unique = shared.index.unique_for(frame);
            if shared.pool.has_given_up(unique, shared.config.max_decode_retries) {
                continue;
            }
            if shared.queue.try_enqueue(frame, generation, &shared.index, &shared.pool) {
                scheduled += 1;
            }
        }
        scheduled
    }

    fn watch_starvation(&mut self, scheduled: usize) -> bool {
        let shared = &self.shared;
        let cursor = shared.cursor.load(Ordering::Acquire);
        let stuck = scheduled == 0
            && shared.queue.is_empty()
            && !shared.paused.load(Ordering::Acquire)
            && cursor < shared.index.total_count()
            && !self.cursor_servable(cursor);

        if !stuck {
            self.idle_passes = 0;
            return false;
        }
        self.idle_passes += 1;
        if self.idle_passes <= shared.config.starvation_idle_passes {
            return false;
        }

        tracing::warn!(
            "Starved at frame {} for {} passes, flushing frame pool",
            cursor,
            self.idle_passes
        );
        self.idle_passes = 0;
        let generation = shared.generation.load(Ordering::Acquire);
        shared.pool.reset_all();
        shared.queue.reset(generation);

        let total = shared.index.total_count();
        let end = cursor.saturating_add(shared.config.recovery_window()).min(total);
        for frame in cursor..end {
            shared
                .queue
                .try_enqueue(frame, generation, &shared.index, &shared.pool);
        }
        shared.counters.recoveries.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn cursor_servable(&self, cursor: u32) -> bool {
        let shared = &self.shared;
        let unique = shared.index.unique_for(cursor);
        shared.pool.holds_ready(shared.pool.slot_for(unique), unique)
            || shared.pool.has_given_up(unique, shared.config.max_decode_retries)
    }
}
