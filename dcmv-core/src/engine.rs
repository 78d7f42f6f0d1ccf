//! # Engine Context
//!
//! One [`Engine`] owns everything for one open container: the shared state
//! the decode worker and the audio callback see, the foreground playback
//! clock, and the worker thread. A cloneable [`Control`] handle is the
//! command surface; commands only set flags and land on a later tick.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use serde::Serialize;

use crate::audio::AudioStreamSource;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::container::{self, AudioLayout, Container, FrameIndex, StreamHeader};
use crate::error::{ContainerError, ControlError, EngineError};
use crate::frame_pool::{FramePool, PoolStats};
use crate::media::{MediaIo, MediaSource};
use crate::playback::{PlaybackClock, PlaybackState, TickOutcome};
use crate::preload::PreloadQueue;
use crate::render::{DisplayGeometry, FrameSink};
use crate::worker::{DecodeWorker, Doorbell};

pub(crate) const NO_END_FRAME: u32 = u32::MAX;
pub(crate) const NO_STILL: u32 = u32::MAX;
const NO_SEEK: i64 = -1;

// ============================================================================
// Shared State
// ============================================================================

#[derive(Default)]
pub(crate) struct Counters {
    pub stale_jobs: AtomicU64,
    pub decode_failures: AtomicU64,
    pub recoveries: AtomicU64,
    pub skipped_frames: AtomicU64,
    pub seeks: AtomicU64,
    pub uploads: AtomicU64,
}

/// State shared by the tick driver, the decode worker and the audio callback.
pub(crate) struct EngineShared {
    pub config: EngineConfig,
    pub header: StreamHeader,
    pub index: FrameIndex,
    pub audio_layout: AudioLayout,

    pub pool: FramePool,
    pub queue: PreloadQueue,
    pub io: Arc<MediaIo>,
    pub audio: Arc<AudioStreamSource>,

    /// Total frame to show next
    pub cursor: AtomicU32,
    /// Frames shown since open. Only ever grows; seeks do not touch it.
    pub displayed: AtomicU32,
    /// Bumped once per seek, never reset
    pub generation: AtomicU64,

    /// Raised by a seek; the worker starts no pass while it is set
    pub preload_paused: AtomicBool,
    /// Set by the worker around each pass
    pub worker_in_pass: AtomicBool,
    /// Paused playback holds preload off; only a still request is decoded
    pub paused: AtomicBool,
    pub stopped: AtomicBool,
    pub shutdown: AtomicBool,
    /// Set from request until the seek settles
    pub seek_active: AtomicBool,
    pub end_frame: AtomicU32,
    /// Frame a paused display needs decoded, or `NO_STILL`
    pub still_request: AtomicU32,
    /// Latest unserved seek target, or `NO_SEEK`
    pending_seek: AtomicI64,

    pub doorbell: Doorbell,
    pub counters: Counters,
}

impl EngineShared {
    pub(crate) fn new(
        container: Container,
        source: Arc<dyn MediaSource>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let Container {
            header,
            index,
            audio: audio_layout,
            ..
        } = container;

        let io = Arc::new(MediaIo::open(source, audio_layout).map_err(ContainerError::Io)?);
        let audio = Arc::new(AudioStreamSource::new(io.clone(), &audio_layout));

        Ok(Self {
            pool: FramePool::new(config.slot_count, header.frame_size as usize),
            queue: PreloadQueue::new(config.slot_count),
            io,
            audio,
            cursor: AtomicU32::new(0),
            displayed: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            preload_paused: AtomicBool::new(false),
            worker_in_pass: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            seek_active: AtomicBool::new(false),
            end_frame: AtomicU32::new(NO_END_FRAME),
            still_request: AtomicU32::new(NO_STILL),
            pending_seek: AtomicI64::new(NO_SEEK),
            doorbell: Doorbell::new(),
            counters: Counters::default(),
            config,
            header,
            index,
            audio_layout,
        })
    }

    /// Queue a seek to `frame`, clamped into the stream. A newer request
    /// replaces one not yet carried out.
    pub(crate) fn request_seek(&self, frame: i64) -> u32 {
        let target = self.index.clamp_frame(frame);
        self.seek_active.store(true, Ordering::Release);
        self.pending_seek.store(i64::from(target), Ordering::Release);
        tracing::debug!("Seek to {} requested (asked for {})", target, frame);
        target
    }

    pub(crate) fn peek_pending_seek(&self) -> Option<u32> {
        u32::try_from(self.pending_seek.load(Ordering::Acquire)).ok()
    }

    pub(crate) fn take_pending_seek(&self) -> Option<u32> {
        u32::try_from(self.pending_seek.swap(NO_SEEK, Ordering::AcqRel)).ok()
    }

    /// Ask the worker to decode `frame` even though playback is paused.
    pub(crate) fn request_still(&self, frame: u32) {
        if self.still_request.swap(frame, Ordering::AcqRel) != frame {
            self.doorbell.ring();
        }
    }

    pub(crate) fn take_still_request(&self) -> Option<u32> {
        match self.still_request.swap(NO_STILL, Ordering::AcqRel) {
            NO_STILL => None,
            frame => Some(frame),
        }
    }

    pub(crate) fn state(&self) -> PlaybackState {
        if self.peek_pending_seek().is_some() {
            PlaybackState::Seeking
        } else if self.stopped.load(Ordering::Acquire) {
            PlaybackState::Stopped
        } else if self.paused.load(Ordering::Acquire) {
            PlaybackState::Paused
        } else if self.cursor.load(Ordering::Acquire) >= self.index.total_count() {
            PlaybackState::Ended
        } else {
            PlaybackState::Playing
        }
    }
}

// ============================================================================
// Control Surface
// ============================================================================

/// Non-blocking command handle. Cheap to clone and safe to use from any thread.
#[derive(Clone)]
pub struct Control {
    shared: Arc<EngineShared>,
}

impl Control {
    pub fn get_current_frame(&self) -> u32 {
        self.shared.cursor.load(Ordering::Acquire)
    }

    /// Search: seek to `frame` and hold there paused.
    pub fn seek(&self, frame: i64) -> u32 {
        self.shared.paused.store(true, Ordering::Release);
        self.shared.request_seek(frame)
    }

    /// Seek to `frame` and keep playing from there.
    pub fn skip_to_frame(&self, frame: i64) -> u32 {
        self.shared.paused.store(false, Ordering::Release);
        self.shared.stopped.store(false, Ordering::Release);
        self.shared.request_seek(frame)
    }

    /// Seek one frame back without touching the play/pause state.
    pub fn step_backward(&self) -> u32 {
        let cursor = i64::from(self.get_current_frame());
        self.shared.request_seek(cursor - 1)
    }

    pub fn play(&self) {
        let shared = &self.shared;
        shared.paused.store(false, Ordering::Release);
        shared.stopped.store(false, Ordering::Release);
        // A seek in flight unmutes once it settles.
        if !shared.seek_active.load(Ordering::Acquire) {
            shared.audio.set_muted(false);
        }
        shared.doorbell.ring();
    }

    /// Stop the clock and hold off preload. The worker only decodes what a
    /// paused display asks for.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
        self.shared.audio.set_muted(true);
    }

    pub fn stop(&self) {
        self.pause();
        self.shared.stopped.store(true, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    pub fn state(&self) -> PlaybackState {
        self.shared.state()
    }

    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }

    /// Enable or disable audio channel 1 (left) or 2 (right).
    pub fn set_audio_channel_enabled(&self, channel: u8, on: bool) -> Result<(), ControlError> {
        self.shared.audio.set_channel_enabled(channel, on)
    }

    /// Mute audio once playback reaches `frame`. `None` clears it.
    pub fn set_end_frame(&self, frame: Option<u32>) {
        let value = frame.unwrap_or(NO_END_FRAME);
        self.shared.end_frame.store(value, Ordering::Release);
    }

    pub fn volume(&self) -> u8 {
        self.shared.audio.volume()
    }

    pub fn set_volume(&self, volume: u8) {
        self.shared.audio.set_volume(volume);
    }

    pub fn get_video_width(&self) -> u16 {
        self.shared.header.width
    }

    pub fn get_video_height(&self) -> u16 {
        self.shared.header.height
    }

    pub fn get_content_width(&self) -> u16 {
        self.shared.header.content_width
    }

    pub fn get_content_height(&self) -> u16 {
        self.shared.header.content_height
    }

    pub fn total_frames(&self) -> u32 {
        self.shared.index.total_count()
    }
}

// ============================================================================
// Stats
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub state: PlaybackState,
    pub frame: u32,
    pub displayed: u32,
    pub total_frames: u32,
    pub generation: u64,
    pub queued: usize,
    pub pool: PoolStats,
    pub stale_jobs: u64,
    pub decode_failures: u64,
    pub recoveries: u64,
    pub skipped_frames: u64,
    pub seeks: u64,
    pub uploads: u64,
    pub media_reopens: u64,
    pub audio_bytes_out: u64,
}

// ============================================================================
// Engine
// ============================================================================

pub struct Engine {
    shared: Arc<EngineShared>,
    playback: PlaybackClock,
    worker: Option<JoinHandle<()>>,
}

impl Engine {
    /// Load the container and start the decode worker, on the system clock.
    pub fn open(source: Arc<dyn MediaSource>, config: EngineConfig) -> Result<Self, EngineError> {
        Self::open_with_clock(source, config, Arc::new(SystemClock::new()))
    }

    pub fn open_with_clock(
        source: Arc<dyn MediaSource>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let container = {
            let mut reader = source.open().map_err(ContainerError::Io)?;
            container::load(&mut reader)?
        };
        tracing::info!(
            "Opening {} with {} slots",
            source.describe(),
            config.slot_count
        );

        let shared = Arc::new(EngineShared::new(container, source, config)?);
        let worker = DecodeWorker::new(shared.clone())?
            .spawn()
            .map_err(EngineError::Worker)?;
        let playback = PlaybackClock::new(shared.clone(), clock);

        Ok(Self {
            shared,
            playback,
            worker: Some(worker),
        })
    }

    pub fn header(&self) -> &StreamHeader {
        &self.shared.header
    }

    pub fn index(&self) -> &FrameIndex {
        &self.shared.index
    }

    pub fn geometry(&self) -> &DisplayGeometry {
        self.playback.geometry()
    }

    pub fn control(&self) -> Control {
        Control {
            shared: self.shared.clone(),
        }
    }

    /// Pull source for the audio mixer thread.
    pub fn audio(&self) -> Arc<AudioStreamSource> {
        self.shared.audio.clone()
    }

    pub fn last_unique_drawn(&self) -> Option<u32> {
        self.playback.last_unique_drawn()
    }

    /// Run one display tick.
    pub fn tick(&mut self, sink: &mut dyn FrameSink) -> TickOutcome {
        self.playback.tick(sink)
    }

    pub fn stats(&self) -> EngineStats {
        let shared = &self.shared;
        let counters = &shared.counters;
        EngineStats {
            state: shared.state(),
            frame: shared.cursor.load(Ordering::Acquire),
            displayed: shared.displayed.load(Ordering::Acquire),
            total_frames: shared.index.total_count(),
            generation: shared.generation.load(Ordering::Acquire),
            queued: shared.queue.len(),
            pool: shared.pool.stats(),
            stale_jobs: counters.stale_jobs.load(Ordering::Relaxed),
            decode_failures: counters.decode_failures.load(Ordering::Relaxed),
            recoveries: counters.recoveries.load(Ordering::Relaxed),
            skipped_frames: counters.skipped_frames.load(Ordering::Relaxed),
            seeks: counters.seeks.load(Ordering::Relaxed),
            uploads: counters.uploads.load(Ordering::Relaxed),
            media_reopens: shared.io.reopen_count(),
            audio_bytes_out: shared.audio.bytes_out(),
        }
    }

    /// Stop the decode worker and wait for it. Idempotent.
    pub fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.doorbell.ring();
        if worker.join().is_err() {
            tracing::error!("Decode worker panicked");
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
