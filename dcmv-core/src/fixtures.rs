//! Synthetic DCMV containers and engine rigs for tests.

use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::config::EngineConfig;
use crate::container::{self, HEADER_LEN, MAGIC, TABLE_OFFSET};
use crate::engine::EngineShared;
use crate::frame_pool::FrameRef;
use crate::media::{MediaSource, MemorySource, ReadSeek};
use crate::render::{DisplayGeometry, FrameSink};

pub(crate) const WIDTH: u16 = 8;
pub(crate) const HEIGHT: u16 = 4;

/// Deterministic decoded content for `unique`.
pub(crate) fn frame_pattern(unique: u32, size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (unique as usize * 31 + i * 7) as u8)
        .collect()
}

/// PCM byte at `pos` of `channel`.
pub(crate) fn audio_byte(channel: usize, pos: u64) -> u8 {
    let b = (pos % 251) as u8;
    if channel == 0 {
        b
    } else {
        b ^ 0xFF
    }
}

pub(crate) struct ContainerBuilder {
    unique: u32,
    total: u32,
    durations: Option<Vec<u16>>,
    fps: f32,
    sample_rate: u16,
    channels: u16,
    audio_bytes: u64,
    zstd: bool,
    corrupt: Vec<u32>,
    blank: Vec<u32>,
}

impl ContainerBuilder {
    pub(crate) fn new(unique: u32, total: u32) -> Self {
        Self {
            unique,
            total,
            durations: None,
            fps: 30.0,
            sample_rate: 22050,
            channels: 2,
            audio_bytes: 4096,
            zstd: false,
            corrupt: Vec::new(),
            blank: Vec::new(),
        }
    }

    pub(crate) fn durations(mut self, durations: Vec<u16>) -> Self {
        self.durations = Some(durations);
        self
    }

    pub(crate) fn fps(mut self, fps: f32) -> Self {
        self.fps = fps;
        self
    }

    pub(crate) fn sample_rate(mut self, rate: u16) -> Self {
        self.sample_rate = rate;
        self
    }

    pub(crate) fn channels(mut self, channels: u16) -> Self {
        self.channels = channels;
        self
    }

    /// Bytes per channel.
    pub(crate) fn audio_bytes(mut self, bytes: u64) -> Self {
        self.audio_bytes = bytes;
        self
    }

    pub(crate) fn zstd(mut self) -> Self {
        self.zstd = true;
        self
    }

    /// Store garbage instead of a valid block for `unique`.
    pub(crate) fn corrupt(mut self, unique: u32) -> Self {
        self.corrupt.push(unique);
        self
    }

    /// Store an empty block for `unique`.
    pub(crate) fn blank(mut self, unique: u32) -> Self {
        self.blank.push(unique);
        self
    }

    pub(crate) fn frame_size() -> usize {
        WIDTH as usize * HEIGHT as usize * 2
    }

    fn resolved_durations(&self) -> Vec<u16> {
        if let Some(d) = &self.durations {
            return d.clone();
        }
        let base = self.total / self.unique;
        let mut d = vec![base as u16; self.unique as usize];
        if let Some(last) = d.last_mut() {
            *last += (self.total - base * self.unique) as u16;
        }
        d
    }

    fn block(&self, unique: u32) -> Vec<u8> {
        if self.blank.contains(&unique) {
            return Vec::new();
        }
        if self.corrupt.contains(&unique) {
            return vec![0xF0, 0xFF, 0xFF, 0x00, 0x13];
        }
        let raw = frame_pattern(unique, Self::frame_size());
        if self.zstd {
            let framed = zstd::bulk::compress(&raw, 3).expect("zstd compress");
            // Magicless frames are regular frames without the 4-byte magic.
            framed[4..].to_vec()
        } else {
            lz4_flex::block::compress(&raw)
        }
    }

    pub(crate) fn build(&self) -> Vec<u8> {
        let durations = self.resolved_durations();
        let blocks: Vec<Vec<u8>> = (0..self.unique).map(|u| self.block(u)).collect();
        let max_block = blocks.iter().map(Vec::len).max().unwrap_or(0) as u32;

        let tables_len = (self.unique as u64 + 1) * 4 + self.unique as u64 * 2;
        let mut offsets = Vec::with_capacity(blocks.len() + 1);
        let mut pos = TABLE_OFFSET + tables_len;
        for block in &blocks {
            offsets.push(pos as u32);
            pos += block.len() as u64;
        }
        offsets.push(pos as u32);
        let audio_offset = pos as u32;

        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&1u32.to_le_bytes());
        out.push(0);
        out.extend_from_slice(&WIDTH.to_le_bytes());
        out.extend_from_slice(&HEIGHT.to_le_bytes());
        out.extend_from_slice(&(WIDTH - 2).to_le_bytes());
        out.extend_from_slice(&(HEIGHT - 1).to_le_bytes());
        out.extend_from_slice(&self.fps.to_le_bytes());
        out.extend_from_slice(&self.sample_rate.to_le_bytes());
        out.extend_from_slice(&self.channels.to_le_bytes());
        out.extend_from_slice(&self.unique.to_le_bytes());
        out.extend_from_slice(&self.total.to_le_bytes());
        out.extend_from_slice(&(Self::frame_size() as u32).to_le_bytes());
        out.extend_from_slice(&max_block.to_le_bytes());
        out.extend_from_slice(&audio_offset.to_le_bytes());
        out.push(u8::from(self.zstd));
        assert_eq!(out.len(), HEADER_LEN);
        out.resize(TABLE_OFFSET as usize, 0);

        for off in &offsets {
            out.extend_from_slice(&off.to_le_bytes());
        }
        for d in &durations {
            out.extend_from_slice(&d.to_le_bytes());
        }
        for block in &blocks {
            out.extend_from_slice(block);
        }
        for channel in 0..self.channels as usize {
            out.extend((0..self.audio_bytes).map(|i| audio_byte(channel, i)));
        }
        out
    }
}

// ============================================================================
// Engine Rigs
// ============================================================================

/// Small windows and no reopen delay, so tests run fast.
pub(crate) fn test_config() -> EngineConfig {
    EngineConfig {
        slot_count: 8,
        preload_ahead: 4,
        seek_reseed: 4,
        recovery_reseed: 4,
        starvation_idle_passes: 50,
        worker_poll_ms: 1,
        paused_poll_ms: 1,
        reopen_delay_ms: 0,
        seek_settle_ms: 50,
        max_decode_retries: 3,
        ..EngineConfig::default()
    }
}

/// Shared engine state over an in-memory container, with no threads running.
pub(crate) fn test_shared(bytes: Vec<u8>, config: EngineConfig) -> Arc<EngineShared> {
    shared_with_source(Arc::new(MemorySource::new(bytes)), config)
}

pub(crate) fn shared_with_source(
    source: Arc<dyn MediaSource>,
    config: EngineConfig,
) -> Arc<EngineShared> {
    let mut reader = source.open().expect("open source");
    let container = container::load(&mut reader).expect("load container");
    Arc::new(EngineShared::new(container, source, config).expect("engine state"))
}

/// Source whose block for one unique frame reads back as garbage for the
/// first `failures` reads.
pub(crate) struct FlakySource {
    data: Bytes,
    bad_offset: u64,
    failures_left: Arc<AtomicU32>,
}

impl FlakySource {
    pub(crate) fn new(builder: &ContainerBuilder, unique: u32, failures: u32) -> Self {
        let bytes = builder.build();
        let container = container::load(&mut Cursor::new(bytes.as_slice())).expect("load container");
        let (bad_offset, _) = container.index.block(unique).expect("block for unique");
        Self {
            data: Bytes::from(bytes),
            bad_offset,
            failures_left: Arc::new(AtomicU32::new(failures)),
        }
    }
}

impl MediaSource for FlakySource {
    fn open(&self) -> io::Result<Box<dyn ReadSeek>> {
        Ok(Box::new(FlakyReader {
            inner: Cursor::new(self.data.clone()),
            bad_offset: self.bad_offset,
            failures_left: self.failures_left.clone(),
        }))
    }

    fn describe(&self) -> String {
        "<flaky>".to_string()
    }
}

struct FlakyReader {
    inner: Cursor<Bytes>,
    bad_offset: u64,
    failures_left: Arc<AtomicU32>,
}

impl Read for FlakyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let start = self.inner.position();
        let n = self.inner.read(buf)?;
        let hit = start == self.bad_offset
            && self
                .failures_left
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(1))
                .is_ok();
        if hit {
            buf[..n].fill(0xFF);
        }
        Ok(n)
    }
}

impl Seek for FlakyReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

/// Sink that records which unique frames were uploaded.
#[derive(Default)]
pub(crate) struct RecordingSink {
    pub uploads: Vec<u32>,
    pub draws: usize,
    pub last_data: Vec<u8>,
}

impl FrameSink for RecordingSink {
    fn upload(&mut self, frame: &FrameRef<'_>) {
        self.uploads.push(frame.unique);
        self.last_data = frame.data().to_vec();
    }

    fn draw(&mut self, _geometry: &DisplayGeometry) {
        self.draws += 1;
    }
}
