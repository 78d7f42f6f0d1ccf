//! # Audio Stream Source
//!
//! Pull-based reader over the channel-split PCM payload. The mixer calls
//! [`AudioStreamSource::fill`] from its own thread; the decode worker keeps a
//! small per-channel prefetch topped up through [`AudioPump::poll`] so most
//! callbacks never touch the device.
//!
//! Samples are handed out exactly as stored (ADPCM by default). Volume is
//! reported to the mixer, which applies it after decoding.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::container::{AudioLayout, StreamHeader};
use crate::error::ControlError;
use crate::media::MediaIo;
use crate::worker::AudioPump;

/// Bytes kept ready per channel.
const PREFETCH_BYTES: usize = 4096;

/// Byte position inside each channel that lines up with total frame `frame`.
///
/// `round(frame * rate / fps)` samples, converted to stored bytes, rounded up
/// to `alignment` and clamped to the channel length.
pub fn seek_offset(
    frame: u32,
    header: &StreamHeader,
    layout: &AudioLayout,
    bits_per_sample: u32,
    alignment: u64,
) -> u64 {
    let samples = header
        .timebase
        .samples_at(u64::from(frame), u32::from(header.sample_rate));
    let bytes = samples * u64::from(bits_per_sample) / 8;
    let aligned = match alignment {
        0 | 1 => bytes,
        a => (bytes + a - 1) & !(a - 1),
    };
    aligned.min(layout.channel_bytes)
}

pub struct AudioStreamSource {
    io: Arc<MediaIo>,
    stereo: bool,
    muted: AtomicBool,
    enabled: [AtomicBool; 2],
    /// 0..=255, 255 = full
    volume: AtomicU8,
    prefetch: Mutex<[VecDeque<u8>; 2]>,
    bytes_out: AtomicU64,
}

impl AudioStreamSource {
    pub fn new(io: Arc<MediaIo>, layout: &AudioLayout) -> Self {
        Self {
            io,
            stereo: layout.is_stereo(),
            muted: AtomicBool::new(false),
            enabled: [AtomicBool::new(true), AtomicBool::new(true)],
            volume: AtomicU8::new(255),
            prefetch: Mutex::new([
                VecDeque::with_capacity(PREFETCH_BYTES),
                VecDeque::with_capacity(PREFETCH_BYTES),
            ]),
            bytes_out: AtomicU64::new(0),
        }
    }

    pub fn is_stereo(&self) -> bool {
        self.stereo
    }

    // ========================================================================
    // Mixer callback
    // ========================================================================

    /// Fill both channel buffers. Returns the number of channel bytes
    /// produced; less than requested means the payload ran out and the tail
    /// of each buffer is silence.
    pub fn fill(&self, left: &mut [u8], right: &mut [u8]) -> usize {
        if self.is_muted() {
            left.fill(0);
            right.fill(0);
            return left.len() + if self.stereo { right.len() } else { 0 };
        }

        let mut prefetch = self.prefetch.lock();
        let mut produced = self.fill_channel(&mut prefetch[0], 0, left);
        if self.stereo {
            produced += self.fill_channel(&mut prefetch[1], 1, right);
        } else {
            right.fill(0);
        }
        self.bytes_out.fetch_add(produced as u64, Ordering::Relaxed);
        produced
    }

    fn fill_channel(&self, cached: &mut VecDeque<u8>, channel: usize, out: &mut [u8]) -> usize {
        let enabled = self.enabled[channel].load(Ordering::Acquire);
        let from_cache = out.len().min(cached.len());

        if enabled {
            for (dst, src) in out.iter_mut().zip(cached.drain(..from_cache)) {
                *dst = src;
            }
            let rest = &mut out[from_cache..];
            let read = match self.io.read_audio(channel, rest) {
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!("Audio channel {} read failed: {}", channel + 1, e);
                    0
                }
            };
            rest[read..].fill(0);
            from_cache + read
        } else {
            // Disabled channels play silence but keep their place in the stream.
            cached.drain(..from_cache);
            let skipped = match self.io.skip_audio(channel, (out.len() - from_cache) as u64) {
                Ok(n) => n as usize,
                Err(e) => {
                    tracing::warn!("Audio channel {} skip failed: {}", channel + 1, e);
                    0
                }
            };
            out.fill(0);
            from_cache + skipped
        }
    }

    // ========================================================================
    // Control
    // ========================================================================

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    /// Enable or disable channel 1 (left) or 2 (right).
    pub fn set_channel_enabled(&self, channel: u8, on: bool) -> Result<(), ControlError> {
        let idx = channel_index(channel)?;
        self.enabled[idx].store(on, Ordering::Release);
        tracing::debug!("Audio channel {} {}", channel, if on { "on" } else { "off" });
        Ok(())
    }

    pub fn channel_enabled(&self, channel: u8) -> Result<bool, ControlError> {
        Ok(self.enabled[channel_index(channel)?].load(Ordering::Acquire))
    }

    pub fn volume(&self) -> u8 {
        self.volume.load(Ordering::Relaxed)
    }

    pub fn set_volume(&self, volume: u8) {
        self.volume.store(volume, Ordering::Relaxed);
    }

    /// Drop prefetched bytes after the channel handles were repositioned.
    pub fn flush(&self) {
        let mut prefetch = self.prefetch.lock();
        prefetch[0].clear();
        prefetch[1].clear();
    }

    /// Bytes of `channel` handed to the mixer or skipped so far.
    pub fn position(&self, channel: usize) -> u64 {
        let prefetch = self.prefetch.lock();
        let queued = prefetch.get(channel).map_or(0, VecDeque::len) as u64;
        self.io.audio_position(channel).saturating_sub(queued)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }
}

impl AudioPump for AudioStreamSource {
    fn poll(&self) {
        if self.is_muted() {
            return;
        }
        let channels = if self.stereo { 2 } else { 1 };
        let mut prefetch = self.prefetch.lock();
        let mut buf = [0u8; PREFETCH_BYTES];
        for (ch, cached) in prefetch.iter_mut().enumerate().take(channels) {
            if !self.enabled[ch].load(Ordering::Acquire) || cached.len() >= PREFETCH_BYTES / 2 {
                continue;
            }
            let want = PREFETCH_BYTES - cached.len();
            match self.io.read_audio(ch, &mut buf[..want]) {
                Ok(n) => cached.extend(&buf[..n]),
                Err(e) => tracing::warn!("Audio prefetch on channel {} failed: {}", ch + 1, e),
            }
        }
    }
}

fn channel_index(channel: u8) -> Result<usize, ControlError> {
    match channel {
        1 => Ok(0),
        2 => Ok(1),
        other => Err(ControlError::InvalidChannel(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container;
    use crate::fixtures::{audio_byte, ContainerBuilder};
    use crate::media::MemorySource;
    use std::io::Cursor;

    fn source(builder: ContainerBuilder) -> (container::Container, AudioStreamSource) {
        let bytes = builder.build();
        let container = container::load(&mut Cursor::new(bytes.clone())).unwrap();
        let io = MediaIo::open(Arc::new(MemorySource::new(bytes)), container.audio).unwrap();
        let audio = AudioStreamSource::new(Arc::new(io), &container.audio);
        (container, audio)
    }

    #[test]
    fn test_seek_offset_ntsc() {
        let (container, _) = source(
            ContainerBuilder::new(1, 300)
                .fps(29.97)
                .sample_rate(22050)
                .audio_bytes(1 << 20),
        );
        // round(150 * 22050 * 1001 / 30000) = 110360 samples, 4-bit -> 55180 bytes
        let expected = (55180u64 + 15) / 16 * 16;
        let got = seek_offset(150, &container.header, &container.audio, 4, 16);
        assert_eq!(got, expected);
        assert_eq!(got % 16, 0);
    }

    #[test]
    fn test_seek_offset_clamps_to_channel() {
        let (container, _) = source(ContainerBuilder::new(1, 3000).audio_bytes(1000));
        let got = seek_offset(2999, &container.header, &container.audio, 4, 16);
        assert_eq!(got, 1000);
        assert_eq!(seek_offset(0, &container.header, &container.audio, 4, 16), 0);
    }

    #[test]
    fn test_fill_splits_channels() {
        let (_, audio) = source(ContainerBuilder::new(1, 1).audio_bytes(64));
        let mut left = [0u8; 16];
        let mut right = [0u8; 16];
        assert_eq!(audio.fill(&mut left, &mut right), 32);
        for i in 0..16 {
            assert_eq!(left[i], audio_byte(0, i as u64));
            assert_eq!(right[i], audio_byte(1, i as u64));
        }
        assert_eq!(audio.position(0), 16);
    }

    #[test]
    fn test_prefetch_is_transparent() {
        let (_, audio) = source(ContainerBuilder::new(1, 1).audio_bytes(10_000));
        let mut left = [0u8; 100];
        let mut right = [0u8; 100];
        audio.fill(&mut left, &mut right);
        audio.poll();
        audio.fill(&mut left, &mut right);
        assert_eq!(left[0], audio_byte(0, 100));
        assert_eq!(right[99], audio_byte(1, 199));
        assert_eq!(audio.position(1), 200);
    }

    #[test]
    fn test_muted_emits_silence_without_advancing() {
        let (_, audio) = source(ContainerBuilder::new(1, 1).audio_bytes(64));
        audio.set_muted(true);
        let mut left = [9u8; 8];
        let mut right = [9u8; 8];
        assert_eq!(audio.fill(&mut left, &mut right), 16);
        assert!(left.iter().chain(right.iter()).all(|&b| b == 0));
        assert_eq!(audio.position(0), 0);

        // Muted pumps do nothing either.
        audio.poll();
        audio.set_muted(false);
        assert_eq!(audio.position(0), 0);
    }

    #[test]
    fn test_disabled_channel_keeps_position() {
        let (_, audio) = source(ContainerBuilder::new(1, 1).audio_bytes(10_000));
        audio.poll();
        audio.set_channel_enabled(2, false).unwrap();
        assert!(!audio.channel_enabled(2).unwrap());

        let mut left = [0u8; 50];
        let mut right = [7u8; 50];
        audio.fill(&mut left, &mut right);
        assert!(right.iter().all(|&b| b == 0));
        assert_eq!(audio.position(1), 50);

        audio.set_channel_enabled(2, true).unwrap();
        audio.fill(&mut left, &mut right);
        assert_eq!(right[0], audio_byte(1, 50));
        assert_eq!(left[0], audio_byte(0, 50));
    }

    #[test]
    fn test_invalid_channel() {
        let (_, audio) = source(ContainerBuilder::new(1, 1));
        assert_eq!(
            audio.set_channel_enabled(3, true),
            Err(ControlError::InvalidChannel(3))
        );
        assert_eq!(audio.channel_enabled(0), Err(ControlError::InvalidChannel(0)));
    }

    #[test]
    fn test_end_of_payload_pads_silence() {
        let (_, audio) = source(ContainerBuilder::new(1, 1).channels(1).audio_bytes(10));
        let mut left = [5u8; 16];
        let mut right = [5u8; 16];
        assert_eq!(audio.fill(&mut left, &mut right), 10);
        assert_eq!(left[9], audio_byte(0, 9));
        assert!(left[10..].iter().all(|&b| b == 0));
        assert!(right.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_volume() {
        let (_, audio) = source(ContainerBuilder::new(1, 1));
        assert_eq!(audio.volume(), 255);
        audio.set_volume(40);
        assert_eq!(audio.volume(), 40);
    }
}
