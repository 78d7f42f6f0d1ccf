//! # DCMV Container - Header & Frame Index
//!
//! Fixed little-endian layout:
//!
//! ```text
//! 0x00  "DCMV"            magic
//! 0x04  u32               version
//! 0x08  u8                pixel format (0 = RGB565, 1 = YUV422)
//! 0x09  u16 x4            coded w/h, content w/h
//! 0x11  f32               fps
//! 0x15  u16 u16           sample rate, channels
//! 0x19  u32 x5            unique, total, frame size, max block, audio offset
//! 0x2D  u8                compression (0 = LZ4 block, 1 = zstd magicless)
//! 0x32  u32 x (unique+1)  frame offsets
//!       u16 x unique      display durations
//! ...   frame blocks
//! audio_offset..EOF       PCM, left half then right half
//! ```
//!
//! Everything here is parsed once at startup and is read-only afterwards.

use std::io::{self, Read, Seek, SeekFrom};

use serde::{Deserialize, Serialize};

use crate::error::ContainerError;
use crate::timebase::Timebase;

pub const MAGIC: &[u8; 4] = b"DCMV";
pub const HEADER_LEN: usize = 46;
/// Frame tables always start here, after a little padding past the header.
pub const TABLE_OFFSET: u64 = 50;

// ============================================================================
// Header Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb565,
    Yuv422,
}

impl PixelFormat {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Rgb565),
            1 => Some(Self::Yuv422),
            _ => None,
        }
    }

    pub fn bytes_per_pixel(&self) -> usize {
        2
    }
}

/// Block codec used for every frame in the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    /// LZ4 raw block, decoded size known up front
    Lz4,
    /// Zstandard stream in magicless frame format
    Zstd,
}

impl Compression {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Lz4),
            1 => Some(Self::Zstd),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamHeader {
    pub version: u32,
    pub pixel_format: PixelFormat,
    pub width: u16,
    pub height: u16,
    pub content_width: u16,
    pub content_height: u16,
    /// Raw rate as stored in the file
    pub fps: f32,
    /// Exact rate derived from `fps`
    pub timebase: Timebase,
    pub sample_rate: u16,
    pub channels: u16,
    pub unique_frames: u32,
    pub total_frames: u32,
    pub frame_size: u32,
    pub max_compressed_size: u32,
    pub audio_offset: u32,
    pub compression: Compression,
}

/// Where the two PCM channel blocks live in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioLayout {
    pub offset: u64,
    pub channel_bytes: u64,
    pub channels: u16,
}

impl AudioLayout {
    /// First byte of `channel` (0 = left, 1 = right).
    pub fn channel_start(&self, channel: usize) -> u64 {
        self.offset + self.channel_bytes * channel as u64
    }

    pub fn is_stereo(&self) -> bool {
        self.channels == 2
    }
}

// ============================================================================
// Frame Index
// ============================================================================

#[derive(Debug, Clone)]
pub struct FrameIndex {
    offsets: Vec<u32>,
    durations: Vec<u16>,
    total_to_unique: Vec<u32>,
    /// First total frame of each unique frame's run, plus a final end marker
    run_starts: Vec<u32>,
}

impl FrameIndex {
    /// Build the index from raw tables. `offsets` must hold one more entry
    /// than `durations`.
    pub fn new(offsets: Vec<u32>, durations: Vec<u16>, total_frames: u32) -> Result<Self, ContainerError> {
        let unique = durations.len();
        if unique == 0 || offsets.len() != unique + 1 {
            return Err(ContainerError::Malformed(format!(
                "{} offsets for {} unique frames",
                offsets.len(),
                unique
            )));
        }
        if let Some(i) = offsets.windows(2).position(|w| w[1] < w[0]) {
            return Err(ContainerError::Malformed(format!(
                "frame offset {} goes backwards ({} -> {})",
                i + 1,
                offsets[i],
                offsets[i + 1]
            )));
        }

        let covered: u64 = durations.iter().map(|&d| u64::from(d)).sum();
        if covered < u64::from(total_frames) {
            return Err(ContainerError::Malformed(format!(
                "durations cover {} of {} total frames",
                covered, total_frames
            )));
        }
        if covered > u64::from(total_frames) {
            tracing::warn!(
                "Durations cover {} frames, header declares {}; trailing frames ignored",
                covered,
                total_frames
            );
        }

        let total = total_frames as usize;
        let mut total_to_unique = Vec::with_capacity(total);
        let mut run_starts = Vec::with_capacity(unique + 1);
        for (u, &duration) in durations.iter().enumerate() {
            run_starts.push(total_to_unique.len() as u32);
            for _ in 0..duration {
                if total_to_unique.len() == total {
                    break;
                }
                total_to_unique.push(u as u32);
            }
        }
        run_starts.push(total_to_unique.len() as u32);

        Ok(Self {
            offsets,
            durations,
            total_to_unique,
            run_starts,
        })
    }

    pub fn unique_count(&self) -> u32 {
        self.durations.len() as u32
    }

    pub fn total_count(&self) -> u32 {
        self.total_to_unique.len() as u32
    }

    /// Unique frame shown at `total`. Out-of-range totals map to the last
    /// unique frame.
    pub fn unique_for(&self, total: u32) -> u32 {
        match self.total_to_unique.get(total as usize) {
            Some(&u) => u,
            None => self.unique_count() - 1,
        }
    }

    pub fn total_to_unique(&self) -> &[u32] {
        &self.total_to_unique
    }

    pub fn duration(&self, unique: u32) -> u16 {
        self.durations.get(unique as usize).copied().unwrap_or(0)
    }

    /// Byte offset and compressed size of `unique`'s block.
    pub fn block(&self, unique: u32) -> Option<(u64, usize)> {
        let u = unique as usize;
        let start = *self.offsets.get(u)?;
        let end = *self.offsets.get(u + 1)?;
        Some((u64::from(start), (end - start) as usize))
    }

    /// One past the last total frame that shows `unique`.
    pub fn run_end(&self, unique: u32) -> u32 {
        self.run_starts
            .get(unique as usize + 1)
            .copied()
            .unwrap_or_else(|| self.total_count())
    }

    /// Clamp a requested frame into `[0, total_count)`.
    pub fn clamp_frame(&self, frame: i64) -> u32 {
        frame.clamp(0, i64::from(self.total_count()) - 1) as u32
    }

    fn end_offset(&self) -> u32 {
        self.offsets.last().copied().unwrap_or(0)
    }
}

// ============================================================================
// Loading
// ============================================================================

/// Everything parsed from a container at startup.
#[derive(Debug, Clone)]
pub struct Container {
    pub header: StreamHeader,
    pub index: FrameIndex,
    pub audio: AudioLayout,
    pub file_len: u64,
}

/// Parse header, tables, and audio layout from `reader`.
pub fn load<R: Read + Seek>(reader: &mut R) -> Result<Container, ContainerError> {
    let file_len = reader.seek(SeekFrom::End(0))?;
    reader.seek(SeekFrom::Start(0))?;

    let mut raw = [0u8; HEADER_LEN];
    read_exact_at(reader, &mut raw, "header", 0)?;
    if &raw[0..4] != MAGIC {
        return Err(ContainerError::Malformed(format!(
            "bad magic {:02X?}",
            &raw[0..4]
        )));
    }

    let mut r = FieldReader::new(&raw[4..]);
    let version = r.u32();
    let pixel_byte = r.u8();
    let width = r.u16();
    let height = r.u16();
    let content_width = r.u16();
    let content_height = r.u16();
    let fps = r.f32();
    let sample_rate = r.u16();
    let channels = r.u16();
    let unique_frames = r.u32();
    let total_frames = r.u32();
    let frame_size = r.u32();
    let max_compressed_size = r.u32();
    let audio_offset = r.u32();
    let compression_byte = r.u8();

    let pixel_format = PixelFormat::from_byte(pixel_byte)
        .ok_or_else(|| ContainerError::Malformed(format!("unknown pixel format {}", pixel_byte)))?;
    let compression = Compression::from_byte(compression_byte).ok_or_else(|| {
        ContainerError::Malformed(format!("unknown compression kind {}", compression_byte))
    })?;
    let timebase = Timebase::from_fps(fps)
        .ok_or_else(|| ContainerError::Malformed(format!("invalid frame rate {}", fps)))?;
    if unique_frames == 0 || total_frames == 0 {
        return Err(ContainerError::Malformed(format!(
            "empty stream (unique={}, total={})",
            unique_frames, total_frames
        )));
    }
    if frame_size == 0 {
        return Err(ContainerError::Malformed("zero decoded frame size".into()));
    }
    if channels == 0 || channels > 2 {
        return Err(ContainerError::Malformed(format!("unsupported channel count {}", channels)));
    }

    // Table sizes come straight from the header, so check them against the
    // file before allocating anything.
    let offsets_len = (u64::from(unique_frames) + 1) * 4;
    let durations_len = u64::from(unique_frames) * 2;
    if TABLE_OFFSET + offsets_len > file_len {
        return Err(ContainerError::Truncated {
            what: "frame offset table",
            offset: TABLE_OFFSET,
        });
    }
    if TABLE_OFFSET + offsets_len + durations_len > file_len {
        return Err(ContainerError::Truncated {
            what: "frame duration table",
            offset: TABLE_OFFSET + offsets_len,
        });
    }

    reader.seek(SeekFrom::Start(TABLE_OFFSET))?;
    let mut buf = vec![0u8; offsets_len as usize];
    read_exact_at(reader, &mut buf, "frame offset table", TABLE_OFFSET)?;
    let offsets: Vec<u32> = buf
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    let mut buf = vec![0u8; durations_len as usize];
    read_exact_at(reader, &mut buf, "frame duration table", TABLE_OFFSET + offsets_len)?;
    let durations: Vec<u16> = buf
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();

    let index = FrameIndex::new(offsets, durations, total_frames)?;
    if u64::from(index.end_offset()) > file_len {
        return Err(ContainerError::Truncated {
            what: "frame data",
            offset: u64::from(index.end_offset()),
        });
    }
    if u64::from(audio_offset) > file_len {
        return Err(ContainerError::Truncated {
            what: "audio payload",
            offset: u64::from(audio_offset),
        });
    }

    let audio_bytes = file_len - u64::from(audio_offset);
    let audio = AudioLayout {
        offset: u64::from(audio_offset),
        channel_bytes: if channels == 2 { audio_bytes / 2 } else { audio_bytes },
        channels,
    };

    let header = StreamHeader {
        version,
        pixel_format,
        width,
        height,
        content_width,
        content_height,
        fps,
        timebase,
        sample_rate,
        channels,
        unique_frames,
        total_frames,
        frame_size,
        max_compressed_size,
        audio_offset,
        compression,
    };

    tracing::info!(
        "DCMV v{}: {:?} {}x{} (content {}x{}) @ {}, {}Hz {}ch, unique={} total={}, {:?}",
        header.version,
        header.pixel_format,
        header.width,
        header.height,
        header.content_width,
        header.content_height,
        header.timebase,
        header.sample_rate,
        header.channels,
        header.unique_frames,
        header.total_frames,
        header.compression,
    );

    Ok(Container {
        header,
        index,
        audio,
        file_len,
    })
}

fn read_exact_at<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    what: &'static str,
    offset: u64,
) -> Result<(), ContainerError> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => ContainerError::Truncated { what, offset },
        _ => ContainerError::Io(e),
    })
}

/// Cursor over the fixed-size header bytes.
struct FieldReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take())
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }

    fn f32(&mut self) -> f32 {
        f32::from_le_bytes(self.take())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::ContainerBuilder;
    use std::io::Cursor;

    #[test]
    fn test_total_to_unique_expansion() {
        let index = FrameIndex::new(vec![50, 60, 70], vec![3, 2], 5).unwrap();
        assert_eq!(index.total_to_unique(), &[0, 0, 0, 1, 1]);
        assert_eq!(index.unique_for(4), 1);
        assert_eq!(index.unique_for(99), 1);
        assert_eq!(index.run_end(0), 3);
        assert_eq!(index.run_end(1), 5);
    }

    #[test]
    fn test_total_to_unique_invariants() {
        let durations = vec![1u16, 4, 0, 2, 7, 1, 3];
        let total: u32 = durations.iter().map(|&d| u32::from(d)).sum();
        let offsets = (0..=durations.len() as u32).map(|i| 100 + i * 10).collect();
        let index = FrameIndex::new(offsets, durations.clone(), total).unwrap();

        let map = index.total_to_unique();
        assert_eq!(map.len(), total as usize);
        assert!(map.windows(2).all(|w| w[0] <= w[1]));
        assert!(map.iter().all(|&u| u < index.unique_count()));
        for (u, &d) in durations.iter().enumerate() {
            let shown = map.iter().filter(|&&m| m == u as u32).count();
            assert_eq!(shown, d as usize);
        }
    }

    #[test]
    fn test_short_durations_rejected() {
        let err = FrameIndex::new(vec![0, 1, 2], vec![1, 1], 5).unwrap_err();
        assert!(matches!(err, ContainerError::Malformed(_)));
    }

    #[test]
    fn test_load_round_trip() {
        let bytes = ContainerBuilder::new(2, 5)
            .durations(vec![3, 2])
            .fps(29.97)
            .build();
        let container = load(&mut Cursor::new(bytes)).unwrap();

        let h = &container.header;
        assert_eq!(h.unique_frames, 2);
        assert_eq!(h.total_frames, 5);
        assert_eq!(h.timebase, Timebase::new(30000, 1001).unwrap());
        assert_eq!(h.compression, Compression::Lz4);
        assert_eq!(container.index.total_to_unique(), &[0, 0, 0, 1, 1]);
        assert!(container.audio.is_stereo());
        assert_eq!(container.audio.offset, u64::from(h.audio_offset));
        assert_eq!(
            container.audio.offset + container.audio.channel_bytes * 2,
            container.file_len
        );

        let (off, size) = container.index.block(0).unwrap();
        assert!(off >= TABLE_OFFSET);
        assert!(size > 0);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = ContainerBuilder::new(1, 1).build();
        bytes[0] = b'X';
        let err = load(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, ContainerError::Malformed(_)), "{err}");
    }

    #[test]
    fn test_truncated_header() {
        let bytes = ContainerBuilder::new(1, 1).build();
        let err = load(&mut Cursor::new(bytes[..20].to_vec())).unwrap_err();
        assert!(matches!(err, ContainerError::Truncated { what: "header", .. }));
    }

    #[test]
    fn test_truncated_tables() {
        let bytes = ContainerBuilder::new(4, 4).build();
        // Cut inside the duration table: 50 + 5*4 offsets + 2 bytes
        let err = load(&mut Cursor::new(bytes[..72].to_vec())).unwrap_err();
        assert!(matches!(
            err,
            ContainerError::Truncated { what: "frame duration table", .. }
        ));

        let err = load(&mut Cursor::new(bytes[..60].to_vec())).unwrap_err();
        assert!(matches!(
            err,
            ContainerError::Truncated { what: "frame offset table", .. }
        ));
    }

    #[test]
    fn test_unknown_compression() {
        let mut bytes = ContainerBuilder::new(1, 1).build();
        bytes[0x2D] = 7;
        let err = load(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, ContainerError::Malformed(_)));
    }

    #[test]
    fn test_mono_layout() {
        let bytes = ContainerBuilder::new(1, 1).channels(1).audio_bytes(96).build();
        let container = load(&mut Cursor::new(bytes)).unwrap();
        assert!(!container.audio.is_stereo());
        assert_eq!(container.audio.channel_bytes, 96);
    }

    #[test]
    fn test_clamp_frame() {
        let index = FrameIndex::new(vec![0, 1, 2], vec![3, 2], 5).unwrap();
        assert_eq!(index.clamp_frame(-3), 0);
        assert_eq!(index.clamp_frame(2), 2);
        assert_eq!(index.clamp_frame(5), 4);
        assert_eq!(index.clamp_frame(i64::MAX), 4);
    }
}
