//! # Media I/O
//!
//! One video handle plus one handle per audio channel, all opened from the
//! same [`MediaSource`] and all behind a single lock. The decode worker reads
//! frame blocks and the audio callback reads PCM through the same [`MediaIo`],
//! so a block read and a channel read never interleave on the device.

use std::fs::File;
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::container::AudioLayout;

pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

/// Something that can hand out independent readers over the container bytes.
pub trait MediaSource: Send + Sync {
    fn open(&self) -> io::Result<Box<dyn ReadSeek>>;

    /// Human-readable origin for logs
    fn describe(&self) -> String;
}

// ============================================================================
// Sources
// ============================================================================

pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MediaSource for FileSource {
    fn open(&self) -> io::Result<Box<dyn ReadSeek>> {
        let file = File::open(&self.path)?;
        Ok(Box::new(BufReader::with_capacity(64 * 1024, file)))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Container held entirely in memory.
pub struct MemorySource {
    data: Bytes,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

impl MediaSource for MemorySource {
    fn open(&self) -> io::Result<Box<dyn ReadSeek>> {
        Ok(Box::new(Cursor::new(self.data.clone())))
    }

    fn describe(&self) -> String {
        format!("<memory, {} bytes>", self.data.len())
    }
}

// ============================================================================
// Handles
// ============================================================================

struct ChannelReader {
    reader: Box<dyn ReadSeek>,
    /// Absolute file offset of the channel's first byte
    start: u64,
    len: u64,
    /// Bytes consumed from the channel
    pos: u64,
}

impl ChannelReader {
    fn remaining(&self) -> u64 {
        self.len.saturating_sub(self.pos)
    }
}

struct Handles {
    video: Box<dyn ReadSeek>,
    /// Where the video handle currently sits, to skip redundant seeks
    video_pos: Option<u64>,
    channels: Vec<ChannelReader>,
}

pub struct MediaIo {
    source: Arc<dyn MediaSource>,
    layout: AudioLayout,
    handles: Mutex<Handles>,
    reopens: AtomicU64,
}

impl MediaIo {
    /// Open the video handle and every audio channel, audio at its start.
    pub fn open(source: Arc<dyn MediaSource>, layout: AudioLayout) -> io::Result<Self> {
        let handles = Self::open_handles(source.as_ref(), &layout, 0, 0)?;
        tracing::debug!(
            "Opened media handles on {} ({} audio channels)",
            source.describe(),
            handles.channels.len()
        );
        Ok(Self {
            source,
            layout,
            handles: Mutex::new(handles),
            reopens: AtomicU64::new(0),
        })
    }

    fn open_handles(
        source: &dyn MediaSource,
        layout: &AudioLayout,
        video_offset: u64,
        audio_pos: u64,
    ) -> io::Result<Handles> {
        let mut video = source.open()?;
        video.seek(SeekFrom::Start(video_offset))?;

        let mut channels = Vec::with_capacity(layout.channels as usize);
        for ch in 0..layout.channels as usize {
            let start = layout.channel_start(ch);
            let pos = audio_pos.min(layout.channel_bytes);
            let mut reader = source.open()?;
            reader.seek(SeekFrom::Start(start + pos))?;
            channels.push(ChannelReader {
                reader,
                start,
                len: layout.channel_bytes,
                pos,
            });
        }

        Ok(Handles {
            video,
            video_pos: Some(video_offset),
            channels,
        })
    }

    pub fn source(&self) -> &dyn MediaSource {
        self.source.as_ref()
    }

    /// Read exactly `buf.len()` bytes of frame data at `offset`.
    pub fn read_block(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut handles = self.handles.lock();
        if handles.video_pos != Some(offset) {
            handles.video.seek(SeekFrom::Start(offset))?;
        }
        // Unknown position until the read completes.
        handles.video_pos = None;
        handles.video.read_exact(buf)?;
        handles.video_pos = Some(offset + buf.len() as u64);
        Ok(())
    }

    /// Read up to `buf.len()` bytes of `channel`, stopping at the channel end.
    pub fn read_audio(&self, channel: usize, buf: &mut [u8]) -> io::Result<usize> {
        let mut handles = self.handles.lock();
        let Some(ch) = handles.channels.get_mut(channel) else {
            return Ok(0);
        };
        let want = (buf.len() as u64).min(ch.remaining()) as usize;
        let mut filled = 0;
        while filled < want {
            match ch.reader.read(&mut buf[filled..want]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    ch.pos += filled as u64;
                    return Err(e);
                }
            }
        }
        ch.pos += filled as u64;
        Ok(filled)
    }

    /// Move `channel` forward by up to `n` bytes without reading them.
    pub fn skip_audio(&self, channel: usize, n: u64) -> io::Result<u64> {
        let mut handles = self.handles.lock();
        let Some(ch) = handles.channels.get_mut(channel) else {
            return Ok(0);
        };
        let step = n.min(ch.remaining());
        if step > 0 {
            ch.reader.seek(SeekFrom::Start(ch.start + ch.pos + step))?;
            ch.pos += step;
        }
        Ok(step)
    }

    /// Bytes consumed from `channel` so far.
    pub fn audio_position(&self, channel: usize) -> u64 {
        self.handles
            .lock()
            .channels
            .get(channel)
            .map_or(0, |ch| ch.pos)
    }

    /// Close every handle and open fresh ones positioned at `video_offset`
    /// and `audio_pos` bytes into each channel. On failure the old handles
    /// stay in place.
    pub fn reopen(&self, video_offset: u64, audio_pos: u64) -> io::Result<()> {
        let fresh = Self::open_handles(self.source.as_ref(), &self.layout, video_offset, audio_pos)?;
        *self.handles.lock() = fresh;
        self.reopens.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "Reopened media at video offset {} / audio byte {}",
            video_offset,
            audio_pos
        );
        Ok(())
    }

    pub fn reopen_count(&self) -> u64 {
        self.reopens.load(Ordering::Relaxed)
    }
}
