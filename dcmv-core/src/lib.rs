//! # DCMV Core
//!
//! Streaming decode and playback engine for DCMV interactive video: a
//! compressed, frame-indexed container with a run-length frame table and two
//! raw PCM audio channels.
//!
//! ```text
//! control ──► seek ──► preload queue ──► decode worker ──► frame pool
//!                                                              │
//!    audio mixer ◄── audio source ◄── media i/o          playback clock ──► sink
//! ```

// ============================================================================
// Container & Codecs
// ============================================================================
pub mod codec;
pub mod container;
pub mod timebase;

// ============================================================================
// Decode Pipeline
// ============================================================================
pub mod frame_pool;
pub mod media;
pub mod preload;
pub mod worker;

// ============================================================================
// Playback
// ============================================================================
pub mod audio;
pub mod clock;
pub mod playback;
pub mod render;
pub mod seek;

// ============================================================================
// Engine
// ============================================================================
pub mod config;
pub mod engine;
pub mod error;

#[cfg(test)]
pub(crate) mod fixtures;

pub use audio::AudioStreamSource;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use container::{AudioLayout, Compression, Container, FrameIndex, PixelFormat, StreamHeader};
pub use engine::{Control, Engine, EngineStats};
pub use error::{ConfigError, ContainerError, ControlError, DecodeError, EngineError};
pub use media::{FileSource, MediaSource, MemorySource};
pub use playback::{PlaybackState, TickOutcome};
pub use render::{DisplayGeometry, FrameSink, NullSink, Vertex};
pub use timebase::Timebase;

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
