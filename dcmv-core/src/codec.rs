//! # Frame Block Codecs
//!
//! Every frame is an independent intra block, so a decoder carries no state
//! between frames beyond reusable scratch contexts.
//!
//! - LZ4: raw block, decoded size is the fixed frame size
//! - Zstandard: magicless frame decoded as a stream into the slot

use zstd::stream::raw::{Decoder as ZstdDecoder, InBuffer, Operation, OutBuffer};
use zstd::zstd_safe::{DParameter, FrameFormat};

use crate::container::Compression;
use crate::error::DecodeError;

/// Decoder trait - one implementation per container compression kind
pub trait FrameDecoder: Send {
    /// Compression kind this decoder handles
    fn compression(&self) -> Compression;

    /// Decompress `block` into `out`, which must be filled exactly.
    fn decode_into(&mut self, block: &[u8], out: &mut [u8]) -> Result<(), DecodeError>;

    /// Decoder name for logs
    fn name(&self) -> &str;
}

/// Create the decoder for a container's declared compression.
pub fn create_decoder(compression: Compression) -> Result<Box<dyn FrameDecoder>, DecodeError> {
    match compression {
        Compression::Lz4 => Ok(Box::new(Lz4BlockDecoder)),
        Compression::Zstd => Ok(Box::new(ZstdStreamDecoder::new()?)),
    }
}

// ============================================================================
// LZ4
// ============================================================================

pub struct Lz4BlockDecoder;

impl FrameDecoder for Lz4BlockDecoder {
    fn compression(&self) -> Compression {
        Compression::Lz4
    }

    fn decode_into(&mut self, block: &[u8], out: &mut [u8]) -> Result<(), DecodeError> {
        let got = lz4_flex::block::decompress_into(block, out)?;
        if got != out.len() {
            return Err(DecodeError::SizeMismatch {
                got,
                expected: out.len(),
            });
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "lz4-block"
    }
}

// ============================================================================
// Zstandard
// ============================================================================

pub struct ZstdStreamDecoder {
    ctx: ZstdDecoder<'static>,
}

impl ZstdStreamDecoder {
    pub fn new() -> Result<Self, DecodeError> {
        let mut ctx = ZstdDecoder::new()?;
        ctx.set_parameter(DParameter::Format(FrameFormat::Magicless))?;
        Ok(Self { ctx })
    }
}

impl FrameDecoder for ZstdStreamDecoder {
    fn compression(&self) -> Compression {
        Compression::Zstd
    }

    fn decode_into(&mut self, block: &[u8], out: &mut [u8]) -> Result<(), DecodeError> {
        let expected = out.len();
        self.ctx.reinit()?;

        let mut input = InBuffer::around(block);
        let mut output = OutBuffer::around(out);
        loop {
            let (in_before, out_before) = (input.pos(), output.pos());
            let hint = self
                .ctx
                .run(&mut input, &mut output)
                .map_err(|e| DecodeError::Zstd(e.to_string()))?;

            if hint == 0 || output.pos() == expected {
                break;
            }
            // Truncated input: the frame wants more bytes than the block has.
            if input.pos() == in_before && output.pos() == out_before {
                break;
            }
        }

        let got = output.pos();
        if got != expected {
            return Err(DecodeError::SizeMismatch { got, expected });
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "zstd-magicless"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::frame_pattern;

    #[test]
    fn test_lz4_decode() {
        let raw = frame_pattern(3, 256);
        let block = lz4_flex::block::compress(&raw);
        let mut out = vec![0u8; 256];
        let mut dec = create_decoder(Compression::Lz4).unwrap();
        dec.decode_into(&block, &mut out).unwrap();
        assert_eq!(out, raw);
        assert_eq!(dec.compression(), Compression::Lz4);
    }

    #[test]
    fn test_lz4_size_mismatch() {
        let block = lz4_flex::block::compress(&frame_pattern(1, 64));
        let mut out = vec![0u8; 128];
        let err = Lz4BlockDecoder.decode_into(&block, &mut out).unwrap_err();
        assert!(matches!(err, DecodeError::SizeMismatch { got: 64, expected: 128 }));
    }

    #[test]
    fn test_lz4_garbage() {
        let mut out = vec![0u8; 64];
        assert!(Lz4BlockDecoder
            .decode_into(&[0xF0, 0xFF, 0xFF, 0x00, 0x13], &mut out)
            .is_err());
    }

    #[test]
    fn test_zstd_magicless_decode_reuses_context() {
        let mut dec = create_decoder(Compression::Zstd).unwrap();
        for unique in 0..3 {
            let raw = frame_pattern(unique, 512);
            let framed = zstd::bulk::compress(&raw, 3).unwrap();
            let mut out = vec![0u8; 512];
            dec.decode_into(&framed[4..], &mut out).unwrap();
            assert_eq!(out, raw);
        }
    }

    #[test]
    fn test_zstd_truncated_block() {
        let raw = frame_pattern(9, 4096);
        let framed = zstd::bulk::compress(&raw, 3).unwrap();
        let cut = &framed[4..framed.len() / 2];
        let mut out = vec![0u8; 4096];
        let mut dec = ZstdStreamDecoder::new().unwrap();
        assert!(dec.decode_into(cut, &mut out).is_err());

        // A failed frame must not poison the next one.
        let framed = zstd::bulk::compress(&frame_pattern(2, 4096), 3).unwrap();
        dec.decode_into(&framed[4..], &mut out).unwrap();
        assert_eq!(out, frame_pattern(2, 4096));
    }
}
