//! # Display Geometry & Frame Sink
//!
//! The engine does not talk to a GPU. It hands READY frames to a
//! [`FrameSink`] and describes where they go with [`DisplayGeometry`]:
//! a power-of-two texture, UV extents of the visible content inside it, and
//! a screen quad.

use serde::Serialize;

use crate::container::{PixelFormat, StreamHeader};
use crate::frame_pool::FrameRef;

// ============================================================================
// Vertex
// ============================================================================

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    pub position: [f32; 2],
    pub tex_coords: [f32; 2],
}

/// Two triangles over the quad returned by [`DisplayGeometry::quad`].
pub const QUAD_INDICES: &[u16] = &[0, 1, 2, 2, 1, 3];

// ============================================================================
// Geometry
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DisplayGeometry {
    pub pixel_format: PixelFormat,
    pub frame_width: u32,
    pub frame_height: u32,
    pub content_width: u32,
    pub content_height: u32,
    pub texture_width: u32,
    pub texture_height: u32,
    /// Frame rows are not a power of two wide and need a stride
    pub strided: bool,
    pub u_max: f32,
    pub v_max: f32,
}

impl DisplayGeometry {
    pub fn for_header(header: &StreamHeader) -> Self {
        let frame_width = u32::from(header.width);
        let frame_height = u32::from(header.height);
        let texture_width = frame_width.max(1).next_power_of_two();
        let texture_height = frame_height.max(1).next_power_of_two();
        Self {
            pixel_format: header.pixel_format,
            frame_width,
            frame_height,
            content_width: u32::from(header.content_width),
            content_height: u32::from(header.content_height),
            texture_width,
            texture_height,
            strided: !frame_width.is_power_of_two() || !frame_height.is_power_of_two(),
            u_max: f32::from(header.content_width) / texture_width as f32,
            v_max: f32::from(header.content_height) / texture_height as f32,
        }
    }

    /// Screen quad covering `(0, 0)..(width, height)`, strip order:
    /// top-left, top-right, bottom-left, bottom-right.
    pub fn quad(&self, width: f32, height: f32) -> [Vertex; 4] {
        [
            Vertex { position: [0.0, 0.0], tex_coords: [0.0, 0.0] },
            Vertex { position: [width, 0.0], tex_coords: [self.u_max, 0.0] },
            Vertex { position: [0.0, height], tex_coords: [0.0, self.v_max] },
            Vertex { position: [width, height], tex_coords: [self.u_max, self.v_max] },
        ]
    }

    /// Bytes of one texture the size of the power-of-two surface.
    pub fn texture_bytes(&self) -> usize {
        self.texture_width as usize * self.texture_height as usize * self.pixel_format.bytes_per_pixel()
    }
}

/// Vertex data as raw bytes for upload.
pub fn vertex_bytes(vertices: &[Vertex]) -> &[u8] {
    bytemuck::cast_slice(vertices)
}

// ============================================================================
// Sink
// ============================================================================

/// Consumer of decoded frames, normally the renderer.
pub trait FrameSink {
    /// Copy a newly shown unique frame into the display texture.
    fn upload(&mut self, frame: &FrameRef<'_>);

    /// Submit the quad for this tick, whether or not a new frame was uploaded.
    fn draw(&mut self, geometry: &DisplayGeometry);
}

/// Sink that only counts, for headless runs.
#[derive(Debug, Default, Clone, Serialize)]
pub struct NullSink {
    pub uploads: u64,
    pub draws: u64,
    pub last_unique: Option<u32>,
}

impl FrameSink for NullSink {
    fn upload(&mut self, frame: &FrameRef<'_>) {
        self.uploads += 1;
        self.last_unique = Some(frame.unique);
    }

    fn draw(&mut self, _geometry: &DisplayGeometry) {
        self.draws += 1;
    }
}
