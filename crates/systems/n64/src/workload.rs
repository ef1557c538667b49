//! Workloads: one emitted frame of RDP work
//!
//! The interpreter fills the current [`Workload`] while it processes display
//! lists. Draw calls are grouped into [`FramebufferPair`]s, one per span of
//! draws sharing the same color and depth images. Transforms, tiles and the
//! draw calls themselves are flattened into [`DrawData`] and referenced by
//! index.

use crate::fb_ops::FramebufferOperation;
use crate::framebuffer::FramebufferChange;
use crate::tile::{LoadTile, TileCopy};
use hle_core::graphics::PixelSize;
use hle_core::types::FixedRect;
use serde::{Deserialize, Serialize};

/// Row-major 4x4 matrix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Matrix4 {
    pub m: [[f32; 4]; 4],
}

impl Matrix4 {
    pub const IDENTITY: Matrix4 = Matrix4 {
        m: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ],
    };

    pub fn identity() -> Self {
        Self::IDENTITY
    }

    pub fn translation(x: f32, y: f32, z: f32) -> Self {
        let mut m = Self::IDENTITY;
        m.m[3][0] = x;
        m.m[3][1] = y;
        m.m[3][2] = z;
        m
    }

    pub fn scale(x: f32, y: f32, z: f32) -> Self {
        let mut m = Self::IDENTITY;
        m.m[0][0] = x;
        m.m[1][1] = y;
        m.m[2][2] = z;
        m
    }

    /// Component-wise blend: `a * (1 - t) + b * t`.
    pub fn lerp(a: &Matrix4, b: &Matrix4, t: f32) -> Matrix4 {
        let mut out = Matrix4 { m: [[0.0; 4]; 4] };
        for (row, (ra, rb)) in out.m.iter_mut().zip(a.m.iter().zip(b.m.iter())) {
            for (v, (x, y)) in row.iter_mut().zip(ra.iter().zip(rb.iter())) {
                *v = x + (y - x) * t;
            }
        }
        out
    }

    pub fn approx_eq(&self, other: &Matrix4, epsilon: f32) -> bool {
        self.m
            .iter()
            .flatten()
            .zip(other.m.iter().flatten())
            .all(|(a, b)| (a - b).abs() <= epsilon)
    }
}

impl Default for Matrix4 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Model transform tagged with a stable id so it can be matched across frames.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransformGroup {
    pub id: u32,
    pub matrix: Matrix4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectionKind {
    Perspective,
    Orthographic,
    /// Screen-space rectangles; never interpolated
    Rectangle,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    pub kind: ProjectionKind,
    pub matrix: Matrix4,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DrawCall {
    /// Index into [`DrawData::transforms`]
    pub transform: usize,
    pub vertex_count: u32,
    /// Index into [`DrawData::tiles`]
    pub tile: Option<usize>,
    pub scissor: FixedRect,
    pub tile_scroll: [f32; 2],
    pub depth_write: bool,
}

/// A draw call as issued under one projection of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameCall {
    /// Index into [`FramebufferPair::projections`]
    pub projection: usize,
    /// Index into [`DrawData::calls`]
    pub draw_call: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorImage {
    pub address: u32,
    pub siz: PixelSize,
    pub width: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FramebufferPair {
    pub color_image: Option<ColorImage>,
    pub depth_image: Option<u32>,
    pub projections: Vec<Projection>,
    pub game_calls: Vec<GameCall>,
    pub draw_color_rect: FixedRect,
    pub draw_depth_rect: FixedRect,
    /// A later pair of the same workload samples this pair's output
    pub sync_required: bool,
    /// Copied from the color framebuffer when the workload is synchronized
    pub interpolate: bool,
    pub start_fb_operations: Vec<FramebufferOperation>,
    pub end_fb_operations: Vec<FramebufferOperation>,
}

impl FramebufferPair {
    pub fn is_empty(&self) -> bool {
        self.game_calls.is_empty()
    }

    /// Rows touched by draws; the render target must be at least this tall.
    pub fn draw_height(&self) -> u32 {
        self.draw_color_rect
            .bottom
            .max(self.draw_depth_rect.bottom)
            .max(1) as u32
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DrawData {
    pub calls: Vec<DrawCall>,
    pub transforms: Vec<TransformGroup>,
    pub tiles: Vec<LoadTile>,
    /// Tile copy bound for each tile, parallel to `tiles`
    pub tile_copies: Vec<Option<TileCopy>>,
}

impl DrawData {
    pub fn clear(&mut self) {
        self.calls.clear();
        self.transforms.clear();
        self.tiles.clear();
        self.tile_copies.clear();
    }
}

/// Shape of a workload used to decide whether two frames can be blended.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Topology {
    pairs: Vec<(u32, usize)>,
    transform_ids: Vec<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Workload {
    pub workload_id: u64,
    /// Last present submitted before this workload
    pub present_id: u64,
    pub fb_pairs: Vec<FramebufferPair>,
    pub draw_data: DrawData,
    pub submission_frame: u64,
    pub paused: bool,
    pub vi_original_rate: u32,
    /// RAM changes found while synchronizing, for diagnostics
    pub fb_changes: Vec<FramebufferChange>,
    #[serde(skip)]
    current_projection: Option<usize>,
}

impl Workload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear per-frame data so the slot can be refilled.
    pub fn reset(&mut self) {
        self.fb_pairs.clear();
        self.draw_data.clear();
        self.fb_changes.clear();
        self.paused = false;
        self.current_projection = None;
    }

    fn current_pair(&mut self) -> &mut FramebufferPair {
        if self.fb_pairs.is_empty() {
            self.fb_pairs.push(FramebufferPair::default());
        }
        let last = self.fb_pairs.len() - 1;
        &mut self.fb_pairs[last]
    }

    /// Start a new pair if draws were issued since the last image change.
    fn open_pair(&mut self) -> &mut FramebufferPair {
        let needs_new = self.fb_pairs.last().is_some_and(|pair| !pair.is_empty());
        if needs_new {
            let depth_image = self.fb_pairs.last().and_then(|pair| pair.depth_image);
            let color_image = self.fb_pairs.last().and_then(|pair| pair.color_image);
            self.fb_pairs.push(FramebufferPair {
                color_image,
                depth_image,
                ..FramebufferPair::default()
            });
            self.current_projection = None;
        }
        self.current_pair()
    }

    pub fn set_color_image(&mut self, address: u32, siz: PixelSize, width: u32) {
        let image = ColorImage {
            address: address & 0x00FF_FFFF,
            siz,
            width,
        };
        if self.fb_pairs.last().and_then(|pair| pair.color_image) == Some(image) {
            return;
        }
        self.open_pair().color_image = Some(image);
    }

    pub fn set_depth_image(&mut self, address: u32) {
        let address = address & 0x00FF_FFFF;
        if self.fb_pairs.last().and_then(|pair| pair.depth_image) == Some(address) {
            return;
        }
        self.open_pair().depth_image = Some(address);
    }

    pub fn add_transform(&mut self, id: u32, matrix: Matrix4) -> usize {
        self.draw_data.transforms.push(TransformGroup { id, matrix });
        self.draw_data.transforms.len() - 1
    }

    pub fn add_projection(&mut self, kind: ProjectionKind, matrix: Matrix4) -> usize {
        let pair = self.current_pair();
        pair.projections.push(Projection { kind, matrix });
        let index = pair.projections.len() - 1;
        self.current_projection = Some(index);
        index
    }

    pub fn add_tile(&mut self, tile: LoadTile) -> usize {
        self.draw_data.tiles.push(tile);
        self.draw_data.tile_copies.push(None);
        self.draw_data.tiles.len() - 1
    }

    /// Append a draw call to the current pair under the current projection.
    pub fn add_draw_call(&mut self, call: DrawCall) -> usize {
        let projection = match self.current_projection {
            Some(index) => index,
            None => self.add_projection(ProjectionKind::Rectangle, Matrix4::IDENTITY),
        };
        self.draw_data.calls.push(call);
        let draw_call = self.draw_data.calls.len() - 1;

        let pair = self.current_pair();
        pair.game_calls.push(GameCall {
            projection,
            draw_call,
        });
        pair.draw_color_rect = pair.draw_color_rect.merge(&call.scissor);
        if call.depth_write {
            pair.draw_depth_rect = pair.draw_depth_rect.merge(&call.scissor);
        }
        draw_call
    }

    pub fn draw_call_count(&self) -> usize {
        self.draw_data.calls.len()
    }

    pub fn topology(&self) -> Topology {
        Topology {
            pairs: self
                .fb_pairs
                .iter()
                .map(|pair| {
                    (
                        pair.color_image.map(|image| image.address).unwrap_or(0),
                        pair.game_calls.len(),
                    )
                })
                .collect(),
            transform_ids: self.draw_data.transforms.iter().map(|t| t.id).collect(),
        }
    }
}
