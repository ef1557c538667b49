//! Texture loads and the tile-copy fast path
//!
//! When a display list loads a texture from an RDRAM region that a previous
//! draw rendered into, the RAM contents are stale: the real image only exists
//! in the GPU render target. Instead of uploading TMEM, such a load binds a
//! GPU copy of the render target region ("tile copy").
//!
//! A tile copy only covers the part of the load that falls inside the
//! framebuffer. If the draws sample texels outside that region the copy is
//! too small and the load falls back to the TMEM hash path.

use crate::framebuffer::{Framebuffer, FramebufferTable};
use hle_core::graphics::PixelSize;
use hle_core::logging::{log, LogCategory, LogLevel};
use hle_core::types::FixedRect;
use serde::{Deserialize, Serialize};

/// Texture load descriptor as decoded by the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadTile {
    /// RDRAM address of the source image
    pub address: u32,
    /// Source image line width in texels
    pub width: u32,
    pub siz: PixelSize,
    pub fmt: u8,
    /// Texels loaded into TMEM, in source image coordinates
    pub load_rect: FixedRect,
    /// Texels sampled by the draws using this tile, same coordinates
    pub sample_rect: FixedRect,
    /// Hash of the TMEM bytes, used when no tile copy applies
    pub tmem_hash: u32,
}

impl LoadTile {
    /// RDRAM bytes spanned by the loaded rows.
    pub fn byte_span(&self) -> (u32, u32) {
        let stride = self.siz.bytes_for(self.width);
        let start = self.address + self.load_rect.top.max(0) as u32 * stride;
        let end = self.address + self.load_rect.bottom.max(0) as u32 * stride;
        (start, end.max(start + 1))
    }
}

/// Texture source chosen for a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TileSource {
    /// Copy `fb_rect` of the framebuffer at `address`. `tile_rect` is the
    /// same region in source image coordinates.
    Copy {
        address: u32,
        fb_rect: FixedRect,
        tile_rect: FixedRect,
    },
    Tmem { hash: u32 },
}

/// A tile copy queued for a framebuffer pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileCopy {
    /// Framebuffer the copy reads from
    pub address: u32,
    pub siz: PixelSize,
    pub width: u32,
    /// Index of this copy within the workload
    pub index: u32,
    pub fb_rect: FixedRect,
    pub tile_rect: FixedRect,
}

/// Validate a tile copy of `fb` for `tile`. Returns the copy region when the
/// load's sampled texels all fall inside it.
pub fn check_tile_copy_tmem(tile: &LoadTile, fb: &Framebuffer) -> Option<TileSource> {
    if !fb.was_written() || tile.siz != fb.siz || tile.width != fb.width {
        return None;
    }
    if tile.address < fb.address {
        return None;
    }

    let stride = fb.stride();
    let pixel_bytes = fb.siz.bytes_for(2) / 2;
    if stride == 0 || pixel_bytes == 0 {
        return None;
    }
    let offset = tile.address - fb.address;
    let dy = (offset / stride) as i32;
    let dx = ((offset % stride) / pixel_bytes) as i32;

    let translated = FixedRect::new(
        tile.load_rect.left + dx,
        tile.load_rect.top + dy,
        tile.load_rect.right + dx,
        tile.load_rect.bottom + dy,
    );
    let fb_rect = translated.intersection(&fb.bounds());
    if fb_rect.is_empty() {
        return None;
    }
    let tile_rect = FixedRect::new(
        fb_rect.left - dx,
        fb_rect.top - dy,
        fb_rect.right - dx,
        fb_rect.bottom - dy,
    );

    if !tile_rect.contains(&tile.sample_rect) {
        log(LogCategory::Framebuffer, LogLevel::Trace, || {
            format!(
                "Tile copy of 0x{:06X} too small: sampled {:?} outside {:?}",
                fb.address, tile.sample_rect, tile_rect
            )
        });
        return None;
    }

    Some(TileSource::Copy {
        address: fb.address,
        fb_rect,
        tile_rect,
    })
}

/// Pick the texture source for `tile`: a tile copy of the latest rendered
/// framebuffer overlapping it, or its TMEM hash.
pub fn resolve(tile: &LoadTile, table: &FramebufferTable) -> TileSource {
    let (start, end) = tile.byte_span();
    table
        .find_overlapping(start, end - start)
        .and_then(|fb| check_tile_copy_tmem(tile, fb))
        .unwrap_or(TileSource::Tmem {
            hash: tile.tmem_hash,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framebuffer::WriteType;

    fn written_fb() -> Framebuffer {
        let mut fb = Framebuffer::new(0x100000, PixelSize::Bits16, 64, 64);
        fb.record_write(WriteType::Color, fb.bounds(), 1);
        fb
    }

    fn tile(address: u32, load: FixedRect, sample: FixedRect) -> LoadTile {
        LoadTile {
            address,
            width: 64,
            siz: PixelSize::Bits16,
            fmt: 0,
            load_rect: load,
            sample_rect: sample,
            tmem_hash: 0xDEADBEEF,
        }
    }

    #[test]
    fn test_tile_copy_inside_bounds() {
        let fb = written_fb();
        let t = tile(
            0x100000,
            FixedRect::new(0, 0, 32, 32),
            FixedRect::new(4, 4, 28, 28),
        );
        assert_eq!(
            check_tile_copy_tmem(&t, &fb),
            Some(TileSource::Copy {
                address: 0x100000,
                fb_rect: FixedRect::new(0, 0, 32, 32),
                tile_rect: FixedRect::new(0, 0, 32, 32),
            })
        );
    }

    #[test]
    fn test_tile_offset_into_framebuffer() {
        let fb = written_fb();
        // Start at row 60, column 8
        let address = 0x100000 + 60 * 128 + 8 * 2;
        let t = tile(
            address,
            FixedRect::new(0, 0, 16, 8),
            FixedRect::new(0, 0, 16, 4),
        );
        match check_tile_copy_tmem(&t, &fb) {
            Some(TileSource::Copy {
                fb_rect, tile_rect, ..
            }) => {
                assert_eq!(fb_rect, FixedRect::new(8, 60, 24, 64));
                assert_eq!(tile_rect, FixedRect::new(0, 0, 16, 4));
            }
            other => panic!("expected tile copy, got {:?}", other),
        }
    }

    #[test]
    fn test_sample_outside_copy_falls_back() {
        let fb = written_fb();
        let address = 0x100000 + 60 * 128;
        // Only 4 rows of the load lie inside the framebuffer but 8 are sampled
        let t = tile(
            address,
            FixedRect::new(0, 0, 16, 8),
            FixedRect::new(0, 0, 16, 8),
        );
        assert_eq!(check_tile_copy_tmem(&t, &fb), None);
    }

    #[test]
    fn test_format_mismatch_falls_back() {
        let fb = written_fb();
        let mut t = tile(
            0x100000,
            FixedRect::new(0, 0, 8, 8),
            FixedRect::new(0, 0, 8, 8),
        );
        t.siz = PixelSize::Bits8;
        assert_eq!(check_tile_copy_tmem(&t, &fb), None);
    }

    #[test]
    fn test_resolve_uses_tmem_without_render() {
        let mut table = FramebufferTable::new();
        table.get_or_create(0x100000, PixelSize::Bits16, 64, 64);
        let t = tile(
            0x100000,
            FixedRect::new(0, 0, 8, 8),
            FixedRect::new(0, 0, 8, 8),
        );
        assert_eq!(resolve(&t, &table), TileSource::Tmem { hash: 0xDEADBEEF });

        table.record_write(0x100000, WriteType::Color, FixedRect::new(0, 0, 64, 64), 1);
        assert!(matches!(resolve(&t, &table), TileSource::Copy { .. }));
    }
}
