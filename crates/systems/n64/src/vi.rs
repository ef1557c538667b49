//! VI (Video Interface) register file and screen snapshots
//!
//! The interpreter mirrors VI register writes into a [`VideoInterface`]; at
//! every vertical interrupt it takes a [`ScreenVi`] snapshot and hands it to
//! the present queue. The snapshot decodes what the present thread needs:
//! which RDRAM framebuffer is on screen, its pixel size, and how much of it
//! is visible.
//!
//! ## Memory Map
//!
//! VI registers are memory-mapped at 0x04400000-0x04400037:
//! - 0x04400000: VI_STATUS - Video control/status register
//! - 0x04400004: VI_ORIGIN - Framebuffer origin address
//! - 0x04400008: VI_WIDTH - Framebuffer line width
//! - 0x0440000C: VI_INTR - Vertical interrupt
//! - 0x04400010: VI_CURRENT - Current scanline
//! - 0x04400014: VI_BURST - Timing register
//! - 0x04400018: VI_V_SYNC - Vertical sync
//! - 0x0440001C: VI_H_SYNC - Horizontal sync
//! - 0x04400020: VI_LEAP - Horizontal sync leap
//! - 0x04400024: VI_H_START - Horizontal video start
//! - 0x04400028: VI_V_START - Vertical video start
//! - 0x0440002C: VI_V_BURST - Vertical burst start/end
//! - 0x04400030: VI_X_SCALE - Horizontal scale
//! - 0x04400034: VI_Y_SCALE - Vertical scale

use hle_core::graphics::PixelSize;
use hle_core::logging::{log, LogCategory, LogLevel};
use serde::{Deserialize, Serialize};

/// VI register offsets (relative to 0x04400000)
pub const VI_STATUS: u32 = 0x00;
pub const VI_ORIGIN: u32 = 0x04;
pub const VI_WIDTH: u32 = 0x08;
pub const VI_INTR: u32 = 0x0C;
pub const VI_CURRENT: u32 = 0x10;
pub const VI_BURST: u32 = 0x14;
pub const VI_V_SYNC: u32 = 0x18;
pub const VI_H_SYNC: u32 = 0x1C;
pub const VI_LEAP: u32 = 0x20;
pub const VI_H_START: u32 = 0x24;
pub const VI_V_START: u32 = 0x28;
pub const VI_V_BURST: u32 = 0x2C;
pub const VI_X_SCALE: u32 = 0x30;
pub const VI_Y_SCALE: u32 = 0x34;

/// VI_STATUS pixel type field
pub const VI_STATUS_TYPE_MASK: u32 = 0x03;
pub const VI_STATUS_TYPE_16: u32 = 0x02;
pub const VI_STATUS_TYPE_32: u32 = 0x03;

/// NTSC field rate in Hz.
pub const NTSC_RATE: u32 = 60;
/// PAL field rate in Hz.
pub const PAL_RATE: u32 = 50;

/// Snapshot of the VI registers relevant to presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScreenVi {
    pub status: u32,
    pub origin: u32,
    pub width: u32,
    pub h_start: u32,
    pub v_start: u32,
    pub x_scale: u32,
    pub y_scale: u32,
}

impl ScreenVi {
    /// Convenience constructor for a 1:1 scaled screen of `width` x `height`.
    pub fn simple(origin: u32, width: u32, height: u32, siz: PixelSize) -> Self {
        let pixel_type = match siz {
            PixelSize::Bits32 => VI_STATUS_TYPE_32,
            _ => VI_STATUS_TYPE_16,
        };
        // Vertical coordinates are in half-lines.
        let v_begin = 0x25;
        let v_end = v_begin + height * 2;
        let h_begin = 0x6C;
        let h_end = h_begin + width;
        Self {
            status: pixel_type,
            origin,
            width,
            h_start: (h_begin << 16) | h_end,
            v_start: (v_begin << 16) | v_end,
            x_scale: 0x400,
            y_scale: 0x400,
        }
    }

    /// RDRAM address of the displayed framebuffer.
    pub fn fb_address(&self) -> u32 {
        self.origin & 0x00FF_FFFF
    }

    pub fn fb_width(&self) -> u32 {
        self.width & 0xFFF
    }

    /// Pixel size of the displayed framebuffer, or `None` when output is blanked.
    pub fn fb_size(&self) -> Option<PixelSize> {
        match self.status & VI_STATUS_TYPE_MASK {
            VI_STATUS_TYPE_16 => Some(PixelSize::Bits16),
            VI_STATUS_TYPE_32 => Some(PixelSize::Bits32),
            _ => None,
        }
    }

    fn span(reg: u32) -> u32 {
        let start = (reg >> 16) & 0x3FF;
        let end = reg & 0x3FF;
        end.saturating_sub(start)
    }

    /// Framebuffer lines read by the VI (2.10 fixed-point y scale).
    pub fn fb_height(&self) -> u32 {
        let half_lines = Self::span(self.v_start);
        let y_scale = self.y_scale & 0xFFF;
        ((half_lines / 2) * y_scale) >> 10
    }

    /// Framebuffer columns read by the VI (2.10 fixed-point x scale).
    pub fn fb_visible_width(&self) -> u32 {
        let span = Self::span(self.h_start);
        let x_scale = self.x_scale & 0xFFF;
        ((span * x_scale) >> 10).min(self.fb_width())
    }

    /// True when the VI is outputting an image.
    pub fn visible(&self) -> bool {
        self.fb_size().is_some()
            && self.fb_width() > 0
            && self.fb_height() > 0
            && self.fb_visible_width() > 0
    }

    /// Number of RDRAM bytes covered by the visible framebuffer.
    pub fn fb_byte_count(&self) -> u32 {
        self.fb_size()
            .map(|siz| siz.bytes_for(self.fb_width() * self.fb_height()))
            .unwrap_or(0)
    }
}

/// Video Interface register file
pub struct VideoInterface {
    status: u32,
    origin: u32,
    width: u32,
    intr: u32,
    current: u32,
    burst: u32,
    v_sync: u32,
    h_sync: u32,
    leap: u32,
    h_start: u32,
    v_start: u32,
    v_burst: u32,
    x_scale: u32,
    y_scale: u32,
}

impl VideoInterface {
    /// Create a new Video Interface with NTSC defaults
    pub fn new() -> Self {
        Self {
            status: 0,
            origin: 0,
            width: 320,
            intr: 0x200,
            current: 0,
            burst: 0x03E52239,
            v_sync: 0x020D,
            h_sync: 0x0C15,
            leap: 0x0C150C15,
            h_start: 0x006C02EC,
            v_start: 0x002501FF,
            v_burst: 0x000E0204,
            x_scale: 0x0200,
            y_scale: 0x0400,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn read_register(&self, offset: u32) -> u32 {
        match offset {
            VI_STATUS => self.status,
            VI_ORIGIN => self.origin,
            VI_WIDTH => self.width,
            VI_INTR => self.intr,
            VI_CURRENT => self.current,
            VI_BURST => self.burst,
            VI_V_SYNC => self.v_sync,
            VI_H_SYNC => self.h_sync,
            VI_LEAP => self.leap,
            VI_H_START => self.h_start,
            VI_V_START => self.v_start,
            VI_V_BURST => self.v_burst,
            VI_X_SCALE => self.x_scale,
            VI_Y_SCALE => self.y_scale,
            _ => 0,
        }
    }

    pub fn write_register(&mut self, offset: u32, value: u32) {
        if offset == VI_STATUS || offset == VI_ORIGIN {
            log(LogCategory::Present, LogLevel::Trace, || {
                format!("VI: write to offset 0x{:02X} = 0x{:08X}", offset, value)
            });
        }

        match offset {
            VI_STATUS => self.status = value,
            VI_ORIGIN => self.origin = value & 0x00FFFFFF,
            VI_WIDTH => self.width = value & 0xFFF,
            VI_INTR => self.intr = value & 0x3FF,
            // Writing VI_CURRENT acknowledges the interrupt.
            VI_CURRENT => self.current = 0,
            VI_BURST => self.burst = value,
            VI_V_SYNC => self.v_sync = value & 0x3FF,
            VI_H_SYNC => self.h_sync = value & 0xFFF,
            VI_LEAP => self.leap = value,
            VI_H_START => self.h_start = value,
            VI_V_START => self.v_start = value,
            VI_V_BURST => self.v_burst = value,
            VI_X_SCALE => self.x_scale = value & 0xFFF,
            VI_Y_SCALE => self.y_scale = value & 0xFFF,
            _ => {}
        }
    }

    /// Field rate implied by VI_V_SYNC (625-line timing is PAL).
    pub fn field_rate(&self) -> u32 {
        if self.v_sync >= 0x270 {
            PAL_RATE
        } else {
            NTSC_RATE
        }
    }

    /// Capture the registers the present thread needs.
    pub fn snapshot(&self) -> ScreenVi {
        ScreenVi {
            status: self.status,
            origin: self.origin,
            width: self.width,
            h_start: self.h_start,
            v_start: self.v_start,
            x_scale: self.x_scale,
            y_scale: self.y_scale,
        }
    }
}

impl Default for VideoInterface {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vi_reset() {
        let mut vi = VideoInterface::new();
        vi.write_register(VI_ORIGIN, 0x00100000);
        vi.write_register(VI_WIDTH, 640);

        vi.reset();

        assert_eq!(vi.read_register(VI_ORIGIN), 0);
        assert_eq!(vi.read_register(VI_WIDTH), 320);
    }

    #[test]
    fn test_vi_origin_masking() {
        let mut vi = VideoInterface::new();
        vi.write_register(VI_ORIGIN, 0xA0100000);
        assert_eq!(vi.read_register(VI_ORIGIN), 0x00100000);
        assert_eq!(vi.snapshot().fb_address(), 0x00100000);
    }

    #[test]
    fn test_blank_screen_is_not_visible() {
        let vi = VideoInterface::new();
        let screen = vi.snapshot();
        assert_eq!(screen.fb_size(), None);
        assert!(!screen.visible());
        assert_eq!(screen.fb_byte_count(), 0);
    }

    #[test]
    fn test_ntsc_snapshot_dimensions() {
        let mut vi = VideoInterface::new();
        vi.write_register(VI_STATUS, VI_STATUS_TYPE_16);
        vi.write_register(VI_WIDTH, 320);
        vi.write_register(VI_ORIGIN, 0x00200000);
        vi.write_register(VI_X_SCALE, 0x200);
        vi.write_register(VI_Y_SCALE, 0x400);

        let screen = vi.snapshot();
        assert_eq!(screen.fb_size(), Some(PixelSize::Bits16));
        assert!(screen.visible());
        // (0x1FF - 0x25) half-lines = 237 lines at 1:1
        assert_eq!(screen.fb_height(), 237);
        // 640 columns at 0.5 scale
        assert_eq!(screen.fb_visible_width(), 320);
        assert_eq!(screen.fb_byte_count(), 320 * 237 * 2);
    }

    #[test]
    fn test_simple_screen() {
        let screen = ScreenVi::simple(0x100000, 320, 240, PixelSize::Bits32);
        assert_eq!(screen.fb_width(), 320);
        assert_eq!(screen.fb_height(), 240);
        assert_eq!(screen.fb_visible_width(), 320);
        assert_eq!(screen.fb_size(), Some(PixelSize::Bits32));
    }

    #[test]
    fn test_field_rate() {
        let mut vi = VideoInterface::new();
        assert_eq!(vi.field_rate(), NTSC_RATE);
        vi.write_register(VI_V_SYNC, 0x0271);
        assert_eq!(vi.field_rate(), PAL_RATE);
    }
}
