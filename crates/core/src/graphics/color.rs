//! Color conversion utilities for RDRAM image data
//!
//! RDRAM stores framebuffers big-endian, either as 16-bit RGBA5551 or 32-bit
//! RGBA8888. Everything here converts to ARGB8888 (0xAARRGGBB), the format
//! used by [`Frame`](crate::types::Frame).

use crate::types::Frame;
use serde::{Deserialize, Serialize};

/// Texel/pixel size as encoded in the RDP `siz` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum PixelSize {
    Bits4 = 0,
    Bits8 = 1,
    Bits16 = 2,
    Bits32 = 3,
}

impl PixelSize {
    /// Decode from the 2-bit `siz` field.
    pub fn from_siz(siz: u32) -> Self {
        match siz & 0x3 {
            0 => PixelSize::Bits4,
            1 => PixelSize::Bits8,
            2 => PixelSize::Bits16,
            _ => PixelSize::Bits32,
        }
    }

    /// Number of bytes needed to store `pixels` pixels (4-bit rounds up).
    pub fn bytes_for(self, pixels: u32) -> u32 {
        match self {
            PixelSize::Bits4 => pixels.div_ceil(2),
            PixelSize::Bits8 => pixels,
            PixelSize::Bits16 => pixels * 2,
            PixelSize::Bits32 => pixels * 4,
        }
    }

    pub fn bits(self) -> u32 {
        4 << (self as u32)
    }
}

/// Color operation utilities
pub struct ColorOps;

impl ColorOps {
    /// Expand an RGBA5551 pixel into ARGB8888.
    ///
    /// The 5-bit channels are replicated into the low bits so that full
    /// intensity maps to 0xFF.
    #[inline]
    pub fn rgba5551_to_argb(pixel: u16) -> u32 {
        let expand = |c: u16| -> u32 {
            let c = (c & 0x1F) as u32;
            (c << 3) | (c >> 2)
        };
        let r = expand(pixel >> 11);
        let g = expand(pixel >> 6);
        let b = expand(pixel >> 1);
        let a = if pixel & 1 != 0 { 0xFF } else { 0x00 };
        (a << 24) | (r << 16) | (g << 8) | b
    }

    /// Convert an RGBA8888 word (as read big-endian from RDRAM) into ARGB8888.
    #[inline]
    pub fn rgba8888_to_argb(pixel: u32) -> u32 {
        pixel.rotate_right(8)
    }

    /// Decode a framebuffer image stored in RDRAM layout.
    ///
    /// Rows that run past the end of `bytes` are left black. 4-bit and 8-bit
    /// sizes are treated as intensity images.
    pub fn decode_image(bytes: &[u8], siz: PixelSize, width: u32, height: u32) -> Frame {
        let mut frame = Frame::new(width, height);
        let pixel_count = (width * height) as usize;
        match siz {
            PixelSize::Bits16 => {
                for (dst, chunk) in frame.pixels.iter_mut().zip(bytes.chunks_exact(2)) {
                    *dst = Self::rgba5551_to_argb(u16::from_be_bytes([chunk[0], chunk[1]]));
                }
            }
            PixelSize::Bits32 => {
                for (dst, chunk) in frame.pixels.iter_mut().zip(bytes.chunks_exact(4)) {
                    let word = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    *dst = Self::rgba8888_to_argb(word);
                }
            }
            PixelSize::Bits8 => {
                for (dst, &i) in frame.pixels.iter_mut().zip(bytes.iter()) {
                    *dst = Self::from_rgb(i, i, i);
                }
            }
            PixelSize::Bits4 => {
                for (index, dst) in frame.pixels.iter_mut().enumerate().take(pixel_count) {
                    let Some(&byte) = bytes.get(index / 2) else {
                        break;
                    };
                    let nibble = if index % 2 == 0 { byte >> 4 } else { byte & 0xF };
                    let i = (nibble << 4) | nibble;
                    *dst = Self::from_rgb(i, i, i);
                }
            }
        }
        frame
    }

    /// Extract red channel from ARGB color
    #[inline]
    pub fn red(color: u32) -> u8 {
        ((color >> 16) & 0xFF) as u8
    }

    /// Extract green channel from ARGB color
    #[inline]
    pub fn green(color: u32) -> u8 {
        ((color >> 8) & 0xFF) as u8
    }

    /// Extract blue channel from ARGB color
    #[inline]
    pub fn blue(color: u32) -> u8 {
        (color & 0xFF) as u8
    }

    /// Extract alpha channel from ARGB color
    #[inline]
    pub fn alpha(color: u32) -> u8 {
        ((color >> 24) & 0xFF) as u8
    }

    /// Construct RGB color with full alpha
    #[inline]
    pub fn from_rgb(r: u8, g: u8, b: u8) -> u32 {
        0xFF000000 | ((r as u32) << 16) | ((g as u32) << 8) | (b as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgba5551_expansion() {
        // White, opaque
        assert_eq!(ColorOps::rgba5551_to_argb(0xFFFF), 0xFFFFFFFF);
        // Black, transparent
        assert_eq!(ColorOps::rgba5551_to_argb(0x0000), 0x00000000);
        // Pure red, opaque: r=31
        let red = ColorOps::rgba5551_to_argb(0b11111_00000_00000_1);
        assert_eq!(ColorOps::red(red), 0xFF);
        assert_eq!(ColorOps::green(red), 0);
        assert_eq!(ColorOps::blue(red), 0);
        assert_eq!(ColorOps::alpha(red), 0xFF);
    }

    #[test]
    fn test_rgba8888_rotation() {
        assert_eq!(ColorOps::rgba8888_to_argb(0x11223344), 0x44112233);
    }

    #[test]
    fn test_decode_image_16bit() {
        let bytes = [0xFF, 0xFF, 0x00, 0x01];
        let frame = ColorOps::decode_image(&bytes, PixelSize::Bits16, 2, 1);
        assert_eq!(frame.pixels, vec![0xFFFFFFFF, 0xFF000000]);
    }

    #[test]
    fn test_decode_image_short_input() {
        // Only one row of data for a 2x2 image; the second row stays black.
        let bytes = [0x11, 0x22, 0x33, 0xFF, 0x44, 0x55, 0x66, 0xFF];
        let frame = ColorOps::decode_image(&bytes, PixelSize::Bits32, 2, 2);
        assert_eq!(frame.pixels[0], 0xFF112233);
        assert_eq!(frame.pixels[1], 0xFF445566);
        assert_eq!(frame.pixels[2], 0);
        assert_eq!(frame.pixels[3], 0);
    }

    #[test]
    fn test_decode_image_4bit() {
        let frame = ColorOps::decode_image(&[0xF0], PixelSize::Bits4, 2, 1);
        assert_eq!(frame.pixels, vec![0xFFFFFFFF, 0xFF000000]);
    }

    #[test]
    fn test_pixel_size_bytes() {
        assert_eq!(PixelSize::from_siz(2), PixelSize::Bits16);
        assert_eq!(PixelSize::Bits4.bytes_for(3), 2);
        assert_eq!(PixelSize::Bits16.bytes_for(320), 640);
        assert_eq!(PixelSize::Bits32.bits(), 32);
    }
}
