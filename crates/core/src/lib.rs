//! Core primitives shared by the HLE graphics pipeline crates.

pub mod graphics;
pub mod logging;
pub mod types {
    use serde::{Deserialize, Serialize};

    /// CPU-side image in ARGB8888 (0xAARRGGBB).
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Frame {
        pub width: u32,
        pub height: u32,
        pub pixels: Vec<u32>,
    }

    impl Frame {
        pub fn new(width: u32, height: u32) -> Self {
            Self {
                width,
                height,
                pixels: vec![0; (width * height) as usize],
            }
        }
    }

    /// Pixel rectangle, `left`/`top` inclusive and `right`/`bottom` exclusive.
    ///
    /// An empty rect (`right <= left` or `bottom <= top`) acts as the identity
    /// for [`FixedRect::merge`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct FixedRect {
        pub left: i32,
        pub top: i32,
        pub right: i32,
        pub bottom: i32,
    }

    impl FixedRect {
        pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
            Self {
                left,
                top,
                right,
                bottom,
            }
        }

        pub fn is_empty(&self) -> bool {
            self.right <= self.left || self.bottom <= self.top
        }

        pub fn width(&self) -> u32 {
            (self.right - self.left).max(0) as u32
        }

        pub fn height(&self) -> u32 {
            (self.bottom - self.top).max(0) as u32
        }

        /// Smallest rect containing both.
        pub fn merge(&self, other: &FixedRect) -> FixedRect {
            if self.is_empty() {
                return *other;
            }
            if other.is_empty() {
                return *self;
            }
            FixedRect {
                left: self.left.min(other.left),
                top: self.top.min(other.top),
                right: self.right.max(other.right),
                bottom: self.bottom.max(other.bottom),
            }
        }

        pub fn intersection(&self, other: &FixedRect) -> FixedRect {
            let rect = FixedRect {
                left: self.left.max(other.left),
                top: self.top.max(other.top),
                right: self.right.min(other.right),
                bottom: self.bottom.min(other.bottom),
            };
            if rect.is_empty() {
                FixedRect::default()
            } else {
                rect
            }
        }

        pub fn intersects(&self, other: &FixedRect) -> bool {
            !self.intersection(other).is_empty()
        }

        /// True if `other` lies entirely inside `self`.
        pub fn contains(&self, other: &FixedRect) -> bool {
            other.left >= self.left
                && other.top >= self.top
                && other.right <= self.right
                && other.bottom <= self.bottom
        }
    }
}
