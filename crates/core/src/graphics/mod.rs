//! Pixel format helpers shared by the pipeline crates.

pub mod color;

pub use color::{ColorOps, PixelSize};
