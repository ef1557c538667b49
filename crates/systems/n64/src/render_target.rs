//! GPU render targets backing framebuffers
//!
//! The [`RenderTargetManager`] owns every texture the pipeline renders into,
//! keyed by [`RenderTargetKey`] and a [`TargetSlot`]. The main slot holds the
//! target the final sub-frame of a workload renders into; override slots hold
//! the intermediate interpolated sub-frames so the present thread can show
//! them in order while the render thread moves on.
//!
//! Targets grow but never shrink. A lookup with a larger size recreates the
//! texture at the union of both sizes; a smaller lookup reuses it as is.

use crate::framebuffer::WriteType;
use crate::rhi::{RenderDevice, RhiError, TextureDesc, TextureFormat, TextureId};
use hle_core::graphics::PixelSize;
use hle_core::logging::{log, LogCategory, LogLevel};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    Color,
    Depth,
    /// GPU copy of a rendered region, sampled as a texture
    TileCopy,
    /// Scratch target the present thread composites into
    Present,
}

impl TargetKind {
    pub fn for_write(write_type: WriteType) -> Self {
        match write_type {
            WriteType::Color => TargetKind::Color,
            WriteType::Depth => TargetKind::Depth,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderTargetKey {
    pub address: u32,
    pub width: u32,
    pub siz: PixelSize,
    pub kind: TargetKind,
    /// Disambiguates several targets sharing one address (tile copy index)
    pub modifier: u32,
}

impl RenderTargetKey {
    pub fn new(address: u32, width: u32, siz: PixelSize, kind: TargetKind) -> Self {
        Self {
            address,
            width,
            siz,
            kind,
            modifier: 0,
        }
    }

    pub fn with_modifier(mut self, modifier: u32) -> Self {
        self.modifier = modifier;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetSlot {
    Main,
    /// Intermediate interpolated sub-frame `n`
    Override(usize),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderTargetConfig {
    pub resolution_scale: f32,
    pub downsample_multiplier: u32,
    pub samples: u32,
}

impl Default for RenderTargetConfig {
    fn default() -> Self {
        Self {
            resolution_scale: 1.0,
            downsample_multiplier: 1,
            samples: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderTarget {
    pub key: RenderTargetKey,
    pub texture: TextureId,
    /// Native size in framebuffer pixels
    pub width: u32,
    pub height: u32,
    pub scaled_width: u32,
    pub scaled_height: u32,
    pub resolution_scale: f32,
    pub downsample_multiplier: u32,
    /// Fractional column lost when `width * resolution_scale` is not integral
    pub misalign_x: f32,
    pub samples: u32,
}

impl RenderTarget {
    pub fn covers(&self, width: u32, height: u32) -> bool {
        self.width >= width && self.height >= height
    }
}

/// Owner of all render target textures.
pub struct RenderTargetManager {
    device: Arc<dyn RenderDevice>,
    config: RenderTargetConfig,
    targets: HashMap<(RenderTargetKey, TargetSlot), RenderTarget>,
}

impl RenderTargetManager {
    pub fn new(device: Arc<dyn RenderDevice>, config: RenderTargetConfig) -> Self {
        Self {
            device,
            config,
            targets: HashMap::new(),
        }
    }

    pub fn config(&self) -> RenderTargetConfig {
        self.config
    }

    /// Scale actually used for a target of `width` native pixels, limited so
    /// the texture fits the device.
    pub fn scale_for(&self, width: u32, height: u32) -> f32 {
        let max = self.device.capabilities().max_texture_size as f32;
        let largest = width.max(height).max(1) as f32;
        let downsample = self.config.downsample_multiplier.max(1) as f32;
        (self.config.resolution_scale * downsample).min(max / largest)
    }

    /// Return the target for `key` in `slot`, creating or growing it so it
    /// covers `width` x `height`.
    pub fn get(
        &mut self,
        key: RenderTargetKey,
        slot: TargetSlot,
        width: u32,
        height: u32,
    ) -> Result<&RenderTarget, RhiError> {
        let grow = match self.targets.get(&(key, slot)) {
            Some(existing) if existing.covers(width, height) => None,
            Some(existing) => Some((existing.width.max(width), existing.height.max(height))),
            None => Some((width.max(1), height.max(1))),
        };

        if let Some((width, height)) = grow {
            if let Some(old) = self.targets.remove(&(key, slot)) {
                log(LogCategory::RenderTarget, LogLevel::Debug, || {
                    format!(
                        "Growing {:?} target 0x{:06X} {}x{} -> {}x{}",
                        key.kind, key.address, old.width, old.height, width, height
                    )
                });
                self.device.destroy_texture(old.texture);
            }
            let target = self.create(key, width, height)?;
            self.targets.insert((key, slot), target);
        }

        self.targets.get(&(key, slot)).ok_or_else(|| {
            RhiError::Backend(format!("render target 0x{:06X} missing", key.address))
        })
    }

    fn create(
        &self,
        key: RenderTargetKey,
        width: u32,
        height: u32,
    ) -> Result<RenderTarget, RhiError> {
        let scale = self.scale_for(width, height);
        let max = self.device.capabilities().max_texture_size;
        let exact_width = width as f32 * scale;
        let scaled_width = (exact_width.ceil() as u32).min(max);
        let scaled_height = ((height as f32 * scale).ceil() as u32).min(max);
        let samples = match key.kind {
            TargetKind::Color | TargetKind::Depth => self.config.samples.max(1),
            TargetKind::TileCopy | TargetKind::Present => 1,
        };
        let format = match key.kind {
            TargetKind::Depth => TextureFormat::Depth32,
            _ => TextureFormat::Rgba8,
        };

        let texture = self.device.create_texture(&TextureDesc {
            width: scaled_width,
            height: scaled_height,
            format,
            samples,
        })?;

        log(LogCategory::RenderTarget, LogLevel::Debug, || {
            format!(
                "Created {:?} target 0x{:06X} {}x{} at {:.2}x ({}x{}, {} samples)",
                key.kind, key.address, width, height, scale, scaled_width, scaled_height, samples
            )
        });

        Ok(RenderTarget {
            key,
            texture,
            width,
            height,
            scaled_width,
            scaled_height,
            resolution_scale: scale,
            downsample_multiplier: self.config.downsample_multiplier,
            misalign_x: (scaled_width as f32 - exact_width).max(0.0),
            samples,
        })
    }

    pub fn find(&self, key: &RenderTargetKey, slot: TargetSlot) -> Option<&RenderTarget> {
        self.targets.get(&(*key, slot))
    }

    /// Color or depth target at `address` in `slot`, preferring `kind`.
    pub fn find_by_address(
        &self,
        address: u32,
        kind: TargetKind,
        slot: TargetSlot,
    ) -> Option<&RenderTarget> {
        let mut fallback = None;
        for ((key, target_slot), target) in &self.targets {
            if key.address != address || *target_slot != slot {
                continue;
            }
            if key.kind == kind {
                return Some(target);
            }
            if matches!(key.kind, TargetKind::Color | TargetKind::Depth) {
                fallback = Some(target);
            }
        }
        fallback
    }

    /// Apply a new configuration. Returns true when existing targets were
    /// destroyed because samples or scale changed.
    pub fn set_config(&mut self, config: RenderTargetConfig) -> bool {
        if config == self.config {
            return false;
        }
        let previous = self.config;
        self.config = config;
        log(LogCategory::RenderTarget, LogLevel::Info, || {
            format!(
                "Render target config {:?} -> {:?}, recreating targets",
                previous, config
            )
        });
        self.destroy_all();
        true
    }

    pub fn destroy_all(&mut self) {
        for (_, target) in self.targets.drain() {
            self.device.destroy_texture(target.texture);
        }
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

impl Drop for RenderTargetManager {
    fn drop(&mut self) {
        self.destroy_all();
    }
}
