//! Render hardware interface - capability traits consumed by the pipeline
//!
//! The pipeline never talks to D3D12, Vulkan or Metal directly. The host
//! hands in a [`RenderBackend`] that creates a [`RenderDevice`] and a
//! [`SwapChain`]; the render and present threads then describe their work as
//! [`GpuCommand`] lists and submit them through the device.
//!
//! # Architecture
//!
//! ```text
//! WorkloadQueue / PresentQueue -> GpuCommand lists -> RenderDevice::submit
//! PresentQueue                 -> SwapChain::present
//! ```
//!
//! The [`recording`] module provides a software implementation that records
//! everything it is given; tests and the headless CLI run on it.

pub mod recording;

use crate::workload::Matrix4;
use hle_core::graphics::PixelSize;
use hle_core::types::FixedRect;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RhiError {
    #[error("Out of GPU memory creating {width}x{height} texture")]
    OutOfMemory { width: u32, height: u32 },
    #[error("Unknown texture handle {0:?}")]
    InvalidTexture(TextureId),
    #[error("Device lost")]
    DeviceLost,
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Graphics APIs a backend may offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GraphicsApi {
    D3D12,
    Vulkan,
    Metal,
}

impl GraphicsApi {
    /// Preferred API for the host platform.
    pub fn platform_default() -> Self {
        if cfg!(target_os = "windows") {
            GraphicsApi::D3D12
        } else if cfg!(target_os = "macos") {
            GraphicsApi::Metal
        } else {
            GraphicsApi::Vulkan
        }
    }
}

/// Opaque texture handle owned by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TextureId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextureFormat {
    Rgba8,
    Depth32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub samples: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub max_texture_size: u32,
    pub max_samples: u32,
    pub raytracing: bool,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            max_texture_size: 16384,
            max_samples: 8,
            raytracing: false,
        }
    }
}

/// Texture bound by a draw call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TextureBinding {
    /// Render target region copied on the GPU
    TileCopy(TextureId),
    /// Texture decoded from TMEM, identified by its content hash
    Tmem { hash: u32 },
}

/// One unit of recorded GPU work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GpuCommand {
    /// Upload native-resolution RDRAM pixels into `rect` of the target.
    UploadTexture {
        target: TextureId,
        rect: FixedRect,
        siz: PixelSize,
        data: Vec<u8>,
    },
    /// Copy `rect` (native coordinates) from `src` into the origin of `dst`.
    /// `reinterpret` converts between color and depth encodings.
    CopyTexture {
        src: TextureId,
        dst: TextureId,
        rect: FixedRect,
        reinterpret: bool,
    },
    /// Make prior writes to `texture` visible to later reads.
    Barrier { texture: TextureId },
    Draw {
        color: TextureId,
        depth: Option<TextureId>,
        vertex_count: u32,
        projection: Matrix4,
        transform: Matrix4,
        texture: Option<TextureBinding>,
        tile_scroll: [f32; 2],
        scissor: FixedRect,
        resolution_scale: f32,
        misalign_x: f32,
    },
}

/// GPU device capability interface.
pub trait RenderDevice: Send + Sync {
    fn capabilities(&self) -> DeviceCapabilities;

    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureId, RhiError>;

    fn destroy_texture(&self, texture: TextureId);

    /// Record and execute a command list. Commands execute in order.
    fn submit(&self, commands: &[GpuCommand]) -> Result<(), RhiError>;

    /// Trivial compute dispatch used to keep the GPU clocked up.
    fn dispatch_idle(&self);

    /// Name of this device (for debugging/UI)
    fn name(&self) -> &str;
}

/// Platform window presentation capability.
pub trait SwapChain: Send {
    /// Resize the back buffers if the window changed. Returns false when the
    /// swap chain cannot be presented to this cycle.
    fn resize_if_needed(&mut self) -> bool;

    /// Show `rect` (native coordinates) of `texture`.
    fn present(&mut self, texture: TextureId, rect: FixedRect) -> Result<(), RhiError>;

    /// Refresh rate of the display the window is on, in Hz.
    fn refresh_rate(&self) -> u32;

    fn size(&self) -> (u32, u32);
}

/// Factory for devices and swap chains, implemented by the host.
pub trait RenderBackend {
    fn supports(&self, api: GraphicsApi) -> bool;

    fn create_device(&self, api: GraphicsApi) -> Result<Arc<dyn RenderDevice>, RhiError>;

    fn create_swap_chain(
        &self,
        device: &Arc<dyn RenderDevice>,
    ) -> Result<Box<dyn SwapChain>, RhiError>;
}
