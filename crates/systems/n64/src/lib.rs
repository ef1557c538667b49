//! N64 high-level graphics pipeline.
//!
//! Receives display-list workloads from the emulated RSP, renders them on a
//! host GPU through the [`rhi`] traits and presents the result at the display
//! refresh rate, interpolating intermediate frames when the game runs slower
//! than the target rate.
//!
//! - **Producer**: the emulation thread, driving [`ApplicationContext`]
//! - **Render thread**: consumes workloads and renders their sub-frames
//! - **Present thread**: consumes VI presents and drives the swap chain
//! - **Idle thread**: dispatches background GPU work while nothing renders
//!
//! Work moves between threads through bounded slot rings. Progress is
//! published as monotonically increasing workload and present ids.

#![allow(clippy::upper_case_acronyms)]

pub mod config;
pub mod context;
pub mod fb_ops;
pub mod framebuffer;
pub mod interpolation;
pub mod present_queue;
pub mod render_target;
pub mod rhi;
pub mod ring;
pub mod shared;
pub mod tile;
pub mod vi;
pub mod workload;
pub mod workload_queue;

use rhi::{GraphicsApi, RhiError};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

pub use config::{RefreshRateMode, ResolutionMode, UserConfiguration};
pub use context::ApplicationContext;
pub use present_queue::pacing_delay;
pub use shared::{FrameRecord, PipelineStats};
pub use vi::{ScreenVi, VideoInterface};
pub use workload::Workload;

#[derive(Error, Debug)]
pub enum HleError {
    #[error("Graphics API {0:?} is not supported by this backend")]
    UnsupportedGraphicsApi(GraphicsApi),
    #[error("Device creation failed: {0}")]
    DeviceCreationFailed(RhiError),
    #[error("Swap chain creation failed: {0}")]
    SwapChainCreationFailed(RhiError),
    #[error("Resource creation failed: {0}")]
    ResourceCreationFailed(#[from] RhiError),
    #[error("Queue stopped")]
    QueueStopped,
    #[error("{0} thread panicked")]
    WorkerPanicked(&'static str),
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Lock `mutex`, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
