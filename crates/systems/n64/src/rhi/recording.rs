//! Recording backend
//!
//! A software [`RenderBackend`] that keeps every texture description,
//! submitted command list and presented frame in memory instead of driving a
//! GPU. It backs the integration tests and the headless `hle-pace` harness,
//! and can be told to fail texture or swap-chain creation to exercise error
//! paths.

use super::{
    DeviceCapabilities, GpuCommand, GraphicsApi, RenderBackend, RenderDevice, RhiError, SwapChain,
    TextureDesc, TextureId,
};
use hle_core::types::FixedRect;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct DeviceState {
    textures: HashMap<TextureId, TextureDesc>,
    submissions: Vec<Vec<GpuCommand>>,
    destroyed: usize,
}

/// Device that records instead of rendering.
pub struct RecordingDevice {
    capabilities: DeviceCapabilities,
    next_texture: AtomicU64,
    idle_dispatches: AtomicUsize,
    /// Remaining texture creations before failures start; `u64::MAX` = never fail
    texture_budget: AtomicU64,
    /// Simulated GPU time per submission, in microseconds
    submit_delay_us: AtomicU64,
    state: Mutex<DeviceState>,
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self::with_capabilities(DeviceCapabilities::default())
    }

    pub fn with_capabilities(capabilities: DeviceCapabilities) -> Self {
        Self {
            capabilities,
            next_texture: AtomicU64::new(1),
            idle_dispatches: AtomicUsize::new(0),
            texture_budget: AtomicU64::new(u64::MAX),
            submit_delay_us: AtomicU64::new(0),
            state: Mutex::new(DeviceState::default()),
        }
    }

    /// Make texture creation fail after `count` more successful creations.
    pub fn fail_textures_after(&self, count: u64) {
        self.texture_budget.store(count, Ordering::SeqCst);
    }

    /// Make every submission take at least `delay`.
    pub fn set_submit_delay(&self, delay: Duration) {
        self.submit_delay_us
            .store(delay.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn submissions(&self) -> Vec<Vec<GpuCommand>> {
        lock(&self.state).submissions.clone()
    }

    /// All submitted commands, flattened in submission order.
    pub fn commands(&self) -> Vec<GpuCommand> {
        lock(&self.state)
            .submissions
            .iter()
            .flat_map(|list| list.iter().cloned())
            .collect()
    }

    pub fn clear_submissions(&self) {
        lock(&self.state).submissions.clear();
    }

    pub fn live_textures(&self) -> usize {
        lock(&self.state).textures.len()
    }

    pub fn destroyed_textures(&self) -> usize {
        lock(&self.state).destroyed
    }

    pub fn texture_desc(&self, texture: TextureId) -> Option<TextureDesc> {
        lock(&self.state).textures.get(&texture).copied()
    }

    pub fn idle_dispatches(&self) -> usize {
        self.idle_dispatches.load(Ordering::Relaxed)
    }

    fn check_texture(state: &DeviceState, texture: TextureId) -> Result<(), RhiError> {
        if state.textures.contains_key(&texture) {
            Ok(())
        } else {
            Err(RhiError::InvalidTexture(texture))
        }
    }
}

impl Default for RecordingDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderDevice for RecordingDevice {
    fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureId, RhiError> {
        let budget = self.texture_budget.load(Ordering::SeqCst);
        if budget == 0 {
            return Err(RhiError::OutOfMemory {
                width: desc.width,
                height: desc.height,
            });
        }
        if budget != u64::MAX {
            self.texture_budget.store(budget - 1, Ordering::SeqCst);
        }
        if desc.width > self.capabilities.max_texture_size
            || desc.height > self.capabilities.max_texture_size
        {
            return Err(RhiError::OutOfMemory {
                width: desc.width,
                height: desc.height,
            });
        }

        let id = TextureId(self.next_texture.fetch_add(1, Ordering::Relaxed));
        lock(&self.state).textures.insert(id, *desc);
        Ok(id)
    }

    fn destroy_texture(&self, texture: TextureId) {
        let mut state = lock(&self.state);
        if state.textures.remove(&texture).is_some() {
            state.destroyed += 1;
        }
    }

    fn submit(&self, commands: &[GpuCommand]) -> Result<(), RhiError> {
        let delay = self.submit_delay_us.load(Ordering::Relaxed);
        if delay > 0 {
            thread::sleep(Duration::from_micros(delay));
        }
        let mut state = lock(&self.state);
        for command in commands {
            match command {
                GpuCommand::UploadTexture { target, .. } => Self::check_texture(&state, *target)?,
                GpuCommand::CopyTexture { src, dst, .. } => {
                    Self::check_texture(&state, *src)?;
                    Self::check_texture(&state, *dst)?;
                }
                GpuCommand::Barrier { texture } => Self::check_texture(&state, *texture)?,
                GpuCommand::Draw { color, depth, .. } => {
                    Self::check_texture(&state, *color)?;
                    if let Some(depth) = depth {
                        Self::check_texture(&state, *depth)?;
                    }
                }
            }
        }
        state.submissions.push(commands.to_vec());
        Ok(())
    }

    fn dispatch_idle(&self) {
        self.idle_dispatches.fetch_add(1, Ordering::Relaxed);
    }

    fn name(&self) -> &str {
        "Recording Device"
    }
}

/// One frame shown by a [`RecordingSwapChain`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PresentRecord {
    pub texture: TextureId,
    pub rect: FixedRect,
    pub at: Instant,
}

/// Shared view of what a recording swap chain presented.
#[derive(Clone, Default)]
pub struct PresentLog {
    records: Arc<Mutex<Vec<PresentRecord>>>,
    valid: Arc<AtomicBool>,
    refresh_rate: Arc<AtomicU32>,
}

impl PresentLog {
    pub fn new(refresh_rate: u32) -> Self {
        Self {
            records: Arc::new(Mutex::new(Vec::new())),
            valid: Arc::new(AtomicBool::new(true)),
            refresh_rate: Arc::new(AtomicU32::new(refresh_rate)),
        }
    }

    pub fn records(&self) -> Vec<PresentRecord> {
        lock(&self.records).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Simulate the window becoming unpresentable (minimized, device lost).
    pub fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::SeqCst);
    }

    pub fn set_refresh_rate(&self, rate: u32) {
        self.refresh_rate.store(rate, Ordering::Relaxed);
    }
}

pub struct RecordingSwapChain {
    log: PresentLog,
    size: (u32, u32),
}

impl RecordingSwapChain {
    pub fn new(log: PresentLog, size: (u32, u32)) -> Self {
        Self { log, size }
    }
}

impl SwapChain for RecordingSwapChain {
    fn resize_if_needed(&mut self) -> bool {
        self.log.valid.load(Ordering::SeqCst)
    }

    fn present(&mut self, texture: TextureId, rect: FixedRect) -> Result<(), RhiError> {
        lock(&self.log.records).push(PresentRecord {
            texture,
            rect,
            at: Instant::now(),
        });
        Ok(())
    }

    fn refresh_rate(&self) -> u32 {
        self.log.refresh_rate.load(Ordering::Relaxed)
    }

    fn size(&self) -> (u32, u32) {
        self.size
    }
}

/// Backend handing out one shared [`RecordingDevice`].
pub struct RecordingBackend {
    device: Arc<RecordingDevice>,
    present_log: PresentLog,
    apis: Vec<GraphicsApi>,
    window_size: (u32, u32),
    fail_device: bool,
    fail_swap_chain: bool,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self {
            device: Arc::new(RecordingDevice::new()),
            present_log: PresentLog::new(60),
            apis: vec![GraphicsApi::D3D12, GraphicsApi::Vulkan, GraphicsApi::Metal],
            window_size: (640, 480),
            fail_device: false,
            fail_swap_chain: false,
        }
    }

    pub fn with_device(mut self, device: RecordingDevice) -> Self {
        self.device = Arc::new(device);
        self
    }

    pub fn with_apis(mut self, apis: &[GraphicsApi]) -> Self {
        self.apis = apis.to_vec();
        self
    }

    pub fn with_refresh_rate(self, rate: u32) -> Self {
        self.present_log.set_refresh_rate(rate);
        self
    }

    pub fn with_window_size(mut self, width: u32, height: u32) -> Self {
        self.window_size = (width, height);
        self
    }

    pub fn failing_device(mut self) -> Self {
        self.fail_device = true;
        self
    }

    pub fn failing_swap_chain(mut self) -> Self {
        self.fail_swap_chain = true;
        self
    }

    pub fn device(&self) -> Arc<RecordingDevice> {
        Arc::clone(&self.device)
    }

    pub fn present_log(&self) -> PresentLog {
        self.present_log.clone()
    }
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderBackend for RecordingBackend {
    fn supports(&self, api: GraphicsApi) -> bool {
        self.apis.contains(&api)
    }

    fn create_device(&self, _api: GraphicsApi) -> Result<Arc<dyn RenderDevice>, RhiError> {
        if self.fail_device {
            return Err(RhiError::Backend("adapter enumeration failed".to_string()));
        }
        let device: Arc<dyn RenderDevice> = self.device.clone();
        Ok(device)
    }

    fn create_swap_chain(
        &self,
        _device: &Arc<dyn RenderDevice>,
    ) -> Result<Box<dyn SwapChain>, RhiError> {
        if self.fail_swap_chain {
            return Err(RhiError::Backend("surface creation failed".to_string()));
        }
        Ok(Box::new(RecordingSwapChain::new(
            self.present_log.clone(),
            self.window_size,
        )))
    }
}
