//! Application context
//!
//! [`ApplicationContext`] owns the device, the shared resources and both
//! queues. The emulation thread is the single producer: it fills the current
//! workload through [`ApplicationContext::with_current_workload`], submits it,
//! and reports every VI update with [`ApplicationContext::submit_present`].

use crate::config::UserConfiguration;
use crate::fb_ops::{full_sync, FramebufferOperation};
use crate::framebuffer::{FramebufferTable, WriteType};
use crate::present_queue::{Present, PresentQueue};
use crate::render_target::{RenderTargetConfig, RenderTargetManager};
use crate::rhi::{RenderBackend, RenderDevice};
use crate::shared::{PipelineStats, SharedConfiguration, SharedQueueResources};
use crate::vi::ScreenVi;
use crate::workload::Workload;
use crate::workload_queue::WorkloadQueue;
use crate::{lock, HleError};
use hle_core::logging::{log, LogCategory, LogLevel};
use std::sync::{Arc, Mutex};

/// Producer-side bookkeeping.
struct ProducerState {
    table: FramebufferTable,
    next_workload_id: u64,
    next_present_id: u64,
    last_workload_id: u64,
    last_present_id: u64,
    paused: bool,
}

pub struct ApplicationContext {
    device: Arc<dyn RenderDevice>,
    shared: Arc<SharedQueueResources>,
    workload_queue: WorkloadQueue,
    present_queue: PresentQueue,
    producer: Mutex<ProducerState>,
}

impl ApplicationContext {
    /// Create the device and swap chain on `backend` and start the worker
    /// threads.
    pub fn new(backend: &dyn RenderBackend, config: UserConfiguration) -> Result<Self, HleError> {
        config.validate()?;

        let api = config.graphics_api();
        if !backend.supports(api) {
            return Err(HleError::UnsupportedGraphicsApi(api));
        }
        let device = backend
            .create_device(api)
            .map_err(HleError::DeviceCreationFailed)?;
        config.validate_for(&device.capabilities())?;
        let swap_chain = backend
            .create_swap_chain(&device)
            .map_err(HleError::SwapChainCreationFailed)?;

        let window_size = swap_chain.size();
        let display_rate = swap_chain.refresh_rate();
        log(LogCategory::Gpu, LogLevel::Info, || {
            format!(
                "Using {} ({:?}), window {}x{} at {}Hz",
                device.name(),
                api,
                window_size.0,
                window_size.1,
                display_rate
            )
        });

        let targets =
            RenderTargetManager::new(Arc::clone(&device), config.render_target_config(window_size.1));
        let workload_ring = config.workload_ring_size;
        let present_ring = config.present_ring_size;
        let shared = Arc::new(SharedQueueResources::new(
            config,
            window_size,
            targets,
            display_rate,
        ));

        let present_queue = PresentQueue::new(
            Arc::clone(&shared),
            Arc::clone(&device),
            swap_chain,
            present_ring,
        )?;
        let workload_queue = WorkloadQueue::new(Arc::clone(&shared), Arc::clone(&device), workload_ring)?;

        Ok(Self {
            device,
            shared,
            workload_queue,
            present_queue,
            producer: Mutex::new(ProducerState {
                table: FramebufferTable::new(),
                next_workload_id: 1,
                next_present_id: 1,
                last_workload_id: 0,
                last_present_id: 0,
                paused: false,
            }),
        })
    }

    fn stopped_error(&self) -> HleError {
        self.shared.take_error().unwrap_or(HleError::QueueStopped)
    }

    fn check_running(&self) -> Result<(), HleError> {
        if self.shared.is_running() {
            Ok(())
        } else {
            Err(self.stopped_error())
        }
    }

    /// Run `f` on the workload being recorded.
    pub fn with_current_workload<R>(&self, f: impl FnOnce(&mut Workload) -> R) -> R {
        f(&mut self.workload_queue.current())
    }

    /// Synchronize the current workload against `rdram` and hand it to the
    /// render thread. Returns its workload id.
    pub fn submit_workload(&self, rdram: &[u8], original_rate: u32) -> Result<u64, HleError> {
        self.check_running()?;
        let mut guard = lock(&self.producer);
        let producer = &mut *guard;

        let workload_id = producer.next_workload_id;
        let sync = {
            let mut workload = self.workload_queue.current();
            workload.workload_id = workload_id;
            workload.present_id = producer.last_present_id;
            workload.paused = producer.paused;
            workload.submission_frame = producer.next_present_id - 1;
            workload.vi_original_rate = original_rate;
            full_sync(&mut workload, &mut producer.table, rdram)
        };
        PipelineStats::add(&self.shared.stats.uploads, sync.uploads as u64);

        self.workload_queue
            .advance_to_next_workload()
            .map_err(|_| self.stopped_error())?;
        producer.next_workload_id += 1;
        producer.last_workload_id = workload_id;
        Ok(workload_id)
    }

    /// Queue a VI update. Returns its present id.
    pub fn submit_present(&self, screen_vi: ScreenVi, rdram: &[u8]) -> Result<u64, HleError> {
        self.check_running()?;
        let mut guard = lock(&self.producer);
        let producer = &mut *guard;

        let present_id = producer.next_present_id;
        let mut fb_operations = Vec::new();
        let mut storage = Vec::new();
        if screen_vi.visible() {
            let address = screen_vi.fb_address();
            if producer.table.find(address).is_some() {
                if let Some(change) = producer.table.check_rdram(address, rdram) {
                    fb_operations.push(FramebufferOperation::WriteChanges {
                        write_type: WriteType::Color,
                        change,
                    });
                }
            } else {
                let start = (address as usize).min(rdram.len());
                let end = (start + screen_vi.fb_byte_count() as usize).min(rdram.len());
                storage.extend_from_slice(&rdram[start..end]);
            }
        }

        let workload_id = producer.last_workload_id;
        self.present_queue.with_current(|present| {
            *present = Present {
                present_id,
                screen_vi,
                workload_id,
                fb_operations,
                storage,
                repeat: false,
            };
        });
        self.present_queue
            .advance_to_next_present()
            .map_err(|_| self.stopped_error())?;
        producer.next_present_id += 1;
        producer.last_present_id = present_id;
        Ok(present_id)
    }

    /// Show the last presented image again. Returns the present id.
    pub fn repeat_last_present(&self) -> Result<u64, HleError> {
        self.check_running()?;
        let mut producer = lock(&self.producer);
        let present_id = producer.next_present_id;
        self.present_queue
            .repeat_last_present(present_id, producer.last_workload_id)
            .map_err(|_| self.stopped_error())?;
        producer.next_present_id += 1;
        producer.last_present_id = present_id;
        Ok(present_id)
    }

    /// Mark following workloads as paused: they are shown without
    /// interpolation and keep their ring slot until a later workload renders.
    pub fn set_paused(&self, paused: bool) {
        lock(&self.producer).paused = paused;
    }

    /// Forget every tracked framebuffer, e.g. after a game reset.
    pub fn reset_framebuffers(&self) {
        lock(&self.producer).table.reset();
    }

    pub fn wait_for_workload_id(&self, id: u64) -> bool {
        self.workload_queue.wait_for_workload_id(id)
    }

    pub fn wait_for_present_id(&self, id: u64) -> bool {
        self.present_queue.wait_for_present_id(id)
    }

    /// Highest workload id the render thread published.
    pub fn workload_id(&self) -> u64 {
        self.shared.workload_id.get()
    }

    /// Highest present id the present thread finished.
    pub fn present_id(&self) -> u64 {
        self.shared.present_id.get()
    }

    pub fn configuration(&self) -> UserConfiguration {
        self.shared.configuration().user.clone()
    }

    fn render_target_config(&self) -> RenderTargetConfig {
        let configuration = self.shared.configuration();
        configuration
            .user
            .render_target_config(configuration.window_size.1)
    }

    /// Apply `update` to the shared configuration. When the render targets
    /// will be recreated, every framebuffer is forgotten so the next workload
    /// uploads RAM contents into the new targets again.
    fn reconfigure(&self, update: impl FnOnce(&mut SharedConfiguration)) {
        let mut producer = lock(&self.producer);
        let before = self.render_target_config();
        self.shared.update_configuration(update);
        if self.render_target_config() != before {
            log(LogCategory::RenderTarget, LogLevel::Info, || {
                "Render target configuration changed, resetting framebuffers".to_string()
            });
            producer.table.reset();
        }
    }

    /// Replace the user configuration. Render targets are recreated by the
    /// render thread before its next workload if scale or samples changed.
    pub fn update_configuration(&self, config: UserConfiguration) -> Result<(), HleError> {
        config.validate_for(&self.device.capabilities())?;
        self.reconfigure(|configuration| configuration.user = config);
        Ok(())
    }

    pub fn resize(&self, width: u32, height: u32) {
        self.reconfigure(|configuration| configuration.window_size = (width, height));
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.shared.stats
    }

    /// Fatal error raised by a worker thread, if any.
    pub fn take_error(&self) -> Option<HleError> {
        self.shared.take_error()
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn device(&self) -> &Arc<dyn RenderDevice> {
        &self.device
    }

    /// Stop and join all worker threads. Blocked producers return
    /// [`HleError::QueueStopped`].
    pub fn shutdown(&mut self) {
        self.shared.shutdown();
        self.workload_queue.stop();
        self.present_queue.stop();
    }
}

impl Drop for ApplicationContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
