//! Present queue and present thread
//!
//! Every VI update becomes a [`Present`]. The present thread waits for the
//! workload the present depends on, works out which texture shows the VI
//! framebuffer, hands it to the swap chain and paces output when frames are
//! interpolated.
//!
//! The first present of a workload shows all of its sub-frames in order,
//! sleeping between them so they are spread over the original frame period.
//! Later presents of the same workload show its final image once.

use crate::fb_ops::{record_operations, FramebufferOperation};
use crate::framebuffer::WriteType;
use crate::render_target::{RenderTargetKey, TargetKind, TargetSlot};
use crate::rhi::{GpuCommand, RenderDevice, SwapChain, TextureId};
use crate::ring::SlotRing;
use crate::shared::{PanicGuard, PipelineStats, SharedQueueResources};
use crate::vi::ScreenVi;
use crate::{lock, HleError};
use hle_core::graphics::PixelSize;
use hle_core::logging::{log, LogCategory, LogLevel};
use hle_core::types::FixedRect;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// One presentation request.
#[derive(Debug, Clone, Default)]
pub struct Present {
    pub present_id: u64,
    pub screen_vi: ScreenVi,
    /// Workload that must be rendered before this present is shown
    pub workload_id: u64,
    /// RAM uploads for the displayed framebuffer
    pub fb_operations: Vec<FramebufferOperation>,
    /// VI framebuffer bytes when no render target backs it
    pub storage: Vec<u8>,
    /// Show the previous image again
    pub repeat: bool,
}

/// Time to sleep after showing a sub-frame so that frames are spaced at
/// `target` Hz. `elapsed` is the time spent on the frame so far.
///
/// Sleeps are whole milliseconds, 500us short of the period, and always
/// leave at least 1ms of slack. Returns `None` when no pacing applies.
pub fn pacing_delay(target: u32, original: u32, elapsed: Duration) -> Option<Duration> {
    if target == 0 || target <= original {
        return None;
    }
    let period = 1_000_000 / target as i64;
    let elapsed = elapsed.as_micros().min(i64::MAX as u128) as i64;
    let remaining = period - elapsed - 500;
    if remaining < 1000 {
        return None;
    }
    let mut sleep_ms = remaining / 1000;
    while sleep_ms > 0 && period - elapsed - sleep_ms * 1000 < 1000 {
        sleep_ms -= 1;
    }
    (sleep_ms >= 1).then(|| Duration::from_millis(sleep_ms as u64))
}

pub struct PresentQueue {
    ring: Arc<SlotRing<Present>>,
    shared: Arc<SharedQueueResources>,
    thread: Option<JoinHandle<()>>,
}

impl PresentQueue {
    pub fn new(
        shared: Arc<SharedQueueResources>,
        device: Arc<dyn RenderDevice>,
        swap_chain: Box<dyn SwapChain>,
        ring_size: usize,
    ) -> Result<Self, HleError> {
        let ring = Arc::new(SlotRing::new(ring_size));
        let present_thread = PresentThread {
            ring: Arc::clone(&ring),
            shared: Arc::clone(&shared),
            device,
            swap_chain,
            last_workload_id: 0,
        };
        let thread = thread::Builder::new()
            .name("present".to_string())
            .spawn(move || present_thread.run())?;

        Ok(Self {
            ring,
            shared,
            thread: Some(thread),
        })
    }

    /// Fill the producer's current present slot.
    pub fn with_current<R>(&self, f: impl FnOnce(&mut Present) -> R) -> R {
        f(&mut self.ring.current())
    }

    pub fn advance_to_next_present(&self) -> Result<(), HleError> {
        self.ring.advance().map(|_| ())
    }

    /// Queue a present that shows the last presented image again.
    ///
    /// With skip buffering the last image can be a live color target rather
    /// than a scratch copy. A workload rendered into that framebuffer since
    /// then shows through the repeat, the same way the VI would scan it out
    /// of RAM.
    pub fn repeat_last_present(&self, present_id: u64, workload_id: u64) -> Result<(), HleError> {
        self.with_current(|present| {
            *present = Present {
                present_id,
                workload_id,
                repeat: true,
                ..Present::default()
            };
        });
        self.advance_to_next_present()
    }

    pub fn wait_for_present_id(&self, id: u64) -> bool {
        self.shared.present_id.wait_for(id)
    }

    pub fn stop(&mut self) {
        self.ring.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log(LogCategory::Present, LogLevel::Error, || {
                    "Present thread panicked".to_string()
                });
            }
        }
    }
}

impl Drop for PresentQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

struct PresentThread {
    ring: Arc<SlotRing<Present>>,
    shared: Arc<SharedQueueResources>,
    device: Arc<dyn RenderDevice>,
    swap_chain: Box<dyn SwapChain>,
    last_workload_id: u64,
}

impl PresentThread {
    fn run(mut self) {
        let _guard = PanicGuard::new(Arc::clone(&self.shared), Arc::clone(&self.ring), "Present");
        log(LogCategory::Present, LogLevel::Debug, || {
            "Present thread started".to_string()
        });

        while let Some(index) = self.ring.claim() {
            let present = std::mem::take(&mut *self.ring.slot(index));

            if !self.shared.workload_id.wait_for(present.workload_id) {
                break;
            }

            let mut swap_chain_valid = self.swap_chain.resize_if_needed();
            self.shared
                .display_rate
                .store(self.swap_chain.refresh_rate(), Ordering::Relaxed);

            if let Err(e) = self.thread_present(&present, &mut swap_chain_valid) {
                log(LogCategory::Present, LogLevel::Error, || {
                    format!("Present {} failed: {}", present.present_id, e)
                });
                self.shared.fail(e);
                break;
            }

            PipelineStats::add(&self.shared.stats.presents_processed, 1);
            // Advance even when nothing was shown so the producer never stalls.
            self.shared.present_id.advance_to(present.present_id);
            self.ring.finish(index);
            self.ring.release_through(index);
        }

        self.ring.stop();
        log(LogCategory::Present, LogLevel::Debug, || {
            "Present thread stopped".to_string()
        });
    }

    fn thread_present(
        &mut self,
        present: &Present,
        swap_chain_valid: &mut bool,
    ) -> Result<(), HleError> {
        if present.repeat {
            let last = self.shared.manager().last_presented;
            if let Some((texture, rect)) = last {
                self.show(texture, rect, swap_chain_valid);
            }
            return Ok(());
        }

        if !present.fb_operations.is_empty() {
            self.apply_operations(&present.fb_operations)?;
        }

        let screen = present.screen_vi;
        if !screen.visible() {
            log(LogCategory::Present, LogLevel::Trace, || {
                format!("Present {} has a blank screen", present.present_id)
            });
            PipelineStats::add(&self.shared.stats.presents_skipped, 1);
            return Ok(());
        }

        let first = present.workload_id != self.last_workload_id;
        self.last_workload_id = present.workload_id;

        let (planned, original, target) = {
            let state = self.shared.interpolated();
            if state.workload_id == present.workload_id {
                (state.planned.max(1), state.original_rate, state.target_rate)
            } else {
                (1, 0, 0)
            }
        };
        let frames_to_present = if first { planned } else { 1 };

        for index in 0..frames_to_present {
            let start = Instant::now();
            let slot = if present.workload_id == 0 {
                TargetSlot::Main
            } else if !first {
                self.shared.wait_for_completion(present.workload_id);
                TargetSlot::Main
            } else {
                match self.shared.wait_for_sub_frame(present.workload_id, index) {
                    Some(slot) => slot,
                    None if index == 0 => TargetSlot::Main,
                    // Skipped by the render thread
                    None => break,
                }
            };

            let shown = self.compose(&screen, slot, present)?;
            if let TargetSlot::Override(_) = slot {
                self.shared
                    .update_interpolated(|state| state.in_flight = state.in_flight.saturating_sub(1));
            }
            match shown {
                Some((texture, rect)) => self.show(texture, rect, swap_chain_valid),
                None => log(LogCategory::Present, LogLevel::Debug, || {
                    format!(
                        "Nothing to present for VI framebuffer 0x{:06X}",
                        screen.fb_address()
                    )
                }),
            }

            if frames_to_present > 1 {
                if let Some(delay) = pacing_delay(target, original, start.elapsed()) {
                    thread::sleep(delay);
                }
            }
        }

        Ok(())
    }

    fn show(&mut self, texture: TextureId, rect: FixedRect, swap_chain_valid: &mut bool) {
        self.shared.manager().last_presented = Some((texture, rect));
        if !*swap_chain_valid {
            PipelineStats::add(&self.shared.stats.presents_skipped, 1);
            return;
        }
        match self.swap_chain.present(texture, rect) {
            Ok(()) => PipelineStats::add(&self.shared.stats.frames_presented, 1),
            Err(e) => {
                log(LogCategory::Present, LogLevel::Warn, || {
                    format!("Swap chain present failed: {}", e)
                });
                *swap_chain_valid = false;
            }
        }
    }

    /// Upload RAM changes to the displayed framebuffer's targets.
    fn apply_operations(&self, ops: &[FramebufferOperation]) -> Result<(), HleError> {
        let _gpu = lock(&self.shared.workload);
        let mut manager = self.shared.manager();
        let mut commands = Vec::new();
        record_operations(ops, &mut manager.targets, TargetSlot::Main, &mut commands)?;
        let mut uploads = 0;
        for op in ops {
            if let FramebufferOperation::WriteChanges { write_type, change } = op {
                manager.written_as.insert(change.address, *write_type);
                uploads += 1;
            }
        }
        drop(manager);
        self.device.submit(&commands)?;
        PipelineStats::add(&self.shared.stats.uploads, uploads);
        Ok(())
    }

    /// Resolve the texture showing the VI framebuffer for `slot`.
    fn compose(
        &self,
        screen: &ScreenVi,
        slot: TargetSlot,
        present: &Present,
    ) -> Result<Option<(TextureId, FixedRect)>, HleError> {
        let address = screen.fb_address();
        let width = screen.fb_visible_width();
        let height = screen.fb_height();
        let rect = FixedRect::new(0, 0, width as i32, height as i32);
        let skip_buffering = self.shared.configuration().user.skip_buffering;
        let scratch_key = RenderTargetKey::new(0, 0, PixelSize::Bits32, TargetKind::Present);

        let _gpu = lock(&self.shared.workload);
        let mut manager = self.shared.manager();
        let seen_before = manager.vi_history.contains(&address);
        manager.push_vi_history(address);

        let written_as_depth = manager.written_as.get(&address) == Some(&WriteType::Depth);
        let live_kind = if written_as_depth {
            TargetKind::Depth
        } else {
            TargetKind::Color
        };
        let live = manager
            .targets
            .find_by_address(address, live_kind, slot)
            .or_else(|| {
                manager
                    .targets
                    .find_by_address(address, live_kind, TargetSlot::Main)
            })
            .map(|target| (target.texture, target.key.kind));

        let command = match live {
            Some((texture, TargetKind::Color)) if skip_buffering && seen_before => {
                return Ok(Some((texture, rect)));
            }
            Some((texture, kind)) => GpuCommand::CopyTexture {
                src: texture,
                dst: TextureId(0),
                rect,
                reinterpret: kind == TargetKind::Depth,
            },
            None if !present.storage.is_empty() => GpuCommand::UploadTexture {
                target: TextureId(0),
                rect,
                siz: screen.fb_size().unwrap_or(PixelSize::Bits16),
                data: present.storage.clone(),
            },
            None => return Ok(None),
        };

        let scratch = manager
            .targets
            .get(scratch_key, TargetSlot::Main, width, height)?
            .texture;
        let command = match command {
            GpuCommand::CopyTexture {
                src,
                rect,
                reinterpret,
                ..
            } => GpuCommand::CopyTexture {
                src,
                dst: scratch,
                rect,
                reinterpret,
            },
            GpuCommand::UploadTexture { rect, siz, data, .. } => GpuCommand::UploadTexture {
                target: scratch,
                rect,
                siz,
                data,
            },
            other => other,
        };
        drop(manager);
        self.device.submit(&[command])?;
        Ok(Some((scratch, rect)))
    }
}
