//! Workload queue, render thread and idle thread
//!
//! The producer fills the current [`Workload`] slot and advances. The render
//! thread claims published workloads, plans their sub-frames through the
//! [`FrameMatcher`] and renders each one into its own target slot: the final
//! sub-frame goes to the main targets, intermediate ones to override slots
//! the present thread shows before the final image.
//!
//! When the producer is blocked on a full ring, intermediate sub-frames are
//! dropped so the render thread catches up. The final sub-frame is always
//! rendered.

use crate::fb_ops::{record_operations, tile_copy_key};
use crate::framebuffer::WriteType;
use crate::interpolation::{FrameMatcher, SubFrame};
use crate::render_target::{RenderTargetKey, TargetKind, TargetSlot};
use crate::rhi::{GpuCommand, RenderDevice, TextureBinding};
use crate::ring::SlotRing;
use crate::shared::{FrameRecord, ManagerState, PanicGuard, PipelineStats, SharedQueueResources};
use crate::workload::{Matrix4, Workload};
use crate::{lock, HleError};
use hle_core::graphics::PixelSize;
use hle_core::logging::{log, LogCategory, LogLevel};
use std::sync::atomic::Ordering;
use std::sync::{Arc, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Sleep between idle dispatches.
const IDLE_INTERVAL: Duration = Duration::from_millis(1);

/// Next sub-frame to render out of `count`, after `previous`. While the
/// producer is blocked, jumps straight to the final sub-frame.
pub fn sub_frame_after(previous: Option<usize>, count: usize, blocked: bool) -> Option<usize> {
    let candidate = previous.map_or(0, |p| p + 1);
    if candidate >= count {
        return None;
    }
    if blocked && candidate + 1 < count {
        return Some(count - 1);
    }
    Some(candidate)
}

pub struct WorkloadQueue {
    ring: Arc<SlotRing<Workload>>,
    shared: Arc<SharedQueueResources>,
    render_thread: Option<JoinHandle<()>>,
    idle_thread: Option<JoinHandle<()>>,
}

impl WorkloadQueue {
    pub fn new(
        shared: Arc<SharedQueueResources>,
        device: Arc<dyn RenderDevice>,
        ring_size: usize,
    ) -> Result<Self, HleError> {
        let ring = Arc::new(SlotRing::new(ring_size));

        let render = RenderThread {
            ring: Arc::clone(&ring),
            shared: Arc::clone(&shared),
            device: Arc::clone(&device),
            matcher: FrameMatcher::new(),
            revision: shared.configuration().revision,
        };
        let render_thread = thread::Builder::new()
            .name("render".to_string())
            .spawn(move || render.run())?;

        let idle_shared = Arc::clone(&shared);
        let idle_thread = thread::Builder::new()
            .name("idle".to_string())
            .spawn(move || idle_loop(idle_shared, device))?;

        Ok(Self {
            ring,
            shared,
            render_thread: Some(render_thread),
            idle_thread: Some(idle_thread),
        })
    }

    /// Lock the workload the producer is filling.
    pub fn current(&self) -> MutexGuard<'_, Workload> {
        self.ring.current()
    }

    /// Publish the current workload. Blocks while the ring is full.
    pub fn advance_to_next_workload(&self) -> Result<(), HleError> {
        self.ring.advance()?;
        self.ring.current().reset();
        Ok(())
    }

    pub fn wait_for_workload_id(&self, id: u64) -> bool {
        self.shared.workload_id.wait_for(id)
    }

    /// Published workloads the render thread has not finished.
    pub fn backlog(&self) -> usize {
        self.ring.backlog()
    }

    pub fn stop(&mut self) {
        self.ring.stop();
        for (name, handle) in [
            ("Render", self.render_thread.take()),
            ("Idle", self.idle_thread.take()),
        ] {
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    log(LogCategory::Workload, LogLevel::Error, || {
                        format!("{} thread panicked", name)
                    });
                }
            }
        }
    }
}

impl Drop for WorkloadQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn idle_loop(shared: Arc<SharedQueueResources>, device: Arc<dyn RenderDevice>) {
    while shared.is_running() {
        if shared.idle_active.load(Ordering::Relaxed) {
            // Never wait on the render thread's submissions.
            if let Ok(_gpu) = shared.workload.try_lock() {
                device.dispatch_idle();
            }
        }
        thread::sleep(IDLE_INTERVAL);
    }
}

struct RenderThread {
    ring: Arc<SlotRing<Workload>>,
    shared: Arc<SharedQueueResources>,
    device: Arc<dyn RenderDevice>,
    matcher: FrameMatcher,
    revision: u64,
}

impl RenderThread {
    fn run(mut self) {
        let _guard = PanicGuard::new(Arc::clone(&self.shared), Arc::clone(&self.ring), "Render");
        log(LogCategory::Workload, LogLevel::Debug, || {
            "Render thread started".to_string()
        });

        while let Some(index) = self.ring.claim() {
            let paused = match self.render_slot(index) {
                Ok(Some(paused)) => paused,
                Ok(None) => break,
                Err(e) => {
                    log(LogCategory::Gpu, LogLevel::Error, || {
                        format!("Rendering failed: {}", e)
                    });
                    self.shared.fail(e);
                    break;
                }
            };

            self.ring.finish(index);
            if paused {
                // Keep the paused workload's slot until a later one renders.
                let len = self.ring.len();
                self.ring.release_through((index + len - 1) % len);
            } else {
                self.ring.release_through(index);
            }
        }

        self.ring.stop();
        log(LogCategory::Workload, LogLevel::Debug, || {
            "Render thread stopped".to_string()
        });
    }

    /// Render the workload in slot `index`. Returns whether it was paused,
    /// or `None` once the pipeline stopped.
    fn render_slot(&mut self, index: usize) -> Result<Option<bool>, HleError> {
        let ring = Arc::clone(&self.ring);
        let workload = ring.slot(index);

        if !self.shared.present_id.wait_for(workload.present_id) {
            return Ok(None);
        }
        // Presents that could show the previous workload's sub-frames are all
        // done; sub-frames none of them showed (blank screen, superseded
        // workload) are no longer in flight.
        self.shared.update_interpolated(|state| {
            if state.in_flight > 0 {
                log(LogCategory::Interpolation, LogLevel::Trace, || {
                    format!(
                        "Workload {}: {} sub-frames never presented",
                        state.workload_id, state.in_flight
                    )
                });
                state.in_flight = 0;
            }
        });
        self.apply_configuration();

        let user = self.shared.configuration().user.clone();
        let original = workload.vi_original_rate;
        let display = self.shared.display_rate.load(Ordering::Relaxed);
        let target = user.target_rate(original, display);
        let plan = self.matcher.plan(&workload, target, user.frame_interpolation);
        let count = plan.len();
        let workload_id = workload.workload_id;

        self.shared
            .update_interpolated(|state| state.begin(workload_id, count, original, target));

        log(LogCategory::Interpolation, LogLevel::Trace, || {
            format!(
                "Workload {}: {} sub-frames at {}Hz -> {}Hz, gap {}",
                workload_id, count, original, target, plan.tick_gap
            )
        });

        let mut previous = None;
        let mut rendered = Vec::with_capacity(count);
        let mut skipped = 0usize;
        while let Some(sub_index) = sub_frame_after(previous, count, self.ring.producer_blocked()) {
            skipped += sub_index - previous.map_or(0, |p| p + 1);
            let sub_frame = plan.sub_frames[sub_index];
            let last = sub_index + 1 == count;
            let slot = if last {
                TargetSlot::Main
            } else {
                TargetSlot::Override(sub_index)
            };

            self.render_sub_frame(&workload, &sub_frame, slot)?;
            rendered.push(sub_frame);

            let any_skipped = skipped > 0;
            self.shared.update_interpolated(|state| {
                state.produced.push(slot);
                if last {
                    state.complete = true;
                    state.skipped = any_skipped;
                } else {
                    state.in_flight += 1;
                }
            });
            if rendered.len() == 1 {
                self.shared.workload_id.advance_to(workload_id);
            }
            previous = Some(sub_index);
        }

        if skipped > 0 {
            log(LogCategory::Interpolation, LogLevel::Debug, || {
                format!(
                    "Workload {}: producer blocked, skipped {} of {} sub-frames",
                    workload_id, skipped, count
                )
            });
        }

        let stats = &self.shared.stats;
        PipelineStats::add(&stats.workloads_rendered, 1);
        PipelineStats::add(&stats.sub_frames_rendered, rendered.len() as u64);
        PipelineStats::add(&stats.sub_frames_skipped, skipped as u64);
        stats.record_frame(FrameRecord {
            workload_id,
            sub_frames: rendered,
            skipped: skipped > 0,
            matched: plan.matched,
        });

        self.matcher.remember(&workload);
        Ok(Some(workload.paused))
    }

    /// Pick up configuration changes made since the last workload.
    fn apply_configuration(&mut self) {
        let (revision, user, window_size) = {
            let configuration = self.shared.configuration();
            (
                configuration.revision,
                configuration.user.clone(),
                configuration.window_size,
            )
        };
        if revision == self.revision {
            return;
        }
        self.revision = revision;

        if !user.frame_interpolation {
            self.matcher.reset();
        }

        let config = user.render_target_config(window_size.1);
        if self.shared.manager().targets.config() == config {
            return;
        }
        if !self.shared.drain_in_flight() {
            log(LogCategory::RenderTarget, LogLevel::Warn, || {
                "Timed out waiting for interpolated frames to present".to_string()
            });
        }
        let _gpu = lock(&self.shared.workload);
        let mut manager = self.shared.manager();
        if manager.targets.set_config(config) {
            manager.last_presented = None;
        }
    }

    fn render_sub_frame(
        &self,
        workload: &Workload,
        sub_frame: &SubFrame,
        slot: TargetSlot,
    ) -> Result<(), HleError> {
        let _gpu = lock(&self.shared.workload);
        let mut manager = self.shared.manager();
        let mut commands = Vec::new();

        for (pair_index, pair) in workload.fb_pairs.iter().enumerate() {
            record_operations(
                &pair.start_fb_operations,
                &mut manager.targets,
                slot,
                &mut commands,
            )?;

            if let Some(color) = pair.color_image.filter(|_| !pair.is_empty()) {
                let height = pair.draw_height();
                let color_key =
                    RenderTargetKey::new(color.address, color.width, color.siz, TargetKind::Color);
                let (color_texture, resolution_scale, misalign_x) = {
                    let target = manager.targets.get(color_key, slot, color.width, height)?;
                    (target.texture, target.resolution_scale, target.misalign_x)
                };
                let depth = match pair.depth_image {
                    Some(address) if !pair.draw_depth_rect.is_empty() => {
                        let key = RenderTargetKey::new(
                            address,
                            color.width,
                            PixelSize::Bits16,
                            TargetKind::Depth,
                        );
                        Some((address, manager.targets.get(key, slot, color.width, height)?.texture))
                    }
                    _ => None,
                };

                let blend = if pair.interpolate {
                    *sub_frame
                } else {
                    SubFrame::DIRECT
                };
                for game_call in &pair.game_calls {
                    let call = &workload.draw_data.calls[game_call.draw_call];
                    let transform = if call.transform < workload.draw_data.transforms.len() {
                        self.matcher.transform(workload, call.transform, &blend)
                    } else {
                        Matrix4::IDENTITY
                    };
                    commands.push(GpuCommand::Draw {
                        color: color_texture,
                        depth: depth.map(|(_, texture)| texture),
                        vertex_count: call.vertex_count,
                        projection: self.matcher.projection(
                            workload,
                            pair_index,
                            game_call.projection,
                            &blend,
                        ),
                        transform,
                        texture: texture_binding(workload, call.tile, &manager, slot),
                        tile_scroll: self.matcher.tile_scroll(workload, game_call.draw_call, &blend),
                        scissor: call.scissor,
                        resolution_scale,
                        misalign_x,
                    });
                }

                manager.written_as.insert(color.address, WriteType::Color);
                if let Some((address, _)) = depth {
                    manager.written_as.insert(address, WriteType::Depth);
                }
            }

            record_operations(
                &pair.end_fb_operations,
                &mut manager.targets,
                slot,
                &mut commands,
            )?;
        }

        drop(manager);
        self.device.submit(&commands)?;
        Ok(())
    }
}

/// Texture bound by a draw call sampling `tile`.
fn texture_binding(
    workload: &Workload,
    tile: Option<usize>,
    manager: &ManagerState,
    slot: TargetSlot,
) -> Option<TextureBinding> {
    let tile = tile?;
    match workload.draw_data.tile_copies.get(tile).copied().flatten() {
        Some(copy) => {
            let key = tile_copy_key(&copy);
            manager
                .targets
                .find(&key, slot)
                .or_else(|| manager.targets.find(&key, TargetSlot::Main))
                .map(|target| TextureBinding::TileCopy(target.texture))
        }
        None => workload
            .draw_data
            .tiles
            .get(tile)
            .map(|load| TextureBinding::Tmem {
                hash: load.tmem_hash,
            }),
    }
}
