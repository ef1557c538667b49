//! State shared between the producer, render, present and idle threads
//!
//! Each concern has its own lock:
//!
//! - `configuration`: user settings plus window and display state
//! - `manager`: render targets and the framebuffers the present thread reads
//! - `interpolated`: progress of the sub-frames of the current workload
//! - `workload`: exclusive GPU submission; the idle thread only `try_lock`s it
//!
//! Workload and present progress are published through [`IdSignal`]s, which
//! only ever move forward.

use crate::config::UserConfiguration;
use crate::framebuffer::WriteType;
use crate::interpolation::SubFrame;
use crate::render_target::{RenderTargetManager, TargetSlot};
use crate::rhi::TextureId;
use crate::ring::SlotRing;
use crate::{lock, HleError};
use hle_core::logging::{log, LogCategory, LogLevel};
use hle_core::types::FixedRect;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// Frame records kept for reporting.
const FRAME_LOG_CAPACITY: usize = 4096;

#[derive(Debug, Default)]
struct SignalState {
    value: u64,
    stopped: bool,
}

/// Monotonic id with blocking waits.
#[derive(Debug, Default)]
pub struct IdSignal {
    state: Mutex<SignalState>,
    changed: Condvar,
}

impl IdSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u64 {
        lock(&self.state).value
    }

    /// Raise the id to `id`. Lower values are ignored.
    pub fn advance_to(&self, id: u64) {
        let mut state = lock(&self.state);
        if id > state.value {
            state.value = id;
            self.changed.notify_all();
        }
    }

    /// Block until the id reaches `id`. Returns false if the signal was
    /// stopped first.
    pub fn wait_for(&self, id: u64) -> bool {
        let mut state = lock(&self.state);
        while state.value < id && !state.stopped {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
        state.value >= id
    }

    pub fn stop(&self) {
        let mut state = lock(&self.state);
        state.stopped = true;
        self.changed.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        lock(&self.state).stopped
    }
}

/// Sub-frame production of the workload being rendered.
#[derive(Debug, Clone, Default)]
pub struct InterpolatedState {
    pub workload_id: u64,
    /// Sub-frames planned for the workload
    pub planned: usize,
    /// Target slot of each produced sub-frame, in presentation order
    pub produced: Vec<TargetSlot>,
    pub complete: bool,
    /// Intermediate sub-frames were dropped
    pub skipped: bool,
    /// Override sub-frames rendered but not presented yet
    pub in_flight: usize,
    pub target_rate: u32,
    pub original_rate: u32,
}

impl InterpolatedState {
    pub fn begin(&mut self, workload_id: u64, planned: usize, original: u32, target: u32) {
        self.workload_id = workload_id;
        self.planned = planned;
        self.produced.clear();
        self.complete = false;
        self.skipped = false;
        self.in_flight = 0;
        self.original_rate = original;
        self.target_rate = target;
    }
}

/// Configuration as seen by the worker threads.
#[derive(Debug, Clone)]
pub struct SharedConfiguration {
    pub user: UserConfiguration,
    pub window_size: (u32, u32),
    /// Bumped on every change so threads can cheaply detect updates
    pub revision: u64,
}

/// Render targets and presentation bookkeeping, guarded together.
pub struct ManagerState {
    pub targets: RenderTargetManager,
    /// Framebuffer addresses recently shown by the VI, newest last
    pub vi_history: VecDeque<u32>,
    /// Last texture handed to the swap chain and the rect shown
    pub last_presented: Option<(TextureId, FixedRect)>,
    /// Write type the render thread last used for each framebuffer address
    pub written_as: HashMap<u32, WriteType>,
}

impl ManagerState {
    pub const VI_HISTORY: usize = 4;

    pub fn new(targets: RenderTargetManager) -> Self {
        Self {
            targets,
            vi_history: VecDeque::with_capacity(Self::VI_HISTORY),
            last_presented: None,
            written_as: HashMap::new(),
        }
    }

    pub fn push_vi_history(&mut self, address: u32) {
        if self.vi_history.back() == Some(&address) {
            return;
        }
        if self.vi_history.len() == Self::VI_HISTORY {
            self.vi_history.pop_front();
        }
        self.vi_history.push_back(address);
    }
}

/// One rendered workload, for reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub workload_id: u64,
    pub sub_frames: Vec<SubFrame>,
    pub skipped: bool,
    pub matched: bool,
}

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub workloads_rendered: AtomicU64,
    pub sub_frames_rendered: AtomicU64,
    pub sub_frames_skipped: AtomicU64,
    pub presents_processed: AtomicU64,
    pub frames_presented: AtomicU64,
    pub presents_skipped: AtomicU64,
    pub uploads: AtomicU64,
    frame_log: Mutex<VecDeque<FrameRecord>>,
}

impl PipelineStats {
    pub fn record_frame(&self, record: FrameRecord) {
        let mut log = lock(&self.frame_log);
        if log.len() == FRAME_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(record);
    }

    pub fn frames(&self) -> Vec<FrameRecord> {
        lock(&self.frame_log).iter().cloned().collect()
    }

    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

pub struct SharedQueueResources {
    pub configuration: Mutex<SharedConfiguration>,
    pub manager: Mutex<ManagerState>,
    pub interpolated: Mutex<InterpolatedState>,
    pub interpolated_changed: Condvar,
    pub workload: Mutex<()>,
    pub workload_id: IdSignal,
    pub present_id: IdSignal,
    /// Refresh rate reported by the swap chain, in Hz
    pub display_rate: AtomicU32,
    pub idle_active: AtomicBool,
    pub stats: PipelineStats,
    running: AtomicBool,
    error: Mutex<Option<HleError>>,
}

impl SharedQueueResources {
    /// Limit on waiting for presented sub-frames before recreating targets.
    pub const DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

    pub fn new(
        user: UserConfiguration,
        window_size: (u32, u32),
        targets: RenderTargetManager,
        display_rate: u32,
    ) -> Self {
        let idle = user.idle_work;
        Self {
            configuration: Mutex::new(SharedConfiguration {
                user,
                window_size,
                revision: 0,
            }),
            manager: Mutex::new(ManagerState::new(targets)),
            interpolated: Mutex::new(InterpolatedState::default()),
            interpolated_changed: Condvar::new(),
            workload: Mutex::new(()),
            workload_id: IdSignal::new(),
            present_id: IdSignal::new(),
            display_rate: AtomicU32::new(display_rate),
            idle_active: AtomicBool::new(idle),
            stats: PipelineStats::default(),
            running: AtomicBool::new(true),
            error: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn configuration(&self) -> MutexGuard<'_, SharedConfiguration> {
        lock(&self.configuration)
    }

    pub fn update_configuration(&self, update: impl FnOnce(&mut SharedConfiguration)) {
        let mut configuration = lock(&self.configuration);
        update(&mut configuration);
        configuration.revision += 1;
        self.idle_active
            .store(configuration.user.idle_work, Ordering::Relaxed);
    }

    pub fn manager(&self) -> MutexGuard<'_, ManagerState> {
        lock(&self.manager)
    }

    pub fn interpolated(&self) -> MutexGuard<'_, InterpolatedState> {
        lock(&self.interpolated)
    }

    /// Apply `update` to the interpolated state and wake waiters.
    pub fn update_interpolated(&self, update: impl FnOnce(&mut InterpolatedState)) {
        let mut state = lock(&self.interpolated);
        update(&mut state);
        self.interpolated_changed.notify_all();
    }

    /// Block until sub-frame `index` of `workload_id` was produced or the
    /// workload completed without it. Returns the slot to present.
    pub fn wait_for_sub_frame(&self, workload_id: u64, index: usize) -> Option<TargetSlot> {
        let mut state = lock(&self.interpolated);
        loop {
            if state.workload_id != workload_id || !self.is_running() {
                return None;
            }
            if let Some(slot) = state.produced.get(index) {
                return Some(*slot);
            }
            if state.complete {
                return None;
            }
            state = self
                .interpolated_changed
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Block until every sub-frame of `workload_id` was rendered. Returns
    /// false if rendering moved on or stopped.
    pub fn wait_for_completion(&self, workload_id: u64) -> bool {
        let mut state = lock(&self.interpolated);
        while state.workload_id == workload_id && !state.complete && self.is_running() {
            state = self
                .interpolated_changed
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
        state.workload_id == workload_id && state.complete
    }

    /// Wait until no override sub-frame is waiting to be presented. Gives up
    /// after [`Self::DRAIN_TIMEOUT`]; returns false in that case.
    pub fn drain_in_flight(&self) -> bool {
        let deadline = Instant::now() + Self::DRAIN_TIMEOUT;
        let mut state = lock(&self.interpolated);
        while state.in_flight > 0 && self.is_running() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .interpolated_changed
                .wait_timeout(state, deadline - now)
                .map(|(state, _)| state)
                .unwrap_or_else(|e| e.into_inner().0);
        }
        true
    }

    /// Record a fatal error and stop all threads. Only the first error is kept.
    pub fn fail(&self, error: HleError) {
        {
            let mut slot = lock(&self.error);
            if slot.is_none() {
                *slot = Some(error);
            }
        }
        self.shutdown();
    }

    pub fn take_error(&self) -> Option<HleError> {
        lock(&self.error).take()
    }

    pub fn has_error(&self) -> bool {
        lock(&self.error).is_some()
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.idle_active.store(false, Ordering::SeqCst);
        self.workload_id.stop();
        self.present_id.stop();
        let _state = lock(&self.interpolated);
        self.interpolated_changed.notify_all();
    }
}

/// Held by a worker thread for its whole run. If the thread unwinds, the
/// pipeline is failed and the thread's ring stopped so nobody waits on it.
pub struct PanicGuard<T> {
    shared: Arc<SharedQueueResources>,
    ring: Arc<SlotRing<T>>,
    thread: &'static str,
}

impl<T> PanicGuard<T> {
    pub fn new(shared: Arc<SharedQueueResources>, ring: Arc<SlotRing<T>>, thread: &'static str) -> Self {
        Self {
            shared,
            ring,
            thread,
        }
    }
}

impl<T> Drop for PanicGuard<T> {
    fn drop(&mut self) {
        if !thread::panicking() {
            return;
        }
        log(LogCategory::Gpu, LogLevel::Error, || {
            format!("{} thread panicked, stopping the pipeline", self.thread)
        });
        self.shared.fail(HleError::WorkerPanicked(self.thread));
        self.ring.stop();
    }
}
