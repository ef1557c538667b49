//! Frame matching and interpolation
//!
//! The console emits workloads at its original rate (typically 30 or 60 Hz)
//! while the host display may run faster. Two tick accumulators decide how
//! many display sub-frames each workload produces:
//!
//! ```text
//! logical += target        once per workload
//! display += original      once per planned sub-frame
//! count    = (logical - display) / original
//! ```
//!
//! Sub-frame `k` (1-based) sits at display tick `D = display + k * original`
//! and blends the previous and current workload with
//! `cur = clamp(1 - (logical - D) / target, 0, 1)` and `prev = 1 - cur`.
//! At 30 Hz to 60 Hz this yields `{0.5, 0.5}` followed by `{0, 1}`.
//!
//! All planned sub-frames are accounted for in the accumulators up front, so
//! sub-frames dropped later by frame skipping do not make them drift. Ticks of
//! different rates do not mix: the accumulators restart whenever the original
//! or target rate changes.

use crate::workload::{Matrix4, ProjectionKind, Topology, Workload};
use hle_core::logging::{log, LogCategory, LogLevel};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubFrame {
    pub index: usize,
    pub prev_weight: f32,
    pub cur_weight: f32,
}

impl SubFrame {
    pub const DIRECT: SubFrame = SubFrame {
        index: 0,
        prev_weight: 0.0,
        cur_weight: 1.0,
    };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FramePlan {
    pub sub_frames: Vec<SubFrame>,
    /// Blending against the previous workload is allowed
    pub matched: bool,
    /// `logical - display` right after the logical update
    pub tick_gap: u64,
}

impl FramePlan {
    pub fn direct() -> Self {
        Self {
            sub_frames: vec![SubFrame::DIRECT],
            matched: false,
            tick_gap: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.sub_frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sub_frames.is_empty()
    }
}

/// Logical/display tick accumulators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameTicks {
    pub logical: u64,
    pub display: u64,
    /// `(original, target)` the accumulators are counting in
    rates: Option<(u64, u64)>,
}

impl FrameTicks {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn gap(&self) -> u64 {
        self.logical.saturating_sub(self.display)
    }

    /// Advance by one workload. Passes through with a single direct sub-frame
    /// when interpolation is off or the target rate does not exceed the
    /// original rate.
    pub fn plan(&mut self, original: u32, target: u32, enabled: bool) -> FramePlan {
        if !enabled || original == 0 || target <= original {
            self.reset();
            return FramePlan::direct();
        }

        let (original, target) = (original as u64, target as u64);
        if self.rates != Some((original, target)) {
            if let Some((from_original, from_target)) = self.rates {
                log(LogCategory::Interpolation, LogLevel::Debug, || {
                    format!(
                        "Rates changed {}Hz -> {}Hz to {}Hz -> {}Hz, restarting ticks",
                        from_original, from_target, original, target
                    )
                });
            }
            *self = Self {
                rates: Some((original, target)),
                ..Self::default()
            };
        }

        self.logical += target;
        // At most one workload plus one display frame can be outstanding.
        if self.gap() > target + original {
            self.display = self.logical - target;
        }
        let gap = self.gap();

        let count = (gap / original).max(1);
        let sub_frames = (1..=count)
            .map(|k| {
                let at = self.display + k * original;
                let ahead = self.logical.saturating_sub(at) as f32;
                let cur_weight = (1.0 - ahead / target as f32).clamp(0.0, 1.0);
                SubFrame {
                    index: (k - 1) as usize,
                    prev_weight: 1.0 - cur_weight,
                    cur_weight,
                }
            })
            .collect();
        self.display += count * original;

        FramePlan {
            sub_frames,
            matched: true,
            tick_gap: gap,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct PreviousFrame {
    topology: Topology,
    transforms: HashMap<u32, Matrix4>,
    /// Projection matrices per pair
    projections: Vec<Vec<(ProjectionKind, Matrix4)>>,
    tile_scroll: Vec<[f32; 2]>,
}

/// Plans sub-frames and blends workload state with the previous workload.
#[derive(Default)]
pub struct FrameMatcher {
    ticks: FrameTicks,
    previous: Option<PreviousFrame>,
}

impl FrameMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ticks(&self) -> FrameTicks {
        self.ticks
    }

    /// Plan the sub-frames for `workload`. A workload whose topology differs
    /// from the previous one is shown directly; its ticks are still consumed.
    pub fn plan(&mut self, workload: &Workload, target_rate: u32, enabled: bool) -> FramePlan {
        let enabled = enabled && !workload.paused;
        let mut plan = self.ticks.plan(workload.vi_original_rate, target_rate, enabled);
        if !plan.matched {
            return plan;
        }

        let matched = self
            .previous
            .as_ref()
            .is_some_and(|previous| previous.topology == workload.topology());
        if !matched {
            log(LogCategory::Interpolation, LogLevel::Debug, || {
                format!(
                    "Workload {} topology changed, presenting {} sub-frames as one",
                    workload.workload_id,
                    plan.len()
                )
            });
            plan.sub_frames = vec![SubFrame::DIRECT];
            plan.matched = false;
        }
        plan
    }

    /// Blend of transform `index` of `workload`.
    pub fn transform(&self, workload: &Workload, index: usize, sub_frame: &SubFrame) -> Matrix4 {
        let current = workload.draw_data.transforms[index];
        match self
            .previous
            .as_ref()
            .and_then(|previous| previous.transforms.get(&current.id))
        {
            Some(prev) if sub_frame.prev_weight > 0.0 => {
                Matrix4::lerp(prev, &current.matrix, sub_frame.cur_weight)
            }
            _ => current.matrix,
        }
    }

    /// Blend of projection `projection` of pair `pair`. Rectangle projections
    /// are screen space and never blended.
    pub fn projection(
        &self,
        workload: &Workload,
        pair: usize,
        projection: usize,
        sub_frame: &SubFrame,
    ) -> Matrix4 {
        let current = workload.fb_pairs[pair].projections[projection];
        if current.kind == ProjectionKind::Rectangle || sub_frame.prev_weight <= 0.0 {
            return current.matrix;
        }
        match self
            .previous
            .as_ref()
            .and_then(|previous| previous.projections.get(pair))
            .and_then(|projections| projections.get(projection))
        {
            Some((kind, prev)) if *kind == current.kind => {
                Matrix4::lerp(prev, &current.matrix, sub_frame.cur_weight)
            }
            _ => current.matrix,
        }
    }

    pub fn tile_scroll(&self, workload: &Workload, call: usize, sub_frame: &SubFrame) -> [f32; 2] {
        let current = workload.draw_data.calls[call].tile_scroll;
        match self
            .previous
            .as_ref()
            .and_then(|previous| previous.tile_scroll.get(call))
        {
            Some(prev) if sub_frame.prev_weight > 0.0 => [
                prev[0] + (current[0] - prev[0]) * sub_frame.cur_weight,
                prev[1] + (current[1] - prev[1]) * sub_frame.cur_weight,
            ],
            _ => current,
        }
    }

    /// Keep `workload` as the blend source for the next one.
    pub fn remember(&mut self, workload: &Workload) {
        self.previous = Some(PreviousFrame {
            topology: workload.topology(),
            transforms: workload
                .draw_data
                .transforms
                .iter()
                .map(|t| (t.id, t.matrix))
                .collect(),
            projections: workload
                .fb_pairs
                .iter()
                .map(|pair| pair.projections.iter().map(|p| (p.kind, p.matrix)).collect())
                .collect(),
            tile_scroll: workload
                .draw_data
                .calls
                .iter()
                .map(|call| call.tile_scroll)
                .collect(),
        });
    }

    /// Forget the previous frame and reset the accumulators.
    pub fn reset(&mut self) {
        self.ticks.reset();
        self.previous = None;
    }
}
