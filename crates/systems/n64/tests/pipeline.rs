//! End-to-end pipeline tests on the recording backend.

use hle_core::graphics::PixelSize;
use hle_core::types::FixedRect;
use n64_hle::rhi::recording::RecordingBackend;
use n64_hle::rhi::{GpuCommand, GraphicsApi};
use n64_hle::workload::{DrawCall, Matrix4, ProjectionKind};
use n64_hle::{ApplicationContext, HleError, PipelineStats, RefreshRateMode, ScreenVi, UserConfiguration};
use std::thread;
use std::time::{Duration, Instant};

const FB_ADDRESS: u32 = 0x10_0000;
const WIDTH: u32 = 320;
const HEIGHT: u32 = 240;

fn rdram() -> Vec<u8> {
    vec![0; 0x40_0000]
}

fn screen() -> ScreenVi {
    ScreenVi::simple(FB_ADDRESS, WIDTH, HEIGHT, PixelSize::Bits16)
}

fn config(target_rate: u32) -> UserConfiguration {
    UserConfiguration {
        refresh_rate: RefreshRateMode::Manual,
        refresh_rate_target: target_rate,
        ..UserConfiguration::default()
    }
}

/// Record one frame drawing a single object translated by `x`.
fn record_frame(context: &ApplicationContext, x: f32) {
    context.with_current_workload(|workload| {
        workload.set_color_image(FB_ADDRESS, PixelSize::Bits16, WIDTH);
        workload.add_projection(ProjectionKind::Perspective, Matrix4::IDENTITY);
        let transform = workload.add_transform(1, Matrix4::translation(x, 0.0, 0.0));
        workload.add_draw_call(DrawCall {
            transform,
            vertex_count: 3,
            tile: None,
            scissor: FixedRect::new(0, 0, WIDTH as i32, HEIGHT as i32),
            tile_scroll: [0.0, 0.0],
            depth_write: false,
        });
    });
}

/// Submit `frames` workloads with one present each, waiting for every
/// present to finish.
fn run_frames(context: &ApplicationContext, rdram: &[u8], frames: usize, original_rate: u32) {
    for frame in 0..frames {
        record_frame(context, frame as f32 * 10.0);
        context.submit_workload(rdram, original_rate).unwrap();
        let present_id = context.submit_present(screen(), rdram).unwrap();
        assert!(context.wait_for_present_id(present_id));
    }
}

fn draw_translations(commands: &[GpuCommand]) -> Vec<f32> {
    commands
        .iter()
        .filter_map(|command| match command {
            GpuCommand::Draw { transform, .. } => Some(transform.m[3][0]),
            _ => None,
        })
        .collect()
}

#[test]
fn test_double_rate_presents_two_frames_per_workload() {
    let backend = RecordingBackend::new();
    let log = backend.present_log();
    let device = backend.device();
    let context = ApplicationContext::new(&backend, config(60)).unwrap();
    let rdram = rdram();

    run_frames(&context, &rdram, 4, 30);

    let frames = context.stats().frames();
    assert_eq!(frames.len(), 4);
    // Nothing to blend against yet
    assert_eq!(frames[0].sub_frames.len(), 1);
    assert!(!frames[0].matched);
    for frame in &frames[1..] {
        assert!(frame.matched);
        assert!(!frame.skipped);
        assert_eq!(frame.sub_frames.len(), 2);
        assert_eq!(frame.sub_frames[0].prev_weight, 0.5);
        assert_eq!(frame.sub_frames[0].cur_weight, 0.5);
        assert_eq!(frame.sub_frames[1].cur_weight, 1.0);
    }
    assert_eq!(log.len(), 1 + 2 * 3);
    assert_eq!(
        PipelineStats::get(&context.stats().sub_frames_skipped),
        0
    );

    // The in-between sub-frame of the second workload sits halfway.
    let translations = draw_translations(&device.commands());
    assert!(translations.contains(&5.0));
    assert!(translations.contains(&10.0));
}

#[test]
fn test_matching_rate_passes_through() {
    let backend = RecordingBackend::new();
    let log = backend.present_log();
    let context = ApplicationContext::new(&backend, config(60)).unwrap();
    let rdram = rdram();

    run_frames(&context, &rdram, 3, 60);

    for frame in context.stats().frames() {
        assert_eq!(frame.sub_frames.len(), 1);
        assert_eq!(frame.sub_frames[0].prev_weight, 0.0);
        assert_eq!(frame.sub_frames[0].cur_weight, 1.0);
    }
    assert_eq!(log.len(), 3);
}

#[test]
fn test_ids_are_monotonic() {
    let backend = RecordingBackend::new();
    let context = ApplicationContext::new(&backend, config(60)).unwrap();
    let rdram = rdram();

    let mut last_workload = 0;
    let mut last_present = 0;
    for frame in 0..5 {
        record_frame(&context, frame as f32);
        let workload_id = context.submit_workload(&rdram, 60).unwrap();
        let present_id = context.submit_present(screen(), &rdram).unwrap();
        assert!(workload_id > last_workload);
        assert!(present_id > last_present);
        last_workload = workload_id;
        last_present = present_id;

        assert!(context.wait_for_workload_id(workload_id));
        assert!(context.workload_id() >= workload_id);
        assert!(context.wait_for_present_id(present_id));
        assert!(context.present_id() >= present_id);
    }
}

#[test]
fn test_repeat_shows_same_texture() {
    let backend = RecordingBackend::new();
    let log = backend.present_log();
    let context = ApplicationContext::new(&backend, config(60)).unwrap();
    let rdram = rdram();

    run_frames(&context, &rdram, 1, 60);
    context.repeat_last_present().unwrap();
    let present_id = context.repeat_last_present().unwrap();
    assert!(context.wait_for_present_id(present_id));

    let records = log.records();
    assert_eq!(records.len(), 3);
    assert_eq!(records[1].texture, records[0].texture);
    assert_eq!(records[2].texture, records[0].texture);
    assert_eq!(records[2].rect, records[0].rect);
}

#[test]
fn test_invalid_swap_chain_still_advances() {
    let backend = RecordingBackend::new();
    let log = backend.present_log();
    let context = ApplicationContext::new(&backend, config(60)).unwrap();
    let rdram = rdram();

    log.set_valid(false);
    run_frames(&context, &rdram, 2, 60);
    assert!(log.is_empty());
    assert!(PipelineStats::get(&context.stats().presents_skipped) >= 2);

    log.set_valid(true);
    run_frames(&context, &rdram, 1, 60);
    assert_eq!(log.len(), 1);
}

#[test]
fn test_blank_screen_is_not_presented() {
    let backend = RecordingBackend::new();
    let log = backend.present_log();
    let context = ApplicationContext::new(&backend, config(60)).unwrap();
    let rdram = rdram();

    record_frame(&context, 0.0);
    context.submit_workload(&rdram, 60).unwrap();
    let present_id = context
        .submit_present(ScreenVi::default(), &rdram)
        .unwrap();
    assert!(context.wait_for_present_id(present_id));
    assert!(log.is_empty());
}

#[test]
fn test_unrendered_framebuffer_presented_from_storage() {
    let backend = RecordingBackend::new();
    let log = backend.present_log();
    let device = backend.device();
    let context = ApplicationContext::new(&backend, config(60)).unwrap();
    let mut rdram = rdram();
    rdram[0x20_0000] = 0xFF;

    let screen = ScreenVi::simple(0x20_0000, WIDTH, HEIGHT, PixelSize::Bits16);
    let present_id = context.submit_present(screen, &rdram).unwrap();
    assert!(context.wait_for_present_id(present_id));

    assert_eq!(log.len(), 1);
    let upload = device.commands().into_iter().find_map(|command| match command {
        GpuCommand::UploadTexture { data, .. } => Some(data),
        _ => None,
    });
    let data = upload.unwrap();
    assert_eq!(data.len(), (WIDTH * HEIGHT * 2) as usize);
    assert_eq!(data[0], 0xFF);
}

#[test]
fn test_configuration_change_recreates_targets() {
    let backend = RecordingBackend::new();
    let device = backend.device();
    let context = ApplicationContext::new(&backend, config(60)).unwrap();
    let rdram = rdram();

    run_frames(&context, &rdram, 1, 60);
    assert_eq!(device.destroyed_textures(), 0);

    let mut updated = context.configuration();
    updated.msaa_samples = 4;
    context.update_configuration(updated).unwrap();
    device.clear_submissions();
    run_frames(&context, &rdram, 1, 60);

    assert!(device.destroyed_textures() > 0);
    let color = device.commands().into_iter().find_map(|command| match command {
        GpuCommand::Draw { color, .. } => Some(color),
        _ => None,
    });
    assert_eq!(device.texture_desc(color.unwrap()).unwrap().samples, 4);
}

#[test]
fn test_invalid_configuration_rejected() {
    let backend = RecordingBackend::new();
    let context = ApplicationContext::new(&backend, config(60)).unwrap();
    let updated = UserConfiguration {
        msaa_samples: 16,
        ..UserConfiguration::default()
    };
    assert!(matches!(
        context.update_configuration(updated),
        Err(HleError::InvalidConfiguration(_))
    ));
}

#[test]
fn test_idle_thread_dispatches() {
    let backend = RecordingBackend::new();
    let device = backend.device();
    let _context = ApplicationContext::new(&backend, config(60)).unwrap();
    for _ in 0..500 {
        if device.idle_dispatches() > 0 {
            break;
        }
        thread::sleep(Duration::from_millis(2));
    }
    assert!(device.idle_dispatches() > 0);
}

#[test]
fn test_unsupported_api() {
    let backend = RecordingBackend::new().with_apis(&[GraphicsApi::Metal]);
    let config = UserConfiguration {
        graphics_api: Some(GraphicsApi::Vulkan),
        ..UserConfiguration::default()
    };
    assert!(matches!(
        ApplicationContext::new(&backend, config),
        Err(HleError::UnsupportedGraphicsApi(GraphicsApi::Vulkan))
    ));
}

#[test]
fn test_creation_failures() {
    let backend = RecordingBackend::new().failing_device();
    assert!(matches!(
        ApplicationContext::new(&backend, UserConfiguration::default()),
        Err(HleError::DeviceCreationFailed(_))
    ));

    let backend = RecordingBackend::new().failing_swap_chain();
    assert!(matches!(
        ApplicationContext::new(&backend, UserConfiguration::default()),
        Err(HleError::SwapChainCreationFailed(_))
    ));
}

#[test]
fn test_texture_failure_stops_pipeline() {
    let backend = RecordingBackend::new();
    backend.device().fail_textures_after(0);
    let context = ApplicationContext::new(&backend, config(60)).unwrap();
    let rdram = rdram();

    record_frame(&context, 0.0);
    let workload_id = context.submit_workload(&rdram, 60).unwrap();
    assert!(!context.wait_for_workload_id(workload_id));
    assert!(!context.is_running());

    record_frame(&context, 1.0);
    assert!(matches!(
        context.submit_workload(&rdram, 60),
        Err(HleError::ResourceCreationFailed(_))
    ));
    assert!(matches!(
        context.submit_present(screen(), &rdram),
        Err(HleError::QueueStopped)
    ));
}

#[test]
fn test_configuration_change_uploads_ram_again() {
    let backend = RecordingBackend::new();
    let device = backend.device();
    let context = ApplicationContext::new(&backend, config(60)).unwrap();
    let mut rdram = rdram();
    rdram[FB_ADDRESS as usize] = 0x5A;

    run_frames(&context, &rdram, 1, 60);
    let mut updated = context.configuration();
    updated.msaa_samples = 4;
    context.update_configuration(updated).unwrap();
    device.clear_submissions();
    run_frames(&context, &rdram, 1, 60);

    // The CPU-written contents reach the recreated target
    let (target, data) = device
        .commands()
        .into_iter()
        .find_map(|command| match command {
            GpuCommand::UploadTexture { target, data, .. } => Some((target, data)),
            _ => None,
        })
        .unwrap();
    assert_eq!(data[0], 0x5A);
    assert_eq!(device.texture_desc(target).unwrap().samples, 4);
}

#[test]
fn test_unpresented_sub_frames_do_not_delay_reconfiguration() {
    let backend = RecordingBackend::new();
    let context = ApplicationContext::new(&backend, config(60)).unwrap();
    let rdram = rdram();

    run_frames(&context, &rdram, 1, 30);
    // In-between sub-frame behind a blank screen
    record_frame(&context, 10.0);
    context.submit_workload(&rdram, 30).unwrap();
    let blank = context.submit_present(ScreenVi::default(), &rdram).unwrap();
    assert!(context.wait_for_present_id(blank));
    // Two workloads for no present
    for x in [20.0, 30.0] {
        record_frame(&context, x);
        context.submit_workload(&rdram, 30).unwrap();
    }

    let mut updated = context.configuration();
    updated.msaa_samples = 4;
    context.update_configuration(updated).unwrap();

    record_frame(&context, 40.0);
    let start = Instant::now();
    let workload_id = context.submit_workload(&rdram, 30).unwrap();
    assert!(context.wait_for_workload_id(workload_id));
    assert!(start.elapsed() < Duration::from_millis(200));
}

#[test]
fn test_paused_workloads_pass_through() {
    let backend = RecordingBackend::new();
    let context = ApplicationContext::new(&backend, config(60)).unwrap();
    let rdram = rdram();

    run_frames(&context, &rdram, 2, 30);
    context.set_paused(true);
    // More paused workloads than ring slots
    run_frames(&context, &rdram, 6, 30);
    context.set_paused(false);
    run_frames(&context, &rdram, 2, 30);

    let frames = context.stats().frames();
    assert_eq!(frames.len(), 10);
    assert_eq!(frames[1].sub_frames.len(), 2);
    for frame in &frames[2..8] {
        assert_eq!(frame.sub_frames.len(), 1);
        assert_eq!(frame.sub_frames[0].cur_weight, 1.0);
        assert!(!frame.matched);
    }
    assert!(frames[8].matched);
    assert_eq!(frames[9].sub_frames.len(), 2);
}

#[test]
fn test_reset_framebuffers_uploads_again() {
    let backend = RecordingBackend::new();
    let context = ApplicationContext::new(&backend, config(60)).unwrap();
    let rdram = rdram();

    run_frames(&context, &rdram, 1, 60);
    let uploads = PipelineStats::get(&context.stats().uploads);
    assert_eq!(uploads, 1);
    run_frames(&context, &rdram, 1, 60);
    assert_eq!(PipelineStats::get(&context.stats().uploads), uploads);

    context.reset_framebuffers();
    run_frames(&context, &rdram, 1, 60);
    assert_eq!(PipelineStats::get(&context.stats().uploads), uploads + 1);
}

#[test]
fn test_blocked_producer_skips_to_final_sub_frame() {
    let backend = RecordingBackend::new();
    let device = backend.device();
    let config = UserConfiguration {
        workload_ring_size: 3,
        ..config(240)
    };
    let context = ApplicationContext::new(&backend, config).unwrap();
    let rdram = rdram();
    device.set_submit_delay(Duration::from_millis(5));

    // Submit without waiting so the workload ring fills up
    let mut last_present = 0;
    for frame in 0..12 {
        record_frame(&context, frame as f32);
        context.submit_workload(&rdram, 30).unwrap();
        last_present = context.submit_present(screen(), &rdram).unwrap();
    }
    assert!(context.wait_for_present_id(last_present));

    assert!(PipelineStats::get(&context.stats().sub_frames_skipped) > 0);
    let frames = context.stats().frames();
    assert!(frames.iter().any(|frame| frame.skipped));
    for frame in &frames {
        let last = frame.sub_frames.last().unwrap();
        assert_eq!(last.cur_weight, 1.0);
        if frame.skipped {
            assert_eq!(last.index, 7);
            assert!(frame.sub_frames.len() < 8);
        }
    }
}

#[test]
fn test_rate_change_between_workloads() {
    let backend = RecordingBackend::new();
    let context = ApplicationContext::new(&backend, config(144)).unwrap();
    let rdram = rdram();

    run_frames(&context, &rdram, 3, 60);
    run_frames(&context, &rdram, 3, 30);
    run_frames(&context, &rdram, 2, 60);

    assert!(context.is_running());
    let frames = context.stats().frames();
    assert_eq!(frames.len(), 8);
    assert_eq!(frames[1].sub_frames.len(), 2);
    // Ticks restart at each new rate
    assert_eq!(frames[3].sub_frames.len(), 4);
    assert_eq!(frames[6].sub_frames.len(), 2);
}

#[test]
fn test_skip_buffering_repeat_shows_live_target() {
    let backend = RecordingBackend::new();
    let log = backend.present_log();
    let device = backend.device();
    let context = ApplicationContext::new(&backend, config(60)).unwrap();
    let rdram = rdram();

    // A framebuffer the VI showed before is presented without a copy
    run_frames(&context, &rdram, 2, 60);
    record_frame(&context, 50.0);
    let workload_id = context.submit_workload(&rdram, 60).unwrap();
    assert!(context.wait_for_workload_id(workload_id));
    let present_id = context.repeat_last_present().unwrap();
    assert!(context.wait_for_present_id(present_id));

    let records = log.records();
    assert_eq!(records.len(), 3);
    assert_ne!(records[1].texture, records[0].texture);
    assert_eq!(records[2].texture, records[1].texture);
    let live = device
        .commands()
        .into_iter()
        .filter_map(|command| match command {
            GpuCommand::Draw { color, .. } => Some(color),
            _ => None,
        })
        .last();
    assert_eq!(live, Some(records[2].texture));
}
