use anyhow::{Context, Result};
use clap::Parser;
use hle_core::graphics::{ColorOps, PixelSize};
use hle_core::logging::{LogConfig, LogLevel};
use hle_core::types::FixedRect;
use n64_hle::rhi::recording::RecordingBackend;
use n64_hle::vi::{
    VI_H_START, VI_ORIGIN, VI_STATUS, VI_V_START, VI_WIDTH, VI_X_SCALE, VI_Y_SCALE,
};
use n64_hle::workload::{DrawCall, Matrix4, ProjectionKind};
use n64_hle::{
    ApplicationContext, PipelineStats, RefreshRateMode, ScreenVi, UserConfiguration,
    VideoInterface,
};
use serde_json::json;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

const RDRAM_SIZE: usize = 0x80_0000;
const FB_ADDRESS: u32 = 0x10_0000;

/// Headless frame pacing harness: drives the pipeline with synthetic
/// workloads on the recording backend and reports what was presented.
#[derive(Parser)]
#[command(name = "hle-pace")]
struct Args {
    /// Rate the synthetic game renders at, in Hz
    #[arg(long, default_value_t = 30)]
    original_rate: u32,

    /// Presentation rate; overrides the configuration's refresh rate mode
    #[arg(long)]
    target_rate: Option<u32>,

    /// Number of workloads to submit
    #[arg(long, default_value_t = 60)]
    workloads: u32,

    /// Framebuffer width
    #[arg(long, default_value_t = 320)]
    width: u32,

    /// Framebuffer height
    #[arg(long, default_value_t = 240)]
    height: u32,

    /// Log level: off, error, warn, info, debug, trace
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Also write pipeline logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Pipeline log messages allowed per category and second
    #[arg(long, default_value_t = 60)]
    log_rate_limit: usize,

    /// JSON user configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the JSON report here instead of stdout
    #[arg(long)]
    report: Option<PathBuf>,

    /// Write the final RDRAM framebuffer as a binary PPM image
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Submit as fast as possible instead of at the original rate
    #[arg(long, default_value_t = false)]
    fast: bool,
}

fn record_frame(context: &ApplicationContext, frame: u32, width: u32, height: u32) {
    let x = (frame % 64) as f32 * 2.0;
    context.with_current_workload(|workload| {
        workload.set_color_image(FB_ADDRESS, PixelSize::Bits16, width);
        workload.add_projection(ProjectionKind::Perspective, Matrix4::IDENTITY);
        let object = workload.add_transform(1, Matrix4::translation(x, 0.0, 0.0));
        workload.add_draw_call(DrawCall {
            transform: object,
            vertex_count: 36,
            tile: None,
            scissor: FixedRect::new(0, 0, width as i32, height as i32),
            tile_scroll: [x * 0.5, 0.0],
            depth_write: false,
        });
        // Screen-space overlay
        workload.add_projection(ProjectionKind::Rectangle, Matrix4::IDENTITY);
        let overlay = workload.add_transform(2, Matrix4::IDENTITY);
        workload.add_draw_call(DrawCall {
            transform: overlay,
            vertex_count: 6,
            tile: None,
            scissor: FixedRect::new(8, 8, 72, 24),
            tile_scroll: [0.0, 0.0],
            depth_write: false,
        });
    });
}

/// Program the VI the way a game would for a 1:1 `width` x `height` screen.
fn program_vi(width: u32, height: u32) -> VideoInterface {
    let layout = ScreenVi::simple(FB_ADDRESS, width, height, PixelSize::Bits16);
    let mut vi = VideoInterface::new();
    for (offset, value) in [
        (VI_STATUS, layout.status),
        (VI_ORIGIN, layout.origin),
        (VI_WIDTH, layout.width),
        (VI_H_START, layout.h_start),
        (VI_V_START, layout.v_start),
        (VI_X_SCALE, layout.x_scale),
        (VI_Y_SCALE, layout.y_scale),
    ] {
        vi.write_register(offset, value);
    }
    vi
}

fn write_snapshot(path: &Path, rdram: &[u8], width: u32, height: u32) -> Result<()> {
    let start = FB_ADDRESS as usize;
    let end = (start + PixelSize::Bits16.bytes_for(width * height) as usize).min(rdram.len());
    let frame = ColorOps::decode_image(&rdram[start..end], PixelSize::Bits16, width, height);

    let mut file = File::create(path)?;
    write!(file, "P6\n{} {}\n255\n", frame.width, frame.height)?;
    let mut bytes = Vec::with_capacity(frame.pixels.len() * 3);
    for &pixel in &frame.pixels {
        bytes.extend_from_slice(&[
            ColorOps::red(pixel),
            ColorOps::green(pixel),
            ColorOps::blue(pixel),
        ]);
    }
    file.write_all(&bytes)?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::new()
        .parse_filters(&args.log_level)
        .init();
    let level = LogLevel::from_str(&args.log_level)
        .with_context(|| format!("unknown log level {}", args.log_level))?;
    let log_config = LogConfig::global();
    log_config.set_global_level(level);
    log_config.set_rate_limit(args.log_rate_limit);
    if let Some(path) = &args.log_file {
        log_config
            .set_log_file(path.clone())
            .with_context(|| format!("opening log file {}", path.display()))?;
    }

    let mut config = match &args.config {
        Some(path) => UserConfiguration::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => UserConfiguration::default(),
    };
    if let Some(target) = args.target_rate {
        config.refresh_rate = RefreshRateMode::Manual;
        config.refresh_rate_target = target;
    }
    config.validate()?;

    let display_rate = args.target_rate.unwrap_or(60);
    let backend = RecordingBackend::new()
        .with_refresh_rate(display_rate)
        .with_window_size(args.width * 2, args.height * 2);
    let present_log = backend.present_log();
    let mut context = ApplicationContext::new(&backend, config)?;
    log::info!(
        "Running {} workloads at {}Hz, display {}Hz",
        args.workloads,
        args.original_rate,
        display_rate
    );

    let vi = program_vi(args.width, args.height);
    let mut rdram = vec![0u8; RDRAM_SIZE];
    let period = Duration::from_micros(1_000_000 / args.original_rate.max(1) as u64);
    let started = Instant::now();
    let mut last_present = 0;

    for frame in 0..args.workloads {
        let frame_start = Instant::now();
        // The CPU touches one framebuffer row every few frames.
        if frame % 8 == 7 {
            let row = (frame / 8) % args.height;
            let offset = FB_ADDRESS as usize + (row * args.width * 2) as usize;
            if let Some(byte) = rdram.get_mut(offset) {
                *byte = byte.wrapping_add(1);
            }
        }

        record_frame(&context, frame, args.width, args.height);
        context.submit_workload(&rdram, args.original_rate)?;
        last_present = context.submit_present(vi.snapshot(), &rdram)?;

        if !args.fast {
            if let Some(remaining) = period.checked_sub(frame_start.elapsed()) {
                thread::sleep(remaining);
            }
        }
    }

    if !context.wait_for_present_id(last_present) {
        if let Some(error) = context.take_error() {
            return Err(error.into());
        }
    }
    let elapsed = started.elapsed();

    let stats = context.stats();
    let records = present_log.records();
    let intervals: Vec<f64> = records
        .windows(2)
        .map(|pair| (pair[1].at - pair[0].at).as_secs_f64() * 1000.0)
        .collect();
    let mean_interval = if intervals.is_empty() {
        0.0
    } else {
        intervals.iter().sum::<f64>() / intervals.len() as f64
    };
    let frames: Vec<_> = stats
        .frames()
        .iter()
        .map(|frame| {
            json!({
                "workload_id": frame.workload_id,
                "matched": frame.matched,
                "skipped": frame.skipped,
                "weights": frame
                    .sub_frames
                    .iter()
                    .map(|sub| [sub.prev_weight, sub.cur_weight])
                    .collect::<Vec<_>>(),
            })
        })
        .collect();

    let report = json!({
        "original_rate": args.original_rate,
        "target_rate": context.configuration().target_rate(args.original_rate, display_rate),
        "elapsed_ms": elapsed.as_secs_f64() * 1000.0,
        "workloads_rendered": PipelineStats::get(&stats.workloads_rendered),
        "sub_frames_rendered": PipelineStats::get(&stats.sub_frames_rendered),
        "sub_frames_skipped": PipelineStats::get(&stats.sub_frames_skipped),
        "presents_processed": PipelineStats::get(&stats.presents_processed),
        "presents_skipped": PipelineStats::get(&stats.presents_skipped),
        "frames_presented": PipelineStats::get(&stats.frames_presented),
        "uploads": PipelineStats::get(&stats.uploads),
        "mean_present_interval_ms": mean_interval,
        "frames": frames,
    });

    context.shutdown();
    log_config.clear_log_file();

    if let Some(path) = &args.snapshot {
        write_snapshot(path, &rdram, args.width, args.height)
            .with_context(|| format!("writing {}", path.display()))?;
    }

    let text = serde_json::to_string_pretty(&report)?;
    match &args.report {
        Some(path) => {
            let mut file = File::create(path)?;
            writeln!(file, "{}", text)?;
            log::info!("Report written to {}", path.display());
        }
        None => println!("{}", text),
    }

    Ok(())
}
