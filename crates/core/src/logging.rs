//! Centralized logging for the HLE pipeline.
//!
//! Every pipeline thread (producer, render, present, idle) logs through
//! [`log`]. Messages are built lazily, filtered per category, and rate
//! limited so that a misbehaving frame loop cannot flood the output.
//!
//! # Architecture
//!
//! - **LogConfig**: thread-safe global configuration using atomic operations
//! - **LogLevel**: hierarchical log levels (Off < Error < Warn < Info < Debug < Trace)
//! - **LogCategory**: pipeline components (workloads, presents, framebuffers, ...)
//! - **log()**: common entry point, with asynchronous file output
//!
//! # Usage
//!
//! ```rust
//! use hle_core::logging::{log, LogCategory, LogLevel};
//!
//! log(LogCategory::Workload, LogLevel::Debug, || {
//!     format!("Workload {} submitted", 42)
//! });
//! ```

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// Log level for controlling verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    /// Parse log level from string (case-insensitive)
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    fn from_u8(val: u8) -> Self {
        match val {
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            5 => LogLevel::Trace,
            _ => LogLevel::Off,
        }
    }
}

/// Log category for the pipeline components
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogCategory {
    /// Workload submission, render thread, frame matching results
    Workload,
    /// Present thread, swap chain, pacing
    Present,
    /// Framebuffer identity table and RDRAM synchronization
    Framebuffer,
    /// Render target creation, resize, multisampling resets
    RenderTarget,
    /// Tick accounting, sub-frame planning and skips
    Interpolation,
    /// Device/backend errors
    Gpu,
    /// Unimplemented paths
    Stubs,
}

const CATEGORY_COUNT: usize = 7;

impl LogCategory {
    pub const ALL: [LogCategory; CATEGORY_COUNT] = [
        LogCategory::Workload,
        LogCategory::Present,
        LogCategory::Framebuffer,
        LogCategory::RenderTarget,
        LogCategory::Interpolation,
        LogCategory::Gpu,
        LogCategory::Stubs,
    ];

    fn index(self) -> usize {
        match self {
            LogCategory::Workload => 0,
            LogCategory::Present => 1,
            LogCategory::Framebuffer => 2,
            LogCategory::RenderTarget => 3,
            LogCategory::Interpolation => 4,
            LogCategory::Gpu => 5,
            LogCategory::Stubs => 6,
        }
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Per-category sliding-window rate limiter.
struct RateLimiter {
    max_logs_per_second: AtomicUsize,
    window_duration: Duration,
    state: Mutex<[CategoryWindow; CATEGORY_COUNT]>,
}

#[derive(Default)]
struct CategoryWindow {
    timestamps: VecDeque<Instant>,
    dropped: usize,
    last_drop_report: Option<Instant>,
}

impl RateLimiter {
    fn new(max_logs_per_second: usize) -> Self {
        Self {
            max_logs_per_second: AtomicUsize::new(max_logs_per_second),
            window_duration: Duration::from_secs(1),
            state: Mutex::new(Default::default()),
        }
    }

    fn set_max_logs_per_second(&self, max: usize) {
        self.max_logs_per_second.store(max, Ordering::Relaxed);
    }

    fn get_max_logs_per_second(&self) -> usize {
        self.max_logs_per_second.load(Ordering::Relaxed)
    }

    /// Returns (allowed, dropped_count) where dropped_count is Some(n) if drops should be reported
    fn should_allow(&self, category: LogCategory) -> (bool, Option<usize>) {
        let now = Instant::now();
        let mut state = lock_or_recover(&self.state);
        let window = &mut state[category.index()];

        while let Some(&front) = window.timestamps.front() {
            if now.duration_since(front) > self.window_duration {
                window.timestamps.pop_front();
            } else {
                break;
            }
        }

        if window.timestamps.len() < self.get_max_logs_per_second() {
            window.timestamps.push_back(now);
            if window.dropped > 0 {
                let dropped = std::mem::take(&mut window.dropped);
                window.last_drop_report = Some(now);
                return (true, Some(dropped));
            }
            return (true, None);
        }

        window.dropped += 1;
        let should_report = match window.last_drop_report {
            None => true,
            Some(last) => now.duration_since(last) >= Duration::from_secs(1),
        };
        if should_report {
            let dropped = std::mem::take(&mut window.dropped);
            window.last_drop_report = Some(now);
            (false, Some(dropped))
        } else {
            (false, None)
        }
    }
}

/// Global logging configuration
pub struct LogConfig {
    global_level: AtomicU8,
    category_levels: [AtomicU8; CATEGORY_COUNT],
    log_sender: Mutex<Option<Sender<String>>>,
    file_logging_enabled: AtomicBool,
    rate_limiter: RateLimiter,
}

impl LogConfig {
    /// Create a new LogConfig with all logging disabled and default rate limit (60 logs/second)
    fn new() -> Self {
        Self {
            global_level: AtomicU8::new(LogLevel::Off as u8),
            category_levels: Default::default(),
            log_sender: Mutex::new(None),
            file_logging_enabled: AtomicBool::new(false),
            rate_limiter: RateLimiter::new(60),
        }
    }

    /// Get the global singleton instance
    pub fn global() -> &'static Self {
        use std::sync::OnceLock;
        static INSTANCE: OnceLock<LogConfig> = OnceLock::new();
        INSTANCE.get_or_init(LogConfig::new)
    }

    pub fn set_global_level(&self, level: LogLevel) {
        self.global_level.store(level as u8, Ordering::Relaxed);
    }

    pub fn get_global_level(&self) -> LogLevel {
        LogLevel::from_u8(self.global_level.load(Ordering::Relaxed))
    }

    pub fn set_level(&self, category: LogCategory, level: LogLevel) {
        self.category_levels[category.index()].store(level as u8, Ordering::Relaxed);
    }

    pub fn get_level(&self, category: LogCategory) -> LogLevel {
        LogLevel::from_u8(self.category_levels[category.index()].load(Ordering::Relaxed))
    }

    /// A category-specific level wins over the global level unless it is Off.
    pub fn should_log(&self, category: LogCategory, level: LogLevel) -> bool {
        if level == LogLevel::Off {
            return false;
        }
        let category_level = self.get_level(category);
        if category_level != LogLevel::Off {
            level <= category_level
        } else {
            level <= self.get_global_level()
        }
    }

    /// Reset all logging to Off
    pub fn reset(&self) {
        self.set_global_level(LogLevel::Off);
        for category in LogCategory::ALL {
            self.set_level(category, LogLevel::Off);
        }
    }

    /// Set the maximum logs per second per category
    pub fn set_rate_limit(&self, max_logs_per_second: usize) {
        self.rate_limiter
            .set_max_logs_per_second(max_logs_per_second);
    }

    pub fn get_rate_limit(&self) -> usize {
        self.rate_limiter.get_max_logs_per_second()
    }

    /// Route output to a file, written from a background thread.
    ///
    /// A previously configured file is closed once its writer drains.
    pub fn set_log_file(&self, path: PathBuf) -> std::io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let (sender, receiver) = channel::<String>();

        thread::Builder::new()
            .name("log-writer".to_string())
            .spawn(move || {
                let mut file = file;
                while let Ok(message) = receiver.recv() {
                    // Logging must never take the pipeline down.
                    let _ = writeln!(file, "{}", message);
                    let _ = file.flush();
                }
                let _ = file.flush();
            })?;

        *lock_or_recover(&self.log_sender) = Some(sender);
        self.file_logging_enabled.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Stop logging to file and fall back to stderr
    pub fn clear_log_file(&self) {
        *lock_or_recover(&self.log_sender) = None;
        self.file_logging_enabled.store(false, Ordering::Relaxed);
    }

    fn write_message(&self, message: &str) {
        if self.file_logging_enabled.load(Ordering::Relaxed) {
            let log_sender = lock_or_recover(&self.log_sender);
            match log_sender.as_ref() {
                Some(sender) if sender.send(message.to_string()).is_ok() => {}
                _ => eprintln!("{}", message),
            }
        } else {
            eprintln!("{}", message);
        }
    }
}

/// Log a message with the specified category and level
///
/// The closure only runs when the category/level is enabled and the rate
/// limiter lets the message through. When messages are dropped, a summary
/// line is emitted at most once per second per category.
///
/// ```rust
/// use hle_core::logging::{log, LogCategory, LogLevel};
///
/// log(LogCategory::Present, LogLevel::Warn, || {
///     "Swap chain resize failed, skipping present".to_string()
/// });
/// ```
pub fn log<F>(category: LogCategory, level: LogLevel, message_fn: F)
where
    F: FnOnce() -> String,
{
    let config = LogConfig::global();
    if !config.should_log(category, level) {
        return;
    }

    let (allowed, dropped_count) = config.rate_limiter.should_allow(category);
    if let Some(count) = dropped_count.filter(|&count| count > 0) {
        config.write_message(&format!(
            "[{:?}] WARNING: Rate limit exceeded, {} log message(s) dropped in the last second",
            category, count
        ));
    }

    if allowed {
        let message = message_fn();
        config.write_message(&format!("[{:?}] {}", category, message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(LogLevel::from_str("off"), Some(LogLevel::Off));
        assert_eq!(LogLevel::from_str("ERR"), Some(LogLevel::Error));
        assert_eq!(LogLevel::from_str("WARNING"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::from_str("3"), Some(LogLevel::Info));
        assert_eq!(LogLevel::from_str("Debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::from_str("trace"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::from_str("verbose"), None);
    }

    #[test]
    fn test_log_level_ordering() {
        assert!(LogLevel::Off < LogLevel::Error);
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Trace);
    }

    #[test]
    fn test_category_levels_are_independent() {
        let config = LogConfig::new();
        assert_eq!(config.get_level(LogCategory::Workload), LogLevel::Off);

        config.set_level(LogCategory::Present, LogLevel::Debug);
        assert_eq!(config.get_level(LogCategory::Present), LogLevel::Debug);
        assert_eq!(config.get_level(LogCategory::Workload), LogLevel::Off);
    }

    #[test]
    fn test_category_level_overrides_global() {
        let config = LogConfig::new();
        config.set_global_level(LogLevel::Error);
        config.set_level(LogCategory::Interpolation, LogLevel::Debug);

        assert!(config.should_log(LogCategory::Interpolation, LogLevel::Debug));
        assert!(!config.should_log(LogCategory::Framebuffer, LogLevel::Warn));
        assert!(config.should_log(LogCategory::Framebuffer, LogLevel::Error));
    }

    #[test]
    fn test_off_messages_never_log() {
        let config = LogConfig::new();
        config.set_global_level(LogLevel::Trace);
        assert!(!config.should_log(LogCategory::Gpu, LogLevel::Off));
    }

    #[test]
    fn test_reset() {
        let config = LogConfig::new();
        config.set_global_level(LogLevel::Trace);
        config.set_level(LogCategory::RenderTarget, LogLevel::Info);

        config.reset();

        assert_eq!(config.get_global_level(), LogLevel::Off);
        for category in LogCategory::ALL {
            assert_eq!(config.get_level(category), LogLevel::Off);
        }
    }

    #[test]
    fn test_rate_limiter_blocks_over_limit() {
        let limiter = RateLimiter::new(60);
        for _ in 0..60 {
            let (allowed, _) = limiter.should_allow(LogCategory::Workload);
            assert!(allowed, "Should allow logs within the rate limit");
        }
        let (allowed, _) = limiter.should_allow(LogCategory::Workload);
        assert!(!allowed, "Should block logs exceeding the rate limit");
    }

    #[test]
    fn test_rate_limiter_per_category() {
        let limiter = RateLimiter::new(5);
        for _ in 0..5 {
            limiter.should_allow(LogCategory::Present);
        }
        assert!(!limiter.should_allow(LogCategory::Present).0);
        assert!(limiter.should_allow(LogCategory::Framebuffer).0);
    }

    #[test]
    fn test_rate_limit_is_configurable() {
        let config = LogConfig::new();
        assert_eq!(config.get_rate_limit(), 60);
        config.set_rate_limit(2);
        assert_eq!(config.get_rate_limit(), 2);
        assert!(config.rate_limiter.should_allow(LogCategory::Stubs).0);
        assert!(config.rate_limiter.should_allow(LogCategory::Stubs).0);
        assert!(!config.rate_limiter.should_allow(LogCategory::Stubs).0);
    }

    #[test]
    fn test_log_file_receives_messages() {
        let path = std::env::temp_dir().join(format!("hle-log-{}.txt", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let config = LogConfig::new();
        config.set_log_file(path.clone()).unwrap();
        config.write_message("[Present] Swap chain lost");
        config.clear_log_file();

        let mut contents = String::new();
        for _ in 0..200 {
            contents = std::fs::read_to_string(&path).unwrap_or_default();
            if contents.ends_with('\n') {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        let _ = std::fs::remove_file(&path);
        assert_eq!(contents, "[Present] Swap chain lost\n");
    }

    #[test]
    fn test_rate_limiter_reports_dropped_count() {
        let limiter = RateLimiter::new(5);
        for _ in 0..5 {
            limiter.should_allow(LogCategory::Gpu);
        }
        // The first drop is reported immediately, the next nine are held back.
        let (allowed, first_report) = limiter.should_allow(LogCategory::Gpu);
        assert!(!allowed);
        assert_eq!(first_report, Some(1));
        for _ in 0..9 {
            limiter.should_allow(LogCategory::Gpu);
        }

        std::thread::sleep(Duration::from_millis(1100));

        let (allowed, dropped) = limiter.should_allow(LogCategory::Gpu);
        assert!(allowed, "Should be allowed after window slides");
        assert_eq!(dropped, Some(9));
    }
}
