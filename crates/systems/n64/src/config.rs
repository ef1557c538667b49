//! User configuration
//!
//! Settings are stored as JSON by the host. Every field has a serde default,
//! so files written by older versions keep loading.

use crate::render_target::RenderTargetConfig;
use crate::rhi::{DeviceCapabilities, GraphicsApi};
use crate::HleError;
use hle_core::logging::{log, LogCategory, LogLevel};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Lines of a standard N64 frame, used for window-relative scaling.
const NATIVE_HEIGHT: u32 = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ResolutionMode {
    /// Native N64 resolution
    Original,
    /// Largest integer multiple that fits the window
    #[default]
    WindowIntegerScale,
    /// `resolution_multiplier`
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RefreshRateMode {
    /// Present at the rate the game runs at
    #[default]
    Original,
    /// Present at the display's refresh rate
    Display,
    /// Present at `refresh_rate_target`
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserConfiguration {
    /// `None` selects the platform default
    #[serde(default)]
    pub graphics_api: Option<GraphicsApi>,
    #[serde(default)]
    pub resolution: ResolutionMode,
    #[serde(default = "default_multiplier")]
    pub resolution_multiplier: f32,
    #[serde(default = "default_one")]
    pub downsample_multiplier: u32,
    #[serde(default = "default_one")]
    pub msaa_samples: u32,
    #[serde(default)]
    pub refresh_rate: RefreshRateMode,
    #[serde(default = "default_refresh_target")]
    pub refresh_rate_target: u32,
    #[serde(default = "default_true")]
    pub frame_interpolation: bool,
    #[serde(default = "default_true")]
    pub idle_work: bool,
    #[serde(default = "default_true")]
    pub skip_buffering: bool,
    #[serde(default = "default_ring_size")]
    pub workload_ring_size: usize,
    #[serde(default = "default_ring_size")]
    pub present_ring_size: usize,
}

fn default_multiplier() -> f32 {
    2.0
}

fn default_one() -> u32 {
    1
}

fn default_refresh_target() -> u32 {
    60
}

fn default_true() -> bool {
    true
}

fn default_ring_size() -> usize {
    4
}

impl Default for UserConfiguration {
    fn default() -> Self {
        Self {
            graphics_api: None,
            resolution: ResolutionMode::default(),
            resolution_multiplier: default_multiplier(),
            downsample_multiplier: 1,
            msaa_samples: 1,
            refresh_rate: RefreshRateMode::default(),
            refresh_rate_target: default_refresh_target(),
            frame_interpolation: true,
            idle_work: true,
            skip_buffering: true,
            workload_ring_size: default_ring_size(),
            present_ring_size: default_ring_size(),
        }
    }
}

impl UserConfiguration {
    pub fn validate(&self) -> Result<(), HleError> {
        let invalid = |message: String| -> Result<(), HleError> {
            Err(HleError::InvalidConfiguration(message))
        };

        if !matches!(self.msaa_samples, 1 | 2 | 4 | 8) {
            return invalid(format!("MSAA sample count {}", self.msaa_samples));
        }
        if !(self.resolution_multiplier > 0.0 && self.resolution_multiplier <= 16.0) {
            return invalid(format!(
                "resolution multiplier {}",
                self.resolution_multiplier
            ));
        }
        if !(1..=4).contains(&self.downsample_multiplier) {
            return invalid(format!(
                "downsample multiplier {}",
                self.downsample_multiplier
            ));
        }
        if self.refresh_rate == RefreshRateMode::Manual
            && !(1..=1000).contains(&self.refresh_rate_target)
        {
            return invalid(format!("refresh rate target {}", self.refresh_rate_target));
        }
        // A paused workload keeps its slot, so the producer needs two more.
        if self.workload_ring_size < 3 {
            return invalid(format!("workload ring size {}", self.workload_ring_size));
        }
        if self.present_ring_size < 2 {
            return invalid(format!("present ring size {}", self.present_ring_size));
        }
        Ok(())
    }

    /// Check values that depend on what the device supports.
    pub fn validate_for(&self, capabilities: &DeviceCapabilities) -> Result<(), HleError> {
        self.validate()?;
        if self.msaa_samples > capabilities.max_samples {
            return Err(HleError::InvalidConfiguration(format!(
                "MSAA sample count {} exceeds device maximum {}",
                self.msaa_samples, capabilities.max_samples
            )));
        }
        Ok(())
    }

    pub fn graphics_api(&self) -> GraphicsApi {
        self.graphics_api.unwrap_or_else(GraphicsApi::platform_default)
    }

    /// Presentation rate for a game running at `original` Hz on a display
    /// refreshing at `display` Hz.
    pub fn target_rate(&self, original: u32, display: u32) -> u32 {
        match self.refresh_rate {
            RefreshRateMode::Original => original,
            RefreshRateMode::Display if display > 0 => display,
            RefreshRateMode::Display => original,
            RefreshRateMode::Manual => self.refresh_rate_target,
        }
    }

    pub fn resolution_scale(&self, window_height: u32) -> f32 {
        match self.resolution {
            ResolutionMode::Original => 1.0,
            ResolutionMode::WindowIntegerScale => (window_height / NATIVE_HEIGHT).max(1) as f32,
            ResolutionMode::Manual => self.resolution_multiplier,
        }
    }

    pub fn render_target_config(&self, window_height: u32) -> RenderTargetConfig {
        RenderTargetConfig {
            resolution_scale: self.resolution_scale(window_height),
            downsample_multiplier: self.downsample_multiplier,
            samples: self.msaa_samples,
        }
    }

    pub fn load(path: &Path) -> Result<Self, HleError> {
        let contents = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, falling back to defaults when the file is missing or
    /// invalid.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(HleError::Io(_)) => Self::default(),
            Err(e) => {
                log(LogCategory::Workload, LogLevel::Warn, || {
                    format!(
                        "Failed to load configuration {}: {}. Using defaults.",
                        path.display(),
                        e
                    )
                });
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), HleError> {
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configuration() {
        let config = UserConfiguration::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.msaa_samples, 1);
        assert_eq!(config.refresh_rate, RefreshRateMode::Original);
        assert!(config.frame_interpolation);
        assert_eq!(config.workload_ring_size, 4);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: UserConfiguration =
            serde_json::from_str(r#"{ "msaa_samples": 4, "refresh_rate": "Display" }"#).unwrap();
        assert_eq!(config.msaa_samples, 4);
        assert_eq!(config.refresh_rate, RefreshRateMode::Display);
        assert_eq!(config.downsample_multiplier, 1);
        assert!(config.skip_buffering);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let config = UserConfiguration {
            msaa_samples: 3,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(HleError::InvalidConfiguration(_))
        ));

        let config = UserConfiguration {
            refresh_rate: RefreshRateMode::Manual,
            refresh_rate_target: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = UserConfiguration {
            msaa_samples: 8,
            ..Default::default()
        };
        let caps = DeviceCapabilities {
            max_samples: 4,
            ..DeviceCapabilities::default()
        };
        assert!(config.validate().is_ok());
        assert!(config.validate_for(&caps).is_err());

        let config = UserConfiguration {
            workload_ring_size: 2,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = UserConfiguration {
            workload_ring_size: 3,
            present_ring_size: 2,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_target_rate_modes() {
        let mut config = UserConfiguration::default();
        assert_eq!(config.target_rate(30, 144), 30);
        config.refresh_rate = RefreshRateMode::Display;
        assert_eq!(config.target_rate(30, 144), 144);
        assert_eq!(config.target_rate(30, 0), 30);
        config.refresh_rate = RefreshRateMode::Manual;
        config.refresh_rate_target = 120;
        assert_eq!(config.target_rate(30, 144), 120);
    }

    #[test]
    fn test_resolution_scale() {
        let mut config = UserConfiguration::default();
        assert_eq!(config.resolution_scale(1080), 4.0);
        assert_eq!(config.resolution_scale(100), 1.0);
        config.resolution = ResolutionMode::Manual;
        config.resolution_multiplier = 1.5;
        assert_eq!(config.render_target_config(1080).resolution_scale, 1.5);
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join("n64_hle_test_config");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");

        let config = UserConfiguration {
            msaa_samples: 4,
            refresh_rate: RefreshRateMode::Manual,
            refresh_rate_target: 144,
            ..Default::default()
        };
        config.save(&path).unwrap();
        let loaded = UserConfiguration::load(&path).unwrap();
        assert_eq!(loaded, config);

        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            UserConfiguration::load(&path),
            Err(HleError::Json(_))
        ));
        assert_eq!(
            UserConfiguration::load_or_default(&path),
            UserConfiguration::default()
        );

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_load_missing_file_defaults() {
        let path = std::env::temp_dir().join("n64_hle_missing_config.json");
        assert_eq!(
            UserConfiguration::load_or_default(&path),
            UserConfiguration::default()
        );
    }
}
