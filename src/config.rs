// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.
// `context_config` turns the file settings into the backend's init-time
// configuration; the window handle is attached by the caller.

use crate::backend::{BackendKind, CaptureBufferType, ContextConfig, PresentMode};
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "vkgfx".to_string(),
            width: 1280,
            height: 720,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub backend: String,
    pub offscreen: bool,
    /// Offscreen size; onscreen contexts use the window size
    pub width: u32,
    pub height: u32,
    pub samples: u32,
    pub clear_color: [f32; 4],
    pub viewport: Option<[i32; 4]>,
    pub scissor: Option<[i32; 4]>,
    pub max_frames_in_flight: usize,
    pub present_mode: String,
    pub capture_buffer_type: String,
    /// Frames rendered by the offscreen demo
    pub frames: u32,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            backend: "vulkan".to_string(),
            offscreen: false,
            width: 1280,
            height: 720,
            samples: 0,
            clear_color: [0.1, 0.2, 0.8, 1.0],
            viewport: None,
            scissor: None,
            max_frames_in_flight: 2,
            present_mode: "fifo".to_string(),
            capture_buffer_type: "cpu".to_string(),
            frames: 1,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub debug_capture: bool,
    /// 0 waits forever
    pub fence_timeout_ms: u64,
    pub log_level: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            debug_capture: false,
            fence_timeout_ms: 0,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Present mode, FIFO when the name is unknown
    pub fn present_mode(&self) -> PresentMode {
        let name = self.graphics.present_mode.to_lowercase();
        PresentMode::from_name(&name).unwrap_or_else(|| {
            log::warn!(
                "Unknown present mode '{}', defaulting to FIFO",
                self.graphics.present_mode
            );
            PresentMode::Fifo
        })
    }

    pub fn fence_timeout_ns(&self) -> u64 {
        match self.debug.fence_timeout_ms {
            0 => u64::MAX,
            ms => ms.saturating_mul(1_000_000),
        }
    }

    /// Backend configuration for these settings
    pub fn context_config(&self) -> Result<ContextConfig> {
        let backend = BackendKind::from_name(&self.graphics.backend.to_lowercase())
            .ok_or_else(|| anyhow!("Unknown backend '{}'", self.graphics.backend))?;
        let capture_buffer_type = CaptureBufferType::from_name(&self.graphics.capture_buffer_type)
            .context("Invalid capture buffer type")?;

        let (width, height) = if self.graphics.offscreen {
            (self.graphics.width, self.graphics.height)
        } else {
            (self.window.width, self.window.height)
        };

        Ok(ContextConfig {
            backend,
            width,
            height,
            samples: self.graphics.samples,
            offscreen: self.graphics.offscreen,
            clear_color: self.graphics.clear_color,
            viewport: self.graphics.viewport,
            scissor: self.graphics.scissor,
            max_frames_in_flight: self.graphics.max_frames_in_flight,
            present_mode: self.present_mode(),
            capture_buffer_type,
            debug_capture: self.debug.debug_capture,
            validation: self.debug.validation_layers,
            fence_timeout: self.fence_timeout_ns(),
            window: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = Config::load_from_path("does/not/exist.toml").unwrap();
        assert_eq!(config.graphics.backend, "vulkan");
        assert_eq!(config.graphics.max_frames_in_flight, 2);
        assert_eq!(config.fence_timeout_ns(), u64::MAX);
    }

    #[test]
    fn test_unknown_present_mode_falls_back_to_fifo() {
        let mut config = Config::default();
        config.graphics.present_mode = "Mailbox".to_string();
        assert_eq!(config.present_mode(), PresentMode::Mailbox);
        config.graphics.present_mode = "adaptive".to_string();
        assert_eq!(config.present_mode(), PresentMode::Fifo);
    }

    #[test]
    fn test_fence_timeout_conversion() {
        let mut config = Config::default();
        config.debug.fence_timeout_ms = 250;
        assert_eq!(config.fence_timeout_ns(), 250_000_000);
    }
}
