// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.
// The command and sync sections are sliced into `CommandSettings` and
// `SyncLimits`, which is all the command engine ever sees of the config.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::backend::command_manager::CommandSettings;
use crate::backend::sync::SyncLimits;

/// Root configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub commands: CommandConfig,
    pub sync: SyncConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Vulkan Renderer".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Which native backend drives the device
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Vulkan,
    Headless,
}

/// Graphics settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GraphicsConfig {
    pub backend: BackendKind,
    pub present_mode: String,
    pub clear_color: [f32; 4],
    pub max_frames_in_flight: usize,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Vulkan,
            present_mode: "immediate".to_string(),
            clear_color: [0.1, 0.2, 0.8, 1.0],
            max_frames_in_flight: 2,
        }
    }
}

/// Command buffer pools and the submission pipeline
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CommandConfig {
    /// Hard ceiling on command buffers per pool
    pub max_command_buffer_count: usize,
    /// Buffers allocated per pool growth step
    pub allocation_batch: usize,
    pub recycle_timeout_ms: u64,
    pub frame_timeout_ms: u64,
    /// Warn every N consecutive deferrals of the same buffer
    pub deferral_warning_threshold: u32,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            max_command_buffer_count: 64,
            allocation_batch: 4,
            recycle_timeout_ms: 3000,
            frame_timeout_ms: 5000,
            deferral_warning_threshold: 64,
        }
    }
}

/// Semaphore pool capacities
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SyncConfig {
    pub max_semaphore_count: usize,
    pub max_timeline_semaphore_count: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_semaphore_count: 64,
            max_timeline_semaphore_count: 64,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "vulkan_debug.log".to_string(),
            show_fps: true,
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

        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Parse and validate configuration text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the command engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.graphics.max_frames_in_flight == 0 {
            anyhow::bail!("graphics.max_frames_in_flight must be at least 1");
        }
        if self.commands.max_command_buffer_count == 0 {
            anyhow::bail!("commands.max_command_buffer_count must be at least 1");
        }
        if self.commands.recycle_timeout_ms == 0 || self.commands.frame_timeout_ms == 0 {
            anyhow::bail!("commands timeouts must be non-zero");
        }
        if self.commands.deferral_warning_threshold == 0 {
            anyhow::bail!("commands.deferral_warning_threshold must be at least 1");
        }
        if self.sync.max_semaphore_count == 0 || self.sync.max_timeline_semaphore_count == 0 {
            anyhow::bail!("sync semaphore capacities must be at least 1");
        }
        Ok(())
    }

    pub fn recycle_timeout(&self) -> Duration {
        Duration::from_millis(self.commands.recycle_timeout_ms)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.commands.frame_timeout_ms)
    }

    pub fn command_settings(&self) -> CommandSettings {
        CommandSettings {
            max_command_buffer_count: self.commands.max_command_buffer_count,
            allocation_batch: self.commands.allocation_batch.max(1),
            recycle_timeout: self.recycle_timeout(),
            deferral_warning_threshold: self.commands.deferral_warning_threshold,
        }
    }

    pub fn sync_limits(&self) -> SyncLimits {
        SyncLimits {
            max_semaphore_count: self.sync.max_semaphore_count,
            max_timeline_semaphore_count: self.sync.max_timeline_semaphore_count,
        }
    }

    /// Get present mode as Vulkan enum
    pub fn get_present_mode(&self) -> ash::vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => ash::vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => ash::vk::PresentModeKHR::MAILBOX,
            "fifo" => ash::vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => ash::vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to IMMEDIATE",
                    self.graphics.present_mode
                );
                ash::vk::PresentModeKHR::IMMEDIATE
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.commands.max_command_buffer_count, 64);
        assert_eq!(config.recycle_timeout(), Duration::from_secs(3));
        assert_eq!(config.frame_timeout(), Duration::from_secs(5));
        assert_eq!(config.graphics.max_frames_in_flight, 2);
        assert_eq!(config.graphics.backend, BackendKind::Vulkan);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = Config::from_toml_str(
            r#"
            [graphics]
            backend = "headless"
            max_frames_in_flight = 3

            [sync]
            max_timeline_semaphore_count = 16
            "#,
        )
        .unwrap();

        assert_eq!(config.graphics.backend, BackendKind::Headless);
        assert_eq!(config.graphics.max_frames_in_flight, 3);
        assert_eq!(config.graphics.present_mode, "immediate");
        assert_eq!(config.sync_limits().max_timeline_semaphore_count, 16);
        assert_eq!(config.sync_limits().max_semaphore_count, 64);
    }

    #[test]
    fn zero_frames_in_flight_is_rejected() {
        let err = Config::from_toml_str("[graphics]\nmax_frames_in_flight = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_frames_in_flight"));
    }

    #[test]
    fn zero_allocation_batch_is_clamped() {
        let config = Config::from_toml_str("[commands]\nallocation_batch = 0\n").unwrap();
        assert_eq!(config.command_settings().allocation_batch, 1);
    }

    #[test]
    fn unknown_present_mode_falls_back_to_immediate() {
        let mut config = Config::default();
        config.graphics.present_mode = "vsync-please".to_string();
        assert_eq!(config.get_present_mode(), ash::vk::PresentModeKHR::IMMEDIATE);
        config.graphics.present_mode = "FIFO".to_string();
        assert_eq!(config.get_present_mode(), ash::vk::PresentModeKHR::FIFO);
    }
}
