// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.
// The file-level Config is turned into a BackendConfig right before build().

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{BackendKind, PresentTarget};
use crate::error::ContractMode;

/// Root configuration structure
#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub app: AppConfig,
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
}

/// Application identity reported to the driver
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
    pub version: AppVersion,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "Mix".to_string(),
            version: AppVersion::new(0, 1, 0),
        }
    }
}

/// major.minor.patch, written as "1.2.3" in the config file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub struct AppVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl AppVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    pub fn to_vk(self) -> u32 {
        vk::make_api_version(0, self.major, self.minor, self.patch)
    }
}

impl TryFrom<String> for AppVersion {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        let parts: Vec<&str> = value.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(format!("expected major.minor.patch, got '{}'", value));
        }
        let parse = |s: &str| {
            s.parse::<u32>()
                .map_err(|e| format!("bad version component '{}': {}", s, e))
        };
        Ok(Self::new(parse(parts[0])?, parse(parts[1])?, parse(parts[2])?))
    }
}

impl std::fmt::Display for AppVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Window settings
#[derive(Debug, Deserialize, Clone, PartialEq)]
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
            title: "Mix Renderer".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct GraphicsConfig {
    pub backend: BackendKind,
    /// Ordered preference; the first mode the surface supports wins, FIFO otherwise.
    pub present_modes: Vec<String>,
    pub image_count: u32,
    pub preferred_device: usize,
    pub srgb: bool,
    pub clear_color: [f32; 4],
    pub fence_timeout_ms: u64,
    pub acquire_timeout_ms: u64,
    pub instance_extensions: Vec<String>,
    pub device_extensions: Vec<String>,
    pub descriptors: DescriptorConfig,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Vulkan,
            present_modes: vec!["fifo".to_string()],
            image_count: 2,
            preferred_device: 0,
            srgb: true,
            clear_color: [0.1, 0.2, 0.8, 1.0],
            fence_timeout_ms: 1000,
            acquire_timeout_ms: 1000,
            instance_extensions: Vec::new(),
            device_extensions: Vec::new(),
            descriptors: DescriptorConfig::default(),
        }
    }
}

/// Descriptor pool sizing, fixed at build time
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct DescriptorConfig {
    pub uniform_buffers: u32,
    pub dynamic_uniform_buffers: u32,
    pub combined_image_samplers: u32,
    pub max_sets: u32,
}

impl Default for DescriptorConfig {
    fn default() -> Self {
        Self {
            uniform_buffers: 64,
            dynamic_uniform_buffers: 32,
            combined_image_samplers: 128,
            max_sets: 128,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
    /// Overrides the build-profile default (assert in debug, report in release).
    pub contract_mode: Option<ContractMode>,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "mix_gfx.log".to_string(),
            show_fps: true,
            contract_mode: None,
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

    /// Present mode preference list as Vulkan enums. Unknown names are skipped.
    pub fn present_modes(&self) -> Vec<vk::PresentModeKHR> {
        self.graphics
            .present_modes
            .iter()
            .filter_map(|name| {
                let mode = parse_present_mode(name);
                if mode.is_none() {
                    log::warn!("Unknown present mode '{}', ignoring", name);
                }
                mode
            })
            .collect()
    }

    pub fn surface_format(&self) -> vk::Format {
        if self.graphics.srgb {
            vk::Format::B8G8R8A8_SRGB
        } else {
            vk::Format::B8G8R8A8_UNORM
        }
    }

    /// Build the runtime backend configuration for a window.
    pub fn backend_config(&self, target: Arc<dyn PresentTarget>) -> BackendConfig {
        let graphics = &self.graphics;
        let descriptors = &graphics.descriptors;

        BackendConfig {
            app_name: self.app.name.clone(),
            app_version: self.app.version,
            instance_extensions: graphics.instance_extensions.clone(),
            device_extensions: graphics.device_extensions.clone(),
            // Validation layers only make sense in debug builds
            validation: cfg!(debug_assertions) && self.debug.validation_layers,
            preferred_device: graphics.preferred_device,
            target,
            image_count: graphics.image_count,
            present_modes: self.present_modes(),
            surface_format: self.surface_format(),
            clear_color: graphics.clear_color,
            fence_timeout: Duration::from_millis(graphics.fence_timeout_ms),
            acquire_timeout: Duration::from_millis(graphics.acquire_timeout_ms),
            descriptor_sizes: vec![
                pool_size(vk::DescriptorType::UNIFORM_BUFFER, descriptors.uniform_buffers),
                pool_size(
                    vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                    descriptors.dynamic_uniform_buffers,
                ),
                pool_size(
                    vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    descriptors.combined_image_samplers,
                ),
            ],
            max_descriptor_sets: descriptors.max_sets,
            contract_mode: self.debug.contract_mode.unwrap_or_default(),
        }
    }

    /// What a reload from `self` to `new` requires of the running backend.
    pub fn reload_effects(&self, new: &Config) -> ReloadEffects {
        ReloadEffects {
            clear_color: (self.graphics.clear_color != new.graphics.clear_color)
                .then_some(new.graphics.clear_color),
            needs_rebuild: self.graphics.present_modes != new.graphics.present_modes
                || self.graphics.image_count != new.graphics.image_count
                || self.graphics.srgb != new.graphics.srgb,
            needs_restart: self.graphics.backend != new.graphics.backend
                || self.graphics.preferred_device != new.graphics.preferred_device
                || self.graphics.instance_extensions != new.graphics.instance_extensions
                || self.graphics.device_extensions != new.graphics.device_extensions
                || self.graphics.descriptors != new.graphics.descriptors,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ReloadEffects {
    pub clear_color: Option<[f32; 4]>,
    pub needs_rebuild: bool,
    /// Device-level settings changed; only a full teardown + build applies them.
    pub needs_restart: bool,
}

fn pool_size(ty: vk::DescriptorType, descriptor_count: u32) -> vk::DescriptorPoolSize {
    vk::DescriptorPoolSize { ty, descriptor_count }
}

pub fn parse_present_mode(name: &str) -> Option<vk::PresentModeKHR> {
    match name.to_lowercase().as_str() {
        "immediate" => Some(vk::PresentModeKHR::IMMEDIATE),
        "mailbox" => Some(vk::PresentModeKHR::MAILBOX),
        "fifo" => Some(vk::PresentModeKHR::FIFO),
        "fifo_relaxed" => Some(vk::PresentModeKHR::FIFO_RELAXED),
        _ => None,
    }
}

// =============================================================================
// BACKEND CONFIG - runtime settings consumed by GraphicsBackend::build
// =============================================================================

#[derive(Clone)]
pub struct BackendConfig {
    pub app_name: String,
    pub app_version: AppVersion,
    pub instance_extensions: Vec<String>,
    pub device_extensions: Vec<String>,
    pub validation: bool,
    /// Out-of-range values fall back to device 0.
    pub preferred_device: usize,
    pub target: Arc<dyn PresentTarget>,
    /// Minimum swapchain images, at least 2.
    pub image_count: u32,
    pub present_modes: Vec<vk::PresentModeKHR>,
    pub surface_format: vk::Format,
    pub clear_color: [f32; 4],
    pub fence_timeout: Duration,
    pub acquire_timeout: Duration,
    pub descriptor_sizes: Vec<vk::DescriptorPoolSize>,
    pub max_descriptor_sets: u32,
    pub contract_mode: ContractMode,
}

impl BackendConfig {
    /// Defaults from an empty config file, targeting `target`.
    pub fn new(target: Arc<dyn PresentTarget>) -> Self {
        Config::default().backend_config(target)
    }
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("app_name", &self.app_name)
            .field("app_version", &self.app_version)
            .field("instance_extensions", &self.instance_extensions)
            .field("device_extensions", &self.device_extensions)
            .field("validation", &self.validation)
            .field("preferred_device", &self.preferred_device)
            .field("target_extent", &self.target.drawable_extent())
            .field("image_count", &self.image_count)
            .field("present_modes", &self.present_modes)
            .field("surface_format", &self.surface_format)
            .field("fence_timeout", &self.fence_timeout)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("max_descriptor_sets", &self.max_descriptor_sets)
            .field("contract_mode", &self.contract_mode)
            .finish()
    }
}

// =============================================================================
// HOT RELOAD
// =============================================================================

/// Watches the config file and hands back freshly parsed configs when it changes.
pub struct ConfigWatcher {
    path: PathBuf,
    events: mpsc::Receiver<notify::Result<notify::Event>>,
    _watcher: notify::RecommendedWatcher,
}

impl ConfigWatcher {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        use notify::Watcher;

        let path = path.as_ref().to_path_buf();
        let (tx, rx) = mpsc::channel();
        let mut watcher = notify::recommended_watcher(move |event| {
            let _ = tx.send(event);
        })
        .context("Failed to create file watcher")?;

        watcher
            .watch(&path, notify::RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {:?}", path))?;

        log::info!("Watching {:?} for changes", path);

        Ok(Self {
            path,
            events: rx,
            _watcher: watcher,
        })
    }

    /// Non-blocking. Returns the reloaded config if the file changed since the last poll.
    pub fn poll(&self) -> Option<Config> {
        let mut changed = false;
        while let Ok(event) = self.events.try_recv() {
            match event {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => changed = true,
                Ok(_) => {}
                Err(e) => log::warn!("Config watch error: {}", e),
            }
        }

        if !changed {
            return None;
        }

        match Config::load_from_path(&self.path) {
            Ok(config) => Some(config),
            Err(e) => {
                log::warn!("Ignoring config change: {:#}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessTarget;
    use std::io::Write;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from_path(dir.path().join("nope.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn partial_file_keeps_defaults_for_the_rest() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[app]
name = "Demo"
version = "1.4.2"

[graphics]
backend = "headless"
present_modes = ["mailbox", "bogus", "fifo"]
image_count = 3
"#
        )
        .unwrap();

        let config = Config::load_from_path(file.path()).unwrap();
        assert_eq!(config.app.name, "Demo");
        assert_eq!(config.app.version, AppVersion::new(1, 4, 2));
        assert_eq!(config.graphics.backend, BackendKind::Headless);
        assert_eq!(config.graphics.image_count, 3);
        assert_eq!(config.window, WindowConfig::default());
        assert_eq!(
            config.present_modes(),
            vec![vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO]
        );
    }

    #[test]
    fn malformed_version_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[app]\nversion = \"1.x\"").unwrap();
        assert!(Config::load_from_path(file.path()).is_err());
    }

    #[test]
    fn backend_config_carries_descriptor_sizes() {
        let target = Arc::new(HeadlessTarget::new(640, 480));
        let backend = Config::default().backend_config(target);

        assert_eq!(backend.image_count, 2);
        assert_eq!(backend.present_modes, vec![vk::PresentModeKHR::FIFO]);
        assert_eq!(backend.max_descriptor_sets, 128);
        let counts: Vec<u32> = backend
            .descriptor_sizes
            .iter()
            .map(|size| size.descriptor_count)
            .collect();
        assert_eq!(counts, vec![64, 32, 128]);
        assert_eq!(backend.app_version.to_vk(), vk::make_api_version(0, 0, 1, 0));
    }

    #[test]
    fn reload_effects_classify_changes() {
        let old = Config::default();
        let mut new = old.clone();
        assert_eq!(old.reload_effects(&new), ReloadEffects::default());

        new.graphics.clear_color = [1.0, 0.0, 0.0, 1.0];
        new.graphics.present_modes = vec!["mailbox".to_string()];
        let effects = old.reload_effects(&new);
        assert_eq!(effects.clear_color, Some([1.0, 0.0, 0.0, 1.0]));
        assert!(effects.needs_rebuild);
        assert!(!effects.needs_restart);

        new.graphics.preferred_device = 3;
        assert!(old.reload_effects(&new).needs_restart);
    }
}
