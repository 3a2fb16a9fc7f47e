// Device context - instance, surface and logical device
//
// Responsibilities:
// - Physical device enumeration (no side effects beyond a temporary instance)
// - Device selection with fallback to index 0
// - Queue family choice: graphics+present, dedicated transfer when available
// - Release order: device, then surface, then instance

use ash::vk;
use std::sync::Arc;

use super::gpu::{
    BackendKind, DeviceCapabilities, DeviceRequest, GpuDevice, GpuInstance, GpuPlatform, InstanceDesc,
    OpenedDevice,
};
use crate::config::BackendConfig;
use crate::error::{BackendError, ContractMode, Result};

/// Device features the backend asks for when the device offers them.
fn wanted_features(available: &vk::PhysicalDeviceFeatures) -> vk::PhysicalDeviceFeatures {
    vk::PhysicalDeviceFeatures {
        fill_mode_non_solid: available.fill_mode_non_solid,
        sampler_anisotropy: available.sampler_anisotropy,
        ..Default::default()
    }
}

/// Outcome of device selection: which device, which families, and the opened device.
pub struct SelectedDevice {
    pub capabilities: DeviceCapabilities,
    pub graphics_family: u32,
    pub transfer_family: u32,
    pub opened: OpenedDevice,
}

pub struct DeviceContext {
    kind: BackendKind,
    capabilities: DeviceCapabilities,
    graphics_family: u32,
    transfer_family: u32,
    graphics_queue: vk::Queue,
    transfer_queue: vk::Queue,
    device: Option<Arc<dyn GpuDevice>>,
    surface: vk::SurfaceKHR,
    instance: Option<Box<dyn GpuInstance>>,
    contract: ContractMode,
}

impl DeviceContext {
    /// Capabilities of every physical device, through a short-lived instance.
    pub fn enumerate(platform: &dyn GpuPlatform) -> Result<Vec<DeviceCapabilities>> {
        let devices = platform.enumerate()?;
        for caps in &devices {
            log::info!(
                "GPU {}: {} ({:?}, API {}.{}.{}, {} MiB device-local)",
                caps.index,
                caps.name,
                caps.device_type,
                vk::api_version_major(caps.api_version),
                vk::api_version_minor(caps.api_version),
                vk::api_version_patch(caps.api_version),
                caps.device_local_memory() >> 20
            );
        }
        Ok(devices)
    }

    /// Instance, surface, device selection and logical device, in that order.
    pub fn create(platform: &dyn GpuPlatform, config: &BackendConfig) -> Result<Self> {
        log::info!("Creating {} device context for '{}'", platform.kind(), config.app_name);

        let instance = platform.create_instance(&InstanceDesc {
            app_name: config.app_name.clone(),
            app_version: config.app_version,
            extensions: config.instance_extensions.clone(),
            validation: config.validation,
        })?;

        let capabilities = instance.enumerate()?;
        let surface = instance.create_surface(config.target.as_ref())?;

        match Self::select(instance.as_ref(), config, &capabilities, surface) {
            Ok(selected) => {
                log::info!(
                    "Selected GPU: {} (graphics family {}, transfer family {})",
                    selected.capabilities.name,
                    selected.graphics_family,
                    selected.transfer_family
                );
                Ok(Self {
                    kind: platform.kind(),
                    capabilities: selected.capabilities,
                    graphics_family: selected.graphics_family,
                    transfer_family: selected.transfer_family,
                    graphics_queue: selected.opened.graphics_queue,
                    transfer_queue: selected.opened.transfer_queue,
                    device: Some(selected.opened.device),
                    surface,
                    instance: Some(instance),
                    contract: config.contract_mode,
                })
            }
            Err(err) => {
                instance.destroy_surface(surface);
                Err(err)
            }
        }
    }

    /// Pick a physical device and open it.
    pub fn select(
        instance: &dyn GpuInstance,
        config: &BackendConfig,
        capabilities: &[DeviceCapabilities],
        surface: vk::SurfaceKHR,
    ) -> Result<SelectedDevice> {
        if capabilities.is_empty() {
            return Err(BackendError::device("no physical devices available"));
        }

        let index = if config.preferred_device < capabilities.len() {
            config.preferred_device
        } else {
            log::warn!(
                "Preferred device {} out of range ({} devices), falling back to device 0",
                config.preferred_device,
                capabilities.len()
            );
            0
        };
        let caps = &capabilities[index];

        let graphics_family = Self::pick_graphics_family(instance, caps, surface)?;
        let transfer_family = Self::pick_transfer_family(caps).unwrap_or(graphics_family);

        if let Some(missing) = config
            .device_extensions
            .iter()
            .find(|ext| !caps.supports_extension(ext))
        {
            return Err(BackendError::device(format!(
                "{} does not support device extension {}",
                caps.name, missing
            )));
        }

        // Presentation needs the swapchain extension on every backend that has it
        let mut extensions = config.device_extensions.clone();
        if caps.supports_extension("VK_KHR_swapchain") && !extensions.iter().any(|e| e == "VK_KHR_swapchain") {
            extensions.push("VK_KHR_swapchain".to_string());
        }

        let opened = instance
            .open_device(&DeviceRequest {
                physical_index: caps.index,
                graphics_family,
                transfer_family,
                extensions,
                features: wanted_features(&caps.features),
            })
            .map_err(|err| BackendError::device(format!("failed to create logical device on {}: {}", caps.name, err)))?;

        Ok(SelectedDevice {
            capabilities: caps.clone(),
            graphics_family,
            transfer_family,
            opened,
        })
    }

    fn pick_graphics_family(instance: &dyn GpuInstance, caps: &DeviceCapabilities, surface: vk::SurfaceKHR) -> Result<u32> {
        let mut saw_graphics = false;
        for family in &caps.queue_families {
            if !family.flags.contains(vk::QueueFlags::GRAPHICS) || family.queue_count == 0 {
                continue;
            }
            saw_graphics = true;
            if instance.present_support(caps.index, family.index, surface)? {
                return Ok(family.index);
            }
        }

        Err(BackendError::device(if saw_graphics {
            format!("{} has no graphics queue that can present to the window", caps.name)
        } else {
            format!("{} has no graphics queue family", caps.name)
        }))
    }

    /// A transfer-capable family without graphics, if the device has one.
    fn pick_transfer_family(caps: &DeviceCapabilities) -> Option<u32> {
        caps.queue_families
            .iter()
            .filter(|family| family.queue_count > 0)
            .filter(|family| family.flags.contains(vk::QueueFlags::TRANSFER))
            .filter(|family| !family.flags.contains(vk::QueueFlags::GRAPHICS))
            .min_by_key(|family| family.flags.contains(vk::QueueFlags::COMPUTE))
            .map(|family| family.index)
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    /// Borrowed device. Returns an error once the context is destroyed.
    pub fn device(&self) -> Result<&dyn GpuDevice> {
        self.shared_device_ref().map(|device| device.as_ref())
    }

    /// Owning handle for the backend stages built on top of the device. Every
    /// clone must be dropped before `destroy`.
    pub(crate) fn shared_device(&self) -> Result<Arc<dyn GpuDevice>> {
        self.shared_device_ref().cloned()
    }

    fn shared_device_ref(&self) -> Result<&Arc<dyn GpuDevice>> {
        self.device
            .as_ref()
            .ok_or_else(|| BackendError::invalid_state("use device", "destroyed"))
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub fn graphics_family(&self) -> u32 {
        self.graphics_family
    }

    pub fn transfer_family(&self) -> u32 {
        self.transfer_family
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn transfer_queue(&self) -> vk::Queue {
        self.transfer_queue
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.device()?.wait_idle()
    }

    /// Release device, surface and instance. Every other component must be gone.
    ///
    /// If the device is still shared, the surface and instance are leaked
    /// rather than released under a live device, and the call reports a
    /// contract violation.
    pub fn destroy(&mut self) -> Result<()> {
        if let Some(device) = self.device.take() {
            if let Err(err) = device.wait_idle() {
                log::warn!("Device not idle at destruction: {}", err);
            }
            let others = Arc::strong_count(&device) - 1;
            drop(device);
            if others > 0 {
                if let Some(instance) = self.instance.take() {
                    std::mem::forget(instance);
                }
                self.surface = vk::SurfaceKHR::null();
                return Err(self.contract.violation(BackendError::invalid_state(
                    "destroy device context",
                    format!("device still shared by {} other owner(s)", others),
                )));
            }
        }

        if let Some(instance) = self.instance.take() {
            if self.surface != vk::SurfaceKHR::null() {
                instance.destroy_surface(self.surface);
                self.surface = vk::SurfaceKHR::null();
            }
            drop(instance);
            log::info!("Destroyed device context");
        }
        Ok(())
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        if let Err(err) = self.destroy() {
            log::warn!("Device context dropped incomplete: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{GpuCall, HeadlessConfig, HeadlessPlatform, ObjectKind};
    use crate::backend::HeadlessTarget;

    fn config() -> BackendConfig {
        let mut config = BackendConfig::new(Arc::new(HeadlessTarget::new(640, 480)));
        config.validation = false;
        config
    }

    #[test]
    fn enumerate_has_no_lasting_side_effects() {
        let platform = HeadlessPlatform::new(HeadlessConfig {
            devices: vec![
                HeadlessConfig::discrete_gpu(0, "first"),
                HeadlessConfig::discrete_gpu(1, "second"),
            ],
            ..Default::default()
        });

        let devices = DeviceContext::enumerate(&platform).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].name, "second");
        assert_eq!(platform.probe().live_objects(), 0);
    }

    #[test]
    fn picks_dedicated_transfer_family() {
        let platform = HeadlessPlatform::default();
        let context = DeviceContext::create(&platform, &config()).unwrap();

        assert_eq!(context.graphics_family(), 0);
        assert_eq!(context.transfer_family(), 1);
        assert_ne!(context.graphics_queue(), context.transfer_queue());
    }

    #[test]
    fn falls_back_to_graphics_family_for_transfer() {
        let mut caps = HeadlessConfig::discrete_gpu(0, "single queue");
        caps.queue_families.truncate(1);
        let platform = HeadlessPlatform::new(HeadlessConfig {
            devices: vec![caps],
            ..Default::default()
        });

        let context = DeviceContext::create(&platform, &config()).unwrap();
        assert_eq!(context.transfer_family(), context.graphics_family());
    }

    #[test]
    fn out_of_range_preference_falls_back_to_first_device() {
        let platform = HeadlessPlatform::new(HeadlessConfig {
            devices: vec![
                HeadlessConfig::discrete_gpu(0, "first"),
                HeadlessConfig::discrete_gpu(1, "second"),
            ],
            ..Default::default()
        });

        let mut cfg = config();
        cfg.preferred_device = 1;
        assert_eq!(DeviceContext::create(&platform, &cfg).unwrap().capabilities().name, "second");

        cfg.preferred_device = 7;
        assert_eq!(DeviceContext::create(&platform, &cfg).unwrap().capabilities().name, "first");
    }

    #[test]
    fn missing_extension_is_a_device_error() {
        let platform = HeadlessPlatform::default();
        let probe = platform.probe();
        let mut cfg = config();
        cfg.device_extensions = vec!["VK_KHR_ray_tracing_pipeline".to_string()];

        assert!(matches!(
            DeviceContext::create(&platform, &cfg),
            Err(BackendError::Device(_))
        ));
        assert_eq!(probe.live_objects(), 0);
    }

    #[test]
    fn no_graphics_family_is_a_device_error() {
        let platform = HeadlessPlatform::new(HeadlessConfig {
            devices: vec![HeadlessConfig::compute_only(0, "compute")],
            ..Default::default()
        });

        let err = DeviceContext::create(&platform, &config()).err().unwrap();
        assert!(err.to_string().contains("no graphics queue family"));
        assert_eq!(platform.probe().live_objects(), 0);
    }

    #[test]
    fn no_devices_is_a_device_error() {
        let platform = HeadlessPlatform::new(HeadlessConfig {
            devices: Vec::new(),
            ..Default::default()
        });
        assert!(matches!(
            DeviceContext::create(&platform, &config()),
            Err(BackendError::Device(_))
        ));
    }

    #[test]
    fn releases_device_then_surface_then_instance() {
        let platform = HeadlessPlatform::default();
        let probe = platform.probe();
        let mut context = DeviceContext::create(&platform, &config()).unwrap();
        probe.clear_calls();

        context.destroy().unwrap();
        context.destroy().unwrap();

        let calls: Vec<GpuCall> = probe
            .calls()
            .into_iter()
            .filter(|call| !matches!(call, GpuCall::WaitIdle))
            .collect();
        assert!(matches!(
            calls.as_slice(),
            [GpuCall::DestroyDevice, GpuCall::DestroySurface(_), GpuCall::DestroyInstance]
        ));
        assert_eq!(probe.live_objects(), 0);
        assert_eq!(probe.live(ObjectKind::Device), 0);
        assert!(probe.violations().is_empty());
        assert!(context.device().is_err());
    }

    #[test]
    fn shared_device_at_destruction_keeps_surface_and_instance() {
        let platform = HeadlessPlatform::default();
        let probe = platform.probe();
        let mut cfg = config();
        cfg.contract_mode = ContractMode::Report;
        let mut context = DeviceContext::create(&platform, &cfg).unwrap();
        let kept = context.shared_device().unwrap();

        assert!(matches!(context.destroy(), Err(BackendError::InvalidState { .. })));
        assert_eq!(probe.live(ObjectKind::Device), 1);
        assert_eq!(probe.live(ObjectKind::Surface), 1);
        assert_eq!(probe.live(ObjectKind::Instance), 1);

        drop(kept);
        assert_eq!(probe.live(ObjectKind::Device), 0);
        // Nothing was released out of order
        assert!(probe.violations().is_empty(), "{:?}", probe.violations());
        assert!(context.destroy().is_ok());
    }

    #[test]
    #[should_panic(expected = "contract violation")]
    fn shared_device_at_destruction_asserts() {
        let platform = HeadlessPlatform::default();
        let mut cfg = config();
        cfg.contract_mode = ContractMode::Assert;
        let mut context = DeviceContext::create(&platform, &cfg).unwrap();
        let _kept = context.shared_device().unwrap();
        let _ = context.destroy();
    }
}
