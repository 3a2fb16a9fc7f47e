// Vulkan backend - instance, surfaces and device creation over ash
//
// Design: thin pass-through; all policy (selection, ordering, pacing) lives
// in the components above the GpuDevice seam.

mod device;
mod memory;

pub use device::VulkanDevice;

use anyhow::Context;
use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

use super::gpu::{
    BackendKind, DeviceCapabilities, DeviceRequest, GpuInstance, GpuPlatform, InstanceDesc, MemoryHeapInfo,
    MemoryTypeInfo, OpenedDevice, PresentTarget, QueueFamilyInfo,
};
use crate::error::{BackendError, Result};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// The Vulkan loader. Loading it does not create an instance.
pub struct VulkanPlatform {
    entry: Entry,
}

impl VulkanPlatform {
    pub fn load() -> Result<Self> {
        let entry = unsafe { Entry::load() }?;
        Ok(Self { entry })
    }

    fn available_instance_extensions(&self) -> Vec<CString> {
        self.entry
            .enumerate_instance_extension_properties(None)
            .unwrap_or_default()
            .iter()
            .map(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }.to_owned())
            .collect()
    }

    fn validation_layer_available(&self) -> bool {
        self.entry
            .enumerate_instance_layer_properties()
            .unwrap_or_default()
            .iter()
            .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER)
    }
}

impl GpuPlatform for VulkanPlatform {
    fn kind(&self) -> BackendKind {
        BackendKind::Vulkan
    }

    fn create_instance(&self, desc: &InstanceDesc) -> Result<Box<dyn GpuInstance>> {
        let app_name = CString::new(desc.app_name.as_str())
            .map_err(|_| BackendError::config("application name contains a NUL byte"))?;
        let engine_name = c"Mix";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(desc.app_version.to_vk())
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        // Surface support: the core extension plus every platform flavour the loader offers
        let available = self.available_instance_extensions();
        let mut extensions: Vec<CString> = Vec::new();
        let mut push = |name: &CStr| {
            if !extensions.iter().any(|e| e.as_c_str() == name) {
                extensions.push(name.to_owned());
            }
        };
        push(ash::extensions::khr::Surface::name());
        for platform_ext in [
            ash::extensions::khr::Win32Surface::name(),
            ash::extensions::khr::XlibSurface::name(),
            ash::extensions::khr::XcbSurface::name(),
            ash::extensions::khr::WaylandSurface::name(),
        ] {
            if available.iter().any(|e| e.as_c_str() == platform_ext) {
                push(platform_ext);
            }
        }

        let validation = desc.validation && self.validation_layer_available();
        if desc.validation && !validation {
            log::warn!("Validation requested but {:?} is not installed", VALIDATION_LAYER);
        }
        if validation {
            push(ash::extensions::ext::DebugUtils::name());
        }

        for requested in &desc.extensions {
            let name = CString::new(requested.as_str())
                .map_err(|_| BackendError::config(format!("invalid extension name {:?}", requested)))?;
            if !available.contains(&name) {
                return Err(BackendError::config(format!(
                    "instance extension {} is not available",
                    requested
                )));
            }
            push(name.as_c_str());
        }

        let extension_ptrs: Vec<*const c_char> = extensions.iter().map(|e| e.as_ptr()).collect();
        let layer_names = if validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extension_ptrs)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { self.entry.create_instance(&create_info, None) }?;
        log::info!(
            "Created Vulkan instance ({} extensions, validation {})",
            extensions.len(),
            if validation { "on" } else { "off" }
        );

        let debug_utils = if validation {
            match setup_debug_messenger(&self.entry, &instance) {
                Ok(debug) => Some(debug),
                Err(err) => {
                    log::warn!("Debug messenger unavailable: {}", err);
                    None
                }
            }
        } else {
            None
        };

        let physical_devices = match unsafe { instance.enumerate_physical_devices() } {
            Ok(devices) => devices,
            Err(err) => {
                unsafe {
                    if let Some((utils, messenger)) = &debug_utils {
                        utils.destroy_debug_utils_messenger(*messenger, None);
                    }
                    instance.destroy_instance(None);
                }
                return Err(err.into());
            }
        };

        Ok(Box::new(VulkanInstance {
            surface_loader: ash::extensions::khr::Surface::new(&self.entry, &instance),
            entry: self.entry.clone(),
            instance,
            debug_utils,
            physical_devices,
        }))
    }
}

fn setup_debug_messenger(
    entry: &Entry,
    instance: &ash::Instance,
) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
    let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));

    let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;
    Ok((debug_utils, messenger))
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

// =============================================================================
// INSTANCE
// =============================================================================

struct VulkanInstance {
    entry: Entry,
    instance: ash::Instance,
    surface_loader: ash::extensions::khr::Surface,
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    physical_devices: Vec<vk::PhysicalDevice>,
}

impl VulkanInstance {
    fn physical(&self, index: usize) -> Result<vk::PhysicalDevice> {
        self.physical_devices
            .get(index)
            .copied()
            .ok_or_else(|| BackendError::device(format!("no physical device with index {}", index)))
    }

    fn capabilities(&self, index: usize, physical: vk::PhysicalDevice) -> Result<DeviceCapabilities> {
        let instance = &self.instance;
        let props = unsafe { instance.get_physical_device_properties(physical) };
        let features = unsafe { instance.get_physical_device_features(physical) };
        let memory = unsafe { instance.get_physical_device_memory_properties(physical) };
        let families = unsafe { instance.get_physical_device_queue_family_properties(physical) };
        let extensions = unsafe { instance.enumerate_device_extension_properties(physical) }?;

        Ok(DeviceCapabilities {
            index,
            name: unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
                .to_string_lossy()
                .into_owned(),
            device_type: props.device_type,
            api_version: props.api_version,
            features,
            extensions: extensions
                .iter()
                .map(|ext| {
                    unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }
                        .to_string_lossy()
                        .into_owned()
                })
                .collect(),
            queue_families: families
                .iter()
                .enumerate()
                .map(|(i, family)| QueueFamilyInfo {
                    index: i as u32,
                    queue_count: family.queue_count,
                    flags: family.queue_flags,
                })
                .collect(),
            memory_types: memory.memory_types[..memory.memory_type_count as usize]
                .iter()
                .map(|ty| MemoryTypeInfo {
                    heap_index: ty.heap_index,
                    flags: ty.property_flags,
                })
                .collect(),
            memory_heaps: memory.memory_heaps[..memory.memory_heap_count as usize]
                .iter()
                .map(|heap| MemoryHeapInfo {
                    size: heap.size,
                    flags: heap.flags,
                })
                .collect(),
        })
    }

    unsafe fn create_platform_surface(
        &self,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> anyhow::Result<vk::SurfaceKHR> {
        let entry = &self.entry;
        let instance = &self.instance;

        let surface = match (display, window) {
            (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
                let hinstance = handle.hinstance.map(|h| h.get()).unwrap_or(0) as *const std::ffi::c_void;
                let hwnd = handle.hwnd.get() as *const std::ffi::c_void;
                let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                    .hinstance(hinstance)
                    .hwnd(hwnd);
                ash::extensions::khr::Win32Surface::new(entry, instance).create_win32_surface(&create_info, None)?
            }
            (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(handle)) => {
                let dpy = display
                    .display
                    .context("Xlib display handle is missing the display")?
                    .as_ptr();
                let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                    .dpy(dpy as *mut vk::Display)
                    .window(handle.window);
                ash::extensions::khr::XlibSurface::new(entry, instance).create_xlib_surface(&create_info, None)?
            }
            (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(handle)) => {
                let connection = display
                    .connection
                    .context("XCB display handle is missing the connection")?
                    .as_ptr();
                let create_info = vk::XcbSurfaceCreateInfoKHR::builder()
                    .connection(connection)
                    .window(handle.window.get());
                ash::extensions::khr::XcbSurface::new(entry, instance).create_xcb_surface(&create_info, None)?
            }
            (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(handle)) => {
                let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                    .display(display.display.as_ptr())
                    .surface(handle.surface.as_ptr());
                ash::extensions::khr::WaylandSurface::new(entry, instance)
                    .create_wayland_surface(&create_info, None)?
            }
            _ => anyhow::bail!("Unsupported window handle type"),
        };
        Ok(surface)
    }
}

impl GpuInstance for VulkanInstance {
    fn kind(&self) -> BackendKind {
        BackendKind::Vulkan
    }

    fn enumerate(&self) -> Result<Vec<DeviceCapabilities>> {
        self.physical_devices
            .iter()
            .enumerate()
            .map(|(index, &physical)| self.capabilities(index, physical))
            .collect()
    }

    fn create_surface(&self, target: &dyn PresentTarget) -> Result<vk::SurfaceKHR> {
        let (display, window) = target
            .window_handles()
            .map_err(|err| BackendError::device(format!("window handles unavailable: {:#}", err)))?;

        unsafe { self.create_platform_surface(display, window) }
            .map_err(|err| BackendError::device(format!("failed to create window surface: {:#}", err)))
    }

    fn destroy_surface(&self, surface: vk::SurfaceKHR) {
        unsafe { self.surface_loader.destroy_surface(surface, None) };
    }

    fn present_support(&self, physical_index: usize, family: u32, surface: vk::SurfaceKHR) -> Result<bool> {
        let physical = self.physical(physical_index)?;
        let supported = unsafe {
            self.surface_loader
                .get_physical_device_surface_support(physical, family, surface)
        }?;
        Ok(supported)
    }

    fn open_device(&self, request: &DeviceRequest) -> Result<OpenedDevice> {
        let physical = self.physical(request.physical_index)?;

        let queue_priorities = [1.0];
        let mut queue_infos = vec![vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(request.graphics_family)
            .queue_priorities(&queue_priorities)
            .build()];
        if request.transfer_family != request.graphics_family {
            queue_infos.push(
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(request.transfer_family)
                    .queue_priorities(&queue_priorities)
                    .build(),
            );
        }

        let extension_names = request
            .extensions
            .iter()
            .map(|name| CString::new(name.as_str()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| BackendError::config("device extension name contains a NUL byte"))?;
        let extension_ptrs: Vec<*const c_char> = extension_names.iter().map(|e| e.as_ptr()).collect();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_ptrs)
            .enabled_features(&request.features);

        let device = unsafe { self.instance.create_device(physical, &create_info, None) }?;
        let graphics_queue = unsafe { device.get_device_queue(request.graphics_family, 0) };
        let transfer_queue = unsafe { device.get_device_queue(request.transfer_family, 0) };

        let device = VulkanDevice::new(
            self.instance.clone(),
            physical,
            device,
            self.surface_loader.clone(),
        );

        Ok(OpenedDevice {
            device: Arc::new(device),
            graphics_queue,
            transfer_queue,
        })
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan instance...");
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}
