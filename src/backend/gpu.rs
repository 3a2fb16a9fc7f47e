// Hardware seam - the calls every component makes into the GPU driver
//
// Components never talk to ash directly. They go through GpuDevice, which
// is implemented by the Vulkan backend and by the simulated headless backend
// the test suite runs against. Handles stay plain `vk` handle types so the
// Vulkan path is a thin pass-through.

use ash::vk;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AppVersion;
use crate::error::Result;

/// Which implementation sits behind the hardware traits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Vulkan,
    Headless,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Vulkan => write!(f, "vulkan"),
            BackendKind::Headless => write!(f, "headless"),
        }
    }
}

// =============================================================================
// DEVICE CAPABILITIES (immutable enumeration snapshot)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyInfo {
    pub index: u32,
    pub queue_count: u32,
    pub flags: vk::QueueFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryTypeInfo {
    pub heap_index: u32,
    pub flags: vk::MemoryPropertyFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryHeapInfo {
    pub size: u64,
    pub flags: vk::MemoryHeapFlags,
}

/// Everything known about one physical device at enumeration time.
#[derive(Debug, Clone)]
pub struct DeviceCapabilities {
    pub index: usize,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    pub features: vk::PhysicalDeviceFeatures,
    pub extensions: Vec<String>,
    pub queue_families: Vec<QueueFamilyInfo>,
    pub memory_types: Vec<MemoryTypeInfo>,
    pub memory_heaps: Vec<MemoryHeapInfo>,
}

impl DeviceCapabilities {
    pub fn supports_extension(&self, name: &str) -> bool {
        self.extensions.iter().any(|ext| ext == name)
    }

    /// Total size of device-local heaps in bytes.
    pub fn device_local_memory(&self) -> u64 {
        self.memory_heaps
            .iter()
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .sum()
    }
}

// =============================================================================
// REQUEST / DESCRIPTION STRUCTS
// =============================================================================

#[derive(Debug, Clone)]
pub struct InstanceDesc {
    pub app_name: String,
    pub app_version: AppVersion,
    pub extensions: Vec<String>,
    pub validation: bool,
}

impl Default for InstanceDesc {
    fn default() -> Self {
        Self {
            app_name: "Mix".to_string(),
            app_version: AppVersion::default(),
            extensions: Vec::new(),
            validation: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceRequest {
    pub physical_index: usize,
    pub graphics_family: u32,
    pub transfer_family: u32,
    pub extensions: Vec<String>,
    pub features: vk::PhysicalDeviceFeatures,
}

/// A freshly created logical device and the queues it was created with.
pub struct OpenedDevice {
    pub device: Arc<dyn GpuDevice>,
    pub graphics_queue: vk::Queue,
    pub transfer_queue: vk::Queue,
}

#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

#[derive(Debug, Clone, Copy)]
pub struct SwapchainDesc {
    pub surface: vk::SurfaceKHR,
    pub image_count: u32,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub old_swapchain: vk::SwapchainKHR,
}

/// One queue submission: wait on semaphores, execute, signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct Submission<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub wait_semaphores: &'a [vk::Semaphore],
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub signal_semaphores: &'a [vk::Semaphore],
}

#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub name: String,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub location: gpu_allocator::MemoryLocation,
}

/// A buffer plus the memory bound to it. The memory backend keys its allocation by `buffer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawBuffer {
    pub buffer: vk::Buffer,
    pub size: u64,
    pub location: gpu_allocator::MemoryLocation,
}

impl RawBuffer {
    pub fn is_host_visible(&self) -> bool {
        matches!(
            self.location,
            gpu_allocator::MemoryLocation::CpuToGpu | gpu_allocator::MemoryLocation::GpuToCpu
        )
    }
}

// =============================================================================
// TRAITS
// =============================================================================

/// Loader for one backend kind. Creating it must not create an instance.
pub trait GpuPlatform: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn create_instance(&self, desc: &InstanceDesc) -> Result<Box<dyn GpuInstance>>;

    /// Snapshot every physical device through a short-lived instance.
    fn enumerate(&self) -> Result<Vec<DeviceCapabilities>> {
        let instance = self.create_instance(&InstanceDesc::default())?;
        instance.enumerate()
    }
}

pub trait GpuInstance: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn enumerate(&self) -> Result<Vec<DeviceCapabilities>>;

    fn create_surface(&self, target: &dyn PresentTarget) -> Result<vk::SurfaceKHR>;

    fn destroy_surface(&self, surface: vk::SurfaceKHR);

    fn present_support(&self, physical_index: usize, family: u32, surface: vk::SurfaceKHR) -> Result<bool>;

    fn open_device(&self, request: &DeviceRequest) -> Result<OpenedDevice>;
}

/// Logical device operations. Shared read-only between components.
pub trait GpuDevice: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// The ash device, for renderers recording their own commands on the Vulkan backend.
    fn raw(&self) -> Option<&ash::Device>;

    fn wait_idle(&self) -> Result<()>;

    // Synchronization
    fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> Result<()>;
    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;
    fn create_semaphore(&self) -> Result<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    // Commands
    fn create_command_pool(&self, family: u32, flags: vk::CommandPoolCreateFlags) -> Result<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>>;
    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]);
    fn reset_command_buffer(&self, buffer: vk::CommandBuffer) -> Result<()>;
    fn begin_command_buffer(&self, buffer: vk::CommandBuffer, flags: vk::CommandBufferUsageFlags) -> Result<()>;
    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> Result<()>;
    /// Transition `image` to TRANSFER_DST, clear it, and leave it in PRESENT_SRC.
    fn cmd_clear_color_image(&self, buffer: vk::CommandBuffer, image: vk::Image, color: [f32; 4]);
    fn queue_submit(&self, queue: vk::Queue, submission: &Submission<'_>, fence: vk::Fence) -> Result<()>;

    // Descriptors
    fn create_descriptor_pool(&self, sizes: &[vk::DescriptorPoolSize], max_sets: u32) -> Result<vk::DescriptorPool>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>>;
    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<()>;

    // Presentation
    fn surface_support(&self, surface: vk::SurfaceKHR) -> Result<SurfaceSupport>;
    fn create_swapchain(&self, desc: &SwapchainDesc) -> Result<vk::SwapchainKHR>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>>;
    fn create_image_view(&self, image: vk::Image, format: vk::Format) -> Result<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);
    /// Returns `(image_index, suboptimal)`.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
        timeout: Duration,
    ) -> Result<(u32, bool)>;
    /// Returns `true` when the swapchain is suboptimal.
    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: &[vk::Semaphore],
    ) -> Result<bool>;

    // Memory
    fn create_memory_backend(&self) -> Result<Box<dyn MemoryBackend>>;
}

/// Device memory allocation behind the ResourceAllocator's policy layer.
pub trait MemoryBackend: Send {
    fn allocate_buffer(&mut self, desc: &BufferDesc) -> Result<RawBuffer>;
    fn write_buffer(&mut self, buffer: &RawBuffer, offset: u64, data: &[u8]) -> Result<()>;
    fn free_buffer(&mut self, buffer: RawBuffer) -> Result<()>;
    fn allocated_bytes(&self) -> u64;
}

/// Window collaborator: native handles for surface creation and the drawable size.
pub trait PresentTarget: Send + Sync {
    fn window_handles(
        &self,
    ) -> anyhow::Result<(raw_window_handle::RawDisplayHandle, raw_window_handle::RawWindowHandle)>;

    fn drawable_extent(&self) -> vk::Extent2D;
}

impl PresentTarget for winit::window::Window {
    fn window_handles(
        &self,
    ) -> anyhow::Result<(raw_window_handle::RawDisplayHandle, raw_window_handle::RawWindowHandle)> {
        use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

        let display = self.display_handle()?.as_raw();
        let window = self.window_handle()?.as_raw();
        Ok((display, window))
    }

    fn drawable_extent(&self) -> vk::Extent2D {
        let size = self.inner_size();
        vk::Extent2D {
            width: size.width,
            height: size.height,
        }
    }
}

/// A target with no window, used by the headless backend.
#[derive(Debug)]
pub struct HeadlessTarget {
    extent: parking_lot::Mutex<vk::Extent2D>,
}

impl HeadlessTarget {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            extent: parking_lot::Mutex::new(vk::Extent2D { width, height }),
        }
    }

    /// Simulate a window resize.
    pub fn resize(&self, width: u32, height: u32) {
        *self.extent.lock() = vk::Extent2D { width, height };
    }
}

impl PresentTarget for HeadlessTarget {
    fn window_handles(
        &self,
    ) -> anyhow::Result<(raw_window_handle::RawDisplayHandle, raw_window_handle::RawWindowHandle)> {
        anyhow::bail!("headless target has no native window")
    }

    fn drawable_extent(&self) -> vk::Extent2D {
        *self.extent.lock()
    }
}
