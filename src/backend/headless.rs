// Headless backend - a simulated GPU
//
// Hands out handles, models the queue timeline and records every call so the
// frame loop can be exercised without a driver. Work submitted with a fence
// stays pending until the CPU waits on that fence (or the device goes idle);
// re-recording a pending command buffer, waiting an unsubmitted fence, or
// destroying objects out of order is flagged as a violation.

use ash::vk::{self, Handle};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use super::gpu::{
    BackendKind, BufferDesc, DeviceCapabilities, DeviceRequest, GpuDevice, GpuInstance,
    GpuPlatform, InstanceDesc, MemoryBackend, MemoryHeapInfo, MemoryTypeInfo, OpenedDevice,
    PresentTarget, QueueFamilyInfo, RawBuffer, Submission, SurfaceSupport, SwapchainDesc,
};
use crate::error::{BackendError, Result};

/// Simulated platform limits and device list.
#[derive(Debug, Clone)]
pub struct HeadlessConfig {
    pub devices: Vec<DeviceCapabilities>,
    pub min_image_count: u32,
    /// 0 means no upper limit.
    pub max_image_count: u32,
    /// Images granted on top of the request, like drivers that round up.
    pub extra_images: u32,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
    /// `None` lets the swapchain pick the extent (window-manager style).
    pub current_extent: Option<vk::Extent2D>,
    pub fail_at: Option<FailPoint>,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            devices: vec![HeadlessConfig::discrete_gpu(0, "Headless GPU")],
            min_image_count: 2,
            max_image_count: 8,
            extra_images: 0,
            formats: vec![
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_SRGB,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_UNORM,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
            ],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
            current_extent: None,
            fail_at: None,
        }
    }
}

impl HeadlessConfig {
    /// A device with a graphics family and a dedicated transfer family.
    pub fn discrete_gpu(index: usize, name: &str) -> DeviceCapabilities {
        DeviceCapabilities {
            index,
            name: name.to_string(),
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            api_version: vk::API_VERSION_1_3,
            features: vk::PhysicalDeviceFeatures {
                sampler_anisotropy: vk::TRUE,
                fill_mode_non_solid: vk::TRUE,
                ..Default::default()
            },
            extensions: vec!["VK_KHR_swapchain".to_string()],
            queue_families: vec![
                QueueFamilyInfo {
                    index: 0,
                    queue_count: 16,
                    flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                },
                QueueFamilyInfo {
                    index: 1,
                    queue_count: 2,
                    flags: vk::QueueFlags::TRANSFER,
                },
            ],
            memory_types: vec![
                MemoryTypeInfo {
                    heap_index: 0,
                    flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                },
                MemoryTypeInfo {
                    heap_index: 1,
                    flags: vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                },
            ],
            memory_heaps: vec![
                MemoryHeapInfo {
                    size: 8 << 30,
                    flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
                },
                MemoryHeapInfo {
                    size: 16 << 30,
                    flags: vk::MemoryHeapFlags::empty(),
                },
            ],
        }
    }

    /// A device that can only compute, so it fails graphics queue selection.
    pub fn compute_only(index: usize, name: &str) -> DeviceCapabilities {
        let mut caps = Self::discrete_gpu(index, name);
        caps.queue_families = vec![QueueFamilyInfo {
            index: 0,
            queue_count: 4,
            flags: vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
        }];
        caps
    }
}

/// Object creation that can be made to fail, one per build stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    CreateInstance,
    CreateSurface,
    CreateDevice,
    CreateSwapchain,
    CreateCommandPool,
    AllocateCommandBuffers,
    CreateDescriptorPool,
    CreateMemoryBackend,
}

/// One-shot runtime conditions, consumed by the next matching call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    AcquireOutOfDate,
    AcquireSuboptimal,
    AcquireTimeout,
    FenceTimeout,
    PresentOutOfDate,
    PresentSuboptimal,
    /// The next queue submission fails without side effects.
    SubmitOutOfMemory,
    /// Taken by the next queue submission; the device stays lost afterwards.
    DeviceLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ObjectKind {
    Instance,
    Surface,
    Device,
    Fence,
    Semaphore,
    CommandPool,
    CommandBuffer,
    DescriptorPool,
    Swapchain,
    ImageView,
    MemoryBackend,
    Buffer,
}

/// Ordered log entry of one device call.
#[derive(Debug, Clone, PartialEq)]
pub enum GpuCall {
    CreateInstance,
    DestroyInstance,
    CreateSurface(vk::SurfaceKHR),
    DestroySurface(vk::SurfaceKHR),
    CreateDevice,
    DestroyDevice,
    WaitIdle,
    CreateFence(vk::Fence),
    DestroyFence(vk::Fence),
    WaitFence(vk::Fence),
    ResetFence(vk::Fence),
    CreateSemaphore(vk::Semaphore),
    DestroySemaphore(vk::Semaphore),
    CreateCommandPool(vk::CommandPool),
    DestroyCommandPool(vk::CommandPool),
    AllocateCommandBuffers(Vec<vk::CommandBuffer>),
    FreeCommandBuffers(Vec<vk::CommandBuffer>),
    ResetCommandBuffer(vk::CommandBuffer),
    BeginCommandBuffer(vk::CommandBuffer),
    EndCommandBuffer(vk::CommandBuffer),
    ClearColorImage {
        buffer: vk::CommandBuffer,
        image: vk::Image,
        color: [f32; 4],
    },
    Submit {
        command_buffers: Vec<vk::CommandBuffer>,
        wait: Vec<vk::Semaphore>,
        signal: Vec<vk::Semaphore>,
        fence: vk::Fence,
    },
    CreateDescriptorPool(vk::DescriptorPool),
    DestroyDescriptorPool(vk::DescriptorPool),
    AllocateDescriptorSets {
        pool: vk::DescriptorPool,
        count: usize,
    },
    ResetDescriptorPool(vk::DescriptorPool),
    CreateSwapchain {
        swapchain: vk::SwapchainKHR,
        image_count: u32,
        present_mode: vk::PresentModeKHR,
        extent: vk::Extent2D,
    },
    DestroySwapchain(vk::SwapchainKHR),
    CreateImageView(vk::ImageView),
    DestroyImageView(vk::ImageView),
    AcquireImage {
        swapchain: vk::SwapchainKHR,
        image_index: u32,
    },
    Present {
        swapchain: vk::SwapchainKHR,
        image_index: u32,
    },
    CreateMemoryBackend,
    DestroyMemoryBackend,
    AllocateBuffer(vk::Buffer),
    WriteBuffer {
        buffer: vk::Buffer,
        offset: u64,
        len: usize,
    },
    FreeBuffer(vk::Buffer),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FenceState {
    Unsignaled,
    Pending,
    Signaled,
}

#[derive(Debug)]
struct SimSwapchain {
    images: Vec<vk::Image>,
    next_image: u32,
    /// Passed as the old swapchain of a later create call.
    retired: bool,
}

#[derive(Debug)]
struct SimDescriptorPool {
    max_sets: u32,
    allocated: u32,
}

#[derive(Debug, Default)]
struct ProbeState {
    next_handle: u64,
    calls: Vec<GpuCall>,
    faults: Vec<Fault>,
    violations: Vec<String>,
    live: BTreeMap<u64, ObjectKind>,
    fences: HashMap<u64, FenceState>,
    /// fence -> command buffers of the submission it guards
    pending: HashMap<u64, Vec<u64>>,
    in_flight: HashSet<u64>,
    recording: HashSet<u64>,
    cb_pool: HashMap<u64, u64>,
    signaled_semaphores: HashSet<u64>,
    swapchains: HashMap<u64, SimSwapchain>,
    descriptor_pools: HashMap<u64, SimDescriptorPool>,
    buffers: HashMap<u64, Vec<u8>>,
    device_lost: bool,
    fail_at: Option<FailPoint>,
}

impl ProbeState {
    fn mint<H: Handle>(&mut self, kind: ObjectKind) -> H {
        self.next_handle += 1;
        let raw = self.next_handle;
        self.live.insert(raw, kind);
        H::from_raw(raw)
    }

    fn release<H: Handle + Copy>(&mut self, handle: H, kind: ObjectKind) {
        match self.live.remove(&handle.as_raw()) {
            Some(found) if found == kind => {}
            Some(found) => self
                .violations
                .push(format!("destroyed {:?} {:#x} as {:?}", found, handle.as_raw(), kind)),
            None => self
                .violations
                .push(format!("destroyed unknown {:?} {:#x}", kind, handle.as_raw())),
        }
    }

    fn take_fault(&mut self, wanted: &[Fault]) -> Option<Fault> {
        let position = self.faults.iter().position(|fault| wanted.contains(fault))?;
        Some(self.faults.remove(position))
    }

    fn fail(&mut self, point: FailPoint) -> Result<()> {
        if self.fail_at == Some(point) {
            self.fail_at = None;
            return Err(BackendError::Vulkan(vk::Result::ERROR_INITIALIZATION_FAILED));
        }
        Ok(())
    }

    fn complete(&mut self, fence: u64) {
        if let Some(buffers) = self.pending.remove(&fence) {
            for buffer in buffers {
                self.in_flight.remove(&buffer);
            }
        }
        self.fences.insert(fence, FenceState::Signaled);
    }

    fn check_lost(&self) -> Result<()> {
        if self.device_lost {
            return Err(BackendError::DeviceLost);
        }
        Ok(())
    }
}

/// Shared view into the simulated GPU: call log, live objects, fault injection.
#[derive(Debug)]
pub struct HeadlessProbe {
    state: Mutex<ProbeState>,
}

impl HeadlessProbe {
    fn new(fail_at: Option<FailPoint>) -> Self {
        Self {
            state: Mutex::new(ProbeState {
                fail_at,
                ..Default::default()
            }),
        }
    }

    pub fn calls(&self) -> Vec<GpuCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Queue a one-shot fault for the next matching call.
    pub fn inject(&self, fault: Fault) {
        self.state.lock().faults.push(fault);
    }

    /// Make the next creation at `point` fail.
    pub fn fail_next(&self, point: FailPoint) {
        self.state.lock().fail_at = Some(point);
    }

    pub fn live_objects(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn live(&self, kind: ObjectKind) -> usize {
        self.state.lock().live.values().filter(|k| **k == kind).count()
    }

    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&buffer.as_raw()).cloned()
    }

    pub fn is_device_lost(&self) -> bool {
        self.state.lock().device_lost
    }

    fn with<T>(&self, f: impl FnOnce(&mut ProbeState) -> T) -> T {
        f(&mut self.state.lock())
    }
}

// =============================================================================
// PLATFORM / INSTANCE
// =============================================================================

pub struct HeadlessPlatform {
    config: Arc<HeadlessConfig>,
    probe: Arc<HeadlessProbe>,
}

impl HeadlessPlatform {
    pub fn new(config: HeadlessConfig) -> Self {
        let probe = Arc::new(HeadlessProbe::new(config.fail_at));
        Self {
            config: Arc::new(config),
            probe,
        }
    }

    pub fn probe(&self) -> Arc<HeadlessProbe> {
        self.probe.clone()
    }
}

impl Default for HeadlessPlatform {
    fn default() -> Self {
        Self::new(HeadlessConfig::default())
    }
}

impl GpuPlatform for HeadlessPlatform {
    fn kind(&self) -> BackendKind {
        BackendKind::Headless
    }

    fn create_instance(&self, desc: &InstanceDesc) -> Result<Box<dyn GpuInstance>> {
        let handle = self.probe.with(|s| -> Result<u64> {
            s.fail(FailPoint::CreateInstance)?;
            s.calls.push(GpuCall::CreateInstance);
            Ok(s.mint::<vk::Instance>(ObjectKind::Instance).as_raw())
        })?;
        log::debug!("Headless instance for '{}' {}", desc.app_name, desc.app_version);

        Ok(Box::new(HeadlessInstance {
            handle,
            config: self.config.clone(),
            probe: self.probe.clone(),
        }))
    }
}

struct HeadlessInstance {
    handle: u64,
    config: Arc<HeadlessConfig>,
    probe: Arc<HeadlessProbe>,
}

impl GpuInstance for HeadlessInstance {
    fn kind(&self) -> BackendKind {
        BackendKind::Headless
    }

    fn enumerate(&self) -> Result<Vec<DeviceCapabilities>> {
        Ok(self.config.devices.clone())
    }

    fn create_surface(&self, target: &dyn PresentTarget) -> Result<vk::SurfaceKHR> {
        let extent = target.drawable_extent();
        self.probe.with(|s| {
            s.fail(FailPoint::CreateSurface)?;
            let surface: vk::SurfaceKHR = s.mint(ObjectKind::Surface);
            s.calls.push(GpuCall::CreateSurface(surface));
            log::debug!("Headless surface {}x{}", extent.width, extent.height);
            Ok(surface)
        })
    }

    fn destroy_surface(&self, surface: vk::SurfaceKHR) {
        self.probe.with(|s| {
            if s.live.values().any(|kind| *kind == ObjectKind::Device) {
                s.violations.push("surface destroyed before device".to_string());
            }
            s.release(surface, ObjectKind::Surface);
            s.calls.push(GpuCall::DestroySurface(surface));
        });
    }

    fn present_support(&self, physical_index: usize, family: u32, _surface: vk::SurfaceKHR) -> Result<bool> {
        Ok(self
            .config
            .devices
            .get(physical_index)
            .map(|caps| {
                caps.queue_families
                    .iter()
                    .any(|f| f.index == family && f.flags.contains(vk::QueueFlags::GRAPHICS))
            })
            .unwrap_or(false))
    }

    fn open_device(&self, request: &DeviceRequest) -> Result<OpenedDevice> {
        let caps = self
            .config
            .devices
            .get(request.physical_index)
            .ok_or(BackendError::Vulkan(vk::Result::ERROR_INITIALIZATION_FAILED))?;

        if let Some(missing) = request
            .extensions
            .iter()
            .find(|ext| !caps.supports_extension(ext))
        {
            log::error!("Headless device lacks extension {}", missing);
            return Err(BackendError::Vulkan(vk::Result::ERROR_EXTENSION_NOT_PRESENT));
        }

        let (graphics_queue, transfer_queue) = self.probe.with(|s| -> Result<_> {
            s.fail(FailPoint::CreateDevice)?;
            s.calls.push(GpuCall::CreateDevice);
            let _device: vk::Device = s.mint(ObjectKind::Device);
            s.next_handle += 2;
            Ok((
                vk::Queue::from_raw(s.next_handle - 1),
                vk::Queue::from_raw(s.next_handle),
            ))
        })?;

        Ok(OpenedDevice {
            device: Arc::new(HeadlessDevice {
                config: self.config.clone(),
                probe: self.probe.clone(),
            }),
            graphics_queue,
            transfer_queue,
        })
    }
}

impl Drop for HeadlessInstance {
    fn drop(&mut self) {
        self.probe.with(|s| {
            if s.live.values().any(|kind| *kind == ObjectKind::Surface) {
                s.violations.push("instance destroyed with a live surface".to_string());
            }
            s.release(vk::Instance::from_raw(self.handle), ObjectKind::Instance);
            s.calls.push(GpuCall::DestroyInstance);
        });
    }
}

// =============================================================================
// DEVICE
// =============================================================================

pub struct HeadlessDevice {
    config: Arc<HeadlessConfig>,
    probe: Arc<HeadlessProbe>,
}

impl GpuDevice for HeadlessDevice {
    fn kind(&self) -> BackendKind {
        BackendKind::Headless
    }

    fn raw(&self) -> Option<&ash::Device> {
        None
    }

    fn wait_idle(&self) -> Result<()> {
        self.probe.with(|s| {
            s.calls.push(GpuCall::WaitIdle);
            let fences: Vec<u64> = s.pending.keys().copied().collect();
            for fence in fences {
                s.complete(fence);
            }
            s.in_flight.clear();
            s.check_lost()
        })
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        Ok(self.probe.with(|s| {
            let fence: vk::Fence = s.mint(ObjectKind::Fence);
            let state = if signaled {
                FenceState::Signaled
            } else {
                FenceState::Unsignaled
            };
            s.fences.insert(fence.as_raw(), state);
            s.calls.push(GpuCall::CreateFence(fence));
            fence
        }))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.probe.with(|s| {
            if s.fences.remove(&fence.as_raw()) == Some(FenceState::Pending) {
                s.violations.push(format!("fence {:#x} destroyed while pending", fence.as_raw()));
            }
            s.release(fence, ObjectKind::Fence);
            s.calls.push(GpuCall::DestroyFence(fence));
        });
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> Result<()> {
        self.probe.with(|s| {
            s.calls.push(GpuCall::WaitFence(fence));
            s.check_lost()?;
            if s.take_fault(&[Fault::FenceTimeout]).is_some() {
                return Err(BackendError::DeviceTimeout { what: "fence", timeout });
            }
            match s.fences.get(&fence.as_raw()).copied() {
                Some(FenceState::Signaled) => Ok(()),
                Some(FenceState::Pending) => {
                    s.complete(fence.as_raw());
                    Ok(())
                }
                // Nothing was submitted, so the wait can only run out
                Some(FenceState::Unsignaled) => Err(BackendError::DeviceTimeout { what: "fence", timeout }),
                None => {
                    s.violations.push(format!("wait on unknown fence {:#x}", fence.as_raw()));
                    Err(BackendError::Vulkan(vk::Result::ERROR_UNKNOWN))
                }
            }
        })
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        self.probe.with(|s| {
            s.calls.push(GpuCall::ResetFence(fence));
            match s.fences.get(&fence.as_raw()).copied() {
                Some(FenceState::Pending) => {
                    s.violations.push(format!("fence {:#x} reset while pending", fence.as_raw()));
                    Err(BackendError::Vulkan(vk::Result::ERROR_VALIDATION_FAILED_EXT))
                }
                Some(_) => {
                    s.fences.insert(fence.as_raw(), FenceState::Unsignaled);
                    Ok(())
                }
                None => Err(BackendError::Vulkan(vk::Result::ERROR_UNKNOWN)),
            }
        })
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        Ok(self.probe.with(|s| {
            let semaphore: vk::Semaphore = s.mint(ObjectKind::Semaphore);
            s.calls.push(GpuCall::CreateSemaphore(semaphore));
            semaphore
        }))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.probe.with(|s| {
            s.signaled_semaphores.remove(&semaphore.as_raw());
            s.release(semaphore, ObjectKind::Semaphore);
            s.calls.push(GpuCall::DestroySemaphore(semaphore));
        });
    }

    fn create_command_pool(&self, family: u32, flags: vk::CommandPoolCreateFlags) -> Result<vk::CommandPool> {
        self.probe.with(|s| {
            s.fail(FailPoint::CreateCommandPool)?;
            let pool: vk::CommandPool = s.mint(ObjectKind::CommandPool);
            s.calls.push(GpuCall::CreateCommandPool(pool));
            log::trace!("Headless command pool family {} flags {:?}", family, flags);
            Ok(pool)
        })
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.probe.with(|s| {
            let owned: Vec<u64> = s
                .cb_pool
                .iter()
                .filter(|(_, p)| **p == pool.as_raw())
                .map(|(cb, _)| *cb)
                .collect();
            for cb in owned {
                if s.in_flight.contains(&cb) {
                    s.violations
                        .push(format!("command pool destroyed while buffer {:#x} is in flight", cb));
                }
                s.cb_pool.remove(&cb);
                s.recording.remove(&cb);
                s.live.remove(&cb);
            }
            s.release(pool, ObjectKind::CommandPool);
            s.calls.push(GpuCall::DestroyCommandPool(pool));
        });
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        _level: vk::CommandBufferLevel,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        self.probe.with(|s| {
            s.fail(FailPoint::AllocateCommandBuffers)?;
            let buffers: Vec<vk::CommandBuffer> = (0..count)
                .map(|_| {
                    let cb: vk::CommandBuffer = s.mint(ObjectKind::CommandBuffer);
                    s.cb_pool.insert(cb.as_raw(), pool.as_raw());
                    cb
                })
                .collect();
            s.calls.push(GpuCall::AllocateCommandBuffers(buffers.clone()));
            Ok(buffers)
        })
    }

    fn free_command_buffers(&self, _pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        self.probe.with(|s| {
            for cb in buffers {
                if s.in_flight.contains(&cb.as_raw()) {
                    s.violations
                        .push(format!("command buffer {:#x} freed while in flight", cb.as_raw()));
                }
                s.cb_pool.remove(&cb.as_raw());
                s.recording.remove(&cb.as_raw());
                s.release(*cb, ObjectKind::CommandBuffer);
            }
            s.calls.push(GpuCall::FreeCommandBuffers(buffers.to_vec()));
        });
    }

    fn reset_command_buffer(&self, buffer: vk::CommandBuffer) -> Result<()> {
        self.probe.with(|s| {
            s.calls.push(GpuCall::ResetCommandBuffer(buffer));
            if s.in_flight.contains(&buffer.as_raw()) {
                s.violations
                    .push(format!("command buffer {:#x} reset while in flight", buffer.as_raw()));
                return Err(BackendError::Vulkan(vk::Result::ERROR_VALIDATION_FAILED_EXT));
            }
            s.recording.remove(&buffer.as_raw());
            Ok(())
        })
    }

    fn begin_command_buffer(&self, buffer: vk::CommandBuffer, _flags: vk::CommandBufferUsageFlags) -> Result<()> {
        self.probe.with(|s| {
            s.calls.push(GpuCall::BeginCommandBuffer(buffer));
            if s.in_flight.contains(&buffer.as_raw()) {
                s.violations
                    .push(format!("command buffer {:#x} re-recorded while in flight", buffer.as_raw()));
                return Err(BackendError::Vulkan(vk::Result::ERROR_VALIDATION_FAILED_EXT));
            }
            s.recording.insert(buffer.as_raw());
            Ok(())
        })
    }

    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> Result<()> {
        self.probe.with(|s| {
            s.calls.push(GpuCall::EndCommandBuffer(buffer));
            if !s.recording.remove(&buffer.as_raw()) {
                s.violations
                    .push(format!("end on command buffer {:#x} that is not recording", buffer.as_raw()));
                return Err(BackendError::Vulkan(vk::Result::ERROR_VALIDATION_FAILED_EXT));
            }
            Ok(())
        })
    }

    fn cmd_clear_color_image(&self, buffer: vk::CommandBuffer, image: vk::Image, color: [f32; 4]) {
        self.probe.with(|s| {
            if !s.recording.contains(&buffer.as_raw()) {
                s.violations
                    .push(format!("clear recorded outside begin/end on {:#x}", buffer.as_raw()));
            }
            s.calls.push(GpuCall::ClearColorImage { buffer, image, color });
        });
    }

    fn queue_submit(&self, _queue: vk::Queue, submission: &Submission<'_>, fence: vk::Fence) -> Result<()> {
        self.probe.with(|s| {
            s.calls.push(GpuCall::Submit {
                command_buffers: submission.command_buffers.to_vec(),
                wait: submission.wait_semaphores.to_vec(),
                signal: submission.signal_semaphores.to_vec(),
                fence,
            });
            s.check_lost()?;
            match s.take_fault(&[Fault::DeviceLost, Fault::SubmitOutOfMemory]) {
                Some(Fault::DeviceLost) => {
                    s.device_lost = true;
                    return Err(BackendError::DeviceLost);
                }
                Some(_) => return Err(BackendError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)),
                None => {}
            }

            for cb in submission.command_buffers {
                if s.recording.contains(&cb.as_raw()) {
                    s.violations
                        .push(format!("command buffer {:#x} submitted while recording", cb.as_raw()));
                    return Err(BackendError::Vulkan(vk::Result::ERROR_VALIDATION_FAILED_EXT));
                }
            }
            for semaphore in submission.wait_semaphores {
                if !s.signaled_semaphores.remove(&semaphore.as_raw()) {
                    s.violations
                        .push(format!("submit waits on unsignaled semaphore {:#x}", semaphore.as_raw()));
                }
            }
            for semaphore in submission.signal_semaphores {
                s.signaled_semaphores.insert(semaphore.as_raw());
            }

            let buffers: Vec<u64> = submission.command_buffers.iter().map(|cb| cb.as_raw()).collect();
            s.in_flight.extend(buffers.iter().copied());
            if fence != vk::Fence::null() {
                if s.fences.get(&fence.as_raw()) != Some(&FenceState::Unsignaled) {
                    s.violations
                        .push(format!("submit with fence {:#x} that is not unsignaled", fence.as_raw()));
                    return Err(BackendError::Vulkan(vk::Result::ERROR_VALIDATION_FAILED_EXT));
                }
                s.fences.insert(fence.as_raw(), FenceState::Pending);
                s.pending.insert(fence.as_raw(), buffers);
            }
            Ok(())
        })
    }

    fn create_descriptor_pool(&self, sizes: &[vk::DescriptorPoolSize], max_sets: u32) -> Result<vk::DescriptorPool> {
        self.probe.with(|s| {
            s.fail(FailPoint::CreateDescriptorPool)?;
            let pool: vk::DescriptorPool = s.mint(ObjectKind::DescriptorPool);
            s.descriptor_pools
                .insert(pool.as_raw(), SimDescriptorPool { max_sets, allocated: 0 });
            s.calls.push(GpuCall::CreateDescriptorPool(pool));
            log::trace!("Headless descriptor pool with {} size entries", sizes.len());
            Ok(pool)
        })
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.probe.with(|s| {
            s.descriptor_pools.remove(&pool.as_raw());
            s.release(pool, ObjectKind::DescriptorPool);
            s.calls.push(GpuCall::DestroyDescriptorPool(pool));
        });
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>> {
        self.probe.with(|s| {
            s.calls.push(GpuCall::AllocateDescriptorSets {
                pool,
                count: layouts.len(),
            });
            let sim = s
                .descriptor_pools
                .get_mut(&pool.as_raw())
                .ok_or(BackendError::Vulkan(vk::Result::ERROR_UNKNOWN))?;
            if sim.allocated + layouts.len() as u32 > sim.max_sets {
                return Err(BackendError::Vulkan(vk::Result::ERROR_OUT_OF_POOL_MEMORY));
            }
            sim.allocated += layouts.len() as u32;
            let sets = (0..layouts.len())
                .map(|_| {
                    s.next_handle += 1;
                    vk::DescriptorSet::from_raw(s.next_handle)
                })
                .collect();
            Ok(sets)
        })
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<()> {
        self.probe.with(|s| {
            s.calls.push(GpuCall::ResetDescriptorPool(pool));
            let sim = s
                .descriptor_pools
                .get_mut(&pool.as_raw())
                .ok_or(BackendError::Vulkan(vk::Result::ERROR_UNKNOWN))?;
            sim.allocated = 0;
            Ok(())
        })
    }

    fn surface_support(&self, _surface: vk::SurfaceKHR) -> Result<SurfaceSupport> {
        let config = &self.config;
        let current_extent = config.current_extent.unwrap_or(vk::Extent2D {
            width: u32::MAX,
            height: u32::MAX,
        });

        Ok(SurfaceSupport {
            capabilities: vk::SurfaceCapabilitiesKHR {
                min_image_count: config.min_image_count,
                max_image_count: config.max_image_count,
                current_extent,
                min_image_extent: vk::Extent2D { width: 1, height: 1 },
                max_image_extent: vk::Extent2D {
                    width: 16384,
                    height: 16384,
                },
                max_image_array_layers: 1,
                supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
                current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
                supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
            },
            formats: config.formats.clone(),
            present_modes: config.present_modes.clone(),
        })
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> Result<vk::SwapchainKHR> {
        let config = &self.config;
        self.probe.with(|s| {
            // The old chain is retired whether or not creation succeeds
            if desc.old_swapchain != vk::SwapchainKHR::null() {
                match s.swapchains.get_mut(&desc.old_swapchain.as_raw()) {
                    Some(old) if old.retired => s.violations.push("old swapchain is already retired".to_string()),
                    Some(old) => old.retired = true,
                    None => s.violations.push("old swapchain is not live".to_string()),
                }
            }
            s.fail(FailPoint::CreateSwapchain)?;

            let mut granted = (desc.image_count + config.extra_images).max(config.min_image_count);
            if config.max_image_count > 0 {
                granted = granted.min(config.max_image_count);
            }

            let swapchain: vk::SwapchainKHR = s.mint(ObjectKind::Swapchain);
            let images = (0..granted)
                .map(|_| {
                    s.next_handle += 1;
                    vk::Image::from_raw(s.next_handle)
                })
                .collect();
            s.swapchains.insert(
                swapchain.as_raw(),
                SimSwapchain {
                    images,
                    next_image: 0,
                    retired: false,
                },
            );
            s.calls.push(GpuCall::CreateSwapchain {
                swapchain,
                image_count: granted,
                present_mode: desc.present_mode,
                extent: desc.extent,
            });
            Ok(swapchain)
        })
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        self.probe.with(|s| {
            s.swapchains.remove(&swapchain.as_raw());
            s.release(swapchain, ObjectKind::Swapchain);
            s.calls.push(GpuCall::DestroySwapchain(swapchain));
        });
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>> {
        self.probe.with(|s| {
            s.swapchains
                .get(&swapchain.as_raw())
                .map(|sim| sim.images.clone())
                .ok_or(BackendError::Vulkan(vk::Result::ERROR_UNKNOWN))
        })
    }

    fn create_image_view(&self, _image: vk::Image, _format: vk::Format) -> Result<vk::ImageView> {
        Ok(self.probe.with(|s| {
            let view: vk::ImageView = s.mint(ObjectKind::ImageView);
            s.calls.push(GpuCall::CreateImageView(view));
            view
        }))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.probe.with(|s| {
            s.release(view, ObjectKind::ImageView);
            s.calls.push(GpuCall::DestroyImageView(view));
        });
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
        timeout: Duration,
    ) -> Result<(u32, bool)> {
        self.probe.with(|s| {
            s.check_lost()?;
            let suboptimal = match s.take_fault(&[
                Fault::AcquireOutOfDate,
                Fault::AcquireTimeout,
                Fault::AcquireSuboptimal,
            ]) {
                Some(Fault::AcquireOutOfDate) => return Err(BackendError::SwapchainOutOfDate),
                Some(Fault::AcquireTimeout) => {
                    return Err(BackendError::DeviceTimeout {
                        what: "swapchain image",
                        timeout,
                    })
                }
                Some(_) => true,
                None => false,
            };

            let sim = s
                .swapchains
                .get_mut(&swapchain.as_raw())
                .ok_or(BackendError::Vulkan(vk::Result::ERROR_UNKNOWN))?;
            if sim.retired {
                s.violations
                    .push(format!("acquire from retired swapchain {:#x}", swapchain.as_raw()));
                return Err(BackendError::SwapchainOutOfDate);
            }
            let image_index = sim.next_image;
            sim.next_image = (sim.next_image + 1) % sim.images.len() as u32;

            if !s.signaled_semaphores.insert(signal.as_raw()) {
                s.violations
                    .push(format!("acquire signals already-signaled semaphore {:#x}", signal.as_raw()));
            }
            s.calls.push(GpuCall::AcquireImage {
                swapchain,
                image_index,
            });
            Ok((image_index, suboptimal))
        })
    }

    fn queue_present(
        &self,
        _queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: &[vk::Semaphore],
    ) -> Result<bool> {
        self.probe.with(|s| {
            s.check_lost()?;
            for semaphore in wait {
                if !s.signaled_semaphores.remove(&semaphore.as_raw()) {
                    s.violations
                        .push(format!("present waits on unsignaled semaphore {:#x}", semaphore.as_raw()));
                }
            }
            s.calls.push(GpuCall::Present {
                swapchain,
                image_index,
            });
            match s.take_fault(&[Fault::PresentOutOfDate, Fault::PresentSuboptimal]) {
                Some(Fault::PresentOutOfDate) => Err(BackendError::SwapchainOutOfDate),
                Some(_) => Ok(true),
                None => Ok(false),
            }
        })
    }

    fn create_memory_backend(&self) -> Result<Box<dyn MemoryBackend>> {
        let handle = self.probe.with(|s| -> Result<u64> {
            s.fail(FailPoint::CreateMemoryBackend)?;
            s.calls.push(GpuCall::CreateMemoryBackend);
            Ok(s.mint::<vk::DeviceMemory>(ObjectKind::MemoryBackend).as_raw())
        })?;

        Ok(Box::new(HeadlessMemory {
            handle,
            probe: self.probe.clone(),
            allocated: 0,
        }))
    }
}

impl Drop for HeadlessDevice {
    fn drop(&mut self) {
        self.probe.with(|s| {
            let leaked: Vec<ObjectKind> = s
                .live
                .values()
                .copied()
                .filter(|kind| {
                    !matches!(kind, ObjectKind::Instance | ObjectKind::Surface | ObjectKind::Device)
                })
                .collect();
            if !leaked.is_empty() {
                s.violations
                    .push(format!("device destroyed with live objects: {:?}", leaked));
            }
            let device = s
                .live
                .iter()
                .find(|(_, kind)| **kind == ObjectKind::Device)
                .map(|(raw, _)| *raw);
            if let Some(raw) = device {
                s.live.remove(&raw);
            }
            s.calls.push(GpuCall::DestroyDevice);
        });
    }
}

// =============================================================================
// MEMORY
// =============================================================================

struct HeadlessMemory {
    handle: u64,
    probe: Arc<HeadlessProbe>,
    allocated: u64,
}

impl MemoryBackend for HeadlessMemory {
    fn allocate_buffer(&mut self, desc: &BufferDesc) -> Result<RawBuffer> {
        let buffer = self.probe.with(|s| {
            let buffer: vk::Buffer = s.mint(ObjectKind::Buffer);
            s.buffers.insert(buffer.as_raw(), vec![0; desc.size as usize]);
            s.calls.push(GpuCall::AllocateBuffer(buffer));
            buffer
        });
        self.allocated += desc.size;

        Ok(RawBuffer {
            buffer,
            size: desc.size,
            location: desc.location,
        })
    }

    fn write_buffer(&mut self, buffer: &RawBuffer, offset: u64, data: &[u8]) -> Result<()> {
        if !buffer.is_host_visible() {
            return Err(BackendError::Vulkan(vk::Result::ERROR_MEMORY_MAP_FAILED));
        }
        self.probe.with(|s| {
            let bytes = s
                .buffers
                .get_mut(&buffer.buffer.as_raw())
                .ok_or(BackendError::Vulkan(vk::Result::ERROR_UNKNOWN))?;
            let start = offset as usize;
            let end = start + data.len();
            if end > bytes.len() {
                return Err(BackendError::OutOfBounds {
                    offset: start,
                    size: data.len(),
                    capacity: bytes.len(),
                });
            }
            bytes[start..end].copy_from_slice(data);
            s.calls.push(GpuCall::WriteBuffer {
                buffer: buffer.buffer,
                offset,
                len: data.len(),
            });
            Ok(())
        })
    }

    fn free_buffer(&mut self, buffer: RawBuffer) -> Result<()> {
        self.probe.with(|s| {
            s.buffers.remove(&buffer.buffer.as_raw());
            s.release(buffer.buffer, ObjectKind::Buffer);
            s.calls.push(GpuCall::FreeBuffer(buffer.buffer));
        });
        self.allocated = self.allocated.saturating_sub(buffer.size);
        Ok(())
    }

    fn allocated_bytes(&self) -> u64 {
        self.allocated
    }
}

impl Drop for HeadlessMemory {
    fn drop(&mut self) {
        self.probe.with(|s| {
            s.release(vk::DeviceMemory::from_raw(self.handle), ObjectKind::MemoryBackend);
            s.calls.push(GpuCall::DestroyMemoryBackend);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> (HeadlessPlatform, Box<dyn GpuInstance>, OpenedDevice) {
        let platform = HeadlessPlatform::default();
        let instance = platform.create_instance(&InstanceDesc::default()).unwrap();
        let opened = instance
            .open_device(&DeviceRequest {
                physical_index: 0,
                graphics_family: 0,
                transfer_family: 1,
                extensions: vec!["VK_KHR_swapchain".into()],
                features: vk::PhysicalDeviceFeatures::default(),
            })
            .unwrap();
        (platform, instance, opened)
    }

    #[test]
    fn unsubmitted_fence_times_out() {
        let (_platform, _instance, opened) = open();
        let device = &opened.device;
        let fence = device.create_fence(false).unwrap();

        let err = device.wait_for_fence(fence, Duration::from_millis(1)).unwrap_err();
        assert!(matches!(err, BackendError::DeviceTimeout { what: "fence", .. }));

        device.destroy_fence(fence);
    }

    #[test]
    fn pending_buffer_cannot_be_rerecorded() {
        let (platform, _instance, opened) = open();
        let device = &opened.device;
        let probe = platform.probe();

        let pool = device
            .create_command_pool(0, vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .unwrap();
        let cb = device
            .allocate_command_buffers(pool, vk::CommandBufferLevel::PRIMARY, 1)
            .unwrap()[0];
        let fence = device.create_fence(false).unwrap();

        device.begin_command_buffer(cb, vk::CommandBufferUsageFlags::empty()).unwrap();
        device.end_command_buffer(cb).unwrap();
        device
            .queue_submit(
                opened.graphics_queue,
                &Submission {
                    command_buffers: &[cb],
                    ..Default::default()
                },
                fence,
            )
            .unwrap();

        assert!(device.begin_command_buffer(cb, vk::CommandBufferUsageFlags::empty()).is_err());
        assert_eq!(probe.violations().len(), 1);

        device.wait_for_fence(fence, Duration::from_millis(1)).unwrap();
        device.begin_command_buffer(cb, vk::CommandBufferUsageFlags::empty()).unwrap();
        device.end_command_buffer(cb).unwrap();

        device.destroy_fence(fence);
        device.destroy_command_pool(pool);
        assert_eq!(probe.live(ObjectKind::CommandBuffer), 0);
    }

    #[test]
    fn faults_are_one_shot() {
        let (platform, _instance, opened) = open();
        let device = &opened.device;
        let probe = platform.probe();

        let swapchain = device
            .create_swapchain(&SwapchainDesc {
                surface: vk::SurfaceKHR::null(),
                image_count: 2,
                format: HeadlessConfig::default().formats[0],
                extent: vk::Extent2D { width: 8, height: 8 },
                present_mode: vk::PresentModeKHR::FIFO,
                pre_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                old_swapchain: vk::SwapchainKHR::null(),
            })
            .unwrap();
        let semaphore = device.create_semaphore().unwrap();

        probe.inject(Fault::AcquireOutOfDate);
        assert!(matches!(
            device.acquire_next_image(swapchain, semaphore, Duration::from_millis(1)),
            Err(BackendError::SwapchainOutOfDate)
        ));
        assert_eq!(
            device
                .acquire_next_image(swapchain, semaphore, Duration::from_millis(1))
                .unwrap(),
            (0, false)
        );

        device.destroy_semaphore(semaphore);
        device.destroy_swapchain(swapchain);
    }

    #[test]
    fn device_drop_reports_leaks() {
        let (platform, _instance, opened) = open();
        let probe = platform.probe();
        let _leaked = opened.device.create_semaphore().unwrap();

        drop(opened);
        assert!(probe
            .violations()
            .iter()
            .any(|v| v.contains("device destroyed with live objects")));
    }

    #[test]
    fn granted_image_count_respects_limits() {
        let platform = HeadlessPlatform::new(HeadlessConfig {
            extra_images: 1,
            max_image_count: 3,
            ..Default::default()
        });
        let instance = platform.create_instance(&InstanceDesc::default()).unwrap();
        let opened = instance
            .open_device(&DeviceRequest {
                physical_index: 0,
                graphics_family: 0,
                transfer_family: 0,
                extensions: Vec::new(),
                features: vk::PhysicalDeviceFeatures::default(),
            })
            .unwrap();
        let device = &opened.device;

        let swapchain = device
            .create_swapchain(&SwapchainDesc {
                surface: vk::SurfaceKHR::null(),
                image_count: 3,
                format: HeadlessConfig::default().formats[0],
                extent: vk::Extent2D { width: 8, height: 8 },
                present_mode: vk::PresentModeKHR::FIFO,
                pre_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                old_swapchain: vk::SwapchainKHR::null(),
            })
            .unwrap();
        assert_eq!(device.swapchain_images(swapchain).unwrap().len(), 3);
        device.destroy_swapchain(swapchain);
    }
}
