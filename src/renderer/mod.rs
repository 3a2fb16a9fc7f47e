// Renderer plugins - per-frame draw command producers
//
// A renderer never owns GPU infrastructure; it borrows it through
// BackendServices for the duration of each hook call.

pub mod registry;

pub use registry::{RendererHandle, RendererRegistry};

use ash::vk;

use crate::backend::{DescriptorPool, DeviceContext, GpuDevice, ParamBlock, ResourceAllocator, Swapchain};
use crate::error::{ContractMode, Result};

/// Everything a renderer needs to record into the current frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameContext {
    /// Already begun; the backend ends and submits it.
    pub command_buffer: vk::CommandBuffer,
    pub slot: usize,
    pub image_index: u32,
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub clear_color: [f32; 4],
}

/// Borrowed view of the built backend stages.
#[derive(Clone, Copy)]
pub struct BackendServices<'a> {
    pub device: &'a DeviceContext,
    pub swapchain: &'a Swapchain,
    pub allocator: &'a ResourceAllocator,
    pub descriptors: &'a DescriptorPool,
    pub contract: ContractMode,
}

impl<'a> BackendServices<'a> {
    /// Borrowed for the hook call only; the device cannot be retained.
    pub fn gpu(&self) -> Result<&'a dyn GpuDevice> {
        self.device.device()
    }

    /// CPU-cached parameter buffer backed by host-visible memory.
    pub fn create_param_block(&self, size: usize, usage: vk::BufferUsageFlags) -> Result<ParamBlock> {
        ParamBlock::new(self.allocator, size, usage, self.contract)
    }
}

/// A pluggable renderer owned by the registry.
///
/// Hook errors are reported as `BackendError::Renderer`. A failing `render`
/// still leaves the frame presentable: the backend records a clear-only pass
/// in its place.
pub trait Renderer: Send {
    fn name(&self) -> &str;

    /// Called once when the renderer is added to a built backend.
    fn attach(&mut self, _services: &BackendServices<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called with the slot's fence already waited, so per-slot resources are free to touch.
    fn update(&mut self, _slot: usize, _services: &BackendServices<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn render(&mut self, frame: &FrameContext, services: &BackendServices<'_>) -> anyhow::Result<()>;

    /// Release GPU resources created in `attach`. Called on removal and teardown.
    fn detach(&mut self, _services: &BackendServices<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Records a clear of the frame image to a fixed colour.
pub struct ClearRenderer {
    name: String,
    color: [f32; 4],
}

impl ClearRenderer {
    pub fn new(name: impl Into<String>, color: [f32; 4]) -> Self {
        Self {
            name: name.into(),
            color,
        }
    }

    pub fn set_color(&mut self, color: [f32; 4]) {
        self.color = color;
    }
}

impl Renderer for ClearRenderer {
    fn name(&self) -> &str {
        &self.name
    }

    fn render(&mut self, frame: &FrameContext, services: &BackendServices<'_>) -> anyhow::Result<()> {
        services
            .gpu()?
            .cmd_clear_color_image(frame.command_buffer, frame.image, self.color);
        Ok(())
    }
}
