// Backend module - GPU abstraction layer
//
// Design: everything above gpu.rs talks to the GpuDevice seam; the Vulkan
// implementation is a thin wrapper around ash, the headless one simulates
// the device for tests and CI.

pub mod allocator;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod gpu;
pub mod headless;
pub mod param_block;
pub mod swapchain;
pub mod sync;
pub mod vulkan;

pub use allocator::{BufferHandle, ResourceAllocator};
pub use command::{CommandPoolSet, QueueBinding, QueuePurpose};
pub use descriptor::DescriptorPool;
pub use device::DeviceContext;
pub use gpu::{
    BackendKind, BufferDesc, DeviceCapabilities, GpuDevice, GpuInstance, GpuPlatform, HeadlessTarget,
    PresentTarget, RawBuffer, Submission,
};
pub use headless::{FailPoint, Fault, GpuCall, HeadlessConfig, HeadlessPlatform, HeadlessProbe, ObjectKind};
pub use param_block::ParamBlock;
pub use swapchain::{Swapchain, SwapchainSettings, SwapchainState};
pub use sync::FrameSlot;
pub use vulkan::VulkanPlatform;
