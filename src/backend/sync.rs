// Synchronization primitives
//
// One FrameSlot per swapchain image: the fence guards CPU reuse of the
// slot's command buffer, the semaphores order acquire -> submit -> present.

use ash::vk;

use super::gpu::GpuDevice;
use crate::error::Result;

#[derive(Debug, Clone, Copy)]
pub struct FrameSlot {
    /// Null until the command pools are built and attach a buffer.
    pub command_buffer: vk::CommandBuffer,
    pub in_flight: vk::Fence,
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
}

impl FrameSlot {
    /// The fence starts signaled so the first wait on a fresh slot returns at once.
    pub fn new(device: &dyn GpuDevice) -> Result<Self> {
        let in_flight = device.create_fence(true)?;

        let image_available = match device.create_semaphore() {
            Ok(semaphore) => semaphore,
            Err(err) => {
                device.destroy_fence(in_flight);
                return Err(err);
            }
        };

        let render_finished = match device.create_semaphore() {
            Ok(semaphore) => semaphore,
            Err(err) => {
                device.destroy_semaphore(image_available);
                device.destroy_fence(in_flight);
                return Err(err);
            }
        };

        Ok(Self {
            command_buffer: vk::CommandBuffer::null(),
            in_flight,
            image_available,
            render_finished,
        })
    }

    /// Command buffers belong to the command pools and are not freed here.
    pub fn destroy(&self, device: &dyn GpuDevice) {
        device.destroy_semaphore(self.render_finished);
        device.destroy_semaphore(self.image_available);
        device.destroy_fence(self.in_flight);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::gpu::{DeviceRequest, GpuPlatform, InstanceDesc};
    use crate::backend::headless::{HeadlessPlatform, ObjectKind};
    use std::time::Duration;

    #[test]
    fn fresh_slot_fence_is_signaled() {
        let platform = HeadlessPlatform::default();
        let probe = platform.probe();
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

        let slot = FrameSlot::new(opened.device.as_ref()).unwrap();
        assert_eq!(slot.command_buffer, vk::CommandBuffer::null());
        opened
            .device
            .wait_for_fence(slot.in_flight, Duration::from_millis(1))
            .unwrap();

        assert_eq!(probe.live(ObjectKind::Semaphore), 2);
        slot.destroy(opened.device.as_ref());
        assert_eq!(probe.live(ObjectKind::Semaphore), 0);
        assert_eq!(probe.live(ObjectKind::Fence), 0);
    }
}
