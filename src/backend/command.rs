// Command pools - one per queue purpose
//
// Both pools allow per-buffer reset so frame slots can re-record their own
// buffer without touching the others.

use ash::vk;
use std::sync::Arc;
use std::time::Duration;

use super::gpu::{GpuDevice, Submission};
use crate::error::{BackendError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePurpose {
    Graphics,
    Transfer,
}

#[derive(Debug, Clone, Copy)]
struct PoolEntry {
    pool: vk::CommandPool,
    family: u32,
    queue: vk::Queue,
}

/// Queue family and queue handle for one purpose.
#[derive(Debug, Clone, Copy)]
pub struct QueueBinding {
    pub family: u32,
    pub queue: vk::Queue,
}

pub struct CommandPoolSet {
    device: Arc<dyn GpuDevice>,
    graphics: PoolEntry,
    transfer: PoolEntry,
    destroyed: bool,
}

impl CommandPoolSet {
    pub fn new(device: Arc<dyn GpuDevice>, graphics: QueueBinding, transfer: QueueBinding) -> Result<Self> {
        let flags = vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER;

        let transfer_pool = device.create_command_pool(transfer.family, flags)?;
        let graphics_pool = match device.create_command_pool(graphics.family, flags) {
            Ok(pool) => pool,
            Err(err) => {
                device.destroy_command_pool(transfer_pool);
                return Err(err);
            }
        };

        log::info!(
            "Created command pools (graphics family {}, transfer family {})",
            graphics.family,
            transfer.family
        );

        Ok(Self {
            device,
            graphics: PoolEntry {
                pool: graphics_pool,
                family: graphics.family,
                queue: graphics.queue,
            },
            transfer: PoolEntry {
                pool: transfer_pool,
                family: transfer.family,
                queue: transfer.queue,
            },
            destroyed: false,
        })
    }

    fn entry(&self, purpose: QueuePurpose) -> &PoolEntry {
        match purpose {
            QueuePurpose::Graphics => &self.graphics,
            QueuePurpose::Transfer => &self.transfer,
        }
    }

    fn live_pool(&self, purpose: QueuePurpose) -> Result<vk::CommandPool> {
        if self.destroyed {
            return Err(BackendError::invalid_state("use command pool", "destroyed"));
        }
        Ok(self.entry(purpose).pool)
    }

    pub fn allocate(
        &self,
        purpose: QueuePurpose,
        count: u32,
        level: vk::CommandBufferLevel,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let pool = self.live_pool(purpose)?;
        if count == 0 {
            return Ok(Vec::new());
        }
        self.device.allocate_command_buffers(pool, level, count)
    }

    /// The buffers must not be pending on a queue.
    pub fn free(&self, purpose: QueuePurpose, buffers: &[vk::CommandBuffer]) {
        if buffers.is_empty() || self.destroyed {
            return;
        }
        self.device.free_command_buffers(self.entry(purpose).pool, buffers);
    }

    pub fn reset(&self, buffer: vk::CommandBuffer) -> Result<()> {
        self.device.reset_command_buffer(buffer)
    }

    pub fn queue(&self, purpose: QueuePurpose) -> vk::Queue {
        self.entry(purpose).queue
    }

    pub fn family(&self, purpose: QueuePurpose) -> u32 {
        self.entry(purpose).family
    }

    /// Record, submit and wait for a throwaway command buffer (uploads, layout changes).
    pub fn one_time_submit<F>(&self, purpose: QueuePurpose, timeout: Duration, record: F) -> Result<()>
    where
        F: FnOnce(&dyn GpuDevice, vk::CommandBuffer) -> Result<()>,
    {
        let buffers = self.allocate(purpose, 1, vk::CommandBufferLevel::PRIMARY)?;
        let fence = match self.device.create_fence(false) {
            Ok(fence) => fence,
            Err(err) => {
                self.free(purpose, &buffers);
                return Err(err);
            }
        };

        let result = self.submit_and_wait(purpose, buffers[0], fence, timeout, record);

        // A submission that never completed must not have its buffer freed
        let in_flight = matches!(result, Err(BackendError::DeviceTimeout { .. }));
        if in_flight {
            log::warn!("One-time submit timed out, waiting for the device before release");
            if let Err(err) = self.device.wait_idle() {
                log::error!("Device wait failed: {}", err);
            }
        }
        self.device.destroy_fence(fence);
        self.free(purpose, &buffers);
        result
    }

    fn submit_and_wait<F>(
        &self,
        purpose: QueuePurpose,
        buffer: vk::CommandBuffer,
        fence: vk::Fence,
        timeout: Duration,
        record: F,
    ) -> Result<()>
    where
        F: FnOnce(&dyn GpuDevice, vk::CommandBuffer) -> Result<()>,
    {
        let device = self.device.as_ref();
        device.begin_command_buffer(buffer, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        let recorded = record(device, buffer);
        device.end_command_buffer(buffer)?;
        recorded?;

        device.queue_submit(
            self.queue(purpose),
            &Submission {
                command_buffers: &[buffer],
                ..Default::default()
            },
            fence,
        )?;
        device.wait_for_fence(fence, timeout)
    }

    /// Destroy both pools once the device is idle. Safe to call repeatedly.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        if let Err(err) = self.device.wait_idle() {
            log::warn!("Device not idle before command pool destruction: {}", err);
        }
        self.device.destroy_command_pool(self.graphics.pool);
        self.device.destroy_command_pool(self.transfer.pool);
        self.destroyed = true;
        log::info!("Destroyed command pools");
    }
}

impl Drop for CommandPoolSet {
    fn drop(&mut self) {
        self.destroy();
    }
}
