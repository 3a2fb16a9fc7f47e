// Device memory through gpu-allocator
//
// Every buffer gets its own sub-allocation; host-visible locations come back
// persistently mapped, so writes are plain copies into the mapped slice.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use std::collections::HashMap;

use crate::backend::gpu::{BufferDesc, MemoryBackend, RawBuffer};
use crate::error::{BackendError, Result};

pub struct VulkanMemory {
    device: ash::Device,
    allocator: Option<Allocator>,
    allocations: HashMap<vk::Buffer, Allocation>,
    allocated: u64,
}

impl VulkanMemory {
    pub fn new(instance: &ash::Instance, physical_device: vk::PhysicalDevice, device: &ash::Device) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;

        Ok(Self {
            device: device.clone(),
            allocator: Some(allocator),
            allocations: HashMap::new(),
            allocated: 0,
        })
    }

    fn allocator(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| BackendError::invalid_state("allocate memory", "destroyed"))
    }
}

impl MemoryBackend for VulkanMemory {
    fn allocate_buffer(&mut self, desc: &BufferDesc) -> Result<RawBuffer> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.allocator()?.allocate(&AllocationCreateDesc {
            name: &desc.name,
            requirements,
            location: desc.location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(err.into());
            }
        };

        if let Err(err) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            let _ = self.allocator()?.free(allocation);
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(err.into());
        }

        self.allocated += allocation.size();
        self.allocations.insert(buffer, allocation);

        Ok(RawBuffer {
            buffer,
            size: desc.size,
            location: desc.location,
        })
    }

    fn write_buffer(&mut self, buffer: &RawBuffer, offset: u64, data: &[u8]) -> Result<()> {
        let allocation = self
            .allocations
            .get_mut(&buffer.buffer)
            .ok_or_else(|| BackendError::invalid_parameter("buffer has no allocation"))?;

        let mapped = allocation
            .mapped_slice_mut()
            .ok_or_else(|| BackendError::invalid_parameter("buffer memory is not host visible"))?;

        let start = offset as usize;
        let end = start + data.len();
        if end > mapped.len() {
            return Err(BackendError::OutOfBounds {
                offset: start,
                size: data.len(),
                capacity: mapped.len(),
            });
        }
        mapped[start..end].copy_from_slice(data);
        Ok(())
    }

    fn free_buffer(&mut self, buffer: RawBuffer) -> Result<()> {
        let allocation = self
            .allocations
            .remove(&buffer.buffer)
            .ok_or_else(|| BackendError::invalid_parameter("buffer has no allocation"))?;

        self.allocated = self.allocated.saturating_sub(allocation.size());
        let freed = self.allocator()?.free(allocation);
        unsafe { self.device.destroy_buffer(buffer.buffer, None) };
        freed?;
        Ok(())
    }

    fn allocated_bytes(&self) -> u64 {
        self.allocated
    }
}

impl Drop for VulkanMemory {
    fn drop(&mut self) {
        let leftovers: Vec<(vk::Buffer, Allocation)> = self.allocations.drain().collect();
        if let Some(allocator) = self.allocator.as_mut() {
            for (buffer, allocation) in leftovers {
                let _ = allocator.free(allocation);
                unsafe { self.device.destroy_buffer(buffer, None) };
            }
        }
        // The allocator releases its memory blocks here, before the device goes away
        self.allocator.take();
    }
}
