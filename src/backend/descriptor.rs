// Descriptor pool - pre-sized at build time
//
// Vulkan requires external synchronization of pool allocation, so the
// allocated-set counter and the allocation call share one lock.

use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

use super::gpu::GpuDevice;
use crate::error::{BackendError, Result};

pub struct DescriptorPool {
    device: Arc<dyn GpuDevice>,
    pool: vk::DescriptorPool,
    sizes: Vec<vk::DescriptorPoolSize>,
    max_sets: u32,
    allocated: Mutex<u32>,
    destroyed: bool,
}

impl DescriptorPool {
    pub fn new(device: Arc<dyn GpuDevice>, sizes: &[vk::DescriptorPoolSize], max_sets: u32) -> Result<Self> {
        if max_sets == 0 {
            return Err(BackendError::config("descriptor pool needs at least one set"));
        }
        if sizes.is_empty() || sizes.iter().any(|size| size.descriptor_count == 0) {
            return Err(BackendError::config("descriptor pool sizes must be non-empty and non-zero"));
        }

        let pool = device.create_descriptor_pool(sizes, max_sets)?;
        log::info!(
            "Created descriptor pool: {} sets, {} descriptor types",
            max_sets,
            sizes.len()
        );

        Ok(Self {
            device,
            pool,
            sizes: sizes.to_vec(),
            max_sets,
            allocated: Mutex::new(0),
            destroyed: false,
        })
    }

    /// One set per layout.
    pub fn allocate(&self, layouts: &[vk::DescriptorSetLayout]) -> Result<Vec<vk::DescriptorSet>> {
        if self.destroyed {
            return Err(BackendError::invalid_state("allocate descriptor sets", "destroyed"));
        }

        let mut allocated = self.allocated.lock();
        let total = reserve_sets(*allocated, layouts.len(), self.max_sets)?;

        let sets = self.device.allocate_descriptor_sets(self.pool, layouts)?;
        *allocated = total;
        Ok(sets)
    }

    /// Return every set to the pool. Sets still referenced by pending work must not be reset.
    pub fn reset(&self) -> Result<()> {
        let mut allocated = self.allocated.lock();
        self.device.reset_descriptor_pool(self.pool)?;
        *allocated = 0;
        Ok(())
    }

    pub fn raw(&self) -> vk::DescriptorPool {
        self.pool
    }

    pub fn allocated_sets(&self) -> u32 {
        *self.allocated.lock()
    }

    pub fn max_sets(&self) -> u32 {
        self.max_sets
    }

    pub fn sizes(&self) -> &[vk::DescriptorPoolSize] {
        &self.sizes
    }

    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.device.destroy_descriptor_pool(self.pool);
        self.destroyed = true;
        log::info!("Destroyed descriptor pool");
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Set count after taking `requested` more, if the pool has room for them.
fn reserve_sets(allocated: u32, requested: usize, max_sets: u32) -> Result<u32> {
    let total = u32::try_from(requested)
        .ok()
        .and_then(|wanted| allocated.checked_add(wanted))
        .ok_or_else(|| BackendError::invalid_parameter(format!("{} descriptor sets requested", requested)))?;
    if total > max_sets {
        log::warn!(
            "Descriptor pool exhausted: {} of {} sets in use, {} requested",
            allocated,
            max_sets,
            requested
        );
        return Err(BackendError::PoolExhausted("descriptor pool"));
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::gpu::{DeviceRequest, GpuPlatform, InstanceDesc};
    use crate::backend::headless::{HeadlessPlatform, ObjectKind};

    fn sizes() -> Vec<vk::DescriptorPoolSize> {
        vec![
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 64,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: 128,
            },
        ]
    }

    #[test]
    fn allocation_is_bounded_by_max_sets() {
        let platform = HeadlessPlatform::default();
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

        let mut pool = DescriptorPool::new(opened.device.clone(), &sizes(), 3).unwrap();
        let layouts = [vk::DescriptorSetLayout::null(); 2];

        assert_eq!(pool.allocate(&layouts).unwrap().len(), 2);
        assert!(matches!(
            pool.allocate(&layouts),
            Err(BackendError::PoolExhausted(_))
        ));
        assert_eq!(pool.allocated_sets(), 2);

        pool.reset().unwrap();
        assert_eq!(pool.allocated_sets(), 0);
        assert_eq!(pool.allocate(&layouts).unwrap().len(), 2);

        pool.destroy();
        assert_eq!(platform.probe().live(ObjectKind::DescriptorPool), 0);
    }

    #[test]
    fn zero_sized_pool_is_rejected() {
        let platform = HeadlessPlatform::default();
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

        assert!(matches!(
            DescriptorPool::new(opened.device.clone(), &sizes(), 0),
            Err(BackendError::Config(_))
        ));
        assert!(matches!(
            DescriptorPool::new(opened.device.clone(), &[], 4),
            Err(BackendError::Config(_))
        ));
    }

    #[test]
    fn oversized_requests_are_rejected_not_wrapped() {
        assert_eq!(reserve_sets(2, 3, 8).unwrap(), 5);
        assert!(matches!(reserve_sets(6, 3, 8), Err(BackendError::PoolExhausted(_))));
        assert!(matches!(
            reserve_sets(u32::MAX - 1, 2, u32::MAX),
            Err(BackendError::InvalidParameter(_))
        ));
        assert!(matches!(
            reserve_sets(0, u32::MAX as usize + 1, u32::MAX),
            Err(BackendError::InvalidParameter(_))
        ));
    }
}
