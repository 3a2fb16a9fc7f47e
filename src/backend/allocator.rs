// Resource allocator - buffer arena over the memory backend
//
// Higher layers hold BufferHandles, never raw buffers with shared owners.
// Records are swept in creation order when the allocator is destroyed, before
// the memory backend itself goes away.

use ash::vk;
use parking_lot::Mutex;
use std::collections::BTreeMap;

use super::gpu::{BufferDesc, GpuDevice, MemoryBackend, RawBuffer};
use crate::error::{BackendError, ContractMode, Result};

/// Stable id of one buffer in the allocator's arena. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(u64);

impl std::fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

#[derive(Debug)]
struct BufferRecord {
    name: String,
    usage: vk::BufferUsageFlags,
    raw: RawBuffer,
}

struct AllocatorState {
    memory: Option<Box<dyn MemoryBackend>>,
    records: BTreeMap<BufferHandle, BufferRecord>,
    next_id: u64,
}

pub struct ResourceAllocator {
    state: Mutex<AllocatorState>,
    contract: ContractMode,
}

impl ResourceAllocator {
    pub fn new(device: &dyn GpuDevice, contract: ContractMode) -> Result<Self> {
        let memory = device.create_memory_backend()?;
        log::info!("Created resource allocator ({} backend)", device.kind());

        Ok(Self {
            state: Mutex::new(AllocatorState {
                memory: Some(memory),
                records: BTreeMap::new(),
                next_id: 1,
            }),
            contract,
        })
    }

    pub fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferHandle> {
        if desc.size == 0 {
            return Err(BackendError::invalid_parameter(format!(
                "buffer '{}' has zero size",
                desc.name
            )));
        }

        let mut state = self.state.lock();
        let memory = state
            .memory
            .as_mut()
            .ok_or_else(|| BackendError::invalid_state("create buffer", "destroyed"))?;
        let raw = memory.allocate_buffer(desc)?;

        let handle = BufferHandle(state.next_id);
        state.next_id += 1;
        state.records.insert(
            handle,
            BufferRecord {
                name: desc.name.clone(),
                usage: desc.usage,
                raw,
            },
        );
        log::debug!("Allocated {} '{}' ({} bytes, {:?})", handle, desc.name, desc.size, desc.location);
        Ok(handle)
    }

    /// Copy `data` into a host-visible buffer at `offset`.
    pub fn write(&self, handle: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let raw = match state.records.get(&handle) {
            Some(record) => record.raw,
            None => {
                return Err(self
                    .contract
                    .violation(BackendError::invalid_parameter(format!("unknown {}", handle))))
            }
        };

        let end = offset.checked_add(data.len() as u64);
        if end.map_or(true, |end| end > raw.size) {
            return Err(self.contract.violation(BackendError::OutOfBounds {
                offset: offset as usize,
                size: data.len(),
                capacity: raw.size as usize,
            }));
        }
        if !raw.is_host_visible() {
            return Err(BackendError::invalid_parameter(format!(
                "{} is not host visible ({:?})",
                handle, raw.location
            )));
        }

        let memory = state
            .memory
            .as_mut()
            .ok_or_else(|| BackendError::invalid_state("write buffer", "destroyed"))?;
        memory.write_buffer(&raw, offset, data)
    }

    pub fn destroy_buffer(&self, handle: BufferHandle) -> Result<()> {
        let mut state = self.state.lock();
        let Some(record) = state.records.remove(&handle) else {
            return Err(self
                .contract
                .violation(BackendError::invalid_parameter(format!("unknown {}", handle))));
        };

        log::debug!("Freeing {} '{}'", handle, record.name);
        match state.memory.as_mut() {
            Some(memory) => memory.free_buffer(record.raw),
            None => Ok(()),
        }
    }

    pub fn raw_buffer(&self, handle: BufferHandle) -> Result<RawBuffer> {
        self.state
            .lock()
            .records
            .get(&handle)
            .map(|record| record.raw)
            .ok_or_else(|| BackendError::invalid_parameter(format!("unknown {}", handle)))
    }

    pub fn usage(&self, handle: BufferHandle) -> Option<vk::BufferUsageFlags> {
        self.state.lock().records.get(&handle).map(|record| record.usage)
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.state
            .lock()
            .memory
            .as_ref()
            .map(|memory| memory.allocated_bytes())
            .unwrap_or(0)
    }

    /// Free every remaining buffer, then the memory backend. Safe to call repeatedly.
    pub fn destroy(&mut self) {
        let state = self.state.get_mut();
        let Some(mut memory) = state.memory.take() else {
            return;
        };

        let records = std::mem::take(&mut state.records);
        if !records.is_empty() {
            log::warn!("Sweeping {} buffers still alive at allocator teardown", records.len());
        }
        for (handle, record) in records {
            if let Err(err) = memory.free_buffer(record.raw) {
                log::error!("Failed to free {} '{}': {}", handle, record.name, err);
            }
        }
        drop(memory);
        log::info!("Destroyed resource allocator");
    }
}

impl Drop for ResourceAllocator {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::gpu::{DeviceRequest, GpuPlatform, InstanceDesc, OpenedDevice};
    use crate::backend::headless::{GpuCall, HeadlessPlatform, ObjectKind};
    use gpu_allocator::MemoryLocation;

    fn open(platform: &HeadlessPlatform) -> (Box<dyn crate::backend::GpuInstance>, OpenedDevice) {
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
        (instance, opened)
    }

    fn uniform(name: &str, size: u64) -> BufferDesc {
        BufferDesc {
            name: name.to_string(),
            size,
            usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
            location: MemoryLocation::CpuToGpu,
        }
    }

    #[test]
    fn write_reaches_buffer_memory() {
        let platform = HeadlessPlatform::default();
        let (_instance, opened) = open(&platform);
        let allocator = ResourceAllocator::new(opened.device.as_ref(), ContractMode::Report).unwrap();

        let handle = allocator.create_buffer(&uniform("params", 8)).unwrap();
        allocator.write(handle, 4, &[1, 2, 3, 4]).unwrap();

        let raw = allocator.raw_buffer(handle).unwrap();
        assert_eq!(
            platform.probe().buffer_contents(raw.buffer).unwrap(),
            vec![0, 0, 0, 0, 1, 2, 3, 4]
        );
        assert_eq!(allocator.allocated_bytes(), 8);
    }

    #[test]
    fn out_of_bounds_write_is_rejected() {
        let platform = HeadlessPlatform::default();
        let (_instance, opened) = open(&platform);
        let allocator = ResourceAllocator::new(opened.device.as_ref(), ContractMode::Report).unwrap();
        let handle = allocator.create_buffer(&uniform("params", 4)).unwrap();

        assert!(matches!(
            allocator.write(handle, 2, &[0; 4]),
            Err(BackendError::OutOfBounds { capacity: 4, .. })
        ));
        assert!(matches!(
            allocator.write(handle, u64::MAX, &[0; 1]),
            Err(BackendError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn device_local_buffers_are_not_mappable() {
        let platform = HeadlessPlatform::default();
        let (_instance, opened) = open(&platform);
        let allocator = ResourceAllocator::new(opened.device.as_ref(), ContractMode::Report).unwrap();
        let handle = allocator
            .create_buffer(&BufferDesc {
                location: MemoryLocation::GpuOnly,
                ..uniform("vertices", 16)
            })
            .unwrap();

        assert!(matches!(
            allocator.write(handle, 0, &[0; 4]),
            Err(BackendError::InvalidParameter(_))
        ));
    }

    #[test]
    fn destroyed_handles_are_unknown() {
        let platform = HeadlessPlatform::default();
        let (_instance, opened) = open(&platform);
        let allocator = ResourceAllocator::new(opened.device.as_ref(), ContractMode::Report).unwrap();

        let first = allocator.create_buffer(&uniform("a", 16)).unwrap();
        allocator.destroy_buffer(first).unwrap();
        let second = allocator.create_buffer(&uniform("b", 16)).unwrap();

        assert_ne!(first, second);
        assert!(allocator.raw_buffer(first).is_err());
        assert!(allocator.destroy_buffer(first).is_err());
        assert_eq!(allocator.live_buffers(), 1);
        assert!(matches!(
            allocator.create_buffer(&uniform("empty", 0)),
            Err(BackendError::InvalidParameter(_))
        ));
    }

    #[test]
    fn teardown_sweeps_in_creation_order() {
        let platform = HeadlessPlatform::default();
        let probe = platform.probe();
        let (_instance, opened) = open(&platform);
        let mut allocator = ResourceAllocator::new(opened.device.as_ref(), ContractMode::Report).unwrap();

        let a = allocator.raw_buffer(allocator.create_buffer(&uniform("a", 4)).unwrap()).unwrap();
        let b = allocator.raw_buffer(allocator.create_buffer(&uniform("b", 4)).unwrap()).unwrap();
        probe.clear_calls();

        allocator.destroy();
        allocator.destroy();

        assert_eq!(
            probe.calls(),
            vec![
                GpuCall::FreeBuffer(a.buffer),
                GpuCall::FreeBuffer(b.buffer),
                GpuCall::DestroyMemoryBackend,
            ]
        );
        assert_eq!(probe.live(ObjectKind::Buffer), 0);
        assert_eq!(probe.live(ObjectKind::MemoryBackend), 0);
        assert!(matches!(
            allocator.create_buffer(&uniform("late", 4)),
            Err(BackendError::InvalidState { .. })
        ));
    }
}
