// Param block - CPU-side cache of a small GPU parameter buffer
//
// Every access hits the cache; the GPU copy is stale until flush_to_gpu.
// Mutation takes &mut self, so the caller serializes writes and flushes.

use ash::vk;
use gpu_allocator::MemoryLocation;

use super::allocator::{BufferHandle, ResourceAllocator};
use super::gpu::BufferDesc;
use crate::error::{BackendError, ContractMode, Result};

pub struct ParamBlock {
    cache: Vec<u8>,
    dirty: bool,
    usage: vk::BufferUsageFlags,
    buffer: Option<BufferHandle>,
    contract: ContractMode,
}

impl ParamBlock {
    /// Allocate a host-visible buffer of `size` bytes. The cache starts zeroed.
    pub fn new(
        allocator: &ResourceAllocator,
        size: usize,
        usage: vk::BufferUsageFlags,
        contract: ContractMode,
    ) -> Result<Self> {
        if size == 0 {
            return Err(BackendError::invalid_parameter("param block size must be positive"));
        }

        let buffer = allocator.create_buffer(&BufferDesc {
            name: format!("param block ({} bytes)", size),
            size: size as u64,
            usage,
            location: MemoryLocation::CpuToGpu,
        })?;

        Ok(Self {
            cache: vec![0; size],
            dirty: false,
            usage,
            buffer: Some(buffer),
            contract,
        })
    }

    pub fn size(&self) -> usize {
        self.cache.len()
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// `None` once released.
    pub fn buffer(&self) -> Option<BufferHandle> {
        self.buffer
    }

    pub fn data(&self) -> &[u8] {
        &self.cache
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn check_range(&self, offset: usize, size: usize) -> Result<std::ops::Range<usize>> {
        match offset.checked_add(size) {
            Some(end) if end <= self.cache.len() => Ok(offset..end),
            _ => Err(self.contract.violation(BackendError::OutOfBounds {
                offset,
                size,
                capacity: self.cache.len(),
            })),
        }
    }

    pub fn read(&self, offset: usize, size: usize) -> Result<&[u8]> {
        let range = self.check_range(offset, size)?;
        Ok(&self.cache[range])
    }

    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let range = self.check_range(offset, data.len())?;
        self.cache[range].copy_from_slice(data);
        self.mark_dirty();
        Ok(())
    }

    pub fn set_zero(&mut self, offset: usize, size: usize) -> Result<()> {
        let range = self.check_range(offset, size)?;
        self.cache[range].fill(0);
        self.mark_dirty();
        Ok(())
    }

    pub fn clear(&mut self) {
        self.cache.fill(0);
        self.mark_dirty();
    }

    pub fn write_value<T: bytemuck::Pod>(&mut self, offset: usize, value: &T) -> Result<()> {
        self.write(offset, bytemuck::bytes_of(value))
    }

    pub fn read_value<T: bytemuck::Pod>(&self, offset: usize) -> Result<T> {
        let bytes = self.read(offset, std::mem::size_of::<T>())?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    /// Copy the whole cache to the GPU buffer. The caller makes sure no
    /// in-flight frame is reading the buffer.
    pub fn flush_to_gpu(&mut self, allocator: &ResourceAllocator) -> Result<()> {
        let buffer = self
            .buffer
            .ok_or_else(|| BackendError::invalid_state("flush param block", "released"))?;
        allocator.write(buffer, 0, &self.cache)?;
        self.dirty = false;
        Ok(())
    }

    /// Give the GPU buffer back to the allocator. The cache stays readable.
    pub fn release(&mut self, allocator: &ResourceAllocator) -> Result<()> {
        match self.buffer.take() {
            Some(buffer) => allocator.destroy_buffer(buffer),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ParamBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParamBlock")
            .field("size", &self.cache.len())
            .field("dirty", &self.dirty)
            .field("buffer", &self.buffer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::gpu::{DeviceRequest, GpuInstance, GpuPlatform, InstanceDesc, OpenedDevice};
    use crate::backend::headless::HeadlessPlatform;

    struct Fixture {
        platform: HeadlessPlatform,
        allocator: ResourceAllocator,
        _opened: OpenedDevice,
        _instance: Box<dyn GpuInstance>,
    }

    fn fixture() -> Fixture {
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
        let allocator = ResourceAllocator::new(opened.device.as_ref(), ContractMode::Report).unwrap();
        Fixture {
            platform,
            allocator,
            _opened: opened,
            _instance: instance,
        }
    }

    fn block(fx: &Fixture, size: usize) -> ParamBlock {
        ParamBlock::new(&fx.allocator, size, vk::BufferUsageFlags::UNIFORM_BUFFER, ContractMode::Report).unwrap()
    }

    #[test]
    fn write_marks_dirty_and_reads_back() {
        let fx = fixture();
        let mut params = block(&fx, 16);
        assert!(!params.is_dirty());

        params.write(4, &[9, 8, 7]).unwrap();
        assert!(params.is_dirty());
        assert_eq!(params.read(4, 3).unwrap(), &[9, 8, 7]);
        assert_eq!(params.read(0, 4).unwrap(), &[0; 4]);
    }

    #[test]
    fn flush_copies_cache_and_clears_dirty() {
        let fx = fixture();
        let mut params = block(&fx, 8);
        params.write_value(0, &1.5f32).unwrap();
        params.write_value(4, &7u32).unwrap();

        params.flush_to_gpu(&fx.allocator).unwrap();
        assert!(!params.is_dirty());

        let raw = fx.allocator.raw_buffer(params.buffer().unwrap()).unwrap();
        assert_eq!(
            fx.platform.probe().buffer_contents(raw.buffer).unwrap(),
            params.data().to_vec()
        );
        assert_eq!(params.read_value::<f32>(0).unwrap(), 1.5);
        assert_eq!(params.read_value::<u32>(4).unwrap(), 7);
    }

    #[test]
    fn set_zero_is_idempotent() {
        let fx = fixture();
        let mut params = block(&fx, 8);
        params.write(0, &[1; 8]).unwrap();

        params.set_zero(2, 4).unwrap();
        let once = params.data().to_vec();
        params.set_zero(2, 4).unwrap();
        assert_eq!(params.data(), once.as_slice());
        assert_eq!(once, vec![1, 1, 0, 0, 0, 0, 1, 1]);

        params.clear();
        params.clear();
        assert_eq!(params.data(), &[0; 8]);
    }

    #[test]
    fn out_of_range_access_is_ignored() {
        let fx = fixture();
        let mut params = block(&fx, 4);
        params.flush_to_gpu(&fx.allocator).unwrap();

        assert!(matches!(
            params.write(2, &[1, 2, 3]),
            Err(BackendError::OutOfBounds { offset: 2, size: 3, capacity: 4 })
        ));
        assert!(params.read(usize::MAX, 2).is_err());
        assert!(params.set_zero(5, 0).is_err());
        assert!(params.read_value::<u64>(0).is_err());
        assert!(!params.is_dirty());
        assert_eq!(params.data(), &[0; 4]);
    }

    #[test]
    #[should_panic(expected = "contract violation")]
    fn out_of_range_panics_when_asserting() {
        let fx = fixture();
        let mut params =
            ParamBlock::new(&fx.allocator, 4, vk::BufferUsageFlags::UNIFORM_BUFFER, ContractMode::Assert).unwrap();
        let _ = params.write(0, &[0; 5]);
    }

    #[test]
    fn release_returns_the_buffer() {
        let fx = fixture();
        let mut params = block(&fx, 4);
        assert_eq!(fx.allocator.live_buffers(), 1);

        params.release(&fx.allocator).unwrap();
        params.release(&fx.allocator).unwrap();
        assert_eq!(fx.allocator.live_buffers(), 0);
        assert!(matches!(
            params.flush_to_gpu(&fx.allocator),
            Err(BackendError::InvalidState { .. })
        ));
        assert!(matches!(
            ParamBlock::new(&fx.allocator, 0, vk::BufferUsageFlags::UNIFORM_BUFFER, ContractMode::Report),
            Err(BackendError::InvalidParameter(_))
        ));
    }
}
