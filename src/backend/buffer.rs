// GPU buffers for vertex, index, uniform and storage data
//
// All buffers live in host-visible, coherent memory that stays mapped for
// the buffer's lifetime, so upload/download are plain copies.

use super::error::{BackendError, BackendResult};
use super::usage::BufferUsage;
use super::VulkanDevice;
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::ptr::NonNull;
use std::sync::Arc;

pub struct Buffer {
    device: Arc<VulkanDevice>,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: usize,
    usage: BufferUsage,
}

impl Buffer {
    pub fn new(device: &Arc<VulkanDevice>, size: usize, usage: BufferUsage) -> BackendResult<Self> {
        let mut buffer = Self::with_location(
            device,
            size,
            usage.to_vk(),
            MemoryLocation::CpuToGpu,
            "buffer",
        )?;
        buffer.usage = usage;
        Ok(buffer)
    }

    /// Staging buffer the GPU copies into and the host reads back.
    pub(crate) fn readback(device: &Arc<VulkanDevice>, size: usize) -> BackendResult<Self> {
        Self::with_location(
            device,
            size,
            vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::GpuToCpu,
            "readback staging",
        )
    }

    /// Staging buffer the host fills and the GPU copies from.
    pub(crate) fn staging(device: &Arc<VulkanDevice>, size: usize) -> BackendResult<Self> {
        let mut buffer = Self::with_location(
            device,
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            "upload staging",
        )?;
        buffer.usage = BufferUsage::TRANSFER_SRC;
        Ok(buffer)
    }

    fn with_location(
        device: &Arc<VulkanDevice>,
        size: usize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> BackendResult<Self> {
        if size == 0 {
            return Err(BackendError::invalid_usage("buffer size must be non-zero"));
        }

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size as vk::DeviceSize)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = device.allocator().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e.into());
            }
        };

        let bind = unsafe {
            device
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bind {
            unsafe { device.device.destroy_buffer(buffer, None) };
            let _ = device.allocator().free(allocation);
            return Err(e.into());
        }

        log::debug!("Created {} ({} bytes, {:?})", name, size, usage);

        Ok(Self {
            device: Arc::clone(device),
            buffer,
            allocation: Some(allocation),
            size,
            usage: BufferUsage::empty(),
        })
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    fn check_range(&self, offset: usize, len: usize) -> BackendResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(BackendError::invalid_usage(format!(
                "range {}..{} exceeds buffer size {}",
                offset,
                offset.saturating_add(len),
                self.size
            ))),
        }
    }

    fn mapped_ptr(&self) -> BackendResult<NonNull<u8>> {
        self.allocation
            .as_ref()
            .and_then(|a| a.mapped_ptr())
            .map(|p| p.cast::<u8>())
            .ok_or_else(|| BackendError::ExternalApi("buffer memory is not host visible".into()))
    }

    /// Copies `data` into the buffer at `offset`.
    pub fn upload(&self, data: &[u8], offset: usize) -> BackendResult<()> {
        self.check_range(offset, data.len())?;
        let ptr = self.mapped_ptr()?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Copies `out.len()` bytes starting at `offset` into `out`.
    pub fn download(&self, out: &mut [u8], offset: usize) -> BackendResult<()> {
        self.check_range(offset, out.len())?;
        let ptr = self.mapped_ptr()?;
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.as_ptr().add(offset), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    /// Exposes the whole mapped range for zero-copy writes.
    pub fn map(&mut self) -> BackendResult<&mut [u8]> {
        let size = self.size;
        self.allocation
            .as_mut()
            .and_then(|a| a.mapped_slice_mut())
            .map(|slice| &mut slice[..size])
            .ok_or_else(|| BackendError::ExternalApi("buffer memory is not host visible".into()))
    }

    /// Memory stays mapped for the buffer's lifetime; nothing to release.
    pub fn unmap(&mut self) {}
}

impl Drop for Buffer {
    fn drop(&mut self) {
        // The GPU may still read this buffer from an in-flight frame
        let _ = self.device.wait_idle();
        unsafe { self.device.device.destroy_buffer(self.buffer, None) };
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.device.allocator().free(allocation) {
                log::error!("Failed to free buffer memory: {}", e);
            }
        }
    }
}
