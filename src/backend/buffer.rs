// GPU buffers for vertex, index, and staging data
//
// Each Buffer owns one native buffer and its dedicated memory allocation.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::command_buffer::CommandBuffer;
use super::VulkanDevice;

pub struct Buffer {
    pub handle: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub memory_flags: vk::MemoryPropertyFlags,
    pub memory_index: u32,
    device: Arc<VulkanDevice>,
}

impl Buffer {
    /// Create a buffer and allocate its memory. When `bind_on_create` is false
    /// the caller binds later with [`Buffer::bind`].
    pub fn new(
        device: Arc<VulkanDevice>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_flags: vk::MemoryPropertyFlags,
        bind_on_create: bool,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = unsafe { device.device.create_buffer(&buffer_info, None) }
            .context("Failed to create buffer")?;

        let mut buffer = Self {
            handle,
            memory: vk::DeviceMemory::null(),
            size,
            usage,
            memory_flags,
            memory_index: 0,
            device,
        };

        let requirements = unsafe { buffer.device.device.get_buffer_memory_requirements(handle) };
        buffer.memory_index = buffer
            .device
            .find_memory_type(requirements.memory_type_bits, memory_flags)?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(buffer.memory_index);

        buffer.memory = unsafe { buffer.device.device.allocate_memory(&alloc_info, None) }
            .context("Failed to allocate buffer memory")?;

        if bind_on_create {
            buffer.bind(0)?;
        }

        log::debug!("Created {} byte buffer ({:?})", size, usage);
        Ok(buffer)
    }

    pub fn bind(&self, offset: vk::DeviceSize) -> Result<()> {
        unsafe {
            self.device
                .device
                .bind_buffer_memory(self.handle, self.memory, offset)
        }
        .context("Failed to bind buffer memory")
    }

    /// Map, copy `data` at byte `offset`, unmap. Host-visible memory only.
    pub fn load_data<T: Copy>(&self, offset: vk::DeviceSize, data: &[T]) -> Result<()> {
        if !self
            .memory_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
        {
            anyhow::bail!("Cannot map a buffer without host-visible memory");
        }

        let byte_len = std::mem::size_of_val(data) as vk::DeviceSize;
        check_range(offset, byte_len, self.size)?;

        unsafe {
            let ptr = self
                .device
                .device
                .map_memory(self.memory, offset, byte_len, vk::MemoryMapFlags::empty())
                .context("Failed to map buffer memory")? as *mut T;

            ptr.copy_from_nonoverlapping(data.as_ptr(), data.len());
            self.device.device.unmap_memory(self.memory);
        }
        Ok(())
    }

    /// Copy `size` bytes into `dest` on the graphics queue and wait for it.
    pub fn copy_to(
        &self,
        dest: &Buffer,
        source_offset: vk::DeviceSize,
        dest_offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<()> {
        check_range(source_offset, size, self.size)?;
        check_range(dest_offset, size, dest.size)?;

        let device = &self.device;
        let command_buffer = CommandBuffer::allocate_and_begin_single_use(device)?;

        let region = vk::BufferCopy {
            src_offset: source_offset,
            dst_offset: dest_offset,
            size,
        };
        unsafe {
            device
                .device
                .cmd_copy_buffer(command_buffer.handle(), self.handle, dest.handle, &[region]);
        }

        command_buffer.end_single_use(device, device.graphics_queue)
    }

    /// Copy `size` bytes from `source` into this buffer.
    pub fn copy_from(
        &self,
        source: &Buffer,
        source_offset: vk::DeviceSize,
        dest_offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<()> {
        source.copy_to(self, source_offset, dest_offset, size)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_buffer(self.handle, None);
            if self.memory != vk::DeviceMemory::null() {
                self.device.device.free_memory(self.memory, None);
            }
        }
    }
}

fn check_range(offset: vk::DeviceSize, len: vk::DeviceSize, size: vk::DeviceSize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => anyhow::bail!(
            "Range {}..{} exceeds buffer size {}",
            offset,
            offset.saturating_add(len),
            size
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_inside_buffer_are_accepted() {
        assert!(check_range(0, 64, 64).is_ok());
        assert!(check_range(16, 16, 64).is_ok());
        assert!(check_range(64, 0, 64).is_ok());
    }

    #[test]
    fn ranges_past_the_end_are_rejected() {
        assert!(check_range(60, 8, 64).is_err());
        assert!(check_range(u64::MAX, 2, 64).is_err());
    }
}
