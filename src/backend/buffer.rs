// GPU buffers backed by raw device memory
//
// Vertex data goes through a host-visible staging buffer into device-local
// memory.

use ash::vk;
use std::sync::Arc;

use super::command::CommandPool;
use super::error::BackendResult;
use super::VulkanDevice;

/// Buffer with its own dedicated allocation
pub struct Buffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    device: Arc<VulkanDevice>,
}

impl Buffer {
    pub fn new(
        device: Arc<VulkanDevice>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_properties: vk::MemoryPropertyFlags,
    ) -> BackendResult<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }?;
        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let memory = match Self::allocate(&device, requirements, memory_properties) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        if let Err(e) = unsafe { device.device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                device.device.destroy_buffer(buffer, None);
                device.device.free_memory(memory, None);
            }
            return Err(e.into());
        }

        Ok(Self {
            buffer,
            memory,
            size,
            device,
        })
    }

    fn allocate(
        device: &VulkanDevice,
        requirements: vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
    ) -> BackendResult<vk::DeviceMemory> {
        let memory_type_index =
            device.find_memory_type(requirements.memory_type_bits, properties)?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        let memory = unsafe { device.device.allocate_memory(&alloc_info, None) }?;
        Ok(memory)
    }

    /// Copy `data` into host-visible memory
    pub fn write<T: Copy>(&self, data: &[T]) -> BackendResult<()> {
        let size = std::mem::size_of_val(data) as vk::DeviceSize;
        debug_assert!(size <= self.size);

        unsafe {
            let ptr = self
                .device
                .device
                .map_memory(self.memory, 0, size, vk::MemoryMapFlags::empty())?
                as *mut T;
            ptr.copy_from_nonoverlapping(data.as_ptr(), data.len());
            self.device.device.unmap_memory(self.memory);
        }
        Ok(())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_buffer(self.buffer, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

/// Upload vertices into a device-local vertex buffer
///
/// Builds a throwaway transient command pool for the copy and waits for the
/// graphics queue to drain. Set-up only; never call this per frame.
pub fn upload_vertex_buffer<T: Copy>(
    device: &Arc<VulkanDevice>,
    vertices: &[T],
) -> BackendResult<Buffer> {
    let size = std::mem::size_of_val(vertices) as vk::DeviceSize;

    let staging = Buffer::new(
        Arc::clone(device),
        size,
        vk::BufferUsageFlags::TRANSFER_SRC,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )?;
    staging.write(vertices)?;

    let vertex_buffer = Buffer::new(
        Arc::clone(device),
        size,
        vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::VERTEX_BUFFER,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )?;

    let transfer_pool = CommandPool::new(Arc::clone(device), vk::CommandPoolCreateFlags::TRANSIENT)?;
    transfer_pool.one_time_submit(|device, command_buffer| {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        unsafe {
            device.cmd_copy_buffer(command_buffer, staging.buffer, vertex_buffer.buffer, &[region])
        };
    })?;

    log::debug!(
        "Uploaded {} vertices ({} bytes) to device-local memory",
        vertices.len(),
        size
    );

    Ok(vertex_buffer)
}
