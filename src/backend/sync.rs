// Synchronization primitives
//
// Fences, semaphores for GPU-CPU and GPU-GPU sync. One set per frame in
// flight.

use ash::vk;
use std::sync::Arc;

use super::error::BackendResult;
use super::VulkanDevice;

/// Frame synchronization - one per frame in flight
pub struct FrameSlot {
    /// Signaled when the acquired image may be written
    pub image_available: vk::Semaphore,
    /// Signaled when rendering is done, gates presentation
    pub render_finished: vk::Semaphore,
    /// Signaled when all work submitted for this slot has finished
    pub in_flight_fence: vk::Fence,
    device: Arc<VulkanDevice>,
}

impl FrameSlot {
    pub fn new(device: Arc<VulkanDevice>) -> BackendResult<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Start signaled so the first wait returns at once
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        let mut slot = Self {
            image_available: vk::Semaphore::null(),
            render_finished: vk::Semaphore::null(),
            in_flight_fence: vk::Fence::null(),
            device,
        };

        // Filled in place so Drop cleans up whatever got created
        unsafe {
            slot.image_available = slot.device.device.create_semaphore(&semaphore_info, None)?;
            slot.render_finished = slot.device.device.create_semaphore(&semaphore_info, None)?;
            slot.in_flight_fence = slot.device.device.create_fence(&fence_info, None)?;
        }

        Ok(slot)
    }

    /// `count` slots, count clamped to at least one
    pub fn create_slots(device: &Arc<VulkanDevice>, count: usize) -> BackendResult<Vec<Self>> {
        (0..count.max(1))
            .map(|_| Self::new(Arc::clone(device)))
            .collect()
    }
}

impl Drop for FrameSlot {
    fn drop(&mut self) {
        // Destroying a null handle is a no-op
        unsafe {
            self.device.device.destroy_semaphore(self.image_available, None);
            self.device.device.destroy_semaphore(self.render_finished, None);
            self.device.device.destroy_fence(self.in_flight_fence, None);
        }
    }
}
