// Command pools and pre-recorded draw commands
//
// The scene never changes, so every swapchain image gets its command
// buffer recorded once at start-up and resubmitted each frame.

use ash::vk;
use std::sync::Arc;

use super::error::{BackendError, BackendResult};
use super::framebuffer::{FrameTargets, RenderPass};
use super::pipeline::Pipeline;
use super::VulkanDevice;

pub const OPAQUE_BLACK: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

/// Command pool on the graphics queue family
pub struct CommandPool {
    pub pool: vk::CommandPool,
    device: Arc<VulkanDevice>,
}

impl CommandPool {
    pub fn new(device: Arc<VulkanDevice>, flags: vk::CommandPoolCreateFlags) -> BackendResult<Self> {
        let family = device
            .queue_families
            .graphics
            .ok_or(BackendError::NoCapableDevice)?;

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(family)
            .flags(flags);

        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }?;

        Ok(Self { pool, device })
    }

    pub fn allocate(&self, count: u32) -> BackendResult<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        let buffers = unsafe { self.device.device.allocate_command_buffers(&alloc_info) }?;
        Ok(buffers)
    }

    /// Record, submit and wait for a single command buffer on the graphics
    /// queue. Stalls the queue; only for set-up transfers.
    pub fn one_time_submit<F>(&self, record: F) -> BackendResult<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let device = &self.device.device;
        let command_buffer = self.allocate(1)?[0];

        let result = (|| -> BackendResult<()> {
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

            unsafe {
                device.begin_command_buffer(command_buffer, &begin_info)?;
                record(device, command_buffer);
                device.end_command_buffer(command_buffer)?;

                let command_buffers = [command_buffer];
                let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
                device
                    .queue_submit(self.device.graphics_queue, &[submit_info.build()], vk::Fence::null())
                    .map_err(BackendError::Submit)?;
                device.queue_wait_idle(self.device.graphics_queue)?;
            }
            Ok(())
        })();

        unsafe { device.free_command_buffers(self.pool, &[command_buffer]) };
        result
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        log::debug!("Destroying command pool");
        unsafe { self.device.device.destroy_command_pool(self.pool, None) };
    }
}

/// A pipeline that reads vertex attributes needs a real buffer bound
pub fn check_vertex_binding(
    vertex_attribute_count: usize,
    vertex_buffer: Option<vk::Buffer>,
) -> BackendResult<Option<vk::Buffer>> {
    match vertex_buffer {
        Some(buffer) if buffer != vk::Buffer::null() => Ok(Some(buffer)),
        _ if vertex_attribute_count > 0 => Err(BackendError::NullBufferBind),
        _ => Ok(None),
    }
}

/// Record one draw command buffer per frame target
///
/// Each buffer clears to `clear_color` (normally [`OPAQUE_BLACK`]), binds
/// the pipeline and the optional vertex buffer at binding 0, and draws a
/// single triangle.
pub fn record_draw_commands(
    pool: &CommandPool,
    render_pass: &RenderPass,
    pipeline: &Pipeline,
    targets: &FrameTargets,
    vertex_buffer: Option<vk::Buffer>,
    clear_color: [f32; 4],
) -> BackendResult<Vec<vk::CommandBuffer>> {
    let vertex_buffer = check_vertex_binding(pipeline.vertex_attribute_count(), vertex_buffer)?;

    let device = &pool.device.device;
    let command_buffers = pool.allocate(targets.framebuffers.len() as u32)?;

    for (&command_buffer, &framebuffer) in command_buffers.iter().zip(&targets.framebuffers) {
        let begin_info = vk::CommandBufferBeginInfo::builder();

        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: clear_color,
            },
        }];

        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(render_pass.render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: targets.extent,
            })
            .clear_values(&clear_values);

        unsafe {
            device.begin_command_buffer(command_buffer, &begin_info)?;
            device.cmd_begin_render_pass(
                command_buffer,
                &render_pass_info,
                vk::SubpassContents::INLINE,
            );
            device.cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.pipeline,
            );
            if let Some(buffer) = vertex_buffer {
                device.cmd_bind_vertex_buffers(command_buffer, 0, &[buffer], &[0]);
            }
            device.cmd_draw(command_buffer, 3, 1, 0, 0);
            device.cmd_end_render_pass(command_buffer);
            device.end_command_buffer(command_buffer)?;
        }
    }

    log::info!("Recorded {} draw command buffers", command_buffers.len());
    Ok(command_buffers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn attributes_without_buffer_fail() {
        assert!(matches!(
            check_vertex_binding(2, None),
            Err(BackendError::NullBufferBind)
        ));
        assert!(matches!(
            check_vertex_binding(2, Some(vk::Buffer::null())),
            Err(BackendError::NullBufferBind)
        ));
    }

    #[test]
    fn buffer_is_passed_through() {
        let buffer = vk::Buffer::from_raw(0x42);
        assert_eq!(check_vertex_binding(2, Some(buffer)).unwrap(), Some(buffer));
    }

    #[test]
    fn attribute_free_pipeline_needs_no_buffer() {
        assert_eq!(check_vertex_binding(0, None).unwrap(), None);
        assert_eq!(check_vertex_binding(0, Some(vk::Buffer::null())).unwrap(), None);
    }
}
