// Frame loop state machine
//
// Cycles through a fixed number of frame slots. Each iteration waits for
// the slot's previous work, acquires an image, makes sure no other slot is
// still rendering into that image, submits and presents.

use ash::vk;

use super::error::{BackendError, BackendResult};
use super::swapchain::Swapchain;
use super::sync::FrameSlot;
use super::VulkanDevice;

/// GPU-side operations the frame loop depends on
///
/// Slots are identified by index; each owns an acquire semaphore, a
/// render-finished semaphore and a fence.
pub trait FrameQueue {
    /// Block until the slot's fence is signaled
    fn wait_slot(&mut self, slot: usize) -> BackendResult<()>;

    /// Non-blocking fence query
    fn is_slot_idle(&mut self, slot: usize) -> BackendResult<bool>;

    /// Next presentable image; the slot's acquire semaphore signals once it
    /// can be written
    fn acquire_image(&mut self, slot: usize) -> BackendResult<u32>;

    /// Reset the slot's fence and submit the image's command buffer
    fn submit(&mut self, slot: usize, image_index: u32) -> BackendResult<()>;

    /// Queue the image for presentation, returns the suboptimal flag
    fn present(&mut self, slot: usize, image_index: u32) -> BackendResult<bool>;
}

/// What happened during one `draw_frame`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReport {
    pub slot: usize,
    pub image_index: u32,
    /// Had to wait for another slot still using the image
    pub waited_on_image: bool,
    pub presented: bool,
}

pub struct FrameSynchronizer {
    frames_in_flight: usize,
    frame_counter: u64,
    /// Owning slot per swapchain image
    images_in_flight: Box<[Option<usize>]>,
}

impl FrameSynchronizer {
    pub fn new(frames_in_flight: usize, image_count: usize) -> Self {
        Self {
            frames_in_flight: frames_in_flight.max(1),
            frame_counter: 0,
            images_in_flight: vec![None; image_count].into_boxed_slice(),
        }
    }

    #[cfg(test)]
    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    pub fn current_slot(&self) -> usize {
        (self.frame_counter % self.frames_in_flight as u64) as usize
    }

    #[cfg(test)]
    pub fn images_in_flight(&self) -> &[Option<usize>] {
        &self.images_in_flight
    }

    /// Run one acquire, submit, present iteration
    ///
    /// Submission errors are returned without presenting and without
    /// advancing; the caller is expected to stop the loop. A present that
    /// fails because the surface went stale is logged and the frame still
    /// counts. Device loss or exhaustion during present is returned.
    pub fn draw_frame<Q: FrameQueue>(&mut self, queue: &mut Q) -> BackendResult<FrameReport> {
        let slot = self.current_slot();

        queue.wait_slot(slot)?;

        let image_index = queue.acquire_image(slot)?;
        let count = self.images_in_flight.len();
        let owner = self
            .images_in_flight
            .get_mut(image_index as usize)
            .ok_or(BackendError::ImageIndexOutOfRange {
                index: image_index,
                count,
            })?;

        let mut waited_on_image = false;
        if let Some(previous) = *owner {
            if previous != slot && !queue.is_slot_idle(previous)? {
                log::trace!(
                    "Image {} still owned by slot {}, waiting",
                    image_index,
                    previous
                );
                queue.wait_slot(previous)?;
                waited_on_image = true;
            }
        }
        *owner = Some(slot);

        queue.submit(slot, image_index)?;

        let presented = match queue.present(slot, image_index) {
            Ok(suboptimal) => {
                if suboptimal {
                    log::debug!("Swapchain is suboptimal for the surface");
                }
                true
            }
            Err(e) if is_surface_failure(&e) => {
                log::warn!("Frame {}: {}", self.frame_counter, e);
                false
            }
            Err(e) => return Err(e),
        };

        self.frame_counter += 1;

        Ok(FrameReport {
            slot,
            image_index,
            waited_on_image,
            presented,
        })
    }
}

/// Present errors that only concern the surface or the chain
fn is_surface_failure(error: &BackendError) -> bool {
    matches!(
        error,
        BackendError::Present(vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::ERROR_SURFACE_LOST_KHR)
    )
}

/// Live implementation over a device, swapchain, frame slots and the
/// per-image command buffers
pub struct VulkanFrameQueue<'a> {
    pub device: &'a VulkanDevice,
    pub swapchain: &'a Swapchain,
    pub slots: &'a [FrameSlot],
    pub command_buffers: &'a [vk::CommandBuffer],
}

impl VulkanFrameQueue<'_> {
    fn slot(&self, index: usize) -> &FrameSlot {
        &self.slots[index % self.slots.len()]
    }
}

impl FrameQueue for VulkanFrameQueue<'_> {
    fn wait_slot(&mut self, slot: usize) -> BackendResult<()> {
        let fences = [self.slot(slot).in_flight_fence];
        unsafe { self.device.device.wait_for_fences(&fences, true, u64::MAX) }?;
        Ok(())
    }

    fn is_slot_idle(&mut self, slot: usize) -> BackendResult<bool> {
        let signaled = unsafe {
            self.device
                .device
                .get_fence_status(self.slot(slot).in_flight_fence)
        }?;
        Ok(signaled)
    }

    fn acquire_image(&mut self, slot: usize) -> BackendResult<u32> {
        let (image_index, suboptimal) = self
            .swapchain
            .acquire_next_image(u64::MAX, self.slot(slot).image_available)?;
        if suboptimal {
            log::debug!("Acquired image {} from a suboptimal swapchain", image_index);
        }
        Ok(image_index)
    }

    fn submit(&mut self, slot: usize, image_index: u32) -> BackendResult<()> {
        let frame = self.slot(slot);
        let command_buffer = *self.command_buffers.get(image_index as usize).ok_or(
            BackendError::ImageIndexOutOfRange {
                index: image_index,
                count: self.command_buffers.len(),
            },
        )?;

        let wait_semaphores = [frame.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [command_buffer];
        let signal_semaphores = [frame.render_finished];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        unsafe {
            self.device.device.reset_fences(&[frame.in_flight_fence])?;
            self.device
                .device
                .queue_submit(
                    self.device.graphics_queue,
                    &[submit_info],
                    frame.in_flight_fence,
                )
                .map_err(BackendError::Submit)?;
        }
        Ok(())
    }

    fn present(&mut self, slot: usize, image_index: u32) -> BackendResult<bool> {
        let wait_semaphores = [self.slot(slot).render_finished];
        self.swapchain
            .present(self.device.present_queue, image_index, &wait_semaphores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Event {
        /// Fence wait on `slot`; `blocked_on` is the submission it had to
        /// wait for, `None` when the fence was already signaled
        Wait { slot: usize, blocked_on: Option<u64> },
        Acquire { slot: usize, image: u32 },
        Submit { slot: usize, image: u32, id: u64 },
        Present { slot: usize, image: u32 },
    }

    /// Single in-order GPU queue. Submissions only complete when the CPU
    /// waits for them (or for a later one), the worst case for overlap.
    struct SimulatedGpu {
        images: VecDeque<u32>,
        image_count: u32,
        next_image: u32,
        pending: Vec<Option<u64>>,
        queue: VecDeque<(u64, usize, u32)>,
        next_submission: u64,
        max_in_flight: usize,
        fail_submit_at: Option<u64>,
        fail_present_at: Option<(u64, vk::Result)>,
        events: Vec<Event>,
    }

    impl SimulatedGpu {
        fn new(slots: usize, image_count: u32) -> Self {
            Self {
                images: VecDeque::new(),
                image_count,
                next_image: 0,
                pending: vec![None; slots],
                queue: VecDeque::new(),
                next_submission: 0,
                max_in_flight: 0,
                fail_submit_at: None,
                fail_present_at: None,
                events: Vec::new(),
            }
        }

        /// Hand out these indices first, then fall back to rotation
        fn with_acquire_order(mut self, order: &[u32]) -> Self {
            self.images = order.iter().copied().collect();
            self
        }

        fn complete_through(&mut self, id: u64) {
            while let Some(&(front, slot, _)) = self.queue.front() {
                if front > id {
                    break;
                }
                self.queue.pop_front();
                self.pending[slot] = None;
            }
        }

        fn finish_all(&mut self) {
            if let Some(&(last, _, _)) = self.queue.back() {
                self.complete_through(last);
            }
        }

        fn in_flight(&self) -> usize {
            self.pending.iter().filter(|p| p.is_some()).count()
        }

        fn waits(&self) -> Vec<(usize, Option<u64>)> {
            self.events
                .iter()
                .filter_map(|e| match *e {
                    Event::Wait { slot, blocked_on } => Some((slot, blocked_on)),
                    _ => None,
                })
                .collect()
        }

        fn presents(&self) -> usize {
            self.events
                .iter()
                .filter(|e| matches!(e, Event::Present { .. }))
                .count()
        }
    }

    impl FrameQueue for SimulatedGpu {
        fn wait_slot(&mut self, slot: usize) -> BackendResult<()> {
            let blocked_on = self.pending[slot];
            if let Some(id) = blocked_on {
                self.complete_through(id);
            }
            self.events.push(Event::Wait { slot, blocked_on });
            Ok(())
        }

        fn is_slot_idle(&mut self, slot: usize) -> BackendResult<bool> {
            Ok(self.pending[slot].is_none())
        }

        fn acquire_image(&mut self, slot: usize) -> BackendResult<u32> {
            let image = self.images.pop_front().unwrap_or_else(|| {
                let image = self.next_image;
                self.next_image = (self.next_image + 1) % self.image_count;
                image
            });
            self.events.push(Event::Acquire { slot, image });
            Ok(image)
        }

        fn submit(&mut self, slot: usize, image_index: u32) -> BackendResult<()> {
            let id = self.next_submission;
            self.next_submission += 1;

            if self.fail_submit_at == Some(id) {
                return Err(BackendError::Submit(vk::Result::ERROR_DEVICE_LOST));
            }

            assert!(
                self.pending[slot].is_none(),
                "slot {} reset while its fence was unsignaled",
                slot
            );
            assert!(
                !self.queue.iter().any(|&(_, _, image)| image == image_index),
                "image {} written by two submissions at once",
                image_index
            );

            self.pending[slot] = Some(id);
            self.queue.push_back((id, slot, image_index));
            self.max_in_flight = self.max_in_flight.max(self.in_flight());
            self.events.push(Event::Submit {
                slot,
                image: image_index,
                id,
            });
            Ok(())
        }

        fn present(&mut self, slot: usize, image_index: u32) -> BackendResult<bool> {
            let id = self.next_submission - 1;
            if let Some((at, result)) = self.fail_present_at {
                if at == id {
                    return Err(BackendError::Present(result));
                }
            }
            self.events.push(Event::Present {
                slot,
                image: image_index,
            });
            Ok(false)
        }
    }

    #[test]
    fn two_slots_three_images_alternate() {
        let mut sync = FrameSynchronizer::new(2, 3);
        let mut gpu = SimulatedGpu::new(2, 3);

        let reports: Vec<FrameReport> = (0..4)
            .map(|_| sync.draw_frame(&mut gpu).unwrap())
            .collect();
        let slots: Vec<usize> = reports.iter().map(|r| r.slot).collect();
        assert_eq!(slots, vec![0, 1, 0, 1]);
        assert_eq!(sync.frame_counter(), 4);

        // Pre-signaled fences for the first two, then submission i gates
        // i + 2. Frame 3 re-acquires image 0 whose owner (slot 0) is busy
        // with submission 2, so it waits on that too.
        assert_eq!(
            gpu.waits(),
            vec![(0, None), (1, None), (0, Some(0)), (1, Some(1)), (0, Some(2))]
        );
        assert!(reports[3].waited_on_image);
        assert!(!reports[2].waited_on_image);
        assert_eq!(gpu.presents(), 4);
    }

    #[test]
    fn never_more_than_k_submissions_in_flight() {
        for k in 1..=4 {
            let mut sync = FrameSynchronizer::new(k, 3);
            let mut gpu = SimulatedGpu::new(k, 3);
            for _ in 0..50 {
                sync.draw_frame(&mut gpu).unwrap();
                assert!(gpu.in_flight() <= k);
            }
            assert_eq!(gpu.max_in_flight, k.min(3));
        }
    }

    #[test]
    fn image_ownership_bounded_by_image_count() {
        let mut sync = FrameSynchronizer::new(2, 3);
        let mut gpu = SimulatedGpu::new(2, 3);
        for _ in 0..100 {
            sync.draw_frame(&mut gpu).unwrap();
        }

        let owners = sync.images_in_flight();
        assert_eq!(owners.len(), 3);
        assert!(owners.iter().all(|o| matches!(o, Some(slot) if *slot < 2)));
    }

    #[test]
    fn more_slots_than_images_waits_on_image_owner() {
        let mut sync = FrameSynchronizer::new(3, 2);
        let mut gpu = SimulatedGpu::new(3, 2);

        let first = sync.draw_frame(&mut gpu).unwrap();
        let second = sync.draw_frame(&mut gpu).unwrap();
        assert!(!first.waited_on_image && !second.waited_on_image);

        // Slot 2 gets image 0 while slot 0 is still rendering to it
        let third = sync.draw_frame(&mut gpu).unwrap();
        assert_eq!((third.slot, third.image_index), (2, 0));
        assert!(third.waited_on_image);
        assert_eq!(gpu.waits()[3], (0, Some(0)));
    }

    #[test]
    fn out_of_rotation_image_waits_on_other_slot() {
        let mut sync = FrameSynchronizer::new(2, 3);
        let mut gpu = SimulatedGpu::new(2, 3).with_acquire_order(&[1, 1]);

        sync.draw_frame(&mut gpu).unwrap();
        let report = sync.draw_frame(&mut gpu).unwrap();

        assert_eq!((report.slot, report.image_index), (1, 1));
        assert!(report.waited_on_image);
        assert_eq!(sync.images_in_flight()[1], Some(1));
    }

    #[test]
    fn finished_owner_is_not_waited_on() {
        let mut sync = FrameSynchronizer::new(2, 3);
        let mut gpu = SimulatedGpu::new(2, 3).with_acquire_order(&[1, 1]);

        sync.draw_frame(&mut gpu).unwrap();
        gpu.finish_all();
        let report = sync.draw_frame(&mut gpu).unwrap();

        assert!(!report.waited_on_image);
        assert_eq!(gpu.waits().len(), 2);
    }

    #[test]
    fn same_slot_reacquiring_its_image_skips_hazard_wait() {
        let mut sync = FrameSynchronizer::new(1, 3);
        let mut gpu = SimulatedGpu::new(1, 3).with_acquire_order(&[0, 0]);

        sync.draw_frame(&mut gpu).unwrap();
        let report = sync.draw_frame(&mut gpu).unwrap();

        assert_eq!(report.slot, 0);
        assert!(!report.waited_on_image);
    }

    #[test]
    fn present_failure_keeps_loop_running() {
        let mut sync = FrameSynchronizer::new(2, 3);
        let mut gpu = SimulatedGpu::new(2, 3);
        gpu.fail_present_at = Some((0, vk::Result::ERROR_OUT_OF_DATE_KHR));

        let report = sync.draw_frame(&mut gpu).unwrap();
        assert!(!report.presented);
        assert_eq!(sync.frame_counter(), 1);

        let next = sync.draw_frame(&mut gpu).unwrap();
        assert_eq!(next.slot, 1);
        assert!(next.presented);
    }

    #[test]
    fn surface_lost_on_present_is_skipped() {
        let mut sync = FrameSynchronizer::new(2, 3);
        let mut gpu = SimulatedGpu::new(2, 3);
        gpu.fail_present_at = Some((0, vk::Result::ERROR_SURFACE_LOST_KHR));

        assert!(!sync.draw_frame(&mut gpu).unwrap().presented);
        assert_eq!(sync.frame_counter(), 1);
    }

    #[test]
    fn device_errors_on_present_stop_the_loop() {
        for result in [
            vk::Result::ERROR_DEVICE_LOST,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY,
        ] {
            let mut sync = FrameSynchronizer::new(2, 3);
            let mut gpu = SimulatedGpu::new(2, 3);
            gpu.fail_present_at = Some((1, result));

            assert!(sync.draw_frame(&mut gpu).unwrap().presented);
            let err = sync.draw_frame(&mut gpu).unwrap_err();

            assert!(matches!(err, BackendError::Present(r) if r == result));
            assert_eq!(sync.frame_counter(), 1);
            assert_eq!(gpu.presents(), 1);
        }
    }

    #[test]
    fn submit_failure_is_fatal_and_skips_present() {
        let mut sync = FrameSynchronizer::new(2, 3);
        let mut gpu = SimulatedGpu::new(2, 3);
        gpu.fail_submit_at = Some(1);

        sync.draw_frame(&mut gpu).unwrap();
        let err = sync.draw_frame(&mut gpu).unwrap_err();

        assert!(matches!(err, BackendError::Submit(vk::Result::ERROR_DEVICE_LOST)));
        assert_eq!(gpu.presents(), 1);
        assert_eq!(sync.frame_counter(), 1);
        assert_eq!(gpu.events.last(), Some(&Event::Acquire { slot: 1, image: 1 }));
    }

    #[test]
    fn acquired_index_beyond_chain_is_rejected() {
        let mut sync = FrameSynchronizer::new(2, 3);
        let mut gpu = SimulatedGpu::new(2, 3).with_acquire_order(&[7]);

        let err = sync.draw_frame(&mut gpu).unwrap_err();
        assert!(matches!(
            err,
            BackendError::ImageIndexOutOfRange { index: 7, count: 3 }
        ));
    }

    #[test]
    fn zero_frames_in_flight_clamped_to_one() {
        let sync = FrameSynchronizer::new(0, 3);
        assert_eq!(sync.frames_in_flight(), 1);
        assert_eq!(sync.current_slot(), 0);
    }
}
