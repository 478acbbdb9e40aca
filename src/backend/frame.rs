// Frame protocol
//
// FrameLoop owns the CPU side of frames-in-flight: one fence per slot, the
// images_in_flight table and the pending-resize flag. Everything that touches
// the swapchain or the queues goes through FrameTarget, so the protocol runs
// unchanged against VulkanContext or a scripted test double.
//
// Per slot: wait -> acquire -> record -> submit -> present -> advance.

use anyhow::{Context, Result};
use ash::vk;

use super::sync::{Fence, FenceWaiter};

/// Outcome of asking the swapchain for the next image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Ready(u32),
    /// Out of date or suboptimal, the swapchain must be rebuilt
    Stale,
}

/// Outcome of presenting an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Present {
    Done,
    /// Presented, but the swapchain no longer matches the surface
    Stale,
}

/// GPU-side operations driven by the frame loop.
pub trait FrameTarget {
    type Waiter: FenceWaiter + ?Sized;

    fn fence_waiter(&self) -> &Self::Waiter;

    /// Acquire the next image, signalling the acquire semaphore of `slot`.
    fn acquire_next_image(&mut self, slot: usize) -> Result<Acquire>;

    /// Reset and begin the image's command buffer and open the render pass.
    fn begin_recording(&mut self, image: u32) -> Result<()>;

    /// Record draw commands for the frame. The render pass is open.
    fn record_scene(&mut self, _image: u32, _delta_time: f32) -> Result<()> {
        Ok(())
    }

    /// Close the render pass and finish the image's command buffer.
    fn end_recording(&mut self, image: u32) -> Result<()>;

    /// Submit the image's command buffer, waiting on the slot's acquire
    /// semaphore and signalling the image's submit semaphore and `fence`.
    fn submit(&mut self, slot: usize, image: u32, fence: vk::Fence) -> Result<()>;

    fn present(&mut self, image: u32) -> Result<Present>;

    /// Rebuild the swapchain after a device-idle wait. Returns the new image
    /// count, or `None` while the surface has no drawable area.
    fn recreate_swapchain(&mut self) -> Result<Option<usize>>;
}

pub struct FrameLoop {
    fences: Vec<Fence>,
    /// Swapchain image -> slot whose fence guards it
    images_in_flight: Vec<Option<usize>>,
    current_frame: usize,
    image_index: Option<u32>,
    max_frames_in_flight: usize,
    resize_requested: bool,
}

impl FrameLoop {
    /// `fences` holds one fence per frame-in-flight slot, created signaled.
    pub fn new(fences: Vec<Fence>, image_count: usize) -> Result<Self> {
        if fences.is_empty() {
            anyhow::bail!("At least one frame in flight is required");
        }

        Ok(Self {
            max_frames_in_flight: fences.len(),
            fences,
            images_in_flight: vec![None; image_count],
            current_frame: 0,
            image_index: None,
            resize_requested: false,
        })
    }

    /// Create `count` signaled fences on `device`.
    pub fn create_fences(device: &ash::Device, count: usize) -> Result<Vec<Fence>> {
        let mut fences = Vec::with_capacity(count);
        for _ in 0..count {
            match Fence::new(device, true) {
                Ok(fence) => fences.push(fence),
                Err(e) => {
                    for mut fence in fences {
                        fence.destroy(device);
                    }
                    return Err(e);
                }
            }
        }
        Ok(fences)
    }

    pub fn current_slot(&self) -> usize {
        self.current_frame
    }

    pub fn max_frames_in_flight(&self) -> usize {
        self.max_frames_in_flight
    }

    pub fn image_owner(&self, image: usize) -> Option<usize> {
        self.images_in_flight.get(image).copied().flatten()
    }

    pub fn resize_requested(&self) -> bool {
        self.resize_requested
    }

    /// Record that the surface changed. Applied at the next frame boundary.
    pub fn request_resize(&mut self) {
        self.resize_requested = true;
    }

    /// Run one frame. Returns `Ok(false)` when the frame was skipped.
    pub fn draw_frame<T: FrameTarget>(&mut self, target: &mut T, delta_time: f32) -> Result<bool> {
        if !self.begin_frame(target)? {
            return Ok(false);
        }

        let image = self.image_index.context("No image acquired")?;
        target.record_scene(image, delta_time)?;
        self.end_frame(target)?;
        Ok(true)
    }

    /// Wait for the slot, acquire an image and start recording into it.
    /// Returns `Ok(false)` if the frame has to be skipped.
    pub fn begin_frame<T: FrameTarget>(&mut self, target: &mut T) -> Result<bool> {
        let slot = self.current_frame;

        if !self.fences[slot].wait(target.fence_waiter(), u64::MAX)? {
            log::warn!("In-flight fence for slot {} did not signal, skipping frame", slot);
            return Ok(false);
        }

        if self.resize_requested {
            self.recreate(target)?;
            return Ok(false);
        }

        let image = match target.acquire_next_image(slot)? {
            Acquire::Ready(image) => image,
            Acquire::Stale => {
                self.recreate(target)?;
                return Ok(false);
            }
        };

        // The image's command buffer may still be executing under another slot
        self.wait_for_image(target, image)?;

        target.begin_recording(image)?;
        self.image_index = Some(image);
        Ok(true)
    }

    /// Finish recording, submit, present and advance to the next slot.
    pub fn end_frame<T: FrameTarget>(&mut self, target: &mut T) -> Result<()> {
        let slot = self.current_frame;
        let image = self
            .image_index
            .take()
            .context("end_frame called without a successful begin_frame")?;

        target.end_recording(image)?;

        self.wait_for_image(target, image)?;
        self.images_in_flight[image as usize] = Some(slot);

        self.fences[slot].reset(target.fence_waiter())?;
        target.submit(slot, image, self.fences[slot].handle())?;

        if target.present(image)? == Present::Stale {
            log::debug!("Swapchain stale after present, recreating next frame");
            self.resize_requested = true;
        }

        self.current_frame = (slot + 1) % self.max_frames_in_flight;
        Ok(())
    }

    fn wait_for_image<T: FrameTarget>(&mut self, target: &T, image: u32) -> Result<()> {
        let owner = self
            .images_in_flight
            .get(image as usize)
            .copied()
            .with_context(|| format!("Image index {} out of range", image))?;

        if let Some(owner) = owner {
            if !self.fences[owner].wait(target.fence_waiter(), u64::MAX)? {
                anyhow::bail!("Timed out waiting for image {} (slot {})", image, owner);
            }
        }
        Ok(())
    }

    fn recreate<T: FrameTarget>(&mut self, target: &mut T) -> Result<()> {
        self.image_index = None;
        let Some(image_count) = target
            .recreate_swapchain()
            .context("Failed to recreate swapchain")?
        else {
            // Retried at the next frame boundary, before any acquire
            log::debug!("Surface has no drawable area, deferring swapchain recreation");
            self.resize_requested = true;
            return Ok(());
        };

        // Device is idle, no image is owned by an in-flight submission
        self.images_in_flight = vec![None; image_count];
        self.resize_requested = false;
        Ok(())
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        for fence in &mut self.fences {
            fence.destroy(device);
        }
        self.fences.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::prelude::VkResult;
    use ash::vk::Handle;
    use std::cell::RefCell;
    use std::collections::{HashMap, VecDeque};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum FenceState {
        Signaled,
        Unsignaled,
        Pending,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Event {
        Wait(u64),
        Reset(u64),
        Acquire { slot: usize },
        Begin { image: u32 },
        Submit { slot: usize, image: u32, extent: (u32, u32) },
        Present { image: u32 },
        Recreate,
    }

    /// Fence bookkeeping shared by the waiter and the target
    #[derive(Default)]
    struct MockGpu {
        fences: RefCell<HashMap<u64, FenceState>>,
        events: RefCell<Vec<Event>>,
        violations: RefCell<Vec<String>>,
    }

    impl MockGpu {
        fn log(&self, event: Event) {
            self.events.borrow_mut().push(event);
        }

        fn violation(&self, message: String) {
            self.violations.borrow_mut().push(message);
        }
    }

    impl FenceWaiter for MockGpu {
        fn wait_for_fence(&self, fence: vk::Fence, _timeout: u64) -> VkResult<()> {
            let raw = fence.as_raw();
            self.log(Event::Wait(raw));
            let state = self.fences.borrow().get(&raw).copied();
            match state {
                Some(FenceState::Pending) | Some(FenceState::Signaled) => {
                    self.fences.borrow_mut().insert(raw, FenceState::Signaled);
                    Ok(())
                }
                state => {
                    // A real wait would never return
                    self.violation(format!("wait on fence {} in state {:?}", raw, state));
                    Err(vk::Result::TIMEOUT)
                }
            }
        }

        fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
            let raw = fence.as_raw();
            self.log(Event::Reset(raw));
            let state = self.fences.borrow().get(&raw).copied();
            if state == Some(FenceState::Pending) {
                self.violation(format!("reset of pending fence {}", raw));
                return Ok(());
            }
            self.fences.borrow_mut().insert(raw, FenceState::Unsignaled);
            Ok(())
        }
    }

    /// Swapchain double: round-robin images unless a script says otherwise
    struct ScriptedSwapchain {
        gpu: MockGpu,
        image_count: usize,
        pending_image_count: usize,
        next_image: u32,
        extent: (u32, u32),
        pending_extent: (u32, u32),
        acquire_script: VecDeque<Acquire>,
        present_script: VecDeque<Present>,
        fail_submit: bool,
        recording: Option<u32>,
        recreations: usize,
    }

    impl ScriptedSwapchain {
        fn new(image_count: usize) -> Self {
            Self {
                gpu: MockGpu::default(),
                image_count,
                pending_image_count: image_count,
                next_image: 0,
                extent: (800, 600),
                pending_extent: (800, 600),
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                fail_submit: false,
                recording: None,
                recreations: 0,
            }
        }

        fn events(&self) -> Vec<Event> {
            self.gpu.events.borrow().clone()
        }

        fn submits(&self) -> Vec<(usize, u32, (u32, u32))> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    Event::Submit { slot, image, extent } => Some((slot, image, extent)),
                    _ => None,
                })
                .collect()
        }

        fn assert_no_violations(&self) {
            let violations = self.gpu.violations.borrow();
            assert!(violations.is_empty(), "{:?}", *violations);
        }
    }

    impl FrameTarget for ScriptedSwapchain {
        type Waiter = MockGpu;

        fn fence_waiter(&self) -> &MockGpu {
            &self.gpu
        }

        fn acquire_next_image(&mut self, slot: usize) -> Result<Acquire> {
            self.gpu.log(Event::Acquire { slot });
            if let Some(scripted) = self.acquire_script.pop_front() {
                return Ok(scripted);
            }
            let image = self.next_image;
            self.next_image = (self.next_image + 1) % self.image_count as u32;
            Ok(Acquire::Ready(image))
        }

        fn begin_recording(&mut self, image: u32) -> Result<()> {
            if self.recording.is_some() {
                anyhow::bail!("nested recording");
            }
            self.recording = Some(image);
            self.gpu.log(Event::Begin { image });
            Ok(())
        }

        fn end_recording(&mut self, image: u32) -> Result<()> {
            if self.recording.take() != Some(image) {
                anyhow::bail!("end_recording for an image that is not recording");
            }
            Ok(())
        }

        fn submit(&mut self, slot: usize, image: u32, fence: vk::Fence) -> Result<()> {
            if self.fail_submit {
                anyhow::bail!("device lost");
            }
            let raw = fence.as_raw();
            let state = self.gpu.fences.borrow().get(&raw).copied();
            // A fence may only be re-armed after its previous signal was observed and reset
            if state != Some(FenceState::Unsignaled) {
                self.gpu
                    .violation(format!("submit with fence {} in state {:?}", raw, state));
            }
            self.gpu.fences.borrow_mut().insert(raw, FenceState::Pending);
            self.gpu.log(Event::Submit {
                slot,
                image,
                extent: self.extent,
            });
            Ok(())
        }

        fn present(&mut self, image: u32) -> Result<Present> {
            self.gpu.log(Event::Present { image });
            Ok(self.present_script.pop_front().unwrap_or(Present::Done))
        }

        fn recreate_swapchain(&mut self) -> Result<Option<usize>> {
            // Device idle: every submission has completed
            for state in self.gpu.fences.borrow_mut().values_mut() {
                if *state == FenceState::Pending {
                    *state = FenceState::Signaled;
                }
            }
            if self.pending_extent.0 == 0 || self.pending_extent.1 == 0 {
                return Ok(None);
            }
            self.extent = self.pending_extent;
            self.image_count = self.pending_image_count;
            self.next_image = 0;
            self.recreations += 1;
            self.gpu.log(Event::Recreate);
            Ok(Some(self.image_count))
        }
    }

    fn frame_loop(target: &ScriptedSwapchain, frames_in_flight: usize) -> FrameLoop {
        let fences = (0..frames_in_flight)
            .map(|i| {
                let raw = i as u64 + 1;
                target.gpu.fences.borrow_mut().insert(raw, FenceState::Signaled);
                Fence::from_handle(vk::Fence::from_raw(raw), true)
            })
            .collect();
        FrameLoop::new(fences, target.image_count).unwrap()
    }

    #[test]
    fn slot_index_wraps_modulo_frames_in_flight() {
        for frames_in_flight in 1..=4 {
            for k in 0..6 {
                let mut target = ScriptedSwapchain::new(3);
                let mut frames = frame_loop(&target, frames_in_flight);

                for _ in 0..frames_in_flight + k {
                    assert!(frames.draw_frame(&mut target, 0.016).unwrap());
                }
                assert_eq!(frames.current_slot(), k % frames_in_flight);
                target.assert_no_violations();
            }
        }
    }

    #[test]
    fn five_frames_on_two_images_alternate_slots() {
        let mut target = ScriptedSwapchain::new(2);
        let mut frames = frame_loop(&target, 2);

        for _ in 0..5 {
            assert!(frames.draw_frame(&mut target, 0.016).unwrap());
        }

        let events = target.events();
        let begins = events
            .iter()
            .filter(|e| matches!(e, Event::Begin { .. }))
            .count();
        let presents = events
            .iter()
            .filter(|e| matches!(e, Event::Present { .. }))
            .count();
        assert_eq!(begins, 5);
        assert_eq!(presents, 5);

        let slots: Vec<usize> = target.submits().iter().map(|s| s.0).collect();
        assert_eq!(slots, vec![0, 1, 0, 1, 0]);
        target.assert_no_violations();
    }

    #[test]
    fn observed_fences_are_not_waited_on_again() {
        let mut target = ScriptedSwapchain::new(2);
        let mut frames = frame_loop(&target, 2);

        // Both fences start signaled and cached, so the first two frames issue no waits
        frames.draw_frame(&mut target, 0.0).unwrap();
        frames.draw_frame(&mut target, 0.0).unwrap();
        let waits = target
            .events()
            .iter()
            .filter(|e| matches!(e, Event::Wait(_)))
            .count();
        assert_eq!(waits, 0);

        // Third frame: slot 0 waits once; the image guard for image 0 hits the cache
        frames.draw_frame(&mut target, 0.0).unwrap();
        let waits: Vec<Event> = target
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::Wait(_)))
            .collect();
        assert_eq!(waits, vec![Event::Wait(1)]);
    }

    #[test]
    fn image_owner_is_waited_on_before_rerecording() {
        let mut target = ScriptedSwapchain::new(3);
        let mut frames = frame_loop(&target, 2);

        // Slot 0 renders image 0, then slot 1 is handed image 0 again
        target.acquire_script.extend([Acquire::Ready(0), Acquire::Ready(0)]);
        frames.draw_frame(&mut target, 0.0).unwrap();
        assert_eq!(frames.image_owner(0), Some(0));

        frames.draw_frame(&mut target, 0.0).unwrap();
        assert_eq!(frames.image_owner(0), Some(1));

        let events = target.events();
        let second_begin = events
            .iter()
            .rposition(|e| *e == Event::Begin { image: 0 })
            .unwrap();
        let guard_wait = events.iter().position(|e| *e == Event::Wait(1)).unwrap();
        assert!(guard_wait < second_begin, "{:?}", events);
        target.assert_no_violations();
    }

    #[test]
    fn out_of_date_acquire_recreates_once_and_skips_the_frame() {
        let mut target = ScriptedSwapchain::new(2);
        let mut frames = frame_loop(&target, 2);

        assert!(frames.draw_frame(&mut target, 0.016).unwrap());
        assert!(frames.draw_frame(&mut target, 0.016).unwrap());

        target.acquire_script.push_back(Acquire::Stale);
        target.pending_extent = (1024, 768);
        assert!(!frames.draw_frame(&mut target, 0.016).unwrap());
        assert_eq!(target.recreations, 1);
        assert_eq!(target.submits().len(), 2);

        assert!(frames.draw_frame(&mut target, 0.016).unwrap());
        assert_eq!(target.recreations, 1);

        let submits = target.submits();
        assert_eq!(submits.len(), 3);
        assert_eq!(submits[2].2, (1024, 768));
        target.assert_no_violations();
    }

    #[test]
    fn resize_request_is_applied_at_next_frame_boundary() {
        let mut target = ScriptedSwapchain::new(2);
        let mut frames = frame_loop(&target, 2);

        frames.draw_frame(&mut target, 0.0).unwrap();
        frames.request_resize();
        frames.request_resize();
        assert_eq!(target.recreations, 0);

        assert!(!frames.draw_frame(&mut target, 0.0).unwrap());
        assert_eq!(target.recreations, 1);
        assert!(!frames.resize_requested());

        assert!(frames.draw_frame(&mut target, 0.0).unwrap());
        assert_eq!(target.recreations, 1);
        target.assert_no_violations();
    }

    #[test]
    fn stale_present_schedules_recreation() {
        let mut target = ScriptedSwapchain::new(2);
        let mut frames = frame_loop(&target, 2);

        target.present_script.push_back(Present::Stale);
        assert!(frames.draw_frame(&mut target, 0.0).unwrap());
        assert!(frames.resize_requested());
        assert_eq!(frames.current_slot(), 1);

        assert!(!frames.draw_frame(&mut target, 0.0).unwrap());
        assert_eq!(target.recreations, 1);
        target.assert_no_violations();
    }

    #[test]
    fn zero_sized_surface_defers_recreation_without_failing() {
        let mut target = ScriptedSwapchain::new(2);
        let mut frames = frame_loop(&target, 2);
        assert!(frames.draw_frame(&mut target, 0.0).unwrap());

        // Minimized between frames: acquire reports stale, the surface is 0x0
        target.acquire_script.push_back(Acquire::Stale);
        target.pending_extent = (0, 0);
        assert!(!frames.draw_frame(&mut target, 0.0).unwrap());
        assert!(frames.resize_requested());
        assert_eq!(target.recreations, 0);

        // Still minimized: the pending flag short-circuits before acquiring
        let acquires_before = target
            .events()
            .iter()
            .filter(|e| matches!(e, Event::Acquire { .. }))
            .count();
        assert!(!frames.draw_frame(&mut target, 0.0).unwrap());
        let acquires_after = target
            .events()
            .iter()
            .filter(|e| matches!(e, Event::Acquire { .. }))
            .count();
        assert_eq!(acquires_before, acquires_after);
        assert!(frames.resize_requested());

        // Restored: one recreation, then normal frames at the new size
        target.pending_extent = (640, 480);
        assert!(!frames.draw_frame(&mut target, 0.0).unwrap());
        assert_eq!(target.recreations, 1);
        assert!(!frames.resize_requested());
        assert!(frames.draw_frame(&mut target, 0.0).unwrap());
        assert_eq!(target.submits().last().map(|s| s.2), Some((640, 480)));
        target.assert_no_violations();
    }

    #[test]
    fn recreation_with_more_images_resizes_the_ownership_table() {
        let mut target = ScriptedSwapchain::new(2);
        let mut frames = frame_loop(&target, 2);
        frames.draw_frame(&mut target, 0.0).unwrap();
        frames.draw_frame(&mut target, 0.0).unwrap();
        assert_eq!(frames.image_owner(2), None);

        target.pending_image_count = 3;
        frames.request_resize();
        assert!(!frames.draw_frame(&mut target, 0.0).unwrap());
        assert_eq!(frames.image_owner(0), None);
        assert_eq!(frames.image_owner(1), None);

        for _ in 0..3 {
            assert!(frames.draw_frame(&mut target, 0.0).unwrap());
        }
        let images: Vec<u32> = target.submits().iter().skip(2).map(|s| s.1).collect();
        assert_eq!(images, vec![0, 1, 2]);
        assert_eq!(frames.image_owner(2), Some(0));
        target.assert_no_violations();
    }

    #[test]
    fn submit_failure_propagates_without_advancing_the_slot() {
        let mut target = ScriptedSwapchain::new(2);
        let mut frames = frame_loop(&target, 2);
        assert!(frames.draw_frame(&mut target, 0.0).unwrap());
        assert_eq!(frames.current_slot(), 1);

        target.fail_submit = true;
        let err = frames.draw_frame(&mut target, 0.0).unwrap_err();
        assert!(format!("{:#}", err).contains("device lost"));
        assert_eq!(frames.current_slot(), 1);
        let presents = target
            .events()
            .iter()
            .filter(|e| matches!(e, Event::Present { .. }))
            .count();
        assert_eq!(presents, 1);
    }

    #[test]
    fn end_frame_requires_begun_frame() {
        let mut target = ScriptedSwapchain::new(2);
        let mut frames = frame_loop(&target, 2);
        assert!(frames.end_frame(&mut target).is_err());
    }

    #[test]
    fn zero_frames_in_flight_is_rejected() {
        assert!(FrameLoop::new(Vec::new(), 2).is_err());
    }
}
