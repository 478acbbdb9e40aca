// Synchronization primitives
//
// Fences for GPU -> CPU signalling, semaphores for GPU -> GPU ordering.
// Acquire semaphores are indexed by frame-in-flight slot, submit semaphores
// by swapchain image (presentation targets an image, not a slot).

use anyhow::{Context, Result};
use ash::prelude::VkResult;
use ash::vk;

/// Native fence operations.
///
/// Implemented for `ash::Device`; tests provide their own implementation so the
/// frame protocol can be exercised without a GPU.
pub trait FenceWaiter {
    /// Block until `fence` is signaled or `timeout` nanoseconds elapse.
    /// A time-out is reported as `Err(vk::Result::TIMEOUT)`.
    fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> VkResult<()>;

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;
}

impl FenceWaiter for ash::Device {
    fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> VkResult<()> {
        unsafe { self.wait_for_fences(&[fence], true, timeout) }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.reset_fences(&[fence]) }
    }
}

/// A fence with a cached signal state.
///
/// Once a wait has observed the fence signaled, further waits return
/// immediately without touching the driver until the fence is reset.
#[derive(Debug)]
pub struct Fence {
    handle: vk::Fence,
    is_signaled: bool,
}

impl Fence {
    pub fn new(device: &ash::Device, signaled: bool) -> Result<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence_info = vk::FenceCreateInfo::builder().flags(flags);

        let handle = unsafe { device.create_fence(&fence_info, None) }
            .context("Failed to create fence")?;
        log::debug!("Created fence (signaled: {})", signaled);

        Ok(Self::from_handle(handle, signaled))
    }

    /// Wrap an existing fence handle whose current state is known to the caller.
    pub fn from_handle(handle: vk::Fence, signaled: bool) -> Self {
        Self {
            handle,
            is_signaled: signaled,
        }
    }

    pub fn handle(&self) -> vk::Fence {
        self.handle
    }

    pub fn is_signaled(&self) -> bool {
        self.is_signaled
    }

    /// Wait for the fence.
    ///
    /// Returns `Ok(true)` once signaled and `Ok(false)` on time-out. Device loss
    /// and out-of-memory conditions are returned as errors.
    pub fn wait<W: FenceWaiter + ?Sized>(&mut self, waiter: &W, timeout: u64) -> Result<bool> {
        if self.is_signaled {
            return Ok(true);
        }

        match waiter.wait_for_fence(self.handle, timeout) {
            Ok(()) => {
                self.is_signaled = true;
                Ok(true)
            }
            Err(vk::Result::TIMEOUT) => {
                log::warn!("Fence wait timed out after {}ns", timeout);
                Ok(false)
            }
            Err(e) => {
                log::error!("Fence wait failed: {:?}", e);
                Err(e).context("Failed to wait for fence")
            }
        }
    }

    /// Return the fence to the unsignaled state. Only a fence whose signal has
    /// been observed is reset; an unobserved fence is left alone.
    pub fn reset<W: FenceWaiter + ?Sized>(&mut self, waiter: &W) -> Result<()> {
        if self.is_signaled {
            waiter
                .reset_fence(self.handle)
                .context("Failed to reset fence")?;
            self.is_signaled = false;
        }
        Ok(())
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            device.destroy_fence(self.handle, None);
        }
        self.handle = vk::Fence::null();
        self.is_signaled = false;
    }
}

/// Semaphores for one swapchain generation.
pub struct FrameSync {
    /// Signaled by image acquisition, one per frame-in-flight slot
    pub image_acquired: Vec<vk::Semaphore>,
    /// Signaled by queue submission, one per swapchain image
    pub render_finished: Vec<vk::Semaphore>,
}

impl FrameSync {
    pub fn new(device: &ash::Device, frames_in_flight: usize, image_count: usize) -> Result<Self> {
        let mut sync = Self {
            image_acquired: Vec::with_capacity(frames_in_flight),
            render_finished: Vec::with_capacity(image_count),
        };

        // Push as we go so a failure part-way can still be cleaned up
        for _ in 0..frames_in_flight {
            match create_semaphore(device) {
                Ok(semaphore) => sync.image_acquired.push(semaphore),
                Err(e) => {
                    sync.destroy(device);
                    return Err(e);
                }
            }
        }
        for _ in 0..image_count {
            match create_semaphore(device) {
                Ok(semaphore) => sync.render_finished.push(semaphore),
                Err(e) => {
                    sync.destroy(device);
                    return Err(e);
                }
            }
        }

        log::debug!(
            "Created {} acquire and {} submit semaphores",
            frames_in_flight,
            image_count
        );
        Ok(sync)
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            for semaphore in self.image_acquired.drain(..) {
                device.destroy_semaphore(semaphore, None);
            }
            for semaphore in self.render_finished.drain(..) {
                device.destroy_semaphore(semaphore, None);
            }
        }
    }
}

fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let semaphore_info = vk::SemaphoreCreateInfo::builder();
    unsafe { device.create_semaphore(&semaphore_info, None) }.context("Failed to create semaphore")
}
