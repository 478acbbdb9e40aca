// Backend module - Vulkan abstraction layer
//
// Design: Thin wrappers around ash, each owning its native objects.
// VulkanBackend ties the GPU-side VulkanContext to the CPU-side FrameLoop.

pub mod buffer;
pub mod command_buffer;
pub mod context;
pub mod device;
pub mod frame;
pub mod framebuffer;
pub mod image;
pub mod instance;
pub mod pipeline;
pub mod render_pass;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use context::VulkanContext;
pub use device::VulkanDevice;
pub use frame::FrameLoop;
pub use swapchain::Swapchain;

use anyhow::Result;
use std::sync::Arc;

use crate::config::Config;
use crate::window::SurfaceProvider;

pub struct VulkanBackend {
    frames: FrameLoop,
    context: VulkanContext,
    frame_number: u64,
}

impl VulkanBackend {
    /// Bring up instance, device, swapchain and per-frame objects.
    pub fn init(app_name: &str, window: Arc<dyn SurfaceProvider>, config: &Config) -> Result<Self> {
        let context = VulkanContext::new(app_name, window, config)?;
        let fences = FrameLoop::create_fences(&context.device.device, config.frames_in_flight())?;
        let frames = FrameLoop::new(fences, context.image_count())?;

        log::info!("Vulkan backend initialized");
        Ok(Self {
            frames,
            context,
            frame_number: 0,
        })
    }

    /// Render one frame. Returns `Ok(false)` if the frame was skipped
    /// (minimized window or swapchain recreation).
    pub fn draw_frame(&mut self, delta_time: f32) -> Result<bool> {
        let (width, height) = self.context.framebuffer_size();
        if width == 0 || height == 0 {
            return Ok(false);
        }

        let drawn = self.frames.draw_frame(&mut self.context, delta_time)?;
        if drawn {
            self.frame_number += 1;
        }
        Ok(drawn)
    }

    /// Record the new size. The swapchain is rebuilt at the next frame boundary.
    pub fn on_window_resize(&mut self, width: u32, height: u32) {
        log::debug!("Window resized to {}x{}", width, height);
        self.context.set_framebuffer_size(width, height);
        self.frames.request_resize();
    }

    pub fn shutdown(self) {
        log::info!("Shutting down Vulkan backend after {} frames", self.frame_number);
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        // Fences belong to the device, release them before the context goes
        if let Err(e) = self.context.device.wait_idle() {
            log::error!("{:#}", e);
        }
        self.frames.destroy(&self.context.device.device);
    }
}
