// Renderer front-end
//
// What the application sees: init with a window, one draw per frame with a
// RenderPacket, resize notifications, shutdown.

use anyhow::Result;
use std::sync::Arc;

use crate::backend::VulkanBackend;
use crate::config::Config;
use crate::window::SurfaceProvider;

/// Per-frame input from the game
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RenderPacket {
    /// Seconds since the previous frame
    pub delta_time: f32,
}

pub struct Renderer {
    backend: VulkanBackend,
}

impl Renderer {
    pub fn init(app_name: &str, window: Arc<dyn SurfaceProvider>, config: &Config) -> Result<Self> {
        let backend = VulkanBackend::init(app_name, window, config)?;
        Ok(Self { backend })
    }

    /// Draw one frame. Skipped frames (minimized, swapchain rebuilt) are not
    /// errors; device loss and failed submissions are.
    pub fn draw_frame(&mut self, packet: &RenderPacket) -> Result<()> {
        if !self.backend.draw_frame(packet.delta_time)? {
            log::trace!("Frame skipped");
        }
        Ok(())
    }

    pub fn on_resized(&mut self, width: u32, height: u32) {
        self.backend.on_window_resize(width, height);
    }

    pub fn shutdown(self) {
        self.backend.shutdown();
    }
}
