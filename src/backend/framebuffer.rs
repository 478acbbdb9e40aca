// Framebuffers
//
// A framebuffer references image views owned elsewhere (swapchain views and
// the shared depth image). Only the framebuffer handle is destroyed here.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;

pub struct Framebuffer {
    pub handle: vk::Framebuffer,
    device: Arc<VulkanDevice>,
}

impl Framebuffer {
    pub fn new(
        device: Arc<VulkanDevice>,
        render_pass: vk::RenderPass,
        width: u32,
        height: u32,
        attachments: &[vk::ImageView],
    ) -> Result<Self> {
        let create_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(width)
            .height(height)
            .layers(1);

        let handle = unsafe { device.device.create_framebuffer(&create_info, None) }
            .context("Failed to create framebuffer")?;

        Ok(Self {
            handle,
            device,
        })
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_framebuffer(self.handle, None);
        }
    }
}
