// Render pass
//
// One subpass with two attachments: the swapchain color image (cleared,
// stored, handed to presentation) and the shared depth image (cleared,
// discarded). Clear values and the render area live here so begin() only
// needs a command buffer and a framebuffer.

use anyhow::{Context, Result};
use ash::vk;
use glam::Vec4;
use std::sync::Arc;

use super::command_buffer::CommandBuffer;
use super::VulkanDevice;

pub struct RenderPass {
    pub handle: vk::RenderPass,
    pub color_format: vk::Format,
    pub render_area: vk::Rect2D,
    pub clear_color: Vec4,
    pub depth: f32,
    pub stencil: u32,
    device: Arc<VulkanDevice>,
}

impl RenderPass {
    pub fn new(
        device: Arc<VulkanDevice>,
        color_format: vk::Format,
        render_area: vk::Rect2D,
        clear_color: Vec4,
        depth: f32,
        stencil: u32,
    ) -> Result<Self> {
        let attachments = attachment_descriptions(color_format, device.depth_format);

        let color_attachment_ref = vk::AttachmentReference::builder()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .build();

        let depth_attachment_ref = vk::AttachmentReference::builder()
            .attachment(1)
            .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .build();

        let color_attachments = &[color_attachment_ref];
        let subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(color_attachments)
            .depth_stencil_attachment(&depth_attachment_ref)
            .build();

        let subpasses = &[subpass];
        let dependencies = &[subpass_dependency()];

        let render_pass_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(subpasses)
            .dependencies(dependencies);

        let handle = unsafe { device.device.create_render_pass(&render_pass_info, None) }
            .context("Failed to create render pass")?;
        log::info!("Created render pass ({:?} + {:?})", color_format, device.depth_format);

        Ok(Self {
            handle,
            color_format,
            render_area,
            clear_color,
            depth,
            stencil,
            device,
        })
    }

    pub fn set_extent(&mut self, extent: vk::Extent2D) {
        self.render_area.extent = extent;
    }

    pub fn clear_values(&self) -> [vk::ClearValue; 2] {
        [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear_color.to_array(),
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: self.depth,
                    stencil: self.stencil,
                },
            },
        ]
    }

    /// Begin the pass on `command_buffer`, which must be recording.
    pub fn begin(&self, command_buffer: &mut CommandBuffer, framebuffer: vk::Framebuffer) -> Result<()> {
        command_buffer.enter_render_pass()?;

        let clear_values = self.clear_values();
        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.handle)
            .framebuffer(framebuffer)
            .render_area(self.render_area)
            .clear_values(&clear_values);

        unsafe {
            self.device.device.cmd_begin_render_pass(
                command_buffer.handle(),
                &begin_info,
                vk::SubpassContents::INLINE,
            );
        }
        Ok(())
    }

    pub fn end(&self, command_buffer: &mut CommandBuffer) -> Result<()> {
        command_buffer.leave_render_pass()?;
        unsafe {
            self.device.device.cmd_end_render_pass(command_buffer.handle());
        }
        Ok(())
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_render_pass(self.handle, None);
        }
    }
}

/// Color then depth attachment descriptions
pub fn attachment_descriptions(
    color_format: vk::Format,
    depth_format: vk::Format,
) -> [vk::AttachmentDescription; 2] {
    let color = vk::AttachmentDescription::builder()
        .format(color_format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .build();

    let depth = vk::AttachmentDescription::builder()
        .format(depth_format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::DONT_CARE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .build();

    [color, depth]
}

/// External -> subpass 0, ordering color output against the previous frame
pub fn subpass_dependency() -> vk::SubpassDependency {
    vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        )
        .build()
}
