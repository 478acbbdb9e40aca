// Graphics pipeline creation and management
//
// The graphics pipeline defines how vertices are processed and rasterized.
// It includes: vertex input, shaders, rasterization, depth/stencil, blending.
// Viewport, scissor and line width are dynamic so the pipeline survives
// swapchain recreation.

use anyhow::{Context, Result};
use ash::vk;
use glam::Vec3;
use std::sync::Arc;

use super::command_buffer::CommandBuffer;
use super::render_pass::RenderPass;
use super::VulkanDevice;

/// Position-only vertex
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vertex3D {
    pub position: Vec3,
}

impl Vertex3D {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self {
            position: Vec3::new(x, y, z),
        }
    }

    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::builder()
            .binding(0)
            .stride(std::mem::size_of::<Self>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build()
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 1] {
        // Position attribute (location 0)
        [vk::VertexInputAttributeDescription::builder()
            .binding(0)
            .location(0)
            .format(vk::Format::R32G32B32_SFLOAT)
            .offset(0)
            .build()]
    }
}

pub const DYNAMIC_STATES: [vk::DynamicState; 3] = [
    vk::DynamicState::VIEWPORT,
    vk::DynamicState::SCISSOR,
    vk::DynamicState::LINE_WIDTH,
];

pub struct Pipeline {
    pub handle: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    device: Arc<VulkanDevice>,
}

impl Pipeline {
    pub fn new(
        device: Arc<VulkanDevice>,
        render_pass: &RenderPass,
        stages: &[vk::PipelineShaderStageCreateInfo],
        wireframe: bool,
    ) -> Result<Self> {
        // Vertex input
        let bindings = [Vertex3D::binding_description()];
        let attributes = Vertex3D::attribute_descriptions();
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        // Input assembly
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        // Viewport and scissor are set per frame, only the counts matter here
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        if wireframe && !device.fill_mode_non_solid {
            log::warn!("Wireframe requested but fillModeNonSolid is unsupported, drawing filled");
        }
        let polygon_mode = polygon_mode(wireframe, device.fill_mode_non_solid);
        let rasterizer = rasterization_state(polygon_mode);

        // Multisampling (disabled)
        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(true)
            .depth_write_enable(true)
            .depth_compare_op(vk::CompareOp::LESS) // Closer objects win
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        // Color blending (no blending, opaque)
        let color_blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build();

        let color_blend_attachments = &[color_blend_attachment];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(color_blend_attachments);

        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&DYNAMIC_STATES);

        let layout_info = vk::PipelineLayoutCreateInfo::builder();
        let layout = unsafe { device.device.create_pipeline_layout(&layout_info, None) }
            .context("Failed to create pipeline layout")?;

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(render_pass.handle)
            .subpass(0)
            .build();

        let pipelines = unsafe {
            device
                .device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };

        let handle = match pipelines {
            Ok(pipelines) => pipelines.first().copied(),
            Err((_, e)) => {
                unsafe { device.device.destroy_pipeline_layout(layout, None) };
                return Err(e).context("Failed to create graphics pipeline");
            }
        };
        let Some(handle) = handle else {
            unsafe { device.device.destroy_pipeline_layout(layout, None) };
            anyhow::bail!("Driver returned no graphics pipeline");
        };

        log::info!("Created graphics pipeline ({:?})", polygon_mode);
        Ok(Self {
            handle,
            layout,
            device,
        })
    }

    pub fn bind(&self, command_buffer: &CommandBuffer) {
        unsafe {
            self.device.device.cmd_bind_pipeline(
                command_buffer.handle(),
                vk::PipelineBindPoint::GRAPHICS,
                self.handle,
            );
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_pipeline(self.handle, None);
            self.device.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

/// LINE needs the device's fillModeNonSolid feature, FILL is always valid
fn polygon_mode(wireframe: bool, non_solid_enabled: bool) -> vk::PolygonMode {
    if wireframe && non_solid_enabled {
        vk::PolygonMode::LINE
    } else {
        vk::PolygonMode::FILL
    }
}

fn rasterization_state(polygon_mode: vk::PolygonMode) -> vk::PipelineRasterizationStateCreateInfo {
    vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(polygon_mode)
        .line_width(1.0)
        .cull_mode(vk::CullModeFlags::BACK)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(false)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_is_three_floats() {
        assert_eq!(std::mem::size_of::<Vertex3D>(), 12);
        assert_eq!(Vertex3D::binding_description().stride, 12);

        let [position] = Vertex3D::attribute_descriptions();
        assert_eq!(position.location, 0);
        assert_eq!(position.format, vk::Format::R32G32B32_SFLOAT);
    }

    #[test]
    fn wireframe_switches_polygon_mode_only() {
        let fill = rasterization_state(polygon_mode(false, true));
        let line = rasterization_state(polygon_mode(true, true));

        assert_eq!(fill.polygon_mode, vk::PolygonMode::FILL);
        assert_eq!(line.polygon_mode, vk::PolygonMode::LINE);
        for state in [fill, line] {
            assert_eq!(state.cull_mode, vk::CullModeFlags::BACK);
            assert_eq!(state.front_face, vk::FrontFace::COUNTER_CLOCKWISE);
        }
    }

    #[test]
    fn wireframe_falls_back_to_fill_without_device_support() {
        assert_eq!(polygon_mode(true, false), vk::PolygonMode::FILL);
        assert_eq!(polygon_mode(false, false), vk::PolygonMode::FILL);
        assert_eq!(polygon_mode(true, true), vk::PolygonMode::LINE);
    }

    #[test]
    fn viewport_scissor_and_line_width_are_dynamic() {
        assert!(DYNAMIC_STATES.contains(&vk::DynamicState::VIEWPORT));
        assert!(DYNAMIC_STATES.contains(&vk::DynamicState::SCISSOR));
        assert!(DYNAMIC_STATES.contains(&vk::DynamicState::LINE_WIDTH));
    }
}
