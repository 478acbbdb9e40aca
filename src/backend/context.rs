// Vulkan context
//
// Owns every GPU object the frame loop drives: surface, device, swapchain,
// render pass, one command buffer and one submit semaphore per swapchain
// image, one acquire semaphore per frame-in-flight slot, and the optional
// object shader with its triangle.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::buffer::Buffer;
use super::command_buffer::CommandBuffer;
use super::frame::{Acquire, FrameTarget, Present};
use super::instance::{Surface, VulkanInstance};
use super::pipeline::Vertex3D;
use super::render_pass::RenderPass;
use super::shader::ObjectShader;
use super::swapchain::{choose_extent, choose_surface_format, Swapchain};
use super::sync::FrameSync;
use super::VulkanDevice;
use crate::config::Config;
use crate::window::SurfaceProvider;

/// Counter-clockwise in framebuffer space, so it survives back-face culling
const TRIANGLE: [Vertex3D; 3] = [
    Vertex3D::new(0.0, -0.5, 0.0),
    Vertex3D::new(-0.5, 0.5, 0.0),
    Vertex3D::new(0.5, 0.5, 0.0),
];

/// The built-in object: shader pipeline plus its vertex buffer
struct SceneObject {
    shader: ObjectShader,
    vertices: Buffer,
    vertex_count: u32,
}

pub struct VulkanContext {
    // Field order is teardown order
    object: Option<SceneObject>,
    command_buffers: Vec<CommandBuffer>,
    sync: FrameSync,
    swapchain: Option<Swapchain>,
    render_pass: RenderPass,
    pub device: Arc<VulkanDevice>,
    surface: Surface,
    window: Arc<dyn SurfaceProvider>,
    framebuffer_size: (u32, u32),
    frames_in_flight: usize,
}

impl VulkanContext {
    pub fn new(app_name: &str, window: Arc<dyn SurfaceProvider>, config: &Config) -> Result<Self> {
        let extensions = window.required_extensions()?;
        let instance = Arc::new(VulkanInstance::new(
            app_name,
            &extensions,
            config.validation_enabled(),
        )?);

        let surface_handle = window.create_surface(&instance.entry, &instance.instance)?;
        let surface = Surface::new(instance.clone(), surface_handle);

        let device = VulkanDevice::new(instance, surface.handle)?;

        let framebuffer_size = window.framebuffer_size();
        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D {
                width: framebuffer_size.0,
                height: framebuffer_size.1,
            },
        };

        // The render pass needs the color format before the swapchain exists
        let surface_format = choose_surface_format(
            &device.query_swapchain_support(surface.handle)?.formats,
        )
        .context("No suitable surface format")?;

        let mut render_pass = RenderPass::new(
            device.clone(),
            surface_format.format,
            render_area,
            config.clear_color(),
            config.graphics.clear_depth,
            config.graphics.clear_stencil,
        )?;

        let swapchain = Swapchain::new(
            device.clone(),
            surface.handle,
            &render_pass,
            framebuffer_size.0,
            framebuffer_size.1,
        )?;
        render_pass.set_extent(swapchain.extent);

        let frames_in_flight = config.frames_in_flight();
        let command_buffers = create_command_buffers(&device, swapchain.image_count())?;
        let sync = FrameSync::new(&device.device, frames_in_flight, swapchain.image_count())?;

        let object = config.shader_base().and_then(|base| {
            SceneObject::new(&device, &render_pass, base, config.graphics.wireframe)
                .map_err(|e| log::error!("Object shader unavailable, continuing without it: {:#}", e))
                .ok()
        });

        log::info!(
            "Vulkan context ready ({} images, {} frames in flight)",
            swapchain.image_count(),
            frames_in_flight
        );

        Ok(Self {
            object,
            command_buffers,
            sync,
            swapchain: Some(swapchain),
            render_pass,
            device,
            surface,
            window,
            framebuffer_size,
            frames_in_flight,
        })
    }

    pub fn image_count(&self) -> usize {
        self.swapchain.as_ref().map_or(0, Swapchain::image_count)
    }

    pub fn framebuffer_size(&self) -> (u32, u32) {
        self.framebuffer_size
    }

    pub fn set_framebuffer_size(&mut self, width: u32, height: u32) {
        self.framebuffer_size = (width, height);
    }

    fn swapchain(&self) -> Result<&Swapchain> {
        self.swapchain
            .as_ref()
            .context("Swapchain is missing after a failed recreation")
    }

    fn free_command_buffers(&mut self) {
        for mut command_buffer in self.command_buffers.drain(..) {
            if let Err(e) = command_buffer.free(&self.device) {
                log::error!("{:#}", e);
            }
        }
    }
}

impl FrameTarget for VulkanContext {
    type Waiter = ash::Device;

    fn fence_waiter(&self) -> &ash::Device {
        &self.device.device
    }

    fn acquire_next_image(&mut self, slot: usize) -> Result<Acquire> {
        let semaphore = self.sync.image_acquired[slot];
        self.swapchain()?.acquire_next_image(u64::MAX, semaphore)
    }

    fn begin_recording(&mut self, image: u32) -> Result<()> {
        let swapchain = self
            .swapchain
            .as_ref()
            .context("Swapchain is missing after a failed recreation")?;
        let framebuffer = swapchain
            .framebuffers
            .get(image as usize)
            .context("No framebuffer for acquired image")?
            .handle;
        let extent = swapchain.extent;

        let command_buffer = self
            .command_buffers
            .get_mut(image as usize)
            .context("No command buffer for acquired image")?;

        command_buffer.reset(&self.device)?;
        command_buffer.begin_recording(&self.device, false, false, false)?;

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        unsafe {
            let cb = command_buffer.handle();
            self.device.device.cmd_set_viewport(cb, 0, &[viewport]);
            self.device.device.cmd_set_scissor(cb, 0, &[scissor]);
            self.device.device.cmd_set_line_width(cb, 1.0);
        }

        self.render_pass.begin(command_buffer, framebuffer)
    }

    fn record_scene(&mut self, image: u32, _delta_time: f32) -> Result<()> {
        let Some(object) = &self.object else {
            return Ok(());
        };
        let command_buffer = self
            .command_buffers
            .get(image as usize)
            .context("No command buffer for acquired image")?;

        object.shader.bind(command_buffer);
        unsafe {
            let cb = command_buffer.handle();
            self.device
                .device
                .cmd_bind_vertex_buffers(cb, 0, &[object.vertices.handle], &[0]);
            self.device.device.cmd_draw(cb, object.vertex_count, 1, 0, 0);
        }
        Ok(())
    }

    fn end_recording(&mut self, image: u32) -> Result<()> {
        let command_buffer = self
            .command_buffers
            .get_mut(image as usize)
            .context("No command buffer for acquired image")?;

        self.render_pass.end(command_buffer)?;
        command_buffer.end_recording(&self.device)
    }

    fn submit(&mut self, slot: usize, image: u32, fence: vk::Fence) -> Result<()> {
        let command_buffer = self
            .command_buffers
            .get_mut(image as usize)
            .context("No command buffer for acquired image")?;

        let wait_semaphores = [self.sync.image_acquired[slot]];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [command_buffer.handle()];
        let signal_semaphores = [self.sync.render_finished[image as usize]];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device
                .device
                .queue_submit(self.device.graphics_queue, &[submit_info.build()], fence)
        }
        .context("Failed to submit draw command buffer")?;

        command_buffer.mark_submitted()?;
        Ok(())
    }

    fn present(&mut self, image: u32) -> Result<Present> {
        let semaphore = self.sync.render_finished[image as usize];
        self.swapchain()?
            .present(self.device.present_queue, image, semaphore)
    }

    fn recreate_swapchain(&mut self) -> Result<Option<usize>> {
        self.device.wait_idle()?;

        // Minimized: keep the old swapchain until the surface has area again
        let (width, height) = self.window.framebuffer_size();
        let capabilities = self
            .device
            .query_swapchain_support(self.surface.handle)?
            .capabilities;
        if choose_extent(&capabilities, width, height).is_none() {
            log::debug!("Surface is {}x{}, swapchain recreation deferred", width, height);
            return Ok(None);
        }
        self.framebuffer_size = (width, height);

        self.free_command_buffers();
        self.sync.destroy(&self.device.device);

        // Destroy before create, the surface only supports one swapchain
        self.swapchain = None;
        let swapchain = Swapchain::new(
            self.device.clone(),
            self.surface.handle,
            &self.render_pass,
            width,
            height,
        )?;
        self.render_pass.set_extent(swapchain.extent);
        let image_count = swapchain.image_count();
        self.swapchain = Some(swapchain);

        self.command_buffers = create_command_buffers(&self.device, image_count)?;
        self.sync = FrameSync::new(&self.device.device, self.frames_in_flight, image_count)?;

        log::info!("Swapchain recreated at {}x{}", width, height);
        Ok(Some(image_count))
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            log::error!("{:#}", e);
        }
        self.free_command_buffers();
        self.sync.destroy(&self.device.device);
        log::info!("Vulkan context destroyed");
    }
}

impl SceneObject {
    fn new(
        device: &Arc<VulkanDevice>,
        render_pass: &RenderPass,
        base: &str,
        wireframe: bool,
    ) -> Result<Self> {
        let shader = ObjectShader::new(device.clone(), render_pass, base, wireframe)?;
        let vertices = upload_vertices(device, &TRIANGLE)?;

        Ok(Self {
            shader,
            vertices,
            vertex_count: TRIANGLE.len() as u32,
        })
    }
}

/// Copy `vertices` into a device-local vertex buffer through a staging buffer.
fn upload_vertices(device: &Arc<VulkanDevice>, vertices: &[Vertex3D]) -> Result<Buffer> {
    let size = std::mem::size_of_val(vertices) as vk::DeviceSize;

    let staging = Buffer::new(
        device.clone(),
        size,
        vk::BufferUsageFlags::TRANSFER_SRC,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        true,
    )
    .context("Failed to create staging buffer")?;
    staging.load_data(0, vertices)?;

    let vertex_buffer = Buffer::new(
        device.clone(),
        size,
        vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
        true,
    )
    .context("Failed to create vertex buffer")?;

    vertex_buffer.copy_from(&staging, 0, 0, size)?;
    log::debug!("Uploaded {} vertices", vertices.len());
    Ok(vertex_buffer)
}

fn create_command_buffers(device: &VulkanDevice, count: usize) -> Result<Vec<CommandBuffer>> {
    let command_buffers = (0..count)
        .map(|_| CommandBuffer::allocate(device, device.command_pool, true))
        .collect::<Result<Vec<_>>>()?;
    log::debug!("Allocated {} graphics command buffers", count);
    Ok(command_buffers)
}
