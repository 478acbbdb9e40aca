// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen,
// plus the per-image views and framebuffers and the shared depth image.
// Never patched in place: a stale swapchain is dropped and rebuilt.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::frame::{Acquire, Present};
use super::framebuffer::Framebuffer;
use super::image::{single_level_range, Image};
use super::render_pass::RenderPass;
use super::VulkanDevice;

pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub framebuffers: Vec<Framebuffer>,
    pub surface_format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    depth: Option<Image>,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    pub fn new(
        device: Arc<VulkanDevice>,
        surface: vk::SurfaceKHR,
        render_pass: &RenderPass,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        log::info!("Creating swapchain: {}x{}", width, height);

        let support = device.query_swapchain_support(surface)?;
        let capabilities = support.capabilities;

        // Framebuffers must match the format the render pass was built for
        let surface_format = surface_format_for(&support.formats, render_pass.color_format)
            .with_context(|| {
                format!("Surface no longer offers {:?}", render_pass.color_format)
            })?;
        let present_mode = choose_present_mode(&support.present_modes);
        let extent = choose_extent(&capabilities, width, height)
            .context("Surface has no drawable area")?;
        let image_count = choose_image_count(&capabilities);

        log::info!("Present mode: {:?}", present_mode);

        let queue_families = [device.graphics_queue_family, device.present_queue_family];
        let mut create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        create_info = if device.graphics_queue_family != device.present_queue_family {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&queue_families)
        } else {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let handle = unsafe { device.swapchain_loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        let mut swapchain = Self {
            handle,
            images: Vec::new(),
            image_views: Vec::new(),
            framebuffers: Vec::new(),
            surface_format,
            extent,
            depth: None,
            device,
        };

        swapchain.images = unsafe { swapchain.device.swapchain_loader.get_swapchain_images(handle) }
            .context("Failed to get swapchain images")?;
        log::info!("Created swapchain with {} images", swapchain.images.len());

        for &image in &swapchain.images {
            let view_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(surface_format.format)
                .subresource_range(single_level_range(vk::ImageAspectFlags::COLOR));

            let view = unsafe { swapchain.device.device.create_image_view(&view_info, None) }
                .context("Failed to create swapchain image view")?;
            swapchain.image_views.push(view);
        }

        let depth = Image::new(
            swapchain.device.clone(),
            extent.width,
            extent.height,
            swapchain.device.depth_format,
            vk::ImageTiling::OPTIMAL,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            Some(vk::ImageAspectFlags::DEPTH),
        )
        .context("Failed to create depth attachment")?;
        let depth_view = depth.view.context("Depth attachment has no view")?;
        swapchain.depth = Some(depth);

        for &view in &swapchain.image_views {
            let framebuffer = Framebuffer::new(
                swapchain.device.clone(),
                render_pass.handle,
                extent.width,
                extent.height,
                &[view, depth_view],
            )?;
            swapchain.framebuffers.push(framebuffer);
        }

        Ok(swapchain)
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Acquire next image for rendering. Out-of-date and suboptimal
    /// swapchains both report `Acquire::Stale`.
    pub fn acquire_next_image(&self, timeout: u64, semaphore: vk::Semaphore) -> Result<Acquire> {
        let result = unsafe {
            self.device.swapchain_loader.acquire_next_image(
                self.handle,
                timeout,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, false)) => Ok(Acquire::Ready(index)),
            Ok((_, true)) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquire::Stale),
            Err(e) => Err(e).context("Failed to acquire swapchain image"),
        }
    }

    /// Present rendered image to screen
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<Present> {
        let swapchains = [self.handle];
        let image_indices = [image_index];
        let wait_semaphores = [wait_semaphore];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.device.swapchain_loader.queue_present(queue, &present_info) };

        match result {
            Ok(false) => Ok(Present::Done),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Present::Stale),
            Err(e) => Err(e).context("Failed to present swapchain image"),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        // Framebuffers, depth attachment, views, then the swapchain itself
        self.framebuffers.clear();
        self.depth = None;
        unsafe {
            for view in self.image_views.drain(..) {
                self.device.device.destroy_image_view(view, None);
            }
            self.device
                .swapchain_loader
                .destroy_swapchain(self.handle, None);
        }
        log::debug!("Destroyed swapchain");
    }
}

/// Prefer BGRA8 sRGB, otherwise whatever the surface lists first
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// The entry for `format`, preferring the sRGB non-linear color space
pub fn surface_format_for(
    formats: &[vk::SurfaceFormatKHR],
    format: vk::Format,
) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .filter(|f| f.format == format)
        .min_by_key(|f| f.color_space != vk::ColorSpaceKHR::SRGB_NONLINEAR)
        .copied()
}

/// MAILBOX when offered, otherwise FIFO (always supported)
pub fn choose_present_mode(modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// The surface's current extent when it dictates one, otherwise the
/// requested size. Always clamped to the supported range. `None` when the
/// result has no area, as for a minimized window.
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    width: u32,
    height: u32,
) -> Option<vk::Extent2D> {
    let requested = if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D { width, height }
    };

    let min = capabilities.min_image_extent;
    let max = capabilities.max_image_extent;
    let extent = vk::Extent2D {
        width: requested.width.max(min.width).min(max.width),
        height: requested.height.max(min.height).min(max.height),
    };
    (extent.width > 0 && extent.height > 0).then_some(extent)
}

/// One more than the minimum, capped by the maximum (0 means unbounded)
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}
