// 2D images with bound device memory and an optional view

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;

/// Mip chain length of every image created through this module
pub const MIP_LEVELS: u32 = 4;

pub struct Image {
    pub handle: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: Option<vk::ImageView>,
    pub format: vk::Format,
    device: Arc<VulkanDevice>,
}

impl Image {
    /// Create the image, allocate and bind its memory, and optionally create
    /// a view over the first mip level.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: Arc<VulkanDevice>,
        width: u32,
        height: u32,
        format: vk::Format,
        tiling: vk::ImageTiling,
        usage: vk::ImageUsageFlags,
        memory_flags: vk::MemoryPropertyFlags,
        view_aspect: Option<vk::ImageAspectFlags>,
    ) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(MIP_LEVELS)
            .array_layers(1)
            .format(format)
            .tiling(tiling)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = unsafe { device.device.create_image(&image_info, None) }
            .context("Failed to create image")?;

        // From here on Drop releases whatever has been created so far
        let mut image = Self {
            handle,
            memory: vk::DeviceMemory::null(),
            view: None,
            format,
            device,
        };

        let requirements = unsafe { image.device.device.get_image_memory_requirements(handle) };
        let memory_type_index = image
            .device
            .find_memory_type(requirements.memory_type_bits, memory_flags)?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        image.memory = unsafe { image.device.device.allocate_memory(&alloc_info, None) }
            .context("Failed to allocate image memory")?;

        unsafe { image.device.device.bind_image_memory(handle, image.memory, 0) }
            .context("Failed to bind image memory")?;

        if let Some(aspect) = view_aspect {
            image.create_view(aspect)?;
        }

        log::debug!("Created {}x{} image ({:?})", width, height, format);
        Ok(image)
    }

    /// Create (or replace) the view over mip 0, layer 0.
    pub fn create_view(&mut self, aspect: vk::ImageAspectFlags) -> Result<vk::ImageView> {
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(self.handle)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(self.format)
            .subresource_range(single_level_range(aspect));

        let view = unsafe { self.device.device.create_image_view(&view_info, None) }
            .context("Failed to create image view")?;

        if let Some(old) = self.view.replace(view) {
            unsafe { self.device.device.destroy_image_view(old, None) };
        }
        Ok(view)
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe {
            if let Some(view) = self.view.take() {
                self.device.device.destroy_image_view(view, None);
            }
            if self.memory != vk::DeviceMemory::null() {
                self.device.device.free_memory(self.memory, None);
            }
            self.device.device.destroy_image(self.handle, None);
        }
    }
}

/// Subresource range covering one mip level and one array layer
pub fn single_level_range(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: aspect,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn views_cover_first_level_only() {
        let range = single_level_range(vk::ImageAspectFlags::DEPTH);
        assert_eq!(range.aspect_mask, vk::ImageAspectFlags::DEPTH);
        assert_eq!(range.base_mip_level, 0);
        assert_eq!(range.level_count, 1);
        assert_eq!(range.layer_count, 1);
        assert!(range.level_count < MIP_LEVELS);
    }
}
