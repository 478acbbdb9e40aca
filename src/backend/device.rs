// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Physical device selection (queue families, extensions, surface support)
// - Logical device + graphics/present queue creation
// - Graphics command pool
// - Depth format probing and memory type lookup

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;
use std::collections::BTreeSet;
use std::ffi::{c_char, CStr};
use std::sync::Arc;

use super::instance::VulkanInstance;

const PORTABILITY_SUBSET: &CStr = c"VK_KHR_portability_subset";

/// Depth formats in order of preference
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// Extensions every selected device must expose
fn required_device_extensions() -> Vec<&'static CStr> {
    vec![khr::Swapchain::name()]
}

/// Queue families needed for rendering and presentation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilyIndices {
    /// Scan the families in order. Later matches overwrite earlier ones until
    /// both roles are filled, which favours a family that can do both.
    pub fn find(
        families: &[vk::QueueFamilyProperties],
        mut supports_present: impl FnMut(u32) -> Result<bool>,
    ) -> Result<Self> {
        let mut indices = Self::default();

        for (index, family) in families.iter().enumerate() {
            let index = index as u32;
            if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                indices.graphics = Some(index);
            }
            if supports_present(index)? {
                indices.present = Some(index);
            }
            if indices.is_complete() {
                break;
            }
        }

        Ok(indices)
    }

    pub fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some()
    }

    /// Distinct family indices, one queue is created per entry
    pub fn unique(&self) -> Vec<u32> {
        self.graphics
            .iter()
            .chain(self.present.iter())
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// What a surface supports on a given physical device
#[derive(Debug, Clone, Default)]
pub struct SwapchainSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupport {
    pub fn query(
        surface_loader: &khr::Surface,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Self> {
        unsafe {
            Ok(Self {
                capabilities: surface_loader
                    .get_physical_device_surface_capabilities(physical_device, surface)
                    .context("Failed to query surface capabilities")?,
                formats: surface_loader
                    .get_physical_device_surface_formats(physical_device, surface)
                    .context("Failed to query surface formats")?,
                present_modes: surface_loader
                    .get_physical_device_surface_present_modes(physical_device, surface)
                    .context("Failed to query present modes")?,
            })
        }
    }

    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// First candidate whose linear or optimal tiling supports depth-stencil attachments
pub fn select_depth_format(
    candidates: &[vk::Format],
    format_properties: impl Fn(vk::Format) -> vk::FormatProperties,
) -> Option<vk::Format> {
    let required = vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;

    candidates.iter().copied().find(|&format| {
        let props = format_properties(format);
        props.linear_tiling_features.contains(required)
            || props.optimal_tiling_features.contains(required)
    })
}

/// Index of the first memory type allowed by `type_filter` that has all of `properties`
pub fn find_memory_type_index(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory_properties.memory_type_count).find(|&i| {
        let has_type = (type_filter & (1 << i)) != 0;
        let has_properties = memory_properties.memory_types[i as usize]
            .property_flags
            .contains(properties);
        has_type && has_properties
    })
}

/// Optional features turned on when the device supports them
pub fn enabled_features(supported: &vk::PhysicalDeviceFeatures) -> vk::PhysicalDeviceFeatures {
    vk::PhysicalDeviceFeatures {
        fill_mode_non_solid: supported.fill_mode_non_solid,
        ..Default::default()
    }
}

/// Logical device wrapper with automatic cleanup
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,

    // Queue handles
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,
    pub present_queue: vk::Queue,
    pub present_queue_family: u32,

    pub command_pool: vk::CommandPool,
    pub depth_format: vk::Format,
    /// Line and point polygon modes are enabled (wireframe pipelines)
    pub fill_mode_non_solid: bool,
    pub swapchain_loader: khr::Swapchain,

    // Cached at selection time
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,

    // Keeps the instance alive for as long as any device object exists
    instance: Arc<VulkanInstance>,
}

impl VulkanDevice {
    /// Select a GPU that can present to `surface` and create the logical device.
    pub fn new(instance: Arc<VulkanInstance>, surface: vk::SurfaceKHR) -> Result<Arc<Self>> {
        let (physical_device, families) = Self::pick_physical_device(&instance, surface)?;
        let graphics_queue_family = families.graphics.context("No graphics queue family")?;
        let present_queue_family = families.present.context("No present queue family")?;

        let properties = unsafe {
            instance
                .instance
                .get_physical_device_properties(physical_device)
        };
        let memory_properties = unsafe {
            instance
                .instance
                .get_physical_device_memory_properties(physical_device)
        };

        log::info!(
            "Selected GPU: {} ({:?})",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy(),
            properties.device_type
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        let supported_features = unsafe {
            instance
                .instance
                .get_physical_device_features(physical_device)
        };
        let features = enabled_features(&supported_features);
        let fill_mode_non_solid = features.fill_mode_non_solid == vk::TRUE;

        let device =
            Self::create_logical_device(&instance, physical_device, &families, &features)?;
        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };
        let present_queue = unsafe { device.get_device_queue(present_queue_family, 0) };

        let command_pool = match Self::create_command_pool(&device, graphics_queue_family) {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e);
            }
        };

        let depth_format = select_depth_format(&DEPTH_FORMAT_CANDIDATES, |format| unsafe {
            instance
                .instance
                .get_physical_device_format_properties(physical_device, format)
        });
        let Some(depth_format) = depth_format else {
            unsafe {
                device.destroy_command_pool(command_pool, None);
                device.destroy_device(None);
            }
            anyhow::bail!("No supported depth format found");
        };
        log::info!("Depth format: {:?}", depth_format);

        let swapchain_loader = khr::Swapchain::new(&instance.instance, &device);

        Ok(Arc::new(Self {
            device,
            physical_device,
            graphics_queue,
            graphics_queue_family,
            present_queue,
            present_queue_family,
            command_pool,
            depth_format,
            fill_mode_non_solid,
            swapchain_loader,
            properties,
            memory_properties,
            instance,
        }))
    }

    fn pick_physical_device(
        instance: &VulkanInstance,
        surface: vk::SurfaceKHR,
    ) -> Result<(vk::PhysicalDevice, QueueFamilyIndices)> {
        let devices = unsafe { instance.instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;

        if devices.is_empty() {
            anyhow::bail!("Failed to find GPUs with Vulkan support");
        }

        for device in devices {
            if let Some(families) = Self::is_device_suitable(instance, device, surface)? {
                return Ok((device, families));
            }
        }

        anyhow::bail!("Failed to find a suitable GPU")
    }

    /// Queue families if the device can render and present to `surface`
    fn is_device_suitable(
        instance: &VulkanInstance,
        device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Option<QueueFamilyIndices>> {
        let families = Self::find_queue_families(instance, device, surface)?;
        if !families.is_complete() {
            return Ok(None);
        }

        if !Self::check_device_extension_support(instance, device)? {
            return Ok(None);
        }

        let support = SwapchainSupport::query(&instance.surface_loader, device, surface)?;
        if !support.is_adequate() {
            return Ok(None);
        }

        Ok(Some(families))
    }

    fn find_queue_families(
        instance: &VulkanInstance,
        device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<QueueFamilyIndices> {
        let families = unsafe {
            instance
                .instance
                .get_physical_device_queue_family_properties(device)
        };

        QueueFamilyIndices::find(&families, |index| unsafe {
            instance
                .surface_loader
                .get_physical_device_surface_support(device, index, surface)
                .context("Failed to query surface support")
        })
    }

    fn available_extensions(
        instance: &VulkanInstance,
        device: vk::PhysicalDevice,
    ) -> Result<Vec<vk::ExtensionProperties>> {
        unsafe { instance.instance.enumerate_device_extension_properties(device) }
            .context("Failed to enumerate device extensions")
    }

    fn check_device_extension_support(
        instance: &VulkanInstance,
        device: vk::PhysicalDevice,
    ) -> Result<bool> {
        let available = Self::available_extensions(instance, device)?;
        let names: Vec<&CStr> = available
            .iter()
            .map(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) })
            .collect();

        Ok(required_device_extensions()
            .iter()
            .all(|required| names.contains(required)))
    }

    fn create_logical_device(
        instance: &VulkanInstance,
        physical_device: vk::PhysicalDevice,
        families: &QueueFamilyIndices,
        features: &vk::PhysicalDeviceFeatures,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let mut extensions: Vec<*const c_char> = required_device_extensions()
            .iter()
            .map(|ext| ext.as_ptr())
            .collect();

        // MoltenVK requires the portability subset to be enabled when exposed
        let available = Self::available_extensions(instance, physical_device)?;
        if available
            .iter()
            .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == PORTABILITY_SUBSET)
        {
            extensions.push(PORTABILITY_SUBSET.as_ptr());
        }

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(features);

        unsafe {
            instance
                .instance
                .create_device(physical_device, &create_info, None)
        }
        .context("Failed to create logical device")
    }

    fn create_command_pool(device: &ash::Device, queue_family: u32) -> Result<vk::CommandPool> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_family)
            // Allow individual buffer reset
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let pool = unsafe { device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;
        log::info!("Created graphics command pool");
        Ok(pool)
    }

    /// Memory type index satisfying `type_filter` and `properties`.
    pub fn find_memory_type(
        &self,
        type_filter: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<u32> {
        find_memory_type_index(&self.memory_properties, type_filter, properties).with_context(
            || {
                format!(
                    "Failed to find suitable memory type (filter {:#b}, {:?})",
                    type_filter, properties
                )
            },
        )
    }

    pub fn query_swapchain_support(&self, surface: vk::SurfaceKHR) -> Result<SwapchainSupport> {
        SwapchainSupport::query(&self.instance.surface_loader, self.physical_device, surface)
    }

    /// Wait for device to be idle (e.g., before destroying resources)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("Failed to wait for device idle")?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        if let Err(e) = self.wait_idle() {
            log::error!("{:?}", e);
        }

        unsafe {
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
        }
    }
}
