// Vulkan instance
//
// Responsibilities:
// - Loading the Vulkan library
// - Instance creation with the window's surface extensions
// - Validation layers + debug messenger (debug builds)
// - Surface loader shared by device selection and the swapchain

use anyhow::{Context, Result};
use ash::extensions::{ext::DebugUtils, khr};
use ash::{vk, Entry};
use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";
const PORTABILITY_ENUMERATION: &CStr = c"VK_KHR_portability_enumeration";
const PHYSICAL_DEVICE_PROPERTIES_2: &CStr = c"VK_KHR_get_physical_device_properties2";

/// `VK_INSTANCE_CREATE_ENUMERATE_PORTABILITY_BIT_KHR`
const ENUMERATE_PORTABILITY: vk::InstanceCreateFlags = vk::InstanceCreateFlags::from_raw(0x1);

pub struct VulkanInstance {
    pub instance: ash::Instance,
    pub surface_loader: khr::Surface,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    // Must outlive the instance
    pub entry: Entry,
}

impl VulkanInstance {
    /// Create the instance.
    ///
    /// # Arguments
    /// * `app_name` - Application name reported to the driver
    /// * `window_extensions` - Extensions the window needs for presentation
    /// * `enable_validation` - Enable Vulkan validation layers if installed
    pub fn new(
        app_name: &str,
        window_extensions: &[&CStr],
        enable_validation: bool,
    ) -> Result<Self> {
        log::info!("Creating Vulkan instance: {}", app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let enable_validation = enable_validation && Self::validation_available(&entry)?;
        let instance = Self::create_instance(&entry, app_name, window_extensions, enable_validation)?;

        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let surface_loader = khr::Surface::new(&entry, &instance);

        Ok(Self {
            instance,
            surface_loader,
            debug_utils,
            entry,
        })
    }

    fn validation_available(entry: &Entry) -> Result<bool> {
        let layers = entry
            .enumerate_instance_layer_properties()
            .context("Failed to enumerate instance layers")?;
        let available = layers
            .iter()
            .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER);

        if !available {
            log::warn!("Validation requested but VK_LAYER_KHRONOS_validation is not installed");
        }
        Ok(available)
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        window_extensions: &[&CStr],
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("Wyvern Engine")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_0);

        let mut extensions: Vec<*const c_char> =
            window_extensions.iter().map(|ext| ext.as_ptr()).collect();

        // MoltenVK only shows up when portability enumeration is requested
        let available = entry
            .enumerate_instance_extension_properties(None)
            .context("Failed to enumerate instance extensions")?;
        let has_extension = |name: &CStr| {
            available
                .iter()
                .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == name)
        };

        let mut flags = vk::InstanceCreateFlags::empty();
        if has_extension(PORTABILITY_ENUMERATION) {
            extensions.push(PORTABILITY_ENUMERATION.as_ptr());
            if has_extension(PHYSICAL_DEVICE_PROPERTIES_2) {
                extensions.push(PHYSICAL_DEVICE_PROPERTIES_2.as_ptr());
            }
            flags |= ENUMERATE_PORTABILITY;
        }

        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        for ext in &extensions {
            log::debug!("Instance extension: {}", unsafe { CStr::from_ptr(*ext) }.to_string_lossy());
        }

        let layer_names = if enable_validation {
            log::info!("Validation layer enabled");
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .flags(flags)
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;
        log::info!("Vulkan debug messenger created");

        Ok((debug_utils, messenger))
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        log::info!("Destroyed Vulkan instance");
    }
}

/// Presentation surface, destroyed before the instance it came from
pub struct Surface {
    pub handle: vk::SurfaceKHR,
    instance: Arc<VulkanInstance>,
}

impl Surface {
    pub fn new(instance: Arc<VulkanInstance>, handle: vk::SurfaceKHR) -> Self {
        Self { handle, instance }
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe {
            self.instance
                .surface_loader
                .destroy_surface(self.handle, None);
        }
        log::debug!("Destroyed surface");
    }
}

// Routes validation messages into the log facade
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            log::info!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
