// Window boundary
//
// The renderer only needs three things from a window: the instance
// extensions presentation requires, a native surface, and the current
// framebuffer size. winit windows provide them through raw-window-handle.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use std::ffi::CStr;

pub trait SurfaceProvider {
    /// Instance extensions needed to present to this window
    fn required_extensions(&self) -> Result<Vec<&'static CStr>>;

    fn create_surface(&self, entry: &ash::Entry, instance: &ash::Instance)
        -> Result<vk::SurfaceKHR>;

    /// Current drawable size in pixels
    fn framebuffer_size(&self) -> (u32, u32);
}

impl SurfaceProvider for winit::window::Window {
    fn required_extensions(&self) -> Result<Vec<&'static CStr>> {
        let display = self
            .display_handle()
            .map_err(|e| anyhow::anyhow!("Window has no display handle: {}", e))?
            .as_raw();
        surface_extensions(display)
    }

    fn create_surface(
        &self,
        entry: &ash::Entry,
        instance: &ash::Instance,
    ) -> Result<vk::SurfaceKHR> {
        let display = self
            .display_handle()
            .map_err(|e| anyhow::anyhow!("Window has no display handle: {}", e))?
            .as_raw();
        let window = self
            .window_handle()
            .map_err(|e| anyhow::anyhow!("Window has no window handle: {}", e))?
            .as_raw();

        let surface = unsafe { create_platform_surface(entry, instance, display, window) }?;
        log::info!("Created window surface");
        Ok(surface)
    }

    fn framebuffer_size(&self) -> (u32, u32) {
        let size = self.inner_size();
        (size.width, size.height)
    }
}

/// Surface extension plus the platform extension for `display`.
pub fn surface_extensions(display: RawDisplayHandle) -> Result<Vec<&'static CStr>> {
    let platform = match display {
        RawDisplayHandle::Windows(_) => khr::Win32Surface::name(),
        RawDisplayHandle::Xlib(_) => khr::XlibSurface::name(),
        RawDisplayHandle::Xcb(_) => khr::XcbSurface::name(),
        RawDisplayHandle::Wayland(_) => khr::WaylandSurface::name(),
        other => anyhow::bail!("Unsupported display platform: {:?}", other),
    };
    Ok(vec![khr::Surface::name(), platform])
}

unsafe fn create_platform_surface(
    entry: &ash::Entry,
    instance: &ash::Instance,
    display: RawDisplayHandle,
    window: RawWindowHandle,
) -> Result<vk::SurfaceKHR> {
    let surface = match (display, window) {
        (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
            let hinstance = handle
                .hinstance
                .map_or(std::ptr::null(), |h| h.get() as *const std::ffi::c_void);
            let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                .hinstance(hinstance)
                .hwnd(handle.hwnd.get() as *const std::ffi::c_void);
            khr::Win32Surface::new(entry, instance).create_win32_surface(&create_info, None)
        }

        (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(handle)) => {
            let dpy = display
                .display
                .context("Xlib display handle is null")?
                .as_ptr();
            let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                .dpy(dpy.cast())
                .window(handle.window);
            khr::XlibSurface::new(entry, instance).create_xlib_surface(&create_info, None)
        }

        (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(handle)) => {
            let connection = display
                .connection
                .context("XCB connection handle is null")?
                .as_ptr();
            let create_info = vk::XcbSurfaceCreateInfoKHR::builder()
                .connection(connection)
                .window(handle.window.get());
            khr::XcbSurface::new(entry, instance).create_xcb_surface(&create_info, None)
        }

        (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(handle)) => {
            let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                .display(display.display.as_ptr())
                .surface(handle.surface.as_ptr());
            khr::WaylandSurface::new(entry, instance).create_wayland_surface(&create_info, None)
        }

        (display, window) => {
            anyhow::bail!("Unsupported window platform: {:?} / {:?}", display, window)
        }
    };

    surface.context("Failed to create window surface")
}

#[cfg(test)]
mod tests {
    use super::*;
    use raw_window_handle::{WaylandDisplayHandle, XlibDisplayHandle};
    use std::ptr::NonNull;

    #[test]
    fn xlib_needs_generic_and_xlib_surface() {
        let display = RawDisplayHandle::Xlib(XlibDisplayHandle::new(None, 0));
        let extensions = surface_extensions(display).unwrap();
        assert_eq!(
            extensions,
            vec![khr::Surface::name(), khr::XlibSurface::name()]
        );
    }

    #[test]
    fn wayland_needs_wayland_surface() {
        let mut dummy = 0u8;
        let display = RawDisplayHandle::Wayland(WaylandDisplayHandle::new(
            NonNull::from(&mut dummy).cast(),
        ));
        let extensions = surface_extensions(display).unwrap();
        assert!(extensions.contains(&khr::WaylandSurface::name()));
    }
}
