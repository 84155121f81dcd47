// Window surface creation
//
// Turns raw window/display handles into a VkSurfaceKHR for the platforms we
// ship on. The instance must have been created with the extensions from
// `required_instance_extensions`.

use anyhow::Result;
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::c_char;

/// Instance extensions needed to create a surface on this platform
pub fn required_instance_extensions() -> Vec<*const c_char> {
    let mut extensions = vec![ash::extensions::khr::Surface::name().as_ptr()];

    #[cfg(target_os = "windows")]
    {
        extensions.push(ash::extensions::khr::Win32Surface::name().as_ptr());
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    {
        extensions.push(ash::extensions::khr::XlibSurface::name().as_ptr());
        extensions.push(ash::extensions::khr::XcbSurface::name().as_ptr());
        extensions.push(ash::extensions::khr::WaylandSurface::name().as_ptr());
    }

    extensions
}

/// Create a surface for the given window
///
/// # Safety
/// The handles must stay valid for the lifetime of the returned surface.
pub unsafe fn create_surface(
    entry: &ash::Entry,
    instance: &ash::Instance,
    display_handle: RawDisplayHandle,
    window_handle: RawWindowHandle,
) -> Result<vk::SurfaceKHR> {
    match (display_handle, window_handle) {
        #[cfg(target_os = "windows")]
        (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
            let hinstance =
                handle.hinstance.map(|h| h.get()).unwrap_or(0) as *const std::ffi::c_void;
            let hwnd = handle.hwnd.get() as *const std::ffi::c_void;
            let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                .hinstance(hinstance)
                .hwnd(hwnd);
            let loader = ash::extensions::khr::Win32Surface::new(entry, instance);
            Ok(loader.create_win32_surface(&create_info, None)?)
        }

        #[cfg(all(unix, not(target_os = "macos")))]
        (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(window)) => {
            let dpy = display
                .display
                .map(|d| d.as_ptr())
                .ok_or_else(|| anyhow::anyhow!("Xlib display handle is null"))?;
            let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                .dpy(dpy as *mut vk::Display)
                .window(window.window as vk::Window);
            let loader = ash::extensions::khr::XlibSurface::new(entry, instance);
            Ok(loader.create_xlib_surface(&create_info, None)?)
        }

        #[cfg(all(unix, not(target_os = "macos")))]
        (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(window)) => {
            let connection = display
                .connection
                .map(|c| c.as_ptr())
                .ok_or_else(|| anyhow::anyhow!("XCB connection handle is null"))?;
            let create_info = vk::XcbSurfaceCreateInfoKHR::builder()
                .connection(connection as *mut vk::xcb_connection_t)
                .window(window.window.get());
            let loader = ash::extensions::khr::XcbSurface::new(entry, instance);
            Ok(loader.create_xcb_surface(&create_info, None)?)
        }

        #[cfg(all(unix, not(target_os = "macos")))]
        (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(window)) => {
            let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                .display(display.display.as_ptr() as *mut vk::wl_display)
                .surface(window.surface.as_ptr() as *mut vk::wl_surface);
            let loader = ash::extensions::khr::WaylandSurface::new(entry, instance);
            Ok(loader.create_wayland_surface(&create_info, None)?)
        }

        _ => anyhow::bail!("Unsupported window handle type"),
    }
}
