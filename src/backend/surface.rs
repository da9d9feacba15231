// Presentation surface creation from raw platform handles
//
// The caller owns the window; we only need its raw display/window handles.
// Supported: Win32, Xlib, Xcb, Wayland.

use super::error::{BackendError, BackendResult};
use ash::extensions::khr;
use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::CStr;

/// Platform window handle handed to the context at init.
#[derive(Debug, Clone, Copy)]
pub struct WindowHandles {
    pub display: RawDisplayHandle,
    pub window: RawWindowHandle,
}

/// Surface plus the loader needed to query and destroy it.
pub struct Surface {
    pub loader: khr::Surface,
    pub surface: vk::SurfaceKHR,
}

impl Surface {
    pub fn destroy(&self) {
        unsafe { self.loader.destroy_surface(self.surface, None) };
    }
}

/// Instance extensions required to create a surface for this display.
pub fn required_extensions(display: RawDisplayHandle) -> BackendResult<Vec<&'static CStr>> {
    let platform = match display {
        RawDisplayHandle::Windows(_) => khr::Win32Surface::name(),
        RawDisplayHandle::Xlib(_) => khr::XlibSurface::name(),
        RawDisplayHandle::Xcb(_) => khr::XcbSurface::name(),
        RawDisplayHandle::Wayland(_) => khr::WaylandSurface::name(),
        other => {
            return Err(BackendError::UnsupportedFeature(format!(
                "no surface support for display handle {:?}",
                other
            )))
        }
    };
    Ok(vec![khr::Surface::name(), platform])
}

/// Creates a surface for the given handles.
///
/// # Safety
/// The handles must refer to a live window that outlives the surface.
pub unsafe fn create_surface(
    entry: &Entry,
    instance: &ash::Instance,
    handles: WindowHandles,
) -> BackendResult<Surface> {
    let surface = match (handles.display, handles.window) {
        (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(window)) => {
            let hinstance = window.hinstance.map(|h| h.get()).unwrap_or(0);
            let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                .hinstance(hinstance as vk::HINSTANCE)
                .hwnd(window.hwnd.get() as vk::HWND);
            khr::Win32Surface::new(entry, instance).create_win32_surface(&create_info, None)?
        }
        (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(window)) => {
            let dpy = display
                .display
                .ok_or_else(|| BackendError::invalid_usage("Xlib display handle is null"))?;
            let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                .dpy(dpy.as_ptr() as *mut _)
                .window(window.window);
            khr::XlibSurface::new(entry, instance).create_xlib_surface(&create_info, None)?
        }
        (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(window)) => {
            let connection = display
                .connection
                .ok_or_else(|| BackendError::invalid_usage("Xcb connection handle is null"))?;
            let create_info = vk::XcbSurfaceCreateInfoKHR::builder()
                .connection(connection.as_ptr() as *mut _)
                .window(window.window.get());
            khr::XcbSurface::new(entry, instance).create_xcb_surface(&create_info, None)?
        }
        (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(window)) => {
            let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                .display(display.display.as_ptr())
                .surface(window.surface.as_ptr());
            khr::WaylandSurface::new(entry, instance)
                .create_wayland_surface(&create_info, None)?
        }
        (display, window) => {
            return Err(BackendError::UnsupportedFeature(format!(
                "no surface support for {:?} / {:?}",
                display, window
            )))
        }
    };

    log::debug!("Created presentation surface {:?}", surface);

    Ok(Surface {
        loader: khr::Surface::new(entry, instance),
        surface,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use raw_window_handle::{AppKitDisplayHandle, WaylandDisplayHandle};
    use std::ptr::NonNull;

    #[test]
    fn test_wayland_extensions() {
        let mut value = 0u8;
        let ptr = NonNull::from(&mut value).cast();
        let display = RawDisplayHandle::Wayland(WaylandDisplayHandle::new(ptr));
        let extensions = required_extensions(display).unwrap();
        assert_eq!(extensions, vec![khr::Surface::name(), khr::WaylandSurface::name()]);
    }

    #[test]
    fn test_unsupported_display() {
        let display = RawDisplayHandle::AppKit(AppKitDisplayHandle::new());
        let err = required_extensions(display).unwrap_err();
        assert!(matches!(err, BackendError::UnsupportedFeature(_)));
    }
}
