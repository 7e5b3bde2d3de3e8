// Window surface - platform-specific connection between window and GPU

use ash::extensions::khr;
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use std::sync::Arc;

use super::error::{BackendError, BackendResult};
use super::instance::VulkanInstance;

pub struct Surface {
    pub handle: vk::SurfaceKHR,
    pub loader: khr::Surface,
    _instance: Arc<VulkanInstance>,
}

impl Surface {
    pub fn new<W>(instance: Arc<VulkanInstance>, window: &W) -> BackendResult<Self>
    where
        W: HasWindowHandle + HasDisplayHandle,
    {
        let window_handle = window
            .window_handle()
            .map_err(|e| BackendError::UnsupportedPlatform(e.to_string()))?
            .as_raw();
        let display_handle = window
            .display_handle()
            .map_err(|e| BackendError::UnsupportedPlatform(e.to_string()))?
            .as_raw();

        let handle = unsafe { create_platform_surface(&instance, display_handle, window_handle) }?;
        let loader = khr::Surface::new(&instance.entry, &instance.instance);

        log::debug!("Created window surface");

        Ok(Self {
            handle,
            loader,
            _instance: instance,
        })
    }

    pub fn supports_present(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> BackendResult<bool> {
        let supported = unsafe {
            self.loader
                .get_physical_device_surface_support(physical_device, queue_family, self.handle)
        }?;
        Ok(supported)
    }

    pub fn capabilities(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> BackendResult<vk::SurfaceCapabilitiesKHR> {
        let caps = unsafe {
            self.loader
                .get_physical_device_surface_capabilities(physical_device, self.handle)
        }?;
        Ok(caps)
    }

    pub fn formats(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> BackendResult<Vec<vk::SurfaceFormatKHR>> {
        let formats = unsafe {
            self.loader
                .get_physical_device_surface_formats(physical_device, self.handle)
        }?;
        Ok(formats)
    }

    pub fn present_modes(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> BackendResult<Vec<vk::PresentModeKHR>> {
        let modes = unsafe {
            self.loader
                .get_physical_device_surface_present_modes(physical_device, self.handle)
        }?;
        Ok(modes)
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        log::debug!("Destroying window surface");
        unsafe { self.loader.destroy_surface(self.handle, None) };
    }
}

unsafe fn create_platform_surface(
    instance: &VulkanInstance,
    display: RawDisplayHandle,
    window: RawWindowHandle,
) -> BackendResult<vk::SurfaceKHR> {
    let entry = &instance.entry;
    let instance = &instance.instance;

    let surface = match (display, window) {
        (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
            let hinstance = handle.hinstance.map(|h| h.get()).unwrap_or(0) as *const std::ffi::c_void;
            let hwnd = handle.hwnd.get() as *const std::ffi::c_void;
            let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                .hinstance(hinstance)
                .hwnd(hwnd);
            khr::Win32Surface::new(entry, instance).create_win32_surface(&create_info, None)?
        }
        (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(handle)) => {
            let dpy = display
                .display
                .map(|d| d.as_ptr())
                .ok_or_else(|| BackendError::UnsupportedPlatform("Xlib display is null".into()))?;
            let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                .dpy(dpy.cast())
                .window(handle.window);
            khr::XlibSurface::new(entry, instance).create_xlib_surface(&create_info, None)?
        }
        (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(handle)) => {
            let connection = display
                .connection
                .map(|c| c.as_ptr())
                .ok_or_else(|| BackendError::UnsupportedPlatform("XCB connection is null".into()))?;
            let create_info = vk::XcbSurfaceCreateInfoKHR::builder()
                .connection(connection)
                .window(handle.window.get());
            khr::XcbSurface::new(entry, instance).create_xcb_surface(&create_info, None)?
        }
        (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(handle)) => {
            let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                .display(display.display.as_ptr())
                .surface(handle.surface.as_ptr());
            khr::WaylandSurface::new(entry, instance).create_wayland_surface(&create_info, None)?
        }
        (display, window) => {
            return Err(BackendError::UnsupportedPlatform(format!(
                "{:?} / {:?}",
                display, window
            )));
        }
    };

    Ok(surface)
}
