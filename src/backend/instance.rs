// Vulkan instance - API loader, validation layer, debug messenger
//
// Surface extensions are picked from the window's display handle so the
// same binary runs on Win32, X11 and Wayland.

use ash::extensions::{ext::DebugUtils, khr};
use ash::{vk, Entry};
use raw_window_handle::RawDisplayHandle;
use std::ffi::{CStr, CString};
use std::sync::Arc;

use super::debug::DebugMessengerConfig;
use super::error::{BackendError, BackendResult};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

pub struct VulkanInstance {
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    pub instance: ash::Instance,
    pub entry: Entry,
}

impl VulkanInstance {
    /// Create the instance
    ///
    /// # Arguments
    /// * `app_name` - Application name reported to the driver
    /// * `display` - Display handle of the window that will be presented to
    /// * `debug` - Messenger settings; `None` disables validation entirely
    pub fn new(
        app_name: &str,
        display: RawDisplayHandle,
        debug: Option<DebugMessengerConfig>,
    ) -> BackendResult<Arc<Self>> {
        log::info!("Creating Vulkan instance: {}", app_name);

        let entry = unsafe { Entry::load() }?;

        let mut extensions: Vec<*const std::ffi::c_char> = required_surface_extensions(display)?
            .iter()
            .map(|name| name.as_ptr())
            .collect();

        // Validation is best effort: a missing SDK only costs diagnostics
        let debug = debug.filter(|_| {
            let available = layer_available(&entry, VALIDATION_LAYER);
            if !available {
                log::warn!("Validation requested but {:?} is not installed", VALIDATION_LAYER);
            }
            available
        });

        let layer_names = if debug.is_some() {
            extensions.push(DebugUtils::name().as_ptr());
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let app_name_cstr = CString::new(app_name).unwrap_or_default();
        let engine_name = c"triangle-renderer";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_0);

        // Chained so that instance creation itself is covered by the messenger
        let mut instance_debug_info = debug.map(|config| config.create_info());

        let mut create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        if let Some(info) = instance_debug_info.as_mut() {
            create_info = create_info.push_next(info);
        }

        let instance = unsafe { entry.create_instance(&create_info, None) }?;

        let debug_utils = match debug {
            Some(config) => {
                let loader = DebugUtils::new(&entry, &instance);
                let messenger =
                    unsafe { loader.create_debug_utils_messenger(&config.create_info(), None) };
                match messenger {
                    Ok(messenger) => Some((loader, messenger)),
                    Err(e) => {
                        unsafe { instance.destroy_instance(None) };
                        return Err(e.into());
                    }
                }
            }
            None => None,
        };

        log::info!(
            "Instance ready (validation {})",
            if debug_utils.is_some() { "on" } else { "off" }
        );

        Ok(Arc::new(Self {
            debug_utils,
            instance,
            entry,
        }))
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        log::debug!("Destroying Vulkan instance");
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Instance extensions needed to create a surface for this display
pub fn required_surface_extensions(display: RawDisplayHandle) -> BackendResult<Vec<&'static CStr>> {
    let platform = match display {
        RawDisplayHandle::Windows(_) => khr::Win32Surface::name(),
        RawDisplayHandle::Xlib(_) => khr::XlibSurface::name(),
        RawDisplayHandle::Xcb(_) => khr::XcbSurface::name(),
        RawDisplayHandle::Wayland(_) => khr::WaylandSurface::name(),
        other => {
            return Err(BackendError::UnsupportedPlatform(format!("{:?}", other)));
        }
    };
    Ok(vec![khr::Surface::name(), platform])
}

fn layer_available(entry: &Entry, layer: &CStr) -> bool {
    match entry.enumerate_instance_layer_properties() {
        Ok(layers) => layers
            .iter()
            .any(|props| unsafe { CStr::from_ptr(props.layer_name.as_ptr()) } == layer),
        Err(e) => {
            log::warn!("Failed to enumerate instance layers: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raw_window_handle::{WaylandDisplayHandle, WindowsDisplayHandle, XlibDisplayHandle};
    use std::ptr::NonNull;

    #[test]
    fn surface_extensions_follow_display_kind() {
        let wayland = RawDisplayHandle::Wayland(WaylandDisplayHandle::new(NonNull::dangling()));
        let names = required_surface_extensions(wayland).unwrap();
        assert_eq!(names, vec![khr::Surface::name(), khr::WaylandSurface::name()]);

        let xlib = RawDisplayHandle::Xlib(XlibDisplayHandle::new(None, 0));
        let names = required_surface_extensions(xlib).unwrap();
        assert_eq!(names[1], khr::XlibSurface::name());

        let windows = RawDisplayHandle::Windows(WindowsDisplayHandle::new());
        let names = required_surface_extensions(windows).unwrap();
        assert_eq!(names[1], khr::Win32Surface::name());
    }

    #[test]
    fn unknown_display_is_rejected() {
        let web = RawDisplayHandle::Web(raw_window_handle::WebDisplayHandle::new());
        assert!(matches!(
            required_surface_extensions(web),
            Err(BackendError::UnsupportedPlatform(_))
        ));
    }
}
