// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Physical device selection (graphics + present queues, swapchain support)
// - Logical device + queue creation
// - Memory type lookup for raw allocations

use ash::vk;
use std::ffi::CStr;
use std::sync::Arc;

use super::error::{BackendError, BackendResult};
use super::instance::VulkanInstance;
use super::surface::Surface;

/// Device extensions every candidate must expose
const REQUIRED_DEVICE_EXTENSIONS: [&CStr; 1] = [c"VK_KHR_swapchain"];

/// Queue family roles resolved on one physical device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilyIndices {
    /// Scan queue families for a graphics family and, independently, a
    /// family that can present to the surface. Stops once both are known.
    pub fn find<F>(families: &[vk::QueueFamilyProperties], mut supports_present: F) -> BackendResult<Self>
    where
        F: FnMut(u32) -> BackendResult<bool>,
    {
        let mut indices = Self::default();

        for (index, family) in families.iter().enumerate() {
            let index = index as u32;

            if indices.graphics.is_none() && family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                indices.graphics = Some(index);
            }
            if indices.present.is_none() && supports_present(index)? {
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

    /// Both roles served by one family (exclusive swapchain images)
    pub fn is_same(&self) -> bool {
        self.is_complete() && self.graphics == self.present
    }

    /// Distinct family indices, graphics first
    pub fn unique(&self) -> Vec<u32> {
        let mut families: Vec<u32> = self.graphics.into_iter().chain(self.present).collect();
        families.dedup();
        families
    }
}

/// What the suitability check needs to know about one GPU
///
/// The default value is an unsuitable candidate.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceCandidate {
    pub indices: QueueFamilyIndices,
    pub extensions_supported: bool,
    pub surface_format_count: usize,
    pub present_mode_count: usize,
}

impl DeviceCandidate {
    pub fn is_suitable(&self) -> bool {
        self.indices.is_complete()
            && self.extensions_supported
            && self.surface_format_count > 0
            && self.present_mode_count > 0
    }
}

/// A GPU whose capability queries failed stays in the list as unsuitable
pub fn candidate_or_unsuitable(name: &str, query: BackendResult<DeviceCandidate>) -> DeviceCandidate {
    query.unwrap_or_else(|e| {
        log::warn!("Skipping GPU {}: {}", name, e);
        DeviceCandidate::default()
    })
}

/// Index of the first suitable candidate in enumeration order
pub fn select_candidate(candidates: &[DeviceCandidate]) -> Option<usize> {
    candidates.iter().position(DeviceCandidate::is_suitable)
}

/// First memory type allowed by `type_bits` whose flags contain `required`
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> BackendResult<u32> {
    let count = memory_properties.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32);

    (0..count)
        .find(|&i| {
            type_bits & (1 << i) != 0
                && memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(required)
        })
        .ok_or(BackendError::NoSuitableMemoryType { type_bits, required })
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: Arc<VulkanInstance>,

    // Queue handles (may be the same queue)
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub queue_families: QueueFamilyIndices,

    // Cached for memory type lookups
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl VulkanDevice {
    /// Pick a GPU able to render to `surface` and open its queues
    pub fn new(instance: Arc<VulkanInstance>, surface: &Surface) -> BackendResult<Arc<Self>> {
        let (physical_device, queue_families) = Self::pick_physical_device(&instance, surface)?;

        let graphics_family = queue_families.graphics.ok_or(BackendError::NoCapableDevice)?;
        let present_family = queue_families.present.ok_or(BackendError::NoCapableDevice)?;

        let device = Self::create_logical_device(&instance.instance, physical_device, &queue_families)?;

        let (graphics_queue, present_queue) = unsafe {
            (
                device.get_device_queue(graphics_family, 0),
                device.get_device_queue(present_family, 0),
            )
        };

        let properties = unsafe { instance.instance.get_physical_device_properties(physical_device) };
        let memory_properties = unsafe {
            instance
                .instance
                .get_physical_device_memory_properties(physical_device)
        };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!(
            "Queue families: graphics={} present={}",
            graphics_family,
            present_family
        );

        Ok(Arc::new(Self {
            device,
            physical_device,
            instance,
            graphics_queue,
            present_queue,
            queue_families,
            memory_properties,
        }))
    }

    fn pick_physical_device(
        instance: &VulkanInstance,
        surface: &Surface,
    ) -> BackendResult<(vk::PhysicalDevice, QueueFamilyIndices)> {
        let devices = unsafe { instance.instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            log::error!("No Vulkan-capable GPU found");
            return Err(BackendError::NoCapableDevice);
        }

        let candidates: Vec<DeviceCandidate> = devices
            .iter()
            .map(|&device| {
                let props = unsafe { instance.instance.get_physical_device_properties(device) };
                let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }.to_string_lossy();
                let candidate =
                    candidate_or_unsuitable(&name, Self::inspect(instance, surface, device));
                log::debug!(
                    "GPU candidate {}: {:?} (suitable: {})",
                    name,
                    candidate,
                    candidate.is_suitable()
                );
                candidate
            })
            .collect();

        let chosen = select_candidate(&candidates).ok_or(BackendError::NoCapableDevice)?;
        Ok((devices[chosen], candidates[chosen].indices))
    }

    fn inspect(
        instance: &VulkanInstance,
        surface: &Surface,
        device: vk::PhysicalDevice,
    ) -> BackendResult<DeviceCandidate> {
        let families = unsafe {
            instance
                .instance
                .get_physical_device_queue_family_properties(device)
        };
        let indices =
            QueueFamilyIndices::find(&families, |index| surface.supports_present(device, index))?;

        let extensions_supported = Self::check_device_extensions(instance, device)?;

        // Surface support is only meaningful once the swapchain extension exists
        let (surface_format_count, present_mode_count) = if extensions_supported {
            (
                surface.formats(device)?.len(),
                surface.present_modes(device)?.len(),
            )
        } else {
            (0, 0)
        };

        Ok(DeviceCandidate {
            indices,
            extensions_supported,
            surface_format_count,
            present_mode_count,
        })
    }

    fn check_device_extensions(
        instance: &VulkanInstance,
        device: vk::PhysicalDevice,
    ) -> BackendResult<bool> {
        let available = unsafe {
            instance
                .instance
                .enumerate_device_extension_properties(device)
        }?;

        Ok(REQUIRED_DEVICE_EXTENSIONS.iter().all(|required| {
            available
                .iter()
                .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == *required)
        }))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_families: &QueueFamilyIndices,
    ) -> BackendResult<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = queue_families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extensions: Vec<*const std::ffi::c_char> = REQUIRED_DEVICE_EXTENSIONS
            .iter()
            .map(|name| name.as_ptr())
            .collect();

        let features = vk::PhysicalDeviceFeatures::default();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }?;

        Ok(device)
    }

    /// Memory type index on this GPU, see [`find_memory_type`]
    pub fn find_memory_type(
        &self,
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    ) -> BackendResult<u32> {
        find_memory_type(&self.memory_properties, type_bits, required)
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> BackendResult<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        unsafe {
            self.device.destroy_device(None);
        }
    }
}
