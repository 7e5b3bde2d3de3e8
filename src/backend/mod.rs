// Backend module - Vulkan abstraction layer
//
// Thin RAII wrappers around ash. Every wrapper holds an Arc to what it was
// created from, so drop order can never outlive a parent object.

pub mod buffer;
pub mod command;
pub mod debug;
pub mod device;
pub mod error;
pub mod frame;
pub mod framebuffer;
pub mod instance;
pub mod pipeline;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use device::VulkanDevice;
pub use error::BackendResult;
pub use instance::VulkanInstance;
pub use swapchain::Swapchain;
