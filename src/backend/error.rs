// Backend error taxonomy
//
// Configuration and resource errors abort start-up, submission errors stop
// the frame loop. Present errors stop it too unless only the surface or
// the chain went stale, in which case they are reported and skipped.

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    /// The Vulkan loader library could not be found
    #[error("Failed to load Vulkan: {0}")]
    Loading(#[from] ash::LoadingError),

    /// Any native call without a more specific variant
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    #[error("No GPU exposes graphics + present queues, the swapchain extension and a usable surface")]
    NoCapableDevice,

    #[error("No memory type matches bits {type_bits:#b} with properties {required:?}")]
    NoSuitableMemoryType {
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    },

    #[error("Unsupported window system: {0}")]
    UnsupportedPlatform(String),

    #[error("Swapchain creation failed: {0}")]
    ChainCreation(vk::Result),

    #[error("A graphics pipeline needs at least a vertex and a fragment stage, got {found}")]
    InsufficientStages { found: usize },

    #[error("Pipeline state '{0}' was never configured")]
    IncompleteState(&'static str),

    #[error("Pipeline consumes vertex attributes but no vertex buffer was bound")]
    NullBufferBind,

    #[error("Shader {path:?}: {reason}")]
    Shader { path: PathBuf, reason: String },

    #[error("Queue submission failed: {0}")]
    Submit(vk::Result),

    #[error("Presentation failed: {0}")]
    Present(vk::Result),

    #[error("Acquired image {index} but the swapchain only has {count}")]
    ImageIndexOutOfRange { index: u32, count: usize },
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;
