// Debug messenger - driver diagnostics routed into the `log` facade
//
// The messenger settings are a plain value handed to instance creation
// instead of a process-wide callback object.

use ash::vk;
use std::ffi::CStr;

/// Which driver messages reach the callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugMessengerConfig {
    pub severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    pub message_types: vk::DebugUtilsMessageTypeFlagsEXT,
}

impl Default for DebugMessengerConfig {
    fn default() -> Self {
        Self {
            severity: vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            message_types: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        }
    }
}

impl DebugMessengerConfig {
    /// Also forward INFO and VERBOSE driver chatter
    pub fn verbose() -> Self {
        let base = Self::default();
        Self {
            severity: base.severity
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                | vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE,
            ..base
        }
    }

    pub fn create_info(&self) -> vk::DebugUtilsMessengerCreateInfoEXT {
        vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(self.severity)
            .message_type(self.message_types)
            .pfn_user_callback(Some(debug_callback))
            .build()
    }
}

fn severity_level(severity: vk::DebugUtilsMessageSeverityFlagsEXT) -> log::Level {
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::Level::Error
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::Level::Warn
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        log::Level::Info
    } else {
        log::Level::Trace
    }
}

fn category(message_types: vk::DebugUtilsMessageTypeFlagsEXT) -> &'static str {
    if message_types.contains(vk::DebugUtilsMessageTypeFlagsEXT::GENERAL) {
        "GENERAL"
    } else if message_types.contains(vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION) {
        "VALIDATION"
    } else if message_types.contains(vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE) {
        "PERFORMANCE"
    } else {
        "UNKNOWN"
    }
}

// Never asks the layer to abort the call: log and continue.
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() {
        return vk::FALSE;
    }
    let data = &*p_callback_data;

    let message_id = if data.p_message_id_name.is_null() {
        "-".into()
    } else {
        CStr::from_ptr(data.p_message_id_name).to_string_lossy()
    };
    let message = if data.p_message.is_null() {
        "".into()
    } else {
        CStr::from_ptr(data.p_message).to_string_lossy()
    };

    log::log!(
        target: "vulkan",
        severity_level(message_severity),
        "{} [{}] {}",
        category(message_types),
        message_id,
        message
    );

    vk::FALSE
}
