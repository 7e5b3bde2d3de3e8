// Shader modules
//
// GLSL is compiled offline by build.rs into `<source>.spv` next to the
// source. When that file is missing we shell out to glslc at start-up.

use ash::vk;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use super::error::{BackendError, BackendResult};
use super::VulkanDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderKind {
    Vertex,
    Fragment,
}

impl ShaderKind {
    pub fn stage_flags(self) -> vk::ShaderStageFlags {
        match self {
            ShaderKind::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderKind::Fragment => vk::ShaderStageFlags::FRAGMENT,
        }
    }

    /// Value for glslc's `-fshader-stage=`
    fn glslc_stage(self) -> &'static str {
        match self {
            ShaderKind::Vertex => "vert",
            ShaderKind::Fragment => "frag",
        }
    }
}

/// Where build.rs leaves the compiled module for `source`
pub fn spirv_path(source: &Path) -> PathBuf {
    let mut name = source.as_os_str().to_owned();
    name.push(".spv");
    PathBuf::from(name)
}

/// Turn a GLSL source into SPIR-V words
pub fn compile(source: &Path, kind: ShaderKind) -> BackendResult<Vec<u32>> {
    let shader_error = |reason: String| BackendError::Shader {
        path: source.to_path_buf(),
        reason,
    };

    let precompiled = spirv_path(source);
    let bytes = if precompiled.exists() {
        log::debug!("Loading precompiled shader {:?}", precompiled);
        std::fs::read(&precompiled).map_err(|e| shader_error(e.to_string()))?
    } else {
        log::info!("Compiling {:?} with glslc", source);
        let output = Command::new("glslc")
            .arg(format!("-fshader-stage={}", kind.glslc_stage()))
            .arg(source)
            .arg("-o")
            .arg("-")
            .output()
            .map_err(|e| shader_error(format!("glslc unavailable: {}", e)))?;

        if !output.status.success() {
            return Err(shader_error(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        output.stdout
    };

    ash::util::read_spv(&mut Cursor::new(bytes)).map_err(|e| shader_error(e.to_string()))
}

pub fn create_shader_module(device: &VulkanDevice, code: &[u32]) -> BackendResult<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(code);
    let module = unsafe { device.device.create_shader_module(&create_info, None) }?;
    Ok(module)
}

/// A compiled stage waiting to be handed to a pipeline builder
///
/// The module lives until the stage is dropped. A pipeline only needs it
/// while it is being created.
pub struct ShaderStage {
    pub kind: ShaderKind,
    pub module: vk::ShaderModule,
    device: Arc<VulkanDevice>,
}

impl ShaderStage {
    pub fn load(device: &Arc<VulkanDevice>, source: &Path, kind: ShaderKind) -> BackendResult<Self> {
        let code = compile(source, kind)?;
        let module = create_shader_module(device, &code)?;
        log::debug!("Shader module ready: {:?} ({:?})", source, kind);
        Ok(Self {
            kind,
            module,
            device: Arc::clone(device),
        })
    }
}

impl Drop for ShaderStage {
    fn drop(&mut self) {
        log::trace!("Destroying {:?} shader module", self.kind);
        unsafe { self.device.device.destroy_shader_module(self.module, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "triangle-renderer-{}-{}",
            name,
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn stage_flags_per_kind() {
        assert_eq!(ShaderKind::Vertex.stage_flags(), vk::ShaderStageFlags::VERTEX);
        assert_eq!(ShaderKind::Fragment.stage_flags(), vk::ShaderStageFlags::FRAGMENT);
        assert_eq!(ShaderKind::Vertex.glslc_stage(), "vert");
        assert_eq!(ShaderKind::Fragment.glslc_stage(), "frag");
    }

    #[test]
    fn stages_release_their_module_on_drop() {
        // A plain handle would need no drop glue and leak on early returns
        assert!(std::mem::needs_drop::<ShaderStage>());
        assert!(std::mem::needs_drop::<Vec<ShaderStage>>());
    }

    #[test]
    fn spirv_sits_next_to_source() {
        assert_eq!(
            spirv_path(Path::new("shaders/triangle.vert")),
            PathBuf::from("shaders/triangle.vert.spv")
        );
    }

    #[test]
    fn precompiled_module_is_preferred() {
        let dir = scratch_dir("precompiled");
        let source = dir.join("pass.vert");
        std::fs::write(&source, "not glsl at all").unwrap();

        let words = [SPIRV_MAGIC, 0x0001_0000, 0, 1, 0];
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        std::fs::write(spirv_path(&source), bytes).unwrap();

        let code = compile(&source, ShaderKind::Vertex).unwrap();
        assert_eq!(code, words);

        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn truncated_module_is_a_shader_error() {
        let dir = scratch_dir("truncated");
        let source = dir.join("broken.frag");
        std::fs::write(spirv_path(&source), [0x03u8, 0x02, 0x23]).unwrap();

        let err = compile(&source, ShaderKind::Fragment).unwrap_err();
        assert!(matches!(err, BackendError::Shader { ref path, .. } if path == &source));

        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn missing_source_is_a_shader_error() {
        let source = Path::new("definitely/not/here.vert");
        assert!(matches!(
            compile(source, ShaderKind::Vertex),
            Err(BackendError::Shader { .. })
        ));
    }
}
