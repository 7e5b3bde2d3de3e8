// Graphics pipeline creation and management
//
// The graphics pipeline defines how vertices are processed and rasterized.
// Every fixed-function stage has to be configured on the builder before
// `initialize`; missing stages are reported, never defaulted.

use ash::vk;
use std::sync::Arc;

use super::error::{BackendError, BackendResult};
use super::shader::{ShaderKind, ShaderStage};
use super::VulkanDevice;

const ENTRY_POINT: &std::ffi::CStr = c"main";

/// One attribute inside an interleaved vertex
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: vk::Format,
    pub offset: u32,
    pub size: u32,
}

/// Interleaved vertex layout for a single binding
///
/// Attributes are packed back to back, so the stride is the sum of their
/// sizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexLayout {
    pub binding: u32,
    pub stride: u32,
    pub attributes: Vec<VertexAttribute>,
}

impl VertexLayout {
    pub fn new(binding: u32) -> Self {
        Self {
            binding,
            stride: 0,
            attributes: Vec::new(),
        }
    }

    pub fn attribute(mut self, location: u32, format: vk::Format, size: u32) -> Self {
        self.attributes.push(VertexAttribute {
            location,
            format,
            offset: self.stride,
            size,
        });
        self.stride += size;
        self
    }

    pub fn binding_description(&self) -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: self.binding,
            stride: self.stride,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    pub fn attribute_descriptions(&self) -> Vec<vk::VertexInputAttributeDescription> {
        self.attributes
            .iter()
            .map(|attr| vk::VertexInputAttributeDescription {
                location: attr.location,
                binding: self.binding,
                format: attr.format,
                offset: attr.offset,
            })
            .collect()
    }
}

/// Fixed viewport + scissor pair covering a whole target
#[derive(Debug, Clone, Copy)]
struct ViewportState {
    viewport: vk::Viewport,
    scissor: vk::Rect2D,
}

/// A programmable stage the builder can hand to the driver
pub trait PipelineStage {
    fn kind(&self) -> ShaderKind;
    fn module(&self) -> vk::ShaderModule;
}

impl PipelineStage for ShaderStage {
    fn kind(&self) -> ShaderKind {
        self.kind
    }

    fn module(&self) -> vk::ShaderModule {
        self.module
    }
}

/// Collects pipeline state one stage at a time
///
/// Owns its shader stages, so they are released whether the builder is
/// rejected, abandoned or initialized.
pub struct PipelineBuilder<S: PipelineStage = ShaderStage> {
    stages: Vec<S>,
    vertex_input: Option<VertexLayout>,
    input_assembly: Option<vk::PipelineInputAssemblyStateCreateInfo>,
    viewport: Option<ViewportState>,
    rasterization: Option<vk::PipelineRasterizationStateCreateInfo>,
    multisample: Option<vk::PipelineMultisampleStateCreateInfo>,
    color_blend: Option<vk::PipelineColorBlendAttachmentState>,
}

/// Borrowed view of a builder with every stage present
struct CompleteState<'a> {
    vertex_input: &'a VertexLayout,
    input_assembly: &'a vk::PipelineInputAssemblyStateCreateInfo,
    viewport: &'a ViewportState,
    rasterization: &'a vk::PipelineRasterizationStateCreateInfo,
    multisample: &'a vk::PipelineMultisampleStateCreateInfo,
    color_blend: &'a vk::PipelineColorBlendAttachmentState,
}

impl<S: PipelineStage> PipelineBuilder<S> {
    /// Start a pipeline from its programmable stages
    ///
    /// At least a vertex and a fragment stage are required.
    pub fn new(stages: Vec<S>) -> BackendResult<Self> {
        if stages.len() < 2 {
            return Err(BackendError::InsufficientStages {
                found: stages.len(),
            });
        }

        Ok(Self {
            stages,
            vertex_input: None,
            input_assembly: None,
            viewport: None,
            rasterization: None,
            multisample: None,
            color_blend: None,
        })
    }

    pub fn setup_vertex_stage(mut self, layout: VertexLayout) -> Self {
        self.vertex_input = Some(layout);
        self
    }

    pub fn setup_input_assembly(mut self, topology: vk::PrimitiveTopology) -> Self {
        self.input_assembly = Some(
            vk::PipelineInputAssemblyStateCreateInfo::builder()
                .topology(topology)
                .primitive_restart_enable(false)
                .build(),
        );
        self
    }

    /// Viewport and scissor both span the full extent, depth range [0, 1]
    pub fn setup_viewport(mut self, extent: vk::Extent2D) -> Self {
        self.viewport = Some(ViewportState {
            viewport: vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            },
            scissor: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            },
        });
        self
    }

    pub fn setup_rasterization(mut self) -> Self {
        self.rasterization = Some(
            vk::PipelineRasterizationStateCreateInfo::builder()
                .depth_clamp_enable(false)
                .rasterizer_discard_enable(false)
                .polygon_mode(vk::PolygonMode::FILL)
                .line_width(1.0)
                .cull_mode(vk::CullModeFlags::BACK)
                .front_face(vk::FrontFace::CLOCKWISE)
                .depth_bias_enable(false)
                .build(),
        );
        self
    }

    pub fn setup_multisample(
        mut self,
        samples: vk::SampleCountFlags,
        sample_shading: bool,
    ) -> Self {
        self.multisample = Some(
            vk::PipelineMultisampleStateCreateInfo::builder()
                .rasterization_samples(samples)
                .sample_shading_enable(sample_shading)
                .min_sample_shading(1.0)
                .build(),
        );
        self
    }

    /// Straight overwrite when `enabled` is false, alpha blending otherwise
    pub fn setup_color_blend(mut self, enabled: bool) -> Self {
        self.color_blend = Some(
            vk::PipelineColorBlendAttachmentState::builder()
                .color_write_mask(vk::ColorComponentFlags::RGBA)
                .blend_enable(enabled)
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
                .alpha_blend_op(vk::BlendOp::ADD)
                .build(),
        );
        self
    }

    fn complete_state(&self) -> BackendResult<CompleteState<'_>> {
        Ok(CompleteState {
            vertex_input: self
                .vertex_input
                .as_ref()
                .ok_or(BackendError::IncompleteState("vertex input"))?,
            input_assembly: self
                .input_assembly
                .as_ref()
                .ok_or(BackendError::IncompleteState("input assembly"))?,
            viewport: self
                .viewport
                .as_ref()
                .ok_or(BackendError::IncompleteState("viewport"))?,
            rasterization: self
                .rasterization
                .as_ref()
                .ok_or(BackendError::IncompleteState("rasterization"))?,
            multisample: self
                .multisample
                .as_ref()
                .ok_or(BackendError::IncompleteState("multisample"))?,
            color_blend: self
                .color_blend
                .as_ref()
                .ok_or(BackendError::IncompleteState("color blend"))?,
        })
    }

    /// Create the pipeline layout and pipeline
    ///
    /// Consumes the builder. The shader stages are dropped whatever the
    /// outcome, so they cannot be reused afterwards.
    pub fn initialize(
        self,
        device: &Arc<VulkanDevice>,
        render_pass: vk::RenderPass,
    ) -> BackendResult<Pipeline> {
        let result = self.create(device, render_pass);
        drop(self);
        result
    }

    fn create(
        &self,
        device: &Arc<VulkanDevice>,
        render_pass: vk::RenderPass,
    ) -> BackendResult<Pipeline> {
        let state = self.complete_state()?;

        let shader_stages: Vec<_> = self
            .stages
            .iter()
            .map(|stage| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(stage.kind().stage_flags())
                    .module(stage.module())
                    .name(ENTRY_POINT)
                    .build()
            })
            .collect();

        let binding = [state.vertex_input.binding_description()];
        let attributes = state.vertex_input.attribute_descriptions();
        let bindings: &[vk::VertexInputBindingDescription] =
            if attributes.is_empty() { &[] } else { &binding };
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(bindings)
            .vertex_attribute_descriptions(&attributes);

        let viewports = [state.viewport.viewport];
        let scissors = [state.viewport.scissor];
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewports(&viewports)
            .scissors(&scissors);

        let color_blend_attachments = [*state.color_blend];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .logic_op(vk::LogicOp::COPY)
            .attachments(&color_blend_attachments)
            .blend_constants([0.0; 4]);

        // No descriptor sets and no push constants
        let layout_info = vk::PipelineLayoutCreateInfo::builder();
        let layout = unsafe { device.device.create_pipeline_layout(&layout_info, None) }?;

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(state.input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(state.rasterization)
            .multisample_state(state.multisample)
            .color_blend_state(&color_blending)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(0)
            .build();

        let pipelines = unsafe {
            device
                .device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };

        let pipeline = match pipelines {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => {
                unsafe { device.device.destroy_pipeline_layout(layout, None) };
                return Err(e.into());
            }
        };

        log::info!(
            "Created graphics pipeline ({} stages, {} vertex attributes, stride {})",
            self.stages.len(),
            attributes.len(),
            state.vertex_input.stride
        );

        Ok(Pipeline {
            pipeline,
            layout,
            vertex_attribute_count: attributes.len(),
            device: Arc::clone(device),
        })
    }
}

/// An initialized graphics pipeline and its layout
pub struct Pipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    vertex_attribute_count: usize,
    device: Arc<VulkanDevice>,
}

impl Pipeline {
    /// Number of vertex attributes the pipeline pulls from binding 0
    pub fn vertex_attribute_count(&self) -> usize {
        self.vertex_attribute_count
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        log::debug!("Destroying graphics pipeline");
        unsafe {
            self.device.device.destroy_pipeline(self.pipeline, None);
            self.device.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}
