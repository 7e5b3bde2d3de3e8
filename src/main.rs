// =============================================================================
// TRIANGLE RENDERER - Vulkan frame loop with frames in flight
// =============================================================================
//
// Draws one static triangle. The interesting part is the frame loop: up to
// `max_frames_in_flight` frames are queued on the GPU while the CPU records
// nothing, since every swapchain image has a pre-recorded command buffer.
//
// SET-UP ORDER:
//   instance -> surface -> device -> swapchain -> render pass -> pipeline
//   -> framebuffers -> vertex buffer -> command buffers -> frame slots
//
// FRAME FLOW (see backend::frame):
//   wait slot fence -> acquire image -> wait image owner -> submit -> present
//
// =============================================================================

mod backend;
mod config;

use anyhow::{Context, Result};
use ash::vk;
use backend::buffer::{upload_vertex_buffer, Buffer};
use backend::command::{record_draw_commands, CommandPool};
use backend::frame::{FrameReport, FrameSynchronizer, VulkanFrameQueue};
use backend::framebuffer::{FrameTargets, RenderPass};
use backend::pipeline::{Pipeline, PipelineBuilder, VertexLayout};
use backend::shader::{ShaderKind, ShaderStage};
use backend::surface::Surface;
use backend::sync::FrameSlot;
use backend::{BackendResult, Swapchain, VulkanDevice, VulkanInstance};
use config::Config;
use glam::{Vec2, Vec4};
use raw_window_handle::HasDisplayHandle;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Window, WindowAttributes, WindowId},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let (config, load_error) = Config::load_or_default("config.toml");

    init_logging(&config);
    if let Some(e) = load_error {
        log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
    }
    log::info!("Starting triangle renderer");
    log::info!(
        "Window: {}x{}, present mode: {}, frames in flight: {}",
        config.window.width,
        config.window.height,
        config.graphics.present_mode,
        config.frames_in_flight()
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    match app.fatal.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// `RUST_LOG` overrides the configured level; with `log_to_file` the
/// output goes to a fresh log file instead of stderr
fn init_logging(config: &Config) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(config.log_level());
    builder.parse_default_env();

    if config.debug.log_to_file {
        match std::fs::File::create(&config.debug.log_file) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => {
                eprintln!(
                    "Cannot open log file {}: {}, logging to stderr",
                    config.debug.log_file, e
                );
            }
        }
    }

    builder.init();
}

// =============================================================================
// SCENE DATA
// =============================================================================

/// Interleaved vertex as the vertex shader reads it
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Vertex {
    pos: [f32; 2],
    color: [f32; 4],
}

impl Vertex {
    fn new(pos: Vec2, color: Vec4) -> Self {
        Self {
            pos: pos.to_array(),
            color: color.to_array(),
        }
    }

    fn layout() -> VertexLayout {
        VertexLayout::new(0)
            .attribute(0, vk::Format::R32G32_SFLOAT, std::mem::size_of::<[f32; 2]>() as u32)
            .attribute(1, vk::Format::R32G32B32A32_SFLOAT, std::mem::size_of::<[f32; 4]>() as u32)
    }
}

/// Clockwise in framebuffer space (y points down)
fn triangle() -> [Vertex; 3] {
    [
        Vertex::new(Vec2::new(0.0, -0.5), Vec4::new(1.0, 0.0, 0.0, 1.0)),
        Vertex::new(Vec2::new(0.5, 0.5), Vec4::new(0.0, 1.0, 0.0, 1.0)),
        Vertex::new(Vec2::new(-0.5, 0.5), Vec4::new(0.0, 0.0, 1.0, 1.0)),
    ]
}

// =============================================================================
// RENDERER
// =============================================================================

/// Every GPU object the frame loop touches.
///
/// IMPORTANT: fields drop in declaration order, so they are listed in
/// reverse order of creation. `Drop` waits for the GPU first.
struct Renderer {
    synchronizer: FrameSynchronizer,
    frame_slots: Vec<FrameSlot>,
    /// One per swapchain image, freed with the pool
    command_buffers: Vec<vk::CommandBuffer>,
    _command_pool: CommandPool,
    _vertex_buffer: Buffer,
    _frame_targets: FrameTargets,
    _pipeline: Pipeline,
    _render_pass: RenderPass,
    swapchain: Swapchain,
    device: Arc<VulkanDevice>,
    _surface: Surface,
    _instance: Arc<VulkanInstance>,
}

impl Renderer {
    fn new(window: &Window, config: &Config) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        let display = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();

        let instance = VulkanInstance::new(&config.window.title, display, config.debug_messenger())
            .context("Failed to create Vulkan instance")?;
        let surface =
            Surface::new(Arc::clone(&instance), window).context("Failed to create surface")?;
        let device = VulkanDevice::new(Arc::clone(&instance), &surface)
            .context("Failed to select a GPU")?;

        let size = window.inner_size();
        let swapchain = Swapchain::new(
            Arc::clone(&device),
            &surface,
            (size.width, size.height),
            config.present_mode(),
        )
        .context("Failed to create swapchain")?;

        let render_pass = RenderPass::new(Arc::clone(&device), swapchain.format)?;

        let stages = load_shader_stages(&device, config)?;
        let pipeline = PipelineBuilder::new(stages)?
            .setup_vertex_stage(Vertex::layout())
            .setup_input_assembly(vk::PrimitiveTopology::TRIANGLE_LIST)
            .setup_viewport(swapchain.extent)
            .setup_rasterization()
            .setup_multisample(vk::SampleCountFlags::TYPE_1, false)
            .setup_color_blend(false)
            .initialize(&device, render_pass.render_pass)
            .context("Failed to build graphics pipeline")?;

        let frame_targets = FrameTargets::new(Arc::clone(&device), &swapchain, &render_pass)?;

        let vertex_buffer =
            upload_vertex_buffer(&device, &triangle()).context("Failed to upload vertices")?;

        let command_pool = CommandPool::new(Arc::clone(&device), vk::CommandPoolCreateFlags::empty())?;
        let command_buffers = record_draw_commands(
            &command_pool,
            &render_pass,
            &pipeline,
            &frame_targets,
            Some(vertex_buffer.buffer),
            config.graphics.clear_color,
        )?;

        let frame_slots = FrameSlot::create_slots(&device, config.frames_in_flight())?;
        let synchronizer = FrameSynchronizer::new(frame_slots.len(), swapchain.image_count());

        log::info!(
            "Vulkan initialized: {} swapchain images, {:?}, {} frames in flight",
            swapchain.image_count(),
            swapchain.present_mode,
            frame_slots.len()
        );

        Ok(Self {
            synchronizer,
            frame_slots,
            command_buffers,
            _command_pool: command_pool,
            _vertex_buffer: vertex_buffer,
            _frame_targets: frame_targets,
            _pipeline: pipeline,
            _render_pass: render_pass,
            swapchain,
            device,
            _surface: surface,
            _instance: instance,
        })
    }

    fn draw_frame(&mut self) -> BackendResult<FrameReport> {
        let mut queue = VulkanFrameQueue {
            device: &self.device,
            swapchain: &self.swapchain,
            slots: &self.frame_slots,
            command_buffers: &self.command_buffers,
        };
        self.synchronizer.draw_frame(&mut queue)
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!(
            "Shutting down after {} frames",
            self.synchronizer.frame_counter()
        );
        // Nothing may be destroyed while the GPU still references it
        if let Err(e) = self.device.wait_idle() {
            log::error!("Failed to wait for device idle: {}", e);
        }
    }
}

fn load_shader_stages(device: &Arc<VulkanDevice>, config: &Config) -> Result<Vec<ShaderStage>> {
    let vertex = ShaderStage::load(device, Path::new(&config.shaders.vertex), ShaderKind::Vertex)
        .context("Failed to load vertex shader")?;
    let fragment =
        ShaderStage::load(device, Path::new(&config.shaders.fragment), ShaderKind::Fragment)
            .context("Failed to load fragment shader")?;

    Ok(vec![vertex, fragment])
}

// =============================================================================
// FPS TRACKING
// =============================================================================

struct FpsCounter {
    frames: u32,
    last_update: Instant,
    last_frame: Instant,
}

impl FpsCounter {
    const INTERVAL: Duration = Duration::from_secs(1);

    fn new(now: Instant) -> Self {
        Self {
            frames: 0,
            last_update: now,
            last_frame: now,
        }
    }

    /// Count a frame; once per interval returns (fps, last frame time in ms)
    fn tick(&mut self, now: Instant) -> Option<(f32, f32)> {
        let frame_ms = now.duration_since(self.last_frame).as_secs_f32() * 1000.0;
        self.last_frame = now;
        self.frames += 1;

        let elapsed = now.duration_since(self.last_update);
        if elapsed < Self::INTERVAL {
            return None;
        }

        let fps = self.frames as f32 / elapsed.as_secs_f32();
        self.frames = 0;
        self.last_update = now;
        Some((fps, frame_ms))
    }
}

// =============================================================================
// APPLICATION
// =============================================================================

struct App {
    config: Config,
    // Dropped before the window it renders to
    renderer: Option<Renderer>,
    window: Option<Arc<Window>>,
    fps: FpsCounter,
    /// Error that stopped the event loop, returned from main
    fatal: Option<anyhow::Error>,
}

impl App {
    fn new(config: Config) -> Self {
        Self {
            config,
            renderer: None,
            window: None,
            fps: FpsCounter::new(Instant::now()),
            fatal: None,
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:#}", error);
        self.fatal = Some(error);
        event_loop.exit();
    }

    fn render_frame(&mut self, event_loop: &ActiveEventLoop) {
        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };

        match renderer.draw_frame() {
            Ok(report) => {
                log::trace!("{:?}", report);
                self.update_fps();
            }
            Err(e) => {
                let error = anyhow::Error::new(e).context("Frame loop stopped");
                self.fail(event_loop, error);
            }
        }
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }
        if let Some((fps, frame_ms)) = self.fps.tick(Instant::now()) {
            if let Some(ref window) = self.window {
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms)",
                    self.config.window.title, fps, frame_ms
                ));
            }
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        // No swapchain recreation, so the size is fixed
        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ))
            .with_resizable(false);

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };

        match Renderer::new(&window, &self.config) {
            Ok(renderer) => {
                self.renderer = Some(renderer);
                self.window = Some(window);
                self.fps = FpsCounter::new(Instant::now());
            }
            Err(e) => self.fail(event_loop, e),
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }
            WindowEvent::KeyboardInput { event, .. } => {
                if event.state.is_pressed()
                    && event.physical_key == PhysicalKey::Code(KeyCode::Escape)
                {
                    log::info!("ESC pressed, exiting...");
                    event_loop.exit();
                }
            }
            WindowEvent::RedrawRequested => self.render_frame(event_loop),
            _ => {}
        }
    }

    /// Keep redrawing as fast as the present mode allows
    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if event_loop.exiting() {
            return;
        }
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        // Renderer waits for the GPU before releasing anything
        self.renderer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_matches_struct() {
        let layout = Vertex::layout();
        assert_eq!(layout.stride as usize, std::mem::size_of::<Vertex>());
        assert_eq!(layout.attributes[0].offset as usize, std::mem::offset_of!(Vertex, pos));
        assert_eq!(layout.attributes[1].offset as usize, std::mem::offset_of!(Vertex, color));
    }

    #[test]
    fn triangle_winds_clockwise_on_screen() {
        let [a, b, c] = triangle().map(|v| Vec2::from_array(v.pos));
        // Positive with y down means clockwise as seen on screen
        let cross = (b - a).perp_dot(c - a);
        assert!(cross > 0.0);
        assert!(triangle().iter().all(|v| v.color[3] == 1.0));
    }

    #[test]
    fn fps_reported_once_per_second() {
        let start = Instant::now();
        let mut fps = FpsCounter::new(start);

        for i in 1..60 {
            assert!(fps.tick(start + Duration::from_millis(i * 16)).is_none());
        }

        let (rate, frame_ms) = fps.tick(start + Duration::from_millis(1000)).unwrap();
        assert!((rate - 60.0).abs() < 0.01);
        assert!((frame_ms - 56.0).abs() < 0.01);

        assert!(fps.tick(start + Duration::from_millis(1016)).is_none());
    }
}
