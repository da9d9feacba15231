// =============================================================================
// VKGFX DEMO - Clear + triangle through the backend abstraction
// =============================================================================
//
// Two modes, picked by `graphics.offscreen` in config.toml:
// - offscreen: renders `graphics.frames` frames into a capture buffer and,
//   with `debug.debug_capture`, writes the last one to capture.ppm
// - onscreen: opens a winit window, hands its raw handles to the context and
//   renders until closed, forwarding resizes to the context
//
// The triangle is drawn only when build.rs managed to compile the shaders;
// otherwise frames are clear-only.
//
// =============================================================================

use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;
use vkgfx::backend::context::capture_buffer_size;
use vkgfx::backend::pipeline::{
    AttributeDesc, AttributeRate, GraphicsParams, PipelineType, Topology, UniformBlock,
    UniformField,
};
use vkgfx::backend::program::spirv_from_bytes;
use vkgfx::backend::{
    self, BackendResult, Buffer, BufferUsage, Format, GraphicsContext, Pipeline, PipelineParams,
    Program, Recording, ShaderStage, VulkanContext, WindowHandles,
};
use vkgfx::config::Config;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

const VERTEX_SHADER: &str = "shaders/triangle.vert.spv";
const FRAGMENT_SHADER: &str = "shaders/triangle.frag.spv";

const TRIANGLE: [f32; 6] = [0.0, -0.5, 0.5, 0.5, -0.5, 0.5];

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting vkgfx demo");

    if config.graphics.offscreen {
        run_offscreen(&config)
    } else {
        let event_loop = EventLoop::new()?;
        let mut app = App::new(config);
        event_loop.run_app(&mut app)?;
        Ok(())
    }
}

/// Level from config.toml, RUST_LOG takes precedence
fn init_logging(config: &Config) {
    use env_logger::Builder;
    use log::LevelFilter;

    let level = config
        .debug
        .log_level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::Info);

    Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

// =============================================================================
// SCENE
// =============================================================================

/// One triangle with an animated color uniform.
struct Scene {
    pipeline: Pipeline,
    color: Option<u32>,
}

impl Scene {
    fn load(ctx: &VulkanContext) -> Result<Option<Self>> {
        let (Ok(vert), Ok(frag)) = (fs::read(VERTEX_SHADER), fs::read(FRAGMENT_SHADER)) else {
            log::warn!("Compiled shaders not found, rendering clear-only frames");
            return Ok(None);
        };
        let vert = spirv_from_bytes(&vert).context("Invalid vertex shader")?;
        let frag = spirv_from_bytes(&frag).context("Invalid fragment shader")?;

        let program = Rc::new(Program::from_spirv(
            ctx.device(),
            &[
                (ShaderStage::Vertex, vert.as_slice()),
                (ShaderStage::Fragment, frag.as_slice()),
            ],
            None,
        )?);

        let bytes: Vec<u8> = TRIANGLE.iter().flat_map(|v| v.to_ne_bytes()).collect();
        let vertices = Rc::new(Buffer::new(ctx.device(), bytes.len(), BufferUsage::VERTEX)?);
        vertices.upload(&bytes, 0)?;

        let mut pipeline = Pipeline::new(
            ctx.device(),
            ctx.frames_in_flight(),
            PipelineParams {
                pipeline_type: PipelineType::Graphics,
                program,
                graphics: GraphicsParams {
                    topology: Topology::TriangleList,
                    state: Default::default(),
                    rt_desc: ctx.default_rendertarget_desc(),
                },
                attributes: vec![AttributeDesc {
                    name: "position".to_string(),
                    location: 0,
                    format: Format::R32G32Sfloat,
                    stride: 8,
                    offset: 0,
                    rate: AttributeRate::Vertex,
                }],
                buffers: Vec::new(),
                textures: Vec::new(),
                uniform_blocks: [
                    None,
                    Some(UniformBlock {
                        name: "FragUniforms".to_string(),
                        binding: 0,
                        size: 16,
                        fields: vec![UniformField {
                            name: "color".to_string(),
                            offset: 0,
                            size: 16,
                        }],
                    }),
                    None,
                ],
            },
        )?;

        let position = pipeline
            .attribute_index("position")
            .context("Pipeline lost the position attribute")?;
        pipeline.update_attribute(position, Some(vertices))?;
        let color = pipeline.uniform_index("color");

        log::info!("Scene loaded");
        Ok(Some(Self { pipeline, color }))
    }

    fn draw(&mut self, rec: &mut Recording, t: f64) -> BackendResult<()> {
        if let Some(color) = self.color {
            let phase = t as f32;
            let rgba = [
                0.5 + 0.5 * phase.sin(),
                0.5 + 0.5 * (phase + 2.0).sin(),
                0.5 + 0.5 * (phase + 4.0).sin(),
                1.0f32,
            ];
            let bytes: Vec<u8> = rgba.iter().flat_map(|v| v.to_ne_bytes()).collect();
            self.pipeline.update_uniform(color, &bytes)?;
        }
        self.pipeline.draw(rec, 3, 1)
    }
}

/// Draws the scene, skipping it on non-fatal errors.
fn render_frame(ctx: &mut VulkanContext, scene: Option<&mut Scene>, t: f64) -> BackendResult<()> {
    let mut frame = ctx.begin_frame(t)?;
    if let Some(scene) = scene {
        match scene.draw(&mut frame, t) {
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => log::warn!("Scene draw skipped: {}", e),
            Ok(()) => {}
        }
    }
    ctx.end_frame(frame, t)
}

// =============================================================================
// OFFSCREEN
// =============================================================================

fn run_offscreen(config: &Config) -> Result<()> {
    let mut ctx = backend::create_context(config.context_config()?)?;
    let size = capture_buffer_size(ctx.width(), ctx.height());
    ctx.set_capture_buffer(Some(vec![0; size]))?;

    let mut scene = Scene::load(&ctx)?;
    let start = Instant::now();
    let frames = config.graphics.frames.max(1);
    for _ in 0..frames {
        let t = start.elapsed().as_secs_f64();
        render_frame(&mut ctx, scene.as_mut(), t)?;
    }
    log::info!("Rendered {} offscreen frame(s)", frames);

    if ctx.debug_capture() {
        if let Some(pixels) = ctx.capture_buffer() {
            write_ppm(Path::new("capture.ppm"), ctx.width(), ctx.height(), pixels)?;
        }
    }
    Ok(())
}

/// Writes RGBA8 pixels as a binary PPM, dropping alpha
fn write_ppm(path: &Path, width: u32, height: u32, rgba: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path)
        .with_context(|| format!("Failed to create {:?}", path))?;
    write!(file, "P6\n{} {}\n255\n", width, height)?;
    let rgb: Vec<u8> = rgba
        .chunks_exact(4)
        .flat_map(|px| [px[0], px[1], px[2]])
        .collect();
    file.write_all(&rgb)?;
    log::info!("Capture written to {:?}", path);
    Ok(())
}

// =============================================================================
// ONSCREEN APPLICATION
// =============================================================================

/// Field order matters for Drop: the scene's pipeline goes before the
/// context, and the window outlives the surface created from it.
struct App {
    config: Config,
    scene: Option<Scene>,
    context: Option<VulkanContext>,
    window: Option<Arc<Window>>,
    is_minimized: bool,
    start: Instant,
    frame_count: u32,
    last_fps_update: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let now = Instant::now();
        Self {
            config,
            scene: None,
            context: None,
            window: None,
            is_minimized: false,
            start: now,
            frame_count: 0,
            last_fps_update: now,
        }
    }

    fn init_context(&mut self, window: &Window) -> Result<()> {
        use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

        let handles = WindowHandles {
            display: window
                .display_handle()
                .context("Failed to get display handle")?
                .as_raw(),
            window: window
                .window_handle()
                .context("Failed to get window handle")?
                .as_raw(),
        };

        let size = window.inner_size();
        let mut ctx_config = self.config.context_config()?;
        ctx_config.width = size.width.max(1);
        ctx_config.height = size.height.max(1);
        ctx_config.window = Some(handles);

        let context = backend::create_context(ctx_config)?;
        self.scene = Scene::load(&context)?;
        self.context = Some(context);
        Ok(())
    }

    fn update_fps(&mut self) {
        self.frame_count += 1;
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed < 1.0 {
            return;
        }
        if let Some(ref window) = self.window {
            let fps = self.frame_count as f32 / elapsed;
            window.set_title(&format!("{} - {:.0} FPS", self.config.window.title, fps));
        }
        self.frame_count = 0;
        self.last_fps_update = now;
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_context(&window) {
            log::error!("Failed to initialize graphics context: {:#}", e);
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                if let Some(ref ctx) = self.context {
                    let _ = ctx.wait_idle();
                }
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                self.is_minimized = size.width == 0 || size.height == 0;
                if self.is_minimized {
                    return;
                }
                if let Some(ref mut ctx) = self.context {
                    if let Err(e) = ctx.resize(size.width, size.height, None) {
                        log::error!("Resize failed: {}", e);
                    }
                }
            }

            WindowEvent::RedrawRequested => {
                if self.is_minimized {
                    return;
                }
                let Some(ctx) = self.context.as_mut() else {
                    return;
                };
                let t = self.start.elapsed().as_secs_f64();
                match render_frame(ctx, self.scene.as_mut(), t) {
                    Ok(()) => self.update_fps(),
                    Err(e) if e.is_fatal() => {
                        log::error!("Fatal render error: {}", e);
                        event_loop.exit();
                    }
                    Err(e) => log::warn!("Frame skipped: {}", e),
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed()
                    && event.physical_key == PhysicalKey::Code(KeyCode::Escape)
                {
                    log::info!("ESC pressed, exiting...");
                    event_loop.exit();
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}
