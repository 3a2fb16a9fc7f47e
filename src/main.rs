// =============================================================================
// MIX-GFX DEMO - window, backend and a pulsing clear renderer
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit event loop                                               │
// │    └── GraphicsBackend (Vulkan or headless, from config.toml)   │
// │          └── PulseRenderer (ParamBlock driven clear colour)     │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Poll config.toml for changes (hot reload)
// 2. update(): wait for the slot, renderer writes its ParamBlock
// 3. render(): acquire, record, submit, present
// 4. Rebuild the swapchain on resize / out-of-date
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use glam::Vec4;
use mix_gfx::backend::{ParamBlock, PresentTarget, SwapchainSettings};
use mix_gfx::config::{Config, ConfigWatcher};
use mix_gfx::{BackendError, BackendServices, FrameContext, FrameStatus, GraphicsBackend, Renderer};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

const CONFIG_PATH: &str = "config.toml";

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting mix-gfx ({} backend)", config.graphics.backend);
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Present modes: {:?}", config.graphics.present_modes);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Initialize logging with optional file output for validation errors
fn init_logging(config: &Config) {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);
    builder.init();

    // Create/clear log file if enabled
    if config.debug.log_to_file {
        let header = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
            .and_then(|mut file| {
                writeln!(file, "=== mix-gfx log ===")?;
                writeln!(file, "Started: {:?}", std::time::SystemTime::now())?;
                writeln!(file)
            });
        if let Err(err) = header {
            log::warn!("Could not prepare log file {:?}: {}", config.debug.log_file, err);
        }
    }
}

// =============================================================================
// DEMO RENDERER
// =============================================================================

/// Clears every frame to the backend clear colour, scaled by a slow pulse.
/// The pulse lives in a ParamBlock so the GPU copy follows the CPU one.
struct PulseRenderer {
    params: Option<ParamBlock>,
    started: Instant,
}

impl PulseRenderer {
    fn new() -> Self {
        Self {
            params: None,
            started: Instant::now(),
        }
    }

    fn params(&mut self) -> Result<&mut ParamBlock> {
        self.params.as_mut().context("pulse renderer is not attached")
    }
}

impl Renderer for PulseRenderer {
    fn name(&self) -> &str {
        "pulse"
    }

    fn attach(&mut self, services: &BackendServices<'_>) -> Result<()> {
        let mut params = services.create_param_block(
            std::mem::size_of::<Vec4>(),
            vk::BufferUsageFlags::UNIFORM_BUFFER,
        )?;
        params.write_value(0, &Vec4::ONE)?;
        self.params = Some(params);
        Ok(())
    }

    fn update(&mut self, _slot: usize, services: &BackendServices<'_>) -> Result<()> {
        let t = self.started.elapsed().as_secs_f32();
        let scale = 0.75 + 0.25 * (t * 2.0).sin();
        let params = self.params()?;
        params.write_value(0, &Vec4::new(scale, scale, scale, 1.0))?;
        params.flush_to_gpu(services.allocator)?;
        Ok(())
    }

    fn render(&mut self, frame: &FrameContext, services: &BackendServices<'_>) -> Result<()> {
        let scale: Vec4 = self.params()?.read_value(0)?;
        let color = Vec4::from_array(frame.clear_color) * scale;
        services
            .gpu()?
            .cmd_clear_color_image(frame.command_buffer, frame.image, color.to_array());
        Ok(())
    }

    fn detach(&mut self, services: &BackendServices<'_>) -> Result<()> {
        if let Some(mut params) = self.params.take() {
            params.release(services.allocator)?;
        }
        Ok(())
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

struct App {
    // ─────────────────────────────────────────────────────────────────────────
    // CONFIGURATION
    // ─────────────────────────────────────────────────────────────────────────
    config: Config,
    watcher: Option<ConfigWatcher>,

    // ─────────────────────────────────────────────────────────────────────────
    // WINDOW
    // ─────────────────────────────────────────────────────────────────────────
    window: Option<Arc<Window>>,
    is_fullscreen: bool,

    // ─────────────────────────────────────────────────────────────────────────
    // BACKEND
    // ─────────────────────────────────────────────────────────────────────────
    backend: Option<GraphicsBackend>,
    /// Set on resize, suboptimal or out-of-date - triggers swapchain rebuild
    needs_rebuild: bool,

    // ─────────────────────────────────────────────────────────────────────────
    // FPS TRACKING
    // ─────────────────────────────────────────────────────────────────────────
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let watcher = match ConfigWatcher::new(CONFIG_PATH) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                log::warn!("Config hot reload disabled: {:#}", e);
                None
            }
        };
        let now = Instant::now();
        Self {
            config,
            watcher,
            window: None,
            is_fullscreen,
            backend: None,
            needs_rebuild: false,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    fn init_backend(&mut self, window: Arc<Window>) -> Result<()> {
        let mut backend = GraphicsBackend::for_kind(self.config.graphics.backend)
            .context("Failed to load graphics platform")?;

        let devices = backend.init().context("Failed to enumerate GPUs")?;
        log::info!("Found {} GPU(s)", devices.len());

        let target: Arc<dyn PresentTarget> = window;
        backend
            .build(self.config.backend_config(target))
            .context("Failed to build graphics backend")?;

        let demo = backend.add_renderer(Box::new(PulseRenderer::new()))?;
        backend.set_active_renderer(Some(demo))?;
        log::info!("Active renderer: {}", demo);

        self.backend = Some(backend);
        log::info!("Graphics backend ready");
        Ok(())
    }

    // =========================================================================
    // HOT RELOAD
    // =========================================================================

    fn poll_config(&mut self) -> Result<()> {
        let Some(new) = self.watcher.as_ref().and_then(ConfigWatcher::poll) else {
            return Ok(());
        };
        let effects = self.config.reload_effects(&new);
        log::info!("Config reloaded: {:?}", effects);

        if let Some(backend) = self.backend.as_mut() {
            if let Some(color) = effects.clear_color {
                backend.set_clear_color(color);
            }
            if effects.needs_rebuild {
                backend.update_swapchain_settings(SwapchainSettings {
                    surface_format: vk::SurfaceFormatKHR {
                        format: new.surface_format(),
                        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                    },
                    present_modes: new.present_modes(),
                    image_count: new.graphics.image_count,
                })?;
            }
        }
        if effects.needs_restart {
            log::warn!("Some changed settings only apply after a restart");
        }

        self.config = new;
        Ok(())
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    /// Returns `true` when a frame reached the screen.
    fn draw_frame(&mut self) -> Result<bool> {
        self.poll_config()?;

        let backend = self.backend.as_mut().context("Backend not initialized")?;

        if self.needs_rebuild {
            if !backend.rebuild_swapchain()? {
                // Minimized: the backend retries on the next frame call
                self.needs_rebuild = false;
                return Ok(false);
            }
            self.needs_rebuild = false;
        }

        match backend.update()? {
            FrameStatus::Ready { .. } => {}
            FrameStatus::Timeout => {
                log::warn!("GPU is behind, skipping frame");
                return Ok(false);
            }
            _ => return Ok(false),
        }

        match backend.render()? {
            FrameStatus::Presented { suboptimal, .. } => {
                if suboptimal {
                    self.needs_rebuild = true;
                }
                Ok(true)
            }
            FrameStatus::OutOfDate => {
                self.needs_rebuild = true;
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    fn shutdown(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            log::info!("Rendered {} frames", backend.frame_index());
            backend.teardown();
        }
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }

            self.needs_rebuild = true;
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{}]",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    mode
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_backend(window.clone()) {
            log::error!("Failed to initialize graphics: {:#}", e);
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
                self.shutdown();
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                self.needs_rebuild = true;
            }

            WindowEvent::RedrawRequested => match self.draw_frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) => {
                    log::error!("Render error: {:#}", e);
                    if matches!(e.downcast_ref::<BackendError>(), Some(BackendError::DeviceLost)) {
                        self.shutdown();
                        event_loop.exit();
                    }
                }
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                self.shutdown();
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for App {
    fn drop(&mut self) {
        self.shutdown();
        log::info!("Cleanup complete");
    }
}
