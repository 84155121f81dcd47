// =============================================================================
// GFX ENGINE DEMO - command submission and synchronization in action
// =============================================================================
//
// Drives the graphics device through a plain frame loop:
//
// FRAME FLOW:
// 1. begin_frame()   - acquire a swapchain image (semaphore attached to the
//                      implicit command buffer)
// 2. Record          - transition, clear, transition to PRESENT_SRC
// 3. present()       - submit, bound frames in flight, present
//
// Submission and recycling happen on each command manager's own threads.
//
// MODES:
//   gfx-demo                       windowed, Vulkan backend
//   gfx-demo --headless [--frames N]
//                                  simulated device, plus a worker thread
//                                  recording transfer work on an external pool
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use gfx_engine::backend::command_pool::CommandPool;
use gfx_engine::backend::driver::Driver;
use gfx_engine::backend::headless::HeadlessConfig;
use gfx_engine::backend::memory::{upload_texture, GpuTexture};
use gfx_engine::backend::vulkan::VulkanDriver;
use gfx_engine::backend::VulkanDevice;
use gfx_engine::config::{BackendKind, Config};
use gfx_engine::gfx::GraphicsDevice;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

const DEFAULT_HEADLESS_FRAMES: u32 = 240;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();
    init_logging(&config);

    let mut headless = config.graphics.backend == BackendKind::Headless;
    let mut frames = DEFAULT_HEADLESS_FRAMES;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--headless" => headless = true,
            "--frames" => {
                frames = args
                    .next()
                    .context("--frames needs a value")?
                    .parse()
                    .context("--frames must be a number")?;
            }
            other => anyhow::bail!("Unknown argument: {}", other),
        }
    }

    log::info!("Starting gfx-engine demo");
    log::info!(
        "Frames in flight: {}, recycle timeout: {:?}, frame timeout: {:?}",
        config.graphics.max_frames_in_flight,
        config.recycle_timeout(),
        config.frame_timeout()
    );

    if headless {
        return run_headless(&config, frames);
    }

    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Initialize logging, optionally into the configured log file
fn init_logging(config: &Config) {
    use env_logger::{Builder, Target};
    use log::LevelFilter;

    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    builder.parse_default_env();

    if config.debug.log_to_file {
        match OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "=== gfx-engine log ===");
                let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Cannot open {}: {}", config.debug.log_file, e),
        }
    }

    builder.init();
}

/// Clear a swapchain image through tracked layout transitions
fn record_clear(gfx: &GraphicsDevice, image_index: u32, color: [f32; 4]) -> Result<()> {
    let image = gfx
        .swapchain_image(image_index)
        .cloned()
        .with_context(|| format!("No swapchain image {}", image_index))?;

    let cmd = gfx.command_buffer();
    let mut cmd = cmd.lock();
    cmd.transition_image_layout(&image, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
    cmd.clear_color_image(&image, color);
    cmd.transition_image_layout(&image, vk::ImageLayout::PRESENT_SRC_KHR);
    Ok(())
}

/// Base color pulsing over time
fn pulse(base: [f32; 4], seconds: f32) -> [f32; 4] {
    let t = 0.75 + 0.25 * seconds.sin();
    [base[0] * t, base[1] * t, base[2] * t, base[3]]
}

fn checkerboard(size: u32, cell: u32) -> Vec<u8> {
    let mut pixels = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let on = ((x / cell) + (y / cell)) % 2 == 0;
            let value = if on { 230 } else { 40 };
            pixels.extend_from_slice(&[value, value, value, 255]);
        }
    }
    pixels
}

// =============================================================================
// HEADLESS MODE
// =============================================================================

fn run_headless(config: &Config, frames: u32) -> Result<()> {
    let headless = HeadlessConfig {
        swapchain_extent: vk::Extent2D {
            width: config.window.width,
            height: config.window.height,
        },
        ..HeadlessConfig::default()
    };
    let mut gfx = GraphicsDevice::new(Driver::headless(headless), config)?;

    // A worker records transfer work on its own pool and hands it back
    let worker = {
        let transfer = gfx.transfer_commands().clone();
        thread::Builder::new()
            .name("upload-worker".to_string())
            .spawn(move || -> CommandPool {
                let pool = transfer.request_external_command_pool();
                for _ in 0..frames {
                    // Full pool: wait for the render thread to flush and recycle
                    while pool.free_count() == 0 && pool.allocated_count() >= pool.capacity() {
                        thread::sleep(Duration::from_millis(1));
                    }
                    let buffer = pool.request_primary_command_buffer();
                    {
                        let mut cmd = buffer.lock();
                        cmd.copy_buffer(
                            vk::Buffer::null(),
                            vk::Buffer::null(),
                            &[vk::BufferCopy {
                                src_offset: 0,
                                dst_offset: 0,
                                size: 256,
                            }],
                        );
                        cmd.end_command_buffer();
                    }
                    transfer.return_external_command_buffer(buffer);
                    thread::yield_now();
                }
                pool
            })
            .context("Failed to spawn worker thread")?
    };

    let start = Instant::now();
    for frame in 0..frames {
        let Some(index) = gfx.begin_frame()? else {
            let extent = gfx.swapchain_extent();
            gfx.recreate_swapchain(extent.width, extent.height)?;
            continue;
        };
        record_clear(&gfx, index, pulse(config.graphics.clear_color, frame as f32 / 30.0))?;
        if gfx.present()? {
            let extent = gfx.swapchain_extent();
            gfx.recreate_swapchain(extent.width, extent.height)?;
        }
        if frame % 16 == 15 {
            gfx.flush_commands(false, false)?;
        }
    }

    while !worker.is_finished() {
        gfx.flush_commands(false, false)?;
        thread::sleep(Duration::from_millis(1));
    }
    let pool = worker
        .join()
        .map_err(|_| anyhow::anyhow!("Worker thread panicked"))?;
    gfx.flush_commands(true, false)?;
    gfx.wait_idle()?;
    drop(pool);

    let elapsed = start.elapsed();
    log::info!(
        "Rendered {} headless frames in {:.2?} ({:.0} FPS)",
        frames,
        elapsed,
        frames as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    if let Some(driver) = gfx.driver().as_headless() {
        let stats = driver.stats();
        log::info!(
            "Native calls: {} submits ({} command buffers), {} barriers, {} clears, {} copies, {} presents",
            stats.submits,
            stats.submitted_command_buffers,
            stats.barriers,
            stats.clears,
            stats.copies,
            stats.presents
        );
        log::info!(
            "Pools: {} command buffers allocated, {} semaphores, {} timeline semaphores",
            stats.command_buffers_allocated,
            gfx.sync().semaphore_count(),
            gfx.sync().timeline_semaphore_count()
        );
    }
    Ok(())
}

// =============================================================================
// WINDOWED MODE
// =============================================================================

/// Windowed application state.
///
/// IMPORTANT: Field order matters for Drop! The texture goes before the
/// device, and the device (which owns the surface) before the window.
struct App {
    config: Config,
    texture: Option<GpuTexture>,
    gfx: Option<GraphicsDevice>,
    window: Option<Arc<Window>>,
    is_fullscreen: bool,

    /// Set to true when window is resized - triggers swapchain recreation
    needs_resize: bool,
    /// Set to true when window is minimized (size = 0) - skip rendering
    is_minimized: bool,

    start: Instant,
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            config,
            texture: None,
            gfx: None,
            window: None,
            is_fullscreen,
            needs_resize: false,
            is_minimized: false,
            start: now,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    fn init_vulkan(&mut self, window: &Window) -> Result<()> {
        let device = VulkanDevice::new(
            &self.config.window.title,
            self.config.debug.validation_layers,
            true,
        )?;

        let size = window.inner_size();
        let display_handle = window
            .display_handle()
            .context("Window has no display handle")?
            .as_raw();
        let window_handle = window
            .window_handle()
            .context("Window has no window handle")?
            .as_raw();

        // SAFETY: the window is dropped after the graphics device (see App)
        let driver = unsafe {
            VulkanDriver::with_surface(
                device,
                display_handle,
                window_handle,
                size.width,
                size.height,
                self.config.get_present_mode(),
            )?
        };
        let gfx = GraphicsDevice::new(Driver::Vulkan(driver), &self.config)?;

        let texture = upload_texture(&gfx, "checkerboard", 256, 256, &checkerboard(256, 32))?;
        log::info!(
            "Checkerboard texture ready ({} mip levels)",
            texture.image.mip_levels
        );

        self.texture = Some(texture);
        self.gfx = Some(gfx);
        Ok(())
    }

    fn recreate_swapchain(&mut self) -> Result<()> {
        let (Some(window), Some(gfx)) = (&self.window, self.gfx.as_mut()) else {
            return Ok(());
        };
        let size = window.inner_size();
        if size.width == 0 || size.height == 0 {
            return Ok(());
        }
        gfx.recreate_swapchain(size.width, size.height)?;
        self.needs_resize = false;
        Ok(())
    }

    /// Returns true when a frame was presented
    fn render_frame(&mut self) -> Result<bool> {
        if self.is_minimized {
            return Ok(false);
        }
        if self.needs_resize {
            self.recreate_swapchain()?;
        }

        let color = pulse(self.config.graphics.clear_color, self.start.elapsed().as_secs_f32());
        let Some(gfx) = self.gfx.as_mut() else {
            return Ok(false);
        };

        let Some(index) = gfx.begin_frame()? else {
            self.needs_resize = true;
            return Ok(false);
        };
        record_clear(gfx, index, color)?;
        if gfx.present()? {
            self.needs_resize = true;
        }
        Ok(true)
    }

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

            self.needs_resize = true;
        }
    }

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

        if let Err(e) = self.init_vulkan(&window) {
            log::error!("Failed to initialize Vulkan: {:?}", e);
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
                if let Some(gfx) = self.gfx.as_mut() {
                    if let Err(e) = gfx.wait_idle() {
                        log::error!("Failed to drain GPU work: {:?}", e);
                    }
                }
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if size.width == 0 || size.height == 0 {
                    self.is_minimized = true;
                } else {
                    self.is_minimized = false;
                    self.needs_resize = true;
                }
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) => {
                    log::error!("Render error: {:?}", e);
                    event_loop.exit();
                }
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
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
