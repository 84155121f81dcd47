// =============================================================================
// GRAPHICS DEVICE - the façade the renderer talks to
// =============================================================================
//
// Owns the driver, the semaphore pool and one command manager per queue, plus
// the implicit command buffer everything per-frame records into. A frame is:
//
//   begin_frame()  -> acquire a swapchain image, current buffer waits on it
//   ...record into command_buffer()...
//   present()      -> submit and wait until it is issued, track the frame,
//                     retire the oldest, present
//
// Frames in flight are bounded by a FIFO of timeline snapshots; once it is
// full the oldest frame is waited on before the new one is presented.

use anyhow::{Context, Result};
use ash::vk;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::command_buffer::{CommandBuffer, CommandBufferRef, CommandBufferUsage};
use crate::backend::command_manager::CommandManager;
use crate::backend::driver::{Driver, QueueType};
use crate::backend::image::Image;
use crate::backend::sync::{Semaphore, SyncObjectManager, TimelineSemaphore};
use crate::config::Config;

struct AcquiredImage {
    index: u32,
    available: Semaphore,
}

struct InFlightFrame {
    timeline: TimelineSemaphore,
    submitted: bool,
    image_available: Semaphore,
    render_finished: Semaphore,
}

pub struct GraphicsDevice {
    driver: Arc<Driver>,
    sync: Arc<SyncObjectManager>,
    graphics: Arc<CommandManager>,
    transfer: Arc<CommandManager>,
    present_queue: vk::Queue,

    current: CommandBufferRef,
    frames: VecDeque<InFlightFrame>,
    max_frames_in_flight: usize,
    frame_timeout: Duration,

    swapchain_images: Vec<Arc<Image>>,
    swapchain_extent: vk::Extent2D,
    acquired: Option<AcquiredImage>,
}

impl GraphicsDevice {
    pub fn new(driver: Driver, config: &Config) -> Result<Self> {
        config.validate()?;
        let driver = Arc::new(driver);
        let sync = Arc::new(SyncObjectManager::new(driver.clone(), config.sync_limits()));

        let settings = config.command_settings();
        let graphics = Arc::new(CommandManager::new(
            driver.clone(),
            sync.clone(),
            QueueType::Graphics,
            settings.clone(),
        )?);
        let transfer = Arc::new(CommandManager::new(
            driver.clone(),
            sync.clone(),
            QueueType::Transfer,
            settings,
        )?);

        let (present_queue, _) = driver.queue(QueueType::Present);
        let current = graphics.request_primary_command_buffer();
        let (swapchain_images, swapchain_extent) = wrap_swapchain_images(&driver);

        log::info!(
            "Graphics device ready on the {} backend ({} frames in flight, {} swapchain images)",
            driver.name(),
            config.graphics.max_frames_in_flight,
            swapchain_images.len()
        );

        Ok(Self {
            driver,
            sync,
            graphics,
            transfer,
            present_queue,
            current,
            frames: VecDeque::with_capacity(config.graphics.max_frames_in_flight + 1),
            max_frames_in_flight: config.graphics.max_frames_in_flight,
            frame_timeout: config.frame_timeout(),
            swapchain_images,
            swapchain_extent,
            acquired: None,
        })
    }

    pub fn driver(&self) -> &Arc<Driver> {
        &self.driver
    }

    pub fn sync(&self) -> &Arc<SyncObjectManager> {
        &self.sync
    }

    pub fn graphics_commands(&self) -> &Arc<CommandManager> {
        &self.graphics
    }

    pub fn transfer_commands(&self) -> &Arc<CommandManager> {
        &self.transfer
    }

    fn manager(&self, queue: QueueType) -> Result<&Arc<CommandManager>> {
        match queue {
            QueueType::Graphics | QueueType::Present => Ok(&self.graphics),
            QueueType::Transfer => Ok(&self.transfer),
            QueueType::Compute => anyhow::bail!("No command manager for the compute queue"),
        }
    }

    /// The implicit buffer the current frame records into
    pub fn command_buffer(&self) -> CommandBufferRef {
        self.current.clone()
    }

    pub fn swapchain_image(&self, index: u32) -> Option<&Arc<Image>> {
        self.swapchain_images.get(index as usize)
    }

    pub fn swapchain_image_count(&self) -> usize {
        self.swapchain_images.len()
    }

    pub fn swapchain_extent(&self) -> vk::Extent2D {
        self.swapchain_extent
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    /// Submit queued EXPLICIT buffers on every queue, and the implicit buffer
    /// too when `flush_implicit` is set. A fresh implicit buffer replaces the
    /// flushed one. With `wait_execution` this blocks until the GPU is done.
    pub fn flush_commands(&mut self, wait_execution: bool, flush_implicit: bool) -> Result<()> {
        let mask = if flush_implicit {
            CommandBufferUsage::EXPLICIT | CommandBufferUsage::IMPLICIT
        } else {
            CommandBufferUsage::EXPLICIT
        };

        let mut submitted = Vec::with_capacity(2);
        for manager in [&self.graphics, &self.transfer] {
            let timeline = self.sync.request_timeline_semaphore();
            if manager.submit_command_buffers(timeline, mask, None) {
                submitted.push((manager.queue_type(), timeline));
            }
        }

        if flush_implicit {
            self.current = self.graphics.request_primary_command_buffer();
        }

        if wait_execution {
            for (queue, timeline) in submitted {
                self.wait_for(timeline, &format!("{:?} flush", queue))?;
            }
        }
        Ok(())
    }

    /// Acquire the next swapchain image. `None` means the swapchain is out of
    /// date and has to be recreated before rendering.
    pub fn begin_frame(&mut self) -> Result<Option<u32>> {
        if self.acquired.is_some() {
            anyhow::bail!("begin_frame() called twice without present()");
        }

        let mut available = self.sync.request_semaphore();
        // Frames may write the image with transfers before any attachment use
        available.wait_stage = vk::PipelineStageFlags::ALL_COMMANDS;
        let (index, suboptimal) = match self.driver.acquire_next_image(available.handle) {
            Ok(acquired) => acquired,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.sync.return_semaphore(available);
                return Ok(None);
            }
            Err(e) => {
                self.sync.return_semaphore(available);
                return Err(e).context("Failed to acquire swapchain image");
            }
        };
        if suboptimal {
            log::debug!("Swapchain is suboptimal");
        }

        self.current.lock().wait_presentation_semaphore(available);
        self.acquired = Some(AcquiredImage { index, available });
        Ok(Some(index))
    }

    /// Submit the frame and present it. Returns true when the swapchain
    /// should be recreated.
    pub fn present(&mut self) -> Result<bool> {
        let acquired = self
            .acquired
            .take()
            .context("present() called without begin_frame()")?;

        let render_finished = self.sync.request_semaphore();
        self.current
            .lock()
            .signal_presentation_semaphore(render_finished);

        let timeline = self.sync.request_timeline_semaphore();
        let issued = self.sync.request_timeline_semaphore();
        let submitted = self.graphics.submit_command_buffers(
            timeline,
            CommandBufferUsage::EXPLICIT | CommandBufferUsage::IMPLICIT,
            Some(issued),
        );
        self.current = self.graphics.request_primary_command_buffer();

        // The present waits on render_finished, so its signalling submit has
        // to reach the queue first
        self.wait_for(issued, "frame submission")?;
        self.sync.return_timeline_semaphore(issued);

        self.frames.push_back(InFlightFrame {
            timeline,
            submitted,
            image_available: acquired.available,
            render_finished,
        });
        while self.frames.len() > self.max_frames_in_flight {
            if let Some(oldest) = self.frames.pop_front() {
                self.retire(oldest)?;
            }
        }

        match self
            .driver
            .queue_present(self.present_queue, acquired.index, render_finished.handle)
        {
            Ok(needs_recreate) => Ok(needs_recreate),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(e).context("Failed to present swapchain image"),
        }
    }

    fn retire(&self, frame: InFlightFrame) -> Result<()> {
        if frame.submitted {
            self.wait_for(frame.timeline, "frame")?;
        }
        self.sync.return_semaphore(frame.image_available);
        self.sync.return_semaphore(frame.render_finished);
        Ok(())
    }

    // Timeline values only grow, so a snapshot stays valid after the
    // semaphore itself has been recycled
    fn wait_for(&self, timeline: TimelineSemaphore, what: &str) -> Result<()> {
        let reached = self
            .driver
            .wait_timeline(timeline.handle, timeline.signal_value, self.frame_timeout)
            .with_context(|| format!("Waiting for {} failed", what))?;
        if !reached {
            anyhow::bail!(
                "{} did not complete within {:?} (timeline semaphore {} at {})",
                what,
                self.frame_timeout,
                timeline.id,
                timeline.signal_value
            );
        }
        Ok(())
    }

    /// Record `record` into a fresh buffer and run it to completion on `queue`.
    /// Stalls the queue; for setup-time work only.
    pub fn execute_immediate<F>(&self, queue: QueueType, record: F) -> Result<()>
    where
        F: FnOnce(&mut CommandBuffer),
    {
        let manager = self.manager(queue)?;
        let buffer = manager.default_pool().request_primary_command_buffer();
        {
            let mut cmd = buffer.lock();
            cmd.set_usage(CommandBufferUsage::EXPLICIT);
            record(&mut *cmd);
        }
        manager.submit_single_command_buffer_immediate(buffer);
        Ok(())
    }

    /// Retire every frame, drain both pipelines and idle the device
    pub fn wait_idle(&mut self) -> Result<()> {
        while let Some(frame) = self.frames.pop_front() {
            self.retire(frame)?;
        }
        for manager in [&self.graphics, &self.transfer] {
            if !manager.wait_until_recycled(self.frame_timeout) {
                anyhow::bail!(
                    "{:?} queue still has {} command buffers in flight",
                    manager.queue_type(),
                    manager.pending_count()
                );
            }
        }
        self.driver.wait_idle().context("Failed to wait for device idle")?;
        Ok(())
    }

    /// Rebuild the swapchain after a resize. Must be called between frames.
    pub fn recreate_swapchain(&mut self, width: u32, height: u32) -> Result<()> {
        if self.acquired.is_some() {
            anyhow::bail!("Cannot recreate the swapchain while an image is acquired");
        }
        self.wait_idle()?;
        self.driver.recreate_swapchain(width, height)?;
        let (images, extent) = wrap_swapchain_images(&self.driver);
        self.swapchain_images = images;
        self.swapchain_extent = extent;
        Ok(())
    }
}

impl Drop for GraphicsDevice {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            log::error!("Failed to idle the device during shutdown: {:#}", e);
        }
        // Worker threads must be gone before the driver is torn down
        self.graphics.destroy();
        self.transfer.destroy();
        log::info!("Graphics device destroyed");
    }
}

fn wrap_swapchain_images(driver: &Driver) -> (Vec<Arc<Image>>, vk::Extent2D) {
    match driver.swapchain_images() {
        Some(swapchain) => (
            swapchain
                .images
                .iter()
                .map(|&handle| Arc::new(Image::from_swapchain(handle, swapchain.format, swapchain.extent)))
                .collect(),
            swapchain.extent,
        ),
        None => (Vec::new(), vk::Extent2D::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::HeadlessConfig;
    use crate::config::BackendKind;

    fn headless_device(frames_in_flight: usize) -> GraphicsDevice {
        let mut config = Config::default();
        config.graphics.backend = BackendKind::Headless;
        config.graphics.max_frames_in_flight = frames_in_flight;
        GraphicsDevice::new(Driver::headless(HeadlessConfig::default()), &config).unwrap()
    }

    fn stats(gfx: &GraphicsDevice) -> crate::backend::headless::HeadlessStats {
        gfx.driver().as_headless().unwrap().stats()
    }

    #[test]
    fn frames_in_flight_never_exceed_the_cap() {
        let mut gfx = headless_device(2);

        for _ in 0..6 {
            gfx.begin_frame().unwrap().unwrap();
            assert!(!gfx.present().unwrap());
            assert!(gfx.frames_in_flight() <= 2);
        }

        let stats = stats(&gfx);
        assert_eq!(stats.acquires, 6);
        assert_eq!(stats.presents, 6);
        assert_eq!(stats.submits, 6);
        // image-available + render-finished for at most cap + 1 frames
        assert!(gfx.sync().semaphore_count() <= 2 * 3);
    }

    #[test]
    fn frame_submit_reaches_the_queue_before_its_present() {
        let mut gfx = headless_device(2);

        for frame in 0..50 {
            gfx.begin_frame().unwrap().unwrap();
            gfx.present().unwrap();
            let stats = stats(&gfx);
            assert!(
                stats.submits >= stats.presents,
                "frame {}: {} submits, {} presents",
                frame,
                stats.submits,
                stats.presents
            );
        }
        // Submission notifications go straight back to the pool
        gfx.wait_idle().unwrap();
        assert_eq!(
            gfx.sync().available_timeline_semaphores(),
            gfx.sync().timeline_semaphore_count()
        );
    }

    #[test]
    fn present_waits_on_the_oldest_frame_once_the_cap_is_reached() {
        let mut config = Config::default();
        config.graphics.max_frames_in_flight = 2;
        config.commands.frame_timeout_ms = 50;
        config.commands.recycle_timeout_ms = 10_000;
        let mut gfx =
            GraphicsDevice::new(Driver::headless(HeadlessConfig::default()), &config).unwrap();
        let driver = gfx.driver().clone();
        let headless = driver.as_headless().unwrap();
        headless.set_stalled(true);

        for _ in 0..2 {
            gfx.begin_frame().unwrap().unwrap();
            assert!(!gfx.present().unwrap());
        }
        assert_eq!(gfx.frames_in_flight(), 2);

        gfx.begin_frame().unwrap().unwrap();
        let err = gfx.present().unwrap_err();
        assert!(err.to_string().contains("frame did not complete"), "{}", err);
        assert_eq!(stats(&gfx).presents, 2);

        headless.set_stalled(false);
        gfx.wait_idle().unwrap();
        assert_eq!(gfx.frames_in_flight(), 0);
    }

    #[test]
    fn external_threads_share_the_queue_with_the_render_thread() {
        const WORKERS: usize = 4;
        const PER_WORKER: usize = 100;

        let mut gfx = headless_device(2);
        let workers: Vec<_> = (0..WORKERS)
            .map(|_| {
                let transfer = gfx.transfer_commands().clone();
                std::thread::spawn(move || {
                    let pool = transfer.request_external_command_pool();
                    for _ in 0..PER_WORKER {
                        while pool.free_count() == 0 && pool.allocated_count() == pool.capacity() {
                            std::thread::sleep(Duration::from_millis(1));
                        }
                        let buffer = pool.request_primary_command_buffer();
                        {
                            let mut cmd = buffer.lock();
                            cmd.copy_buffer(
                                vk::Buffer::null(),
                                vk::Buffer::null(),
                                &[vk::BufferCopy::default()],
                            );
                            cmd.end_command_buffer();
                        }
                        transfer.return_external_command_buffer(buffer);
                    }
                    pool
                })
            })
            .collect();

        while workers.iter().any(|worker| !worker.is_finished()) {
            gfx.flush_commands(true, false).unwrap();
            std::thread::sleep(Duration::from_millis(1));
        }
        let pools: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        gfx.flush_commands(true, false).unwrap();
        assert!(gfx.transfer_commands().wait_until_recycled(Duration::from_secs(3)));

        let stats = stats(&gfx);
        assert_eq!(stats.copies, WORKERS * PER_WORKER);
        assert_eq!(stats.submitted_command_buffers, WORKERS * PER_WORKER);
        assert_eq!(gfx.transfer_commands().in_use_count(), 0);
        for pool in &pools {
            assert_eq!(pool.free_count(), pool.allocated_count());
        }
    }

    #[test]
    fn present_submits_wait_and_signal_semaphores() {
        let mut gfx = headless_device(2);
        gfx.begin_frame().unwrap();
        gfx.present().unwrap();
        assert!(gfx.graphics_commands().wait_until_recycled(Duration::from_secs(3)));

        let submit = gfx.driver().as_headless().unwrap().last_submit().unwrap();
        assert_eq!(submit.command_buffers.len(), 1);
        assert_eq!(submit.wait_semaphores.len(), 1);
        // render-finished, then the frame's timeline
        assert_eq!(submit.signal_semaphores.len(), 2);
    }

    #[test]
    fn present_without_begin_frame_is_an_error() {
        let mut gfx = headless_device(2);
        let err = gfx.present().unwrap_err();
        assert!(err.to_string().contains("begin_frame"));
    }

    #[test]
    fn swapchain_images_track_layout_through_a_frame() {
        let mut gfx = headless_device(2);
        assert_eq!(gfx.swapchain_image_count(), 3);

        let index = gfx.begin_frame().unwrap().unwrap();
        let image = gfx.swapchain_image(index).unwrap().clone();
        {
            let cmd = gfx.command_buffer();
            let mut cmd = cmd.lock();
            cmd.transition_image_layout(&image, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
            cmd.clear_color_image(&image, [0.0, 0.0, 0.0, 1.0]);
            cmd.transition_image_layout(&image, vk::ImageLayout::PRESENT_SRC_KHR);
        }
        gfx.present().unwrap();

        assert_eq!(image.layout(), vk::ImageLayout::PRESENT_SRC_KHR);
        let stats = stats(&gfx);
        assert_eq!(stats.barriers, 2);
        assert_eq!(stats.clears, 1);
    }

    #[test]
    fn flush_with_implicit_primes_a_new_buffer() {
        let mut gfx = headless_device(2);
        let before = gfx.command_buffer();

        gfx.flush_commands(true, true).unwrap();

        let after = gfx.command_buffer();
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(after.lock().is_recording());
        assert_eq!(stats(&gfx).submits, 1);
    }

    #[test]
    fn flush_without_implicit_leaves_frame_buffer_alone() {
        let mut gfx = headless_device(2);
        let before = gfx.command_buffer();

        gfx.flush_commands(true, false).unwrap();

        assert!(Arc::ptr_eq(&before, &gfx.command_buffer()));
        assert_eq!(stats(&gfx).submits, 0);
        assert_eq!(gfx.graphics_commands().in_use_count(), 1);
    }

    #[test]
    fn explicit_transfer_work_is_flushed_on_its_own_queue() {
        let mut gfx = headless_device(2);
        let upload = gfx
            .transfer_commands()
            .request_command_buffer(CommandBufferUsage::EXPLICIT);
        upload
            .lock()
            .copy_buffer(vk::Buffer::null(), vk::Buffer::null(), &[vk::BufferCopy::default()]);
        drop(upload);

        gfx.flush_commands(true, false).unwrap();

        let stats = stats(&gfx);
        assert_eq!(stats.submits, 1);
        assert_eq!(stats.copies, 1);
        assert_eq!(gfx.transfer_commands().in_use_count(), 0);
    }

    #[test]
    fn hung_flush_reports_a_timeout() {
        let mut config = Config::default();
        config.commands.frame_timeout_ms = 50;
        config.commands.recycle_timeout_ms = 10_000;
        let mut gfx =
            GraphicsDevice::new(Driver::headless(HeadlessConfig::default()), &config).unwrap();
        let headless = gfx.driver().clone();
        let headless = headless.as_headless().unwrap();
        headless.set_stalled(true);

        let err = gfx.flush_commands(true, true).unwrap_err();
        assert!(err.to_string().contains("did not complete"));

        // Let the stuck batch finish so shutdown does not trip the recycle timeout
        headless.set_stalled(false);
        assert!(gfx.graphics_commands().wait_until_recycled(Duration::from_secs(3)));
    }

    #[test]
    fn execute_immediate_runs_to_completion() {
        let gfx = headless_device(2);
        gfx.execute_immediate(QueueType::Transfer, |cmd| {
            cmd.copy_buffer(vk::Buffer::null(), vk::Buffer::null(), &[vk::BufferCopy::default()]);
        })
        .unwrap();

        let stats = stats(&gfx);
        assert_eq!(stats.queue_wait_idles, 1);
        assert_eq!(stats.copies, 1);
        assert_eq!(gfx.transfer_commands().in_use_count(), 0);
        assert!(gfx.execute_immediate(QueueType::Compute, |_| {}).is_err());
    }

    #[test]
    fn recreate_swapchain_rewraps_images() {
        let mut gfx = headless_device(2);
        let old = gfx.swapchain_image(0).unwrap().handle;

        gfx.recreate_swapchain(800, 600).unwrap();

        assert_eq!(gfx.swapchain_extent(), vk::Extent2D { width: 800, height: 600 });
        assert_ne!(gfx.swapchain_image(0).unwrap().handle, old);
        assert_eq!(gfx.swapchain_image(0).unwrap().layout(), vk::ImageLayout::UNDEFINED);
    }
}
