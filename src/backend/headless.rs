// Headless driver - a CPU-only stand-in for a GPU
//
// Handles are manufactured from a counter, submitted work "completes" the
// moment it is submitted (timeline signals are applied during queue_submit),
// and every native call is counted so callers can observe what reached the
// driver. Setting the driver stalled simulates a hung GPU: submissions are
// accepted but never signal anything.

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::driver::{NativeCommand, QueueType, SubmitBatch, SwapchainImages};

#[derive(Debug, Clone)]
pub struct HeadlessConfig {
    pub swapchain_image_count: u32,
    pub swapchain_extent: vk::Extent2D,
    pub swapchain_format: vk::Format,
    /// Formats that report no linear-filter blit support
    pub formats_without_linear_blit: Vec<vk::Format>,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            swapchain_image_count: 3,
            swapchain_extent: vk::Extent2D { width: 1280, height: 720 },
            swapchain_format: vk::Format::B8G8R8A8_SRGB,
            formats_without_linear_blit: Vec::new(),
        }
    }
}

/// Counts of native calls that reached the driver
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HeadlessStats {
    pub command_pools_created: usize,
    pub command_pools_destroyed: usize,
    pub command_buffers_allocated: usize,
    pub begins: usize,
    pub ends: usize,
    pub binds: usize,
    pub render_passes: usize,
    pub draws: usize,
    pub barriers: usize,
    pub blits: usize,
    pub copies: usize,
    pub clears: usize,
    pub submits: usize,
    pub submitted_command_buffers: usize,
    pub semaphores_created: usize,
    pub timeline_semaphores_created: usize,
    pub semaphores_destroyed: usize,
    pub host_signals: usize,
    pub queue_wait_idles: usize,
    pub acquires: usize,
    pub presents: usize,
}

pub struct HeadlessDriver {
    config: HeadlessConfig,
    next_handle: AtomicU64,
    stalled: AtomicBool,
    stats: Mutex<HeadlessStats>,
    timelines: Mutex<HashMap<u64, u64>>,
    // Timeline signals held back while stalled
    withheld: Mutex<Vec<(u64, u64)>>,
    timeline_changed: Condvar,
    swapchain: Mutex<SwapchainImages>,
    next_image: AtomicU64,
    last_submit: Mutex<Option<SubmitBatch>>,
}

impl HeadlessDriver {
    pub fn new(config: HeadlessConfig) -> Self {
        let driver = Self {
            swapchain: Mutex::new(SwapchainImages {
                images: Vec::new(),
                format: config.swapchain_format,
                extent: config.swapchain_extent,
            }),
            config,
            next_handle: AtomicU64::new(1),
            stalled: AtomicBool::new(false),
            stats: Mutex::new(HeadlessStats::default()),
            timelines: Mutex::new(HashMap::new()),
            withheld: Mutex::new(Vec::new()),
            timeline_changed: Condvar::new(),
            next_image: AtomicU64::new(0),
            last_submit: Mutex::new(None),
        };
        let images = (0..driver.config.swapchain_image_count)
            .map(|_| vk::Image::from_raw(driver.next_raw()))
            .collect();
        driver.swapchain.lock().images = images;
        log::info!(
            "Headless driver ready ({} swapchain images)",
            driver.config.swapchain_image_count
        );
        driver
    }

    fn next_raw(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    /// Stop (or resume) completing submitted work. Resuming completes
    /// everything submitted while stalled.
    pub fn set_stalled(&self, stalled: bool) {
        let mut timelines = self.timelines.lock();
        self.stalled.store(stalled, Ordering::SeqCst);
        if stalled {
            log::warn!("Headless driver stalled: submissions will never complete");
            return;
        }
        for (raw, value) in self.withheld.lock().drain(..) {
            if let Some(counter) = timelines.get_mut(&raw) {
                *counter = (*counter).max(value);
            }
        }
        self.timeline_changed.notify_all();
    }

    pub fn stats(&self) -> HeadlessStats {
        self.stats.lock().clone()
    }

    /// The arrays of the most recent queue submission
    pub fn last_submit(&self) -> Option<SubmitBatch> {
        self.last_submit.lock().clone()
    }

    pub fn queue(&self, kind: QueueType) -> (vk::Queue, u32) {
        // Graphics and present share family 0, transfer and compute get their own
        let family = match kind {
            QueueType::Graphics | QueueType::Present => 0,
            QueueType::Transfer => 1,
            QueueType::Compute => 2,
        };
        (vk::Queue::from_raw(0x1000 + u64::from(family)), family)
    }

    pub fn create_command_pool(&self, _queue_family: u32) -> VkResult<vk::CommandPool> {
        self.stats.lock().command_pools_created += 1;
        Ok(vk::CommandPool::from_raw(self.next_raw()))
    }

    pub fn destroy_command_pool(&self, _pool: vk::CommandPool) {
        self.stats.lock().command_pools_destroyed += 1;
    }

    pub fn allocate_command_buffers(
        &self,
        _pool: vk::CommandPool,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        self.stats.lock().command_buffers_allocated += count as usize;
        Ok((0..count)
            .map(|_| vk::CommandBuffer::from_raw(self.next_raw()))
            .collect())
    }

    pub fn begin_command_buffer(
        &self,
        _cmd: vk::CommandBuffer,
        _flags: vk::CommandBufferUsageFlags,
    ) -> VkResult<()> {
        self.stats.lock().begins += 1;
        Ok(())
    }

    pub fn end_command_buffer(&self, _cmd: vk::CommandBuffer) -> VkResult<()> {
        self.stats.lock().ends += 1;
        Ok(())
    }

    pub fn record(&self, _cmd: vk::CommandBuffer, command: NativeCommand<'_>) {
        let mut stats = self.stats.lock();
        match command {
            NativeCommand::BindVertexBuffers { .. }
            | NativeCommand::BindIndexBuffer { .. }
            | NativeCommand::BindPipeline { .. }
            | NativeCommand::BindDescriptorSets { .. } => stats.binds += 1,
            NativeCommand::BeginRenderPass { .. } => stats.render_passes += 1,
            NativeCommand::EndRenderPass
            | NativeCommand::SetViewport(_)
            | NativeCommand::SetScissor(_) => {}
            NativeCommand::Draw { .. } | NativeCommand::DrawIndexed { .. } => stats.draws += 1,
            NativeCommand::ImageBarrier { .. } => stats.barriers += 1,
            NativeCommand::BlitImage { .. } => stats.blits += 1,
            NativeCommand::CopyBuffer { .. } | NativeCommand::CopyBufferToImage { .. } => {
                stats.copies += 1
            }
            NativeCommand::ClearColorImage { .. } => stats.clears += 1,
        }
    }

    pub fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        self.stats.lock().semaphores_created += 1;
        Ok(vk::Semaphore::from_raw(self.next_raw()))
    }

    pub fn create_timeline_semaphore(&self, initial_value: u64) -> VkResult<vk::Semaphore> {
        let raw = self.next_raw();
        self.timelines.lock().insert(raw, initial_value);
        self.stats.lock().timeline_semaphores_created += 1;
        Ok(vk::Semaphore::from_raw(raw))
    }

    pub fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.timelines.lock().remove(&semaphore.as_raw());
        self.stats.lock().semaphores_destroyed += 1;
    }

    pub fn signal_timeline(&self, semaphore: vk::Semaphore, value: u64) -> VkResult<()> {
        self.stats.lock().host_signals += 1;
        let mut timelines = self.timelines.lock();
        let counter = timelines
            .get_mut(&semaphore.as_raw())
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        *counter = (*counter).max(value);
        self.timeline_changed.notify_all();
        Ok(())
    }

    pub fn wait_timeline(
        &self,
        semaphore: vk::Semaphore,
        value: u64,
        timeout: Duration,
    ) -> VkResult<bool> {
        let deadline = Instant::now() + timeout;
        let mut timelines = self.timelines.lock();
        loop {
            let current = *timelines
                .get(&semaphore.as_raw())
                .ok_or(vk::Result::ERROR_UNKNOWN)?;
            if current >= value {
                return Ok(true);
            }
            if self
                .timeline_changed
                .wait_until(&mut timelines, deadline)
                .timed_out()
            {
                let current = timelines.get(&semaphore.as_raw()).copied().unwrap_or(0);
                return Ok(current >= value);
            }
        }
    }

    pub fn timeline_value(&self, semaphore: vk::Semaphore) -> VkResult<u64> {
        self.timelines
            .lock()
            .get(&semaphore.as_raw())
            .copied()
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }

    pub fn queue_submit(&self, _queue: vk::Queue, batch: &SubmitBatch) -> VkResult<()> {
        {
            let mut stats = self.stats.lock();
            stats.submits += 1;
            stats.submitted_command_buffers += batch.command_buffers.len();
        }
        *self.last_submit.lock() = Some(batch.clone());

        let mut timelines = self.timelines.lock();
        if self.stalled.load(Ordering::SeqCst) {
            let mut withheld = self.withheld.lock();
            for (semaphore, value) in batch.signal_semaphores.iter().zip(&batch.signal_values) {
                if timelines.contains_key(&semaphore.as_raw()) {
                    withheld.push((semaphore.as_raw(), *value));
                }
            }
            return Ok(());
        }

        for (semaphore, value) in batch.signal_semaphores.iter().zip(&batch.signal_values) {
            // Binary semaphores are not tracked
            if let Some(counter) = timelines.get_mut(&semaphore.as_raw()) {
                *counter = (*counter).max(*value);
            }
        }
        self.timeline_changed.notify_all();
        Ok(())
    }

    pub fn queue_wait_idle(&self, _queue: vk::Queue) -> VkResult<()> {
        self.stats.lock().queue_wait_idles += 1;
        if self.stalled.load(Ordering::SeqCst) {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        Ok(())
    }

    pub fn format_supports_linear_blit(&self, format: vk::Format) -> bool {
        !self.config.formats_without_linear_blit.contains(&format)
    }

    pub fn swapchain_images(&self) -> Option<SwapchainImages> {
        Some(self.swapchain.lock().clone())
    }

    pub fn recreate_swapchain(&self, width: u32, height: u32) -> anyhow::Result<()> {
        let images = (0..self.config.swapchain_image_count)
            .map(|_| vk::Image::from_raw(self.next_raw()))
            .collect();
        let mut swapchain = self.swapchain.lock();
        swapchain.images = images;
        swapchain.extent = vk::Extent2D { width, height };
        log::info!("Headless swapchain recreated: {}x{}", width, height);
        Ok(())
    }

    pub fn acquire_next_image(&self, _signal: vk::Semaphore) -> VkResult<(u32, bool)> {
        self.stats.lock().acquires += 1;
        let count = u64::from(self.config.swapchain_image_count.max(1));
        let index = self.next_image.fetch_add(1, Ordering::Relaxed) % count;
        Ok((index as u32, false))
    }

    pub fn queue_present(
        &self,
        _queue: vk::Queue,
        _image_index: u32,
        _wait: vk::Semaphore,
    ) -> VkResult<bool> {
        self.stats.lock().presents += 1;
        Ok(false)
    }

    pub fn wait_idle(&self) -> VkResult<()> {
        if self.stalled.load(Ordering::SeqCst) {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submission_signals_timeline_values() {
        let driver = HeadlessDriver::new(HeadlessConfig::default());
        let timeline = driver.create_timeline_semaphore(0).unwrap();
        let (queue, _) = driver.queue(QueueType::Graphics);

        let mut batch = SubmitBatch::default();
        batch.command_buffers.push(vk::CommandBuffer::from_raw(99));
        batch.signal(timeline, 3);
        driver.queue_submit(queue, &batch).unwrap();

        assert_eq!(driver.timeline_value(timeline).unwrap(), 3);
        assert!(driver.wait_timeline(timeline, 3, Duration::from_millis(1)).unwrap());
        assert_eq!(driver.stats().submitted_command_buffers, 1);
    }

    #[test]
    fn stalled_driver_times_out_waits() {
        let driver = HeadlessDriver::new(HeadlessConfig::default());
        driver.set_stalled(true);
        let timeline = driver.create_timeline_semaphore(0).unwrap();
        let (queue, _) = driver.queue(QueueType::Graphics);

        let mut batch = SubmitBatch::default();
        batch.signal(timeline, 1);
        driver.queue_submit(queue, &batch).unwrap();

        assert!(!driver.wait_timeline(timeline, 1, Duration::from_millis(20)).unwrap());

        driver.set_stalled(false);
        assert_eq!(driver.timeline_value(timeline).unwrap(), 1);
    }

    #[test]
    fn host_signal_wakes_waiter() {
        let driver = std::sync::Arc::new(HeadlessDriver::new(HeadlessConfig::default()));
        let timeline = driver.create_timeline_semaphore(0).unwrap();

        let waiter = {
            let driver = driver.clone();
            std::thread::spawn(move || driver.wait_timeline(timeline, 5, Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(10));
        driver.signal_timeline(timeline, 5).unwrap();

        assert!(waiter.join().unwrap().unwrap());
    }

    #[test]
    fn acquire_cycles_through_swapchain_images() {
        let driver = HeadlessDriver::new(HeadlessConfig::default());
        let indices: Vec<u32> = (0..4)
            .map(|_| driver.acquire_next_image(vk::Semaphore::null()).unwrap().0)
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 0]);
    }
}
