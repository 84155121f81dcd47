// Native driver seam
//
// Everything the command engine needs from the GPU goes through `Driver`.
// Backends are a closed set chosen once at startup, so this is a plain enum
// with a dispatch macro instead of a trait object.

use ash::prelude::VkResult;
use ash::vk;
use std::time::Duration;

use super::headless::{HeadlessConfig, HeadlessDriver};
use super::vulkan::VulkanDriver;

/// Hardware queue a command manager drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueType {
    Graphics,
    Transfer,
    Compute,
    Present,
}

/// One command recorded into a native command buffer
#[derive(Clone, Copy)]
pub enum NativeCommand<'a> {
    BindVertexBuffers {
        first_binding: u32,
        buffers: &'a [vk::Buffer],
        offsets: &'a [vk::DeviceSize],
    },
    BindIndexBuffer {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    },
    BindPipeline {
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    },
    BindDescriptorSets {
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &'a [vk::DescriptorSet],
    },
    BeginRenderPass {
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        render_area: vk::Rect2D,
        clear_values: &'a [vk::ClearValue],
    },
    EndRenderPass,
    SetViewport(vk::Viewport),
    SetScissor(vk::Rect2D),
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    ImageBarrier {
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: vk::ImageMemoryBarrier,
    },
    /// Blit from a TRANSFER_SRC image to a TRANSFER_DST image
    BlitImage {
        src: vk::Image,
        dst: vk::Image,
        region: vk::ImageBlit,
        filter: vk::Filter,
    },
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &'a [vk::BufferCopy],
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: &'a [vk::BufferImageCopy],
    },
    ClearColorImage {
        image: vk::Image,
        layout: vk::ImageLayout,
        color: vk::ClearColorValue,
        range: vk::ImageSubresourceRange,
    },
}

/// Arrays for a single native queue submission.
///
/// `wait_values`/`signal_values` run parallel to the semaphore arrays; entries
/// for binary semaphores are ignored by the driver.
#[derive(Debug, Default, Clone)]
pub struct SubmitBatch {
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub wait_values: Vec<u64>,
    pub wait_stages: Vec<vk::PipelineStageFlags>,
    pub signal_semaphores: Vec<vk::Semaphore>,
    pub signal_values: Vec<u64>,
}

impl SubmitBatch {
    pub fn is_empty(&self) -> bool {
        self.command_buffers.is_empty()
    }

    pub fn wait(&mut self, semaphore: vk::Semaphore, value: u64, stage: vk::PipelineStageFlags) {
        self.wait_semaphores.push(semaphore);
        self.wait_values.push(value);
        self.wait_stages.push(stage);
    }

    pub fn signal(&mut self, semaphore: vk::Semaphore, value: u64) {
        self.signal_semaphores.push(semaphore);
        self.signal_values.push(value);
    }
}

/// Swapchain images currently owned by the presentation engine
#[derive(Debug, Clone)]
pub struct SwapchainImages {
    pub images: Vec<vk::Image>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

/// The native backend the engine runs on
pub enum Driver {
    Vulkan(VulkanDriver),
    Headless(HeadlessDriver),
}

macro_rules! dispatch {
    ($self:expr, $driver:ident => $body:expr) => {
        match $self {
            Driver::Vulkan($driver) => $body,
            Driver::Headless($driver) => $body,
        }
    };
}

impl Driver {
    pub fn headless(config: HeadlessConfig) -> Self {
        Driver::Headless(HeadlessDriver::new(config))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Driver::Vulkan(_) => "vulkan",
            Driver::Headless(_) => "headless",
        }
    }

    pub fn as_headless(&self) -> Option<&HeadlessDriver> {
        match self {
            Driver::Headless(driver) => Some(driver),
            Driver::Vulkan(_) => None,
        }
    }

    pub fn as_vulkan(&self) -> Option<&VulkanDriver> {
        match self {
            Driver::Vulkan(driver) => Some(driver),
            Driver::Headless(_) => None,
        }
    }

    pub fn queue(&self, kind: QueueType) -> (vk::Queue, u32) {
        dispatch!(self, d => d.queue(kind))
    }

    pub fn create_command_pool(&self, queue_family: u32) -> VkResult<vk::CommandPool> {
        dispatch!(self, d => d.create_command_pool(queue_family))
    }

    pub fn destroy_command_pool(&self, pool: vk::CommandPool) {
        dispatch!(self, d => d.destroy_command_pool(pool))
    }

    pub fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        dispatch!(self, d => d.allocate_command_buffers(pool, count))
    }

    pub fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> VkResult<()> {
        dispatch!(self, d => d.begin_command_buffer(cmd, flags))
    }

    pub fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        dispatch!(self, d => d.end_command_buffer(cmd))
    }

    pub fn record(&self, cmd: vk::CommandBuffer, command: NativeCommand<'_>) {
        dispatch!(self, d => d.record(cmd, command))
    }

    pub fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        dispatch!(self, d => d.create_semaphore())
    }

    pub fn create_timeline_semaphore(&self, initial_value: u64) -> VkResult<vk::Semaphore> {
        dispatch!(self, d => d.create_timeline_semaphore(initial_value))
    }

    pub fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        dispatch!(self, d => d.destroy_semaphore(semaphore))
    }

    /// Signal a timeline semaphore from the host
    pub fn signal_timeline(&self, semaphore: vk::Semaphore, value: u64) -> VkResult<()> {
        dispatch!(self, d => d.signal_timeline(semaphore, value))
    }

    /// Wait until the timeline reaches `value`. `Ok(false)` means the timeout expired.
    pub fn wait_timeline(
        &self,
        semaphore: vk::Semaphore,
        value: u64,
        timeout: Duration,
    ) -> VkResult<bool> {
        dispatch!(self, d => d.wait_timeline(semaphore, value, timeout))
    }

    pub fn timeline_value(&self, semaphore: vk::Semaphore) -> VkResult<u64> {
        dispatch!(self, d => d.timeline_value(semaphore))
    }

    pub fn queue_submit(&self, queue: vk::Queue, batch: &SubmitBatch) -> VkResult<()> {
        dispatch!(self, d => d.queue_submit(queue, batch))
    }

    pub fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()> {
        dispatch!(self, d => d.queue_wait_idle(queue))
    }

    pub fn format_supports_linear_blit(&self, format: vk::Format) -> bool {
        dispatch!(self, d => d.format_supports_linear_blit(format))
    }

    pub fn swapchain_images(&self) -> Option<SwapchainImages> {
        dispatch!(self, d => d.swapchain_images())
    }

    pub fn recreate_swapchain(&self, width: u32, height: u32) -> anyhow::Result<()> {
        dispatch!(self, d => d.recreate_swapchain(width, height))
    }

    /// Returns the acquired image index and whether the swapchain is suboptimal
    pub fn acquire_next_image(&self, signal: vk::Semaphore) -> VkResult<(u32, bool)> {
        dispatch!(self, d => d.acquire_next_image(signal))
    }

    /// Returns true when the swapchain should be recreated
    pub fn queue_present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> VkResult<bool> {
        dispatch!(self, d => d.queue_present(queue, image_index, wait))
    }

    pub fn wait_idle(&self) -> VkResult<()> {
        dispatch!(self, d => d.wait_idle())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_batch_keeps_arrays_parallel() {
        let mut batch = SubmitBatch::default();
        assert!(batch.is_empty());

        batch.wait(vk::Semaphore::null(), 0, vk::PipelineStageFlags::TOP_OF_PIPE);
        batch.wait(vk::Semaphore::null(), 7, vk::PipelineStageFlags::ALL_COMMANDS);
        batch.signal(vk::Semaphore::null(), 8);

        assert_eq!(batch.wait_semaphores.len(), batch.wait_values.len());
        assert_eq!(batch.wait_semaphores.len(), batch.wait_stages.len());
        assert_eq!(batch.signal_semaphores.len(), batch.signal_values.len());
        assert_eq!(batch.wait_values, vec![0, 7]);
        assert!(batch.is_empty());
    }

    #[test]
    fn headless_driver_reports_its_kind() {
        let driver = Driver::headless(HeadlessConfig::default());
        assert_eq!(driver.name(), "headless");
        assert!(driver.as_headless().is_some());
        assert!(driver.as_vulkan().is_none());
    }
}
