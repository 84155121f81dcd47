// Vulkan driver - ash implementation of the native seam
//
// Queues are externally synchronized in Vulkan, so every submit, wait-idle
// and present goes through `queue_lock`. The submission thread is the only
// hot-path user of that lock.

use anyhow::{Context, Result};
use ash::prelude::VkResult;
use ash::vk;
use parking_lot::Mutex;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::sync::Arc;
use std::time::Duration;

use super::driver::{NativeCommand, QueueType, SubmitBatch, SwapchainImages};
use super::{surface, Swapchain, VulkanDevice};

struct Presentation {
    surface: vk::SurfaceKHR,
    surface_loader: ash::extensions::khr::Surface,
    present_mode: vk::PresentModeKHR,
    swapchain: Option<Swapchain>,
}

pub struct VulkanDriver {
    device: Arc<VulkanDevice>,
    queue_lock: Mutex<()>,
    presentation: Mutex<Option<Presentation>>,
}

impl VulkanDriver {
    /// Driver without presentation support (offscreen work only)
    pub fn new(device: Arc<VulkanDevice>) -> Self {
        Self {
            device,
            queue_lock: Mutex::new(()),
            presentation: Mutex::new(None),
        }
    }

    /// Driver presenting to a window surface
    ///
    /// # Safety
    /// The window behind the handles must outlive the driver.
    pub unsafe fn with_surface(
        device: Arc<VulkanDevice>,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        width: u32,
        height: u32,
        present_mode: vk::PresentModeKHR,
    ) -> Result<Self> {
        let surface =
            surface::create_surface(&device.entry, &device.instance, display_handle, window_handle)?;
        let surface_loader = ash::extensions::khr::Surface::new(&device.entry, &device.instance);

        let surface_support = surface_loader.get_physical_device_surface_support(
            device.physical_device,
            device.graphics_queue_family,
            surface,
        )?;
        if !surface_support {
            surface_loader.destroy_surface(surface, None);
            anyhow::bail!("GPU doesn't support presenting to this surface");
        }

        let swapchain = Swapchain::new(
            device.clone(),
            surface,
            &surface_loader,
            width,
            height,
            present_mode,
        )?;

        Ok(Self {
            device,
            queue_lock: Mutex::new(()),
            presentation: Mutex::new(Some(Presentation {
                surface,
                surface_loader,
                present_mode,
                swapchain: Some(swapchain),
            })),
        })
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }

    pub fn queue(&self, kind: QueueType) -> (vk::Queue, u32) {
        match kind {
            QueueType::Transfer => (self.device.transfer_queue, self.device.transfer_queue_family),
            QueueType::Graphics | QueueType::Compute | QueueType::Present => {
                (self.device.graphics_queue, self.device.graphics_queue_family)
            }
        }
    }

    pub fn create_command_pool(&self, queue_family: u32) -> VkResult<vk::CommandPool> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_family)
            // TRANSIENT: Command buffers are short-lived
            // RESET: vkBeginCommandBuffer resets recycled buffers individually
            .flags(
                vk::CommandPoolCreateFlags::TRANSIENT
                    | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            );
        unsafe { self.device.device.create_command_pool(&pool_info, None) }
    }

    pub fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.device.destroy_command_pool(pool, None) }
    }

    pub fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        unsafe { self.device.device.allocate_command_buffers(&alloc_info) }
    }

    pub fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> VkResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::builder().flags(flags);
        unsafe { self.device.device.begin_command_buffer(cmd, &begin_info) }
    }

    pub fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.device.device.end_command_buffer(cmd) }
    }

    pub fn record(&self, cmd: vk::CommandBuffer, command: NativeCommand<'_>) {
        let device = &self.device.device;
        unsafe {
            match command {
                NativeCommand::BindVertexBuffers {
                    first_binding,
                    buffers,
                    offsets,
                } => device.cmd_bind_vertex_buffers(cmd, first_binding, buffers, offsets),
                NativeCommand::BindIndexBuffer {
                    buffer,
                    offset,
                    index_type,
                } => device.cmd_bind_index_buffer(cmd, buffer, offset, index_type),
                NativeCommand::BindPipeline {
                    bind_point,
                    pipeline,
                } => device.cmd_bind_pipeline(cmd, bind_point, pipeline),
                NativeCommand::BindDescriptorSets {
                    bind_point,
                    layout,
                    first_set,
                    sets,
                } => device.cmd_bind_descriptor_sets(cmd, bind_point, layout, first_set, sets, &[]),
                NativeCommand::BeginRenderPass {
                    render_pass,
                    framebuffer,
                    render_area,
                    clear_values,
                } => {
                    let begin_info = vk::RenderPassBeginInfo::builder()
                        .render_pass(render_pass)
                        .framebuffer(framebuffer)
                        .render_area(render_area)
                        .clear_values(clear_values);
                    device.cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE);
                }
                NativeCommand::EndRenderPass => device.cmd_end_render_pass(cmd),
                NativeCommand::SetViewport(viewport) => device.cmd_set_viewport(cmd, 0, &[viewport]),
                NativeCommand::SetScissor(scissor) => device.cmd_set_scissor(cmd, 0, &[scissor]),
                NativeCommand::Draw {
                    vertex_count,
                    instance_count,
                    first_vertex,
                    first_instance,
                } => device.cmd_draw(cmd, vertex_count, instance_count, first_vertex, first_instance),
                NativeCommand::DrawIndexed {
                    index_count,
                    instance_count,
                    first_index,
                    vertex_offset,
                    first_instance,
                } => device.cmd_draw_indexed(
                    cmd,
                    index_count,
                    instance_count,
                    first_index,
                    vertex_offset,
                    first_instance,
                ),
                NativeCommand::ImageBarrier {
                    src_stage,
                    dst_stage,
                    barrier,
                } => device.cmd_pipeline_barrier(
                    cmd,
                    src_stage,
                    dst_stage,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[barrier],
                ),
                NativeCommand::BlitImage {
                    src,
                    dst,
                    region,
                    filter,
                } => device.cmd_blit_image(
                    cmd,
                    src,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    dst,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                    filter,
                ),
                NativeCommand::CopyBuffer { src, dst, regions } => {
                    device.cmd_copy_buffer(cmd, src, dst, regions)
                }
                NativeCommand::CopyBufferToImage {
                    src,
                    dst,
                    layout,
                    regions,
                } => device.cmd_copy_buffer_to_image(cmd, src, dst, layout, regions),
                NativeCommand::ClearColorImage {
                    image,
                    layout,
                    color,
                    range,
                } => device.cmd_clear_color_image(cmd, image, layout, &color, &[range]),
            }
        }
    }

    pub fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        unsafe { self.device.device.create_semaphore(&semaphore_info, None) }
    }

    pub fn create_timeline_semaphore(&self, initial_value: u64) -> VkResult<vk::Semaphore> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let semaphore_info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);
        unsafe { self.device.device.create_semaphore(&semaphore_info, None) }
    }

    pub fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.device.destroy_semaphore(semaphore, None) }
    }

    pub fn signal_timeline(&self, semaphore: vk::Semaphore, value: u64) -> VkResult<()> {
        let signal_info = vk::SemaphoreSignalInfo::builder()
            .semaphore(semaphore)
            .value(value);
        unsafe { self.device.device.signal_semaphore(&signal_info) }
    }

    pub fn wait_timeline(
        &self,
        semaphore: vk::Semaphore,
        value: u64,
        timeout: Duration,
    ) -> VkResult<bool> {
        let semaphores = [semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);

        match unsafe { self.device.device.wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn timeline_value(&self, semaphore: vk::Semaphore) -> VkResult<u64> {
        unsafe { self.device.device.get_semaphore_counter_value(semaphore) }
    }

    pub fn queue_submit(&self, queue: vk::Queue, batch: &SubmitBatch) -> VkResult<()> {
        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::builder()
            .wait_semaphore_values(&batch.wait_values)
            .signal_semaphore_values(&batch.signal_values);

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&batch.wait_semaphores)
            .wait_dst_stage_mask(&batch.wait_stages)
            .command_buffers(&batch.command_buffers)
            .signal_semaphores(&batch.signal_semaphores)
            .push_next(&mut timeline_info);

        let _queue = self.queue_lock.lock();
        unsafe {
            self.device
                .device
                .queue_submit(queue, &[submit_info.build()], vk::Fence::null())
        }
    }

    pub fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()> {
        let _queue = self.queue_lock.lock();
        unsafe { self.device.device.queue_wait_idle(queue) }
    }

    pub fn format_supports_linear_blit(&self, format: vk::Format) -> bool {
        let properties = unsafe {
            self.device
                .instance
                .get_physical_device_format_properties(self.device.physical_device, format)
        };
        properties
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
    }

    pub fn swapchain_images(&self) -> Option<SwapchainImages> {
        let presentation = self.presentation.lock();
        let swapchain = presentation.as_ref()?.swapchain.as_ref()?;
        Some(SwapchainImages {
            images: swapchain.images.clone(),
            format: swapchain.format,
            extent: swapchain.extent,
        })
    }

    pub fn recreate_swapchain(&self, width: u32, height: u32) -> Result<()> {
        let mut presentation = self.presentation.lock();
        let presentation = presentation
            .as_mut()
            .context("Driver was created without a surface")?;

        self.device.wait_idle()?;

        // The surface can only have one swapchain at a time
        presentation.swapchain = None;
        presentation.swapchain = Some(Swapchain::new(
            self.device.clone(),
            presentation.surface,
            &presentation.surface_loader,
            width,
            height,
            presentation.present_mode,
        )?);
        Ok(())
    }

    pub fn acquire_next_image(&self, signal: vk::Semaphore) -> VkResult<(u32, bool)> {
        let presentation = self.presentation.lock();
        let swapchain = presentation
            .as_ref()
            .and_then(|p| p.swapchain.as_ref())
            .ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)?;
        swapchain.acquire_next_image(u64::MAX, signal)
    }

    pub fn queue_present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> VkResult<bool> {
        let presentation = self.presentation.lock();
        let swapchain = presentation
            .as_ref()
            .and_then(|p| p.swapchain.as_ref())
            .ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)?;
        let _queue = self.queue_lock.lock();
        swapchain.present(queue, image_index, &[wait])
    }

    pub fn wait_idle(&self) -> VkResult<()> {
        let _queue = self.queue_lock.lock();
        unsafe { self.device.device.device_wait_idle() }
    }
}

impl Drop for VulkanDriver {
    fn drop(&mut self) {
        let _ = self.wait_idle();
        if let Some(mut presentation) = self.presentation.lock().take() {
            // Swapchain first, then the surface it was created from
            presentation.swapchain = None;
            unsafe {
                presentation
                    .surface_loader
                    .destroy_surface(presentation.surface, None);
            }
        }
    }
}
