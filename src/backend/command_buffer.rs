// Command buffer - one recordable, submittable unit of GPU work
//
// Lifecycle: Free -> Recording -> InExecution -> Free. A buffer leaves its
// pool already recording, is closed by its owner or by the command manager,
// travels through the submission pipeline and is reset by the recycle thread
// once its timeline semaphore has been reached.
//
// Wait/signal semaphores and bound descriptor sets accumulate on the buffer
// while it records. They are read once at submission and cleared at recycle.

use ash::vk;
use bitflags::bitflags;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use super::command_pool::PoolShared;
use super::driver::{Driver, NativeCommand, SubmitBatch};
use super::image::{layout_access_and_stage, DescriptorSet, Image, ImageState};
use super::sync::{Semaphore, TimelineSemaphore};

bitflags! {
    /// Who manages a command buffer's recording lifecycle
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CommandBufferUsage: u32 {
        /// Requested by a caller that begins and ends it itself
        const EXPLICIT = 1 << 0;
        /// Owned by the device for routine per-frame work
        const IMPLICIT = 1 << 1;
    }
}

/// Command buffers move between threads, so they are shared behind a lock
pub type CommandBufferRef = Arc<Mutex<CommandBuffer>>;

#[derive(Debug, Clone, Copy)]
struct TimelineWait {
    semaphore: TimelineSemaphore,
    stage: vk::PipelineStageFlags,
}

pub struct CommandBuffer {
    id: u32,
    pool_id: u32,
    handle: vk::CommandBuffer,
    driver: Arc<Driver>,
    // Held from checkout until the buffer is released back to its pool
    pool_guard: Option<Arc<PoolShared>>,

    is_recording: bool,
    in_render_pass: bool,
    in_execution: bool,
    is_external: bool,
    usage: CommandBufferUsage,
    deferrals: u32,

    wait_presentation: Vec<Semaphore>,
    signal_presentation: Vec<Semaphore>,
    wait_timelines: Vec<TimelineWait>,
    signal_timelines: Vec<TimelineSemaphore>,
    descriptor_sets: VecDeque<Arc<DescriptorSet>>,
}

impl CommandBuffer {
    pub(crate) fn new(id: u32, pool_id: u32, handle: vk::CommandBuffer, driver: Arc<Driver>) -> Self {
        Self {
            id,
            pool_id,
            handle,
            driver,
            pool_guard: None,
            is_recording: false,
            in_render_pass: false,
            in_execution: false,
            is_external: false,
            usage: CommandBufferUsage::empty(),
            deferrals: 0,
            wait_presentation: Vec::new(),
            signal_presentation: Vec::new(),
            wait_timelines: Vec::new(),
            signal_timelines: Vec::new(),
            descriptor_sets: VecDeque::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn pool_id(&self) -> u32 {
        self.pool_id
    }

    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    pub fn usage(&self) -> CommandBufferUsage {
        self.usage
    }

    pub fn is_recording(&self) -> bool {
        self.is_recording
    }

    pub fn in_render_pass(&self) -> bool {
        self.in_render_pass
    }

    pub fn in_execution(&self) -> bool {
        self.in_execution
    }

    pub fn is_external(&self) -> bool {
        self.is_external
    }

    /// Consecutive submit calls that skipped this buffer
    pub fn deferrals(&self) -> u32 {
        self.deferrals
    }

    pub fn bound_descriptor_set_count(&self) -> usize {
        self.descriptor_sets.len()
    }

    // =========================================================================
    // Recording lifecycle
    // =========================================================================

    pub fn begin_command_buffer(&mut self, flags: vk::CommandBufferUsageFlags) {
        assert!(
            !self.is_recording,
            "command buffer {} (pool {}) is already recording",
            self.id, self.pool_id
        );
        if let Err(e) = self.driver.begin_command_buffer(self.handle, flags) {
            log::error!("vkBeginCommandBuffer failed for command buffer {}: {:?}", self.id, e);
            panic!("failed to begin command buffer {}: {:?}", self.id, e);
        }
        self.is_recording = true;
        self.in_render_pass = false;
        self.in_execution = false;
    }

    /// Close recording, ending an open render pass first
    pub fn end_command_buffer(&mut self) {
        debug_assert!(self.is_recording, "ending command buffer {} that is not recording", self.id);
        if self.in_render_pass {
            self.end_render_pass();
        }
        if let Err(e) = self.driver.end_command_buffer(self.handle) {
            log::error!("vkEndCommandBuffer failed for command buffer {}: {:?}", self.id, e);
            panic!("failed to end command buffer {}: {:?}", self.id, e);
        }
        self.is_recording = false;
    }

    fn record(&self, command: NativeCommand<'_>) {
        debug_assert!(
            self.is_recording,
            "recording into command buffer {} (pool {}) outside begin/end",
            self.id, self.pool_id
        );
        self.driver.record(self.handle, command);
    }

    // =========================================================================
    // Bindings
    // =========================================================================

    pub fn bind_vertex_buffers(
        &mut self,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    ) {
        debug_assert_eq!(buffers.len(), offsets.len());
        self.record(NativeCommand::BindVertexBuffers {
            first_binding,
            buffers,
            offsets,
        });
    }

    pub fn bind_index_buffer(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize, index_type: vk::IndexType) {
        self.record(NativeCommand::BindIndexBuffer {
            buffer,
            offset,
            index_type,
        });
    }

    pub fn bind_pipeline(&mut self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        self.record(NativeCommand::BindPipeline { bind_point, pipeline });
    }

    /// Bind sets and keep them marked in use until this buffer is recycled
    pub fn bind_descriptor_sets(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[Arc<DescriptorSet>],
    ) {
        let handles: Vec<vk::DescriptorSet> = sets.iter().map(|set| set.handle).collect();
        self.record(NativeCommand::BindDescriptorSets {
            bind_point,
            layout,
            first_set,
            sets: &handles,
        });
        for set in sets {
            set.mark_in_use();
            self.descriptor_sets.push_back(set.clone());
        }
    }

    // =========================================================================
    // Render passes and draws
    // =========================================================================

    pub fn begin_render_pass(
        &mut self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        render_area: vk::Rect2D,
        clear_values: &[vk::ClearValue],
    ) {
        debug_assert!(!self.in_render_pass, "render pass already open on command buffer {}", self.id);
        self.record(NativeCommand::BeginRenderPass {
            render_pass,
            framebuffer,
            render_area,
            clear_values,
        });
        self.in_render_pass = true;
    }

    pub fn end_render_pass(&mut self) {
        debug_assert!(self.in_render_pass, "no render pass open on command buffer {}", self.id);
        self.record(NativeCommand::EndRenderPass);
        self.in_render_pass = false;
    }

    pub fn set_viewport(&mut self, viewport: vk::Viewport) {
        self.record(NativeCommand::SetViewport(viewport));
    }

    pub fn set_scissor(&mut self, scissor: vk::Rect2D) {
        self.record(NativeCommand::SetScissor(scissor));
    }

    /// Zero vertices or instances is skipped, not an error
    pub fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        if vertex_count == 0 || instance_count == 0 {
            return;
        }
        debug_assert!(self.in_render_pass, "draw outside a render pass on command buffer {}", self.id);
        self.record(NativeCommand::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        });
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        if index_count == 0 || instance_count == 0 {
            return;
        }
        debug_assert!(self.in_render_pass, "draw outside a render pass on command buffer {}", self.id);
        self.record(NativeCommand::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        });
    }

    // =========================================================================
    // Images and transfers
    // =========================================================================

    /// Move every subresource of `image` to `new_layout`.
    ///
    /// Source access/stage come from the image's tracked state, destination
    /// access/stage from the layout table. Same layout is a no-op.
    pub fn transition_image_layout(&mut self, image: &Image, new_layout: vk::ImageLayout) {
        let current = image.state();
        if current.layout == new_layout {
            return;
        }
        let (dst_access, dst_stage) = layout_access_and_stage(new_layout);
        self.image_barrier(
            image,
            image.full_range(),
            (current.layout, new_layout),
            (current.access, dst_access),
            (current.stage, dst_stage),
        );
        image.set_state(ImageState {
            layout: new_layout,
            stage: dst_stage,
            access: dst_access,
        });
    }

    /// Fill mip levels 1..N from level 0 and leave the whole image in `target_layout`
    pub fn generate_mipmap(&mut self, image: &Image, target_layout: vk::ImageLayout) {
        debug_assert!(
            self.driver.format_supports_linear_blit(image.format),
            "format {:?} does not support linear blits",
            image.format
        );

        if image.mip_levels <= 1 {
            self.transition_image_layout(image, target_layout);
            return;
        }

        let transfer_dst = vk::ImageLayout::TRANSFER_DST_OPTIMAL;
        let transfer_src = vk::ImageLayout::TRANSFER_SRC_OPTIMAL;
        let transfer = vk::PipelineStageFlags::TRANSFER;

        let current = image.state();
        if current.layout != transfer_dst {
            self.image_barrier(
                image,
                image.full_range(),
                (current.layout, transfer_dst),
                (current.access, vk::AccessFlags::TRANSFER_WRITE),
                (current.stage, transfer),
            );
        }

        for level in 0..image.mip_levels - 1 {
            self.image_barrier(
                image,
                image.mip_range(level),
                (transfer_dst, transfer_src),
                (vk::AccessFlags::TRANSFER_WRITE, vk::AccessFlags::TRANSFER_READ),
                (transfer, transfer),
            );

            let src = image.mip_extent(level);
            let dst = image.mip_extent(level + 1);
            let region = vk::ImageBlit {
                src_subresource: subresource_layers(image, level),
                src_offsets: [vk::Offset3D::default(), extent_offset(src)],
                dst_subresource: subresource_layers(image, level + 1),
                dst_offsets: [vk::Offset3D::default(), extent_offset(dst)],
            };
            self.record(NativeCommand::BlitImage {
                src: image.handle,
                dst: image.handle,
                region,
                filter: vk::Filter::LINEAR,
            });
        }

        // Levels 0..N-1 are TRANSFER_SRC now, the last level is still TRANSFER_DST
        let (dst_access, dst_stage) = layout_access_and_stage(target_layout);
        let last = image.mip_levels - 1;
        let mut sources = image.full_range();
        sources.level_count = last;
        self.image_barrier(
            image,
            sources,
            (transfer_src, target_layout),
            (vk::AccessFlags::TRANSFER_READ, dst_access),
            (transfer, dst_stage),
        );
        self.image_barrier(
            image,
            image.mip_range(last),
            (transfer_dst, target_layout),
            (vk::AccessFlags::TRANSFER_WRITE, dst_access),
            (transfer, dst_stage),
        );

        image.set_state(ImageState {
            layout: target_layout,
            stage: dst_stage,
            access: dst_access,
        });
    }

    fn image_barrier(
        &self,
        image: &Image,
        range: vk::ImageSubresourceRange,
        (old_layout, new_layout): (vk::ImageLayout, vk::ImageLayout),
        (src_access, dst_access): (vk::AccessFlags, vk::AccessFlags),
        (src_stage, dst_stage): (vk::PipelineStageFlags, vk::PipelineStageFlags),
    ) {
        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image.handle)
            .subresource_range(range)
            .build();
        self.record(NativeCommand::ImageBarrier {
            src_stage,
            dst_stage,
            barrier,
        });
    }

    pub fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        self.record(NativeCommand::CopyBuffer { src, dst, regions });
    }

    /// The image must already be in TRANSFER_DST_OPTIMAL
    pub fn copy_buffer_to_image(&mut self, src: vk::Buffer, image: &Image, regions: &[vk::BufferImageCopy]) {
        debug_assert_eq!(image.layout(), vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        self.record(NativeCommand::CopyBufferToImage {
            src,
            dst: image.handle,
            layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            regions,
        });
    }

    /// The image must be in TRANSFER_DST_OPTIMAL or GENERAL
    pub fn clear_color_image(&mut self, image: &Image, color: [f32; 4]) {
        let layout = image.layout();
        debug_assert!(
            layout == vk::ImageLayout::TRANSFER_DST_OPTIMAL || layout == vk::ImageLayout::GENERAL,
            "clearing image in layout {:?}",
            layout
        );
        self.record(NativeCommand::ClearColorImage {
            image: image.handle,
            layout,
            color: vk::ClearColorValue { float32: color },
            range: image.full_range(),
        });
    }

    // =========================================================================
    // Semaphore dependencies
    // =========================================================================

    pub fn wait_presentation_semaphore(&mut self, semaphore: Semaphore) {
        self.wait_presentation.push(semaphore);
    }

    pub fn signal_presentation_semaphore(&mut self, semaphore: Semaphore) {
        self.signal_presentation.push(semaphore);
    }

    /// Block this buffer at `stage` until the timeline reaches its wait value
    pub fn wait_semaphore(&mut self, semaphore: TimelineSemaphore, stage: vk::PipelineStageFlags) {
        self.wait_timelines.push(TimelineWait { semaphore, stage });
    }

    pub fn signal_semaphore(&mut self, semaphore: TimelineSemaphore) {
        self.signal_timelines.push(semaphore);
    }

    // =========================================================================
    // Pipeline bookkeeping (pool and command manager only)
    // =========================================================================

    pub(crate) fn checkout(&mut self, pool: Arc<PoolShared>, usage: CommandBufferUsage, external: bool) {
        self.pool_guard = Some(pool);
        self.usage = usage;
        self.is_external = external;
        self.deferrals = 0;
    }

    pub(crate) fn set_usage(&mut self, usage: CommandBufferUsage) {
        self.usage = usage;
    }

    /// Count one more skip; true when a starvation warning is due
    pub(crate) fn note_deferral(&mut self, warning_threshold: u32) -> bool {
        self.deferrals += 1;
        warning_threshold > 0 && self.deferrals % warning_threshold == 0
    }

    pub(crate) fn mark_submitted(&mut self) {
        debug_assert!(!self.is_recording);
        self.in_execution = true;
        self.deferrals = 0;
    }

    /// Append this buffer and its dependencies to a submission
    pub(crate) fn collect_submission(&self, batch: &mut SubmitBatch) {
        batch.command_buffers.push(self.handle);
        for semaphore in &self.wait_presentation {
            batch.wait(semaphore.handle, 0, semaphore.wait_stage);
        }
        for wait in &self.wait_timelines {
            batch.wait(wait.semaphore.handle, wait.semaphore.wait_value, wait.stage);
        }
        for semaphore in &self.signal_presentation {
            batch.signal(semaphore.handle, 0);
        }
        for timeline in &self.signal_timelines {
            batch.signal(timeline.handle, timeline.signal_value);
        }
    }

    /// Clear everything the finished execution held and hand back the owning pool
    pub(crate) fn reset_after_execution(&mut self) -> Option<Arc<PoolShared>> {
        self.wait_presentation.clear();
        self.signal_presentation.clear();
        self.wait_timelines.clear();
        self.signal_timelines.clear();
        for set in self.descriptor_sets.drain(..) {
            set.release();
        }
        self.in_execution = false;
        self.is_recording = false;
        self.in_render_pass = false;
        self.deferrals = 0;
        self.pool_guard.take()
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        if self.in_execution && !std::thread::panicking() {
            log::error!(
                "Command buffer {} (pool {}) destroyed while in execution",
                self.id,
                self.pool_id
            );
            panic!("command buffer {} destroyed while in execution", self.id);
        }
    }
}

fn subresource_layers(image: &Image, level: u32) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: image.aspect,
        mip_level: level,
        base_array_layer: 0,
        layer_count: image.array_layers,
    }
}

fn extent_offset(extent: vk::Extent3D) -> vk::Offset3D {
    vk::Offset3D {
        x: extent.width as i32,
        y: extent.height as i32,
        z: extent.depth as i32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::HeadlessConfig;
    use ash::vk::Handle;

    fn recording_buffer() -> (Arc<Driver>, CommandBuffer) {
        let driver = Arc::new(Driver::headless(HeadlessConfig::default()));
        let mut cmd = CommandBuffer::new(0, 0, vk::CommandBuffer::from_raw(7), driver.clone());
        cmd.begin_command_buffer(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        (driver, cmd)
    }

    fn stats(driver: &Driver) -> crate::backend::headless::HeadlessStats {
        driver.as_headless().unwrap().stats()
    }

    fn color_image(mip_levels: u32) -> Image {
        Image::new(
            vk::Image::from_raw(42),
            vk::Format::R8G8B8A8_UNORM,
            vk::Extent3D { width: 64, height: 64, depth: 1 },
            mip_levels,
            1,
        )
    }

    #[test]
    fn repeated_transition_issues_one_barrier() {
        let (driver, mut cmd) = recording_buffer();
        let image = color_image(1);

        cmd.transition_image_layout(&image, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        cmd.transition_image_layout(&image, vk::ImageLayout::TRANSFER_DST_OPTIMAL);

        assert_eq!(stats(&driver).barriers, 1);
        let state = image.state();
        assert_eq!(state.layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(state.stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(state.access, vk::AccessFlags::TRANSFER_WRITE);
    }

    #[test]
    fn zero_count_draws_never_reach_the_driver() {
        let (driver, mut cmd) = recording_buffer();

        cmd.draw(0, 1, 0, 0);
        cmd.draw(3, 0, 0, 0);
        cmd.draw_indexed(0, 1, 0, 0, 0);
        cmd.draw_indexed(6, 0, 0, 0, 0);

        assert_eq!(stats(&driver).draws, 0);
        assert!(cmd.is_recording());
        assert!(!cmd.in_render_pass());
    }

    #[test]
    fn end_closes_open_render_pass() {
        let (driver, mut cmd) = recording_buffer();
        cmd.begin_render_pass(
            vk::RenderPass::null(),
            vk::Framebuffer::null(),
            vk::Rect2D::default(),
            &[],
        );
        cmd.draw(3, 1, 0, 0);
        cmd.end_command_buffer();

        assert!(!cmd.in_render_pass());
        assert!(!cmd.is_recording());
        let stats = stats(&driver);
        assert_eq!(stats.draws, 1);
        assert_eq!(stats.ends, 1);
    }

    #[test]
    fn mipmap_generation_blits_each_level_and_converges() {
        let (driver, mut cmd) = recording_buffer();
        let image = color_image(4);
        cmd.transition_image_layout(&image, vk::ImageLayout::TRANSFER_DST_OPTIMAL);

        cmd.generate_mipmap(&image, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

        let stats = stats(&driver);
        assert_eq!(stats.blits, 3);
        // initial transition + one per source level + two closing barriers
        assert_eq!(stats.barriers, 1 + 3 + 2);
        assert_eq!(image.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(image.state().stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }

    #[test]
    fn dependencies_are_collected_then_cleared() {
        let (_driver, mut cmd) = recording_buffer();
        let present = Semaphore {
            handle: vk::Semaphore::from_raw(100),
            wait_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            id: 0,
        };
        let timeline = TimelineSemaphore {
            handle: vk::Semaphore::from_raw(200),
            wait_value: 4,
            signal_value: 4,
            id: 0,
        };
        cmd.wait_presentation_semaphore(present);
        cmd.wait_semaphore(timeline, vk::PipelineStageFlags::TRANSFER);
        cmd.signal_semaphore(timeline);
        cmd.end_command_buffer();

        let mut batch = SubmitBatch::default();
        cmd.collect_submission(&mut batch);
        assert_eq!(batch.command_buffers, vec![cmd.handle()]);
        assert_eq!(batch.wait_semaphores.len(), 2);
        assert_eq!(batch.wait_values, vec![0, 4]);
        assert_eq!(batch.signal_values, vec![4]);

        cmd.mark_submitted();
        assert!(cmd.reset_after_execution().is_none());
        let mut empty = SubmitBatch::default();
        cmd.collect_submission(&mut empty);
        assert!(empty.wait_semaphores.is_empty());
        assert!(empty.signal_semaphores.is_empty());
    }

    #[test]
    fn deferral_warning_fires_on_each_multiple() {
        let (_driver, mut cmd) = recording_buffer();
        let due: Vec<bool> = (0..6).map(|_| cmd.note_deferral(3)).collect();
        assert_eq!(due, vec![false, false, true, false, false, true]);
        cmd.end_command_buffer();
        cmd.mark_submitted();
        assert_eq!(cmd.deferrals(), 0);
        cmd.reset_after_execution();
    }

    #[test]
    #[should_panic(expected = "destroyed while in execution")]
    fn dropping_buffer_in_execution_is_fatal() {
        let (_driver, mut cmd) = recording_buffer();
        cmd.end_command_buffer();
        cmd.mark_submitted();
        drop(cmd);
    }
}
