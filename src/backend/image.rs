// Tracked GPU resources
//
// An `Image` remembers the layout, stage and access it was last transitioned
// to. That record is the only synchronization state the engine knows about:
// transitions read it to build barriers and write it back afterwards.
// `DescriptorSet` counts the in-flight command buffers that bound it.

use ash::vk;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

/// Last known state of every subresource of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageState {
    pub layout: vk::ImageLayout,
    pub stage: vk::PipelineStageFlags,
    pub access: vk::AccessFlags,
}

impl ImageState {
    pub const UNDEFINED: Self = Self {
        layout: vk::ImageLayout::UNDEFINED,
        stage: vk::PipelineStageFlags::TOP_OF_PIPE,
        access: vk::AccessFlags::empty(),
    };
}

/// Access mask and pipeline stage implied by using an image in `layout`
pub fn layout_access_and_stage(layout: vk::ImageLayout) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    match layout {
        vk::ImageLayout::UNDEFINED | vk::ImageLayout::PREINITIALIZED => {
            (vk::AccessFlags::empty(), vk::PipelineStageFlags::TOP_OF_PIPE)
        }
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => {
            (vk::AccessFlags::TRANSFER_WRITE, vk::PipelineStageFlags::TRANSFER)
        }
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => {
            (vk::AccessFlags::TRANSFER_READ, vk::PipelineStageFlags::TRANSFER)
        }
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => {
            (vk::AccessFlags::SHADER_READ, vk::PipelineStageFlags::FRAGMENT_SHADER)
        }
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        ),
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL => (
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        vk::ImageLayout::PRESENT_SRC_KHR => {
            (vk::AccessFlags::empty(), vk::PipelineStageFlags::BOTTOM_OF_PIPE)
        }
        vk::ImageLayout::GENERAL => (
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            vk::PipelineStageFlags::COMPUTE_SHADER,
        ),
        _ => (
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
    }
}

/// A native image plus its tracked state. Does not own the memory.
#[derive(Debug)]
pub struct Image {
    pub handle: vk::Image,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub aspect: vk::ImageAspectFlags,
    state: Mutex<ImageState>,
}

impl Image {
    pub fn new(
        handle: vk::Image,
        format: vk::Format,
        extent: vk::Extent3D,
        mip_levels: u32,
        array_layers: u32,
    ) -> Self {
        Self {
            handle,
            format,
            extent,
            mip_levels: mip_levels.max(1),
            array_layers: array_layers.max(1),
            aspect: aspect_for_format(format),
            state: Mutex::new(ImageState::UNDEFINED),
        }
    }

    /// Wrap a swapchain image (single mip, single layer, starts UNDEFINED)
    pub fn from_swapchain(handle: vk::Image, format: vk::Format, extent: vk::Extent2D) -> Self {
        Self::new(
            handle,
            format,
            vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            1,
            1,
        )
    }

    pub fn state(&self) -> ImageState {
        *self.state.lock()
    }

    pub fn layout(&self) -> vk::ImageLayout {
        self.state.lock().layout
    }

    pub(crate) fn set_state(&self, state: ImageState) {
        *self.state.lock() = state;
    }

    pub fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect,
            base_mip_level: 0,
            level_count: self.mip_levels,
            base_array_layer: 0,
            layer_count: self.array_layers,
        }
    }

    pub fn mip_range(&self, level: u32) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect,
            base_mip_level: level,
            level_count: 1,
            base_array_layer: 0,
            layer_count: self.array_layers,
        }
    }

    /// Size of a mip level, never smaller than 1 texel per axis
    pub fn mip_extent(&self, level: u32) -> vk::Extent3D {
        vk::Extent3D {
            width: (self.extent.width >> level).max(1),
            height: (self.extent.height >> level).max(1),
            depth: (self.extent.depth >> level).max(1),
        }
    }
}

fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// A descriptor set produced upstream (shader reflection / material setup).
///
/// Several in-flight command buffers may bind the same set, so usage is a
/// counter: bound once per command buffer, released once at recycle time.
#[derive(Debug)]
pub struct DescriptorSet {
    pub handle: vk::DescriptorSet,
    users: AtomicU32,
}

impl DescriptorSet {
    pub fn new(handle: vk::DescriptorSet) -> Self {
        Self {
            handle,
            users: AtomicU32::new(0),
        }
    }

    /// True while any command buffer that bound this set has not been recycled
    pub fn is_in_use(&self) -> bool {
        self.users.load(Ordering::Acquire) > 0
    }

    pub(crate) fn mark_in_use(&self) {
        self.users.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release(&self) {
        let previous = self.users.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "descriptor set released more often than bound");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_extent_never_reaches_zero() {
        let image = Image::new(
            vk::Image::null(),
            vk::Format::R8G8B8A8_UNORM,
            vk::Extent3D { width: 256, height: 64, depth: 1 },
            9,
            1,
        );
        assert_eq!(image.mip_extent(2).width, 64);
        assert_eq!(image.mip_extent(2).height, 16);
        assert_eq!(image.mip_extent(8).width, 1);
        assert_eq!(image.mip_extent(8).height, 1);
    }

    #[test]
    fn depth_formats_get_depth_aspect() {
        let depth = Image::new(
            vk::Image::null(),
            vk::Format::D32_SFLOAT,
            vk::Extent3D { width: 4, height: 4, depth: 1 },
            1,
            1,
        );
        assert_eq!(depth.aspect, vk::ImageAspectFlags::DEPTH);
        assert_eq!(depth.layout(), vk::ImageLayout::UNDEFINED);
    }

    #[test]
    fn transfer_layouts_map_to_transfer_stage() {
        let (access, stage) = layout_access_and_stage(vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(stage, vk::PipelineStageFlags::TRANSFER);

        let (access, stage) = layout_access_and_stage(vk::ImageLayout::PRESENT_SRC_KHR);
        assert!(access.is_empty());
        assert_eq!(stage, vk::PipelineStageFlags::BOTTOM_OF_PIPE);
    }

    #[test]
    fn descriptor_set_counts_users() {
        let set = DescriptorSet::new(vk::DescriptorSet::null());
        assert!(!set.is_in_use());
        set.mark_in_use();
        set.mark_in_use();
        set.release();
        assert!(set.is_in_use());
        set.release();
        assert!(!set.is_in_use());
    }
}
