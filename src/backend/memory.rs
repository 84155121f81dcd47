// GPU memory - buffers and textures backed by gpu-allocator
//
// Setup-time resources only: data goes through a host-visible staging buffer
// and is copied on the GPU through the immediate submit path. Vulkan backend
// only; the headless driver has no memory to allocate.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::driver::QueueType;
use super::image::Image;
use super::VulkanDevice;
use crate::gfx::GraphicsDevice;

fn allocate(
    device: &VulkanDevice,
    name: &str,
    requirements: vk::MemoryRequirements,
    location: MemoryLocation,
    linear: bool,
) -> Result<Allocation> {
    let mut guard = device.allocator.lock();
    let allocator = guard.as_mut().context("Allocator has already been shut down")?;
    let allocation = allocator
        .allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
        .with_context(|| format!("Failed to allocate memory for {}", name))?;
    Ok(allocation)
}

fn free(device: &VulkanDevice, allocation: Allocation) {
    if let Some(allocator) = device.allocator.lock().as_mut() {
        if let Err(e) = allocator.free(allocation) {
            log::warn!("Failed to free GPU allocation: {}", e);
        }
    }
}

/// Buffer plus its memory allocation
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    allocation: Option<Allocation>,
    device: Arc<VulkanDevice>,
}

impl GpuBuffer {
    /// `queue_families` with more than one distinct family makes the buffer
    /// concurrently shared between them
    pub fn new(
        device: &Arc<VulkanDevice>,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        queue_families: &[u32],
    ) -> Result<Self> {
        let mut families = queue_families.to_vec();
        families.sort_unstable();
        families.dedup();

        let mut buffer_info = vk::BufferCreateInfo::builder().size(size).usage(usage);
        buffer_info = if families.len() > 1 {
            buffer_info
                .sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&families)
        } else {
            buffer_info.sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .with_context(|| format!("Failed to create buffer {}", name))?;
        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = match allocate(device, name, requirements, location, true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };
        unsafe {
            device
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        }
        .context("Failed to bind buffer memory")?;

        Ok(Self {
            buffer,
            size,
            allocation: Some(allocation),
            device: device.clone(),
        })
    }

    /// Copy `data` into a host-visible buffer
    pub fn write<T: Copy>(&mut self, data: &[T]) -> Result<()> {
        let bytes = std::mem::size_of_val(data);
        let mapped = self
            .allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
            .context("Buffer memory is not host visible")?;
        anyhow::ensure!(
            bytes <= mapped.len(),
            "Writing {} bytes into a {} byte buffer",
            bytes,
            mapped.len()
        );
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr() as *const u8, mapped.as_mut_ptr(), bytes);
        }
        Ok(())
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_buffer(self.buffer, None) };
        if let Some(allocation) = self.allocation.take() {
            free(&self.device, allocation);
        }
    }
}

/// Sampled 2D texture with tracked layout
pub struct GpuTexture {
    pub image: Arc<Image>,
    allocation: Option<Allocation>,
    device: Arc<VulkanDevice>,
}

impl GpuTexture {
    pub fn new(
        device: &Arc<VulkanDevice>,
        name: &str,
        extent: vk::Extent2D,
        format: vk::Format,
        mip_levels: u32,
        usage: vk::ImageUsageFlags,
    ) -> Result<Self> {
        let extent = vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        };
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(extent)
            .mip_levels(mip_levels)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = unsafe { device.device.create_image(&image_info, None) }
            .with_context(|| format!("Failed to create image {}", name))?;
        let requirements = unsafe { device.device.get_image_memory_requirements(handle) };

        let allocation = match allocate(device, name, requirements, MemoryLocation::GpuOnly, false) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_image(handle, None) };
                return Err(e);
            }
        };
        unsafe {
            device
                .device
                .bind_image_memory(handle, allocation.memory(), allocation.offset())
        }
        .context("Failed to bind image memory")?;

        Ok(Self {
            image: Arc::new(Image::new(handle, format, extent, mip_levels, 1)),
            allocation: Some(allocation),
            device: device.clone(),
        })
    }
}

impl Drop for GpuTexture {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_image(self.image.handle, None) };
        if let Some(allocation) = self.allocation.take() {
            free(&self.device, allocation);
        }
    }
}

/// Number of mip levels down to 1x1
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

fn vulkan_device(gfx: &GraphicsDevice) -> Result<Arc<VulkanDevice>> {
    gfx.driver()
        .as_vulkan()
        .map(|driver| driver.device().clone())
        .context("GPU memory needs the Vulkan backend")
}

/// Create a device-local buffer and fill it through a staging copy on the
/// transfer queue
pub fn upload_buffer<T: Copy>(
    gfx: &GraphicsDevice,
    name: &str,
    usage: vk::BufferUsageFlags,
    data: &[T],
) -> Result<GpuBuffer> {
    let device = vulkan_device(gfx)?;
    let size = std::mem::size_of_val(data) as vk::DeviceSize;
    anyhow::ensure!(size > 0, "Uploading an empty buffer ({})", name);

    let mut staging = GpuBuffer::new(
        &device,
        &format!("{} (staging)", name),
        size,
        vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryLocation::CpuToGpu,
        &[],
    )?;
    staging.write(data)?;

    let buffer = GpuBuffer::new(
        &device,
        name,
        size,
        usage | vk::BufferUsageFlags::TRANSFER_DST,
        MemoryLocation::GpuOnly,
        &[device.graphics_queue_family, device.transfer_queue_family],
    )?;

    gfx.execute_immediate(QueueType::Transfer, |cmd| {
        cmd.copy_buffer(
            staging.buffer,
            buffer.buffer,
            &[vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size,
            }],
        );
    })?;

    log::debug!("Uploaded buffer {} ({} bytes)", name, size);
    Ok(buffer)
}

/// Upload RGBA8 pixels into a sampled texture, generating mips when the
/// format can be blitted with linear filtering
pub fn upload_texture(
    gfx: &GraphicsDevice,
    name: &str,
    width: u32,
    height: u32,
    rgba: &[u8],
) -> Result<GpuTexture> {
    let device = vulkan_device(gfx)?;
    anyhow::ensure!(
        rgba.len() == (width as usize) * (height as usize) * 4,
        "Texture {} expects {}x{} RGBA8 pixels, got {} bytes",
        name,
        width,
        height,
        rgba.len()
    );

    let format = vk::Format::R8G8B8A8_UNORM;
    let generate_mips = gfx.driver().format_supports_linear_blit(format);
    let mip_levels = if generate_mips {
        mip_level_count(width, height)
    } else {
        1
    };

    let mut staging = GpuBuffer::new(
        &device,
        &format!("{} (staging)", name),
        rgba.len() as vk::DeviceSize,
        vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryLocation::CpuToGpu,
        &[],
    )?;
    staging.write(rgba)?;

    let texture = GpuTexture::new(
        &device,
        name,
        vk::Extent2D { width, height },
        format,
        mip_levels,
        vk::ImageUsageFlags::SAMPLED
            | vk::ImageUsageFlags::TRANSFER_DST
            | vk::ImageUsageFlags::TRANSFER_SRC,
    )?;

    let region = vk::BufferImageCopy {
        buffer_offset: 0,
        buffer_row_length: 0,
        buffer_image_height: 0,
        image_subresource: vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        },
        image_offset: vk::Offset3D::default(),
        image_extent: texture.image.extent,
    };

    // Blits need a graphics-capable queue
    gfx.execute_immediate(QueueType::Graphics, |cmd| {
        cmd.transition_image_layout(&texture.image, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        cmd.copy_buffer_to_image(staging.buffer, &texture.image, &[region]);
        cmd.generate_mipmap(&texture.image, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    })?;

    log::debug!(
        "Uploaded texture {} ({}x{}, {} mips)",
        name,
        width,
        height,
        mip_levels
    );
    Ok(texture)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::driver::Driver;
    use crate::backend::headless::HeadlessConfig;
    use crate::config::Config;

    #[test]
    fn mip_chain_reaches_one_texel() {
        assert_eq!(mip_level_count(1, 1), 1);
        assert_eq!(mip_level_count(256, 256), 9);
        assert_eq!(mip_level_count(300, 20), 9);
        assert_eq!(mip_level_count(0, 0), 1);
    }

    #[test]
    fn uploads_need_the_vulkan_backend() {
        let gfx = GraphicsDevice::new(Driver::headless(HeadlessConfig::default()), &Config::default())
            .unwrap();
        let err = upload_buffer(&gfx, "vertices", vk::BufferUsageFlags::VERTEX_BUFFER, &[1.0f32; 3])
            .err()
            .unwrap();
        assert!(err.to_string().contains("Vulkan backend"));
    }
}
