// Backend module - native layer and the command engine
//
// driver/vulkan/headless: the closed set of native backends
// device/surface/swapchain: Vulkan setup
// sync, image: semaphore pool and tracked resources
// command_*: command buffers, pools and the per-queue submission pipeline

pub mod command_buffer;
pub mod command_manager;
pub mod command_pool;
pub mod device;
pub mod driver;
pub mod headless;
pub mod image;
pub mod memory;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod vulkan;

pub use device::VulkanDevice;
pub use swapchain::Swapchain;
