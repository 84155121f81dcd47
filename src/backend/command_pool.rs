// Command pool - bounded allocation and reuse of command buffers
//
// One native pool per queue family user. Buffers are allocated in small
// batches up to a hard ceiling and come back through `release` once the
// recycle thread is done with them.

use ash::prelude::VkResult;
use ash::vk;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::command_buffer::{CommandBuffer, CommandBufferRef, CommandBufferUsage};
use super::driver::Driver;

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(0);

struct PoolState {
    free: Vec<CommandBufferRef>,
    allocated: usize,
}

/// The part of a pool its checked-out buffers keep alive
pub(crate) struct PoolShared {
    id: u32,
    driver: Arc<Driver>,
    handle: vk::CommandPool,
    queue_family: u32,
    external: bool,
    capacity: usize,
    batch: usize,
    state: Mutex<PoolState>,
}

impl PoolShared {
    /// Put a reset buffer back on the free list
    pub(crate) fn release(&self, buffer: CommandBufferRef) {
        {
            let cmd = buffer.lock();
            debug_assert_eq!(cmd.pool_id(), self.id, "command buffer returned to the wrong pool");
            debug_assert!(!cmd.in_execution());
        }
        self.state.lock().free.push(buffer);
    }

    fn grow(&self, state: &mut PoolState) -> CommandBufferRef {
        assert!(
            state.allocated < self.capacity,
            "command pool {} exhausted ({} command buffers)",
            self.id,
            self.capacity
        );
        let count = self.batch.clamp(1, self.capacity - state.allocated);
        let handles = self
            .driver
            .allocate_command_buffers(self.handle, count as u32)
            .unwrap_or_else(|e| {
                log::error!("vkAllocateCommandBuffers failed in pool {}: {:?}", self.id, e);
                panic!("failed to allocate command buffers: {:?}", e)
            });

        let first_id = state.allocated as u32;
        let mut created: Vec<CommandBufferRef> = handles
            .into_iter()
            .enumerate()
            .map(|(i, handle)| {
                Arc::new(Mutex::new(CommandBuffer::new(
                    first_id + i as u32,
                    self.id,
                    handle,
                    self.driver.clone(),
                )))
            })
            .collect();
        state.allocated += created.len();
        log::debug!(
            "Command pool {} grew to {}/{} buffers",
            self.id,
            state.allocated,
            self.capacity
        );

        let first = created.remove(0);
        // Lowest ids are handed out first
        state.free.extend(created.into_iter().rev());
        first
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        log::debug!("Destroying command pool {}", self.id);
        self.driver.destroy_command_pool(self.handle);
    }
}

pub struct CommandPool {
    shared: Arc<PoolShared>,
}

impl CommandPool {
    pub fn new(
        driver: Arc<Driver>,
        queue_family: u32,
        capacity: usize,
        batch: usize,
        external: bool,
    ) -> VkResult<Self> {
        let handle = driver.create_command_pool(queue_family)?;
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "Created {} command pool {} (family {}, capacity {})",
            if external { "external" } else { "default" },
            id,
            queue_family,
            capacity
        );
        Ok(Self {
            shared: Arc::new(PoolShared {
                id,
                driver,
                handle,
                queue_family,
                external,
                capacity,
                batch,
                state: Mutex::new(PoolState {
                    free: Vec::with_capacity(capacity),
                    allocated: 0,
                }),
            }),
        })
    }

    /// Hand out a buffer that is already recording.
    ///
    /// Buffers from an external pool are tagged EXPLICIT; buffers from a
    /// default pool are IMPLICIT until their manager says otherwise.
    pub fn request_primary_command_buffer(&self) -> CommandBufferRef {
        let buffer = {
            let mut state = self.shared.state.lock();
            match state.free.pop() {
                Some(buffer) => buffer,
                None => self.shared.grow(&mut state),
            }
        };

        let usage = if self.shared.external {
            CommandBufferUsage::EXPLICIT
        } else {
            CommandBufferUsage::IMPLICIT
        };
        {
            let mut cmd = buffer.lock();
            cmd.checkout(self.shared.clone(), usage, self.shared.external);
            cmd.begin_command_buffer(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        }
        buffer
    }

    /// Give back a buffer that was never submitted
    pub fn release(&self, buffer: CommandBufferRef) {
        let pool = buffer.lock().reset_after_execution();
        debug_assert!(pool.is_some(), "command buffer was not checked out");
        self.shared.release(buffer);
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn queue_family(&self) -> u32 {
        self.shared.queue_family
    }

    pub fn is_external(&self) -> bool {
        self.shared.external
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn allocated_count(&self) -> usize {
        self.shared.state.lock().allocated
    }

    pub fn free_count(&self) -> usize {
        self.shared.state.lock().free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::HeadlessConfig;

    fn pool(capacity: usize, batch: usize, external: bool) -> (Arc<Driver>, CommandPool) {
        let driver = Arc::new(Driver::headless(HeadlessConfig::default()));
        let pool = CommandPool::new(driver.clone(), 0, capacity, batch, external).unwrap();
        (driver, pool)
    }

    #[test]
    fn buffers_leave_the_pool_recording() {
        let (_driver, pool) = pool(8, 4, false);
        let buffer = pool.request_primary_command_buffer();
        let cmd = buffer.lock();
        assert!(cmd.is_recording());
        assert_eq!(cmd.usage(), CommandBufferUsage::IMPLICIT);
        assert!(!cmd.is_external());
        assert_eq!(cmd.pool_id(), pool.id());
        assert_eq!(cmd.id(), 0);
    }

    #[test]
    fn growth_is_batched_and_never_passes_capacity() {
        let (driver, pool) = pool(5, 2, false);
        let held: Vec<_> = (0..5).map(|_| pool.request_primary_command_buffer()).collect();

        assert_eq!(pool.allocated_count(), 5);
        assert_eq!(pool.free_count(), 0);
        assert_eq!(driver.as_headless().unwrap().stats().command_buffers_allocated, 5);
        let ids: Vec<u32> = held.iter().map(|b| b.lock().id()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn released_buffer_is_reused_at_capacity() {
        let (_driver, pool) = pool(2, 1, false);
        let a = pool.request_primary_command_buffer();
        let _b = pool.request_primary_command_buffer();
        let a_id = a.lock().id();

        a.lock().end_command_buffer();
        pool.release(a);
        let c = pool.request_primary_command_buffer();

        assert_eq!(c.lock().id(), a_id);
        assert_eq!(pool.allocated_count(), 2);
    }

    #[test]
    #[should_panic(expected = "exhausted")]
    fn allocating_past_capacity_is_fatal() {
        let (_driver, pool) = pool(3, 2, false);
        let _held: Vec<_> = (0..4).map(|_| pool.request_primary_command_buffer()).collect();
    }

    #[test]
    fn external_pool_tags_explicit() {
        let (_driver, pool) = pool(4, 1, true);
        let buffer = pool.request_primary_command_buffer();
        let cmd = buffer.lock();
        assert_eq!(cmd.usage(), CommandBufferUsage::EXPLICIT);
        assert!(cmd.is_external());
    }

    #[test]
    fn pool_outlives_its_owner_while_buffers_are_out() {
        let (driver, pool) = pool(4, 1, true);
        let buffer = pool.request_primary_command_buffer();
        drop(pool);
        assert_eq!(driver.as_headless().unwrap().stats().command_pools_destroyed, 0);

        drop(buffer);
        assert_eq!(driver.as_headless().unwrap().stats().command_pools_destroyed, 1);
    }
}
