// Synchronization primitives
//
// Binary semaphores hook the presentation engine up (image available /
// render finished); timeline semaphores track every submission. Both live in
// fixed-capacity slot pools indexed by id, so handing one out never allocates
// once the pool has warmed up.

use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

use super::driver::Driver;

/// Hard ceilings for the semaphore pools
#[derive(Debug, Clone, Copy)]
pub struct SyncLimits {
    pub max_semaphore_count: usize,
    pub max_timeline_semaphore_count: usize,
}

impl Default for SyncLimits {
    fn default() -> Self {
        Self {
            max_semaphore_count: 64,
            max_timeline_semaphore_count: 64,
        }
    }
}

/// Binary semaphore checked out of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Semaphore {
    pub handle: vk::Semaphore,
    /// Stage a submission waiting on this semaphore blocks at
    pub wait_stage: vk::PipelineStageFlags,
    pub id: u32,
}

/// Timeline semaphore checked out of the pool.
///
/// This is a snapshot: the pool advances the values on every checkout, so a
/// copy kept around after the semaphore was returned still names the value
/// its own work signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineSemaphore {
    pub handle: vk::Semaphore,
    pub wait_value: u64,
    pub signal_value: u64,
    pub id: u32,
}

impl TimelineSemaphore {
    pub fn update_timeline(&mut self) {
        self.wait_value += 1;
        self.signal_value += 1;
    }
}

/// Slots plus a parallel availability map
struct SlotPool<T> {
    entries: Vec<T>,
    available: Vec<bool>,
}

impl<T> SlotPool<T> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            available: Vec::with_capacity(capacity),
        }
    }

    /// Claim the first free slot
    fn claim(&mut self) -> Option<usize> {
        let index = self.available.iter().position(|&free| free)?;
        self.available[index] = false;
        Some(index)
    }

    /// Add a slot that starts out claimed
    fn push_claimed(&mut self, entry: T) -> usize {
        self.entries.push(entry);
        self.available.push(false);
        self.entries.len() - 1
    }

    fn release(&mut self, index: usize) -> bool {
        match self.available.get_mut(index) {
            Some(free) if !*free => {
                *free = true;
                true
            }
            _ => false,
        }
    }

    fn free_count(&self) -> usize {
        self.available.iter().filter(|&&free| free).count()
    }
}

/// Pool of reusable binary and timeline semaphores
pub struct SyncObjectManager {
    driver: Arc<Driver>,
    limits: SyncLimits,
    semaphores: Mutex<SlotPool<Semaphore>>,
    timelines: Mutex<SlotPool<TimelineSemaphore>>,
}

impl SyncObjectManager {
    pub fn new(driver: Arc<Driver>, limits: SyncLimits) -> Self {
        Self {
            driver,
            semaphores: Mutex::new(SlotPool::with_capacity(limits.max_semaphore_count)),
            timelines: Mutex::new(SlotPool::with_capacity(limits.max_timeline_semaphore_count)),
            limits,
        }
    }

    pub fn limits(&self) -> SyncLimits {
        self.limits
    }

    pub fn request_semaphore(&self) -> Semaphore {
        let mut pool = self.semaphores.lock();
        if let Some(index) = pool.claim() {
            return pool.entries[index];
        }

        assert!(
            pool.entries.len() < self.limits.max_semaphore_count,
            "semaphore pool exhausted ({} in use)",
            self.limits.max_semaphore_count
        );
        let handle = self.driver.create_semaphore().unwrap_or_else(|e| {
            log::error!("vkCreateSemaphore failed: {:?}", e);
            panic!("failed to create semaphore: {:?}", e)
        });
        let semaphore = Semaphore {
            handle,
            wait_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            id: pool.entries.len() as u32,
        };
        pool.push_claimed(semaphore);
        log::debug!("Semaphore pool grew to {}", pool.entries.len());
        semaphore
    }

    /// Check out a timeline semaphore with its values advanced past any earlier use
    pub fn request_timeline_semaphore(&self) -> TimelineSemaphore {
        let mut pool = self.timelines.lock();
        if let Some(index) = pool.claim() {
            let entry = &mut pool.entries[index];
            entry.update_timeline();
            return *entry;
        }

        assert!(
            pool.entries.len() < self.limits.max_timeline_semaphore_count,
            "timeline semaphore pool exhausted ({} in use)",
            self.limits.max_timeline_semaphore_count
        );
        let handle = self.driver.create_timeline_semaphore(0).unwrap_or_else(|e| {
            log::error!("vkCreateSemaphore (timeline) failed: {:?}", e);
            panic!("failed to create timeline semaphore: {:?}", e)
        });
        let mut timeline = TimelineSemaphore {
            handle,
            wait_value: 0,
            signal_value: 0,
            id: pool.entries.len() as u32,
        };
        timeline.update_timeline();
        pool.push_claimed(timeline);
        log::debug!("Timeline semaphore pool grew to {}", pool.entries.len());
        timeline
    }

    /// The GPU must be done with the semaphore before it comes back here
    pub fn return_semaphore(&self, semaphore: Semaphore) {
        let mut pool = self.semaphores.lock();
        debug_assert_eq!(
            pool.entries.get(semaphore.id as usize).map(|s| s.handle),
            Some(semaphore.handle),
            "semaphore {} does not belong to this pool",
            semaphore.id
        );
        let released = pool.release(semaphore.id as usize);
        debug_assert!(released, "semaphore {} returned twice", semaphore.id);
    }

    /// The GPU must have reached the semaphore's value before it comes back here
    pub fn return_timeline_semaphore(&self, timeline: TimelineSemaphore) {
        let mut pool = self.timelines.lock();
        debug_assert_eq!(
            pool.entries.get(timeline.id as usize).map(|s| s.handle),
            Some(timeline.handle),
            "timeline semaphore {} does not belong to this pool",
            timeline.id
        );
        let released = pool.release(timeline.id as usize);
        debug_assert!(released, "timeline semaphore {} returned twice", timeline.id);
    }

    pub fn semaphore_count(&self) -> usize {
        self.semaphores.lock().entries.len()
    }

    pub fn timeline_semaphore_count(&self) -> usize {
        self.timelines.lock().entries.len()
    }

    pub fn available_semaphores(&self) -> usize {
        self.semaphores.lock().free_count()
    }

    pub fn available_timeline_semaphores(&self) -> usize {
        self.timelines.lock().free_count()
    }
}

impl Drop for SyncObjectManager {
    fn drop(&mut self) {
        let semaphores = self.semaphores.get_mut();
        let timelines = self.timelines.get_mut();
        log::debug!(
            "Destroying {} semaphores and {} timeline semaphores",
            semaphores.entries.len(),
            timelines.entries.len()
        );
        for semaphore in &semaphores.entries {
            self.driver.destroy_semaphore(semaphore.handle);
        }
        for timeline in &timelines.entries {
            self.driver.destroy_semaphore(timeline.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::HeadlessConfig;

    fn manager(limits: SyncLimits) -> (Arc<Driver>, SyncObjectManager) {
        let driver = Arc::new(Driver::headless(HeadlessConfig::default()));
        let sync = SyncObjectManager::new(driver.clone(), limits);
        (driver, sync)
    }

    #[test]
    fn back_to_back_timeline_requests_grow_pool_by_two() {
        let (_driver, sync) = manager(SyncLimits {
            max_semaphore_count: 16,
            max_timeline_semaphore_count: 16,
        });
        assert_eq!(sync.timeline_semaphore_count(), 0);

        let first = sync.request_timeline_semaphore();
        let second = sync.request_timeline_semaphore();

        assert_eq!(sync.timeline_semaphore_count(), 2);
        assert_eq!(first.id, 0);
        assert_eq!(second.id, 1);
        assert_ne!(first.handle, second.handle);
        assert_eq!(sync.available_timeline_semaphores(), 0);
    }

    #[test]
    fn timeline_values_strictly_increase_across_checkouts() {
        let (_driver, sync) = manager(SyncLimits::default());

        let mut previous = sync.request_timeline_semaphore();
        for _ in 0..10 {
            sync.return_timeline_semaphore(previous);
            let next = sync.request_timeline_semaphore();
            assert_eq!(next.id, previous.id);
            assert!(next.wait_value > previous.wait_value);
            assert!(next.signal_value > previous.signal_value);
            previous = next;
        }
        assert_eq!(sync.timeline_semaphore_count(), 1);
    }

    #[test]
    fn returned_semaphore_is_reused_before_growing() {
        let (driver, sync) = manager(SyncLimits::default());

        let a = sync.request_semaphore();
        let b = sync.request_semaphore();
        sync.return_semaphore(a);
        assert_eq!(sync.available_semaphores(), 1);
        let c = sync.request_semaphore();

        assert_eq!(sync.available_semaphores(), 0);

        assert_eq!(c.id, a.id);
        assert_ne!(b.id, c.id);
        assert_eq!(sync.semaphore_count(), 2);
        assert_eq!(driver.as_headless().unwrap().stats().semaphores_created, 2);
    }

    #[test]
    #[should_panic(expected = "timeline semaphore pool exhausted")]
    fn exceeding_timeline_capacity_is_fatal() {
        let (_driver, sync) = manager(SyncLimits {
            max_semaphore_count: 2,
            max_timeline_semaphore_count: 2,
        });
        let _a = sync.request_timeline_semaphore();
        let _b = sync.request_timeline_semaphore();
        let _c = sync.request_timeline_semaphore();
    }

    #[test]
    fn dropping_pool_destroys_every_semaphore() {
        let (driver, sync) = manager(SyncLimits::default());
        let _ = sync.request_semaphore();
        let t = sync.request_timeline_semaphore();
        sync.return_timeline_semaphore(t);
        drop(sync);

        assert_eq!(driver.as_headless().unwrap().stats().semaphores_destroyed, 2);
    }
}
