// Command manager - one queue's submit / execute / recycle pipeline
//
// Callers record into buffers and hand them over with
// `submit_command_buffers`, which only packages work and returns. Two
// long-lived threads do the rest:
//
//   caller --PendingSubmit--> submission thread --InFlightBatch--> recycle thread
//
// The submission thread issues the native submit. The recycle thread waits on
// each batch's timeline semaphore, resets the buffers, returns them to their
// pools and gives the semaphore back. A batch that never completes within the
// recycle timeout means the GPU is hung, which aborts the process.

use anyhow::{Context, Result};
use ash::vk;
use crossbeam_channel::{Receiver, SendError, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::command_buffer::{CommandBufferRef, CommandBufferUsage};
use super::command_pool::CommandPool;
use super::driver::{Driver, QueueType, SubmitBatch};
use super::sync::{SyncObjectManager, TimelineSemaphore};

/// The slice of configuration a command manager runs with
#[derive(Debug, Clone)]
pub struct CommandSettings {
    pub max_command_buffer_count: usize,
    pub allocation_batch: usize,
    pub recycle_timeout: Duration,
    pub deferral_warning_threshold: u32,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            max_command_buffer_count: 64,
            allocation_batch: 4,
            recycle_timeout: Duration::from_secs(3),
            deferral_warning_threshold: 64,
        }
    }
}

/// Work packaged by `submit_command_buffers` for the submission thread
struct PendingSubmit {
    batch: SubmitBatch,
    buffers: Vec<CommandBufferRef>,
    semaphore: TimelineSemaphore,
    notify: Option<TimelineSemaphore>,
}

/// Buffers the GPU is executing, keyed by the semaphore that marks their end
struct InFlightBatch {
    semaphore: TimelineSemaphore,
    buffers: Vec<CommandBufferRef>,
}

enum Disposition {
    Submit,
    Defer,
    Skip,
}

/// State the worker threads share with the manager
struct ManagerShared {
    queue_type: QueueType,
    queue: vk::Queue,
    driver: Arc<Driver>,
    sync: Arc<SyncObjectManager>,
    recycle_timeout: Duration,
    pending: Mutex<usize>,
    recycled: Condvar,
}

fn abort_with(message: std::fmt::Arguments<'_>) -> ! {
    log::error!("{}", message);
    log::logger().flush();
    std::process::abort()
}

impl ManagerShared {
    fn run_submission(&self, submissions: Receiver<PendingSubmit>, recycle: Sender<InFlightBatch>) {
        log::info!("{:?} submission thread started", self.queue_type);
        while let Ok(first) = submissions.recv() {
            for pending in std::iter::once(first).chain(submissions.try_iter()) {
                self.submit(pending, &recycle);
            }
            thread::yield_now();
        }
        log::info!("{:?} submission thread stopped", self.queue_type);
    }

    fn submit(&self, pending: PendingSubmit, recycle: &Sender<InFlightBatch>) {
        let PendingSubmit {
            batch,
            buffers,
            semaphore,
            notify,
        } = pending;

        if let Err(e) = self.driver.queue_submit(self.queue, &batch) {
            abort_with(format_args!(
                "{:?} queue submit of {} command buffers failed: {:?}",
                self.queue_type,
                buffers.len(),
                e
            ));
        }
        if let Some(notify) = notify {
            if let Err(e) = self.driver.signal_timeline(notify.handle, notify.signal_value) {
                abort_with(format_args!(
                    "Signalling notify semaphore {} failed: {:?}",
                    notify.id, e
                ));
            }
        }
        log::trace!(
            "{:?} queue: submitted {} command buffers, signalling {} at {}",
            self.queue_type,
            buffers.len(),
            semaphore.id,
            semaphore.signal_value
        );

        if let Err(SendError(_batch)) = recycle.send(InFlightBatch { semaphore, buffers }) {
            abort_with(format_args!("{:?} recycle thread is gone", self.queue_type));
        }
    }

    fn run_recycle(&self, in_flight: Receiver<InFlightBatch>) {
        log::info!("{:?} recycle thread started", self.queue_type);
        while let Ok(first) = in_flight.recv() {
            for batch in std::iter::once(first).chain(in_flight.try_iter()) {
                self.recycle(batch);
            }
        }
        log::info!("{:?} recycle thread stopped", self.queue_type);
    }

    fn recycle(&self, batch: InFlightBatch) {
        let InFlightBatch { semaphore, buffers } = batch;

        match self
            .driver
            .wait_timeline(semaphore.handle, semaphore.wait_value, self.recycle_timeout)
        {
            Ok(true) => {}
            Ok(false) => {
                log::error!(
                    "{:?} queue: timeline semaphore {} did not reach {} within {:?}",
                    self.queue_type,
                    semaphore.id,
                    semaphore.wait_value,
                    self.recycle_timeout
                );
                for buffer in &buffers {
                    let cmd = buffer.lock();
                    log::error!(
                        "Stuck command buffer {} (pool {}) usage {:?}",
                        cmd.id(),
                        cmd.pool_id(),
                        cmd.usage()
                    );
                }
                abort_with(format_args!("GPU hang on the {:?} queue", self.queue_type));
            }
            Err(e) => abort_with(format_args!(
                "Waiting on timeline semaphore {} failed: {:?}",
                semaphore.id, e
            )),
        }

        let count = buffers.len();
        for buffer in buffers {
            let pool = buffer.lock().reset_after_execution();
            match pool {
                Some(pool) => pool.release(buffer),
                None => log::warn!("Recycled a command buffer that has no owning pool"),
            }
        }
        self.sync.return_timeline_semaphore(semaphore);

        let mut pending = self.pending.lock();
        *pending -= count;
        if *pending == 0 {
            self.recycled.notify_all();
        }
    }
}

pub struct CommandManager {
    shared: Arc<ManagerShared>,
    queue_family: u32,
    settings: CommandSettings,
    default_pool: CommandPool,
    external_pools: Mutex<usize>,
    in_use: Mutex<VecDeque<CommandBufferRef>>,
    submissions: Mutex<Option<Sender<PendingSubmit>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CommandManager {
    /// Create the default pool and start the submission and recycle threads
    pub fn new(
        driver: Arc<Driver>,
        sync: Arc<SyncObjectManager>,
        queue_type: QueueType,
        settings: CommandSettings,
    ) -> Result<Self> {
        let (queue, queue_family) = driver.queue(queue_type);
        let default_pool = CommandPool::new(
            driver.clone(),
            queue_family,
            settings.max_command_buffer_count,
            settings.allocation_batch,
            false,
        )
        .with_context(|| format!("Failed to create {:?} command pool", queue_type))?;

        let shared = Arc::new(ManagerShared {
            queue_type,
            queue,
            driver,
            sync,
            recycle_timeout: settings.recycle_timeout,
            pending: Mutex::new(0),
            recycled: Condvar::new(),
        });

        let (submit_tx, submit_rx) = crossbeam_channel::unbounded();
        let (recycle_tx, recycle_rx) = crossbeam_channel::unbounded();
        let name = format!("{:?}", queue_type).to_lowercase();

        let submission = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("{}-submit", name))
                .spawn(move || shared.run_submission(submit_rx, recycle_tx))
                .context("Failed to spawn submission thread")?
        };
        let recycle = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("{}-recycle", name))
                .spawn(move || shared.run_recycle(recycle_rx))
                .context("Failed to spawn recycle thread")?
        };

        Ok(Self {
            shared,
            queue_family,
            settings,
            default_pool,
            external_pools: Mutex::new(0),
            in_use: Mutex::new(VecDeque::new()),
            submissions: Mutex::new(Some(submit_tx)),
            workers: Mutex::new(vec![submission, recycle]),
        })
    }

    pub fn queue_type(&self) -> QueueType {
        self.shared.queue_type
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    pub fn default_pool(&self) -> &CommandPool {
        &self.default_pool
    }

    /// Recording buffer from the default pool, queued for the next IMPLICIT submit
    pub fn request_primary_command_buffer(&self) -> CommandBufferRef {
        self.request_command_buffer(CommandBufferUsage::IMPLICIT)
    }

    /// Recording buffer from the default pool with the given usage, already queued
    pub fn request_command_buffer(&self, usage: CommandBufferUsage) -> CommandBufferRef {
        let buffer = self.default_pool.request_primary_command_buffer();
        buffer.lock().set_usage(usage);
        self.in_use.lock().push_back(buffer.clone());
        buffer
    }

    /// A new pool for one external thread; its buffers are EXPLICIT
    pub fn request_external_command_pool(&self) -> CommandPool {
        let mut created = self.external_pools.lock();
        let pool = CommandPool::new(
            self.shared.driver.clone(),
            self.queue_family,
            self.settings.max_command_buffer_count,
            self.settings.allocation_batch,
            true,
        )
        .unwrap_or_else(|e| {
            log::error!("vkCreateCommandPool failed: {:?}", e);
            panic!("failed to create external command pool: {:?}", e)
        });
        *created += 1;
        log::info!(
            "{:?} queue: external command pool {} created ({} so far)",
            self.shared.queue_type,
            pool.id(),
            *created
        );
        pool
    }

    /// Queue a buffer recorded on an external pool for the next EXPLICIT submit.
    /// It stays deferred until its owner ends recording.
    pub fn return_external_command_buffer(&self, buffer: CommandBufferRef) {
        debug_assert!(buffer.lock().is_external(), "not an external command buffer");
        self.in_use.lock().push_back(buffer);
    }

    /// Submit every queued buffer whose usage intersects `usage_mask`.
    ///
    /// `submit_semaphore` is signalled once the batch completes and belongs to
    /// the manager from here on. `notify` is host-signalled as soon as the
    /// native submit has been issued. Returns false when nothing matched, in
    /// which case no native submit happens and the semaphore goes straight
    /// back to the pool.
    pub fn submit_command_buffers(
        &self,
        submit_semaphore: TimelineSemaphore,
        usage_mask: CommandBufferUsage,
        notify: Option<TimelineSemaphore>,
    ) -> bool {
        let drained: Vec<CommandBufferRef> = self.in_use.lock().drain(..).collect();

        let mut batch = SubmitBatch::default();
        let mut submitted = Vec::with_capacity(drained.len());
        let mut deferred = Vec::new();
        for buffer in drained {
            match self.prepare_for_submit(&buffer, usage_mask, &mut batch) {
                Disposition::Submit => submitted.push(buffer),
                Disposition::Defer => deferred.push(buffer),
                Disposition::Skip => {}
            }
        }

        if !deferred.is_empty() {
            let mut in_use = self.in_use.lock();
            for buffer in deferred.into_iter().rev() {
                in_use.push_front(buffer);
            }
        }

        if submitted.is_empty() {
            self.shared.sync.return_timeline_semaphore(submit_semaphore);
            if let Some(notify) = notify {
                if let Err(e) = self.shared.driver.signal_timeline(notify.handle, notify.signal_value) {
                    log::error!("Signalling notify semaphore {} failed: {:?}", notify.id, e);
                    panic!("failed to signal notify semaphore: {:?}", e);
                }
            }
            log::trace!(
                "{:?} queue: nothing matched {:?}, submit elided",
                self.shared.queue_type,
                usage_mask
            );
            return false;
        }

        batch.signal(submit_semaphore.handle, submit_semaphore.signal_value);
        *self.shared.pending.lock() += submitted.len();

        let sender = self.submissions.lock().clone();
        let Some(sender) = sender else {
            abort_with(format_args!(
                "{:?} queue: submit after the command manager was destroyed",
                self.shared.queue_type
            ));
        };
        let pending = PendingSubmit {
            batch,
            buffers: submitted,
            semaphore: submit_semaphore,
            notify,
        };
        if let Err(SendError(_pending)) = sender.send(pending) {
            abort_with(format_args!(
                "{:?} submission thread is gone",
                self.shared.queue_type
            ));
        }
        true
    }

    fn prepare_for_submit(
        &self,
        buffer: &CommandBufferRef,
        usage_mask: CommandBufferUsage,
        batch: &mut SubmitBatch,
    ) -> Disposition {
        let mut cmd = buffer.lock();
        if cmd.in_execution() {
            return Disposition::Skip;
        }

        let mismatched = !cmd.usage().intersects(usage_mask);
        let unfinished = cmd.is_external() && cmd.is_recording();
        if mismatched || unfinished {
            let reason = if mismatched { "usage mismatch" } else { "still recording" };
            if cmd.note_deferral(self.settings.deferral_warning_threshold) {
                log::warn!(
                    "{:?} queue: command buffer {} (pool {}) usage {:?} deferred {} times in a row ({}, submit mask {:?})",
                    self.shared.queue_type,
                    cmd.id(),
                    cmd.pool_id(),
                    cmd.usage(),
                    cmd.deferrals(),
                    reason,
                    usage_mask
                );
            } else {
                log::debug!(
                    "Deferring command buffer {} (pool {}): {}",
                    cmd.id(),
                    cmd.pool_id(),
                    reason
                );
            }
            return Disposition::Defer;
        }

        if cmd.is_recording() {
            cmd.end_command_buffer();
        }
        cmd.mark_submitted();
        cmd.collect_submission(batch);
        Disposition::Submit
    }

    /// End, submit and wait for one buffer, then return it to its pool.
    ///
    /// Stalls the whole queue; meant for setup-time uploads.
    pub fn submit_single_command_buffer_immediate(&self, buffer: CommandBufferRef) {
        self.in_use.lock().retain(|queued| !Arc::ptr_eq(queued, &buffer));

        let mut batch = SubmitBatch::default();
        {
            let mut cmd = buffer.lock();
            if cmd.is_recording() {
                cmd.end_command_buffer();
            }
            cmd.mark_submitted();
            cmd.collect_submission(&mut batch);
        }

        let driver = &self.shared.driver;
        let result = driver
            .queue_submit(self.shared.queue, &batch)
            .and_then(|_| driver.queue_wait_idle(self.shared.queue));
        if let Err(e) = result {
            log::error!(
                "{:?} queue: immediate submit failed: {:?}",
                self.shared.queue_type,
                e
            );
            panic!("immediate submit failed: {:?}", e);
        }

        let pool = buffer.lock().reset_after_execution();
        if let Some(pool) = pool {
            pool.release(buffer);
        }
    }

    /// Buffers recorded and queued but not yet submitted
    pub fn in_use_count(&self) -> usize {
        self.in_use.lock().len()
    }

    /// Buffers handed to the submission pipeline and not yet recycled
    pub fn pending_count(&self) -> usize {
        *self.shared.pending.lock()
    }

    /// Block until every submitted buffer has been recycled. False on timeout.
    pub fn wait_until_recycled(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = self.shared.pending.lock();
        while *pending > 0 {
            if self
                .shared
                .recycled
                .wait_until(&mut pending, deadline)
                .timed_out()
            {
                return *pending == 0;
            }
        }
        true
    }

    /// Stop both threads once they have drained their queues. Must run before
    /// the device goes away; further submits abort.
    pub fn destroy(&self) {
        let Some(sender) = self.submissions.lock().take() else {
            return;
        };
        drop(sender);

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let name = worker.thread().name().unwrap_or("worker").to_string();
            if worker.join().is_err() {
                log::error!("{} thread panicked", name);
            }
        }
        log::info!("{:?} command manager destroyed", self.shared.queue_type);
    }
}

impl Drop for CommandManager {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::HeadlessConfig;
    use crate::backend::image::DescriptorSet;
    use crate::backend::sync::SyncLimits;
    use ash::vk::Handle;

    const RECYCLE_WAIT: Duration = Duration::from_secs(3);

    fn setup(settings: CommandSettings) -> (Arc<Driver>, Arc<SyncObjectManager>, CommandManager) {
        let driver = Arc::new(Driver::headless(HeadlessConfig::default()));
        let sync = Arc::new(SyncObjectManager::new(driver.clone(), SyncLimits::default()));
        let manager =
            CommandManager::new(driver.clone(), sync.clone(), QueueType::Graphics, settings).unwrap();
        (driver, sync, manager)
    }

    fn stats(driver: &Driver) -> crate::backend::headless::HeadlessStats {
        driver.as_headless().unwrap().stats()
    }

    #[test]
    fn recorded_buffer_returns_to_pool_after_completion() {
        let (driver, sync, manager) = setup(CommandSettings::default());

        let buffer = manager.request_primary_command_buffer();
        let id = {
            let mut cmd = buffer.lock();
            cmd.begin_render_pass(
                vk::RenderPass::null(),
                vk::Framebuffer::null(),
                vk::Rect2D::default(),
                &[],
            );
            cmd.end_render_pass();
            cmd.id()
        };
        drop(buffer);

        assert!(manager.submit_command_buffers(
            sync.request_timeline_semaphore(),
            CommandBufferUsage::IMPLICIT,
            None
        ));
        assert!(manager.wait_until_recycled(RECYCLE_WAIT));

        assert_eq!(manager.default_pool().free_count(), manager.default_pool().allocated_count());
        assert_eq!(sync.available_timeline_semaphores(), 1);
        assert_eq!(stats(&driver).submits, 1);

        let again = manager.request_primary_command_buffer();
        assert_eq!(again.lock().id(), id);
        assert!(again.lock().is_recording());
    }

    #[test]
    fn explicit_mask_leaves_implicit_buffers_queued() {
        let (driver, sync, manager) = setup(CommandSettings::default());

        let implicit: Vec<_> = (0..3).map(|_| manager.request_primary_command_buffer()).collect();
        let explicit: Vec<_> = (0..2)
            .map(|_| manager.request_command_buffer(CommandBufferUsage::EXPLICIT))
            .collect();

        let semaphore = sync.request_timeline_semaphore();
        assert!(manager.submit_command_buffers(semaphore, CommandBufferUsage::EXPLICIT, None));
        assert!(manager.wait_until_recycled(RECYCLE_WAIT));

        let submit = driver.as_headless().unwrap().last_submit().unwrap();
        let explicit_handles: Vec<_> = explicit.iter().map(|b| b.lock().handle()).collect();
        assert_eq!(submit.command_buffers, explicit_handles);
        assert_eq!(submit.signal_semaphores.last(), Some(&semaphore.handle));
        assert_eq!(submit.signal_values.last(), Some(&semaphore.signal_value));

        assert_eq!(manager.in_use_count(), 3);
        for buffer in &implicit {
            let cmd = buffer.lock();
            assert!(cmd.is_recording());
            assert!(!cmd.in_execution());
            assert_eq!(cmd.deferrals(), 1);
        }
        assert_eq!(stats(&driver).submits, 1);
    }

    #[test]
    fn empty_submit_returns_semaphore_without_native_call() {
        let (driver, sync, manager) = setup(CommandSettings::default());
        let _implicit = manager.request_primary_command_buffer();

        let notify = sync.request_timeline_semaphore();
        let semaphore = sync.request_timeline_semaphore();
        assert_eq!(sync.available_timeline_semaphores(), 0);

        let submitted =
            manager.submit_command_buffers(semaphore, CommandBufferUsage::EXPLICIT, Some(notify));

        assert!(!submitted);
        assert_eq!(stats(&driver).submits, 0);
        assert_eq!(sync.available_timeline_semaphores(), 1);
        assert_eq!(driver.timeline_value(notify.handle).unwrap(), notify.signal_value);
        assert_eq!(manager.pending_count(), 0);
        assert_eq!(manager.in_use_count(), 1);
    }

    #[test]
    fn descriptor_sets_stay_in_use_until_recycled() {
        let settings = CommandSettings {
            recycle_timeout: Duration::from_secs(10),
            ..CommandSettings::default()
        };
        let (driver, sync, manager) = setup(settings);
        let headless = driver.as_headless().unwrap();
        headless.set_stalled(true);

        let set = Arc::new(DescriptorSet::new(vk::DescriptorSet::from_raw(77)));
        let buffer = manager.request_primary_command_buffer();
        buffer.lock().bind_descriptor_sets(
            vk::PipelineBindPoint::GRAPHICS,
            vk::PipelineLayout::null(),
            0,
            std::slice::from_ref(&set),
        );
        assert_eq!(buffer.lock().bound_descriptor_set_count(), 1);

        let semaphore = sync.request_timeline_semaphore();
        assert!(manager.submit_command_buffers(semaphore, CommandBufferUsage::IMPLICIT, None));

        assert!(!manager.wait_until_recycled(Duration::from_millis(100)));
        assert!(set.is_in_use());
        assert_eq!(manager.pending_count(), 1);

        // Resuming completes the withheld signal
        headless.set_stalled(false);

        assert!(manager.wait_until_recycled(RECYCLE_WAIT));
        assert!(!set.is_in_use());
        assert_eq!(buffer.lock().bound_descriptor_set_count(), 0);
    }

    #[test]
    fn external_buffer_waits_for_its_owner_to_finish() {
        let (driver, sync, manager) = setup(CommandSettings::default());
        let pool = manager.request_external_command_pool();
        assert_eq!(pool.queue_family(), manager.queue_family());
        let buffer = pool.request_primary_command_buffer();
        manager.return_external_command_buffer(buffer.clone());

        assert!(!manager.submit_command_buffers(
            sync.request_timeline_semaphore(),
            CommandBufferUsage::EXPLICIT,
            None
        ));
        assert_eq!(manager.in_use_count(), 1);
        assert!(buffer.lock().is_recording());

        buffer.lock().end_command_buffer();
        assert!(manager.submit_command_buffers(
            sync.request_timeline_semaphore(),
            CommandBufferUsage::EXPLICIT,
            None
        ));
        assert!(manager.wait_until_recycled(RECYCLE_WAIT));
        assert_eq!(pool.free_count(), pool.allocated_count());
        assert_eq!(stats(&driver).submitted_command_buffers, 1);
    }

    #[test]
    fn dropped_external_pool_is_destroyed_after_its_work_completes() {
        let (driver, sync, manager) = setup(CommandSettings::default());
        let pool = manager.request_external_command_pool();
        let buffer = pool.request_primary_command_buffer();
        buffer.lock().end_command_buffer();
        manager.return_external_command_buffer(buffer);
        drop(pool);

        let destroyed_before = stats(&driver).command_pools_destroyed;
        assert!(manager.submit_command_buffers(
            sync.request_timeline_semaphore(),
            CommandBufferUsage::EXPLICIT,
            None
        ));
        assert!(manager.wait_until_recycled(RECYCLE_WAIT));
        assert_eq!(stats(&driver).command_pools_destroyed, destroyed_before + 1);
    }

    #[test]
    fn deferral_count_resets_once_submitted() {
        let settings = CommandSettings {
            deferral_warning_threshold: 2,
            ..CommandSettings::default()
        };
        let (_driver, sync, manager) = setup(settings);
        let explicit = manager.request_command_buffer(CommandBufferUsage::EXPLICIT);

        for _ in 0..5 {
            manager.submit_command_buffers(
                sync.request_timeline_semaphore(),
                CommandBufferUsage::IMPLICIT,
                None,
            );
        }
        assert_eq!(explicit.lock().deferrals(), 5);

        assert!(manager.submit_command_buffers(
            sync.request_timeline_semaphore(),
            CommandBufferUsage::EXPLICIT,
            None
        ));
        assert!(manager.wait_until_recycled(RECYCLE_WAIT));
        assert_eq!(explicit.lock().deferrals(), 0);
        assert_eq!(manager.in_use_count(), 0);
    }

    #[test]
    fn immediate_submit_blocks_and_recycles_in_place() {
        let (driver, _sync, manager) = setup(CommandSettings::default());
        let buffer = manager.request_primary_command_buffer();
        assert_eq!(manager.in_use_count(), 1);

        manager.submit_single_command_buffer_immediate(buffer.clone());

        let stats = stats(&driver);
        assert_eq!(stats.submits, 1);
        assert_eq!(stats.queue_wait_idles, 1);
        assert_eq!(manager.in_use_count(), 0);
        assert_eq!(manager.pending_count(), 0);
        assert!(!buffer.lock().in_execution());
        assert_eq!(manager.default_pool().free_count(), manager.default_pool().allocated_count());
    }

    #[test]
    fn destroy_drains_in_flight_work() {
        let (_driver, sync, manager) = setup(CommandSettings::default());
        for _ in 0..4 {
            manager.request_primary_command_buffer();
            manager.submit_command_buffers(
                sync.request_timeline_semaphore(),
                CommandBufferUsage::IMPLICIT,
                None,
            );
        }
        manager.destroy();
        assert_eq!(manager.pending_count(), 0);
        assert_eq!(sync.available_timeline_semaphores(), sync.timeline_semaphore_count());
    }

    const ABORT_CHILD_ENV: &str = "GFX_ENGINE_RECYCLE_ABORT_CHILD";
    const ABORT_TEST: &str =
        "backend::command_manager::tests::recycle_timeout_aborts_with_stuck_buffer_report";

    #[test]
    fn recycle_timeout_aborts_with_stuck_buffer_report() {
        if std::env::var_os(ABORT_CHILD_ENV).is_some() {
            let _ = env_logger::Builder::new()
                .filter_level(log::LevelFilter::Error)
                .target(env_logger::Target::Stderr)
                .try_init();

            let settings = CommandSettings {
                recycle_timeout: Duration::from_millis(100),
                ..CommandSettings::default()
            };
            let (driver, sync, manager) = setup(settings);
            driver.as_headless().unwrap().set_stalled(true);

            manager.request_primary_command_buffer();
            manager.submit_command_buffers(
                sync.request_timeline_semaphore(),
                CommandBufferUsage::IMPLICIT,
                None,
            );
            thread::sleep(Duration::from_secs(10));
            // Still alive: the child exits cleanly and the parent fails
            return;
        }

        let exe = std::env::current_exe().unwrap();
        let output = std::process::Command::new(exe)
            .args([ABORT_TEST, "--exact", "--nocapture", "--test-threads=1"])
            .env(ABORT_CHILD_ENV, "1")
            .output()
            .unwrap();

        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(!output.status.success(), "child survived a GPU hang:\n{}", stderr);
        assert!(stderr.contains("Stuck command buffer 0"), "stderr:\n{}", stderr);
        assert!(stderr.contains("IMPLICIT"), "stderr:\n{}", stderr);
    }
}
