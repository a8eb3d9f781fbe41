//! 同步提交引擎
//!
//! [`CommandQueue`] 是设备队列提交顺序和完成记录的唯一权威，所有公开操作都可以并发调用。
//!
//! # 锁顺序
//!
//! 三把锁总是按 submit → complete → release 的顺序获取：
//!
//! - submit：组装批次、调用设备提交、推进 last-submitted、批次进入在途队列
//! - complete：检查或等待最老的在途批次，推进 last-completed，批次进入完成队列
//! - release：完成队列中的批次归还命令缓冲区和 fence
//!
//! 等待 fence 时会临时释放 complete 锁，等待方持有 fence 的引用，fence 不会在等待期间被回收。
//!
//! # 设备丢失
//!
//! 致命错误在所有锁释放之后触发 [`CommandQueue::handle_device_lost`]：
//! 在途和已完成的批次直接丢弃，不等待 fence，之后的所有操作都返回 `SubmitError::DeviceLost`。

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ash::vk;
use parking_lot::{Mutex, MutexGuard};

use super::batch::{CommandBatch, CommandBatchQueue, FenceWaiter};
use super::command::{
    CommandPoolAccess, OutsideRenderPassCommands, Priority, ProtectionType, RenderPassCommands,
};
use super::garbage::{GarbageList, SharedGarbage};
use super::metrics::QueuePerfCounters;
use super::serial::{
    AtomicQueueSerialArray, QueueSerial, ResourceUse, Serial, SerialFactory, SerialIndex,
};
use super::sync::{FenceRecycler, SharedExternalFence, SwapchainStatus};
use crate::core::config::Config;
use crate::core::error::{severity_of, ErrorContext, ErrorSeverity, LoggingErrorContext, Result, SubmitError};
use crate::gfx::backend::{DeviceBackend, DeviceObject, PresentRequest, QueueSubmitInfo};
use crate::{engine_debug, engine_error, engine_info, engine_warn, vk_error, vk_try};

/// 一次性提交的策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitPolicy {
    /// 允许延迟到工作线程处理时再提交
    AllowDeferred,
    /// 返回前必须已经提交给设备
    EnsureSubmitted,
}

/// 队列族
#[derive(Debug, Clone, Copy)]
pub struct QueueFamily {
    index: u32,
    properties: vk::QueueFamilyProperties,
}

impl QueueFamily {
    pub fn new(index: u32, properties: vk::QueueFamilyProperties) -> Self {
        Self { index, properties }
    }

    /// 查找第 `match_number` 个（从 0 开始）支持 `flags` 的队列族
    pub fn find_index(
        families: &[vk::QueueFamilyProperties],
        flags: vk::QueueFlags,
        match_number: usize,
    ) -> Option<u32> {
        families
            .iter()
            .enumerate()
            .filter(|(_, family)| family.queue_flags.contains(flags))
            .nth(match_number)
            .map(|(index, _)| index as u32)
    }

    /// 支持 `flags` 的队列族数量
    pub fn count_matching(families: &[vk::QueueFamilyProperties], flags: vk::QueueFlags) -> usize {
        families.iter().filter(|family| family.queue_flags.contains(flags)).count()
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn queue_count(&self) -> u32 {
        self.properties.queue_count
    }

    pub fn supports_protected(&self) -> bool {
        self.properties.queue_flags.contains(vk::QueueFlags::PROTECTED)
    }
}

/// 优先级到设备队列的映射
///
/// 队列数量不足时回退：中优先级总是使用 0 号队列，高优先级使用 1 号，低优先级使用 2 号，
/// 没有对应队列时使用中优先级的队列。
#[derive(Debug, Clone, Copy)]
pub struct DeviceQueueMap {
    family_index: u32,
    protected: bool,
    queues: [vk::Queue; Priority::COUNT],
    device_priorities: [Priority; Priority::COUNT],
}

impl DeviceQueueMap {
    pub fn new(device: &dyn DeviceBackend, family: &QueueFamily, protected: bool, queue_count: u32) -> Self {
        let queue_count = queue_count.min(family.queue_count()).max(1);
        let medium = device.device_queue(family.index(), 0, protected);
        let mut queues = [medium; Priority::COUNT];
        let mut device_priorities = [Priority::Medium; Priority::COUNT];

        if queue_count > 1 {
            queues[Priority::High.index()] = device.device_queue(family.index(), 1, protected);
            device_priorities[Priority::High.index()] = Priority::High;
        }
        if queue_count > 2 {
            queues[Priority::Low.index()] = device.device_queue(family.index(), 2, protected);
            device_priorities[Priority::Low.index()] = Priority::Low;
        }

        Self {
            family_index: family.index(),
            protected,
            queues,
            device_priorities,
        }
    }

    pub fn queue(&self, priority: Priority) -> vk::Queue {
        self.queues[priority.index()]
    }

    /// 请求的优先级实际落到的设备优先级
    pub fn device_priority(&self, priority: Priority) -> Priority {
        self.device_priorities[priority.index()]
    }

    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    pub fn is_protected(&self) -> bool {
        self.protected
    }

    /// 去重后的设备队列
    fn distinct_queues(&self) -> Vec<vk::Queue> {
        let mut queues = self.queues.to_vec();
        queues.sort_by_key(|queue| ash::vk::Handle::as_raw(*queue));
        queues.dedup();
        queues
    }
}

/// 队列限制
#[derive(Debug, Clone, Copy)]
pub struct CommandQueueLimits {
    pub in_flight_commands_limit: usize,
    pub max_finished_commands_limit: usize,
    pub max_queue_serial_indices: usize,
    pub fence_wait_timeout: Duration,
}

impl CommandQueueLimits {
    pub fn from_config(config: &Config) -> Self {
        let submission = &config.submission;
        Self {
            in_flight_commands_limit: submission.in_flight_commands_limit,
            max_finished_commands_limit: submission.max_finished_commands_limit,
            max_queue_serial_indices: submission.max_queue_serial_indices,
            fence_wait_timeout: submission.fence_wait_timeout(),
        }
    }
}

#[derive(Debug, Default)]
struct SubmitState {
    perf_counters: QueuePerfCounters,
}

/// 同步提交引擎
pub struct CommandQueue {
    device: Arc<dyn DeviceBackend>,
    pool_access: CommandPoolAccess,
    fence_recycler: Arc<FenceRecycler>,
    queue_maps: [Option<DeviceQueueMap>; ProtectionType::COUNT],
    limits: CommandQueueLimits,

    submit_lock: Mutex<SubmitState>,
    complete_lock: Mutex<()>,
    release_lock: Mutex<()>,

    in_flight: CommandBatchQueue,
    finished: CommandBatchQueue,
    num_all_commands: AtomicUsize,

    serial_factories: Box<[SerialFactory]>,
    last_submitted: AtomicQueueSerialArray,
    last_completed: AtomicQueueSerialArray,

    garbage: Mutex<GarbageList>,
    device_lost: AtomicBool,
    destroyed: AtomicBool,
}

impl CommandQueue {
    /// 创建提交引擎
    ///
    /// 选择第一个同时支持图形和计算的队列族，建立优先级映射并初始化命令池。
    /// 配置启用受保护内容时还会建立受保护队列映射。
    pub fn new(device: Arc<dyn DeviceBackend>, context: &dyn ErrorContext, config: &Config) -> Result<Self> {
        let limits = CommandQueueLimits::from_config(config);
        let families = device.queue_family_properties();
        let flags = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;
        let family_index = QueueFamily::find_index(&families, flags, 0).ok_or_else(|| {
            SubmitError::Initialization("no queue family supports graphics and compute".to_string())
        })?;
        let family = QueueFamily::new(family_index, families[family_index as usize]);

        let pool_access = CommandPoolAccess::new(Arc::clone(&device));
        pool_access.init_command_pool(context, ProtectionType::Unprotected, family_index)?;

        let queue_count = config.device.queue_count;
        let mut queue_maps = [None, None];
        queue_maps[ProtectionType::Unprotected.index()] =
            Some(DeviceQueueMap::new(device.as_ref(), &family, false, queue_count));

        if config.device.enable_protected_content {
            if !family.supports_protected() {
                return Err(SubmitError::Initialization(
                    "protected content requested but the queue family does not support it".to_string(),
                ));
            }
            pool_access.init_command_pool(context, ProtectionType::Protected, family_index)?;
            queue_maps[ProtectionType::Protected.index()] =
                Some(DeviceQueueMap::new(device.as_ref(), &family, true, queue_count));
        }

        engine_info!(
            backend = device.backend_name(),
            family = family_index,
            queues = family.queue_count().min(queue_count),
            protected = config.device.enable_protected_content,
            "Command queue initialized"
        );

        let indices = limits.max_queue_serial_indices;
        Ok(Self {
            fence_recycler: FenceRecycler::new(Arc::clone(&device)),
            device,
            pool_access,
            queue_maps,
            limits,
            submit_lock: Mutex::new(SubmitState::default()),
            complete_lock: Mutex::new(()),
            release_lock: Mutex::new(()),
            in_flight: CommandBatchQueue::new(limits.in_flight_commands_limit),
            finished: CommandBatchQueue::new(limits.max_finished_commands_limit),
            num_all_commands: AtomicUsize::new(0),
            serial_factories: (0..indices).map(|_| SerialFactory::new()).collect(),
            last_submitted: AtomicQueueSerialArray::new(indices),
            last_completed: AtomicQueueSerialArray::new(indices),
            garbage: Mutex::new(GarbageList::default()),
            device_lost: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn device(&self) -> &Arc<dyn DeviceBackend> {
        &self.device
    }

    pub fn pool_access(&self) -> &CommandPoolAccess {
        &self.pool_access
    }

    pub fn fence_recycler(&self) -> &Arc<FenceRecycler> {
        &self.fence_recycler
    }

    pub fn limits(&self) -> &CommandQueueLimits {
        &self.limits
    }

    pub fn max_queue_serial_indices(&self) -> usize {
        self.serial_factories.len()
    }

    /// 为队列索引生成下一个序列号
    pub fn generate_queue_serial(&self, index: SerialIndex) -> Result<QueueSerial> {
        let factory = self.serial_factories.get(index.as_usize()).ok_or_else(|| {
            SubmitError::Runtime(format!("queue serial index {} is out of range", index.value()))
        })?;
        Ok(QueueSerial::new(index, factory.generate()))
    }

    pub fn queue_map(&self, protection: ProtectionType) -> Option<&DeviceQueueMap> {
        self.queue_maps[protection.index()].as_ref()
    }

    fn queue(&self, protection: ProtectionType, priority: Priority) -> Result<vk::Queue> {
        self.queue_map(protection)
            .map(|map| map.queue(priority))
            .ok_or_else(|| SubmitError::Initialization(format!("no device queue for {:?} content", protection)))
    }

    pub fn is_device_lost(&self) -> bool {
        self.device_lost.load(Ordering::Acquire)
    }

    fn ensure_device_not_lost(&self) -> Result<()> {
        if self.is_device_lost() {
            return Err(SubmitError::DeviceLost);
        }
        Ok(())
    }

    /// 致命错误在锁外触发设备丢失处理
    fn check_fatal<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_fatal() {
                self.handle_device_lost();
            }
        }
        result
    }

    // ---- 录制 ----

    pub fn flush_wait_semaphores(
        &self,
        protection: ProtectionType,
        priority: Priority,
        semaphores: Vec<vk::Semaphore>,
        stage_masks: Vec<vk::PipelineStageFlags>,
    ) -> Result<()> {
        self.ensure_device_not_lost()?;
        self.pool_access.flush_wait_semaphores(protection, priority, semaphores, stage_masks);
        Ok(())
    }

    pub fn flush_outside_render_pass_commands(
        &self,
        context: &dyn ErrorContext,
        protection: ProtectionType,
        priority: Priority,
        commands: OutsideRenderPassCommands,
    ) -> Result<vk::CommandBuffer> {
        self.ensure_device_not_lost()?;
        let result = self
            .pool_access
            .flush_outside_render_pass_commands(context, protection, priority, commands);
        self.check_fatal(result)
    }

    pub fn flush_render_pass_commands(
        &self,
        context: &dyn ErrorContext,
        protection: ProtectionType,
        priority: Priority,
        commands: RenderPassCommands,
        framebuffer_override: Option<vk::Framebuffer>,
    ) -> Result<vk::CommandBuffer> {
        self.ensure_device_not_lost()?;
        let result = self.pool_access.flush_render_pass_commands(
            context,
            protection,
            priority,
            commands,
            framebuffer_override,
        );
        self.check_fatal(result)
    }

    // ---- 提交 ----

    /// 提交桶中的命令
    ///
    /// 组装批次（主、次级命令缓冲区和等待信号量），附加回收池或外部提供的 fence，
    /// 提交到优先级对应的设备队列，并把 `submit_queue_serial` 记为该索引的 last-submitted。
    /// 同一索引上的序列号必须严格递增。
    pub fn submit_commands(
        &self,
        context: &dyn ErrorContext,
        protection: ProtectionType,
        priority: Priority,
        signal_semaphore: Option<vk::Semaphore>,
        external_fence: Option<SharedExternalFence>,
        submit_queue_serial: QueueSerial,
    ) -> Result<()> {
        self.ensure_device_not_lost()?;
        let result = self.submit_commands_impl(
            context,
            protection,
            priority,
            signal_semaphore,
            external_fence,
            submit_queue_serial,
        );
        let result = self.check_fatal(result);
        result?;
        self.post_submit_check(context)
    }

    fn submit_commands_impl(
        &self,
        context: &dyn ErrorContext,
        protection: ProtectionType,
        priority: Priority,
        signal_semaphore: Option<vk::Semaphore>,
        external_fence: Option<SharedExternalFence>,
        submit_queue_serial: QueueSerial,
    ) -> Result<()> {
        let mut submit = self.submit_lock.lock();
        self.validate_serial_locked(submit_queue_serial)?;
        self.make_room_for_batch_locked(context)?;

        let pending = self.pool_access.get_commands_and_wait_semaphores(context, protection, priority)?;
        submit.perf_counters.record_submit(pending.wait_semaphores.len());

        let needs_queue_submit = pending.primary.is_some()
            || signal_semaphore.is_some()
            || external_fence.is_some()
            || !pending.wait_semaphores.is_empty();

        let mut batch = CommandBatch::new(submit_queue_serial, protection);
        let mut submit_info = QueueSubmitInfo {
            wait_semaphores: pending.wait_semaphores,
            wait_stage_masks: pending.wait_stage_masks,
            command_buffers: pending.primary.iter().map(|primary| primary.handle()).collect(),
            signal_semaphores: signal_semaphore.into_iter().collect(),
            protected: protection.is_protected(),
        };
        batch.set_primary_commands(pending.primary, pending.secondaries);

        if needs_queue_submit {
            match external_fence {
                Some(fence) => batch.set_external_fence(fence),
                None => batch.init_fence(&self.fence_recycler, context)?,
            }
        } else {
            // 没有内容也要占位，保证同一索引上按顺序完成
            submit_info.command_buffers.clear();
        }

        self.queue_submit_locked(&mut submit, context, protection, priority, &submit_info, batch, needs_queue_submit)
    }

    /// 提交一个调用方提供的命令缓冲区，不经过分桶
    ///
    /// 同步路径上总是立即提交；`submit_policy` 只影响异步路径。
    #[allow(clippy::too_many_arguments)]
    pub fn queue_submit_one_off(
        &self,
        context: &dyn ErrorContext,
        protection: ProtectionType,
        priority: Priority,
        command_buffer: Option<vk::CommandBuffer>,
        wait_semaphore: Option<(vk::Semaphore, vk::PipelineStageFlags)>,
        submit_policy: SubmitPolicy,
        submit_queue_serial: QueueSerial,
    ) -> Result<()> {
        self.ensure_device_not_lost()?;
        let result = self.queue_submit_one_off_impl(
            context,
            protection,
            priority,
            command_buffer,
            wait_semaphore,
            submit_queue_serial,
        );
        engine_debug!(
            serial = %submit_queue_serial,
            policy = ?submit_policy,
            "One-off submission"
        );
        let result = self.check_fatal(result);
        result?;
        self.post_submit_check(context)
    }

    fn queue_submit_one_off_impl(
        &self,
        context: &dyn ErrorContext,
        protection: ProtectionType,
        priority: Priority,
        command_buffer: Option<vk::CommandBuffer>,
        wait_semaphore: Option<(vk::Semaphore, vk::PipelineStageFlags)>,
        submit_queue_serial: QueueSerial,
    ) -> Result<()> {
        let mut submit = self.submit_lock.lock();
        self.validate_serial_locked(submit_queue_serial)?;
        self.make_room_for_batch_locked(context)?;

        let mut batch = CommandBatch::new(submit_queue_serial, protection);
        batch.init_fence(&self.fence_recycler, context)?;

        let (wait_semaphores, wait_stage_masks) = wait_semaphore.map_or((Vec::new(), Vec::new()), |(semaphore, stage)| {
            (vec![semaphore], vec![stage])
        });
        submit.perf_counters.record_submit(wait_semaphores.len());

        let submit_info = QueueSubmitInfo {
            wait_semaphores,
            wait_stage_masks,
            command_buffers: command_buffer.into_iter().collect(),
            signal_semaphores: Vec::new(),
            protected: protection.is_protected(),
        };
        self.queue_submit_locked(&mut submit, context, protection, priority, &submit_info, batch, true)
    }

    /// 拒绝超出配置的队列索引
    fn check_usage_indices(&self, usage: &ResourceUse) -> Result<()> {
        match usage.max_index() {
            Some(index) if index.as_usize() >= self.serial_factories.len() => Err(SubmitError::Runtime(format!(
                "queue serial index {} is out of range",
                index.value()
            ))),
            _ => Ok(()),
        }
    }

    fn validate_serial_locked(&self, submit_queue_serial: QueueSerial) -> Result<()> {
        let last = self.last_submitted.load(submit_queue_serial.index());
        if submit_queue_serial.serial() <= last {
            return Err(SubmitError::SerialOutOfOrder {
                index: submit_queue_serial.index().value(),
                serial: submit_queue_serial.serial().value(),
                last: last.value(),
            });
        }
        if submit_queue_serial.index().as_usize() >= self.serial_factories.len() {
            return Err(SubmitError::Runtime(format!(
                "queue serial index {} is out of range",
                submit_queue_serial.index().value()
            )));
        }
        Ok(())
    }

    /// 在途批次达到上限时先等待最老的批次完成
    fn make_room_for_batch_locked(&self, context: &dyn ErrorContext) -> Result<()> {
        while self.in_flight.len() >= self.limits.in_flight_commands_limit {
            let mut complete = self.complete_lock.lock();
            self.finish_one_command_batch_locked(context, self.limits.fence_wait_timeout, &mut complete)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn queue_submit_locked(
        &self,
        submit: &mut MutexGuard<'_, SubmitState>,
        context: &dyn ErrorContext,
        protection: ProtectionType,
        priority: Priority,
        submit_info: &QueueSubmitInfo,
        batch: CommandBatch,
        needs_queue_submit: bool,
    ) -> Result<()> {
        let queue_serial = batch.queue_serial();
        if needs_queue_submit {
            let queue = self.queue(protection, priority)?;
            let fence = batch.fence_handle();
            if let Err(result) = self.device.queue_submit(queue, submit_info, fence) {
                // 提交失败时 fence 没有被使用；设备丢失时不再调用设备重置命令缓冲区
                if severity_of(result) == ErrorSeverity::Fatal {
                    batch.destroy(&self.pool_access);
                } else if let Err(err) = batch.release(context, &self.pool_access) {
                    engine_warn!(error = %err, "Failed to release a rejected batch");
                }
                return Err(vk_error!(context, result, "CommandQueue::queue_submit"));
            }
            submit.perf_counters.record_device_submit();
        }

        self.last_submitted.advance(queue_serial);
        self.num_all_commands.fetch_add(1, Ordering::AcqRel);
        engine_debug!(
            serial = %queue_serial,
            priority = %priority,
            buffers = submit_info.command_buffers.len(),
            "Batch submitted"
        );

        if let Err(batch) = self.in_flight.push(batch) {
            // 提交锁下只有本线程会入队，只有在并发完成路径异常时才会到这里
            let status = batch.wait_fence(self.limits.fence_wait_timeout);
            self.last_completed.advance(queue_serial);
            self.num_all_commands.fetch_sub(1, Ordering::AcqRel);
            batch.release(context, &self.pool_access)?;
            vk_try!(context, status, "CommandQueue::queue_submit");
        }
        Ok(())
    }

    /// 提交后检查完成情况并回收垃圾
    fn post_submit_check(&self, context: &dyn ErrorContext) -> Result<()> {
        self.check_and_cleanup_completed_commands(context)
    }

    /// 呈现
    ///
    /// 呈现结果只写入 `swapchain_status`。设备已丢失时结果固定为 `ERROR_DEVICE_LOST`，
    /// 呈现返回设备丢失时同时触发设备丢失处理。
    pub fn queue_present(
        &self,
        priority: Priority,
        present: &PresentRequest,
        swapchain_status: &SwapchainStatus,
    ) {
        if self.is_device_lost() {
            swapchain_status.record_present_result(vk::Result::ERROR_DEVICE_LOST);
            return;
        }

        let result = {
            let _submit = self.submit_lock.lock();
            match self.queue(ProtectionType::Unprotected, priority) {
                Ok(queue) => self.device.queue_present(queue, present),
                Err(_) => vk::Result::ERROR_INITIALIZATION_FAILED,
            }
        };

        if result == vk::Result::ERROR_DEVICE_LOST {
            self.handle_device_lost();
        }
        if result != vk::Result::SUCCESS {
            engine_warn!(result = ?result, image = present.image_index, "Present did not succeed");
        }
        // 设备丢失的优先级高于呈现结果
        let recorded = if self.is_device_lost() { vk::Result::ERROR_DEVICE_LOST } else { result };
        swapchain_status.record_present_result(recorded);
    }

    // ---- 完成 ----

    /// 检查在途批次，把已完成的移入完成队列
    pub fn check_completed_commands(&self, context: &dyn ErrorContext) -> Result<()> {
        self.ensure_device_not_lost()?;
        let result = {
            let _complete = self.complete_lock.lock();
            self.check_completed_commands_locked(context)
        };
        self.check_fatal(result)
    }

    /// 从最老的批次开始检查，遇到第一个未完成的批次停止
    pub(crate) fn check_completed_commands_locked(&self, context: &dyn ErrorContext) -> Result<()> {
        while self.check_one_command_batch_locked(context)? {}
        Ok(())
    }

    /// 检查最老的批次，完成时返回 true
    fn check_one_command_batch_locked(&self, context: &dyn ErrorContext) -> Result<bool> {
        let waiter = match self.in_flight.with_front(CommandBatch::fence_waiter) {
            Some(waiter) => waiter,
            None => return Ok(false),
        };
        if let Some(waiter) = waiter {
            let signaled = vk_try!(context, waiter.status(), "CommandQueue::check_one_command_batch");
            if !signaled {
                return Ok(false);
            }
        }
        self.on_command_batch_finished_locked(context)?;
        Ok(true)
    }

    /// 等待最老的批次完成
    pub fn finish_one_command_batch(&self, context: &dyn ErrorContext, timeout: Duration) -> Result<()> {
        self.ensure_device_not_lost()?;
        let result = {
            let mut complete = self.complete_lock.lock();
            self.finish_one_command_batch_locked(context, timeout, &mut complete)
        };
        self.check_fatal(result)
    }

    /// 等待最老的批次完成，等待期间释放 complete 锁
    pub(crate) fn finish_one_command_batch_locked(
        &self,
        context: &dyn ErrorContext,
        timeout: Duration,
        complete: &mut MutexGuard<'_, ()>,
    ) -> Result<()> {
        let front = self
            .in_flight
            .with_front(|batch| (batch.queue_serial(), batch.fence_waiter()));
        let (batch_serial, waiter) = match front {
            Some(front) => front,
            None => return Ok(()),
        };

        if let Some(waiter) = waiter {
            let status = Self::wait_unlocked(complete, &waiter, timeout);
            vk_try!(context, status, "CommandQueue::finish_one_command_batch");
        }

        // 其他线程可能已经在等待期间处理了这个批次
        if !self.has_queue_serial_finished(batch_serial) {
            self.on_command_batch_finished_locked(context)?;
        }
        Ok(())
    }

    fn wait_unlocked(
        complete: &mut MutexGuard<'_, ()>,
        waiter: &FenceWaiter,
        timeout: Duration,
    ) -> ash::prelude::VkResult<()> {
        MutexGuard::unlocked(complete, || waiter.wait(timeout))
    }

    /// 最老的在途批次已完成：推进 last-completed，移入完成队列
    fn on_command_batch_finished_locked(&self, context: &dyn ErrorContext) -> Result<()> {
        if self.finished.is_full() {
            let _release = self.release_lock.lock();
            self.release_finished_commands_locked(context)?;
        }

        let batch = match self.in_flight.pop_front() {
            Some(batch) => batch,
            None => return Ok(()),
        };
        let queue_serial = batch.queue_serial();
        self.last_completed.advance(queue_serial);
        engine_debug!(serial = %queue_serial, "Batch completed");

        if let Err(batch) = self.finished.push(batch) {
            self.num_all_commands.fetch_sub(1, Ordering::AcqRel);
            batch.release(context, &self.pool_access)?;
        }
        Ok(())
    }

    /// 释放完成队列中的批次
    pub fn release_finished_commands(&self, context: &dyn ErrorContext) -> Result<()> {
        let result = {
            let _release = self.release_lock.lock();
            self.release_finished_commands_locked(context)
        };
        self.check_fatal(result)
    }

    pub(crate) fn release_finished_commands_locked(&self, context: &dyn ErrorContext) -> Result<()> {
        while let Some(batch) = self.finished.pop_front() {
            self.num_all_commands.fetch_sub(1, Ordering::AcqRel);
            batch.release(context, &self.pool_access)?;
        }
        Ok(())
    }

    /// 释放完成的批次并清理已完成的垃圾
    pub fn release_finished_commands_and_cleanup_garbage(&self, context: &dyn ErrorContext) -> Result<()> {
        self.release_finished_commands(context)?;
        self.cleanup_garbage();
        Ok(())
    }

    /// 不阻塞地检查完成情况，释放完成的批次并清理垃圾
    pub fn check_and_cleanup_completed_commands(&self, context: &dyn ErrorContext) -> Result<()> {
        self.ensure_device_not_lost()?;
        let result = {
            let _complete = self.complete_lock.lock();
            self.check_completed_commands_locked(context)
        };
        self.check_fatal(result)?;
        if !self.finished.is_empty() {
            self.release_finished_commands_and_cleanup_garbage(context)?;
        }
        Ok(())
    }

    // ---- 等待 ----

    /// 等待资源使用完成
    ///
    /// 资源依赖的序列号尚未提交时返回 `SubmitError::SerialNotSubmitted`，否则等待会永远无法返回。
    pub fn finish_resource_use(&self, context: &dyn ErrorContext, usage: &ResourceUse, timeout: Duration) -> Result<()> {
        self.ensure_device_not_lost()?;
        let result = self.finish_resource_use_impl(context, usage, timeout);
        self.check_fatal(result)?;
        if !self.finished.is_empty() {
            self.release_finished_commands_and_cleanup_garbage(context)?;
        }
        Ok(())
    }

    fn finish_resource_use_impl(&self, context: &dyn ErrorContext, usage: &ResourceUse, timeout: Duration) -> Result<()> {
        self.check_usage_indices(usage)?;
        loop {
            let mut complete = self.complete_lock.lock();
            while !self.in_flight.is_empty() && !self.has_resource_use_finished(usage) {
                if !self.check_one_command_batch_locked(context)? {
                    self.finish_one_command_batch_locked(context, timeout, &mut complete)?;
                }
            }
            // 后面的批次可能也已经完成
            self.check_completed_commands_locked(context)?;
            drop(complete);

            if self.has_resource_use_finished(usage) {
                return Ok(());
            }
            if self.is_device_lost() {
                return Err(SubmitError::DeviceLost);
            }
            // 已推进 last-submitted 但批次还没进入在途队列，稍后重试
            if self.has_resource_use_submitted(usage) {
                std::thread::yield_now();
                continue;
            }

            let (index, serial) = usage
                .iter()
                .find(|(index, serial)| self.last_submitted.load(*index) < *serial)
                .unwrap_or((SerialIndex::new(0), Serial::ZERO));
            return Err(SubmitError::SerialNotSubmitted {
                index: index.value(),
                serial: serial.value(),
            });
        }
    }

    pub fn finish_queue_serial(&self, context: &dyn ErrorContext, queue_serial: QueueSerial, timeout: Duration) -> Result<()> {
        self.finish_resource_use(context, &ResourceUse::from_queue_serial(queue_serial), timeout)
    }

    /// 等待所有已提交的批次完成
    pub fn wait_idle(&self, context: &dyn ErrorContext, timeout: Duration) -> Result<()> {
        let mut usage = ResourceUse::new();
        for (index, serial) in self.last_submitted.snapshot().into_iter().enumerate() {
            if !serial.is_zero() {
                usage.set_queue_serial(QueueSerial::new(SerialIndex::new(index as u32), serial));
            }
        }
        self.finish_resource_use(context, &usage, timeout)
    }

    /// 带用户超时的等待
    ///
    /// 超时不算错误，返回 `vk::Result::TIMEOUT`；完成返回 `SUCCESS`；
    /// 在途批次已经全部完成但资源仍未完成（尚未提交）时返回 `NOT_READY`。
    pub fn wait_for_resource_use_to_finish_with_user_timeout(
        &self,
        context: &dyn ErrorContext,
        usage: &ResourceUse,
        timeout: Duration,
    ) -> Result<vk::Result> {
        self.ensure_device_not_lost()?;
        let result = self.wait_with_user_timeout_impl(context, usage, timeout);
        let result = self.check_fatal(result)?;
        if !self.finished.is_empty() {
            self.release_finished_commands_and_cleanup_garbage(context)?;
        }
        Ok(result)
    }

    fn wait_with_user_timeout_impl(
        &self,
        context: &dyn ErrorContext,
        usage: &ResourceUse,
        timeout: Duration,
    ) -> Result<vk::Result> {
        let deadline = Instant::now() + timeout;
        let mut complete = self.complete_lock.lock();
        let mut result = self.finished_or_not_ready(usage);

        while !self.in_flight.is_empty() && !self.has_resource_use_finished(usage) {
            if self.check_one_command_batch_locked(context)? {
                result = self.finished_or_not_ready(usage);
                continue;
            }
            let front = self.in_flight.with_front(|batch| batch.fence_waiter()).flatten();
            let waiter = match front {
                Some(waiter) => waiter,
                None => continue,
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            match Self::wait_unlocked(&mut complete, &waiter, remaining) {
                Ok(()) => result = self.finished_or_not_ready(usage),
                Err(vk::Result::TIMEOUT) => {
                    result = vk::Result::TIMEOUT;
                    break;
                }
                Err(status) => return Err(vk_error!(context, status, "CommandQueue::wait_for_resource_use")),
            }
        }

        self.check_completed_commands_locked(context)?;
        if self.has_resource_use_finished(usage) {
            result = vk::Result::SUCCESS;
        }
        Ok(result)
    }

    fn finished_or_not_ready(&self, usage: &ResourceUse) -> vk::Result {
        if self.has_resource_use_finished(usage) {
            vk::Result::SUCCESS
        } else {
            vk::Result::NOT_READY
        }
    }

    // ---- 垃圾 ----

    /// 延迟销毁：资源使用完成后才销毁对象
    pub fn collect_garbage(&self, usage: ResourceUse, objects: Vec<DeviceObject>) {
        if self.has_resource_use_finished(&usage) {
            for object in objects {
                self.device.destroy_object(object);
            }
            return;
        }
        self.garbage.lock().add(SharedGarbage::new(usage, objects));
    }

    /// 销毁已完成的垃圾，返回是否有对象被销毁
    pub fn cleanup_garbage(&self) -> bool {
        self.garbage.lock().cleanup(self.device.as_ref(), &self.last_completed) > 0
    }

    pub fn pending_garbage_count(&self) -> usize {
        self.garbage.lock().pending_object_count()
    }

    /// 尝试回收垃圾
    ///
    /// 不等待时没有回收到任何东西，就逐个等待在途批次，直到回收到垃圾或
    /// 在途批次只剩 `min_in_flight_batches_to_keep` 个。返回是否回收到了垃圾。
    pub fn cleanup_some_garbage(&self, context: &dyn ErrorContext, min_in_flight_batches_to_keep: usize) -> Result<bool> {
        self.ensure_device_not_lost()?;
        let result = self.cleanup_some_garbage_impl(context, min_in_flight_batches_to_keep);
        self.check_fatal(result)
    }

    fn cleanup_some_garbage_impl(&self, context: &dyn ErrorContext, min_in_flight_batches_to_keep: usize) -> Result<bool> {
        let mut complete = self.complete_lock.lock();
        let mut cleaned = self.cleanup_garbage();

        while !cleaned && self.in_flight.len() > min_in_flight_batches_to_keep {
            self.finish_one_command_batch_locked(context, self.limits.fence_wait_timeout, &mut complete)?;
            cleaned = MutexGuard::unlocked(&mut complete, || self.cleanup_garbage());
        }
        drop(complete);

        if !self.finished.is_empty() {
            self.release_finished_commands(context)?;
        }
        Ok(cleaned)
    }

    // ---- 查询 ----

    pub fn has_queue_serial_finished(&self, queue_serial: QueueSerial) -> bool {
        self.last_completed.covers(queue_serial)
    }

    pub fn has_queue_serial_submitted(&self, queue_serial: QueueSerial) -> bool {
        self.last_submitted.covers(queue_serial)
    }

    pub fn has_resource_use_finished(&self, usage: &ResourceUse) -> bool {
        self.last_completed.covers_use(usage)
    }

    pub fn has_resource_use_submitted(&self, usage: &ResourceUse) -> bool {
        self.last_submitted.covers_use(usage)
    }

    pub fn last_submitted_serial(&self, index: SerialIndex) -> Serial {
        self.last_submitted.load(index)
    }

    pub fn last_completed_serial(&self, index: SerialIndex) -> Serial {
        self.last_completed.load(index)
    }

    pub(crate) fn last_submitted_serials(&self) -> &AtomicQueueSerialArray {
        &self.last_submitted
    }

    /// 是否还有已提交但未完成的工作
    pub fn is_busy(&self) -> bool {
        let submitted = self.last_submitted.snapshot();
        let completed = self.last_completed.snapshot();
        submitted.iter().zip(completed.iter()).any(|(s, c)| s > c)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn finished_count(&self) -> usize {
        self.finished.len()
    }

    /// 在途和已完成未释放的批次总数
    pub fn num_all_commands(&self) -> usize {
        self.num_all_commands.load(Ordering::Acquire)
    }

    pub fn perf_counters(&self) -> QueuePerfCounters {
        self.submit_lock.lock().perf_counters
    }

    pub fn reset_per_frame_perf_counters(&self) {
        self.submit_lock.lock().perf_counters.reset_per_frame();
    }

    // ---- 设备丢失与销毁 ----

    /// 设备丢失处理
    ///
    /// 持有全部三把锁，不等待 fence 直接丢弃在途和已完成的批次，
    /// 并把 last-completed 推进到 last-submitted，等待方不会永远阻塞。只执行一次。
    pub fn handle_device_lost(&self) {
        if self.device_lost.swap(true, Ordering::AcqRel) {
            return;
        }
        engine_error!(
            in_flight = self.in_flight.len(),
            finished = self.finished.len(),
            "Device lost, discarding pending batches"
        );

        let _submit = self.submit_lock.lock();
        let _complete = self.complete_lock.lock();
        let _release = self.release_lock.lock();

        for batch in self.in_flight.drain().into_iter().chain(self.finished.drain()) {
            self.last_completed.advance(batch.queue_serial());
            self.num_all_commands.fetch_sub(1, Ordering::AcqRel);
            batch.destroy(&self.pool_access);
        }
        self.last_completed.advance_all(&self.last_submitted);
    }

    /// 销毁提交引擎
    ///
    /// 等待设备队列空闲后释放所有批次、垃圾、命令池和 fence。可以重复调用。
    pub fn destroy(&self, context: &dyn ErrorContext) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        if !self.is_device_lost() {
            for map in self.queue_maps.iter().flatten() {
                for queue in map.distinct_queues() {
                    if let Err(result) = self.device.queue_wait_idle(queue) {
                        engine_warn!(result = ?result, "Queue wait idle failed during teardown");
                    }
                }
            }
            if let Err(err) = self.check_and_cleanup_completed_commands(context) {
                engine_warn!(error = %err, "Failed to retire batches during teardown");
            }
        }

        let _submit = self.submit_lock.lock();
        let _complete = self.complete_lock.lock();
        let _release = self.release_lock.lock();

        for batch in self.in_flight.drain().into_iter().chain(self.finished.drain()) {
            self.num_all_commands.fetch_sub(1, Ordering::AcqRel);
            batch.destroy(&self.pool_access);
        }
        self.last_completed.advance_all(&self.last_submitted);
        self.garbage.lock().destroy_all(self.device.as_ref());
        self.pool_access.destroy();
        self.fence_recycler.destroy();
        engine_info!("Command queue destroyed");
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        self.destroy(&LoggingErrorContext);
    }
}
