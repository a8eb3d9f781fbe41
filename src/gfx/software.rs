//! 软件设备后端
//!
//! 在 CPU 上模拟 fence、命令池、命令缓冲区生命周期和队列提交，
//! 不需要 GPU 和驱动即可驱动整个提交层。
//!
//! # 完成方式
//!
//! - `Immediate`：提交后立即 signal 对应的 fence
//! - `Manual`：提交进入待完成队列，由 [`SoftwareDevice::complete_next`] 按提交顺序推进
//!
//! # 合法性检查
//!
//! 违反 Vulkan 使用规则的调用（复用尚未完成的 fence、提交未结束录制的命令缓冲区、
//! 释放执行中的命令缓冲区等）会被计入 `validation_errors` 并输出警告。
//!
//! # 故障注入
//!
//! 支持注入设备丢失、下一次提交失败、下一次结束录制失败以及指定的呈现结果。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::{Condvar, Mutex};

use super::backend::{
    CommandBufferBegin, DeviceBackend, DeviceObject, PresentRequest, QueueSubmitInfo,
    RenderPassBegin,
};
use crate::core::config::CompletionMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FenceState {
    Unsignaled,
    Pending,
    Signaled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferState {
    Initial,
    Recording,
    Executable,
    Pending,
}

#[derive(Debug)]
struct BufferRecord {
    pool: u64,
    level: vk::CommandBufferLevel,
    state: BufferState,
    in_render_pass: bool,
}

#[derive(Debug)]
struct PendingSubmission {
    fence: vk::Fence,
    command_buffers: Vec<vk::CommandBuffer>,
}

#[derive(Debug, Default)]
struct SoftwareState {
    fences: HashMap<u64, FenceState>,
    pools: HashMap<u64, u32>,
    buffers: HashMap<u64, BufferRecord>,
    pending: VecDeque<PendingSubmission>,
}

/// 软件设备统计信息快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoftwareStats {
    pub submits: usize,
    pub presents: usize,
    pub fences_created: usize,
    pub fences_destroyed: usize,
    pub command_buffers_allocated: usize,
    pub command_buffers_freed: usize,
    pub live_command_buffers: usize,
    pub validation_errors: usize,
    pub objects_destroyed: usize,
}

#[derive(Debug, Default)]
struct Counters {
    submits: AtomicUsize,
    presents: AtomicUsize,
    fences_created: AtomicUsize,
    fences_destroyed: AtomicUsize,
    command_buffers_allocated: AtomicUsize,
    command_buffers_freed: AtomicUsize,
    validation_errors: AtomicUsize,
    objects_destroyed: AtomicUsize,
}

/// CPU 模拟的设备
pub struct SoftwareDevice {
    completion: CompletionMode,
    queue_count: u32,
    protected_content: bool,
    next_handle: AtomicU64,
    state: Mutex<SoftwareState>,
    progress: Condvar,
    lost: AtomicBool,
    submit_failure: Mutex<Option<vk::Result>>,
    end_failure: Mutex<Option<vk::Result>>,
    present_results: Mutex<VecDeque<vk::Result>>,
    counters: Counters,
}

impl SoftwareDevice {
    /// 创建软件设备
    ///
    /// # 参数
    ///
    /// * `completion` - fence 完成方式
    /// * `queue_count` - 唯一队列族暴露的队列数量
    /// * `protected_content` - 是否支持受保护队列
    pub fn new(completion: CompletionMode, queue_count: u32, protected_content: bool) -> Self {
        Self {
            completion,
            queue_count: queue_count.max(1),
            protected_content,
            next_handle: AtomicU64::new(1),
            state: Mutex::new(SoftwareState::default()),
            progress: Condvar::new(),
            lost: AtomicBool::new(false),
            submit_failure: Mutex::new(None),
            end_failure: Mutex::new(None),
            present_results: Mutex::new(VecDeque::new()),
            counters: Counters::default(),
        }
    }

    pub fn immediate() -> Self {
        Self::new(CompletionMode::Immediate, 3, false)
    }

    pub fn manual() -> Self {
        Self::new(CompletionMode::Manual, 3, false)
    }

    fn next_raw(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn validation_error(&self, message: &str) {
        self.counters.validation_errors.fetch_add(1, Ordering::Relaxed);
        crate::engine_warn!(reason = message, "Software device validation error");
    }

    /// 完成最早的一次待完成提交
    ///
    /// 返回是否有提交被完成。
    pub fn complete_next(&self) -> bool {
        if self.is_lost() {
            return false;
        }
        let mut state = self.state.lock();
        let completed = match state.pending.pop_front() {
            Some(submission) => {
                Self::retire(&mut state, submission);
                true
            }
            None => false,
        };
        drop(state);
        self.progress.notify_all();
        completed
    }

    /// 完成全部待完成提交，返回完成的数量
    pub fn complete_all(&self) -> usize {
        if self.is_lost() {
            return 0;
        }
        let mut state = self.state.lock();
        let mut count = 0;
        while let Some(submission) = state.pending.pop_front() {
            Self::retire(&mut state, submission);
            count += 1;
        }
        drop(state);
        self.progress.notify_all();
        count
    }

    fn retire(state: &mut SoftwareState, submission: PendingSubmission) {
        if submission.fence != vk::Fence::null() {
            state.fences.insert(submission.fence.as_raw(), FenceState::Signaled);
        }
        for buffer in submission.command_buffers {
            if let Some(record) = state.buffers.get_mut(&buffer.as_raw()) {
                record.state = BufferState::Executable;
            }
        }
    }

    /// 尚未完成的提交数量
    pub fn pending_submissions(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// 模拟设备丢失，之后的提交和等待都返回 `ERROR_DEVICE_LOST`
    pub fn inject_device_lost(&self) {
        self.lost.store(true, Ordering::Release);
        // 唤醒所有等待中的线程
        let _state = self.state.lock();
        self.progress.notify_all();
    }

    /// 下一次 `queue_submit` 返回给定的错误码
    pub fn fail_next_submit(&self, result: vk::Result) {
        *self.submit_failure.lock() = Some(result);
    }

    /// 下一次 `end_command_buffer` 返回给定的错误码
    pub fn fail_next_end(&self, result: vk::Result) {
        *self.end_failure.lock() = Some(result);
    }

    /// 下一次 `queue_present` 返回给定的结果
    pub fn inject_present_result(&self, result: vk::Result) {
        self.present_results.lock().push_back(result);
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> SoftwareStats {
        let live = self.state.lock().buffers.len();
        let c = &self.counters;
        SoftwareStats {
            submits: c.submits.load(Ordering::Relaxed),
            presents: c.presents.load(Ordering::Relaxed),
            fences_created: c.fences_created.load(Ordering::Relaxed),
            fences_destroyed: c.fences_destroyed.load(Ordering::Relaxed),
            command_buffers_allocated: c.command_buffers_allocated.load(Ordering::Relaxed),
            command_buffers_freed: c.command_buffers_freed.load(Ordering::Relaxed),
            live_command_buffers: live,
            validation_errors: c.validation_errors.load(Ordering::Relaxed),
            objects_destroyed: c.objects_destroyed.load(Ordering::Relaxed),
        }
    }
}

impl DeviceBackend for SoftwareDevice {
    fn backend_name(&self) -> &str {
        "Software"
    }

    fn queue_family_properties(&self) -> Vec<vk::QueueFamilyProperties> {
        let mut flags = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER;
        if self.protected_content {
            flags |= vk::QueueFlags::PROTECTED;
        }
        vec![vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: self.queue_count,
            ..Default::default()
        }]
    }

    fn device_queue(&self, family_index: u32, queue_index: u32, protected: bool) -> vk::Queue {
        let raw = 0x1000 + u64::from(family_index) * 0x100 + u64::from(queue_index) * 2 + u64::from(protected);
        vk::Queue::from_raw(raw)
    }

    fn create_fence(&self) -> VkResult<vk::Fence> {
        if self.is_lost() {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        let fence = vk::Fence::from_raw(self.next_raw());
        self.state.lock().fences.insert(fence.as_raw(), FenceState::Unsignaled);
        self.counters.fences_created.fetch_add(1, Ordering::Relaxed);
        Ok(fence)
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();
        match state.fences.get_mut(&fence.as_raw()) {
            Some(FenceState::Pending) => {
                drop(state);
                self.validation_error("reset of a fence that is still in use by a submission");
                Ok(())
            }
            Some(slot) => {
                *slot = FenceState::Unsignaled;
                Ok(())
            }
            None => {
                drop(state);
                self.validation_error("reset of an unknown fence");
                Ok(())
            }
        }
    }

    fn get_fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        if self.is_lost() {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        match self.state.lock().fences.get(&fence.as_raw()) {
            Some(FenceState::Signaled) => Ok(true),
            Some(_) => Ok(false),
            None => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> VkResult<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if self.is_lost() {
                return Err(vk::Result::ERROR_DEVICE_LOST);
            }
            match state.fences.get(&fence.as_raw()) {
                Some(FenceState::Signaled) => return Ok(()),
                Some(_) => {}
                None => return Err(vk::Result::ERROR_UNKNOWN),
            }
            if self.progress.wait_until(&mut state, deadline).timed_out() {
                return match state.fences.get(&fence.as_raw()) {
                    Some(FenceState::Signaled) => Ok(()),
                    _ => Err(vk::Result::TIMEOUT),
                };
            }
        }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let removed = self.state.lock().fences.remove(&fence.as_raw());
        match removed {
            Some(FenceState::Pending) if !self.is_lost() => {
                self.validation_error("destroy of a fence that is still in use by a submission")
            }
            None => self.validation_error("destroy of an unknown fence"),
            _ => {}
        }
        self.counters.fences_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        if self.is_lost() {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        Ok(vk::Semaphore::from_raw(self.next_raw()))
    }

    fn create_command_pool(&self, queue_family_index: u32, protected: bool) -> VkResult<vk::CommandPool> {
        if protected && !self.protected_content {
            return Err(vk::Result::ERROR_FEATURE_NOT_PRESENT);
        }
        let pool = vk::CommandPool::from_raw(self.next_raw());
        self.state.lock().pools.insert(pool.as_raw(), queue_family_index);
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        state.pools.remove(&pool.as_raw());
        // 销毁命令池会隐式释放其中的所有命令缓冲区
        let before = state.buffers.len();
        state.buffers.retain(|_, record| record.pool != pool.as_raw());
        let released = before - state.buffers.len();
        self.counters.command_buffers_freed.fetch_add(released, Ordering::Relaxed);
    }

    fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
    ) -> VkResult<vk::CommandBuffer> {
        let mut state = self.state.lock();
        if !state.pools.contains_key(&pool.as_raw()) {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        let buffer = vk::CommandBuffer::from_raw(self.next_raw());
        state.buffers.insert(
            buffer.as_raw(),
            BufferRecord {
                pool: pool.as_raw(),
                level,
                state: BufferState::Initial,
                in_render_pass: false,
            },
        );
        self.counters.command_buffers_allocated.fetch_add(1, Ordering::Relaxed);
        Ok(buffer)
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        for buffer in buffers {
            let mut state = self.state.lock();
            let problem = match state.buffers.get(&buffer.as_raw()) {
                None => Some("free of an unknown or already freed command buffer"),
                Some(record) if record.pool != pool.as_raw() => {
                    Some("free of a command buffer through the wrong pool")
                }
                Some(record) if record.state == BufferState::Pending && !self.is_lost() => {
                    Some("free of a command buffer that is still executing")
                }
                Some(_) => None,
            };
            if problem.is_none() {
                state.buffers.remove(&buffer.as_raw());
                self.counters.command_buffers_freed.fetch_add(1, Ordering::Relaxed);
            }
            drop(state);
            if let Some(message) = problem {
                self.validation_error(message);
            }
        }
    }

    fn reset_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state.lock();
        let pending = match state.buffers.get_mut(&buffer.as_raw()) {
            Some(record) if record.state == BufferState::Pending => true,
            Some(record) => {
                record.state = BufferState::Initial;
                record.in_render_pass = false;
                false
            }
            None => return Err(vk::Result::ERROR_UNKNOWN),
        };
        drop(state);
        if pending {
            self.validation_error("reset of a command buffer that is still executing");
        }
        Ok(())
    }

    fn begin_command_buffer(&self, buffer: vk::CommandBuffer, begin: &CommandBufferBegin) -> VkResult<()> {
        let mut state = self.state.lock();
        let record = state.buffers.get_mut(&buffer.as_raw()).ok_or(vk::Result::ERROR_UNKNOWN)?;
        let valid = matches!(record.state, BufferState::Initial | BufferState::Executable)
            && record.level == begin.level;
        if valid {
            record.state = BufferState::Recording;
            return Ok(());
        }
        drop(state);
        self.validation_error("begin of a command buffer that is recording or executing");
        Ok(())
    }

    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()> {
        if let Some(result) = self.end_failure.lock().take() {
            return Err(result);
        }
        let mut state = self.state.lock();
        let record = state.buffers.get_mut(&buffer.as_raw()).ok_or(vk::Result::ERROR_UNKNOWN)?;
        if record.state == BufferState::Recording && !record.in_render_pass {
            record.state = BufferState::Executable;
            return Ok(());
        }
        drop(state);
        self.validation_error("end of a command buffer that is not recording");
        Ok(())
    }

    fn cmd_execute_commands(&self, primary: vk::CommandBuffer, secondaries: &[vk::CommandBuffer]) {
        let state = self.state.lock();
        let primary_ok = state.buffers.get(&primary.as_raw()).map_or(false, |record| {
            record.state == BufferState::Recording && record.level == vk::CommandBufferLevel::PRIMARY
        });
        let secondaries_ok = secondaries.iter().all(|buffer| {
            state.buffers.get(&buffer.as_raw()).map_or(false, |record| {
                record.state == BufferState::Executable && record.level == vk::CommandBufferLevel::SECONDARY
            })
        });
        drop(state);
        if !primary_ok || !secondaries_ok {
            self.validation_error("execute commands with a buffer in the wrong state");
        }
    }

    fn cmd_begin_render_pass(&self, primary: vk::CommandBuffer, _begin: &RenderPassBegin) {
        let mut state = self.state.lock();
        let ok = match state.buffers.get_mut(&primary.as_raw()) {
            Some(record) if record.state == BufferState::Recording && !record.in_render_pass => {
                record.in_render_pass = true;
                true
            }
            _ => false,
        };
        drop(state);
        if !ok {
            self.validation_error("begin render pass outside of recording");
        }
    }

    fn cmd_end_render_pass(&self, primary: vk::CommandBuffer) {
        let mut state = self.state.lock();
        let ok = match state.buffers.get_mut(&primary.as_raw()) {
            Some(record) if record.in_render_pass => {
                record.in_render_pass = false;
                true
            }
            _ => false,
        };
        drop(state);
        if !ok {
            self.validation_error("end render pass without a matching begin");
        }
    }

    fn queue_submit(&self, _queue: vk::Queue, submit: &QueueSubmitInfo, fence: vk::Fence) -> VkResult<()> {
        if self.is_lost() {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        if let Some(result) = self.submit_failure.lock().take() {
            if result == vk::Result::ERROR_DEVICE_LOST {
                self.inject_device_lost();
            }
            return Err(result);
        }

        let mut state = self.state.lock();
        let mut problems = Vec::new();

        if fence != vk::Fence::null() {
            match state.fences.get_mut(&fence.as_raw()) {
                Some(slot) if *slot == FenceState::Unsignaled => *slot = FenceState::Pending,
                Some(_) => problems.push("submit with a fence that is not unsignaled"),
                None => problems.push("submit with an unknown fence"),
            }
        }
        for buffer in &submit.command_buffers {
            match state.buffers.get_mut(&buffer.as_raw()) {
                Some(record) if record.state == BufferState::Executable => {
                    record.state = BufferState::Pending;
                }
                _ => problems.push("submit of a command buffer that is not executable"),
            }
        }

        let submission = PendingSubmission {
            fence,
            command_buffers: submit.command_buffers.clone(),
        };
        match self.completion {
            CompletionMode::Immediate => Self::retire(&mut state, submission),
            CompletionMode::Manual => state.pending.push_back(submission),
        }
        drop(state);
        self.progress.notify_all();

        self.counters.submits.fetch_add(1, Ordering::Relaxed);
        for message in problems {
            self.validation_error(message);
        }
        Ok(())
    }

    fn queue_present(&self, _queue: vk::Queue, _present: &PresentRequest) -> vk::Result {
        self.counters.presents.fetch_add(1, Ordering::Relaxed);
        if self.is_lost() {
            return vk::Result::ERROR_DEVICE_LOST;
        }
        self.present_results.lock().pop_front().unwrap_or(vk::Result::SUCCESS)
    }

    fn queue_wait_idle(&self, _queue: vk::Queue) -> VkResult<()> {
        if self.is_lost() {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        // 模拟 GPU 执行完所有已提交的工作
        self.complete_all();
        Ok(())
    }

    fn destroy_object(&self, object: DeviceObject) {
        match object {
            DeviceObject::Fence(fence) => self.destroy_fence(fence),
            _ => {
                self.counters.objects_destroyed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn recorded_primary(device: &SoftwareDevice) -> (vk::CommandPool, vk::CommandBuffer) {
        let pool = device.create_command_pool(0, false).unwrap();
        let buffer = device.allocate_command_buffer(pool, vk::CommandBufferLevel::PRIMARY).unwrap();
        device.begin_command_buffer(buffer, &CommandBufferBegin::primary()).unwrap();
        device.end_command_buffer(buffer).unwrap();
        (pool, buffer)
    }

    fn submit_info(buffer: vk::CommandBuffer) -> QueueSubmitInfo {
        QueueSubmitInfo {
            command_buffers: vec![buffer],
            ..Default::default()
        }
    }

    #[test]
    fn test_manual_completion_signals_in_order() {
        let device = SoftwareDevice::manual();
        let queue = device.device_queue(0, 0, false);
        let (_pool, buffer) = recorded_primary(&device);
        let fence = device.create_fence().unwrap();

        device.queue_submit(queue, &submit_info(buffer), fence).unwrap();
        assert_eq!(device.get_fence_status(fence), Ok(false));
        assert_eq!(
            device.wait_for_fence(fence, Duration::from_millis(5)),
            Err(vk::Result::TIMEOUT)
        );

        assert!(device.complete_next());
        assert_eq!(device.get_fence_status(fence), Ok(true));
        assert_eq!(device.stats().validation_errors, 0);
    }

    #[test]
    fn test_fence_reuse_while_pending_is_reported() {
        let device = SoftwareDevice::manual();
        let queue = device.device_queue(0, 0, false);
        let (_pool, buffer) = recorded_primary(&device);
        let fence = device.create_fence().unwrap();

        device.queue_submit(queue, &submit_info(buffer), fence).unwrap();
        device.reset_fence(fence).unwrap();
        assert_eq!(device.stats().validation_errors, 1);
    }

    #[test]
    fn test_wait_is_woken_by_completion() {
        let device = Arc::new(SoftwareDevice::manual());
        let queue = device.device_queue(0, 0, false);
        let (_pool, buffer) = recorded_primary(&device);
        let fence = device.create_fence().unwrap();
        device.queue_submit(queue, &submit_info(buffer), fence).unwrap();

        let completer = {
            let device = Arc::clone(&device);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                device.complete_next();
            })
        };
        assert_eq!(device.wait_for_fence(fence, Duration::from_secs(5)), Ok(()));
        completer.join().unwrap();
    }

    #[test]
    fn test_device_lost_fails_everything() {
        let device = SoftwareDevice::immediate();
        let queue = device.device_queue(0, 0, false);
        let fence = device.create_fence().unwrap();

        device.inject_device_lost();
        assert_eq!(
            device.queue_submit(queue, &QueueSubmitInfo::default(), fence),
            Err(vk::Result::ERROR_DEVICE_LOST)
        );
        assert_eq!(device.get_fence_status(fence), Err(vk::Result::ERROR_DEVICE_LOST));
        let present = PresentRequest {
            swapchain: vk::SwapchainKHR::null(),
            image_index: 0,
            wait_semaphores: Vec::new(),
        };
        assert_eq!(device.queue_present(queue, &present), vk::Result::ERROR_DEVICE_LOST);
    }

    #[test]
    fn test_double_free_is_reported() {
        let device = SoftwareDevice::immediate();
        let (pool, buffer) = recorded_primary(&device);

        device.free_command_buffers(pool, &[buffer]);
        assert_eq!(device.stats().live_command_buffers, 0);
        device.free_command_buffers(pool, &[buffer]);
        assert_eq!(device.stats().validation_errors, 1);
    }
}
