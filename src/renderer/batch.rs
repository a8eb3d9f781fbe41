//! 提交批次模块
//!
//! [`CommandBatch`] 是一次提交的全部内容：主命令缓冲区、次级命令缓冲区、fence 和序列号。
//! 批次只记录自己的保护类型；归还命令缓冲区时由 [`CommandPoolAccess`] 按保护类型查找对应的池。
//!
//! [`CommandBatchQueue`] 是有界的批次队列，内部锁是叶子锁，持有期间不获取其他锁。

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use ash::prelude::VkResult;
use ash::vk;
use parking_lot::Mutex;

use super::command::{CommandPoolAccess, PrimaryCommandBuffer, ProtectionType, SecondaryCommandBufferCollector};
use super::serial::QueueSerial;
use super::sync::{FenceRecycler, SharedExternalFence, SharedFence};
use crate::core::error::{ErrorContext, Result};

/// 批次持有的 fence
enum BatchFence {
    None,
    Recycled(SharedFence),
    External(SharedExternalFence),
}

/// 在不持有队列锁的情况下等待 fence
///
/// 持有 fence 的一份引用，等待期间 fence 不会被回收。
#[derive(Clone)]
pub enum FenceWaiter {
    Recycled(SharedFence),
    External(SharedExternalFence),
}

impl FenceWaiter {
    pub fn wait(&self, timeout: Duration) -> VkResult<()> {
        match self {
            FenceWaiter::Recycled(fence) => fence.wait(timeout),
            FenceWaiter::External(fence) => fence.wait(timeout),
        }
    }

    pub fn status(&self) -> VkResult<bool> {
        match self {
            FenceWaiter::Recycled(fence) => fence.status(),
            FenceWaiter::External(fence) => fence.status(),
        }
    }
}

/// 提交批次
pub struct CommandBatch {
    queue_serial: QueueSerial,
    protection: ProtectionType,
    primary: Option<PrimaryCommandBuffer>,
    secondaries: SecondaryCommandBufferCollector,
    fence: BatchFence,
}

impl CommandBatch {
    pub fn new(queue_serial: QueueSerial, protection: ProtectionType) -> Self {
        Self {
            queue_serial,
            protection,
            primary: None,
            secondaries: SecondaryCommandBufferCollector::default(),
            fence: BatchFence::None,
        }
    }

    pub fn queue_serial(&self) -> QueueSerial {
        self.queue_serial
    }

    pub fn protection(&self) -> ProtectionType {
        self.protection
    }

    pub fn set_primary_commands(
        &mut self,
        primary: Option<PrimaryCommandBuffer>,
        secondaries: SecondaryCommandBufferCollector,
    ) {
        self.primary = primary;
        self.secondaries = secondaries;
    }

    pub fn primary_handle(&self) -> Option<vk::CommandBuffer> {
        self.primary.as_ref().map(PrimaryCommandBuffer::handle)
    }

    /// 从回收池取一个 fence
    pub fn init_fence(&mut self, recycler: &Arc<FenceRecycler>, context: &dyn ErrorContext) -> Result<()> {
        self.fence = BatchFence::Recycled(recycler.fetch(context)?);
        Ok(())
    }

    pub fn set_external_fence(&mut self, fence: SharedExternalFence) {
        self.fence = BatchFence::External(fence);
    }

    pub fn has_fence(&self) -> bool {
        !matches!(self.fence, BatchFence::None)
    }

    pub fn fence_handle(&self) -> vk::Fence {
        match &self.fence {
            BatchFence::None => vk::Fence::null(),
            BatchFence::Recycled(fence) => fence.handle(),
            BatchFence::External(fence) => fence.handle(),
        }
    }

    /// `Ok(true)` 表示批次已完成；没有 fence 的批次视为已完成
    pub fn fence_status(&self) -> VkResult<bool> {
        match self.fence_waiter() {
            Some(waiter) => waiter.status(),
            None => Ok(true),
        }
    }

    pub fn wait_fence(&self, timeout: Duration) -> VkResult<()> {
        match self.fence_waiter() {
            Some(waiter) => waiter.wait(timeout),
            None => Ok(()),
        }
    }

    pub fn fence_waiter(&self) -> Option<FenceWaiter> {
        match &self.fence {
            BatchFence::None => None,
            BatchFence::Recycled(fence) => Some(FenceWaiter::Recycled(Arc::clone(fence))),
            BatchFence::External(fence) => Some(FenceWaiter::External(Arc::clone(fence))),
        }
    }

    /// 批次完成后释放资源：命令缓冲区归还命令池，fence 归还回收池
    pub fn release(mut self, context: &dyn ErrorContext, pool_access: &CommandPoolAccess) -> Result<()> {
        // 先释放 fence 引用，最后一个引用释放时回到回收池
        self.fence = BatchFence::None;
        let primary_result = match self.primary.take() {
            Some(primary) => pool_access.recycle_primary_command_buffer(context, primary),
            None => Ok(()),
        };
        let secondary_result = pool_access.release_secondary_command_buffers(context, &mut self.secondaries);
        primary_result.and(secondary_result)
    }

    /// 设备丢失时丢弃批次：不等待 fence，命令缓冲区直接释放，fence 直接销毁
    pub fn destroy(mut self, pool_access: &CommandPoolAccess) {
        if let BatchFence::Recycled(fence) = &self.fence {
            fence.detach();
        }
        self.fence = BatchFence::None;
        if let Some(primary) = self.primary.take() {
            pool_access.destroy_primary_command_buffer(primary);
        }
        pool_access.destroy_secondary_command_buffers(&mut self.secondaries);
    }
}

/// 有界批次队列
pub struct CommandBatchQueue {
    batches: Mutex<VecDeque<CommandBatch>>,
    capacity: usize,
}

impl CommandBatchQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            batches: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 入队；队列已满时把批次原样返回
    pub fn push(&self, batch: CommandBatch) -> std::result::Result<(), CommandBatch> {
        let mut batches = self.batches.lock();
        if batches.len() >= self.capacity {
            return Err(batch);
        }
        batches.push_back(batch);
        Ok(())
    }

    pub fn pop_front(&self) -> Option<CommandBatch> {
        self.batches.lock().pop_front()
    }

    /// 读取队首批次
    ///
    /// 闭包在队列锁内执行，不能获取其他锁。
    pub fn with_front<R>(&self, f: impl FnOnce(&CommandBatch) -> R) -> Option<R> {
        self.batches.lock().front().map(f)
    }

    pub fn len(&self) -> usize {
        self.batches.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// 取出全部批次
    pub fn drain(&self) -> Vec<CommandBatch> {
        self.batches.lock().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::LoggingErrorContext;
    use crate::gfx::software::SoftwareDevice;
    use crate::renderer::serial::{Serial, SerialIndex};

    fn batch(serial: u64) -> CommandBatch {
        CommandBatch::new(
            QueueSerial::new(SerialIndex::new(0), Serial::new(serial)),
            ProtectionType::Unprotected,
        )
    }

    #[test]
    fn test_batch_queue_is_bounded_and_ordered() {
        let queue = CommandBatchQueue::new(2);
        assert!(queue.push(batch(1)).is_ok());
        assert!(queue.push(batch(2)).is_ok());
        assert!(queue.is_full());

        let rejected = queue.push(batch(3)).unwrap_err();
        assert_eq!(rejected.queue_serial().serial(), Serial::new(3));

        assert_eq!(queue.with_front(|b| b.queue_serial().serial()), Some(Serial::new(1)));
        assert_eq!(queue.pop_front().unwrap().queue_serial().serial(), Serial::new(1));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_release_returns_fence_to_recycler() {
        let device = Arc::new(SoftwareDevice::immediate());
        let recycler = FenceRecycler::new(device.clone());
        let pool_access = CommandPoolAccess::new(device.clone());

        let mut b = batch(1);
        b.init_fence(&recycler, &LoggingErrorContext).unwrap();
        assert!(b.has_fence());
        assert_ne!(b.fence_handle(), vk::Fence::null());

        b.release(&LoggingErrorContext, &pool_access).unwrap();
        assert_eq!(recycler.pooled_count(), 1);
    }

    #[test]
    fn test_destroy_does_not_recycle_fence() {
        let device = Arc::new(SoftwareDevice::immediate());
        let recycler = FenceRecycler::new(device.clone());
        let pool_access = CommandPoolAccess::new(device.clone());

        let mut b = batch(1);
        b.init_fence(&recycler, &LoggingErrorContext).unwrap();
        b.destroy(&pool_access);

        assert_eq!(recycler.pooled_count(), 0);
        assert_eq!(device.stats().fences_destroyed, 1);
    }
}
