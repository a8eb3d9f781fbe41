//! GPU 同步机制模块
//!
//! 提供提交层使用的同步原语：
//!
//! - [`FenceRecycler`]：可复用 fence 的池
//! - [`RecyclableFence`]：批次持有的 fence，最后一个引用释放时自动回到池中
//! - [`ExternalFence`]：调用方提供并共享的 fence
//! - [`SwapchainStatus`]：呈现请求的状态记录
//!
//! # Fence 生命周期
//!
//! 批次通过 `Arc` 持有 fence。等待线程会先克隆一份引用再释放锁去等待，
//! 因此 fence 只可能在所有等待结束之后才回到池中，不会出现“正在等待却被复用”。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use ash::prelude::VkResult;
use ash::vk;
use parking_lot::Mutex;

use crate::core::error::{ErrorContext, Result};
use crate::gfx::backend::DeviceBackend;
use crate::vk_try;

/// 共享的可回收 fence
pub type SharedFence = Arc<RecyclableFence>;

/// 共享的外部 fence
pub type SharedExternalFence = Arc<ExternalFence>;

/// Fence 回收池
///
/// 池中只保存不属于任何在途批次的 fence。池有自己的锁，与命令池无关。
pub struct FenceRecycler {
    device: Arc<dyn DeviceBackend>,
    pool: Mutex<FencePool>,
}

/// `destroyed` 和空闲列表在同一把锁下修改
#[derive(Default)]
struct FencePool {
    free: Vec<vk::Fence>,
    destroyed: bool,
}

impl FenceRecycler {
    pub fn new(device: Arc<dyn DeviceBackend>) -> Arc<Self> {
        Arc::new(Self {
            device,
            pool: Mutex::new(FencePool::default()),
        })
    }

    /// 取出一个未 signal 的 fence
    ///
    /// 池中有可用的 fence 时复用并重置，否则新建。
    pub fn fetch(self: &Arc<Self>, context: &dyn ErrorContext) -> Result<SharedFence> {
        let recycled = self.pool.lock().free.pop();
        let fence = match recycled {
            Some(fence) => {
                vk_try!(
                    context,
                    self.device.reset_fence(fence).map_err(|result| {
                        self.device.destroy_fence(fence);
                        result
                    }),
                    "FenceRecycler::fetch"
                );
                fence
            }
            None => vk_try!(context, self.device.create_fence(), "FenceRecycler::fetch"),
        };

        Ok(Arc::new(RecyclableFence {
            fence,
            device: Arc::clone(&self.device),
            recycler: Arc::downgrade(self),
            detached: AtomicBool::new(false),
        }))
    }

    /// 归还一个不再被引用的 fence
    pub fn recycle(&self, fence: vk::Fence) {
        let mut pool = self.pool.lock();
        if !pool.destroyed {
            pool.free.push(fence);
            return;
        }
        drop(pool);
        self.device.destroy_fence(fence);
    }

    /// 销毁池中的所有 fence，之后归还的 fence 会被直接销毁
    pub fn destroy(&self) {
        let fences = {
            let mut pool = self.pool.lock();
            pool.destroyed = true;
            std::mem::take(&mut pool.free)
        };
        for fence in fences {
            self.device.destroy_fence(fence);
        }
    }

    /// 池中空闲 fence 的数量
    pub fn pooled_count(&self) -> usize {
        self.pool.lock().free.len()
    }
}

/// 可回收的 fence
///
/// 最后一个引用释放时回到 [`FenceRecycler`]；池已不存在或 fence 被分离时直接销毁。
pub struct RecyclableFence {
    fence: vk::Fence,
    device: Arc<dyn DeviceBackend>,
    recycler: Weak<FenceRecycler>,
    detached: AtomicBool,
}

impl RecyclableFence {
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    /// `Ok(true)` 表示已 signal
    pub fn status(&self) -> VkResult<bool> {
        self.device.get_fence_status(self.fence)
    }

    pub fn wait(&self, timeout: Duration) -> VkResult<()> {
        self.device.wait_for_fence(self.fence, timeout)
    }

    /// 设备丢失后 fence 状态不可信，释放时销毁而不是回收
    pub fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }
}

impl Drop for RecyclableFence {
    fn drop(&mut self) {
        let recycler = if self.detached.load(Ordering::Acquire) {
            None
        } else {
            self.recycler.upgrade()
        };
        match recycler {
            Some(recycler) => recycler.recycle(self.fence),
            None => self.device.destroy_fence(self.fence),
        }
    }
}

/// 外部 fence
///
/// 由调用方创建并在提交时附加到批次上，调用方通过自己持有的引用查询完成状态。
pub struct ExternalFence {
    fence: vk::Fence,
    device: Arc<dyn DeviceBackend>,
}

impl ExternalFence {
    pub fn new(device: Arc<dyn DeviceBackend>, context: &dyn ErrorContext) -> Result<SharedExternalFence> {
        let fence = vk_try!(context, device.create_fence(), "ExternalFence::new");
        Ok(Arc::new(Self { fence, device }))
    }

    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    pub fn status(&self) -> VkResult<bool> {
        self.device.get_fence_status(self.fence)
    }

    pub fn wait(&self, timeout: Duration) -> VkResult<()> {
        self.device.wait_for_fence(self.fence, timeout)
    }
}

impl Drop for ExternalFence {
    fn drop(&mut self) {
        self.device.destroy_fence(self.fence);
    }
}

/// 交换链呈现状态
///
/// 由提交呈现的一方写入，由发起呈现的线程读取。呈现失败只记录在这里，不作为队列错误。
#[derive(Debug)]
pub struct SwapchainStatus {
    pending: AtomicBool,
    last_present_result: Mutex<vk::Result>,
}

impl SwapchainStatus {
    pub fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            last_present_result: Mutex::new(vk::Result::NOT_READY),
        }
    }

    /// 呈现请求已入队但尚未提交
    pub fn mark_pending(&self) {
        self.pending.store(true, Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// 记录呈现结果并清除 pending
    pub fn record_present_result(&self, result: vk::Result) {
        *self.last_present_result.lock() = result;
        self.pending.store(false, Ordering::Release);
    }

    pub fn last_present_result(&self) -> vk::Result {
        *self.last_present_result.lock()
    }
}

impl Default for SwapchainStatus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::LoggingErrorContext;
    use crate::gfx::software::SoftwareDevice;

    #[test]
    fn test_fence_is_recycled_on_last_drop() {
        let device = Arc::new(SoftwareDevice::immediate());
        let recycler = FenceRecycler::new(device.clone());

        let fence = recycler.fetch(&LoggingErrorContext).unwrap();
        let handle = fence.handle();
        let waiter = Arc::clone(&fence);

        drop(fence);
        // 还有等待方持有引用，不能回收
        assert_eq!(recycler.pooled_count(), 0);

        drop(waiter);
        assert_eq!(recycler.pooled_count(), 1);

        let again = recycler.fetch(&LoggingErrorContext).unwrap();
        assert_eq!(again.handle(), handle);
        assert_eq!(device.stats().fences_created, 1);
    }

    #[test]
    fn test_recycle_racing_destroy_never_strands_fences() {
        for _ in 0..20 {
            let device = Arc::new(SoftwareDevice::immediate());
            let recycler = FenceRecycler::new(device.clone());
            let fences: Vec<SharedFence> = (0..32)
                .map(|_| recycler.fetch(&LoggingErrorContext).unwrap())
                .collect();

            let dropper = std::thread::spawn(move || drop(fences));
            recycler.destroy();
            dropper.join().unwrap();

            assert_eq!(recycler.pooled_count(), 0);
            let stats = device.stats();
            assert_eq!(stats.fences_created, 32);
            assert_eq!(stats.fences_destroyed, 32);
        }
    }

    #[test]
    fn test_detached_fence_is_destroyed() {
        let device = Arc::new(SoftwareDevice::immediate());
        let recycler = FenceRecycler::new(device.clone());

        let fence = recycler.fetch(&LoggingErrorContext).unwrap();
        fence.detach();
        drop(fence);

        assert_eq!(recycler.pooled_count(), 0);
        assert_eq!(device.stats().fences_destroyed, 1);
    }

    #[test]
    fn test_recycler_destroy() {
        let device = Arc::new(SoftwareDevice::immediate());
        let recycler = FenceRecycler::new(device.clone());

        let a = recycler.fetch(&LoggingErrorContext).unwrap();
        let b = recycler.fetch(&LoggingErrorContext).unwrap();
        drop(a);
        recycler.destroy();
        // 销毁之后归还的 fence 直接销毁
        drop(b);

        assert_eq!(recycler.pooled_count(), 0);
        assert_eq!(device.stats().fences_destroyed, 2);
        assert_eq!(device.stats().validation_errors, 0);
    }

    #[test]
    fn test_swapchain_status() {
        let status = SwapchainStatus::new();
        assert_eq!(status.last_present_result(), vk::Result::NOT_READY);

        status.mark_pending();
        assert!(status.is_pending());

        status.record_present_result(vk::Result::SUBOPTIMAL_KHR);
        assert!(!status.is_pending());
        assert_eq!(status.last_present_result(), vk::Result::SUBOPTIMAL_KHR);
    }
}
