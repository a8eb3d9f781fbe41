//! 提交层模块
//!
//! 本模块提供统一的提交接口，封装同步和异步两条提交路径。
//! 生产者通过 [`Renderer`] 录制、提交、呈现和等待，而不需要关心
//! 当前配置使用的是直接提交还是工作线程提交。
//!
//! # 架构设计
//!
//! - `Renderer`：统一的提交接口，对外提供一致的 API
//! - `Submission`：内部枚举，封装直接提交和异步提交两种路径
//! - [`queue::CommandQueue`]：同步提交引擎，所有路径最终都落到这里
//! - [`processor::CommandProcessor`]：工作线程和有界任务队列

use std::sync::Arc;
use std::time::Duration;

use ash::vk;

use crate::core::config::Config;
use crate::core::error::{ErrorContext, LoggingErrorContext, Result, SubmitError};
use crate::engine_info;
use crate::gfx::backend::{DeviceBackend, DeviceObject, PresentRequest, RenderPassInheritance};

pub mod batch;
pub mod command;
pub mod garbage;
pub mod metrics;
pub mod processor;
pub mod queue;
pub mod serial;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

use command::{OutsideRenderPassCommands, Priority, ProtectionType, RenderPassCommands, SecondaryCommandBuffer};
use metrics::QueuePerfCounters;
use processor::CommandProcessor;
use queue::{CommandQueue, SubmitPolicy};
use serial::{QueueSerial, QueueSerialIndexAllocator, ResourceUse, SerialIndex};
use sync::{SharedExternalFence, SwapchainStatus};

/// 提交路径
///
/// 通过枚举在直接提交和工作线程提交之间分派，避免动态分发。
enum Submission {
    Direct,
    Async(CommandProcessor),
}

/// 统一的提交接口
pub struct Renderer {
    command_queue: Arc<CommandQueue>,
    submission: Submission,
    serial_indices: QueueSerialIndexAllocator,
    fence_wait_timeout: Duration,
}

impl Renderer {
    /// 创建提交层
    ///
    /// # 参数
    ///
    /// * `device` - 设备后端
    /// * `config` - 配置，`submission.async_command_queue` 决定是否启动工作线程
    pub fn new(device: Arc<dyn DeviceBackend>, config: &Config) -> Result<Self> {
        config.validate()?;
        let command_queue = Arc::new(CommandQueue::new(device, &LoggingErrorContext, config)?);

        let submission = if config.submission.async_command_queue {
            let processor = CommandProcessor::new(Arc::clone(&command_queue), config.submission.task_queue_capacity);
            processor.init()?;
            engine_info!(capacity = config.submission.task_queue_capacity, "Asynchronous submission enabled");
            Submission::Async(processor)
        } else {
            engine_info!("Direct submission enabled");
            Submission::Direct
        };

        Ok(Self {
            serial_indices: QueueSerialIndexAllocator::new(command_queue.max_queue_serial_indices()),
            command_queue,
            submission,
            fence_wait_timeout: config.submission.fence_wait_timeout(),
        })
    }

    pub fn is_async(&self) -> bool {
        matches!(self.submission, Submission::Async(_))
    }

    pub fn command_queue(&self) -> &Arc<CommandQueue> {
        &self.command_queue
    }

    pub fn processor(&self) -> Option<&CommandProcessor> {
        match &self.submission {
            Submission::Direct => None,
            Submission::Async(processor) => Some(processor),
        }
    }

    // ---- 序列号 ----

    /// 为一个生产者分配队列索引
    pub fn allocate_queue_serial_index(&self) -> Result<SerialIndex> {
        self.serial_indices
            .allocate()
            .ok_or_else(|| SubmitError::Runtime("out of queue serial indices".to_string()))
    }

    pub fn release_queue_serial_index(&self, index: SerialIndex) {
        self.serial_indices.release(index);
    }

    pub fn generate_queue_serial(&self, index: SerialIndex) -> Result<QueueSerial> {
        self.command_queue.generate_queue_serial(index)
    }

    // ---- 录制与提交 ----

    pub fn allocate_secondary_command_buffer(
        &self,
        context: &dyn ErrorContext,
        protection: ProtectionType,
        inheritance: Option<RenderPassInheritance>,
    ) -> Result<SecondaryCommandBuffer> {
        self.command_queue
            .pool_access()
            .allocate_secondary_command_buffer(context, protection, inheritance)
    }

    pub fn flush_wait_semaphores(
        &self,
        context: &dyn ErrorContext,
        protection: ProtectionType,
        priority: Priority,
        semaphores: Vec<vk::Semaphore>,
        stage_masks: Vec<vk::PipelineStageFlags>,
    ) -> Result<()> {
        match &self.submission {
            Submission::Direct => self
                .command_queue
                .flush_wait_semaphores(protection, priority, semaphores, stage_masks),
            Submission::Async(processor) => {
                processor.enqueue_flush_wait_semaphores(context, protection, priority, semaphores, stage_masks)
            }
        }
    }

    pub fn flush_outside_render_pass_commands(
        &self,
        context: &dyn ErrorContext,
        protection: ProtectionType,
        priority: Priority,
        commands: OutsideRenderPassCommands,
    ) -> Result<()> {
        match &self.submission {
            Submission::Direct => self
                .command_queue
                .flush_outside_render_pass_commands(context, protection, priority, commands)
                .map(|_| ()),
            Submission::Async(processor) => {
                processor.enqueue_flush_outside_render_pass_commands(context, protection, priority, commands)
            }
        }
    }

    pub fn flush_render_pass_commands(
        &self,
        context: &dyn ErrorContext,
        protection: ProtectionType,
        priority: Priority,
        commands: RenderPassCommands,
        framebuffer_override: Option<vk::Framebuffer>,
    ) -> Result<()> {
        match &self.submission {
            Submission::Direct => self
                .command_queue
                .flush_render_pass_commands(context, protection, priority, commands, framebuffer_override)
                .map(|_| ()),
            Submission::Async(processor) => processor.enqueue_flush_render_pass_commands(
                context,
                protection,
                priority,
                commands,
                framebuffer_override,
            ),
        }
    }

    pub fn submit_commands(
        &self,
        context: &dyn ErrorContext,
        protection: ProtectionType,
        priority: Priority,
        signal_semaphore: Option<vk::Semaphore>,
        external_fence: Option<SharedExternalFence>,
        queue_serial: QueueSerial,
    ) -> Result<()> {
        match &self.submission {
            Submission::Direct => self.command_queue.submit_commands(
                context,
                protection,
                priority,
                signal_semaphore,
                external_fence,
                queue_serial,
            ),
            Submission::Async(processor) => processor.enqueue_submit_commands(
                context,
                protection,
                priority,
                signal_semaphore,
                external_fence,
                queue_serial,
            ),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn queue_submit_one_off(
        &self,
        context: &dyn ErrorContext,
        protection: ProtectionType,
        priority: Priority,
        command_buffer: Option<vk::CommandBuffer>,
        wait_semaphore: Option<(vk::Semaphore, vk::PipelineStageFlags)>,
        submit_policy: SubmitPolicy,
        queue_serial: QueueSerial,
    ) -> Result<()> {
        match &self.submission {
            Submission::Direct => self.command_queue.queue_submit_one_off(
                context,
                protection,
                priority,
                command_buffer,
                wait_semaphore,
                submit_policy,
                queue_serial,
            ),
            Submission::Async(processor) => processor.enqueue_submit_one_off_commands(
                context,
                protection,
                priority,
                command_buffer,
                wait_semaphore,
                submit_policy,
                queue_serial,
            ),
        }
    }

    /// 呈现，结果写入 `swapchain_status`
    pub fn queue_present(
        &self,
        context: &dyn ErrorContext,
        priority: Priority,
        request: PresentRequest,
        swapchain_status: &Arc<SwapchainStatus>,
    ) -> Result<()> {
        match &self.submission {
            Submission::Direct => {
                self.command_queue.queue_present(priority, &request, swapchain_status);
                Ok(())
            }
            Submission::Async(processor) => {
                processor.enqueue_present(context, priority, request, Arc::clone(swapchain_status))
            }
        }
    }

    // ---- 等待 ----

    /// 异步路径上先等待资源使用被提交
    fn ensure_submitted(&self, context: &dyn ErrorContext, usage: &ResourceUse) -> Result<()> {
        match &self.submission {
            Submission::Direct => Ok(()),
            Submission::Async(processor) => processor.wait_for_resource_use_to_be_submitted(context, usage),
        }
    }

    pub fn finish_resource_use(&self, context: &dyn ErrorContext, usage: &ResourceUse) -> Result<()> {
        self.ensure_submitted(context, usage)?;
        self.command_queue.finish_resource_use(context, usage, self.fence_wait_timeout)
    }

    pub fn finish_queue_serial(&self, context: &dyn ErrorContext, queue_serial: QueueSerial) -> Result<()> {
        self.finish_resource_use(context, &ResourceUse::from_queue_serial(queue_serial))
    }

    /// 带用户超时的等待，超时返回 `vk::Result::TIMEOUT`
    pub fn wait_for_resource_use_to_finish_with_user_timeout(
        &self,
        context: &dyn ErrorContext,
        usage: &ResourceUse,
        timeout: Duration,
    ) -> Result<vk::Result> {
        self.ensure_submitted(context, usage)?;
        self.command_queue
            .wait_for_resource_use_to_finish_with_user_timeout(context, usage, timeout)
    }

    pub fn wait_for_present_to_be_submitted(
        &self,
        context: &dyn ErrorContext,
        swapchain_status: &SwapchainStatus,
    ) -> Result<()> {
        match &self.submission {
            Submission::Direct => Ok(()),
            Submission::Async(processor) => processor.wait_for_present_to_be_submitted(context, swapchain_status),
        }
    }

    /// 等待所有工作提交并完成
    pub fn wait_idle(&self, context: &dyn ErrorContext) -> Result<()> {
        if let Submission::Async(processor) = &self.submission {
            processor.wait_for_all_work_to_be_submitted(context)?;
        }
        self.command_queue.wait_idle(context, self.fence_wait_timeout)
    }

    // ---- 查询 ----

    pub fn has_resource_use_finished(&self, usage: &ResourceUse) -> bool {
        self.command_queue.has_resource_use_finished(usage)
    }

    pub fn has_resource_use_submitted(&self, usage: &ResourceUse) -> bool {
        self.command_queue.has_resource_use_submitted(usage)
    }

    /// 直接提交路径上入队即提交
    pub fn has_resource_use_enqueued(&self, usage: &ResourceUse) -> bool {
        match &self.submission {
            Submission::Direct => self.command_queue.has_resource_use_submitted(usage),
            Submission::Async(processor) => processor.has_resource_use_enqueued(usage),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.command_queue.is_busy()
    }

    pub fn is_device_lost(&self) -> bool {
        self.command_queue.is_device_lost()
    }

    /// 取回异步错误；直接提交路径上只报告设备丢失
    pub fn check_and_pop_pending_error(&self, context: &dyn ErrorContext) -> Result<()> {
        match &self.submission {
            Submission::Direct if self.command_queue.is_device_lost() => Err(SubmitError::DeviceLost),
            Submission::Direct => Ok(()),
            Submission::Async(processor) => processor.check_and_pop_pending_error(context),
        }
    }

    // ---- 回收 ----

    /// 检查完成情况并回收；异步路径上交给工作线程在空闲时处理
    pub fn check_completed_commands_and_cleanup(&self, context: &dyn ErrorContext) -> Result<()> {
        match &self.submission {
            Submission::Direct => self.command_queue.check_and_cleanup_completed_commands(context),
            Submission::Async(processor) => {
                processor.request_commands_and_garbage_cleanup();
                Ok(())
            }
        }
    }

    pub fn collect_garbage(&self, usage: ResourceUse, objects: Vec<DeviceObject>) {
        self.command_queue.collect_garbage(usage, objects);
    }

    pub fn cleanup_some_garbage(&self, context: &dyn ErrorContext, min_in_flight_batches_to_keep: usize) -> Result<bool> {
        self.command_queue.cleanup_some_garbage(context, min_in_flight_batches_to_keep)
    }

    pub fn perf_counters(&self) -> QueuePerfCounters {
        self.command_queue.perf_counters()
    }

    pub fn reset_per_frame_perf_counters(&self) {
        self.command_queue.reset_per_frame_perf_counters();
    }

    /// 停止工作线程并销毁提交引擎
    pub fn destroy(&self) {
        if let Submission::Async(processor) = &self.submission {
            processor.destroy();
        }
        self.command_queue.destroy(&LoggingErrorContext);
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::gfx::software::SoftwareDevice;
    use crate::renderer::testing::{self, CTX};

    fn renderer(device: &Arc<SoftwareDevice>, async_queue: bool) -> Renderer {
        let mut config = Config::default();
        config.submission.async_command_queue = async_queue;
        Renderer::new(device.clone(), &config).unwrap()
    }

    fn record_and_submit(renderer: &Renderer, index: SerialIndex) -> QueueSerial {
        let secondary = renderer
            .allocate_secondary_command_buffer(CTX, ProtectionType::Unprotected, None)
            .unwrap();
        renderer
            .flush_outside_render_pass_commands(
                CTX,
                ProtectionType::Unprotected,
                Priority::Medium,
                OutsideRenderPassCommands::new(secondary),
            )
            .unwrap();
        let serial = renderer.generate_queue_serial(index).unwrap();
        renderer
            .submit_commands(CTX, ProtectionType::Unprotected, Priority::Medium, None, None, serial)
            .unwrap();
        serial
    }

    #[test]
    fn test_both_paths_finish_submitted_work() {
        for async_queue in [false, true] {
            let device = Arc::new(SoftwareDevice::immediate());
            let renderer = renderer(&device, async_queue);
            assert_eq!(renderer.is_async(), async_queue);

            let index = renderer.allocate_queue_serial_index().unwrap();
            let serial = record_and_submit(&renderer, index);
            let usage = ResourceUse::from_queue_serial(serial);
            assert!(renderer.has_resource_use_enqueued(&usage));

            renderer.finish_queue_serial(CTX, serial).unwrap();
            assert!(renderer.has_resource_use_finished(&usage));
            assert!(renderer.has_resource_use_submitted(&usage));

            renderer.wait_idle(CTX).unwrap();
            assert!(!renderer.is_busy());
            renderer.check_and_pop_pending_error(CTX).unwrap();
            assert_eq!(device.stats().validation_errors, 0);
        }
    }

    #[test]
    fn test_producers_on_separate_indices() {
        let device = Arc::new(SoftwareDevice::immediate());
        let renderer = Arc::new(renderer(&device, true));

        let producers: Vec<_> = (0..4)
            .map(|_| {
                let renderer = Arc::clone(&renderer);
                std::thread::spawn(move || {
                    let index = renderer.allocate_queue_serial_index().unwrap();
                    let serials: Vec<QueueSerial> = (0..10).map(|_| record_and_submit(&renderer, index)).collect();
                    renderer.finish_queue_serial(CTX, *serials.last().unwrap()).unwrap();
                    assert!(serials.iter().all(|s| renderer.command_queue().has_queue_serial_finished(*s)));
                    renderer.release_queue_serial_index(index);
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        renderer.wait_idle(CTX).unwrap();
        assert_eq!(device.stats().validation_errors, 0);
        assert_eq!(renderer.perf_counters().command_queue_submit_calls_total, 40);
    }

    #[test]
    fn test_present_status_on_direct_path() {
        let device = Arc::new(SoftwareDevice::immediate());
        let renderer = renderer(&device, false);
        let status = Arc::new(SwapchainStatus::new());

        device.inject_present_result(vk::Result::SUBOPTIMAL_KHR);
        renderer
            .queue_present(CTX, Priority::Medium, testing::present_request(), &status)
            .unwrap();
        renderer.wait_for_present_to_be_submitted(CTX, &status).unwrap();
        assert_eq!(status.last_present_result(), vk::Result::SUBOPTIMAL_KHR);
    }

    #[test]
    fn test_serial_indices_are_exhausted() {
        let device = Arc::new(SoftwareDevice::immediate());
        let mut config = Config::default();
        config.submission.max_queue_serial_indices = 2;
        let renderer = Renderer::new(device, &config).unwrap();

        let a = renderer.allocate_queue_serial_index().unwrap();
        let _b = renderer.allocate_queue_serial_index().unwrap();
        assert!(renderer.allocate_queue_serial_index().is_err());

        renderer.release_queue_serial_index(a);
        assert!(renderer.allocate_queue_serial_index().is_ok());
    }
}
