//! 异步提交模块
//!
//! [`CommandProcessor`] 在一个专用工作线程上按入队顺序执行 [`Task`]，
//! 生产者线程只负责入队，不等待设备调用。
//!
//! - 任务队列是有界的 crossbeam 通道，队列满时入队阻塞（背压，不丢任务）
//! - 控制消息走单独的通道，`Shutdown` 会先处理完已入队的任务再退出
//! - 工作线程上的错误连同调用位置一起放入错误队列，由生产者通过
//!   [`CommandProcessor::check_and_pop_pending_error`] 取回
//! - 致命错误（设备丢失）会让工作线程退出，之后的入队和等待都返回错误而不是阻塞
//!
//! 等待提交的调用方可以在 dequeue 锁下直接从通道取任务执行，不必等工作线程调度。

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use ash::vk;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Select, SendTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;

use super::command::{OutsideRenderPassCommands, Priority, ProtectionType, RenderPassCommands};
use super::queue::{CommandQueue, SubmitPolicy};
use super::serial::{AtomicQueueSerialArray, QueueSerial, ResourceUse, Serial, SerialIndex};
use super::sync::{SharedExternalFence, SwapchainStatus};
use crate::core::error::{DeviceError, ErrorContext, ErrorSeverity, Result, SubmitError};
use crate::gfx::backend::PresentRequest;
use crate::{engine_debug, engine_error, engine_info, engine_warn, span_trace};

/// 队列满时入队方检查工作线程状态的间隔
const ENQUEUE_POLL_INTERVAL: Duration = Duration::from_millis(10);

const WORKER_THREAD_NAME: &str = "dist-submit-worker";

/// 工作线程执行的任务
pub enum Task {
    /// 记录下一次提交需要等待的信号量
    FlushWaitSemaphores {
        protection: ProtectionType,
        priority: Priority,
        semaphores: Vec<vk::Semaphore>,
        stage_masks: Vec<vk::PipelineStageFlags>,
    },
    /// 录入渲染通道外的命令
    ProcessOutsideRenderPassCommands {
        protection: ProtectionType,
        priority: Priority,
        commands: OutsideRenderPassCommands,
    },
    /// 录入渲染通道内的命令
    ProcessRenderPassCommands {
        protection: ProtectionType,
        priority: Priority,
        commands: RenderPassCommands,
        framebuffer_override: Option<vk::Framebuffer>,
    },
    /// 提交桶中的命令
    FlushAndQueueSubmit {
        protection: ProtectionType,
        priority: Priority,
        signal_semaphore: Option<vk::Semaphore>,
        external_fence: Option<SharedExternalFence>,
        queue_serial: QueueSerial,
    },
    /// 提交调用方提供的命令缓冲区
    OneOffQueueSubmit {
        protection: ProtectionType,
        priority: Priority,
        command_buffer: Option<vk::CommandBuffer>,
        wait_semaphore: Option<(vk::Semaphore, vk::PipelineStageFlags)>,
        submit_policy: SubmitPolicy,
        queue_serial: QueueSerial,
    },
    /// 呈现
    Present {
        priority: Priority,
        request: PresentRequest,
        swapchain_status: Arc<SwapchainStatus>,
    },
}

/// 任务类型（用于日志）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    FlushWaitSemaphores,
    ProcessOutsideRenderPassCommands,
    ProcessRenderPassCommands,
    FlushAndQueueSubmit,
    OneOffQueueSubmit,
    Present,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            TaskKind::FlushWaitSemaphores => "FlushWaitSemaphores",
            TaskKind::ProcessOutsideRenderPassCommands => "ProcessOutsideRenderPassCommands",
            TaskKind::ProcessRenderPassCommands => "ProcessRenderPassCommands",
            TaskKind::FlushAndQueueSubmit => "FlushAndQueueSubmit",
            TaskKind::OneOffQueueSubmit => "OneOffQueueSubmit",
            TaskKind::Present => "Present",
        };
        write!(f, "{}", name)
    }
}

impl Task {
    pub fn kind(&self) -> TaskKind {
        match self {
            Task::FlushWaitSemaphores { .. } => TaskKind::FlushWaitSemaphores,
            Task::ProcessOutsideRenderPassCommands { .. } => TaskKind::ProcessOutsideRenderPassCommands,
            Task::ProcessRenderPassCommands { .. } => TaskKind::ProcessRenderPassCommands,
            Task::FlushAndQueueSubmit { .. } => TaskKind::FlushAndQueueSubmit,
            Task::OneOffQueueSubmit { .. } => TaskKind::OneOffQueueSubmit,
            Task::Present { .. } => TaskKind::Present,
        }
    }

    /// 任务提交时使用的序列号
    pub fn submit_queue_serial(&self) -> Option<QueueSerial> {
        match self {
            Task::FlushAndQueueSubmit { queue_serial, .. } | Task::OneOffQueueSubmit { queue_serial, .. } => {
                Some(*queue_serial)
            }
            _ => None,
        }
    }
}

/// 控制消息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    /// 空闲时释放完成的批次并清理垃圾
    CleanupGarbage,
    /// 处理完已入队的任务后退出
    Shutdown,
}

/// 生产者和工作线程共享的状态
struct ProcessorShared {
    command_queue: Arc<CommandQueue>,

    task_sender: Sender<Task>,
    task_receiver: Receiver<Task>,
    control_sender: Sender<Control>,
    control_receiver: Receiver<Control>,

    enqueue_lock: Mutex<()>,
    dequeue_lock: Mutex<()>,

    /// 只在任务真正进入通道后前进
    last_enqueued: AtomicQueueSerialArray,
    /// 正在发送（可能因队列满而阻塞）的提交序列号
    sending: Mutex<Option<QueueSerial>>,
    errors: Mutex<VecDeque<SubmitError>>,
    need_cleanup: AtomicBool,
    worker_exited: AtomicBool,
}

impl ErrorContext for ProcessorShared {
    fn handle_error(&self, error: &DeviceError) {
        if error.is_fatal() {
            engine_error!(result = ?error.result, function = error.function, "Worker hit a fatal device error");
        } else {
            engine_warn!(result = ?error.result, function = error.function, "Worker hit a device error");
        }
        self.errors.lock().push_back(SubmitError::Device(*error));
    }
}

impl ProcessorShared {
    fn process_tasks(self: Arc<Self>) {
        engine_info!("Command processor worker started");
        let result = self.process_tasks_impl();
        self.worker_exited.store(true, Ordering::Release);
        match result {
            Ok(()) => engine_info!("Command processor worker stopped"),
            Err(err) => engine_error!(error = %err, "Command processor worker exited on fatal error"),
        }
    }

    fn process_tasks_impl(&self) -> Result<()> {
        loop {
            let mut select = Select::new();
            let task_op = select.recv(&self.task_receiver);
            let control_op = select.recv(&self.control_receiver);
            let ready = select.ready();

            if ready == control_op {
                match self.control_receiver.try_recv() {
                    Ok(Control::Shutdown) => return self.drain_tasks(),
                    Ok(Control::CleanupGarbage) => self.cleanup_commands_and_garbage(),
                    Err(TryRecvError::Empty) => {}
                    Err(TryRecvError::Disconnected) => return Ok(()),
                }
                continue;
            }
            debug_assert_eq!(ready, task_op);

            let _dequeue = self.dequeue_lock.lock();
            let task = match self.task_receiver.try_recv() {
                Ok(task) => task,
                // 等待提交的调用方已经取走了任务
                Err(TryRecvError::Empty) => continue,
                Err(TryRecvError::Disconnected) => return Ok(()),
            };
            if let Err(ErrorSeverity::Fatal) = self.process_task(task) {
                return Err(SubmitError::DeviceLost);
            }
        }
    }

    /// 关闭前处理剩余任务
    fn drain_tasks(&self) -> Result<()> {
        let _dequeue = self.dequeue_lock.lock();
        while let Ok(task) = self.task_receiver.try_recv() {
            if let Err(ErrorSeverity::Fatal) = self.process_task(task) {
                return Err(SubmitError::DeviceLost);
            }
        }
        Ok(())
    }

    fn cleanup_commands_and_garbage(&self) {
        self.need_cleanup.store(false, Ordering::Release);
        if let Err(err) = self.command_queue.check_and_cleanup_completed_commands(self) {
            self.record_error(err);
        }
    }

    /// 执行一个任务；失败时错误进入错误队列，返回错误的严重程度
    fn process_task(&self, task: Task) -> std::result::Result<(), ErrorSeverity> {
        let kind = task.kind();
        let _span = span_trace!("process_task", task = %kind).entered();
        match self.process_task_impl(task) {
            Ok(()) => Ok(()),
            Err(err) => {
                let severity = err.severity();
                engine_debug!(task = %kind, error = %err, "Task failed");
                self.record_error(err);
                Err(severity)
            }
        }
    }

    fn process_task_impl(&self, task: Task) -> Result<()> {
        let queue = &self.command_queue;
        match task {
            Task::FlushWaitSemaphores {
                protection,
                priority,
                semaphores,
                stage_masks,
            } => queue.flush_wait_semaphores(protection, priority, semaphores, stage_masks),
            Task::ProcessOutsideRenderPassCommands {
                protection,
                priority,
                commands,
            } => queue
                .flush_outside_render_pass_commands(self, protection, priority, commands)
                .map(|_| ()),
            Task::ProcessRenderPassCommands {
                protection,
                priority,
                commands,
                framebuffer_override,
            } => queue
                .flush_render_pass_commands(self, protection, priority, commands, framebuffer_override)
                .map(|_| ()),
            Task::FlushAndQueueSubmit {
                protection,
                priority,
                signal_semaphore,
                external_fence,
                queue_serial,
            } => queue.submit_commands(self, protection, priority, signal_semaphore, external_fence, queue_serial),
            Task::OneOffQueueSubmit {
                protection,
                priority,
                command_buffer,
                wait_semaphore,
                submit_policy,
                queue_serial,
            } => queue.queue_submit_one_off(
                self,
                protection,
                priority,
                command_buffer,
                wait_semaphore,
                submit_policy,
                queue_serial,
            ),
            Task::Present {
                priority,
                request,
                swapchain_status,
            } => {
                queue.queue_present(priority, &request, &swapchain_status);
                Ok(())
            }
        }
    }

    /// 设备错误已经由 `handle_error` 放入队列
    fn record_error(&self, err: SubmitError) {
        if !matches!(err, SubmitError::Device(_)) {
            self.errors.lock().push_back(err);
        }
    }

    /// 在调用方线程上执行任务，直到 `done` 返回 true 或通道为空
    fn drain_until(&self, mut done: impl FnMut() -> bool) {
        let _dequeue = self.dequeue_lock.lock();
        while !done() {
            let task = match self.task_receiver.try_recv() {
                Ok(task) => task,
                Err(_) => break,
            };
            if self.process_task(task).is_err() {
                break;
            }
        }
    }

    /// 在调用方线程上执行任务，直到 `usage` 全部提交
    ///
    /// 通道为空但生产者还在发送 `usage` 需要的任务时继续等待，
    /// 设备丢失、任务失败或没有相关任务时返回。
    fn drain_until_submitted(&self, usage: &ResourceUse) {
        let queue = &self.command_queue;
        loop {
            if queue.has_resource_use_submitted(usage) || queue.is_device_lost() {
                return;
            }
            let _dequeue = self.dequeue_lock.lock();
            let task = match self.task_receiver.try_recv() {
                Ok(task) => task,
                Err(TryRecvError::Disconnected) => return,
                Err(TryRecvError::Empty) => {
                    if !self.is_send_pending(usage) {
                        // 发送方在清除 sending 之前已经把任务放进通道
                        if self.task_receiver.is_empty() {
                            return;
                        }
                        continue;
                    }
                    match self.task_receiver.recv_timeout(ENQUEUE_POLL_INTERVAL) {
                        Ok(task) => task,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => return,
                    }
                }
            };
            if self.process_task(task).is_err() {
                return;
            }
        }
    }

    /// 是否有生产者正在发送 `usage` 依赖的提交任务
    fn is_send_pending(&self, usage: &ResourceUse) -> bool {
        match *self.sending.lock() {
            Some(sending) => {
                let needed = usage.serial(sending.index());
                !needed.is_zero()
                    && needed <= sending.serial()
                    && self.command_queue.last_submitted_serial(sending.index()) < needed
            }
            None => false,
        }
    }

    /// 已入队或已提交
    fn is_enqueued(&self, index: SerialIndex, serial: Serial) -> bool {
        self.last_enqueued.load(index) >= serial || self.command_queue.last_submitted_serial(index) >= serial
    }
}

/// 异步提交器
pub struct CommandProcessor {
    shared: Arc<ProcessorShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CommandProcessor {
    /// 创建提交器，工作线程在 [`CommandProcessor::init`] 时启动
    ///
    /// # 参数
    ///
    /// * `command_queue` - 任务最终分派到的同步提交引擎
    /// * `task_queue_capacity` - 任务队列容量
    pub fn new(command_queue: Arc<CommandQueue>, task_queue_capacity: usize) -> Self {
        let (task_sender, task_receiver) = bounded(task_queue_capacity);
        let (control_sender, control_receiver) = bounded(2);
        let indices = command_queue.max_queue_serial_indices();
        Self {
            shared: Arc::new(ProcessorShared {
                command_queue,
                task_sender,
                task_receiver,
                control_sender,
                control_receiver,
                enqueue_lock: Mutex::new(()),
                dequeue_lock: Mutex::new(()),
                last_enqueued: AtomicQueueSerialArray::new(indices),
                sending: Mutex::new(None),
                errors: Mutex::new(VecDeque::new()),
                need_cleanup: AtomicBool::new(false),
                worker_exited: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    /// 启动工作线程
    pub fn init(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || shared.process_tasks())?;
        *worker = Some(handle);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some() && !self.shared.worker_exited.load(Ordering::Acquire)
    }

    pub fn command_queue(&self) -> &Arc<CommandQueue> {
        &self.shared.command_queue
    }

    /// 队列中尚未执行的任务数
    pub fn pending_task_count(&self) -> usize {
        self.shared.task_receiver.len()
    }

    // ---- 入队 ----

    pub fn enqueue_flush_wait_semaphores(
        &self,
        context: &dyn ErrorContext,
        protection: ProtectionType,
        priority: Priority,
        semaphores: Vec<vk::Semaphore>,
        stage_masks: Vec<vk::PipelineStageFlags>,
    ) -> Result<()> {
        self.enqueue_task(
            context,
            Task::FlushWaitSemaphores {
                protection,
                priority,
                semaphores,
                stage_masks,
            },
        )
    }

    pub fn enqueue_flush_outside_render_pass_commands(
        &self,
        context: &dyn ErrorContext,
        protection: ProtectionType,
        priority: Priority,
        commands: OutsideRenderPassCommands,
    ) -> Result<()> {
        self.enqueue_task(
            context,
            Task::ProcessOutsideRenderPassCommands {
                protection,
                priority,
                commands,
            },
        )
    }

    pub fn enqueue_flush_render_pass_commands(
        &self,
        context: &dyn ErrorContext,
        protection: ProtectionType,
        priority: Priority,
        commands: RenderPassCommands,
        framebuffer_override: Option<vk::Framebuffer>,
    ) -> Result<()> {
        self.enqueue_task(
            context,
            Task::ProcessRenderPassCommands {
                protection,
                priority,
                commands,
                framebuffer_override,
            },
        )
    }

    pub fn enqueue_submit_commands(
        &self,
        context: &dyn ErrorContext,
        protection: ProtectionType,
        priority: Priority,
        signal_semaphore: Option<vk::Semaphore>,
        external_fence: Option<SharedExternalFence>,
        queue_serial: QueueSerial,
    ) -> Result<()> {
        self.enqueue_task(
            context,
            Task::FlushAndQueueSubmit {
                protection,
                priority,
                signal_semaphore,
                external_fence,
                queue_serial,
            },
        )
    }

    /// 一次性提交；`EnsureSubmitted` 时等待任务被提交后才返回
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue_submit_one_off_commands(
        &self,
        context: &dyn ErrorContext,
        protection: ProtectionType,
        priority: Priority,
        command_buffer: Option<vk::CommandBuffer>,
        wait_semaphore: Option<(vk::Semaphore, vk::PipelineStageFlags)>,
        submit_policy: SubmitPolicy,
        queue_serial: QueueSerial,
    ) -> Result<()> {
        self.enqueue_task(
            context,
            Task::OneOffQueueSubmit {
                protection,
                priority,
                command_buffer,
                wait_semaphore,
                submit_policy,
                queue_serial,
            },
        )?;
        if submit_policy == SubmitPolicy::EnsureSubmitted {
            self.wait_for_resource_use_to_be_submitted(context, &ResourceUse::from_queue_serial(queue_serial))?;
        }
        Ok(())
    }

    /// 呈现；入队前把交换链状态标记为等待中
    pub fn enqueue_present(
        &self,
        context: &dyn ErrorContext,
        priority: Priority,
        request: PresentRequest,
        swapchain_status: Arc<SwapchainStatus>,
    ) -> Result<()> {
        swapchain_status.mark_pending();
        let result = self.enqueue_task(
            context,
            Task::Present {
                priority,
                request,
                swapchain_status: Arc::clone(&swapchain_status),
            },
        );
        if let Err(err) = &result {
            let recorded = if err.is_fatal() {
                vk::Result::ERROR_DEVICE_LOST
            } else {
                vk::Result::NOT_READY
            };
            swapchain_status.record_present_result(recorded);
        }
        result
    }

    fn enqueue_task(&self, context: &dyn ErrorContext, task: Task) -> Result<()> {
        self.check_and_pop_pending_error(context)?;
        let shared = &self.shared;

        let _enqueue = shared.enqueue_lock.lock();
        let queue_serial = task.submit_queue_serial();
        if let Some(queue_serial) = queue_serial {
            let last = shared.last_enqueued.load(queue_serial.index());
            if queue_serial.serial() <= last {
                return Err(SubmitError::SerialOutOfOrder {
                    index: queue_serial.index().value(),
                    serial: queue_serial.serial().value(),
                    last: last.value(),
                });
            }
            *shared.sending.lock() = Some(queue_serial);
        }

        let kind = task.kind();
        let result = Self::send_task(shared, task);
        if let (Ok(()), Some(queue_serial)) = (&result, queue_serial) {
            shared.last_enqueued.advance(queue_serial);
        }
        // 先前进水位线再清除，等待方按相反顺序读取
        *shared.sending.lock() = None;
        result?;

        engine_debug!(task = %kind, pending = shared.task_receiver.len(), "Task enqueued");
        Ok(())
    }

    /// 发送任务；队列满时阻塞，设备丢失或工作线程退出时放弃
    fn send_task(shared: &ProcessorShared, mut task: Task) -> Result<()> {
        loop {
            match shared.task_sender.send_timeout(task, ENQUEUE_POLL_INTERVAL) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(rejected)) => {
                    if shared.command_queue.is_device_lost() || shared.worker_exited.load(Ordering::Acquire) {
                        return Err(SubmitError::DeviceLost);
                    }
                    task = rejected;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    return Err(SubmitError::Runtime("command processor task queue is closed".to_string()));
                }
            }
        }
    }

    // ---- 等待 ----

    /// 等待资源使用的所有序列号都已提交给设备
    pub fn wait_for_resource_use_to_be_submitted(&self, context: &dyn ErrorContext, usage: &ResourceUse) -> Result<()> {
        self.shared.drain_until_submitted(usage);
        self.check_and_pop_pending_error(context)?;

        if let Some((index, serial)) = self.first_unsubmitted(usage) {
            return Err(SubmitError::SerialNotSubmitted {
                index: index.value(),
                serial: serial.value(),
            });
        }
        Ok(())
    }

    pub fn wait_for_queue_serial_to_be_submitted(&self, context: &dyn ErrorContext, queue_serial: QueueSerial) -> Result<()> {
        self.wait_for_resource_use_to_be_submitted(context, &ResourceUse::from_queue_serial(queue_serial))
    }

    /// 等待当前已入队的所有任务执行完
    pub fn wait_for_all_work_to_be_submitted(&self, context: &dyn ErrorContext) -> Result<()> {
        let shared = &self.shared;
        // 包括调用时还阻塞在发送中的提交
        let mut target = ResourceUse::new();
        if let Some(sending) = *shared.sending.lock() {
            target.set_queue_serial(sending);
        }
        for (slot, serial) in shared.last_enqueued.snapshot().into_iter().enumerate() {
            if !serial.is_zero() {
                target.set_queue_serial(QueueSerial::new(SerialIndex::new(slot as u32), serial));
            }
        }
        shared.drain_until_submitted(&target);
        shared.drain_until(|| false);
        self.check_and_pop_pending_error(context)?;
        self.shared.need_cleanup.store(false, Ordering::Release);
        self.shared.command_queue.release_finished_commands_and_cleanup_garbage(context)
    }

    /// 等待呈现任务被执行
    pub fn wait_for_present_to_be_submitted(&self, context: &dyn ErrorContext, swapchain_status: &SwapchainStatus) -> Result<()> {
        if swapchain_status.is_pending() {
            self.shared.drain_until(|| !swapchain_status.is_pending());
        }
        self.check_and_pop_pending_error(context)
    }

    fn first_unsubmitted(&self, usage: &ResourceUse) -> Option<(SerialIndex, Serial)> {
        let queue = &self.shared.command_queue;
        usage
            .iter()
            .find(|(index, serial)| queue.last_submitted_serial(*index) < *serial)
    }

    // ---- 错误与查询 ----

    /// 取回工作线程上发生的错误
    ///
    /// 所有排队的错误都会按顺序交给 `context` 处理并清空，返回最早的一个。
    /// 设备已丢失且没有排队错误时返回 `SubmitError::DeviceLost`。
    pub fn check_and_pop_pending_error(&self, context: &dyn ErrorContext) -> Result<()> {
        let errors: Vec<SubmitError> = self.shared.errors.lock().drain(..).collect();
        for error in &errors {
            if let SubmitError::Device(device_error) = error {
                context.handle_error(device_error);
            }
        }
        if let Some(oldest) = errors.into_iter().next() {
            return Err(oldest);
        }
        if self.shared.command_queue.is_device_lost() {
            return Err(SubmitError::DeviceLost);
        }
        Ok(())
    }

    pub fn has_pending_error(&self) -> bool {
        !self.shared.errors.lock().is_empty()
    }

    /// 请求工作线程在空闲时释放完成的批次并清理垃圾
    pub fn request_commands_and_garbage_cleanup(&self) {
        if !self.shared.need_cleanup.swap(true, Ordering::AcqRel) {
            // 已有未处理的请求时通道可能是满的，丢掉这次请求即可
            let _ = self.shared.control_sender.try_send(Control::CleanupGarbage);
        }
    }

    /// 只统计已经进入任务队列的提交，阻塞在发送中的不算
    pub fn has_resource_use_enqueued(&self, usage: &ResourceUse) -> bool {
        usage.iter().all(|(index, serial)| self.shared.is_enqueued(index, serial))
    }

    pub fn has_queue_serial_enqueued(&self, queue_serial: QueueSerial) -> bool {
        self.shared.is_enqueued(queue_serial.index(), queue_serial.serial())
    }

    pub fn last_enqueued_serial(&self, index: SerialIndex) -> Serial {
        self.shared.last_enqueued.load(index)
    }

    /// 停止工作线程
    ///
    /// 工作线程先处理完已入队的任务再退出。可以重复调用。
    pub fn destroy(&self) {
        let handle = match self.worker.lock().take() {
            Some(handle) => handle,
            None => return,
        };

        loop {
            if self.shared.worker_exited.load(Ordering::Acquire) {
                break;
            }
            match self
                .shared
                .control_sender
                .send_timeout(Control::Shutdown, ENQUEUE_POLL_INTERVAL)
            {
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(_)) => {}
                Err(SendTimeoutError::Disconnected(_)) => break,
            }
        }

        if handle.join().is_err() {
            engine_error!("Command processor worker panicked");
        }
    }
}

impl Drop for CommandProcessor {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::gfx::software::SoftwareDevice;
    use crate::renderer::testing::{self, RecordingContext, CTX};
    use crossbeam_channel::RecvTimeoutError;

    fn index0() -> SerialIndex {
        SerialIndex::new(0)
    }

    fn processor(device: &Arc<SoftwareDevice>, capacity: usize) -> CommandProcessor {
        let queue = Arc::new(testing::command_queue(device, &Config::default()));
        CommandProcessor::new(queue, capacity)
    }

    fn enqueue_submit(processor: &CommandProcessor, context: &dyn ErrorContext) -> Result<QueueSerial> {
        let serial = processor.command_queue().generate_queue_serial(index0())?;
        processor.enqueue_submit_commands(
            context,
            ProtectionType::Unprotected,
            Priority::Medium,
            None,
            None,
            serial,
        )?;
        Ok(serial)
    }

    fn enqueue_recorded_submit(processor: &CommandProcessor) -> QueueSerial {
        let secondary = processor
            .command_queue()
            .pool_access()
            .allocate_secondary_command_buffer(CTX, ProtectionType::Unprotected, None)
            .unwrap();
        processor
            .enqueue_flush_outside_render_pass_commands(
                CTX,
                ProtectionType::Unprotected,
                Priority::Medium,
                OutsideRenderPassCommands::new(secondary),
            )
            .unwrap();
        enqueue_submit(processor, CTX).unwrap()
    }

    #[test]
    fn test_worker_submits_in_enqueue_order() {
        let device = Arc::new(SoftwareDevice::immediate());
        let processor = processor(&device, 16);
        processor.init().unwrap();

        let serials: Vec<QueueSerial> = (0..5).map(|_| enqueue_recorded_submit(&processor)).collect();
        processor.wait_for_all_work_to_be_submitted(CTX).unwrap();

        let queue = processor.command_queue();
        assert_eq!(queue.last_submitted_serial(index0()), Serial::new(5));
        for serial in &serials {
            assert!(processor.has_queue_serial_enqueued(*serial));
            assert!(queue.has_queue_serial_submitted(*serial));
        }
        queue.wait_idle(CTX, Duration::from_secs(5)).unwrap();
        assert_eq!(device.stats().submits, 5);
        assert_eq!(device.stats().validation_errors, 0);
    }

    #[test]
    fn test_full_queue_blocks_until_worker_drains() {
        let device = Arc::new(SoftwareDevice::immediate());
        let processor = Arc::new(processor(&device, 16));

        for _ in 0..16 {
            enqueue_submit(&processor, CTX).unwrap();
        }
        assert_eq!(processor.pending_task_count(), 16);

        let (done_sender, done_receiver) = bounded(1);
        let producer = {
            let processor = Arc::clone(&processor);
            std::thread::spawn(move || {
                let result = enqueue_submit(&processor, CTX);
                done_sender.send(()).unwrap();
                result
            })
        };

        // 第 17 个任务在工作线程启动前一直阻塞
        assert_eq!(
            done_receiver.recv_timeout(Duration::from_millis(100)),
            Err(RecvTimeoutError::Timeout)
        );

        processor.init().unwrap();
        done_receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        producer.join().unwrap().unwrap();

        for _ in 0..3 {
            enqueue_submit(&processor, CTX).unwrap();
        }
        processor.wait_for_all_work_to_be_submitted(CTX).unwrap();
        // 没有任务被丢弃
        assert_eq!(processor.command_queue().last_submitted_serial(index0()), Serial::new(20));
    }

    #[test]
    fn test_waiter_processes_tasks_without_worker() {
        let device = Arc::new(SoftwareDevice::immediate());
        let processor = processor(&device, 16);

        let first = enqueue_submit(&processor, CTX).unwrap();
        let second = enqueue_submit(&processor, CTX).unwrap();
        let third = enqueue_submit(&processor, CTX).unwrap();
        assert!(processor.has_queue_serial_enqueued(third));
        assert!(!processor.command_queue().has_queue_serial_submitted(first));

        processor.wait_for_queue_serial_to_be_submitted(CTX, second).unwrap();
        let queue = processor.command_queue();
        assert!(queue.has_queue_serial_submitted(second));
        assert!(!queue.has_queue_serial_submitted(third));
        assert_eq!(processor.pending_task_count(), 1);
    }

    /// 等到另一个线程阻塞在发送 `queue_serial` 上
    fn wait_until_sending(processor: &CommandProcessor, queue_serial: QueueSerial) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while *processor.shared.sending.lock() != Some(queue_serial) {
            assert!(std::time::Instant::now() < deadline, "producer never started sending");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_wait_covers_producer_blocked_on_full_queue() {
        for _ in 0..20 {
            let device = Arc::new(SoftwareDevice::immediate());
            let processor = Arc::new(processor(&device, 1));

            enqueue_submit(&processor, CTX).unwrap();
            let blocked = processor.command_queue().generate_queue_serial(index0()).unwrap();
            let producer = {
                let processor = Arc::clone(&processor);
                std::thread::spawn(move || {
                    processor.enqueue_submit_commands(CTX, ProtectionType::Unprotected, Priority::Medium, None, None, blocked)
                })
            };

            wait_until_sending(&processor, blocked);
            // 还在发送中的任务不算已入队
            assert!(!processor.has_queue_serial_enqueued(blocked));

            processor.wait_for_queue_serial_to_be_submitted(CTX, blocked).unwrap();
            producer.join().unwrap().unwrap();

            assert!(processor.has_queue_serial_enqueued(blocked));
            assert!(processor.command_queue().has_queue_serial_submitted(blocked));
            assert_eq!(processor.pending_task_count(), 0);
        }
    }

    #[test]
    fn test_failed_enqueue_leaves_watermark_untouched() {
        let device = Arc::new(SoftwareDevice::immediate());
        let processor = Arc::new(processor(&device, 1));

        let first = enqueue_submit(&processor, CTX).unwrap();
        let blocked = processor.command_queue().generate_queue_serial(index0()).unwrap();
        let producer = {
            let processor = Arc::clone(&processor);
            std::thread::spawn(move || {
                processor.enqueue_submit_commands(CTX, ProtectionType::Unprotected, Priority::Medium, None, None, blocked)
            })
        };

        wait_until_sending(&processor, blocked);
        processor.command_queue().handle_device_lost();

        let result = producer.join().unwrap();
        assert!(matches!(result, Err(SubmitError::DeviceLost)));
        assert!(processor.has_queue_serial_enqueued(first));
        assert!(!processor.has_queue_serial_enqueued(blocked));
        assert_eq!(processor.last_enqueued_serial(index0()), first.serial());
        assert_eq!(processor.pending_task_count(), 1);
        assert!(processor.shared.sending.lock().is_none());
    }

    #[test]
    fn test_enqueue_rejects_stale_serial() {
        let device = Arc::new(SoftwareDevice::immediate());
        let processor = processor(&device, 16);

        let serial = QueueSerial::new(index0(), Serial::new(4));
        processor
            .enqueue_submit_commands(CTX, ProtectionType::Unprotected, Priority::Medium, None, None, serial)
            .unwrap();
        let result =
            processor.enqueue_submit_commands(CTX, ProtectionType::Unprotected, Priority::Medium, None, None, serial);
        assert!(matches!(result, Err(SubmitError::SerialOutOfOrder { serial: 4, last: 4, .. })));
        assert_eq!(processor.pending_task_count(), 1);
    }

    #[test]
    fn test_non_fatal_error_is_queued_and_worker_continues() {
        let device = Arc::new(SoftwareDevice::immediate());
        let processor = processor(&device, 16);
        processor.init().unwrap();
        let context = RecordingContext::default();

        device.fail_next_submit(vk::Result::ERROR_INITIALIZATION_FAILED);
        enqueue_recorded_submit(&processor);

        let err = processor.wait_for_all_work_to_be_submitted(&context).unwrap_err();
        assert_eq!(err.vk_result(), Some(vk::Result::ERROR_INITIALIZATION_FAILED));
        assert!(!err.is_fatal());
        assert_eq!(context.results(), vec![vk::Result::ERROR_INITIALIZATION_FAILED]);

        // 错误已被取走，工作线程仍在运行
        let serial = enqueue_recorded_submit(&processor);
        processor.wait_for_queue_serial_to_be_submitted(CTX, serial).unwrap();
        assert!(processor.is_running());
    }

    #[test]
    fn test_device_lost_on_worker() {
        let device = Arc::new(SoftwareDevice::manual());
        let processor = processor(&device, 16);
        processor.init().unwrap();
        let context = RecordingContext::default();

        device.fail_next_submit(vk::Result::ERROR_DEVICE_LOST);
        enqueue_recorded_submit(&processor);

        // 等待返回致命错误，错误同时交给调用方的上下文
        let err = processor.wait_for_all_work_to_be_submitted(&context).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(context.results(), vec![vk::Result::ERROR_DEVICE_LOST]);

        let result = enqueue_submit(&processor, &context);
        assert!(matches!(result, Err(SubmitError::DeviceLost)));

        let err = processor.wait_for_all_work_to_be_submitted(&context).unwrap_err();
        assert!(err.is_fatal());
        assert!(processor.command_queue().is_device_lost());
    }

    #[test]
    fn test_present_through_worker() {
        let device = Arc::new(SoftwareDevice::immediate());
        let processor = processor(&device, 16);
        processor.init().unwrap();
        let status = Arc::new(SwapchainStatus::new());

        processor
            .enqueue_present(CTX, Priority::Medium, testing::present_request(), Arc::clone(&status))
            .unwrap();
        processor.wait_for_present_to_be_submitted(CTX, &status).unwrap();

        assert!(!status.is_pending());
        assert_eq!(status.last_present_result(), vk::Result::SUCCESS);
        assert_eq!(device.stats().presents, 1);
    }

    #[test]
    fn test_cleanup_request_releases_finished_batches() {
        let device = Arc::new(SoftwareDevice::manual());
        let processor = processor(&device, 16);
        processor.init().unwrap();

        let serial = enqueue_recorded_submit(&processor);
        processor.wait_for_queue_serial_to_be_submitted(CTX, serial).unwrap();
        device.complete_all();

        processor.request_commands_and_garbage_cleanup();
        let queue = processor.command_queue();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !queue.has_queue_serial_finished(serial) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(queue.has_queue_serial_finished(serial));
    }

    #[test]
    fn test_shutdown_drains_pending_tasks() {
        let device = Arc::new(SoftwareDevice::immediate());
        let processor = processor(&device, 16);
        processor.init().unwrap();

        for _ in 0..8 {
            enqueue_recorded_submit(&processor);
        }
        processor.destroy();

        assert!(!processor.is_running());
        assert_eq!(processor.command_queue().last_submitted_serial(index0()), Serial::new(8));
    }
}
