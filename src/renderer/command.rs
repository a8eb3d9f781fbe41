//! 命令缓冲区管理模块
//!
//! [`CommandPoolAccess`] 拥有全部命令池，并串行化所有命令池操作：
//! 分配、开始/结束录制、重置和释放。
//!
//! # 分桶
//!
//! 每个 (优先级, 保护类型) 组合是一个桶，桶里最多有一个正在录制的主命令缓冲区，
//! 以及已经录入主命令缓冲区的次级命令缓冲区和等待的信号量。
//! 主命令缓冲区在第一次使用时才分配并开始录制。
//!
//! # 所有权
//!
//! [`PrimaryCommandBuffer`] 和 [`SecondaryCommandBuffer`] 只能移动不能复制，
//! 因此一个命令缓冲区要么回到池中，要么被释放，不会两者都发生。

use std::fmt;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::core::error::{ErrorContext, Result, SubmitError};
use crate::gfx::backend::{CommandBufferBegin, DeviceBackend, RenderPassBegin, RenderPassInheritance};
use crate::{vk_error, vk_try};

/// 保护类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtectionType {
    Unprotected,
    Protected,
}

impl ProtectionType {
    pub const COUNT: usize = 2;
    pub const ALL: [ProtectionType; Self::COUNT] = [ProtectionType::Unprotected, ProtectionType::Protected];

    pub fn index(&self) -> usize {
        match self {
            ProtectionType::Unprotected => 0,
            ProtectionType::Protected => 1,
        }
    }

    pub fn is_protected(&self) -> bool {
        matches!(self, ProtectionType::Protected)
    }
}

/// 队列优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub const COUNT: usize = 3;
    pub const ALL: [Priority; Self::COUNT] = [Priority::Low, Priority::Medium, Priority::High];

    pub fn index(&self) -> usize {
        match self {
            Priority::Low => 0,
            Priority::Medium => 1,
            Priority::High => 2,
        }
    }

    /// 设备队列创建时使用的优先级
    pub fn queue_priority(&self) -> f32 {
        match self {
            Priority::Low => 0.0,
            Priority::Medium => 0.5,
            Priority::High => 1.0,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        };
        write!(f, "{}", name)
    }
}

/// 主命令缓冲区
#[derive(Debug)]
pub struct PrimaryCommandBuffer {
    handle: vk::CommandBuffer,
    protection: ProtectionType,
}

impl PrimaryCommandBuffer {
    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    pub fn protection(&self) -> ProtectionType {
        self.protection
    }
}

/// 次级命令缓冲区
#[derive(Debug)]
pub struct SecondaryCommandBuffer {
    handle: vk::CommandBuffer,
    protection: ProtectionType,
}

impl SecondaryCommandBuffer {
    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    pub fn protection(&self) -> ProtectionType {
        self.protection
    }
}

/// 已录入主命令缓冲区、等待批次完成后回收的次级命令缓冲区
#[derive(Debug, Default)]
pub struct SecondaryCommandBufferCollector {
    buffers: Vec<SecondaryCommandBuffer>,
}

impl SecondaryCommandBufferCollector {
    pub fn collect(&mut self, buffer: SecondaryCommandBuffer) {
        self.buffers.push(buffer);
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    fn drain(&mut self) -> std::vec::Drain<'_, SecondaryCommandBuffer> {
        self.buffers.drain(..)
    }
}

/// 渲染通道外的命令
///
/// 录制好的次级命令缓冲区，刷新时直接在主命令缓冲区里执行。
#[derive(Debug)]
pub struct OutsideRenderPassCommands {
    secondary: SecondaryCommandBuffer,
}

impl OutsideRenderPassCommands {
    pub fn new(secondary: SecondaryCommandBuffer) -> Self {
        Self { secondary }
    }
}

/// 渲染通道内的命令
///
/// 刷新时先在主命令缓冲区里开始渲染通道，执行次级命令缓冲区后结束渲染通道。
#[derive(Debug)]
pub struct RenderPassCommands {
    secondary: SecondaryCommandBuffer,
    begin: RenderPassBegin,
}

impl RenderPassCommands {
    pub fn new(secondary: SecondaryCommandBuffer, begin: RenderPassBegin) -> Self {
        Self { secondary, begin }
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.begin.render_pass
    }

    pub fn inheritance(&self) -> RenderPassInheritance {
        RenderPassInheritance {
            render_pass: self.begin.render_pass,
            subpass: 0,
            framebuffer: self.begin.framebuffer,
        }
    }
}

/// 从桶中取出的待提交内容
#[derive(Debug, Default)]
pub struct PendingCommands {
    pub primary: Option<PrimaryCommandBuffer>,
    pub secondaries: SecondaryCommandBufferCollector,
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub wait_stage_masks: Vec<vk::PipelineStageFlags>,
}

/// 持久命令池
///
/// 回收的命令缓冲区重置后留在空闲列表中复用。
#[derive(Debug)]
struct PersistentCommandPool {
    pool: vk::CommandPool,
    level: vk::CommandBufferLevel,
    free: Vec<vk::CommandBuffer>,
    live: usize,
}

impl PersistentCommandPool {
    fn allocate(&mut self, device: &dyn DeviceBackend, context: &dyn ErrorContext) -> Result<vk::CommandBuffer> {
        let buffer = match self.free.pop() {
            Some(buffer) => buffer,
            None => vk_try!(
                context,
                device.allocate_command_buffer(self.pool, self.level),
                "PersistentCommandPool::allocate"
            ),
        };
        self.live += 1;
        Ok(buffer)
    }

    fn collect(
        &mut self,
        device: &dyn DeviceBackend,
        context: &dyn ErrorContext,
        buffer: vk::CommandBuffer,
    ) -> Result<()> {
        self.live = self.live.saturating_sub(1);
        let pool = self.pool;
        vk_try!(
            context,
            device.reset_command_buffer(buffer).map_err(|result| {
                device.free_command_buffers(pool, &[buffer]);
                result
            }),
            "PersistentCommandPool::collect"
        );
        self.free.push(buffer);
        Ok(())
    }

    fn release(&mut self, device: &dyn DeviceBackend, buffer: vk::CommandBuffer) {
        self.live = self.live.saturating_sub(1);
        device.free_command_buffers(self.pool, &[buffer]);
    }

    fn destroy(&mut self, device: &dyn DeviceBackend) {
        if !self.free.is_empty() {
            device.free_command_buffers(self.pool, &self.free);
            self.free.clear();
        }
        // 销毁命令池会隐式释放仍未归还的命令缓冲区
        device.destroy_command_pool(self.pool);
        self.live = 0;
    }
}

#[derive(Debug, Default)]
struct CommandsState {
    primary: Option<PrimaryCommandBuffer>,
    secondaries: SecondaryCommandBufferCollector,
    wait_semaphores: Vec<vk::Semaphore>,
    wait_stage_masks: Vec<vk::PipelineStageFlags>,
}

#[derive(Debug, Default)]
struct PoolAccessState {
    primary_pools: [Option<PersistentCommandPool>; ProtectionType::COUNT],
    secondary_pools: [Option<PersistentCommandPool>; ProtectionType::COUNT],
    commands: [[CommandsState; ProtectionType::COUNT]; Priority::COUNT],
}

impl PoolAccessState {
    fn primary_pool(&mut self, protection: ProtectionType) -> Result<&mut PersistentCommandPool> {
        self.primary_pools[protection.index()]
            .as_mut()
            .ok_or_else(|| pool_not_initialized(protection))
    }

    fn secondary_pool(&mut self, protection: ProtectionType) -> Result<&mut PersistentCommandPool> {
        self.secondary_pools[protection.index()]
            .as_mut()
            .ok_or_else(|| pool_not_initialized(protection))
    }

    fn bucket(&mut self, protection: ProtectionType, priority: Priority) -> &mut CommandsState {
        &mut self.commands[priority.index()][protection.index()]
    }

    /// 返回桶中正在录制的主命令缓冲区，没有时分配并开始录制
    fn ensure_primary(
        &mut self,
        device: &dyn DeviceBackend,
        context: &dyn ErrorContext,
        protection: ProtectionType,
        priority: Priority,
    ) -> Result<vk::CommandBuffer> {
        if let Some(primary) = &self.bucket(protection, priority).primary {
            return Ok(primary.handle);
        }

        let pool = self.primary_pool(protection)?;
        let handle = pool.allocate(device, context)?;
        vk_try!(
            context,
            device.begin_command_buffer(handle, &CommandBufferBegin::primary()).map_err(|result| {
                pool.release(device, handle);
                result
            }),
            "CommandPoolAccess::ensure_primary"
        );

        self.bucket(protection, priority).primary = Some(PrimaryCommandBuffer { handle, protection });
        Ok(handle)
    }
}

fn pool_not_initialized(protection: ProtectionType) -> SubmitError {
    SubmitError::Initialization(format!("command pool for {:?} content is not initialized", protection))
}

/// 命令池访问器
///
/// 一把锁覆盖所有桶的分配、录制状态变化和命令池修改。
pub struct CommandPoolAccess {
    device: Arc<dyn DeviceBackend>,
    state: Mutex<PoolAccessState>,
}

impl CommandPoolAccess {
    pub fn new(device: Arc<dyn DeviceBackend>) -> Self {
        Self {
            device,
            state: Mutex::new(PoolAccessState::default()),
        }
    }

    /// 为某个保护类型创建主、次级命令池
    pub fn init_command_pool(
        &self,
        context: &dyn ErrorContext,
        protection: ProtectionType,
        queue_family_index: u32,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.primary_pools[protection.index()].is_some() {
            return Ok(());
        }

        let protected = protection.is_protected();
        let primary = vk_try!(
            context,
            self.device.create_command_pool(queue_family_index, protected),
            "CommandPoolAccess::init_command_pool"
        );
        let secondary = vk_try!(
            context,
            self.device.create_command_pool(queue_family_index, protected).map_err(|result| {
                self.device.destroy_command_pool(primary);
                result
            }),
            "CommandPoolAccess::init_command_pool"
        );

        state.primary_pools[protection.index()] = Some(PersistentCommandPool {
            pool: primary,
            level: vk::CommandBufferLevel::PRIMARY,
            free: Vec::new(),
            live: 0,
        });
        state.secondary_pools[protection.index()] = Some(PersistentCommandPool {
            pool: secondary,
            level: vk::CommandBufferLevel::SECONDARY,
            free: Vec::new(),
            live: 0,
        });
        Ok(())
    }

    /// 分配并开始录制一个次级命令缓冲区
    ///
    /// 在渲染通道内执行的次级命令缓冲区需要提供继承信息。
    pub fn allocate_secondary_command_buffer(
        &self,
        context: &dyn ErrorContext,
        protection: ProtectionType,
        inheritance: Option<RenderPassInheritance>,
    ) -> Result<SecondaryCommandBuffer> {
        let device = self.device.as_ref();
        let mut state = self.state.lock();
        let pool = state.secondary_pool(protection)?;
        let handle = pool.allocate(device, context)?;
        vk_try!(
            context,
            device.begin_command_buffer(handle, &CommandBufferBegin::secondary(inheritance)).map_err(|result| {
                pool.release(device, handle);
                result
            }),
            "CommandPoolAccess::allocate_secondary_command_buffer"
        );
        Ok(SecondaryCommandBuffer { handle, protection })
    }

    /// 记录下一次提交需要等待的信号量
    pub fn flush_wait_semaphores(
        &self,
        protection: ProtectionType,
        priority: Priority,
        semaphores: Vec<vk::Semaphore>,
        stage_masks: Vec<vk::PipelineStageFlags>,
    ) {
        debug_assert_eq!(semaphores.len(), stage_masks.len());
        let mut state = self.state.lock();
        let bucket = state.bucket(protection, priority);
        bucket.wait_semaphores.extend(semaphores);
        bucket.wait_stage_masks.extend(stage_masks);
    }

    /// 把渲染通道外的命令录入桶中的主命令缓冲区
    ///
    /// 返回仍处于录制状态的主命令缓冲区句柄。
    pub fn flush_outside_render_pass_commands(
        &self,
        context: &dyn ErrorContext,
        protection: ProtectionType,
        priority: Priority,
        commands: OutsideRenderPassCommands,
    ) -> Result<vk::CommandBuffer> {
        let device = self.device.as_ref();
        let mut state = self.state.lock();
        let secondary = commands.secondary;
        let primary = match state.ensure_primary(device, context, protection, priority) {
            Ok(primary) => primary,
            Err(err) => {
                self.release_secondary(&mut state, secondary);
                return Err(err);
            }
        };

        if let Err(result) = device.end_command_buffer(secondary.handle) {
            self.release_secondary(&mut state, secondary);
            return Err(vk_error!(context, result, "CommandPoolAccess::flush_outside_render_pass_commands"));
        }
        device.cmd_execute_commands(primary, &[secondary.handle]);
        state.bucket(protection, priority).secondaries.collect(secondary);
        Ok(primary)
    }

    /// 把渲染通道内的命令录入桶中的主命令缓冲区
    ///
    /// `framebuffer_override` 用于替换录制时的帧缓冲（例如交换链图像变化）。
    pub fn flush_render_pass_commands(
        &self,
        context: &dyn ErrorContext,
        protection: ProtectionType,
        priority: Priority,
        commands: RenderPassCommands,
        framebuffer_override: Option<vk::Framebuffer>,
    ) -> Result<vk::CommandBuffer> {
        let device = self.device.as_ref();
        let mut state = self.state.lock();
        let RenderPassCommands { secondary, mut begin } = commands;
        let primary = match state.ensure_primary(device, context, protection, priority) {
            Ok(primary) => primary,
            Err(err) => {
                self.release_secondary(&mut state, secondary);
                return Err(err);
            }
        };

        if let Some(framebuffer) = framebuffer_override {
            begin.framebuffer = framebuffer;
        }
        if let Err(result) = device.end_command_buffer(secondary.handle) {
            self.release_secondary(&mut state, secondary);
            return Err(vk_error!(context, result, "CommandPoolAccess::flush_render_pass_commands"));
        }
        device.cmd_begin_render_pass(primary, &begin);
        device.cmd_execute_commands(primary, &[secondary.handle]);
        device.cmd_end_render_pass(primary);
        state.bucket(protection, priority).secondaries.collect(secondary);
        Ok(primary)
    }

    /// 结束桶中主命令缓冲区的录制并交给调用方
    ///
    /// 桶被清空，下次使用时重新分配。桶中没有主命令缓冲区时返回 `None`。
    pub fn collect_primary_command_buffer(
        &self,
        context: &dyn ErrorContext,
        protection: ProtectionType,
        priority: Priority,
    ) -> Result<Option<PrimaryCommandBuffer>> {
        let mut state = self.state.lock();
        let primary = state.bucket(protection, priority).primary.take();
        match primary {
            Some(primary) => {
                self.end_primary(&mut state, context, &primary)?;
                Ok(Some(primary))
            }
            None => Ok(None),
        }
    }

    /// 取出桶中的全部待提交内容：结束录制的主命令缓冲区、次级命令缓冲区和等待信号量
    ///
    /// 结束录制失败时主、次级命令缓冲区被释放，等待信号量留在桶中给下一次提交。
    pub fn get_commands_and_wait_semaphores(
        &self,
        context: &dyn ErrorContext,
        protection: ProtectionType,
        priority: Priority,
    ) -> Result<PendingCommands> {
        let mut state = self.state.lock();
        let bucket = std::mem::take(state.bucket(protection, priority));
        let mut pending = PendingCommands {
            primary: bucket.primary,
            secondaries: bucket.secondaries,
            wait_semaphores: bucket.wait_semaphores,
            wait_stage_masks: bucket.wait_stage_masks,
        };
        if let Some(primary) = &pending.primary {
            if let Err(err) = self.end_primary(&mut state, context, primary) {
                for secondary in pending.secondaries.drain() {
                    self.release_secondary(&mut state, secondary);
                }
                let restored = state.bucket(protection, priority);
                restored.wait_semaphores.append(&mut pending.wait_semaphores);
                restored.wait_stage_masks.append(&mut pending.wait_stage_masks);
                return Err(err);
            }
        }
        Ok(pending)
    }

    fn end_primary(
        &self,
        state: &mut PoolAccessState,
        context: &dyn ErrorContext,
        primary: &PrimaryCommandBuffer,
    ) -> Result<()> {
        vk_try!(
            context,
            self.device.end_command_buffer(primary.handle).map_err(|result| {
                if let Some(pool) = state.primary_pools[primary.protection.index()].as_mut() {
                    pool.release(self.device.as_ref(), primary.handle);
                }
                result
            }),
            "CommandPoolAccess::end_primary"
        );
        Ok(())
    }

    /// 批次完成后把主命令缓冲区归还到对应保护类型的命令池中复用
    pub fn recycle_primary_command_buffer(
        &self,
        context: &dyn ErrorContext,
        primary: PrimaryCommandBuffer,
    ) -> Result<()> {
        let device = self.device.as_ref();
        let mut state = self.state.lock();
        state.primary_pool(primary.protection)?.collect(device, context, primary.handle)
    }

    /// 释放主命令缓冲区（设备丢失或销毁时使用，不再复用）
    pub fn destroy_primary_command_buffer(&self, primary: PrimaryCommandBuffer) {
        let mut state = self.state.lock();
        if let Some(pool) = state.primary_pools[primary.protection.index()].as_mut() {
            pool.release(self.device.as_ref(), primary.handle);
        }
    }

    /// 归还次级命令缓冲区
    pub fn release_secondary_command_buffers(
        &self,
        context: &dyn ErrorContext,
        collector: &mut SecondaryCommandBufferCollector,
    ) -> Result<()> {
        let device = self.device.as_ref();
        let mut state = self.state.lock();
        let mut first_error = None;
        for secondary in collector.drain() {
            let result = state
                .secondary_pool(secondary.protection)
                .and_then(|pool| pool.collect(device, context, secondary.handle));
            if let Err(err) = result {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// 释放次级命令缓冲区，不再复用
    pub fn destroy_secondary_command_buffers(&self, collector: &mut SecondaryCommandBufferCollector) {
        let mut state = self.state.lock();
        for secondary in collector.drain() {
            self.release_secondary(&mut state, secondary);
        }
    }

    fn release_secondary(&self, state: &mut PoolAccessState, secondary: SecondaryCommandBuffer) {
        if let Some(pool) = state.secondary_pools[secondary.protection.index()].as_mut() {
            pool.release(self.device.as_ref(), secondary.handle);
        }
    }

    /// 已分配且尚未归还的主命令缓冲区数量（包括正在录制的）
    pub fn live_primary_count(&self, protection: ProtectionType) -> usize {
        self.state.lock().primary_pools[protection.index()]
            .as_ref()
            .map_or(0, |pool| pool.live)
    }

    pub fn live_secondary_count(&self, protection: ProtectionType) -> usize {
        self.state.lock().secondary_pools[protection.index()]
            .as_ref()
            .map_or(0, |pool| pool.live)
    }

    /// 池中空闲可复用的主命令缓冲区数量
    pub fn pooled_primary_count(&self, protection: ProtectionType) -> usize {
        self.state.lock().primary_pools[protection.index()]
            .as_ref()
            .map_or(0, |pool| pool.free.len())
    }

    /// 桶中是否有尚未提交的内容
    pub fn has_pending_commands(&self, protection: ProtectionType, priority: Priority) -> bool {
        let mut state = self.state.lock();
        let bucket = state.bucket(protection, priority);
        bucket.primary.is_some() || !bucket.wait_semaphores.is_empty()
    }

    /// 销毁所有命令池
    ///
    /// 桶中尚未提交的命令一并丢弃。
    pub fn destroy(&self) {
        let device = self.device.as_ref();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        for row in state.commands.iter_mut() {
            for bucket in row.iter_mut() {
                *bucket = CommandsState::default();
            }
        }
        for pool in state.primary_pools.iter_mut().chain(state.secondary_pools.iter_mut()) {
            if let Some(mut pool) = pool.take() {
                pool.destroy(device);
            }
        }
    }
}

impl Drop for CommandPoolAccess {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::LoggingErrorContext;
    use crate::gfx::software::SoftwareDevice;

    const CTX: &LoggingErrorContext = &LoggingErrorContext;

    fn pool_access() -> (Arc<SoftwareDevice>, CommandPoolAccess) {
        let device = Arc::new(SoftwareDevice::immediate());
        let access = CommandPoolAccess::new(device.clone());
        access.init_command_pool(CTX, ProtectionType::Unprotected, 0).unwrap();
        (device, access)
    }

    fn record_outside(access: &CommandPoolAccess, priority: Priority) -> vk::CommandBuffer {
        let secondary = access
            .allocate_secondary_command_buffer(CTX, ProtectionType::Unprotected, None)
            .unwrap();
        access
            .flush_outside_render_pass_commands(
                CTX,
                ProtectionType::Unprotected,
                priority,
                OutsideRenderPassCommands::new(secondary),
            )
            .unwrap()
    }

    #[test]
    fn test_primary_is_lazily_created_per_bucket() {
        let (_device, access) = pool_access();

        let a = record_outside(&access, Priority::Medium);
        let b = record_outside(&access, Priority::Medium);
        let c = record_outside(&access, Priority::High);

        // 同一个桶复用同一个主命令缓冲区
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(access.live_primary_count(ProtectionType::Unprotected), 2);
    }

    #[test]
    fn test_collect_primary_clears_bucket() {
        let (_device, access) = pool_access();
        let handle = record_outside(&access, Priority::Medium);

        let primary = access
            .collect_primary_command_buffer(CTX, ProtectionType::Unprotected, Priority::Medium)
            .unwrap()
            .unwrap();
        assert_eq!(primary.handle(), handle);
        assert!(!access.has_pending_commands(ProtectionType::Unprotected, Priority::Medium));

        access.recycle_primary_command_buffer(CTX, primary).unwrap();
        assert_eq!(access.pooled_primary_count(ProtectionType::Unprotected), 1);
    }

    #[test]
    fn test_round_trip_without_leaks() {
        let (device, access) = pool_access();

        for _ in 0..4 {
            record_outside(&access, Priority::Medium);
            let mut pending = access
                .get_commands_and_wait_semaphores(CTX, ProtectionType::Unprotected, Priority::Medium)
                .unwrap();
            let primary = pending.primary.take().unwrap();
            assert_eq!(pending.secondaries.len(), 1);

            access.recycle_primary_command_buffer(CTX, primary).unwrap();
            access.release_secondary_command_buffers(CTX, &mut pending.secondaries).unwrap();
        }

        assert_eq!(access.live_primary_count(ProtectionType::Unprotected), 0);
        assert_eq!(access.live_secondary_count(ProtectionType::Unprotected), 0);
        // 复用池中的命令缓冲区，只分配了一主一次
        assert_eq!(device.stats().command_buffers_allocated, 2);
        assert_eq!(device.stats().validation_errors, 0);

        access.destroy();
        assert_eq!(device.stats().live_command_buffers, 0);
    }

    #[test]
    fn test_render_pass_flush() {
        let (device, access) = pool_access();
        let begin = RenderPassBegin {
            render_pass: vk::RenderPass::null(),
            framebuffer: vk::Framebuffer::null(),
            render_area: vk::Rect2D::default(),
            clear_values: Vec::new(),
        };
        let secondary = access
            .allocate_secondary_command_buffer(CTX, ProtectionType::Unprotected, None)
            .unwrap();
        access
            .flush_render_pass_commands(
                CTX,
                ProtectionType::Unprotected,
                Priority::Low,
                RenderPassCommands::new(secondary, begin),
                None,
            )
            .unwrap();

        let primary = access
            .collect_primary_command_buffer(CTX, ProtectionType::Unprotected, Priority::Low)
            .unwrap();
        assert!(primary.is_some());
        assert_eq!(device.stats().validation_errors, 0);
    }

    #[test]
    fn test_failed_secondary_end_releases_buffer() {
        let (device, access) = pool_access();
        let secondary = access
            .allocate_secondary_command_buffer(CTX, ProtectionType::Unprotected, None)
            .unwrap();

        device.fail_next_end(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        let result = access.flush_outside_render_pass_commands(
            CTX,
            ProtectionType::Unprotected,
            Priority::Medium,
            OutsideRenderPassCommands::new(secondary),
        );

        assert_eq!(result.unwrap_err().vk_result(), Some(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        assert_eq!(access.live_secondary_count(ProtectionType::Unprotected), 0);
        // 主命令缓冲区仍在桶中，下一次刷新继续使用
        assert_eq!(access.live_primary_count(ProtectionType::Unprotected), 1);
        record_outside(&access, Priority::Medium);
        assert_eq!(access.live_secondary_count(ProtectionType::Unprotected), 1);
    }

    #[test]
    fn test_failed_primary_end_keeps_wait_semaphores() {
        let (device, access) = pool_access();
        record_outside(&access, Priority::Medium);
        record_outside(&access, Priority::Medium);
        let semaphore = device.create_semaphore().unwrap();
        access.flush_wait_semaphores(
            ProtectionType::Unprotected,
            Priority::Medium,
            vec![semaphore],
            vec![vk::PipelineStageFlags::ALL_COMMANDS],
        );

        device.fail_next_end(vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        let result = access.get_commands_and_wait_semaphores(CTX, ProtectionType::Unprotected, Priority::Medium);
        assert!(result.is_err());

        assert_eq!(access.live_primary_count(ProtectionType::Unprotected), 0);
        assert_eq!(access.live_secondary_count(ProtectionType::Unprotected), 0);
        assert!(access.has_pending_commands(ProtectionType::Unprotected, Priority::Medium));

        let pending = access
            .get_commands_and_wait_semaphores(CTX, ProtectionType::Unprotected, Priority::Medium)
            .unwrap();
        assert!(pending.primary.is_none());
        assert_eq!(pending.wait_semaphores, vec![semaphore]);
        assert_eq!(device.stats().validation_errors, 0);
    }

    #[test]
    fn test_uninitialized_protected_pool() {
        let (_device, access) = pool_access();
        let result = access.allocate_secondary_command_buffer(CTX, ProtectionType::Protected, None);
        assert!(matches!(result, Err(SubmitError::Initialization(_))));
    }
}
