//! 设备后端的统一抽象接口
//!
//! 本模块定义了提交层依赖的全部设备调用：fence、命令池与命令缓冲区、
//! 队列提交与呈现。Vulkan 后端直接转发给 `ash`，软件后端在 CPU 上模拟。
//!
//! 所有句柄和返回码都使用 `ash::vk` 中的类型，失败统一返回 `VkResult`。

use std::fmt;
use std::time::Duration;

use ash::prelude::VkResult;
use ash::vk;

/// 命令缓冲区开始录制的参数
#[derive(Debug, Clone, Copy)]
pub struct CommandBufferBegin {
    /// 主命令缓冲区或次级命令缓冲区
    pub level: vk::CommandBufferLevel,
    /// 次级命令缓冲区在渲染通道内执行时需要继承的信息
    pub inheritance: Option<RenderPassInheritance>,
}

impl CommandBufferBegin {
    pub fn primary() -> Self {
        Self {
            level: vk::CommandBufferLevel::PRIMARY,
            inheritance: None,
        }
    }

    pub fn secondary(inheritance: Option<RenderPassInheritance>) -> Self {
        Self {
            level: vk::CommandBufferLevel::SECONDARY,
            inheritance,
        }
    }
}

/// 渲染通道继承信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderPassInheritance {
    pub render_pass: vk::RenderPass,
    pub subpass: u32,
    pub framebuffer: vk::Framebuffer,
}

/// 开始渲染通道的参数
#[derive(Clone)]
pub struct RenderPassBegin {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub render_area: vk::Rect2D,
    pub clear_values: Vec<vk::ClearValue>,
}

// ClearValue 是 union，只输出数量
impl fmt::Debug for RenderPassBegin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderPassBegin")
            .field("render_pass", &self.render_pass)
            .field("framebuffer", &self.framebuffer)
            .field("render_area", &self.render_area)
            .field("clear_values", &self.clear_values.len())
            .finish()
    }
}

/// 一次队列提交
#[derive(Debug, Clone, Default)]
pub struct QueueSubmitInfo {
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub wait_stage_masks: Vec<vk::PipelineStageFlags>,
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub signal_semaphores: Vec<vk::Semaphore>,
    /// 受保护内容提交
    pub protected: bool,
}

/// 一次呈现请求
#[derive(Debug, Clone)]
pub struct PresentRequest {
    pub swapchain: vk::SwapchainKHR,
    pub image_index: u32,
    pub wait_semaphores: Vec<vk::Semaphore>,
}

/// 可延迟销毁的设备对象
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceObject {
    Semaphore(vk::Semaphore),
    Fence(vk::Fence),
    Buffer(vk::Buffer),
    Image(vk::Image),
    ImageView(vk::ImageView),
    Framebuffer(vk::Framebuffer),
}

/// 设备后端的统一接口
///
/// 实现必须可以跨线程共享：提交层会在生产者线程和工作线程上同时调用。
pub trait DeviceBackend: Send + Sync {
    /// 后端名称，用于日志输出
    fn backend_name(&self) -> &str;

    /// 可用的队列族
    fn queue_family_properties(&self) -> Vec<vk::QueueFamilyProperties>;

    /// 取得设备队列
    fn device_queue(&self, family_index: u32, queue_index: u32, protected: bool) -> vk::Queue;

    // ---- fence ----

    fn create_fence(&self) -> VkResult<vk::Fence>;

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;

    /// `Ok(true)` 表示已 signal，`Ok(false)` 表示尚未完成
    fn get_fence_status(&self, fence: vk::Fence) -> VkResult<bool>;

    /// 超时返回 `Err(vk::Result::TIMEOUT)`
    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> VkResult<()>;

    fn destroy_fence(&self, fence: vk::Fence);

    fn create_semaphore(&self) -> VkResult<vk::Semaphore>;

    // ---- 命令池与命令缓冲区 ----

    fn create_command_pool(&self, queue_family_index: u32, protected: bool) -> VkResult<vk::CommandPool>;

    fn destroy_command_pool(&self, pool: vk::CommandPool);

    fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
    ) -> VkResult<vk::CommandBuffer>;

    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]);

    fn reset_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()>;

    fn begin_command_buffer(&self, buffer: vk::CommandBuffer, begin: &CommandBufferBegin) -> VkResult<()>;

    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()>;

    fn cmd_execute_commands(&self, primary: vk::CommandBuffer, secondaries: &[vk::CommandBuffer]);

    fn cmd_begin_render_pass(&self, primary: vk::CommandBuffer, begin: &RenderPassBegin);

    fn cmd_end_render_pass(&self, primary: vk::CommandBuffer);

    // ---- 队列 ----

    fn queue_submit(&self, queue: vk::Queue, submit: &QueueSubmitInfo, fence: vk::Fence) -> VkResult<()>;

    /// 呈现结果只作为状态返回，由调用方写入交换链状态
    fn queue_present(&self, queue: vk::Queue, present: &PresentRequest) -> vk::Result;

    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()>;

    /// 销毁一个设备对象
    fn destroy_object(&self, object: DeviceObject);
}
