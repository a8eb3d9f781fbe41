//! 测试辅助

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use super::command::{OutsideRenderPassCommands, Priority, ProtectionType};
use super::queue::CommandQueue;
use crate::core::config::Config;
use crate::core::error::{DeviceError, ErrorContext, LoggingErrorContext};
use crate::gfx::backend::PresentRequest;
use crate::gfx::software::SoftwareDevice;

pub(crate) const CTX: &LoggingErrorContext = &LoggingErrorContext;

/// 记录所有上报错误的上下文
#[derive(Default)]
pub(crate) struct RecordingContext {
    errors: Mutex<Vec<DeviceError>>,
}

impl RecordingContext {
    pub(crate) fn results(&self) -> Vec<vk::Result> {
        self.errors.lock().iter().map(|error| error.result).collect()
    }
}

impl ErrorContext for RecordingContext {
    fn handle_error(&self, error: &DeviceError) {
        self.errors.lock().push(*error);
    }
}

pub(crate) fn command_queue(device: &Arc<SoftwareDevice>, config: &Config) -> CommandQueue {
    CommandQueue::new(device.clone(), CTX, config).unwrap()
}

/// 在指定优先级的桶里录制一段渲染通道外的命令
pub(crate) fn record_outside(queue: &CommandQueue, priority: Priority) -> vk::CommandBuffer {
    let secondary = queue
        .pool_access()
        .allocate_secondary_command_buffer(CTX, ProtectionType::Unprotected, None)
        .unwrap();
    queue
        .flush_outside_render_pass_commands(
            CTX,
            ProtectionType::Unprotected,
            priority,
            OutsideRenderPassCommands::new(secondary),
        )
        .unwrap()
}

pub(crate) fn present_request() -> PresentRequest {
    PresentRequest {
        swapchain: vk::SwapchainKHR::null(),
        image_index: 0,
        wait_semaphores: Vec::new(),
    }
}
