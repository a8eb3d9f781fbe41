//! 设备后端模块
//!
//! 本模块封装提交层所依赖的设备操作，包括：
//! - Software：在 CPU 上模拟 fence 和队列，用于测试和无 GPU 环境
//! - Vulkan：基于 ash 的真实设备（无窗口）
//!
//! 所有后端都实现了统一的 `DeviceBackend` trait，
//! 提交层只通过这个 trait 访问设备。

pub mod backend;
pub mod software;
pub mod vulkan;

pub use backend::DeviceBackend;
pub use software::SoftwareDevice;
pub use vulkan::VulkanDevice;
