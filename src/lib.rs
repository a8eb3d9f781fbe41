//! dist_submit - 异步 GPU 命令提交与同步层
//!
//! 本库在 Vulkan 风格的设备之上提供多生产者的命令提交：
//! 按保护类型和优先级录制命令，按队列序列号追踪完成进度，
//! 并可选地通过工作线程和有界任务队列异步提交。
//!
//! # 模块结构
//!
//! - `core`: 核心功能模块（日志、配置、错误处理）
//! - `gfx`: 设备后端抽象层（软件模拟设备和 Vulkan 设备）
//! - `renderer`: 提交层（序列号、fence 回收、命令池、批次、队列、工作线程）
//!
//! # 使用示例
//!
//! ```no_run
//! use std::sync::Arc;
//! use dist_submit::core::config::Config;
//! use dist_submit::core::error::LoggingErrorContext;
//! use dist_submit::gfx::SoftwareDevice;
//! use dist_submit::renderer::command::{OutsideRenderPassCommands, Priority, ProtectionType};
//! use dist_submit::renderer::Renderer;
//!
//! let context = LoggingErrorContext;
//! let renderer = Renderer::new(Arc::new(SoftwareDevice::immediate()), &Config::default()).unwrap();
//! let index = renderer.allocate_queue_serial_index().unwrap();
//!
//! let secondary = renderer
//!     .allocate_secondary_command_buffer(&context, ProtectionType::Unprotected, None)
//!     .unwrap();
//! renderer
//!     .flush_outside_render_pass_commands(
//!         &context,
//!         ProtectionType::Unprotected,
//!         Priority::Medium,
//!         OutsideRenderPassCommands::new(secondary),
//!     )
//!     .unwrap();
//!
//! let serial = renderer.generate_queue_serial(index).unwrap();
//! renderer
//!     .submit_commands(&context, ProtectionType::Unprotected, Priority::Medium, None, None, serial)
//!     .unwrap();
//! renderer.finish_queue_serial(&context, serial).unwrap();
//! ```

pub mod core;
pub mod gfx;
pub mod renderer;
