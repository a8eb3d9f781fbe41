//! dist_submit - 多生产者提交演示
//!
//! 启动提交层，用多个生产者线程按不同优先级录制、提交并等待命令批次，
//! 最后输出队列统计。可以通过配置文件或命令行参数选择设备后端和提交路径。
//!
//! # 使用方法
//!
//! ```bash
//! # 使用配置文件（默认软件设备 + 异步提交）
//! cargo run
//!
//! # 直接提交（不启动工作线程）
//! cargo run -- --sync
//!
//! # 使用真实的 Vulkan 设备（无窗口）
//! cargo run -- --vulkan
//! ```
//!
//! # 架构概览
//!
//! ```text
//! ┌──────────────┐
//! │  生产者线程   │  录制 / 提交 / 等待
//! └──────┬───────┘
//!        │
//! ┌──────▼───────┐
//! │   Renderer   │  统一提交接口
//! └──────┬───────┘
//!        │
//!   ┌────┴──────────┐
//!   │               │
//! ┌─▼────────┐  ┌───▼──────────────┐
//! │  Direct  │  │ CommandProcessor │  有界任务队列 + 工作线程
//! └─┬────────┘  └───┬──────────────┘
//!   └──────┬────────┘
//!   ┌──────▼───────┐
//!   │ CommandQueue │  批次 / fence / 序列号水位
//!   └──────┬───────┘
//!   ┌──────▼───────┐
//!   │ DeviceBackend│  Software / Vulkan
//!   └──────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};

use dist_submit::core::config::{CompletionMode, Config, DeviceBackendKind};
use dist_submit::core::error::LoggingErrorContext;
use dist_submit::core::log;
use dist_submit::gfx::backend::{DeviceBackend, PresentRequest};
use dist_submit::gfx::{SoftwareDevice, VulkanDevice};
use dist_submit::renderer::command::{OutsideRenderPassCommands, Priority, ProtectionType};
use dist_submit::renderer::sync::SwapchainStatus;
use dist_submit::renderer::Renderer;
use dist_submit::{app_error, app_info, app_warn};

/// 每个生产者提交的帧数
const FRAMES_PER_PRODUCER: u64 = 64;

/// 每隔多少帧等待一次本生产者的最新批次
const FINISH_INTERVAL: u64 = 8;

/// 模拟 GPU 推进 fence 的间隔
const GPU_TICK: Duration = Duration::from_micros(200);

/// 应用程序入口点
///
/// # 执行流程
///
/// 1. 加载配置并应用命令行参数
/// 2. 初始化日志系统
/// 3. 创建设备后端和提交层
/// 4. 启动生产者线程并等待结束
/// 5. 等待设备空闲，输出统计
fn main() -> Result<()> {
    // 1. 加载配置
    let mut config = Config::from_file_or_default("config.toml");
    config.apply_args(std::env::args());
    config.validate().context("invalid configuration")?;

    // 2. 初始化日志系统
    log::init_logger(
        config.logging.level,
        config.logging.file_output,
        Some(&config.logging.log_file),
    )
    .context("failed to initialize logger")?;

    app_info!(
        backend = config.device.backend.name(),
        asynchronous = config.submission.async_command_queue,
        "Starting dist_submit"
    );

    // 3. 创建设备后端
    let stop_gpu = Arc::new(AtomicBool::new(false));
    let mut gpu_thread = None;
    let device: Arc<dyn DeviceBackend> = match config.device.backend {
        DeviceBackendKind::Software => {
            let software = Arc::new(SoftwareDevice::new(
                config.device.completion,
                config.device.queue_count,
                config.device.enable_protected_content,
            ));
            if config.device.completion == CompletionMode::Manual {
                gpu_thread = Some(spawn_gpu_thread(Arc::clone(&software), Arc::clone(&stop_gpu))?);
            }
            software
        }
        DeviceBackendKind::Vulkan => Arc::new(VulkanDevice::new(&config.device)?),
    };
    let presentable = config.device.backend == DeviceBackendKind::Software;

    let renderer = Arc::new(Renderer::new(Arc::clone(&device), &config)?);
    app_info!(device = device.backend_name(), "Submission layer ready");

    // 4. 启动生产者
    let producers = [Priority::Low, Priority::Medium, Priority::High]
        .into_iter()
        .map(|priority| {
            let renderer = Arc::clone(&renderer);
            thread::Builder::new()
                .name(format!("producer-{:?}", priority).to_lowercase())
                .spawn(move || run_producer(&renderer, priority, presentable))
                .context("failed to spawn producer thread")
        })
        .collect::<Result<Vec<_>>>()?;

    for producer in producers {
        match producer.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => app_error!(error = %e, "Producer failed"),
            Err(_) => app_error!("Producer thread panicked"),
        }
    }

    // 5. 等待空闲
    let context = LoggingErrorContext;
    renderer.wait_idle(&context)?;
    renderer.check_and_pop_pending_error(&context)?;

    stop_gpu.store(true, Ordering::Release);
    if let Some(handle) = gpu_thread {
        if handle.join().is_err() {
            app_warn!("GPU thread panicked");
        }
    }

    let counters = renderer.perf_counters();
    let queue = renderer.command_queue();
    app_info!(
        submits = counters.command_queue_submit_calls_total,
        device_submits = counters.vk_queue_submit_calls_total,
        wait_semaphores = counters.command_queue_wait_semaphores_total,
        batches = queue.num_all_commands(),
        garbage = queue.pending_garbage_count(),
        "Submission summary"
    );

    renderer.destroy();
    app_info!("dist_submit exited");
    Ok(())
}

/// 单个生产者的提交循环
///
/// 每帧录制一段命令并提交，周期性地等待自己的批次完成，结束时归还队列索引。
fn run_producer(renderer: &Renderer, priority: Priority, presentable: bool) -> Result<()> {
    let context = LoggingErrorContext;
    let index = renderer.allocate_queue_serial_index()?;
    let swapchain_status = Arc::new(SwapchainStatus::new());

    let result = (|| -> Result<()> {
        for frame in 0..FRAMES_PER_PRODUCER {
            let secondary =
                renderer.allocate_secondary_command_buffer(&context, ProtectionType::Unprotected, None)?;
            renderer.flush_outside_render_pass_commands(
                &context,
                ProtectionType::Unprotected,
                priority,
                OutsideRenderPassCommands::new(secondary),
            )?;

            let queue_serial = renderer.generate_queue_serial(index)?;
            renderer.submit_commands(&context, ProtectionType::Unprotected, priority, None, None, queue_serial)?;

            if presentable {
                let request = PresentRequest {
                    swapchain: ash::vk::SwapchainKHR::null(),
                    image_index: (frame % 3) as u32,
                    wait_semaphores: Vec::new(),
                };
                renderer.queue_present(&context, priority, request, &swapchain_status)?;
            }

            if (frame + 1) % FINISH_INTERVAL == 0 {
                renderer.finish_queue_serial(&context, queue_serial)?;
                renderer.check_completed_commands_and_cleanup(&context)?;
            }
        }

        if presentable {
            renderer.wait_for_present_to_be_submitted(&context, &swapchain_status)?;
            app_info!(
                ?priority,
                result = ?swapchain_status.last_present_result(),
                "Last present"
            );
        }
        Ok(())
    })();

    renderer.release_queue_serial_index(index);
    result
}

/// 手动完成模式下模拟 GPU 的线程
fn spawn_gpu_thread(device: Arc<SoftwareDevice>, stop: Arc<AtomicBool>) -> Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("software-gpu".to_string())
        .spawn(move || {
            while !stop.load(Ordering::Acquire) {
                if !device.complete_next() {
                    thread::sleep(GPU_TICK);
                }
            }
            device.complete_all();
        })
        .context("failed to spawn software GPU thread")
}
