//! 配置管理模块
//!
//! 提供提交层配置的加载、解析和管理功能。
//! 支持从 TOML 配置文件加载，也支持命令行参数覆盖。
//!
//! # 配置文件格式 (config.toml)
//!
//! ```toml
//! [device]
//! backend = "software"     # 或 "vulkan"
//! queue_count = 3
//! enable_protected_content = false
//! completion = "immediate" # 软件设备：immediate 或 manual
//!
//! [submission]
//! async_command_queue = true
//! task_queue_capacity = 16
//! in_flight_commands_limit = 50
//! max_finished_commands_limit = 64
//! max_queue_serial_indices = 128
//! fence_wait_timeout_ms = 120000
//!
//! [logging]
//! level = "info"      # trace, debug, info, warn, error
//! file_output = true
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::error::{ConfigError, Result};

/// 提交层配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// 设备配置
    #[serde(default)]
    pub device: DeviceConfig,

    /// 提交配置
    #[serde(default)]
    pub submission: SubmissionConfig,

    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 设备配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// 设备后端选择
    #[serde(default = "default_backend")]
    pub backend: DeviceBackendKind,

    /// 每个队列族请求的队列数量（对应 低/中/高 三个优先级）
    #[serde(default = "default_queue_count")]
    pub queue_count: u32,

    /// 是否创建受保护内容队列
    #[serde(default)]
    pub enable_protected_content: bool,

    /// 软件设备的 fence 完成方式
    #[serde(default = "default_completion")]
    pub completion: CompletionMode,
}

/// 设备后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceBackendKind {
    /// CPU 模拟的设备
    Software,
    /// Vulkan 设备（无窗口）
    Vulkan,
}

/// 软件设备的完成方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionMode {
    /// 提交后立即 signal
    Immediate,
    /// 由调用方显式推进
    Manual,
}

/// 提交配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionConfig {
    /// 是否启用异步提交线程
    #[serde(default = "default_async")]
    pub async_command_queue: bool,

    /// 任务队列容量，队列满时生产者阻塞
    #[serde(default = "default_task_queue_capacity")]
    pub task_queue_capacity: usize,

    /// 在途批次上限，超过时先等待最老的批次
    #[serde(default = "default_in_flight_limit")]
    pub in_flight_commands_limit: usize,

    /// 已完成批次上限，超过时先释放
    #[serde(default = "default_finished_limit")]
    pub max_finished_commands_limit: usize,

    /// 队列索引数量
    #[serde(default = "default_max_indices")]
    pub max_queue_serial_indices: usize,

    /// fence 等待超时（毫秒）
    #[serde(default = "default_fence_timeout")]
    pub fence_wait_timeout_ms: u64,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: LogLevel,

    /// 是否输出到文件
    #[serde(default = "default_file_output")]
    pub file_output: bool,

    /// 日志文件路径
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

// 默认值函数
fn default_backend() -> DeviceBackendKind { DeviceBackendKind::Software }
fn default_queue_count() -> u32 { 3 }
fn default_completion() -> CompletionMode { CompletionMode::Immediate }
fn default_async() -> bool { true }
fn default_task_queue_capacity() -> usize { 16 }
fn default_in_flight_limit() -> usize { 50 }
fn default_finished_limit() -> usize { 64 }
fn default_max_indices() -> usize { 128 }
fn default_fence_timeout() -> u64 { 120_000 }
fn default_log_level() -> LogLevel { LogLevel::Info }
fn default_file_output() -> bool { false }
fn default_log_file() -> String { "distsubmit.log".to_string() }

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            queue_count: default_queue_count(),
            enable_protected_content: false,
            completion: default_completion(),
        }
    }
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            async_command_queue: default_async(),
            task_queue_capacity: default_task_queue_capacity(),
            in_flight_commands_limit: default_in_flight_limit(),
            max_finished_commands_limit: default_finished_limit(),
            max_queue_serial_indices: default_max_indices(),
            fence_wait_timeout_ms: default_fence_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_output: default_file_output(),
            log_file: default_log_file(),
        }
    }
}

impl SubmissionConfig {
    pub fn fence_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_wait_timeout_ms)
    }
}

impl Config {
    /// 从配置文件加载
    ///
    /// # 参数
    ///
    /// * `path` - 配置文件路径
    ///
    /// # 返回值
    ///
    /// 成功返回 `Config` 实例，失败返回错误
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let contents = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound(path_str.clone()))?;

        Self::from_toml_str(&contents)
    }

    /// 从 TOML 字符串解析
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| ConfigError::ParseError(e.to_string()).into())
    }

    /// 从配置文件加载，如果文件不存在则使用默认配置
    pub fn from_file_or_default<P: AsRef<Path>>(path: P) -> Self {
        Self::from_file(path).unwrap_or_default()
    }

    /// 保存配置到文件
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// 从命令行参数覆盖配置
    ///
    /// # 说明
    ///
    /// 支持的参数：
    /// - `--sync` / `--async`: 关闭或开启异步提交线程
    /// - `--vulkan` / `--software`: 选择设备后端
    /// - `--task-queue-capacity <value>`: 设置任务队列容量
    pub fn apply_args<I>(&mut self, args: I)
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let args: Vec<String> = args.into_iter().map(|s| s.as_ref().to_string()).collect();

        if args.iter().any(|a| a == "--sync") {
            self.submission.async_command_queue = false;
        }
        if args.iter().any(|a| a == "--async") {
            self.submission.async_command_queue = true;
        }

        if args.iter().any(|a| a == "--vulkan") {
            self.device.backend = DeviceBackendKind::Vulkan;
        }
        if args.iter().any(|a| a == "--software") {
            self.device.backend = DeviceBackendKind::Software;
        }

        if let Some(idx) = args.iter().position(|a| a == "--task-queue-capacity") {
            if let Some(capacity) = args.get(idx + 1).and_then(|s| s.parse().ok()) {
                self.submission.task_queue_capacity = capacity;
            }
        }
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        if !(1..=3).contains(&self.device.queue_count) {
            return Err(invalid("device.queue_count", "Queue count must be between 1 and 3"));
        }

        let submission = &self.submission;
        if submission.task_queue_capacity == 0 {
            return Err(invalid(
                "submission.task_queue_capacity",
                "Task queue capacity must be greater than 0",
            ));
        }

        if submission.in_flight_commands_limit == 0 {
            return Err(invalid(
                "submission.in_flight_commands_limit",
                "In-flight limit must be greater than 0",
            ));
        }

        // 完成的批次从在途队列移入完成队列，完成队列至少要能容纳全部在途批次
        if submission.in_flight_commands_limit > submission.max_finished_commands_limit {
            return Err(invalid(
                "submission.max_finished_commands_limit",
                "Finished limit must not be smaller than the in-flight limit",
            ));
        }

        if submission.max_queue_serial_indices == 0 {
            return Err(invalid(
                "submission.max_queue_serial_indices",
                "At least one queue serial index is required",
            ));
        }

        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> super::error::SubmitError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

impl DeviceBackendKind {
    /// 获取后端名称
    pub fn name(&self) -> &'static str {
        match self {
            DeviceBackendKind::Software => "Software",
            DeviceBackendKind::Vulkan => "Vulkan",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.device.backend, DeviceBackendKind::Software);
        assert_eq!(config.submission.task_queue_capacity, 16);
        assert_eq!(config.submission.in_flight_commands_limit, 50);
        assert_eq!(config.submission.max_finished_commands_limit, 64);
        assert!(config.submission.async_command_queue);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.submission.task_queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.submission.in_flight_commands_limit = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml() {
        let config = Config::from_toml_str(
            "[submission]\nasync_command_queue = false\ntask_queue_capacity = 4\n",
        )
        .unwrap();

        assert!(!config.submission.async_command_queue);
        assert_eq!(config.submission.task_queue_capacity, 4);
        // 未写出的字段使用默认值
        assert_eq!(config.submission.max_queue_serial_indices, 128);
        assert_eq!(config.logging.level, LogLevel::Info);
    }

    #[test]
    fn test_apply_args() {
        let mut config = Config::default();
        config.apply_args(["dist_submit", "--sync", "--task-queue-capacity", "8"]);

        assert!(!config.submission.async_command_queue);
        assert_eq!(config.submission.task_queue_capacity, 8);
        assert_eq!(config.device.backend, DeviceBackendKind::Software);
    }
}
