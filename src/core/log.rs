//! 日志系统模块
//!
//! 基于 `tracing` 提供结构化的日志记录功能。
//!
//! 提交层的关键事件（提交、完成、设备丢失、工作线程启停）都带有
//! `serial`、`index`、`priority`、`result` 等结构化字段。
//!
//! # 使用示例
//!
//! ```no_run
//! use dist_submit::core::log;
//! use dist_submit::core::config::LogLevel;
//!
//! log::init_logger(LogLevel::Info, false, None).unwrap();
//!
//! dist_submit::engine_info!(serial = 3, index = 0, "Batch submitted");
//! ```

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    prelude::*,
    EnvFilter,
};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use std::path::Path;

use super::config::LogLevel;
use super::error::{Result, SubmitError};

/// 初始化日志系统
///
/// 必须在程序开始时调用一次，重复调用返回 `SubmitError::Log`。
///
/// # 参数
///
/// * `level` - 日志级别
/// * `file_output` - 是否输出到文件
/// * `log_file_path` - 日志文件路径（可选，默认为 "distsubmit.log"）
pub fn init_logger(level: LogLevel, file_output: bool, log_file_path: Option<&str>) -> Result<()> {
    let filter = EnvFilter::new(level_directive(level));

    let result = if file_output {
        let log_path = log_file_path.unwrap_or("distsubmit.log");
        let path = Path::new(log_path);
        let directory = path.parent().unwrap_or(Path::new("."));
        let filename = path.file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("distsubmit.log");

        // 每天滚动
        let file_appender = RollingFileAppender::new(Rotation::DAILY, directory, filename);

        let console_layer = fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_ansi(true);

        let file_layer = fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .with(file_layer)
            .try_init()
    } else {
        // 工作线程有名字，输出线程名便于区分提交来源
        let fmt_layer = fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(true);

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
    };

    result.map_err(|e| SubmitError::Log(e.to_string()))
}

fn level_directive(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}

/// 引擎核心日志 - Debug 级别
#[macro_export]
macro_rules! engine_debug {
    ($($arg:tt)*) => {
        tracing::debug!(target: "dist_submit::engine", $($arg)*)
    };
}

/// 引擎核心日志 - Info 级别
#[macro_export]
macro_rules! engine_info {
    ($($arg:tt)*) => {
        tracing::info!(target: "dist_submit::engine", $($arg)*)
    };
}

/// 引擎核心日志 - Warn 级别
#[macro_export]
macro_rules! engine_warn {
    ($($arg:tt)*) => {
        tracing::warn!(target: "dist_submit::engine", $($arg)*)
    };
}

/// 引擎核心日志 - Error 级别
#[macro_export]
macro_rules! engine_error {
    ($($arg:tt)*) => {
        tracing::error!(target: "dist_submit::engine", $($arg)*)
    };
}

/// 应用层日志 - Info 级别
#[macro_export]
macro_rules! app_info {
    ($($arg:tt)*) => {
        tracing::info!(target: "dist_submit::app", $($arg)*)
    };
}

/// 应用层日志 - Warn 级别
#[macro_export]
macro_rules! app_warn {
    ($($arg:tt)*) => {
        tracing::warn!(target: "dist_submit::app", $($arg)*)
    };
}

/// 应用层日志 - Error 级别
#[macro_export]
macro_rules! app_error {
    ($($arg:tt)*) => {
        tracing::error!(target: "dist_submit::app", $($arg)*)
    };
}

/// 日志级别转换
impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

/// 追踪 span
///
/// 工作线程在分发每个任务时打开一个 span，退出作用域时结束。
///
/// ```ignore
/// let _span = span_trace!("execute_task", kind = ?task.kind()).entered();
/// ```
#[macro_export]
macro_rules! span_trace {
    ($name:expr) => {
        tracing::span!(tracing::Level::TRACE, $name)
    };
    ($name:expr, $($fields:tt)*) => {
        tracing::span!(tracing::Level::TRACE, $name, $($fields)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(Level::from(LogLevel::Info), Level::INFO);
        assert_eq!(Level::from(LogLevel::Error), Level::ERROR);
        assert_eq!(level_directive(LogLevel::Trace), "trace");
    }
}
