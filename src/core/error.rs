//! 错误处理模块
//!
//! 定义了提交层中使用的统一错误类型，并按严重程度对设备返回码进行分类。
//!
//! # 错误分类
//!
//! - **Transient**：呈现失败、交换链过期等，只记录到状态中，不作为队列错误抛出
//! - **Recoverable**：等待完成超时等调用方错误，只返回给发起等待的调用
//! - **Fatal**：设备丢失、驱动内存耗尽，传播给后续所有调用方并终止工作线程
//!
//! # 错误上下文
//!
//! 设备调用失败时会携带调用位置（文件、函数、行号），并同步交给 [`ErrorContext`]。
//! 工作线程上产生的错误会先进入队列，由生产者线程轮询时重放。

use std::fmt;

use ash::vk;

/// 提交层统一的 Result 类型
pub type Result<T> = std::result::Result<T, SubmitError>;

/// 提交层的错误类型
#[derive(Debug)]
pub enum SubmitError {
    /// 配置错误
    Config(ConfigError),

    /// 设备调用返回了错误码
    Device(DeviceError),

    /// 设备已丢失，之后的所有提交都会失败
    DeviceLost,

    /// 同一队列索引上的序列号没有严格递增
    SerialOutOfOrder { index: u32, serial: u64, last: u64 },

    /// 等待的序列号从未被提交，等待会永远无法返回
    SerialNotSubmitted { index: u32, serial: u64 },

    /// IO 错误
    Io(std::io::Error),

    /// 日志系统错误
    Log(String),

    /// 初始化错误
    Initialization(String),

    /// 运行时错误
    Runtime(String),
}

/// 配置相关的错误
#[derive(Debug)]
pub enum ConfigError {
    /// 配置文件未找到
    FileNotFound(String),

    /// 配置文件解析失败
    ParseError(String),

    /// 配置值无效
    InvalidValue { field: String, reason: String },
}

/// 错误严重程度
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// 仅作为状态记录
    Transient,
    /// 只影响当前调用
    Recoverable,
    /// 设备不可用
    Fatal,
}

/// 设备调用错误
///
/// 保存设备返回码以及出错的调用位置。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceError {
    pub result: vk::Result,
    pub file: &'static str,
    pub function: &'static str,
    pub line: u32,
}

impl DeviceError {
    pub fn new(result: vk::Result, file: &'static str, function: &'static str, line: u32) -> Self {
        Self { result, file, function, line }
    }

    /// 按返回码分类
    pub fn severity(&self) -> ErrorSeverity {
        severity_of(self.result)
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == ErrorSeverity::Fatal
    }
}

/// 返回码分类
///
/// 设备丢失和内存耗尽是致命的；交换链相关结果只是状态；其余（包括超时）可恢复。
pub fn severity_of(result: vk::Result) -> ErrorSeverity {
    match result {
        vk::Result::ERROR_DEVICE_LOST
        | vk::Result::ERROR_OUT_OF_HOST_MEMORY
        | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => ErrorSeverity::Fatal,
        vk::Result::ERROR_OUT_OF_DATE_KHR
        | vk::Result::SUBOPTIMAL_KHR
        | vk::Result::ERROR_SURFACE_LOST_KHR
        | vk::Result::NOT_READY => ErrorSeverity::Transient,
        _ => ErrorSeverity::Recoverable,
    }
}

impl SubmitError {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            SubmitError::DeviceLost => ErrorSeverity::Fatal,
            SubmitError::Device(e) => e.severity(),
            _ => ErrorSeverity::Recoverable,
        }
    }

    /// 是否为致命错误（设备丢失或内存耗尽）
    pub fn is_fatal(&self) -> bool {
        self.severity() == ErrorSeverity::Fatal
    }

    /// 如果错误来自设备调用，返回对应的返回码
    pub fn vk_result(&self) -> Option<vk::Result> {
        match self {
            SubmitError::Device(e) => Some(e.result),
            SubmitError::DeviceLost => Some(vk::Result::ERROR_DEVICE_LOST),
            _ => None,
        }
    }
}

/// 错误接收端
///
/// 直接提交路径上同步调用；异步路径上的错误在生产者轮询时重放。
pub trait ErrorContext: Send + Sync {
    fn handle_error(&self, error: &DeviceError);
}

/// 只记录日志的错误接收端
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingErrorContext;

impl ErrorContext for LoggingErrorContext {
    fn handle_error(&self, error: &DeviceError) {
        match error.severity() {
            ErrorSeverity::Fatal => crate::engine_error!(
                result = ?error.result,
                file = error.file,
                function = error.function,
                line = error.line,
                "Fatal device error"
            ),
            _ => crate::engine_warn!(
                result = ?error.result,
                file = error.file,
                function = error.function,
                line = error.line,
                "Device call failed"
            ),
        }
    }
}

/// 检查设备调用结果
///
/// 失败时构造带调用位置的 [`DeviceError`]，交给错误上下文，并从当前函数返回。
///
/// # 示例
///
/// ```ignore
/// let fence = vk_try!(context, device.create_fence());
/// let fence = vk_try!(context, device.create_fence(), "fetch_fence");
/// ```
#[macro_export]
macro_rules! vk_try {
    ($context:expr, $call:expr) => {
        $crate::vk_try!($context, $call, module_path!())
    };
    ($context:expr, $call:expr, $function:expr) => {
        match $call {
            Ok(value) => value,
            Err(result) => return Err($crate::vk_error!($context, result, $function)),
        }
    };
}

/// 把已知失败的返回码上报给错误上下文，并得到对应的 [`SubmitError`]
///
/// ```ignore
/// return Err(vk_error!(context, result, "queue_submit"));
/// ```
#[macro_export]
macro_rules! vk_error {
    ($context:expr, $result:expr, $function:expr) => {{
        let error = $crate::core::error::DeviceError::new($result, file!(), $function, line!());
        $crate::core::error::ErrorContext::handle_error($context, &error);
        $crate::core::error::SubmitError::Device(error)
    }};
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::Config(e) => write!(f, "Configuration error: {}", e),
            SubmitError::Device(e) => write!(f, "Device error: {}", e),
            SubmitError::DeviceLost => write!(f, "Device lost"),
            SubmitError::SerialOutOfOrder { index, serial, last } => write!(
                f,
                "Serial {} on queue index {} is not greater than last serial {}",
                serial, index, last
            ),
            SubmitError::SerialNotSubmitted { index, serial } => write!(
                f,
                "Serial {} on queue index {} has not been submitted",
                serial, index
            ),
            SubmitError::Io(e) => write!(f, "IO error: {}", e),
            SubmitError::Log(msg) => write!(f, "Log error: {}", msg),
            SubmitError::Initialization(msg) => write!(f, "Initialization error: {}", msg),
            SubmitError::Runtime(msg) => write!(f, "Runtime error: {}", msg),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileNotFound(path) => write!(f, "Config file not found: {}", path),
            ConfigError::ParseError(msg) => write!(f, "Failed to parse config: {}", msg),
            ConfigError::InvalidValue { field, reason } => {
                write!(f, "Invalid value for '{}': {}", field, reason)
            }
        }
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} in {} ({}:{})", self.result, self.function, self.file, self.line)
    }
}

impl std::error::Error for SubmitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SubmitError::Io(e) => Some(e),
            SubmitError::Device(e) => Some(e),
            SubmitError::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl std::error::Error for ConfigError {}
impl std::error::Error for DeviceError {}

// 实现 From trait 以便于错误转换
impl From<std::io::Error> for SubmitError {
    fn from(err: std::io::Error) -> Self {
        SubmitError::Io(err)
    }
}

impl From<ConfigError> for SubmitError {
    fn from(err: ConfigError) -> Self {
        SubmitError::Config(err)
    }
}

impl From<DeviceError> for SubmitError {
    fn from(err: DeviceError) -> Self {
        SubmitError::Device(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingContext {
        errors: Mutex<Vec<DeviceError>>,
    }

    impl ErrorContext for RecordingContext {
        fn handle_error(&self, error: &DeviceError) {
            self.errors.lock().push(*error);
        }
    }

    fn failing_call(context: &dyn ErrorContext) -> Result<u32> {
        let value: u32 = vk_try!(context, Err(vk::Result::ERROR_DEVICE_LOST), "failing_call");
        Ok(value)
    }

    #[test]
    fn test_severity_classification() {
        assert_eq!(severity_of(vk::Result::ERROR_DEVICE_LOST), ErrorSeverity::Fatal);
        assert_eq!(severity_of(vk::Result::ERROR_OUT_OF_HOST_MEMORY), ErrorSeverity::Fatal);
        assert_eq!(severity_of(vk::Result::ERROR_OUT_OF_DATE_KHR), ErrorSeverity::Transient);
        assert_eq!(severity_of(vk::Result::TIMEOUT), ErrorSeverity::Recoverable);
        assert!(SubmitError::DeviceLost.is_fatal());
    }

    #[test]
    fn test_vk_try_reports_to_context() {
        let context = RecordingContext::default();
        let err = failing_call(&context).unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(err.vk_result(), Some(vk::Result::ERROR_DEVICE_LOST));

        let recorded = context.errors.lock();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].function, "failing_call");
        assert!(recorded[0].file.ends_with("error.rs"));
    }
}
