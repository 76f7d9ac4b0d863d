//! Flare 客户端统一错误类型

use super::code::ErrorKind;
use thiserror::Error;

/// Flare 客户端统一错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlareError {
    /// 选择后端时没有任何就绪的连接
    #[error("no ready backend for service: {0}")]
    Unavailable(String),

    /// 哈希环选中的地址在快照中没有存活连接，重新 pick 即可
    #[error("picked backend has no live connection: {0}")]
    NotFound(String),

    /// 监听流已终止
    #[error("watch stream closed")]
    WatchClosed,

    /// 调用上下文超时
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// 调用上下文被取消
    #[error("call canceled")]
    Canceled,

    /// 注册中心错误（原样向上传递，不在内部重试）
    #[error("registry error: {0}")]
    Registry(String),

    /// 连接工厂错误
    #[error("connection error: {0}")]
    Connection(String),

    /// 配置错误
    #[error("configuration error: {0}")]
    Config(String),

    /// 序列化错误
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl FlareError {
    /// 创建不可用错误
    pub fn unavailable(service: impl Into<String>) -> Self {
        FlareError::Unavailable(service.into())
    }

    /// 创建注册中心错误
    pub fn registry(msg: impl Into<String>) -> Self {
        FlareError::Registry(msg.into())
    }

    /// 创建连接错误
    pub fn connection(msg: impl Into<String>) -> Self {
        FlareError::Connection(msg.into())
    }

    /// 创建配置错误
    pub fn config(msg: impl Into<String>) -> Self {
        FlareError::Config(msg.into())
    }

    /// 按类别创建错误，用于把基础设施错误归类
    pub fn from_kind(kind: ErrorKind, msg: impl Into<String>) -> Self {
        let msg = msg.into();
        match kind {
            ErrorKind::Unavailable => FlareError::Unavailable(msg),
            ErrorKind::NotFound => FlareError::NotFound(msg),
            ErrorKind::WatchClosed => FlareError::WatchClosed,
            ErrorKind::DeadlineExceeded => FlareError::DeadlineExceeded,
            ErrorKind::Canceled => FlareError::Canceled,
            ErrorKind::Registry => FlareError::Registry(msg),
            ErrorKind::Connection | ErrorKind::Transport => FlareError::Connection(msg),
            ErrorKind::Config => FlareError::Config(msg),
            ErrorKind::Serialization => FlareError::Serialization(msg),
        }
    }

    /// 获取错误类别
    pub fn kind(&self) -> ErrorKind {
        match self {
            FlareError::Unavailable(_) => ErrorKind::Unavailable,
            FlareError::NotFound(_) => ErrorKind::NotFound,
            FlareError::WatchClosed => ErrorKind::WatchClosed,
            FlareError::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            FlareError::Canceled => ErrorKind::Canceled,
            FlareError::Registry(_) => ErrorKind::Registry,
            FlareError::Connection(_) => ErrorKind::Connection,
            FlareError::Config(_) => ErrorKind::Config,
            FlareError::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// 是否来自调用上下文（取消或超时）
    pub fn is_context_error(&self) -> bool {
        matches!(self, FlareError::DeadlineExceeded | FlareError::Canceled)
    }
}

impl From<serde_json::Error> for FlareError {
    fn from(err: serde_json::Error) -> Self {
        FlareError::Serialization(err.to_string())
    }
}

impl From<tonic::transport::Error> for FlareError {
    fn from(err: tonic::transport::Error) -> Self {
        FlareError::Connection(err.to_string())
    }
}

#[cfg(feature = "etcd")]
impl From<etcd_client::Error> for FlareError {
    fn from(err: etcd_client::Error) -> Self {
        FlareError::Registry(err.to_string())
    }
}

#[cfg(feature = "consul")]
impl From<reqwest::Error> for FlareError {
    fn from(err: reqwest::Error) -> Self {
        FlareError::Registry(err.to_string())
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, FlareError>;
