//! 错误类别定义
//!
//! `ErrorKind` 是错误的粗粒度分类，重试策略通过它判断一个错误是否可以重试

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 错误类别
///
/// 配置文件中以 snake_case 书写，例如 `retryable_error_kinds = ["transport", "not_found"]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 没有可用的后端
    Unavailable,
    /// 快照与连接池之间的竞争，选中的地址已经没有连接
    NotFound,
    /// 监听流已关闭
    WatchClosed,
    /// 调用超时
    DeadlineExceeded,
    /// 调用被取消
    Canceled,
    /// 注册中心错误
    Registry,
    /// 连接建立失败
    Connection,
    /// 传输层错误（连接被重置等）
    Transport,
    /// 配置错误
    Config,
    /// 序列化错误
    Serialization,
}

impl ErrorKind {
    /// 获取错误类别的英文标识符
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::NotFound => "not_found",
            ErrorKind::WatchClosed => "watch_closed",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::Canceled => "canceled",
            ErrorKind::Registry => "registry",
            ErrorKind::Connection => "connection",
            ErrorKind::Transport => "transport",
            ErrorKind::Config => "config",
            ErrorKind::Serialization => "serialization",
        }
    }

    /// 从 gRPC 状态码推导错误类别
    pub fn from_code(code: tonic::Code) -> Option<Self> {
        match code {
            tonic::Code::Unavailable => Some(ErrorKind::Unavailable),
            tonic::Code::DeadlineExceeded => Some(ErrorKind::DeadlineExceeded),
            tonic::Code::Cancelled => Some(ErrorKind::Canceled),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "unavailable" => Ok(ErrorKind::Unavailable),
            "not_found" | "notfound" => Ok(ErrorKind::NotFound),
            "watch_closed" => Ok(ErrorKind::WatchClosed),
            "deadline_exceeded" | "timeout" => Ok(ErrorKind::DeadlineExceeded),
            "canceled" | "cancelled" => Ok(ErrorKind::Canceled),
            "registry" => Ok(ErrorKind::Registry),
            "connection" => Ok(ErrorKind::Connection),
            "transport" => Ok(ErrorKind::Transport),
            "config" => Ok(ErrorKind::Config),
            "serialization" => Ok(ErrorKind::Serialization),
            _ => Err(format!("Unknown error kind: {}", s)),
        }
    }
}
