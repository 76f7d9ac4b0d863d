//! gRPC 错误处理
//!
//! 提供 FlareError 与 tonic::Status 之间的转换，以及重试判定所需的错误分类

use super::{ErrorKind, FlareError};
use tonic::{Code, Status};

/// 错误分类 trait
///
/// 重试拦截器只通过状态码和错误类别判断是否重试，不关心具体错误类型
pub trait Classify {
    /// gRPC 状态码（数值形式，与配置中的 `retryable_status_codes` 对应）
    fn status_code(&self) -> Option<i32>;

    /// 错误类别
    fn error_kind(&self) -> Option<ErrorKind>;
}

impl Classify for Status {
    fn status_code(&self) -> Option<i32> {
        Some(self.code() as i32)
    }

    fn error_kind(&self) -> Option<ErrorKind> {
        // 连接被重置、握手失败等由 tonic 包装成 Status，原始错误挂在 source 上
        let transport = std::error::Error::source(self)
            .is_some_and(|source| source.downcast_ref::<tonic::transport::Error>().is_some());
        if transport {
            return Some(ErrorKind::Transport);
        }
        ErrorKind::from_code(self.code())
    }
}

impl Classify for FlareError {
    fn status_code(&self) -> Option<i32> {
        Some(map_error_to_grpc(self) as i32)
    }

    fn error_kind(&self) -> Option<ErrorKind> {
        Some(self.kind())
    }
}

impl From<FlareError> for Status {
    fn from(err: FlareError) -> Self {
        let kind = err.kind();
        let mut status = Status::new(map_error_to_grpc(&err), err.to_string());

        // 错误类别写入 metadata，便于上游区分 pick 失败和业务失败
        if let Ok(value) = kind.as_str().parse() {
            status.metadata_mut().insert("error-kind", value);
        }

        status
    }
}

/// 将 FlareError 映射到 gRPC 状态码
fn map_error_to_grpc(err: &FlareError) -> Code {
    match err {
        FlareError::Unavailable(_)
        | FlareError::NotFound(_)
        | FlareError::WatchClosed
        | FlareError::Registry(_)
        | FlareError::Connection(_) => Code::Unavailable,
        FlareError::DeadlineExceeded => Code::DeadlineExceeded,
        FlareError::Canceled => Code::Cancelled,
        FlareError::Config(_) => Code::FailedPrecondition,
        FlareError::Serialization(_) => Code::Internal,
    }
}
