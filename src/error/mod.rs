//! Flare Client Core 错误处理模块
//!
//! 提供统一的错误类型、错误分类以及与 gRPC 状态码之间的转换

pub mod code;
pub mod flare_error;
pub mod grpc;

// 重新导出公共类型
pub use code::ErrorKind;
pub use flare_error::{FlareError, Result};
pub use grpc::Classify;

/// 基础设施层默认使用的结果类型
pub type InfraResult<T> = anyhow::Result<T>;

/// `InfraResult` 的辅助扩展，用于快速转换为统一的错误类型
pub trait InfraResultExt<T> {
    fn into_flare(self, kind: ErrorKind) -> Result<T>;
}

impl<T> InfraResultExt<T> for InfraResult<T> {
    fn into_flare(self, kind: ErrorKind) -> Result<T> {
        // `{:#}` 保留 anyhow 的上下文链
        self.map_err(|err| FlareError::from_kind(kind, format!("{:#}", err)))
    }
}
