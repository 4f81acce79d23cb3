//! 错误处理模块
//!
//! 该模块提供 ZTWIM 共享库的统一错误类型，覆盖配置、校验与序列化失败。

use thiserror::Error;

/// ZTWIM 统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 校验错误
    #[error("校验错误: {0}")]
    Validation(String),

    /// 无效的信任域
    #[error("无效的信任域 {domain:?}: {reason}")]
    InvalidTrustDomain {
        /// 原始输入
        domain: String,
        /// 失败原因
        reason: String,
    },

    /// 无效的 SPIFFE ID
    #[error("无效的 SPIFFE ID: {0}")]
    InvalidSpiffeId(String),

    /// JSON 错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),
}

/// ZTWIM 结果类型别名
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// 是否为用户输入导致的错误（重试无法修复）
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::InvalidTrustDomain { .. } | Error::InvalidSpiffeId(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidTrustDomain {
            domain: "Example.ORG".to_string(),
            reason: "must be lower case".to_string(),
        };
        assert!(err.to_string().contains("Example.ORG"));
        assert!(err.to_string().contains("must be lower case"));
    }

    #[test]
    fn test_permanent_errors() {
        assert!(Error::Validation("x".into()).is_permanent());
        assert!(!Error::Config("x".into()).is_permanent());
    }
}
