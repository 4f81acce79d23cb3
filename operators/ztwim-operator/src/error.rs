//! Operator 错误类型

use std::time::Duration;
use thiserror::Error;

/// Operator 运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API 错误
    #[error("Kubernetes API 错误: {0}")]
    Kube(#[from] kube::Error),

    /// 共享库错误（信任域、配置哈希等）
    #[error(transparent)]
    Common(#[from] ztwim_common::Error),

    /// 资源规范无效
    #[error("资源规范无效: {0}")]
    InvalidSpec(String),

    /// 生成对象缺少必要的元数据
    #[error("{kind} 缺少 metadata.{field}")]
    MissingMetadata {
        /// 对象类型
        kind: String,
        /// 缺失的字段
        field: &'static str,
    },

    /// 缺少顶层资源
    #[error("ZeroTrustWorkloadIdentityManager {0} 不存在")]
    ZtwimNotFound(String),

    /// JSON 序列化错误
    #[error("JSON 序列化错误: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML 序列化错误
    #[error("YAML 序列化错误: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Operator 结果类型
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// 重试能否修复该错误
    pub fn is_retryable(&self) -> bool {
        match self {
            OperatorError::Kube(_) | OperatorError::ZtwimNotFound(_) => true,
            OperatorError::Common(e) => !e.is_permanent(),
            _ => false,
        }
    }

    /// API server 的暂时性错误：冲突、限流、服务端故障或连接中断
    pub fn is_transient(&self) -> bool {
        match self {
            OperatorError::Kube(kube::Error::Api(response)) => {
                response.code == 409 || response.code == 429 || response.code >= 500
            }
            OperatorError::Kube(kube::Error::HyperError(_) | kube::Error::Service(_)) => true,
            _ => false,
        }
    }

    /// 错误对应的条件原因
    ///
    /// 暂时性错误不计入失败，聚合时视为进行中。
    pub fn reason(&self) -> &'static str {
        match self {
            e if e.is_transient() => ztwim_common::REASON_RETRYING,
            OperatorError::InvalidSpec(_) => ztwim_common::REASON_INVALID_SPEC,
            // 信任域错误来自顶层资源，不属于组件规范
            OperatorError::Common(ztwim_common::Error::InvalidTrustDomain { .. }) => {
                ztwim_common::REASON_FAILED
            }
            OperatorError::Common(e) if e.is_permanent() => ztwim_common::REASON_INVALID_SPEC,
            OperatorError::ZtwimNotFound(_) => ztwim_common::REASON_ZTWIM_NOT_FOUND,
            _ => ztwim_common::REASON_FAILED,
        }
    }

    /// 不可重试的错误使用固定的长间隔
    pub fn fixed_requeue(&self) -> Option<Duration> {
        if self.is_retryable() {
            None
        } else {
            Some(Duration::from_secs(300))
        }
    }
}
