//! 组件资源共享的类型

use k8s_openapi::api::core::v1::{Affinity, ResourceRequirements, Toleration};
use k8s_openapi::ClusterResourceScope;
use kube::Resource;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use ztwim_common::Condition;

/// 单例资源的唯一合法名称
pub const SINGLETON_NAME: &str = "cluster";

/// 所有组件共享的调度与标签配置
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommonConfig {
    /// 附加到所有生成对象上的标签
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// 容器资源配额
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// 亲和性
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    /// 容忍度
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    /// 节点选择器
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
}

/// 组件资源的状态，只包含条件列表
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalStatus {
    /// 状态条件
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// 顶层资源中记录的单个组件状态
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperandStatus {
    /// 组件资源名称
    pub name: String,
    /// 组件资源类型
    pub kind: String,
    /// 是否就绪（"true" / "false"）
    pub ready: String,
    /// 状态说明
    #[serde(default)]
    pub message: String,
    /// 组件上报的关键条件
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// 组件资源的公共访问接口
pub trait Operand:
    Resource<DynamicType = (), Scope = ClusterResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// 组件名称，用于日志与指标标签
    const OPERAND: &'static str;

    /// 当前状态条件
    fn conditions(&self) -> &[Condition];

    /// 共享调度配置
    fn common(&self) -> &CommonConfig;
}

/// 为组件资源实现 [`Operand`]
macro_rules! impl_operand {
    ($kind:ty, $operand:expr) => {
        impl $crate::crd::common::Operand for $kind {
            const OPERAND: &'static str = $operand;

            fn conditions(&self) -> &[ztwim_common::Condition] {
                self.status
                    .as_ref()
                    .map(|s| s.conditions.as_slice())
                    .unwrap_or(&[])
            }

            fn common(&self) -> &$crate::crd::common::CommonConfig {
                &self.spec.common
            }
        }
    };
}

pub(crate) use impl_operand;

/// 默认日志级别
pub(crate) fn default_log_level() -> String {
    "info".to_string()
}

/// 默认日志格式
pub(crate) fn default_log_format() -> String {
    "text".to_string()
}

/// 默认 agent socket 目录
pub(crate) fn default_agent_socket_path() -> String {
    "/run/spire/agent-sockets".to_string()
}

/// 默认布尔值 true
pub(crate) fn default_true() -> bool {
    true
}
