//! 顶层资源 ZeroTrustWorkloadIdentityManager

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use ztwim_common::Condition;

use super::common::OperandStatus;

/// 零信任工作负载身份管理器规范
///
/// 保存所有组件共享的 SPIFFE 信任域与集群信息。
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "operator.openshift.io",
    version = "v1alpha1",
    kind = "ZeroTrustWorkloadIdentityManager",
    plural = "zerotrustworkloadidentitymanagers",
    shortname = "ztwim",
    status = "ZeroTrustWorkloadIdentityManagerStatus",
    printcolumn = r#"{"name":"TrustDomain","type":"string","jsonPath":".spec.trustDomain"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ZeroTrustWorkloadIdentityManagerSpec {
    /// SPIFFE 信任域
    pub trust_domain: String,

    /// 集群名称，用于节点证明与 controller-manager
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    /// 信任包 ConfigMap 名称
    #[serde(default = "default_bundle_config_map")]
    pub bundle_config_map: String,
}

/// 顶层资源状态
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ZeroTrustWorkloadIdentityManagerStatus {
    /// 汇总条件：Ready、Degraded、CreateOnlyMode、Upgradeable
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// 各组件状态
    #[serde(default)]
    pub operands: Vec<OperandStatus>,
}

fn default_cluster_name() -> String {
    "cluster".to_string()
}

fn default_bundle_config_map() -> String {
    "spire-bundle".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_defaults() {
        let spec: ZeroTrustWorkloadIdentityManagerSpec =
            serde_json::from_value(serde_json::json!({"trustDomain": "example.org"})).unwrap();
        assert_eq!(spec.trust_domain, "example.org");
        assert_eq!(spec.cluster_name, "cluster");
        assert_eq!(spec.bundle_config_map, "spire-bundle");
    }
}
