//! SpireOIDCDiscoveryProvider 组件资源

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{
    default_log_level, default_true, impl_operand, CommonConfig, ConditionalStatus,
};
use super::spire_server::validate_issuer;

/// OIDC 发现服务规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "operator.openshift.io",
    version = "v1alpha1",
    kind = "SpireOIDCDiscoveryProvider",
    plural = "spireoidcdiscoveryproviders",
    status = "ConditionalStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SpireOIDCDiscoveryProviderSpec {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// JWT 签发者 URL，其主机名同时作为 Route 主机
    pub jwt_issuer: String,

    /// 副本数
    #[serde(default = "default_replica_count")]
    pub replica_count: i32,

    /// 是否由 Operator 管理 Route
    #[serde(default = "default_true")]
    pub managed_route: bool,

    /// agent socket 文件名
    #[serde(default = "default_agent_socket_name")]
    pub agent_socket_name: String,

    /// 共享调度配置
    #[serde(flatten)]
    pub common: CommonConfig,
}

impl SpireOIDCDiscoveryProviderSpec {
    /// 校验规范
    pub fn validate(&self) -> Result<(), String> {
        validate_issuer(&self.jwt_issuer)?;
        if self.replica_count < 1 {
            return Err(format!(
                "replicaCount: must be at least 1, got {}",
                self.replica_count
            ));
        }
        if self.agent_socket_name.is_empty() || self.agent_socket_name.contains('/') {
            return Err(format!(
                "agentSocketName: must be a plain file name, got {:?}",
                self.agent_socket_name
            ));
        }
        Ok(())
    }
}

fn default_replica_count() -> i32 {
    1
}

fn default_agent_socket_name() -> String {
    "spire-agent.sock".to_string()
}

impl_operand!(SpireOIDCDiscoveryProvider, "spire-oidc-discovery-provider");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_validation() {
        let mut spec: SpireOIDCDiscoveryProviderSpec = serde_json::from_value(
            serde_json::json!({"jwtIssuer": "https://oidc-discovery.apps.example.org"}),
        )
        .unwrap();
        assert_eq!(spec.replica_count, 1);
        assert!(spec.managed_route);
        assert!(spec.validate().is_ok());

        spec.replica_count = 0;
        assert!(spec.validate().is_err());
    }
}
