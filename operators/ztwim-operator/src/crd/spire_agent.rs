//! SpireAgent 组件资源

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{
    default_agent_socket_path, default_log_format, default_log_level, default_true,
    impl_operand, CommonConfig, ConditionalStatus,
};

/// spire-agent 规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "operator.openshift.io",
    version = "v1alpha1",
    kind = "SpireAgent",
    plural = "spireagents",
    status = "ConditionalStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SpireAgentSpec {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// 日志格式
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// 主机上存放 Workload API socket 的目录
    #[serde(default = "default_agent_socket_path")]
    pub socket_path: String,

    /// 节点证明
    #[serde(default)]
    pub node_attestor: NodeAttestor,

    /// 工作负载证明
    #[serde(default)]
    pub workload_attestors: WorkloadAttestors,

    /// 共享调度配置
    #[serde(flatten)]
    pub common: CommonConfig,
}

/// 节点证明配置
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeAttestor {
    /// 启用 k8s_psat 节点证明
    #[serde(default = "default_true", rename = "k8sPSATEnabled")]
    pub k8s_psat_enabled: bool,
}

impl Default for NodeAttestor {
    fn default() -> Self {
        Self {
            k8s_psat_enabled: true,
        }
    }
}

/// 工作负载证明配置
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadAttestors {
    /// 启用 k8s 工作负载证明
    #[serde(default = "default_true")]
    pub k8s_enabled: bool,

    /// 禁用容器级选择器
    #[serde(default)]
    pub disable_container_selectors: bool,

    /// 使用新的容器定位器
    #[serde(default = "default_true")]
    pub use_new_container_locator: bool,

    /// kubelet 证书校验方式
    #[serde(default)]
    pub verification: WorkloadAttestorsVerification,
}

impl Default for WorkloadAttestors {
    fn default() -> Self {
        Self {
            k8s_enabled: true,
            disable_container_selectors: false,
            use_new_container_locator: true,
            verification: WorkloadAttestorsVerification::default(),
        }
    }
}

/// kubelet 证书校验方式
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum VerificationType {
    /// 自动：OpenShift 上使用 API server CA
    #[default]
    Auto,
    /// 使用主机上的 kubelet CA 文件
    HostCert,
    /// 使用 API server CA
    #[serde(rename = "APIServerCA")]
    ApiServerCa,
    /// 跳过校验
    Skip,
}

/// kubelet 校验配置
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadAttestorsVerification {
    /// 校验方式
    #[serde(default, rename = "type")]
    pub type_: VerificationType,

    /// HostCert 模式下的主机证书目录
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_cert_base_path: Option<String>,

    /// HostCert 模式下的证书文件名
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_cert_file_name: Option<String>,
}

impl SpireAgentSpec {
    /// 校验规范
    pub fn validate(&self) -> Result<(), String> {
        if !self.socket_path.starts_with('/') {
            return Err(format!(
                "socketPath: must be an absolute path, got {:?}",
                self.socket_path
            ));
        }

        let verification = &self.workload_attestors.verification;
        if verification.type_ == VerificationType::HostCert {
            let base = verification.host_cert_base_path.as_deref().unwrap_or("");
            let file = verification.host_cert_file_name.as_deref().unwrap_or("");
            if base.is_empty() || file.is_empty() {
                return Err(
                    "workloadAttestors.verification: HostCert requires hostCertBasePath and hostCertFileName"
                        .to_string(),
                );
            }
        }

        Ok(())
    }
}

impl_operand!(SpireAgent, "spire-agent");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let spec: SpireAgentSpec = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(spec.node_attestor.k8s_psat_enabled);
        assert!(spec.workload_attestors.k8s_enabled);
        assert!(spec.workload_attestors.use_new_container_locator);
        assert_eq!(spec.workload_attestors.verification.type_, VerificationType::Auto);
        assert_eq!(spec.socket_path, "/run/spire/agent-sockets");
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_verification_type_names() {
        let v: WorkloadAttestorsVerification =
            serde_json::from_value(serde_json::json!({"type": "APIServerCA"})).unwrap();
        assert_eq!(v.type_, VerificationType::ApiServerCa);
    }

    #[test]
    fn test_host_cert_requires_paths() {
        let spec: SpireAgentSpec = serde_json::from_value(serde_json::json!({
            "workloadAttestors": {"verification": {"type": "HostCert"}}
        }))
        .unwrap();
        assert!(spec.validate().is_err());
    }
}
