//! SpiffeCSIDriver 组件资源

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{default_agent_socket_path, impl_operand, CommonConfig, ConditionalStatus};

/// SPIFFE CSI 驱动规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "operator.openshift.io",
    version = "v1alpha1",
    kind = "SpiffeCSIDriver",
    plural = "spiffecsidrivers",
    status = "ConditionalStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SpiffeCSIDriverSpec {
    /// 主机上 agent socket 所在目录，需与 SpireAgent.socketPath 一致
    #[serde(default = "default_agent_socket_path")]
    pub agent_socket_path: String,

    /// CSI 插件名称
    #[serde(default = "default_plugin_name")]
    pub plugin_name: String,

    /// 共享调度配置
    #[serde(flatten)]
    pub common: CommonConfig,
}

impl SpiffeCSIDriverSpec {
    /// 校验规范
    pub fn validate(&self) -> Result<(), String> {
        if !self.agent_socket_path.starts_with('/') {
            return Err(format!(
                "agentSocketPath: must be an absolute path, got {:?}",
                self.agent_socket_path
            ));
        }
        let valid_name = !self.plugin_name.is_empty()
            && self.plugin_name.len() <= 63
            && self
                .plugin_name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-');
        if !valid_name {
            return Err(format!("pluginName: invalid name {:?}", self.plugin_name));
        }
        Ok(())
    }
}

/// 默认 CSI 插件名称
pub const DEFAULT_PLUGIN_NAME: &str = "csi.spiffe.io";

fn default_plugin_name() -> String {
    DEFAULT_PLUGIN_NAME.to_string()
}

impl_operand!(SpiffeCSIDriver, "spiffe-csi-driver");
