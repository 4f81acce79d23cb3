//! Kubernetes 资源构建模块
//!
//! 该模块把自定义资源规范翻译为具体的 Kubernetes 对象（ConfigMap、
//! DaemonSet、StatefulSet、Deployment、Service、RBAC、SCC、Route 等）。
//! 所有构建函数都是纯函数，不访问 API server。

pub mod csi_driver;
pub mod oidc;
pub mod spire_agent;
pub mod spire_server;

use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, EnvVar, EnvVarSource, HTTPGetAction, HostPathVolumeSource,
    ObjectFieldSelector, PodSpec, Probe, ServiceAccount, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::DynamicObject;
use kube::core::{ApiResource, GroupVersionKind};
use kube::Resource;
use serde_json::json;
use std::collections::BTreeMap;

use crate::crd::CommonConfig;
use crate::error::{OperatorError, Result};

/// 所有生成对象的 part-of / managed-by 标签值
pub const OPERATOR_NAME: &str = "zero-trust-workload-identity-manager";

/// 组件实例标签值
pub const INSTANCE_NAME: &str = "spire";

/// 标签键
pub const LABEL_NAME: &str = "app.kubernetes.io/name";
/// 标签键
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
/// 标签键
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
/// 标签键
pub const LABEL_PART_OF: &str = "app.kubernetes.io/part-of";
/// 标签键
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// 用于筛选本 Operator 管理对象的标签选择器
pub fn managed_by_selector() -> String {
    format!("{LABEL_MANAGED_BY}={OPERATOR_NAME}")
}

/// 标准标签，自定义标签不会覆盖标准标签
pub fn standard_labels(
    name: &str,
    component: &str,
    custom: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut labels = custom.clone();
    labels.extend([
        (LABEL_NAME.to_string(), name.to_string()),
        (LABEL_INSTANCE.to_string(), INSTANCE_NAME.to_string()),
        (LABEL_COMPONENT.to_string(), component.to_string()),
        (LABEL_PART_OF.to_string(), OPERATOR_NAME.to_string()),
        (LABEL_MANAGED_BY.to_string(), OPERATOR_NAME.to_string()),
    ]);
    labels
}

/// 工作负载选择器标签，创建后不可变，因此不包含自定义标签
pub fn selector_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_NAME.to_string(), name.to_string()),
        (LABEL_INSTANCE.to_string(), INSTANCE_NAME.to_string()),
    ])
}

/// 生成对象时共享的元数据上下文
#[derive(Clone, Debug)]
pub struct ObjectContext {
    /// 组件命名空间
    pub namespace: String,
    /// 所有对象的标签
    pub labels: BTreeMap<String, String>,
    /// 指向组件资源的控制者引用
    pub owner: OwnerReference,
}

impl ObjectContext {
    /// 为组件资源创建上下文
    pub fn new<K>(owner: &K, namespace: &str, name: &str, component: &str, common: &CommonConfig) -> Result<Self>
    where
        K: Resource<DynamicType = ()>,
    {
        let owner = owner
            .controller_owner_ref(&())
            .ok_or_else(|| OperatorError::MissingMetadata {
                kind: K::kind(&()).to_string(),
                field: "uid",
            })?;

        Ok(Self {
            namespace: namespace.to_string(),
            labels: standard_labels(name, component, &common.labels),
            owner,
        })
    }

    /// 命名空间级对象的元数据
    pub fn meta(&self, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.clone()),
            labels: Some(self.labels.clone()),
            owner_references: Some(vec![self.owner.clone()]),
            ..Default::default()
        }
    }

    /// 集群级对象的元数据
    pub fn cluster_meta(&self, name: &str) -> ObjectMeta {
        ObjectMeta {
            namespace: None,
            ..self.meta(name)
        }
    }

    /// 服务账户
    pub fn service_account(&self, name: &str) -> ServiceAccount {
        ServiceAccount {
            metadata: self.meta(name),
            ..Default::default()
        }
    }

    /// 指向本命名空间服务账户的 RBAC 主体
    pub fn service_account_subject(&self, name: &str) -> Subject {
        Subject {
            kind: "ServiceAccount".to_string(),
            name: name.to_string(),
            namespace: Some(self.namespace.clone()),
            ..Default::default()
        }
    }

    /// OpenShift 服务账户用户名
    pub fn service_account_user(&self, name: &str) -> String {
        format!("system:serviceaccount:{}:{}", self.namespace, name)
    }

    /// 构建 SecurityContextConstraints
    pub fn scc(&self, name: &str, service_account: &str, privileged: bool) -> DynamicObject {
        let mut scc = DynamicObject::new(name, &scc_api_resource());
        scc.metadata = self.cluster_meta(name);
        scc.data = json!({
            "allowHostDirVolumePlugin": true,
            "allowHostIPC": false,
            "allowHostNetwork": true,
            "allowHostPID": true,
            "allowHostPorts": true,
            "allowPrivilegeEscalation": privileged,
            "allowPrivilegedContainer": privileged,
            "fsGroup": {"type": "RunAsAny"},
            "readOnlyRootFilesystem": !privileged,
            "requiredDropCapabilities": ["ALL"],
            "runAsUser": {"type": "RunAsAny"},
            "seLinuxContext": {"type": "RunAsAny"},
            "supplementalGroups": {"type": "RunAsAny"},
            "users": [self.service_account_user(service_account)],
            "volumes": ["configMap", "csi", "downwardAPI", "emptyDir", "hostPath", "projected", "secret"],
        });
        scc
    }
}

/// SecurityContextConstraints 的 API 资源描述
pub fn scc_api_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("security.openshift.io", "v1", "SecurityContextConstraints"),
        "securitycontextconstraints",
    )
}

/// Route 的 API 资源描述
pub fn route_api_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("route.openshift.io", "v1", "Route"),
        "routes",
    )
}

/// ClusterRole / Role 引用
pub fn role_ref(kind: &str, name: &str) -> RoleRef {
    RoleRef {
        api_group: "rbac.authorization.k8s.io".to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

/// RBAC 规则
pub fn policy_rule(api_groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(api_groups.iter().map(|s| s.to_string()).collect()),
        resources: Some(resources.iter().map(|s| s.to_string()).collect()),
        verbs: verbs.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

/// ConfigMap 卷
pub fn config_map_volume(name: &str, config_map: &str) -> Volume {
    Volume {
        name: name.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: Some(config_map.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// hostPath 卷
pub fn host_path_volume(name: &str, path: &str, type_: &str) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            type_: Some(type_.to_string()),
        }),
        ..Default::default()
    }
}

/// emptyDir 卷
pub fn empty_dir_volume(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(Default::default()),
        ..Default::default()
    }
}

/// 卷挂载
pub fn volume_mount(name: &str, mount_path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: mount_path.to_string(),
        read_only: Some(read_only),
        ..Default::default()
    }
}

/// 注入节点名的环境变量
pub fn node_name_env(name: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: "spec.nodeName".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// 基于命名端口的 HTTP 探针
pub fn http_probe(path: &str, port: &str, initial_delay: i32, period: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::String(port.to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(period),
        ..Default::default()
    }
}

/// 把共享调度配置应用到 Pod 与主容器
pub fn apply_scheduling(common: &CommonConfig, pod: &mut PodSpec, main_container: &mut Container) {
    if !common.node_selector.is_empty() {
        pod.node_selector = Some(common.node_selector.clone());
    }
    if !common.tolerations.is_empty() {
        pod.tolerations = Some(common.tolerations.clone());
    }
    pod.affinity = common.affinity.clone();
    main_container.resources = common.resources.clone();
}

/// 序列化为带缩进的 JSON 配置文本
pub fn to_config_json(value: &serde_json::Value) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}
