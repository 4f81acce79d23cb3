//! spire-agent 资源构建

use k8s_openapi::api::apps::v1::{
    DaemonSet, DaemonSetSpec, DaemonSetUpdateStrategy, RollingUpdateDaemonSet,
};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, ContainerPort, PodSpec, PodTemplateSpec, ProjectedVolumeSource,
    SecurityContext, Service, ServicePort, ServiceSpec, ServiceAccountTokenProjection, Volume,
    VolumeProjection,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::DynamicObject;
use serde_json::{json, Value};
use std::collections::BTreeMap;

use super::{
    apply_scheduling, config_map_volume, empty_dir_volume, host_path_volume, http_probe,
    node_name_env, policy_rule, role_ref, selector_labels, to_config_json, volume_mount,
    ObjectContext,
};
use crate::config::OperatorConfig;
use crate::crd::{SpireAgent, VerificationType, ZeroTrustWorkloadIdentityManagerSpec};
use crate::error::Result;
use crate::resources::spire_server::{SERVER_SERVICE_NAME, SERVER_SERVICE_PORT};

/// 所有 spire-agent 对象共用的名称
pub const AGENT_NAME: &str = "spire-agent";
/// 配置哈希注解
pub const AGENT_CONFIG_HASH_ANNOTATION: &str = "ztwim.openshift.io/spire-agent-config-hash";
/// 配置文件名
pub const AGENT_CONFIG_FILE: &str = "agent.conf";
/// 容器内 Workload API socket 目录
pub const AGENT_SOCKET_DIR: &str = "/tmp/spire-agent/public";
/// 健康检查端口
pub const AGENT_HEALTH_PORT: i32 = 9982;
/// 指标端口
pub const AGENT_METRICS_PORT: i32 = 9402;
/// PSAT 令牌受众
pub const AGENT_TOKEN_AUDIENCE: &str = "spire-server";

const CONFIG_DIR: &str = "/opt/spire/conf/agent";
const BUNDLE_DIR: &str = "/run/spire/bundle";
const TOKEN_DIR: &str = "/var/run/secrets/tokens";
const HOST_CERT_DIR: &str = "/run/spire/kubelet-ca";
const SERVICE_ACCOUNT_CA: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// spire-agent 资源构建器
pub struct SpireAgentResources<'a> {
    agent: &'a SpireAgent,
    ztwim: &'a ZeroTrustWorkloadIdentityManagerSpec,
    config: &'a OperatorConfig,
    ctx: ObjectContext,
}

impl<'a> SpireAgentResources<'a> {
    /// 创建构建器
    pub fn new(
        agent: &'a SpireAgent,
        ztwim: &'a ZeroTrustWorkloadIdentityManagerSpec,
        config: &'a OperatorConfig,
    ) -> Result<Self> {
        let ctx = ObjectContext::new(
            agent,
            &config.operand_namespace,
            AGENT_NAME,
            "node-agent",
            &agent.spec.common,
        )?;
        Ok(Self {
            agent,
            ztwim,
            config,
            ctx,
        })
    }

    /// 服务账户
    pub fn service_account(&self) -> k8s_openapi::api::core::v1::ServiceAccount {
        self.ctx.service_account(AGENT_NAME)
    }

    /// 集群角色：工作负载证明需要读取 Pod 与节点信息
    pub fn cluster_role(&self) -> ClusterRole {
        ClusterRole {
            metadata: self.ctx.cluster_meta(AGENT_NAME),
            rules: Some(vec![
                policy_rule(&[""], &["pods", "nodes", "nodes/proxy"], &["get", "list", "watch"]),
            ]),
            ..Default::default()
        }
    }

    /// 集群角色绑定
    pub fn cluster_role_binding(&self) -> ClusterRoleBinding {
        ClusterRoleBinding {
            metadata: self.ctx.cluster_meta(AGENT_NAME),
            role_ref: role_ref("ClusterRole", AGENT_NAME),
            subjects: Some(vec![self.ctx.service_account_subject(AGENT_NAME)]),
        }
    }

    /// 指标 Service
    pub fn service(&self) -> Service {
        Service {
            metadata: self.ctx.meta(AGENT_NAME),
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(selector_labels(AGENT_NAME)),
                ports: Some(vec![ServicePort {
                    name: Some("metrics".to_string()),
                    port: AGENT_METRICS_PORT,
                    target_port: Some(IntOrString::String("metrics".to_string())),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// SecurityContextConstraints
    pub fn scc(&self) -> DynamicObject {
        self.ctx.scc(AGENT_NAME, AGENT_NAME, false)
    }

    /// 渲染 agent.conf 内容
    pub fn agent_config(&self) -> Value {
        let spec = &self.agent.spec;
        let server_address = format!("{}.{}", SERVER_SERVICE_NAME, self.config.operand_namespace);

        let mut plugins = serde_json::Map::new();
        plugins.insert(
            "KeyManager".to_string(),
            json!([{"memory": {"plugin_data": null}}]),
        );
        if spec.node_attestor.k8s_psat_enabled {
            plugins.insert(
                "NodeAttestor".to_string(),
                json!([{"k8s_psat": {"plugin_data": {"cluster": self.ztwim.cluster_name}}}]),
            );
        }
        plugins.insert(
            "WorkloadAttestor".to_string(),
            Value::Array(vec![self.workload_attestor()]),
        );

        json!({
            "agent": {
                "data_dir": "/var/lib/spire",
                "log_level": spec.log_level,
                "log_format": spec.log_format,
                "server_address": server_address,
                "server_port": SERVER_SERVICE_PORT.to_string(),
                "socket_path": format!("{AGENT_SOCKET_DIR}/spire-agent.sock"),
                "trust_bundle_path": format!("{BUNDLE_DIR}/bundle.crt"),
                "trust_domain": self.ztwim.trust_domain,
            },
            "health_checks": {
                "bind_address": "0.0.0.0",
                "bind_port": AGENT_HEALTH_PORT.to_string(),
                "listener_enabled": true,
                "live_path": "/live",
                "ready_path": "/ready",
            },
            "plugins": plugins,
            "telemetry": {
                "Prometheus": {
                    "host": "0.0.0.0",
                    "port": AGENT_METRICS_PORT.to_string(),
                }
            },
        })
    }

    fn workload_attestor(&self) -> Value {
        let attestors = &self.agent.spec.workload_attestors;
        if !attestors.k8s_enabled {
            return json!({"unix": {"plugin_data": null}});
        }

        let mut data = json!({
            "disable_container_selectors": attestors.disable_container_selectors,
            "node_name_env": "MY_NODE_NAME",
            "use_new_container_locator": attestors.use_new_container_locator,
            "verbose_container_locator_logs": false,
        });
        let verification = &attestors.verification;
        match verification.type_ {
            VerificationType::Skip => {
                data["skip_kubelet_verification"] = json!(true);
            }
            VerificationType::HostCert => {
                let file = verification.host_cert_file_name.as_deref().unwrap_or_default();
                data["kubelet_ca_path"] = json!(format!("{HOST_CERT_DIR}/{file}"));
            }
            VerificationType::Auto | VerificationType::ApiServerCa => {
                data["kubelet_ca_path"] = json!(SERVICE_ACCOUNT_CA);
            }
        }

        json!({"k8s": {"plugin_data": data}})
    }

    /// agent ConfigMap
    pub fn config_map(&self) -> Result<ConfigMap> {
        Ok(ConfigMap {
            metadata: self.ctx.meta(AGENT_NAME),
            data: Some(BTreeMap::from([(
                AGENT_CONFIG_FILE.to_string(),
                to_config_json(&self.agent_config())?,
            )])),
            ..Default::default()
        })
    }

    /// agent DaemonSet，`config_hash` 写入 Pod 模板注解
    pub fn daemon_set(&self, config_hash: &str) -> DaemonSet {
        let spec = &self.agent.spec;
        let verification = &spec.workload_attestors.verification;

        let mut volume_mounts = vec![
            volume_mount("spire-config", CONFIG_DIR, true),
            volume_mount("spire-agent-persistence", "/var/lib/spire", false),
            volume_mount("spire-bundle", BUNDLE_DIR, true),
            volume_mount("spire-agent-socket-dir", AGENT_SOCKET_DIR, false),
            volume_mount("spire-token", TOKEN_DIR, true),
        ];
        let mut volumes = vec![
            config_map_volume("spire-config", AGENT_NAME),
            empty_dir_volume("spire-agent-persistence"),
            config_map_volume("spire-bundle", &self.ztwim.bundle_config_map),
            host_path_volume("spire-agent-socket-dir", &spec.socket_path, "DirectoryOrCreate"),
            token_volume(),
        ];
        if verification.type_ == VerificationType::HostCert {
            let base = verification.host_cert_base_path.as_deref().unwrap_or_default();
            volume_mounts.push(volume_mount("kubelet-ca", HOST_CERT_DIR, true));
            volumes.push(host_path_volume("kubelet-ca", base, "Directory"));
        }

        let mut container = Container {
            name: AGENT_NAME.to_string(),
            image: Some(self.config.images.spire_agent.clone()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            args: Some(vec![
                "-config".to_string(),
                format!("{CONFIG_DIR}/{AGENT_CONFIG_FILE}"),
            ]),
            env: Some(vec![node_name_env("MY_NODE_NAME")]),
            ports: Some(vec![
                container_port("healthz", AGENT_HEALTH_PORT),
                container_port("metrics", AGENT_METRICS_PORT),
            ]),
            liveness_probe: Some(http_probe("/live", "healthz", 15, 60)),
            readiness_probe: Some(http_probe("/ready", "healthz", 10, 30)),
            security_context: Some(SecurityContext {
                read_only_root_filesystem: Some(true),
                allow_privilege_escalation: Some(false),
                ..Default::default()
            }),
            volume_mounts: Some(volume_mounts),
            ..Default::default()
        };

        let mut pod = PodSpec {
            service_account_name: Some(AGENT_NAME.to_string()),
            host_pid: Some(true),
            host_network: Some(true),
            dns_policy: Some("ClusterFirstWithHostNet".to_string()),
            volumes: Some(volumes),
            ..Default::default()
        };
        apply_scheduling(&spec.common, &mut pod, &mut container);
        pod.containers = vec![container];

        let mut pod_labels = self.ctx.labels.clone();
        pod_labels.extend(selector_labels(AGENT_NAME));

        DaemonSet {
            metadata: self.ctx.meta(AGENT_NAME),
            spec: Some(DaemonSetSpec {
                selector: LabelSelector {
                    match_labels: Some(selector_labels(AGENT_NAME)),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(pod_labels),
                        annotations: Some(BTreeMap::from([
                            (AGENT_CONFIG_HASH_ANNOTATION.to_string(), config_hash.to_string()),
                            (
                                "kubectl.kubernetes.io/default-container".to_string(),
                                AGENT_NAME.to_string(),
                            ),
                        ])),
                        ..Default::default()
                    }),
                    spec: Some(pod),
                },
                update_strategy: Some(DaemonSetUpdateStrategy {
                    type_: Some("RollingUpdate".to_string()),
                    rolling_update: Some(RollingUpdateDaemonSet {
                        max_unavailable: Some(IntOrString::Int(1)),
                        ..Default::default()
                    }),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// 命名容器端口
pub(crate) fn container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn token_volume() -> Volume {
    Volume {
        name: "spire-token".to_string(),
        projected: Some(ProjectedVolumeSource {
            sources: Some(vec![VolumeProjection {
                service_account_token: Some(ServiceAccountTokenProjection {
                    audience: Some(AGENT_TOKEN_AUDIENCE.to_string()),
                    expiration_seconds: Some(7200),
                    path: AGENT_NAME.to_string(),
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
