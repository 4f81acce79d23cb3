//! spire-server 资源构建
//!
//! spire-server 以单副本 StatefulSet 运行，同一 Pod 中附带
//! spire-controller-manager 容器，两者共享 server 的管理 socket。

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec,
    PodTemplateSpec, ResourceRequirements, SecurityContext, Service, ServiceAccount, ServicePort,
    ServiceSpec,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde_json::{json, Value};
use std::collections::BTreeMap;

use super::spire_agent::{container_port, AGENT_NAME, AGENT_TOKEN_AUDIENCE};
use super::{
    apply_scheduling, config_map_volume, empty_dir_volume, http_probe, policy_rule, role_ref,
    selector_labels, to_config_json, volume_mount, ObjectContext,
};
use crate::config::OperatorConfig;
use crate::crd::{SpireServer, ZeroTrustWorkloadIdentityManagerSpec};
use crate::error::Result;

/// spire-server 对象名称
pub const SERVER_NAME: &str = "spire-server";
/// agent 连接的 Service 名称
pub const SERVER_SERVICE_NAME: &str = "spire-server";
/// agent 连接的 Service 端口
pub const SERVER_SERVICE_PORT: i32 = 443;
/// spire-controller-manager 对象名称
pub const CONTROLLER_MANAGER_NAME: &str = "spire-controller-manager";
/// 信任包写入权限的 Role 名称
pub const BUNDLE_ROLE_NAME: &str = "spire-bundle";
/// server 配置哈希注解
pub const SERVER_CONFIG_HASH_ANNOTATION: &str = "ztwim.openshift.io/spire-server-config-hash";
/// controller-manager 配置哈希注解
pub const CONTROLLER_MANAGER_CONFIG_HASH_ANNOTATION: &str =
    "ztwim.openshift.io/spire-controller-manager-config-hash";
/// server 配置文件名
pub const SERVER_CONFIG_FILE: &str = "server.conf";
/// controller-manager 配置文件名
pub const CONTROLLER_MANAGER_CONFIG_FILE: &str = "controller-manager-config.yaml";

const SERVER_GRPC_PORT: i32 = 8081;
const SERVER_HEALTH_PORT: i32 = 8080;
const SERVER_METRICS_PORT: i32 = 9402;
const CONFIG_DIR: &str = "/run/spire/config";
const DATA_DIR: &str = "/run/spire/data";
const SOCKET_DIR: &str = "/tmp/spire-server/private";

/// spire-server 资源构建器
pub struct SpireServerResources<'a> {
    server: &'a SpireServer,
    ztwim: &'a ZeroTrustWorkloadIdentityManagerSpec,
    config: &'a OperatorConfig,
    ctx: ObjectContext,
}

impl<'a> SpireServerResources<'a> {
    /// 创建构建器
    pub fn new(
        server: &'a SpireServer,
        ztwim: &'a ZeroTrustWorkloadIdentityManagerSpec,
        config: &'a OperatorConfig,
    ) -> Result<Self> {
        let ctx = ObjectContext::new(
            server,
            &config.operand_namespace,
            SERVER_NAME,
            "control-plane",
            &server.spec.common,
        )?;
        Ok(Self {
            server,
            ztwim,
            config,
            ctx,
        })
    }

    /// 服务账户
    pub fn service_account(&self) -> ServiceAccount {
        self.ctx.service_account(SERVER_NAME)
    }

    /// spire-server 集群角色：PSAT 校验需要 TokenReview
    pub fn server_cluster_role(&self) -> ClusterRole {
        ClusterRole {
            metadata: self.ctx.cluster_meta(SERVER_NAME),
            rules: Some(vec![
                policy_rule(&["authentication.k8s.io"], &["tokenreviews"], &["create"]),
                policy_rule(&[""], &["pods", "nodes"], &["get", "list", "watch"]),
            ]),
            ..Default::default()
        }
    }

    /// spire-server 集群角色绑定
    pub fn server_cluster_role_binding(&self) -> ClusterRoleBinding {
        ClusterRoleBinding {
            metadata: self.ctx.cluster_meta(SERVER_NAME),
            role_ref: role_ref("ClusterRole", SERVER_NAME),
            subjects: Some(vec![self.ctx.service_account_subject(SERVER_NAME)]),
        }
    }

    /// spire-controller-manager 集群角色
    pub fn controller_manager_cluster_role(&self) -> ClusterRole {
        ClusterRole {
            metadata: self.ctx.cluster_meta(CONTROLLER_MANAGER_NAME),
            rules: Some(vec![
                policy_rule(&[""], &["namespaces", "pods", "nodes", "endpoints"], &["get", "list", "watch"]),
                policy_rule(
                    &["admissionregistration.k8s.io"],
                    &["validatingwebhookconfigurations"],
                    &["get", "list", "patch", "watch"],
                ),
                policy_rule(
                    &["spire.spiffe.io"],
                    &["clusterfederatedtrustdomains", "clusterspiffeids", "clusterstaticentries"],
                    &["get", "list", "patch", "update", "watch"],
                ),
                policy_rule(
                    &["spire.spiffe.io"],
                    &[
                        "clusterfederatedtrustdomains/status",
                        "clusterspiffeids/status",
                        "clusterstaticentries/status",
                    ],
                    &["get", "patch", "update"],
                ),
            ]),
            ..Default::default()
        }
    }

    /// spire-controller-manager 集群角色绑定
    pub fn controller_manager_cluster_role_binding(&self) -> ClusterRoleBinding {
        ClusterRoleBinding {
            metadata: self.ctx.cluster_meta(CONTROLLER_MANAGER_NAME),
            role_ref: role_ref("ClusterRole", CONTROLLER_MANAGER_NAME),
            subjects: Some(vec![self.ctx.service_account_subject(SERVER_NAME)]),
        }
    }

    /// 信任包 ConfigMap 的写入权限，同时覆盖 controller-manager 的选主租约
    pub fn bundle_role(&self) -> Role {
        Role {
            metadata: self.ctx.meta(BUNDLE_ROLE_NAME),
            rules: Some(vec![
                PolicyRule {
                    resource_names: Some(vec![self.ztwim.bundle_config_map.clone()]),
                    ..policy_rule(&[""], &["configmaps"], &["get", "patch", "update"])
                },
                policy_rule(
                    &["coordination.k8s.io"],
                    &["leases"],
                    &["create", "get", "list", "patch", "update", "watch", "delete"],
                ),
            ]),
        }
    }

    /// 信任包 RoleBinding
    pub fn bundle_role_binding(&self) -> RoleBinding {
        RoleBinding {
            metadata: self.ctx.meta(BUNDLE_ROLE_NAME),
            role_ref: role_ref("Role", BUNDLE_ROLE_NAME),
            subjects: Some(vec![self.ctx.service_account_subject(SERVER_NAME)]),
        }
    }

    /// agent 连接的 Service
    pub fn service(&self) -> Service {
        Service {
            metadata: self.ctx.meta(SERVER_SERVICE_NAME),
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(selector_labels(SERVER_NAME)),
                ports: Some(vec![ServicePort {
                    name: Some("grpc".to_string()),
                    port: SERVER_SERVICE_PORT,
                    target_port: Some(IntOrString::String("grpc".to_string())),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// 渲染 server.conf 内容
    pub fn server_config(&self) -> Value {
        let spec = &self.server.spec;
        let ns = &self.config.operand_namespace;

        let mut server = json!({
            "audit_log_enabled": false,
            "bind_address": "0.0.0.0",
            "bind_port": SERVER_GRPC_PORT.to_string(),
            "ca_key_type": spec.ca_key_type,
            "ca_ttl": spec.ca_validity,
            "data_dir": DATA_DIR,
            "default_jwt_svid_ttl": spec.default_jwt_validity,
            "default_x509_svid_ttl": spec.default_x509_validity,
            "jwt_issuer": spec.jwt_issuer,
            "log_format": spec.log_format,
            "log_level": spec.log_level,
            "socket_path": format!("{SOCKET_DIR}/api.sock"),
            "trust_domain": self.ztwim.trust_domain,
        });
        if let Some(subject) = &spec.ca_subject {
            server["ca_subject"] = json!([{
                "common_name": subject.common_name,
                "country": non_empty(&subject.country),
                "organization": non_empty(&subject.organization),
            }]);
        }

        let datastore = &spec.datastore;
        json!({
            "server": server,
            "health_checks": {
                "bind_address": "0.0.0.0",
                "bind_port": SERVER_HEALTH_PORT.to_string(),
                "listener_enabled": true,
                "live_path": "/live",
                "ready_path": "/ready",
            },
            "plugins": {
                "DataStore": [{"sql": {"plugin_data": {
                    "database_type": datastore.database_type,
                    "connection_string": datastore.connection_string,
                    "max_open_conns": datastore.max_open_conns,
                    "max_idle_conns": datastore.max_idle_conns,
                    "conn_max_lifetime": format!("{}s", datastore.conn_max_lifetime),
                    "disable_migration": datastore.disable_migration,
                }}}],
                "KeyManager": [{"disk": {"plugin_data": {
                    "keys_path": format!("{DATA_DIR}/keys.json"),
                }}}],
                "NodeAttestor": [{"k8s_psat": {"plugin_data": {
                    "clusters": [{
                        (self.ztwim.cluster_name.clone()): {
                            "service_account_allow_list": [format!("{ns}:{AGENT_NAME}")],
                            "audience": [AGENT_TOKEN_AUDIENCE],
                        }
                    }],
                }}}],
                "Notifier": [{"k8sbundle": {"plugin_data": {
                    "namespace": ns,
                    "config_map": self.ztwim.bundle_config_map,
                }}}],
            },
            "telemetry": {
                "Prometheus": {"host": "0.0.0.0", "port": SERVER_METRICS_PORT.to_string()},
            },
        })
    }

    /// 渲染 spire-controller-manager 配置
    pub fn controller_manager_config(&self) -> Value {
        let ns = &self.config.operand_namespace;
        json!({
            "apiVersion": "spire.spiffe.io/v1alpha1",
            "kind": "ControllerManagerConfig",
            "metadata": {"name": CONTROLLER_MANAGER_NAME},
            "metrics": {"bindAddress": "0.0.0.0:8082"},
            "health": {"healthProbeBindAddress": "0.0.0.0:8083"},
            "leaderElection": {
                "leaderElect": true,
                "resourceName": "98c9c988.spiffe.io",
                "resourceNamespace": ns,
            },
            "validatingWebhookConfigurationName": "spire-controller-manager-webhook",
            "entryIDPrefix": format!("{}.", self.ztwim.cluster_name),
            "clusterName": self.ztwim.cluster_name,
            "trustDomain": self.ztwim.trust_domain,
            "watchClassless": false,
            "className": format!("{ns}-spire"),
            "spireServerSocketPath": format!("{SOCKET_DIR}/api.sock"),
            "ignoreNamespaces": ["kube-system", "kube-public", "openshift-*", ns],
        })
    }

    /// server ConfigMap
    pub fn server_config_map(&self, server_config: &Value) -> Result<ConfigMap> {
        Ok(ConfigMap {
            metadata: self.ctx.meta(SERVER_NAME),
            data: Some(BTreeMap::from([(
                SERVER_CONFIG_FILE.to_string(),
                to_config_json(server_config)?,
            )])),
            ..Default::default()
        })
    }

    /// controller-manager ConfigMap，内容为 YAML
    pub fn controller_manager_config_map(&self, cm_config: &Value) -> Result<ConfigMap> {
        Ok(ConfigMap {
            metadata: self.ctx.meta(CONTROLLER_MANAGER_NAME),
            data: Some(BTreeMap::from([(
                CONTROLLER_MANAGER_CONFIG_FILE.to_string(),
                serde_yaml::to_string(cm_config)?,
            )])),
            ..Default::default()
        })
    }

    /// 信任包 ConfigMap，内容由 k8sbundle notifier 写入，Operator 只负责创建
    pub fn bundle_config_map(&self) -> ConfigMap {
        ConfigMap {
            metadata: self.ctx.meta(&self.ztwim.bundle_config_map),
            ..Default::default()
        }
    }

    /// server StatefulSet
    pub fn stateful_set(&self, server_hash: &str, controller_manager_hash: &str) -> StatefulSet {
        let spec = &self.server.spec;
        let images = &self.config.images;

        let mut server = Container {
            name: SERVER_NAME.to_string(),
            image: Some(images.spire_server.clone()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            args: Some(vec![
                "-config".to_string(),
                format!("{CONFIG_DIR}/{SERVER_CONFIG_FILE}"),
            ]),
            ports: Some(vec![
                container_port("grpc", SERVER_GRPC_PORT),
                container_port("healthz", SERVER_HEALTH_PORT),
                container_port("metrics", SERVER_METRICS_PORT),
            ]),
            liveness_probe: Some(http_probe("/live", "healthz", 15, 60)),
            readiness_probe: Some(http_probe("/ready", "healthz", 5, 5)),
            security_context: Some(restricted_security_context()),
            volume_mounts: Some(vec![
                volume_mount("spire-server-socket", SOCKET_DIR, false),
                volume_mount("spire-config", CONFIG_DIR, true),
                volume_mount("spire-data", DATA_DIR, false),
            ]),
            ..Default::default()
        };

        let controller_manager = Container {
            name: CONTROLLER_MANAGER_NAME.to_string(),
            image: Some(images.spire_controller_manager.clone()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            args: Some(vec![format!(
                "--config={CONTROLLER_MANAGER_CONFIG_FILE}"
            )]),
            ports: Some(vec![
                container_port("https", 9443),
                container_port("cm-healthz", 8083),
                container_port("cm-metrics", 8082),
            ]),
            liveness_probe: Some(http_probe("/healthz", "cm-healthz", 10, 30)),
            readiness_probe: Some(http_probe("/readyz", "cm-healthz", 5, 10)),
            security_context: Some(restricted_security_context()),
            volume_mounts: Some(vec![
                volume_mount("spire-server-socket", SOCKET_DIR, true),
                k8s_openapi::api::core::v1::VolumeMount {
                    sub_path: Some(CONTROLLER_MANAGER_CONFIG_FILE.to_string()),
                    ..volume_mount(
                        "controller-manager-config",
                        &format!("/{CONTROLLER_MANAGER_CONFIG_FILE}"),
                        true,
                    )
                },
            ]),
            ..Default::default()
        };

        let mut pod = PodSpec {
            service_account_name: Some(SERVER_NAME.to_string()),
            share_process_namespace: Some(true),
            volumes: Some(vec![
                config_map_volume("spire-config", SERVER_NAME),
                empty_dir_volume("spire-server-socket"),
                config_map_volume("controller-manager-config", CONTROLLER_MANAGER_NAME),
            ]),
            ..Default::default()
        };
        apply_scheduling(&spec.common, &mut pod, &mut server);
        pod.containers = vec![server, controller_manager];

        let mut pod_labels = self.ctx.labels.clone();
        pod_labels.extend(selector_labels(SERVER_NAME));

        StatefulSet {
            metadata: self.ctx.meta(SERVER_NAME),
            spec: Some(StatefulSetSpec {
                replicas: Some(1),
                service_name: SERVER_SERVICE_NAME.to_string(),
                selector: LabelSelector {
                    match_labels: Some(selector_labels(SERVER_NAME)),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(pod_labels),
                        annotations: Some(BTreeMap::from([
                            (SERVER_CONFIG_HASH_ANNOTATION.to_string(), server_hash.to_string()),
                            (
                                CONTROLLER_MANAGER_CONFIG_HASH_ANNOTATION.to_string(),
                                controller_manager_hash.to_string(),
                            ),
                            (
                                "kubectl.kubernetes.io/default-container".to_string(),
                                SERVER_NAME.to_string(),
                            ),
                        ])),
                        ..Default::default()
                    }),
                    spec: Some(pod),
                },
                volume_claim_templates: Some(vec![self.data_volume_claim()]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn data_volume_claim(&self) -> PersistentVolumeClaim {
        let persistence = &self.server.spec.persistence;
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("spire-data".to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec![persistence.access_mode.clone()]),
                storage_class_name: persistence.storage_class.clone(),
                resources: Some(ResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(persistence.size.clone()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

fn restricted_security_context() -> SecurityContext {
    SecurityContext {
        read_only_root_filesystem: Some(true),
        allow_privilege_escalation: Some(false),
        run_as_non_root: Some(true),
        capabilities: Some(k8s_openapi::api::core::v1::Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn non_empty(value: &str) -> Vec<&str> {
    if value.is_empty() {
        vec![]
    } else {
        vec![value]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::CaSubject;
    use crate::resources::test_support;

    fn build<R>(server: &SpireServer, f: impl FnOnce(&SpireServerResources) -> R) -> R {
        let ztwim = test_support::ztwim();
        let config = test_support::config();
        let resources = SpireServerResources::new(server, &ztwim.spec, &config).unwrap();
        f(&resources)
    }

    #[test]
    fn test_server_config() {
        let server = test_support::spire_server();
        let config = build(&server, |r| r.server_config());

        assert_eq!(config["server"]["trust_domain"], "apps.example.org");
        assert_eq!(config["server"]["jwt_issuer"], "https://oidc-discovery.apps.example.org");
        assert_eq!(config["server"]["ca_ttl"], "24h");
        assert!(config["server"].get("ca_subject").is_none());
        assert_eq!(
            config["plugins"]["DataStore"][0]["sql"]["plugin_data"]["database_type"],
            "sqlite3"
        );
        let clusters = &config["plugins"]["NodeAttestor"][0]["k8s_psat"]["plugin_data"]["clusters"];
        assert_eq!(
            clusters[0]["test-cluster"]["service_account_allow_list"][0],
            "zero-trust-workload-identity-manager:spire-agent"
        );
        assert_eq!(
            config["plugins"]["Notifier"][0]["k8sbundle"]["plugin_data"]["config_map"],
            "spire-bundle"
        );
    }

    #[test]
    fn test_ca_subject_rendering() {
        let mut server = test_support::spire_server();
        server.spec.ca_subject = Some(CaSubject {
            country: "US".to_string(),
            organization: String::new(),
            common_name: "spire".to_string(),
        });
        let config = build(&server, |r| r.server_config());
        let subject = &config["server"]["ca_subject"][0];
        assert_eq!(subject["country"][0], "US");
        assert_eq!(subject["organization"].as_array().unwrap().len(), 0);
        assert_eq!(subject["common_name"], "spire");
    }

    #[test]
    fn test_controller_manager_config_yaml() {
        let server = test_support::spire_server();
        let cm = build(&server, |r| {
            let config = r.controller_manager_config();
            r.controller_manager_config_map(&config).unwrap()
        });
        let yaml = &cm.data.unwrap()[CONTROLLER_MANAGER_CONFIG_FILE];
        let parsed: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(parsed["kind"], "ControllerManagerConfig");
        assert_eq!(parsed["trustDomain"], "apps.example.org");
        assert_eq!(parsed["clusterName"], "test-cluster");
    }

    #[test]
    fn test_bundle_config_map_has_no_data() {
        let server = test_support::spire_server();
        let cm = build(&server, |r| r.bundle_config_map());
        assert_eq!(cm.metadata.name.as_deref(), Some("spire-bundle"));
        assert!(cm.data.is_none());
    }

    #[test]
    fn test_stateful_set() {
        let mut server = test_support::spire_server();
        server.spec.persistence.storage_class = Some("gp3".to_string());
        let sts = build(&server, |r| r.stateful_set("server-hash", "cm-hash"));
        let spec = sts.spec.unwrap();

        assert_eq!(spec.replicas, Some(1));
        let annotations = spec.template.metadata.unwrap().annotations.unwrap();
        assert_eq!(annotations[SERVER_CONFIG_HASH_ANNOTATION], "server-hash");
        assert_eq!(annotations[CONTROLLER_MANAGER_CONFIG_HASH_ANNOTATION], "cm-hash");

        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.containers.len(), 2);
        assert_eq!(pod.containers[1].name, CONTROLLER_MANAGER_NAME);

        let pvc = &spec.volume_claim_templates.unwrap()[0];
        let pvc_spec = pvc.spec.as_ref().unwrap();
        assert_eq!(pvc_spec.storage_class_name.as_deref(), Some("gp3"));
        assert_eq!(
            pvc_spec.resources.as_ref().unwrap().requests.as_ref().unwrap()["storage"],
            Quantity("1Gi".to_string())
        );
    }

    #[test]
    fn test_bundle_role_is_scoped() {
        let server = test_support::spire_server();
        let role = build(&server, |r| r.bundle_role());
        let rules = role.rules.unwrap();
        assert_eq!(rules[0].resource_names.as_ref().unwrap()[0], "spire-bundle");
    }
}
