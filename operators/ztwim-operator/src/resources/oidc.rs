//! spire-oidc-discovery-provider 资源构建

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    CSIVolumeSource, ConfigMap, Container, PodSpec, PodTemplateSpec, SecretVolumeSource,
    SecurityContext, Service, ServiceAccount, ServicePort, ServiceSpec, Volume,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::DynamicObject;
use kube::core::{ApiResource, GroupVersionKind};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use ztwim_common::SpiffeId;

use super::spire_agent::container_port;
use super::{
    apply_scheduling, config_map_volume, http_probe, route_api_resource, selector_labels,
    to_config_json, volume_mount, ObjectContext, LABEL_NAME,
};
use crate::config::OperatorConfig;
use crate::crd::{SpireOIDCDiscoveryProvider, ZeroTrustWorkloadIdentityManagerSpec};
use crate::error::{OperatorError, Result};

/// ServiceAccount / Service / ConfigMap / Deployment 共用的名称
pub const OIDC_NAME: &str = "spire-spiffe-oidc-discovery-provider";
/// Route 名称
pub const OIDC_ROUTE_NAME: &str = "spire-oidc-discovery-provider";
/// ClusterSPIFFEID 名称
pub const OIDC_CLUSTER_SPIFFE_ID_NAME: &str = "zero-trust-workload-identity-manager-spire-oidc-discovery-provider";
/// 配置哈希注解
pub const OIDC_CONFIG_HASH_ANNOTATION: &str =
    "ztwim.openshift.io/spire-oidc-discovery-provider-config-hash";
/// 配置文件名
pub const OIDC_CONFIG_FILE: &str = "oidc-discovery-provider.conf";
/// 服务证书 Secret 名称
pub const OIDC_SERVING_CERT_SECRET: &str = "oidc-serving-cert";
/// OpenShift 服务证书注解
pub const SERVING_CERT_ANNOTATION: &str = "service.beta.openshift.io/serving-cert-secret-name";

const HTTPS_PORT: i32 = 8443;
const HEALTH_PORT: i32 = 8008;
const CONFIG_DIR: &str = "/run/spire/oidc/config";
const TLS_DIR: &str = "/etc/oidc/tls";
const WORKLOAD_API_DIR: &str = "/spiffe-workload-api";

/// OIDC 发现服务资源构建器
pub struct OidcResources<'a> {
    oidc: &'a SpireOIDCDiscoveryProvider,
    ztwim: &'a ZeroTrustWorkloadIdentityManagerSpec,
    config: &'a OperatorConfig,
    csi_plugin: &'a str,
    ctx: ObjectContext,
}

impl<'a> OidcResources<'a> {
    /// 创建构建器
    ///
    /// `csi_plugin` 是 SpiffeCSIDriver 注册的插件名称，Pod 通过它挂载 Workload API。
    pub fn new(
        oidc: &'a SpireOIDCDiscoveryProvider,
        ztwim: &'a ZeroTrustWorkloadIdentityManagerSpec,
        config: &'a OperatorConfig,
        csi_plugin: &'a str,
    ) -> Result<Self> {
        let ctx = ObjectContext::new(
            oidc,
            &config.operand_namespace,
            OIDC_NAME,
            "discovery",
            &oidc.spec.common,
        )?;
        Ok(Self {
            oidc,
            ztwim,
            config,
            csi_plugin,
            ctx,
        })
    }

    /// 服务账户
    pub fn service_account(&self) -> ServiceAccount {
        self.ctx.service_account(OIDC_NAME)
    }

    /// Service，由 OpenShift service-ca 签发服务证书
    pub fn service(&self) -> Service {
        let mut metadata = self.ctx.meta(OIDC_NAME);
        metadata.annotations = Some(BTreeMap::from([(
            SERVING_CERT_ANNOTATION.to_string(),
            OIDC_SERVING_CERT_SECRET.to_string(),
        )]));

        Service {
            metadata,
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(selector_labels(OIDC_NAME)),
                ports: Some(vec![ServicePort {
                    name: Some("https".to_string()),
                    port: 443,
                    target_port: Some(IntOrString::String("https".to_string())),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// 为发现服务签发身份的 ClusterSPIFFEID
    pub fn cluster_spiffe_id(&self) -> Result<DynamicObject> {
        let ns = &self.config.operand_namespace;
        let id = SpiffeId::for_service_account(&self.ztwim.trust_domain, ns, OIDC_NAME)?;

        let mut object = DynamicObject::new(OIDC_CLUSTER_SPIFFE_ID_NAME, &cluster_spiffe_id_api_resource());
        object.metadata = self.ctx.cluster_meta(OIDC_CLUSTER_SPIFFE_ID_NAME);
        object.data = json!({
            "spec": {
                "className": format!("{ns}-spire"),
                "spiffeIDTemplate": id.uri(),
                "dnsNameTemplates": [
                    format!("{OIDC_NAME}.{ns}.svc"),
                    issuer_host(&self.oidc.spec.jwt_issuer)?,
                ],
                "podSelector": {"matchLabels": {LABEL_NAME: OIDC_NAME}},
                "namespaceSelector": {
                    "matchLabels": {"kubernetes.io/metadata.name": ns},
                },
            }
        });
        Ok(object)
    }

    /// 渲染发现服务配置
    pub fn oidc_config(&self) -> Result<Value> {
        let spec = &self.oidc.spec;
        let ns = &self.config.operand_namespace;
        let host = issuer_host(&spec.jwt_issuer)?;

        let mut domains = vec![
            OIDC_NAME.to_string(),
            format!("{OIDC_NAME}.{ns}"),
            format!("{OIDC_NAME}.{ns}.svc.cluster.local"),
        ];
        if !domains.contains(&host) {
            domains.push(host);
        }

        Ok(json!({
            "domains": domains,
            "health_checks": {
                "bind_port": HEALTH_PORT.to_string(),
                "live_path": "/live",
                "ready_path": "/ready",
            },
            "log_level": spec.log_level,
            "serving_cert_file": {
                "addr": format!(":{HTTPS_PORT}"),
                "cert_file_path": format!("{TLS_DIR}/tls.crt"),
                "key_file_path": format!("{TLS_DIR}/tls.key"),
            },
            "workload_api": {
                "socket_path": format!("{WORKLOAD_API_DIR}/{}", spec.agent_socket_name),
                "trust_domain": self.ztwim.trust_domain,
            },
        }))
    }

    /// ConfigMap
    pub fn config_map(&self, oidc_config: &Value) -> Result<ConfigMap> {
        Ok(ConfigMap {
            metadata: self.ctx.meta(OIDC_NAME),
            data: Some(BTreeMap::from([(
                OIDC_CONFIG_FILE.to_string(),
                to_config_json(oidc_config)?,
            )])),
            ..Default::default()
        })
    }

    /// Deployment，`config_hash` 写入 Pod 模板注解
    pub fn deployment(&self, config_hash: &str) -> Deployment {
        let spec = &self.oidc.spec;

        let mut container = Container {
            name: OIDC_NAME.to_string(),
            image: Some(self.config.images.spire_oidc_discovery_provider.clone()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            args: Some(vec![
                "-config".to_string(),
                format!("{CONFIG_DIR}/{OIDC_CONFIG_FILE}"),
            ]),
            ports: Some(vec![
                container_port("https", HTTPS_PORT),
                container_port("healthz", HEALTH_PORT),
            ]),
            liveness_probe: Some(http_probe("/live", "healthz", 5, 5)),
            readiness_probe: Some(http_probe("/ready", "healthz", 5, 5)),
            security_context: Some(SecurityContext {
                read_only_root_filesystem: Some(true),
                allow_privilege_escalation: Some(false),
                run_as_non_root: Some(true),
                ..Default::default()
            }),
            volume_mounts: Some(vec![
                volume_mount("spiffe-workload-api", WORKLOAD_API_DIR, true),
                volume_mount("spire-oidc-config", CONFIG_DIR, true),
                volume_mount("tls-certs", TLS_DIR, true),
            ]),
            ..Default::default()
        };

        let mut pod = PodSpec {
            service_account_name: Some(OIDC_NAME.to_string()),
            volumes: Some(vec![
                Volume {
                    name: "spiffe-workload-api".to_string(),
                    csi: Some(CSIVolumeSource {
                        driver: self.csi_plugin.to_string(),
                        read_only: Some(true),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                config_map_volume("spire-oidc-config", OIDC_NAME),
                Volume {
                    name: "tls-certs".to_string(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some(OIDC_SERVING_CERT_SECRET.to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        };
        apply_scheduling(&spec.common, &mut pod, &mut container);
        pod.containers = vec![container];

        let mut pod_labels = self.ctx.labels.clone();
        pod_labels.extend(selector_labels(OIDC_NAME));

        Deployment {
            metadata: self.ctx.meta(OIDC_NAME),
            spec: Some(DeploymentSpec {
                replicas: Some(spec.replica_count),
                selector: LabelSelector {
                    match_labels: Some(selector_labels(OIDC_NAME)),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(pod_labels),
                        annotations: Some(BTreeMap::from([(
                            OIDC_CONFIG_HASH_ANNOTATION.to_string(),
                            config_hash.to_string(),
                        )])),
                        ..Default::default()
                    }),
                    spec: Some(pod),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// 对外暴露发现端点的 Route，仅在 `managedRoute` 开启时生成
    pub fn route(&self) -> Result<Option<DynamicObject>> {
        if !self.oidc.spec.managed_route {
            return Ok(None);
        }

        let mut route = DynamicObject::new(OIDC_ROUTE_NAME, &route_api_resource());
        route.metadata = self.ctx.meta(OIDC_ROUTE_NAME);
        route.data = json!({
            "spec": {
                "host": issuer_host(&self.oidc.spec.jwt_issuer)?,
                "port": {"targetPort": "https"},
                "tls": {
                    "termination": "reencrypt",
                    "insecureEdgeTerminationPolicy": "Redirect",
                },
                "to": {"kind": "Service", "name": OIDC_NAME, "weight": 100},
                "wildcardPolicy": "None",
            }
        });
        Ok(Some(route))
    }
}

/// ClusterSPIFFEID 的 API 资源描述
pub fn cluster_spiffe_id_api_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("spire.spiffe.io", "v1alpha1", "ClusterSPIFFEID"),
        "clusterspiffeids",
    )
}

fn issuer_host(issuer: &str) -> Result<String> {
    url::Url::parse(issuer)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .ok_or_else(|| OperatorError::InvalidSpec(format!("jwtIssuer: no host in {issuer:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::DEFAULT_PLUGIN_NAME;
    use crate::resources::test_support;

    fn build<R>(oidc: &SpireOIDCDiscoveryProvider, f: impl FnOnce(&OidcResources) -> R) -> R {
        build_with_plugin(oidc, DEFAULT_PLUGIN_NAME, f)
    }

    fn build_with_plugin<R>(
        oidc: &SpireOIDCDiscoveryProvider,
        plugin: &str,
        f: impl FnOnce(&OidcResources) -> R,
    ) -> R {
        let ztwim = test_support::ztwim();
        let config = test_support::config();
        let resources = OidcResources::new(oidc, &ztwim.spec, &config, plugin).unwrap();
        f(&resources)
    }

    #[test]
    fn test_oidc_config() {
        let oidc = test_support::oidc();
        let config = build(&oidc, |r| r.oidc_config().unwrap());
        let domains: Vec<&str> = config["domains"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert!(domains.contains(&"oidc-discovery.apps.example.org"));
        assert!(domains.contains(&OIDC_NAME));
        assert_eq!(
            config["workload_api"]["socket_path"],
            "/spiffe-workload-api/spire-agent.sock"
        );
        assert_eq!(config["serving_cert_file"]["cert_file_path"], "/etc/oidc/tls/tls.crt");
    }

    #[test]
    fn test_service_serving_cert_annotation() {
        let oidc = test_support::oidc();
        let svc = build(&oidc, |r| r.service());
        assert_eq!(
            svc.metadata.annotations.unwrap()[SERVING_CERT_ANNOTATION],
            OIDC_SERVING_CERT_SECRET
        );
    }

    #[test]
    fn test_deployment_replicas_and_csi_volume() {
        let mut oidc = test_support::oidc();
        oidc.spec.replica_count = 3;
        let deploy = build(&oidc, |r| r.deployment("h1"));
        let spec = deploy.spec.unwrap();
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(
            spec.template.metadata.unwrap().annotations.unwrap()[OIDC_CONFIG_HASH_ANNOTATION],
            "h1"
        );
        let volumes = spec.template.spec.unwrap().volumes.unwrap();
        let csi = volumes.iter().find_map(|v| v.csi.as_ref()).unwrap();
        assert_eq!(csi.driver, "csi.spiffe.io");
    }

    #[test]
    fn test_deployment_uses_csi_plugin_name() {
        let oidc = test_support::oidc();
        let deploy = build_with_plugin(&oidc, "workload.example.io", |r| r.deployment("h1"));
        let volumes = deploy.spec.unwrap().template.spec.unwrap().volumes.unwrap();
        let csi = volumes.iter().find_map(|v| v.csi.as_ref()).unwrap();
        assert_eq!(csi.driver, "workload.example.io");
    }

    #[test]
    fn test_route_host_and_toggle() {
        let mut oidc = test_support::oidc();
        let route = build(&oidc, |r| r.route().unwrap()).unwrap();
        assert_eq!(route.data["spec"]["host"], "oidc-discovery.apps.example.org");
        assert_eq!(route.data["spec"]["tls"]["termination"], "reencrypt");
        assert_eq!(route.metadata.name.as_deref(), Some(OIDC_ROUTE_NAME));

        oidc.spec.managed_route = false;
        assert!(build(&oidc, |r| r.route().unwrap()).is_none());
    }

    #[test]
    fn test_cluster_spiffe_id() {
        let oidc = test_support::oidc();
        let object = build(&oidc, |r| r.cluster_spiffe_id().unwrap());
        assert_eq!(
            object.data["spec"]["spiffeIDTemplate"],
            "spiffe://apps.example.org/ns/zero-trust-workload-identity-manager/sa/spire-spiffe-oidc-discovery-provider"
        );
        assert!(object.metadata.namespace.is_none());
    }
}
