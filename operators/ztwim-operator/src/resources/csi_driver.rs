//! spiffe-csi-driver 资源构建

use k8s_openapi::api::apps::v1::{
    DaemonSet, DaemonSetSpec, DaemonSetUpdateStrategy, RollingUpdateDaemonSet,
};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, PodSpec, PodTemplateSpec, SecurityContext, ServiceAccount, VolumeMount,
};
use k8s_openapi::api::storage::v1::{CSIDriver, CSIDriverSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::DynamicObject;
use std::collections::BTreeMap;

use super::{
    apply_scheduling, host_path_volume, node_name_env, selector_labels, volume_mount,
    ObjectContext,
};
use crate::config::OperatorConfig;
use crate::crd::SpiffeCSIDriver;
use crate::error::Result;

/// ServiceAccount / SCC / DaemonSet 共用的名称
pub const CSI_NAME: &str = "spire-spiffe-csi-driver";

const KUBELET_PLUGIN_DIR: &str = "/var/lib/kubelet/plugins";
const KUBELET_REGISTRY_DIR: &str = "/var/lib/kubelet/plugins_registry";
const KUBELET_PODS_DIR: &str = "/var/lib/kubelet/pods";
const AGENT_SOCKET_MOUNT: &str = "/spire-agent-socket";
const CSI_SOCKET_MOUNT: &str = "/spiffe-csi";

/// CSI 驱动资源构建器
pub struct CsiDriverResources<'a> {
    driver: &'a SpiffeCSIDriver,
    config: &'a OperatorConfig,
    ctx: ObjectContext,
}

impl<'a> CsiDriverResources<'a> {
    /// 创建构建器
    pub fn new(driver: &'a SpiffeCSIDriver, config: &'a OperatorConfig) -> Result<Self> {
        let ctx = ObjectContext::new(
            driver,
            &config.operand_namespace,
            CSI_NAME,
            "csi",
            &driver.spec.common,
        )?;
        Ok(Self {
            driver,
            config,
            ctx,
        })
    }

    /// 服务账户
    pub fn service_account(&self) -> ServiceAccount {
        self.ctx.service_account(CSI_NAME)
    }

    /// 特权 SCC：CSI 驱动需要双向挂载传播
    pub fn scc(&self) -> DynamicObject {
        self.ctx.scc(CSI_NAME, CSI_NAME, true)
    }

    /// CSIDriver 对象，名称即插件名
    pub fn csi_driver(&self) -> CSIDriver {
        CSIDriver {
            metadata: self.ctx.cluster_meta(&self.driver.spec.plugin_name),
            spec: CSIDriverSpec {
                attach_required: Some(false),
                pod_info_on_mount: Some(true),
                fs_group_policy: Some("None".to_string()),
                volume_lifecycle_modes: Some(vec!["Ephemeral".to_string()]),
                ..Default::default()
            },
        }
    }

    fn plugin_dir(&self) -> String {
        format!("{KUBELET_PLUGIN_DIR}/{}", self.driver.spec.plugin_name)
    }

    /// 驱动 DaemonSet
    pub fn daemon_set(&self) -> DaemonSet {
        let spec = &self.driver.spec;
        let images = &self.config.images;
        let plugin_dir = self.plugin_dir();

        // 在 SELinux 节点上放开 agent socket 目录的标签，使工作负载可访问
        let init = Container {
            name: "set-context".to_string(),
            image: Some(images.spiffe_csi_init.clone()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            command: Some(vec!["chcon".to_string()]),
            args: Some(vec![
                "-Rvt".to_string(),
                "container_file_t".to_string(),
                "spire-agent-socket/".to_string(),
            ]),
            security_context: Some(privileged_context()),
            volume_mounts: Some(vec![volume_mount(
                "spire-agent-socket-dir",
                "/spire-agent-socket",
                false,
            )]),
            ..Default::default()
        };

        let mut driver = Container {
            name: "spiffe-csi-driver".to_string(),
            image: Some(images.spiffe_csi_driver.clone()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            args: Some(vec![
                "-workload-api-socket-dir".to_string(),
                AGENT_SOCKET_MOUNT.to_string(),
                "-plugin-name".to_string(),
                spec.plugin_name.clone(),
                "-csi-socket-path".to_string(),
                format!("{CSI_SOCKET_MOUNT}/csi.sock"),
            ]),
            env: Some(vec![node_name_env("MY_NODE_NAME")]),
            security_context: Some(SecurityContext {
                read_only_root_filesystem: Some(true),
                ..privileged_context()
            }),
            volume_mounts: Some(vec![
                volume_mount("spire-agent-socket-dir", AGENT_SOCKET_MOUNT, true),
                volume_mount("spiffe-csi-socket-dir", CSI_SOCKET_MOUNT, false),
                VolumeMount {
                    mount_propagation: Some("Bidirectional".to_string()),
                    ..volume_mount("mountpoint-dir", KUBELET_PODS_DIR, false)
                },
            ]),
            ..Default::default()
        };

        let registrar = Container {
            name: "node-driver-registrar".to_string(),
            image: Some(images.node_driver_registrar.clone()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            args: Some(vec![
                format!("-csi-address={CSI_SOCKET_MOUNT}/csi.sock"),
                format!("-kubelet-registration-path={plugin_dir}/csi.sock"),
                "-health-port=9809".to_string(),
            ]),
            env: Some(vec![EnvVar {
                name: "ADDRESS".to_string(),
                value: Some(format!("{CSI_SOCKET_MOUNT}/csi.sock")),
                ..Default::default()
            }]),
            volume_mounts: Some(vec![
                volume_mount("spiffe-csi-socket-dir", CSI_SOCKET_MOUNT, false),
                volume_mount("kubelet-plugin-registration-dir", "/registration", false),
            ]),
            ..Default::default()
        };

        let mut pod = PodSpec {
            service_account_name: Some(CSI_NAME.to_string()),
            init_containers: Some(vec![init]),
            volumes: Some(vec![
                host_path_volume("spire-agent-socket-dir", &spec.agent_socket_path, "DirectoryOrCreate"),
                host_path_volume("spiffe-csi-socket-dir", &plugin_dir, "DirectoryOrCreate"),
                host_path_volume("kubelet-plugin-registration-dir", KUBELET_REGISTRY_DIR, "Directory"),
                host_path_volume("mountpoint-dir", KUBELET_PODS_DIR, "Directory"),
            ]),
            ..Default::default()
        };
        apply_scheduling(&spec.common, &mut pod, &mut driver);
        pod.containers = vec![driver, registrar];

        let mut pod_labels = self.ctx.labels.clone();
        pod_labels.extend(selector_labels(CSI_NAME));

        DaemonSet {
            metadata: self.ctx.meta(CSI_NAME),
            spec: Some(DaemonSetSpec {
                selector: LabelSelector {
                    match_labels: Some(selector_labels(CSI_NAME)),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(pod_labels),
                        annotations: Some(BTreeMap::from([(
                            "kubectl.kubernetes.io/default-container".to_string(),
                            "spiffe-csi-driver".to_string(),
                        )])),
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

fn privileged_context() -> SecurityContext {
    SecurityContext {
        privileged: Some(true),
        ..Default::default()
    }
}
