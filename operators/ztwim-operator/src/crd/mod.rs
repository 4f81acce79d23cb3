//! 自定义资源定义模块
//!
//! 该模块定义 Operator 管理的全部自定义资源：顶层的
//! `ZeroTrustWorkloadIdentityManager` 以及四个组件资源
//! （SpireServer、SpireAgent、SpireOIDCDiscoveryProvider、SpiffeCSIDriver）。
//! 所有资源都是集群级单例，只处理名为 `cluster` 的对象。

pub mod common;
pub mod csi_driver;
pub mod oidc;
pub mod spire_agent;
pub mod spire_server;
pub mod ztwim;

pub use common::{CommonConfig, ConditionalStatus, Operand, OperandStatus, SINGLETON_NAME};
pub use csi_driver::{SpiffeCSIDriver, SpiffeCSIDriverSpec, DEFAULT_PLUGIN_NAME};
pub use oidc::{SpireOIDCDiscoveryProvider, SpireOIDCDiscoveryProviderSpec};
pub use spire_agent::{
    NodeAttestor, SpireAgent, SpireAgentSpec, VerificationType, WorkloadAttestors,
    WorkloadAttestorsVerification,
};
pub use spire_server::{CaSubject, Datastore, Persistence, SpireServer, SpireServerSpec};
pub use ztwim::{
    ZeroTrustWorkloadIdentityManager, ZeroTrustWorkloadIdentityManagerSpec,
    ZeroTrustWorkloadIdentityManagerStatus,
};

use kube::CustomResourceExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

/// 全部 CRD，用于安装清单输出
pub fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![
        ZeroTrustWorkloadIdentityManager::crd(),
        SpireServer::crd(),
        SpireAgent::crd(),
        SpireOIDCDiscoveryProvider::crd(),
        SpiffeCSIDriver::crd(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crds_are_cluster_scoped() {
        for crd in all_crds() {
            assert_eq!(crd.spec.group, "operator.openshift.io");
            assert_eq!(crd.spec.scope, "Cluster");
            assert_eq!(crd.spec.versions[0].name, "v1alpha1");
            assert!(crd.spec.versions[0].subresources.is_some());
        }
    }
}
