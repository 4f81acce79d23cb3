//! SpireServer 协调

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::api::Api;
use ztwim_common::generate_config_hash;

use super::{Context, OperandReconciler, StatusRecorder, WorkloadReadiness};
use crate::crd::{SpireServer, ZeroTrustWorkloadIdentityManagerSpec};
use crate::error::Result;
use crate::resources::spire_server::{SpireServerResources, SERVER_NAME};

#[async_trait]
impl OperandReconciler for SpireServer {
    fn validate_spec(&self) -> std::result::Result<(), String> {
        self.spec.validate()
    }

    async fn apply_objects(
        &self,
        ztwim: &ZeroTrustWorkloadIdentityManagerSpec,
        ctx: &Context,
        recorder: &mut StatusRecorder,
    ) -> Result<WorkloadReadiness> {
        let resources = SpireServerResources::new(self, ztwim, &ctx.config)?;
        let server_config = resources.server_config();
        let cm_config = resources.controller_manager_config();
        let server_hash = generate_config_hash(&server_config)?;
        let cm_hash = generate_config_hash(&cm_config)?;

        ctx.apply_step(&ctx.namespaced(), resources.service_account(), "ServiceAccountAvailable", recorder)
            .await?;
        ctx.apply_step(&ctx.cluster(), resources.server_cluster_role(), "ClusterRoleAvailable", recorder)
            .await?;
        ctx.apply_step(
            &ctx.cluster(),
            resources.server_cluster_role_binding(),
            "ClusterRoleBindingAvailable",
            recorder,
        )
        .await?;
        ctx.apply_step(
            &ctx.cluster(),
            resources.controller_manager_cluster_role(),
            "ControllerManagerClusterRoleAvailable",
            recorder,
        )
        .await?;
        ctx.apply_step(
            &ctx.cluster(),
            resources.controller_manager_cluster_role_binding(),
            "ControllerManagerClusterRoleBindingAvailable",
            recorder,
        )
        .await?;
        ctx.apply_step(&ctx.namespaced(), resources.bundle_role(), "BundleRoleAvailable", recorder)
            .await?;
        ctx.apply_step(
            &ctx.namespaced(),
            resources.bundle_role_binding(),
            "BundleRoleBindingAvailable",
            recorder,
        )
        .await?;
        ctx.apply_step(&ctx.namespaced(), resources.service(), "ServiceAvailable", recorder)
            .await?;
        ctx.apply_step(
            &ctx.namespaced(),
            resources.server_config_map(&server_config)?,
            "ConfigMapAvailable",
            recorder,
        )
        .await?;
        ctx.apply_step(
            &ctx.namespaced(),
            resources.controller_manager_config_map(&cm_config)?,
            "ControllerManagerConfigMapAvailable",
            recorder,
        )
        .await?;
        ctx.apply_step(&ctx.namespaced(), resources.bundle_config_map(), "BundleConfigMapAvailable", recorder)
            .await?;

        let stateful_sets: Api<StatefulSet> = ctx.namespaced();
        ctx.apply_step(
            &stateful_sets,
            resources.stateful_set(&server_hash, &cm_hash),
            "StatefulSetAvailable",
            recorder,
        )
        .await?;

        let sts = stateful_sets.get(SERVER_NAME).await?;
        Ok(WorkloadReadiness::from_stateful_set(&sts))
    }
}
