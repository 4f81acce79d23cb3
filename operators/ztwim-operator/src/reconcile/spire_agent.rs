//! SpireAgent 协调

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use kube::api::{Api, DynamicObject};
use ztwim_common::generate_config_hash;

use super::{Context, OperandReconciler, StatusRecorder, WorkloadReadiness};
use crate::crd::{SpireAgent, ZeroTrustWorkloadIdentityManagerSpec};
use crate::error::Result;
use crate::resources::scc_api_resource;
use crate::resources::spire_agent::{SpireAgentResources, AGENT_NAME};

#[async_trait]
impl OperandReconciler for SpireAgent {
    fn validate_spec(&self) -> std::result::Result<(), String> {
        self.spec.validate()
    }

    async fn apply_objects(
        &self,
        ztwim: &ZeroTrustWorkloadIdentityManagerSpec,
        ctx: &Context,
        recorder: &mut StatusRecorder,
    ) -> Result<WorkloadReadiness> {
        let resources = SpireAgentResources::new(self, ztwim, &ctx.config)?;
        let config_hash = generate_config_hash(&resources.agent_config())?;
        let scc_api: Api<DynamicObject> = Api::all_with(ctx.client.clone(), &scc_api_resource());

        ctx.apply_step(&ctx.namespaced(), resources.service_account(), "ServiceAccountAvailable", recorder)
            .await?;
        ctx.apply_step(&ctx.cluster(), resources.cluster_role(), "ClusterRoleAvailable", recorder)
            .await?;
        ctx.apply_step(
            &ctx.cluster(),
            resources.cluster_role_binding(),
            "ClusterRoleBindingAvailable",
            recorder,
        )
        .await?;
        ctx.apply_step(&ctx.namespaced(), resources.service(), "ServiceAvailable", recorder)
            .await?;
        ctx.apply_step(&ctx.namespaced(), resources.config_map()?, "ConfigMapAvailable", recorder)
            .await?;
        ctx.apply_step(&scc_api, resources.scc(), "SecurityContextConstraintsAvailable", recorder)
            .await?;

        let daemon_sets: Api<DaemonSet> = ctx.namespaced();
        ctx.apply_step(&daemon_sets, resources.daemon_set(&config_hash), "DaemonSetAvailable", recorder)
            .await?;

        let ds = daemon_sets.get(AGENT_NAME).await?;
        Ok(WorkloadReadiness::from_daemon_set(&ds))
    }
}
