//! SpiffeCSIDriver 协调

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use kube::api::{Api, DynamicObject};

use super::{Context, OperandReconciler, StatusRecorder, WorkloadReadiness};
use crate::crd::{SpiffeCSIDriver, ZeroTrustWorkloadIdentityManagerSpec};
use crate::error::Result;
use crate::resources::csi_driver::{CsiDriverResources, CSI_NAME};
use crate::resources::scc_api_resource;

#[async_trait]
impl OperandReconciler for SpiffeCSIDriver {
    fn validate_spec(&self) -> std::result::Result<(), String> {
        self.spec.validate()
    }

    // CSI 驱动不依赖信任域，顶层资源只作为存在性前提
    async fn apply_objects(
        &self,
        _ztwim: &ZeroTrustWorkloadIdentityManagerSpec,
        ctx: &Context,
        recorder: &mut StatusRecorder,
    ) -> Result<WorkloadReadiness> {
        let resources = CsiDriverResources::new(self, &ctx.config)?;
        let scc_api: Api<DynamicObject> = Api::all_with(ctx.client.clone(), &scc_api_resource());

        ctx.apply_step(&ctx.namespaced(), resources.service_account(), "ServiceAccountAvailable", recorder)
            .await?;
        ctx.apply_step(&ctx.cluster(), resources.csi_driver(), "CSIDriverAvailable", recorder)
            .await?;
        ctx.apply_step(&scc_api, resources.scc(), "SecurityContextConstraintsAvailable", recorder)
            .await?;

        let daemon_sets: Api<DaemonSet> = ctx.namespaced();
        ctx.apply_step(&daemon_sets, resources.daemon_set(), "DaemonSetAvailable", recorder)
            .await?;

        let ds = daemon_sets.get(CSI_NAME).await?;
        Ok(WorkloadReadiness::from_daemon_set(&ds))
    }
}
