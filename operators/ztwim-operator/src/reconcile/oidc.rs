//! SpireOIDCDiscoveryProvider 协调

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, DynamicObject};
use tracing::debug;
use ztwim_common::generate_config_hash;

use super::{Context, OperandReconciler, StatusRecorder, WorkloadReadiness};
use crate::crd::{
    SpiffeCSIDriver, SpireOIDCDiscoveryProvider, ZeroTrustWorkloadIdentityManagerSpec,
    DEFAULT_PLUGIN_NAME, SINGLETON_NAME,
};
use crate::error::Result;
use crate::resources::oidc::{cluster_spiffe_id_api_resource, OidcResources, OIDC_NAME};
use crate::resources::route_api_resource;

#[async_trait]
impl OperandReconciler for SpireOIDCDiscoveryProvider {
    fn validate_spec(&self) -> std::result::Result<(), String> {
        self.spec.validate()
    }

    async fn apply_objects(
        &self,
        ztwim: &ZeroTrustWorkloadIdentityManagerSpec,
        ctx: &Context,
        recorder: &mut StatusRecorder,
    ) -> Result<WorkloadReadiness> {
        let drivers: Api<SpiffeCSIDriver> = ctx.cluster();
        let csi_plugin = csi_plugin_name(drivers.get_opt(SINGLETON_NAME).await?.as_ref());
        let resources = OidcResources::new(self, ztwim, &ctx.config, &csi_plugin)?;
        let oidc_config = resources.oidc_config()?;
        let config_hash = generate_config_hash(&oidc_config)?;

        ctx.apply_step(&ctx.namespaced(), resources.service_account(), "ServiceAccountAvailable", recorder)
            .await?;
        ctx.apply_step(&ctx.namespaced(), resources.service(), "ServiceAvailable", recorder)
            .await?;

        let spiffe_ids: Api<DynamicObject> =
            Api::all_with(ctx.client.clone(), &cluster_spiffe_id_api_resource());
        ctx.apply_step(&spiffe_ids, resources.cluster_spiffe_id()?, "ClusterSPIFFEIDAvailable", recorder)
            .await?;

        ctx.apply_step(
            &ctx.namespaced(),
            resources.config_map(&oidc_config)?,
            "ConfigMapAvailable",
            recorder,
        )
        .await?;

        let deployments: Api<Deployment> = ctx.namespaced();
        ctx.apply_step(&deployments, resources.deployment(&config_hash), "DeploymentAvailable", recorder)
            .await?;

        match resources.route()? {
            Some(route) => {
                let routes: Api<DynamicObject> = Api::namespaced_with(
                    ctx.client.clone(),
                    &ctx.config.operand_namespace,
                    &route_api_resource(),
                );
                ctx.apply_step(&routes, route, "RouteAvailable", recorder).await?;
            }
            None => debug!("managedRoute 已关闭，跳过 Route"),
        }

        let deploy = deployments.get(OIDC_NAME).await?;
        Ok(WorkloadReadiness::from_deployment(&deploy))
    }
}

/// SpiffeCSIDriver 注册的插件名称，资源不存在时使用默认值
fn csi_plugin_name(driver: Option<&SpiffeCSIDriver>) -> String {
    driver
        .map(|d| d.spec.plugin_name.clone())
        .unwrap_or_else(|| DEFAULT_PLUGIN_NAME.to_string())
}
