//! 控制器模块
//!
//! 为每种自定义资源启动一个 kube-runtime 控制器，并发运行：
//! 四个组件控制器分别监听自己生成的对象，顶层控制器监听全部组件资源，
//! 任何组件变化都会触发顶层状态重新汇总。

use futures::{future, StreamExt};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Service, ServiceAccount};
use kube::{
    api::{Api, ListParams},
    client::Client,
    runtime::{controller::Controller as KubeController, reflector::ObjectRef, watcher},
    Resource,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::crd::{
    SpiffeCSIDriver, SpireAgent, SpireOIDCDiscoveryProvider, SpireServer,
    ZeroTrustWorkloadIdentityManager, SINGLETON_NAME,
};
use crate::error::Result;
use crate::metrics::Readiness;
use crate::reconcile::{self, error_policy, reconcile_operand, Context, OperandReconciler};
use crate::resources::managed_by_selector;

/// 就绪检查失败后的重试间隔
const READINESS_RETRY: Duration = Duration::from_secs(5);

/// 子对象的控制者若是 `K`，映射到单例 `K`
fn owning_operand<K, C>(child: C) -> Option<ObjectRef<K>>
where
    K: Resource<DynamicType = ()>,
    C: Resource,
{
    let kind = K::kind(&());
    child
        .meta()
        .owner_references
        .as_ref()?
        .iter()
        .any(|owner| owner.kind == kind && owner.name == SINGLETON_NAME)
        .then(|| ObjectRef::new(SINGLETON_NAME))
}

/// 任意事件都映射到单例
fn singleton<K, C>(_: C) -> Option<ObjectRef<K>>
where
    K: Resource<DynamicType = ()>,
{
    Some(ObjectRef::new(SINGLETON_NAME))
}

/// 五种自定义资源都能被列出，说明 CRD 已安装且 RBAC 已生效
pub async fn crd_apis_served(client: &Client) -> Result<()> {
    let params = ListParams::default().limit(1);
    Api::<ZeroTrustWorkloadIdentityManager>::all(client.clone())
        .list(&params)
        .await?;
    Api::<SpireServer>::all(client.clone()).list(&params).await?;
    Api::<SpireAgent>::all(client.clone()).list(&params).await?;
    Api::<SpireOIDCDiscoveryProvider>::all(client.clone())
        .list(&params)
        .await?;
    Api::<SpiffeCSIDriver>::all(client.clone()).list(&params).await?;
    Ok(())
}

/// 控制器依赖的 API 可用后标记就绪
pub async fn mark_ready_when_served(client: Client, readiness: Readiness) {
    loop {
        match crd_apis_served(&client).await {
            Ok(()) => {
                readiness.set_ready();
                info!("自定义资源 API 可用，已标记就绪");
                return;
            }
            Err(e) => {
                warn!(error = %e, "自定义资源 API 暂不可用");
                tokio::time::sleep(READINESS_RETRY).await;
            }
        }
    }
}

/// 控制器集合
pub struct Controller {
    /// Kubernetes 客户端
    client: Client,
    /// 共享上下文
    ctx: Arc<Context>,
}

impl Controller {
    /// 创建控制器集合
    pub fn new(client: Client, ctx: Arc<Context>) -> Self {
        Self { client, ctx }
    }

    /// 并发运行全部控制器，收到终止信号后返回
    pub async fn run(&self) {
        info!(
            namespace = %self.ctx.config.operand_namespace,
            create_only = self.ctx.config.create_only_mode,
            "启动 ZTWIM 控制器"
        );

        future::join5(
            self.run_operand::<SpireServer>(),
            self.run_operand::<SpireAgent>(),
            self.run_operand::<SpireOIDCDiscoveryProvider>(),
            self.run_operand::<SpiffeCSIDriver>(),
            self.run_ztwim(),
        )
        .await;

        info!("ZTWIM 控制器已停止");
    }

    /// 组件控制器：监听组件资源、顶层资源以及组件命名空间中的生成对象
    async fn run_operand<K: OperandReconciler>(&self) {
        let client = self.client.clone();
        let namespace = &self.ctx.config.operand_namespace;
        let owned = watcher::Config::default().labels(&managed_by_selector());

        info!(operand = K::OPERAND, "启动组件控制器");
        KubeController::new(Api::<K>::all(client.clone()), watcher::Config::default())
            .watches(
                Api::<ZeroTrustWorkloadIdentityManager>::all(client.clone()),
                watcher::Config::default(),
                singleton::<K, ZeroTrustWorkloadIdentityManager>,
            )
            .watches(
                Api::<ConfigMap>::namespaced(client.clone(), namespace),
                owned.clone(),
                owning_operand::<K, ConfigMap>,
            )
            .watches(
                Api::<Service>::namespaced(client.clone(), namespace),
                owned.clone(),
                owning_operand::<K, Service>,
            )
            .watches(
                Api::<ServiceAccount>::namespaced(client.clone(), namespace),
                owned.clone(),
                owning_operand::<K, ServiceAccount>,
            )
            .watches(
                Api::<DaemonSet>::namespaced(client.clone(), namespace),
                owned.clone(),
                owning_operand::<K, DaemonSet>,
            )
            .watches(
                Api::<StatefulSet>::namespaced(client.clone(), namespace),
                owned.clone(),
                owning_operand::<K, StatefulSet>,
            )
            .watches(
                Api::<Deployment>::namespaced(client.clone(), namespace),
                owned,
                owning_operand::<K, Deployment>,
            )
            .shutdown_on_signal()
            .run(reconcile_operand::<K>, error_policy::<K>, self.ctx.clone())
            .for_each(|result| async move {
                match result {
                    Ok((obj, action)) => debug!(operand = K::OPERAND, name = %obj.name, ?action, "协调成功"),
                    Err(e) => error!(operand = K::OPERAND, error = %e, "协调错误"),
                }
            })
            .await;
    }

    /// 顶层控制器：任一组件资源变化都重新汇总状态
    async fn run_ztwim(&self) {
        let client = self.client.clone();

        info!("启动 ZeroTrustWorkloadIdentityManager 控制器");
        KubeController::new(
            Api::<ZeroTrustWorkloadIdentityManager>::all(client.clone()),
            watcher::Config::default(),
        )
        .watches(
            Api::<SpireServer>::all(client.clone()),
            watcher::Config::default(),
            singleton::<ZeroTrustWorkloadIdentityManager, SpireServer>,
        )
        .watches(
            Api::<SpireAgent>::all(client.clone()),
            watcher::Config::default(),
            singleton::<ZeroTrustWorkloadIdentityManager, SpireAgent>,
        )
        .watches(
            Api::<SpireOIDCDiscoveryProvider>::all(client.clone()),
            watcher::Config::default(),
            singleton::<ZeroTrustWorkloadIdentityManager, SpireOIDCDiscoveryProvider>,
        )
        .watches(
            Api::<SpiffeCSIDriver>::all(client.clone()),
            watcher::Config::default(),
            singleton::<ZeroTrustWorkloadIdentityManager, SpiffeCSIDriver>,
        )
        .shutdown_on_signal()
        .run(
            reconcile::ztwim::reconcile,
            error_policy::<ZeroTrustWorkloadIdentityManager>,
            self.ctx.clone(),
        )
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => debug!(name = %obj.name, ?action, "顶层状态汇总成功"),
                Err(e) => error!(error = %e, "顶层状态汇总错误"),
            }
        })
        .await;
    }
}
