//! 资源协调模块
//!
//! 每个组件资源由同一套流程协调：读取顶层 `ZeroTrustWorkloadIdentityManager`，
//! 校验信任域与组件规范，按依赖顺序逐个创建或更新生成对象，
//! 最后根据工作负载状态写回条件。
//!
//! 各组件只需实现 [`OperandReconciler`]，描述自己生成哪些对象以及
//! 以哪个工作负载判断就绪。

pub mod apply;
pub mod csi_driver;
pub mod oidc;
pub mod spire_agent;
pub mod spire_server;
pub mod ztwim;

use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use kube::{
    api::{Api, Patch, PatchParams},
    client::Client,
    runtime::controller::Action,
    Resource, ResourceExt,
};
use serde_json::json;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};
use ztwim_common::{
    set_condition, validate_trust_domain, Condition, ConditionStatus, CONDITION_CREATE_ONLY_MODE,
    CONDITION_READY, REASON_CREATE_ONLY_DISABLED, REASON_CREATE_ONLY_ENABLED, REASON_READY,
    REASON_WORKLOAD_NOT_READY,
};

#[cfg(test)]
use mockall::automock;

use crate::config::OperatorConfig;
use crate::crd::{
    Operand, ZeroTrustWorkloadIdentityManager, ZeroTrustWorkloadIdentityManagerSpec,
    SINGLETON_NAME,
};
use crate::error::{OperatorError, Result};
use crate::metrics::OperatorMetrics;
use apply::{apply, ManagedResource};

/// 错误重试的基础间隔
const ERROR_REQUEUE_SECONDS: u64 = 30;

/// 错误重试的最大间隔
const MAX_ERROR_REQUEUE_SECONDS: u64 = 600;

/// 所有控制器共享的上下文
pub struct Context {
    /// Kubernetes 客户端
    pub client: Client,
    /// Operator 配置
    pub config: OperatorConfig,
    /// 指标
    pub metrics: OperatorMetrics,
    /// 各对象的连续失败次数，用于指数退避
    pub error_counts: ErrorCounts,
}

impl Context {
    /// 创建上下文
    pub fn new(client: Client, config: OperatorConfig, metrics: OperatorMetrics) -> Self {
        Self {
            client,
            config,
            metrics,
            error_counts: ErrorCounts::default(),
        }
    }

    /// 组件命名空间内的 API
    pub fn namespaced<K>(&self) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.config.operand_namespace)
    }

    /// 集群级 API
    pub fn cluster<K>(&self) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::ClusterResourceScope>,
        K::DynamicType: Default,
    {
        Api::all(self.client.clone())
    }

    /// 处理一个生成对象并记录 `<Kind>Available` 条件
    ///
    /// 失败时写入 `Failed` 条件并返回错误，调用方应停止后续对象。
    pub async fn apply_step<K: ManagedResource>(
        &self,
        api: &Api<K>,
        desired: K,
        condition_type: &str,
        recorder: &mut StatusRecorder,
    ) -> Result<()> {
        let kind = desired.kind_name();
        let name = desired.meta().name.clone().unwrap_or_default();

        match apply(api, desired, self.config.create_only_mode).await {
            Ok(outcome) => {
                self.metrics.observe_apply(&kind, outcome.as_str());
                recorder.set(
                    condition_type,
                    ConditionStatus::True,
                    outcome.reason(),
                    format!("{kind} {name} {outcome}"),
                );
                Ok(())
            }
            Err(e) => {
                warn!(kind = %kind, name = %name, error = %e, "处理对象失败");
                recorder.set(
                    condition_type,
                    ConditionStatus::False,
                    e.reason(),
                    format!("{kind} {name}: {e}"),
                );
                Err(e)
            }
        }
    }
}

/// 连续失败计数
#[derive(Default)]
pub struct ErrorCounts(DashMap<String, u32>);

impl ErrorCounts {
    /// 增加一次失败并返回当前次数
    pub fn increment(&self, key: &str) -> u32 {
        let mut entry = self.0.entry(key.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// 成功后清零
    pub fn reset(&self, key: &str) {
        self.0.remove(key);
    }
}

/// 指数退避：30s → 60s → 120s → 240s → 480s → 600s
pub fn backoff_delay(retries: u32) -> Duration {
    let base = Duration::from_secs(ERROR_REQUEUE_SECONDS);
    let backoff = base * 2u32.saturating_pow(retries.saturating_sub(1).min(5));
    backoff.min(Duration::from_secs(MAX_ERROR_REQUEUE_SECONDS))
}

fn error_key<K: Resource<DynamicType = ()>>(obj: &K) -> String {
    format!("{}/{}", K::kind(&()), obj.name_any())
}

/// 控制器错误策略
pub fn error_policy<K>(obj: Arc<K>, error: &OperatorError, ctx: Arc<Context>) -> Action
where
    K: Resource<DynamicType = ()>,
{
    let key = error_key(obj.as_ref());
    let retries = ctx.error_counts.increment(&key);
    let delay = error.fixed_requeue().unwrap_or_else(|| backoff_delay(retries));

    warn!(
        error = %error,
        retry = retries,
        delay_secs = delay.as_secs(),
        "协调 {} 失败，稍后重试",
        key
    );

    Action::requeue(delay)
}

/// 收集本轮协调写入的条件
#[derive(Debug, Clone)]
pub struct StatusRecorder {
    conditions: Vec<Condition>,
    generation: Option<i64>,
    changed: bool,
}

impl StatusRecorder {
    /// 以现有条件为起点
    pub fn new(conditions: &[Condition], generation: Option<i64>) -> Self {
        Self {
            conditions: conditions.to_vec(),
            generation,
            changed: false,
        }
    }

    /// 写入一个条件
    pub fn set(
        &mut self,
        type_: &str,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
    ) {
        let condition = Condition::new(type_, status, reason, message).with_generation(self.generation);
        self.changed |= set_condition(&mut self.conditions, condition);
    }

    /// 是否有条件发生变化
    pub fn changed(&self) -> bool {
        self.changed
    }

    /// 当前条件
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// 取出条件
    pub fn into_conditions(self) -> Vec<Condition> {
        self.conditions
    }
}

/// 工作负载就绪情况
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadReadiness {
    /// 是否就绪
    pub ready: bool,
    /// 说明
    pub message: String,
}

impl WorkloadReadiness {
    /// DaemonSet：所有调度到的节点都已就绪，且至少调度了一个
    pub fn from_daemon_set(ds: &DaemonSet) -> Self {
        let name = ds.name_any();
        let (ready, desired) = ds
            .status
            .as_ref()
            .map(|s| (s.number_ready, s.desired_number_scheduled))
            .unwrap_or_default();
        Self {
            ready: desired > 0 && ready == desired,
            message: format!("DaemonSet {name}: {ready}/{desired} pods ready"),
        }
    }

    /// StatefulSet：就绪副本数不少于期望副本数
    pub fn from_stateful_set(sts: &StatefulSet) -> Self {
        let desired = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        let ready = sts.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0);
        Self::replicas("StatefulSet", &sts.name_any(), ready, desired)
    }

    /// Deployment：就绪副本数不少于期望副本数
    pub fn from_deployment(deploy: &Deployment) -> Self {
        let desired = deploy.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        let ready = deploy.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0);
        Self::replicas("Deployment", &deploy.name_any(), ready, desired)
    }

    fn replicas(kind: &str, name: &str, ready: i32, desired: i32) -> Self {
        Self {
            ready: ready >= desired,
            message: format!("{kind} {name}: {ready}/{desired} replicas ready"),
        }
    }
}

/// 组件资源的协调逻辑
#[async_trait]
pub trait OperandReconciler: Operand {
    /// 校验组件规范，返回可读的错误说明
    fn validate_spec(&self) -> std::result::Result<(), String>;

    /// 按依赖顺序处理全部生成对象，返回主工作负载的就绪情况
    async fn apply_objects(
        &self,
        ztwim: &ZeroTrustWorkloadIdentityManagerSpec,
        ctx: &Context,
        recorder: &mut StatusRecorder,
    ) -> Result<WorkloadReadiness>;
}

/// 协调过程中对顶层资源与组件状态的读写
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OperandStore<K: Operand>: Send + Sync {
    /// 读取 `ZeroTrustWorkloadIdentityManager/cluster`
    async fn ztwim(&self) -> Result<Option<ZeroTrustWorkloadIdentityManager>>;

    /// 把条件写回组件资源的 status 子资源
    async fn patch_conditions(&self, name: &str, conditions: &[Condition]) -> Result<()>;
}

/// 基于 Kubernetes API 的 [`OperandStore`]
pub struct KubeOperandStore<K> {
    client: Client,
    _operand: PhantomData<fn() -> K>,
}

impl<K> KubeOperandStore<K> {
    /// 创建存取器
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _operand: PhantomData,
        }
    }
}

#[async_trait]
impl<K: Operand> OperandStore<K> for KubeOperandStore<K> {
    async fn ztwim(&self) -> Result<Option<ZeroTrustWorkloadIdentityManager>> {
        let api: Api<ZeroTrustWorkloadIdentityManager> = Api::all(self.client.clone());
        Ok(api.get_opt(SINGLETON_NAME).await?)
    }

    async fn patch_conditions(&self, name: &str, conditions: &[Condition]) -> Result<()> {
        let api: Api<K> = Api::all(self.client.clone());
        let patch = json!({
            "status": {
                "conditions": conditions
            }
        });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!(operand = K::OPERAND, name = %name, "已更新状态");
        Ok(())
    }
}

/// 根据本轮结果写入 Ready 与 CreateOnlyMode 条件
pub fn finalize_conditions(
    recorder: &mut StatusRecorder,
    outcome: &Result<WorkloadReadiness>,
    create_only: bool,
) -> bool {
    let ready = match outcome {
        Ok(readiness) if readiness.ready => {
            recorder.set(CONDITION_READY, ConditionStatus::True, REASON_READY, readiness.message.as_str());
            true
        }
        Ok(readiness) => {
            recorder.set(
                CONDITION_READY,
                ConditionStatus::False,
                REASON_WORKLOAD_NOT_READY,
                readiness.message.as_str(),
            );
            false
        }
        Err(e) => {
            recorder.set(CONDITION_READY, ConditionStatus::False, e.reason(), e.to_string());
            false
        }
    };

    if create_only {
        recorder.set(
            CONDITION_CREATE_ONLY_MODE,
            ConditionStatus::True,
            REASON_CREATE_ONLY_ENABLED,
            "Existing resources are not updated",
        );
    } else {
        recorder.set(
            CONDITION_CREATE_ONLY_MODE,
            ConditionStatus::False,
            REASON_CREATE_ONLY_DISABLED,
            "Existing resources are reconciled",
        );
    }

    ready
}

async fn drive<K, S>(
    obj: &K,
    ctx: &Context,
    store: &S,
    recorder: &mut StatusRecorder,
) -> Result<WorkloadReadiness>
where
    K: OperandReconciler,
    S: OperandStore<K> + ?Sized,
{
    let ztwim = store
        .ztwim()
        .await?
        .ok_or_else(|| OperatorError::ZtwimNotFound(SINGLETON_NAME.to_string()))?;
    validate_trust_domain(&ztwim.spec.trust_domain)?;
    obj.validate_spec().map_err(OperatorError::InvalidSpec)?;
    obj.apply_objects(&ztwim.spec, ctx, recorder).await
}

/// 组件资源的协调入口
#[instrument(skip(obj, ctx), fields(operand = K::OPERAND, name = %obj.name_any()))]
pub async fn reconcile_operand<K: OperandReconciler>(obj: Arc<K>, ctx: Arc<Context>) -> Result<Action> {
    let store = KubeOperandStore::<K>::new(ctx.client.clone());
    reconcile_with(obj.as_ref(), &ctx, &store).await
}

/// 使用给定存取器协调单个组件资源
pub async fn reconcile_with<K, S>(obj: &K, ctx: &Context, store: &S) -> Result<Action>
where
    K: OperandReconciler,
    S: OperandStore<K> + ?Sized,
{
    let name = obj.name_any();
    if name != SINGLETON_NAME {
        warn!("忽略名称不是 {} 的 {} 资源", SINGLETON_NAME, K::OPERAND);
        return Ok(Action::await_change());
    }

    let start = Instant::now();
    let mut recorder = StatusRecorder::new(obj.conditions(), obj.meta().generation);

    let outcome = drive(obj, ctx, store, &mut recorder).await;
    let ready = finalize_conditions(&mut recorder, &outcome, ctx.config.create_only_mode);
    ctx.metrics.set_operand_ready(K::OPERAND, ready);

    let patched = if recorder.changed() {
        store.patch_conditions(&name, recorder.conditions()).await
    } else {
        Ok(())
    };

    let result = outcome.and(patched);
    ctx.metrics
        .observe_reconcile(K::OPERAND, result.is_ok(), start.elapsed());

    match result {
        Ok(()) => {
            ctx.error_counts.reset(&error_key(obj));
            info!(ready, "协调完成");
            Ok(Action::requeue(ctx.config.reconcile_interval()))
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{
        DaemonSetStatus, DeploymentSpec, DeploymentStatus, StatefulSetSpec, StatefulSetStatus,
    };
    use rstest::rstest;
    use ztwim_common::{find_condition, is_condition_true, REASON_FAILED, REASON_ZTWIM_NOT_FOUND};

    use crate::config::OperatorConfig;
    use crate::crd::{ConditionalStatus, SpireAgent};
    use crate::resources::test_support;

    /// 不连接集群的上下文；测试中的读写都经过 mock 存取器
    fn offline_context(create_only: bool) -> Context {
        let service = hyper::service::service_fn(|_req: hyper::Request<hyper::Body>| async {
            Ok::<_, std::convert::Infallible>(hyper::Response::new(hyper::Body::empty()))
        });
        let client = Client::new(service, "default");
        let config = OperatorConfig {
            create_only_mode: create_only,
            ..test_support::config()
        };
        Context::new(client, config, OperatorMetrics::new().unwrap())
    }

    fn ready_reason(conditions: &[Condition]) -> Option<String> {
        find_condition(conditions, CONDITION_READY).map(|c| c.reason.clone())
    }

    #[rstest]
    #[case(1, 30)]
    #[case(2, 60)]
    #[case(3, 120)]
    #[case(5, 480)]
    #[case(6, 600)]
    #[case(20, 600)]
    fn test_backoff_delay(#[case] retries: u32, #[case] expected_secs: u64) {
        assert_eq!(backoff_delay(retries), Duration::from_secs(expected_secs));
    }

    #[test]
    fn test_error_counts() {
        let counts = ErrorCounts::default();
        assert_eq!(counts.increment("SpireAgent/cluster"), 1);
        assert_eq!(counts.increment("SpireAgent/cluster"), 2);
        assert_eq!(counts.increment("SpireServer/cluster"), 1);
        counts.reset("SpireAgent/cluster");
        assert_eq!(counts.increment("SpireAgent/cluster"), 1);
    }

    #[rstest]
    #[case(3, 3, true)]
    #[case(2, 3, false)]
    #[case(0, 0, false)]
    fn test_daemon_set_readiness(#[case] ready: i32, #[case] desired: i32, #[case] expected: bool) {
        let ds = DaemonSet {
            status: Some(DaemonSetStatus {
                number_ready: ready,
                desired_number_scheduled: desired,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(WorkloadReadiness::from_daemon_set(&ds).ready, expected);
    }

    #[test]
    fn test_replica_readiness() {
        let sts = StatefulSet {
            spec: Some(StatefulSetSpec {
                replicas: Some(1),
                ..Default::default()
            }),
            status: Some(StatefulSetStatus {
                ready_replicas: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(WorkloadReadiness::from_stateful_set(&sts).ready);

        let deploy = Deployment {
            spec: Some(DeploymentSpec {
                replicas: Some(2),
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                ready_replicas: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        };
        let readiness = WorkloadReadiness::from_deployment(&deploy);
        assert!(!readiness.ready);
        assert!(readiness.message.contains("1/2"));
    }

    #[test]
    fn test_recorder_tracks_changes() {
        let mut recorder = StatusRecorder::new(&[], Some(3));
        recorder.set("ConfigMapAvailable", ConditionStatus::True, "Created", "ConfigMap created");
        assert!(recorder.changed());

        let conditions = recorder.into_conditions();
        assert_eq!(conditions[0].observed_generation, Some(3));

        let mut again = StatusRecorder::new(&conditions, Some(3));
        again.set("ConfigMapAvailable", ConditionStatus::True, "Created", "ConfigMap created");
        assert!(!again.changed());
    }

    #[test]
    fn test_finalize_conditions() {
        let mut recorder = StatusRecorder::new(&[], None);
        let ready = finalize_conditions(
            &mut recorder,
            &Ok(WorkloadReadiness {
                ready: false,
                message: "0/1".into(),
            }),
            true,
        );
        assert!(!ready);
        let conditions = recorder.conditions();
        assert_eq!(
            find_condition(conditions, CONDITION_READY).unwrap().reason,
            REASON_WORKLOAD_NOT_READY
        );
        assert!(find_condition(conditions, CONDITION_CREATE_ONLY_MODE).unwrap().is_true());

        let mut recorder = StatusRecorder::new(&[], None);
        let missing: Result<WorkloadReadiness> =
            Err(OperatorError::ZtwimNotFound(SINGLETON_NAME.into()));
        assert!(!finalize_conditions(&mut recorder, &missing, false));
        let ready = find_condition(recorder.conditions(), CONDITION_READY).unwrap();
        assert_eq!(ready.reason, REASON_ZTWIM_NOT_FOUND);
        assert_eq!(ready.status, ConditionStatus::False);
    }

    #[tokio::test]
    async fn test_reconcile_skips_other_names() {
        let ctx = offline_context(false);
        let mut agent = test_support::spire_agent();
        agent.metadata.name = Some("secondary".into());

        let mut store = MockOperandStore::<SpireAgent>::new();
        store.expect_ztwim().never();
        store.expect_patch_conditions().never();

        let action = reconcile_with(&agent, &ctx, &store).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_reconcile_without_ztwim() {
        let ctx = offline_context(true);
        let agent = test_support::spire_agent();

        let mut store = MockOperandStore::<SpireAgent>::new();
        store.expect_ztwim().times(1).returning(|| Ok(None));
        store
            .expect_patch_conditions()
            .withf(|name: &str, conditions: &[Condition]| {
                name == "cluster"
                    && ready_reason(conditions).as_deref() == Some(REASON_ZTWIM_NOT_FOUND)
                    && is_condition_true(conditions, CONDITION_CREATE_ONLY_MODE)
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let result = reconcile_with(&agent, &ctx, &store).await;
        assert!(matches!(result, Err(OperatorError::ZtwimNotFound(_))));
    }

    #[tokio::test]
    async fn test_reconcile_rejects_invalid_trust_domain() {
        let ctx = offline_context(false);
        let agent = test_support::spire_agent();

        let mut store = MockOperandStore::<SpireAgent>::new();
        store.expect_ztwim().returning(|| {
            let mut ztwim = test_support::ztwim();
            ztwim.spec.trust_domain = "Not A Domain".into();
            Ok(Some(ztwim))
        });
        store
            .expect_patch_conditions()
            .withf(|_: &str, conditions: &[Condition]| {
                ready_reason(conditions).as_deref() == Some(REASON_FAILED)
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let result = reconcile_with(&agent, &ctx, &store).await;
        assert!(matches!(result, Err(OperatorError::Common(_))));
    }

    #[tokio::test]
    async fn test_reconcile_skips_unchanged_status() {
        let ctx = offline_context(false);
        let mut recorder = StatusRecorder::new(&[], Some(1));
        let missing: Result<WorkloadReadiness> =
            Err(OperatorError::ZtwimNotFound(SINGLETON_NAME.into()));
        finalize_conditions(&mut recorder, &missing, false);

        let mut agent = test_support::spire_agent();
        agent.status = Some(ConditionalStatus {
            conditions: recorder.into_conditions(),
        });

        let mut store = MockOperandStore::<SpireAgent>::new();
        store.expect_ztwim().returning(|| Ok(None));
        store.expect_patch_conditions().never();

        let result = reconcile_with(&agent, &ctx, &store).await;
        assert!(matches!(result, Err(OperatorError::ZtwimNotFound(_))));
    }
}
