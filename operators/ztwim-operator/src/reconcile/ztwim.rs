//! ZeroTrustWorkloadIdentityManager 状态汇总
//!
//! 读取四个组件资源的条件，归类为就绪、进行中或失败，
//! 再据此写入顶层资源的 Ready、Degraded、CreateOnlyMode、Upgradeable 条件。

use async_trait::async_trait;
use kube::{
    api::{Api, Patch, PatchParams},
    client::Client,
    runtime::controller::Action,
    Resource, ResourceExt,
};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument};
use ztwim_common::{
    find_condition, Condition, ConditionStatus, CONDITION_CREATE_ONLY_MODE, CONDITION_DEGRADED,
    CONDITION_READY, CONDITION_UPGRADEABLE, REASON_CREATE_ONLY_ENABLED, REASON_FAILED,
    REASON_INVALID_SPEC, REASON_ZTWIM_NOT_FOUND,
};

#[cfg(test)]
use mockall::automock;

use super::{Context, StatusRecorder};
use crate::crd::{
    Operand, OperandStatus, SpiffeCSIDriver, SpireAgent, SpireOIDCDiscoveryProvider, SpireServer,
    ZeroTrustWorkloadIdentityManager, ZeroTrustWorkloadIdentityManagerStatus, SINGLETON_NAME,
};
use crate::error::Result;

/// 控制器名称，用于日志与指标
pub const CONTROLLER_NAME: &str = "zero-trust-workload-identity-manager";

/// 原因：存在失败的组件
pub const REASON_OPERANDS_FAILED: &str = "OperandsFailed";
/// 原因：存在尚未就绪的组件
pub const REASON_OPERANDS_PROGRESSING: &str = "OperandsProgressing";
/// 原因：全部组件就绪
pub const REASON_ALL_OPERANDS_READY: &str = "AllOperandsReady";
/// 原因：没有失败的组件
pub const REASON_NO_FAILURES: &str = "NoOperandFailures";
/// 原因：可以升级
pub const REASON_UPGRADEABLE: &str = "Upgradeable";

/// 表示组件失败的 Ready 原因
const FAILURE_REASONS: &[&str] = &[REASON_FAILED, REASON_ZTWIM_NOT_FOUND, REASON_INVALID_SPEC];

/// 组件资源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// spire-server
    SpireServer,
    /// spire-agent
    SpireAgent,
    /// OIDC 发现服务
    SpireOIDCDiscoveryProvider,
    /// CSI 驱动
    SpiffeCSIDriver,
}

impl OperandKind {
    /// 全部组件，按汇总顺序排列
    pub const ALL: [OperandKind; 4] = [
        OperandKind::SpireServer,
        OperandKind::SpireAgent,
        OperandKind::SpireOIDCDiscoveryProvider,
        OperandKind::SpiffeCSIDriver,
    ];

    /// 资源 Kind
    pub fn kind(&self) -> &'static str {
        match self {
            OperandKind::SpireServer => "SpireServer",
            OperandKind::SpireAgent => "SpireAgent",
            OperandKind::SpireOIDCDiscoveryProvider => "SpireOIDCDiscoveryProvider",
            OperandKind::SpiffeCSIDriver => "SpiffeCSIDriver",
        }
    }
}

impl fmt::Display for OperandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// 组件条件来源
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OperandStatusSource: Send + Sync {
    /// 读取单例组件资源的条件，资源不存在时返回 `None`
    async fn operand_conditions(&self, kind: OperandKind) -> Result<Option<Vec<Condition>>>;
}

/// 通过 API server 读取组件资源
pub struct KubeOperandStatusSource {
    client: Client,
}

impl KubeOperandStatusSource {
    /// 创建来源
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn conditions_of<K: Operand>(&self) -> Result<Option<Vec<Condition>>> {
        let api: Api<K> = Api::all(self.client.clone());
        let object = api.get_opt(SINGLETON_NAME).await?;
        Ok(object.map(|o| o.conditions().to_vec()))
    }
}

#[async_trait]
impl OperandStatusSource for KubeOperandStatusSource {
    async fn operand_conditions(&self, kind: OperandKind) -> Result<Option<Vec<Condition>>> {
        match kind {
            OperandKind::SpireServer => self.conditions_of::<SpireServer>().await,
            OperandKind::SpireAgent => self.conditions_of::<SpireAgent>().await,
            OperandKind::SpireOIDCDiscoveryProvider => {
                self.conditions_of::<SpireOIDCDiscoveryProvider>().await
            }
            OperandKind::SpiffeCSIDriver => self.conditions_of::<SpiffeCSIDriver>().await,
        }
    }
}

/// 组件健康分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandHealth {
    /// 就绪
    Ready,
    /// 进行中
    Progressing,
    /// 失败
    Failed,
}

/// 单个组件的分类结果
#[derive(Debug, Clone, PartialEq)]
pub struct OperandReport {
    /// 组件类型
    pub kind: OperandKind,
    /// 健康分类
    pub health: OperandHealth,
    /// 说明
    pub message: String,
    /// 组件是否处于只创建模式
    pub create_only: bool,
    /// 汇总到顶层状态的关键条件
    pub conditions: Vec<Condition>,
}

/// 对单个组件分类
pub fn classify(kind: OperandKind, conditions: Option<&[Condition]>) -> OperandReport {
    let Some(conditions) = conditions else {
        return OperandReport {
            kind,
            health: OperandHealth::Progressing,
            message: format!("{kind} {SINGLETON_NAME} not found"),
            create_only: false,
            conditions: Vec::new(),
        };
    };

    let ready = find_condition(conditions, CONDITION_READY);
    let (health, message) = match ready {
        Some(c) if c.is_true() => (OperandHealth::Ready, c.message.clone()),
        Some(c) if FAILURE_REASONS.contains(&c.reason.as_str()) => {
            (OperandHealth::Failed, format!("{}: {}", c.reason, c.message))
        }
        Some(c) => (OperandHealth::Progressing, format!("{}: {}", c.reason, c.message)),
        None => (
            OperandHealth::Progressing,
            "Ready condition not reported yet".to_string(),
        ),
    };

    let create_only = find_condition(conditions, CONDITION_CREATE_ONLY_MODE)
        .map_or(false, Condition::is_true);
    let key_conditions = [CONDITION_READY, CONDITION_CREATE_ONLY_MODE]
        .iter()
        .filter_map(|t| find_condition(conditions, t).cloned())
        .collect();

    OperandReport {
        kind,
        health,
        message,
        create_only,
        conditions: key_conditions,
    }
}

fn list_operands(reports: &[OperandReport], health: OperandHealth) -> String {
    reports
        .iter()
        .filter(|r| r.health == health)
        .map(|r| format!("{} ({})", r.kind, r.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// 由组件分类结果计算顶层状态
pub fn aggregate(
    existing: Option<&ZeroTrustWorkloadIdentityManagerStatus>,
    generation: Option<i64>,
    reports: &[OperandReport],
    create_only_config: bool,
) -> ZeroTrustWorkloadIdentityManagerStatus {
    let previous = existing.map(|s| s.conditions.as_slice()).unwrap_or_default();
    let mut recorder = StatusRecorder::new(previous, generation);

    let any_failed = reports.iter().any(|r| r.health == OperandHealth::Failed);
    let all_ready = reports.iter().all(|r| r.health == OperandHealth::Ready);

    if all_ready {
        recorder.set(
            CONDITION_READY,
            ConditionStatus::True,
            REASON_ALL_OPERANDS_READY,
            "All operands are ready",
        );
    } else if any_failed {
        recorder.set(
            CONDITION_READY,
            ConditionStatus::False,
            REASON_OPERANDS_FAILED,
            format!("Failed operands: {}", list_operands(reports, OperandHealth::Failed)),
        );
    } else {
        recorder.set(
            CONDITION_READY,
            ConditionStatus::False,
            REASON_OPERANDS_PROGRESSING,
            format!(
                "Operands not ready: {}",
                list_operands(reports, OperandHealth::Progressing)
            ),
        );
    }

    if any_failed {
        recorder.set(
            CONDITION_DEGRADED,
            ConditionStatus::True,
            REASON_OPERANDS_FAILED,
            format!("Failed operands: {}", list_operands(reports, OperandHealth::Failed)),
        );
    } else {
        recorder.set(
            CONDITION_DEGRADED,
            ConditionStatus::False,
            REASON_NO_FAILURES,
            "No operand has failed",
        );
    }

    let create_only = create_only_config || reports.iter().any(|r| r.create_only);
    if create_only {
        recorder.set(
            CONDITION_CREATE_ONLY_MODE,
            ConditionStatus::True,
            REASON_CREATE_ONLY_ENABLED,
            "Create-only mode is enabled; existing resources are not updated",
        );
    } else {
        recorder.set(
            CONDITION_CREATE_ONLY_MODE,
            ConditionStatus::False,
            ztwim_common::REASON_CREATE_ONLY_DISABLED,
            "Create-only mode is disabled",
        );
    }

    if any_failed {
        recorder.set(
            CONDITION_UPGRADEABLE,
            ConditionStatus::False,
            REASON_OPERANDS_FAILED,
            "Operands must recover before upgrading",
        );
    } else if create_only {
        recorder.set(
            CONDITION_UPGRADEABLE,
            ConditionStatus::False,
            REASON_CREATE_ONLY_ENABLED,
            "Upgrades are blocked while create-only mode is enabled",
        );
    } else {
        recorder.set(
            CONDITION_UPGRADEABLE,
            ConditionStatus::True,
            REASON_UPGRADEABLE,
            "Operator can be upgraded",
        );
    }

    let operands = reports
        .iter()
        .map(|r| OperandStatus {
            name: SINGLETON_NAME.to_string(),
            kind: r.kind.kind().to_string(),
            ready: (r.health == OperandHealth::Ready).to_string(),
            message: r.message.clone(),
            conditions: r.conditions.clone(),
        })
        .collect();

    ZeroTrustWorkloadIdentityManagerStatus {
        conditions: recorder.into_conditions(),
        operands,
    }
}

/// 读取全部组件并计算顶层状态
pub async fn collect_status<S: OperandStatusSource + ?Sized>(
    source: &S,
    ztwim: &ZeroTrustWorkloadIdentityManager,
    create_only_config: bool,
) -> Result<ZeroTrustWorkloadIdentityManagerStatus> {
    let mut reports = Vec::with_capacity(OperandKind::ALL.len());
    for kind in OperandKind::ALL {
        let conditions = source.operand_conditions(kind).await?;
        let report = classify(kind, conditions.as_deref());
        debug!(kind = %kind, health = ?report.health, "组件状态");
        reports.push(report);
    }

    Ok(aggregate(
        ztwim.status.as_ref(),
        ztwim.meta().generation,
        &reports,
        create_only_config,
    ))
}

/// 顶层资源的协调入口
#[instrument(skip(ztwim, ctx), fields(name = %ztwim.name_any()))]
pub async fn reconcile(ztwim: Arc<ZeroTrustWorkloadIdentityManager>, ctx: Arc<Context>) -> Result<Action> {
    let name = ztwim.name_any();
    if name != SINGLETON_NAME {
        info!("忽略名称不是 {} 的 ZeroTrustWorkloadIdentityManager", SINGLETON_NAME);
        return Ok(Action::await_change());
    }

    let start = Instant::now();
    let source = KubeOperandStatusSource::new(ctx.client.clone());
    let result = sync_status(&source, &ztwim, &ctx).await;
    ctx.metrics
        .observe_reconcile(CONTROLLER_NAME, result.is_ok(), start.elapsed());

    result?;
    ctx.error_counts
        .reset(&format!("ZeroTrustWorkloadIdentityManager/{name}"));
    Ok(Action::requeue(ctx.config.reconcile_interval()))
}

async fn sync_status(
    source: &KubeOperandStatusSource,
    ztwim: &ZeroTrustWorkloadIdentityManager,
    ctx: &Context,
) -> Result<()> {
    let status = collect_status(source, ztwim, ctx.config.create_only_mode).await?;

    if ztwim.status.as_ref() == Some(&status) {
        debug!("状态无变化");
        return Ok(());
    }

    let api: Api<ZeroTrustWorkloadIdentityManager> = Api::all(ctx.client.clone());
    let patch = json!({ "status": status });
    api.patch_status(&ztwim.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;

    let ready = find_condition(&status.conditions, CONDITION_READY).map_or(false, Condition::is_true);
    info!(ready, "已更新 ZeroTrustWorkloadIdentityManager 状态");
    Ok(())
}
