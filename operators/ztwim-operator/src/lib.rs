//! ZTWIM Operator - 管理 SPIFFE/SPIRE 工作负载身份栈的 Kubernetes Operator
//!
//! 该 crate 实现 Zero Trust Workload Identity Manager：由五个集群级单例
//! 自定义资源描述 spire-server、spire-agent、OIDC 发现服务与 SPIFFE CSI 驱动，
//! Operator 把它们翻译为具体的 Kubernetes 对象并持续协调，
//! 再把各组件状态汇总到 `ZeroTrustWorkloadIdentityManager/cluster`。

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod reconcile;
pub mod resources;

use kube::Client;
use std::sync::Arc;

use crate::config::OperatorConfig;
use crate::metrics::{OperatorMetrics, Readiness};
use crate::reconcile::Context;

/// Operator 主结构体
pub struct ZtwimOperator {
    /// Kubernetes 客户端
    client: Client,
    /// 控制器集合
    controller: controller::Controller,
    /// 就绪标记
    readiness: Readiness,
}

impl ZtwimOperator {
    /// 创建 Operator 实例
    pub fn new(client: Client, config: OperatorConfig, metrics: OperatorMetrics, readiness: Readiness) -> Self {
        let ctx = Arc::new(Context::new(client.clone(), config, metrics));
        Self {
            controller: controller::Controller::new(client.clone(), ctx),
            client,
            readiness,
        }
    }

    /// 运行全部控制器，直到收到终止信号
    ///
    /// 自定义资源 API 可被列出后 `/readyz` 才返回成功。
    pub async fn run(&self) {
        let ready_gate = tokio::spawn(controller::mark_ready_when_served(
            self.client.clone(),
            self.readiness.clone(),
        ));
        self.controller.run().await;
        ready_gate.abort();
    }
}
