//! 指标与健康检查模块
//!
//! 以 Prometheus 文本格式导出协调指标，同时提供 `/healthz`、`/readyz`
//! 探针端点。

use hyper::{
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Operator 指标
#[derive(Clone)]
pub struct OperatorMetrics {
    registry: Registry,
    /// 协调次数，按控制器与结果区分
    pub reconciliations: IntCounterVec,
    /// 协调耗时
    pub reconcile_duration: HistogramVec,
    /// 对象处理结果，按类型与结果区分
    pub applied_objects: IntCounterVec,
    /// 组件就绪状态（1 为就绪）
    pub operand_ready: IntGaugeVec,
}

impl OperatorMetrics {
    /// 创建并注册全部指标
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("ztwim".to_string()), None)?;

        let reconciliations = IntCounterVec::new(
            Opts::new("reconciliations_total", "Total number of reconciliations"),
            &["controller", "result"],
        )?;
        let reconcile_duration = HistogramVec::new(
            HistogramOpts::new(
                "reconcile_duration_seconds",
                "Duration of reconciliations in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["controller"],
        )?;
        let applied_objects = IntCounterVec::new(
            Opts::new("applied_objects_total", "Managed objects processed by outcome"),
            &["kind", "outcome"],
        )?;
        let operand_ready = IntGaugeVec::new(
            Opts::new("operand_ready", "Whether an operand reports Ready (1) or not (0)"),
            &["operand"],
        )?;

        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;
        registry.register(Box::new(applied_objects.clone()))?;
        registry.register(Box::new(operand_ready.clone()))?;

        Ok(Self {
            registry,
            reconciliations,
            reconcile_duration,
            applied_objects,
            operand_ready,
        })
    }

    /// 记录一次协调
    pub fn observe_reconcile(&self, controller: &str, success: bool, elapsed: Duration) {
        let result = if success { "success" } else { "error" };
        self.reconciliations
            .with_label_values(&[controller, result])
            .inc();
        self.reconcile_duration
            .with_label_values(&[controller])
            .observe(elapsed.as_secs_f64());
    }

    /// 记录对象处理结果
    pub fn observe_apply(&self, kind: &str, outcome: &str) {
        self.applied_objects
            .with_label_values(&[kind, outcome])
            .inc();
    }

    /// 更新组件就绪状态
    pub fn set_operand_ready(&self, operand: &str, ready: bool) {
        self.operand_ready
            .with_label_values(&[operand])
            .set(i64::from(ready));
    }

    /// 以文本格式编码全部指标
    pub fn render(&self) -> prometheus::Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

/// 就绪状态标记，自定义资源 API 可用后置为就绪
#[derive(Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    /// 标记为就绪
    pub fn set_ready(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// 是否就绪
    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
}

async fn handle(
    req: Request<Body>,
    metrics: OperatorMetrics,
    readiness: Readiness,
) -> Result<Response<Body>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => match metrics.render() {
            Ok((content_type, buffer)) => {
                let mut response = Response::new(Body::from(buffer));
                if let Ok(value) = content_type.parse() {
                    response
                        .headers_mut()
                        .insert(hyper::header::CONTENT_TYPE, value);
                }
                response
            }
            Err(e) => {
                error!("编码指标失败: {}", e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed")
            }
        },
        (&Method::GET, "/healthz") => text_response(StatusCode::OK, "ok"),
        (&Method::GET, "/readyz") if readiness.is_ready() => text_response(StatusCode::OK, "ok"),
        (&Method::GET, "/readyz") => {
            text_response(StatusCode::SERVICE_UNAVAILABLE, "controllers not started")
        }
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

/// 启动指标与探针 HTTP 服务
pub async fn serve(addr: SocketAddr, metrics: OperatorMetrics, readiness: Readiness) -> hyper::Result<()> {
    let make_svc = make_service_fn(move |_| {
        let metrics = metrics.clone();
        let readiness = readiness.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                handle(req, metrics.clone(), readiness.clone())
            }))
        }
    });

    info!("指标服务监听于 {}", addr);
    Server::bind(&addr).serve(make_svc).await
}
