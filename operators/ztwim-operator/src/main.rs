//! ztwim-operator 可执行程序

use anyhow::{Context as _, Result};
use clap::Parser;
use kube::Client;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ztwim_operator::config::OperatorConfig;
use ztwim_operator::crd::all_crds;
use ztwim_operator::metrics::{self, OperatorMetrics, Readiness};
use ztwim_operator::ZtwimOperator;

/// Zero Trust Workload Identity Manager Operator
#[derive(Parser, Debug)]
#[command(name = "ztwim-operator")]
#[command(about = "管理 SPIFFE/SPIRE 工作负载身份栈的 Kubernetes Operator")]
#[command(version)]
struct Args {
    /// 配置文件路径（YAML 或 JSON）
    #[arg(short, long, env = "ZTWIM_CONFIG")]
    config: Option<PathBuf>,

    /// 指标与探针服务地址
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// 日志过滤规则，`RUST_LOG` 优先
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// 输出 JSON 格式日志
    #[arg(long, env = "LOG_JSON", default_value_t = false)]
    log_json: bool,

    /// 输出 CRD 清单后退出
    #[arg(long)]
    print_crds: bool,
}

fn init_logging(args: &Args) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn print_crds() -> Result<()> {
    for crd in all_crds() {
        print!("---\n{}", serde_yaml::to_string(&crd).context("序列化 CRD 失败")?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crds {
        return print_crds();
    }

    init_logging(&args);

    let config = OperatorConfig::load(args.config.as_deref()).context("加载配置失败")?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = %config.operand_namespace,
        create_only = config.create_only_mode,
        "启动 ZTWIM Operator"
    );

    let metrics = OperatorMetrics::new().context("注册指标失败")?;
    let readiness = Readiness::default();

    let server_metrics = metrics.clone();
    let server_readiness = readiness.clone();
    let metrics_addr = args.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = metrics::serve(metrics_addr, server_metrics, server_readiness).await {
            error!(error = %e, "指标服务异常退出");
        }
    });

    let client = Client::try_default()
        .await
        .context("创建 Kubernetes 客户端失败")?;

    ZtwimOperator::new(client, config, metrics, readiness).run().await;

    info!("ZTWIM Operator 已退出");
    Ok(())
}
