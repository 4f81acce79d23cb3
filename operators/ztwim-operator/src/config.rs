//! 配置管理模块
//!
//! Operator 配置按以下顺序叠加：内置默认值 → 可选的配置文件（YAML/JSON）
//! → `ZTWIM__*` 环境变量 → OLM 约定的 `RELATED_IMAGE_*`、`CREATE_ONLY_MODE`
//! 环境变量。

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};
use ztwim_common::{Error, Result};

/// 默认的组件命名空间
pub const DEFAULT_OPERAND_NAMESPACE: &str = "zero-trust-workload-identity-manager";

/// 镜像环境变量与配置键的对应关系
const IMAGE_ENV_VARS: &[(&str, &str)] = &[
    ("RELATED_IMAGE_SPIRE_SERVER", "images.spire_server"),
    ("RELATED_IMAGE_SPIRE_AGENT", "images.spire_agent"),
    ("RELATED_IMAGE_SPIFFE_CSI_DRIVER", "images.spiffe_csi_driver"),
    (
        "RELATED_IMAGE_SPIRE_OIDC_DISCOVERY_PROVIDER",
        "images.spire_oidc_discovery_provider",
    ),
    (
        "RELATED_IMAGE_SPIRE_CONTROLLER_MANAGER",
        "images.spire_controller_manager",
    ),
    (
        "RELATED_IMAGE_NODE_DRIVER_REGISTRAR",
        "images.node_driver_registrar",
    ),
    ("RELATED_IMAGE_SPIFFE_CSI_INIT_CONTAINER", "images.spiffe_csi_init"),
];

/// Operator 配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorConfig {
    /// 组件部署的命名空间
    pub operand_namespace: String,
    /// 只创建不更新模式
    pub create_only_mode: bool,
    /// 成功协调后的重新检查间隔（秒）
    pub reconcile_interval_seconds: u64,
    /// 组件镜像
    pub images: Images,
}

/// 组件镜像
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Images {
    /// spire-server
    pub spire_server: String,
    /// spire-agent
    pub spire_agent: String,
    /// spiffe-csi-driver
    pub spiffe_csi_driver: String,
    /// spire-oidc-discovery-provider
    pub spire_oidc_discovery_provider: String,
    /// spire-controller-manager
    pub spire_controller_manager: String,
    /// node-driver-registrar
    pub node_driver_registrar: String,
    /// CSI 驱动的初始化容器
    pub spiffe_csi_init: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            operand_namespace: DEFAULT_OPERAND_NAMESPACE.to_string(),
            create_only_mode: false,
            reconcile_interval_seconds: 300,
            images: Images::default(),
        }
    }
}

impl Default for Images {
    fn default() -> Self {
        Self {
            spire_server: "ghcr.io/spiffe/spire-server:1.12.0".to_string(),
            spire_agent: "ghcr.io/spiffe/spire-agent:1.12.0".to_string(),
            spiffe_csi_driver: "ghcr.io/spiffe/spiffe-csi-driver:0.2.7".to_string(),
            spire_oidc_discovery_provider: "ghcr.io/spiffe/oidc-discovery-provider:1.12.0"
                .to_string(),
            spire_controller_manager: "ghcr.io/spiffe/spire-controller-manager:0.6.2"
                .to_string(),
            node_driver_registrar:
                "registry.k8s.io/sig-storage/csi-node-driver-registrar:v2.13.0".to_string(),
            spiffe_csi_init: "registry.access.redhat.com/ubi9/ubi-minimal:latest".to_string(),
        }
    }
}

impl OperatorConfig {
    /// 从配置文件与进程环境变量加载配置
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let env: HashMap<String, String> = std::env::vars().collect();
        Self::load_with_env(config_path, &env)
    }

    /// 从配置文件与给定的环境变量集合加载配置
    pub fn load_with_env(config_path: Option<&Path>, env: &HashMap<String, String>) -> Result<Self> {
        let defaults = Config::try_from(&OperatorConfig::default()).map_err(config_error)?;
        let mut builder = Config::builder().add_source(defaults);

        if let Some(path) = config_path {
            let file = path
                .to_str()
                .ok_or_else(|| Error::Config(format!("配置路径无效: {path:?}")))?;
            let format = match path.extension().and_then(|ext| ext.to_str()) {
                Some("yaml") | Some("yml") => FileFormat::Yaml,
                Some("json") => FileFormat::Json,
                _ => {
                    return Err(Error::Config(
                        "不支持的配置文件格式，仅支持 YAML 或 JSON".to_string(),
                    ))
                }
            };
            info!(path = %file, "加载配置文件");
            builder = builder.add_source(File::with_name(file).format(format));
        }

        builder = builder.add_source(
            Environment::with_prefix("ZTWIM")
                .separator("__")
                .try_parsing(true)
                .source(Some(env.clone().into_iter().collect())),
        );

        for (var, key) in IMAGE_ENV_VARS {
            let value = env.get(*var).filter(|v| !v.is_empty()).cloned();
            if value.is_some() {
                debug!(env = %var, "使用环境变量指定的镜像");
            }
            builder = builder
                .set_override_option(*key, value)
                .map_err(config_error)?;
        }

        let create_only = env
            .get("CREATE_ONLY_MODE")
            .map(|v| v.trim().eq_ignore_ascii_case("true"));
        builder = builder
            .set_override_option("create_only_mode", create_only)
            .map_err(config_error)?;

        let config: OperatorConfig = builder
            .build()
            .map_err(config_error)?
            .try_deserialize()
            .map_err(config_error)?;
        config.validate()?;

        Ok(config)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.operand_namespace.is_empty() {
            return Err(Error::Config("operand_namespace 不能为空".to_string()));
        }
        if self.reconcile_interval_seconds == 0 {
            return Err(Error::Config(
                "reconcile_interval_seconds 必须大于 0".to_string(),
            ));
        }
        Ok(())
    }

    /// 成功协调后的重新检查间隔
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_seconds)
    }
}

fn config_error(e: config::ConfigError) -> Error {
    Error::Config(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = OperatorConfig::load_with_env(None, &HashMap::new()).unwrap();
        assert_eq!(config, OperatorConfig::default());
        assert_eq!(config.reconcile_interval(), Duration::from_secs(300));
    }

    #[test]
    fn test_related_image_overrides() {
        let config = OperatorConfig::load_with_env(
            None,
            &env(&[
                ("RELATED_IMAGE_SPIRE_AGENT", "quay.io/example/spire-agent@sha256:abc"),
                ("RELATED_IMAGE_SPIRE_SERVER", ""),
            ]),
        )
        .unwrap();
        assert_eq!(config.images.spire_agent, "quay.io/example/spire-agent@sha256:abc");
        assert_eq!(config.images.spire_server, Images::default().spire_server);
    }

    #[test]
    fn test_create_only_mode_env() {
        let on = OperatorConfig::load_with_env(None, &env(&[("CREATE_ONLY_MODE", "TRUE")])).unwrap();
        assert!(on.create_only_mode);

        let off = OperatorConfig::load_with_env(None, &env(&[("CREATE_ONLY_MODE", "no")])).unwrap();
        assert!(!off.create_only_mode);
    }

    #[test]
    fn test_prefixed_env() {
        let config = OperatorConfig::load_with_env(
            None,
            &env(&[
                ("ZTWIM__OPERAND_NAMESPACE", "spire-system"),
                ("ZTWIM__RECONCILE_INTERVAL_SECONDS", "60"),
            ]),
        )
        .unwrap();
        assert_eq!(config.operand_namespace, "spire-system");
        assert_eq!(config.reconcile_interval_seconds, 60);
    }

    #[test]
    fn test_yaml_file() {
        let dir = std::env::temp_dir().join(format!("ztwim-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("operator.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "create_only_mode: true\nimages:\n  spire_server: example/server:1").unwrap();

        let config = OperatorConfig::load_with_env(Some(&path), &HashMap::new()).unwrap();
        assert!(config.create_only_mode);
        assert_eq!(config.images.spire_server, "example/server:1");
        assert_eq!(config.images.spire_agent, Images::default().spire_agent);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_unsupported_file_format() {
        let result = OperatorConfig::load_with_env(Some(Path::new("operator.toml")), &HashMap::new());
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let result = OperatorConfig::load_with_env(
            None,
            &env(&[("ZTWIM__RECONCILE_INTERVAL_SECONDS", "0")]),
        );
        assert!(result.is_err());
    }
}
