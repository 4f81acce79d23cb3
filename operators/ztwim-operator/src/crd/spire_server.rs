//! SpireServer 组件资源

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use url::Url;

use super::common::{
    default_log_format, default_log_level, impl_operand, CommonConfig, ConditionalStatus,
};

/// spire-server 规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "operator.openshift.io",
    version = "v1alpha1",
    kind = "SpireServer",
    plural = "spireservers",
    status = "ConditionalStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SpireServerSpec {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// 日志格式：text 或 json
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// JWT-SVID 签发者 URL
    pub jwt_issuer: String,

    /// CA 证书有效期
    #[serde(default = "default_ca_validity")]
    pub ca_validity: String,

    /// X509-SVID 默认有效期
    #[serde(default = "default_x509_validity")]
    pub default_x509_validity: String,

    /// JWT-SVID 默认有效期
    #[serde(default = "default_jwt_validity", rename = "defaultJWTValidity")]
    pub default_jwt_validity: String,

    /// CA 密钥类型
    #[serde(default = "default_ca_key_type")]
    pub ca_key_type: String,

    /// CA 证书主题
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_subject: Option<CaSubject>,

    /// 数据持久化
    #[serde(default)]
    pub persistence: Persistence,

    /// 数据存储
    #[serde(default)]
    pub datastore: Datastore,

    /// 共享调度配置
    #[serde(flatten)]
    pub common: CommonConfig,
}

/// CA 证书主题
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CaSubject {
    /// 国家
    #[serde(default)]
    pub country: String,
    /// 组织
    #[serde(default)]
    pub organization: String,
    /// 通用名称
    #[serde(default)]
    pub common_name: String,
}

/// 持久卷配置
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Persistence {
    /// 卷大小
    #[serde(default = "default_persistence_size")]
    pub size: String,
    /// 访问模式
    #[serde(default = "default_access_mode")]
    pub access_mode: String,
    /// 存储类
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

impl Default for Persistence {
    fn default() -> Self {
        Self {
            size: default_persistence_size(),
            access_mode: default_access_mode(),
            storage_class: None,
        }
    }
}

/// SQL 数据存储配置
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Datastore {
    /// 数据库类型：sqlite3、postgres、mysql
    #[serde(default = "default_database_type")]
    pub database_type: String,
    /// 连接串
    #[serde(default = "default_connection_string")]
    pub connection_string: String,
    /// 最大打开连接数
    #[serde(default = "default_max_open_conns")]
    pub max_open_conns: i32,
    /// 最大空闲连接数
    #[serde(default = "default_max_idle_conns")]
    pub max_idle_conns: i32,
    /// 连接最长存活时间（秒，0 表示不限制）
    #[serde(default)]
    pub conn_max_lifetime: i32,
    /// 是否禁用自动迁移
    #[serde(default)]
    pub disable_migration: bool,
}

impl Default for Datastore {
    fn default() -> Self {
        Self {
            database_type: default_database_type(),
            connection_string: default_connection_string(),
            max_open_conns: default_max_open_conns(),
            max_idle_conns: default_max_idle_conns(),
            conn_max_lifetime: 0,
            disable_migration: false,
        }
    }
}

const DATABASE_TYPES: &[&str] = &["sqlite3", "postgres", "mysql"];
const ACCESS_MODES: &[&str] = &["ReadWriteOnce", "ReadWriteOncePod", "ReadWriteMany"];

impl SpireServerSpec {
    /// 校验规范中无法由 CRD schema 表达的约束
    pub fn validate(&self) -> Result<(), String> {
        validate_issuer(&self.jwt_issuer)?;

        for (field, value) in [
            ("caValidity", &self.ca_validity),
            ("defaultX509Validity", &self.default_x509_validity),
            ("defaultJWTValidity", &self.default_jwt_validity),
        ] {
            if !is_duration(value) {
                return Err(format!("{field}: invalid duration {value:?}"));
            }
        }

        if !DATABASE_TYPES.contains(&self.datastore.database_type.as_str()) {
            return Err(format!(
                "datastore.databaseType: unsupported type {:?}",
                self.datastore.database_type
            ));
        }
        if self.datastore.connection_string.is_empty() {
            return Err("datastore.connectionString must not be empty".to_string());
        }
        if self.datastore.max_open_conns < 1 || self.datastore.max_idle_conns < 0 {
            return Err("datastore connection limits must be positive".to_string());
        }
        if !ACCESS_MODES.contains(&self.persistence.access_mode.as_str()) {
            return Err(format!(
                "persistence.accessMode: unsupported mode {:?}",
                self.persistence.access_mode
            ));
        }

        Ok(())
    }
}

/// 校验 JWT 签发者，必须是带主机名的 https URL
pub(crate) fn validate_issuer(issuer: &str) -> Result<(), String> {
    let url = Url::parse(issuer).map_err(|e| format!("jwtIssuer: {e}"))?;
    if url.scheme() != "https" {
        return Err(format!("jwtIssuer: scheme must be https, got {:?}", url.scheme()));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err("jwtIssuer: missing host".to_string());
    }
    Ok(())
}

/// 形如 `24h`、`1h30m`、`90s` 的时长
fn is_duration(value: &str) -> bool {
    if value.is_empty() {
        return false;
    }

    let mut digits = 0;
    let mut last_unit = 0;
    for c in value.chars() {
        if c.is_ascii_digit() {
            digits += 1;
            continue;
        }
        let rank = match c {
            'h' => 3,
            'm' => 2,
            's' => 1,
            _ => return false,
        };
        if digits == 0 || (last_unit != 0 && rank >= last_unit) {
            return false;
        }
        digits = 0;
        last_unit = rank;
    }

    digits == 0
}

fn default_ca_validity() -> String {
    "24h".to_string()
}

fn default_x509_validity() -> String {
    "1h".to_string()
}

fn default_jwt_validity() -> String {
    "5m".to_string()
}

fn default_ca_key_type() -> String {
    "rsa-2048".to_string()
}

fn default_persistence_size() -> String {
    "1Gi".to_string()
}

fn default_access_mode() -> String {
    "ReadWriteOnce".to_string()
}

fn default_database_type() -> String {
    "sqlite3".to_string()
}

fn default_connection_string() -> String {
    "/run/spire/data/datastore.sqlite3".to_string()
}

fn default_max_open_conns() -> i32 {
    100
}

fn default_max_idle_conns() -> i32 {
    2
}

impl_operand!(SpireServer, "spire-server");
