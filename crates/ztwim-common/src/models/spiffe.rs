//! SPIFFE 身份模型
//!
//! 该模块实现 SPIFFE 信任域与 SPIFFE ID 的解析和校验。
//! Operator 在渲染任何 SPIRE 配置之前都会先校验信任域，
//! 并使用 [`SpiffeId`] 生成服务端允许的 agent 身份。

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

use crate::error::{Error, Result};

/// 信任域允许的字符集
static TRUST_DOMAIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9._-]+$").expect("valid trust domain regex"));

/// 信任域最大长度
pub const MAX_TRUST_DOMAIN_LEN: usize = 255;

/// 校验信任域名称
pub fn validate_trust_domain(domain: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidTrustDomain {
        domain: domain.to_string(),
        reason: reason.to_string(),
    };

    if domain.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if domain.len() > MAX_TRUST_DOMAIN_LEN {
        return Err(invalid("must not exceed 255 characters"));
    }
    if domain.contains("://") {
        return Err(invalid("must not contain a scheme"));
    }
    if domain.contains('/') {
        return Err(invalid("must not contain a path"));
    }
    if !TRUST_DOMAIN_RE.is_match(domain) {
        return Err(invalid(
            "may only contain lower case letters, digits, dots, dashes and underscores",
        ));
    }

    Ok(())
}

/// SPIFFE ID 结构体
///
/// 格式为 `spiffe://trust-domain/path`，路径可以为空（信任域 ID）。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpiffeId {
    /// 信任域（如 example.org）
    pub trust_domain: String,
    /// 路径部分（如 /ns/default/sa/web）
    pub path: String,
}

impl SpiffeId {
    /// 创建新的 SPIFFE ID
    pub fn new(trust_domain: &str, path: &str) -> Result<Self> {
        validate_trust_domain(trust_domain)?;

        if !path.is_empty() {
            if !path.starts_with('/') {
                return Err(Error::InvalidSpiffeId(format!(
                    "path {path:?} must start with '/'"
                )));
            }
            if path.ends_with('/') {
                return Err(Error::InvalidSpiffeId(format!(
                    "path {path:?} must not end with '/'"
                )));
            }
            if path
                .split('/')
                .skip(1)
                .any(|seg| seg.is_empty() || seg == "." || seg == "..")
            {
                return Err(Error::InvalidSpiffeId(format!(
                    "path {path:?} contains an empty or relative segment"
                )));
            }
        }

        Ok(Self {
            trust_domain: trust_domain.to_string(),
            path: path.to_string(),
        })
    }

    /// 从 URI 字符串解析 SPIFFE ID
    pub fn from_uri(uri: &str) -> Result<Self> {
        let url = Url::parse(uri)
            .map_err(|e| Error::InvalidSpiffeId(format!("{uri}: {e}")))?;

        if url.scheme() != "spiffe" {
            return Err(Error::InvalidSpiffeId(format!(
                "unsupported scheme {:?}",
                url.scheme()
            )));
        }
        if url.query().is_some() || url.fragment().is_some() {
            return Err(Error::InvalidSpiffeId(
                "query and fragment are not allowed".to_string(),
            ));
        }

        let trust_domain = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::InvalidSpiffeId("missing trust domain".to_string()))?;

        Self::new(trust_domain, url.path())
    }

    /// Kubernetes 服务账户对应的 SPIFFE ID
    pub fn for_service_account(
        trust_domain: &str,
        namespace: &str,
        service_account: &str,
    ) -> Result<Self> {
        Self::new(
            trust_domain,
            &format!("/ns/{namespace}/sa/{service_account}"),
        )
    }

    /// 生成 SPIFFE URI 字符串
    pub fn uri(&self) -> String {
        format!("spiffe://{}{}", self.trust_domain, self.path)
    }
}

impl fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uri())
    }
}

impl FromStr for SpiffeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_uri(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("example.org")]
    #[case("apps.cluster-1.example.com")]
    #[case("td_with-underscore")]
    fn test_valid_trust_domains(#[case] domain: &str) {
        assert!(validate_trust_domain(domain).is_ok());
    }

    #[rstest]
    #[case("")]
    #[case("Example.org")]
    #[case("spiffe://example.org")]
    #[case("example.org/path")]
    #[case("exa mple.org")]
    fn test_invalid_trust_domains(#[case] domain: &str) {
        assert!(validate_trust_domain(domain).is_err());
    }

    #[test]
    fn test_trust_domain_too_long() {
        let domain = "a".repeat(MAX_TRUST_DOMAIN_LEN + 1);
        assert!(validate_trust_domain(&domain).is_err());
    }

    #[test]
    fn test_spiffe_id_from_uri() {
        let id = SpiffeId::from_uri("spiffe://example.org/ns/default/sa/web").unwrap();
        assert_eq!(id.trust_domain, "example.org");
        assert_eq!(id.path, "/ns/default/sa/web");
        assert_eq!(id.to_string(), "spiffe://example.org/ns/default/sa/web");
    }

    #[test]
    fn test_trust_domain_id() {
        let id: SpiffeId = "spiffe://example.org".parse().unwrap();
        assert_eq!(id.path, "");
        assert_eq!(id.uri(), "spiffe://example.org");
    }

    #[rstest]
    #[case("https://example.org/service")]
    #[case("spiffe:///service")]
    #[case("spiffe://example.org/service/")]
    #[case("spiffe://example.org/a//b")]
    #[case("spiffe://example.org/a?x=1")]
    fn test_invalid_spiffe_ids(#[case] uri: &str) {
        assert!(SpiffeId::from_uri(uri).is_err());
    }

    #[test]
    fn test_service_account_id() {
        let id = SpiffeId::for_service_account(
            "example.org",
            "zero-trust-workload-identity-manager",
            "spire-agent",
        )
        .unwrap();
        assert_eq!(
            id.uri(),
            "spiffe://example.org/ns/zero-trust-workload-identity-manager/sa/spire-agent"
        );
    }
}
