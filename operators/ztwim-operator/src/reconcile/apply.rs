//! 创建或更新引擎
//!
//! 每个生成对象都经过同一流程：按名称读取现有对象，不存在则创建；
//! 存在时在只创建模式下保持原样，否则逐类型比较 Operator 控制的字段，
//! 有差异才继承 `resourceVersion` 等不可变字段后整体替换。
//!
//! 比较只覆盖 Operator 写入的字段。API server 填充的默认值、规范化后的
//! 资源数量以及其他控制器追加的标签、注解不会触发更新。

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, EnvVar, PodTemplateSpec, ResourceRequirements, Service, ServiceAccount,
    ServicePort, Volume,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::api::storage::v1::CSIDriver;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DynamicObject, PostParams};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Debug};
use tracing::{debug, info};
use ztwim_common::{
    REASON_CREATED, REASON_CREATE_ONLY_SKIPPED, REASON_UPDATED, REASON_UP_TO_DATE,
};

#[cfg(test)]
use mockall::automock;

use crate::error::{OperatorError, Result};

/// 单个对象的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// 新建
    Created,
    /// 已替换为期望状态
    Updated,
    /// 无差异
    Unchanged,
    /// 只创建模式下跳过了已有对象
    SkippedCreateOnly,
}

impl ApplyOutcome {
    /// 对应的条件原因
    pub fn reason(&self) -> &'static str {
        match self {
            ApplyOutcome::Created => REASON_CREATED,
            ApplyOutcome::Updated => REASON_UPDATED,
            ApplyOutcome::Unchanged => REASON_UP_TO_DATE,
            ApplyOutcome::SkippedCreateOnly => REASON_CREATE_ONLY_SKIPPED,
        }
    }

    /// 用于日志与指标的短名称
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyOutcome::Created => "created",
            ApplyOutcome::Updated => "updated",
            ApplyOutcome::Unchanged => "unchanged",
            ApplyOutcome::SkippedCreateOnly => "skipped",
        }
    }
}

impl fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 由 Operator 生成并维护的对象
pub trait ManagedResource:
    Resource + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// 对象类型名称
    fn kind_name(&self) -> String;

    /// Operator 控制的字段是否与现有对象不同
    fn needs_update(existing: &Self, desired: &Self) -> bool;

    /// 替换前从现有对象继承服务端维护的字段
    fn prepare_update(desired: &mut Self, existing: &Self) {
        carry_metadata(desired.meta_mut(), existing.meta());
    }
}

/// 对单个对象的处理计划
#[derive(Debug)]
pub enum ApplyPlan<K> {
    /// 创建期望对象
    Create(K),
    /// 用准备好的对象替换现有对象
    Replace(K),
    /// 保持不变
    Keep(ApplyOutcome),
}

/// 根据现有对象决定如何处理期望对象
pub fn plan<K: ManagedResource>(existing: Option<&K>, mut desired: K, create_only: bool) -> ApplyPlan<K> {
    match existing {
        None => ApplyPlan::Create(desired),
        Some(_) if create_only => ApplyPlan::Keep(ApplyOutcome::SkippedCreateOnly),
        Some(existing) if !K::needs_update(existing, &desired) => {
            ApplyPlan::Keep(ApplyOutcome::Unchanged)
        }
        Some(existing) => {
            K::prepare_update(&mut desired, existing);
            ApplyPlan::Replace(desired)
        }
    }
}

/// 生成对象的读写接口
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore<K: ManagedResource>: Send + Sync {
    /// 按名称读取，不存在时返回 `None`
    async fn fetch(&self, name: &str) -> Result<Option<K>>;

    /// 创建新对象
    async fn create_new(&self, object: &K) -> Result<()>;

    /// 替换现有对象
    async fn replace_existing(&self, name: &str, object: &K) -> Result<()>;
}

#[async_trait]
impl<K: ManagedResource> ObjectStore<K> for Api<K> {
    async fn fetch(&self, name: &str) -> Result<Option<K>> {
        Ok(self.get_opt(name).await?)
    }

    async fn create_new(&self, object: &K) -> Result<()> {
        self.create(&PostParams::default(), object).await?;
        Ok(())
    }

    async fn replace_existing(&self, name: &str, object: &K) -> Result<()> {
        self.replace(name, &PostParams::default(), object).await?;
        Ok(())
    }
}

/// 创建或更新单个对象
pub async fn apply<K, S>(store: &S, desired: K, create_only: bool) -> Result<ApplyOutcome>
where
    K: ManagedResource,
    S: ObjectStore<K> + ?Sized,
{
    let kind = desired.kind_name();
    let name = desired
        .meta()
        .name
        .clone()
        .ok_or_else(|| OperatorError::MissingMetadata {
            kind: kind.clone(),
            field: "name",
        })?;

    let existing = store.fetch(&name).await?;
    let outcome = match plan(existing.as_ref(), desired, create_only) {
        ApplyPlan::Create(object) => {
            store.create_new(&object).await?;
            info!(kind = %kind, name = %name, "已创建对象");
            ApplyOutcome::Created
        }
        ApplyPlan::Replace(object) => {
            store.replace_existing(&name, &object).await?;
            info!(kind = %kind, name = %name, "已更新对象");
            ApplyOutcome::Updated
        }
        ApplyPlan::Keep(outcome) => {
            debug!(kind = %kind, name = %name, outcome = %outcome, "对象无需变更");
            outcome
        }
    };

    Ok(outcome)
}

/// 期望的键值是否都以相同的值存在于现有集合中
fn is_subset(existing: &Option<BTreeMap<String, String>>, desired: &Option<BTreeMap<String, String>>) -> bool {
    let Some(desired) = desired else {
        return true;
    };
    let empty = BTreeMap::new();
    let existing = existing.as_ref().unwrap_or(&empty);
    desired.iter().all(|(k, v)| existing.get(k) == Some(v))
}

fn metadata_differs(existing: &ObjectMeta, desired: &ObjectMeta) -> bool {
    !is_subset(&existing.labels, &desired.labels)
        || !is_subset(&existing.annotations, &desired.annotations)
}

/// 继承 resourceVersion，并保留其他参与者写入的标签与注解
fn carry_metadata(desired: &mut ObjectMeta, existing: &ObjectMeta) {
    desired.resource_version = existing.resource_version.clone();
    desired.labels = merge_maps(&existing.labels, desired.labels.take());
    desired.annotations = merge_maps(&existing.annotations, desired.annotations.take());
}

fn merge_maps(
    existing: &Option<BTreeMap<String, String>>,
    desired: Option<BTreeMap<String, String>>,
) -> Option<BTreeMap<String, String>> {
    match (existing, desired) {
        (None, desired) => desired,
        (Some(existing), None) => Some(existing.clone()),
        (Some(existing), Some(desired)) => {
            let mut merged = existing.clone();
            merged.extend(desired);
            Some(merged)
        }
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
        _ => false,
    }
}

/// `desired` 中出现的字段是否都以相同的值存在于 `existing`
///
/// 数组按位置逐项比较，长度必须一致；`existing` 多出的字段视为服务端默认值。
fn json_subset(desired: &Value, existing: &Value) -> bool {
    match (desired, existing) {
        (Value::Object(desired), Value::Object(existing)) => {
            desired.iter().all(|(key, value)| match existing.get(key) {
                Some(current) => json_subset(value, current),
                None => is_empty_value(value),
            })
        }
        (Value::Array(desired), Value::Array(existing)) => {
            desired.len() == existing.len()
                && desired.iter().zip(existing).all(|(d, e)| json_subset(d, e))
        }
        (Value::Null, _) => true,
        (Value::Number(d), Value::Number(e)) => d.as_f64() == e.as_f64(),
        (desired, existing) => desired == existing,
    }
}

/// 以 JSON 形式比较，`existing` 覆盖 `desired` 的全部字段即视为相同
fn covers<T: Serialize>(existing: &T, desired: &T) -> bool {
    match (serde_json::to_value(existing), serde_json::to_value(desired)) {
        (Ok(existing), Ok(desired)) => json_subset(&desired, &existing),
        _ => false,
    }
}

const QUANTITY_SUFFIXES: [(&str, f64); 15] = [
    ("Ki", 1024.0),
    ("Mi", 1_048_576.0),
    ("Gi", 1_073_741_824.0),
    ("Ti", 1_099_511_627_776.0),
    ("Pi", 1_125_899_906_842_624.0),
    ("Ei", 1_152_921_504_606_846_976.0),
    ("n", 1e-9),
    ("u", 1e-6),
    ("m", 1e-3),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
];

/// 资源数量的数值，`500m` 与 `0.5`、`1Gi` 与 `1073741824` 相同
fn quantity_value(quantity: &Quantity) -> Option<f64> {
    let text = quantity.0.trim();
    QUANTITY_SUFFIXES
        .iter()
        .find_map(|(suffix, factor)| {
            text.strip_suffix(suffix)
                .and_then(|number| number.parse::<f64>().ok())
                .map(|number| number * factor)
        })
        .or_else(|| text.parse::<f64>().ok())
}

fn same_quantity(existing: Option<&Quantity>, desired: Option<&Quantity>) -> bool {
    match (existing, desired) {
        (None, None) => true,
        (Some(e), Some(d)) => match (quantity_value(e), quantity_value(d)) {
            (Some(a), Some(b)) => a == b || (a - b).abs() <= 1e-9 * a.abs().max(b.abs()),
            _ => e.0 == d.0,
        },
        _ => false,
    }
}

/// 资源限制与请求的比较；未声明的请求由服务端按限制补全
fn resources_differ(existing: Option<&ResourceRequirements>, desired: Option<&ResourceRequirements>) -> bool {
    let lookup = |r: Option<&ResourceRequirements>, limits: bool, key: &str| -> Option<Quantity> {
        r.and_then(|r| if limits { r.limits.as_ref() } else { r.requests.as_ref() })
            .and_then(|m| m.get(key))
            .cloned()
    };

    let mut keys = BTreeSet::new();
    for r in [existing, desired].into_iter().flatten() {
        for map in [r.limits.as_ref(), r.requests.as_ref()].into_iter().flatten() {
            keys.extend(map.keys().cloned());
        }
    }

    keys.iter().any(|key| {
        let desired_limit = lookup(desired, true, key);
        let desired_request = lookup(desired, false, key).or_else(|| desired_limit.clone());
        !same_quantity(lookup(existing, true, key).as_ref(), desired_limit.as_ref())
            || !same_quantity(lookup(existing, false, key).as_ref(), desired_request.as_ref())
    })
}

fn volumes_differ(existing: &[Volume], desired: &[Volume]) -> bool {
    existing.len() != desired.len()
        || existing
            .iter()
            .zip(desired)
            .any(|(e, d)| e.name != d.name || !covers(e, d))
}

/// 环境变量的比较形式；字段引用只比较路径，apiVersion 由服务端补全
fn env_fingerprint(env: &Option<Vec<EnvVar>>) -> Vec<(String, Option<String>, Option<String>)> {
    env.iter()
        .flatten()
        .map(|e| {
            let field = e
                .value_from
                .as_ref()
                .and_then(|v| v.field_ref.as_ref())
                .map(|f| f.field_path.clone());
            (e.name.clone(), e.value.clone(), field)
        })
        .collect()
}

fn container_differs(existing: &Container, desired: &Container) -> bool {
    let mounts = |c: &Container| -> Vec<(String, String, bool)> {
        c.volume_mounts
            .iter()
            .flatten()
            .map(|m| (m.name.clone(), m.mount_path.clone(), m.read_only.unwrap_or(false)))
            .collect()
    };

    existing.image != desired.image
        || existing.args != desired.args
        || existing.command != desired.command
        || env_fingerprint(&existing.env) != env_fingerprint(&desired.env)
        || resources_differ(existing.resources.as_ref(), desired.resources.as_ref())
        || mounts(existing) != mounts(desired)
}

fn containers_differ(existing: &[Container], desired: &[Container]) -> bool {
    existing.len() != desired.len()
        || desired.iter().any(|d| match existing.iter().find(|e| e.name == d.name) {
            Some(e) => container_differs(e, d),
            None => true,
        })
}

/// Pod 模板比较：模板元数据、容器、调度与卷
fn pod_template_differs(existing: &PodTemplateSpec, desired: &PodTemplateSpec) -> bool {
    let empty_meta = ObjectMeta::default();
    let existing_meta = existing.metadata.as_ref().unwrap_or(&empty_meta);
    let desired_meta = desired.metadata.as_ref().unwrap_or(&empty_meta);
    if metadata_differs(existing_meta, desired_meta) {
        return true;
    }

    let (Some(existing), Some(desired)) = (&existing.spec, &desired.spec) else {
        return existing.spec.is_some() != desired.spec.is_some();
    };

    containers_differ(&existing.containers, &desired.containers)
        || containers_differ(
            existing.init_containers.as_deref().unwrap_or_default(),
            desired.init_containers.as_deref().unwrap_or_default(),
        )
        || existing.service_account_name != desired.service_account_name
        || existing.node_selector.clone().unwrap_or_default()
            != desired.node_selector.clone().unwrap_or_default()
        || existing.tolerations.clone().unwrap_or_default()
            != desired.tolerations.clone().unwrap_or_default()
        || existing.affinity != desired.affinity
        || volumes_differ(
            existing.volumes.as_deref().unwrap_or_default(),
            desired.volumes.as_deref().unwrap_or_default(),
        )
}

impl ManagedResource for ConfigMap {
    fn kind_name(&self) -> String {
        "ConfigMap".to_string()
    }

    /// 期望对象未声明 data 时（信任包）不比较内容
    fn needs_update(existing: &Self, desired: &Self) -> bool {
        metadata_differs(&existing.metadata, &desired.metadata)
            || (desired.data.is_some() && existing.data != desired.data)
    }

    fn prepare_update(desired: &mut Self, existing: &Self) {
        carry_metadata(&mut desired.metadata, &existing.metadata);
        if desired.data.is_none() {
            desired.data = existing.data.clone();
            desired.binary_data = existing.binary_data.clone();
        }
    }
}

impl ManagedResource for ServiceAccount {
    fn kind_name(&self) -> String {
        "ServiceAccount".to_string()
    }

    fn needs_update(existing: &Self, desired: &Self) -> bool {
        metadata_differs(&existing.metadata, &desired.metadata)
    }

    /// 令牌与拉取凭据由集群维护
    fn prepare_update(desired: &mut Self, existing: &Self) {
        carry_metadata(&mut desired.metadata, &existing.metadata);
        desired.secrets = existing.secrets.clone();
        desired.image_pull_secrets = existing.image_pull_secrets.clone();
    }
}

fn port_fingerprint(ports: &[ServicePort]) -> Vec<(Option<String>, i32, Option<String>, String)> {
    ports
        .iter()
        .map(|p| {
            let target = p.target_port.as_ref().map(|t| match t {
                k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(i) => i.to_string(),
                k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::String(s) => s.clone(),
            });
            let protocol = p.protocol.clone().unwrap_or_else(|| "TCP".to_string());
            (p.name.clone(), p.port, target, protocol)
        })
        .collect()
}

impl ManagedResource for Service {
    fn kind_name(&self) -> String {
        "Service".to_string()
    }

    fn needs_update(existing: &Self, desired: &Self) -> bool {
        if metadata_differs(&existing.metadata, &desired.metadata) {
            return true;
        }
        let (Some(existing), Some(desired)) = (&existing.spec, &desired.spec) else {
            return desired.spec.is_some();
        };
        existing.selector != desired.selector
            || existing.type_ != desired.type_
            || port_fingerprint(existing.ports.as_deref().unwrap_or_default())
                != port_fingerprint(desired.ports.as_deref().unwrap_or_default())
    }

    /// clusterIP 创建后不可变
    fn prepare_update(desired: &mut Self, existing: &Self) {
        carry_metadata(&mut desired.metadata, &existing.metadata);
        if let (Some(desired), Some(existing)) = (desired.spec.as_mut(), existing.spec.as_ref()) {
            desired.cluster_ip = existing.cluster_ip.clone();
            desired.cluster_ips = existing.cluster_ips.clone();
            desired.ip_families = existing.ip_families.clone();
            desired.ip_family_policy = existing.ip_family_policy.clone();
        }
    }
}

impl ManagedResource for ClusterRole {
    fn kind_name(&self) -> String {
        "ClusterRole".to_string()
    }

    fn needs_update(existing: &Self, desired: &Self) -> bool {
        metadata_differs(&existing.metadata, &desired.metadata) || existing.rules != desired.rules
    }
}

impl ManagedResource for Role {
    fn kind_name(&self) -> String {
        "Role".to_string()
    }

    fn needs_update(existing: &Self, desired: &Self) -> bool {
        metadata_differs(&existing.metadata, &desired.metadata) || existing.rules != desired.rules
    }
}

// roleRef 不可变，只比较主体
impl ManagedResource for ClusterRoleBinding {
    fn kind_name(&self) -> String {
        "ClusterRoleBinding".to_string()
    }

    fn needs_update(existing: &Self, desired: &Self) -> bool {
        metadata_differs(&existing.metadata, &desired.metadata)
            || existing.subjects != desired.subjects
    }
}

impl ManagedResource for RoleBinding {
    fn kind_name(&self) -> String {
        "RoleBinding".to_string()
    }

    fn needs_update(existing: &Self, desired: &Self) -> bool {
        metadata_differs(&existing.metadata, &desired.metadata)
            || existing.subjects != desired.subjects
    }
}

impl ManagedResource for DaemonSet {
    fn kind_name(&self) -> String {
        "DaemonSet".to_string()
    }

    fn needs_update(existing: &Self, desired: &Self) -> bool {
        if metadata_differs(&existing.metadata, &desired.metadata) {
            return true;
        }
        match (&existing.spec, &desired.spec) {
            (Some(e), Some(d)) => pod_template_differs(&e.template, &d.template),
            (e, d) => e.is_some() != d.is_some(),
        }
    }
}

impl ManagedResource for Deployment {
    fn kind_name(&self) -> String {
        "Deployment".to_string()
    }

    fn needs_update(existing: &Self, desired: &Self) -> bool {
        if metadata_differs(&existing.metadata, &desired.metadata) {
            return true;
        }
        match (&existing.spec, &desired.spec) {
            (Some(e), Some(d)) => {
                e.replicas != d.replicas || pod_template_differs(&e.template, &d.template)
            }
            (e, d) => e.is_some() != d.is_some(),
        }
    }
}

impl ManagedResource for StatefulSet {
    fn kind_name(&self) -> String {
        "StatefulSet".to_string()
    }

    fn needs_update(existing: &Self, desired: &Self) -> bool {
        if metadata_differs(&existing.metadata, &desired.metadata) {
            return true;
        }
        match (&existing.spec, &desired.spec) {
            (Some(e), Some(d)) => {
                e.replicas != d.replicas || pod_template_differs(&e.template, &d.template)
            }
            (e, d) => e.is_some() != d.is_some(),
        }
    }

    /// volumeClaimTemplates 创建后不可变
    fn prepare_update(desired: &mut Self, existing: &Self) {
        carry_metadata(&mut desired.metadata, &existing.metadata);
        if let (Some(desired), Some(existing)) = (desired.spec.as_mut(), existing.spec.as_ref()) {
            desired.volume_claim_templates = existing.volume_claim_templates.clone();
        }
    }
}

impl ManagedResource for CSIDriver {
    fn kind_name(&self) -> String {
        "CSIDriver".to_string()
    }

    fn needs_update(existing: &Self, desired: &Self) -> bool {
        let (e, d) = (&existing.spec, &desired.spec);
        metadata_differs(&existing.metadata, &desired.metadata)
            || e.attach_required != d.attach_required
            || e.pod_info_on_mount != d.pod_info_on_mount
            || e.fs_group_policy != d.fs_group_policy
            || e.volume_lifecycle_modes != d.volume_lifecycle_modes
    }
}

impl ManagedResource for DynamicObject {
    fn kind_name(&self) -> String {
        self.types
            .as_ref()
            .map(|t| t.kind.clone())
            .unwrap_or_else(|| "DynamicObject".to_string())
    }

    /// 只比较期望对象中出现的字段，服务端生成的字段（如 Route 的 host）不参与
    fn needs_update(existing: &Self, desired: &Self) -> bool {
        metadata_differs(&existing.metadata, &desired.metadata)
            || !json_subset(&desired.data, &existing.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::StatefulSetSpec;
    use k8s_openapi::api::core::v1::{
        CSIVolumeSource, ConfigMapVolumeSource, EnvVarSource, ObjectFieldSelector,
        PersistentVolumeClaim, PodSpec, ServiceSpec,
    };
    use rstest::rstest;
    use serde_json::json;

    fn meta(labels: &[(&str, &str)]) -> ObjectMeta {
        ObjectMeta {
            name: Some("spire-agent".to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn config_map(data: Option<&str>) -> ConfigMap {
        ConfigMap {
            metadata: meta(&[("app", "spire")]),
            data: data.map(|d| BTreeMap::from([("agent.conf".to_string(), d.to_string())])),
            ..Default::default()
        }
    }

    fn stored<K: ManagedResource>(mut object: K) -> K {
        object.meta_mut().resource_version = Some("42".to_string());
        object
    }

    #[rstest]
    #[case(&[("app", "spire")], &[("app", "spire")], false)]
    #[case(&[("app", "spire"), ("extra", "x")], &[("app", "spire")], false)]
    #[case(&[("app", "other")], &[("app", "spire")], true)]
    #[case(&[], &[("app", "spire")], true)]
    fn test_label_subset(
        #[case] existing: &[(&str, &str)],
        #[case] desired: &[(&str, &str)],
        #[case] expected: bool,
    ) {
        assert_eq!(metadata_differs(&meta(existing), &meta(desired)), expected);
    }

    #[test]
    fn test_plan_create_and_create_only() {
        let desired = config_map(Some("{}"));
        assert!(matches!(plan(None, desired.clone(), false), ApplyPlan::Create(_)));
        assert!(matches!(plan(None, desired.clone(), true), ApplyPlan::Create(_)));

        let existing = stored(config_map(Some("old")));
        assert!(matches!(
            plan(Some(&existing), desired, true),
            ApplyPlan::Keep(ApplyOutcome::SkippedCreateOnly)
        ));
    }

    #[test]
    fn test_plan_replace_carries_resource_version() {
        let existing = stored(config_map(Some("old")));
        match plan(Some(&existing), config_map(Some("new")), false) {
            ApplyPlan::Replace(object) => {
                assert_eq!(object.metadata.resource_version.as_deref(), Some("42"));
                assert_eq!(object.data.unwrap()["agent.conf"], "new");
            }
            other => panic!("unexpected plan: {other:?}"),
        }
    }

    #[test]
    fn test_plan_unchanged() {
        let existing = stored(config_map(Some("same")));
        assert!(matches!(
            plan(Some(&existing), config_map(Some("same")), false),
            ApplyPlan::Keep(ApplyOutcome::Unchanged)
        ));
    }

    #[test]
    fn test_bundle_config_map_keeps_data() {
        let existing = stored(config_map(Some("bundle")));
        let desired = config_map(None);
        assert!(!ConfigMap::needs_update(&existing, &desired));

        let mut relabeled = config_map(None);
        relabeled.metadata.labels = Some(BTreeMap::from([("app".into(), "new".into())]));
        match plan(Some(&existing), relabeled, false) {
            ApplyPlan::Replace(object) => {
                assert_eq!(object.data.unwrap()["agent.conf"], "bundle");
            }
            other => panic!("unexpected plan: {other:?}"),
        }
    }

    #[test]
    fn test_carry_metadata_keeps_foreign_annotations() {
        let mut existing = stored(config_map(Some("old")));
        existing.metadata.annotations = Some(BTreeMap::from([(
            "openshift.io/owning-component".to_string(),
            "x".to_string(),
        )]));
        let mut desired = config_map(Some("new"));
        ConfigMap::prepare_update(&mut desired, &existing);
        assert_eq!(
            desired.metadata.annotations.unwrap()["openshift.io/owning-component"],
            "x"
        );
    }

    fn service(cluster_ip: Option<&str>, port: i32) -> Service {
        Service {
            metadata: meta(&[]),
            spec: Some(ServiceSpec {
                cluster_ip: cluster_ip.map(str::to_string),
                ports: Some(vec![ServicePort {
                    name: Some("grpc".into()),
                    port,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_service_keeps_cluster_ip() {
        let existing = stored(service(Some("10.0.0.7"), 443));
        assert!(!Service::needs_update(&existing, &service(None, 443)));

        match plan(Some(&existing), service(None, 8443), false) {
            ApplyPlan::Replace(object) => {
                assert_eq!(object.spec.unwrap().cluster_ip.as_deref(), Some("10.0.0.7"));
            }
            other => panic!("unexpected plan: {other:?}"),
        }
    }

    fn container(image: &str) -> Container {
        Container {
            name: "spire-server".into(),
            image: Some(image.into()),
            env: Some(vec![EnvVar {
                name: "MY_NODE_NAME".into(),
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        field_path: "spec.nodeName".into(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    fn stateful_set(image: &str, hash: &str, claim_size: &str) -> StatefulSet {
        StatefulSet {
            metadata: meta(&[]),
            spec: Some(StatefulSetSpec {
                replicas: Some(1),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        annotations: Some(BTreeMap::from([("hash".into(), hash.into())])),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container(image)],
                        ..Default::default()
                    }),
                },
                volume_claim_templates: Some(vec![PersistentVolumeClaim {
                    metadata: ObjectMeta {
                        name: Some(claim_size.into()),
                        ..Default::default()
                    },
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_stateful_set_hash_and_image_changes() {
        let existing = stored(stateful_set("server:1", "a", "1Gi"));
        assert!(!StatefulSet::needs_update(&existing, &stateful_set("server:1", "a", "1Gi")));
        assert!(StatefulSet::needs_update(&existing, &stateful_set("server:1", "b", "1Gi")));
        assert!(StatefulSet::needs_update(&existing, &stateful_set("server:2", "a", "1Gi")));
        // 声明模板不参与比较
        assert!(!StatefulSet::needs_update(&existing, &stateful_set("server:1", "a", "5Gi")));
    }

    #[test]
    fn test_stateful_set_keeps_claim_templates() {
        let existing = stored(stateful_set("server:1", "a", "1Gi"));
        match plan(Some(&existing), stateful_set("server:1", "b", "5Gi"), false) {
            ApplyPlan::Replace(object) => {
                let claims = object.spec.unwrap().volume_claim_templates.unwrap();
                assert_eq!(claims[0].metadata.name.as_deref(), Some("1Gi"));
            }
            other => panic!("unexpected plan: {other:?}"),
        }
    }

    #[test]
    fn test_env_api_version_defaulting_ignored() {
        let mut defaulted = container("server:1");
        if let Some(env) = defaulted.env.as_mut() {
            if let Some(field) = env[0].value_from.as_mut().and_then(|v| v.field_ref.as_mut()) {
                field.api_version = Some("v1".into());
            }
        }
        assert!(!container_differs(&defaulted, &container("server:1")));
    }

    #[test]
    fn test_dynamic_object_compares_desired_fields() {
        let ar = crate::resources::route_api_resource();
        let mut existing = DynamicObject::new("route", &ar);
        existing.data = json!({"spec": {"host": "a.example.org"}, "status": {"ingress": []}});
        let mut desired = DynamicObject::new("route", &ar);
        desired.data = json!({"spec": {"host": "a.example.org"}});
        assert!(!DynamicObject::needs_update(&existing, &desired));

        desired.data = json!({"spec": {"host": "b.example.org"}});
        assert!(DynamicObject::needs_update(&existing, &desired));
        assert_eq!(desired.kind_name(), "Route");
    }

    #[test]
    fn test_outcome_reasons() {
        assert_eq!(ApplyOutcome::Created.reason(), "Created");
        assert_eq!(ApplyOutcome::Updated.reason(), "Updated");
        assert_eq!(ApplyOutcome::Unchanged.reason(), "UpToDate");
        assert_eq!(ApplyOutcome::SkippedCreateOnly.reason(), "CreateOnlySkipped");
    }

    #[rstest]
    #[case("500m", "0.5", true)]
    #[case("1Gi", "1073741824", true)]
    #[case("1k", "1000", true)]
    #[case("1e3", "1k", true)]
    #[case("128Mi", "128M", false)]
    #[case("100m", "200m", false)]
    fn test_quantity_normalization(#[case] a: &str, #[case] b: &str, #[case] same: bool) {
        assert_eq!(
            same_quantity(Some(&Quantity(a.into())), Some(&Quantity(b.into()))),
            same
        );
    }

    fn requirements(limits: &[(&str, &str)], requests: &[(&str, &str)]) -> ResourceRequirements {
        let map = |pairs: &[(&str, &str)]| -> Option<BTreeMap<String, Quantity>> {
            (!pairs.is_empty()).then(|| {
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
                    .collect()
            })
        };
        ResourceRequirements {
            limits: map(limits),
            requests: map(requests),
            ..Default::default()
        }
    }

    #[test]
    fn test_resources_defaulted_requests() {
        // 只声明限制时服务端把请求补成同样的值
        let desired = requirements(&[("cpu", "0.5")], &[]);
        let stored = requirements(&[("cpu", "500m")], &[("cpu", "500m")]);
        assert!(!resources_differ(Some(&stored), Some(&desired)));

        let lowered = requirements(&[("cpu", "250m")], &[]);
        assert!(resources_differ(Some(&stored), Some(&lowered)));
        assert!(resources_differ(Some(&stored), None));
        assert!(!resources_differ(None, Some(&ResourceRequirements::default())));
    }

    #[test]
    fn test_plan_ignores_server_defaults() {
        let mut desired_container = container("server:1");
        desired_container.resources = Some(requirements(&[("memory", "1Gi")], &[("cpu", "0.5")]));
        let mut live_container = desired_container.clone();
        live_container.resources = Some(requirements(
            &[("memory", "1073741824")],
            &[("cpu", "500m"), ("memory", "1073741824")],
        ));
        live_container.termination_message_path = Some("/dev/termination-log".into());

        let mut desired = stateful_set("server:1", "a", "1Gi");
        let mut live = stored(stateful_set("server:1", "a", "1Gi"));
        desired.spec.as_mut().unwrap().template.spec.as_mut().unwrap().containers =
            vec![desired_container];
        live.spec.as_mut().unwrap().template.spec.as_mut().unwrap().containers =
            vec![live_container];

        assert!(matches!(
            plan(Some(&live), desired, false),
            ApplyPlan::Keep(ApplyOutcome::Unchanged)
        ));

        let ar = crate::resources::route_api_resource();
        let mut route = DynamicObject::new("spire-oidc-discovery-provider", &ar);
        route.data = json!({"spec": {"to": {"kind": "Service", "name": "oidc"}, "tls": {}}});
        let mut live_route = stored(route.clone());
        live_route.data = json!({
            "spec": {
                "host": "oidc.apps.example.org",
                "to": {"kind": "Service", "name": "oidc", "weight": 100},
                "wildcardPolicy": "None"
            },
            "status": {"ingress": []}
        });
        assert!(matches!(
            plan(Some(&live_route), route, false),
            ApplyPlan::Keep(ApplyOutcome::Unchanged)
        ));
    }

    #[test]
    fn test_json_subset() {
        assert!(json_subset(&json!({"a": [{"b": 1}]}), &json!({"a": [{"b": 1.0, "c": 2}], "d": 3})));
        assert!(!json_subset(&json!({"a": [1, 2]}), &json!({"a": [1]})));
        assert!(!json_subset(&json!({"a": "x"}), &json!({})));
        assert!(json_subset(&json!({"a": [], "b": null}), &json!({})));
    }

    fn volume(name: &str, driver: Option<&str>) -> Volume {
        Volume {
            name: name.into(),
            csi: driver.map(|d| CSIVolumeSource {
                driver: d.into(),
                read_only: Some(true),
                ..Default::default()
            }),
            config_map: driver.is_none().then(|| ConfigMapVolumeSource {
                name: Some(name.into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_volume_source_changes() {
        let desired = vec![volume("spiffe-workload-api", Some("csi.spiffe.io")), volume("config", None)];
        let mut live = desired.clone();
        if let Some(cm) = live[1].config_map.as_mut() {
            cm.default_mode = Some(420);
        }
        assert!(!volumes_differ(&live, &desired));

        let renamed = vec![volume("spiffe-workload-api", Some("workload.example.io")), volume("config", None)];
        assert!(volumes_differ(&live, &renamed));
    }

    fn named_service(cluster_ip: Option<&str>, port: i32) -> Service {
        let mut svc = service(cluster_ip, port);
        svc.metadata.name = Some("spire-server".into());
        svc
    }

    #[tokio::test]
    async fn test_apply_creates_missing_object() {
        let mut store = MockObjectStore::<Service>::new();
        store
            .expect_fetch()
            .withf(|name: &str| name == "spire-server")
            .times(1)
            .returning(|_| Ok(None));
        store
            .expect_create_new()
            .withf(|svc: &Service| svc.metadata.name.as_deref() == Some("spire-server"))
            .times(1)
            .returning(|_| Ok(()));

        let outcome = apply(&store, named_service(None, 443), false).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Created);
    }

    #[tokio::test]
    async fn test_apply_create_only_leaves_existing() {
        let mut store = MockObjectStore::<Service>::new();
        store
            .expect_fetch()
            .returning(|_| Ok(Some(stored(named_service(Some("10.0.0.7"), 8443)))));
        store.expect_create_new().never();
        store.expect_replace_existing().never();

        let outcome = apply(&store, named_service(None, 443), true).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::SkippedCreateOnly);
    }

    #[tokio::test]
    async fn test_apply_replace_keeps_cluster_ip() {
        let mut store = MockObjectStore::<Service>::new();
        store
            .expect_fetch()
            .returning(|_| Ok(Some(stored(named_service(Some("10.0.0.7"), 8443)))));
        store
            .expect_replace_existing()
            .withf(|name: &str, svc: &Service| {
                name == "spire-server"
                    && svc.metadata.resource_version.as_deref() == Some("42")
                    && svc.spec.as_ref().and_then(|s| s.cluster_ip.as_deref()) == Some("10.0.0.7")
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let outcome = apply(&store, named_service(None, 443), false).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Updated);
    }

    #[tokio::test]
    async fn test_apply_replace_keeps_claim_templates() {
        let mut store = MockObjectStore::<StatefulSet>::new();
        store
            .expect_fetch()
            .returning(|_| Ok(Some(stored(stateful_set("server:1", "a", "1Gi")))));
        store
            .expect_replace_existing()
            .withf(|_: &str, sts: &StatefulSet| {
                let claims = sts
                    .spec
                    .as_ref()
                    .and_then(|s| s.volume_claim_templates.as_ref());
                claims.and_then(|c| c[0].metadata.name.as_deref()) == Some("1Gi")
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let outcome = apply(&store, stateful_set("server:2", "a", "5Gi"), false)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Updated);
    }

    #[tokio::test]
    async fn test_apply_requires_name() {
        let mut store = MockObjectStore::<ConfigMap>::new();
        store.expect_fetch().never();

        let mut unnamed = config_map(Some("{}"));
        unnamed.metadata.name = None;
        let result = apply(&store, unnamed, false).await;
        assert!(matches!(result, Err(OperatorError::MissingMetadata { .. })));
    }
}
