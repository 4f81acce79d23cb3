//! 状态条件模型
//!
//! 所有自定义资源的 `status.conditions` 共用同一个条件结构，
//! 语义与 Kubernetes `metav1.Condition` 保持一致：按类型唯一，
//! 只有状态值发生变化时才刷新 `lastTransitionTime`。

use chrono::{SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 条件类型：资源整体就绪
pub const CONDITION_READY: &str = "Ready";
/// 条件类型：存在失败的组件
pub const CONDITION_DEGRADED: &str = "Degraded";
/// 条件类型：只创建不更新模式
pub const CONDITION_CREATE_ONLY_MODE: &str = "CreateOnlyMode";
/// 条件类型：是否允许升级
pub const CONDITION_UPGRADEABLE: &str = "Upgradeable";

/// 原因：就绪
pub const REASON_READY: &str = "Ready";
/// 原因：失败
pub const REASON_FAILED: &str = "Failed";
/// 原因：资源已创建
pub const REASON_CREATED: &str = "Created";
/// 原因：资源已更新
pub const REASON_UPDATED: &str = "Updated";
/// 原因：资源已是最新
pub const REASON_UP_TO_DATE: &str = "UpToDate";
/// 原因：只创建模式下跳过更新
pub const REASON_CREATE_ONLY_SKIPPED: &str = "CreateOnlySkipped";
/// 原因：工作负载尚未就绪
pub const REASON_WORKLOAD_NOT_READY: &str = "WorkloadNotReady";
/// 原因：Kubernetes API 暂时不可用，稍后重试
pub const REASON_RETRYING: &str = "Retrying";
/// 原因：缺少 ZeroTrustWorkloadIdentityManager 资源
pub const REASON_ZTWIM_NOT_FOUND: &str = "ZTWIMNotFound";
/// 原因：资源规范无效
pub const REASON_INVALID_SPEC: &str = "InvalidSpec";
/// 原因：只创建模式已启用
pub const REASON_CREATE_ONLY_ENABLED: &str = "CreateOnlyModeEnabled";
/// 原因：只创建模式已关闭
pub const REASON_CREATE_ONLY_DISABLED: &str = "CreateOnlyModeDisabled";

/// 条件状态值
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    /// 成立
    True,
    /// 不成立
    False,
    /// 未知
    Unknown,
}

impl ConditionStatus {
    /// 由布尔值转换
    pub fn from_bool(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionStatus::True => write!(f, "True"),
            ConditionStatus::False => write!(f, "False"),
            ConditionStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// 资源状态条件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// 条件类型
    #[serde(rename = "type")]
    pub type_: String,
    /// 条件状态
    pub status: ConditionStatus,
    /// 机器可读的原因
    #[serde(default)]
    pub reason: String,
    /// 人类可读的说明
    #[serde(default)]
    pub message: String,
    /// 上次状态变化时间（RFC3339）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
    /// 观测到的资源代数
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// 创建新的条件，时间戳为当前时间
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Some(now_rfc3339()),
            observed_generation: None,
        }
    }

    /// 设置观测代数
    pub fn with_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    /// 条件是否成立
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// 当前时间的 RFC3339 表示
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// 按类型写入条件
///
/// 状态值未变化时保留原有的 `lastTransitionTime`。
/// 返回条件内容是否发生了变化。
pub fn set_condition(conditions: &mut Vec<Condition>, mut new: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == new.type_) {
        Some(existing) => {
            if existing.status == new.status {
                new.last_transition_time = existing.last_transition_time.clone();
            }
            let changed = existing.status != new.status
                || existing.reason != new.reason
                || existing.message != new.message
                || existing.observed_generation != new.observed_generation;
            *existing = new;
            changed
        }
        None => {
            conditions.push(new);
            true
        }
    }
}

/// 按类型查找条件
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// 指定类型的条件是否成立
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).map_or(false, Condition::is_true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_time(mut c: Condition, time: &str) -> Condition {
        c.last_transition_time = Some(time.to_string());
        c
    }

    #[test]
    fn test_set_condition_inserts() {
        let mut conditions = vec![];
        let changed = set_condition(
            &mut conditions,
            Condition::new(CONDITION_READY, ConditionStatus::False, "Pending", ""),
        );
        assert!(changed);
        assert_eq!(conditions.len(), 1);
    }

    #[test]
    fn test_set_condition_keeps_transition_time_when_status_unchanged() {
        let mut conditions = vec![with_time(
            Condition::new(CONDITION_READY, ConditionStatus::False, "A", "first"),
            "2024-01-01T00:00:00Z",
        )];

        let changed = set_condition(
            &mut conditions,
            Condition::new(CONDITION_READY, ConditionStatus::False, "B", "second"),
        );

        assert!(changed);
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].reason, "B");
        assert_eq!(
            conditions[0].last_transition_time.as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
    }

    #[test]
    fn test_set_condition_refreshes_transition_time_on_flip() {
        let mut conditions = vec![with_time(
            Condition::new(CONDITION_READY, ConditionStatus::False, "A", ""),
            "2024-01-01T00:00:00Z",
        )];

        set_condition(
            &mut conditions,
            Condition::new(CONDITION_READY, ConditionStatus::True, REASON_READY, ""),
        );

        assert!(conditions[0].is_true());
        assert_ne!(
            conditions[0].last_transition_time.as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
    }

    #[test]
    fn test_set_condition_reports_no_change() {
        let mut conditions = vec![];
        let c = Condition::new(CONDITION_DEGRADED, ConditionStatus::False, "None", "");
        set_condition(&mut conditions, c.clone());
        assert!(!set_condition(&mut conditions, c));
    }

    #[test]
    fn test_find_and_is_true() {
        let conditions = vec![
            Condition::new(CONDITION_READY, ConditionStatus::True, REASON_READY, ""),
            Condition::new(CONDITION_DEGRADED, ConditionStatus::False, "None", ""),
        ];
        assert!(is_condition_true(&conditions, CONDITION_READY));
        assert!(!is_condition_true(&conditions, CONDITION_DEGRADED));
        assert!(!is_condition_true(&conditions, CONDITION_UPGRADEABLE));
        assert!(find_condition(&conditions, CONDITION_DEGRADED).is_some());
    }

    #[test]
    fn test_condition_serialization() {
        let c = Condition::new(CONDITION_READY, ConditionStatus::True, REASON_READY, "ok")
            .with_generation(Some(3));
        let value = serde_json::to_value(&c).unwrap();
        assert_eq!(value["type"], "Ready");
        assert_eq!(value["status"], "True");
        assert_eq!(value["observedGeneration"], 3);
        assert!(value["lastTransitionTime"].is_string());
    }
}
