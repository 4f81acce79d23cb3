//! 配置哈希模块
//!
//! 为渲染后的配置生成确定性的 SHA-256 摘要。工作负载把摘要写入
//! Pod 模板注解，配置变化即触发滚动更新，同时作为更新检测的依据。

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::Result;

/// 生成配置哈希
///
/// 先序列化为 JSON，再按键名递归排序，保证相同内容得到相同摘要。
pub fn generate_config_hash<T: Serialize + ?Sized>(config: &T) -> Result<String> {
    let value = canonicalize(serde_json::to_value(config)?);
    let bytes = serde_json::to_vec(&value)?;
    Ok(hash_bytes(&bytes))
}

/// 对原始字节计算十六进制 SHA-256
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));

            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, canonicalize(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}
