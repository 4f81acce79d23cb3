//! ZTWIM Common - 跨模块共享工具与数据结构
//!
//! 该模块提供 Zero Trust Workload Identity Manager 各组件共享的数据结构、
//! 错误处理和工具函数。包括状态条件模型、SPIFFE 信任域校验以及
//! 用于变更检测的确定性配置哈希。

pub mod error;
pub mod hash;
pub mod models;

/// 重新导出常用类型，方便使用
pub use error::Error;
pub use error::Result;
pub use hash::generate_config_hash;
pub use models::condition::*;
pub use models::spiffe::*;
