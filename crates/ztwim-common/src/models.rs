//! 数据模型模块
//!
//! 该模块定义了共享的核心数据模型：资源状态条件以及 SPIFFE 身份标识。

pub mod condition;
pub mod spiffe;
