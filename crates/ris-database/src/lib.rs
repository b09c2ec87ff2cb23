//! # RIS数据库模块
//!
//! 负责患者、团队、订单、影像和访问密钥的持久化。
//! 提供 PostgreSQL 实现和单进程使用的内存实现，二者共享 `EntityStore` 接口。

pub mod connection;
pub mod memory;
pub mod models;
pub mod queries;
pub mod store;

// 重新导出主要类型
pub use connection::DatabasePool;
pub use memory::MemoryStore;
pub use models::*;
pub use queries::PgStore;
pub use store::EntityStore;
