//! # RIS存储模块
//!
//! 负责订单影像文件的本地存储。

pub mod storage;

pub use storage::*;
