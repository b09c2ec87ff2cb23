//! # RIS集成模块
//!
//! 对外部系统的集成，目前提供邮件投递：
//! - 通过 HTTP 邮件网关发送
//! - 只写日志的本地发送器（开发环境）

pub mod mail;

pub use mail::{HttpMailSender, LogMailSender, MailPayload};
