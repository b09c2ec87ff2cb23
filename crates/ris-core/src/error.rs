//! 错误定义模块

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// 字段级验证错误集合
///
/// 键为表单字段名，值为该字段的全部错误消息。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FieldErrors(BTreeMap<String, Vec<String>>);

impl FieldErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// 只包含一个字段错误
    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut errors = Self::new();
        errors.add(field, message);
        errors
    }

    /// 添加字段错误
    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.entry(field.into()).or_default().push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.0.get(field).map(Vec::as_slice)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    /// 没有错误时返回 `Ok(())`，否则转为验证错误
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(RisError::Validation(self))
        }
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, messages) in &self.0 {
            for message in messages {
                if !first {
                    write!(f, "; ")?;
                }
                write!(f, "{}: {}", field, message)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// RIS系统统一错误类型
#[derive(Error, Debug)]
pub enum RisError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("数据库错误: {0}")]
    Database(String),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("文件过大: {size} 字节, 上限为 {max} 字节")]
    FileTooLarge { size: u64, max: u64 },

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("验证错误: {0}")]
    Validation(FieldErrors),

    #[error("权限错误: {0}")]
    Permission(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("预约冲突: {0}")]
    Conflict(String),

    #[error("订单 {0} 已完成, 无法继续流转")]
    AlreadyComplete(Uuid),

    #[error("无效状态转换: 从 {from} 执行 {action}")]
    InvalidStateTransition { from: String, action: String },

    #[error("系统内部错误: {0}")]
    Internal(String),
}

impl RisError {
    /// 单字段验证错误
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        RisError::Validation(FieldErrors::single(field, message))
    }
}

/// RIS系统统一结果类型
pub type Result<T> = std::result::Result<T, RisError>;
