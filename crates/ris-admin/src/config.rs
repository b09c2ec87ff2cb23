//! 配置管理
//!
//! 配置按以下顺序叠加：内置默认值、可选的 TOML 文件、`RIS_` 前缀的环境变量。
//! 嵌套字段在环境变量中用双下划线分隔，例如 `RIS_SERVER__PORT=9090`。

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use ris_core::{AppSettings, Role, User};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// RIS系统完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RisConfig {
    /// 服务器配置
    pub server: ServerConfig,
    /// 数据库配置
    pub database: DatabaseConfig,
    /// 影像文件存储配置
    pub storage: StorageConfig,
    /// 邮件配置
    pub email: EmailConfig,
    /// 功能开关
    pub features: FeatureConfig,
    /// 日志配置
    pub logging: LoggingConfig,
    /// 登录配置
    pub auth: AuthConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 监听主机
    pub host: String,
    /// 监听端口
    pub port: u16,
    /// 对外访问地址，用于邮件中的链接
    pub base_url: String,
    /// 请求超时时间（秒）
    pub request_timeout_secs: u64,
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// PostgreSQL 连接字符串，为空时使用内存存储
    pub url: String,
    /// 最大连接数
    pub max_connections: u32,
    /// 连接超时时间（秒）
    pub connect_timeout_secs: u64,
}

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// 影像文件根目录
    pub media_root: String,
}

/// 邮件配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub enabled: bool,
    /// 邮件网关地址，为空时只写日志
    pub gateway_url: String,
    pub api_key: Option<String>,
    pub from_address: String,
    pub timeout_secs: u64,
}

/// 功能开关
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// 原型模式：在接口响应中返回公开链接
    pub show_prototype: bool,
}

/// 日志格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Full,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别或过滤指令，例如 `info,ris_workflow=debug`
    pub level: String,
    /// 日志格式
    pub format: LogFormat,
}

/// 登录配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// 令牌有效期（小时）
    pub token_expiry_hours: i64,
    /// 系统用户
    pub users: Vec<UserSeed>,
}

/// 配置文件中的用户
///
/// 团队成员按用户ID记录，所以ID必须固定。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSeed {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub name: String,
    pub roles: Vec<Role>,
    /// 口令的 SHA-256 十六进制摘要
    pub password_sha256: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl UserSeed {
    pub fn to_user(&self) -> User {
        User {
            id: self.id,
            username: self.username.clone(),
            email: self.email.clone(),
            name: self.name.clone(),
            roles: self.roles.clone(),
            is_active: self.is_active,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            base_url: "http://localhost:8080".to_string(),
            request_timeout_secs: 300,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 20,
            connect_timeout_secs: 30,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            media_root: "./data/media".to_string(),
        }
    }
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            gateway_url: String::new(),
            api_key: None,
            from_address: "noreply@ris.local".to_string(),
            timeout_secs: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_expiry_hours: 24,
            users: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl DatabaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn is_memory(&self) -> bool {
        self.url.trim().is_empty()
    }
}

impl EmailConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl RisConfig {
    /// 加载配置：默认值、可选配置文件、环境变量
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let env = Environment::with_prefix("RIS")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true);
        Self::load_with(config_path, env)
    }

    fn load_with(config_path: Option<&Path>, env: Environment) -> Result<Self> {
        let defaults =
            Config::try_from(&RisConfig::default()).context("Failed to build default configuration")?;

        let mut builder = Config::builder().add_source(defaults);
        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path).required(true));
        }

        let settings = builder
            .add_source(env)
            .build()
            .context("Failed to read configuration")?;
        let config: RisConfig = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        ConfigValidator::new().validate(&config)?;

        match config_path {
            Some(path) => info!("Configuration loaded successfully from: {}", path.display()),
            None => info!("Configuration loaded from defaults and environment"),
        }
        Ok(config)
    }

    /// 运行时功能开关
    pub fn app_settings(&self) -> AppSettings {
        AppSettings {
            show_prototype: self.features.show_prototype,
            email_enabled: self.email.enabled,
        }
    }
}

/// 配置验证器
pub struct ConfigValidator {
    /// 验证规则
    validation_rules: Vec<ValidationRule>,
}

/// 验证规则
struct ValidationRule {
    /// 字段路径
    field_path: &'static str,
    /// 验证函数
    validator: fn(&RisConfig) -> Result<()>,
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigValidator {
    /// 创建新的配置验证器
    pub fn new() -> Self {
        let validation_rules = vec![
            ValidationRule {
                field_path: "server.port",
                validator: |config| {
                    anyhow::ensure!(config.server.port != 0, "Server port cannot be 0");
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "server.base_url",
                validator: |config| {
                    let url = config.server.base_url.as_str();
                    anyhow::ensure!(
                        url.starts_with("http://") || url.starts_with("https://"),
                        "Base URL must start with http:// or https://"
                    );
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "database.max_connections",
                validator: |config| {
                    anyhow::ensure!(
                        config.database.max_connections != 0,
                        "Database max connections cannot be 0"
                    );
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "storage.media_root",
                validator: |config| {
                    anyhow::ensure!(
                        !config.storage.media_root.trim().is_empty(),
                        "Media root cannot be empty"
                    );
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "auth.token_expiry_hours",
                validator: |config| {
                    anyhow::ensure!(
                        config.auth.token_expiry_hours > 0,
                        "Token expiry must be positive"
                    );
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "auth.users",
                validator: |config| {
                    let mut usernames = HashSet::new();
                    let mut ids = HashSet::new();
                    for user in &config.auth.users {
                        anyhow::ensure!(
                            usernames.insert(user.username.as_str()),
                            "Duplicate username '{}'",
                            user.username
                        );
                        anyhow::ensure!(ids.insert(user.id), "Duplicate user id {}", user.id);
                        let digest = user.password_sha256.trim();
                        anyhow::ensure!(
                            digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit()),
                            "User '{}' needs a 64-character hex password_sha256",
                            user.username
                        );
                    }
                    Ok(())
                },
            },
        ];

        Self { validation_rules }
    }

    /// 验证配置
    pub fn validate(&self, config: &RisConfig) -> Result<()> {
        for rule in &self.validation_rules {
            if let Err(e) = (rule.validator)(config) {
                error!("Configuration validation failed for {}: {}", rule.field_path, e);
                return Err(e.context(format!("Invalid {}", rule.field_path)));
            }
        }

        if config.auth.users.is_empty() {
            warn!("No users configured; nobody will be able to log in");
        }
        info!("Configuration validation passed");
        Ok(())
    }
}
