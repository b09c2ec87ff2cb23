//! RIS服务器主程序

use anyhow::{Context, Result};
use clap::Parser;
use ris_admin::{init_logging, DatabaseConfig, EmailConfig, RisConfig};
use ris_core::{MemoryDirectory, NotificationSender};
use ris_database::{DatabasePool, EntityStore, MemoryStore, PgStore};
use ris_integration::{HttpMailSender, LogMailSender};
use ris_storage::FileStorage;
use ris_web::{AppState, AuthService, ServerOptions, WebServer};
use ris_workflow::WorkflowEngine;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// RIS服务器命令行参数
#[derive(Parser, Debug)]
#[command(name = "ris-server")]
#[command(about = "RIS (Radiology Information System) 服务器")]
struct Args {
    /// 配置文件路径
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 服务器端口，覆盖配置文件
    #[arg(short, long)]
    port: Option<u16>,

    /// 日志级别，覆盖配置文件
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = RisConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    // 初始化日志
    init_logging(&config.logging)?;
    info!("Starting RIS server v{}", env!("CARGO_PKG_VERSION"));

    let store = open_store(&config.database).await?;

    let directory = Arc::new(MemoryDirectory::new());
    let auth = AuthService::new(directory.clone(), config.auth.token_expiry_hours);
    for seed in &config.auth.users {
        auth.register(seed.to_user(), &seed.password_sha256).await;
    }
    info!("Loaded {} user(s)", config.auth.users.len());

    let engine = WorkflowEngine::new(
        store,
        directory,
        mail_sender(&config.email)?,
        FileStorage::new(&config.storage.media_root),
        config.app_settings(),
        config.server.base_url.clone(),
    );

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "Invalid listen address {}:{}",
                config.server.host, config.server.port
            )
        })?;
    info!("  Base URL: {}", config.server.base_url);
    info!("  Media root: {}", config.storage.media_root);

    let options = ServerOptions {
        request_timeout: config.server.request_timeout(),
        ..ServerOptions::default()
    };
    WebServer::new(addr, AppState { engine, auth }, options)
        .run()
        .await
}

/// 数据库地址为空时使用内存存储
async fn open_store(config: &DatabaseConfig) -> Result<Arc<dyn EntityStore>> {
    if config.is_memory() {
        warn!("No database URL configured; using in-memory store (data is lost on restart)");
        return Ok(Arc::new(MemoryStore::new()));
    }

    let pool = DatabasePool::connect(&config.url, config.max_connections, config.connect_timeout())
        .await
        .context("Failed to connect to database")?;
    let store = PgStore::new(pool);
    store
        .create_tables()
        .await
        .context("Failed to create database schema")?;
    info!("Connected to PostgreSQL ({} max connections)", config.max_connections);
    Ok(Arc::new(store))
}

/// 未配置邮件网关时只写日志
fn mail_sender(config: &EmailConfig) -> Result<Arc<dyn NotificationSender>> {
    if !config.enabled {
        info!("Email notifications disabled");
    }
    if config.gateway_url.trim().is_empty() {
        return Ok(Arc::new(LogMailSender));
    }

    let sender = HttpMailSender::new(
        config.gateway_url.trim(),
        config.api_key.clone(),
        config.from_address.clone(),
        config.timeout(),
    )?;
    info!("Mail gateway: {}", config.gateway_url);
    Ok(Arc::new(sender))
}
