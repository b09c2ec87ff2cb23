//! 影像文件存储管理

use chrono::{DateTime, Utc};
use ris_core::{RisError, Result};
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 单个影像文件的上限（字节，含）
pub const MAX_UPLOAD_BYTES: u64 = 2_000_000_000;

/// 检查上传大小，恰好等于上限时允许
pub fn check_size(size: u64) -> Result<()> {
    check_limit(size, MAX_UPLOAD_BYTES)
}

fn check_limit(size: u64, max: u64) -> Result<()> {
    if size > max {
        return Err(RisError::FileTooLarge { size, max });
    }
    Ok(())
}

/// 生成影像存储路径 `ris/{order_id}/{微秒}-{文件名}`
///
/// 文件名只保留最后一段，客户端传来的目录部分被丢弃。
pub fn image_path(order_id: Uuid, filename: &str, now: DateTime<Utc>) -> String {
    let name = filename
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .unwrap_or("upload");
    format!("ris/{}/{}-{}", order_id, now.format("%6f"), name)
}

/// 分块写入中的上传文件
///
/// 每块写入前检查累计大小，超过上限立即拒绝。出错后调用 [`UploadWriter::discard`] 删除半截文件。
#[derive(Debug)]
pub struct UploadWriter {
    relative: String,
    full_path: PathBuf,
    file: tokio::fs::File,
    written: u64,
    max: u64,
}

impl UploadWriter {
    pub fn path(&self) -> &str {
        &self.relative
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let total = self.written + chunk.len() as u64;
        check_limit(total, self.max)?;
        self.file.write_all(chunk).await?;
        self.written = total;
        Ok(())
    }

    /// 刷盘并返回写入字节数
    pub async fn finish(mut self) -> Result<u64> {
        self.file.flush().await?;
        info!("Stored {} bytes at {}", self.written, self.relative);
        Ok(self.written)
    }

    /// 放弃上传并删除已写入的部分
    pub async fn discard(self) {
        let Self {
            relative,
            full_path,
            file,
            ..
        } = self;
        drop(file);
        match tokio::fs::remove_file(&full_path).await {
            Ok(()) => debug!("Discarded partial upload {}", relative),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to discard partial upload {}: {}", relative, e),
        }
    }
}

/// 本地文件存储
#[derive(Debug, Clone)]
pub struct FileStorage {
    base_path: PathBuf,
    max_upload_bytes: u64,
}

impl FileStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            max_upload_bytes: MAX_UPLOAD_BYTES,
        }
    }

    /// 覆盖单文件上限，测试中用较小的值
    pub fn with_max_upload_bytes(mut self, max: u64) -> Self {
        self.max_upload_bytes = max;
        self
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_bytes
    }

    /// 把相对路径解析到存储根目录下，拒绝跳出根目录的路径
    fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let path = Path::new(relative);
        let escapes = path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if relative.is_empty() || escapes {
            return Err(RisError::Storage(format!("非法存储路径: {}", relative)));
        }
        Ok(self.base_path.join(path))
    }

    /// 创建文件供分块写入
    pub async fn create(&self, relative: &str) -> Result<UploadWriter> {
        let full_path = self.resolve(relative)?;
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(&full_path).await?;

        Ok(UploadWriter {
            relative: relative.to_string(),
            full_path,
            file,
            written: 0,
            max: self.max_upload_bytes,
        })
    }

    /// 一次性写入文件，返回写入字节数
    pub async fn store(&self, relative: &str, data: &[u8]) -> Result<u64> {
        check_limit(data.len() as u64, self.max_upload_bytes)?;

        let mut writer = self.create(relative).await?;
        if let Err(e) = writer.write_chunk(data).await {
            writer.discard().await;
            return Err(e);
        }
        writer.finish().await
    }

    /// 读取文件
    pub async fn read(&self, relative: &str) -> Result<Vec<u8>> {
        let full_path = self.resolve(relative)?;
        match tokio::fs::read(&full_path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RisError::NotFound(format!("File {} not found", relative)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// 删除文件，文件已不存在时视为成功
    pub async fn delete(&self, relative: &str) -> Result<()> {
        let full_path = self.resolve(relative)?;
        match tokio::fs::remove_file(&full_path).await {
            Ok(()) => {
                debug!("Deleted file {}", relative);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("File {} already removed", relative);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
