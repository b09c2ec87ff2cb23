//! 订单影像附件
//!
//! 上传和删除只在订单已签到（级别2）时允许，并且只限订单团队中的技师或放射科医生。

use crate::guard::{require_any_role, require_level, team_membership};
use chrono::Utc;
use ris_core::utils::is_thumbnail;
use ris_core::{Directory, FieldErrors, Image, Order, OrderLevel, RisError, Result, Role, User};
use ris_database::{EntityStore, NewImage};
use ris_storage::{image_path, FileStorage, UploadWriter};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// 可以管理影像的角色
pub const IMAGING_ROLES: &[Role] = &[Role::Technician, Role::Radiologist];

const MAX_LABEL_LENGTH: usize = 30;

/// 上传表单的字段校验，`None` 表示该字段本次不检查
fn check_upload_fields(label: Option<&str>, filename: Option<&str>) -> Result<()> {
    let mut errors = FieldErrors::new();
    if let Some(label) = label.map(str::trim) {
        if label.is_empty() {
            errors.add("label", "此字段为必填项");
        } else if label.chars().count() > MAX_LABEL_LENGTH {
            errors.add("label", format!("长度不能超过 {} 个字符", MAX_LABEL_LENGTH));
        }
    }
    if filename.map_or(false, |name| name.trim().is_empty()) {
        errors.add("image", "请选择要上传的文件");
    }
    errors.into_result()
}

/// 已通过权限检查、正在接收内容的上传
#[derive(Debug)]
pub struct PendingUpload {
    order_id: Uuid,
    uploaded_by: String,
    writer: UploadWriter,
}

impl PendingUpload {
    pub fn order_id(&self) -> Uuid {
        self.order_id
    }

    /// 追加一块内容，累计超过上限时返回 `FileTooLarge`
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.writer.write_chunk(chunk).await
    }
}

/// 影像附件服务
#[derive(Clone)]
pub struct ImageService {
    store: Arc<dyn EntityStore>,
    directory: Arc<dyn Directory>,
    storage: FileStorage,
}

impl ImageService {
    pub fn new(
        store: Arc<dyn EntityStore>,
        directory: Arc<dyn Directory>,
        storage: FileStorage,
    ) -> Self {
        Self {
            store,
            directory,
            storage,
        }
    }

    /// 检查用户能否修改订单影像
    async fn authorize(&self, order: &Order, actor: &User, action: &str) -> Result<()> {
        require_level(order, OrderLevel::CheckedIn, action)?;
        require_any_role(self.directory.as_ref(), actor, IMAGING_ROLES, action).await?;

        let membership = team_membership(self.store.as_ref(), order, actor).await?;
        if !(membership.technician || membership.radiologist) {
            return Err(RisError::Permission(format!(
                "用户 {} 不属于订单 {} 的检查团队",
                actor.username, order.id
            )));
        }
        Ok(())
    }

    async fn writable_order(&self, order_id: Uuid, actor: &User) -> Result<Order> {
        let order = self.store.get_order(order_id).await?;
        self.authorize(&order, actor, "upload_image").await?;
        Ok(order)
    }

    /// 开始接收影像文件，文件内容随后分块写入
    pub async fn begin_upload(
        &self,
        order_id: Uuid,
        actor: &User,
        filename: &str,
    ) -> Result<PendingUpload> {
        let order = self.writable_order(order_id, actor).await?;
        check_upload_fields(None, Some(filename))?;
        self.start_writer(&order, actor, filename).await
    }

    async fn start_writer(&self, order: &Order, actor: &User, filename: &str) -> Result<PendingUpload> {
        let path = image_path(order.id, filename, Utc::now());
        let writer = self.storage.create(&path).await?;
        Ok(PendingUpload {
            order_id: order.id,
            uploaded_by: actor.username.clone(),
            writer,
        })
    }

    /// 文件接收完毕后校验标签并写入影像记录，失败时删除已写入的文件
    pub async fn finish_upload(&self, upload: PendingUpload, label: &str) -> Result<Image> {
        let PendingUpload {
            order_id,
            uploaded_by,
            writer,
        } = upload;

        if let Err(e) = check_upload_fields(Some(label), None) {
            writer.discard().await;
            return Err(e);
        }

        let path = writer.path().to_string();
        let size = match writer.finish().await {
            Ok(size) => size,
            Err(e) => {
                self.remove_orphan(&path).await;
                return Err(e);
            }
        };

        let record = NewImage {
            order_id,
            label: label.trim().to_string(),
            file_path: path.clone(),
            uploaded_by: uploaded_by.clone(),
            size_bytes: size as i64,
        };
        match self.store.add_image(record).await {
            Ok(image) => {
                info!("Image {} uploaded to order {} by {}", image.id, order_id, uploaded_by);
                Ok(image)
            }
            Err(e) => {
                self.remove_orphan(&path).await;
                Err(e)
            }
        }
    }

    /// 放弃未完成的上传
    pub async fn abort_upload(&self, upload: PendingUpload) {
        warn!(
            "Upload to order {} by {} aborted after {} bytes",
            upload.order_id,
            upload.uploaded_by,
            upload.writer.written()
        );
        upload.writer.discard().await;
    }

    /// 一次性上传内存中的影像
    pub async fn upload(
        &self,
        order_id: Uuid,
        actor: &User,
        label: &str,
        filename: &str,
        data: &[u8],
    ) -> Result<Image> {
        let order = self.writable_order(order_id, actor).await?;
        check_upload_fields(Some(label), Some(filename))?;

        let mut upload = self.start_writer(&order, actor, filename).await?;
        if let Err(e) = upload.write_chunk(data).await {
            self.abort_upload(upload).await;
            return Err(e);
        }
        self.finish_upload(upload, label).await
    }

    async fn remove_orphan(&self, path: &str) {
        if let Err(cleanup) = self.storage.delete(path).await {
            warn!("Failed to remove orphaned file {}: {}", path, cleanup);
        }
    }

    /// 读取影像记录及文件内容
    pub async fn download(&self, image_id: Uuid) -> Result<(Image, Vec<u8>)> {
        let image = self.store.get_image(image_id).await?;
        let data = self.storage.read(&image.file_path).await?;
        Ok((image, data))
    }

    /// 删除影像记录并同时删除存储的文件
    ///
    /// 记录删除成功即视为完成，文件删除失败只记录警告。
    pub async fn delete(&self, image_id: Uuid, actor: &User) -> Result<Image> {
        let image = self.store.get_image(image_id).await?;
        let order = self.store.get_order(image.order_id).await?;
        self.authorize(&order, actor, "delete_image").await?;

        let image = self.store.delete_image(image_id).await?;
        if let Err(e) = self.storage.delete(&image.file_path).await {
            warn!("Image {} deleted but file {} was left behind: {}", image.id, image.file_path, e);
        }

        info!("Image {} deleted from order {} by {}", image.id, order.id, actor.username);
        Ok(image)
    }

    /// 订单中可作为缩略图显示的影像
    pub async fn thumbnails(&self, order_id: Uuid) -> Result<Vec<Image>> {
        let images = self.store.list_images(order_id).await?;
        Ok(images
            .into_iter()
            .filter(|image| is_thumbnail(&image.file_path))
            .collect())
    }

    /// 删除患者时清理其全部影像文件
    pub async fn remove_files(&self, paths: &[String]) {
        for path in paths {
            if let Err(e) = self.storage.delete(path).await {
                warn!("Failed to remove file {}: {}", path, e);
            }
        }
    }
}
