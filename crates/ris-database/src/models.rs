//! 数据库模型

use chrono::{DateTime, NaiveDate, Utc};
use ris_core::models::*;
use ris_core::{RisError, Result};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// 数据库表模型 - 使用FromRow trait用于SQL查询

/// 数据库患者表
#[derive(Debug, FromRow)]
pub struct DbPatient {
    pub id: Uuid,
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
    pub email: String,
    pub phone_number: String,
    pub birth_date: NaiveDate,
    pub allergy_asthma: bool,
    pub allergy_xray_dye: bool,
    pub allergy_mri_dye: bool,
    pub allergy_latex: bool,
    pub notes: Option<String>,
    pub doctor_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl From<DbPatient> for Patient {
    fn from(db_patient: DbPatient) -> Self {
        Patient {
            id: db_patient.id,
            first_name: db_patient.first_name,
            middle_name: db_patient.middle_name,
            last_name: db_patient.last_name,
            email: db_patient.email,
            phone_number: db_patient.phone_number,
            birth_date: db_patient.birth_date,
            allergy_asthma: db_patient.allergy_asthma,
            allergy_xray_dye: db_patient.allergy_xray_dye,
            allergy_mri_dye: db_patient.allergy_mri_dye,
            allergy_latex: db_patient.allergy_latex,
            notes: db_patient.notes,
            doctor_id: db_patient.doctor_id,
            created_at: db_patient.created_at,
        }
    }
}

/// 数据库团队表
#[derive(Debug, FromRow)]
pub struct DbTeam {
    pub id: Uuid,
    pub name: String,
}

/// 数据库团队成员表，role 为 "technician" 或 "radiologist"
#[derive(Debug, FromRow)]
pub struct DbTeamMember {
    pub team_id: Uuid,
    pub user_id: Uuid,
    pub role: String,
}

impl DbTeam {
    pub fn into_team(self, members: &[DbTeamMember]) -> Team {
        let members_with = |role: &str| -> Vec<Uuid> {
            members
                .iter()
                .filter(|m| m.team_id == self.id && m.role == role)
                .map(|m| m.user_id)
                .collect()
        };
        Team {
            technicians: members_with(MEMBER_TECHNICIAN),
            radiologists: members_with(MEMBER_RADIOLOGIST),
            id: self.id,
            name: self.name,
        }
    }
}

pub const MEMBER_TECHNICIAN: &str = "technician";
pub const MEMBER_RADIOLOGIST: &str = "radiologist";

/// 数据库订单表
#[derive(Debug, FromRow)]
pub struct DbOrder {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub team_id: Option<Uuid>,
    pub level: i32, // 存储为整数，转换为OrderLevel枚举
    pub appointment: Option<DateTime<Utc>>,
    pub visit_reason: Option<String>,
    pub imaging_needed: Option<String>,
    pub modality: Option<String>,
    pub notes: Option<String>,
    pub imaged: Option<Uuid>,
    pub imaged_time: Option<DateTime<Utc>>,
    pub report: Option<String>,
    pub completed: Option<Uuid>,
    pub completed_time: Option<DateTime<Utc>>,
    pub added_on: DateTime<Utc>,
    pub last_edit: DateTime<Utc>,
}

impl TryFrom<DbOrder> for Order {
    type Error = RisError;

    fn try_from(db_order: DbOrder) -> Result<Self> {
        let level = OrderLevel::from_i32(db_order.level).ok_or_else(|| {
            RisError::Database(format!(
                "Order {} has invalid level {}",
                db_order.id, db_order.level
            ))
        })?;

        Ok(Order {
            id: db_order.id,
            patient_id: db_order.patient_id,
            team_id: db_order.team_id,
            level,
            appointment: db_order.appointment,
            visit_reason: db_order.visit_reason,
            imaging_needed: db_order.imaging_needed,
            modality: db_order.modality,
            notes: db_order.notes,
            imaged: db_order.imaged,
            imaged_time: db_order.imaged_time,
            report: db_order.report,
            completed: db_order.completed,
            completed_time: db_order.completed_time,
            added_on: db_order.added_on,
            last_edit: db_order.last_edit,
        })
    }
}

/// 数据库影像表
#[derive(Debug, FromRow)]
pub struct DbImage {
    pub id: Uuid,
    pub order_id: Uuid,
    pub label: String,
    pub file_path: String,
    pub uploaded_by: String,
    pub size_bytes: i64,
    pub added_on: DateTime<Utc>,
}

impl From<DbImage> for Image {
    fn from(db_image: DbImage) -> Self {
        Image {
            id: db_image.id,
            order_id: db_image.order_id,
            label: db_image.label,
            file_path: db_image.file_path,
            uploaded_by: db_image.uploaded_by,
            size_bytes: db_image.size_bytes,
            added_on: db_image.added_on,
        }
    }
}

/// 数据库访问密钥表
#[derive(Debug, FromRow)]
pub struct DbOrderKey {
    pub id: Uuid,
    pub order_id: Uuid,
    pub secret_digest: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

impl From<DbOrderKey> for OrderKey {
    fn from(db_key: DbOrderKey) -> Self {
        OrderKey {
            id: db_key.id,
            order_id: db_key.order_id,
            secret_digest: db_key.secret_digest,
            email: db_key.email,
            created_at: db_key.created_at,
        }
    }
}

// 插入模型 - 用于创建新记录

/// 新患者插入模型
#[derive(Debug, Clone)]
pub struct NewPatient {
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
    pub email: String,
    pub phone_number: String,
    pub birth_date: NaiveDate,
    pub allergy_asthma: bool,
    pub allergy_xray_dye: bool,
    pub allergy_mri_dye: bool,
    pub allergy_latex: bool,
    pub notes: Option<String>,
    pub doctor_id: Uuid,
}

/// 新团队插入模型
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTeam {
    pub name: String,
    #[serde(default)]
    pub technicians: Vec<Uuid>,
    #[serde(default)]
    pub radiologists: Vec<Uuid>,
}

/// 新订单插入模型，创建后直接处于第一级
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub patient_id: Uuid,
    pub visit_reason: Option<String>,
    pub imaging_needed: Option<String>,
    pub modality: Option<String>,
    pub notes: Option<String>,
}

/// 新影像插入模型
#[derive(Debug, Clone)]
pub struct NewImage {
    pub order_id: Uuid,
    pub label: String,
    pub file_path: String,
    pub uploaded_by: String,
    pub size_bytes: i64,
}

/// 订单查询条件
#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub patient_id: Option<Uuid>,
    pub level: Option<OrderLevel>,
}

/// 随级别推进一起写入的字段
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowUpdate {
    AssignTeam { team_id: Uuid },
    Imaged { by: Uuid, at: DateTime<Utc> },
    Reported { report: String, by: Uuid, at: DateTime<Utc> },
    Archived,
}

impl WorkflowUpdate {
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowUpdate::AssignTeam { .. } => "assign_team",
            WorkflowUpdate::Imaged { .. } => "complete_imaging",
            WorkflowUpdate::Reported { .. } => "submit_report",
            WorkflowUpdate::Archived => "archive",
        }
    }

    /// 把字段写入内存中的订单（不改变级别）
    pub fn apply_to(&self, order: &mut Order) {
        match self {
            WorkflowUpdate::AssignTeam { team_id } => order.team_id = Some(*team_id),
            WorkflowUpdate::Imaged { by, at } => {
                order.imaged = Some(*by);
                order.imaged_time = Some(*at);
            }
            WorkflowUpdate::Reported { report, by, at } => {
                order.report = Some(report.clone());
                order.completed = Some(*by);
                order.completed_time = Some(*at);
            }
            WorkflowUpdate::Archived => {}
        }
    }
}
