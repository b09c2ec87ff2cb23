//! 核心数据模型定义

use crate::error::{RisError, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// 预约占用时长（分钟）
pub const APPOINTMENT_DURATION_MINUTES: i64 = 120;

/// 患者基本信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Patient {
    pub id: Uuid,
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
    pub email: String,
    pub phone_number: String, // 仅数字，10位
    pub birth_date: NaiveDate,

    // 过敏信息
    pub allergy_asthma: bool,
    pub allergy_xray_dye: bool,
    pub allergy_mri_dye: bool,
    pub allergy_latex: bool,

    pub notes: Option<String>,
    pub doctor_id: Uuid, // 开单医生
    pub created_at: DateTime<Utc>,
}

impl Patient {
    /// 患者全名，中间名为空时省略
    pub fn full_name(&self) -> String {
        match self.middle_name.as_deref().map(str::trim) {
            Some(middle) if !middle.is_empty() => {
                format!("{} {} {}", self.first_name, middle, self.last_name)
            }
            _ => format!("{} {}", self.first_name, self.last_name),
        }
    }
}

/// 检查团队：技师与放射科医生两组成员
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Team {
    pub id: Uuid,
    pub name: String,
    pub technicians: Vec<Uuid>,
    pub radiologists: Vec<Uuid>,
}

impl Team {
    /// 计算用户在团队中的身份
    pub fn membership(&self, user_id: Uuid) -> TeamMembership {
        TeamMembership {
            technician: self.technicians.contains(&user_id),
            radiologist: self.radiologists.contains(&user_id),
        }
    }
}

/// 用户在某个订单团队中的身份
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamMembership {
    pub technician: bool,
    pub radiologist: bool,
}

impl TeamMembership {
    pub const NONE: TeamMembership = TeamMembership {
        technician: false,
        radiologist: false,
    };
}

/// 订单流程级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum OrderLevel {
    ReferralPlaced = 1,   // 已转诊
    CheckedIn = 2,        // 已签到
    ImagingComplete = 3,  // 影像完成
    AnalysisComplete = 4, // 诊断完成
    Archived = 5,         // 已归档
}

impl OrderLevel {
    pub const ALL: [OrderLevel; 5] = [
        OrderLevel::ReferralPlaced,
        OrderLevel::CheckedIn,
        OrderLevel::ImagingComplete,
        OrderLevel::AnalysisComplete,
        OrderLevel::Archived,
    ];

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|level| level.as_i32() == value)
    }

    /// 下一级别，已归档时为 `None`
    pub fn next(self) -> Option<Self> {
        Self::from_i32(self.as_i32() + 1)
    }

    /// 诊断完成或已归档的订单不再参与流程流转
    pub fn is_complete(self) -> bool {
        matches!(self, OrderLevel::AnalysisComplete | OrderLevel::Archived)
    }

    pub fn name(self) -> &'static str {
        match self {
            OrderLevel::ReferralPlaced => "Referral Placed",
            OrderLevel::CheckedIn => "Checked In",
            OrderLevel::ImagingComplete => "Imaging Complete",
            OrderLevel::AnalysisComplete => "Analysis Complete",
            OrderLevel::Archived => "Archived",
        }
    }
}

impl fmt::Display for OrderLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_i32())
    }
}

impl TryFrom<i32> for OrderLevel {
    type Error = RisError;

    fn try_from(value: i32) -> Result<Self> {
        OrderLevel::from_i32(value)
            .ok_or_else(|| RisError::validation("level", format!("未知的订单级别: {}", value)))
    }
}

impl From<OrderLevel> for i32 {
    fn from(level: OrderLevel) -> Self {
        level.as_i32()
    }
}

/// 影像检查订单
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub team_id: Option<Uuid>,
    pub level: OrderLevel,
    pub appointment: Option<DateTime<Utc>>,

    // 订单信息
    pub visit_reason: Option<String>,
    pub imaging_needed: Option<String>,
    pub modality: Option<String>,
    pub notes: Option<String>,

    // 影像与诊断
    pub imaged: Option<Uuid>,
    pub imaged_time: Option<DateTime<Utc>>,
    pub report: Option<String>,
    pub completed: Option<Uuid>,
    pub completed_time: Option<DateTime<Utc>>,

    pub added_on: DateTime<Utc>,
    pub last_edit: DateTime<Utc>,
}

impl Order {
    pub fn appointment_window(&self) -> Option<AppointmentWindow> {
        self.appointment
            .and_then(|start| AppointmentWindow::starting_at(start).ok())
    }
}

/// 预约占用的半开区间 `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl AppointmentWindow {
    /// 结束时间超出可表示范围时返回校验错误
    pub fn starting_at(start: DateTime<Utc>) -> Result<Self> {
        let end = start
            .checked_add_signed(Duration::minutes(APPOINTMENT_DURATION_MINUTES))
            .ok_or_else(|| out_of_range(start))?;
        Ok(Self { start, end })
    }

    /// 与 `start` 开始的预约可能重叠的最早开始时间（不含）
    pub fn earliest_overlapping_start(&self) -> Result<DateTime<Utc>> {
        self.start
            .checked_sub_signed(Duration::minutes(APPOINTMENT_DURATION_MINUTES))
            .ok_or_else(|| out_of_range(self.start))
    }

    /// 半开区间重叠判断，端点相接不算冲突
    pub fn overlaps(&self, other: &AppointmentWindow) -> bool {
        self.start < other.end && other.start < self.end
    }
}

fn out_of_range(start: DateTime<Utc>) -> RisError {
    RisError::validation(
        "appointment",
        format!("预约时间 {} 超出可安排的范围", start.to_rfc3339()),
    )
}

/// 订单附带的影像文件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Image {
    pub id: Uuid,
    pub order_id: Uuid,
    pub label: String,
    pub file_path: String,
    pub uploaded_by: String,
    pub size_bytes: i64,
    pub added_on: DateTime<Utc>,
}

/// 患者公开访问密钥，每个订单一条
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderKey {
    pub id: Uuid,
    pub order_id: Uuid,
    #[serde(skip_serializing)]
    pub secret_digest: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}
