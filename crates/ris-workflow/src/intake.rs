//! 患者查找与新订单登记

use crate::guard::require_any_role;
use crate::notify::NotificationDispatcher;
use chrono::NaiveDate;
use regex::Regex;
use ris_core::utils::normalize_phone_number;
use ris_core::{Directory, FieldErrors, Order, Patient, RisError, Result, Role, User};
use ris_database::{EntityStore, NewOrder, NewPatient};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use tracing::info;
use uuid::Uuid;

/// 可以登记患者和开单的角色
pub const INTAKE_ROLES: &[Role] = &[Role::Physician, Role::Administrator];

const MAX_NAME_LENGTH: usize = 128;
const MAX_VISIT_FIELD_LENGTH: usize = 128;

const EMAIL_PATTERN: &str =
    r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9\-]+(\.[A-Za-z0-9\-]+)*\.[A-Za-z]{2,}$";

fn email_regex() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| {
        Regex::new(EMAIL_PATTERN).unwrap_or_else(|e| panic!("Invalid email pattern: {e}"))
    })
}

/// 邮箱格式校验
pub fn is_valid_email(email: &str) -> bool {
    email_regex().is_match(email.trim())
}

/// 出生日期必须早于今天
pub fn check_birth_date(birth_date: NaiveDate, today: NaiveDate) -> Result<()> {
    if birth_date >= today {
        return Err(RisError::validation("birth_date", "出生日期必须早于今天"));
    }
    Ok(())
}

/// 患者登记表单
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientForm {
    pub first_name: String,
    #[serde(default)]
    pub middle_name: Option<String>,
    pub last_name: String,
    pub email: String,
    pub phone_number: String,
    pub birth_date: NaiveDate,
    #[serde(default)]
    pub allergy_asthma: bool,
    #[serde(default)]
    pub allergy_xray_dye: bool,
    #[serde(default)]
    pub allergy_mri_dye: bool,
    #[serde(default)]
    pub allergy_latex: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

impl PatientForm {
    /// 校验全部字段，一次返回所有字段错误
    pub fn validate(&self, today: NaiveDate) -> Result<()> {
        let mut errors = FieldErrors::new();

        for (field, value) in [("first_name", &self.first_name), ("last_name", &self.last_name)] {
            let value = value.trim();
            if value.is_empty() {
                errors.add(field, "此字段为必填项");
            } else if value.chars().count() > MAX_NAME_LENGTH {
                errors.add(field, format!("长度不能超过 {} 个字符", MAX_NAME_LENGTH));
            }
        }
        if let Some(middle) = &self.middle_name {
            if middle.trim().chars().count() > MAX_NAME_LENGTH {
                errors.add("middle_name", format!("长度不能超过 {} 个字符", MAX_NAME_LENGTH));
            }
        }

        if !is_valid_email(&self.email) {
            errors.add("email", "请输入有效的邮箱地址");
        }

        let phone = normalize_phone_number(&self.phone_number);
        if phone.len() != 10 || !phone.chars().all(|c| c.is_ascii_digit()) {
            errors.add("phone_number", "电话号码必须为10位数字");
        }

        if self.birth_date >= today {
            errors.add("birth_date", "出生日期必须早于今天");
        }

        errors.into_result()
    }

    fn into_new_patient(self, doctor_id: Uuid) -> NewPatient {
        NewPatient {
            first_name: self.first_name.trim().to_string(),
            middle_name: self
                .middle_name
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty()),
            last_name: self.last_name.trim().to_string(),
            email: self.email.trim().to_string(),
            phone_number: normalize_phone_number(&self.phone_number),
            birth_date: self.birth_date,
            allergy_asthma: self.allergy_asthma,
            allergy_xray_dye: self.allergy_xray_dye,
            allergy_mri_dye: self.allergy_mri_dye,
            allergy_latex: self.allergy_latex,
            notes: self.notes,
            doctor_id,
        }
    }
}

/// 新订单表单，患者由路径给出
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderForm {
    #[serde(default)]
    pub visit_reason: Option<String>,
    #[serde(default)]
    pub imaging_needed: Option<String>,
    #[serde(default)]
    pub modality: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl OrderForm {
    pub fn validate(&self) -> Result<()> {
        let mut errors = FieldErrors::new();
        for (field, value) in [
            ("visit_reason", &self.visit_reason),
            ("imaging_needed", &self.imaging_needed),
        ] {
            if let Some(value) = value {
                if value.chars().count() > MAX_VISIT_FIELD_LENGTH {
                    errors.add(field, format!("长度不能超过 {} 个字符", MAX_VISIT_FIELD_LENGTH));
                }
            }
        }
        errors.into_result()
    }
}

/// 患者查找与登记
#[derive(Clone)]
pub struct Intake {
    store: Arc<dyn EntityStore>,
    directory: Arc<dyn Directory>,
    notifier: NotificationDispatcher,
}

impl Intake {
    pub fn new(
        store: Arc<dyn EntityStore>,
        directory: Arc<dyn Directory>,
        notifier: NotificationDispatcher,
    ) -> Self {
        Self {
            store,
            directory,
            notifier,
        }
    }

    /// 按出生日期精确查找患者
    pub async fn lookup_patients(
        &self,
        actor: &User,
        birth_date: NaiveDate,
        today: NaiveDate,
    ) -> Result<Vec<Patient>> {
        require_any_role(self.directory.as_ref(), actor, INTAKE_ROLES, "lookup_patients").await?;
        check_birth_date(birth_date, today)?;
        self.store.find_patients_by_birth_date(birth_date).await
    }

    /// 登记患者，开单医生为当前用户
    pub async fn create_patient(
        &self,
        actor: &User,
        form: PatientForm,
        today: NaiveDate,
    ) -> Result<Patient> {
        require_any_role(self.directory.as_ref(), actor, INTAKE_ROLES, "create_patient").await?;
        form.validate(today)?;

        let patient = self.store.create_patient(form.into_new_patient(actor.id)).await?;
        info!("Patient {} registered by {}", patient.id, actor.username);
        Ok(patient)
    }

    /// 为患者开新订单，订单从第一级开始并通知前台
    pub async fn create_order(
        &self,
        actor: &User,
        patient_id: Uuid,
        form: OrderForm,
    ) -> Result<Order> {
        require_any_role(self.directory.as_ref(), actor, INTAKE_ROLES, "create_order").await?;
        form.validate()?;

        let order = self
            .store
            .create_order(NewOrder {
                patient_id,
                visit_reason: form.visit_reason,
                imaging_needed: form.imaging_needed,
                modality: form.modality,
                notes: form.notes,
            })
            .await?;

        info!("Order {} created for patient {} at {}", order.id, patient_id, order.level);
        self.notifier.notify_level(order.id, order.level);
        Ok(order)
    }
}
