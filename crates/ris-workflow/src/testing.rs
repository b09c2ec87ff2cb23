//! 测试夹具：内存存储、用户目录、记录型邮件发送器

use crate::engine::WorkflowEngine;
use crate::intake::PatientForm;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use ris_core::{
    AppSettings, MailMessage, MemoryDirectory, NotificationSender, Order, OrderLevel, Patient,
    Role, Team, User,
};
use ris_database::{EntityStore, MemoryStore, NewOrder, NewTeam, WorkflowUpdate};
use ris_storage::FileStorage;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

#[derive(Default)]
pub(crate) struct RecordingSender {
    sent: Mutex<Vec<MailMessage>>,
}

#[async_trait]
impl NotificationSender for RecordingSender {
    async fn send(&self, message: &MailMessage) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

pub(crate) struct FailingSender;

#[async_trait]
impl NotificationSender for FailingSender {
    async fn send(&self, _message: &MailMessage) -> anyhow::Result<()> {
        anyhow::bail!("smtp relay unreachable")
    }
}

pub(crate) fn user(username: &str, roles: Vec<Role>) -> User {
    User {
        id: Uuid::new_v4(),
        username: username.to_string(),
        email: format!("{}@ris.local", username),
        name: format!("Dr. {}", username),
        roles,
        is_active: true,
    }
}

pub(crate) fn patient_form(birth_date: NaiveDate) -> PatientForm {
    PatientForm {
        first_name: "Grace".to_string(),
        middle_name: None,
        last_name: "Hopper".to_string(),
        email: "grace@example.com".to_string(),
        phone_number: "513-555-0100".to_string(),
        birth_date,
        allergy_asthma: false,
        allergy_xray_dye: true,
        allergy_mri_dye: false,
        allergy_latex: false,
        notes: None,
    }
}

pub(crate) struct Fixture {
    pub store: Arc<MemoryStore>,
    pub engine: WorkflowEngine,
    pub recorder: Arc<RecordingSender>,
    pub admin: User,
    pub physician: User,
    pub receptionist: User,
    pub technician: User,
    pub radiologist: User,
    /// 不属于任何团队的技师
    pub outsider: User,
    pub team: Team,
    storage_dir: TempDir,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::build(AppSettings::default(), false).await
    }

    pub async fn with_settings(settings: AppSettings) -> Self {
        Self::build(settings, false).await
    }

    pub async fn failing() -> Self {
        Self::build(AppSettings::default(), true).await
    }

    async fn build(settings: AppSettings, failing: bool) -> Self {
        let admin = user("admin", vec![Role::Administrator]);
        let physician = user("physician", vec![Role::Physician]);
        let receptionist = user("frontdesk", vec![Role::Receptionist]);
        let technician = user("tech", vec![Role::Technician]);
        let radiologist = user("rad", vec![Role::Radiologist]);
        let outsider = user("tech2", vec![Role::Technician]);

        let directory = Arc::new(MemoryDirectory::with_users([
            admin.clone(),
            physician.clone(),
            receptionist.clone(),
            technician.clone(),
            radiologist.clone(),
            outsider.clone(),
        ]));
        let store = Arc::new(MemoryStore::new());
        let team = store
            .create_team(NewTeam {
                name: "CT".to_string(),
                technicians: vec![technician.id],
                radiologists: vec![radiologist.id],
            })
            .await
            .unwrap();

        let recorder = Arc::new(RecordingSender::default());
        let sender: Arc<dyn NotificationSender> = if failing {
            Arc::new(FailingSender)
        } else {
            recorder.clone()
        };

        let storage_dir = tempfile::tempdir().unwrap();
        let engine = WorkflowEngine::new(
            store.clone(),
            directory,
            sender,
            FileStorage::new(storage_dir.path()),
            settings,
            "http://ris.test/",
        );

        Self {
            store,
            engine,
            recorder,
            admin,
            physician,
            receptionist,
            technician,
            radiologist,
            outsider,
            team,
            storage_dir,
        }
    }

    pub fn storage_root(&self) -> PathBuf {
        self.storage_dir.path().to_path_buf()
    }

    pub fn sent(&self) -> Vec<MailMessage> {
        self.recorder.sent.lock().unwrap().clone()
    }

    /// 等待后台任务发出至少 `count` 封邮件
    pub async fn wait_for_mail(&self, count: usize) -> Vec<MailMessage> {
        for _ in 0..200 {
            let sent = self.sent();
            if sent.len() >= count {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} messages, got {}", count, self.sent().len());
    }

    pub async fn patient(&self, birth_date: NaiveDate) -> Patient {
        let form = patient_form(birth_date);
        self.engine
            .intake()
            .create_patient(&self.physician, form, Utc::now().date_naive())
            .await
            .unwrap()
    }

    /// 直接写入存储的第一级订单，不触发通知
    pub async fn order(&self) -> Order {
        let patient = self.patient(NaiveDate::from_ymd_opt(1980, 1, 1).unwrap()).await;
        self.store
            .create_order(NewOrder {
                patient_id: patient.id,
                visit_reason: Some("Shortness of breath".to_string()),
                imaging_needed: Some("Chest X-ray".to_string()),
                modality: Some("XR".to_string()),
                notes: None,
            })
            .await
            .unwrap()
    }

    /// 推进到指定级别的订单，不触发通知
    pub async fn order_at(&self, level: OrderLevel) -> Order {
        let mut order = self.order().await;
        while order.level < level {
            let update = match order.level {
                OrderLevel::ReferralPlaced => WorkflowUpdate::AssignTeam { team_id: self.team.id },
                OrderLevel::CheckedIn => WorkflowUpdate::Imaged {
                    by: self.technician.id,
                    at: Utc::now(),
                },
                OrderLevel::ImagingComplete => WorkflowUpdate::Reported {
                    report: "No acute findings.".to_string(),
                    by: self.radiologist.id,
                    at: Utc::now(),
                },
                _ => WorkflowUpdate::Archived,
            };
            order = self
                .store
                .advance_order(order.id, order.level, update)
                .await
                .unwrap();
        }
        order
    }
}
