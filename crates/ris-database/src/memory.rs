//! 内存实体存储
//!
//! 所有表放在同一把读写锁之后，写操作天然串行，
//! 用于测试和未配置数据库时的单进程运行。

use crate::models::*;
use crate::store::EntityStore;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use ris_core::{
    AppointmentWindow, Image, Order, OrderKey, OrderLevel, Patient, RisError, Result, Team,
};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Default)]
struct Tables {
    patients: HashMap<Uuid, Patient>,
    teams: HashMap<Uuid, Team>,
    orders: HashMap<Uuid, Order>,
    images: HashMap<Uuid, Image>,
    order_keys: HashMap<Uuid, OrderKey>, // order_id -> key
}

/// 内存存储
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn order_not_found(id: Uuid) -> RisError {
    RisError::NotFound(format!("Order {} not found", id))
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn create_patient(&self, patient: NewPatient) -> Result<Patient> {
        let patient = Patient {
            id: Uuid::new_v4(),
            first_name: patient.first_name,
            middle_name: patient.middle_name,
            last_name: patient.last_name,
            email: patient.email,
            phone_number: patient.phone_number,
            birth_date: patient.birth_date,
            allergy_asthma: patient.allergy_asthma,
            allergy_xray_dye: patient.allergy_xray_dye,
            allergy_mri_dye: patient.allergy_mri_dye,
            allergy_latex: patient.allergy_latex,
            notes: patient.notes,
            doctor_id: patient.doctor_id,
            created_at: Utc::now(),
        };

        self.tables
            .write()
            .await
            .patients
            .insert(patient.id, patient.clone());
        Ok(patient)
    }

    async fn get_patient(&self, id: Uuid) -> Result<Patient> {
        self.tables
            .read()
            .await
            .patients
            .get(&id)
            .cloned()
            .ok_or_else(|| RisError::NotFound(format!("Patient {} not found", id)))
    }

    async fn find_patients_by_birth_date(&self, birth_date: NaiveDate) -> Result<Vec<Patient>> {
        let tables = self.tables.read().await;
        let mut patients: Vec<Patient> = tables
            .patients
            .values()
            .filter(|p| p.birth_date == birth_date)
            .cloned()
            .collect();
        patients.sort_by(|a, b| {
            (&a.last_name, &a.first_name).cmp(&(&b.last_name, &b.first_name))
        });
        Ok(patients)
    }

    async fn delete_patient(&self, id: Uuid) -> Result<Vec<String>> {
        let mut tables = self.tables.write().await;
        if tables.patients.remove(&id).is_none() {
            return Err(RisError::NotFound(format!("Patient {} not found", id)));
        }

        let order_ids: Vec<Uuid> = tables
            .orders
            .values()
            .filter(|o| o.patient_id == id)
            .map(|o| o.id)
            .collect();

        let mut removed_paths = Vec::new();
        for order_id in &order_ids {
            tables.orders.remove(order_id);
            tables.order_keys.remove(order_id);
        }
        tables.images.retain(|_, image| {
            if order_ids.contains(&image.order_id) {
                removed_paths.push(image.file_path.clone());
                false
            } else {
                true
            }
        });

        debug!(
            "Deleted patient {} with {} orders and {} images",
            id,
            order_ids.len(),
            removed_paths.len()
        );
        Ok(removed_paths)
    }

    async fn create_team(&self, team: NewTeam) -> Result<Team> {
        let team = Team {
            id: Uuid::new_v4(),
            name: team.name,
            technicians: team.technicians,
            radiologists: team.radiologists,
        };
        self.tables.write().await.teams.insert(team.id, team.clone());
        Ok(team)
    }

    async fn get_team(&self, id: Uuid) -> Result<Team> {
        self.tables
            .read()
            .await
            .teams
            .get(&id)
            .cloned()
            .ok_or_else(|| RisError::NotFound(format!("Team {} not found", id)))
    }

    async fn list_teams(&self) -> Result<Vec<Team>> {
        let mut teams: Vec<Team> = self.tables.read().await.teams.values().cloned().collect();
        teams.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(teams)
    }

    async fn delete_team(&self, id: Uuid) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.teams.remove(&id).is_none() {
            return Err(RisError::NotFound(format!("Team {} not found", id)));
        }
        for order in tables.orders.values_mut() {
            if order.team_id == Some(id) {
                order.team_id = None;
            }
        }
        Ok(())
    }

    async fn create_order(&self, order: NewOrder) -> Result<Order> {
        let mut tables = self.tables.write().await;
        if !tables.patients.contains_key(&order.patient_id) {
            return Err(RisError::NotFound(format!(
                "Patient {} not found",
                order.patient_id
            )));
        }

        let now = Utc::now();
        let order = Order {
            id: Uuid::new_v4(),
            patient_id: order.patient_id,
            team_id: None,
            level: OrderLevel::ReferralPlaced,
            appointment: None,
            visit_reason: order.visit_reason,
            imaging_needed: order.imaging_needed,
            modality: order.modality,
            notes: order.notes,
            imaged: None,
            imaged_time: None,
            report: None,
            completed: None,
            completed_time: None,
            added_on: now,
            last_edit: now,
        };
        tables.orders.insert(order.id, order.clone());
        Ok(order)
    }

    async fn get_order(&self, id: Uuid) -> Result<Order> {
        self.tables
            .read()
            .await
            .orders
            .get(&id)
            .cloned()
            .ok_or_else(|| order_not_found(id))
    }

    async fn list_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>> {
        let tables = self.tables.read().await;
        let mut orders: Vec<Order> = tables
            .orders
            .values()
            .filter(|o| filter.patient_id.map_or(true, |id| o.patient_id == id))
            .filter(|o| filter.level.map_or(true, |level| o.level == level))
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.added_on.cmp(&b.added_on));
        Ok(orders)
    }

    async fn advance_order(
        &self,
        id: Uuid,
        expected: OrderLevel,
        update: WorkflowUpdate,
    ) -> Result<Order> {
        let mut tables = self.tables.write().await;

        if let WorkflowUpdate::AssignTeam { team_id } = &update {
            if !tables.teams.contains_key(team_id) {
                return Err(RisError::validation("team", "所选团队不存在"));
            }
        }

        let order = tables.orders.get_mut(&id).ok_or_else(|| order_not_found(id))?;
        let next = match expected.next() {
            Some(next) if order.level == expected => next,
            _ => {
                return Err(RisError::InvalidStateTransition {
                    from: order.level.to_string(),
                    action: update.name().to_string(),
                })
            }
        };

        update.apply_to(order);
        order.level = next;
        order.last_edit = Utc::now();
        Ok(order.clone())
    }

    async fn reserve_appointment(
        &self,
        id: Uuid,
        appointment: Option<DateTime<Utc>>,
    ) -> Result<Order> {
        let mut tables = self.tables.write().await;
        if !tables.orders.contains_key(&id) {
            return Err(order_not_found(id));
        }

        if let Some(start) = appointment {
            let candidate = AppointmentWindow::starting_at(start)?;
            let conflict = tables.orders.values().find(|other| {
                other.id != id
                    && other
                        .appointment_window()
                        .map_or(false, |window| window.overlaps(&candidate))
            });
            if let Some(other) = conflict {
                return Err(RisError::Conflict(format!(
                    "与订单 {} 的预约时间 {} 重叠",
                    other.id,
                    other.appointment.map(|t| t.to_rfc3339()).unwrap_or_default()
                )));
            }
        }

        let order = tables.orders.get_mut(&id).ok_or_else(|| order_not_found(id))?;
        order.appointment = appointment;
        order.last_edit = Utc::now();
        Ok(order.clone())
    }

    async fn add_image(&self, image: NewImage) -> Result<Image> {
        let mut tables = self.tables.write().await;
        if !tables.orders.contains_key(&image.order_id) {
            return Err(order_not_found(image.order_id));
        }
        let image = Image {
            id: Uuid::new_v4(),
            order_id: image.order_id,
            label: image.label,
            file_path: image.file_path,
            uploaded_by: image.uploaded_by,
            size_bytes: image.size_bytes,
            added_on: Utc::now(),
        };
        tables.images.insert(image.id, image.clone());
        Ok(image)
    }

    async fn get_image(&self, id: Uuid) -> Result<Image> {
        self.tables
            .read()
            .await
            .images
            .get(&id)
            .cloned()
            .ok_or_else(|| RisError::NotFound(format!("Image {} not found", id)))
    }

    async fn list_images(&self, order_id: Uuid) -> Result<Vec<Image>> {
        let tables = self.tables.read().await;
        let mut images: Vec<Image> = tables
            .images
            .values()
            .filter(|image| image.order_id == order_id)
            .cloned()
            .collect();
        images.sort_by(|a, b| a.added_on.cmp(&b.added_on));
        Ok(images)
    }

    async fn delete_image(&self, id: Uuid) -> Result<Image> {
        self.tables
            .write()
            .await
            .images
            .remove(&id)
            .ok_or_else(|| RisError::NotFound(format!("Image {} not found", id)))
    }

    async fn upsert_order_key(
        &self,
        order_id: Uuid,
        secret_digest: String,
        email: String,
    ) -> Result<OrderKey> {
        let mut tables = self.tables.write().await;
        if !tables.orders.contains_key(&order_id) {
            return Err(order_not_found(order_id));
        }

        let now = Utc::now();
        let key = tables
            .order_keys
            .entry(order_id)
            .or_insert_with(|| OrderKey {
                id: Uuid::new_v4(),
                order_id,
                secret_digest: String::new(),
                email: String::new(),
                created_at: now,
            });
        key.secret_digest = secret_digest;
        key.email = email;
        key.created_at = now;
        Ok(key.clone())
    }

    async fn find_order_key(&self, secret_digest: &str) -> Result<Option<OrderKey>> {
        Ok(self
            .tables
            .read()
            .await
            .order_keys
            .values()
            .find(|key| key.secret_digest == secret_digest)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn new_patient(birth_date: NaiveDate) -> NewPatient {
        NewPatient {
            first_name: "Grace".to_string(),
            middle_name: None,
            last_name: "Hopper".to_string(),
            email: "grace@example.com".to_string(),
            phone_number: "5135550100".to_string(),
            birth_date,
            allergy_asthma: false,
            allergy_xray_dye: true,
            allergy_mri_dye: false,
            allergy_latex: false,
            notes: None,
            doctor_id: Uuid::new_v4(),
        }
    }

    fn new_order(patient_id: Uuid) -> NewOrder {
        NewOrder {
            patient_id,
            visit_reason: Some("Chest pain".to_string()),
            imaging_needed: Some("Chest X-ray".to_string()),
            modality: Some("XR".to_string()),
            notes: None,
        }
    }

    async fn seeded_order(store: &MemoryStore) -> Order {
        let patient = store
            .create_patient(new_patient(NaiveDate::from_ymd_opt(1980, 1, 1).unwrap()))
            .await
            .unwrap();
        store.create_order(new_order(patient.id)).await.unwrap()
    }

    #[tokio::test]
    async fn test_new_order_starts_at_referral() {
        let store = MemoryStore::new();
        let order = seeded_order(&store).await;
        assert_eq!(order.level, OrderLevel::ReferralPlaced);
        assert!(order.team_id.is_none());
    }

    #[tokio::test]
    async fn test_advance_order_compare_and_increment() {
        let store = MemoryStore::new();
        let order = seeded_order(&store).await;
        let team = store
            .create_team(NewTeam {
                name: "CT".to_string(),
                technicians: vec![],
                radiologists: vec![],
            })
            .await
            .unwrap();

        let advanced = store
            .advance_order(
                order.id,
                OrderLevel::ReferralPlaced,
                WorkflowUpdate::AssignTeam { team_id: team.id },
            )
            .await
            .unwrap();
        assert_eq!(advanced.level, OrderLevel::CheckedIn);
        assert_eq!(advanced.team_id, Some(team.id));

        // 过期的期望级别不会写入任何字段
        let stale = store
            .advance_order(
                order.id,
                OrderLevel::ReferralPlaced,
                WorkflowUpdate::AssignTeam { team_id: team.id },
            )
            .await;
        assert!(matches!(stale, Err(RisError::InvalidStateTransition { .. })));
        let current = store.get_order(order.id).await.unwrap();
        assert_eq!(current.level, OrderLevel::CheckedIn);
        assert_eq!(current.last_edit, advanced.last_edit);
    }

    #[tokio::test]
    async fn test_reserve_appointment_detects_overlap() {
        let store = MemoryStore::new();
        let a = seeded_order(&store).await;
        let b = seeded_order(&store).await;
        let ten = Utc.with_ymd_and_hms(2040, 6, 1, 10, 0, 0).unwrap();

        store.reserve_appointment(a.id, Some(ten)).await.unwrap();
        let overlap = store
            .reserve_appointment(b.id, Some(ten + Duration::hours(1)))
            .await;
        assert!(matches!(overlap, Err(RisError::Conflict(_))));
        assert!(store.get_order(b.id).await.unwrap().appointment.is_none());

        let touching = store
            .reserve_appointment(b.id, Some(ten + Duration::hours(2)))
            .await
            .unwrap();
        assert_eq!(touching.appointment, Some(ten + Duration::hours(2)));

        // 重新预约自己的时间段不算冲突
        store.reserve_appointment(a.id, Some(ten)).await.unwrap();
        let cleared = store.reserve_appointment(a.id, None).await.unwrap();
        assert!(cleared.appointment.is_none());
    }

    #[tokio::test]
    async fn test_delete_patient_cascades() {
        let store = MemoryStore::new();
        let order = seeded_order(&store).await;
        store
            .add_image(NewImage {
                order_id: order.id,
                label: "PA view".to_string(),
                file_path: "ris/x/1-pa.png".to_string(),
                uploaded_by: "tech".to_string(),
                size_bytes: 10,
            })
            .await
            .unwrap();
        store
            .upsert_order_key(order.id, "digest".to_string(), "p@example.com".to_string())
            .await
            .unwrap();

        let paths = store.delete_patient(order.patient_id).await.unwrap();
        assert_eq!(paths, vec!["ris/x/1-pa.png".to_string()]);
        assert!(matches!(store.get_order(order.id).await, Err(RisError::NotFound(_))));
        assert!(store.find_order_key("digest").await.unwrap().is_none());
        assert!(store.list_images(order.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_team_nulls_orders() {
        let store = MemoryStore::new();
        let order = seeded_order(&store).await;
        let team = store
            .create_team(NewTeam {
                name: "MRI".to_string(),
                technicians: vec![],
                radiologists: vec![],
            })
            .await
            .unwrap();
        store
            .advance_order(
                order.id,
                OrderLevel::ReferralPlaced,
                WorkflowUpdate::AssignTeam { team_id: team.id },
            )
            .await
            .unwrap();

        store.delete_team(team.id).await.unwrap();
        let order = store.get_order(order.id).await.unwrap();
        assert!(order.team_id.is_none());
        assert_eq!(order.level, OrderLevel::CheckedIn);
    }

    #[tokio::test]
    async fn test_upsert_order_key_overwrites() {
        let store = MemoryStore::new();
        let order = seeded_order(&store).await;
        let first = store
            .upsert_order_key(order.id, "one".to_string(), "p@example.com".to_string())
            .await
            .unwrap();
        let second = store
            .upsert_order_key(order.id, "two".to_string(), "p@example.com".to_string())
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert!(store.find_order_key("one").await.unwrap().is_none());
        assert_eq!(store.find_order_key("two").await.unwrap().map(|k| k.order_id), Some(order.id));
    }
}
