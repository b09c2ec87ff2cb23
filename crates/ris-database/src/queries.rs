//! PostgreSQL 实体存储

use crate::connection::DatabasePool;
use crate::models::*;
use crate::store::EntityStore;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use ris_core::{
    AppointmentWindow, Image, Order, OrderKey, OrderLevel, Patient, RisError, Result, Team,
};
use sqlx::Row;
use uuid::Uuid;

/// 预约检查使用的事务级咨询锁
const APPOINTMENT_LOCK_KEY: i64 = 0x5249_535f_4150_5054;

fn db_err(e: sqlx::Error) -> RisError {
    RisError::Database(e.to_string())
}

/// 基于 sqlx 的 PostgreSQL 存储
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: DatabasePool,
}

impl PgStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// 创建数据库表
    pub async fn create_tables(&self) -> Result<()> {
        let pool = self.pool.pool();

        // 创建患者表
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS patients (
                id UUID PRIMARY KEY,
                first_name VARCHAR(128) NOT NULL,
                middle_name VARCHAR(128),
                last_name VARCHAR(128) NOT NULL,
                email VARCHAR(254) NOT NULL,
                phone_number VARCHAR(10) NOT NULL,
                birth_date DATE NOT NULL,
                allergy_asthma BOOLEAN NOT NULL DEFAULT FALSE,
                allergy_xray_dye BOOLEAN NOT NULL DEFAULT FALSE,
                allergy_mri_dye BOOLEAN NOT NULL DEFAULT FALSE,
                allergy_latex BOOLEAN NOT NULL DEFAULT FALSE,
                notes TEXT,
                doctor_id UUID NOT NULL,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
            )
        "#).execute(pool).await.map_err(db_err)?;

        // 创建团队表
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS teams (
                id UUID PRIMARY KEY,
                name VARCHAR(128) NOT NULL
            )
        "#).execute(pool).await.map_err(db_err)?;

        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS team_members (
                team_id UUID NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
                user_id UUID NOT NULL,
                role VARCHAR(16) NOT NULL,
                PRIMARY KEY (team_id, user_id, role)
            )
        "#).execute(pool).await.map_err(db_err)?;

        // 创建订单表
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS orders (
                id UUID PRIMARY KEY,
                patient_id UUID NOT NULL REFERENCES patients(id) ON DELETE CASCADE,
                team_id UUID REFERENCES teams(id) ON DELETE SET NULL,
                level INTEGER NOT NULL CHECK (level BETWEEN 1 AND 5),
                appointment TIMESTAMP WITH TIME ZONE,
                visit_reason VARCHAR(128),
                imaging_needed VARCHAR(128),
                modality VARCHAR(64),
                notes TEXT,
                imaged UUID,
                imaged_time TIMESTAMP WITH TIME ZONE,
                report TEXT,
                completed UUID,
                completed_time TIMESTAMP WITH TIME ZONE,
                added_on TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                last_edit TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
            )
        "#).execute(pool).await.map_err(db_err)?;

        // 创建影像表
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS images (
                id UUID PRIMARY KEY,
                order_id UUID NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
                label VARCHAR(30) NOT NULL,
                file_path VARCHAR(512) NOT NULL,
                uploaded_by VARCHAR(150) NOT NULL,
                size_bytes BIGINT NOT NULL,
                added_on TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
            )
        "#).execute(pool).await.map_err(db_err)?;

        // 创建访问密钥表
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS order_keys (
                id UUID PRIMARY KEY,
                order_id UUID UNIQUE NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
                secret_digest CHAR(64) NOT NULL,
                email VARCHAR(254) NOT NULL,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
            )
        "#).execute(pool).await.map_err(db_err)?;

        self.create_indexes().await?;

        tracing::info!("Database tables created successfully");
        Ok(())
    }

    /// 创建数据库索引
    async fn create_indexes(&self) -> Result<()> {
        let pool = self.pool.pool();

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_patients_birth_date ON patients(birth_date)",
            "CREATE INDEX IF NOT EXISTS idx_orders_patient_id ON orders(patient_id)",
            "CREATE INDEX IF NOT EXISTS idx_orders_level ON orders(level)",
            "CREATE INDEX IF NOT EXISTS idx_orders_appointment ON orders(appointment)",
            "CREATE INDEX IF NOT EXISTS idx_images_order_id ON images(order_id)",
            "CREATE INDEX IF NOT EXISTS idx_order_keys_secret_digest ON order_keys(secret_digest)",
        ];

        for index_sql in indexes {
            sqlx::query(index_sql).execute(pool).await.map_err(db_err)?;
        }

        tracing::info!("Database indexes created successfully");
        Ok(())
    }

    async fn team_members(&self, team_ids: &[Uuid]) -> Result<Vec<DbTeamMember>> {
        sqlx::query_as::<_, DbTeamMember>(
            "SELECT team_id, user_id, role FROM team_members WHERE team_id = ANY($1)",
        )
        .bind(team_ids)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }
}

#[async_trait]
impl EntityStore for PgStore {
    // ========== 患者相关操作 ==========

    async fn create_patient(&self, patient: NewPatient) -> Result<Patient> {
        let result = sqlx::query_as::<_, DbPatient>(r#"
            INSERT INTO patients (id, first_name, middle_name, last_name, email, phone_number, birth_date,
                                  allergy_asthma, allergy_xray_dye, allergy_mri_dye, allergy_latex, notes, doctor_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING *
        "#)
        .bind(Uuid::new_v4())
        .bind(&patient.first_name)
        .bind(&patient.middle_name)
        .bind(&patient.last_name)
        .bind(&patient.email)
        .bind(&patient.phone_number)
        .bind(patient.birth_date)
        .bind(patient.allergy_asthma)
        .bind(patient.allergy_xray_dye)
        .bind(patient.allergy_mri_dye)
        .bind(patient.allergy_latex)
        .bind(&patient.notes)
        .bind(patient.doctor_id)
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(Patient::from(result))
    }

    async fn get_patient(&self, id: Uuid) -> Result<Patient> {
        sqlx::query_as::<_, DbPatient>("SELECT * FROM patients WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)?
            .map(Patient::from)
            .ok_or_else(|| RisError::NotFound(format!("Patient {} not found", id)))
    }

    async fn find_patients_by_birth_date(&self, birth_date: NaiveDate) -> Result<Vec<Patient>> {
        let results = sqlx::query_as::<_, DbPatient>(
            "SELECT * FROM patients WHERE birth_date = $1 ORDER BY last_name, first_name",
        )
        .bind(birth_date)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(results.into_iter().map(Patient::from).collect())
    }

    async fn delete_patient(&self, id: Uuid) -> Result<Vec<String>> {
        let mut tx = self.pool.pool().begin().await.map_err(db_err)?;

        let paths: Vec<String> = sqlx::query(r#"
            SELECT images.file_path FROM images
            JOIN orders ON orders.id = images.order_id
            WHERE orders.patient_id = $1
        "#)
        .bind(id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?
        .into_iter()
        .map(|row| row.get::<String, _>("file_path"))
        .collect();

        let deleted = sqlx::query("DELETE FROM patients WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        if deleted.rows_affected() == 0 {
            return Err(RisError::NotFound(format!("Patient {} not found", id)));
        }

        tx.commit().await.map_err(db_err)?;
        Ok(paths)
    }

    // ========== 团队相关操作 ==========

    async fn create_team(&self, team: NewTeam) -> Result<Team> {
        let mut tx = self.pool.pool().begin().await.map_err(db_err)?;
        let id = Uuid::new_v4();

        sqlx::query("INSERT INTO teams (id, name) VALUES ($1, $2)")
            .bind(id)
            .bind(&team.name)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let members = team
            .technicians
            .iter()
            .map(|user_id| (user_id, MEMBER_TECHNICIAN))
            .chain(team.radiologists.iter().map(|user_id| (user_id, MEMBER_RADIOLOGIST)));
        for (user_id, role) in members {
            sqlx::query(
                "INSERT INTO team_members (team_id, user_id, role) VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
            )
            .bind(id)
            .bind(user_id)
            .bind(role)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(Team {
            id,
            name: team.name,
            technicians: team.technicians,
            radiologists: team.radiologists,
        })
    }

    async fn get_team(&self, id: Uuid) -> Result<Team> {
        let team = sqlx::query_as::<_, DbTeam>("SELECT id, name FROM teams WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)?
            .ok_or_else(|| RisError::NotFound(format!("Team {} not found", id)))?;

        let members = self.team_members(&[id]).await?;
        Ok(team.into_team(&members))
    }

    async fn list_teams(&self) -> Result<Vec<Team>> {
        let teams = sqlx::query_as::<_, DbTeam>("SELECT id, name FROM teams ORDER BY name")
            .fetch_all(self.pool.pool())
            .await
            .map_err(db_err)?;

        let ids: Vec<Uuid> = teams.iter().map(|t| t.id).collect();
        let members = self.team_members(&ids).await?;
        Ok(teams.into_iter().map(|t| t.into_team(&members)).collect())
    }

    async fn delete_team(&self, id: Uuid) -> Result<()> {
        let deleted = sqlx::query("DELETE FROM teams WHERE id = $1")
            .bind(id)
            .execute(self.pool.pool())
            .await
            .map_err(db_err)?;

        if deleted.rows_affected() == 0 {
            return Err(RisError::NotFound(format!("Team {} not found", id)));
        }
        Ok(())
    }

    // ========== 订单相关操作 ==========

    async fn create_order(&self, order: NewOrder) -> Result<Order> {
        // 外键失败时给出明确的 NotFound
        self.get_patient(order.patient_id).await?;

        let result = sqlx::query_as::<_, DbOrder>(r#"
            INSERT INTO orders (id, patient_id, level, visit_reason, imaging_needed, modality, notes)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
        "#)
        .bind(Uuid::new_v4())
        .bind(order.patient_id)
        .bind(OrderLevel::ReferralPlaced.as_i32())
        .bind(&order.visit_reason)
        .bind(&order.imaging_needed)
        .bind(&order.modality)
        .bind(&order.notes)
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)?;

        Order::try_from(result)
    }

    async fn get_order(&self, id: Uuid) -> Result<Order> {
        sqlx::query_as::<_, DbOrder>("SELECT * FROM orders WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)?
            .ok_or_else(|| RisError::NotFound(format!("Order {} not found", id)))
            .and_then(Order::try_from)
    }

    async fn list_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>> {
        let results = sqlx::query_as::<_, DbOrder>(r#"
            SELECT * FROM orders
            WHERE ($1::uuid IS NULL OR patient_id = $1)
              AND ($2::integer IS NULL OR level = $2)
            ORDER BY added_on
        "#)
        .bind(filter.patient_id)
        .bind(filter.level.map(OrderLevel::as_i32))
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)?;

        results.into_iter().map(Order::try_from).collect()
    }

    async fn advance_order(
        &self,
        id: Uuid,
        expected: OrderLevel,
        update: WorkflowUpdate,
    ) -> Result<Order> {
        let pool = self.pool.pool();
        let stale = |from: OrderLevel| RisError::InvalidStateTransition {
            from: from.to_string(),
            action: update.name().to_string(),
        };
        let next = expected.next().ok_or_else(|| stale(expected))?;

        if let WorkflowUpdate::AssignTeam { team_id } = &update {
            self.get_team(*team_id).await.map_err(|e| match e {
                RisError::NotFound(_) => RisError::validation("team", "所选团队不存在"),
                other => other,
            })?;
        }

        // 条件更新：只有级别仍等于期望值时才写入
        let updated = match &update {
            WorkflowUpdate::AssignTeam { team_id } => {
                sqlx::query_as::<_, DbOrder>(
                    "UPDATE orders SET team_id = $3, level = $4, last_edit = NOW() \
                     WHERE id = $1 AND level = $2 RETURNING *",
                )
                .bind(id)
                .bind(expected.as_i32())
                .bind(team_id)
                .bind(next.as_i32())
                .fetch_optional(pool)
                .await
            }
            WorkflowUpdate::Imaged { by, at } => {
                sqlx::query_as::<_, DbOrder>(
                    "UPDATE orders SET imaged = $3, imaged_time = $4, level = $5, last_edit = NOW() \
                     WHERE id = $1 AND level = $2 RETURNING *",
                )
                .bind(id)
                .bind(expected.as_i32())
                .bind(by)
                .bind(at)
                .bind(next.as_i32())
                .fetch_optional(pool)
                .await
            }
            WorkflowUpdate::Reported { report, by, at } => {
                sqlx::query_as::<_, DbOrder>(
                    "UPDATE orders SET report = $3, completed = $4, completed_time = $5, level = $6, \
                     last_edit = NOW() WHERE id = $1 AND level = $2 RETURNING *",
                )
                .bind(id)
                .bind(expected.as_i32())
                .bind(report)
                .bind(by)
                .bind(at)
                .bind(next.as_i32())
                .fetch_optional(pool)
                .await
            }
            WorkflowUpdate::Archived => {
                sqlx::query_as::<_, DbOrder>(
                    "UPDATE orders SET level = $3, last_edit = NOW() \
                     WHERE id = $1 AND level = $2 RETURNING *",
                )
                .bind(id)
                .bind(expected.as_i32())
                .bind(next.as_i32())
                .fetch_optional(pool)
                .await
            }
        }
        .map_err(db_err)?;

        match updated {
            Some(order) => Order::try_from(order),
            None => {
                let current = self.get_order(id).await?;
                Err(stale(current.level))
            }
        }
    }

    async fn reserve_appointment(
        &self,
        id: Uuid,
        appointment: Option<DateTime<Utc>>,
    ) -> Result<Order> {
        let mut tx = self.pool.pool().begin().await.map_err(db_err)?;

        // 串行化所有预约写入，检查与写入在同一事务内
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(APPOINTMENT_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        if let Some(start) = appointment {
            let window = AppointmentWindow::starting_at(start)?;
            let earliest = window.earliest_overlapping_start()?;
            let conflict = sqlx::query(r#"
                SELECT id, appointment FROM orders
                WHERE id <> $1 AND appointment IS NOT NULL
                  AND appointment < $2 AND appointment > $3
                LIMIT 1
            "#)
            .bind(id)
            .bind(window.end)
            .bind(earliest)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;

            if let Some(row) = conflict {
                let other: Uuid = row.get("id");
                let at: DateTime<Utc> = row.get("appointment");
                return Err(RisError::Conflict(format!(
                    "与订单 {} 的预约时间 {} 重叠",
                    other,
                    at.to_rfc3339()
                )));
            }
        }

        let updated = sqlx::query_as::<_, DbOrder>(
            "UPDATE orders SET appointment = $2, last_edit = NOW() WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(appointment)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| RisError::NotFound(format!("Order {} not found", id)))?;

        tx.commit().await.map_err(db_err)?;
        Order::try_from(updated)
    }

    // ========== 影像相关操作 ==========

    async fn add_image(&self, image: NewImage) -> Result<Image> {
        self.get_order(image.order_id).await?;

        let result = sqlx::query_as::<_, DbImage>(r#"
            INSERT INTO images (id, order_id, label, file_path, uploaded_by, size_bytes)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
        "#)
        .bind(Uuid::new_v4())
        .bind(image.order_id)
        .bind(&image.label)
        .bind(&image.file_path)
        .bind(&image.uploaded_by)
        .bind(image.size_bytes)
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(Image::from(result))
    }

    async fn get_image(&self, id: Uuid) -> Result<Image> {
        sqlx::query_as::<_, DbImage>("SELECT * FROM images WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)?
            .map(Image::from)
            .ok_or_else(|| RisError::NotFound(format!("Image {} not found", id)))
    }

    async fn list_images(&self, order_id: Uuid) -> Result<Vec<Image>> {
        let results = sqlx::query_as::<_, DbImage>(
            "SELECT * FROM images WHERE order_id = $1 ORDER BY added_on",
        )
        .bind(order_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(results.into_iter().map(Image::from).collect())
    }

    async fn delete_image(&self, id: Uuid) -> Result<Image> {
        sqlx::query_as::<_, DbImage>("DELETE FROM images WHERE id = $1 RETURNING *")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)?
            .map(Image::from)
            .ok_or_else(|| RisError::NotFound(format!("Image {} not found", id)))
    }

    // ========== 访问密钥相关操作 ==========

    async fn upsert_order_key(
        &self,
        order_id: Uuid,
        secret_digest: String,
        email: String,
    ) -> Result<OrderKey> {
        self.get_order(order_id).await?;

        let result = sqlx::query_as::<_, DbOrderKey>(r#"
            INSERT INTO order_keys (id, order_id, secret_digest, email)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (order_id) DO UPDATE
                SET secret_digest = EXCLUDED.secret_digest,
                    email = EXCLUDED.email,
                    created_at = NOW()
            RETURNING *
        "#)
        .bind(Uuid::new_v4())
        .bind(order_id)
        .bind(&secret_digest)
        .bind(&email)
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(OrderKey::from(result))
    }

    async fn find_order_key(&self, secret_digest: &str) -> Result<Option<OrderKey>> {
        let result = sqlx::query_as::<_, DbOrderKey>(
            "SELECT * FROM order_keys WHERE secret_digest = $1",
        )
        .bind(secret_digest)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.map(OrderKey::from))
    }
}
