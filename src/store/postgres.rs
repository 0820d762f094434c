use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use super::Backend;
use crate::err::Error;
use crate::models::{AdminAccount, AdminSession, AttendanceEntry, StudentRecord};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS admin_accounts (
        id UUID PRIMARY KEY,
        username VARCHAR(50) NOT NULL,
        password_hash TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        last_login TIMESTAMPTZ,
        CONSTRAINT admin_accounts_username_key UNIQUE (username)
    )",
    "CREATE TABLE IF NOT EXISTS students (
        id UUID PRIMARY KEY,
        student_id VARCHAR(20) NOT NULL,
        full_name VARCHAR(255) NOT NULL,
        email VARCHAR(255) NOT NULL,
        section VARCHAR(10) NOT NULL,
        year_level VARCHAR(20) NOT NULL,
        major VARCHAR(255) NOT NULL,
        course VARCHAR(10) NOT NULL,
        qr_code TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CONSTRAINT students_student_id_key UNIQUE (student_id),
        CONSTRAINT students_email_key UNIQUE (email)
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS students_email_lower_key ON students (lower(email))",
    "CREATE TABLE IF NOT EXISTS attendance_records (
        id UUID PRIMARY KEY,
        student_id VARCHAR(20) NOT NULL,
        student_name VARCHAR(255) NOT NULL,
        student_email VARCHAR(255) NOT NULL,
        section VARCHAR(10) NOT NULL,
        year_level VARCHAR(20) NOT NULL,
        major VARCHAR(255) NOT NULL,
        course VARCHAR(10) NOT NULL,
        event_name VARCHAR(255) NOT NULL,
        login_date DATE NOT NULL,
        login_time VARCHAR(16) NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL,
        CONSTRAINT attendance_once_per_day UNIQUE (student_id, login_date)
    )",
    "CREATE TABLE IF NOT EXISTS admin_sessions (
        session_token VARCHAR(255) PRIMARY KEY,
        admin_id UUID NOT NULL REFERENCES admin_accounts(id) ON DELETE CASCADE,
        expires_at TIMESTAMPTZ NOT NULL
    )",
];

pub struct PgBackend {
    pg: PgPool,
}

impl PgBackend {
    pub async fn connect(url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pg = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pg })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        for statement in SCHEMA {
            sqlx::query(*statement).execute(&self.pg).await?;
        }
        log::info!("Database schema is up to date");
        Ok(())
    }
}

#[async_trait]
impl Backend for PgBackend {
    async fn insert_student(&self, student: &StudentRecord) -> Result<(), Error> {
        sqlx::query("INSERT INTO students VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)")
            .bind(student.id)
            .bind(&student.student_id)
            .bind(&student.full_name)
            .bind(&student.email)
            .bind(&student.section)
            .bind(&student.year_level)
            .bind(&student.major)
            .bind(&student.course)
            .bind(&student.qr_code)
            .bind(student.created_at)
            .execute(&self.pg)
            .await
            .map_err(Error::from)?;
        Ok(())
    }

    async fn student_by_id(&self, student_id: &str) -> Result<Option<StudentRecord>, Error> {
        sqlx::query_as::<_, StudentRecord>("SELECT * FROM students WHERE student_id = $1 LIMIT 1")
            .bind(student_id)
            .fetch_optional(&self.pg)
            .await
            .map_err(Error::from)
    }

    async fn list_students(&self) -> Result<Vec<StudentRecord>, Error> {
        sqlx::query_as::<_, StudentRecord>("SELECT * FROM students ORDER BY created_at DESC")
            .fetch_all(&self.pg)
            .await
            .map_err(Error::from)
    }

    async fn delete_student(&self, student_id: &str) -> Result<bool, Error> {
        let res = sqlx::query("DELETE FROM students WHERE student_id = $1")
            .bind(student_id)
            .execute(&self.pg)
            .await
            .map_err(Error::from)?;
        Ok(res.rows_affected() >= 1)
    }

    async fn attendance_for(&self, student_id: &str) -> Result<Vec<AttendanceEntry>, Error> {
        sqlx::query_as::<_, AttendanceEntry>(
            "SELECT * FROM attendance_records WHERE student_id = $1 ORDER BY timestamp DESC",
        )
        .bind(student_id)
        .fetch_all(&self.pg)
        .await
        .map_err(Error::from)
    }

    async fn list_attendance(&self) -> Result<Vec<AttendanceEntry>, Error> {
        sqlx::query_as::<_, AttendanceEntry>(
            "SELECT * FROM attendance_records ORDER BY timestamp DESC",
        )
        .fetch_all(&self.pg)
        .await
        .map_err(Error::from)
    }

    async fn attendance_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<AttendanceEntry>, Error> {
        sqlx::query_as::<_, AttendanceEntry>(
            "SELECT * FROM attendance_records WHERE login_date >= $1 AND login_date <= $2 \
             ORDER BY timestamp DESC",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pg)
        .await
        .map_err(Error::from)
    }

    async fn insert_attendance_once(&self, entry: &AttendanceEntry) -> Result<bool, Error> {
        let res = sqlx::query(
            "INSERT INTO attendance_records VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (student_id, login_date) DO NOTHING",
        )
        .bind(entry.id)
        .bind(&entry.student_id)
        .bind(&entry.student_name)
        .bind(&entry.student_email)
        .bind(&entry.section)
        .bind(&entry.year_level)
        .bind(&entry.major)
        .bind(&entry.course)
        .bind(&entry.event_name)
        .bind(entry.login_date)
        .bind(&entry.login_time)
        .bind(entry.timestamp)
        .execute(&self.pg)
        .await
        .map_err(Error::from)?;
        Ok(res.rows_affected() >= 1)
    }

    async fn insert_admin(&self, admin: &AdminAccount) -> Result<(), Error> {
        sqlx::query("INSERT INTO admin_accounts VALUES ($1, $2, $3, $4, $5)")
            .bind(admin.id)
            .bind(&admin.username)
            .bind(&admin.password_hash)
            .bind(admin.created_at)
            .bind(admin.last_login)
            .execute(&self.pg)
            .await
            .map_err(Error::from)?;
        Ok(())
    }

    async fn admin_by_username(&self, username: &str) -> Result<Option<AdminAccount>, Error> {
        sqlx::query_as::<_, AdminAccount>(
            "SELECT * FROM admin_accounts WHERE username = $1 LIMIT 1",
        )
        .bind(username)
        .fetch_optional(&self.pg)
        .await
        .map_err(Error::from)
    }

    async fn admin_by_id(&self, id: Uuid) -> Result<Option<AdminAccount>, Error> {
        sqlx::query_as::<_, AdminAccount>("SELECT * FROM admin_accounts WHERE id = $1 LIMIT 1")
            .bind(id)
            .fetch_optional(&self.pg)
            .await
            .map_err(Error::from)
    }

    async fn list_admins(&self) -> Result<Vec<AdminAccount>, Error> {
        sqlx::query_as::<_, AdminAccount>("SELECT * FROM admin_accounts ORDER BY created_at DESC")
            .fetch_all(&self.pg)
            .await
            .map_err(Error::from)
    }

    async fn update_admin_password(&self, id: Uuid, password_hash: &str) -> Result<bool, Error> {
        let res = sqlx::query("UPDATE admin_accounts SET password_hash = $1 WHERE id = $2")
            .bind(password_hash)
            .bind(id)
            .execute(&self.pg)
            .await
            .map_err(Error::from)?;
        Ok(res.rows_affected() >= 1)
    }

    async fn touch_last_login(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), Error> {
        sqlx::query("UPDATE admin_accounts SET last_login = $1 WHERE id = $2")
            .bind(at)
            .bind(id)
            .execute(&self.pg)
            .await
            .map_err(Error::from)?;
        Ok(())
    }

    async fn delete_admin(&self, id: Uuid) -> Result<bool, Error> {
        let res = sqlx::query("DELETE FROM admin_accounts WHERE id = $1")
            .bind(id)
            .execute(&self.pg)
            .await
            .map_err(Error::from)?;
        Ok(res.rows_affected() >= 1)
    }

    async fn insert_session(&self, session: &AdminSession) -> Result<(), Error> {
        let res = sqlx::query("INSERT INTO admin_sessions VALUES ($1, $2, $3)")
            .bind(&session.session_token)
            .bind(session.admin_id)
            .bind(session.expires_at)
            .execute(&self.pg)
            .await
            .map_err(Error::from)?;

        if res.rows_affected() < 1 {
            return Err(Error::InternalError {
                kind: "DatabaseError",
                message: "Could not store admin session!".to_string(),
            });
        }
        Ok(())
    }

    async fn session_by_token(&self, token: &str) -> Result<Option<AdminSession>, Error> {
        sqlx::query_as::<_, AdminSession>(
            "SELECT * FROM admin_sessions WHERE session_token = $1 LIMIT 1",
        )
        .bind(token)
        .fetch_optional(&self.pg)
        .await
        .map_err(Error::from)
    }

    async fn delete_session(&self, token: &str) -> Result<bool, Error> {
        let res = sqlx::query("DELETE FROM admin_sessions WHERE session_token = $1")
            .bind(token)
            .execute(&self.pg)
            .await
            .map_err(Error::from)?;
        Ok(res.rows_affected() >= 1)
    }
}
