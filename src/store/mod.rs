//! Persistence boundary. Handlers never talk to a database directly; they go
//! through the [`Backend`] held by the application state.

mod memory;
mod postgres;

pub use memory::MemoryBackend;
pub use postgres::PgBackend;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::err::Error;
use crate::models::{AdminAccount, AdminSession, AttendanceEntry, StudentRecord};

#[async_trait]
pub trait Backend: Send + Sync {
    async fn insert_student(&self, student: &StudentRecord) -> Result<(), Error>;
    async fn student_by_id(&self, student_id: &str) -> Result<Option<StudentRecord>, Error>;
    async fn list_students(&self) -> Result<Vec<StudentRecord>, Error>;
    async fn delete_student(&self, student_id: &str) -> Result<bool, Error>;

    /// Most recent first.
    async fn attendance_for(&self, student_id: &str) -> Result<Vec<AttendanceEntry>, Error>;
    /// Most recent first.
    async fn list_attendance(&self) -> Result<Vec<AttendanceEntry>, Error>;
    /// Inclusive on both ends, most recent first.
    async fn attendance_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<AttendanceEntry>, Error>;
    /// Atomically inserts unless an entry for the same student and login date
    /// exists. Returns `false` when the insert was skipped.
    async fn insert_attendance_once(&self, entry: &AttendanceEntry) -> Result<bool, Error>;

    async fn insert_admin(&self, admin: &AdminAccount) -> Result<(), Error>;
    async fn admin_by_username(&self, username: &str) -> Result<Option<AdminAccount>, Error>;
    async fn admin_by_id(&self, id: Uuid) -> Result<Option<AdminAccount>, Error>;
    async fn list_admins(&self) -> Result<Vec<AdminAccount>, Error>;
    async fn update_admin_password(&self, id: Uuid, password_hash: &str) -> Result<bool, Error>;
    async fn touch_last_login(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), Error>;
    async fn delete_admin(&self, id: Uuid) -> Result<bool, Error>;

    async fn insert_session(&self, session: &AdminSession) -> Result<(), Error>;
    async fn session_by_token(&self, token: &str) -> Result<Option<AdminSession>, Error>;
    async fn delete_session(&self, token: &str) -> Result<bool, Error>;
}
