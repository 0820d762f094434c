use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::Backend;
use crate::err::Error;
use crate::models::{AdminAccount, AdminSession, AttendanceEntry, StudentRecord};

/// Process-local store used when no database is configured.
#[derive(Default)]
pub struct MemoryBackend {
    students: RwLock<Vec<StudentRecord>>,
    attendance: RwLock<Vec<AttendanceEntry>>,
    admins: RwLock<Vec<AdminAccount>>,
    sessions: RwLock<HashMap<String, AdminSession>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn newest_first(mut entries: Vec<AttendanceEntry>) -> Vec<AttendanceEntry> {
    entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    entries
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn insert_student(&self, student: &StudentRecord) -> Result<(), Error> {
        let mut students = self.students.write().await;
        if students.iter().any(|s| s.student_id == student.student_id) {
            return Err(Error::Conflict {
                field: "studentId",
                message: "This student ID is already registered".to_string(),
            });
        }
        if students.iter().any(|s| s.email.eq_ignore_ascii_case(&student.email)) {
            return Err(Error::Conflict {
                field: "email",
                message: "This email address is already registered".to_string(),
            });
        }
        students.push(student.clone());
        Ok(())
    }

    async fn student_by_id(&self, student_id: &str) -> Result<Option<StudentRecord>, Error> {
        let students = self.students.read().await;
        Ok(students.iter().find(|s| s.student_id == student_id).cloned())
    }

    async fn list_students(&self) -> Result<Vec<StudentRecord>, Error> {
        let mut students = self.students.read().await.clone();
        students.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(students)
    }

    async fn delete_student(&self, student_id: &str) -> Result<bool, Error> {
        let mut students = self.students.write().await;
        let before = students.len();
        students.retain(|s| s.student_id != student_id);
        Ok(students.len() < before)
    }

    async fn attendance_for(&self, student_id: &str) -> Result<Vec<AttendanceEntry>, Error> {
        let attendance = self.attendance.read().await;
        Ok(newest_first(
            attendance
                .iter()
                .filter(|e| e.student_id == student_id)
                .cloned()
                .collect(),
        ))
    }

    async fn list_attendance(&self) -> Result<Vec<AttendanceEntry>, Error> {
        Ok(newest_first(self.attendance.read().await.clone()))
    }

    async fn attendance_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<AttendanceEntry>, Error> {
        let attendance = self.attendance.read().await;
        Ok(newest_first(
            attendance
                .iter()
                .filter(|e| e.login_date >= start && e.login_date <= end)
                .cloned()
                .collect(),
        ))
    }

    async fn insert_attendance_once(&self, entry: &AttendanceEntry) -> Result<bool, Error> {
        // check and insert under one write guard
        let mut attendance = self.attendance.write().await;
        let exists = attendance
            .iter()
            .any(|e| e.student_id == entry.student_id && e.login_date == entry.login_date);
        if exists {
            return Ok(false);
        }
        attendance.push(entry.clone());
        Ok(true)
    }

    async fn insert_admin(&self, admin: &AdminAccount) -> Result<(), Error> {
        let mut admins = self.admins.write().await;
        if admins.iter().any(|a| a.username == admin.username) {
            return Err(Error::Conflict {
                field: "username",
                message: "Username already exists".to_string(),
            });
        }
        admins.push(admin.clone());
        Ok(())
    }

    async fn admin_by_username(&self, username: &str) -> Result<Option<AdminAccount>, Error> {
        let admins = self.admins.read().await;
        Ok(admins.iter().find(|a| a.username == username).cloned())
    }

    async fn admin_by_id(&self, id: Uuid) -> Result<Option<AdminAccount>, Error> {
        let admins = self.admins.read().await;
        Ok(admins.iter().find(|a| a.id == id).cloned())
    }

    async fn list_admins(&self) -> Result<Vec<AdminAccount>, Error> {
        let mut admins = self.admins.read().await.clone();
        admins.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(admins)
    }

    async fn update_admin_password(&self, id: Uuid, password_hash: &str) -> Result<bool, Error> {
        let mut admins = self.admins.write().await;
        Ok(match admins.iter_mut().find(|a| a.id == id) {
            Some(admin) => {
                admin.password_hash = password_hash.to_string();
                true
            }
            None => false,
        })
    }

    async fn touch_last_login(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), Error> {
        let mut admins = self.admins.write().await;
        if let Some(admin) = admins.iter_mut().find(|a| a.id == id) {
            admin.last_login = Some(at);
        }
        Ok(())
    }

    async fn delete_admin(&self, id: Uuid) -> Result<bool, Error> {
        let mut admins = self.admins.write().await;
        let before = admins.len();
        admins.retain(|a| a.id != id);
        let removed = admins.len() < before;
        if removed {
            // sessions cascade with their admin
            self.sessions.write().await.retain(|_, s| s.admin_id != id);
        }
        Ok(removed)
    }

    async fn insert_session(&self, session: &AdminSession) -> Result<(), Error> {
        self.sessions
            .write()
            .await
            .insert(session.session_token.clone(), session.clone());
        Ok(())
    }

    async fn session_by_token(&self, token: &str) -> Result<Option<AdminSession>, Error> {
        Ok(self.sessions.read().await.get(token).cloned())
    }

    async fn delete_session(&self, token: &str) -> Result<bool, Error> {
        Ok(self.sessions.write().await.remove(token).is_some())
    }
}
