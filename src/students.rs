use std::sync::Arc;

use axum::extract::Path;
use axum::{Extension, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::AdminAuth;
use crate::feed::{ChangeKind, Table};
use crate::mail::{EmailOutcome, QrEmail};
use crate::models::{Section, StudentRecord, YearLevel};
use crate::payload::QrPayload;
use crate::state::AppState;
use crate::{breaks, proceeds, Error, Payload};

pub const MAJOR_NOT_APPLICABLE: &str = "Not applicable";
pub const MAJOR_NOT_SPECIFIED: &str = "Not specified";

pub fn qr_image_url(endpoint: &str, qr_payload: &str) -> String {
    format!(
        "{}?size=300x300&data={}",
        endpoint,
        urlencoding::encode(qr_payload)
    )
}

/// Upper-cases the course code and requires it to be letters only.
pub fn normalize_course(course: &str) -> Result<String, Error> {
    let course = course.trim().to_uppercase();
    if course.is_empty() || !course.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(Error::invalid(
            "Course should contain only uppercase letters (e.g., BSCS, BSIT, BSEE)",
        ));
    }
    Ok(course)
}

pub fn resolve_major(year_level: YearLevel, major: Option<&str>) -> String {
    if !year_level.declares_major() {
        return MAJOR_NOT_APPLICABLE.to_string();
    }
    match major.map(str::trim) {
        Some(major) if !major.is_empty() => major.to_string(),
        _ => MAJOR_NOT_SPECIFIED.to_string(),
    }
}

fn looks_like_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !email.contains(' '),
        None => false,
    }
}

pub const STUDENT_ID_DIGITS: usize = 9;

pub fn is_student_id(student_id: &str) -> bool {
    student_id.len() == STUDENT_ID_DIGITS && student_id.bytes().all(|b| b.is_ascii_digit())
}

/// Validates the form and builds the record, QR payload included.
pub fn build_student(form: &RegisterStudent) -> Result<StudentRecord, Error> {
    let full_name = form.full_name.trim();
    if full_name.is_empty() {
        return Err(Error::invalid("`fullName` parameter was empty"));
    }
    let student_id = form.student_id.trim();
    if !is_student_id(student_id) {
        return Err(Error::invalid("`studentId` must be exactly 9 digits"));
    }
    let email = form.email.trim().to_lowercase();
    if !looks_like_email(&email) {
        return Err(Error::invalid(format!("`{}` is not a valid email address", email)));
    }
    let section: Section = form.section.parse()?;
    let year_level: YearLevel = form.year_level.parse()?;
    let course = normalize_course(&form.course)?;
    let major = resolve_major(year_level, form.major.as_deref());

    let mut student = StudentRecord {
        id: Uuid::new_v4(),
        student_id: student_id.to_string(),
        full_name: full_name.to_string(),
        email,
        section: section.as_str().to_string(),
        year_level: year_level.as_str().to_string(),
        major,
        course,
        qr_code: String::new(),
        created_at: Utc::now(),
    };
    student.qr_code = QrPayload::for_student(&student).encode()?;
    Ok(student)
}

pub async fn register(state: &AppState, form: &RegisterStudent) -> Result<RegisteredStudent, Error> {
    let student = build_student(form)?;

    if state.store.student_by_id(&student.student_id).await?.is_some() {
        return Err(Error::Conflict {
            field: "studentId",
            message: "A student with this ID already exists. Please use a different student ID."
                .to_string(),
        });
    }
    state.store.insert_student(&student).await?;
    state.feed.publish(Table::Students, ChangeKind::Insert);
    log::info!("Registered student {} ({})", student.student_id, student.full_name);

    let qr_image_url = qr_image_url(&state.config.qr_image_endpoint, &student.qr_code);
    let email = state
        .mailer
        .send_qr_code(&QrEmail {
            to: student.email.clone(),
            student_name: student.full_name.clone(),
            student_id: student.student_id.clone(),
            qr_image_url: qr_image_url.clone(),
        })
        .await;

    Ok(RegisteredStudent {
        student,
        qr_image_url,
        email,
    })
}

pub async fn register_student(
    Json(form): Json<RegisterStudent>,
    Extension(state): Extension<Arc<AppState>>,
) -> Payload<RegisteredStudent> {
    match register(&state, &form).await {
        Ok(registered) => proceeds(registered),
        Err(err) => breaks(err),
    }
}

pub async fn student_dashboard(
    Path(student_id): Path<String>,
    Extension(state): Extension<Arc<AppState>>,
) -> Payload<StudentCard> {
    let student = match state.store.student_by_id(&student_id).await? {
        Some(student) => student,
        None => {
            return breaks(Error::not_found(format!(
                "Student with id `{}` does not exist!",
                student_id
            )))
        }
    };
    let qr_image_url = qr_image_url(&state.config.qr_image_endpoint, &student.qr_code);
    proceeds(StudentCard {
        student,
        qr_image_url,
    })
}

pub async fn list_students(
    _auth: AdminAuth,
    Extension(state): Extension<Arc<AppState>>,
) -> Payload<StudentList> {
    proceeds(StudentList {
        students: state.store.list_students().await?,
    })
}

pub async fn delete_student(
    _auth: AdminAuth,
    Path(student_id): Path<String>,
    Extension(state): Extension<Arc<AppState>>,
) -> Payload<StudentDeleted> {
    if !state.store.delete_student(&student_id).await? {
        return breaks(Error::not_found(format!(
            "Student with id `{}` does not exist!",
            student_id
        )));
    }
    state.feed.publish(Table::Students, ChangeKind::Delete);
    proceeds(StudentDeleted { student_id })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterStudent {
    pub full_name: String,
    pub student_id: String,
    pub email: String,
    pub year_level: String,
    pub section: String,
    pub major: Option<String>,
    pub course: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisteredStudent {
    pub student: StudentRecord,
    pub qr_image_url: String,
    pub email: EmailOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentCard {
    pub student: StudentRecord,
    pub qr_image_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentList {
    pub students: Vec<StudentRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentDeleted {
    pub student_id: String,
}
