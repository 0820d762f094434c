//! Wire format of the structured record encoded into each student's QR image,
//! and the interpreter that turns decoded text back into a scan payload.
//!
//! The JSON field names are shared with every code already issued, so they
//! must stay flat and keep their camelCase spelling.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::StudentRecord;

pub const UNKNOWN: &str = "Unknown";
pub const UNKNOWN_NAME: &str = "Unknown Student";
pub const UNKNOWN_EMAIL: &str = "unknown@email.com";
pub const RAW_NAME: &str = "QR Code Student";
pub const RAW_EMAIL: &str = "qr@student.com";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrPayload {
    pub student_id: String,
    pub name: String,
    pub email: String,
    pub section: String,
    pub year_level: String,
    pub major: String,
    pub course: String,
    pub id: String,
}

impl QrPayload {
    pub fn for_student(student: &StudentRecord) -> Self {
        Self {
            student_id: student.student_id.clone(),
            name: student.full_name.clone(),
            email: student.email.clone(),
            section: student.section.clone(),
            year_level: student.year_level.clone(),
            major: student.major.clone(),
            course: student.course.clone(),
            id: Uuid::new_v4().to_string(),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Lenient mirror of [`QrPayload`]: every field may be absent or mistyped.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct LooseQrPayload {
    student_id: Option<serde_json::Value>,
    name: Option<serde_json::Value>,
    email: Option<serde_json::Value>,
    section: Option<serde_json::Value>,
    year_level: Option<serde_json::Value>,
    major: Option<serde_json::Value>,
    course: Option<serde_json::Value>,
    id: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadQuality {
    /// Structured record with studentId, name and email present.
    Complete,
    /// Structured record with placeholders substituted for missing fields.
    Partial,
    /// Not structured; the whole text is taken as the student id.
    Raw,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannedPayload {
    pub student_id: String,
    pub name: String,
    pub email: String,
    pub section: String,
    pub year_level: String,
    pub major: String,
    pub course: String,
    pub scan_instance_id: String,
    pub quality: PayloadQuality,
}

fn text(value: Option<serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Never fails: malformed content degrades into a placeholder-filled payload
/// and rejection is left to the attendance recorder.
pub fn interpret(decoded: &str) -> ScannedPayload {
    let loose = match serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(decoded)
        .and_then(|record| serde_json::from_value::<LooseQrPayload>(record.into()))
    {
        Ok(loose) => loose,
        Err(_) => {
            log::warn!("QR content is not a structured record, treating it as a raw id");
            return raw(decoded);
        }
    };

    let student_id = text(loose.student_id);
    let name = text(loose.name);
    let email = text(loose.email);
    let quality = if student_id.is_some() && name.is_some() && email.is_some() {
        PayloadQuality::Complete
    } else {
        log::warn!("QR record is missing identifying fields, substituting placeholders");
        PayloadQuality::Partial
    };

    ScannedPayload {
        student_id: student_id.unwrap_or_else(|| UNKNOWN.to_string()),
        name: name.unwrap_or_else(|| UNKNOWN_NAME.to_string()),
        email: email.unwrap_or_else(|| UNKNOWN_EMAIL.to_string()),
        section: text(loose.section).unwrap_or_else(|| UNKNOWN.to_string()),
        year_level: text(loose.year_level).unwrap_or_else(|| UNKNOWN.to_string()),
        major: text(loose.major).unwrap_or_else(|| UNKNOWN.to_string()),
        course: text(loose.course).unwrap_or_else(|| UNKNOWN.to_string()),
        scan_instance_id: text(loose.id).unwrap_or_else(|| Uuid::new_v4().to_string()),
        quality,
    }
}

fn raw(decoded: &str) -> ScannedPayload {
    ScannedPayload {
        student_id: decoded.trim().to_string(),
        name: RAW_NAME.to_string(),
        email: RAW_EMAIL.to_string(),
        section: UNKNOWN.to_string(),
        year_level: UNKNOWN.to_string(),
        major: UNKNOWN.to_string(),
        course: UNKNOWN.to_string(),
        scan_instance_id: Uuid::new_v4().to_string(),
        quality: PayloadQuality::Raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issued() -> QrPayload {
        QrPayload {
            student_id: "202210042".into(),
            name: "Demo Student".into(),
            email: "demo@university.edu".into(),
            section: "A".into(),
            year_level: "2nd Year".into(),
            major: "Information Technology".into(),
            course: "BSIT".into(),
            id: "5f0c3a4e-0000-4000-8000-000000000000".into(),
        }
    }

    #[test]
    fn complete_record_keeps_every_field() {
        let source = issued();
        let scanned = interpret(&source.encode().unwrap());

        assert_eq!(scanned.quality, PayloadQuality::Complete);
        assert_eq!(scanned.student_id, source.student_id);
        assert_eq!(scanned.name, source.name);
        assert_eq!(scanned.email, source.email);
        assert_eq!(scanned.section, source.section);
        assert_eq!(scanned.year_level, source.year_level);
        assert_eq!(scanned.major, source.major);
        assert_eq!(scanned.course, source.course);
        assert_eq!(scanned.scan_instance_id, source.id);
    }

    #[test]
    fn wire_names_are_flat_camel_case() {
        let json: serde_json::Value = serde_json::from_str(&issued().encode().unwrap()).unwrap();
        let mut keys: Vec<_> = json.as_object().unwrap().keys().cloned().collect();
        keys.sort();
        assert_eq!(
            keys,
            ["course", "email", "id", "major", "name", "section", "studentId", "yearLevel"]
        );
    }

    #[test]
    fn missing_fields_get_placeholders() {
        let scanned = interpret(r#"{"studentId":"202210042","section":"B"}"#);

        assert_eq!(scanned.quality, PayloadQuality::Partial);
        assert_eq!(scanned.student_id, "202210042");
        assert_eq!(scanned.name, UNKNOWN_NAME);
        assert_eq!(scanned.email, UNKNOWN_EMAIL);
        assert_eq!(scanned.section, "B");
        assert_eq!(scanned.course, UNKNOWN);
        assert!(!scanned.scan_instance_id.is_empty());
    }

    #[test]
    fn empty_strings_count_as_missing() {
        let scanned = interpret(r#"{"studentId":"","name":"A","email":"a@b.c"}"#);
        assert_eq!(scanned.quality, PayloadQuality::Partial);
        assert_eq!(scanned.student_id, UNKNOWN);
    }

    #[test]
    fn numeric_ids_are_accepted() {
        let scanned = interpret(r#"{"studentId":202210042,"name":"A","email":"a@b.c"}"#);
        assert_eq!(scanned.quality, PayloadQuality::Complete);
        assert_eq!(scanned.student_id, "202210042");
    }

    #[test]
    fn plain_text_becomes_raw_id() {
        let scanned = interpret("202210042");
        // a bare number is valid JSON but not a record
        assert_eq!(scanned.quality, PayloadQuality::Raw);
        assert_eq!(scanned.student_id, "202210042");

        let scanned = interpret(r#"["202210042","A","a@b.c"]"#);
        // arrays are not records, so nothing is read from them by position
        assert_eq!(scanned.quality, PayloadQuality::Raw);
        assert_eq!(scanned.student_id, r#"["202210042","A","a@b.c"]"#);
        assert_eq!(scanned.name, RAW_NAME);

        let scanned = interpret("hello there");
        assert_eq!(scanned.quality, PayloadQuality::Raw);
        assert_eq!(scanned.student_id, "hello there");
        assert_eq!(scanned.name, RAW_NAME);
        assert_eq!(scanned.email, RAW_EMAIL);
        assert_eq!(scanned.section, UNKNOWN);
    }
}
