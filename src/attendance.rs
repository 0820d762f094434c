use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::Query;
use axum::http::header;
use axum::{Extension, Json};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::AdminAuth;
use crate::export::attendance_csv;
use crate::feed::{ChangeFeed, ChangeKind, Table};
use crate::models::AttendanceEntry;
use crate::payload::{interpret, ScannedPayload};
use crate::scanner::{ScanReport, ScanSink};
use crate::state::AppState;
use crate::store::Backend;
use crate::{breaks, proceeds, Error, Payload};

pub const LOGIN_TIME_FORMAT: &str = "%I:%M %p";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordOutcome {
    Recorded { entry: AttendanceEntry },
    NotRegistered { student_id: String },
    AlreadyLoggedToday { student_id: String, name: String },
}

impl RecordOutcome {
    pub fn is_recorded(&self) -> bool {
        matches!(self, RecordOutcome::Recorded { .. })
    }

    pub fn message(&self) -> String {
        match self {
            RecordOutcome::Recorded { entry } => format!(
                "Attendance recorded for {} ({}) at {}",
                entry.student_name, entry.student_id, entry.login_time
            ),
            RecordOutcome::NotRegistered { student_id } => format!(
                "Student {} not found. Please ensure the student is registered.",
                student_id
            ),
            RecordOutcome::AlreadyLoggedToday { student_id, name } => format!(
                "{} ({}) has already logged attendance today.",
                name, student_id
            ),
        }
    }
}

/// Turns scan payloads into at most one attendance entry per student and day.
pub struct AttendanceRecorder {
    store: Arc<dyn Backend>,
    feed: ChangeFeed,
    default_event: String,
}

impl AttendanceRecorder {
    pub fn new(store: Arc<dyn Backend>, feed: ChangeFeed, default_event: String) -> Self {
        Self {
            store,
            feed,
            default_event,
        }
    }

    pub async fn record(
        &self,
        payload: &ScannedPayload,
        event_name: Option<&str>,
    ) -> Result<RecordOutcome, Error> {
        self.record_at(payload, event_name, Utc::now()).await
    }

    pub async fn record_at(
        &self,
        payload: &ScannedPayload,
        event_name: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<RecordOutcome, Error> {
        let student = match self.store.student_by_id(&payload.student_id).await? {
            Some(student) => student,
            None => {
                log::info!("Scanned id {} is not registered", payload.student_id);
                return Ok(RecordOutcome::NotRegistered {
                    student_id: payload.student_id.clone(),
                });
            }
        };

        let today = now.date_naive();
        let already_logged = || RecordOutcome::AlreadyLoggedToday {
            student_id: student.student_id.clone(),
            name: student.full_name.clone(),
        };

        let history = self.store.attendance_for(&student.student_id).await?;
        if history.iter().any(|entry| entry.login_date == today) {
            return Ok(already_logged());
        }

        let entry = AttendanceEntry {
            id: Uuid::new_v4(),
            student_id: student.student_id.clone(),
            student_name: student.full_name.clone(),
            student_email: student.email.clone(),
            section: student.section.clone(),
            year_level: student.year_level.clone(),
            major: student.major.clone(),
            course: student.course.clone(),
            event_name: event_name
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .unwrap_or(self.default_event.as_str())
                .to_string(),
            login_date: today,
            login_time: now.format(LOGIN_TIME_FORMAT).to_string(),
            timestamp: now,
        };

        // a concurrent scan may have won between the check and this insert
        if !self.store.insert_attendance_once(&entry).await? {
            return Ok(already_logged());
        }

        self.feed.publish(Table::AttendanceRecords, ChangeKind::Insert);
        log::info!(
            "Attendance recorded for {} at event `{}`",
            entry.student_id,
            entry.event_name
        );
        Ok(RecordOutcome::Recorded { entry })
    }
}

/// Binds a recorder to one scan session's event.
pub struct RecorderSink {
    pub recorder: Arc<AttendanceRecorder>,
    pub event_name: Option<String>,
}

#[async_trait]
impl ScanSink for RecorderSink {
    async fn deliver(&self, payload: ScannedPayload) -> ScanReport {
        match self.recorder.record(&payload, self.event_name.as_deref()).await {
            Ok(outcome) => ScanReport {
                accepted: outcome.is_recorded(),
                message: outcome.message(),
                payload,
            },
            Err(err) => {
                log::error!("Recording scan for {} failed: {:?}", payload.student_id, err);
                ScanReport {
                    accepted: false,
                    message: "Failed to record attendance. Please try again.".to_string(),
                    payload,
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoginStamp {
    pub date: NaiveDate,
    pub time: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudentAttendance {
    pub student_id: String,
    pub student_name: String,
    pub email: String,
    pub section: String,
    pub year_level: String,
    pub major: String,
    pub course: String,
    pub event_name: String,
    pub login_timestamps: Vec<LoginStamp>,
}

/// Groups entries per student, keeping the order in which students first
/// appear. Each student's logins are sorted oldest first.
pub fn group_by_student(entries: &[AttendanceEntry]) -> Vec<StudentAttendance> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, StudentAttendance> = HashMap::new();

    for entry in entries {
        let group = groups.entry(entry.student_id.clone()).or_insert_with(|| {
            order.push(entry.student_id.clone());
            StudentAttendance {
                student_id: entry.student_id.clone(),
                student_name: entry.student_name.clone(),
                email: entry.student_email.clone(),
                section: entry.section.clone(),
                year_level: entry.year_level.clone(),
                major: entry.major.clone(),
                course: entry.course.clone(),
                event_name: entry.event_name.clone(),
                login_timestamps: Vec::new(),
            }
        });
        group.login_timestamps.push(LoginStamp {
            date: entry.login_date,
            time: entry.login_time.clone(),
            timestamp: entry.timestamp,
        });
    }

    order
        .into_iter()
        .filter_map(|id| groups.remove(&id))
        .map(|mut group| {
            group.login_timestamps.sort_by_key(|stamp| stamp.timestamp);
            group
        })
        .collect()
}

#[derive(Debug, Default, Deserialize)]
pub struct AttendanceFilter {
    pub search: Option<String>,
    pub event: Option<String>,
}

impl AttendanceFilter {
    pub fn matches(&self, record: &StudentAttendance) -> bool {
        let matches_search = match self.search.as_deref().map(str::trim) {
            Some(term) if !term.is_empty() => {
                let term = term.to_lowercase();
                record.student_name.to_lowercase().contains(&term)
                    || record.student_id.to_lowercase().contains(&term)
            }
            _ => true,
        };
        let matches_event = match self.event.as_deref() {
            Some(event) if event != "all" && !event.is_empty() => record.event_name == event,
            _ => true,
        };
        matches_search && matches_event
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AttendanceOverview {
    pub records: Vec<StudentAttendance>,
    pub total_students: usize,
    pub logged_today: usize,
    pub events: Vec<String>,
}

pub fn overview(
    entries: &[AttendanceEntry],
    filter: &AttendanceFilter,
    today: NaiveDate,
) -> AttendanceOverview {
    let grouped = group_by_student(entries);
    let total_students = grouped.len();
    let logged_today = grouped
        .iter()
        .filter(|r| r.login_timestamps.iter().any(|s| s.date == today))
        .count();
    let events: BTreeSet<String> = grouped.iter().map(|r| r.event_name.clone()).collect();

    AttendanceOverview {
        records: grouped.into_iter().filter(|r| filter.matches(r)).collect(),
        total_students,
        logged_today,
        events: events.into_iter().collect(),
    }
}

pub async fn scan_decoded_text(
    _auth: AdminAuth,
    Json(body): Json<DecodedScan>,
    Extension(state): Extension<Arc<AppState>>,
) -> Payload<ScanResult> {
    if body.text.trim().is_empty() {
        return breaks(Error::invalid("`text` parameter was empty"));
    }
    let payload = interpret(&body.text);
    let outcome = state
        .recorder
        .record(&payload, body.event_name.as_deref())
        .await?;
    proceeds(ScanResult {
        message: outcome.message(),
        payload,
        outcome,
    })
}

pub async fn attendance_overview(
    _auth: AdminAuth,
    Query(filter): Query<AttendanceFilter>,
    Extension(state): Extension<Arc<AppState>>,
) -> Payload<AttendanceOverview> {
    let entries = state.store.list_attendance().await?;
    proceeds(overview(&entries, &filter, Utc::now().date_naive()))
}

pub async fn attendance_range(
    _auth: AdminAuth,
    Query(range): Query<DateRange>,
    Extension(state): Extension<Arc<AppState>>,
) -> Payload<AttendanceList> {
    if range.start > range.end {
        return breaks(Error::invalid("`start` must not be after `end`"));
    }
    proceeds(AttendanceList {
        entries: state.store.attendance_between(range.start, range.end).await?,
    })
}

pub async fn export_attendance(
    _auth: AdminAuth,
    Query(filter): Query<AttendanceFilter>,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<([(header::HeaderName, String); 2], String), Error> {
    let entries = state.store.list_attendance().await?;
    let records: Vec<_> = group_by_student(&entries)
        .into_iter()
        .filter(|r| filter.matches(r))
        .collect();
    let filename = format!(
        "attendance-by-year-{}.csv",
        Utc::now().date_naive().format("%Y-%m-%d")
    );
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        attendance_csv(&records),
    ))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodedScan {
    pub text: String,
    pub event_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanResult {
    pub payload: ScannedPayload,
    pub outcome: RecordOutcome,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttendanceList {
    pub entries: Vec<AttendanceEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::QrPayload;
    use crate::store::MemoryBackend;
    use crate::students::build_student;
    use crate::students::tests::form;
    use chrono::{Duration, TimeZone};

    async fn recorder_with(student_ids: &[&str]) -> (Arc<MemoryBackend>, AttendanceRecorder) {
        let store = Arc::new(MemoryBackend::new());
        for (n, id) in student_ids.iter().enumerate() {
            let student = build_student(&form(id, &format!("s{}@university.edu", n))).unwrap();
            store.insert_student(&student).await.unwrap();
        }
        let recorder =
            AttendanceRecorder::new(store.clone(), ChangeFeed::new(), "Live Event".into());
        (store, recorder)
    }

    fn scanned(student_id: &str) -> ScannedPayload {
        let text = QrPayload {
            student_id: student_id.into(),
            name: "Demo Student".into(),
            email: "demo@university.edu".into(),
            section: "A".into(),
            year_level: "2nd Year".into(),
            major: "Information Technology".into(),
            course: "BSIT".into(),
            id: Uuid::new_v4().to_string(),
        }
        .encode()
        .unwrap();
        interpret(&text)
    }

    #[tokio::test]
    async fn second_scan_on_the_same_day_is_a_duplicate() {
        let (store, recorder) = recorder_with(&["202210042"]).await;
        let morning = Utc.with_ymd_and_hms(2024, 9, 2, 8, 15, 0).unwrap();

        let first = recorder
            .record_at(&scanned("202210042"), None, morning)
            .await
            .unwrap();
        assert!(first.is_recorded());

        let second = recorder
            .record_at(&scanned("202210042"), None, morning + Duration::hours(2))
            .await
            .unwrap();
        assert!(matches!(second, RecordOutcome::AlreadyLoggedToday { .. }));
        assert!(second.message().contains("already logged attendance today"));

        assert_eq!(store.attendance_for("202210042").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn next_day_is_a_new_entry() {
        let (store, recorder) = recorder_with(&["202210042"]).await;
        let day = Utc.with_ymd_and_hms(2024, 9, 2, 8, 15, 0).unwrap();
        for offset in 0..2 {
            let outcome = recorder
                .record_at(&scanned("202210042"), Some("Orientation"), day + Duration::days(offset))
                .await
                .unwrap();
            assert!(outcome.is_recorded());
        }
        let history = store.attendance_for("202210042").await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|e| e.event_name == "Orientation"));
    }

    #[tokio::test]
    async fn unregistered_students_leave_no_rows() {
        let (store, recorder) = recorder_with(&["202210042"]).await;
        let outcome = recorder.record(&scanned("999999999"), None).await.unwrap();

        assert_eq!(
            outcome,
            RecordOutcome::NotRegistered {
                student_id: "999999999".into()
            }
        );
        assert!(outcome.message().contains("not found"));
        assert!(store.list_attendance().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn entries_use_roster_data_and_default_event() {
        let (_, recorder) = recorder_with(&["202210042"]).await;
        // payload carries placeholders, the roster supplies the real name
        let outcome = recorder.record(&interpret("202210042"), None).await.unwrap();
        match outcome {
            RecordOutcome::Recorded { entry } => {
                assert_eq!(entry.student_name, "Demo Student");
                assert_eq!(entry.course, "BSIT");
                assert_eq!(entry.event_name, "Live Event");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn sink_reports_duplicates_as_not_accepted() {
        let (_, recorder) = recorder_with(&["202210042"]).await;
        let sink = RecorderSink {
            recorder: Arc::new(recorder),
            event_name: None,
        };
        assert!(sink.deliver(scanned("202210042")).await.accepted);
        let again = sink.deliver(scanned("202210042")).await;
        assert!(!again.accepted);
        assert_eq!(again.payload.student_id, "202210042");
    }

    #[test]
    fn grouping_sorts_logins_and_filters() {
        let base = Utc.with_ymd_and_hms(2024, 9, 2, 8, 0, 0).unwrap();
        let make = |id: &str, name: &str, event: &str, at: DateTime<Utc>| AttendanceEntry {
            id: Uuid::new_v4(),
            student_id: id.into(),
            student_name: name.into(),
            student_email: format!("{}@u.edu", id),
            section: "A".into(),
            year_level: "1st Year".into(),
            major: "Not applicable".into(),
            course: "BSCS".into(),
            event_name: event.into(),
            login_date: at.date_naive(),
            login_time: at.format(LOGIN_TIME_FORMAT).to_string(),
            timestamp: at,
        };
        // newest first, as the store returns them
        let entries = vec![
            make("2", "Jane Smith", "Fair", base + Duration::days(1)),
            make("1", "John Doe", "Fair", base + Duration::days(1)),
            make("1", "John Doe", "Fair", base),
        ];

        let grouped = group_by_student(&entries);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].student_id, "2");
        assert!(grouped[1].login_timestamps[0].timestamp < grouped[1].login_timestamps[1].timestamp);

        let filter = AttendanceFilter {
            search: Some("john".into()),
            event: Some("all".into()),
        };
        let view = overview(&entries, &filter, (base + Duration::days(1)).date_naive());
        assert_eq!(view.records.len(), 1);
        assert_eq!(view.total_students, 2);
        assert_eq!(view.logged_today, 2);
        assert_eq!(view.events, vec!["Fair".to_string()]);
    }
}
