use std::fmt::Write;

use crate::attendance::StudentAttendance;
use crate::models::YearLevel;

const HEADERS: [&str; 8] = [
    "Student Name",
    "Student ID",
    "Course",
    "Section",
    "Major",
    "Event",
    "Login Dates & Times",
    "Total Login Days",
];

fn quoted(cell: &str) -> String {
    format!("\"{}\"", cell.replace('"', "\"\""))
}

fn row<I, S>(cells: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    cells
        .into_iter()
        .map(|cell| quoted(cell.as_ref()))
        .collect::<Vec<_>>()
        .join(",")
}

fn login_times(record: &StudentAttendance) -> String {
    record
        .login_timestamps
        .iter()
        .map(|stamp| format!("{} at {}", stamp.date.format("%b %-d, %Y"), stamp.time))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Renders grouped attendance as CSV, one section per year level.
/// Records with an unrecognised year level are left out.
pub fn attendance_csv(records: &[StudentAttendance]) -> String {
    let mut csv = String::new();

    for level in YearLevel::ALL {
        let year: Vec<&StudentAttendance> = records
            .iter()
            .filter(|r| r.year_level == level.as_str())
            .collect();
        if year.is_empty() {
            continue;
        }
        if !csv.is_empty() {
            csv.push_str("\n\n");
        }

        let sessions: usize = year.iter().map(|r| r.login_timestamps.len()).sum();
        // writing into a String cannot fail
        let _ = writeln!(csv, "{}", quoted(&format!("=== {} Students ===", level)));
        let _ = writeln!(csv, "{}\n", quoted(&format!("Total Students: {}", year.len())));
        let _ = writeln!(csv, "{}", row(HEADERS));
        for record in &year {
            let _ = writeln!(
                csv,
                "{}",
                row([
                    record.student_name.as_str(),
                    record.student_id.as_str(),
                    record.course.as_str(),
                    record.section.as_str(),
                    record.major.as_str(),
                    record.event_name.as_str(),
                    login_times(record).as_str(),
                    record.login_timestamps.len().to_string().as_str(),
                ])
            );
        }
        let _ = writeln!(csv, "\n{}", quoted(&format!("Summary for {}:", level)));
        let _ = writeln!(csv, "{}", quoted(&format!("Total Students: {}", year.len())));
        let _ = writeln!(csv, "{}", quoted(&format!("Total Login Sessions: {}", sessions)));
    }

    if csv.is_empty() {
        csv = format!("{}\n", quoted("No attendance records found for any year level"));
    }
    csv
}
