use crate::aggregate::{SessionRecord, Student, StudentSubjectReport};
use std::collections::{BTreeSet, HashSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportError {
    /// Empty roster or empty session set; no partial file is produced.
    NoData,
}

impl fmt::Display for ExportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportError::NoData => write!(f, "no data to export"),
        }
    }
}

impl std::error::Error for ExportError {}

pub fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

pub fn parse_csv_record(line: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0usize;
    while i < chars.len() {
        let ch = chars[i];
        if ch == '"' {
            if in_quotes && i + 1 < chars.len() && chars[i + 1] == '"' {
                buf.push('"');
                i += 2;
                continue;
            }
            in_quotes = !in_quotes;
            i += 1;
            continue;
        }
        if ch == ',' && !in_quotes {
            out.push(buf);
            buf = String::new();
            i += 1;
            continue;
        }
        buf.push(ch);
        i += 1;
    }
    out.push(buf);
    out
}

/// Date-matrix register: one row per student, one column per distinct
/// session date (ascending), cells "Present"/"Absent". A student is
/// Present on a date when any session on that date carries an
/// is_present entry for them.
pub fn date_matrix_csv(
    students: &[Student],
    sessions: &[SessionRecord],
) -> Result<String, ExportError> {
    if students.is_empty() || sessions.is_empty() {
        return Err(ExportError::NoData);
    }

    // ISO dates, so lexicographic order is chronological order.
    let dates: BTreeSet<&str> = sessions.iter().map(|s| s.date.as_str()).collect();

    let mut present: HashSet<(&str, &str)> = HashSet::new();
    for s in sessions {
        for e in &s.entries {
            if e.is_present {
                present.insert((s.date.as_str(), e.student_id.as_str()));
            }
        }
    }

    let mut ordered: Vec<&Student> = students.iter().collect();
    ordered.sort_by(|a, b| {
        a.name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then_with(|| a.roll_no.cmp(&b.roll_no))
    });

    let mut csv = String::from("Roll Number,Student Name");
    for d in &dates {
        csv.push(',');
        csv.push_str(&csv_quote(d));
    }
    csv.push('\n');

    for s in ordered {
        csv.push_str(&csv_quote(&s.roll_no));
        csv.push(',');
        csv.push_str(&csv_quote(&s.name));
        for d in &dates {
            csv.push(',');
            csv.push_str(if present.contains(&(*d, s.id.as_str())) {
                "Present"
            } else {
                "Absent"
            });
        }
        csv.push('\n');
    }

    Ok(csv)
}

/// Subject-by-session-type breakdown for one student, one row per
/// subject ascending, closed by an Overall row.
pub fn subject_breakdown_csv(report: &StudentSubjectReport) -> Result<String, ExportError> {
    if report.subjects.is_empty() {
        return Err(ExportError::NoData);
    }

    let mut csv = String::from(
        "Subject,Lecture Attended,Lecture Total,Practical Attended,Practical Total,Percentage\n",
    );
    for s in &report.subjects {
        csv.push_str(&format!(
            "{},{},{},{},{},{}\n",
            csv_quote(&s.subject_name),
            s.lecture_attended,
            s.lecture_total,
            s.practical_attended,
            s.practical_total,
            s.percentage
        ));
    }
    let lec_att: i64 = report.subjects.iter().map(|s| s.lecture_attended).sum();
    let lec_tot: i64 = report.subjects.iter().map(|s| s.lecture_total).sum();
    let prac_att: i64 = report.subjects.iter().map(|s| s.practical_attended).sum();
    let prac_tot: i64 = report.subjects.iter().map(|s| s.practical_total).sum();
    csv.push_str(&format!(
        "Overall,{},{},{},{},{}\n",
        lec_att, lec_tot, prac_att, prac_tot, report.overall.percentage
    ));

    Ok(csv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{
        subject_breakdown, AttendanceEntry, SessionType, DEFAULT_THRESHOLD_PERCENT,
    };

    fn student(id: &str, name: &str, roll: &str) -> Student {
        Student {
            id: id.to_string(),
            name: name.to_string(),
            roll_no: roll.to_string(),
            department: "Computer".to_string(),
            year: "3rd Year".to_string(),
            batch: None,
        }
    }

    fn lecture(id: &str, date: &str, present: &[&str]) -> SessionRecord {
        SessionRecord {
            id: id.to_string(),
            teacher_id: "t-1".to_string(),
            department: "Computer".to_string(),
            year: "3rd Year".to_string(),
            subject_name: "DBMS".to_string(),
            session_type: SessionType::Lecture,
            batch: None,
            sessions_count: 1,
            date: date.to_string(),
            entries: present
                .iter()
                .map(|sid| AttendanceEntry {
                    student_id: sid.to_string(),
                    is_present: true,
                })
                .collect(),
        }
    }

    #[test]
    fn quote_round_trips_awkward_fields() {
        let fields = ["plain", "has,comma", "has \"quotes\"", ""];
        let line = fields
            .iter()
            .map(|f| csv_quote(f))
            .collect::<Vec<_>>()
            .join(",");
        assert_eq!(parse_csv_record(&line), fields);
    }

    #[test]
    fn matrix_has_expected_shape_and_round_trips() {
        let students = [
            student("s1", "Asha Rao", "301"),
            student("s2", "Kiran, Jr.", "302"),
            student("s3", "Zoya Khan", "303"),
        ];
        let sessions = [
            lecture("l1", "2025-01-06", &["s1", "s3"]),
            lecture("l2", "2025-01-07", &["s2"]),
        ];
        let csv = date_matrix_csv(&students, &sessions).expect("matrix");
        let lines: Vec<&str> = csv.lines().collect();
        // N+1 rows, M+2 columns.
        assert_eq!(lines.len(), 4);
        for line in &lines {
            assert_eq!(parse_csv_record(line).len(), 4);
        }
        let header = parse_csv_record(lines[0]);
        assert_eq!(header[2], "2025-01-06");
        assert_eq!(header[3], "2025-01-07");

        let first = parse_csv_record(lines[1]);
        assert_eq!(first[0], "301");
        assert_eq!(first[2], "Present");
        assert_eq!(first[3], "Absent");
        let second = parse_csv_record(lines[2]);
        assert_eq!(second[1], "Kiran, Jr.");
        assert_eq!(second[2], "Absent");
        assert_eq!(second[3], "Present");
    }

    #[test]
    fn matrix_refuses_empty_inputs() {
        let students = [student("s1", "Asha Rao", "301")];
        let sessions = [lecture("l1", "2025-01-06", &["s1"])];
        assert_eq!(date_matrix_csv(&[], &sessions), Err(ExportError::NoData));
        assert_eq!(date_matrix_csv(&students, &[]), Err(ExportError::NoData));
    }

    #[test]
    fn breakdown_ends_with_overall_row() {
        let s1 = student("s1", "Asha Rao", "301");
        let sessions = [
            lecture("l1", "2025-01-06", &["s1"]),
            lecture("l2", "2025-01-07", &[]),
        ];
        let report = subject_breakdown(&s1, &sessions, &[], DEFAULT_THRESHOLD_PERCENT);
        let csv = subject_breakdown_csv(&report).expect("breakdown");
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("DBMS,1,2,0,0,"));
        assert!(lines[2].starts_with("Overall,1,2,0,0,50.00"));
    }

    #[test]
    fn breakdown_refuses_student_with_no_sessions() {
        let s1 = student("s1", "Asha Rao", "301");
        let report = subject_breakdown(&s1, &[], &[], DEFAULT_THRESHOLD_PERCENT);
        assert_eq!(subject_breakdown_csv(&report), Err(ExportError::NoData));
    }
}
