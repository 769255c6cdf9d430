use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

pub const DEFAULT_THRESHOLD_PERCENT: f64 = 75.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    Lecture,
    Practical,
}

impl SessionType {
    /// Session units a single meeting contributes unless overridden:
    /// lectures count 1, practicals count 2.
    pub fn default_sessions_count(self) -> i64 {
        match self {
            SessionType::Lecture => 1,
            SessionType::Practical => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionType::Lecture => "lecture",
            SessionType::Practical => "practical",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "lecture" => Some(SessionType::Lecture),
            "practical" => Some(SessionType::Practical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Student {
    pub id: String,
    pub name: String,
    pub roll_no: String,
    pub department: String,
    pub year: String,
    pub batch: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AttendanceEntry {
    pub student_id: String,
    pub is_present: bool,
}

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    pub teacher_id: String,
    pub department: String,
    pub year: String,
    pub subject_name: String,
    pub session_type: SessionType,
    pub batch: Option<String>,
    pub sessions_count: i64,
    pub date: String,
    pub entries: Vec<AttendanceEntry>,
}

impl SessionRecord {
    /// A record the engine refuses to count: a practical with no batch,
    /// a non-positive unit count, or a date that is not YYYY-MM-DD.
    pub fn is_malformed(&self) -> bool {
        if self.sessions_count < 1 {
            return true;
        }
        if self.session_type == SessionType::Practical && self.batch.is_none() {
            return true;
        }
        NaiveDate::parse_from_str(&self.date, "%Y-%m-%d").is_err()
    }
}

#[derive(Debug, Clone)]
pub struct ExtraCredit {
    pub id: String,
    pub student_id: String,
    pub extra_sessions: i64,
    pub reason: String,
    pub department: String,
    pub year: String,
    pub batch: Option<String>,
    pub added_at: String,
}

/// Whether students with no applicable sessions appear in the report.
/// `Include` synthesizes 0/0 rows (always defaulters); `Omit` drops them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroSessionPolicy {
    Include,
    Omit,
}

impl ZeroSessionPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            ZeroSessionPolicy::Include => "include",
            ZeroSessionPolicy::Omit => "omit",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "include" => Some(ZeroSessionPolicy::Include),
            "omit" => Some(ZeroSessionPolicy::Omit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AggregateOptions {
    pub subject: Option<String>,
    pub threshold_percent: f64,
    pub zero_session_policy: ZeroSessionPolicy,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self {
            subject: None,
            threshold_percent: DEFAULT_THRESHOLD_PERCENT,
            zero_session_policy: ZeroSessionPolicy::Include,
        }
    }
}

/// Out-of-range thresholds are clamped, not rejected. Non-finite input
/// falls back to the default.
pub fn clamp_threshold(raw: f64) -> f64 {
    if !raw.is_finite() {
        return DEFAULT_THRESHOLD_PERCENT;
    }
    raw.clamp(0.0, 100.0)
}

// Conducted-session totals are keyed by this composite rather than a
// concatenated string. Lecture keys always carry batch = None.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ConductedKey {
    year: String,
    subject: String,
    session_type: SessionType,
    batch: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentAttendanceRow {
    pub student_id: String,
    pub name: String,
    pub roll_no: String,
    pub year: String,
    pub batch: Option<String>,
    pub attended_sessions: i64,
    pub total_sessions: i64,
    pub percentage: String,
    pub is_defaulter: bool,
    pub extra_sessions_applied: i64,
    pub capped_at_total: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceReport {
    pub rows: Vec<StudentAttendanceRow>,
    pub skipped_entries: usize,
    pub skipped_sessions: usize,
    pub threshold_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectTypeStat {
    pub subject_name: String,
    pub lecture_attended: i64,
    pub lecture_total: i64,
    pub practical_attended: i64,
    pub practical_total: i64,
    pub percentage: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverallStat {
    pub attended_sessions: i64,
    pub total_sessions: i64,
    pub percentage: String,
    pub is_defaulter: bool,
    pub extra_sessions_applied: i64,
    pub capped_at_total: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentSubjectReport {
    pub student_id: String,
    pub name: String,
    pub roll_no: String,
    pub year: String,
    pub batch: Option<String>,
    pub subjects: Vec<SubjectTypeStat>,
    pub overall: OverallStat,
    pub skipped_sessions: usize,
}

pub fn percentage_value(attended: i64, total: i64) -> f64 {
    if total > 0 {
        100.0 * attended as f64 / total as f64
    } else {
        0.0
    }
}

pub fn format_percentage(attended: i64, total: i64) -> String {
    format!("{:.2}", percentage_value(attended, total))
}

fn subject_matches(filter: Option<&str>, subject_name: &str) -> bool {
    match filter {
        Some(f) => subject_name.eq_ignore_ascii_case(f),
        None => true,
    }
}

/// A session counts toward a student only when the years match and, for
/// practicals, the batches match. Lecture batches are ignored entirely:
/// legacy lecture records sometimes carry one, and a lecture applies to
/// the whole year regardless.
fn session_applies_to(session: &SessionRecord, student: &Student) -> bool {
    if session.year != student.year {
        return false;
    }
    match session.session_type {
        SessionType::Lecture => true,
        SessionType::Practical => {
            session.batch.is_some() && session.batch == student.batch
        }
    }
}

fn sum_credits_by_student(credits: &[ExtraCredit]) -> HashMap<&str, i64> {
    let mut by_student: HashMap<&str, i64> = HashMap::new();
    for c in credits {
        if c.extra_sessions > 0 {
            *by_student.entry(c.student_id.as_str()).or_insert(0) += c.extra_sessions;
        }
    }
    by_student
}

fn name_order(a: &Student, b: &Student) -> Ordering {
    let an = a.name.to_lowercase();
    let bn = b.name.to_lowercase();
    an.cmp(&bn).then_with(|| a.roll_no.cmp(&b.roll_no))
}

/// Joins a roster snapshot with a session snapshot into per-student
/// attendance statistics. Pure: same inputs, same report. Callers are
/// expected to have fetched both snapshots for one filter selection
/// before invoking this; a failed fetch means this never runs.
pub fn aggregate(
    students: &[Student],
    sessions: &[SessionRecord],
    credits: &[ExtraCredit],
    options: &AggregateOptions,
) -> AttendanceReport {
    let threshold = clamp_threshold(options.threshold_percent);
    let subject = options.subject.as_deref();

    let mut skipped_sessions = 0usize;
    let selected: Vec<&SessionRecord> = sessions
        .iter()
        .filter(|s| subject_matches(subject, &s.subject_name))
        .filter(|s| {
            if s.is_malformed() {
                skipped_sessions += 1;
                false
            } else {
                true
            }
        })
        .collect();

    let mut conducted: HashMap<ConductedKey, i64> = HashMap::new();
    for s in &selected {
        let key = ConductedKey {
            year: s.year.clone(),
            subject: s.subject_name.clone(),
            session_type: s.session_type,
            batch: match s.session_type {
                SessionType::Lecture => None,
                SessionType::Practical => s.batch.clone(),
            },
        };
        *conducted.entry(key).or_insert(0) += s.sessions_count;
    }

    let by_id: HashMap<&str, &Student> = students.iter().map(|s| (s.id.as_str(), s)).collect();

    let mut attended: HashMap<&str, i64> = HashMap::new();
    let mut skipped_entries = 0usize;
    for s in &selected {
        for entry in &s.entries {
            if !entry.is_present {
                continue;
            }
            let Some(student) = by_id.get(entry.student_id.as_str()) else {
                // Dangling student id; dropped but counted.
                skipped_entries += 1;
                continue;
            };
            if !session_applies_to(s, student) {
                skipped_entries += 1;
                continue;
            }
            *attended.entry(student.id.as_str()).or_insert(0) += s.sessions_count;
        }
    }

    let credit_sums = sum_credits_by_student(credits);

    let mut ordered: Vec<&Student> = students.iter().collect();
    ordered.sort_by(|a, b| name_order(a, b));

    let mut rows: Vec<StudentAttendanceRow> = Vec::with_capacity(ordered.len());
    for student in ordered {
        let mut total = 0i64;
        for (key, count) in &conducted {
            if key.year != student.year {
                continue;
            }
            match key.session_type {
                SessionType::Lecture => total += count,
                SessionType::Practical => {
                    if student.batch.is_some() && key.batch == student.batch {
                        total += count;
                    }
                }
            }
        }

        if total == 0 && options.zero_session_policy == ZeroSessionPolicy::Omit {
            continue;
        }

        let base = attended.get(student.id.as_str()).copied().unwrap_or(0);
        let credit = credit_sums.get(student.id.as_str()).copied().unwrap_or(0);
        let adjusted = (base + credit).min(total);
        let capped = credit > 0 && base + credit > total;

        let pct = percentage_value(adjusted, total);
        rows.push(StudentAttendanceRow {
            student_id: student.id.clone(),
            name: student.name.clone(),
            roll_no: student.roll_no.clone(),
            year: student.year.clone(),
            batch: student.batch.clone(),
            attended_sessions: adjusted,
            total_sessions: total,
            percentage: format!("{:.2}", pct),
            is_defaulter: pct < threshold,
            extra_sessions_applied: adjusted - base,
            capped_at_total: capped,
        });
    }

    AttendanceReport {
        rows,
        skipped_entries,
        skipped_sessions,
        threshold_percent: threshold,
    }
}

/// Per-subject lecture/practical split for a single student, with an
/// overall row that applies extra credits (capped at the overall total).
pub fn subject_breakdown(
    student: &Student,
    sessions: &[SessionRecord],
    credits: &[ExtraCredit],
    threshold_percent: f64,
) -> StudentSubjectReport {
    let threshold = clamp_threshold(threshold_percent);

    let mut skipped_sessions = 0usize;
    let mut per_subject: HashMap<String, (i64, i64, i64, i64)> = HashMap::new();
    for s in sessions {
        if s.is_malformed() {
            skipped_sessions += 1;
            continue;
        }
        if !session_applies_to(s, student) {
            continue;
        }
        let present = s
            .entries
            .iter()
            .any(|e| e.student_id == student.id && e.is_present);
        let slot = per_subject
            .entry(s.subject_name.clone())
            .or_insert((0, 0, 0, 0));
        match s.session_type {
            SessionType::Lecture => {
                slot.1 += s.sessions_count;
                if present {
                    slot.0 += s.sessions_count;
                }
            }
            SessionType::Practical => {
                slot.3 += s.sessions_count;
                if present {
                    slot.2 += s.sessions_count;
                }
            }
        }
    }

    let mut subjects: Vec<SubjectTypeStat> = per_subject
        .into_iter()
        .map(
            |(subject_name, (lec_att, lec_tot, prac_att, prac_tot))| SubjectTypeStat {
                subject_name,
                lecture_attended: lec_att,
                lecture_total: lec_tot,
                practical_attended: prac_att,
                practical_total: prac_tot,
                percentage: format_percentage(lec_att + prac_att, lec_tot + prac_tot),
            },
        )
        .collect();
    subjects.sort_by(|a, b| {
        a.subject_name
            .to_lowercase()
            .cmp(&b.subject_name.to_lowercase())
    });

    let base: i64 = subjects
        .iter()
        .map(|s| s.lecture_attended + s.practical_attended)
        .sum();
    let total: i64 = subjects
        .iter()
        .map(|s| s.lecture_total + s.practical_total)
        .sum();
    let credit = sum_credits_by_student(credits)
        .get(student.id.as_str())
        .copied()
        .unwrap_or(0);
    let adjusted = (base + credit).min(total);
    let pct = percentage_value(adjusted, total);

    StudentSubjectReport {
        student_id: student.id.clone(),
        name: student.name.clone(),
        roll_no: student.roll_no.clone(),
        year: student.year.clone(),
        batch: student.batch.clone(),
        subjects,
        overall: OverallStat {
            attended_sessions: adjusted,
            total_sessions: total,
            percentage: format!("{:.2}", pct),
            is_defaulter: pct < threshold,
            extra_sessions_applied: adjusted - base,
            capped_at_total: credit > 0 && base + credit > total,
        },
        skipped_sessions,
    }
}
