use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};
use uuid::Uuid;

/// Number of tracked school days, Monday through Saturday.
pub const WEEK_SLOTS: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Student {
    pub id: Uuid,
    pub roll_number: String,
    pub name: String,
    pub email: String,
    pub classroom_code: Option<String>,
    /// Anchor for the manual-override cooldown; set by every broadcast.
    pub otp_generated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One row per (student, date).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AttendanceRecord {
    pub student_id: Uuid,
    pub roll_number: String,
    pub date: NaiveDate,
    /// `None` means not marked, which is not the same as absent.
    pub present: Option<bool>,
    pub otp: Option<String>,
    pub otp_expiry: Option<DateTime<Utc>>,
    pub otp_used: bool,
}

impl AttendanceRecord {
    pub fn blank(student: &Student, date: NaiveDate) -> Self {
        Self {
            student_id: student.id,
            roll_number: student.roll_number.clone(),
            date,
            present: None,
            otp: None,
            otp_expiry: None,
            otp_used: false,
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            student_id: self.student_id,
            date: self.date,
        }
    }

    pub fn has_unused_otp(&self) -> bool {
        self.otp.is_some() && !self.otp_used
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub student_id: Uuid,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mark {
    #[serde(rename = "P")]
    Present,
    #[serde(rename = "A")]
    Absent,
}

impl Mark {
    pub fn from_presence(present: bool) -> Self {
        if present {
            Mark::Present
        } else {
            Mark::Absent
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mark::Present => "P",
            Mark::Absent => "A",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "P" => Some(Mark::Present),
            "A" => Some(Mark::Absent),
            _ => None,
        }
    }
}

/// Slot index of `date` in the weekly grid, or `None` for Sunday.
pub fn week_slot(date: NaiveDate) -> Option<usize> {
    match date.weekday() {
        Weekday::Sun => None,
        day => Some(day.num_days_from_monday() as usize),
    }
}

/// Per-student six-slot summary, keyed by roll number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyAttendance {
    pub roll_number: String,
    pub name: String,
    pub days: [Option<Mark>; WEEK_SLOTS],
}

impl WeeklyAttendance {
    pub fn new(roll_number: String, name: String) -> Self {
        Self {
            roll_number,
            name,
            days: [None; WEEK_SLOTS],
        }
    }

    pub fn clear(&mut self) {
        self.days = [None; WEEK_SLOTS];
    }

    pub fn is_clear(&self) -> bool {
        self.days.iter().all(Option::is_none)
    }
}

const DAY_COLUMNS: [&str; WEEK_SLOTS] = ["mon", "tue", "wed", "thu", "fri", "sat"];

impl<'r> FromRow<'r, PgRow> for WeeklyAttendance {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        let mut days = [None; WEEK_SLOTS];
        for (slot, column) in days.iter_mut().zip(DAY_COLUMNS) {
            let raw: Option<String> = row.try_get(column)?;
            *slot = raw.as_deref().and_then(Mark::parse);
        }
        Ok(Self {
            roll_number: row.try_get("roll_number")?,
            name: row.try_get("name")?,
            days,
        })
    }
}

/// Row of the teacher's weekly table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WeeklyRow {
    pub roll_number: String,
    pub name: String,
    pub present_today: bool,
    pub mon: Option<Mark>,
    pub tue: Option<Mark>,
    pub wed: Option<Mark>,
    pub thu: Option<Mark>,
    pub fri: Option<Mark>,
    pub sat: Option<Mark>,
}

impl WeeklyRow {
    pub fn of(weekly: &WeeklyAttendance, present_today: bool) -> Self {
        let [mon, tue, wed, thu, fri, sat] = weekly.days;
        Self {
            roll_number: weekly.roll_number.clone(),
            name: weekly.name.clone(),
            present_today,
            mon,
            tue,
            wed,
            thu,
            fri,
            sat,
        }
    }
}

/// Roster entry with today's state. `present_today` stays `None` until the
/// student is marked either way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DashboardRow {
    #[serde(flatten)]
    pub student: Student,
    pub present_today: Option<bool>,
    pub otp_sent: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewStudent {
    pub roll_number: String,
    pub name: String,
    pub email: String,
    pub classroom_code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn week_slots_cover_monday_to_saturday() {
        // 2024-06-03 is a Monday
        let monday = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();
        for offset in 0..6 {
            let day = monday + chrono::Duration::days(offset);
            assert_eq!(week_slot(day), Some(offset as usize));
        }
        assert_eq!(week_slot(monday + chrono::Duration::days(6)), None);
    }

    #[test]
    fn marks_serialize_as_letters() {
        let json = serde_json::to_string(&[Some(Mark::Present), Some(Mark::Absent), None]).unwrap();
        assert_eq!(json, r#"["P","A",null]"#);
        assert_eq!(Mark::parse("P"), Some(Mark::Present));
        assert_eq!(Mark::parse("x"), None);
    }
}
