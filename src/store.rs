//! Persistence seam for students, daily records and the weekly grid.
//!
//! Stores give last-write-wins semantics and no transactions; the engine
//! serialises writers itself through [`crate::locks::RecordLocks`].

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{AttendanceRecord, RecordKey, Student, WeeklyAttendance};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    async fn student(&self, id: Uuid) -> StoreResult<Option<Student>>;

    async fn student_by_roll(&self, roll_number: &str) -> StoreResult<Option<Student>>;

    async fn student_by_email(&self, email: &str) -> StoreResult<Option<Student>>;

    /// All students, or only those of one classroom.
    async fn students(&self, classroom: Option<&str>) -> StoreResult<Vec<Student>>;

    async fn put_student(&self, student: &Student) -> StoreResult<()>;

    /// Moves the broadcast timestamp of an existing student. Returns false,
    /// and writes nothing, when the student is gone.
    async fn set_otp_generated_at(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<bool>;

    /// Removes the student together with all of their attendance records.
    async fn delete_student(&self, id: Uuid) -> StoreResult<bool>;

    async fn record(&self, key: RecordKey) -> StoreResult<Option<AttendanceRecord>>;

    async fn records_for_student(&self, student_id: Uuid) -> StoreResult<Vec<AttendanceRecord>>;

    async fn records_on(&self, date: NaiveDate) -> StoreResult<Vec<AttendanceRecord>>;

    /// Records dated `date` or earlier.
    async fn records_until(&self, date: NaiveDate) -> StoreResult<Vec<AttendanceRecord>>;

    async fn put_record(&self, record: &AttendanceRecord) -> StoreResult<()>;

    async fn delete_records(&self, keys: &[RecordKey]) -> StoreResult<u64>;

    async fn weekly(&self, roll_number: &str) -> StoreResult<Option<WeeklyAttendance>>;

    async fn weekly_all(&self) -> StoreResult<Vec<WeeklyAttendance>>;

    async fn put_weekly(&self, weekly: &WeeklyAttendance) -> StoreResult<()>;

    async fn delete_weekly(&self, roll_number: &str) -> StoreResult<bool>;
}
