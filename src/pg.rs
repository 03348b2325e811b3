use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use uuid::Uuid;

use crate::models::{AttendanceRecord, RecordKey, Student, WeeklyAttendance};
use crate::store::{Store, StoreResult};

const SCHEMA_SQL: &str = include_str!("../migrations/schema.sql");

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Applies the idempotent schema.
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        self.pool.execute(SCHEMA_SQL).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn student(&self, id: Uuid) -> StoreResult<Option<Student>> {
        let student = sqlx::query_as::<_, Student>("SELECT * FROM students WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(student)
    }

    async fn student_by_roll(&self, roll_number: &str) -> StoreResult<Option<Student>> {
        let student =
            sqlx::query_as::<_, Student>("SELECT * FROM students WHERE roll_number = $1 LIMIT 1")
                .bind(roll_number)
                .fetch_optional(&self.pool)
                .await?;
        Ok(student)
    }

    async fn student_by_email(&self, email: &str) -> StoreResult<Option<Student>> {
        let student = sqlx::query_as::<_, Student>(
            "SELECT * FROM students WHERE email = $1 LIMIT 1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(student)
    }

    async fn students(&self, classroom: Option<&str>) -> StoreResult<Vec<Student>> {
        let students = sqlx::query_as::<_, Student>(
            "SELECT * FROM students
             WHERE $1::TEXT IS NULL OR classroom_code = $1
             ORDER BY roll_number",
        )
        .bind(classroom)
        .fetch_all(&self.pool)
        .await?;
        Ok(students)
    }

    async fn put_student(&self, student: &Student) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO students
                (id, roll_number, name, email, classroom_code, otp_generated_at, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (id) DO UPDATE SET
                roll_number = EXCLUDED.roll_number,
                name = EXCLUDED.name,
                email = EXCLUDED.email,
                classroom_code = EXCLUDED.classroom_code,
                otp_generated_at = EXCLUDED.otp_generated_at",
        )
        .bind(student.id)
        .bind(&student.roll_number)
        .bind(&student.name)
        .bind(&student.email)
        .bind(&student.classroom_code)
        .bind(student.otp_generated_at)
        .bind(student.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_otp_generated_at(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<bool> {
        let res = sqlx::query("UPDATE students SET otp_generated_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() >= 1)
    }

    async fn delete_student(&self, id: Uuid) -> StoreResult<bool> {
        // attendance_records cascade on the foreign key
        let res = sqlx::query("DELETE FROM students WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() >= 1)
    }

    async fn record(&self, key: RecordKey) -> StoreResult<Option<AttendanceRecord>> {
        let record = sqlx::query_as::<_, AttendanceRecord>(
            "SELECT * FROM attendance_records WHERE student_id = $1 AND date = $2",
        )
        .bind(key.student_id)
        .bind(key.date)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn records_for_student(&self, student_id: Uuid) -> StoreResult<Vec<AttendanceRecord>> {
        let records = sqlx::query_as::<_, AttendanceRecord>(
            "SELECT * FROM attendance_records WHERE student_id = $1 ORDER BY date DESC",
        )
        .bind(student_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn records_on(&self, date: NaiveDate) -> StoreResult<Vec<AttendanceRecord>> {
        let records = sqlx::query_as::<_, AttendanceRecord>(
            "SELECT * FROM attendance_records WHERE date = $1",
        )
        .bind(date)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn records_until(&self, date: NaiveDate) -> StoreResult<Vec<AttendanceRecord>> {
        let records = sqlx::query_as::<_, AttendanceRecord>(
            "SELECT * FROM attendance_records WHERE date <= $1",
        )
        .bind(date)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn put_record(&self, record: &AttendanceRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO attendance_records
                (student_id, roll_number, date, present, otp, otp_expiry, otp_used)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (student_id, date) DO UPDATE SET
                roll_number = EXCLUDED.roll_number,
                present = EXCLUDED.present,
                otp = EXCLUDED.otp,
                otp_expiry = EXCLUDED.otp_expiry,
                otp_used = EXCLUDED.otp_used",
        )
        .bind(record.student_id)
        .bind(&record.roll_number)
        .bind(record.date)
        .bind(record.present)
        .bind(&record.otp)
        .bind(record.otp_expiry)
        .bind(record.otp_used)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_records(&self, keys: &[RecordKey]) -> StoreResult<u64> {
        let mut deleted = 0;
        for key in keys {
            let res = sqlx::query(
                "DELETE FROM attendance_records WHERE student_id = $1 AND date = $2",
            )
            .bind(key.student_id)
            .bind(key.date)
            .execute(&self.pool)
            .await?;
            deleted += res.rows_affected();
        }
        Ok(deleted)
    }

    async fn weekly(&self, roll_number: &str) -> StoreResult<Option<WeeklyAttendance>> {
        let weekly = sqlx::query_as::<_, WeeklyAttendance>(
            "SELECT * FROM weekly_attendance WHERE roll_number = $1",
        )
        .bind(roll_number)
        .fetch_optional(&self.pool)
        .await?;
        Ok(weekly)
    }

    async fn weekly_all(&self) -> StoreResult<Vec<WeeklyAttendance>> {
        let rows = sqlx::query_as::<_, WeeklyAttendance>(
            "SELECT * FROM weekly_attendance ORDER BY roll_number",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn put_weekly(&self, weekly: &WeeklyAttendance) -> StoreResult<()> {
        let [mon, tue, wed, thu, fri, sat] = weekly.days.map(|d| d.map(|m| m.as_str()));
        sqlx::query(
            "INSERT INTO weekly_attendance (roll_number, name, mon, tue, wed, thu, fri, sat)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (roll_number) DO UPDATE SET
                name = EXCLUDED.name,
                mon = EXCLUDED.mon, tue = EXCLUDED.tue, wed = EXCLUDED.wed,
                thu = EXCLUDED.thu, fri = EXCLUDED.fri, sat = EXCLUDED.sat",
        )
        .bind(&weekly.roll_number)
        .bind(&weekly.name)
        .bind(mon)
        .bind(tue)
        .bind(wed)
        .bind(thu)
        .bind(fri)
        .bind(sat)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_weekly(&self, roll_number: &str) -> StoreResult<bool> {
        let res = sqlx::query("DELETE FROM weekly_attendance WHERE roll_number = $1")
            .bind(roll_number)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() >= 1)
    }
}
