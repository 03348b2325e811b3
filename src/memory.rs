use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{AttendanceRecord, RecordKey, Student, WeeklyAttendance};
use crate::store::{Store, StoreError, StoreResult};

#[derive(Debug, Default)]
struct Tables {
    students: HashMap<Uuid, Student>,
    records: BTreeMap<RecordKey, AttendanceRecord>,
    weekly: HashMap<String, WeeklyAttendance>,
}

/// Process-local store, used when no database is configured and in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    /// Makes every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn student(&self, id: Uuid) -> StoreResult<Option<Student>> {
        self.check()?;
        Ok(self.tables.read().await.students.get(&id).cloned())
    }

    async fn student_by_roll(&self, roll_number: &str) -> StoreResult<Option<Student>> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables
            .students
            .values()
            .find(|s| s.roll_number == roll_number)
            .cloned())
    }

    async fn student_by_email(&self, email: &str) -> StoreResult<Option<Student>> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables.students.values().find(|s| s.email == email).cloned())
    }

    async fn students(&self, classroom: Option<&str>) -> StoreResult<Vec<Student>> {
        self.check()?;
        let tables = self.tables.read().await;
        let mut students: Vec<Student> = tables
            .students
            .values()
            .filter(|s| classroom.map_or(true, |c| s.classroom_code.as_deref() == Some(c)))
            .cloned()
            .collect();
        students.sort_by(|a, b| a.roll_number.cmp(&b.roll_number));
        Ok(students)
    }

    async fn put_student(&self, student: &Student) -> StoreResult<()> {
        self.check()?;
        self.tables
            .write()
            .await
            .students
            .insert(student.id, student.clone());
        Ok(())
    }

    async fn set_otp_generated_at(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<bool> {
        self.check()?;
        let mut tables = self.tables.write().await;
        Ok(match tables.students.get_mut(&id) {
            Some(student) => {
                student.otp_generated_at = Some(at);
                true
            }
            None => false,
        })
    }

    async fn delete_student(&self, id: Uuid) -> StoreResult<bool> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let existed = tables.students.remove(&id).is_some();
        tables.records.retain(|key, _| key.student_id != id);
        Ok(existed)
    }

    async fn record(&self, key: RecordKey) -> StoreResult<Option<AttendanceRecord>> {
        self.check()?;
        Ok(self.tables.read().await.records.get(&key).cloned())
    }

    async fn records_for_student(&self, student_id: Uuid) -> StoreResult<Vec<AttendanceRecord>> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables
            .records
            .values()
            .filter(|r| r.student_id == student_id)
            .cloned()
            .collect())
    }

    async fn records_on(&self, date: NaiveDate) -> StoreResult<Vec<AttendanceRecord>> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables
            .records
            .values()
            .filter(|r| r.date == date)
            .cloned()
            .collect())
    }

    async fn records_until(&self, date: NaiveDate) -> StoreResult<Vec<AttendanceRecord>> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables
            .records
            .values()
            .filter(|r| r.date <= date)
            .cloned()
            .collect())
    }

    async fn put_record(&self, record: &AttendanceRecord) -> StoreResult<()> {
        self.check()?;
        self.tables
            .write()
            .await
            .records
            .insert(record.key(), record.clone());
        Ok(())
    }

    async fn delete_records(&self, keys: &[RecordKey]) -> StoreResult<u64> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let deleted = keys
            .iter()
            .filter(|key| tables.records.remove(*key).is_some())
            .count();
        Ok(deleted as u64)
    }

    async fn weekly(&self, roll_number: &str) -> StoreResult<Option<WeeklyAttendance>> {
        self.check()?;
        Ok(self.tables.read().await.weekly.get(roll_number).cloned())
    }

    async fn weekly_all(&self) -> StoreResult<Vec<WeeklyAttendance>> {
        self.check()?;
        let tables = self.tables.read().await;
        let mut rows: Vec<WeeklyAttendance> = tables.weekly.values().cloned().collect();
        rows.sort_by(|a, b| a.roll_number.cmp(&b.roll_number));
        Ok(rows)
    }

    async fn put_weekly(&self, weekly: &WeeklyAttendance) -> StoreResult<()> {
        self.check()?;
        self.tables
            .write()
            .await
            .weekly
            .insert(weekly.roll_number.clone(), weekly.clone());
        Ok(())
    }

    async fn delete_weekly(&self, roll_number: &str) -> StoreResult<bool> {
        self.check()?;
        Ok(self.tables.write().await.weekly.remove(roll_number).is_some())
    }
}
