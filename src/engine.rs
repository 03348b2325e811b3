//! OTP-gated attendance state machine.
//!
//! A record for (student, date) moves `unset -> otp-pending -> present` through
//! [`Engine::verify`], or is set directly by a teacher through
//! [`Engine::manual_update`] once the override cooldown has elapsed. Every
//! transition on a record happens while holding that record's lock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::clock::Clock;
use crate::code::{generate_code, is_well_formed};
use crate::config::Policy;
use crate::locks::{RecordLocks, WeeklyLocks};
use crate::models::{
    week_slot, AttendanceRecord, DashboardRow, Mark, NewStudent, RecordKey, Student,
    WeeklyAttendance, WeeklyRow,
};
use crate::notify::{otp_body, Notifier, BROADCAST_SUBJECT, REQUEST_SUBJECT};
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum AttendanceError {
    #[error("student `{0}` not found")]
    NotFound(String),

    #[error("no OTP has been issued")]
    NoOtpIssued,

    #[error("OTP already used")]
    AlreadyUsed,

    #[error("OTP expired")]
    Expired,

    #[error("invalid OTP")]
    Mismatch,

    #[error("manual update is not allowed yet")]
    TooEarly { retry_after_seconds: Option<i64> },

    #[error("attendance already marked")]
    AlreadyMarked,

    #[error("{0}")]
    AlreadyExists(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("another broadcast is in progress")]
    BroadcastInProgress,

    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

pub type AttendanceResult<T> = Result<T, AttendanceError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotifyFailure {
    pub roll_number: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BroadcastSummary {
    pub issued: usize,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub notify_failures: Vec<NotifyFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedCode {
    pub roll_number: String,
    pub expires_at: DateTime<Utc>,
    pub delivered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Marked {
    pub roll_number: String,
    pub date: NaiveDate,
    pub marked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManualMark {
    pub roll_number: String,
    pub date: NaiveDate,
    pub present: bool,
}

pub struct Engine {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    policy: Policy,
    locks: RecordLocks,
    weekly_locks: WeeklyLocks,
    broadcasting: tokio::sync::Mutex<()>,
    // Process-wide; one value shared by every client countdown.
    last_broadcast: RwLock<Option<DateTime<Utc>>>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        policy: Policy,
    ) -> Self {
        Self {
            store,
            notifier,
            clock,
            policy,
            locks: RecordLocks::new(),
            weekly_locks: WeeklyLocks::new(),
            broadcasting: tokio::sync::Mutex::new(()),
            last_broadcast: RwLock::new(None),
        }
    }

    async fn student_by_roll(&self, roll_number: &str) -> AttendanceResult<Student> {
        self.store
            .student_by_roll(roll_number)
            .await?
            .ok_or_else(|| AttendanceError::NotFound(roll_number.to_string()))
    }

    async fn student_by_id(&self, id: Uuid) -> AttendanceResult<Student> {
        self.store
            .student(id)
            .await?
            .ok_or_else(|| AttendanceError::NotFound(id.to_string()))
    }

    async fn record_or_blank(
        &self,
        student: &Student,
        date: NaiveDate,
    ) -> AttendanceResult<AttendanceRecord> {
        let key = RecordKey {
            student_id: student.id,
            date,
        };
        Ok(self
            .store
            .record(key)
            .await?
            .unwrap_or_else(|| AttendanceRecord::blank(student, date)))
    }

    /// Stores a fresh code on the student's record for `date`, and moves
    /// the override window when `broadcast_at` is given.
    ///
    /// Returns `None` when the student no longer exists.
    async fn store_code(
        &self,
        student_id: Uuid,
        date: NaiveDate,
        expires_at: DateTime<Utc>,
        broadcast_at: Option<DateTime<Utc>>,
    ) -> AttendanceResult<Option<(Student, String)>> {
        let _guard = self.locks.lock(RecordKey { student_id, date }).await;
        // Deletion takes the same lock, so the student cannot vanish below us.
        let student = match self.store.student(student_id).await? {
            Some(student) => student,
            None => return Ok(None),
        };

        let code = generate_code();
        let mut record = self.record_or_blank(&student, date).await?;
        record.otp = Some(code.clone());
        record.otp_expiry = Some(expires_at);
        record.otp_used = false;
        self.store.put_record(&record).await?;
        if let Some(at) = broadcast_at {
            self.store.set_otp_generated_at(student_id, at).await?;
        }
        Ok(Some((student, code)))
    }

    /// Issues one code per known student and starts the shared countdown.
    ///
    /// Delivery failures are collected in the summary; only store failures
    /// abort the batch, and then the shared countdown is left untouched.
    /// Students deleted while the batch runs are skipped.
    pub async fn issue_all(&self) -> AttendanceResult<BroadcastSummary> {
        let _broadcast = self
            .broadcasting
            .try_lock()
            .map_err(|_| AttendanceError::BroadcastInProgress)?;

        let now = self.clock.now();
        let today = self.clock.today();
        let expires_at = now + self.policy.otp_validity;
        let roster = self.store.students(None).await?;

        let body_seconds = self.policy.otp_validity.num_seconds();
        let mut issued = 0;
        let mut notify_failures = Vec::new();
        for id in roster.iter().map(|s| s.id) {
            let (student, code) = match self.store_code(id, today, expires_at, Some(now)).await {
                Ok(Some(stored)) => stored,
                Ok(None) => {
                    log::debug!("Student {} was deleted during the broadcast", id);
                    continue;
                }
                Err(err) => {
                    log::error!(
                        "Broadcast stopped after {} of {} students: {}",
                        issued,
                        roster.len(),
                        err
                    );
                    return Err(err);
                }
            };
            issued += 1;

            if let Err(err) = self
                .notifier
                .send(&student.email, BROADCAST_SUBJECT, &otp_body(&code, body_seconds))
                .await
            {
                log::warn!("Could not deliver OTP to {}: {}", student.roll_number, err);
                notify_failures.push(NotifyFailure {
                    roll_number: student.roll_number.clone(),
                    reason: err.to_string(),
                });
            }
        }

        *self.last_broadcast.write().unwrap_or_else(|e| e.into_inner()) = Some(now);
        log::info!(
            "Broadcast OTP to {} students ({} undelivered)",
            issued,
            notify_failures.len()
        );
        Ok(BroadcastSummary {
            issued,
            issued_at: now,
            expires_at,
            notify_failures,
        })
    }

    /// Issues a code for one student's record of today.
    pub async fn issue_for_student(&self, roll_number: &str) -> AttendanceResult<IssuedCode> {
        let found = self.student_by_roll(roll_number).await?;
        let now = self.clock.now();
        let expires_at = now + self.policy.otp_validity;
        let (student, code) = self
            .store_code(found.id, self.clock.today(), expires_at, None)
            .await?
            .ok_or_else(|| AttendanceError::NotFound(roll_number.to_string()))?;

        let delivered = match self
            .notifier
            .send(
                &student.email,
                REQUEST_SUBJECT,
                &otp_body(&code, self.policy.otp_validity.num_seconds()),
            )
            .await
        {
            Ok(()) => true,
            Err(err) => {
                log::warn!("Could not deliver OTP to {}: {}", student.roll_number, err);
                false
            }
        };

        Ok(IssuedCode {
            roll_number: student.roll_number,
            expires_at,
            delivered,
        })
    }

    /// Consumes the student's most recent code and marks them present.
    ///
    /// Only the code with the latest expiry is eligible; older codes are
    /// superseded even when still unused.
    pub async fn verify(&self, roll_number: &str, code: &str) -> AttendanceResult<Marked> {
        let student = self.student_by_roll(roll_number).await?;
        let mut issued: Vec<AttendanceRecord> = self
            .store
            .records_for_student(student.id)
            .await?
            .into_iter()
            .filter(|r| r.otp.is_some())
            .collect();
        issued.sort_by(|a, b| b.otp_expiry.cmp(&a.otp_expiry));
        let latest = issued.first().ok_or(AttendanceError::NoOtpIssued)?;

        let key = latest.key();
        let _guard = self.locks.lock(key).await;
        // Re-read under the lock: a concurrent submission may have consumed it.
        let mut record = self
            .store
            .record(key)
            .await?
            .filter(|r| r.otp.is_some())
            .ok_or(AttendanceError::NoOtpIssued)?;

        let now = self.clock.now();
        if record.otp_used {
            log::debug!("{} resubmitted a used OTP", roll_number);
            return Err(AttendanceError::AlreadyUsed);
        }
        if record.otp_expiry.map_or(true, |expiry| now > expiry) {
            log::debug!("{} submitted an expired OTP", roll_number);
            return Err(AttendanceError::Expired);
        }
        let code = code.trim();
        if !is_well_formed(code) || record.otp.as_deref() != Some(code) {
            log::debug!("{} submitted a wrong OTP", roll_number);
            return Err(AttendanceError::Mismatch);
        }

        record.otp_used = true;
        if record.present == Some(true) {
            self.store.put_record(&record).await?;
            return Err(AttendanceError::AlreadyMarked);
        }
        record.present = Some(true);
        self.store.put_record(&record).await?;
        self.record_day(&student, record.date, true).await?;

        log::info!("{} marked present for {}", roll_number, record.date);
        Ok(Marked {
            roll_number: student.roll_number,
            date: record.date,
            marked_at: now,
        })
    }

    /// Writes `P` or `A` into the student's weekly slot for `date`.
    /// Sundays are not tracked and are ignored.
    pub async fn record_day(
        &self,
        student: &Student,
        date: NaiveDate,
        present: bool,
    ) -> AttendanceResult<()> {
        let slot = match week_slot(date) {
            Some(slot) => slot,
            None => return Ok(()),
        };
        let _guard = self.weekly_locks.lock(student.roll_number.clone()).await;
        let mut weekly = match self.store.weekly(&student.roll_number).await? {
            Some(weekly) => weekly,
            None => WeeklyAttendance::new(student.roll_number.clone(), student.name.clone()),
        };
        weekly.name = student.name.clone();
        if let Some(day) = weekly.days.get_mut(slot) {
            *day = Some(Mark::from_presence(present));
        }
        self.store.put_weekly(&weekly).await?;
        Ok(())
    }

    fn override_allowed(&self, student: &Student) -> bool {
        student
            .otp_generated_at
            .map_or(false, |at| self.clock.now() - at >= self.policy.override_cooldown)
    }

    /// Whole seconds until the cooldown ends, rounded up.
    fn override_wait(&self, student: &Student) -> Option<i64> {
        let generated_at = student.otp_generated_at?;
        let left = self.policy.override_cooldown - (self.clock.now() - generated_at);
        let millis = left.num_milliseconds().max(0);
        Some((millis + 999) / 1000)
    }

    pub async fn can_override(&self, student_id: Uuid) -> AttendanceResult<bool> {
        let student = self.student_by_id(student_id).await?;
        Ok(self.override_allowed(&student))
    }

    /// Teacher-driven presence change for today, bypassing codes.
    pub async fn manual_update(
        &self,
        student_id: Uuid,
        present: bool,
    ) -> AttendanceResult<ManualMark> {
        let student = self.student_by_id(student_id).await?;
        if !self.override_allowed(&student) {
            return Err(AttendanceError::TooEarly {
                retry_after_seconds: self.override_wait(&student),
            });
        }

        let today = self.clock.today();
        let _guard = self
            .locks
            .lock(RecordKey {
                student_id: student.id,
                date: today,
            })
            .await;
        let mut record = self.record_or_blank(&student, today).await?;
        record.present = Some(present);
        self.store.put_record(&record).await?;
        self.record_day(&student, today, present).await?;

        log::info!(
            "{} manually marked {} for {}",
            student.roll_number,
            Mark::from_presence(present).as_str(),
            today
        );
        Ok(ManualMark {
            roll_number: student.roll_number,
            date: today,
            present,
        })
    }

    /// Deletes today's records, and any stale ones left from earlier days.
    /// Returns the number of deleted records.
    pub async fn run_daily_reset(&self) -> AttendanceResult<u64> {
        let today = self.clock.today();
        let records = self.store.records_until(today).await?;
        let mut deleted = 0;
        for record in records {
            let key = record.key();
            let _guard = self.locks.lock(key).await;
            match self.store.delete_records(&[key]).await {
                Ok(n) => deleted += n,
                Err(err) => log::error!(
                    "Daily reset could not delete record of {} for {}: {}",
                    record.roll_number,
                    record.date,
                    err
                ),
            }
        }
        log::info!("Daily reset removed {} attendance records", deleted);
        Ok(deleted)
    }

    /// Clears every weekly slot, keeping the rows. Returns the rows cleared.
    pub async fn run_weekly_reset(&self) -> AttendanceResult<usize> {
        let rows = self.store.weekly_all().await?;
        let mut cleared = 0;
        for row in rows {
            let _guard = self.weekly_locks.lock(row.roll_number.clone()).await;
            match self.clear_week(&row.roll_number).await {
                Ok(true) => cleared += 1,
                Ok(false) => {}
                Err(err) => log::error!(
                    "Weekly reset could not clear row of {}: {}",
                    row.roll_number,
                    err
                ),
            }
        }
        log::info!("Weekly reset cleared {} rows", cleared);
        Ok(cleared)
    }

    // Caller holds the row's weekly lock.
    async fn clear_week(&self, roll_number: &str) -> AttendanceResult<bool> {
        let mut weekly = match self.store.weekly(roll_number).await? {
            Some(weekly) => weekly,
            None => return Ok(false),
        };
        weekly.clear();
        self.store.put_weekly(&weekly).await?;
        Ok(true)
    }

    /// Seconds left on the last broadcast, clamped at zero.
    pub fn remaining_seconds(&self) -> i64 {
        let last = *self.last_broadcast.read().unwrap_or_else(|e| e.into_inner());
        match last {
            Some(at) => (self.policy.otp_validity - (self.clock.now() - at))
                .num_seconds()
                .max(0),
            None => 0,
        }
    }

    pub fn otp_active(&self) -> bool {
        self.remaining_seconds() > 0
    }

    /// Seconds left on the student's own outstanding code.
    pub async fn remaining_seconds_for(&self, roll_number: &str) -> AttendanceResult<i64> {
        let student = self.student_by_roll(roll_number).await?;
        let now = self.clock.now();
        let latest_expiry = self
            .store
            .records_for_student(student.id)
            .await?
            .iter()
            .filter(|r| r.has_unused_otp())
            .filter_map(|r| r.otp_expiry)
            .max();
        Ok(latest_expiry.map_or(0, |expiry| (expiry - now).num_seconds().max(0)))
    }

    /// Today's presence: `None` until the student is marked either way.
    pub async fn is_present_today(&self, student_id: Uuid) -> AttendanceResult<Option<bool>> {
        let student = self.student_by_id(student_id).await?;
        let record = self
            .store
            .record(RecordKey {
                student_id: student.id,
                date: self.clock.today(),
            })
            .await?;
        Ok(record.and_then(|r| r.present))
    }

    /// Roster with today's state of each student.
    pub async fn dashboard(&self, classroom: Option<&str>) -> AttendanceResult<Vec<DashboardRow>> {
        let students = self.store.students(classroom).await?;
        let today: HashMap<Uuid, AttendanceRecord> = self
            .store
            .records_on(self.clock.today())
            .await?
            .into_iter()
            .map(|r| (r.student_id, r))
            .collect();
        Ok(students
            .into_iter()
            .map(|student| {
                let record = today.get(&student.id);
                DashboardRow {
                    present_today: record.and_then(|r| r.present),
                    otp_sent: record.map_or(false, |r| r.otp.is_some()),
                    student,
                }
            })
            .collect())
    }

    /// Weekly grid with today's presence, optionally for one classroom.
    pub async fn weekly_view(&self, classroom: Option<&str>) -> AttendanceResult<Vec<WeeklyRow>> {
        let mut rows = self.store.weekly_all().await?;
        if let Some(classroom) = classroom {
            let members: HashSet<String> = self
                .store
                .students(Some(classroom))
                .await?
                .into_iter()
                .map(|s| s.roll_number)
                .collect();
            rows.retain(|row| members.contains(&row.roll_number));
        }

        let present_today: HashSet<String> = self
            .store
            .records_on(self.clock.today())
            .await?
            .into_iter()
            .filter(|r| r.present == Some(true))
            .map(|r| r.roll_number)
            .collect();

        Ok(rows
            .iter()
            .map(|row| WeeklyRow::of(row, present_today.contains(&row.roll_number)))
            .collect())
    }

    pub async fn add_student(&self, new: NewStudent) -> AttendanceResult<Student> {
        let roll_number = new.roll_number.trim().to_string();
        let email = new.email.trim().to_string();
        if roll_number.is_empty() {
            return Err(AttendanceError::InvalidInput("roll number must not be empty".to_string()));
        }
        if !email.contains('@') {
            return Err(AttendanceError::InvalidInput(format!(
                "`{}` is not an email address",
                email
            )));
        }
        if self.store.student_by_roll(&roll_number).await?.is_some() {
            return Err(AttendanceError::AlreadyExists(format!(
                "student with roll number `{}` already exists",
                roll_number
            )));
        }
        if self.store.student_by_email(&email).await?.is_some() {
            return Err(AttendanceError::AlreadyExists(format!(
                "student with email `{}` already exists",
                email
            )));
        }

        let student = Student {
            id: Uuid::new_v4(),
            roll_number,
            name: new.name.trim().to_string(),
            email,
            classroom_code: new.classroom_code,
            otp_generated_at: None,
            created_at: self.clock.now(),
        };
        self.store.put_student(&student).await?;
        Ok(student)
    }

    pub async fn edit_student(
        &self,
        id: Uuid,
        name: Option<String>,
        email: Option<String>,
    ) -> AttendanceResult<Student> {
        // Same lock as issuance, so a concurrent broadcast timestamp is kept.
        let _guard = self
            .locks
            .lock(RecordKey {
                student_id: id,
                date: self.clock.today(),
            })
            .await;
        let mut student = self.student_by_id(id).await?;
        if let Some(email) = email.map(|e| e.trim().to_string()) {
            if !email.contains('@') {
                return Err(AttendanceError::InvalidInput(format!(
                    "`{}` is not an email address",
                    email
                )));
            }
            if let Some(other) = self.store.student_by_email(&email).await? {
                if other.id != id {
                    return Err(AttendanceError::AlreadyExists(format!(
                        "student with email `{}` already exists",
                        email
                    )));
                }
            }
            student.email = email;
        }
        if let Some(name) = name {
            student.name = name.trim().to_string();
        }
        self.store.put_student(&student).await?;
        Ok(student)
    }

    /// Removes the student, all of their attendance records and their weekly row.
    pub async fn delete_student(&self, id: Uuid) -> AttendanceResult<()> {
        let student = self.student_by_id(id).await?;
        let _guard = self
            .locks
            .lock(RecordKey {
                student_id: id,
                date: self.clock.today(),
            })
            .await;
        self.store.delete_student(id).await?;
        let _weekly = self.weekly_locks.lock(student.roll_number.clone()).await;
        self.store.delete_weekly(&student.roll_number).await?;
        log::info!("Deleted student {}", student.roll_number);
        Ok(())
    }
}
