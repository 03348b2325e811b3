use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, Query};
use axum::handler::Handler;
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::{AttendanceResult, BroadcastSummary, Engine, IssuedCode, ManualMark, Marked};
use crate::err::{self, Error};
use crate::models::{DashboardRow, Mark, NewStudent, Student, WeeklyRow};
use crate::{breaks, proceeds, Payload};

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/otp/broadcast", post(broadcast_otp))
        .route("/otp/request", post(request_otp))
        .route("/otp/submit", post(submit_otp))
        .route("/otp/status", get(otp_status))
        .route("/otp/status/:roll", get(student_otp_status))
        .route("/attendance/weekly", get(weekly))
        .route("/attendance/reset-today", post(reset_today))
        .route("/attendance/reset-week", post(reset_week))
        .route(
            "/attendance/student/:student_id",
            get(attendance_today).put(update_attendance),
        )
        .route("/attendance/student/:student_id/override", get(override_status))
        .route("/students", post(add_student).get(list_students))
        .route("/students/:student_id", put(edit_student).delete(delete_student))
        .fallback(err::handler404.into_service())
        .layer(Extension(engine))
}

fn respond<V: Serialize>(result: AttendanceResult<V>) -> Payload<V> {
    match result {
        Ok(value) => proceeds(value),
        Err(err) => Err(Error::from(err)),
    }
}

fn student_id(raw: &str) -> Result<Uuid, Error> {
    Ok(Uuid::from_str(raw)?)
}

async fn broadcast_otp(Extension(engine): Extension<Arc<Engine>>) -> Payload<BroadcastSummary> {
    respond(engine.issue_all().await)
}

async fn request_otp(
    Extension(engine): Extension<Arc<Engine>>,
    Json(body): Json<RequestOtp>,
) -> Payload<IssuedCode> {
    if body.roll_number.trim().is_empty() {
        return breaks(Error::invalid("Roll number required"));
    }
    respond(engine.issue_for_student(body.roll_number.trim()).await)
}

async fn submit_otp(
    Extension(engine): Extension<Arc<Engine>>,
    Json(body): Json<SubmitOtp>,
) -> Payload<Marked> {
    if body.roll_number.trim().is_empty() || body.otp.trim().is_empty() {
        return breaks(Error::invalid("`roll_number` and `otp` are required"));
    }
    respond(engine.verify(body.roll_number.trim(), &body.otp).await)
}

async fn otp_status(Extension(engine): Extension<Arc<Engine>>) -> Payload<OtpStatus> {
    proceeds(OtpStatus {
        active: engine.otp_active(),
        remaining_seconds: engine.remaining_seconds(),
    })
}

async fn student_otp_status(
    Extension(engine): Extension<Arc<Engine>>,
    Path(roll): Path<String>,
) -> Payload<OtpStatus> {
    let remaining_seconds = engine.remaining_seconds_for(&roll).await?;
    proceeds(OtpStatus {
        active: remaining_seconds > 0,
        remaining_seconds,
    })
}

async fn update_attendance(
    Extension(engine): Extension<Arc<Engine>>,
    Path(raw_id): Path<String>,
    Json(body): Json<UpdateAttendance>,
) -> Payload<ManualMark> {
    let id = student_id(&raw_id)?;
    let mark = match Mark::parse(body.attendance.trim()) {
        Some(mark) => mark,
        None => return breaks(Error::invalid("`attendance` must be \"P\" or \"A\"")),
    };
    respond(engine.manual_update(id, mark == Mark::Present).await)
}

async fn attendance_today(
    Extension(engine): Extension<Arc<Engine>>,
    Path(raw_id): Path<String>,
) -> Payload<TodayStatus> {
    let id = student_id(&raw_id)?;
    let present_today = engine.is_present_today(id).await?;
    proceeds(TodayStatus {
        student_id: id,
        present_today,
    })
}

async fn override_status(
    Extension(engine): Extension<Arc<Engine>>,
    Path(raw_id): Path<String>,
) -> Payload<OverrideStatus> {
    let id = student_id(&raw_id)?;
    let can_override = engine.can_override(id).await?;
    proceeds(OverrideStatus {
        student_id: id,
        can_override,
    })
}

async fn weekly(
    Extension(engine): Extension<Arc<Engine>>,
    Query(query): Query<ClassroomQuery>,
) -> Payload<WeeklyTable> {
    let rows = engine.weekly_view(query.classroom.as_deref()).await?;
    proceeds(WeeklyTable { rows })
}

async fn reset_today(Extension(engine): Extension<Arc<Engine>>) -> Payload<ResetDone> {
    let deleted = engine.run_daily_reset().await?;
    proceeds(ResetDone {
        affected: deleted as usize,
    })
}

async fn reset_week(Extension(engine): Extension<Arc<Engine>>) -> Payload<ResetDone> {
    let affected = engine.run_weekly_reset().await?;
    proceeds(ResetDone { affected })
}

async fn add_student(
    Extension(engine): Extension<Arc<Engine>>,
    Json(body): Json<NewStudent>,
) -> Payload<Student> {
    respond(engine.add_student(body).await)
}

async fn list_students(
    Extension(engine): Extension<Arc<Engine>>,
    Query(query): Query<ClassroomQuery>,
) -> Payload<StudentList> {
    let students = engine.dashboard(query.classroom.as_deref()).await?;
    proceeds(StudentList { students })
}

async fn edit_student(
    Extension(engine): Extension<Arc<Engine>>,
    Path(raw_id): Path<String>,
    Json(body): Json<EditStudent>,
) -> Payload<Student> {
    let id = student_id(&raw_id)?;
    respond(engine.edit_student(id, body.name, body.email).await)
}

async fn delete_student(
    Extension(engine): Extension<Arc<Engine>>,
    Path(raw_id): Path<String>,
) -> Payload<StudentDeleted> {
    let id = student_id(&raw_id)?;
    engine.delete_student(id).await?;
    proceeds(StudentDeleted { student_id: id })
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestOtp {
    pub roll_number: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitOtp {
    pub roll_number: String,
    pub otp: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateAttendance {
    pub attendance: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EditStudent {
    pub name: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClassroomQuery {
    pub classroom: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OtpStatus {
    pub active: bool,
    pub remaining_seconds: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OverrideStatus {
    pub student_id: Uuid,
    pub can_override: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WeeklyTable {
    pub rows: Vec<WeeklyRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentList {
    pub students: Vec<DashboardRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TodayStatus {
    pub student_id: Uuid,
    pub present_today: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResetDone {
    pub affected: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentDeleted {
    pub student_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Policy;
    use crate::memory::MemoryStore;
    use crate::notify::testing::RecordingNotifier;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    struct App {
        router: Router,
        notifier: Arc<RecordingNotifier>,
        clock: Arc<ManualClock>,
    }

    fn app() -> App {
        let notifier = Arc::new(RecordingNotifier::default());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 5, 9, 0, 0).unwrap()));
        let engine = Arc::new(Engine::new(
            Arc::new(MemoryStore::new()),
            notifier.clone(),
            clock.clone(),
            Policy::default(),
        ));
        App {
            router: router(engine),
            notifier,
            clock,
        }
    }

    impl App {
        async fn call(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
            let mut request = Request::builder().method(method).uri(uri);
            let body = match body {
                Some(json) => {
                    request = request.header("content-type", "application/json");
                    Body::from(json.to_string())
                }
                None => Body::empty(),
            };
            let response = self
                .router
                .clone()
                .oneshot(request.body(body).unwrap())
                .await
                .unwrap();
            let status = response.status();
            let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
            (status, serde_json::from_slice(&bytes).unwrap())
        }

        async fn add(&self, roll: &str) -> Value {
            let (status, body) = self
                .call(
                    "POST",
                    "/students",
                    Some(json!({
                        "roll_number": roll,
                        "name": format!("Student {}", roll),
                        "email": format!("{}@school.test", roll.to_lowercase()),
                        "classroom_code": "CLS1"
                    })),
                )
                .await;
            assert_eq!(status, StatusCode::OK, "{}", body);
            body
        }
    }

    #[tokio::test]
    async fn broadcast_then_submit() {
        let app = app();
        app.add("S001").await;

        let (status, body) = app.call("POST", "/otp/broadcast", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["issued"], 1);

        let (_, status_body) = app.call("GET", "/otp/status", None).await;
        assert_eq!(status_body["active"], true);
        assert_eq!(status_body["remaining_seconds"], 120);

        let code = app.notifier.last_code_for("s001@school.test").unwrap();
        let submit = json!({"roll_number": "S001", "otp": code});
        let (status, body) = app.call("POST", "/otp/submit", Some(submit.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["roll_number"], "S001");

        let (status, body) = app.call("POST", "/otp/submit", Some(submit)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["error"], "AlreadyUsed");

        let (_, weekly) = app.call("GET", "/attendance/weekly?classroom=CLS1", None).await;
        assert_eq!(weekly["rows"][0]["present_today"], true);
        assert_eq!(weekly["rows"][0]["wed"], "P");
    }

    #[tokio::test]
    async fn submit_for_unknown_student() {
        let app = app();
        let (status, body) = app
            .call("POST", "/otp/submit", Some(json!({"roll_number": "S404", "otp": "123456"})))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "NotFound");

        let (status, body) = app
            .call("POST", "/otp/request", Some(json!({"roll_number": " "})))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "InvalidPayload");
    }

    #[tokio::test]
    async fn manual_update_respects_cooldown() {
        let app = app();
        let student = app.add("S002").await;
        let id = student["id"].as_str().unwrap().to_string();
        app.call("POST", "/otp/broadcast", None).await;

        let uri = format!("/attendance/student/{}", id);
        let (status, body) = app.call("PUT", &uri, Some(json!({"attendance": "A"}))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "TooEarly");
        assert_eq!(body["retry_after_seconds"], 300);

        app.clock.advance(Duration::seconds(301));
        let (_, gate) = app.call("GET", &format!("{}/override", uri), None).await;
        assert_eq!(gate["can_override"], true);

        let (status, body) = app.call("PUT", &uri, Some(json!({"attendance": "A"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["present"], false);

        let (status, body) = app.call("PUT", &uri, Some(json!({"attendance": "late"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "InvalidPayload");
    }

    #[tokio::test]
    async fn roster_and_resets() {
        let app = app();
        let student = app.add("S003").await;
        let id = student["id"].as_str().unwrap().to_string();

        let (status, body) = app.call("POST", "/students", Some(json!({
            "roll_number": "S003", "name": "Dup", "email": "dup@school.test"
        }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "AlreadyExists");

        app.call("POST", "/otp/broadcast", None).await;
        let (_, body) = app.call("POST", "/attendance/reset-today", None).await;
        assert_eq!(body["affected"], 1);
        let (_, body) = app.call("POST", "/attendance/reset-week", None).await;
        assert_eq!(body["affected"], 0);

        let (status, _) = app.call("DELETE", &format!("/students/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = app.call("GET", "/students", None).await;
        assert_eq!(body["students"], json!([]));

        let (status, body) = app.call("DELETE", "/students/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "InvalidPayload");
    }

    #[tokio::test]
    async fn roster_lists_todays_state() {
        let app = app();
        let student = app.add("S004").await;
        let id = student["id"].as_str().unwrap().to_string();
        app.add("S005").await;

        let (_, body) = app.call("GET", "/students?classroom=CLS1", None).await;
        assert_eq!(body["students"][0]["roll_number"], "S004");
        assert_eq!(body["students"][0]["present_today"], Value::Null);
        assert_eq!(body["students"][0]["otp_sent"], false);

        app.call("POST", "/otp/broadcast", None).await;
        let code = app.notifier.last_code_for("s004@school.test").unwrap();
        app.call("POST", "/otp/submit", Some(json!({"roll_number": "S004", "otp": code})))
            .await;

        let (status, body) = app.call("GET", "/students", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["students"][0]["present_today"], true);
        assert_eq!(body["students"][0]["otp_sent"], true);
        assert_eq!(body["students"][1]["roll_number"], "S005");
        assert_eq!(body["students"][1]["present_today"], Value::Null);
        assert_eq!(body["students"][1]["otp_sent"], true);

        let uri = format!("/attendance/student/{}", id);
        let (status, body) = app.call("GET", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["present_today"], true);
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let app = app();
        let (status, body) = app.call("GET", "/nowhere", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "NotFound");
    }
}
