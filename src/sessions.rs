use actix_web::{get, post, put, web, HttpRequest, HttpResponse, Responder};
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use log::error;
use serde::Deserialize;
use serde_json::json;
use sqlx::FromRow;

use crate::accounting;
use crate::attendance;
use crate::conflicts::{
    find_class_duplicate, find_teacher_overlap, is_foreign_key_violation, is_unique_violation,
};
use crate::models::session::{ClassSession, SessionStatus};
use crate::policy::{authorize, Operation};
use crate::sync::sync_month;
use crate::timeparse::{local_now, local_today, parse_date, parse_time};
use crate::AppState;

const SESSION_COLUMNS: &str =
    "id, class_id, session_date, start_time, end_time, teacher_id, status, \
     is_auto_generated, note, accounting_applied, accounting_applied_at";

#[derive(Deserialize)]
struct CreateSessionRequest {
    class_id: i32,
    session_date: String,
    start_time: String,
    end_time: String,
    teacher_id: Option<i32>,
    note: Option<String>,
}

#[derive(Deserialize)]
struct UpdateSessionRequest {
    session_date: String,
    start_time: String,
    end_time: String,
    teacher_id: Option<i32>,
    /// Omitted keeps the stored note; an empty string clears it.
    note: Option<String>,
    /// Omitted keeps the stored status.
    status: Option<SessionStatus>,
}

#[derive(Deserialize)]
struct PreflightTeacherRequest {
    session_id: Option<i32>,
    session_date: String,
    start_time: String,
    end_time: String,
    teacher_id: i32,
}

#[derive(Deserialize)]
struct ListSessionsQuery {
    class_id: i32,
    year: Option<i32>,
    month: Option<u32>,
}

#[derive(Deserialize)]
struct SyncMonthQuery {
    year: Option<i32>,
    month: Option<u32>,
}

/// Validated, normalized session fields ready to be written. Built from the
/// raw request up front so handlers work with concrete values rather than
/// re-parsing strings at each step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPatch {
    pub session_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub teacher_id: Option<i32>,
    pub note: Option<String>,
    pub status: Option<SessionStatus>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PatchError {
    InvalidFormat(&'static str),
    InvalidTimeRange,
}

impl SessionPatch {
    pub fn parse(
        session_date: &str,
        start_time: &str,
        end_time: &str,
        teacher_id: Option<i32>,
        note: Option<String>,
        status: Option<SessionStatus>,
    ) -> Result<Self, PatchError> {
        let session_date =
            parse_date(session_date).map_err(|e| PatchError::InvalidFormat(e.message()))?;
        let start_time =
            parse_time(start_time).map_err(|e| PatchError::InvalidFormat(e.message()))?;
        let end_time = parse_time(end_time).map_err(|e| PatchError::InvalidFormat(e.message()))?;

        if end_time <= start_time {
            return Err(PatchError::InvalidTimeRange);
        }

        Ok(SessionPatch {
            session_date,
            start_time,
            end_time,
            teacher_id,
            note,
            status,
        })
    }
}

fn patch_error_response(err: PatchError) -> HttpResponse {
    match err {
        PatchError::InvalidFormat(message) => HttpResponse::BadRequest().json(json!({
            "error": "InvalidFormat",
            "message": message,
        })),
        PatchError::InvalidTimeRange => HttpResponse::BadRequest().json(json!({
            "error": "InvalidTimeRange",
            "message": "End time must be after start time",
        })),
    }
}

/// A session may only be edited before it starts, in school-local time.
/// Applies to every role; historical records stay as they were taken.
pub fn edit_window_open(
    session_date: NaiveDate,
    start_time: NaiveTime,
    now_local: NaiveDateTime,
) -> bool {
    now_local < session_date.and_time(start_time)
}

/// An omitted note keeps the stored one; an explicit empty string clears it.
fn merge_note(input: Option<&str>, current: Option<&str>) -> Option<String> {
    match input {
        None => current.map(str::to_owned),
        Some("") => None,
        Some(n) => Some(n.to_owned()),
    }
}

async fn load_session(
    db: &sqlx::PgPool,
    session_id: i32,
) -> Result<Option<ClassSession>, sqlx::Error> {
    sqlx::query_as::<_, ClassSession>(&format!(
        "SELECT {} FROM class_sessions WHERE id = $1",
        SESSION_COLUMNS
    ))
    .bind(session_id)
    .fetch_optional(db)
    .await
}

#[get("")]
async fn list_sessions(
    app_state: web::Data<AppState>,
    req: HttpRequest,
    query: web::Query<ListSessionsQuery>,
) -> impl Responder {
    if let Err(response) = authorize(&req, &app_state, Operation::ListSessions) {
        return response;
    }

    let now = Utc::now();
    let year = query.year.unwrap_or_else(|| local_today(now).year());
    let month = query.month.unwrap_or_else(|| local_today(now).month());

    let Some((first, next)) = crate::sync::month_bounds(year, month) else {
        return HttpResponse::BadRequest().json(json!({
            "error": "InvalidFormat",
            "message": "Invalid year/month",
        }));
    };

    match sqlx::query_as::<_, ClassSession>(&format!(
        "SELECT {} FROM class_sessions
         WHERE class_id = $1 AND session_date >= $2 AND session_date < $3
         ORDER BY session_date, start_time",
        SESSION_COLUMNS
    ))
    .bind(query.class_id)
    .bind(first)
    .bind(next)
    .fetch_all(&app_state.db)
    .await
    {
        Ok(sessions) => HttpResponse::Ok().json(sessions),
        Err(e) => {
            error!("Failed to list sessions: {}", e);
            HttpResponse::InternalServerError().json(json!({ "error": "Internal server error" }))
        }
    }
}

#[post("")]
async fn create_session(
    app_state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<CreateSessionRequest>,
) -> impl Responder {
    if let Err(response) = authorize(&req, &app_state, Operation::CreateSession) {
        return response;
    }

    let patch = match SessionPatch::parse(
        &body.session_date,
        &body.start_time,
        &body.end_time,
        body.teacher_id,
        body.note.clone(),
        None,
    ) {
        Ok(patch) => patch,
        Err(e) => return patch_error_response(e),
    };

    match sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM classes WHERE id = $1)")
        .bind(body.class_id)
        .fetch_one(&app_state.db)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            return HttpResponse::NotFound().json(json!({ "error": "Class not found" }));
        }
        Err(e) => {
            error!("Class lookup failed: {}", e);
            return HttpResponse::InternalServerError()
                .json(json!({ "error": "Internal server error" }));
        }
    }

    if let Some(teacher_id) = patch.teacher_id {
        match sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM teachers WHERE user_id = $1)",
        )
        .bind(teacher_id)
        .fetch_one(&app_state.db)
        .await
        {
            Ok(true) => {}
            Ok(false) => {
                return HttpResponse::NotFound().json(json!({ "error": "Teacher not found" }));
            }
            Err(e) => {
                error!("Teacher lookup failed: {}", e);
                return HttpResponse::InternalServerError()
                    .json(json!({ "error": "Internal server error" }));
            }
        }
    }

    let mut tx = match app_state.db.begin().await {
        Ok(tx) => tx,
        Err(e) => {
            error!("Failed to start transaction: {}", e);
            return HttpResponse::InternalServerError().json(json!({ "error": "Database error" }));
        }
    };

    match find_class_duplicate(
        &mut *tx,
        body.class_id,
        patch.session_date,
        patch.start_time,
        patch.end_time,
        None,
    )
    .await
    {
        Ok(Some(duplicate)) => {
            return HttpResponse::Conflict().json(json!({
                "error": "DuplicateSession",
                "message": "A session with this class, date and time already exists",
                "duplicate": duplicate,
            }));
        }
        Ok(None) => {}
        Err(e) => {
            error!("Duplicate check failed: {}", e);
            return HttpResponse::InternalServerError()
                .json(json!({ "error": "Internal server error" }));
        }
    }

    if let Some(teacher_id) = patch.teacher_id {
        match find_teacher_overlap(
            &mut *tx,
            teacher_id,
            patch.session_date,
            patch.start_time,
            patch.end_time,
            None,
        )
        .await
        {
            Ok(Some(conflict)) => {
                return HttpResponse::Conflict().json(json!({
                    "error": "TeacherOverlap",
                    "message": format!(
                        "Teacher {} already has an overlapping session",
                        conflict.teacher_name.clone().unwrap_or_else(|| teacher_id.to_string())
                    ),
                    "conflicts": [conflict],
                }));
            }
            Ok(None) => {}
            Err(e) => {
                error!("Teacher overlap check failed: {}", e);
                return HttpResponse::InternalServerError()
                    .json(json!({ "error": "Internal server error" }));
            }
        }
    }

    let inserted = sqlx::query_as::<_, ClassSession>(&format!(
        "INSERT INTO class_sessions
             (class_id, session_date, start_time, end_time, teacher_id, note,
              status, is_auto_generated)
         VALUES ($1, $2, $3, $4, $5, $6, 'planned', FALSE)
         RETURNING {}",
        SESSION_COLUMNS
    ))
    .bind(body.class_id)
    .bind(patch.session_date)
    .bind(patch.start_time)
    .bind(patch.end_time)
    .bind(patch.teacher_id)
    .bind(&patch.note)
    .fetch_one(&mut *tx)
    .await;

    let session = match inserted {
        Ok(session) => session,
        Err(e) if is_unique_violation(&e) => {
            // Lost the race between check and insert; the constraint is
            // authoritative.
            return HttpResponse::Conflict().json(json!({
                "error": "DuplicateSession",
                "message": "A session with this class, date and time already exists",
            }));
        }
        Err(e) if is_foreign_key_violation(&e) => {
            // Referenced class or teacher vanished between check and insert.
            return HttpResponse::NotFound()
                .json(json!({ "error": "Referenced class or teacher not found" }));
        }
        Err(e) => {
            error!("Failed to create session: {}", e);
            return HttpResponse::InternalServerError()
                .json(json!({ "error": "Failed to create session" }));
        }
    };

    if let Err(e) = tx.commit().await {
        error!("Failed to commit session create: {}", e);
        return HttpResponse::InternalServerError().json(json!({ "error": "Database error" }));
    }

    HttpResponse::Created().json(session)
}

#[put("/{session_id}")]
async fn update_session(
    app_state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<i32>,
    body: web::Json<UpdateSessionRequest>,
) -> impl Responder {
    if let Err(response) = authorize(&req, &app_state, Operation::UpdateSession) {
        return response;
    }

    let session_id = path.into_inner();

    let session = match load_session(&app_state.db, session_id).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            return HttpResponse::NotFound().json(json!({ "error": "Session not found" }));
        }
        Err(e) => {
            error!("Database error: {}", e);
            return HttpResponse::InternalServerError()
                .json(json!({ "error": "Internal server error" }));
        }
    };

    // No role bypasses the edit window, admins included.
    if !edit_window_open(session.session_date, session.start_time, local_now(Utc::now())) {
        return HttpResponse::Conflict().json(json!({
            "error": "EditWindowClosed",
            "message": "This session has already started and can no longer be edited",
        }));
    }

    let patch = match SessionPatch::parse(
        &body.session_date,
        &body.start_time,
        &body.end_time,
        body.teacher_id,
        body.note.clone(),
        body.status,
    ) {
        Ok(patch) => patch,
        Err(e) => return patch_error_response(e),
    };

    let mut tx = match app_state.db.begin().await {
        Ok(tx) => tx,
        Err(e) => {
            error!("Failed to start transaction: {}", e);
            return HttpResponse::InternalServerError().json(json!({ "error": "Database error" }));
        }
    };

    match find_class_duplicate(
        &mut *tx,
        session.class_id,
        patch.session_date,
        patch.start_time,
        patch.end_time,
        Some(session_id),
    )
    .await
    {
        Ok(Some(duplicate)) => {
            return HttpResponse::Conflict().json(json!({
                "error": "DuplicateSession",
                "message": "A session with this class, date and time already exists",
                "duplicate": duplicate,
            }));
        }
        Ok(None) => {}
        Err(e) => {
            error!("Duplicate check failed: {}", e);
            return HttpResponse::InternalServerError()
                .json(json!({ "error": "Internal server error" }));
        }
    }

    // Teacher to validate: the explicit input, falling back to the current
    // assignment when the request leaves it unspecified.
    let effective_teacher = patch.teacher_id.or(session.teacher_id);
    if let Some(teacher_id) = effective_teacher {
        match find_teacher_overlap(
            &mut *tx,
            teacher_id,
            patch.session_date,
            patch.start_time,
            patch.end_time,
            Some(session_id),
        )
        .await
        {
            Ok(Some(conflict)) => {
                return HttpResponse::Conflict().json(json!({
                    "error": "TeacherOverlap",
                    "message": format!(
                        "Teacher {} already has an overlapping session",
                        conflict.teacher_name.clone().unwrap_or_else(|| teacher_id.to_string())
                    ),
                    "conflicts": [conflict],
                }));
            }
            Ok(None) => {}
            Err(e) => {
                error!("Teacher overlap check failed: {}", e);
                return HttpResponse::InternalServerError()
                    .json(json!({ "error": "Internal server error" }));
            }
        }
    }

    let note = merge_note(patch.note.as_deref(), session.note.as_deref());
    let status = patch.status.unwrap_or(session.status);

    // Any manual edit detaches the session from auto-management.
    let updated = sqlx::query_as::<_, ClassSession>(&format!(
        "UPDATE class_sessions
         SET session_date = $1, start_time = $2, end_time = $3, teacher_id = $4,
             note = $5, status = $6, is_auto_generated = FALSE
         WHERE id = $7
         RETURNING {}",
        SESSION_COLUMNS
    ))
    .bind(patch.session_date)
    .bind(patch.start_time)
    .bind(patch.end_time)
    .bind(effective_teacher)
    .bind(&note)
    .bind(status)
    .bind(session_id)
    .fetch_one(&mut *tx)
    .await;

    let updated = match updated {
        Ok(session) => session,
        Err(e) if is_unique_violation(&e) => {
            return HttpResponse::Conflict().json(json!({
                "error": "DuplicateSession",
                "message": "A session with this class, date and time already exists",
            }));
        }
        Err(e) if is_foreign_key_violation(&e) => {
            return HttpResponse::NotFound().json(json!({ "error": "Teacher not found" }));
        }
        Err(e) => {
            error!("Failed to update session: {}", e);
            return HttpResponse::InternalServerError()
                .json(json!({ "error": "Failed to update session" }));
        }
    };

    if let Err(e) = tx.commit().await {
        error!("Failed to commit session update: {}", e);
        return HttpResponse::InternalServerError().json(json!({ "error": "Database error" }));
    }

    HttpResponse::Ok().json(updated)
}

/// Dry-run teacher conflict check: reports what the write path would reject,
/// without mutating anything. The write path re-checks authoritatively.
#[post("/{session_id}/preflight-teacher")]
async fn preflight_teacher(
    app_state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<PreflightTeacherRequest>,
) -> impl Responder {
    if let Err(response) = authorize(&req, &app_state, Operation::PreflightSession) {
        return response;
    }

    let patch = match SessionPatch::parse(
        &body.session_date,
        &body.start_time,
        &body.end_time,
        Some(body.teacher_id),
        None,
        None,
    ) {
        Ok(patch) => patch,
        Err(e) => return patch_error_response(e),
    };

    match find_teacher_overlap(
        &app_state.db,
        body.teacher_id,
        patch.session_date,
        patch.start_time,
        patch.end_time,
        body.session_id,
    )
    .await
    {
        Ok(Some(conflict)) => HttpResponse::Conflict().json(json!({
            "error": "TeacherOverlap",
            "message": format!(
                "Teacher {} already has an overlapping session",
                conflict.teacher_name.clone().unwrap_or_else(|| body.teacher_id.to_string())
            ),
            "conflicts": [conflict],
        })),
        Ok(None) => HttpResponse::Ok().json(json!({ "conflict": false })),
        Err(e) => {
            error!("Preflight check failed: {}", e);
            HttpResponse::InternalServerError().json(json!({ "error": "Internal server error" }))
        }
    }
}

#[derive(FromRow, serde::Serialize)]
struct StudentOverlapWarning {
    student_id: i32,
    student_name: String,
    session_id: i32,
    class_name: String,
    start_time: NaiveTime,
    end_time: NaiveTime,
}

/// Advisory only: lists enrolled students with a competing commitment in this
/// session's slot. Never blocks a save.
#[post("/{session_id}/check-student-overlap")]
async fn check_student_overlap(
    app_state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<i32>,
) -> impl Responder {
    if let Err(response) = authorize(&req, &app_state, Operation::PreflightSession) {
        return response;
    }

    let session_id = path.into_inner();

    let session = match load_session(&app_state.db, session_id).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            return HttpResponse::NotFound().json(json!({ "error": "Session not found" }));
        }
        Err(e) => {
            error!("Database error: {}", e);
            return HttpResponse::InternalServerError()
                .json(json!({ "error": "Internal server error" }));
        }
    };

    match sqlx::query_as::<_, StudentOverlapWarning>(
        "SELECT s.user_id AS student_id, s.full_name AS student_name,
                cs.id AS session_id, c.name AS class_name, cs.start_time, cs.end_time
         FROM class_students m
         JOIN students s ON s.user_id = m.student_id
         JOIN class_students m2 ON m2.student_id = m.student_id AND m2.is_active
         JOIN class_sessions cs ON cs.class_id = m2.class_id
         JOIN classes c ON c.id = cs.class_id
         WHERE m.class_id = $1 AND m.is_active
           AND cs.id <> $2 AND cs.session_date = $3
           AND cs.start_time < $5 AND cs.end_time > $4
         ORDER BY s.full_name, cs.start_time",
    )
    .bind(session.class_id)
    .bind(session_id)
    .bind(session.session_date)
    .bind(session.start_time)
    .bind(session.end_time)
    .fetch_all(&app_state.db)
    .await
    {
        Ok(warnings) => HttpResponse::Ok().json(warnings),
        Err(e) => {
            error!("Student overlap check failed: {}", e);
            HttpResponse::InternalServerError().json(json!({ "error": "Internal server error" }))
        }
    }
}

#[post("/sync-month/{class_id}")]
async fn sync_month_endpoint(
    app_state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<i32>,
    query: web::Query<SyncMonthQuery>,
) -> impl Responder {
    if let Err(response) = authorize(&req, &app_state, Operation::SyncMonth) {
        return response;
    }

    let class_id = path.into_inner();

    let class_exists = sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS(SELECT 1 FROM classes WHERE id = $1)",
    )
    .bind(class_id)
    .fetch_one(&app_state.db)
    .await
    .unwrap_or(false);

    if !class_exists {
        return HttpResponse::NotFound().json(json!({ "error": "Class not found" }));
    }

    let today = local_today(Utc::now());
    let year = query.year.unwrap_or_else(|| today.year());
    let month = query.month.unwrap_or_else(|| today.month());

    match sync_month(&app_state.db, class_id, year, month).await {
        Ok(report) => HttpResponse::Ok().json(report),
        Err(e) => {
            error!("Month sync failed for class {}: {}", class_id, e);
            HttpResponse::InternalServerError().json(json!({ "error": "Month sync failed" }))
        }
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/class-sessions")
            .service(sync_month_endpoint)
            .service(list_sessions)
            .service(create_session)
            .service(update_session)
            .service(preflight_teacher)
            .service(check_student_overlap)
            .service(attendance::submit_attendance)
            .service(accounting::apply_accounting_endpoint)
            .service(accounting::revert_accounting_endpoint),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn edit_window_open_before_start() {
        let now = date(2025, 3, 10).and_time(time(8, 59));
        assert!(edit_window_open(date(2025, 3, 10), time(9, 0), now));
    }

    #[test]
    fn edit_window_closed_at_start_and_after() {
        let start = date(2025, 3, 10).and_time(time(9, 0));
        assert!(!edit_window_open(date(2025, 3, 10), time(9, 0), start));
        let later = date(2025, 3, 10).and_time(time(9, 1));
        assert!(!edit_window_open(date(2025, 3, 10), time(9, 0), later));
    }

    #[test]
    fn edit_window_closed_for_past_dates() {
        let now = date(2025, 3, 11).and_time(time(0, 0));
        assert!(!edit_window_open(date(2025, 3, 10), time(23, 0), now));
    }

    #[test]
    fn patch_rejects_reversed_time_range() {
        let result = SessionPatch::parse("2025-03-10", "10:00", "09:00", None, None, None);
        assert_eq!(result, Err(PatchError::InvalidTimeRange));
        let equal = SessionPatch::parse("2025-03-10", "10:00", "10:00", None, None, None);
        assert_eq!(equal, Err(PatchError::InvalidTimeRange));
    }

    #[test]
    fn patch_rejects_bad_formats() {
        assert!(matches!(
            SessionPatch::parse("03/10/2025", "09:00", "10:00", None, None, None),
            Err(PatchError::InvalidFormat(_))
        ));
        assert!(matches!(
            SessionPatch::parse("2025-03-10", "9am", "10:00", None, None, None),
            Err(PatchError::InvalidFormat(_))
        ));
    }

    #[test]
    fn patch_accepts_seconds_in_times() {
        let patch =
            SessionPatch::parse("2025-03-10", "09:00:00", "10:30:00", Some(7), None, None).unwrap();
        assert_eq!(patch.session_date, date(2025, 3, 10));
        assert_eq!(patch.start_time, time(9, 0));
        assert_eq!(patch.end_time, time(10, 30));
        assert_eq!(patch.teacher_id, Some(7));
    }

    #[test]
    fn note_is_kept_replaced_or_cleared() {
        assert_eq!(merge_note(None, Some("bring sheet music")), Some("bring sheet music".to_string()));
        assert_eq!(merge_note(Some("room changed"), Some("bring sheet music")), Some("room changed".to_string()));
        assert_eq!(merge_note(Some(""), Some("bring sheet music")), None);
        assert_eq!(merge_note(None, None), None);
        assert_eq!(merge_note(Some(""), None), None);
    }
}
