use actix_web::{post, web, HttpRequest, HttpResponse, Responder};
use chrono::{Datelike, NaiveDate, Utc};
use log::error;
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;

use crate::conflicts::is_foreign_key_violation;
use crate::models::session::ClassSession;
use crate::policy::{self, authorize, Operation};
use crate::timeparse::local_today;
use crate::AppState;

#[derive(Deserialize)]
pub struct AttendanceEntry {
    pub student_id: i32,
    pub is_present: bool,
    pub note: Option<String>,
}

/// Decide whether the caller may record attendance for a session.
///
/// Admins may record for any session, including past ones. Teachers may only
/// record for sessions assigned to them, and only on the session's own day in
/// school-local time; historical corrections go through an admin. The denial
/// reason is surfaced to the client verbatim.
pub fn can_take_attendance(
    roles: &[String],
    user_id: i32,
    assigned_teacher_id: Option<i32>,
    session_date: NaiveDate,
    today: NaiveDate,
) -> Result<(), String> {
    if roles.iter().any(|r| r == policy::ADMIN) {
        return Ok(());
    }

    if roles.iter().any(|r| r == policy::TEACHER) {
        if assigned_teacher_id != Some(user_id) {
            return Err("You are not the teacher assigned to this session".to_string());
        }
        if session_date != today {
            return Err(
                "Teachers can only take attendance on the session's date; contact an admin for corrections"
                    .to_string(),
            );
        }
        return Ok(());
    }

    Err("Only teachers and admins can take attendance".to_string())
}

/// The teacher responsible for a session: the one pinned on the session row,
/// or the class's scheduled teacher for that weekday and start time.
pub async fn resolve_assigned_teacher(
    db: &PgPool,
    session: &ClassSession,
) -> Result<Option<i32>, sqlx::Error> {
    if session.teacher_id.is_some() {
        return Ok(session.teacher_id);
    }

    let weekday = session.session_date.weekday().num_days_from_sunday() as i16;
    sqlx::query_scalar::<_, i32>(
        "SELECT teacher_id FROM class_schedules
         WHERE class_id = $1 AND day_of_week = $2 AND start_time = $3 AND is_active",
    )
    .bind(session.class_id)
    .bind(weekday)
    .bind(session.start_time)
    .fetch_optional(db)
    .await
}

#[post("/{session_id}/attendance")]
pub async fn submit_attendance(
    app_state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<i32>,
    entries: web::Json<Vec<AttendanceEntry>>,
) -> impl Responder {
    let claims = match authorize(&req, &app_state, Operation::TakeAttendance) {
        Ok(claims) => claims,
        Err(response) => return response,
    };

    let session_id = path.into_inner();

    let session = match sqlx::query_as::<_, ClassSession>(
        "SELECT id, class_id, session_date, start_time, end_time, teacher_id, status,
                is_auto_generated, note, accounting_applied, accounting_applied_at
         FROM class_sessions WHERE id = $1",
    )
    .bind(session_id)
    .fetch_optional(&app_state.db)
    .await
    {
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

    let user_id = match sqlx::query_scalar::<_, i32>("SELECT id FROM users WHERE username = $1")
        .bind(&claims.sub)
        .fetch_optional(&app_state.db)
        .await
    {
        Ok(Some(id)) => id,
        Ok(None) => {
            return HttpResponse::Unauthorized().json(json!({ "error": "User not found" }));
        }
        Err(e) => {
            error!("Database error: {}", e);
            return HttpResponse::InternalServerError()
                .json(json!({ "error": "Internal server error" }));
        }
    };

    let assigned_teacher = match resolve_assigned_teacher(&app_state.db, &session).await {
        Ok(teacher) => teacher,
        Err(e) => {
            error!("Failed to resolve assigned teacher: {}", e);
            return HttpResponse::InternalServerError()
                .json(json!({ "error": "Internal server error" }));
        }
    };

    if let Err(reason) = can_take_attendance(
        &claims.roles,
        user_id,
        assigned_teacher,
        session.session_date,
        local_today(Utc::now()),
    ) {
        return HttpResponse::Forbidden().json(json!({ "error": reason }));
    }

    let mut tx = match app_state.db.begin().await {
        Ok(tx) => tx,
        Err(e) => {
            error!("Failed to start transaction: {}", e);
            return HttpResponse::InternalServerError().json(json!({ "error": "Database error" }));
        }
    };

    for entry in entries.iter() {
        if let Err(e) = sqlx::query(
            "INSERT INTO attendance (session_id, student_id, is_present, note, taken_at, taken_by_user_id)
             VALUES ($1, $2, $3, $4, NOW(), $5)
             ON CONFLICT (session_id, student_id) DO UPDATE
                 SET is_present = EXCLUDED.is_present,
                     note = EXCLUDED.note,
                     taken_at = EXCLUDED.taken_at,
                     taken_by_user_id = EXCLUDED.taken_by_user_id",
        )
        .bind(session_id)
        .bind(entry.student_id)
        .bind(entry.is_present)
        .bind(&entry.note)
        .bind(user_id)
        .execute(&mut *tx)
        .await
        {
            let _ = tx.rollback().await;
            if is_foreign_key_violation(&e) {
                return HttpResponse::NotFound().json(json!({
                    "error": "Student not found",
                    "student_id": entry.student_id,
                }));
            }
            error!("Failed to record attendance: {}", e);
            return HttpResponse::InternalServerError()
                .json(json!({ "error": "Failed to record attendance" }));
        }
    }

    if let Err(e) = tx.commit().await {
        error!("Failed to commit attendance: {}", e);
        return HttpResponse::InternalServerError()
            .json(json!({ "error": "Failed to save attendance" }));
    }

    HttpResponse::Ok().json(json!({
        "message": "Attendance recorded",
        "records": entries.len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn roles(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn admin_can_record_any_date() {
        let today = date(2025, 3, 10);
        assert!(can_take_attendance(&roles(&["admin"]), 1, Some(9), date(2025, 3, 3), today).is_ok());
        assert!(can_take_attendance(&roles(&["admin"]), 1, None, date(2025, 4, 1), today).is_ok());
    }

    #[test]
    fn assigned_teacher_allowed_on_the_day_only() {
        let today = date(2025, 3, 10);
        assert!(can_take_attendance(&roles(&["teacher"]), 9, Some(9), today, today).is_ok());

        let yesterday = date(2025, 3, 9);
        let denied = can_take_attendance(&roles(&["teacher"]), 9, Some(9), yesterday, today);
        assert!(denied.is_err());
        assert!(denied.unwrap_err().contains("session's date"));
    }

    #[test]
    fn unassigned_teacher_is_denied() {
        let today = date(2025, 3, 10);
        let denied = can_take_attendance(&roles(&["teacher"]), 9, Some(4), today, today);
        assert!(denied.is_err());
        assert!(denied.unwrap_err().contains("not the teacher"));
    }

    #[test]
    fn teacher_denied_when_session_has_no_assignee() {
        let today = date(2025, 3, 10);
        assert!(can_take_attendance(&roles(&["teacher"]), 9, None, today, today).is_err());
    }

    #[test]
    fn students_are_denied() {
        let today = date(2025, 3, 10);
        assert!(can_take_attendance(&roles(&["student"]), 9, Some(9), today, today).is_err());
    }
}
