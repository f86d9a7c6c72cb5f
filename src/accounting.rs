use actix_web::{post, web, HttpRequest, HttpResponse, Responder};
use chrono::{Datelike, NaiveDate};
use log::error;
use serde_json::json;
use sqlx::{FromRow, PgPool};

use crate::policy::{authorize, Operation};
use crate::AppState;

#[derive(Debug, PartialEq, Eq)]
pub enum AccountingOutcome {
    Applied { students_charged: u64 },
    AlreadyApplied,
    NotApplied,
    SessionNotFound,
}

#[derive(FromRow)]
struct AccountingSession {
    id: i32,
    class_id: i32,
    teacher_id: Option<i32>,
    session_date: NaiveDate,
    accounting_applied: bool,
}

/// Settle a session's accounting exactly once: flag the session, charge one
/// paid session to every active roster student, and bump the teacher's monthly
/// taught counter. The `accounting_applied` check-and-set runs under a row
/// lock inside one transaction, so a concurrent retry sees AlreadyApplied
/// rather than double-charging.
pub async fn apply_accounting(
    db: &PgPool,
    session_id: i32,
) -> Result<AccountingOutcome, sqlx::Error> {
    let mut tx = db.begin().await?;

    let session = sqlx::query_as::<_, AccountingSession>(
        "SELECT id, class_id, teacher_id, session_date, accounting_applied
         FROM class_sessions WHERE id = $1 FOR UPDATE",
    )
    .bind(session_id)
    .fetch_optional(&mut *tx)
    .await?;

    let session = match session {
        Some(session) => session,
        None => return Ok(AccountingOutcome::SessionNotFound),
    };

    if session.accounting_applied {
        return Ok(AccountingOutcome::AlreadyApplied);
    }

    sqlx::query(
        "UPDATE class_sessions
         SET accounting_applied = TRUE, accounting_applied_at = NOW()
         WHERE id = $1",
    )
    .bind(session.id)
    .execute(&mut *tx)
    .await?;

    let charged = sqlx::query(
        "UPDATE students
         SET remaining_sessions = remaining_sessions - 1,
             attended_sessions = attended_sessions + 1
         WHERE user_id IN
             (SELECT student_id FROM class_students WHERE class_id = $1 AND is_active)",
    )
    .bind(session.class_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    // Legacy per-class counter, kept in step with the student ledger.
    sqlx::query(
        "UPDATE class_students SET remaining_sessions = remaining_sessions - 1
         WHERE class_id = $1 AND is_active",
    )
    .bind(session.class_id)
    .execute(&mut *tx)
    .await?;

    if let Some(teacher_id) = session.teacher_id {
        sqlx::query(
            "INSERT INTO teacher_monthly_stats (teacher_id, year, month, sessions_taught)
             VALUES ($1, $2, $3, 1)
             ON CONFLICT (teacher_id, year, month) DO UPDATE
                 SET sessions_taught = teacher_monthly_stats.sessions_taught + 1",
        )
        .bind(teacher_id)
        .bind(session.session_date.year())
        .bind(session.session_date.month() as i32)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    Ok(AccountingOutcome::Applied {
        students_charged: charged,
    })
}

/// Undo a settled session: clear the flag, refund each active roster student,
/// and decrement the teacher's monthly counter. A session that was never
/// applied is left untouched.
pub async fn revert_accounting(
    db: &PgPool,
    session_id: i32,
) -> Result<AccountingOutcome, sqlx::Error> {
    let mut tx = db.begin().await?;

    let session = sqlx::query_as::<_, AccountingSession>(
        "SELECT id, class_id, teacher_id, session_date, accounting_applied
         FROM class_sessions WHERE id = $1 FOR UPDATE",
    )
    .bind(session_id)
    .fetch_optional(&mut *tx)
    .await?;

    let session = match session {
        Some(session) => session,
        None => return Ok(AccountingOutcome::SessionNotFound),
    };

    if !session.accounting_applied {
        return Ok(AccountingOutcome::NotApplied);
    }

    sqlx::query(
        "UPDATE class_sessions
         SET accounting_applied = FALSE, accounting_applied_at = NULL
         WHERE id = $1",
    )
    .bind(session.id)
    .execute(&mut *tx)
    .await?;

    let refunded = sqlx::query(
        "UPDATE students
         SET remaining_sessions = remaining_sessions + 1,
             attended_sessions = attended_sessions - 1
         WHERE user_id IN
             (SELECT student_id FROM class_students WHERE class_id = $1 AND is_active)",
    )
    .bind(session.class_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    sqlx::query(
        "UPDATE class_students SET remaining_sessions = remaining_sessions + 1
         WHERE class_id = $1 AND is_active",
    )
    .bind(session.class_id)
    .execute(&mut *tx)
    .await?;

    if let Some(teacher_id) = session.teacher_id {
        sqlx::query(
            "UPDATE teacher_monthly_stats
             SET sessions_taught = GREATEST(sessions_taught - 1, 0)
             WHERE teacher_id = $1 AND year = $2 AND month = $3",
        )
        .bind(teacher_id)
        .bind(session.session_date.year())
        .bind(session.session_date.month() as i32)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    Ok(AccountingOutcome::Applied {
        students_charged: refunded,
    })
}

#[post("/{session_id}/accounting/apply")]
pub async fn apply_accounting_endpoint(
    app_state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<i32>,
) -> impl Responder {
    if let Err(response) = authorize(&req, &app_state, Operation::ApplyAccounting) {
        return response;
    }

    match apply_accounting(&app_state.db, path.into_inner()).await {
        Ok(AccountingOutcome::Applied { students_charged }) => HttpResponse::Ok().json(json!({
            "message": format!("Accounting applied; {} students charged", students_charged),
        })),
        Ok(AccountingOutcome::AlreadyApplied) => HttpResponse::Conflict().json(json!({
            "error": "AlreadyApplied",
            "message": "Accounting was already applied for this session",
        })),
        Ok(AccountingOutcome::SessionNotFound) => {
            HttpResponse::NotFound().json(json!({ "error": "Session not found" }))
        }
        Ok(AccountingOutcome::NotApplied) => {
            HttpResponse::InternalServerError().json(json!({ "error": "Internal server error" }))
        }
        Err(e) => {
            error!("Failed to apply accounting: {}", e);
            HttpResponse::InternalServerError().json(json!({ "error": "Internal server error" }))
        }
    }
}

#[post("/{session_id}/accounting/revert")]
pub async fn revert_accounting_endpoint(
    app_state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<i32>,
) -> impl Responder {
    if let Err(response) = authorize(&req, &app_state, Operation::RevertAccounting) {
        return response;
    }

    match revert_accounting(&app_state.db, path.into_inner()).await {
        Ok(AccountingOutcome::Applied { students_charged }) => HttpResponse::Ok().json(json!({
            "message": format!("Accounting reverted; {} students refunded", students_charged),
        })),
        Ok(AccountingOutcome::NotApplied) => HttpResponse::Conflict().json(json!({
            "error": "NotApplied",
            "message": "Accounting has not been applied for this session",
        })),
        Ok(AccountingOutcome::SessionNotFound) => {
            HttpResponse::NotFound().json(json!({ "error": "Session not found" }))
        }
        Ok(AccountingOutcome::AlreadyApplied) => {
            HttpResponse::InternalServerError().json(json!({ "error": "Internal server error" }))
        }
        Err(e) => {
            error!("Failed to revert accounting: {}", e);
            HttpResponse::InternalServerError().json(json!({ "error": "Internal server error" }))
        }
    }
}
