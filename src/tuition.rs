use actix_web::{get, post, web, HttpRequest, HttpResponse, Responder};
use log::error;
use serde::Deserialize;
use serde_json::json;
use sqlx::FromRow;

use crate::models::tuition::{TuitionPayment, TuitionStatus};
use crate::policy::{self, authorize, Operation};
use crate::AppState;

const TUITION_COLUMNS: &str =
    "id, student_id, sessions_purchased, amount, note, status, created_at, \
     decided_at, decided_by_user_id";

#[derive(Deserialize)]
struct CreateTuitionRequest {
    student_id: i32,
    sessions_purchased: i32,
    amount: Option<i64>,
    note: Option<String>,
}

#[derive(Deserialize)]
struct ListTuitionQuery {
    student_id: Option<i32>,
}

#[derive(FromRow)]
struct PendingPayment {
    student_id: i32,
    sessions_purchased: i32,
    status: TuitionStatus,
}

#[get("")]
async fn list_payments(
    app_state: web::Data<AppState>,
    req: HttpRequest,
    query: web::Query<ListTuitionQuery>,
) -> impl Responder {
    let claims = match authorize(&req, &app_state, Operation::ViewTuition) {
        Ok(claims) => claims,
        Err(response) => return response,
    };

    // Students only see their own payment history.
    let student_filter = if claims.roles.iter().any(|r| r == policy::ADMIN) {
        query.student_id
    } else {
        match sqlx::query_scalar::<_, i32>("SELECT id FROM users WHERE username = $1")
            .bind(&claims.sub)
            .fetch_optional(&app_state.db)
            .await
        {
            Ok(Some(id)) => Some(id),
            _ => {
                return HttpResponse::Unauthorized().json(json!({ "error": "User not found" }));
            }
        }
    };

    match sqlx::query_as::<_, TuitionPayment>(&format!(
        "SELECT {} FROM tuition_payments
         WHERE $1::int IS NULL OR student_id = $1
         ORDER BY created_at DESC",
        TUITION_COLUMNS
    ))
    .bind(student_filter)
    .fetch_all(&app_state.db)
    .await
    {
        Ok(payments) => HttpResponse::Ok().json(payments),
        Err(e) => {
            error!("Failed to list tuition payments: {}", e);
            HttpResponse::InternalServerError().json(json!({ "error": "Internal server error" }))
        }
    }
}

#[post("")]
async fn create_payment(
    app_state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<CreateTuitionRequest>,
) -> impl Responder {
    if let Err(response) = authorize(&req, &app_state, Operation::RequestTuition) {
        return response;
    }

    if body.sessions_purchased <= 0 {
        return HttpResponse::BadRequest()
            .json(json!({ "error": "sessions_purchased must be positive" }));
    }

    match sqlx::query_as::<_, TuitionPayment>(&format!(
        "INSERT INTO tuition_payments (student_id, sessions_purchased, amount, note)
         VALUES ($1, $2, $3, $4)
         RETURNING {}",
        TUITION_COLUMNS
    ))
    .bind(body.student_id)
    .bind(body.sessions_purchased)
    .bind(body.amount.unwrap_or(0))
    .bind(&body.note)
    .fetch_one(&app_state.db)
    .await
    {
        Ok(payment) => HttpResponse::Created().json(payment),
        Err(e) => {
            error!("Failed to create tuition request: {}", e);
            HttpResponse::InternalServerError()
                .json(json!({ "error": "Failed to create tuition request" }))
        }
    }
}

/// Approve a pending request and credit the purchased sessions to the
/// student's balance. The status check-and-set runs under a row lock, so a
/// double approval yields a conflict instead of a double credit.
#[post("/{payment_id}/approve")]
async fn approve_payment(
    app_state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<i32>,
) -> impl Responder {
    let claims = match authorize(&req, &app_state, Operation::DecideTuition) {
        Ok(claims) => claims,
        Err(response) => return response,
    };

    let payment_id = path.into_inner();

    let admin_id = match sqlx::query_scalar::<_, i32>("SELECT id FROM users WHERE username = $1")
        .bind(&claims.sub)
        .fetch_optional(&app_state.db)
        .await
    {
        Ok(Some(id)) => id,
        _ => {
            return HttpResponse::Unauthorized().json(json!({ "error": "User not found" }));
        }
    };

    let mut tx = match app_state.db.begin().await {
        Ok(tx) => tx,
        Err(e) => {
            error!("Failed to start transaction: {}", e);
            return HttpResponse::InternalServerError().json(json!({ "error": "Database error" }));
        }
    };

    let payment = match sqlx::query_as::<_, PendingPayment>(
        "SELECT student_id, sessions_purchased, status
         FROM tuition_payments WHERE id = $1 FOR UPDATE",
    )
    .bind(payment_id)
    .fetch_optional(&mut *tx)
    .await
    {
        Ok(Some(payment)) => payment,
        Ok(None) => {
            return HttpResponse::NotFound().json(json!({ "error": "Payment not found" }));
        }
        Err(e) => {
            error!("Database error: {}", e);
            return HttpResponse::InternalServerError()
                .json(json!({ "error": "Internal server error" }));
        }
    };

    if payment.status != TuitionStatus::Pending {
        return HttpResponse::Conflict().json(json!({
            "error": "AlreadyDecided",
            "message": "This payment request was already decided",
        }));
    }

    if let Err(e) = sqlx::query(
        "UPDATE tuition_payments
         SET status = 'approved', decided_at = NOW(), decided_by_user_id = $1
         WHERE id = $2",
    )
    .bind(admin_id)
    .bind(payment_id)
    .execute(&mut *tx)
    .await
    {
        error!("Failed to approve payment: {}", e);
        let _ = tx.rollback().await;
        return HttpResponse::InternalServerError()
            .json(json!({ "error": "Failed to approve payment" }));
    }

    if let Err(e) = sqlx::query(
        "UPDATE students SET remaining_sessions = remaining_sessions + $1 WHERE user_id = $2",
    )
    .bind(payment.sessions_purchased)
    .bind(payment.student_id)
    .execute(&mut *tx)
    .await
    {
        error!("Failed to credit student balance: {}", e);
        let _ = tx.rollback().await;
        return HttpResponse::InternalServerError()
            .json(json!({ "error": "Failed to credit student balance" }));
    }

    if let Err(e) = tx.commit().await {
        error!("Failed to commit approval: {}", e);
        return HttpResponse::InternalServerError().json(json!({ "error": "Database error" }));
    }

    HttpResponse::Ok().json(json!({
        "message": format!("Approved; {} sessions credited", payment.sessions_purchased),
    }))
}

#[post("/{payment_id}/reject")]
async fn reject_payment(
    app_state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<i32>,
) -> impl Responder {
    let claims = match authorize(&req, &app_state, Operation::DecideTuition) {
        Ok(claims) => claims,
        Err(response) => return response,
    };

    let admin_id = match sqlx::query_scalar::<_, i32>("SELECT id FROM users WHERE username = $1")
        .bind(&claims.sub)
        .fetch_optional(&app_state.db)
        .await
    {
        Ok(Some(id)) => id,
        _ => {
            return HttpResponse::Unauthorized().json(json!({ "error": "User not found" }));
        }
    };

    match sqlx::query(
        "UPDATE tuition_payments
         SET status = 'rejected', decided_at = NOW(), decided_by_user_id = $1
         WHERE id = $2 AND status = 'pending'",
    )
    .bind(admin_id)
    .bind(path.into_inner())
    .execute(&app_state.db)
    .await
    {
        Ok(result) if result.rows_affected() > 0 => {
            HttpResponse::Ok().json(json!({ "message": "Payment request rejected" }))
        }
        Ok(_) => HttpResponse::Conflict().json(json!({
            "error": "AlreadyDecided",
            "message": "Payment not found or already decided",
        })),
        Err(e) => {
            error!("Failed to reject payment: {}", e);
            HttpResponse::InternalServerError()
                .json(json!({ "error": "Failed to reject payment" }))
        }
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/tuition")
            .service(list_payments)
            .service(create_payment)
            .service(approve_payment)
            .service(reject_payment),
    );
}
