use actix_web::{delete, get, post, web, HttpRequest, HttpResponse, Responder};
use chrono::{DateTime, NaiveDate, Utc};
use log::error;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::FromRow;

use crate::policy::{authorize, Operation};
use crate::AppState;

#[derive(Debug, Serialize, FromRow)]
struct ClassRecord {
    id: i32,
    name: String,
    is_active: bool,
    note: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, FromRow)]
struct RosterStudent {
    student_id: i32,
    full_name: String,
    is_active: bool,
    joined_date: NaiveDate,
    remaining_sessions: i32,
    attended_sessions: i32,
}

#[derive(Debug, Serialize)]
struct ClassResponse {
    #[serde(flatten)]
    class: ClassRecord,
    students: Vec<RosterStudent>,
}

#[derive(Deserialize)]
struct CreateClassRequest {
    name: String,
    note: Option<String>,
}

#[derive(Deserialize)]
struct AddStudentRequest {
    student_id: i32,
    note: Option<String>,
}

#[derive(Deserialize)]
struct ListClassesQuery {
    include_inactive: Option<bool>,
}

#[get("")]
async fn list_classes(
    app_state: web::Data<AppState>,
    req: HttpRequest,
    query: web::Query<ListClassesQuery>,
) -> impl Responder {
    if let Err(response) = authorize(&req, &app_state, Operation::ViewClasses) {
        return response;
    }

    let include_inactive = query.include_inactive.unwrap_or(false);

    match sqlx::query_as::<_, ClassRecord>(
        "SELECT id, name, is_active, note, created_at FROM classes
         WHERE $1 OR is_active
         ORDER BY name",
    )
    .bind(include_inactive)
    .fetch_all(&app_state.db)
    .await
    {
        Ok(classes) => HttpResponse::Ok().json(classes),
        Err(e) => {
            error!("Failed to list classes: {}", e);
            HttpResponse::InternalServerError().json(json!({ "error": "Internal server error" }))
        }
    }
}

#[get("/{class_id}")]
async fn get_class(
    app_state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<i32>,
) -> impl Responder {
    if let Err(response) = authorize(&req, &app_state, Operation::ViewClasses) {
        return response;
    }

    let class_id = path.into_inner();

    let class = match sqlx::query_as::<_, ClassRecord>(
        "SELECT id, name, is_active, note, created_at FROM classes WHERE id = $1",
    )
    .bind(class_id)
    .fetch_optional(&app_state.db)
    .await
    {
        Ok(Some(class)) => class,
        Ok(None) => {
            return HttpResponse::NotFound().json(json!({ "error": "Class not found" }));
        }
        Err(e) => {
            error!("Database error: {}", e);
            return HttpResponse::InternalServerError()
                .json(json!({ "error": "Internal server error" }));
        }
    };

    let students = sqlx::query_as::<_, RosterStudent>(
        "SELECT m.student_id, s.full_name, m.is_active, m.joined_date,
                s.remaining_sessions, s.attended_sessions
         FROM class_students m
         JOIN students s ON s.user_id = m.student_id
         WHERE m.class_id = $1
         ORDER BY s.full_name",
    )
    .bind(class_id)
    .fetch_all(&app_state.db)
    .await
    .unwrap_or_default();

    HttpResponse::Ok().json(ClassResponse { class, students })
}

#[post("")]
async fn create_class(
    app_state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<CreateClassRequest>,
) -> impl Responder {
    if let Err(response) = authorize(&req, &app_state, Operation::ManageClasses) {
        return response;
    }

    if body.name.trim().is_empty() {
        return HttpResponse::BadRequest().json(json!({ "error": "Class name is required" }));
    }

    match sqlx::query_as::<_, ClassRecord>(
        "INSERT INTO classes (name, note) VALUES ($1, $2)
         RETURNING id, name, is_active, note, created_at",
    )
    .bind(body.name.trim())
    .bind(&body.note)
    .fetch_one(&app_state.db)
    .await
    {
        Ok(class) => HttpResponse::Created().json(class),
        Err(e) => {
            error!("Failed to create class: {}", e);
            HttpResponse::InternalServerError().json(json!({ "error": "Failed to create class" }))
        }
    }
}

/// Enroll a student; re-adding a removed student reactivates the membership.
#[post("/{class_id}/students")]
async fn add_student(
    app_state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<i32>,
    body: web::Json<AddStudentRequest>,
) -> impl Responder {
    if let Err(response) = authorize(&req, &app_state, Operation::ManageClasses) {
        return response;
    }

    let class_id = path.into_inner();

    let student_exists = sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS(SELECT 1 FROM students WHERE user_id = $1 AND status = 'active')",
    )
    .bind(body.student_id)
    .fetch_one(&app_state.db)
    .await
    .unwrap_or(false);

    if !student_exists {
        return HttpResponse::NotFound().json(json!({ "error": "Active student not found" }));
    }

    match sqlx::query(
        "INSERT INTO class_students (class_id, student_id, is_active, joined_date, note)
         VALUES ($1, $2, TRUE, CURRENT_DATE, $3)
         ON CONFLICT (class_id, student_id) DO UPDATE
             SET is_active = TRUE, note = COALESCE(EXCLUDED.note, class_students.note)",
    )
    .bind(class_id)
    .bind(body.student_id)
    .bind(&body.note)
    .execute(&app_state.db)
    .await
    {
        Ok(_) => HttpResponse::Ok().json(json!({ "message": "Student enrolled" })),
        Err(e) => {
            error!("Failed to enroll student: {}", e);
            HttpResponse::InternalServerError().json(json!({ "error": "Failed to enroll student" }))
        }
    }
}

/// Deactivate a membership rather than erasing it; attendance history and the
/// legacy per-class counter stay intact.
#[delete("/{class_id}/students/{student_id}")]
async fn remove_student(
    app_state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<(i32, i32)>,
) -> impl Responder {
    if let Err(response) = authorize(&req, &app_state, Operation::ManageClasses) {
        return response;
    }

    let (class_id, student_id) = path.into_inner();

    match sqlx::query(
        "UPDATE class_students SET is_active = FALSE WHERE class_id = $1 AND student_id = $2",
    )
    .bind(class_id)
    .bind(student_id)
    .execute(&app_state.db)
    .await
    {
        Ok(result) if result.rows_affected() > 0 => {
            HttpResponse::Ok().json(json!({ "message": "Student removed from class" }))
        }
        Ok(_) => HttpResponse::NotFound().json(json!({ "error": "Membership not found" })),
        Err(e) => {
            error!("Failed to remove student: {}", e);
            HttpResponse::InternalServerError().json(json!({ "error": "Failed to remove student" }))
        }
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/classes")
            .service(list_classes)
            .service(create_class)
            .service(get_class)
            .service(add_student)
            .service(remove_student),
    );
}
