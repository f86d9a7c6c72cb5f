use actix_web::{delete, get, post, put, web, HttpRequest, HttpResponse, Responder};
use log::error;
use serde::Deserialize;
use serde_json::json;

use crate::conflicts::is_unique_violation;
use crate::models::session::ClassSchedule;
use crate::policy::{authorize, Operation};
use crate::timeparse::parse_time;
use crate::AppState;

#[derive(Deserialize)]
struct CreateScheduleRequest {
    class_id: i32,
    day_of_week: i16,
    start_time: String,
    end_time: String,
    teacher_id: i32,
    note: Option<String>,
}

#[derive(Deserialize)]
struct UpdateScheduleRequest {
    day_of_week: Option<i16>,
    start_time: Option<String>,
    end_time: Option<String>,
    teacher_id: Option<i32>,
    is_active: Option<bool>,
    note: Option<String>,
}

#[derive(Deserialize)]
struct ListSchedulesQuery {
    class_id: i32,
}

const SCHEDULE_COLUMNS: &str =
    "id, class_id, day_of_week, start_time, end_time, teacher_id, is_active, note";

#[get("")]
async fn list_schedules(
    app_state: web::Data<AppState>,
    req: HttpRequest,
    query: web::Query<ListSchedulesQuery>,
) -> impl Responder {
    if let Err(response) = authorize(&req, &app_state, Operation::ViewSchedules) {
        return response;
    }

    match sqlx::query_as::<_, ClassSchedule>(&format!(
        "SELECT {} FROM class_schedules WHERE class_id = $1 ORDER BY day_of_week, start_time",
        SCHEDULE_COLUMNS
    ))
    .bind(query.class_id)
    .fetch_all(&app_state.db)
    .await
    {
        Ok(schedules) => HttpResponse::Ok().json(schedules),
        Err(e) => {
            error!("Failed to list schedules: {}", e);
            HttpResponse::InternalServerError().json(json!({ "error": "Internal server error" }))
        }
    }
}

#[post("")]
async fn create_schedule(
    app_state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<CreateScheduleRequest>,
) -> impl Responder {
    if let Err(response) = authorize(&req, &app_state, Operation::ManageSchedules) {
        return response;
    }

    if !(0..=6).contains(&body.day_of_week) {
        return HttpResponse::BadRequest().json(json!({
            "error": "InvalidFormat",
            "message": "day_of_week must be between 0 (Sunday) and 6 (Saturday)",
        }));
    }

    let (start, end) = match (parse_time(&body.start_time), parse_time(&body.end_time)) {
        (Ok(start), Ok(end)) => (start, end),
        (Err(e), _) | (_, Err(e)) => {
            return HttpResponse::BadRequest().json(json!({
                "error": "InvalidFormat",
                "message": e.message(),
            }));
        }
    };

    if end <= start {
        return HttpResponse::BadRequest().json(json!({
            "error": "InvalidTimeRange",
            "message": "End time must be after start time",
        }));
    }

    match sqlx::query_as::<_, ClassSchedule>(&format!(
        "INSERT INTO class_schedules
             (class_id, day_of_week, start_time, end_time, teacher_id, is_active, note)
         VALUES ($1, $2, $3, $4, $5, TRUE, $6)
         RETURNING {}",
        SCHEDULE_COLUMNS
    ))
    .bind(body.class_id)
    .bind(body.day_of_week)
    .bind(start)
    .bind(end)
    .bind(body.teacher_id)
    .bind(&body.note)
    .fetch_one(&app_state.db)
    .await
    {
        Ok(schedule) => HttpResponse::Created().json(schedule),
        Err(e) if is_unique_violation(&e) => HttpResponse::Conflict().json(json!({
            "error": "DuplicateSchedule",
            "message": "This class already has a schedule at that weekday and start time",
        })),
        Err(e) => {
            error!("Failed to create schedule: {}", e);
            HttpResponse::InternalServerError()
                .json(json!({ "error": "Failed to create schedule" }))
        }
    }
}

#[put("/{schedule_id}")]
async fn update_schedule(
    app_state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<i32>,
    body: web::Json<UpdateScheduleRequest>,
) -> impl Responder {
    if let Err(response) = authorize(&req, &app_state, Operation::ManageSchedules) {
        return response;
    }

    let schedule_id = path.into_inner();

    let existing = match sqlx::query_as::<_, ClassSchedule>(&format!(
        "SELECT {} FROM class_schedules WHERE id = $1",
        SCHEDULE_COLUMNS
    ))
    .bind(schedule_id)
    .fetch_optional(&app_state.db)
    .await
    {
        Ok(Some(schedule)) => schedule,
        Ok(None) => {
            return HttpResponse::NotFound().json(json!({ "error": "Schedule not found" }));
        }
        Err(e) => {
            error!("Database error: {}", e);
            return HttpResponse::InternalServerError()
                .json(json!({ "error": "Internal server error" }));
        }
    };

    let day_of_week = body.day_of_week.unwrap_or(existing.day_of_week);
    if !(0..=6).contains(&day_of_week) {
        return HttpResponse::BadRequest().json(json!({
            "error": "InvalidFormat",
            "message": "day_of_week must be between 0 (Sunday) and 6 (Saturday)",
        }));
    }

    let start = match &body.start_time {
        Some(raw) => match parse_time(raw) {
            Ok(time) => time,
            Err(e) => {
                return HttpResponse::BadRequest().json(json!({
                    "error": "InvalidFormat",
                    "message": e.message(),
                }));
            }
        },
        None => existing.start_time,
    };
    let end = match &body.end_time {
        Some(raw) => match parse_time(raw) {
            Ok(time) => time,
            Err(e) => {
                return HttpResponse::BadRequest().json(json!({
                    "error": "InvalidFormat",
                    "message": e.message(),
                }));
            }
        },
        None => existing.end_time,
    };

    if end <= start {
        return HttpResponse::BadRequest().json(json!({
            "error": "InvalidTimeRange",
            "message": "End time must be after start time",
        }));
    }

    match sqlx::query_as::<_, ClassSchedule>(&format!(
        "UPDATE class_schedules
         SET day_of_week = $1, start_time = $2, end_time = $3, teacher_id = $4,
             is_active = $5, note = COALESCE($6, note)
         WHERE id = $7
         RETURNING {}",
        SCHEDULE_COLUMNS
    ))
    .bind(day_of_week)
    .bind(start)
    .bind(end)
    .bind(body.teacher_id.unwrap_or(existing.teacher_id))
    .bind(body.is_active.unwrap_or(existing.is_active))
    .bind(&body.note)
    .bind(schedule_id)
    .fetch_one(&app_state.db)
    .await
    {
        Ok(schedule) => HttpResponse::Ok().json(schedule),
        Err(e) if is_unique_violation(&e) => HttpResponse::Conflict().json(json!({
            "error": "DuplicateSchedule",
            "message": "This class already has a schedule at that weekday and start time",
        })),
        Err(e) => {
            error!("Failed to update schedule: {}", e);
            HttpResponse::InternalServerError()
                .json(json!({ "error": "Failed to update schedule" }))
        }
    }
}

#[delete("/{schedule_id}")]
async fn delete_schedule(
    app_state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<i32>,
) -> impl Responder {
    if let Err(response) = authorize(&req, &app_state, Operation::ManageSchedules) {
        return response;
    }

    match sqlx::query("DELETE FROM class_schedules WHERE id = $1")
        .bind(path.into_inner())
        .execute(&app_state.db)
        .await
    {
        Ok(result) if result.rows_affected() > 0 => {
            HttpResponse::Ok().json(json!({ "message": "Schedule deleted" }))
        }
        Ok(_) => HttpResponse::NotFound().json(json!({ "error": "Schedule not found" })),
        Err(e) => {
            error!("Failed to delete schedule: {}", e);
            HttpResponse::InternalServerError()
                .json(json!({ "error": "Failed to delete schedule" }))
        }
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/class-schedules")
            .service(list_schedules)
            .service(create_schedule)
            .service(update_schedule)
            .service(delete_schedule),
    );
}
