use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(sqlx::Type, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "session_status", rename_all = "snake_case")]
pub enum SessionStatus {
    Planned,
    Completed,
    Cancelled,
    NoShow,
    Rescheduled,
}

/// A concrete class meeting on a specific date.
#[derive(Serialize, Deserialize, Debug, Clone, FromRow)]
pub struct ClassSession {
    pub id: i32,
    pub class_id: i32,
    pub session_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub teacher_id: Option<i32>,
    pub status: SessionStatus,
    pub is_auto_generated: bool,
    pub note: Option<String>,
    pub accounting_applied: bool,
    pub accounting_applied_at: Option<DateTime<Utc>>,
}

/// Weekly recurring template slot. `day_of_week` uses 0 = Sunday .. 6 = Saturday,
/// matching `Weekday::num_days_from_sunday`.
#[derive(Serialize, Deserialize, Debug, Clone, FromRow)]
pub struct ClassSchedule {
    pub id: i32,
    pub class_id: i32,
    pub day_of_week: i16,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub teacher_id: i32,
    pub is_active: bool,
    pub note: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, FromRow)]
pub struct AttendanceRecord {
    pub session_id: i32,
    pub student_id: i32,
    pub is_present: bool,
    pub note: Option<String>,
    pub taken_at: DateTime<Utc>,
    pub taken_by_user_id: i32,
}
