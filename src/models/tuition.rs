use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(sqlx::Type, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "tuition_status", rename_all = "snake_case")]
pub enum TuitionStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Serialize, Deserialize, Debug, Clone, FromRow)]
pub struct TuitionPayment {
    pub id: i32,
    pub student_id: i32,
    pub sessions_purchased: i32,
    pub amount: i64,
    pub note: Option<String>,
    pub status: TuitionStatus,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub decided_by_user_id: Option<i32>,
}
