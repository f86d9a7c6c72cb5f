use chrono::{NaiveDate, NaiveTime};
use serde::Serialize;
use sqlx::{FromRow, PgExecutor};

/// Half-open interval intersection: touching endpoints do not conflict, so a
/// 10:00-11:00 session coexists with an 11:00-12:00 one.
pub fn ranges_overlap(
    a_start: NaiveTime,
    a_end: NaiveTime,
    b_start: NaiveTime,
    b_end: NaiveTime,
) -> bool {
    a_start < b_end && a_end > b_start
}

/// True when the write failed on a unique constraint, so the storage layer
/// stays authoritative for duplicates even when two requests race past the
/// advisory checks.
pub fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

/// True when the write failed on a foreign key, which means a referenced row
/// (class, teacher, student) does not exist.
pub fn is_foreign_key_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|db| db.is_foreign_key_violation())
        .unwrap_or(false)
}

/// Conflict detail returned to the client alongside 409 responses.
#[derive(Serialize, Debug, Clone, FromRow)]
pub struct ConflictingSession {
    pub id: i32,
    pub class_id: i32,
    pub class_name: String,
    pub session_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub teacher_id: Option<i32>,
    pub teacher_name: Option<String>,
}

/// Exact (class, date, start, end) duplicate, excluding `exclude_session_id`
/// so a session being edited does not collide with itself.
pub async fn find_class_duplicate<'e>(
    db: impl PgExecutor<'e>,
    class_id: i32,
    date: NaiveDate,
    start: NaiveTime,
    end: NaiveTime,
    exclude_session_id: Option<i32>,
) -> Result<Option<ConflictingSession>, sqlx::Error> {
    sqlx::query_as::<_, ConflictingSession>(
        "SELECT cs.id, cs.class_id, c.name AS class_name, cs.session_date,
                cs.start_time, cs.end_time, cs.teacher_id, t.full_name AS teacher_name
         FROM class_sessions cs
         JOIN classes c ON c.id = cs.class_id
         LEFT JOIN teachers t ON t.user_id = cs.teacher_id
         WHERE cs.class_id = $1 AND cs.session_date = $2
           AND cs.start_time = $3 AND cs.end_time = $4
           AND ($5::int IS NULL OR cs.id <> $5)
         ORDER BY cs.start_time
         LIMIT 1",
    )
    .bind(class_id)
    .bind(date)
    .bind(start)
    .bind(end)
    .bind(exclude_session_id)
    .fetch_optional(db)
    .await
}

/// Any session for the teacher on that date whose time range intersects the
/// given one. When several overlap, the earliest-starting one is reported.
pub async fn find_teacher_overlap<'e>(
    db: impl PgExecutor<'e>,
    teacher_id: i32,
    date: NaiveDate,
    start: NaiveTime,
    end: NaiveTime,
    exclude_session_id: Option<i32>,
) -> Result<Option<ConflictingSession>, sqlx::Error> {
    sqlx::query_as::<_, ConflictingSession>(
        "SELECT cs.id, cs.class_id, c.name AS class_name, cs.session_date,
                cs.start_time, cs.end_time, cs.teacher_id, t.full_name AS teacher_name
         FROM class_sessions cs
         JOIN classes c ON c.id = cs.class_id
         LEFT JOIN teachers t ON t.user_id = cs.teacher_id
         WHERE cs.teacher_id = $1 AND cs.session_date = $2
           AND cs.start_time < $4 AND cs.end_time > $3
           AND ($5::int IS NULL OR cs.id <> $5)
         ORDER BY cs.start_time
         LIMIT 1",
    )
    .bind(teacher_id)
    .bind(date)
    .bind(start)
    .bind(end)
    .bind(exclude_session_id)
    .fetch_optional(db)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn touching_endpoints_do_not_overlap() {
        assert!(!ranges_overlap(t(10, 0), t(11, 0), t(11, 0), t(12, 0)));
        assert!(!ranges_overlap(t(11, 0), t(12, 0), t(10, 0), t(11, 0)));
    }

    #[test]
    fn partial_overlap_is_detected_both_ways() {
        assert!(ranges_overlap(t(10, 0), t(11, 0), t(10, 30), t(11, 30)));
        assert!(ranges_overlap(t(10, 30), t(11, 30), t(10, 0), t(11, 0)));
    }

    #[test]
    fn containment_overlaps() {
        assert!(ranges_overlap(t(9, 0), t(12, 0), t(10, 0), t(11, 0)));
        assert!(ranges_overlap(t(10, 0), t(11, 0), t(9, 0), t(12, 0)));
    }

    #[test]
    fn disjoint_ranges_do_not_overlap() {
        assert!(!ranges_overlap(t(8, 0), t(9, 0), t(10, 0), t(11, 0)));
    }

    #[test]
    fn identical_ranges_overlap() {
        assert!(ranges_overlap(t(10, 0), t(11, 0), t(10, 0), t(11, 0)));
    }

    #[derive(Debug)]
    struct FakeDbError(sqlx::error::ErrorKind);

    impl std::fmt::Display for FakeDbError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "fake database error")
        }
    }

    impl std::error::Error for FakeDbError {}

    impl sqlx::error::DatabaseError for FakeDbError {
        fn message(&self) -> &str {
            "fake database error"
        }

        fn kind(&self) -> sqlx::error::ErrorKind {
            match self.0 {
                sqlx::error::ErrorKind::UniqueViolation => sqlx::error::ErrorKind::UniqueViolation,
                sqlx::error::ErrorKind::ForeignKeyViolation => {
                    sqlx::error::ErrorKind::ForeignKeyViolation
                }
                _ => sqlx::error::ErrorKind::Other,
            }
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }
    }

    fn db_error(kind: sqlx::error::ErrorKind) -> sqlx::Error {
        sqlx::Error::Database(Box::new(FakeDbError(kind)))
    }

    #[test]
    fn constraint_classifiers_match_their_own_kind_only() {
        let unique = db_error(sqlx::error::ErrorKind::UniqueViolation);
        let foreign = db_error(sqlx::error::ErrorKind::ForeignKeyViolation);
        let other = db_error(sqlx::error::ErrorKind::Other);

        assert!(is_unique_violation(&unique));
        assert!(!is_unique_violation(&foreign));
        assert!(!is_unique_violation(&other));

        assert!(is_foreign_key_violation(&foreign));
        assert!(!is_foreign_key_violation(&unique));
        assert!(!is_foreign_key_violation(&other));

        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
        assert!(!is_foreign_key_violation(&sqlx::Error::RowNotFound));
    }
}
