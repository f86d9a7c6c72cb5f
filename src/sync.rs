use chrono::{Datelike, Duration, NaiveDate, NaiveTime};
use log::error;
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use std::collections::HashSet;

use crate::conflicts::find_teacher_overlap;
use crate::models::session::ClassSchedule;

#[derive(Serialize, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub created: i32,
    pub updated: i32,
    pub deleted: i32,
    pub skipped_teacher_conflicts: i32,
}

/// One session the weekly template wants to exist in the target month.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub teacher_id: i32,
}

pub fn month_bounds(year: i32, month: u32) -> Option<(NaiveDate, NaiveDate)> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    Some((first, next))
}

/// Expand active weekly schedule slots into the concrete dates of one month.
/// Inactive slots contribute nothing.
pub fn expand_month(schedules: &[ClassSchedule], year: i32, month: u32) -> Vec<Candidate> {
    let Some((first, next)) = month_bounds(year, month) else {
        return Vec::new();
    };

    let mut candidates = Vec::new();
    let mut date = first;
    while date < next {
        let weekday = date.weekday().num_days_from_sunday() as i16;
        for schedule in schedules.iter().filter(|s| s.is_active) {
            if schedule.day_of_week == weekday {
                candidates.push(Candidate {
                    date,
                    start_time: schedule.start_time,
                    end_time: schedule.end_time,
                    teacher_id: schedule.teacher_id,
                });
            }
        }
        date = date + Duration::days(1);
    }
    candidates
}

#[derive(Debug, FromRow)]
struct ExistingSession {
    id: i32,
    session_date: NaiveDate,
    start_time: NaiveTime,
    end_time: NaiveTime,
    teacher_id: Option<i32>,
    is_auto_generated: bool,
    has_attendance: bool,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct SyncPlan {
    /// Auto-generated, attendance-free rows no active slot wants anymore.
    delete_ids: Vec<i32>,
    /// Auto-generated, attendance-free rows whose slot now belongs to a
    /// different teacher: (session id, new teacher id).
    reassignments: Vec<(i32, i32)>,
    /// Wanted slots with no existing row; created unless the teacher has an
    /// overlap elsewhere.
    missing: Vec<Candidate>,
}

/// Decide what the month needs without touching the database. Manually edited
/// rows and rows with recorded attendance are never deleted or reassigned;
/// they only suppress creation of their own slot.
fn plan_month(candidates: &[Candidate], existing: &[ExistingSession]) -> SyncPlan {
    let wanted: HashSet<(NaiveDate, NaiveTime, NaiveTime)> = candidates
        .iter()
        .map(|c| (c.date, c.start_time, c.end_time))
        .collect();

    let delete_ids = existing
        .iter()
        .filter(|s| {
            s.is_auto_generated
                && !s.has_attendance
                && !wanted.contains(&(s.session_date, s.start_time, s.end_time))
        })
        .map(|s| s.id)
        .collect();

    let mut reassignments = Vec::new();
    let mut missing = Vec::new();

    for candidate in candidates {
        let matched = existing.iter().find(|s| {
            s.session_date == candidate.date
                && s.start_time == candidate.start_time
                && s.end_time == candidate.end_time
        });

        match matched {
            Some(session) => {
                if session.is_auto_generated
                    && !session.has_attendance
                    && session.teacher_id != Some(candidate.teacher_id)
                {
                    reassignments.push((session.id, candidate.teacher_id));
                }
            }
            None => missing.push(candidate.clone()),
        }
    }

    SyncPlan {
        delete_ids,
        reassignments,
        missing,
    }
}

/// Reconcile a class's sessions for one month against its weekly template:
/// create missing slots, update drifted auto-generated ones, delete orphaned
/// auto-generated ones. Manually edited sessions are never touched. Candidates
/// whose teacher already has an overlapping session elsewhere are skipped and
/// counted, never created. Runs in a single transaction and is idempotent, so
/// an admin rerun after a failure is safe.
pub async fn sync_month(
    db: &PgPool,
    class_id: i32,
    year: i32,
    month: u32,
) -> Result<SyncReport, sqlx::Error> {
    let (first, next) = month_bounds(year, month).ok_or_else(|| {
        sqlx::Error::Protocol(format!("invalid target month {}-{}", year, month))
    })?;

    let schedules = sqlx::query_as::<_, ClassSchedule>(
        "SELECT id, class_id, day_of_week, start_time, end_time, teacher_id, is_active, note
         FROM class_schedules
         WHERE class_id = $1 AND is_active",
    )
    .bind(class_id)
    .fetch_all(db)
    .await?;

    let candidates = expand_month(&schedules, year, month);

    let mut tx = db.begin().await?;

    let existing = sqlx::query_as::<_, ExistingSession>(
        "SELECT cs.id, cs.session_date, cs.start_time, cs.end_time, cs.teacher_id,
                cs.is_auto_generated,
                EXISTS(SELECT 1 FROM attendance a WHERE a.session_id = cs.id) AS has_attendance
         FROM class_sessions cs
         WHERE cs.class_id = $1 AND cs.session_date >= $2 AND cs.session_date < $3",
    )
    .bind(class_id)
    .bind(first)
    .bind(next)
    .fetch_all(&mut *tx)
    .await?;

    let plan = plan_month(&candidates, &existing);
    let mut report = SyncReport::default();

    // Orphans go first: when a slot moved, its stale rows must be gone before
    // the overlap check for the replacement slot, or the class would collide
    // with its own leftovers.
    for session_id in &plan.delete_ids {
        sqlx::query("DELETE FROM class_sessions WHERE id = $1")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        report.deleted += 1;
    }

    for (session_id, teacher_id) in &plan.reassignments {
        sqlx::query("UPDATE class_sessions SET teacher_id = $1 WHERE id = $2")
            .bind(teacher_id)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        report.updated += 1;
    }

    for candidate in &plan.missing {
        let overlap = find_teacher_overlap(
            &mut *tx,
            candidate.teacher_id,
            candidate.date,
            candidate.start_time,
            candidate.end_time,
            None,
        )
        .await?;

        if overlap.is_some() {
            report.skipped_teacher_conflicts += 1;
            continue;
        }

        sqlx::query(
            "INSERT INTO class_sessions
                 (class_id, session_date, start_time, end_time, teacher_id,
                  status, is_auto_generated)
             VALUES ($1, $2, $3, $4, $5, 'planned', TRUE)",
        )
        .bind(class_id)
        .bind(candidate.date)
        .bind(candidate.start_time)
        .bind(candidate.end_time)
        .bind(candidate.teacher_id)
        .execute(&mut *tx)
        .await?;
        report.created += 1;
    }

    if let Err(e) = tx.commit().await {
        error!("Failed to commit month sync for class {}: {}", class_id, e);
        return Err(e);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn schedule(day_of_week: i16, start: NaiveTime, end: NaiveTime, teacher_id: i32) -> ClassSchedule {
        ClassSchedule {
            id: 0,
            class_id: 1,
            day_of_week,
            start_time: start,
            end_time: end,
            teacher_id,
            is_active: true,
            note: None,
        }
    }

    fn auto_row(id: i32, date: NaiveDate, start: NaiveTime, end: NaiveTime, teacher_id: i32) -> ExistingSession {
        ExistingSession {
            id,
            session_date: date,
            start_time: start,
            end_time: end,
            teacher_id: Some(teacher_id),
            is_auto_generated: true,
            has_attendance: false,
        }
    }

    #[test]
    fn march_2025_has_five_mondays() {
        let schedules = vec![schedule(1, t(9, 0), t(10, 0), 7)];
        let candidates = expand_month(&schedules, 2025, 3);
        assert_eq!(candidates.len(), 5);
        let expected = [3, 10, 17, 24, 31];
        for (candidate, day) in candidates.iter().zip(expected) {
            assert_eq!(candidate.date, NaiveDate::from_ymd_opt(2025, 3, day).unwrap());
            assert_eq!(candidate.start_time, t(9, 0));
            assert_eq!(candidate.end_time, t(10, 0));
            assert_eq!(candidate.teacher_id, 7);
        }
    }

    #[test]
    fn inactive_schedules_produce_nothing() {
        let mut s = schedule(1, t(9, 0), t(10, 0), 7);
        s.is_active = false;
        assert!(expand_month(&[s], 2025, 3).is_empty());
    }

    #[test]
    fn two_slots_on_the_same_weekday_both_expand() {
        let schedules = vec![
            schedule(2, t(9, 0), t(10, 0), 7),
            schedule(2, t(14, 0), t(15, 30), 8),
        ];
        let candidates = expand_month(&schedules, 2025, 3);
        // March 2025 has four Tuesdays.
        assert_eq!(candidates.len(), 8);
        assert!(candidates.iter().all(|c| c.date.weekday().num_days_from_sunday() == 2));
    }

    #[test]
    fn sunday_is_day_zero() {
        let schedules = vec![schedule(0, t(8, 0), t(9, 0), 7)];
        let candidates = expand_month(&schedules, 2025, 3);
        // March 2025 starts on a Saturday; Sundays are the 2nd, 9th, ...
        assert_eq!(candidates[0].date, NaiveDate::from_ymd_opt(2025, 3, 2).unwrap());
        assert_eq!(candidates.len(), 5);
    }

    #[test]
    fn december_rolls_to_january() {
        let (first, next) = month_bounds(2025, 12).unwrap();
        assert_eq!(first, NaiveDate::from_ymd_opt(2025, 12, 1).unwrap());
        assert_eq!(next, NaiveDate::from_ymd_opt(2026, 1, 1).unwrap());
    }

    #[test]
    fn invalid_month_yields_no_candidates() {
        let schedules = vec![schedule(1, t(9, 0), t(10, 0), 7)];
        assert!(expand_month(&schedules, 2025, 13).is_empty());
    }

    #[test]
    fn moved_slot_is_replaced_not_skipped() {
        // The class's only slot moved from 09:00-10:00 to 09:30-10:30 with
        // the same teacher. Every old row must be planned for deletion and
        // every new slot for creation; the stale rows must not survive to
        // collide with their replacements.
        let schedules = vec![schedule(1, t(9, 30), t(10, 30), 7)];
        let candidates = expand_month(&schedules, 2025, 3);

        let old_rows: Vec<ExistingSession> = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| auto_row(i as i32 + 1, c.date, t(9, 0), t(10, 0), 7))
            .collect();

        let plan = plan_month(&candidates, &old_rows);
        assert_eq!(plan.delete_ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(plan.missing, candidates);
        assert!(plan.reassignments.is_empty());
    }

    #[test]
    fn manual_edits_are_sticky() {
        let schedules = vec![schedule(1, t(9, 0), t(10, 0), 7)];
        let candidates = expand_month(&schedules, 2025, 3);
        let monday = candidates[0].date;

        // Matched slot, manually edited, drifted teacher: left alone.
        let mut edited = auto_row(1, monday, t(9, 0), t(10, 0), 4);
        edited.is_auto_generated = false;
        // Unmatched manual row: never deleted.
        let mut extra = auto_row(2, monday, t(16, 0), t(17, 0), 7);
        extra.is_auto_generated = false;

        let plan = plan_month(&candidates, &[edited, extra]);
        assert!(plan.reassignments.is_empty());
        assert!(plan.delete_ids.is_empty());
        // The remaining Mondays still need their sessions.
        assert_eq!(plan.missing.len(), candidates.len() - 1);
    }

    #[test]
    fn attendance_pins_auto_rows() {
        let schedules = vec![schedule(1, t(9, 0), t(10, 0), 7)];
        let candidates = expand_month(&schedules, 2025, 3);
        let monday = candidates[0].date;

        let mut matched = auto_row(1, monday, t(9, 0), t(10, 0), 4);
        matched.has_attendance = true;
        let mut orphan = auto_row(2, monday, t(16, 0), t(17, 0), 7);
        orphan.has_attendance = true;

        let plan = plan_month(&candidates, &[matched, orphan]);
        assert!(plan.reassignments.is_empty());
        assert!(plan.delete_ids.is_empty());
    }

    #[test]
    fn teacher_drift_on_auto_row_is_reassigned() {
        let schedules = vec![schedule(1, t(9, 0), t(10, 0), 7)];
        let candidates = expand_month(&schedules, 2025, 3);
        let rows: Vec<ExistingSession> = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| auto_row(i as i32 + 1, c.date, c.start_time, c.end_time, 4))
            .collect();

        let plan = plan_month(&candidates, &rows);
        assert_eq!(plan.reassignments, vec![(1, 7), (2, 7), (3, 7), (4, 7), (5, 7)]);
        assert!(plan.delete_ids.is_empty());
        assert!(plan.missing.is_empty());
    }

    #[test]
    fn replan_after_a_clean_sync_is_empty() {
        let schedules = vec![schedule(1, t(9, 0), t(10, 0), 7)];
        let candidates = expand_month(&schedules, 2025, 3);
        // What the month looks like right after a successful sync.
        let rows: Vec<ExistingSession> = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| auto_row(i as i32 + 1, c.date, c.start_time, c.end_time, c.teacher_id))
            .collect();

        let plan = plan_month(&candidates, &rows);
        assert_eq!(plan, SyncPlan::default());
    }
}
