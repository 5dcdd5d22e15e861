use anyhow::Result;
use chrono::Duration;
use routinely_lib::performance;
use routinely_lib::session::{self, SessionCompletion, SessionCreate, TaskCompletionInput};
use routinely_lib::ErrorKind;
#[path = "util.rs"]
mod util;

use util::{harness, start_instant, Harness, CHILD_A, CHILD_B};

/// Runs one session on day `day` (offset from the harness start) that takes
/// `minutes` from first tick to completion.
async fn run_day(h: &Harness, routine_id: &str, task_id: &str, day: i64, minutes: i64) -> Result<()> {
    h.clock.set(start_instant() + Duration::days(day));
    let kid = h.child(CHILD_A);
    let created = session::create_session(
        &h.state,
        &kid,
        SessionCreate {
            routine_id: routine_id.to_string(),
            child_profile_id: CHILD_A.to_string(),
            session_date: None,
            auto_start_timer: false,
        },
    )
    .await?;
    session::complete_task(
        &h.state,
        &kid,
        &created.id,
        TaskCompletionInput {
            task_id: task_id.to_string(),
            completed_at: None,
            notes: None,
        },
    )
    .await?;
    h.advance_minutes(minutes);
    session::complete_session(&h.state, &kid, &created.id, SessionCompletion::default()).await?;
    Ok(())
}

#[tokio::test]
async fn streak_grows_on_consecutive_days_and_resets_after_a_gap() -> Result<()> {
    let h = harness().await?;
    let (routine, tasks) = h
        .routine_with_tasks("streak", CHILD_A, &[4], None, None)
        .await?;
    let task = &tasks[0].id;

    let expected = [(0, 10, 1), (1, 5, 2), (2, 8, 3), (4, 7, 1)];
    for (day, minutes, streak) in expected {
        run_day(&h, &routine.id, task, day, minutes).await?;
        let stats =
            performance::list_performance(&h.state, &h.child(CHILD_A), CHILD_A, Some(&routine.id))
                .await?;
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].streak_days, streak, "day {day}");
    }

    let stats = performance::list_performance(&h.state, &h.parent(), CHILD_A, None).await?;
    assert_eq!(stats[0].best_duration_seconds, Some(5 * 60));
    assert_eq!(
        stats[0].last_completed_at,
        Some(start_instant() + Duration::days(4) + Duration::minutes(7))
    );
    assert_ne!(stats[0].best_session_id, stats[0].last_completed_session_id);
    Ok(())
}

#[tokio::test]
async fn stats_are_private_to_the_child_and_guardians() -> Result<()> {
    let h = harness().await?;
    let (routine, tasks) = h
        .routine_with_tasks("private", CHILD_A, &[1], None, None)
        .await?;
    run_day(&h, &routine.id, &tasks[0].id, 0, 3).await?;

    let own = performance::list_performance(&h.state, &h.child(CHILD_A), CHILD_A, None).await?;
    assert_eq!(own.len(), 1);
    let err = performance::list_performance(&h.state, &h.child(CHILD_B), CHILD_A, None)
        .await
        .expect_err("siblings cannot read stats");
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    let err = performance::list_performance(&h.state, &h.outsider(), CHILD_A, None)
        .await
        .expect_err("other family");
    assert!(matches!(err.kind(), ErrorKind::Forbidden | ErrorKind::NotFound));

    let none = performance::list_performance(&h.state, &h.parent(), CHILD_B, None).await?;
    assert!(none.is_empty());
    Ok(())
}
