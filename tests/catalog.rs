use anyhow::Result;
use routinely_lib::catalog::{
    self, PositionUpdate, RoutineCreate, RoutineListQuery, RoutineType, RoutineUpdate, TaskCreate,
    TaskGroupUpdate, TaskListQuery, TaskUpdate,
};
use routinely_lib::ErrorKind;
use serde_json::json;
#[path = "util.rs"]
mod util;

use util::{harness, CHILD_A, CHILD_B, OUTSIDER};

fn morning(slug: &str) -> RoutineCreate {
    RoutineCreate {
        name: "Morning".into(),
        slug: slug.into(),
        routine_type: Some(RoutineType::Morning),
        start_time: Some("06:00".into()),
        end_time: Some("08:30".into()),
        auto_close_after_minutes: Some(45),
        settings: None,
    }
}

fn task(name: &str, points: i64) -> TaskCreate {
    TaskCreate {
        name: name.into(),
        points: Some(points),
        ..Default::default()
    }
}

#[tokio::test]
async fn routine_crud_round_trip() -> Result<()> {
    let h = harness().await?;
    let ctx = h.parent();
    let created = catalog::create_routine(&h.state, &ctx, morning("morning")).await?;
    assert!(created.is_active);
    assert_eq!(created.auto_close_after_minutes, Some(45));
    assert_eq!(created.settings, json!({}));

    let updated = catalog::update_routine(
        &h.state,
        &ctx,
        &created.id,
        RoutineUpdate {
            name: Some("Early morning".into()),
            end_time: Some(None),
            settings: Some(json!({ "bonusMultiplier": 1.5 })),
            ..Default::default()
        },
    )
    .await?;
    assert_eq!(updated.name, "Early morning");
    assert!(updated.end_time.is_none());
    assert_eq!(updated.bonus_multiplier(), 1.5);

    let fetched = catalog::get_routine(&h.state, &h.child(CHILD_A), &created.id).await?;
    assert_eq!(fetched, updated);

    catalog::archive_routine(&h.state, &ctx, &created.id).await?;
    let err = catalog::get_routine(&h.state, &ctx, &created.id)
        .await
        .expect_err("archived routines are hidden");
    assert_eq!(err.kind(), ErrorKind::NotFound);
    Ok(())
}

#[tokio::test]
async fn routine_validation_and_slug_conflicts() -> Result<()> {
    let h = harness().await?;
    let ctx = h.parent();

    let mut inverted = morning("inverted");
    inverted.start_time = Some("09:00".into());
    inverted.end_time = Some("08:00".into());
    let err = catalog::create_routine(&h.state, &ctx, inverted)
        .await
        .expect_err("window must be ordered");
    assert_eq!(err.kind(), ErrorKind::Validation);

    let mut bad_time = morning("bad-time");
    bad_time.start_time = Some("7am".into());
    let err = catalog::create_routine(&h.state, &ctx, bad_time)
        .await
        .expect_err("time format");
    assert_eq!(err.kind(), ErrorKind::Validation);

    let mut no_type = morning("no-type");
    no_type.routine_type = None;
    assert_eq!(
        catalog::create_routine(&h.state, &ctx, no_type)
            .await
            .expect_err("type is required")
            .kind(),
        ErrorKind::Validation
    );

    catalog::create_routine(&h.state, &ctx, morning("taken")).await?;
    let err = catalog::create_routine(&h.state, &ctx, morning("taken"))
        .await
        .expect_err("duplicate slug");
    assert_eq!(err.code(), "CONFLICT/SLUG_TAKEN");

    let err = catalog::create_routine(&h.state, &h.child(CHILD_A), morning("kid"))
        .await
        .expect_err("children cannot author routines");
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    let err = catalog::update_routine(&h.state, &ctx, "missing", RoutineUpdate::default())
        .await
        .expect_err("empty update");
    assert_eq!(err.kind(), ErrorKind::Validation);
    Ok(())
}

#[tokio::test]
async fn list_routines_filters_archived_and_type() -> Result<()> {
    let h = harness().await?;
    let ctx = h.parent();
    let first = catalog::create_routine(&h.state, &ctx, morning("one")).await?;
    let mut evening = morning("two");
    evening.routine_type = Some(RoutineType::Evening);
    evening.start_time = None;
    evening.end_time = None;
    catalog::create_routine(&h.state, &ctx, evening).await?;
    catalog::archive_routine(&h.state, &ctx, &first.id).await?;

    let live = catalog::list_routines(&h.state, &ctx, RoutineListQuery::default()).await?;
    assert_eq!(live.total, 1);
    assert_eq!(live.items[0].routine_type, RoutineType::Evening);

    let all = catalog::list_routines(
        &h.state,
        &ctx,
        RoutineListQuery {
            include_deleted: true,
            ..Default::default()
        },
    )
    .await?;
    assert_eq!(all.total, 2);

    let mornings = catalog::list_routines(
        &h.state,
        &ctx,
        RoutineListQuery {
            routine_type: Some(RoutineType::Morning),
            ..Default::default()
        },
    )
    .await?;
    assert_eq!(mornings.total, 0);

    let err = catalog::list_routines(
        &h.state,
        &h.child(CHILD_A),
        RoutineListQuery {
            include_deleted: true,
            ..Default::default()
        },
    )
    .await
    .expect_err("archived listing is guardian only");
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    let foreign = catalog::list_routines(&h.state, &h.outsider(), RoutineListQuery::default()).await?;
    assert_eq!(foreign.total, 0);
    Ok(())
}

#[tokio::test]
async fn assignments_gate_task_creation() -> Result<()> {
    let h = harness().await?;
    let ctx = h.parent();
    let routine = catalog::create_routine(&h.state, &ctx, morning("gate")).await?;

    let err = catalog::create_task(&h.state, &ctx, &routine.id, CHILD_A, task("Brush teeth", 5))
        .await
        .expect_err("unassigned child");
    assert_eq!(err.kind(), ErrorKind::UnassignedChild);

    catalog::assign_child(&h.state, &ctx, &routine.id, CHILD_A, 1, false).await?;
    let err = catalog::create_task(&h.state, &ctx, &routine.id, CHILD_A, task("Brush teeth", 5))
        .await
        .expect_err("disabled assignment");
    assert_eq!(err.kind(), ErrorKind::UnassignedChild);

    let enabled = catalog::assign_child(&h.state, &ctx, &routine.id, CHILD_A, 1, true).await?;
    assert!(enabled.is_enabled);
    let created =
        catalog::create_task(&h.state, &ctx, &routine.id, CHILD_A, task("Brush teeth", 5)).await?;
    assert_eq!(created.position, 1);
    let second = catalog::create_task(&h.state, &ctx, &routine.id, CHILD_A, task("Dress", 0)).await?;
    assert_eq!(second.position, 2);

    let err = catalog::assign_child(&h.state, &ctx, &routine.id, OUTSIDER, 2, true)
        .await
        .expect_err("outsider is not family");
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    let err = catalog::assign_child(&h.state, &ctx, &routine.id, CHILD_B, 1, true)
        .await
        .expect_err("position already held");
    assert_eq!(err.code(), "CONFLICT/POSITION_TAKEN");
    Ok(())
}

#[tokio::test]
async fn unassign_archives_the_child_copy() -> Result<()> {
    let h = harness().await?;
    let ctx = h.parent();
    let (routine, _) = h
        .routine_with_tasks("unassign", CHILD_A, &[3, 4], None, None)
        .await?;

    catalog::unassign_child(&h.state, &ctx, &routine.id, CHILD_A).await?;
    let remaining = catalog::list_tasks(&h.state, &ctx, &routine.id, CHILD_A, TaskListQuery::default()).await?;
    assert!(remaining.is_empty());
    assert!(catalog::list_children(&h.state, &ctx, &routine.id).await?.is_empty());

    let err = catalog::unassign_child(&h.state, &ctx, &routine.id, CHILD_A)
        .await
        .expect_err("already unassigned");
    assert_eq!(err.kind(), ErrorKind::UnassignedChild);

    let revived = catalog::assign_child(&h.state, &ctx, &routine.id, CHILD_A, 3, true).await?;
    assert!(revived.deleted_at.is_none());
    assert_eq!(revived.position, 3);
    Ok(())
}

#[tokio::test]
async fn reorder_tasks_swaps_positions_atomically() -> Result<()> {
    let h = harness().await?;
    let ctx = h.parent();
    let (routine, tasks) = h
        .routine_with_tasks("swap", CHILD_A, &[1, 2, 3], None, None)
        .await?;

    let reordered = catalog::reorder_tasks(
        &h.state,
        &ctx,
        &routine.id,
        CHILD_A,
        vec![
            PositionUpdate::new(&tasks[0].id, 3),
            PositionUpdate::new(&tasks[2].id, 1),
        ],
    )
    .await?;
    let order: Vec<(&str, i64)> = reordered
        .iter()
        .map(|t| (t.name.as_str(), t.position))
        .collect();
    assert_eq!(order, vec![("task 3", 1), ("task 2", 2), ("task 1", 3)]);

    let err = catalog::reorder_tasks(
        &h.state,
        &ctx,
        &routine.id,
        CHILD_A,
        vec![
            PositionUpdate::new(&tasks[0].id, 2),
            PositionUpdate::new(&tasks[1].id, 2),
        ],
    )
    .await
    .expect_err("duplicate target position");
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = catalog::reorder_tasks(
        &h.state,
        &ctx,
        &routine.id,
        CHILD_A,
        vec![PositionUpdate::new("nope", 1)],
    )
    .await
    .expect_err("unknown id");
    assert_eq!(err.kind(), ErrorKind::NotFound);

    // Nothing moved after the failed attempts.
    let current = catalog::list_tasks(&h.state, &ctx, &routine.id, CHILD_A, TaskListQuery::default()).await?;
    assert_eq!(current[0].name, "task 3");
    Ok(())
}

#[tokio::test]
async fn update_and_archive_single_task() -> Result<()> {
    let h = harness().await?;
    let ctx = h.parent();
    let (routine, tasks) = h
        .routine_with_tasks("edit", CHILD_A, &[2, 4], None, None)
        .await?;

    let updated = catalog::update_task(
        &h.state,
        &ctx,
        &tasks[0].id,
        TaskUpdate {
            points: Some(6),
            is_optional: Some(true),
            description: Some(Some("before breakfast".into())),
            ..Default::default()
        },
    )
    .await?;
    assert_eq!(updated.points, 6);
    assert!(updated.is_optional);
    assert_eq!(updated.description.as_deref(), Some("before breakfast"));

    let err = catalog::update_task(
        &h.state,
        &ctx,
        &tasks[0].id,
        TaskUpdate {
            points: Some(-1),
            ..Default::default()
        },
    )
    .await
    .expect_err("negative points");
    assert_eq!(err.kind(), ErrorKind::Validation);

    catalog::archive_task(&h.state, &ctx, &tasks[1].id).await?;
    let live = catalog::list_tasks(&h.state, &ctx, &routine.id, CHILD_A, TaskListQuery::default()).await?;
    assert_eq!(live.len(), 1);
    let everything = catalog::list_tasks(
        &h.state,
        &ctx,
        &routine.id,
        CHILD_A,
        TaskListQuery {
            include_inactive: true,
            ..Default::default()
        },
    )
    .await?;
    assert_eq!(everything.len(), 2);
    Ok(())
}

#[tokio::test]
async fn grouped_tasks_fan_out_to_enabled_children() -> Result<()> {
    let h = harness().await?;
    let ctx = h.parent();
    let routine = catalog::create_routine(&h.state, &ctx, morning("group")).await?;
    catalog::assign_child(&h.state, &ctx, &routine.id, CHILD_A, 1, true).await?;
    catalog::assign_child(&h.state, &ctx, &routine.id, CHILD_B, 2, true).await?;
    catalog::create_task(&h.state, &ctx, &routine.id, CHILD_A, task("Feed fish", 1)).await?;

    let copies = catalog::create_task_for_all_children(
        &h.state,
        &ctx,
        &routine.id,
        TaskCreate {
            name: "Make bed".into(),
            ..Default::default()
        },
    )
    .await?;
    assert_eq!(copies.len(), 2);
    assert!(copies.iter().all(|c| c.points == 10 && c.position == 2));

    let renamed = catalog::update_task_group(
        &h.state,
        &ctx,
        &copies[0].id,
        TaskGroupUpdate {
            name: Some("Tidy bed".into()),
            points: Some(7),
            ..Default::default()
        },
    )
    .await?;
    assert_eq!(renamed.len(), 2);
    assert!(renamed.iter().all(|c| c.name == "Tidy bed" && c.points == 7));

    let err = catalog::create_task_for_all_children(
        &h.state,
        &ctx,
        &routine.id,
        TaskCreate {
            name: "Positioned".into(),
            position: Some(4),
            ..Default::default()
        },
    )
    .await
    .expect_err("group position is automatic");
    assert_eq!(err.kind(), ErrorKind::Validation);

    let archived = catalog::archive_task_group(&h.state, &ctx, &copies[1].id).await?;
    assert_eq!(archived, 2);
    let left_b = catalog::list_tasks(&h.state, &ctx, &routine.id, CHILD_B, TaskListQuery::default()).await?;
    assert!(left_b.is_empty());
    Ok(())
}

#[tokio::test]
async fn group_fan_out_without_children_creates_nothing() -> Result<()> {
    let h = harness().await?;
    let ctx = h.parent();
    let routine = catalog::create_routine(&h.state, &ctx, morning("empty")).await?;
    let copies =
        catalog::create_task_for_all_children(&h.state, &ctx, &routine.id, task("Anything", 3)).await?;
    assert!(copies.is_empty());
    Ok(())
}

#[tokio::test]
async fn reorder_task_groups_moves_every_copy() -> Result<()> {
    let h = harness().await?;
    let ctx = h.parent();
    let routine = catalog::create_routine(&h.state, &ctx, morning("groups")).await?;
    catalog::assign_child(&h.state, &ctx, &routine.id, CHILD_A, 1, true).await?;
    catalog::assign_child(&h.state, &ctx, &routine.id, CHILD_B, 2, true).await?;
    let first =
        catalog::create_task_for_all_children(&h.state, &ctx, &routine.id, task("Wash", 2)).await?;
    let second =
        catalog::create_task_for_all_children(&h.state, &ctx, &routine.id, task("Dress", 3)).await?;

    catalog::reorder_task_groups(
        &h.state,
        &ctx,
        &routine.id,
        vec![
            PositionUpdate::new(&first[0].id, 2),
            PositionUpdate::new(&second[1].id, 1),
        ],
    )
    .await?;
    for child in [CHILD_A, CHILD_B] {
        let tasks = catalog::list_tasks(&h.state, &ctx, &routine.id, child, TaskListQuery::default()).await?;
        let names: Vec<&str> = tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["Dress", "Wash"]);
    }

    let err = catalog::reorder_task_groups(
        &h.state,
        &ctx,
        &routine.id,
        vec![
            PositionUpdate::new(&first[0].id, 1),
            PositionUpdate::new(&first[1].id, 2),
        ],
    )
    .await
    .expect_err("same group twice");
    assert_eq!(err.kind(), ErrorKind::Validation);
    Ok(())
}

#[tokio::test]
async fn reorder_children_on_a_routine() -> Result<()> {
    let h = harness().await?;
    let ctx = h.parent();
    let routine = catalog::create_routine(&h.state, &ctx, morning("kids")).await?;
    catalog::assign_child(&h.state, &ctx, &routine.id, CHILD_A, 1, true).await?;
    catalog::assign_child(&h.state, &ctx, &routine.id, CHILD_B, 2, true).await?;

    let reordered = catalog::reorder_children(
        &h.state,
        &ctx,
        &routine.id,
        vec![PositionUpdate::new(CHILD_A, 2), PositionUpdate::new(CHILD_B, 1)],
    )
    .await?;
    let order: Vec<&str> = reordered.iter().map(|a| a.child_profile_id.as_str()).collect();
    assert_eq!(order, vec![CHILD_B, CHILD_A]);
    Ok(())
}
