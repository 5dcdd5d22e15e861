use anyhow::Result;
use routinely_lib::rewards::{self, RedemptionStatus, RedemptionUpdate};
use routinely_lib::ErrorKind;
#[path = "util.rs"]
mod util;

use util::{harness, CHILD_A, CHILD_B, REWARD_BIG, REWARD_HIDDEN, REWARD_ONCE};

fn to(status: RedemptionStatus) -> RedemptionUpdate {
    RedemptionUpdate {
        status,
        notes: None,
    }
}

async fn redemption_rows(h: &util::Harness) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM reward_redemptions")
        .fetch_one(h.pool())
        .await?;
    Ok(count)
}

#[tokio::test]
async fn insufficient_balance_creates_nothing() -> Result<()> {
    let h = harness().await?;
    h.credit(CHILD_A, 60).await?;

    let err = rewards::create_redemption(&h.state, &h.child(CHILD_A), REWARD_BIG, CHILD_A, None)
        .await
        .expect_err("100 > 60");
    assert_eq!(err.kind(), ErrorKind::InsufficientBalance);
    assert_eq!(redemption_rows(&h).await?, 0);
    assert_eq!(h.ledger_rows(CHILD_A).await?, 1);
    assert_eq!(h.balance(CHILD_A).await?, 60);
    Ok(())
}

#[tokio::test]
async fn redemption_debits_and_links_the_transaction() -> Result<()> {
    let h = harness().await?;
    h.credit(CHILD_A, 120).await?;

    let redemption = rewards::create_redemption(
        &h.state,
        &h.child(CHILD_A),
        REWARD_BIG,
        CHILD_A,
        Some("  for the park  ".into()),
    )
    .await?;
    assert_eq!(redemption.status, RedemptionStatus::Pending);
    assert_eq!(redemption.points_cost, 100);
    assert_eq!(redemption.notes.as_deref(), Some("for the park"));
    assert!(redemption.point_transaction_id.is_some());
    assert_eq!(h.balance(CHILD_A).await?, 20);

    let approved =
        rewards::update_redemption(&h.state, &h.parent(), &redemption.id, to(RedemptionStatus::Approved))
            .await?;
    assert_eq!(approved.confirmed_by_profile_id.as_deref(), Some(util::PARENT));
    let confirmed_at = approved.confirmed_at;
    assert!(confirmed_at.is_some());

    h.advance_minutes(30);
    let fulfilled =
        rewards::update_redemption(&h.state, &h.parent(), &redemption.id, to(RedemptionStatus::Fulfilled))
            .await?;
    assert_eq!(fulfilled.status, RedemptionStatus::Fulfilled);
    assert_eq!(fulfilled.confirmed_at, confirmed_at);
    assert_eq!(h.balance(CHILD_A).await?, 20);

    let err =
        rewards::update_redemption(&h.state, &h.parent(), &redemption.id, to(RedemptionStatus::Cancelled))
            .await
            .expect_err("fulfilled is final");
    assert_eq!(err.code(), "CONFLICT/INVALID_TRANSITION");
    Ok(())
}

#[tokio::test]
async fn rejection_and_cancellation_refund() -> Result<()> {
    let h = harness().await?;
    h.credit(CHILD_A, 200).await?;
    let kid = h.child(CHILD_A);

    let rejected = rewards::create_redemption(&h.state, &kid, REWARD_BIG, CHILD_A, None).await?;
    let rejected =
        rewards::update_redemption(&h.state, &h.parent(), &rejected.id, to(RedemptionStatus::Rejected))
            .await?;
    assert!(rejected.cancelled_at.is_some());
    assert_eq!(h.balance(CHILD_A).await?, 200);

    let cancelled = rewards::create_redemption(&h.state, &kid, REWARD_BIG, CHILD_A, None).await?;
    rewards::update_redemption(&h.state, &h.parent(), &cancelled.id, to(RedemptionStatus::Approved))
        .await?;
    assert_eq!(h.balance(CHILD_A).await?, 100);
    rewards::update_redemption(&h.state, &h.parent(), &cancelled.id, to(RedemptionStatus::Cancelled))
        .await?;
    assert_eq!(h.balance(CHILD_A).await?, 200);

    let refunds: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM point_transactions \
         WHERE transaction_type = 'reward_redeem' AND points_delta > 0",
    )
    .fetch_one(h.pool())
    .await?;
    assert_eq!(refunds, 2);
    let report = routinely_lib::ledger::verify_ledger(h.pool(), Some(CHILD_A)).await?;
    assert!(report.is_consistent());
    Ok(())
}

#[tokio::test]
async fn non_repeatable_rewards_redeem_once() -> Result<()> {
    let h = harness().await?;
    h.credit(CHILD_A, 100).await?;
    let kid = h.child(CHILD_A);

    let first = rewards::create_redemption(&h.state, &kid, REWARD_ONCE, CHILD_A, None).await?;
    let err = rewards::create_redemption(&h.state, &kid, REWARD_ONCE, CHILD_A, None)
        .await
        .expect_err("second redemption");
    assert_eq!(err.code(), "CONFLICT/ALREADY_REDEEMED");

    rewards::update_redemption(&h.state, &h.parent(), &first.id, to(RedemptionStatus::Rejected)).await?;
    rewards::create_redemption(&h.state, &kid, REWARD_ONCE, CHILD_A, None).await?;
    assert_eq!(h.balance(CHILD_A).await?, 70);
    Ok(())
}

#[tokio::test]
async fn visibility_and_roles_are_enforced() -> Result<()> {
    let h = harness().await?;
    h.credit(CHILD_A, 50).await?;
    h.credit(CHILD_B, 50).await?;

    let err = rewards::create_redemption(&h.state, &h.child(CHILD_B), REWARD_HIDDEN, CHILD_B, None)
        .await
        .expect_err("hidden from Ben");
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    rewards::create_redemption(&h.state, &h.child(CHILD_A), REWARD_HIDDEN, CHILD_A, None).await?;

    let err = rewards::create_redemption(&h.state, &h.child(CHILD_A), REWARD_HIDDEN, CHILD_B, None)
        .await
        .expect_err("cannot redeem for a sibling");
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    let err = rewards::create_redemption(&h.state, &h.child(CHILD_A), "no-such-reward", CHILD_A, None)
        .await
        .expect_err("unknown reward");
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let mine = rewards::list_redemptions(&h.state, &h.child(CHILD_A), CHILD_A, None).await?;
    assert_eq!(mine.len(), 1);
    let err = rewards::update_redemption(&h.state, &h.child(CHILD_A), &mine[0].id, to(RedemptionStatus::Cancelled))
        .await
        .expect_err("children cannot move redemptions");
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    let pending = rewards::list_redemptions(&h.state, &h.parent(), CHILD_A, Some(RedemptionStatus::Pending)).await?;
    assert_eq!(pending.len(), 1);
    let approved = rewards::list_redemptions(&h.state, &h.parent(), CHILD_A, Some(RedemptionStatus::Approved)).await?;
    assert!(approved.is_empty());
    Ok(())
}
