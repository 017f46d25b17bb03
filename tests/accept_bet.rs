#![allow(non_snake_case)]
use wager_client::{
    ValidationError,
    backend::in_memory::RecordedCall,
    cache::CacheKey,
    controller::{
        ActionKey,
        NotificationKind,
        Phase,
    },
    test_helpers::TestContext,
    types::{
        Balances,
        BetStatus,
    },
};

#[tokio::test]
async fn accept_bet__insufficient_points_blocks_before_any_call() {
    // given
    let ctx = TestContext::new().await;
    let alice = ctx.with_user("alice", 500).await;
    let poor = ctx.with_user("poor", 50).await;
    let bet_id = ctx.open_bet(&alice, 100).await.unwrap();
    let calls_before = ctx.backend().calls().await.len();
    let controller = ctx.controller_for(&poor);

    // when
    let err = controller.accept_bet(&bet_id).await.unwrap_err();

    // then
    assert_eq!(
        err,
        ValidationError::InsufficientPoints {
            needed: 100,
            available: 50
        }
        .into()
    );
    assert_eq!(ctx.backend().calls().await.len(), calls_before);
    let note = controller.notifications().pop().unwrap();
    assert_eq!(note.kind, NotificationKind::Error);
    assert!(note.message.starts_with("Insufficient Points"));
    assert_eq!(
        controller.phase(&ActionKey::Accept(bet_id)),
        Phase::Idle
    );
}

#[tokio::test]
async fn accept_bet__creator_cannot_accept_own_bet() {
    // given
    let ctx = TestContext::new().await;
    let alice = ctx.with_user("alice", 500).await;
    let bet_id = ctx.open_bet(&alice, 100).await.unwrap();
    let calls_before = ctx.backend().calls().await.len();
    let controller = ctx.controller_for(&alice);

    // when
    let err = controller.accept_bet(&bet_id).await.unwrap_err();

    // then
    assert_eq!(err, ValidationError::CannotAcceptOwnBet.into());
    assert_eq!(err.to_string(), "You cannot accept your own bet");
    assert_eq!(ctx.backend().calls().await.len(), calls_before);
}

#[tokio::test]
async fn accept_bet__takes_opposing_side_and_reserves_acceptor_points() {
    // given
    let ctx = TestContext::new().await;
    let alice = ctx.with_user("alice", 500).await;
    let bob = ctx.with_user("bob", 300).await;
    let bet_id = ctx.open_bet(&alice, 100).await.unwrap();
    let controller = ctx.controller_for(&bob);

    // when
    controller.accept_bet(&bet_id).await.unwrap();

    // then
    let calls = ctx.backend().calls().await;
    let RecordedCall::Accept(call) = calls.last().unwrap() else {
        panic!("expected an accept call");
    };
    assert_eq!(call.acceptors_pick_id, ctx.pick_b());
    assert_eq!(call.user_id, bob);

    assert_eq!(
        controller.ledger().current().unwrap().balances,
        Balances::new(200, 100)
    );
    let bet = controller
        .bets()
        .cached(&CacheKey::Bet(bet_id.clone()))
        .await
        .unwrap()
        .remove(0);
    assert_eq!(bet.status, BetStatus::WaitingResult);
    assert_eq!(bet.acceptor_id, Some(bob.clone()));
    let open = controller.bets().cached(&CacheKey::open()).await.unwrap();
    assert!(open.iter().all(|b| b.id != bet_id));
}

#[tokio::test]
async fn accept_bet__already_accepted_bet_is_not_open() {
    // given
    let ctx = TestContext::new().await;
    let alice = ctx.with_user("alice", 500).await;
    let bob = ctx.with_user("bob", 500).await;
    let carol = ctx.with_user("carol", 500).await;
    let bet_id = ctx.open_bet(&alice, 100).await.unwrap();
    ctx.controller_for(&bob).accept_bet(&bet_id).await.unwrap();
    let calls_before = ctx.backend().calls().await.len();

    // when
    let err = ctx
        .controller_for(&carol)
        .accept_bet(&bet_id)
        .await
        .unwrap_err();

    // then
    assert_eq!(
        err,
        ValidationError::BetNotOpen(BetStatus::WaitingResult).into()
    );
    assert_eq!(ctx.backend().calls().await.len(), calls_before);
}

#[tokio::test]
async fn settle__winner_sees_payout_after_refresh() {
    // given
    let ctx = TestContext::new().await;
    let alice = ctx.with_user("alice", 500).await;
    let bob = ctx.with_user("bob", 500).await;
    let bet_id = ctx.open_bet(&alice, 100).await.unwrap();
    let bob_controller = ctx.controller_for(&bob);
    bob_controller.accept_bet(&bet_id).await.unwrap();

    // when
    ctx.backend().settle(&bet_id, &bob).await.unwrap();
    let bob_after = bob_controller.ledger().refresh().await.unwrap();
    let alice_after = ctx.controller_for(&alice).ledger().refresh().await.unwrap();

    // then
    assert_eq!(bob_after, Balances::new(600, 0));
    assert_eq!(alice_after, Balances::new(400, 0));
}
