#![allow(non_snake_case)]

use std::time::Duration;
use wager_engine::{
    GameRules,
    PlaceBetError,
    RetryPolicy,
    SessionStatus,
    ValidationError,
    WagerEngine,
    gateway::{
        Retrying,
        local::LocalChain,
    },
    test_helpers::{
        STARTING_BALANCE,
        TestContext,
        alice,
        bob,
        test_config,
    },
};

#[tokio::test(start_paused = true)]
async fn place_bet__winning_bet__debits_stake_then_credits_payout() {
    let ctx = TestContext::new().await;

    // given
    let handle = ctx.engine.place_bet(4, 100).await.unwrap();
    assert_eq!(STARTING_BALANCE - 100, ctx.chain.balance());

    // when
    ctx.chain.fulfill(&handle.request_id, 4).unwrap();
    let actual = handle.observer.wait_terminal().await.unwrap();

    // then
    assert_eq!(SessionStatus::Completed, actual.status);
    assert_eq!(STARTING_BALANCE - 100 + 600, ctx.chain.balance());
}

#[tokio::test(start_paused = true)]
async fn place_bet__below_contract_minimum__is_rejected_without_signing() {
    // given
    let config = test_config();
    let chain = LocalChain::new(alice(), STARTING_BALANCE)
        .with_rules(GameRules {
            min_bet: 10,
            ..GameRules::default()
        })
        .with_config(&config);
    let ctx = TestContext::on_chain(chain, config).await;

    // when
    let actual = ctx.engine.place_bet(3, 5).await;

    // then
    assert!(matches!(
        actual,
        Err(PlaceBetError::Validation(ValidationError::BelowMinimum { amount: 5, min: 10 }))
    ));
    assert_eq!(0, ctx.chain.signature_requests());
}

#[tokio::test(start_paused = true)]
async fn place_bet__zero_amount__is_rejected_without_signing() {
    let ctx = TestContext::new().await;

    let actual = ctx.engine.place_bet(3, 0).await;

    assert!(matches!(
        actual,
        Err(PlaceBetError::Validation(ValidationError::ZeroAmount))
    ));
    assert_eq!(0, ctx.chain.signature_requests());
}

#[tokio::test(start_paused = true)]
async fn place_bet__insufficient_funds__is_reported_and_player_stays_free() {
    let ctx = TestContext::new().await;

    // given
    ctx.chain.fail_next_funding_checks(1);

    // when
    let rejected = ctx.engine.place_bet(4, 100).await;

    // then
    assert!(matches!(rejected, Err(PlaceBetError::InsufficientFunds(_))));
    assert_eq!(None, ctx.engine.active_session());
    assert!(ctx.engine.place_bet(4, 100).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn place_bet__after_reverted_bet__next_bet_settles_under_the_same_request_id() {
    let ctx = TestContext::new().await;

    // given
    ctx.chain.revert_next_submission("house paused");
    let reverted = ctx.engine.place_bet(4, 100).await.unwrap();
    let failed = reverted.observer.wait_terminal().await.unwrap();
    assert_eq!(SessionStatus::Failed, failed.status);

    // when
    let retried = ctx.engine.place_bet(4, 100).await.unwrap();
    ctx.chain.fulfill(&retried.request_id, 4).unwrap();
    let actual = retried.observer.wait_terminal().await.unwrap();

    // then
    assert_eq!(reverted.request_id, retried.request_id);
    assert_eq!(SessionStatus::Completed, actual.status);
    assert_eq!(Some(600), actual.payout);
}

#[tokio::test(start_paused = true)]
async fn place_bet__transient_rpc_failures__are_retried_by_the_gateway() {
    // given
    let config = test_config();
    let chain = LocalChain::new(alice(), STARTING_BALANCE).with_config(&config);
    let policy = RetryPolicy {
        max_attempts: 5,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
    };
    let engine = WagerEngine::start(Retrying::new(chain.clone(), policy), config)
        .await
        .unwrap();
    chain.fail_next_rpc_calls(2);

    // when
    let actual = engine.place_bet(4, 100).await;

    // then
    assert!(actual.is_ok());
    assert_eq!(1, chain.signature_requests());
}

#[tokio::test(start_paused = true)]
async fn place_bet__rpc_down_beyond_retry_budget__is_rpc_error_and_player_stays_free() {
    // given
    let config = test_config();
    let chain = LocalChain::new(alice(), STARTING_BALANCE).with_config(&config);
    let policy = RetryPolicy {
        max_attempts: 2,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(10),
    };
    let engine = WagerEngine::start(Retrying::new(chain.clone(), policy), config)
        .await
        .unwrap();
    chain.fail_next_rpc_calls(2);

    // when
    let actual = engine.place_bet(4, 100).await;

    // then
    assert!(matches!(actual, Err(PlaceBetError::Rpc(_))));
    assert_eq!(None, engine.active_session());
    assert!(engine.place_bet(4, 100).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn place_bet__two_players_on_one_chain__each_engine_tracks_only_its_own_bet() {
    // given
    let ctx = TestContext::new().await;
    let bob_chain = ctx.chain.connect_as(bob(), 1_000);
    let bob_engine = WagerEngine::start(bob_chain.clone(), ctx.config.clone())
        .await
        .unwrap();

    // when
    let alice_bet = ctx.engine.place_bet(4, 100).await.unwrap();
    let bob_bet = bob_engine.place_bet(2, 50).await.unwrap();
    ctx.chain.fulfill(&alice_bet.request_id, 4).unwrap();
    ctx.chain.fulfill(&bob_bet.request_id, 5).unwrap();
    let alice_result = alice_bet.observer.wait_terminal().await.unwrap();
    let bob_result = bob_bet.observer.wait_terminal().await.unwrap();

    // then
    assert_eq!(Some(600), alice_result.payout);
    assert_eq!(Some(0), bob_result.payout);
    assert_eq!(None, ctx.engine.snapshot(&bob_bet.request_id));
    assert_eq!(None, bob_engine.snapshot(&alice_bet.request_id));
    assert_eq!(950, bob_chain.balance());
}

#[tokio::test(start_paused = true)]
async fn place_bet__reply_lost_after_broadcast__is_not_submitted_twice() {
    // given
    let config = test_config();
    let chain = LocalChain::new(alice(), STARTING_BALANCE).with_config(&config);
    let policy = RetryPolicy {
        max_attempts: 5,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
    };
    let engine = WagerEngine::start(Retrying::new(chain.clone(), policy), config)
        .await
        .unwrap();
    chain.lose_next_broadcast_replies(1);

    // when
    let actual = engine.place_bet(4, 100).await;

    // then
    assert!(matches!(actual, Err(PlaceBetError::BroadcastUnknown(_))));
    assert_eq!(1, chain.signature_requests());
    assert_eq!(1, chain.open_requests().len());
    assert_eq!(STARTING_BALANCE - 100, chain.balance());
}
