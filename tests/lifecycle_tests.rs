//! End-to-end lifecycle tests over the in-memory store and mock gateways

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{loan_request, setup, TestCoordinator};
use skinvault_coordinator::escrow::{TradeOfferStatus, TradeStatusPoller};
use skinvault_coordinator::loan::{
    EscrowOutcome, LiquidationTrigger, Loan, LoanStatus, TransitionError,
};
use skinvault_coordinator::vault::TxSignature;
use uuid::Uuid;

/// Poll the store until the loan reaches `expected` or the deadline passes.
async fn wait_for_status(
    coordinator: &TestCoordinator,
    loan_id: Uuid,
    expected: LoanStatus,
) -> Loan {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);

    loop {
        let loan = coordinator.store.get(loan_id).await.unwrap().unwrap();
        if loan.status == expected {
            return loan;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "loan {} never reached {:?}, stuck at {:?}",
                loan_id, expected, loan.status
            );
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn spawn_poller(coordinator: &TestCoordinator, loan_id: Uuid) {
    let poller = Arc::new(TradeStatusPoller::new(
        coordinator.store.clone(),
        coordinator.escrow.clone(),
        coordinator.vault.clone(),
        coordinator.state_machine.clone(),
        Duration::from_millis(10),
    ));
    poller.spawn(loan_id);
}

/// Drive a loan straight to Active without the poller.
async fn activate_loan(coordinator: &TestCoordinator, principal: i64, duration_days: i32) -> Loan {
    let loan = coordinator
        .state_machine
        .create(loan_request(principal, duration_days))
        .await
        .unwrap();
    coordinator
        .state_machine
        .request_escrow(loan.id)
        .await
        .unwrap();
    coordinator
        .state_machine
        .on_escrow_resolved(loan.id, EscrowOutcome::Accepted)
        .await
        .unwrap();
    coordinator
        .state_machine
        .activate(loan.id, TxSignature(format!("borrow-{}", loan.id)))
        .await
        .unwrap();

    coordinator.store.get(loan.id).await.unwrap().unwrap()
}

#[tokio::test]
async fn accepted_offer_activates_loan_with_exact_term() {
    let coordinator = setup(1.2);

    let loan = coordinator
        .state_machine
        .create(loan_request(100, 14))
        .await
        .unwrap();
    coordinator
        .state_machine
        .request_escrow(loan.id)
        .await
        .unwrap();

    spawn_poller(&coordinator, loan.id);

    let before_accept = Utc::now();
    coordinator.escrow.set_status(TradeOfferStatus::Accepted).await;

    let active = wait_for_status(&coordinator, loan.id, LoanStatus::Active).await;

    // The term anchors to the activation instant, not to offer acceptance.
    let start = active.start_time.unwrap();
    let end = active.end_time.unwrap();
    assert_eq!(end - start, ChronoDuration::days(14));
    assert!(start >= before_accept);
    assert!(start <= Utc::now());

    assert!(active.vault_tx.is_some());
    assert_eq!(coordinator.vault.borrow_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn declined_offer_cancels_loan_without_vault_call() {
    let coordinator = setup(1.2);

    let loan = coordinator
        .state_machine
        .create(loan_request(100, 14))
        .await
        .unwrap();
    coordinator
        .state_machine
        .request_escrow(loan.id)
        .await
        .unwrap();

    spawn_poller(&coordinator, loan.id);

    coordinator.escrow.set_status(TradeOfferStatus::Declined).await;

    wait_for_status(&coordinator, loan.id, LoanStatus::Canceled).await;

    assert_eq!(coordinator.vault.borrow_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failed_borrow_cancels_and_flags_collateral_return() {
    let coordinator = setup(1.2);
    coordinator.vault.fail_borrow.store(true, Ordering::SeqCst);

    let loan = coordinator
        .state_machine
        .create(loan_request(100, 14))
        .await
        .unwrap();
    coordinator
        .state_machine
        .request_escrow(loan.id)
        .await
        .unwrap();

    spawn_poller(&coordinator, loan.id);

    coordinator.escrow.set_status(TradeOfferStatus::Accepted).await;

    let canceled = wait_for_status(&coordinator, loan.id, LoanStatus::Canceled).await;

    // Never activated, and the items are flagged for send-back.
    assert!(canceled.collateral_return_pending);
    assert!(canceled.start_time.is_none());
    assert!(canceled.end_time.is_none());
    assert!(canceled.vault_tx.is_none());
}

#[tokio::test]
async fn overdue_scan_liquidates_with_single_event() {
    let coordinator = setup(1.2);

    let loan = activate_loan(&coordinator, 100, 14).await;
    let end = loan.end_time.unwrap();

    let events = coordinator.engine.scan(end + ChronoDuration::hours(1)).await;

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].triggered_by, LiquidationTrigger::Overdue);
    assert_eq!(events[0].resulting_status, LoanStatus::Liquidated);

    let stored = coordinator.store.get(loan.id).await.unwrap().unwrap();
    assert_eq!(stored.status, LoanStatus::Liquidated);

    // A second scan has nothing left to do.
    let again = coordinator.engine.scan(end + ChronoDuration::hours(2)).await;
    assert!(again.is_empty());
}

#[tokio::test]
async fn concurrent_liquidation_changes_state_exactly_once() {
    let coordinator = setup(1.2);

    let loan = activate_loan(&coordinator, 100, 14).await;

    let (first, second) = tokio::join!(
        coordinator
            .state_machine
            .liquidate(loan.id, LiquidationTrigger::Overdue),
        coordinator
            .state_machine
            .liquidate(loan.id, LiquidationTrigger::Manual),
    );

    let first = first.unwrap();
    let second = second.unwrap();

    // Exactly one call performed the transition; the other observed the
    // already-liquidated loan and no-opped.
    assert!(first.changed ^ second.changed);
    assert_eq!(first.loan.status, LoanStatus::Liquidated);
    assert_eq!(second.loan.status, LoanStatus::Liquidated);
}

#[tokio::test]
async fn concurrent_manual_liquidation_records_one_event() {
    let coordinator = setup(1.2);

    let loan = activate_loan(&coordinator, 100, 14).await;

    let (first, second) = tokio::join!(
        coordinator.engine.liquidate_manually(loan.id),
        coordinator.engine.liquidate_manually(loan.id),
    );

    assert!(first.is_ok() ^ second.is_ok());

    let events = coordinator.store.liquidation_events(loan.id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].triggered_by, LiquidationTrigger::Manual);
}

#[tokio::test]
async fn duplicate_escrow_resolution_changes_state_at_most_once() {
    let coordinator = setup(1.2);

    let loan = coordinator
        .state_machine
        .create(loan_request(100, 14))
        .await
        .unwrap();
    coordinator
        .state_machine
        .request_escrow(loan.id)
        .await
        .unwrap();

    let first = coordinator
        .state_machine
        .on_escrow_resolved(loan.id, EscrowOutcome::Accepted)
        .await
        .unwrap();
    let second = coordinator
        .state_machine
        .on_escrow_resolved(loan.id, EscrowOutcome::Accepted)
        .await
        .unwrap();

    assert!(first.changed);
    assert!(!second.changed);
    assert_eq!(second.loan.status, LoanStatus::EscrowHeld);
}

#[tokio::test]
async fn duplicate_activation_does_not_recompute_term() {
    let coordinator = setup(1.2);

    let loan = activate_loan(&coordinator, 100, 14).await;
    let original_start = loan.start_time.unwrap();
    let original_end = loan.end_time.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;

    let retried = coordinator
        .state_machine
        .activate(loan.id, TxSignature("retry".to_string()))
        .await
        .unwrap();

    assert!(!retried.changed);
    assert_eq!(retried.loan.start_time.unwrap(), original_start);
    assert_eq!(retried.loan.end_time.unwrap(), original_end);
    // The original confirmation is kept too.
    assert_eq!(retried.loan.vault_tx, loan.vault_tx);
}

#[tokio::test]
async fn transitions_off_the_graph_are_rejected() {
    let coordinator = setup(1.2);

    let loan = coordinator
        .state_machine
        .create(loan_request(100, 14))
        .await
        .unwrap();

    // Created loan: no repay, no activation, no liquidation.
    assert!(matches!(
        coordinator.state_machine.repay(loan.id).await,
        Err(TransitionError::InvalidTransition { .. })
    ));
    assert!(matches!(
        coordinator
            .state_machine
            .activate(loan.id, TxSignature("sig".to_string()))
            .await,
        Err(TransitionError::InvalidTransition { .. })
    ));
    assert!(matches!(
        coordinator
            .state_machine
            .liquidate(loan.id, LiquidationTrigger::Manual)
            .await,
        Err(TransitionError::InvalidTransition { .. })
    ));

    // Nothing moved.
    let stored = coordinator.store.get(loan.id).await.unwrap().unwrap();
    assert_eq!(stored.status, LoanStatus::Created);
}

#[tokio::test]
async fn user_cancel_only_honored_while_escrow_pending() {
    let coordinator = setup(1.2);

    let loan = coordinator
        .state_machine
        .create(loan_request(100, 14))
        .await
        .unwrap();
    coordinator
        .state_machine
        .request_escrow(loan.id)
        .await
        .unwrap();

    let canceled = coordinator.state_machine.cancel(loan.id).await.unwrap();
    assert!(canceled.changed);
    assert_eq!(canceled.loan.status, LoanStatus::Canceled);
    assert_eq!(coordinator.escrow.cancel_calls.load(Ordering::SeqCst), 1);

    // Once collateral is held, cancel must go through repay/liquidate.
    let held = activate_loan(&coordinator, 200, 7).await;
    assert!(matches!(
        coordinator.state_machine.cancel(held.id).await,
        Err(TransitionError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn repeated_escrow_request_reuses_open_offer() {
    let coordinator = setup(1.2);

    let loan = coordinator
        .state_machine
        .create(loan_request(100, 14))
        .await
        .unwrap();

    let first = coordinator
        .state_machine
        .request_escrow(loan.id)
        .await
        .unwrap();
    let second = coordinator
        .state_machine
        .request_escrow(loan.id)
        .await
        .unwrap();

    // The loan never holds two open offers.
    assert_eq!(first.offer_id, second.offer_id);
    assert_eq!(coordinator.escrow.open_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn escrow_resolution_after_activation_is_rejected_without_side_effects() {
    let coordinator = setup(1.2);

    let loan = activate_loan(&coordinator, 100, 14).await;

    // A late duplicate delivery of the acceptance webhook/poll.
    let result = coordinator
        .state_machine
        .on_escrow_resolved(loan.id, EscrowOutcome::Accepted)
        .await;

    assert!(matches!(
        result,
        Err(TransitionError::InvalidTransition { .. })
    ));

    let stored = coordinator.store.get(loan.id).await.unwrap().unwrap();
    assert_eq!(stored.status, LoanStatus::Active);
    assert_eq!(stored.end_time, loan.end_time);
}
