#![allow(non_snake_case)]

use super::*;
use proptest::prelude::*;

const WINDOW: Duration = Duration::from_secs(30);

fn alice() -> PlayerAddress {
    PlayerAddress::new("0xa11ce")
}

fn record(id: u64) -> SubmissionRecord {
    SubmissionRecord {
        request_id: RequestId::from(id),
        player: alice(),
        chosen_number: 4,
        bet_amount: 100,
    }
}

fn started(id: u64, block_number: u64) -> RawEvent {
    RawEvent::started(RequestId::from(id), block_number, alice(), 4, 100)
}

fn resolved(id: u64, block_number: u64, result_roll: u8) -> RawEvent {
    let payout = if result_roll == 4 { 600 } else { 0 };
    RawEvent::resolved(RequestId::from(id), block_number, result_roll, payout)
}

fn labels(deliveries: &[Delivery]) -> Vec<&'static str> {
    deliveries.iter().map(|d| d.event.label()).collect()
}

#[test]
fn ingest__started_for_tracked_request__delivers_immediately() {
    // given
    let mut reconciler = EventReconciler::new(WINDOW);
    reconciler.track(record(1));

    // when
    let actual = reconciler.ingest(started(1, 10), Instant::now());

    // then
    let expected = vec![Delivery {
        request_id: RequestId::from(1),
        event: DomainEvent::Started { block_number: 10 },
    }];
    assert_eq!(expected, actual);
}

#[test]
fn ingest__duplicate_resolved__is_delivered_once() {
    // given
    let mut reconciler = EventReconciler::new(WINDOW);
    let now = Instant::now();
    reconciler.track(record(1));
    reconciler.ingest(started(1, 10), now);

    // when
    let first = reconciler.ingest(resolved(1, 12, 4), now);
    let second = reconciler.ingest(resolved(1, 12, 4).with_log_index(2), now);

    // then
    assert_eq!(vec!["GameResolved"], labels(&first));
    assert!(second.is_empty());
}

#[test]
fn ingest__resolved_before_started__is_held_then_released_in_order() {
    // given
    let mut reconciler = EventReconciler::new(WINDOW);
    let now = Instant::now();
    reconciler.track(record(1));

    // when
    let early = reconciler.ingest(resolved(1, 12, 4), now);
    let released = reconciler.ingest(started(1, 10), now);

    // then
    assert!(early.is_empty());
    assert_eq!(vec!["GameStarted", "GameResolved"], labels(&released));
    assert_eq!(0, reconciler.buffered_len());
}

#[test]
fn track__events_arrived_before_registration__are_released_on_track() {
    // given
    let mut reconciler = EventReconciler::new(WINDOW);
    let now = Instant::now();
    reconciler.ingest(resolved(1, 12, 2), now);
    reconciler.ingest(started(1, 10), now);

    // when
    let actual = reconciler.track(record(1));

    // then
    assert_eq!(vec!["GameStarted", "GameResolved"], labels(&actual));
}

#[test]
fn ingest__started_with_wrong_amount__is_discarded() {
    // given
    let mut reconciler = EventReconciler::new(WINDOW);
    reconciler.track(record(1));
    let forged = RawEvent::started(RequestId::from(1), 10, alice(), 4, 999);

    // when
    let actual = reconciler.ingest(forged, Instant::now());

    // then
    assert!(actual.is_empty());
    assert_eq!(0, reconciler.buffered_len());
}

#[test]
fn expire__resolved_without_started__is_orphaned_after_window() {
    // given
    let mut reconciler = EventReconciler::new(WINDOW);
    let start = Instant::now();
    reconciler.ingest(resolved(9, 12, 3), start);

    // when
    let too_early = reconciler.expire(start + WINDOW / 2);
    let orphans = reconciler.expire(start + WINDOW);

    // then
    assert!(too_early.is_empty());
    assert_eq!(
        vec![Orphan {
            request_id: RequestId::from(9),
            name: EventName::GameResolved,
            block_number: 12,
        }],
        orphans
    );
    assert_eq!(0, reconciler.buffered_len());
}

#[test]
fn expire__tracked_request__keeps_its_ledger_for_deduplication() {
    // given
    let mut reconciler = EventReconciler::new(WINDOW);
    let start = Instant::now();
    reconciler.track(record(1));
    reconciler.ingest(started(1, 10), start);

    // when
    reconciler.expire(start + WINDOW * 2);
    let replay = reconciler.ingest(started(1, 10), start + WINDOW * 2);

    // then
    assert!(reconciler.is_tracked(&RequestId::from(1)));
    assert!(replay.is_empty());
}

#[test]
fn forget__tracked_request__drops_all_state() {
    let mut reconciler = EventReconciler::new(WINDOW);
    reconciler.track(record(1));

    reconciler.forget(&RequestId::from(1));

    assert!(!reconciler.is_tracked(&RequestId::from(1)));
}

#[derive(Clone, Debug)]
enum Step {
    Track,
    Started,
    Resolved,
}

fn arb_steps() -> impl Strategy<Value = Vec<Step>> {
    (1usize..=3, 1usize..=3)
        .prop_flat_map(|(started_copies, resolved_copies)| {
            let mut steps = vec![Step::Track];
            steps.extend(std::iter::repeat_n(Step::Started, started_copies));
            steps.extend(std::iter::repeat_n(Step::Resolved, resolved_copies));
            Just(steps).prop_shuffle()
        })
}

proptest! {
    #[test]
    fn ingest__any_order_with_duplicates__delivers_started_then_resolved_once(
        steps in arb_steps()
    ) {
        let mut reconciler = EventReconciler::new(WINDOW);
        let now = Instant::now();
        let mut delivered = Vec::new();
        for step in steps {
            let batch = match step {
                Step::Track => reconciler.track(record(1)),
                Step::Started => reconciler.ingest(started(1, 10), now),
                Step::Resolved => reconciler.ingest(resolved(1, 12, 4), now),
            };
            delivered.extend(batch);
        }
        prop_assert_eq!(vec!["GameStarted", "GameResolved"], labels(&delivered));
        prop_assert_eq!(0, reconciler.buffered_len());
    }
}
