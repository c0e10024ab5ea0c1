//! Integration tests for per-owner fetch tracking.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect

use request_lifecycle_core::prelude::*;
use request_lifecycle_runtime::{Fetch, FetchStatus, FetchTracker};
use request_lifecycle_testing::{MockTransport, init_tracing};
use serde_json::json;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

// ============================================================================
// Test Fixtures
// ============================================================================

struct Fixture {
    transport: MockTransport,
    coordinator: Coordinator,
    tracker: FetchTracker,
}

fn fixture() -> Fixture {
    init_tracing();
    let transport = MockTransport::new();
    let coordinator = Coordinator::builder(transport.clone())
        .global_bus(Rc::new(EventBus::new()))
        .build();
    let tracker = FetchTracker::install(&coordinator);
    Fixture {
        transport,
        coordinator,
        tracker,
    }
}

/// Callbacks recording what `ensure_fetched` reported.
fn outcomes() -> (Rc<Cell<usize>>, Rc<RefCell<Vec<String>>>) {
    (Rc::new(Cell::new(0)), Rc::new(RefCell::new(Vec::new())))
}

fn ensure(
    fixture: &Fixture,
    owner: &Owner,
    successes: &Rc<Cell<usize>>,
    errors: &Rc<RefCell<Vec<String>>>,
) -> Fetch {
    let successes = Rc::clone(successes);
    let errors = Rc::clone(errors);
    fixture
        .tracker
        .ensure_fetched(
            owner,
            move || successes.set(successes.get() + 1),
            move |error| errors.borrow_mut().push(error.message.clone()),
        )
        .unwrap()
}

// ============================================================================
// Flags
// ============================================================================

#[test]
fn successful_read_marks_the_owner_fetched() {
    let fixture = fixture();
    let owner = Owner::new("user");
    assert_eq!(fixture.tracker.status(&owner), FetchStatus::default());

    fixture
        .coordinator
        .start("read", &owner, RequestOptions::new())
        .unwrap();
    assert!(!fixture.tracker.has_been_fetched(&owner));

    fixture.transport.succeed_next(json!({ "name": "ada" }));
    assert!(fixture.tracker.has_been_fetched(&owner));
    assert!(!fixture.tracker.had_fetch_error(&owner));
}

#[test]
fn failed_read_sets_the_error_flag_until_the_next_success() {
    let fixture = fixture();
    let owner = Owner::new("user");

    fixture.coordinator.start("read", &owner, RequestOptions::new()).unwrap();
    fixture.transport.fail_next(TransportError::new("offline"));
    assert_eq!(
        fixture.tracker.status(&owner),
        FetchStatus {
            fetched: false,
            error: true
        }
    );

    fixture.coordinator.start("read", &owner, RequestOptions::new()).unwrap();
    fixture.transport.succeed_next(json!({}));
    assert_eq!(
        fixture.tracker.status(&owner),
        FetchStatus {
            fetched: true,
            error: false
        }
    );
}

#[test]
fn other_kinds_and_aborts_leave_the_flags_alone() {
    let fixture = fixture();
    let owner = Owner::new("user");

    fixture.coordinator.start("update", &owner, RequestOptions::new()).unwrap();
    fixture.transport.succeed_next(json!({}));
    fixture
        .coordinator
        .start("read", &owner, RequestOptions::new())
        .unwrap()
        .abort();

    assert_eq!(fixture.tracker.status(&owner), FetchStatus::default());
}

#[test]
fn custom_read_kind_is_tracked() {
    init_tracing();
    let transport = MockTransport::new();
    let coordinator = Coordinator::builder(transport.clone())
        .global_bus(Rc::new(EventBus::new()))
        .build();
    let tracker = FetchTracker::install_for_kind(&coordinator, "load");
    let owner = Owner::new("user");
    assert_eq!(tracker.read_kind(), "load");

    coordinator.start("read", &owner, RequestOptions::new()).unwrap();
    transport.succeed_next(json!({}));
    assert!(!tracker.has_been_fetched(&owner));

    coordinator.start("load", &owner, RequestOptions::new()).unwrap();
    transport.succeed_next(json!({}));
    assert!(tracker.has_been_fetched(&owner));
}

#[test]
fn forwarded_reads_do_not_mark_the_receiver() {
    let fixture = fixture();
    let forwarding = ForwardingManager::new(&fixture.coordinator);
    let source = Owner::new("source");
    let receiver = Owner::new("receiver");
    forwarding.forward(&source, &receiver, ForwardFilter::All);

    let context = fixture
        .coordinator
        .start("read", &source, RequestOptions::new())
        .unwrap();
    assert_eq!(context.forward_targets().len(), 1);
    fixture.transport.succeed_next(json!({}));

    assert!(fixture.tracker.has_been_fetched(&source));
    assert!(!fixture.tracker.has_been_fetched(&receiver));
}

#[test]
fn reset_forgets_the_owner() {
    let fixture = fixture();
    let owner = Owner::new("user");
    let other = Owner::new("other");
    for target in [&owner, &other] {
        fixture.coordinator.start("read", target, RequestOptions::new()).unwrap();
        fixture.transport.succeed_next(json!({}));
    }

    fixture.tracker.reset(&owner);
    assert!(!fixture.tracker.has_been_fetched(&owner));
    assert!(fixture.tracker.has_been_fetched(&other));
}

#[test]
fn dropping_the_tracker_unsubscribes() {
    let fixture = fixture();
    let bus = Rc::clone(fixture.coordinator.global_events());
    assert_eq!(bus.len(), 1);

    let Fixture {
        transport: _transport,
        coordinator: _coordinator,
        tracker,
    } = fixture;
    drop(tracker);
    assert!(bus.is_empty());
}

// ============================================================================
// ensure_fetched
// ============================================================================

#[test]
fn ensure_fetched_starts_a_read_and_reports_success() {
    let fixture = fixture();
    let owner = Owner::new("user");
    let (successes, errors) = outcomes();

    let fetch = ensure(&fixture, &owner, &successes, &errors);
    let Fetch::Started(context) = fetch else {
        unreachable!("nothing was in flight");
    };
    assert_eq!(context.kind(), "read");
    assert_eq!(successes.get(), 0);

    fixture.transport.succeed(&context, json!({}));
    assert_eq!(successes.get(), 1);
    assert!(errors.borrow().is_empty());
    assert!(fixture.tracker.has_been_fetched(&owner));
}

#[test]
fn ensure_fetched_reports_errors_and_retries_next_time() {
    let fixture = fixture();
    let owner = Owner::new("user");
    let (successes, errors) = outcomes();

    assert!(matches!(ensure(&fixture, &owner, &successes, &errors), Fetch::Started(_)));
    fixture.transport.fail_next(TransportError::new("offline"));
    assert_eq!(*errors.borrow(), ["offline"]);
    assert!(fixture.tracker.had_fetch_error(&owner));

    assert!(matches!(ensure(&fixture, &owner, &successes, &errors), Fetch::Started(_)));
    assert_eq!(fixture.transport.sent_count(), 2);
}

#[test]
fn ensure_fetched_answers_immediately_once_fetched() {
    let fixture = fixture();
    let owner = Owner::new("user");
    fixture.coordinator.start("read", &owner, RequestOptions::new()).unwrap();
    fixture.transport.succeed_next(json!({}));
    let (successes, errors) = outcomes();

    assert!(matches!(ensure(&fixture, &owner, &successes, &errors), Fetch::Ready));
    assert_eq!(successes.get(), 1);
    assert_eq!(fixture.transport.sent_count(), 1);
}

#[test]
fn ensure_fetched_joins_the_read_in_flight() {
    let fixture = fixture();
    let owner = Owner::new("user");
    let running = fixture
        .coordinator
        .start("read", &owner, RequestOptions::new())
        .unwrap();
    let (successes, errors) = outcomes();

    let Fetch::Joined(joined) = ensure(&fixture, &owner, &successes, &errors) else {
        unreachable!("a read is in flight");
    };
    assert!(joined.ptr_eq(&running));
    assert_eq!(fixture.transport.sent_count(), 1);

    fixture.transport.succeed_next(json!({}));
    assert_eq!(successes.get(), 1);
    assert!(errors.borrow().is_empty());
    assert!(fixture.tracker.has_been_fetched(&owner));
}

#[test]
fn joined_callers_hear_nothing_when_the_read_is_aborted() {
    let fixture = fixture();
    let owner = Owner::new("user");
    let running = fixture
        .coordinator
        .start("read", &owner, RequestOptions::new())
        .unwrap();
    let (successes, errors) = outcomes();
    assert!(matches!(ensure(&fixture, &owner, &successes, &errors), Fetch::Joined(_)));

    running.abort();
    assert_eq!(successes.get(), 0);
    assert!(errors.borrow().is_empty());
    assert_eq!(fixture.tracker.status(&owner), FetchStatus::default());
}

#[test]
fn fetch_status_serializes() {
    let status = FetchStatus {
        fetched: true,
        error: false,
    };
    let value = serde_json::to_value(status).unwrap();
    assert_eq!(value, json!({ "fetched": true, "error": false }));
}
