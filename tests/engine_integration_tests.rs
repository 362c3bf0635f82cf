//! End-to-end election scenarios: engines competing through a shared store
//!
//! These run against the in-memory store with a manual clock, so lease
//! expiry is advanced explicitly instead of slept through; the only real
//! time spent is the loop cadence (tens of milliseconds).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use leasehold::{
    ElectionEngine, ElectionOptions, ElectionState, InMemoryLeaseStore, LeaseStore, ManualClock,
};

fn fast_options() -> ElectionOptions {
    ElectionOptions::new()
        .with_lease_duration(Duration::from_secs(5))
        .with_renewal_interval(Duration::from_millis(40))
        .with_retry_interval(Duration::from_millis(20))
        .with_operation_timeout(Duration::from_millis(500))
}

fn engine(
    store: Arc<InMemoryLeaseStore>,
    participant: &str,
) -> (ElectionEngine, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let engine =
        ElectionEngine::with_participant(store, "job-x", participant, fast_options()).unwrap();

    let gained = Arc::new(AtomicUsize::new(0));
    let lost = Arc::new(AtomicUsize::new(0));
    let (g, l) = (gained.clone(), lost.clone());
    engine.on_leadership_changed(move |change| {
        if change.leadership_gained() {
            g.fetch_add(1, Ordering::SeqCst);
        }
        if change.leadership_lost() {
            l.fetch_add(1, Ordering::SeqCst);
        }
    });

    (engine, gained, lost)
}

async fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

#[test_log::test(tokio::test)]
async fn test_single_participant_lifecycle() {
    let store = Arc::new(InMemoryLeaseStore::new());

    // No background loop: the release below must stay released while the
    // store contents are inspected.
    let options = fast_options().with_continuous_check(false);
    let engine =
        ElectionEngine::with_participant(store.clone(), "job-x", "p1", options).unwrap();
    let gained = Arc::new(AtomicUsize::new(0));
    let lost = Arc::new(AtomicUsize::new(0));
    let (g, l) = (gained.clone(), lost.clone());
    engine.on_leadership_changed(move |change| {
        if change.leadership_gained() {
            g.fetch_add(1, Ordering::SeqCst);
        }
        if change.leadership_lost() {
            l.fetch_add(1, Ordering::SeqCst);
        }
    });

    assert!(engine.start().await);
    assert!(engine.is_leader());
    assert_eq!(engine.state(), ElectionState::Leading);
    assert_eq!(gained.load(Ordering::SeqCst), 1);

    assert!(engine.release_leadership().await);
    assert!(!engine.is_leader());
    assert_eq!(lost.load(Ordering::SeqCst), 1);
    assert!(store.is_empty());

    engine.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_racing_engines_elect_exactly_one_leader() {
    let store = Arc::new(InMemoryLeaseStore::new());
    let (first, first_gained, _) = engine(store.clone(), "p1");
    let (second, second_gained, _) = engine(store.clone(), "p2");

    let (a, b) = tokio::join!(first.start(), second.start());
    assert_ne!(a, b, "exactly one starter may win");
    assert_ne!(first.is_leader(), second.is_leader());
    assert_eq!(
        first_gained.load(Ordering::SeqCst) + second_gained.load(Ordering::SeqCst),
        1,
        "exactly one gained event across both listeners"
    );

    // The loser observes who won.
    let (_winner, loser) = if first.is_leader() {
        (&first, &second)
    } else {
        (&second, &first)
    };
    assert_eq!(loser.state(), ElectionState::Seeking);
    let observed = loser.current_leader().expect("loser sees the holder");
    assert!(observed.participant_id == "p1" || observed.participant_id == "p2");

    first.stop().await;
    second.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_stopping_the_leader_hands_over() {
    let store = Arc::new(InMemoryLeaseStore::new());
    let (first, _, _) = engine(store.clone(), "p1");
    let (second, second_gained, _) = engine(store.clone(), "p2");

    assert!(first.start().await);
    assert!(!second.start().await);

    // Stop releases the lease, so the follower takes over within a few
    // retry ticks, with no expiry wait.
    first.stop().await;
    assert!(
        wait_until(Duration::from_secs(2), || second.is_leader()).await,
        "follower should take over after release"
    );
    assert_eq!(second_gained.load(Ordering::SeqCst), 1);
    assert_eq!(second.current_leader().unwrap().participant_id, "p2");

    second.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_crashed_leader_is_replaced_after_expiry() {
    let clock = Arc::new(ManualClock::new());
    let store = Arc::new(InMemoryLeaseStore::with_clock(clock.clone()));
    let (first, _, _) = engine(store.clone(), "p1");
    let (second, second_gained, _) = engine(store.clone(), "p2");

    assert!(first.start().await);
    assert!(!second.start().await);

    // Crash: the engine is dropped without stop(), so nothing releases the
    // lease; the follower stays blocked while the lease is valid.
    drop(first);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!second.is_leader());

    // Past expiry the next retry tick wins.
    clock.advance(Duration::from_secs(6));
    assert!(
        wait_until(Duration::from_secs(2), || second.is_leader()).await,
        "follower should take over once the lease expires"
    );
    assert_eq!(second_gained.load(Ordering::SeqCst), 1);

    second.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_continuous_holding_emits_no_duplicate_events() {
    let store = Arc::new(InMemoryLeaseStore::new());
    let (engine, gained, lost) = engine(store, "p1");

    assert!(engine.start().await);

    // Many renewal ticks pass; the holder never changes.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(engine.is_leader());
    assert_eq!(gained.load(Ordering::SeqCst), 1);
    assert_eq!(lost.load(Ordering::SeqCst), 0);

    // Direct re-acquire while holding is also a no-op.
    assert!(!engine.try_acquire_leadership().await.unwrap());
    assert_eq!(gained.load(Ordering::SeqCst), 1);

    engine.stop().await;
    assert_eq!(lost.load(Ordering::SeqCst), 1);
}

#[test_log::test(tokio::test)]
async fn test_lost_lease_is_detected_by_renewal() {
    let clock = Arc::new(ManualClock::new());
    let store = Arc::new(InMemoryLeaseStore::with_clock(clock.clone()));

    // A slow renewal cadence leaves a wide window to steal the lease between
    // two renew ticks.
    let options = fast_options().with_renewal_interval(Duration::from_millis(400));
    let first =
        ElectionEngine::with_participant(store.clone(), "job-x", "p1", options).unwrap();
    let first_lost = Arc::new(AtomicUsize::new(0));
    let l = first_lost.clone();
    first.on_leadership_changed(move |change| {
        if change.leadership_lost() {
            l.fetch_add(1, Ordering::SeqCst);
        }
    });

    assert!(first.start().await);

    // Expire p1's lease and hand the election to p2 behind its back.
    clock.advance(Duration::from_secs(6));
    store
        .try_acquire("job-x", "p2", Duration::from_secs(60), None)
        .await
        .unwrap()
        .expect("expired lease is acquirable");

    assert!(
        wait_until(Duration::from_secs(2), || !first.is_leader()).await,
        "renewal should notice the lease is gone"
    );
    assert_eq!(first_lost.load(Ordering::SeqCst), 1);

    first.stop().await;
}
