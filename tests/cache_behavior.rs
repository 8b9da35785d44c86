use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tally::cache::{
    response_key, response_key_for, Clock, InspectionCache, ResponseCache, SessionCache,
};
use tally::error::TallyError;

/// Test clock driven by hand so expiry needs no real waiting.
struct ManualClock(AtomicI64);

impl ManualClock {
    fn at(start_ms: i64) -> Arc<Self> {
        Arc::new(Self(AtomicI64::new(start_ms)))
    }
    fn advance(&self, by_ms: i64) {
        self.0.fetch_add(by_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

// ------------- Response cache -------------

#[test]
fn keys_compose_from_kind_and_entity() {
    assert_eq!(response_key("SESSIONS"), "SESSIONS");
    assert_eq!(response_key_for("SESSIONS", "abc"), "SESSIONS-abc");
}

#[test]
fn supplier_runs_at_most_once_between_invalidations() {
    let cache: ResponseCache<String> = ResponseCache::new(ManualClock::at(0));
    let calls = AtomicUsize::new(0);
    let supplier = || {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok("payload".to_owned())
    };
    let first = cache.get_or_compute("SESSIONS", supplier).unwrap();
    let second = cache
        .get_or_compute("SESSIONS", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok("other".to_owned())
        })
        .unwrap();
    assert_eq!(*first, "payload");
    assert_eq!(*second, "payload", "the cached value is reused");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn invalidation_forces_the_next_supplier() {
    let cache: ResponseCache<String> = ResponseCache::new(ManualClock::at(0));
    let a = cache
        .get_or_compute("SESSIONS", || Ok("from_a".to_owned()))
        .unwrap();
    assert_eq!(*a, "from_a");
    cache.invalidate("SESSIONS").unwrap();
    let b = cache
        .get_or_compute("SESSIONS", || Ok("from_b".to_owned()))
        .unwrap();
    assert_eq!(*b, "from_b", "supplier B must run, not reuse A's result");
}

#[test]
fn prefix_invalidation_removes_exactly_the_matching_keys() {
    let cache: ResponseCache<i32> = ResponseCache::new(ManualClock::at(0));
    cache.get_or_compute("SESSIONS", || Ok(1)).unwrap();
    cache
        .get_or_compute(&response_key_for("SESSIONS", "p1"), || Ok(2))
        .unwrap();
    cache.get_or_compute("SERVER_OVERVIEW", || Ok(3)).unwrap();

    cache.invalidate_matching(&["SESSIONS"]).unwrap();
    assert!(cache.get("SESSIONS").unwrap().is_none());
    assert!(cache.get("SESSIONS-p1").unwrap().is_none());
    assert_eq!(*cache.get("SERVER_OVERVIEW").unwrap().unwrap(), 3);
}

#[test]
fn invalidate_entity_targets_one_key() {
    let cache: ResponseCache<i32> = ResponseCache::new(ManualClock::at(0));
    cache
        .get_or_compute(&response_key_for("PLAYER", "p1"), || Ok(1))
        .unwrap();
    cache
        .get_or_compute(&response_key_for("PLAYER", "p2"), || Ok(2))
        .unwrap();
    cache.invalidate_entity("PLAYER", "p1").unwrap();
    assert!(cache.get("PLAYER-p1").unwrap().is_none());
    assert!(cache.get("PLAYER-p2").unwrap().is_some());
}

#[test]
fn invalidate_all_clears_everything() {
    let cache: ResponseCache<i32> = ResponseCache::new(ManualClock::at(0));
    cache.get_or_compute("A", || Ok(1)).unwrap();
    cache.get_or_compute("B", || Ok(2)).unwrap();
    cache.invalidate_all().unwrap();
    assert!(cache.is_empty().unwrap());
}

#[test]
fn failed_supplier_does_not_poison_the_key() {
    let cache: ResponseCache<String> = ResponseCache::new(ManualClock::at(0));
    let err = cache
        .get_or_compute("SESSIONS", || {
            Err(TallyError::Operation("query failed".into()))
        })
        .unwrap_err();
    assert!(matches!(err, TallyError::Operation(_)));
    // the failure left no sentinel behind; the retry recomputes
    let value = cache
        .get_or_compute("SESSIONS", || Ok("recovered".to_owned()))
        .unwrap();
    assert_eq!(*value, "recovered");
}

#[test]
fn concurrent_misses_run_one_supplier_to_completion() {
    let cache: Arc<ResponseCache<String>> = Arc::new(ResponseCache::new(ManualClock::at(0)));
    let calls = Arc::new(AtomicUsize::new(0));
    std::thread::scope(|scope| {
        for _ in 0..4 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            scope.spawn(move || {
                let value = cache
                    .get_or_compute("HOT", || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(20));
                        Ok("computed".to_owned())
                    })
                    .unwrap();
                assert_eq!(*value, "computed", "never a torn or partial value");
            });
        }
    });
    assert_eq!(calls.load(Ordering::SeqCst), 1, "one computation, shared result");
}

#[test]
fn stored_values_carry_their_creation_timestamp() {
    let clock = ManualClock::at(1_000);
    let cache: ResponseCache<i32> = ResponseCache::new(Arc::clone(&clock) as Arc<dyn Clock>);
    cache.get_or_compute("A", || Ok(1)).unwrap();
    assert_eq!(cache.created_ms("A").unwrap(), Some(1_000));
    assert_eq!(cache.created_ms("missing").unwrap(), None);
}

// ------------- Inspection cache -------------

const THREE_MINUTES_MS: i64 = 180_000;

#[test]
fn entries_live_exactly_their_pinned_lifetime() {
    let clock = ManualClock::at(0);
    let cache: InspectionCache<String> =
        InspectionCache::new(THREE_MINUTES_MS, Arc::clone(&clock) as Arc<dyn Clock>);
    cache.insert("p1", "snapshot".to_owned()).unwrap();
    assert!(cache.get("p1").unwrap().is_some(), "retrievable immediately");

    clock.advance(THREE_MINUTES_MS - 1);
    assert!(cache.get("p1").unwrap().is_some(), "still pinned");

    clock.advance(1);
    assert!(cache.get("p1").unwrap().is_none(), "gone once the lifetime elapses");
}

#[test]
fn expiry_is_independent_per_entry() {
    let clock = ManualClock::at(0);
    let cache: InspectionCache<i32> =
        InspectionCache::new(THREE_MINUTES_MS, Arc::clone(&clock) as Arc<dyn Clock>);
    cache.insert("early", 1).unwrap();
    clock.advance(100_000);
    cache.insert("late", 2).unwrap();

    clock.advance(THREE_MINUTES_MS - 100_000);
    assert!(cache.get("early").unwrap().is_none());
    assert_eq!(*cache.get("late").unwrap().unwrap(), 2);
}

#[test]
fn sweep_removes_only_expired_entries() {
    let clock = ManualClock::at(0);
    let cache: InspectionCache<i32> =
        InspectionCache::new(THREE_MINUTES_MS, Arc::clone(&clock) as Arc<dyn Clock>);
    cache.insert("old", 1).unwrap();
    clock.advance(100_000);
    cache.insert("fresh", 2).unwrap();
    clock.advance(THREE_MINUTES_MS - 100_000);

    assert_eq!(cache.sweep().unwrap(), 1);
    assert_eq!(cache.len().unwrap(), 1);
    assert!(cache.get("fresh").unwrap().is_some());
}

#[test]
fn reinsertion_repins_the_entry() {
    let clock = ManualClock::at(0);
    let cache: InspectionCache<i32> =
        InspectionCache::new(THREE_MINUTES_MS, Arc::clone(&clock) as Arc<dyn Clock>);
    cache.insert("p1", 1).unwrap();
    clock.advance(THREE_MINUTES_MS - 10);
    cache.insert("p1", 2).unwrap();
    clock.advance(THREE_MINUTES_MS - 10);
    assert_eq!(*cache.get("p1").unwrap().unwrap(), 2);
}

// ------------- Write-back session cache -------------

#[test]
fn mutations_accumulate_in_memory() {
    let clock = ManualClock::at(10_000);
    let cache = SessionCache::new(Arc::clone(&clock) as Arc<dyn Clock>);
    cache.start_session("p1", "s1").unwrap();
    clock.advance(5_000);
    cache.add_afk("p1", 2_000).unwrap();
    cache.add_afk("p1", 1_000).unwrap();

    let session = cache.get("p1").unwrap().unwrap();
    assert_eq!(session.server_uuid, "s1");
    assert_eq!(session.start_ms, 10_000);
    assert_eq!(session.afk_ms, 3_000);
    assert!(session.ended_ms.is_none());
}

#[test]
fn flush_snapshots_dirty_entries_and_acknowledgement_cleans_them() {
    let clock = ManualClock::at(0);
    let cache = SessionCache::new(Arc::clone(&clock) as Arc<dyn Clock>);
    cache.start_session("p1", "s1").unwrap();

    let (_, keys) = cache.flush_transaction().unwrap().expect("dirty state");
    assert_eq!(keys.len(), 1);
    cache.mark_flushed(&keys).unwrap();
    // nothing dirty: the next cycle has nothing to write
    assert!(cache.flush_transaction().unwrap().is_none());
    // the session is still active and still in memory
    assert!(cache.get("p1").unwrap().is_some());
}

#[test]
fn ended_sessions_leave_memory_once_their_flush_commits() {
    let clock = ManualClock::at(0);
    let cache = SessionCache::new(Arc::clone(&clock) as Arc<dyn Clock>);
    cache.start_session("p1", "s1").unwrap();
    cache.end_session("p1").unwrap();

    let (_, keys) = cache.flush_transaction().unwrap().expect("dirty state");
    cache.mark_flushed(&keys).unwrap();
    assert!(cache.get("p1").unwrap().is_none());
    assert!(cache.is_empty().unwrap());
}

#[test]
fn mutations_racing_a_flush_stay_dirty() {
    let clock = ManualClock::at(0);
    let cache = SessionCache::new(Arc::clone(&clock) as Arc<dyn Clock>);
    cache.start_session("p1", "s1").unwrap();

    let (_, keys) = cache.flush_transaction().unwrap().expect("dirty state");
    // a mutation lands while the flush is in flight
    cache.add_afk("p1", 500).unwrap();
    cache.mark_flushed(&keys).unwrap();
    // the acknowledgement must not swallow the newer mutation
    assert!(cache.flush_transaction().unwrap().is_some());
}

#[test]
fn replacement_sessions_racing_a_flush_stay_dirty() {
    let clock = ManualClock::at(0);
    let cache = SessionCache::new(Arc::clone(&clock) as Arc<dyn Clock>);
    cache.start_session("p1", "s1").unwrap();

    let (_, keys) = cache.flush_transaction().unwrap().expect("dirty state");
    // the player relogs while the flush is in flight; the snapshotted
    // session is gone and a brand-new one sits in its slot
    clock.advance(1_000);
    cache.start_session("p1", "s2").unwrap();
    cache.mark_flushed(&keys).unwrap();

    // the replacement has never been written and must reach the next cycle
    let (_, keys) = cache
        .flush_transaction()
        .unwrap()
        .expect("replacement session stays dirty");
    assert_eq!(keys.len(), 1);
    let session = cache.get("p1").unwrap().unwrap();
    assert_eq!(session.server_uuid, "s2");
    assert_eq!(session.start_ms, 1_000);
}

#[test]
fn idle_eviction_spares_dirty_entries() {
    let clock = ManualClock::at(0);
    let cache = SessionCache::new(Arc::clone(&clock) as Arc<dyn Clock>);
    cache.start_session("stale", "s1").unwrap();
    cache.start_session("busy", "s1").unwrap();

    let (_, keys) = cache.flush_transaction().unwrap().expect("dirty state");
    cache.mark_flushed(&keys).unwrap();
    // both clean now; only "busy" keeps being touched
    clock.advance(60_000);
    cache.touch("busy").unwrap();
    clock.advance(60_000);

    let evicted = cache.evict_idle(90_000).unwrap();
    assert_eq!(evicted, 1);
    assert!(cache.get("stale").unwrap().is_none());
    assert!(cache.get("busy").unwrap().is_some());

    // a dirty entry survives eviction no matter how idle
    cache.add_afk("busy", 1).unwrap();
    clock.advance(1_000_000);
    assert_eq!(cache.evict_idle(90_000).unwrap(), 0);
}
