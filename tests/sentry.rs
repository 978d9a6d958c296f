#[macro_use]
extern crate nonzero_ext;
extern crate admission_meter;

use admission_meter::test_utilities::{client_keys, eventually, quick_settings};
use admission_meter::{
    AdmissionOrder, Config, Decision, Driver, InProcessDriver, Result, Sentry, Settings,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const PATIENCE: Duration = Duration::from_secs(5);

fn sentry(order: AdmissionOrder) -> Sentry<InProcessDriver> {
    let settings = Config::builder()
        .window(Duration::from_secs(60))
        .limits(nonzero!(3u64), nonzero!(5u64))
        .ban_for(Duration::from_secs(60))
        .order(order)
        .build()
        .unwrap();
    Sentry::with_settings(settings, InProcessDriver::new()).unwrap()
}

#[test]
fn count_then_check_scenario() {
    let sentry = sentry(AdmissionOrder::CountThenCheck);
    let decisions: Vec<Decision> = (0..7).map(|_| sentry.check("192.0.2.7")).collect();
    assert_eq!(
        vec![
            Decision::Admit { count: 1 },
            Decision::Admit { count: 2 },
            Decision::Admit { count: 3 },
            Decision::Throttle { count: 4 },
            Decision::Ban,
            Decision::Banned,
            Decision::Banned,
        ],
        decisions
    );
    // Other keys are unaffected.
    assert_eq!(Decision::Admit { count: 1 }, sentry.check("192.0.2.8"));
}

#[test]
fn check_then_count_scenario() {
    let sentry = sentry(AdmissionOrder::CheckThenCount);
    let decisions: Vec<Decision> = (0..7).map(|_| sentry.check("192.0.2.7")).collect();
    assert_eq!(
        vec![
            Decision::Admit { count: 1 },
            Decision::Admit { count: 2 },
            Decision::Admit { count: 3 },
            Decision::Admit { count: 4 },
            Decision::Throttle { count: 5 },
            Decision::Ban,
            Decision::Banned,
        ],
        decisions
    );
}

#[test]
fn below_soft_limit_is_never_denied() {
    let sentry = Sentry::new(&Config::default(), InProcessDriver::new()).unwrap();
    for key in client_keys(20) {
        for _ in 0..120 {
            assert!(sentry.handle(&key));
        }
    }
}

#[test]
fn bans_end_with_a_fresh_count() {
    let settings = quick_settings(
        Duration::from_secs(60),
        nonzero!(1u64),
        nonzero!(2u64),
        Duration::from_millis(100),
    );
    let sentry = Sentry::with_settings(settings, InProcessDriver::new()).unwrap();
    assert_eq!(Decision::Admit { count: 1 }, sentry.check("k"));
    assert_eq!(Decision::Ban, sentry.check("k"));
    assert_eq!(Decision::Banned, sentry.check("k"));

    assert!(eventually(PATIENCE, || !sentry
        .driver()
        .is_banned("k")
        .unwrap()));
    assert_eq!(Decision::Admit { count: 1 }, sentry.check("k"));
}

#[test]
fn unban_lifts_ban() {
    let sentry = sentry(AdmissionOrder::CountThenCheck);
    for _ in 0..5 {
        sentry.check("k");
    }
    assert_eq!(Decision::Banned, sentry.check("k"));
    assert_eq!(0, sentry.unban("k").unwrap());
    assert_eq!(0, sentry.rate("k").unwrap());
    assert_eq!(Decision::Admit { count: 1 }, sentry.check("k"));
}

#[test]
fn deny_handler_sees_denials() {
    let denials = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&denials);
    let sentry = sentry(AdmissionOrder::CountThenCheck).with_deny_handler(move |key, decision| {
        assert_eq!("k", key);
        assert!(decision.is_denied());
        seen.fetch_add(1, Ordering::SeqCst);
    });
    let admitted = (0..10).filter(|_| sentry.handle("k")).count();
    assert_eq!(3, admitted);
    assert_eq!(7, denials.load(Ordering::SeqCst));
}

#[test]
fn rate_reports_count() {
    let sentry = sentry(AdmissionOrder::CountThenCheck);
    assert_eq!(0, sentry.rate("k").unwrap());
    sentry.check("k");
    sentry.check("k");
    assert_eq!(2, sentry.rate("k").unwrap());
}

#[test]
fn invalid_config_is_rejected() {
    let config = Config {
        soft_limit: nonzero!(10u64),
        hard_limit: nonzero!(10u64),
        ..Config::default()
    };
    assert!(Sentry::new(&config, InProcessDriver::new()).is_err());
}

#[test]
fn shutdown_stops_counting() {
    let sentry = sentry(AdmissionOrder::CountThenCheck);
    assert_eq!(Decision::Admit { count: 1 }, sentry.check("k"));
    sentry.shutdown();
    // The driver refuses to count now; requests are let through.
    assert_eq!(Decision::Unavailable, sentry.check("k"));
}

/// An in-process driver that counts how often it is asked to collect
/// garbage.
#[derive(Default)]
struct CountingCollections {
    inner: InProcessDriver,
    collections: Arc<AtomicUsize>,
}

impl Driver for CountingCollections {
    fn init(&self, window: Duration) -> Result<()> {
        self.inner.init(window)
    }

    fn add_request(&self, key: &str) -> Result<u64> {
        self.inner.add_request(key)
    }

    fn request_rate(&self, key: &str) -> Result<u64> {
        self.inner.request_rate(key)
    }

    fn remove_ip(&self, key: &str) -> Result<u64> {
        self.inner.remove_ip(key)
    }

    fn ban(&self, key: &str, duration: Duration) -> Result<bool> {
        self.inner.ban(key, duration)
    }

    fn is_banned(&self, key: &str) -> Result<bool> {
        self.inner.is_banned(key)
    }

    fn admit(&self, key: &str, settings: &Settings) -> Result<Decision> {
        self.inner.admit(key, settings)
    }

    fn collect_garbage(&self) {
        self.collections.fetch_add(1, Ordering::SeqCst);
        self.inner.collect_garbage();
    }

    fn shutdown(&self) {
        self.inner.shutdown();
    }
}

#[test]
fn drained_ban_list_collects_garbage_once() {
    let ban = Duration::from_millis(100);
    let settings = quick_settings(Duration::from_secs(60), nonzero!(1u64), nonzero!(2u64), ban);
    let driver = CountingCollections::default();
    let collections = Arc::clone(&driver.collections);
    let sentry = Sentry::with_settings(settings, driver).unwrap();

    assert_eq!(Decision::Admit { count: 1 }, sentry.check("live"));

    // Idle before any ban: nothing to collect.
    thread::sleep(ban * 3);
    assert_eq!(0, collections.load(Ordering::SeqCst));

    for round in 1..=2 {
        let key = format!("offender-{}", round);
        sentry.check(&key);
        assert_eq!(Decision::Ban, sentry.check(&key));
        assert!(eventually(PATIENCE, || !sentry.driver().is_banned(&key).unwrap()));
        assert!(eventually(PATIENCE, || collections.load(Ordering::SeqCst) == round));

        // Further idle sleeps don't collect again.
        thread::sleep(ban * 5);
        assert_eq!(round, collections.load(Ordering::SeqCst));
    }
    assert_eq!(1, sentry.rate("live").unwrap());
}

#[cfg(feature = "shared_store")]
mod shared_store {
    use super::*;
    use admission_meter::{MemoryStore, SharedStoreDriver, Store, StoreError};

    type StoreResult<T> = std::result::Result<T, StoreError>;

    /// A store that is always down.
    struct Unreachable;

    impl Store for Unreachable {
        fn get(&self, _key: &str) -> StoreResult<Option<i64>> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        fn incr(&self, _key: &str) -> StoreResult<i64> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        fn decr(&self, _key: &str) -> StoreResult<i64> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        fn expire(&self, _key: &str, _ttl: Duration) -> StoreResult<bool> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        fn del(&self, _key: &str) -> StoreResult<u64> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        fn push(&self, _list: &str, _value: String) -> StoreResult<()> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        fn pop(&self, _list: &str) -> StoreResult<Option<String>> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    #[test]
    fn fails_open_when_store_is_down() {
        let sentry = Sentry::new(&Config::default(), SharedStoreDriver::new(Unreachable)).unwrap();
        for _ in 0..500 {
            assert_eq!(Decision::Unavailable, sentry.check("k"));
        }
        assert!(sentry.handle("k"));
        assert!(sentry.rate("k").is_err());
    }

    #[test]
    fn shared_store_scenario() {
        let settings = quick_settings(
            Duration::from_secs(60),
            nonzero!(3u64),
            nonzero!(5u64),
            Duration::from_millis(100),
        );
        let store = Arc::new(MemoryStore::new());
        let sentry =
            Sentry::with_settings(settings, SharedStoreDriver::new(Arc::clone(&store))).unwrap();
        for count in 1..=3 {
            assert_eq!(Decision::Admit { count }, sentry.check("k"));
        }
        assert_eq!(Decision::Throttle { count: 4 }, sentry.check("k"));
        assert_eq!(Decision::Ban, sentry.check("k"));
        assert_eq!(Decision::Banned, sentry.check("k"));

        assert!(eventually(PATIENCE, || !sentry
            .driver()
            .is_banned("k")
            .unwrap()));
        assert_eq!(Decision::Admit { count: 1 }, sentry.check("k"));
        assert_eq!(None, store.get("secure-ban-k").unwrap());
    }
}
