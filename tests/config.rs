#[macro_use]
extern crate nonzero_ext;
extern crate admission_meter;

use admission_meter::clock::{self, Clock, FakeAbsoluteClock, Reference};
use admission_meter::blacklist::Blacklist;
use admission_meter::{AdmissionOrder, Config, Error, InProcessDriver, Sentry, Settings};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn defaults() {
    let config = Config::default();
    assert_eq!(Duration::from_secs(60), config.window());
    assert_eq!(Duration::from_secs(1800), config.ban_duration());
    assert_eq!(nonzero!(120u64), config.limits().soft);
    assert_eq!(nonzero!(300u64), config.limits().hard);
    assert_eq!(AdmissionOrder::CountThenCheck, config.order);
    config.validate().unwrap();

    let parsed: Config = serde_json::from_str("{}").unwrap();
    assert_eq!(config, parsed);
}

#[test]
fn deserializes_all_fields() {
    let config: Config = serde_json::from_str(
        r#"{
            "window_secs": 10,
            "soft_limit": 5,
            "hard_limit": 8,
            "ban_duration_secs": 90,
            "order": "check_then_count"
        }"#,
    )
    .unwrap();
    let settings = Settings::try_from(&config).unwrap();
    assert_eq!(Duration::from_secs(10), settings.window);
    assert_eq!(Duration::from_secs(90), settings.ban_duration);
    assert_eq!(nonzero!(5u64), settings.limits.soft);
    assert_eq!(nonzero!(8u64), settings.limits.hard);
    assert_eq!(AdmissionOrder::CheckThenCount, settings.limits.order);
}

#[test]
fn zero_limits_do_not_parse() {
    assert!(serde_json::from_str::<Config>(r#"{"soft_limit": 0}"#).is_err());
}

#[test]
fn rejects_inconsistent_settings() {
    let inverted = Config {
        soft_limit: nonzero!(20u64),
        hard_limit: nonzero!(10u64),
        ..Config::default()
    };
    assert!(matches!(inverted.validate(), Err(Error::InvalidConfig(_))));

    let no_window = Config {
        window_secs: 0,
        ..Config::default()
    };
    assert!(matches!(no_window.validate(), Err(Error::InvalidConfig(_))));

    let no_ban = Config::builder().ban_for(Duration::new(0, 0)).build();
    assert!(matches!(no_ban, Err(Error::InvalidConfig(_))));
}

#[test]
fn rejects_out_of_range_durations() {
    let endless_ban = Config {
        soft_limit: nonzero!(1u64),
        hard_limit: nonzero!(2u64),
        ban_duration_secs: u64::MAX,
        ..Config::default()
    };
    assert!(matches!(endless_ban.validate(), Err(Error::InvalidConfig(_))));
    assert!(matches!(
        Sentry::new(&endless_ban, InProcessDriver::new()),
        Err(Error::InvalidConfig(_))
    ));

    let endless_window = Config {
        window_secs: u64::MAX,
        ..Config::default()
    };
    assert!(matches!(endless_window.validate(), Err(Error::InvalidConfig(_))));

    let built = Config::builder().window(Duration::MAX).build();
    assert!(matches!(built, Err(Error::InvalidConfig(_))));

    let blacklist = Blacklist::start(Arc::new(InProcessDriver::new()), Duration::MAX);
    assert!(matches!(blacklist, Err(Error::InvalidConfig(_))));
}

#[test]
fn builder_allows_subsecond_timings() {
    let settings = Config::builder()
        .window(Duration::from_millis(250))
        .ban_for(Duration::from_millis(500))
        .limits(nonzero!(1u64), nonzero!(2u64))
        .build()
        .unwrap();
    assert_eq!(Duration::from_millis(250), settings.window);
    assert_eq!(Duration::from_millis(500), settings.ban_duration);
}

#[test]
fn remaining_time_with_fake_clock() {
    let clock = FakeAbsoluteClock::default();
    let window = Duration::from_secs(60);
    let start = clock.now();

    assert_eq!(Some(window), clock::remaining(window, start, clock.now()));
    clock.advance(Duration::from_secs(45));
    assert_eq!(
        Some(Duration::from_secs(15)),
        clock::remaining(window, start, clock.now())
    );
    clock.advance(Duration::from_secs(15));
    assert_eq!(None, clock::remaining(window, start, clock.now()));
    clock.advance(Duration::from_secs(15));
    assert_eq!(None, clock::remaining(window, start, clock.now()));

    // Stamps from the future wait the full period.
    assert_eq!(Some(window), clock::remaining(window, clock.now(), start));
}

#[test]
fn fake_clock_clones_share_now() {
    let clock = FakeAbsoluteClock::default();
    let other = clock.clone();
    let before = other.now();
    clock.advance(Duration::from_secs(3));
    assert_eq!(Duration::from_secs(3), Reference::duration_since(&other.now(), before));
}
