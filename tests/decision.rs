#[macro_use]
extern crate nonzero_ext;
extern crate admission_meter;

use admission_meter::decision::{decide, verdict, Verdict};
use admission_meter::store::CounterState;
use admission_meter::{AdmissionOrder, Decision, Limits};

fn limits(order: AdmissionOrder) -> Limits {
    Limits {
        soft: nonzero!(3u64),
        hard: nonzero!(5u64),
        order,
    }
}

#[test]
fn count_then_check_thresholds() {
    let limits = limits(AdmissionOrder::CountThenCheck);
    assert_eq!(Verdict::Admit, verdict(&limits, 0));
    assert_eq!(Verdict::Admit, verdict(&limits, 2));
    assert_eq!(Verdict::Throttle, verdict(&limits, 3));
    assert_eq!(Verdict::Ban, verdict(&limits, 4));
    assert_eq!(Verdict::Ban, verdict(&limits, 100));
}

#[test]
fn check_then_count_thresholds() {
    let limits = limits(AdmissionOrder::CheckThenCount);
    assert_eq!(Verdict::Admit, verdict(&limits, 3));
    assert_eq!(Verdict::Throttle, verdict(&limits, 4));
    assert_eq!(Verdict::Ban, verdict(&limits, 5));
}

#[test]
fn count_then_check_sequence() {
    let limits = limits(AdmissionOrder::CountThenCheck);
    let mut state = CounterState::default();
    let decisions: Vec<Decision> = (0..7).map(|_| decide(&mut state, &limits)).collect();
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
    assert!(state.is_banned());
    assert_eq!(0, state.rate());
}

#[test]
fn check_then_count_sequence() {
    let limits = limits(AdmissionOrder::CheckThenCount);
    let mut state = CounterState::default();
    let decisions: Vec<Decision> = (0..7).map(|_| decide(&mut state, &limits)).collect();
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
fn decision_predicates() {
    assert!(Decision::Admit { count: 1 }.is_admitted());
    assert!(Decision::Unavailable.is_admitted());
    assert!(Decision::Throttle { count: 4 }.is_denied());
    assert!(Decision::Ban.is_denied());
    assert!(Decision::Banned.is_denied());

    assert!(Decision::Throttle { count: 4 }.is_counted());
    assert!(!Decision::Ban.is_counted());
    assert!(!Decision::Banned.is_counted());
    assert!(!Decision::Unavailable.is_counted());

    assert_eq!(Some(4), Decision::Throttle { count: 4 }.count());
    assert_eq!(None, Decision::Banned.count());
}
