//! Property tests over random call sequences against one canary.

use std::sync::Arc;

use canary_switch::canary::facade::{Canary, CanarySpec};
use canary_switch::canary::hook::{AnnounceAction, DeathHook};
use canary_switch::canary::types::{CanaryType, Operation};
use canary_switch::core::clock::ManualClock;
use canary_switch::core::errors::CanaryError;
use canary_switch::daemon::notifications::MemorySink;
use proptest::prelude::*;

const FEEDERS: [&str; 2] = ["alice", "bob"];
const CALLERS: [&str; 3] = ["alice", "bob", "mallory"];

#[derive(Debug, Clone)]
struct Step {
    op: Operation,
    caller: &'static str,
    advance: u64,
}

fn arb_step() -> impl Strategy<Value = Step> {
    (
        prop_oneof![
            4 => Just(Operation::Feed),
            1 => Just(Operation::Poison),
            4 => Just(Operation::Touch),
            1 => Just(Operation::Query),
        ],
        0..CALLERS.len(),
        0_u64..15,
    )
        .prop_map(|(op, caller, advance)| Step {
            op,
            caller: CALLERS[caller],
            advance,
        })
}

fn hatch(interval: u64, hook: DeathHook) -> (Canary, Arc<ManualClock>, Arc<MemorySink>) {
    let spec = CanarySpec {
        name: "prop".to_string(),
        canary_type: CanaryType::MultipleFeeders,
        feeding_interval: interval,
        feeders: FEEDERS.iter().map(|f| (*f).to_string()).collect(),
    };
    let clock = Arc::new(ManualClock::new(1_000));
    let sink = Arc::new(MemorySink::new());
    let canary = Canary::new(&spec, hook, clock.clone(), sink.clone()).expect("valid spec");
    (canary, clock, sink)
}

fn is_feeder(caller: &str) -> bool {
    FEEDERS.contains(&caller)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Liveness and the death timestamp always agree, and the timestamp is
    /// fixed once set.
    #[test]
    fn death_timestamp_tracks_liveness(
        interval in 1_u64..20,
        steps in prop::collection::vec(arb_step(), 1..60)
    ) {
        let (canary, clock, _sink) = hatch(interval, DeathHook::NoOp);
        let mut first_death = None;
        for step in steps {
            clock.advance(step.advance);
            let _ = canary.dispatch(step.op, step.caller);

            let ts = canary.death_timestamp();
            prop_assert_eq!(canary.is_alive(), ts == 0);
            match first_death {
                None if ts != 0 => first_death = Some(ts),
                Some(prev) => prop_assert_eq!(prev, ts),
                None => {}
            }
        }
    }

    /// At most one death notice per canary, and one exactly when it is dead.
    #[test]
    fn death_is_announced_at_most_once(
        interval in 1_u64..20,
        steps in prop::collection::vec(arb_step(), 1..60)
    ) {
        let (canary, clock, sink) = hatch(interval, DeathHook::NoOp);
        for step in steps {
            clock.advance(step.advance);
            let _ = canary.dispatch(step.op, step.caller);
            prop_assert!(sink.deaths() <= 1);
            prop_assert_eq!(sink.deaths() == 1, !canary.is_alive());
        }
    }

    /// A successful feed records its own time; a starving feed records nothing.
    #[test]
    fn feed_sets_last_fed_only_on_success(
        interval in 1_u64..20,
        steps in prop::collection::vec(arb_step(), 1..60)
    ) {
        let (canary, clock, _sink) = hatch(interval, DeathHook::NoOp);
        for step in steps {
            let now = clock.advance(step.advance);
            if step.op != Operation::Feed {
                let _ = canary.dispatch(step.op, step.caller);
                continue;
            }
            let before = canary.time_last_fed();
            match canary.feed(step.caller) {
                Ok(fed_at) => {
                    prop_assert_eq!(fed_at, now);
                    prop_assert_eq!(canary.time_last_fed(), now);
                }
                Err(_) => prop_assert_eq!(canary.time_last_fed(), before),
            }
        }
    }

    /// Touch never renews the canary.
    #[test]
    fn touch_never_moves_last_fed(
        interval in 1_u64..20,
        steps in prop::collection::vec(arb_step(), 1..60)
    ) {
        let (canary, clock, _sink) = hatch(interval, DeathHook::NoOp);
        for step in steps {
            clock.advance(step.advance);
            let before = canary.time_last_fed();
            let response = canary.dispatch(step.op, step.caller);
            if step.op == Operation::Touch {
                prop_assert!(response.ok);
                prop_assert_eq!(canary.time_last_fed(), before);
            }
        }
    }

    /// Outsiders are refused with no state change and no notice.
    #[test]
    fn outsiders_change_nothing(
        interval in 1_u64..20,
        steps in prop::collection::vec(arb_step(), 1..60)
    ) {
        let (canary, clock, sink) =
            hatch(interval, DeathHook::custom(AnnounceAction::new("gone")));
        for step in steps {
            clock.advance(step.advance);
            let gated = matches!(step.op, Operation::Feed | Operation::Poison);
            if !gated || is_feeder(step.caller) {
                let _ = canary.dispatch(step.op, step.caller);
                continue;
            }

            let before = canary.snapshot();
            let events_before = sink.len();
            let result = match step.op {
                Operation::Feed => canary.feed(step.caller).map(|_| ()),
                _ => canary.poison(step.caller).map(|_| ()),
            };
            let refused = matches!(result, Err(CanaryError::Unauthorized { .. }));
            prop_assert!(refused, "outsider call was not refused: {:?}", result);
            prop_assert_eq!(canary.snapshot(), before);
            prop_assert_eq!(sink.len(), events_before);
        }
    }

    /// Once dead, touch keeps reporting dead and never re-announces.
    #[test]
    fn dead_canary_touches_are_silent(
        interval in 1_u64..20,
        warmup in prop::collection::vec(arb_step(), 0..20),
        touches in prop::collection::vec(0_u64..50, 1..20)
    ) {
        let (canary, clock, sink) =
            hatch(interval, DeathHook::custom(AnnounceAction::new("gone")));
        for step in warmup {
            clock.advance(step.advance);
            let _ = canary.dispatch(step.op, step.caller);
        }
        if canary.is_alive() {
            canary.poison("alice").expect("feeder may poison a live canary");
        }

        let events = sink.len();
        let death = canary.death_timestamp();
        for advance in touches {
            clock.advance(advance);
            prop_assert!(!canary.touch("anyone").expect("touch on a dead canary"));
            prop_assert_eq!(sink.len(), events);
            prop_assert_eq!(canary.death_timestamp(), death);
        }
    }
}
