mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;

use tigris_guard::guard::policy::{MitigationAction, PolicyConfig, Thresholds};
use tigris_guard::guard::signal::{Event, RawPrivilegedEvent, SignalType};
use tigris_guard::guard::state::Mode;
use tigris_guard::guard::{DropReason, GuardEngine, Ingest};

use common::{Call, DownPolicyStore, MockApi, SwitchablePolicy, engine, engine_with_store};

const GUILD: u64 = 4242;
const ALERTS: u64 = 900;

fn secs(t0: DateTime<Utc>, s: i64) -> DateTime<Utc> {
    t0 + chrono::Duration::seconds(s)
}

fn policy(action: MitigationAction, thresholds: Thresholds) -> PolicyConfig {
    PolicyConfig {
        enabled: true,
        thresholds,
        time_window_seconds: 10,
        action,
        cooldown_seconds: 1,
        alert_channel_id: Some(ALERTS),
        ..Default::default()
    }
}

fn join_policy(threshold: u32) -> PolicyConfig {
    policy(
        MitigationAction::Kick,
        Thresholds {
            join: threshold,
            ..Default::default()
        },
    )
}

async fn mode_of(engine: &GuardEngine, signal: SignalType) -> Option<Mode> {
    engine
        .status(GUILD)
        .await
        .signals
        .into_iter()
        .find(|s| s.signal == signal)
        .map(|s| s.mode)
}

#[tokio::test]
async fn declares_exactly_on_threshold_event() {
    let api = MockApi::new();
    let engine = engine(api.clone(), join_policy(5));
    let t0 = Utc::now();

    for i in 1..=4u64 {
        match engine.ingest_join(GUILD, 100 + i, t0).await {
            Ingest::Recorded { count, threshold, mode } => {
                assert_eq!(count, i as usize);
                assert_eq!(threshold, 5);
                assert_eq!(mode, Mode::Idle);
            }
            other => panic!("join #{i}: unexpected {other:?}"),
        }
    }
    let Ingest::Declared(d) = engine.ingest_join(GUILD, 105, t0).await else {
        panic!("5th join must declare");
    };
    assert_eq!(d.count, 5);
    let report = d.mitigation.await.unwrap();
    assert_eq!(report.succeeded(), 5);

    // burst keeps going: no second episode
    let again = engine.ingest_join(GUILD, 106, t0).await;
    assert!(!again.is_declared());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_burst_declares_once() {
    let api = MockApi::new();
    let engine = engine(api.clone(), join_policy(5));
    let t0 = Utc::now();

    let tasks = (0..10u64).map(|i| {
        let engine = engine.clone();
        tokio::spawn(async move { engine.ingest_join(GUILD, 200 + i, t0).await })
    });
    let outcomes: Vec<Ingest> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let mut declared = 0;
    let mut tasks = Vec::new();
    for outcome in outcomes {
        match outcome {
            Ingest::Declared(d) => {
                declared += 1;
                assert_eq!(d.count, 5);
                tasks.push(d.mitigation);
            }
            Ingest::FollowUp(d) => tasks.push(d.mitigation),
            _ => {}
        }
    }
    assert_eq!(declared, 1);

    for t in tasks {
        t.await.unwrap();
    }
    // the five that crossed the line plus the five that kept the burst going
    let mut kicked = api.kicked();
    let total = kicked.len();
    kicked.sort_unstable();
    kicked.dedup();
    assert_eq!(kicked.len(), total, "an actor was kicked twice");
    assert_eq!(total, 10);
}

#[tokio::test]
async fn whitelisted_actor_never_counts_nor_gets_punished() {
    let api = MockApi::new();
    let mut p = join_policy(2);
    p.whitelisted_user_ids.insert(7);
    let engine = engine(api.clone(), p);
    let t0 = Utc::now();

    for _ in 0..5 {
        assert!(matches!(
            engine.ingest_join(GUILD, 7, t0).await,
            Ingest::Dropped(DropReason::Whitelisted)
        ));
    }
    assert!(matches!(
        engine.ingest_join(GUILD, 8, t0).await,
        Ingest::Recorded { count: 1, .. }
    ));
    let window = engine
        .registry()
        .count(GUILD, SignalType::Join, t0, Duration::from_secs(10));
    assert!(window.events.iter().all(|e| e.actor_id != 7));
    assert!(api.kicked().is_empty());
}

#[tokio::test]
async fn join_scenario_reevaluates_live_window_only() {
    let api = MockApi::new();
    let engine = engine(api.clone(), join_policy(3));
    let t0 = Utc::now();

    engine.ingest_join(GUILD, 1001, secs(t0, 0)).await;
    engine.ingest_join(GUILD, 1002, secs(t0, 2)).await;
    let Ingest::Declared(first) = engine.ingest_join(GUILD, 1003, secs(t0, 4)).await else {
        panic!("third join at t=4 must declare");
    };
    first.mitigation.await.unwrap();
    assert_eq!(mode_of(&engine, SignalType::Join).await, Some(Mode::Cooldown));

    // t=15: the first three are outside the 10s window
    let r = engine.ingest_join(GUILD, 1004, secs(t0, 15)).await;
    assert!(matches!(r, Ingest::Recorded { count: 1, .. }), "got {r:?}");
    assert_eq!(mode_of(&engine, SignalType::Join).await, Some(Mode::Idle));

    engine.ingest_join(GUILD, 1005, secs(t0, 16)).await;
    let Ingest::Declared(second) = engine.ingest_join(GUILD, 1006, secs(t0, 17)).await else {
        panic!("three live joins must declare again");
    };
    assert_ne!(first.episode, second.episode);
    second.mitigation.await.unwrap();

    let mut kicked = api.kicked();
    kicked.sort_unstable();
    assert_eq!(kicked, vec![1001, 1002, 1003, 1004, 1005, 1006]);
}

#[tokio::test]
async fn partial_kick_is_reported_and_still_reaches_cooldown() {
    let api = MockApi::new();
    api.unmanageable.lock().unwrap().insert(3002);
    let engine = engine(api.clone(), join_policy(3));
    let t0 = Utc::now();

    engine.ingest_join(GUILD, 3001, t0).await;
    engine.ingest_join(GUILD, 3002, t0).await;
    let Ingest::Declared(d) = engine.ingest_join(GUILD, 3003, t0).await else {
        panic!("expected declaration");
    };
    let report = d.mitigation.await.unwrap();

    assert_eq!(report.succeeded(), 2);
    assert_eq!(report.denied(), 1);
    assert!(report.is_partial());
    assert_eq!(mode_of(&engine, SignalType::Join).await, Some(Mode::Cooldown));

    let alerts = api.alerts();
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].contains("2 ok, 1 permission denied"), "{}", alerts[0]);
    assert!(alerts[0].contains("(partial)"));
    assert!(api.calls().iter().any(|c| matches!(c, Call::Dm(common::OWNER, _))));
}

#[tokio::test]
async fn dm_goes_out_before_the_ban() {
    let api = MockApi::new();
    let p = policy(
        MitigationAction::Ban,
        Thresholds {
            ban: 1,
            ..Default::default()
        },
    );
    let engine = engine(api.clone(), p);

    let ev = Event::privileged(66, SignalType::Ban, Some(5), Utc::now());
    let Ingest::Declared(d) = engine.ingest(GUILD, ev).await else {
        panic!("expected declaration");
    };
    d.mitigation.await.unwrap();

    let calls = api.calls();
    let dm = calls
        .iter()
        .position(|c| matches!(c, Call::Dm(66, _)))
        .expect("actor DM");
    let ban = calls
        .iter()
        .position(|c| matches!(c, Call::Ban(66, 0)))
        .expect("ban");
    assert!(dm < ban);
}

#[tokio::test]
async fn transient_failures_are_retried_then_given_up() {
    let api = MockApi::new();
    // one blip recovers, five outlast the 2-attempt budget
    api.transient.lock().unwrap().insert(11, 1);
    api.transient.lock().unwrap().insert(12, 5);
    let engine = engine(api.clone(), join_policy(2));
    let t0 = Utc::now();

    engine.ingest_join(GUILD, 11, t0).await;
    let Ingest::Declared(d) = engine.ingest_join(GUILD, 12, t0).await else {
        panic!("expected declaration");
    };
    let report = d.mitigation.await.unwrap();
    assert_eq!(report.succeeded(), 1);
    assert_eq!(report.gave_up(), 1);
    assert_eq!(api.kicked(), vec![11]);
    assert_eq!(mode_of(&engine, SignalType::Join).await, Some(Mode::Cooldown));
}

#[tokio::test]
async fn signal_types_are_independent() {
    let api = MockApi::new();
    let p = policy(
        MitigationAction::RemoveRoles,
        Thresholds {
            join: 3,
            channel_delete: 2,
            ..Default::default()
        },
    );
    let engine = engine(api.clone(), p);
    let t0 = Utc::now();

    engine
        .ingest(GUILD, Event::privileged(50, SignalType::ChannelDelete, Some(1), t0))
        .await;
    let Ingest::Declared(d) = engine
        .ingest(GUILD, Event::privileged(50, SignalType::ChannelDelete, Some(2), t0))
        .await
    else {
        panic!("expected declaration");
    };
    d.mitigation.await.unwrap();
    assert!(api.calls().contains(&Call::StripRoles(50)));

    engine.ingest_join(GUILD, 60, t0).await;
    assert_eq!(mode_of(&engine, SignalType::Join).await, Some(Mode::Idle));
    assert_eq!(
        mode_of(&engine, SignalType::ChannelDelete).await,
        Some(Mode::Cooldown)
    );
}

#[tokio::test]
async fn disabling_protection_resets_every_signal_and_blocks_new_episodes() {
    let api = MockApi::new();
    let mut p = policy(
        MitigationAction::Kick,
        Thresholds {
            join: 2,
            ban: 1,
            ..Default::default()
        },
    );
    p.cooldown_seconds = 300;
    p.whitelisted_user_ids.insert(7);
    let store = SwitchablePolicy::new(p);
    let engine = engine_with_store(api.clone(), store.clone());
    let t0 = Utc::now();

    engine.ingest_join(GUILD, 1, t0).await;
    let Ingest::Declared(joins) = engine.ingest_join(GUILD, 2, t0).await else {
        panic!("expected join declaration");
    };
    let Ingest::Declared(bans) = engine
        .ingest(GUILD, Event::privileged(50, SignalType::Ban, Some(3), t0))
        .await
    else {
        panic!("expected ban declaration");
    };
    joins.mitigation.await.unwrap();
    bans.mitigation.await.unwrap();
    assert_eq!(mode_of(&engine, SignalType::Join).await, Some(Mode::Cooldown));
    assert_eq!(mode_of(&engine, SignalType::Ban).await, Some(Mode::Cooldown));

    store.policy.lock().unwrap().enabled = false;
    // a whitelisted join is enough to apply the switch, and to every signal at once
    assert!(matches!(
        engine.ingest_join(GUILD, 7, t0).await,
        Ingest::Dropped(DropReason::Whitelisted)
    ));
    assert_eq!(mode_of(&engine, SignalType::Join).await, Some(Mode::Idle));
    assert_eq!(mode_of(&engine, SignalType::Ban).await, Some(Mode::Idle));

    for i in 10..20u64 {
        assert!(!engine.ingest_join(GUILD, i, t0).await.is_declared());
    }
    assert_eq!(api.kicked().len(), 3);
}

#[tokio::test]
async fn outage_records_nothing_and_recovery_starts_clean() {
    let api = MockApi::new();
    let mut p = policy(
        MitigationAction::Ban,
        Thresholds {
            ban: 5,
            ..Default::default()
        },
    );
    p.whitelisted_user_ids.insert(42);
    let store = SwitchablePolicy::new(p);
    let engine = engine_with_store(api.clone(), store.clone());
    let t0 = Utc::now();

    *store.down.lock().unwrap() = true;
    for target in 0..4u64 {
        let ev = Event::privileged(42, SignalType::Ban, Some(target), t0);
        assert!(matches!(
            engine.ingest(GUILD, ev).await,
            Ingest::Dropped(DropReason::PolicyUnavailable)
        ));
    }
    let window = engine
        .registry()
        .count(GUILD, SignalType::Ban, t0, Duration::from_secs(10));
    assert_eq!(window.count, 0);

    *store.down.lock().unwrap() = false;
    let ev = Event::privileged(7, SignalType::Ban, Some(99), t0);
    assert!(matches!(
        engine.ingest(GUILD, ev).await,
        Ingest::Recorded { count: 1, .. }
    ));
    assert!(api.calls().is_empty());
}

#[tokio::test]
async fn outage_does_not_tear_down_open_episode() {
    let api = MockApi::new();
    let mut p = join_policy(1);
    p.cooldown_seconds = 300;
    let store = SwitchablePolicy::new(p);
    let engine = engine_with_store(api.clone(), store.clone());

    let Ingest::Declared(d) = engine.ingest_join(GUILD, 1, Utc::now()).await else {
        panic!("expected declaration");
    };
    d.mitigation.await.unwrap();

    *store.down.lock().unwrap() = true;
    engine.ingest_join(GUILD, 2, Utc::now()).await;
    assert_eq!(mode_of(&engine, SignalType::Join).await, Some(Mode::Cooldown));
}

#[tokio::test]
async fn finished_burst_left_in_long_window_does_not_rearm() {
    let api = MockApi::new();
    let mut p = join_policy(3);
    p.time_window_seconds = 60;
    p.cooldown_seconds = 1;
    let engine = engine(api.clone(), p);
    let t0 = Utc::now();

    for user in [1, 2] {
        engine.ingest_join(GUILD, user, t0).await;
    }
    let Ingest::Declared(d) = engine.ingest_join(GUILD, 3, t0).await else {
        panic!("expected declaration");
    };
    d.mitigation.await.unwrap();

    // cooldown long over, the three joins still inside the 60s window
    let lone = engine.ingest_join(GUILD, 999, secs(t0, 5)).await;
    assert!(matches!(lone, Ingest::Recorded { count: 1, mode: Mode::Idle, .. }), "got {lone:?}");
    assert_eq!(api.kicked(), vec![1, 2, 3]);

    // a real second wave is still caught, and only the new actors are hit
    engine.ingest_join(GUILD, 1000, secs(t0, 6)).await;
    let Ingest::Declared(second) = engine.ingest_join(GUILD, 1001, secs(t0, 7)).await else {
        panic!("three fresh joins must declare");
    };
    second.mitigation.await.unwrap();
    let mut kicked = api.kicked();
    kicked.sort_unstable();
    assert_eq!(kicked, vec![1, 2, 3, 999, 1000, 1001]);
}

#[tokio::test]
async fn burst_continuing_into_cooldown_is_mitigated_under_same_episode() {
    let api = MockApi::new();
    let mut p = join_policy(3);
    p.time_window_seconds = 60;
    p.cooldown_seconds = 300;
    let engine = engine(api.clone(), p);
    let t0 = Utc::now();

    for user in [1, 2] {
        engine.ingest_join(GUILD, user, t0).await;
    }
    let Ingest::Declared(first) = engine.ingest_join(GUILD, 3, t0).await else {
        panic!("expected declaration");
    };
    first.mitigation.await.unwrap();

    // a single newcomer during cooldown is left alone
    assert!(matches!(
        engine.ingest_join(GUILD, 4, secs(t0, 1)).await,
        Ingest::Recorded { count: 1, mode: Mode::Cooldown, .. }
    ));
    engine.ingest_join(GUILD, 5, secs(t0, 1)).await;
    let Ingest::FollowUp(late) = engine.ingest_join(GUILD, 6, secs(t0, 1)).await else {
        panic!("burst kept going: late actors must be picked up");
    };
    assert_eq!(late.episode, first.episode);
    late.mitigation.await.unwrap();

    let mut kicked = api.kicked();
    kicked.sort_unstable();
    assert_eq!(kicked, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(mode_of(&engine, SignalType::Join).await, Some(Mode::Cooldown));
}

#[tokio::test]
async fn unavailable_policy_fails_safe() {
    let api = MockApi::new();
    let engine = engine_with_store(api.clone(), Arc::new(DownPolicyStore));
    let t0 = Utc::now();

    for i in 0..50u64 {
        assert!(!engine.ingest_join(GUILD, i, t0).await.is_declared());
    }
    assert!(api.calls().is_empty());
    assert!(engine.registry().is_empty());
}

#[tokio::test]
async fn unknown_signal_and_own_actions_are_dropped() {
    let api = MockApi::new();
    let engine = engine(api.clone(), join_policy(1));
    engine.set_self_id(777);

    let raw = RawPrivilegedEvent {
        guild_id: GUILD,
        actor_id: 5,
        signal_type: "webhookUpdate".into(),
        target_id: None,
        timestamp: Utc::now(),
    };
    assert!(matches!(
        engine.ingest_privileged(raw).await,
        Ingest::Dropped(DropReason::UnknownSignal)
    ));

    let own = Event::privileged(777, SignalType::Kick, Some(9), Utc::now());
    assert!(matches!(
        engine.ingest(GUILD, own).await,
        Ingest::Dropped(DropReason::OwnAction)
    ));

    let raw = RawPrivilegedEvent {
        guild_id: GUILD,
        actor_id: 5,
        signal_type: "roleDelete".into(),
        target_id: Some(3),
        timestamp: Utc::now(),
    };
    assert!(matches!(
        engine.ingest_privileged(raw).await,
        Ingest::Recorded { count: 1, .. }
    ));
}

#[tokio::test]
async fn cooldown_timer_returns_state_to_idle() {
    let api = MockApi::new();
    let engine = engine(api.clone(), join_policy(1));

    let Ingest::Declared(d) = engine.ingest_join(GUILD, 1, Utc::now()).await else {
        panic!("expected declaration");
    };
    d.mitigation.await.unwrap();
    assert_eq!(mode_of(&engine, SignalType::Join).await, Some(Mode::Cooldown));

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(mode_of(&engine, SignalType::Join).await, Some(Mode::Idle));
}

#[tokio::test]
async fn shutdown_cancels_cooldown_timers() {
    let api = MockApi::new();
    let engine = engine(api.clone(), join_policy(1));

    let Ingest::Declared(d) = engine.ingest_join(GUILD, 1, Utc::now()).await else {
        panic!("expected declaration");
    };
    d.mitigation.await.unwrap();
    engine.shutdown().await;

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    // no timer left to move it; the state only changes on the next event
    assert_eq!(mode_of(&engine, SignalType::Join).await, Some(Mode::Cooldown));
}

#[tokio::test]
async fn forget_guild_drops_everything() {
    let api = MockApi::new();
    let engine = engine(api.clone(), join_policy(10));
    engine.ingest_join(GUILD, 1, Utc::now()).await;
    assert_eq!(engine.status(GUILD).await.signals.len(), 1);

    engine.forget_guild(GUILD).await;
    let status = engine.status(GUILD).await;
    assert!(status.signals.is_empty());
    assert!(status.lockdown.is_none());
    assert!(engine.registry().is_empty());
}
