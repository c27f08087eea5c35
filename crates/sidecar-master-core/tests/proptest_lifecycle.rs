//! Property-based tests for the configuration lifecycle.
//!
//! Verifies:
//! 1. Status derivation is a pure function of presence and the startup flag
//! 2. Presence count stays within [0, expected] under any found/lost mix
//! 3. Entry status always equals the derivation from a simple presence model
//! 4. Every status-change event chains from the previous status
//! 5. A startup deadline is reported at most once

use proptest::prelude::*;
use sidecar_master_core::launcher::{ExternalLauncher, LaunchCompletion};
use sidecar_master_core::lifecycle::{
    ConfigurationEntry, LifecycleEvent, LifecycleStatus, LifecycleTiming,
};
use sidecar_master_core::status::RunnerId;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const RADAR: &str = "<radar><name>R</name><gateCountMax>10</gateCountMax>\
    <shaftEncodingMax>10</shaftEncodingMax><rotationRate>1</rotationRate>\
    <rangeMin>0</rangeMin><rangeMax>10</rangeMax><beamWidth>1</beamWidth></radar>";

const STARTUP_SECS: u64 = 30;

// ────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Op {
    Found(usize),
    Lost(usize),
    /// Advance the clock by this many seconds and fire timers.
    Advance(u64),
    /// A runner that is not part of the configuration reports in.
    Stranger,
}

fn arb_op(runners: usize) -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..runners).prop_map(Op::Found),
        3 => (0..runners).prop_map(Op::Lost),
        1 => (1u64..20).prop_map(Op::Advance),
        1 => Just(Op::Stranger),
    ]
}

fn arb_scenario() -> impl Strategy<Value = (usize, bool, Vec<Op>)> {
    (1usize..5, any::<bool>()).prop_flat_map(|(runners, start)| {
        (
            Just(runners),
            Just(start),
            prop::collection::vec(arb_op(runners), 0..40),
        )
    })
}

// ────────────────────────────────────────────────────────────────────
// Helpers
// ────────────────────────────────────────────────────────────────────

fn write_config(dir: &Path, runners: usize) -> PathBuf {
    let runners: String = (0..runners)
        .map(|i| format!(r#"<runner name="r{i}" host="n{i}"><stream/></runner>"#))
        .collect();
    let xml = format!(
        r#"<sidecar>{RADAR}<dp recordingsDirectory="{}">{runners}</dp></sidecar>"#,
        dir.display()
    );
    let path = dir.join("cfg.xml");
    std::fs::write(&path, xml).expect("write config");
    path
}

fn runner(i: usize) -> RunnerId {
    RunnerId::new("cfg", format!("n{i}"), format!("r{i}"))
}

fn timing() -> LifecycleTiming {
    LifecycleTiming {
        startup_timeout: Duration::from_secs(STARTUP_SECS),
        partial_confirm_delay: Duration::from_secs(1),
    }
}

// ────────────────────────────────────────────────────────────────────
// Properties
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn derive_matches_presence(presence in 0usize..10, extra in 0usize..10, starting in any::<bool>()) {
        let expected = presence + extra;
        let status = LifecycleStatus::derive(presence, expected, starting);
        match status {
            LifecycleStatus::Starting => prop_assert!(presence == 0 && starting),
            LifecycleStatus::NotRunning => prop_assert!(presence == 0 && !starting),
            LifecycleStatus::Partial => prop_assert!(presence > 0 && presence < expected),
            LifecycleStatus::Running => prop_assert!(presence > 0 && presence == expected),
            LifecycleStatus::Error => prop_assert!(false, "derive never yields Error"),
        }
        prop_assert_eq!(status.is_running(), presence > 0);
    }

    #[test]
    fn entry_tracks_presence_model((runners, start, ops) in arb_scenario()) {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut entry = ConfigurationEntry::new(write_config(dir.path(), runners), timing());
        entry.load().expect("load");
        entry.drain_events();

        let mut now = Instant::now();
        let mut model = vec![false; runners];
        let mut deadline = None;
        if start {
            entry
                .startup(&ExternalLauncher, LaunchCompletion::new("cfg", |_, _| {}), now)
                .expect("startup");
            deadline = Some(now + Duration::from_secs(STARTUP_SECS));
        }

        let mut last_status = entry.status();
        let mut deadline_reports = 0;
        for event in entry.drain_events() {
            if let LifecycleEvent::StatusChanged { to, .. } = event {
                last_status = to;
            }
        }

        for op in ops {
            match op {
                Op::Found(i) => {
                    entry.found_runner(&runner(i), false, now);
                    model[i] = true;
                }
                Op::Lost(i) => {
                    entry.lost_runner(&runner(i), now);
                    model[i] = false;
                }
                Op::Advance(secs) => {
                    now += Duration::from_secs(secs);
                    entry.poll(now);
                    if deadline.is_some_and(|d| now >= d) {
                        deadline = None;
                    }
                }
                Op::Stranger => {
                    entry.found_runner(&RunnerId::new("cfg", "elsewhere", "ghost"), false, now);
                }
            }
            let present = model.iter().filter(|p| **p).count();
            if present == runners {
                deadline = None;
            }

            prop_assert_eq!(entry.presence_count(), present);
            prop_assert!(entry.presence_count() <= entry.expected_count());
            prop_assert_eq!(
                entry.status(),
                LifecycleStatus::derive(present, runners, deadline.is_some())
            );

            for event in entry.drain_events() {
                match event {
                    LifecycleEvent::StatusChanged { from, to, .. } => {
                        prop_assert_eq!(from, last_status);
                        last_status = to;
                    }
                    LifecycleEvent::LaunchSucceeded { .. } | LifecycleEvent::LaunchFailed { .. } => {
                        deadline_reports += 1;
                    }
                    _ => {}
                }
            }
            prop_assert_eq!(last_status, entry.status());
        }
        prop_assert!(deadline_reports <= usize::from(start));
    }
}
