//! Property-based tests for recording session bookkeeping.
//!
//! Verifies:
//! 1. Session names round-trip through Display/FromStr
//! 2. Names with the wrong shape are rejected
//! 3. Sidecar render/parse round-trip for well-formed notes
//! 4. Elapsed-time text matches the seconds it was built from
//! 5. Restore continues numbering above every observed sequence
//! 6. Restore reports exactly the sessions without readable notes

use chrono::{NaiveDate, NaiveDateTime};
use proptest::prelude::*;
use sidecar_master_core::recording::{
    RecordingController, SIDECAR_FILE_NAME, SessionName, SessionNotes, Sidecar, format_elapsed,
};
use std::collections::BTreeMap;

// ────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────

fn arb_stamp() -> impl Strategy<Value = NaiveDateTime> {
    (2000i32..2100, 1u32..=12, 1u32..=28, 0u32..24, 0u32..60, 0u32..60).prop_map(
        |(year, month, day, hour, minute, second)| {
            NaiveDate::from_ymd_opt(year, month, day)
                .and_then(|date| date.and_hms_opt(hour, minute, second))
                .expect("valid stamp")
        },
    )
}

fn arb_session_name() -> impl Strategy<Value = SessionName> {
    (arb_stamp(), 0u32..1_000_000, any::<bool>()).prop_map(|(stamp, sequence, calibration)| {
        SessionName {
            stamp,
            sequence,
            calibration,
        }
    })
}

fn arb_word() -> impl Strategy<Value = String> {
    "[A-Za-z0-9_.]{1,10}"
}

fn arb_notes() -> impl Strategy<Value = SessionNotes> {
    (
        prop::option::of(1u32..20_000),
        prop::option::of(0u32..60),
        prop::option::of("[A-Za-z0-9_. -]{0,24}"),
        "[a-zA-Z0-9 :*\n]{0,80}",
    )
        .prop_map(|(frequency, rate, drfm, text)| SessionNotes {
            radar_transmitting: frequency.map(f64::from),
            radar_rotating: rate.map(f64::from),
            drfm,
            text,
        })
}

fn arb_sidecar() -> impl Strategy<Value = Sidecar> {
    (
        prop::collection::vec(arb_word(), 0..4),
        0i64..400_000,
        0u64..1_000_000,
        0u64..1_000_000,
        arb_notes(),
    )
        .prop_map(|(configurations, seconds, drop_count, dupe_count, notes)| Sidecar {
            configurations,
            duration: format_elapsed(seconds),
            drop_count,
            dupe_count,
            notes,
        })
}

// ────────────────────────────────────────────────────────────────────
// Properties
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn session_name_round_trip(name in arb_session_name()) {
        let text = name.to_string();
        let parsed: SessionName = text.parse().expect("parse");
        prop_assert_eq!(parsed, name);
        prop_assert_eq!(text.ends_with("-CAL"), name.calibration);
    }

    #[test]
    fn malformed_names_rejected(junk in "[a-z]{1,8}(-[a-z0-9]{1,4}){0,3}") {
        prop_assert!(junk.parse::<SessionName>().is_err());
    }

    #[test]
    fn sidecar_round_trip(sidecar in arb_sidecar()) {
        let parsed = Sidecar::parse(&sidecar.render()).expect("parse");
        prop_assert_eq!(parsed, sidecar);
    }

    #[test]
    fn elapsed_text_encodes_seconds(seconds in 0i64..1_000_000) {
        let text = format_elapsed(seconds);
        let parts: Vec<i64> = text.split(':').map(|p| p.parse().expect("digits")).collect();
        prop_assert_eq!(parts.len(), 3);
        prop_assert!(parts[1] < 60 && parts[2] < 60);
        prop_assert_eq!(parts[0] * 3600 + parts[1] * 60 + parts[2], seconds);
    }

    #[test]
    fn restore_numbers_above_observed(
        sessions in prop::collection::btree_map(1u32..500, any::<bool>(), 1..8),
        initial in 1u32..300,
    ) {
        let today = NaiveDate::from_ymd_opt(2024, 3, 9).expect("date");
        let root = tempfile::tempdir().expect("tempdir");
        let mut expected_failed = Vec::new();
        for (sequence, with_notes) in &sessions {
            let name = format!("20240309-101500-{sequence}");
            let dir = root.path().join(&name);
            std::fs::create_dir(&dir).expect("mkdir");
            if *with_notes {
                let sidecar = Sidecar {
                    configurations: vec!["alpha".to_string()],
                    duration: "00:01:00".to_string(),
                    ..Sidecar::default()
                };
                std::fs::write(dir.join(SIDECAR_FILE_NAME), sidecar.render()).expect("write");
            } else {
                expected_failed.push(name);
            }
        }
        // Sessions from another day are ignored.
        std::fs::create_dir(root.path().join("20240308-101500-999")).expect("mkdir");

        let mut controller = RecordingController::new(initial);
        let mut failed = controller.restore(&[root.path().to_path_buf()], today);
        failed.sort();
        expected_failed.sort();

        let highest = *sessions.keys().max().expect("non-empty");
        prop_assert_eq!(controller.sessions().len(), sessions.len());
        prop_assert_eq!(controller.next_sequence(), initial.max(highest + 1));
        prop_assert_eq!(failed, expected_failed);
        prop_assert!(controller.sessions().iter().all(|s| s.done));
        let restored: BTreeMap<u32, bool> = controller
            .sessions()
            .iter()
            .map(|s| {
                let parsed: SessionName = s.name.parse().expect("restored name");
                (parsed.sequence, !s.configuration_names.is_empty())
            })
            .collect();
        prop_assert_eq!(restored, sessions);
    }
}
