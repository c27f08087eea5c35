//! Runner processing states.
//!
//! Every task inside a runner reports one of these values. Composite nodes in
//! the status tree carry a merged value (see [`crate::stats`]).

use serde::{Deserialize, Serialize};

/// Processing state reported by a task, or merged for a composite node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    #[default]
    Invalid,
    Failure,
    Initialize,
    AutoDiagnostic,
    Calibrate,
    Run,
    Stop,
}

impl ProcessingState {
    /// All states in wire order.
    pub const ALL: [Self; 7] = [
        Self::Invalid,
        Self::Failure,
        Self::Initialize,
        Self::AutoDiagnostic,
        Self::Calibrate,
        Self::Run,
        Self::Stop,
    ];

    /// Operator-facing name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Invalid => "Invalid",
            Self::Failure => "Failure",
            Self::Initialize => "Initialize",
            Self::AutoDiagnostic => "AutoDiagnostic",
            Self::Calibrate => "Calibrate",
            Self::Run => "Run",
            Self::Stop => "Stop",
        }
    }

    /// True for the states in which a task is actively consuming data.
    #[must_use]
    pub const fn is_processing(self) -> bool {
        matches!(self, Self::AutoDiagnostic | Self::Calibrate | Self::Run)
    }

    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::Failure)
    }

    /// Numeric value used by the `stateChange` command.
    #[must_use]
    pub const fn wire_value(self) -> i32 {
        match self {
            Self::Invalid => 0,
            Self::Failure => 1,
            Self::Initialize => 2,
            Self::AutoDiagnostic => 3,
            Self::Calibrate => 4,
            Self::Run => 5,
            Self::Stop => 6,
        }
    }
}

impl std::fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ProcessingState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.name().eq_ignore_ascii_case(wanted))
            .or_else(|| match wanted.to_ascii_lowercase().as_str() {
                "auto_diagnostic" => Some(Self::AutoDiagnostic),
                _ => None,
            })
            .ok_or_else(|| {
                format!(
                    "unknown processing state: {s}. Expected one of: initialize, autodiagnostic, calibrate, run, stop"
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processing_flag_matches_running_states() {
        let processing: Vec<_> = ProcessingState::ALL
            .iter()
            .filter(|s| s.is_processing())
            .collect();
        assert_eq!(
            processing,
            vec![
                &ProcessingState::AutoDiagnostic,
                &ProcessingState::Calibrate,
                &ProcessingState::Run
            ]
        );
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!("run".parse::<ProcessingState>(), Ok(ProcessingState::Run));
        assert_eq!(
            "CALIBRATE".parse::<ProcessingState>(),
            Ok(ProcessingState::Calibrate)
        );
        assert_eq!(
            "auto_diagnostic".parse::<ProcessingState>(),
            Ok(ProcessingState::AutoDiagnostic)
        );
        assert!("sprint".parse::<ProcessingState>().is_err());
    }

    #[test]
    fn wire_values_follow_declaration_order() {
        for (index, state) in ProcessingState::ALL.iter().enumerate() {
            assert_eq!(state.wire_value(), index as i32);
        }
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&ProcessingState::AutoDiagnostic).unwrap();
        assert_eq!(json, "\"auto_diagnostic\"");
    }
}
