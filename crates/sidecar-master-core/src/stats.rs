//! Bottom-up statistics rollup for the status tree.
//!
//! Leaves (tasks and controllers) produce a *contribution*; every composite
//! node holds the merge of its children's contributions. Counters add up.
//! Two fields merge differently:
//!
//! | Field | Rule |
//! |-------|------|
//! | `processing_state` | first child to report wins; any later mismatch forces `Failure` |
//! | `error` | first non-empty error wins; later ones are dropped |
//!
//! The processing-state rule depends on child order. Composites with an
//! unreported subtree (no leaves yet) do not take part in the merge.

use serde::{Deserialize, Serialize};

use crate::processing_state::ProcessingState;
use crate::status::{ControllerStatus, TaskStatus};

/// Whether a node is currently seeing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActiveState {
    #[default]
    Idle,
    Partial,
    Active,
    NotUsingData,
}

impl std::fmt::Display for ActiveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Partial => write!(f, "partial"),
            Self::Active => write!(f, "active"),
            Self::NotUsingData => write!(f, "not_using_data"),
        }
    }
}

/// Aggregated counters for a subtree.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CollectionStats {
    pub leaf_count: u64,
    pub ok_count: u64,
    pub idle_count: u64,
    pub active_count: u64,
    pub not_using_data_count: u64,
    pub pending_queue_count: u64,
    pub can_record_count: u64,
    pub will_record_count: u64,
    pub is_recording_count: u64,
    pub recording_queue_count: u64,
    pub drop_count: u64,
    pub dupe_count: u64,
    /// Merged processing state; `None` until some leaf has contributed.
    pub processing_state: Option<ProcessingState>,
    /// First error captured from the subtree.
    pub error: Option<String>,
}

impl CollectionStats {
    /// Contribution of a plain task leaf.
    #[must_use]
    pub fn for_task(status: &TaskStatus, ok: bool, active: ActiveState) -> Self {
        let mut stats = Self::leaf(ok, active, status);
        stats.drop_count = status.drop_count;
        stats.dupe_count = status.dupe_count;
        stats
    }

    /// Contribution of a controller leaf. Controllers never count drops or
    /// duplicates; they add the recording counters instead.
    #[must_use]
    pub fn for_controller(status: &ControllerStatus, ok: bool, active: ActiveState) -> Self {
        let mut stats = Self::leaf(ok, active, &status.task);
        stats.can_record_count = 1;
        stats.will_record_count = u64::from(status.recording_enabled);
        stats.is_recording_count = u64::from(status.recording_on);
        stats.recording_queue_count = status.recording_queue;
        stats
    }

    fn leaf(ok: bool, active: ActiveState, status: &TaskStatus) -> Self {
        let mut stats = Self {
            leaf_count: 1,
            ok_count: u64::from(ok),
            pending_queue_count: status.pending_queue,
            processing_state: Some(status.processing_state),
            error: (!status.error.is_empty()).then(|| status.error.clone()),
            ..Self::default()
        };
        match active {
            ActiveState::Active | ActiveState::Partial => stats.active_count = 1,
            ActiveState::Idle => stats.idle_count = 1,
            ActiveState::NotUsingData => stats.not_using_data_count = 1,
        }
        stats
    }

    /// Merge one child's contribution into this accumulator.
    pub fn merge(&mut self, child: &Self) {
        self.leaf_count += child.leaf_count;
        self.ok_count += child.ok_count;
        self.idle_count += child.idle_count;
        self.active_count += child.active_count;
        self.not_using_data_count += child.not_using_data_count;
        self.pending_queue_count += child.pending_queue_count;
        self.can_record_count += child.can_record_count;
        self.will_record_count += child.will_record_count;
        self.is_recording_count += child.is_recording_count;
        self.recording_queue_count += child.recording_queue_count;
        self.drop_count += child.drop_count;
        self.dupe_count += child.dupe_count;

        if let Some(state) = child.processing_state {
            self.processing_state = match self.processing_state {
                None => Some(state),
                Some(current) if current == state => Some(current),
                Some(_) => Some(ProcessingState::Failure),
            };
        }

        if self.error.is_none() {
            self.error.clone_from(&child.error);
        }
    }

    /// Fold a sequence of contributions in order.
    #[must_use]
    pub fn sum<'a>(children: impl IntoIterator<Item = &'a Self>) -> Self {
        let mut total = Self::default();
        for child in children {
            total.merge(child);
        }
        total
    }

    #[must_use]
    pub const fn failure_count(&self) -> u64 {
        self.leaf_count.saturating_sub(self.ok_count)
    }

    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.ok_count == self.leaf_count
    }

    /// Active state of the composite owning these stats.
    #[must_use]
    pub const fn active_state(&self) -> ActiveState {
        if self.not_using_data_count == self.leaf_count {
            ActiveState::NotUsingData
        } else if self.idle_count == self.leaf_count {
            ActiveState::Idle
        } else if self.active_count == self.leaf_count {
            ActiveState::Active
        } else {
            ActiveState::Partial
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(state: ProcessingState, error: &str) -> TaskStatus {
        TaskStatus {
            name: "t".to_string(),
            processing_state: state,
            error: error.to_string(),
            drop_count: 3,
            dupe_count: 1,
            pending_queue: 2,
            ..TaskStatus::default()
        }
    }

    #[test]
    fn task_contribution_counts_one_leaf() {
        let stats =
            CollectionStats::for_task(&task(ProcessingState::Run, ""), true, ActiveState::Active);
        assert_eq!(stats.leaf_count, 1);
        assert_eq!(stats.ok_count, 1);
        assert_eq!(stats.active_count, 1);
        assert_eq!(stats.idle_count + stats.not_using_data_count, 0);
        assert_eq!(stats.drop_count, 3);
        assert_eq!(stats.dupe_count, 1);
        assert_eq!(stats.pending_queue_count, 2);
        assert_eq!(stats.can_record_count, 0);
        assert!(stats.error.is_none());
    }

    #[test]
    fn controller_contribution_skips_drops() {
        let controller = ControllerStatus {
            task: task(ProcessingState::Run, ""),
            recording_enabled: true,
            recording_on: false,
            recording_queue: 7,
            ..ControllerStatus::default()
        };
        let stats = CollectionStats::for_controller(&controller, true, ActiveState::Idle);
        assert_eq!(stats.drop_count, 0);
        assert_eq!(stats.dupe_count, 0);
        assert_eq!(stats.can_record_count, 1);
        assert_eq!(stats.will_record_count, 1);
        assert_eq!(stats.is_recording_count, 0);
        assert_eq!(stats.recording_queue_count, 7);
        assert_eq!(stats.idle_count, 1);
    }

    #[test]
    fn first_processing_state_wins_until_mismatch() {
        let run = CollectionStats::for_task(&task(ProcessingState::Run, ""), true, ActiveState::Idle);
        let stop =
            CollectionStats::for_task(&task(ProcessingState::Stop, ""), true, ActiveState::Idle);

        let same = CollectionStats::sum([&run, &run]);
        assert_eq!(same.processing_state, Some(ProcessingState::Run));

        let mixed = CollectionStats::sum([&run, &stop]);
        assert_eq!(mixed.processing_state, Some(ProcessingState::Failure));

        let empty = CollectionStats::default();
        let with_empty = CollectionStats::sum([&empty, &run]);
        assert_eq!(with_empty.processing_state, Some(ProcessingState::Run));
    }

    #[test]
    fn first_error_wins() {
        let a = CollectionStats::for_task(&task(ProcessingState::Run, ""), true, ActiveState::Idle);
        let b = CollectionStats::for_task(
            &task(ProcessingState::Run, "disk full"),
            false,
            ActiveState::Idle,
        );
        let c = CollectionStats::for_task(
            &task(ProcessingState::Run, "socket closed"),
            false,
            ActiveState::Idle,
        );
        let total = CollectionStats::sum([&a, &b, &c]);
        assert_eq!(total.error.as_deref(), Some("disk full"));
        assert_eq!(total.failure_count(), 2);
        assert!(!total.is_ok());
    }

    #[test]
    fn composite_active_state() {
        let idle = CollectionStats::for_task(&task(ProcessingState::Run, ""), true, ActiveState::Idle);
        let active =
            CollectionStats::for_task(&task(ProcessingState::Run, ""), true, ActiveState::Active);
        let unused = CollectionStats::for_task(
            &task(ProcessingState::Run, ""),
            true,
            ActiveState::NotUsingData,
        );

        assert_eq!(CollectionStats::sum([&idle, &idle]).active_state(), ActiveState::Idle);
        assert_eq!(
            CollectionStats::sum([&active, &active]).active_state(),
            ActiveState::Active
        );
        assert_eq!(
            CollectionStats::sum([&unused]).active_state(),
            ActiveState::NotUsingData
        );
        assert_eq!(
            CollectionStats::sum([&idle, &active]).active_state(),
            ActiveState::Partial
        );
    }
}
