//! Live status tree: Root → Configuration → Runner → Stream → Task/Controller.
//!
//! Nodes live in an arena addressed by generation-checked [`NodeId`] handles.
//! A parent owns its children; removing a node frees its whole subtree and
//! stale handles simply stop resolving.
//!
//! Children are kept in case-insensitive name order at every depth. A new
//! child goes after any existing children with an equal name.
//!
//! Every mutation runs the same cascade: the touched node recomputes its own
//! contribution, then each ancestor up to the root re-merges its children (see
//! [`crate::stats`]). After any public call returns, a composite node's stats
//! are exactly the merge of its children's stats.

use std::cmp::Ordering;
use std::collections::VecDeque;

use crate::discovery::Endpoint;
use crate::processing_state::ProcessingState;
use crate::stats::{ActiveState, CollectionStats};
use crate::status::{
    ControllerStatus, MemoryLevel, RunnerId, RunnerStatus, StatusError, StreamStatus, TaskRecord,
    TaskStatus,
};

/// Name of the invisible root node.
pub const ROOT_NAME: &str = "~ROOT~";

/// Runner log lines retained per runner.
pub const RUNNER_LOG_CAPACITY: usize = 1000;

/// Stable handle to a tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error("node {0:?} no longer exists")]
    Stale(NodeId),

    #[error("the root node cannot be removed")]
    RootRemoval,

    #[error("record kind does not match node '{0}'")]
    KindMismatch(String),

    #[error("service '{service}' does not belong to configuration '{configuration}'")]
    ConfigurationMismatch {
        service: String,
        configuration: String,
    },

    #[error(transparent)]
    Status(#[from] StatusError),
}

// =============================================================================
// Node payloads
// =============================================================================

/// Runner-level fields of the last status record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunnerHeader {
    pub name: String,
    pub host_name: String,
    pub log_path: String,
    pub memory_used: u64,
}

impl RunnerHeader {
    fn from_status(status: &RunnerStatus) -> Self {
        Self {
            name: status.name.clone(),
            host_name: status.host_name.clone(),
            log_path: status.log_path.clone(),
            memory_used: status.memory_used,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerNode {
    pub id: RunnerId,
    pub header: RunnerHeader,
    /// Command endpoint, once discovery has resolved it.
    pub endpoint: Option<Endpoint>,
    pub log: VecDeque<String>,
}

impl RunnerNode {
    #[must_use]
    pub fn new(id: RunnerId) -> Self {
        Self {
            id,
            header: RunnerHeader::default(),
            endpoint: None,
            log: VecDeque::new(),
        }
    }

    #[must_use]
    pub const fn memory_level(&self) -> MemoryLevel {
        MemoryLevel::classify(self.header.memory_used)
    }
}

#[derive(Debug, Clone)]
pub struct StreamNode {
    /// Index of this stream in the runner's status record.
    pub slot: usize,
}

#[derive(Debug, Clone)]
pub struct TaskNode {
    /// Index of this task in the stream's status record.
    pub slot: usize,
    pub status: TaskStatus,
    previous_message_count: u64,
}

#[derive(Debug, Clone)]
pub struct ControllerNode {
    pub slot: usize,
    pub status: ControllerStatus,
    previous_message_count: u64,
}

/// Closed set of node kinds, each carrying its own payload.
#[derive(Debug, Clone)]
pub enum NodeKind {
    Root,
    Configuration,
    Runner(RunnerNode),
    Stream(StreamNode),
    Task(TaskNode),
    Controller(ControllerNode),
}

impl NodeKind {
    #[must_use]
    pub const fn task(slot: usize) -> Self {
        Self::Task(TaskNode {
            slot,
            status: TaskStatus {
                name: String::new(),
                processing_state: ProcessingState::Invalid,
                error: String::new(),
                message_count: 0,
                using_data: false,
                pending_queue: 0,
                drop_count: 0,
                dupe_count: 0,
            },
            previous_message_count: 0,
        })
    }

    #[must_use]
    pub fn controller(slot: usize) -> Self {
        Self::Controller(ControllerNode {
            slot,
            status: ControllerStatus::default(),
            previous_message_count: 0,
        })
    }

    #[must_use]
    pub const fn is_leaf(&self) -> bool {
        matches!(self, Self::Task(_) | Self::Controller(_))
    }

    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Configuration => "configuration",
            Self::Runner(_) => "runner",
            Self::Stream(_) => "stream",
            Self::Task(_) => "task",
            Self::Controller(_) => "controller",
        }
    }

    fn slot(&self) -> Option<usize> {
        match self {
            Self::Stream(s) => Some(s.slot),
            Self::Task(t) => Some(t.slot),
            Self::Controller(c) => Some(c.slot),
            _ => None,
        }
    }

    fn before_update(&mut self) {
        match self {
            Self::Task(t) => t.previous_message_count = t.status.message_count,
            Self::Controller(c) => c.previous_message_count = c.status.task.message_count,
            _ => {}
        }
    }

    /// Store a new leaf record. Returns whether it differs from the old one.
    fn store(&mut self, record: TaskRecord) -> Option<bool> {
        match (self, record) {
            (Self::Task(node), TaskRecord::Task(status)) => {
                let changed = node.status != status;
                node.status = status;
                Some(changed)
            }
            (Self::Controller(node), TaskRecord::Controller(status)) => {
                let changed = node.status != status;
                node.status = status;
                Some(changed)
            }
            _ => None,
        }
    }
}

/// A node in the status tree.
#[derive(Debug, Clone)]
pub struct Node {
    name: String,
    full_name: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    ok: bool,
    processing_state: ProcessingState,
    active_state: ActiveState,
    expanded: bool,
    stats: CollectionStats,
    kind: NodeKind,
    dirty: bool,
}

impl Node {
    fn new(name: String, full_name: String, parent: Option<NodeId>, kind: NodeKind) -> Self {
        Self {
            name,
            full_name,
            parent,
            children: Vec::new(),
            ok: true,
            processing_state: ProcessingState::Invalid,
            active_state: ActiveState::Idle,
            expanded: false,
            stats: CollectionStats::default(),
            kind,
            dirty: true,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Colon-joined path from the first level below the root.
    #[must_use]
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    #[must_use]
    pub const fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    #[must_use]
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    #[must_use]
    pub const fn ok(&self) -> bool {
        self.ok
    }

    #[must_use]
    pub const fn processing_state(&self) -> ProcessingState {
        self.processing_state
    }

    #[must_use]
    pub const fn active_state(&self) -> ActiveState {
        self.active_state
    }

    #[must_use]
    pub const fn is_expanded(&self) -> bool {
        self.expanded
    }

    #[must_use]
    pub const fn stats(&self) -> &CollectionStats {
        &self.stats
    }

    #[must_use]
    pub const fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Failure forces `ok` off; the processing flag follows the state.
    fn set_processing_state(&mut self, state: ProcessingState) {
        self.processing_state = state;
        if state.is_failure() {
            self.ok = false;
        }
    }

    fn after_leaf_update(&mut self) {
        let (status, previous) = match &self.kind {
            NodeKind::Task(t) => (&t.status, t.previous_message_count),
            NodeKind::Controller(c) => (&c.status.task, c.previous_message_count),
            _ => return,
        };
        let state = status.processing_state;
        let active = if !status.using_data {
            ActiveState::NotUsingData
        } else if status.message_count == previous {
            ActiveState::Idle
        } else {
            ActiveState::Active
        };
        self.ok = status.error.is_empty();
        self.active_state = active;
        self.set_processing_state(state);
    }

    fn leaf_contribution(&self) -> CollectionStats {
        match &self.kind {
            NodeKind::Task(t) => CollectionStats::for_task(&t.status, self.ok, self.active_state),
            NodeKind::Controller(c) => {
                CollectionStats::for_controller(&c.status, self.ok, self.active_state)
            }
            _ => CollectionStats::default(),
        }
    }
}

// =============================================================================
// Outcomes and summaries
// =============================================================================

/// Result of applying one runner status record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub runner_id: RunnerId,
    pub runner: NodeId,
    /// The runner node did not exist before this record.
    pub created: bool,
    /// Anything visible changed.
    pub changed: bool,
    /// Some controller under the runner reports it is recording.
    pub recording: bool,
}

/// Cluster-wide counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct ServiceStats {
    pub runners: usize,
    pub streams: usize,
    pub pending: u64,
    pub failures: u64,
}

// =============================================================================
// Arena
// =============================================================================

#[derive(Debug)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// The status tree arena.
#[derive(Debug)]
pub struct StatusTree {
    slots: Vec<Slot>,
    free: Vec<u32>,
    root: NodeId,
}

impl Default for StatusTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Case-insensitive name ordering used at every level of the tree.
#[must_use]
pub fn compare_names(a: &str, b: &str) -> Ordering {
    a.chars()
        .flat_map(char::to_lowercase)
        .cmp(b.chars().flat_map(char::to_lowercase))
}

impl StatusTree {
    #[must_use]
    pub fn new() -> Self {
        let root = Node::new(ROOT_NAME.to_string(), String::new(), None, NodeKind::Root);
        Self {
            slots: vec![Slot {
                generation: 0,
                node: Some(root),
            }],
            free: Vec::new(),
            root: NodeId {
                index: 0,
                generation: 0,
            },
        }
    }

    #[must_use]
    pub const fn root(&self) -> NodeId {
        self.root
    }

    /// Number of live nodes, root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.node.is_some()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children(self.root).is_empty()
    }

    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, TreeError> {
        self.get_mut(id).ok_or(TreeError::Stale(id))
    }

    /// Children of `id` in display order; empty for stale handles.
    #[must_use]
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.get(id).map_or(&[], Node::children)
    }

    /// Linear scan for a child by exact name.
    #[must_use]
    pub fn find_child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.children(parent)
            .iter()
            .copied()
            .find(|child| self.get(*child).is_some_and(|n| n.name == name))
    }

    fn insertion_index(&self, parent: NodeId, name: &str) -> usize {
        let children = self.children(parent);
        children
            .iter()
            .position(|child| {
                self.get(*child)
                    .is_some_and(|n| compare_names(&n.name, name) == Ordering::Greater)
            })
            .unwrap_or(children.len())
    }

    fn allocate(&mut self, node: Node) -> NodeId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            NodeId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
            self.slots.push(Slot {
                generation: 0,
                node: Some(node),
            });
            NodeId {
                index,
                generation: 0,
            }
        }
    }

    fn child_full_name(&self, parent: NodeId, name: &str) -> String {
        match self.get(parent) {
            Some(p) if parent != self.root => format!("{}:{name}", p.full_name),
            _ => name.to_string(),
        }
    }

    /// Insert a new child under `parent` at its sorted position.
    pub fn insert(
        &mut self,
        parent: NodeId,
        name: impl Into<String>,
        kind: NodeKind,
    ) -> Result<NodeId, TreeError> {
        let name = name.into();
        if self.get(parent).is_none() {
            return Err(TreeError::Stale(parent));
        }
        let index = self.insertion_index(parent, &name);
        let full_name = self.child_full_name(parent, &name);
        let id = self.allocate(Node::new(name, full_name, Some(parent), kind));
        self.node_mut(parent)?.children.insert(index, id);
        self.recompute(id)?;
        self.recompute_ancestors(id)?;
        Ok(id)
    }

    /// Rename a node, keeping sibling order and descendant full names valid.
    pub fn rename(&mut self, id: NodeId, name: impl Into<String>) -> Result<(), TreeError> {
        let name = name.into();
        let parent = self
            .get(id)
            .ok_or(TreeError::Stale(id))?
            .parent
            .ok_or(TreeError::RootRemoval)?;
        self.node_mut(parent)?.children.retain(|c| *c != id);
        let index = self.insertion_index(parent, &name);
        self.node_mut(parent)?.children.insert(index, id);
        let full_name = self.child_full_name(parent, &name);
        let node = self.node_mut(id)?;
        node.name = name;
        node.full_name = full_name;
        node.dirty = true;
        self.refresh_full_names(id);
        Ok(())
    }

    fn refresh_full_names(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let children = self.children(current).to_vec();
            for child in children {
                let Some(name) = self.get(child).map(|n| n.name.clone()) else {
                    continue;
                };
                let full_name = self.child_full_name(current, &name);
                if let Some(node) = self.get_mut(child) {
                    node.full_name = full_name;
                }
                stack.push(child);
            }
        }
    }

    /// Remove a node and its whole subtree, then re-merge its ancestors.
    pub fn remove(&mut self, id: NodeId) -> Result<(), TreeError> {
        if id == self.root {
            return Err(TreeError::RootRemoval);
        }
        let parent = self.get(id).ok_or(TreeError::Stale(id))?.parent;
        if let Some(parent) = parent {
            self.node_mut(parent)?.children.retain(|c| *c != id);
        }
        for doomed in self.descendants(id) {
            if let Some(slot) = self.slots.get_mut(doomed.index as usize) {
                slot.node = None;
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(doomed.index);
            }
        }
        if let Some(parent) = parent {
            self.recompute(parent)?;
            self.recompute_ancestors(parent)?;
        }
        Ok(())
    }

    /// `id` followed by every descendant, pre-order.
    #[must_use]
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        if self.get(id).is_none() {
            return out;
        }
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            out.push(current);
            stack.extend(self.children(current).iter().rev().copied());
        }
        out
    }

    /// Replace a leaf's record and cascade. Returns whether the record changed.
    pub fn update(&mut self, id: NodeId, record: TaskRecord) -> Result<bool, TreeError> {
        let changed = self.update_leaf(id, record)?;
        self.recompute_ancestors(id)?;
        Ok(changed)
    }

    fn update_leaf(&mut self, id: NodeId, record: TaskRecord) -> Result<bool, TreeError> {
        let node = self.node_mut(id)?;
        node.kind.before_update();
        let changed = node
            .kind
            .store(record)
            .ok_or_else(|| TreeError::KindMismatch(node.full_name.clone()))?;
        node.after_leaf_update();
        let contribution = node.leaf_contribution();
        if changed || contribution != node.stats {
            node.dirty = true;
        }
        node.stats = contribution;
        Ok(changed)
    }

    /// Recompute one node's stats from its payload or children. Idempotent.
    pub fn recompute(&mut self, id: NodeId) -> Result<(), TreeError> {
        let node = self.get(id).ok_or(TreeError::Stale(id))?;
        if node.kind.is_leaf() {
            let contribution = node.leaf_contribution();
            let node = self.node_mut(id)?;
            if node.stats != contribution {
                node.dirty = true;
            }
            node.stats = contribution;
            return Ok(());
        }

        let stats = CollectionStats::sum(
            node.children
                .iter()
                .filter_map(|child| self.get(*child))
                .map(Node::stats),
        );
        let node = self.node_mut(id)?;
        if node.stats != stats {
            node.dirty = true;
        }
        node.ok = stats.is_ok();
        node.active_state = stats.active_state();
        node.set_processing_state(stats.processing_state.unwrap_or_default());
        node.stats = stats;
        Ok(())
    }

    fn recompute_ancestors(&mut self, id: NodeId) -> Result<(), TreeError> {
        let mut current = self.get(id).ok_or(TreeError::Stale(id))?.parent;
        while let Some(parent) = current {
            self.recompute(parent)?;
            current = self.get(parent).and_then(|n| n.parent);
        }
        Ok(())
    }

    pub fn set_expanded(&mut self, id: NodeId, expanded: bool) -> Result<(), TreeError> {
        self.node_mut(id)?.expanded = expanded;
        Ok(())
    }

    /// Drain the set of nodes changed since the previous call.
    pub fn take_dirty(&mut self) -> Vec<NodeId> {
        let mut dirty = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(node) = slot.node.as_mut() {
                if node.dirty {
                    node.dirty = false;
                    dirty.push(NodeId {
                        index: index as u32,
                        generation: slot.generation,
                    });
                }
            }
        }
        dirty
    }

    // =========================================================================
    // Runner status ingest
    // =========================================================================

    /// Apply one runner status record, creating configuration and runner nodes
    /// as needed. The stream/task subtree is rebuilt when the record's shape no
    /// longer matches the existing children.
    pub fn apply_status(&mut self, status: &RunnerStatus) -> Result<ApplyOutcome, TreeError> {
        let runner_id = status.runner_id()?;
        if runner_id.configuration != status.config_name {
            return Err(TreeError::ConfigurationMismatch {
                service: status.service_name.clone(),
                configuration: status.config_name.clone(),
            });
        }
        let root = self.root;

        let configuration = match self.configuration(&status.config_name) {
            Some(id) => id,
            None => self.insert(root, status.config_name.clone(), NodeKind::Configuration)?,
        };

        let (runner, created) = match self.runner_under(configuration, &runner_id) {
            Some(id) => (id, false),
            None => {
                let node = NodeKind::Runner(RunnerNode::new(runner_id.clone()));
                (self.insert(configuration, status.name.clone(), node)?, true)
            }
        };

        if self.get(runner).is_some_and(|n| n.name != status.name) {
            tracing::warn!(
                runner = %runner_id,
                name = %status.name,
                "runner name changed"
            );
            self.rename(runner, status.name.clone())?;
        }

        let mut changed = created;
        if !self.shape_matches(runner, &status.streams) {
            self.rebuild_streams(runner, &status.streams)?;
            changed = true;
        }

        for (stream_slot, stream) in status.streams.iter().enumerate() {
            let Some(stream_node) = self.stream_by_slot(runner, stream_slot) else {
                continue;
            };
            for (task_slot, record) in stream.tasks.iter().enumerate() {
                if let Some(task_node) = self.task_by_slot(stream_node, task_slot) {
                    changed |= self.update_leaf(task_node, record.clone())?;
                }
            }
            self.recompute(stream_node)?;
        }

        let header = RunnerHeader::from_status(status);
        if let Some(NodeKind::Runner(node)) = self.get_mut(runner).map(|n| &mut n.kind) {
            if node.header != header {
                node.header = header;
                changed = true;
            }
            node.log.extend(status.log_messages.iter().cloned());
            while node.log.len() > RUNNER_LOG_CAPACITY {
                node.log.pop_front();
            }
        }

        self.recompute(runner)?;
        self.recompute_ancestors(runner)?;

        let recording = self
            .get(runner)
            .is_some_and(|n| n.stats.is_recording_count > 0);
        Ok(ApplyOutcome {
            runner_id,
            runner,
            created,
            changed,
            recording,
        })
    }

    fn shape_matches(&self, runner: NodeId, streams: &[StreamStatus]) -> bool {
        if self.children(runner).len() != streams.len() {
            return false;
        }
        streams.iter().enumerate().all(|(slot, stream)| {
            let Some(stream_node) = self.stream_by_slot(runner, slot) else {
                return false;
            };
            if self.get(stream_node).is_none_or(|n| n.name != stream.name)
                || self.children(stream_node).len() != stream.tasks.len()
            {
                return false;
            }
            stream.tasks.iter().enumerate().all(|(task_slot, record)| {
                self.task_by_slot(stream_node, task_slot)
                    .and_then(|id| self.get(id))
                    .is_some_and(|node| {
                        node.name == record.name()
                            && matches!(
                                (&node.kind, record),
                                (NodeKind::Task(_), TaskRecord::Task(_))
                                    | (NodeKind::Controller(_), TaskRecord::Controller(_))
                            )
                    })
            })
        })
    }

    fn rebuild_streams(&mut self, runner: NodeId, streams: &[StreamStatus]) -> Result<(), TreeError> {
        for child in self.children(runner).to_vec() {
            self.remove(child)?;
        }
        for (slot, stream) in streams.iter().enumerate() {
            let stream_node =
                self.insert(runner, stream.name.clone(), NodeKind::Stream(StreamNode { slot }))?;
            for (task_slot, record) in stream.tasks.iter().enumerate() {
                let kind = match record {
                    TaskRecord::Task(_) => NodeKind::task(task_slot),
                    TaskRecord::Controller(_) => NodeKind::controller(task_slot),
                };
                self.insert(stream_node, record.name().to_string(), kind)?;
            }
        }
        Ok(())
    }

    /// Remove a runner; drop its configuration node too once it has no runners left.
    pub fn remove_runner(&mut self, id: &RunnerId) -> Result<bool, TreeError> {
        let Some(configuration) = self.configuration(&id.configuration) else {
            return Ok(false);
        };
        let Some(runner) = self.runner_under(configuration, id) else {
            return Ok(false);
        };
        self.remove(runner)?;
        if self.children(configuration).is_empty() {
            self.remove(configuration)?;
        }
        Ok(true)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    #[must_use]
    pub fn configuration(&self, name: &str) -> Option<NodeId> {
        self.find_child(self.root, name)
            .filter(|id| matches!(self.get(*id).map(Node::kind), Some(NodeKind::Configuration)))
    }

    fn runner_under(&self, configuration: NodeId, id: &RunnerId) -> Option<NodeId> {
        self.children(configuration).iter().copied().find(|child| {
            matches!(self.get(*child).map(Node::kind), Some(NodeKind::Runner(r)) if r.id == *id)
        })
    }

    #[must_use]
    pub fn find_runner(&self, id: &RunnerId) -> Option<NodeId> {
        self.configuration(&id.configuration)
            .and_then(|configuration| self.runner_under(configuration, id))
    }

    /// Runner payload of a runner node.
    #[must_use]
    pub fn runner(&self, id: NodeId) -> Option<&RunnerNode> {
        match self.get(id).map(Node::kind) {
            Some(NodeKind::Runner(runner)) => Some(runner),
            _ => None,
        }
    }

    /// Runner nodes under a configuration, in display order.
    #[must_use]
    pub fn runners_of(&self, configuration: &str) -> Vec<NodeId> {
        self.configuration(configuration)
            .map(|c| self.children(c).to_vec())
            .unwrap_or_default()
    }

    /// Record (or clear) the resolved command endpoint of a runner.
    pub fn set_endpoint(&mut self, id: &RunnerId, endpoint: Option<Endpoint>) -> bool {
        let Some(runner) = self.find_runner(id) else {
            return false;
        };
        match self.get_mut(runner).map(|n| &mut n.kind) {
            Some(NodeKind::Runner(node)) => {
                node.endpoint = endpoint;
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn stream_by_slot(&self, runner: NodeId, slot: usize) -> Option<NodeId> {
        self.child_by_slot(runner, slot)
    }

    #[must_use]
    pub fn task_by_slot(&self, stream: NodeId, slot: usize) -> Option<NodeId> {
        self.child_by_slot(stream, slot)
    }

    fn child_by_slot(&self, parent: NodeId, slot: usize) -> Option<NodeId> {
        self.children(parent)
            .iter()
            .copied()
            .find(|child| self.get(*child).and_then(|n| n.kind.slot()) == Some(slot))
    }

    /// Names from the configuration level down to `id`.
    #[must_use]
    pub fn path_names(&self, id: NodeId) -> Vec<String> {
        let mut names = Vec::new();
        let mut current = Some(id);
        while let Some(node_id) = current {
            if node_id == self.root {
                break;
            }
            let Some(node) = self.get(node_id) else {
                break;
            };
            names.push(node.name.clone());
            current = node.parent;
        }
        names.reverse();
        names
    }

    /// Summed drop and duplicate counts over the named configurations.
    #[must_use]
    pub fn drops_and_dupes(&self, filter: &[String]) -> (u64, u64) {
        filter
            .iter()
            .filter_map(|name| self.configuration(name))
            .filter_map(|id| self.get(id))
            .fold((0, 0), |(drops, dupes), node| {
                (drops + node.stats.drop_count, dupes + node.stats.dupe_count)
            })
    }

    /// True if any named configuration's merged state is `Calibrate`.
    #[must_use]
    pub fn is_calibrating(&self, filter: &[String]) -> bool {
        filter
            .iter()
            .filter_map(|name| self.configuration(name))
            .filter_map(|id| self.get(id))
            .any(|node| node.processing_state == ProcessingState::Calibrate)
    }

    #[must_use]
    pub fn service_stats(&self) -> ServiceStats {
        let mut stats = ServiceStats::default();
        for configuration in self.children(self.root) {
            for runner in self.children(*configuration) {
                stats.runners += 1;
                stats.streams += self.children(*runner).len();
            }
        }
        if let Some(root) = self.get(self.root) {
            stats.pending = root.stats.pending_queue_count;
            stats.failures = root.stats.failure_count();
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::STATUS_VERSION;

    fn task(name: &str, messages: u64, drops: u64) -> TaskRecord {
        TaskRecord::Task(TaskStatus {
            name: name.to_string(),
            processing_state: ProcessingState::Run,
            message_count: messages,
            using_data: true,
            drop_count: drops,
            ..TaskStatus::default()
        })
    }

    fn controller(name: &str, recording: bool) -> TaskRecord {
        TaskRecord::Controller(ControllerStatus {
            task: TaskStatus {
                name: name.to_string(),
                processing_state: ProcessingState::Run,
                using_data: true,
                ..TaskStatus::default()
            },
            recording_enabled: true,
            recording_on: recording,
            ..ControllerStatus::default()
        })
    }

    fn runner_status(config: &str, runner: &str, streams: Vec<StreamStatus>) -> RunnerStatus {
        RunnerStatus {
            version: STATUS_VERSION,
            name: runner.to_string(),
            config_name: config.to_string(),
            service_name: format!("{config}:node1:{runner}"),
            host_name: "node1".to_string(),
            log_path: String::new(),
            streams,
            log_messages: vec!["started".to_string()],
            memory_used: 0,
        }
    }

    fn stream(name: &str, tasks: Vec<TaskRecord>) -> StreamStatus {
        StreamStatus {
            name: name.to_string(),
            tasks,
        }
    }

    fn names(tree: &StatusTree, parent: NodeId) -> Vec<String> {
        tree.children(parent)
            .iter()
            .map(|id| tree.get(*id).unwrap().name().to_string())
            .collect()
    }

    #[test]
    fn insert_keeps_case_insensitive_order() {
        let mut tree = StatusTree::new();
        let root = tree.root();
        for name in ["delta", "Alpha", "charlie", "bravo", "alpha"] {
            tree.insert(root, name, NodeKind::Configuration).unwrap();
        }
        assert_eq!(
            names(&tree, root),
            vec!["Alpha", "alpha", "bravo", "charlie", "delta"]
        );
    }

    #[test]
    fn full_names_skip_root() {
        let mut tree = StatusTree::new();
        let config = tree
            .insert(tree.root(), "cfg", NodeKind::Configuration)
            .unwrap();
        let stream = tree
            .insert(config, "video", NodeKind::Stream(StreamNode { slot: 0 }))
            .unwrap();
        assert_eq!(tree.get(config).unwrap().full_name(), "cfg");
        assert_eq!(tree.get(stream).unwrap().full_name(), "cfg:video");
    }

    #[test]
    fn remove_frees_subtree_and_invalidates_handles() {
        let mut tree = StatusTree::new();
        let status = runner_status("cfg", "r1", vec![stream("s", vec![task("t", 1, 0)])]);
        let outcome = tree.apply_status(&status).unwrap();
        let config = tree.configuration("cfg").unwrap();
        let before = tree.len();
        tree.remove(config).unwrap();
        assert_eq!(tree.len(), before - 4);
        assert!(tree.get(outcome.runner).is_none());
        assert!(tree.is_empty());
        assert!(matches!(tree.remove(tree.root()), Err(TreeError::RootRemoval)));
    }

    #[test]
    fn update_reports_change_and_cascades() {
        let mut tree = StatusTree::new();
        let status = runner_status("cfg", "r1", vec![stream("s", vec![task("t", 1, 2)])]);
        let outcome = tree.apply_status(&status).unwrap();
        let stream_node = tree.stream_by_slot(outcome.runner, 0).unwrap();
        let leaf = tree.task_by_slot(stream_node, 0).unwrap();

        assert!(!tree.update(leaf, task("t", 1, 2)).unwrap());
        assert!(tree.update(leaf, task("t", 5, 9)).unwrap());

        let root = tree.get(tree.root()).unwrap();
        assert_eq!(root.stats().drop_count, 9);
        assert_eq!(tree.get(leaf).unwrap().active_state(), ActiveState::Active);

        assert!(!tree.update(leaf, task("t", 5, 9)).unwrap());
        assert_eq!(tree.get(leaf).unwrap().active_state(), ActiveState::Idle);
    }

    #[test]
    fn update_rejects_kind_mismatch() {
        let mut tree = StatusTree::new();
        let status = runner_status("cfg", "r1", vec![stream("s", vec![task("t", 1, 0)])]);
        let outcome = tree.apply_status(&status).unwrap();
        let stream_node = tree.stream_by_slot(outcome.runner, 0).unwrap();
        let leaf = tree.task_by_slot(stream_node, 0).unwrap();
        assert!(matches!(
            tree.update(leaf, controller("t", false)),
            Err(TreeError::KindMismatch(_))
        ));
    }

    #[test]
    fn failure_state_clears_ok() {
        let mut tree = StatusTree::new();
        let failing = TaskRecord::Task(TaskStatus {
            name: "t".to_string(),
            processing_state: ProcessingState::Failure,
            ..TaskStatus::default()
        });
        let status = runner_status("cfg", "r1", vec![stream("s", vec![failing])]);
        let outcome = tree.apply_status(&status).unwrap();
        let runner = tree.get(outcome.runner).unwrap();
        assert!(!runner.ok());
        assert_eq!(runner.stats().failure_count(), 1);
        assert_eq!(runner.processing_state(), ProcessingState::Failure);
    }

    #[test]
    fn apply_status_rejects_service_from_other_configuration() {
        let mut tree = StatusTree::new();
        let mut status = runner_status("cfg", "r1", vec![stream("s", vec![task("t", 1, 0)])]);
        status.service_name = "other:node1:r1".to_string();

        let err = tree.apply_status(&status).unwrap_err();
        assert!(matches!(err, TreeError::ConfigurationMismatch { .. }));
        assert!(tree.is_empty());
        assert!(tree.configuration("cfg").is_none());
        assert!(tree.configuration("other").is_none());
    }

    #[test]
    fn apply_status_builds_hierarchy_and_aggregates() {
        let mut tree = StatusTree::new();
        let status = runner_status(
            "cfg",
            "r1",
            vec![
                stream("zeta", vec![task("reader", 4, 1), controller("ctl", true)]),
                stream("alpha", vec![task("reader", 4, 2)]),
            ],
        );
        let outcome = tree.apply_status(&status).unwrap();
        assert!(outcome.created);
        assert!(outcome.recording);
        assert_eq!(names(&tree, outcome.runner), vec!["alpha", "zeta"]);

        let zeta = tree.stream_by_slot(outcome.runner, 0).unwrap();
        assert_eq!(tree.get(zeta).unwrap().name(), "zeta");

        let config = tree.configuration("cfg").unwrap();
        let stats = tree.get(config).unwrap().stats();
        assert_eq!(stats.leaf_count, 3);
        assert_eq!(stats.drop_count, 3);
        assert_eq!(stats.can_record_count, 1);
        assert_eq!(stats.is_recording_count, 1);
        assert_eq!(tree.drops_and_dupes(&["cfg".to_string()]), (3, 0));

        let second = tree.apply_status(&status).unwrap();
        assert!(!second.created);
        assert_eq!(second.runner, outcome.runner);
        let runner = tree.runner(outcome.runner).unwrap();
        assert_eq!(runner.log.len(), 2);
    }

    #[test]
    fn shape_change_rebuilds_streams() {
        let mut tree = StatusTree::new();
        let first = runner_status("cfg", "r1", vec![stream("s", vec![task("a", 1, 0)])]);
        let outcome = tree.apply_status(&first).unwrap();
        let old_stream = tree.stream_by_slot(outcome.runner, 0).unwrap();

        let second = runner_status(
            "cfg",
            "r1",
            vec![stream("s", vec![task("a", 1, 0), task("b", 1, 0)])],
        );
        let outcome = tree.apply_status(&second).unwrap();
        assert!(outcome.changed);
        assert!(tree.get(old_stream).is_none());
        let new_stream = tree.stream_by_slot(outcome.runner, 0).unwrap();
        assert_eq!(tree.children(new_stream).len(), 2);
    }

    #[test]
    fn remove_runner_drops_empty_configuration() {
        let mut tree = StatusTree::new();
        let a = runner_status("cfg", "r1", vec![stream("s", vec![task("t", 1, 0)])]);
        let b = runner_status("cfg", "r2", vec![stream("s", vec![task("t", 1, 0)])]);
        tree.apply_status(&a).unwrap();
        tree.apply_status(&b).unwrap();

        assert!(tree.remove_runner(&a.runner_id().unwrap()).unwrap());
        assert!(tree.configuration("cfg").is_some());
        assert!(tree.remove_runner(&b.runner_id().unwrap()).unwrap());
        assert!(tree.configuration("cfg").is_none());
        assert!(!tree.remove_runner(&b.runner_id().unwrap()).unwrap());
    }

    #[test]
    fn rename_repositions_runner() {
        let mut tree = StatusTree::new();
        let a = runner_status("cfg", "a", vec![]);
        let mut b = runner_status("cfg", "b", vec![]);
        tree.apply_status(&a).unwrap();
        tree.apply_status(&b).unwrap();
        b.name = "0-first".to_string();
        tree.apply_status(&b).unwrap();
        let config = tree.configuration("cfg").unwrap();
        assert_eq!(names(&tree, config), vec!["0-first", "a"]);
        let renamed = tree.children(config)[0];
        assert_eq!(tree.get(renamed).unwrap().full_name(), "cfg:0-first");
    }

    #[test]
    fn calibrating_and_service_stats() {
        let mut tree = StatusTree::new();
        let calibrating = TaskRecord::Task(TaskStatus {
            name: "t".to_string(),
            processing_state: ProcessingState::Calibrate,
            pending_queue: 4,
            ..TaskStatus::default()
        });
        tree.apply_status(&runner_status("cal", "r1", vec![stream("s", vec![calibrating])]))
            .unwrap();
        tree.apply_status(&runner_status("run", "r1", vec![stream("s", vec![task("t", 1, 0)])]))
            .unwrap();

        assert!(tree.is_calibrating(&["cal".to_string()]));
        assert!(!tree.is_calibrating(&["run".to_string()]));
        let stats = tree.service_stats();
        assert_eq!(stats.runners, 2);
        assert_eq!(stats.streams, 2);
        assert_eq!(stats.pending, 4);
    }

    #[test]
    fn endpoints_and_path_names() {
        let mut tree = StatusTree::new();
        let status = runner_status("cfg", "r1", vec![stream("s", vec![task("t", 1, 0)])]);
        let outcome = tree.apply_status(&status).unwrap();
        assert!(tree.set_endpoint(&outcome.runner_id, Some(Endpoint::new("node1", 9000))));
        assert_eq!(
            tree.runner(outcome.runner).unwrap().endpoint,
            Some(Endpoint::new("node1", 9000))
        );
        let stream_node = tree.stream_by_slot(outcome.runner, 0).unwrap();
        let leaf = tree.task_by_slot(stream_node, 0).unwrap();
        assert_eq!(tree.path_names(leaf), vec!["cfg", "r1", "s", "t"]);
    }

    #[test]
    fn take_dirty_drains() {
        let mut tree = StatusTree::new();
        let status = runner_status("cfg", "r1", vec![stream("s", vec![task("t", 1, 0)])]);
        tree.apply_status(&status).unwrap();
        assert!(!tree.take_dirty().is_empty());
        assert!(tree.take_dirty().is_empty());
    }
}
