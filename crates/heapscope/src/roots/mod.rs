//! Roots Module - what keeps objects alive
//!
//! # Root Sources
//!
//! 1. **Stack Roots** - live references reported per thread
//! 2. **Handle Roots** - strong handle-table entries
//! 3. **Finalizer Queue** - objects awaiting (or registered for) finalization
//! 4. **Older Generation** - the GC's captured root array; an approximation
//!    of cross-generation references, not a card-table scan
//! 5. **Dependent Handles** - primary keeps secondary alive; these add graph
//!    edges rather than roots
//!
//! # Queries
//!
//! [`RootFinder`] answers "which roots, via what path, keep X alive" and
//! "how many bytes does X (or each root) retain".

pub mod finder;
pub mod sources;

pub use finder::RootFinder;
pub use sources::DependentHandleMap;

use crate::stats::QueryStats;
use crate::target::HandleKind;
use indexmap::IndexSet;
use std::fmt;

/// Provenance of a root
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RootKind {
    Stack {
        os_thread_id: u32,
        /// Stack slot or register location
        slot: u64,
        pinned: bool,
        interior: bool,
    },
    Handle {
        handle: u64,
        kind: HandleKind,
    },
    FinalizerQueue {
        slot: u64,
        /// False for objects registered but not yet due for finalization
        ready: bool,
    },
    OlderGeneration {
        slot: u64,
    },
    DependentHandle {
        handle: u64,
        secondary: u64,
    },
}

impl fmt::Display for RootKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RootKind::Stack {
                os_thread_id,
                slot,
                pinned,
                interior,
            } => {
                write!(f, "thread {:x} stack {:#x}", os_thread_id, slot)?;
                if *pinned {
                    f.write_str(" (pinned)")?;
                }
                if *interior {
                    f.write_str(" (interior)")?;
                }
                Ok(())
            },
            RootKind::Handle { handle, kind } => write!(f, "{} {:#x}", kind, handle),
            RootKind::FinalizerQueue { slot, ready: true } => {
                write!(f, "finalizer queue {:#x}", slot)
            },
            RootKind::FinalizerQueue { slot, ready: false } => {
                write!(f, "finalizer queue {:#x} (not ready for finalization)", slot)
            },
            RootKind::OlderGeneration { slot } => write!(f, "older generation {:#x}", slot),
            RootKind::DependentHandle { handle, secondary } => {
                write!(f, "dependent handle {:#x} -> {:#x}", handle, secondary)
            },
        }
    }
}

/// One root candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Root {
    pub kind: RootKind,
    pub object: u64,
}

/// One object on a root-to-target path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathNode {
    pub address: u64,
    pub type_name: String,
    /// Reached through a dependent handle rather than a field
    pub from_dependent_handle: bool,
}

/// A root and the objects leading from it to the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootPath {
    pub root: Root,
    /// Root object first, target last
    pub nodes: Vec<PathNode>,
    /// Found only through not-yet-ready finalization entries
    pub possible_false_positive: bool,
}

impl RootPath {
    pub fn addresses(&self) -> Vec<u64> {
        self.nodes.iter().map(|n| n.address).collect()
    }
}

/// How paths from different roots are reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchMode {
    /// Skip roots whose path would only extend one already reported
    #[default]
    Unique,
    /// Report every root that reaches the target
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootSearchOptions {
    pub mode: SearchMode,
    pub include_stacks: bool,
}

impl Default for RootSearchOptions {
    fn default() -> Self {
        Self {
            mode: SearchMode::Unique,
            include_stacks: true,
        }
    }
}

/// Condition that made a result less complete than it could be
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    ObjectUnreadable { address: u64, reason: String },
    HandleTableUnavailable { reason: String },
    ThreadsUnavailable { reason: String },
    ThreadStackUnavailable { os_thread_id: u32, reason: String },
    DependentHandlesUnavailable { reason: String },
    FinalizerQueueUnreadable { heap: usize, address: u64, reason: String },
    OlderGenerationUnavailable { heap: usize },
    OlderGenerationSlotUnreadable { heap: usize, address: u64, reason: String },
    SearchLimitReached { root: u64, limit: usize },
    PossibleFalsePositives,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::ObjectUnreadable { address, reason } => {
                write!(f, "object {:#x} unreadable: {}", address, reason)
            },
            Diagnostic::HandleTableUnavailable { reason } => {
                write!(f, "handle table unavailable: {}", reason)
            },
            Diagnostic::ThreadsUnavailable { reason } => {
                write!(f, "thread list unavailable: {}", reason)
            },
            Diagnostic::ThreadStackUnavailable {
                os_thread_id,
                reason,
            } => write!(f, "stack of thread {:x} unavailable: {}", os_thread_id, reason),
            Diagnostic::DependentHandlesUnavailable { reason } => write!(
                f,
                "dependent handles unavailable, paths through them may be missed: {}",
                reason
            ),
            Diagnostic::FinalizerQueueUnreadable {
                heap,
                address,
                reason,
            } => write!(
                f,
                "heap {} finalizer queue unreadable at {:#x}: {}",
                heap, address, reason
            ),
            Diagnostic::OlderGenerationUnavailable { heap } => write!(
                f,
                "heap {} has no usable older-generation root data",
                heap
            ),
            Diagnostic::OlderGenerationSlotUnreadable {
                heap,
                address,
                reason,
            } => write!(
                f,
                "heap {} root array slot {:#x} unreadable: {}",
                heap, address, reason
            ),
            Diagnostic::SearchLimitReached { root, limit } => write!(
                f,
                "search from {:#x} abandoned after {} nodes",
                root, limit
            ),
            Diagnostic::PossibleFalsePositives => f.write_str(
                "paths found only through objects not yet ready for finalization; they may be false positives",
            ),
        }
    }
}

/// Result of a root search
#[derive(Debug, Clone, Default)]
pub struct RootReport {
    pub target: u64,
    pub paths: Vec<RootPath>,
    pub diagnostics: Vec<Diagnostic>,
    pub stats: QueryStats,
}

/// Bytes kept alive by one object
#[derive(Debug, Clone, Default)]
pub struct RetainedSize {
    pub object: u64,
    pub bytes: u64,
    pub objects: u64,
    pub diagnostics: Vec<Diagnostic>,
}

/// Bytes kept alive by one root
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootRetention {
    pub root: Root,
    pub bytes: u64,
    pub objects: u64,
}

#[derive(Debug, Clone, Default)]
pub struct RetentionReport {
    pub roots: Vec<RootRetention>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Objects reachable from the roots, in discovery order
#[derive(Debug, Clone, Default)]
pub struct LiveObjects {
    pub objects: IndexSet<u64>,
    pub diagnostics: Vec<Diagnostic>,
}

impl LiveObjects {
    pub fn contains(&self, address: u64) -> bool {
        self.objects.contains(&address)
    }
}

/// Every root candidate with provenance
#[derive(Debug, Clone, Default)]
pub struct RootSet {
    pub roots: Vec<Root>,
    pub diagnostics: Vec<Diagnostic>,
}
