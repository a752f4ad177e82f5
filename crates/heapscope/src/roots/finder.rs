//! Root Finder - reference-graph search from roots to targets
//!
//! # Algorithm
//!
//! Breadth-first search from each root object. Nodes live in an
//! [`IndexVec`] arena and point at their parent by [`NodeId`], so a found
//! path is rebuilt by walking parent links back to the root. Edges are the
//! object's non-null reference slots plus the secondaries of any dependent
//! handle whose primary is the object.
//!
//! # Modes
//!
//! - **Unique**: explored objects stay in one `considered` set shared by
//!   every root, so a later root reaching an already explored region is not
//!   reported again.
//! - **All**: `considered` is cleared per root; every node of a found path
//!   becomes a target itself, carrying its remaining path, so later roots
//!   stop as soon as they meet a known route.
//!
//! # Failure Handling
//!
//! An object that cannot be read or decoded ends its branch only. The
//! address goes into the report's diagnostics and the search continues
//! elsewhere. Cancellation ends the query with `UserInterrupt`.

use super::sources::{DependentHandleMap, RootSources};
use super::{
    Diagnostic, LiveObjects, PathNode, RetainedSize, RetentionReport, Root, RootPath,
    RootReport, RootRetention, RootSearchOptions, RootSet, SearchMode,
};
use crate::define_idx;
use crate::error::{HeapError, Result};
use crate::logging::WalkEvent;
use crate::object::TypeHandle;
use crate::session::HeapSession;
use crate::stats::{QueryStats, QueryTimer};
use crate::util::IndexVec;
use indexmap::IndexSet;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;

define_idx!(NodeId);

#[derive(Debug, Clone, Copy)]
struct SearchNode {
    address: u64,
    parent: Option<NodeId>,
    from_dependent: bool,
}

/// Graph queries over one session
pub struct RootFinder<'s, 't> {
    session: &'s HeapSession<'t>,
}

impl<'s, 't> RootFinder<'s, 't> {
    pub fn new(session: &'s HeapSession<'t>) -> Self {
        Self { session }
    }

    fn sources(&self) -> RootSources<'s, 't> {
        RootSources::new(self.session)
    }

    /// Run `query`, bracketing it with start/finish events
    fn run<T>(
        &self,
        name: &str,
        target: u64,
        query: impl FnOnce() -> Result<T>,
        results: impl FnOnce(&T) -> usize,
    ) -> Result<T> {
        let events = self.session.events();
        events.record(WalkEvent::QueryStarted {
            query: name.to_string(),
            target,
        });
        let timer = QueryTimer::start();

        match query() {
            Ok(value) => {
                events.record(WalkEvent::QueryFinished {
                    query: name.to_string(),
                    results: results(&value),
                    duration_ms: timer.elapsed_ms(),
                });
                Ok(value)
            },
            Err(e) => {
                if e.is_interrupt() {
                    events.record(WalkEvent::QueryInterrupted {
                        query: name.to_string(),
                    });
                }
                Err(e)
            },
        }
    }

    // ========================================================================
    // ROOT SEARCH
    // ========================================================================

    /// Roots keeping `target` alive, with the path from each
    ///
    /// Sources are searched in order: thread stacks, strong handles, ready
    /// finalizer-queue entries. If none reaches the target, not-yet-ready
    /// finalizer entries are tried and any hits are flagged as possible
    /// false positives.
    pub fn find_roots(&self, target: u64, options: RootSearchOptions) -> Result<RootReport> {
        self.run(
            "find_roots",
            target,
            || {
                let sources = self.sources();
                let mut diagnostics = Vec::new();
                let dependents = sources.dependent_handles(&mut diagnostics);
                let mut search =
                    PathSearch::new(self.session, &dependents, options.mode, target, diagnostics);

                if options.include_stacks {
                    let roots = sources.stack_roots(&mut search.diagnostics)?;
                    search.search_roots(roots, false)?;
                }
                let roots = sources.handle_roots(None, &mut search.diagnostics);
                search.search_roots(roots, false)?;
                let roots = sources.finalizer_roots(true, &mut search.diagnostics)?;
                search.search_roots(roots, false)?;

                if search.paths.is_empty() {
                    let roots = sources.finalizer_roots(false, &mut search.diagnostics)?;
                    search.search_roots(roots, true)?;
                    if !search.paths.is_empty() {
                        search.diagnostics.push(Diagnostic::PossibleFalsePositives);
                    }
                }
                Ok(search.into_report(target))
            },
            |report| report.paths.len(),
        )
    }

    /// Roots keeping `target` alive from the perspective of a collection
    /// of `generation`
    ///
    /// `None`, or the maximum generation, is a full search. Otherwise the
    /// roots are: the GC's captured older-generation root array, handles
    /// aged `<= generation`, and ready finalizer-queue entries. Stacks are
    /// not consulted.
    pub fn find_roots_in_generation(
        &self,
        generation: Option<u32>,
        target: u64,
    ) -> Result<RootReport> {
        let generation = match generation {
            Some(g) if g < self.session.topology().max_generation() => g,
            _ => return self.find_roots(target, RootSearchOptions::default()),
        };

        self.run(
            "find_roots_in_generation",
            target,
            || {
                let sources = self.sources();
                let mut diagnostics = Vec::new();
                let dependents = sources.dependent_handles(&mut diagnostics);
                let mut search = PathSearch::new(
                    self.session,
                    &dependents,
                    SearchMode::Unique,
                    target,
                    diagnostics,
                );

                let roots = sources.older_generation_roots(&mut search.diagnostics)?;
                search.search_roots(roots, false)?;
                let roots = sources.handle_roots(Some(generation), &mut search.diagnostics);
                search.search_roots(roots, false)?;
                let roots = sources.finalizer_roots(true, &mut search.diagnostics)?;
                search.search_roots(roots, false)?;
                Ok(search.into_report(target))
            },
            |report| report.paths.len(),
        )
    }

    /// Shortest reference path from `root_object` to `target`, both ends
    /// included
    pub fn path_to(&self, root_object: u64, target: u64) -> Result<Option<Vec<PathNode>>> {
        self.run(
            "path_to",
            target,
            || {
                let mut diagnostics = Vec::new();
                let dependents = self.sources().dependent_handles(&mut diagnostics);
                let mut search = PathSearch::new(
                    self.session,
                    &dependents,
                    SearchMode::Unique,
                    target,
                    diagnostics,
                );
                search.search_from(root_object)
            },
            |path| usize::from(path.is_some()),
        )
    }

    // ========================================================================
    // RETENTION & LIVENESS
    // ========================================================================

    /// Total aligned size of everything reachable from `object`, itself
    /// included
    pub fn retained_size(&self, object: u64) -> Result<RetainedSize> {
        self.run(
            "retained_size",
            object,
            || {
                let mut diagnostics = Vec::new();
                let dependents = self.sources().dependent_handles(&mut diagnostics);
                let mut closure = Closure::new(self.session, &dependents);
                closure.extend([object])?;
                diagnostics.append(&mut closure.diagnostics);
                Ok(RetainedSize {
                    object,
                    bytes: closure.bytes,
                    objects: closure.objects,
                    diagnostics,
                })
            },
            |size| size.objects as usize,
        )
    }

    /// Retained size of each strong root, computed independently
    ///
    /// Objects reachable from several roots count towards each of them.
    pub fn retained_sizes_by_root(&self) -> Result<RetentionReport> {
        self.run(
            "retained_sizes_by_root",
            0,
            || {
                let sources = self.sources();
                let mut diagnostics = Vec::new();
                let dependents = sources.dependent_handles(&mut diagnostics);
                let mut roots = sources.stack_roots(&mut diagnostics)?;
                roots.extend(sources.handle_roots(None, &mut diagnostics));
                roots.extend(sources.finalizer_roots(true, &mut diagnostics)?);

                let mut report = RetentionReport::default();
                for root in roots {
                    let mut closure = Closure::new(self.session, &dependents);
                    closure.extend([root.object])?;
                    diagnostics.append(&mut closure.diagnostics);
                    report.roots.push(RootRetention {
                        root,
                        bytes: closure.bytes,
                        objects: closure.objects,
                    });
                }
                report.diagnostics = diagnostics;
                Ok(report)
            },
            |report| report.roots.len(),
        )
    }

    /// Every object reachable from stacks, strong handles and (unless
    /// excluded) ready finalizer-queue entries
    pub fn live_objects(&self, exclude_finalizer_queue: bool) -> Result<LiveObjects> {
        self.run(
            "live_objects",
            0,
            || {
                let sources = self.sources();
                let mut diagnostics = Vec::new();
                let dependents = sources.dependent_handles(&mut diagnostics);
                let mut roots = sources.stack_roots(&mut diagnostics)?;
                roots.extend(sources.handle_roots(None, &mut diagnostics));
                if !exclude_finalizer_queue {
                    roots.extend(sources.finalizer_roots(true, &mut diagnostics)?);
                }

                let mut closure = Closure::new(self.session, &dependents);
                closure.extend(roots.iter().map(|r| r.object))?;
                diagnostics.append(&mut closure.diagnostics);
                Ok(LiveObjects {
                    objects: closure.visited,
                    diagnostics,
                })
            },
            |live| live.objects.len(),
        )
    }

    /// Every root candidate, with provenance
    ///
    /// Includes weakly-held sources a search would not use: not-ready
    /// finalizer entries, older-generation array entries and dependent
    /// handle primaries.
    pub fn enumerate_roots(&self) -> Result<RootSet> {
        self.run(
            "enumerate_roots",
            0,
            || {
                let sources = self.sources();
                let mut set = RootSet::default();
                let diagnostics = &mut set.diagnostics;
                let mut roots = sources.stack_roots(diagnostics)?;
                roots.extend(sources.handle_roots(None, diagnostics));
                roots.extend(sources.finalizer_roots(true, diagnostics)?);
                roots.extend(sources.finalizer_roots(false, diagnostics)?);
                roots.extend(sources.older_generation_roots(diagnostics)?);
                roots.extend_from_slice(sources.dependent_handles(diagnostics).handles());
                set.roots = roots;
                Ok(set)
            },
            |set| set.roots.len(),
        )
    }
}

/// Record an object that could not be expanded
fn note_unreadable(
    session: &HeapSession<'_>,
    diagnostics: &mut Vec<Diagnostic>,
    address: u64,
    error: &HeapError,
) {
    log::warn!("object {:#x} unreadable: {}", address, error);
    session.events().record(WalkEvent::ObjectUnreadable {
        address,
        reason: error.to_string(),
    });
    diagnostics.push(Diagnostic::ObjectUnreadable {
        address,
        reason: error.to_string(),
    });
}

/// Outgoing edges of `address`: reference slots, then dependent secondaries
fn edges_of(
    session: &HeapSession<'_>,
    dependents: &DependentHandleMap,
    address: u64,
) -> Result<(u64, Vec<(u64, bool)>)> {
    let info = session.inspect(address)?;
    let mut edges: Vec<(u64, bool)> = session
        .outgoing(&info)?
        .into_iter()
        .map(|(target, _)| (target, false))
        .collect();
    edges.extend(dependents.secondaries(address).iter().map(|&s| (s, true)));
    Ok((info.size, edges))
}

/// Errors that end only the current branch
fn is_branch_local(error: &HeapError) -> bool {
    error.is_local() || matches!(error, HeapError::ResourceExhaustion { .. })
}

// ============================================================================
// PATH SEARCH
// ============================================================================

struct PathSearch<'f, 's, 't> {
    session: &'s HeapSession<'t>,
    dependents: &'f DependentHandleMap,
    mode: SearchMode,
    /// Object -> remaining path from it to the original target
    targets: FxHashMap<u64, Vec<PathNode>>,
    considered: FxHashSet<u64>,
    arena: IndexVec<NodeId, SearchNode>,
    queue: VecDeque<NodeId>,
    paths: Vec<RootPath>,
    diagnostics: Vec<Diagnostic>,
    stats: QueryStats,
}

impl<'f, 's, 't> PathSearch<'f, 's, 't> {
    fn new(
        session: &'s HeapSession<'t>,
        dependents: &'f DependentHandleMap,
        mode: SearchMode,
        target: u64,
        diagnostics: Vec<Diagnostic>,
    ) -> Self {
        let mut search = Self {
            session,
            dependents,
            mode,
            targets: FxHashMap::default(),
            considered: FxHashSet::default(),
            arena: IndexVec::new(),
            queue: VecDeque::new(),
            paths: Vec::new(),
            diagnostics,
            stats: QueryStats::default(),
        };
        let node = search.describe(target, false);
        search.targets.insert(target, vec![node]);
        search
    }

    fn describe(&self, address: u64, from_dependent_handle: bool) -> PathNode {
        let type_name = match self.session.read_pointer(address) {
            Ok(word) => self.session.type_name(TypeHandle::new(word)),
            Err(_) => "<unreadable>".to_string(),
        };
        PathNode {
            address,
            type_name,
            from_dependent_handle,
        }
    }

    fn search_roots(&mut self, roots: Vec<Root>, possible_false_positive: bool) -> Result<()> {
        for root in roots {
            self.search_root(root, possible_false_positive)?;
        }
        Ok(())
    }

    fn search_root(&mut self, root: Root, possible_false_positive: bool) -> Result<()> {
        self.stats.roots_visited += 1;
        if self.mode == SearchMode::All {
            self.considered.clear();
        }

        let Some(nodes) = self.search_from(root.object)? else {
            return Ok(());
        };
        if self.mode == SearchMode::All {
            for (i, node) in nodes.iter().enumerate() {
                self.targets
                    .entry(node.address)
                    .or_insert_with(|| nodes[i..].to_vec());
            }
        }
        self.paths.push(RootPath {
            root,
            nodes,
            possible_false_positive,
        });
        Ok(())
    }

    /// Path from `start` to the nearest known target, if any
    fn search_from(&mut self, start: u64) -> Result<Option<Vec<PathNode>>> {
        if let Some(path) = self.targets.get(&start) {
            return Ok(Some(path.clone()));
        }
        if !self.considered.insert(start) {
            return Ok(None);
        }

        let limit = self.session.config().max_search_nodes;
        self.arena.clear();
        self.queue.clear();
        let root = self.arena.push(SearchNode {
            address: start,
            parent: None,
            from_dependent: false,
        });
        self.queue.push_back(root);

        while let Some(id) = self.queue.pop_front() {
            if self.session.is_cancelled() {
                return Err(HeapError::UserInterrupt);
            }
            self.stats.nodes_expanded += 1;

            let address = self.arena[id].address;
            let edges = match edges_of(self.session, self.dependents, address) {
                Ok((_, edges)) => edges,
                Err(e) if is_branch_local(&e) => {
                    self.stats.objects_unreadable += 1;
                    note_unreadable(self.session, &mut self.diagnostics, address, &e);
                    continue;
                },
                Err(e) => return Err(e),
            };

            if self.arena.try_reserve(edges.len()).is_err() {
                let e = HeapError::exhausted("search arena");
                note_unreadable(self.session, &mut self.diagnostics, address, &e);
                self.release_pending();
                return Ok(None);
            }

            for (child, from_dependent) in edges {
                if let Some(suffix) = self.targets.get(&child) {
                    let mut suffix = suffix.clone();
                    suffix[0].from_dependent_handle = from_dependent;
                    let mut path = self.path_to_node(id);
                    path.append(&mut suffix);
                    self.release_pending();
                    return Ok(Some(path));
                }
                if !self.considered.insert(child) {
                    continue;
                }
                if self.arena.len() >= limit {
                    log::warn!("search from {:#x} abandoned after {} nodes", start, limit);
                    self.diagnostics.push(Diagnostic::SearchLimitReached { root: start, limit });
                    self.release_pending();
                    return Ok(None);
                }
                let node = self.arena.push(SearchNode {
                    address: child,
                    parent: Some(id),
                    from_dependent,
                });
                self.queue.push_back(node);
            }
        }
        Ok(None)
    }

    /// Un-mark queued nodes that were discovered but never expanded
    fn release_pending(&mut self) {
        while let Some(id) = self.queue.pop_front() {
            self.considered.remove(&self.arena[id].address);
        }
    }

    fn path_to_node(&self, id: NodeId) -> Vec<PathNode> {
        let mut chain = Vec::new();
        let mut cursor = Some(id);
        while let Some(id) = cursor {
            let node = self.arena[id];
            chain.push(self.describe(node.address, node.from_dependent));
            cursor = node.parent;
        }
        chain.reverse();
        chain
    }

    fn into_report(self, target: u64) -> RootReport {
        RootReport {
            target,
            paths: self.paths,
            diagnostics: self.diagnostics,
            stats: self.stats,
        }
    }
}

// ============================================================================
// REACHABILITY CLOSURE
// ============================================================================

/// Depth-first closure accumulating sizes
struct Closure<'f, 's, 't> {
    session: &'s HeapSession<'t>,
    dependents: &'f DependentHandleMap,
    visited: IndexSet<u64>,
    bytes: u64,
    objects: u64,
    diagnostics: Vec<Diagnostic>,
}

impl<'f, 's, 't> Closure<'f, 's, 't> {
    fn new(session: &'s HeapSession<'t>, dependents: &'f DependentHandleMap) -> Self {
        Self {
            session,
            dependents,
            visited: IndexSet::new(),
            bytes: 0,
            objects: 0,
            diagnostics: Vec::new(),
        }
    }

    fn extend(&mut self, starts: impl IntoIterator<Item = u64>) -> Result<()> {
        let mut stack: Vec<u64> = Vec::new();
        for start in starts {
            if start != 0 && self.visited.insert(start) {
                stack.push(start);
            }
        }

        while let Some(address) = stack.pop() {
            if self.session.is_cancelled() {
                return Err(HeapError::UserInterrupt);
            }
            let (size, edges) = match edges_of(self.session, self.dependents, address) {
                Ok(found) => found,
                Err(e) if is_branch_local(&e) => {
                    note_unreadable(self.session, &mut self.diagnostics, address, &e);
                    continue;
                },
                Err(e) => return Err(e),
            };
            self.bytes += size;
            self.objects += 1;
            for (child, _) in edges {
                if self.visited.insert(child) {
                    stack.push(child);
                }
            }
        }
        Ok(())
    }
}
