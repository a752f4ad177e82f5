//! Root enumeration
//!
//! Every source degrades independently: a thread whose stack cannot be
//! walked, an unreadable finalizer-queue slot or a missing handle table is
//! recorded as a [`Diagnostic`] and the remaining sources still contribute.
//! Only cancellation aborts enumeration.

use super::{Diagnostic, Root, RootKind};
use crate::cache::LinearReadCache;
use crate::error::{HeapError, Result};
use crate::session::HeapSession;
use crate::target::{HandleKind, SlotRange};
use indexmap::IndexMap;

/// Primary object -> secondaries kept alive through dependent handles
#[derive(Debug, Clone, Default)]
pub struct DependentHandleMap {
    edges: IndexMap<u64, Vec<u64>>,
    handles: Vec<Root>,
}

impl DependentHandleMap {
    pub fn secondaries(&self, primary: u64) -> &[u64] {
        self.edges.get(&primary).map_or(&[], Vec::as_slice)
    }

    /// One root per dependent handle, keyed on its primary
    pub fn handles(&self) -> &[Root] {
        &self.handles
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    fn insert(&mut self, handle: u64, primary: u64, secondary: u64) {
        self.edges.entry(primary).or_default().push(secondary);
        self.handles.push(Root {
            kind: RootKind::DependentHandle { handle, secondary },
            object: primary,
        });
    }
}

/// Root enumeration over one session
pub(crate) struct RootSources<'s, 't> {
    session: &'s HeapSession<'t>,
}

impl<'s, 't> RootSources<'s, 't> {
    pub(crate) fn new(session: &'s HeapSession<'t>) -> Self {
        Self { session }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.session.is_cancelled() {
            Err(HeapError::UserInterrupt)
        } else {
            Ok(())
        }
    }

    /// Live references on every thread's stack
    pub(crate) fn stack_roots(&self, diagnostics: &mut Vec<Diagnostic>) -> Result<Vec<Root>> {
        self.session.with_stack_walker_do(|walker| {
            let threads = match walker.threads() {
                Ok(threads) => threads,
                Err(e) => {
                    log::warn!("thread list unavailable: {}", e);
                    diagnostics.push(Diagnostic::ThreadsUnavailable {
                        reason: e.to_string(),
                    });
                    return Ok(Vec::new());
                },
            };

            let mut roots = Vec::new();
            for thread in threads {
                self.check_cancelled()?;
                let os_thread_id = thread.os_thread_id;
                let refs = match walker.stack_references(os_thread_id) {
                    Ok(refs) => refs,
                    Err(e) => {
                        log::warn!("stack of thread {:x} unavailable: {}", os_thread_id, e);
                        diagnostics.push(Diagnostic::ThreadStackUnavailable {
                            os_thread_id,
                            reason: e.to_string(),
                        });
                        continue;
                    },
                };
                roots.extend(refs.into_iter().filter(|r| r.object != 0).map(|r| Root {
                    kind: RootKind::Stack {
                        os_thread_id,
                        slot: r.address,
                        pinned: r.pinned,
                        interior: r.interior,
                    },
                    object: r.object,
                }));
            }
            Ok(roots)
        })
    }

    /// Strong handles, optionally restricted to those aged `<= generation`
    pub(crate) fn handle_roots(
        &self,
        generation: Option<u32>,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Vec<Root> {
        match self.session.metadata().handle_table(generation) {
            Ok(handles) => handles
                .into_iter()
                .filter(|h| h.strong && h.target != 0)
                .map(|h| Root {
                    kind: RootKind::Handle {
                        handle: h.handle,
                        kind: h.kind,
                    },
                    object: h.target,
                })
                .collect(),
            Err(e) => {
                log::warn!("handle table unavailable: {}", e);
                diagnostics.push(Diagnostic::HandleTableUnavailable {
                    reason: e.to_string(),
                });
                Vec::new()
            },
        }
    }

    /// Dependent-handle edges of the whole handle table
    ///
    /// Without them a search may miss paths; the caller is told so.
    pub(crate) fn dependent_handles(
        &self,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> DependentHandleMap {
        let mut map = DependentHandleMap::default();
        match self.session.metadata().handle_table(None) {
            Ok(handles) => {
                for h in handles {
                    if h.kind == HandleKind::Dependent && h.target != 0 && h.secondary != 0 {
                        map.insert(h.handle, h.target, h.secondary);
                    }
                }
            },
            Err(e) => {
                log::warn!("dependent handles unavailable: {}", e);
                diagnostics.push(Diagnostic::DependentHandlesUnavailable {
                    reason: e.to_string(),
                });
            },
        }
        map
    }

    /// Finalizer-queue entries of every heap
    ///
    /// `ready` selects objects due for finalization; otherwise the objects
    /// merely registered for it.
    pub(crate) fn finalizer_roots(
        &self,
        ready: bool,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<Vec<Root>> {
        let mut cache = LinearReadCache::new(self.session.config().root_scan_page_size);
        let mut roots = Vec::new();
        for heap in self.session.topology().heaps() {
            self.check_cancelled()?;
            let finalization = &heap.details.finalization;
            let range = if ready {
                finalization.ready
            } else {
                finalization.not_ready
            };
            let failed = self.scan_slots(&mut cache, range, &mut roots, |slot| {
                RootKind::FinalizerQueue { slot, ready }
            })?;
            for (address, e) in failed {
                log::warn!(
                    "heap {} finalizer queue unreadable at {:#x}: {}",
                    heap.index,
                    address,
                    e
                );
                diagnostics.push(Diagnostic::FinalizerQueueUnreadable {
                    heap: heap.index,
                    address,
                    reason: e.to_string(),
                });
            }
        }
        Ok(roots)
    }

    /// Entries of the GC's captured root array, per heap
    ///
    /// Heaps whose last analysis did not complete contribute nothing.
    pub(crate) fn older_generation_roots(
        &self,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<Vec<Root>> {
        let pointer_size = self.session.pointer_size() as u64;
        let mut cache = LinearReadCache::new(self.session.config().root_scan_page_size);
        let mut roots = Vec::new();
        for heap in self.session.topology().heaps() {
            self.check_cancelled()?;
            let array = heap.details.root_array;
            if !array.analyzed || array.address == 0 {
                diagnostics.push(Diagnostic::OlderGenerationUnavailable { heap: heap.index });
                continue;
            }
            let end = array
                .count
                .checked_mul(pointer_size)
                .and_then(|len| array.address.checked_add(len));
            let Some(end) = end else {
                diagnostics.push(Diagnostic::OlderGenerationUnavailable { heap: heap.index });
                continue;
            };
            let range = SlotRange {
                start: array.address,
                end,
            };
            let failed = self.scan_slots(&mut cache, range, &mut roots, |slot| {
                RootKind::OlderGeneration { slot }
            })?;
            for (address, e) in failed {
                log::warn!(
                    "heap {} root array unreadable at {:#x}: {}",
                    heap.index,
                    address,
                    e
                );
                diagnostics.push(Diagnostic::OlderGenerationSlotUnreadable {
                    heap: heap.index,
                    address,
                    reason: e.to_string(),
                });
            }
        }
        Ok(roots)
    }

    /// Read each pointer slot of `range`
    ///
    /// An unreadable slot is skipped; the slots after it are still scanned.
    /// Returns the failed slots.
    fn scan_slots(
        &self,
        cache: &mut LinearReadCache,
        range: SlotRange,
        roots: &mut Vec<Root>,
        kind: impl Fn(u64) -> RootKind,
    ) -> Result<Vec<(u64, HeapError)>> {
        let pointer_size = self.session.pointer_size();
        let reader = self.session.reader();
        let mut failed = Vec::new();
        let mut slot = range.start;
        while slot < range.end {
            match cache.read_pointer(reader, slot, pointer_size) {
                Ok(0) => {},
                Ok(object) => roots.push(Root {
                    kind: kind(slot),
                    object,
                }),
                Err(e @ HeapError::UserInterrupt) => return Err(e),
                Err(e) => {
                    self.check_cancelled()?;
                    failed.push((slot, e));
                },
            }
            slot += pointer_size as u64;
        }
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::target::SnapshotBuilder;

    #[test]
    fn test_sources_enumerate_each_kind() {
        let mut builder = SnapshotBuilder::new();
        let leaf = builder.add_type("Leaf", 24, &[]);
        let a = builder.alloc(leaf);
        let b = builder.alloc(leaf);
        builder.add_stack_root(7, a);
        builder.add_strong_handle(b);
        builder.add_handle(HandleKind::WeakShort, a, false);
        builder.add_finalizable(a, true);
        builder.add_finalizable(b, false);
        builder.add_older_generation_root(b);
        let snap = builder.build();
        let session = HeapSession::open(&snap, &snap, SessionConfig::default()).unwrap();
        let sources = RootSources::new(&session);
        let mut diags = Vec::new();

        let stacks = sources.stack_roots(&mut diags).unwrap();
        assert_eq!(stacks.len(), 1);
        assert_eq!(stacks[0].object, a);

        let handles = sources.handle_roots(None, &mut diags);
        assert_eq!(handles.len(), 1, "weak handles are not roots");
        assert_eq!(handles[0].object, b);

        let ready = sources.finalizer_roots(true, &mut diags).unwrap();
        let not_ready = sources.finalizer_roots(false, &mut diags).unwrap();
        assert_eq!(ready[0].object, a);
        assert_eq!(not_ready[0].object, b);

        let older = sources.older_generation_roots(&mut diags).unwrap();
        assert_eq!(older[0].object, b);
        assert!(diags.is_empty(), "unexpected diagnostics: {:?}", diags);
    }

    #[test]
    fn test_unanalyzed_root_array_is_diagnosed() {
        let mut builder = SnapshotBuilder::new();
        let leaf = builder.add_type("Leaf", 24, &[]);
        let a = builder.alloc(leaf);
        builder.add_older_generation_root(a);
        builder.set_root_array_analyzed(false);
        let snap = builder.build();
        let session = HeapSession::open(&snap, &snap, SessionConfig::default()).unwrap();
        let mut diags = Vec::new();

        let roots = RootSources::new(&session)
            .older_generation_roots(&mut diags)
            .unwrap();
        assert!(roots.is_empty());
        assert_eq!(diags, vec![Diagnostic::OlderGenerationUnavailable { heap: 0 }]);
    }

    #[test]
    fn test_unreadable_finalizer_queue_degrades() {
        let mut builder = SnapshotBuilder::new();
        let leaf = builder.add_type("Leaf", 24, &[]);
        let a = builder.alloc(leaf);
        builder.add_finalizable(a, true);
        let mut snap = builder.build();
        let start = snap.heaps[0].finalization.ready.start;
        snap.unmap(start);
        let session = HeapSession::open(&snap, &snap, SessionConfig::default()).unwrap();
        let mut diags = Vec::new();

        let roots = RootSources::new(&session)
            .finalizer_roots(true, &mut diags)
            .unwrap();
        assert!(roots.is_empty());
        assert!(matches!(
            diags[0],
            Diagnostic::FinalizerQueueUnreadable { heap: 0, .. }
        ));
    }

    #[test]
    fn test_unreadable_root_slot_is_skipped() {
        let mut builder = SnapshotBuilder::new();
        let leaf = builder.add_type("Leaf", 24, &[]);
        let a = builder.alloc(leaf);
        let b = builder.alloc(leaf);
        builder.add_older_generation_root(a);
        builder.add_older_generation_root(a);
        builder.add_older_generation_root(b);
        let mut snap = builder.build();
        // remap slots 0 and 2 only
        let start = snap.heaps[0].root_array.address;
        snap.unmap(start);
        snap.map(start, a.to_le_bytes().to_vec());
        snap.map(start + 16, b.to_le_bytes().to_vec());
        let session = HeapSession::open(&snap, &snap, SessionConfig::default()).unwrap();
        let mut diags = Vec::new();

        let roots = RootSources::new(&session)
            .older_generation_roots(&mut diags)
            .unwrap();
        let objects: Vec<u64> = roots.iter().map(|r| r.object).collect();
        assert_eq!(objects, vec![a, b]);
        assert_eq!(diags.len(), 1);
        match &diags[0] {
            Diagnostic::OlderGenerationSlotUnreadable { heap, address, .. } => {
                assert_eq!((*heap, *address), (0, start + 8));
            },
            other => panic!("unexpected diagnostic {:?}", other),
        }
    }

    #[test]
    fn test_dependent_map() {
        let mut builder = SnapshotBuilder::new();
        let leaf = builder.add_type("Leaf", 24, &[]);
        let primary = builder.alloc(leaf);
        let secondary = builder.alloc(leaf);
        builder.add_dependent_handle(primary, secondary);
        let snap = builder.build();
        let session = HeapSession::open(&snap, &snap, SessionConfig::default()).unwrap();
        let mut diags = Vec::new();

        let map = RootSources::new(&session).dependent_handles(&mut diags);
        assert_eq!(map.secondaries(primary), &[secondary]);
        assert!(map.secondaries(secondary).is_empty());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_cancelled_enumeration() {
        let mut builder = SnapshotBuilder::new();
        let leaf = builder.add_type("Leaf", 24, &[]);
        let a = builder.alloc(leaf);
        builder.add_stack_root(1, a);
        let snap = builder.build();
        let session = HeapSession::open(&snap, &snap, SessionConfig::default()).unwrap();
        session.cancellation_token().cancel();

        let result = RootSources::new(&session).stack_roots(&mut Vec::new());
        assert!(matches!(result, Err(HeapError::UserInterrupt)));
    }
}
